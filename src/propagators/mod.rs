/*
    Nyx, blazing fast astrodynamics
    Copyright (C) 2018-onwards Christopher Rabotin <christopher.rabotin@gmail.com>

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::linalg::{DMatrix, DVector};
use crate::time::{Duration, Epoch};
use snafu::prelude::*;

mod linear;
pub use linear::LinearPropagator;

#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PropagationError {
    #[snafu(display("state became non-finite when propagating to {epoch}"))]
    NonFiniteState { epoch: Epoch },
    #[snafu(display("state has {got} components but {need} are required"))]
    StateTooShort { need: usize, got: usize },
}

/// The dynamical participant collaborator: it owns the reference state and accumulates the state transition matrix
/// since the last reset. The estimation engines request steps and read the STM back, they never integrate anything.
pub trait Propagator {
    /// Current epoch of the propagated state.
    fn epoch(&self) -> Epoch;

    /// Full propagated state. The first six components are the Cartesian position (km) and velocity (km/s).
    fn state(&self) -> &DVector<f64>;

    /// Replaces the propagated state and epoch, for example after a rectification or a warm start.
    fn set_state(&mut self, epoch: Epoch, state: DVector<f64>);

    /// Names of each state component, used to map warm-start columns.
    fn state_names(&self) -> Vec<String>;

    /// Advances the state by the provided step, which may be negative, accumulating the STM.
    fn advance(&mut self, step: Duration) -> Result<(), PropagationError>;

    /// State transition matrix accumulated since the last reset.
    fn stm(&self) -> &DMatrix<f64>;

    /// Resets the accumulated state transition matrix to identity.
    fn reset_stm(&mut self);

    /// Number of dynamical participants bound to this propagator.
    fn participant_count(&self) -> usize {
        1
    }
}
