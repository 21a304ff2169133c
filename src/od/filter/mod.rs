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

use super::ODError;
use crate::time::Duration;
use std::fmt;

mod conf;
pub use conf::{CovarianceUpdate, FilterConfig, WarmStartEpoch, DEFAULT_SIGMA_MULTIPLIER};

pub mod kalman;

mod sequential;
pub use sequential::SequentialFilter;
pub(crate) use sequential::{cartesian_vnb_covariance, edit_counts, summarize, to_cartesian_covar};

/// States of the estimation state machine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EstimatorState {
    /// Not yet initialized
    #[default]
    Undefined,
    Initializing,
    Propagating,
    Calculating,
    Locating,
    Estimating,
    CheckingRun,
    Finished,
}

impl fmt::Display for EstimatorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Undefined => "UNDEFINED",
            Self::Initializing => "INITIALIZING",
            Self::Propagating => "PROPAGATING",
            Self::Calculating => "CALCULATING",
            Self::Locating => "LOCATING",
            Self::Estimating => "ESTIMATING",
            Self::CheckingRun => "CHECKINGRUN",
            Self::Finished => "FINISHED",
        };
        write!(f, "{name}")
    }
}

/// Commands which redirect an estimator between or before runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Consume observations backward in time and restart from initialization
    RunBackwards,
    /// Consume observations forward in time and restart from initialization
    RunForwards,
    /// Keep the edit flags carried by the observations instead of recomputing them
    UseProvidedFlags,
    /// Recompute all edit flags (default)
    ComputeFlags,
    /// Do not write reports or warm-start files
    NoOutput,
}

/// The capability shared by the filter and the smoother: a cooperative state machine advanced by an external driver.
pub trait Estimator {
    /// Validates the configuration and resets the state machine to `Initializing`.
    fn initialize(&mut self) -> Result<(), ODError>;

    /// Performs the work of the current state and returns the new state.
    fn advance_state(&mut self) -> Result<EstimatorState, ODError>;

    fn state(&self) -> EstimatorState;

    /// Step the driver must propagate by when the state is `Propagating`.
    fn time_step(&self) -> Duration;

    /// Applies an action, returns false if it is not supported.
    fn take_action(&mut self, action: Action) -> bool;

    /// Advances the dynamical participant by the provided step.
    fn propagate(&mut self, step: Duration) -> Result<(), ODError>;

    /// True once the run has been finalized and will not re-enter propagation.
    fn is_complete(&self) -> bool;

    /// Drives the state machine until the run is complete, propagating whenever requested.
    fn run(&mut self) -> Result<(), ODError> {
        while !self.is_complete() {
            let state = self.advance_state()?;
            if state == EstimatorState::Propagating {
                let step = self.time_step();
                if step != Duration::ZERO {
                    self.propagate(step)?;
                }
            }
        }
        Ok(())
    }
}
