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

use crate::io::warmstart::WarmStartError;
use crate::io::{ConfigError, InputOutputError};
use crate::propagators::PropagationError;
use crate::time::Epoch;
use snafu::prelude::Snafu;

/// Sequential filter engine and its configuration.
pub mod filter;
pub use filter::{Estimator, EstimatorState, SequentialFilter};

/// Forward/backward two-filter smoother.
pub mod smoother;
pub use smoother::Smoother;

/// Provides estimate and measurement records.
pub mod estimate;

/// Provides the measurement collaborator interface and reference models.
pub mod msr;

/// Provides all process noise (state noise compensation) functionality.
pub mod snc;

#[allow(unused_imports)]
pub mod prelude {
    pub use super::estimate::*;
    pub use super::filter::*;
    pub use super::msr::*;
    pub use super::smoother::*;
    pub use super::snc::*;
    pub use super::*;

    pub use crate::cosmic::{CartesianGateway, EpochFormat, FrameGateway};
    pub use crate::io::report::*;
    pub use crate::io::ConfigRepr;
    pub use crate::propagators::{LinearPropagator, Propagator};
    pub use crate::time::{Duration, Epoch, TimeUnits, Unit};
}

#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ODError {
    #[snafu(display("during an orbit determination, encountered {source}"))]
    ODPropError { source: PropagationError },
    #[snafu(display("OD failed because {source}"))]
    ODConfigError { source: ConfigError },
    #[snafu(display("warm start failed: {source}"))]
    ODWarmStart { source: WarmStartError },
    #[snafu(display("report failed: {source}"))]
    ODReportIo { source: InputOutputError },
    #[snafu(display("{name} has no dynamical participant to estimate"))]
    NoParticipant { name: String },
    #[snafu(display("the smoother has no filter to run"))]
    FilterNotSet,
    #[snafu(display("Kalman gain is singular"))]
    SingularKalmanGain,
    #[snafu(display("Noise matrix is singular"))]
    SingularNoiseRk,
    #[snafu(display("{what} is {got_rows}x{got_cols} but {need_rows}x{need_cols} was expected"))]
    SensitivityMismatch {
        what: &'static str,
        need_rows: usize,
        need_cols: usize,
        got_rows: usize,
        got_cols: usize,
    },
    #[snafu(display("{name} cannot advance from state {state}"))]
    UnknownState {
        name: String,
        state: EstimatorState,
    },
    #[snafu(display("{name} state machine re-entered while already advancing"))]
    Reentrant { name: String },
    #[snafu(display("the forward filter produced no records to smooth"))]
    EmptyForwardPass,
    #[snafu(display("state became non-finite at {epoch} during {action}"))]
    NonFiniteEstimate { epoch: Epoch, action: &'static str },
}
