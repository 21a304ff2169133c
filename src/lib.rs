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

/*! # seqod

Sequential orbit determination: a discrete-event Kalman filter engine which ingests time-tagged observations,
propagates the state error covariance between them, injects process noise on its own cadence, edits outliers,
and hands its full update history to a forward/backward two-filter smoother.

The engines never integrate dynamics themselves: they are driven by an external loop which calls `advance_state`
and propagates the collaborator by the requested `time_step` (see [`od::filter::Estimator::run`]).
*/

/// Dense covariance and state algebra on dynamically sized nalgebra matrices.
pub mod linalg;

/// Time system and reference frame conversions consumed by the estimation engines.
pub mod cosmic;

/// Propagation collaborator interface and a reference linear propagator.
pub mod propagators;

/// Configuration, warm-start persistence, and report sinks.
pub mod io;

/// All of the sequential estimation tools: filter, smoother, process noise, measurements.
pub mod od;

#[macro_use]
extern crate log;
extern crate hifitime;
extern crate nalgebra as na;

/// Re-export of hifitime
pub mod time {
    pub use hifitime::*;
}

pub use self::od::ODError;
