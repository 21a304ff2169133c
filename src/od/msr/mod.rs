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
use crate::od::estimate::EditFlag;
use crate::time::Epoch;
use std::fmt;

mod arc;
pub use arc::ObservationArc;

mod models;
pub use models::{PositionModel, RangeModel};

mod sim;
pub use sim::ArcSimulator;

/// Direction in which observations are consumed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    /// +1.0 forward, -1.0 backward
    pub fn sign(&self) -> f64 {
        match self {
            Self::Forward => 1.0,
            Self::Backward => -1.0,
        }
    }
}

/// Which side of an epoch to drop observations from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrimSide {
    Before,
    After,
}

/// A real, time-tagged observation.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub epoch: Epoch,
    pub value: DVector<f64>,
    /// Noise covariance provided with the observation, if any
    pub noise_covar: Option<DMatrix<f64>>,
    /// Edit flag carried by the observation, set by the user or inherited from a previous pass
    pub edit_flag: EditFlag,
}

impl Observation {
    pub fn new(epoch: Epoch, value: DVector<f64>) -> Self {
        Self {
            epoch,
            value,
            noise_covar: None,
            edit_flag: EditFlag::Normal,
        }
    }

    pub fn with_noise(mut self, noise_covar: DMatrix<f64>) -> Self {
        self.noise_covar = Some(noise_covar);
        self
    }

    pub fn with_flag(mut self, edit_flag: EditFlag) -> Self {
        self.edit_flag = edit_flag;
        self
    }
}

/// A value computed by a measurement model at the current estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct ComputedMeasurement {
    pub epoch: Epoch,
    pub value: DVector<f64>,
    /// Partial derivatives of the measurement with respect to the estimated state, H
    pub sensitivity: DMatrix<f64>,
    /// Model noise covariance
    pub noise_covar: DMatrix<f64>,
    /// Normal if feasible, else why the measurement cannot be used
    pub feasibility: EditFlag,
}

/// A measurement model computes the expected observation and its sensitivity from a state.
pub trait MeasurementModel: Clone + fmt::Debug {
    /// Number of components in each observation
    fn size(&self) -> usize;

    /// Computes the measurement, or `None` if no value can be computed at all.
    fn compute(&self, epoch: Epoch, state: &DVector<f64>) -> Option<ComputedMeasurement>;
}

/// Whether a discrete event has been bracketed and located.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Searching,
    Located,
}

/// A discrete event (e.g. light time or eclipse entry) which must be located before a measurement can be processed.
pub trait DiscreteEvent: fmt::Debug {
    fn name(&self) -> &str;

    /// Clears any search progress, called before each new measurement.
    fn reset(&mut self);

    /// Evaluates the event at the provided epoch and state.
    fn check_status(&mut self, epoch: Epoch, state: &DVector<f64>) -> EventStatus;

    fn clone_box(&self) -> Box<dyn DiscreteEvent>;
}

impl Clone for Box<dyn DiscreteEvent> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The measurement collaborator: owns the observation table, computes measurements, and locates events.
pub trait MeasurementManager {
    fn direction(&self) -> Direction;

    fn set_direction(&mut self, direction: Direction);

    /// Rewinds the cursor to the first usable observation in the current direction.
    fn prepare_for_processing(&mut self);

    /// Drops observations on one side of the provided epoch, and those at the epoch unless `keep_equal` is set.
    /// Trimming persists across calls to `prepare_for_processing`.
    fn trim(&mut self, epoch: Epoch, side: TrimSide, keep_equal: bool);

    /// Full observation table, in time order, including trimmed observations.
    fn observations(&self) -> &[Observation];

    /// Mutable access to the table, used to set or inherit edit flags.
    fn observations_mut(&mut self) -> &mut [Observation];

    /// Index of the current observation in the table, `None` when exhausted.
    fn current_index(&self) -> Option<usize>;

    /// Current observation, `None` when exhausted.
    fn observation(&self) -> Option<&Observation> {
        self.current_index()
            .and_then(|idx| self.observations().get(idx))
    }

    /// Epoch of the current observation, `None` when exhausted.
    fn observation_epoch(&self) -> Option<Epoch> {
        self.observation().map(|obs| obs.epoch)
    }

    /// Moves to the next observation in the processing direction. Returns false once exhausted.
    fn advance_observation(&mut self) -> bool;

    /// Positions the cursor on a specific table entry. Returns false if it is out of range or trimmed.
    fn seek(&mut self, record_num: usize) -> bool;

    /// Computes the current observation at the provided state. Returns false if no value can be computed.
    fn calculate_measurements(&mut self, epoch: Epoch, state: &DVector<f64>) -> bool;

    /// Result of the last successful call to `calculate_measurements`.
    fn computed(&self) -> Option<&ComputedMeasurement>;

    /// Number of events which must be located for the current measurement.
    fn event_count(&self) -> usize;

    /// Polls one of the active events.
    fn check_event(&mut self, index: usize, epoch: Epoch, state: &DVector<f64>) -> EventStatus;

    /// Hands a located event to the measurement model. Returns true if the event was consumed.
    fn process_event(&mut self, index: usize) -> bool;

    /// Releases transient buffers at the end of a pass.
    fn processing_complete(&mut self);
}
