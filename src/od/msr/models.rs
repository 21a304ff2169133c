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

use super::{ComputedMeasurement, MeasurementModel};
use crate::linalg::{DMatrix, DVector, Vector3};
use crate::od::estimate::EditFlag;
use crate::time::Epoch;

/// Range (km) from a fixed inertial station to the first three components of the state.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RangeModel {
    /// Inertial position of the station in km
    pub station: Vector3<f64>,
    /// Range noise standard deviation in km
    pub sigma_km: f64,
    /// Beyond this range, the measurement is flagged as blocked
    pub max_range_km: Option<f64>,
}

impl RangeModel {
    pub fn new(station: Vector3<f64>, sigma_km: f64) -> Self {
        Self {
            station,
            sigma_km,
            max_range_km: None,
        }
    }
}

impl MeasurementModel for RangeModel {
    fn size(&self) -> usize {
        1
    }

    fn compute(&self, epoch: Epoch, state: &DVector<f64>) -> Option<ComputedMeasurement> {
        if state.len() < 3 {
            return None;
        }
        let rho_vec = Vector3::new(state[0], state[1], state[2]) - self.station;
        let range = rho_vec.norm();
        if range < f64::EPSILON {
            return None;
        }

        let mut sensitivity = DMatrix::zeros(1, state.len());
        for i in 0..3 {
            sensitivity[(0, i)] = rho_vec[i] / range;
        }

        let feasibility = match self.max_range_km {
            Some(max_range) if range > max_range => EditFlag::Blocked,
            _ => EditFlag::Normal,
        };

        Some(ComputedMeasurement {
            epoch,
            value: DVector::from_element(1, range),
            sensitivity,
            noise_covar: DMatrix::from_element(1, 1, self.sigma_km.powi(2)),
            feasibility,
        })
    }
}

/// Direct observation of the inertial position (km), as from a navigation receiver.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PositionModel {
    /// Position noise standard deviation in km, identical on each axis
    pub sigma_km: f64,
}

impl MeasurementModel for PositionModel {
    fn size(&self) -> usize {
        3
    }

    fn compute(&self, epoch: Epoch, state: &DVector<f64>) -> Option<ComputedMeasurement> {
        if state.len() < 3 {
            return None;
        }
        let mut sensitivity = DMatrix::zeros(3, state.len());
        for i in 0..3 {
            sensitivity[(i, i)] = 1.0;
        }
        Some(ComputedMeasurement {
            epoch,
            value: state.rows(0, 3).into_owned(),
            sensitivity,
            noise_covar: DMatrix::identity(3, 3) * self.sigma_km.powi(2),
            feasibility: EditFlag::Normal,
        })
    }
}
