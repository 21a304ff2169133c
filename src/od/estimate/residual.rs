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

use super::EditFlag;
use crate::linalg::{DMatrix, DVector};
use crate::time::Epoch;
use std::fmt;

/// Observation, computed value, and residuals of one processed measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementRecord {
    /// Index of the observation in the measurement table
    pub record_num: usize,
    pub epoch: Epoch,
    pub observed: DVector<f64>,
    /// Value computed from the estimate, if the model could compute one
    pub computed: Option<DVector<f64>>,
    /// Observed minus computed minus the sensitivity applied to the pending state offset
    pub prefit: Option<DVector<f64>>,
    /// Residual after the update, only for accepted observations
    pub postfit: Option<DVector<f64>>,
    /// Prefit residuals divided by the square root of the innovation covariance diagonal
    pub scaled: Option<DVector<f64>>,
    /// Measurement noise covariance
    pub noise_covar: DMatrix<f64>,
    /// Innovation covariance, H P H^T + R
    pub innovation_covar: Option<DMatrix<f64>>,
    pub edit_flag: EditFlag,
    /// First component which failed the sigma edit, if any
    pub edited_component: Option<usize>,
}

impl MeasurementRecord {
    /// A record for an observation which could not be evaluated.
    pub fn not_computed(
        record_num: usize,
        epoch: Epoch,
        observed: DVector<f64>,
        noise_covar: DMatrix<f64>,
        edit_flag: EditFlag,
    ) -> Self {
        Self {
            record_num,
            epoch,
            observed,
            computed: None,
            prefit: None,
            postfit: None,
            scaled: None,
            noise_covar,
            innovation_covar: None,
            edit_flag,
            edited_component: None,
        }
    }

    /// Largest scaled residual magnitude, if residuals were computed.
    pub fn max_scaled(&self) -> Option<f64> {
        self.scaled
            .as_ref()
            .map(|scaled| scaled.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())))
    }
}

impl fmt::Display for MeasurementRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{} @ {} [{}]", self.record_num, self.epoch, self.edit_flag)?;
        if let Some(prefit) = &self.prefit {
            write!(f, " prefit {:e}", prefit.transpose())?;
        }
        if let Some(postfit) = &self.postfit {
            write!(f, " postfit {:e}", postfit.transpose())?;
        }
        Ok(())
    }
}
