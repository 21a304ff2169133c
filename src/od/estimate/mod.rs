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

use crate::linalg::{DMatrix, DVector, Matrix3, Matrix6, Vector3, Vector6};
use crate::time::Epoch;
use enum_iterator::Sequence;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

mod residual;
pub use residual::MeasurementRecord;

/// Why an observation did, or did not, update the estimate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Sequence)]
pub enum EditFlag {
    /// Accepted
    #[default]
    Normal,
    /// The measurement model could not compute a value for this observation.
    NoComputedValue,
    /// The observation falls outside of the ramp table.
    OutOfRampRange,
    /// The signal path is blocked.
    Blocked,
    /// The residual exceeded the sigma editing threshold.
    SigmaEdited,
    /// Edited by the user ahead of the estimation.
    UserEdited,
}

impl EditFlag {
    /// Whether this observation updates the estimate.
    pub fn is_normal(&self) -> bool {
        matches!(self, Self::Normal)
    }

    /// Short tag used in reports.
    pub fn report_str(&self) -> &'static str {
        match self {
            Self::Normal => "N",
            Self::NoComputedValue => "NCV",
            Self::OutOfRampRange => "OORR",
            Self::Blocked => "B",
            Self::SigmaEdited => "SIG",
            Self::UserEdited => "USER",
        }
    }
}

impl fmt::Display for EditFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.report_str())
    }
}

/// One filter time update or measurement update, as kept in the filter history.
///
/// Pure time updates (`is_obs == false`) have identical pre and post update state and covariance.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateRecord {
    pub is_obs: bool,
    pub epoch: Epoch,
    /// Estimate before the measurement update
    pub state_pre: DVector<f64>,
    /// Estimate after the measurement update
    pub state: DVector<f64>,
    /// Covariance after the time update, before the measurement update
    pub covar_bar: DMatrix<f64>,
    /// Covariance after the measurement update
    pub covar: DMatrix<f64>,
    /// State transition matrix of the time update which led to this record
    pub stm: DMatrix<f64>,
    /// Process noise added in the time update which led to this record
    pub process_noise: DMatrix<f64>,
    /// Position covariance in the VNB frame
    pub vnb_covar: Matrix3<f64>,
    pub vnb_sigma: Vector3<f64>,
    pub measurement: Option<MeasurementRecord>,
}

impl UpdateRecord {
    /// The edit flag of the measurement of this record, if any.
    pub fn edit_flag(&self) -> Option<EditFlag> {
        self.measurement.as_ref().map(|msr| msr.edit_flag)
    }

    /// Whether this record holds an observation which updated the estimate.
    pub fn is_accepted_obs(&self) -> bool {
        self.is_obs && self.edit_flag() == Some(EditFlag::Normal)
    }

    /// Standard deviations of each component of the estimate.
    pub fn sigmas(&self) -> DVector<f64> {
        self.covar.diagonal().map(|v| v.max(0.0).sqrt())
    }
}

impl fmt::Display for UpdateRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match &self.measurement {
            Some(msr) => format!("measurement #{} ({})", msr.record_num, msr.edit_flag),
            None => "time update".to_string(),
        };
        write!(
            f,
            "=== {kind} @ {} ===\nestimate: {:e}\nsigmas: {:e}\nVNB sigmas: {:e}",
            self.epoch,
            self.state.transpose(),
            self.sigmas().transpose(),
            self.vnb_sigma.transpose()
        )
    }
}

/// One smoothed estimate, built from a forward record and the matching backward record if any.
#[derive(Clone, Debug, PartialEq)]
pub struct SmoothedRecord {
    pub is_obs: bool,
    pub epoch: Epoch,
    pub state: DVector<f64>,
    pub covar: DMatrix<f64>,
    /// Whether a backward filter record contributed to this estimate
    pub combined: bool,
    /// Filter-smoother consistency test statistics, one per component
    pub consistency: DVector<f64>,
    pub vnb_covar: Matrix3<f64>,
    pub vnb_sigma: Vector3<f64>,
    /// The observation processed at this epoch, re-evaluated at the smoothed state
    pub measurement: Option<MeasurementRecord>,
}

impl SmoothedRecord {
    pub fn sigmas(&self) -> DVector<f64> {
        self.covar.diagonal().map(|v| v.max(0.0).sqrt())
    }
}

impl fmt::Display for SmoothedRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "=== smoothed {} @ {} ===\nestimate: {:e}\nsigmas: {:e}",
            if self.is_obs { "measurement" } else { "time update" },
            self.epoch,
            self.state.transpose(),
            self.sigmas().transpose()
        )
    }
}

/// Final products of an estimation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterSummary {
    pub epoch: Epoch,
    /// Final Cartesian estimate
    pub state: DVector<f64>,
    /// Final Keplerian elements, if the estimate is an orbit
    pub keplerian: Option<Vector6<f64>>,
    /// Covariance of the Keplerian elements, mapped with their Cartesian partials
    pub keplerian_covar: Option<Matrix6<f64>>,
    pub covar: DMatrix<f64>,
    /// Inverse of the final covariance, if it could be inverted
    pub information: Option<DMatrix<f64>>,
    pub iterations: usize,
    pub num_records: usize,
    pub edit_counts: BTreeMap<EditFlag, usize>,
}

impl FilterSummary {
    /// Number of observations flagged with the provided edit flag.
    pub fn count(&self, flag: EditFlag) -> usize {
        self.edit_counts.get(&flag).copied().unwrap_or(0)
    }
}

impl fmt::Display for FilterSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Final estimate @ {} after {} record(s)", self.epoch, self.num_records)?;
        writeln!(f, "state: {:e}", self.state.transpose())?;
        if let Some(kep) = &self.keplerian {
            writeln!(
                f,
                "sma = {:.6} km  ecc = {:.6}  inc = {:.6} deg  raan = {:.6} deg  aop = {:.6} deg  ta = {:.6} deg",
                kep[0], kep[1], kep[2], kep[3], kep[4], kep[5]
            )?;
        }
        if let Some(kep_covar) = &self.keplerian_covar {
            let sigma = kep_covar.diagonal().map(|var| var.max(0.0).sqrt());
            writeln!(
                f,
                "1-sigma: sma = {:.6} km  ecc = {:.6}  inc = {:.6} deg  raan = {:.6} deg  aop = {:.6} deg  ta = {:.6} deg",
                sigma[0], sigma[1], sigma[2], sigma[3], sigma[4], sigma[5]
            )?;
        }
        let counts: Vec<String> = self
            .edit_counts
            .iter()
            .map(|(flag, count)| format!("{flag}: {count}"))
            .collect();
        write!(f, "observation edits: {}", counts.join(", "))
    }
}

#[cfg(test)]
mod ut_estimate {
    use super::*;

    #[test]
    fn edit_flag_tags() {
        let tags: Vec<&str> = enum_iterator::all::<EditFlag>()
            .map(|flag| flag.report_str())
            .collect();
        assert_eq!(tags, vec!["N", "NCV", "OORR", "B", "SIG", "USER"]);
        assert!(EditFlag::default().is_normal());
        assert!(!EditFlag::SigmaEdited.is_normal());
    }
}
