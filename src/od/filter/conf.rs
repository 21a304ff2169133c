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

use crate::cosmic::EpochFormat;
use crate::io::warmstart::RowSelector;
use crate::io::{
    maybe_epoch_from_str, maybe_epoch_to_str, validate_file_name, ConfigError, ConfigRepr,
};
use crate::linalg::DEFAULT_COV_INV_TOL;
use crate::od::snc::{NoiseFrame, ProcessNoise};
use crate::time::{Duration, Epoch, Unit};
use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use typed_builder::TypedBuilder;

/// Default sigma editing threshold, in standard deviations.
pub const DEFAULT_SIGMA_MULTIPLIER: f64 = 3.0;

const FIRST_MEASUREMENT: &str = "FirstMeasurement";
const LAST_WARM_START_RECORD: &str = "LastWarmStartRecord";

/// Form of the covariance measurement update.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceUpdate {
    /// (I - KH) P (I - KH)^T + K R K^T, which preserves positive definiteness
    #[default]
    Joseph,
    /// (I - KH) P
    Simple,
}

/// Which warm-start record a run resumes from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WarmStartEpoch {
    /// The last record strictly before the first observation
    FirstMeasurement,
    /// The last record of the file
    #[default]
    LastWarmStartRecord,
    /// The last record at or before this epoch, written in the configured warm-start epoch format
    Literal(String),
}

impl WarmStartEpoch {
    /// Builds the row selector for this restore point.
    pub fn selector(
        &self,
        format: EpochFormat,
        first_measurement: Option<Epoch>,
    ) -> Result<RowSelector, ConfigError> {
        match self {
            Self::LastWarmStartRecord => Ok(RowSelector::Last),
            Self::FirstMeasurement => match first_measurement {
                Some(epoch) => Ok(RowSelector::StrictlyBefore(epoch)),
                None => {
                    warn!("no observations to warm start before, using the last warm-start record");
                    Ok(RowSelector::Last)
                }
            },
            Self::Literal(value) => Ok(RowSelector::NotAfter(format.parse(value)?)),
        }
    }
}

impl TryFrom<String> for WarmStartEpoch {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

impl FromStr for WarmStartEpoch {
    type Err = ConfigError;

    /// Accepts the two symbolic restore points or any non-empty literal, which is validated against the epoch format
    /// when assigned through the configuration.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            FIRST_MEASUREMENT => Ok(Self::FirstMeasurement),
            LAST_WARM_START_RECORD => Ok(Self::LastWarmStartRecord),
            "" => Err(ConfigError::InvalidEpoch {
                value: s.to_string(),
                format: EpochFormat::default(),
            }),
            literal => Ok(Self::Literal(literal.to_string())),
        }
    }
}

impl From<WarmStartEpoch> for String {
    fn from(value: WarmStartEpoch) -> Self {
        value.to_string()
    }
}

impl fmt::Display for WarmStartEpoch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FirstMeasurement => write!(f, "{FIRST_MEASUREMENT}"),
            Self::LastWarmStartRecord => write!(f, "{LAST_WARM_START_RECORD}"),
            Self::Literal(value) => write!(f, "{value}"),
        }
    }
}

/// Tunables of the sequential filter.
///
/// Durations are in seconds. All values are checked by [`FilterConfig::validate`] when the filter is initialized, and
/// immediately by the `set_*` methods.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(doc)]
pub struct FilterConfig {
    /// Cadence of the process noise updates, zero to only add noise at measurement updates
    #[builder(default)]
    #[serde(default)]
    pub process_noise_step: f64,
    /// Sigma editing threshold: observations whose residual exceeds this many standard deviations are edited
    #[builder(default = DEFAULT_SIGMA_MULTIPLIER)]
    #[serde(default = "default_sigma_multiplier")]
    pub sigma_multiplier: f64,
    /// Span after the start during which corrections are kept as a state offset instead of rectifying the reference
    #[builder(default)]
    #[serde(default)]
    pub delay_rectify_span: f64,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub input_warm_start_file: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub output_warm_start_file: Option<String>,
    /// Format of the `warm_start_epoch` literal and of the epochs written to the output warm-start file
    #[builder(default)]
    #[serde(default)]
    pub warm_start_epoch_format: EpochFormat,
    #[builder(default)]
    #[serde(default)]
    pub warm_start_epoch: WarmStartEpoch,
    /// Pivot tolerance used when inverting covariances and innovation covariances
    #[builder(default = DEFAULT_COV_INV_TOL)]
    #[serde(default = "default_cov_inv_tol")]
    pub cov_inv_tol: f64,
    #[builder(default)]
    #[serde(default)]
    pub process_noise: ProcessNoise,
    #[builder(default)]
    #[serde(default)]
    pub noise_frame: NoiseFrame,
    #[builder(default)]
    #[serde(default)]
    pub covariance_update: CovarianceUpdate,
    /// Measurement noise standard deviation used when neither the observation nor the model provide one
    #[builder(default = 1.0)]
    #[serde(default = "default_msr_sigma")]
    pub default_msr_sigma: f64,
    /// If set, predict for this long after the last observation
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub prediction_span: Option<f64>,
    /// If set, predict until this epoch after the last observation
    #[builder(default, setter(strip_option))]
    #[serde(
        default,
        serialize_with = "maybe_epoch_to_str",
        deserialize_with = "maybe_epoch_from_str"
    )]
    pub anchor_epoch: Option<Epoch>,
}

fn default_sigma_multiplier() -> f64 {
    DEFAULT_SIGMA_MULTIPLIER
}

fn default_cov_inv_tol() -> f64 {
    DEFAULT_COV_INV_TOL
}

fn default_msr_sigma() -> f64 {
    1.0
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConfigRepr for FilterConfig {}

fn non_negative(param: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value < 0.0 || !value.is_finite() {
        Err(ConfigError::NegativeValue { param, value })
    } else {
        Ok(value)
    }
}

fn positive(param: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value <= 0.0 || !value.is_finite() {
        Err(ConfigError::NonPositiveValue { param, value })
    } else {
        Ok(value)
    }
}

fn file_name(param: &'static str, name: &str) -> Result<Option<String>, ConfigError> {
    if name.trim().is_empty() {
        Ok(None)
    } else {
        validate_file_name(param, name)?;
        Ok(Some(name.trim().to_string()))
    }
}

impl FilterConfig {
    pub fn set_process_noise_step(&mut self, seconds: f64) -> Result<(), ConfigError> {
        self.process_noise_step = non_negative("ProcessNoiseTimeStep", seconds)?;
        Ok(())
    }

    pub fn set_sigma_multiplier(&mut self, multiplier: f64) -> Result<(), ConfigError> {
        self.sigma_multiplier = positive("ScaledResidualThreshold", multiplier)?;
        Ok(())
    }

    pub fn set_delay_rectify_span(&mut self, seconds: f64) -> Result<(), ConfigError> {
        self.delay_rectify_span = non_negative("DelayRectifyTimeSpan", seconds)?;
        Ok(())
    }

    /// Sets the file to resume from, an empty name disables the warm start.
    pub fn set_input_warm_start_file(&mut self, name: &str) -> Result<(), ConfigError> {
        self.input_warm_start_file = file_name("InputWarmStartFile", name)?;
        Ok(())
    }

    /// Sets the file to write the run history to, an empty name disables it.
    pub fn set_output_warm_start_file(&mut self, name: &str) -> Result<(), ConfigError> {
        self.output_warm_start_file = file_name("OutputWarmStartFile", name)?;
        Ok(())
    }

    pub fn set_warm_start_epoch_format(&mut self, name: &str) -> Result<(), ConfigError> {
        self.warm_start_epoch_format = EpochFormat::from_str(name)?;
        Ok(())
    }

    /// Sets the restore point, literal epochs must parse in the current warm-start epoch format.
    pub fn set_warm_start_epoch(&mut self, value: &str) -> Result<(), ConfigError> {
        let epoch = WarmStartEpoch::from_str(value)?;
        if let WarmStartEpoch::Literal(literal) = &epoch {
            self.warm_start_epoch_format.parse(literal)?;
        }
        self.warm_start_epoch = epoch;
        Ok(())
    }

    pub fn set_cov_inv_tol(&mut self, tol: f64) -> Result<(), ConfigError> {
        self.cov_inv_tol = positive("CovarianceInversionTolerance", tol)?;
        Ok(())
    }

    pub fn set_prediction_span(&mut self, seconds: f64) -> Result<(), ConfigError> {
        self.prediction_span = Some(non_negative("PredictionTimeSpan", seconds)?);
        Ok(())
    }

    /// Sets an option from its name and string value, as found in mission scripts.
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let real = |param: &'static str| {
            f64::from_str(value.trim()).map_err(|_| ConfigError::InvalidParameter {
                param,
                value: value.to_string(),
            })
        };
        match name {
            "ProcessNoiseTimeStep" => self.set_process_noise_step(real("ProcessNoiseTimeStep")?),
            "ScaledResidualThreshold" => {
                self.set_sigma_multiplier(real("ScaledResidualThreshold")?)
            }
            "DelayRectifyTimeSpan" => self.set_delay_rectify_span(real("DelayRectifyTimeSpan")?),
            "InputWarmStartFile" => self.set_input_warm_start_file(value),
            "OutputWarmStartFile" => self.set_output_warm_start_file(value),
            "WarmStartEpochFormat" => self.set_warm_start_epoch_format(value),
            "WarmStartEpoch" => self.set_warm_start_epoch(value),
            "CovarianceInversionTolerance" => {
                self.set_cov_inv_tol(real("CovarianceInversionTolerance")?)
            }
            "PredictionTimeSpan" => self.set_prediction_span(real("PredictionTimeSpan")?),
            "ProcessNoiseModel" => {
                self.process_noise = ProcessNoise::from_name(value)?;
                Ok(())
            }
            _ => Err(ConfigError::UnknownModel {
                kind: "filter parameter",
                name: name.to_string(),
            }),
        }
    }

    /// Checks every option, as the setters do. Used for configurations built by hand or loaded from YAML.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_negative("ProcessNoiseTimeStep", self.process_noise_step)?;
        positive("ScaledResidualThreshold", self.sigma_multiplier)?;
        non_negative("DelayRectifyTimeSpan", self.delay_rectify_span)?;
        positive("CovarianceInversionTolerance", self.cov_inv_tol)?;
        positive("DefaultMeasurementSigma", self.default_msr_sigma)?;
        if let Some(span) = self.prediction_span {
            non_negative("PredictionTimeSpan", span)?;
        }
        if let Some(name) = &self.input_warm_start_file {
            validate_file_name("InputWarmStartFile", name)?;
        }
        if let Some(name) = &self.output_warm_start_file {
            validate_file_name("OutputWarmStartFile", name)?;
        }
        if let WarmStartEpoch::Literal(literal) = &self.warm_start_epoch {
            self.warm_start_epoch_format.parse(literal)?;
        }
        self.process_noise.validate()
    }

    pub fn process_noise_step_duration(&self) -> Option<Duration> {
        if self.process_noise_step > 0.0 {
            Some(Unit::Second * self.process_noise_step)
        } else {
            None
        }
    }

    pub fn delay_rectify_duration(&self) -> Duration {
        Unit::Second * self.delay_rectify_span
    }
}

impl fmt::Display for FilterConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} sigma editing, {} ({:?} frame) every {}, {:?} covariance update",
            self.sigma_multiplier,
            self.process_noise,
            self.noise_frame,
            match self.process_noise_step_duration() {
                Some(step) => format!("{step}"),
                None => "measurement".to_string(),
            },
            self.covariance_update
        )
    }
}
