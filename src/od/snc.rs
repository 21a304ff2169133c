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

use crate::io::{maybe_epoch_from_str, maybe_epoch_to_str, ConfigError};
use crate::linalg::{Matrix3, Matrix6};
use crate::time::{Duration, Epoch};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Time updates shorter than this many seconds do not add process noise.
pub const MIN_NOISE_DT_S: f64 = 1.0e-6;

/// Frame in which the process noise model is expressed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoiseFrame {
    #[default]
    Inertial,
    /// Velocity-normal-binormal frame of the current estimate.
    VNB,
}

/// Process noise models acting on the Cartesian position and velocity.
///
/// All models return a 6x6 covariance for an elapsed time (in seconds), in km^2, km^2/s, and km^2/s^2.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model")]
pub enum ProcessNoise {
    #[default]
    None,
    /// Constant covariance added at each update regardless of the elapsed time.
    Constant { diag: [f64; 6] },
    /// Position and velocity standard deviations growing linearly with time.
    BasicTime {
        /// Position sigma rate in km/s
        pos_rate: f64,
        /// Velocity sigma rate in km/s^2
        vel_rate: f64,
    },
    /// Singer first order Gauss-Markov acceleration model.
    Singer {
        /// Acceleration sigma in km/s^2
        sigma: f64,
        /// Time constant in seconds
        time_constant: f64,
    },
    /// State noise compensation: white acceleration noise per axis.
    SNC {
        /// Acceleration variances in km^2/s^4
        accel_var: [f64; 3],
        /// Noise is disabled when the time between updates exceeds this many seconds.
        #[serde(default)]
        disable_time: Option<f64>,
        /// No noise is added before this epoch, and decay is counted from it.
        #[serde(
            default,
            serialize_with = "maybe_epoch_to_str",
            deserialize_with = "maybe_epoch_from_str"
        )]
        start: Option<Epoch>,
        /// Exponential decay time constants in seconds, per axis.
        #[serde(default)]
        decay: Option<[f64; 3]>,
    },
}

/// A process noise model maps an elapsed time, ending at the provided epoch, to a 6x6 Cartesian covariance.
pub trait ProcessNoiseModel {
    fn process_noise(&self, elapsed: Duration, epoch: Epoch) -> Matrix6<f64>;
}

impl ProcessNoiseModel for ProcessNoise {
    fn process_noise(&self, elapsed: Duration, epoch: Epoch) -> Matrix6<f64> {
        if let Self::SNC {
            start: Some(start),
            decay,
            ..
        } = self
        {
            if epoch < *start {
                return Matrix6::zeros();
            }
            if let Some(decay) = decay {
                let since_start_s = (epoch - *start).to_seconds();
                let mut q = self.covariance(elapsed.to_seconds());
                // Each axis only populates its own position/velocity block
                for (i, tau) in decay.iter().enumerate() {
                    if *tau > 0.0 {
                        let factor = (-since_start_s / tau).exp();
                        for (r, c) in [(i, i), (i, i + 3), (i + 3, i), (i + 3, i + 3)] {
                            q[(r, c)] *= factor;
                        }
                    }
                }
                return q;
            }
        }
        self.covariance(elapsed.to_seconds())
    }
}

impl ProcessNoise {
    /// Builds a zeroed model from its name.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim() {
            "None" => Ok(Self::None),
            "Constant" | "ConstantAcceleration" => Ok(Self::Constant { diag: [0.0; 6] }),
            "BasicTime" | "LinearTime" => Ok(Self::BasicTime {
                pos_rate: 0.0,
                vel_rate: 0.0,
            }),
            "Singer" | "SingerModel" => Ok(Self::Singer {
                sigma: 0.0,
                time_constant: 1.0,
            }),
            "SNC" | "StateNoiseCompensation" => Ok(Self::SNC {
                accel_var: [0.0; 3],
                disable_time: None,
                start: None,
                decay: None,
            }),
            _ => Err(ConfigError::UnknownModel {
                kind: "process noise model",
                name: name.to_string(),
            }),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Checks that all parameters are physical.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |param: &'static str, value: f64| {
            if value < 0.0 || !value.is_finite() {
                Err(ConfigError::NegativeValue { param, value })
            } else {
                Ok(())
            }
        };
        match self {
            Self::None => Ok(()),
            Self::Constant { diag } => diag.iter().try_for_each(|v| check("Constant diagonal", *v)),
            Self::BasicTime { pos_rate, vel_rate } => {
                check("BasicTime position rate", *pos_rate)?;
                check("BasicTime velocity rate", *vel_rate)
            }
            Self::Singer {
                sigma,
                time_constant,
            } => {
                check("Singer sigma", *sigma)?;
                if *time_constant <= 0.0 {
                    return Err(ConfigError::NonPositiveValue {
                        param: "Singer time constant",
                        value: *time_constant,
                    });
                }
                Ok(())
            }
            Self::SNC {
                accel_var,
                disable_time,
                decay,
                ..
            } => {
                accel_var
                    .iter()
                    .try_for_each(|v| check("SNC acceleration variance", *v))?;
                if let Some(dt) = disable_time {
                    check("SNC disable time", *dt)?;
                }
                if let Some(decay) = decay {
                    decay.iter().try_for_each(|v| check("SNC decay", *v))?;
                }
                Ok(())
            }
        }
    }

    /// Process noise covariance accumulated over `elapsed_s` seconds (sign ignored).
    pub fn covariance(&self, elapsed_s: f64) -> Matrix6<f64> {
        let dt = elapsed_s.abs();
        let mut q = Matrix6::zeros();
        if dt < MIN_NOISE_DT_S {
            return q;
        }

        match self {
            Self::None => {}
            Self::Constant { diag } => {
                for (i, v) in diag.iter().enumerate() {
                    q[(i, i)] = *v;
                }
            }
            Self::BasicTime { pos_rate, vel_rate } => {
                let pos_var = (pos_rate * dt).powi(2);
                let vel_var = (vel_rate * dt).powi(2);
                for i in 0..3 {
                    q[(i, i)] = pos_var;
                    q[(i + 3, i + 3)] = vel_var;
                }
            }
            Self::Singer {
                sigma,
                time_constant,
            } => {
                let s = 2.0 * sigma.powi(2) * time_constant;
                let pp = dt.powi(3) / 3.0 * s;
                let pv = dt.powi(2) / 2.0 * s;
                let vv = dt * s;
                for i in 0..3 {
                    q[(i, i)] = pp;
                    q[(i, i + 3)] = pv;
                    q[(i + 3, i)] = pv;
                    q[(i + 3, i + 3)] = vv;
                }
            }
            Self::SNC {
                accel_var,
                disable_time,
                ..
            } => {
                if let Some(disable) = disable_time {
                    if dt > *disable {
                        debug!("SNC disabled: {dt} s since last update exceeds {disable} s");
                        return q;
                    }
                }
                // Gamma * Q * Gamma^T with Gamma = [dt^2/2 I; dt I]
                for (i, var) in accel_var.iter().enumerate() {
                    q[(i, i)] = dt.powi(4) / 4.0 * var;
                    q[(i, i + 3)] = dt.powi(3) / 2.0 * var;
                    q[(i + 3, i)] = dt.powi(3) / 2.0 * var;
                    q[(i + 3, i + 3)] = dt.powi(2) * var;
                }
            }
        }
        q
    }
}

/// Rotates a 6x6 VNB process noise into the inertial frame, given the inertial to VNB rotation.
pub fn vnb_to_inertial(q_vnb: &Matrix6<f64>, dcm_inertial_to_vnb: &Matrix3<f64>) -> Matrix6<f64> {
    let mut rot = Matrix6::zeros();
    let dcm_t = dcm_inertial_to_vnb.transpose();
    rot.fixed_view_mut::<3, 3>(0, 0).copy_from(&dcm_t);
    rot.fixed_view_mut::<3, 3>(3, 3).copy_from(&dcm_t);
    rot * q_vnb * rot.transpose()
}

impl fmt::Display for ProcessNoise {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => write!(f, "no process noise"),
            Self::Constant { diag } => {
                let fmt_diag: Vec<String> = diag.iter().map(|v| format!("{v:.1e}")).collect();
                write!(f, "constant process noise: diag({})", fmt_diag.join(", "))
            }
            Self::BasicTime { pos_rate, vel_rate } => write!(
                f,
                "basic time process noise: {pos_rate:.1e} km/s, {vel_rate:.1e} km/s^2"
            ),
            Self::Singer {
                sigma,
                time_constant,
            } => write!(f, "Singer process noise: {sigma:.1e} km/s^2, tau = {time_constant} s"),
            Self::SNC {
                accel_var,
                disable_time,
                start,
                decay,
            } => {
                let fmt_diag: Vec<String> = match decay {
                    Some(decay) => accel_var
                        .iter()
                        .zip(decay.iter())
                        .map(|(v, tau)| format!("{v:.1e} × exp(- t / {tau:.1e})"))
                        .collect(),
                    None => accel_var.iter().map(|v| format!("{v:.1e}")).collect(),
                };
                write!(f, "SNC: diag({})", fmt_diag.join(", "))?;
                if let Some(start) = start {
                    write!(f, " starting at {start}")?;
                }
                if let Some(dt) = disable_time {
                    write!(f, " disabled after {dt} s")?;
                }
                Ok(())
            }
        }
    }
}

#[test]
fn test_snc_init() {
    let snc = ProcessNoise::SNC {
        accel_var: [1e-12, 1e-12, 1e-12],
        disable_time: Some(120.0),
        start: None,
        decay: None,
    };
    println!("{snc}");
    let q = snc.covariance(60.0);
    assert_eq!(q[(0, 0)], 60.0_f64.powi(4) / 4.0 * 1e-12);
    assert_eq!(q[(0, 3)], q[(3, 0)]);
    assert_eq!(q[(3, 3)], 3600.0 * 1e-12);

    // Disabled past the disable time
    assert_eq!(snc.covariance(121.0), Matrix6::zeros());
    // And negligible durations add nothing
    assert_eq!(snc.covariance(1e-7), Matrix6::zeros());
    // Sign is ignored
    assert_eq!(snc.covariance(-60.0), q);
}

#[test]
fn test_snc_start_and_decay() {
    use crate::time::TimeUnits;
    let start = Epoch::from_gregorian_utc_at_midnight(2024, 1, 1);
    let snc = ProcessNoise::SNC {
        accel_var: [1e-12, 1e-12, 1e-12],
        disable_time: None,
        start: Some(start),
        decay: Some([100.0, 100.0, 100.0]),
    };
    assert_eq!(
        snc.process_noise(60.seconds(), start - 1.seconds()),
        Matrix6::zeros()
    );
    let at_start = snc.process_noise(60.seconds(), start);
    let later = snc.process_noise(60.seconds(), start + 100.seconds());
    approx::assert_relative_eq!(
        later[(3, 3)],
        at_start[(3, 3)] * (-1.0_f64).exp(),
        max_relative = 1e-12
    );
    approx::assert_relative_eq!(
        later[(0, 3)],
        at_start[(0, 3)] * (-1.0_f64).exp(),
        max_relative = 1e-12
    );
}

#[test]
fn test_basic_time_and_singer() {
    let basic = ProcessNoise::BasicTime {
        pos_rate: 1e-3,
        vel_rate: 1e-6,
    };
    let q = basic.covariance(30.0);
    assert_eq!(q[(0, 0)], (1e-3 * 30.0_f64).powi(2));
    assert_eq!(q[(5, 5)], (1e-6 * 30.0_f64).powi(2));

    let singer = ProcessNoise::Singer {
        sigma: 1e-6,
        time_constant: 100.0,
    };
    let q = singer.covariance(10.0);
    let s = 2.0 * 1e-12 * 100.0;
    approx::assert_relative_eq!(q[(1, 1)], 1000.0 / 3.0 * s, max_relative = 1e-12);
    approx::assert_relative_eq!(q[(1, 4)], 50.0 * s, max_relative = 1e-12);
    assert!(singer.validate().is_ok());
    assert!(ProcessNoise::Singer {
        sigma: 1.0,
        time_constant: 0.0
    }
    .validate()
    .is_err());
}

#[test]
fn test_from_name_and_frames() {
    assert_eq!(ProcessNoise::from_name("None").unwrap(), ProcessNoise::None);
    assert!(matches!(
        ProcessNoise::from_name("SingerModel").unwrap(),
        ProcessNoise::Singer { .. }
    ));
    assert!(ProcessNoise::from_name("Brownian").is_err());

    // Rotation preserves the trace
    let q = ProcessNoise::Constant {
        diag: [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
    }
    .covariance(1.0);
    let dcm = crate::linalg::Matrix3::new(0.0, 1.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let q_inertial = vnb_to_inertial(&q, &dcm);
    assert!((q_inertial.trace() - q.trace()).abs() < 1e-12);
    assert_eq!(q_inertial[(0, 0)], 2.0);
}
