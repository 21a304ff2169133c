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

use super::CovarianceUpdate;
use crate::linalg::{invert_with_tolerance, symmetrize, DMatrix, DVector};
use crate::od::ODError;

/// Outcome of a Kalman measurement update.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementUpdate {
    /// Updated state deviation
    pub state_deviation: DVector<f64>,
    pub covar: DMatrix<f64>,
    pub gain: DMatrix<f64>,
    /// Residual after the update, relative to the reference state
    pub postfit: DVector<f64>,
}

/// Computes a time update: maps the covariance and state deviation with the STM and adds the process noise.
///
/// The returned covariance is exactly symmetric.
pub fn time_update(
    covar: &DMatrix<f64>,
    state_deviation: &DVector<f64>,
    stm: &DMatrix<f64>,
    process_noise: &DMatrix<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let mut covar_bar = stm * covar * stm.transpose() + process_noise;
    symmetrize(&mut covar_bar);
    (covar_bar, stm * state_deviation)
}

/// Innovation covariance S = H P H^T + R
pub fn innovation_covariance(
    h_tilde: &DMatrix<f64>,
    covar_bar: &DMatrix<f64>,
    r_k: &DMatrix<f64>,
) -> DMatrix<f64> {
    let mut s_k = h_tilde * covar_bar * h_tilde.transpose() + r_k;
    symmetrize(&mut s_k);
    s_k
}

/// Prefit residuals scaled by the square root of the innovation covariance diagonal.
pub fn scaled_residuals(innovation: &DVector<f64>, s_k: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_fn(innovation.len(), |i, _| {
        let var = s_k[(i, i)];
        if var > 0.0 {
            innovation[i] / var.sqrt()
        } else {
            0.0
        }
    })
}

/// Returns the first component whose innovation magnitude exceeds `multiplier` standard deviations, if any.
///
/// A residual exactly at the threshold passes.
pub fn sigma_edit(innovation: &DVector<f64>, s_k: &DMatrix<f64>, multiplier: f64) -> Option<usize> {
    (0..innovation.len()).find(|i| innovation[*i].abs() > multiplier * s_k[(*i, *i)].max(0.0).sqrt())
}

/// Computes the Kalman gain and updates the state deviation and covariance.
///
/// `prefit` is the observed minus computed residual at the reference state, and `state_deviation` the pending
/// offset from that reference, so the innovation is `prefit - H dx`.
pub fn measurement_update(
    covar_bar: &DMatrix<f64>,
    state_deviation: &DVector<f64>,
    h_tilde: &DMatrix<f64>,
    r_k: &DMatrix<f64>,
    prefit: &DVector<f64>,
    method: CovarianceUpdate,
    cov_inv_tol: f64,
) -> Result<MeasurementUpdate, ODError> {
    let s_k = innovation_covariance(h_tilde, covar_bar, r_k);

    let s_k_inv = match invert_with_tolerance(&s_k, cov_inv_tol) {
        Some(s_k_inv) => s_k_inv,
        None => {
            // Distinguish a degenerate noise from a degenerate geometry
            return if invert_with_tolerance(r_k, cov_inv_tol).is_none() {
                Err(ODError::SingularNoiseRk)
            } else {
                Err(ODError::SingularKalmanGain)
            };
        }
    };

    let gain = covar_bar * h_tilde.transpose() * s_k_inv;

    let innovation = prefit - h_tilde * state_deviation;
    let state_hat = state_deviation + &gain * innovation;
    let postfit = prefit - h_tilde * &state_hat;

    let n = covar_bar.nrows();
    let first_term = DMatrix::<f64>::identity(n, n) - &gain * h_tilde;
    let mut covar = match method {
        CovarianceUpdate::Joseph => {
            &first_term * covar_bar * first_term.transpose() + &gain * r_k * gain.transpose()
        }
        CovarianceUpdate::Simple => &first_term * covar_bar,
    };
    symmetrize(&mut covar);

    Ok(MeasurementUpdate {
        state_deviation: state_hat,
        covar,
        gain,
        postfit,
    })
}
