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

use crate::linalg::{information, invert_with_tolerance, symmetrize, DMatrix, DVector};
use std::fmt;

/// A smoothed state and covariance.
#[derive(Clone, Debug, PartialEq)]
pub struct Combination {
    pub state: DVector<f64>,
    pub covar: DMatrix<f64>,
    /// Whether backward information contributed
    pub combined: bool,
}

impl Combination {
    pub fn forward_only(state: &DVector<f64>, covar: &DMatrix<f64>) -> Self {
        Self {
            state: state.clone(),
            covar: covar.clone(),
            combined: false,
        }
    }

    /// Filter-smoother consistency ratios: the smoother correction of each component divided by the square root of
    /// the variance reduction. Components whose variance did not decrease have a zero ratio.
    pub fn consistency(&self, forward_state: &DVector<f64>, forward_covar: &DMatrix<f64>) -> DVector<f64> {
        DVector::from_fn(self.state.len(), |i, _| {
            let delta_var = forward_covar[(i, i)] - self.covar[(i, i)];
            if delta_var > 0.0 {
                (self.state[i] - forward_state[i]) / delta_var.sqrt()
            } else {
                0.0
            }
        })
    }
}

/// Combines the forward estimate at an epoch with the backward estimate at the same epoch.
///
/// Implementations must return the forward estimate unchanged when there is no backward estimate, and a symmetric
/// covariance otherwise.
pub trait SmoothingAlgorithm: Clone + fmt::Debug {
    fn combine(
        &self,
        forward: (&DVector<f64>, &DMatrix<f64>),
        backward: Option<(&DVector<f64>, &DMatrix<f64>)>,
        cov_inv_tol: f64,
    ) -> Combination;
}

/// Fraser-Potter two-filter smoother: the smoothed information is the sum of the forward and backward information.
///
/// The backward estimate must not include the observation processed by the forward filter at the same epoch,
/// otherwise that observation is counted twice.
#[derive(Copy, Clone, Debug, Default)]
pub struct FraserPotter;

impl SmoothingAlgorithm for FraserPotter {
    fn combine(
        &self,
        forward: (&DVector<f64>, &DMatrix<f64>),
        backward: Option<(&DVector<f64>, &DMatrix<f64>)>,
        cov_inv_tol: f64,
    ) -> Combination {
        let (x_f, p_f) = forward;
        let (x_b, p_b) = match backward {
            Some(backward) => backward,
            None => return Combination::forward_only(x_f, p_f),
        };

        let (info_f, info_b) = match (information(p_f, cov_inv_tol), information(p_b, cov_inv_tol)) {
            (Some(info_f), Some(info_b)) => (info_f, info_b),
            _ => {
                warn!("singular forward or backward covariance, keeping the forward estimate");
                return Combination::forward_only(x_f, p_f);
            }
        };

        let mut p_s = match invert_with_tolerance(&(&info_f + &info_b), cov_inv_tol) {
            Some(p_s) => p_s,
            None => {
                warn!("singular combined information, keeping the forward estimate");
                return Combination::forward_only(x_f, p_f);
            }
        };
        symmetrize(&mut p_s);

        // Equivalent to Ps (If xf + Ib xb) without summing large absolute states
        let x_s = x_f + &p_s * info_b * (x_b - x_f);

        Combination {
            state: x_s,
            covar: p_s,
            combined: true,
        }
    }
}

#[cfg(test)]
mod ut_fraser_potter {
    use super::*;
    use crate::linalg::{is_symmetric, trace};
    use approx::assert_relative_eq;

    #[test]
    fn equal_weights_average() {
        let p = DMatrix::from_diagonal_element(2, 2, 4.0);
        let x_f = DVector::from_vec(vec![1.0, 2.0]);
        let x_b = DVector::from_vec(vec![3.0, 2.0]);
        let comb = FraserPotter.combine((&x_f, &p), Some((&x_b, &p)), 1e-20);
        assert!(comb.combined);
        assert_relative_eq!(comb.state[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(comb.state[1], 2.0, epsilon = 1e-12);
        assert_relative_eq!(comb.covar[(0, 0)], 2.0, epsilon = 1e-12);
        let ratios = comb.consistency(&x_f, &p);
        assert_relative_eq!(ratios[0], 1.0 / 2.0_f64.sqrt(), epsilon = 1e-12);
        assert_eq!(ratios[1], 0.0);
    }

    #[test]
    fn forward_only_without_backward() {
        let p = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);
        let x = DVector::from_vec(vec![7000.0, 7.5]);
        let comb = FraserPotter.combine((&x, &p), None, 1e-20);
        assert!(!comb.combined);
        assert_eq!(comb.state, x);
        assert_eq!(comb.covar, p);
        assert_eq!(comb.consistency(&x, &p), DVector::zeros(2));
    }

    #[test]
    fn diffuse_backward_is_negligible() {
        let p_f = DMatrix::from_row_slice(3, 3, &[2.0, 0.3, 0.0, 0.3, 1.0, 0.1, 0.0, 0.1, 0.5]);
        let p_b = &p_f * 1.0e10;
        let x_f = DVector::from_vec(vec![7000.0, 1.0, -3.0]);
        let x_b = DVector::from_vec(vec![7001.0, 1.5, -2.0]);
        let comb = FraserPotter.combine((&x_f, &p_f), Some((&x_b, &p_b)), 1e-20);
        assert!(comb.combined);
        assert!(is_symmetric(&comb.covar));
        assert!(trace(&comb.covar) <= trace(&p_f));
        assert_relative_eq!(comb.state, x_f, epsilon = 1e-8);
    }
}
