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

use super::OrbitDual;
use crate::linalg::{DMatrix, DVector, Matrix3, Matrix6, Vector3, Vector6};
use crate::time::Epoch;

/// Earth gravitational parameter in km^3/s^2.
pub const EARTH_GM_KM3_S2: f64 = 398_600.441_5;

/// Converts between the Cartesian representation the propagator integrates and the solve-for representation the
/// filter estimates, and provides the local frames needed for noise and reporting.
///
/// The first six components of every state are the inertial position (km) and velocity (km/s); any additional
/// component is carried through unchanged by the default implementations.
pub trait FrameGateway: Clone {
    /// Jacobian of the solve-for representation with respect to the Cartesian state, dS/dX.
    fn cartesian_to_solve_for(&self, state: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(state.len(), state.len())
    }

    /// Jacobian of the Cartesian state with respect to the solve-for representation, dX/dS.
    fn solve_for_to_cartesian(&self, state: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(state.len(), state.len())
    }

    /// Lifts the orbit of this state into hyperdual space, if the state is an orbit.
    fn orbit_dual(&self, state: &DVector<f64>) -> Option<OrbitDual>;

    /// Keplerian elements (SMA km, ECC, INC deg, RAAN deg, AOP deg, TA deg), if the state is an orbit.
    fn to_keplerian(&self, state: &DVector<f64>) -> Option<Vector6<f64>> {
        self.orbit_dual(state)?.keplerian().map(|(kep, _)| kep)
    }

    /// Rotation from the inertial frame into the velocity-normal-binormal frame of this state.
    fn vnb_rotation(&self, _epoch: Epoch, state: &DVector<f64>) -> Matrix3<f64> {
        vnb_rotation(state)
    }

    /// Jacobian of the Keplerian elements with respect to the first six solve-for components.
    fn solve_for_to_keplerian(&self, state: &DVector<f64>) -> Option<Matrix6<f64>> {
        let (_, kep_jac) = self.orbit_dual(state)?.keplerian()?;
        let cart_jac = self.solve_for_to_cartesian(state);
        let cart_block = Matrix6::from_fn(|i, j| cart_jac[(i, j)]);
        Some(kep_jac * cart_block)
    }
}

/// Direction cosine matrix whose rows are the V, N, and B unit vectors of the provided Cartesian state.
///
/// Falls back to the identity if the state is shorter than six components or the orbit is degenerate.
pub fn vnb_rotation(state: &DVector<f64>) -> Matrix3<f64> {
    if state.len() < 6 {
        return Matrix3::identity();
    }
    let r = Vector3::new(state[0], state[1], state[2]);
    let v = Vector3::new(state[3], state[4], state[5]);
    let h = r.cross(&v);
    if v.norm() < f64::EPSILON || h.norm() < f64::EPSILON {
        return Matrix3::identity();
    }
    let v_hat = v / v.norm();
    let n_hat = h / h.norm();
    let b_hat = v_hat.cross(&n_hat);
    Matrix3::from_rows(&[v_hat.transpose(), n_hat.transpose(), b_hat.transpose()])
}

/// Gateway for filters which estimate the Cartesian state directly.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CartesianGateway {
    pub mu_km3_s2: f64,
}

impl Default for CartesianGateway {
    fn default() -> Self {
        Self {
            mu_km3_s2: EARTH_GM_KM3_S2,
        }
    }
}

impl FrameGateway for CartesianGateway {
    fn orbit_dual(&self, state: &DVector<f64>) -> Option<OrbitDual> {
        if state.len() < 6 {
            return None;
        }
        let cartesian = Vector6::from_fn(|i, _| state[i]);
        Some(OrbitDual::new(&cartesian, self.mu_km3_s2))
    }
}
