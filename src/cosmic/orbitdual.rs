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

use crate::linalg::{Matrix6, Vector3, Vector6, U7};
use hyperdual::linalg::norm;
use hyperdual::{hyperspace_from_vector, Float, OHyperdual};
use std::f64::consts::{PI, TAU};

type Dual = OHyperdual<f64, U7>;

/// Below this eccentricity (or node vector magnitude), the orbit is handled as circular (or equatorial).
const DEGENERATE_EPSILON: f64 = 1e-11;

/// Cartesian orbit lifted into hyperdual space: every element computed from it carries its partials with respect to
/// the Cartesian position and velocity.
#[derive(Copy, Clone, Debug)]
pub struct OrbitDual {
    radius: Vector3<Dual>,
    velocity: Vector3<Dual>,
    mu: Dual,
}

impl OrbitDual {
    pub fn new(cartesian: &Vector6<f64>, mu_km3_s2: f64) -> Self {
        let hyperstate = hyperspace_from_vector(cartesian);
        Self {
            radius: Vector3::new(hyperstate[0], hyperstate[1], hyperstate[2]),
            velocity: Vector3::new(hyperstate[3], hyperstate[4], hyperstate[5]),
            mu: Dual::from(mu_km3_s2),
        }
    }

    fn hvec(&self) -> Vector3<Dual> {
        self.radius.cross(&self.velocity)
    }

    fn evec(&self) -> Vector3<Dual> {
        let r = self.radius;
        let v = self.velocity;
        let coeff = norm(&v).powi(2) - self.mu / norm(&r);
        let rdotv = r.dot(&v);
        Vector3::new(
            (coeff * r[0] - rdotv * v[0]) / self.mu,
            (coeff * r[1] - rdotv * v[1]) / self.mu,
            (coeff * r[2] - rdotv * v[2]) / self.mu,
        )
    }

    /// Keplerian elements (SMA km, ECC, INC deg, RAAN deg, AOP deg, TA deg) and their Jacobian with respect to the
    /// Cartesian state.
    ///
    /// Returns `None` for rectilinear and parabolic orbits. Circular orbits report the argument of latitude as the
    /// true anomaly, and circular equatorial orbits the true longitude.
    pub fn keplerian(&self) -> Option<(Vector6<f64>, Matrix6<f64>)> {
        let r = self.radius;
        let v = self.velocity;
        let rmag = norm(&r);
        let hvec = self.hvec();
        let hmag = norm(&hvec);
        if rmag.real() < f64::EPSILON || hmag.real() < f64::EPSILON || self.mu.real() <= 0.0 {
            return None;
        }

        let energy = norm(&v).powi(2) / Dual::from(2.0) - self.mu / rmag;
        if energy.real().abs() < f64::EPSILON {
            return None;
        }
        let sma = -self.mu / (Dual::from(2.0) * energy);
        let evec = self.evec();
        let ecc = norm(&evec);
        let inc = acos_clamped(hvec[2] / hmag);

        let node = Vector3::new(-hvec[1], hvec[0], Dual::from(0.0));
        let equatorial = (hvec[0].real().powi(2) + hvec[1].real().powi(2)).sqrt() < DEGENERATE_EPSILON;
        let circular = ecc.real() < DEGENERATE_EPSILON;

        let raan = if equatorial {
            Dual::from(0.0)
        } else {
            let node_mag = norm(&node);
            quadrant(acos_clamped(node[0] / node_mag), node[1].real() < 0.0)
        };

        let aop = if circular || equatorial {
            Dual::from(0.0)
        } else {
            let node_mag = norm(&node);
            quadrant(
                acos_clamped(node.dot(&evec) / (node_mag * ecc)),
                evec[2].real() < 0.0,
            )
        };

        let ta = match (circular, equatorial) {
            (true, true) => quadrant(acos_clamped(r[0] / rmag), r[1].real() < 0.0),
            (true, false) => {
                let node_mag = norm(&node);
                quadrant(
                    acos_clamped(node.dot(&r) / (node_mag * rmag)),
                    r[2].real() < 0.0,
                )
            }
            _ => quadrant(
                acos_clamped(evec.dot(&r) / (ecc * rmag)),
                r.dot(&v).real() < 0.0,
            ),
        };

        let elements = [
            sma,
            ecc,
            inc.to_degrees(),
            raan.to_degrees(),
            aop.to_degrees(),
            ta.to_degrees(),
        ];
        let values = Vector6::from_fn(|i, _| elements[i].real());
        // The first component of each hyperdual is the real part
        let partials = Matrix6::from_fn(|i, j| elements[i][j + 1]);
        Some((values, partials))
    }
}

/// Arc cosine with the argument saturated to [-1, 1], constant (no partials) at the bounds.
fn acos_clamped(cos: Dual) -> Dual {
    if cos.real() >= 1.0 {
        Dual::from(0.0)
    } else if cos.real() <= -1.0 {
        Dual::from(PI)
    } else {
        cos.acos()
    }
}

fn quadrant(angle: Dual, lower_half: bool) -> Dual {
    if lower_half {
        Dual::from(TAU) - angle
    } else {
        angle
    }
}
