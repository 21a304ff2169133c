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

use super::{NonFiniteStateSnafu, PropagationError, Propagator, StateTooShortSnafu};
use crate::linalg::{DMatrix, DVector};
use crate::time::{Duration, Epoch};
use snafu::ensure;

const CARTESIAN_NAMES: [&str; 6] = ["X", "Y", "Z", "VX", "VY", "VZ"];

/// Straight-line (force free) motion of a single participant. Components past the first six are constant parameters,
/// e.g. measurement biases.
///
/// The dynamics are linear, so the STM is exact and the propagator is a useful reference for filter tests.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPropagator {
    epoch: Epoch,
    state: DVector<f64>,
    stm: DMatrix<f64>,
    names: Vec<String>,
    /// Number of participants bound to this propagator, zero when unbound.
    pub participants: usize,
}

impl LinearPropagator {
    pub fn new(epoch: Epoch, state: DVector<f64>) -> Result<Self, PropagationError> {
        ensure!(
            state.len() >= 6,
            StateTooShortSnafu {
                need: 6_usize,
                got: state.len()
            }
        );
        let n = state.len();
        let names = (0..n)
            .map(|i| match CARTESIAN_NAMES.get(i) {
                Some(name) => name.to_string(),
                None => format!("Param_{}", i - 5),
            })
            .collect();
        Ok(Self {
            epoch,
            state,
            stm: DMatrix::identity(n, n),
            names,
            participants: 1,
        })
    }

    /// Transition matrix of the linear dynamics over `dt` seconds.
    pub fn transition(n: usize, dt: f64) -> DMatrix<f64> {
        let mut phi = DMatrix::identity(n, n);
        for i in 0..3 {
            phi[(i, i + 3)] = dt;
        }
        phi
    }
}

impl Propagator for LinearPropagator {
    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn state(&self) -> &DVector<f64> {
        &self.state
    }

    fn set_state(&mut self, epoch: Epoch, state: DVector<f64>) {
        self.epoch = epoch;
        self.state = state;
    }

    fn state_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn advance(&mut self, step: Duration) -> Result<(), PropagationError> {
        let dt = step.to_seconds();
        let phi = Self::transition(self.state.len(), dt);
        self.state = &phi * &self.state;
        self.stm = phi * &self.stm;
        self.epoch += step;
        ensure!(
            self.state.iter().all(|v| v.is_finite()),
            NonFiniteStateSnafu { epoch: self.epoch }
        );
        Ok(())
    }

    fn stm(&self) -> &DMatrix<f64> {
        &self.stm
    }

    fn reset_stm(&mut self) {
        let n = self.state.len();
        self.stm = DMatrix::identity(n, n);
    }

    fn participant_count(&self) -> usize {
        self.participants
    }
}

#[cfg(test)]
mod ut_linear {
    use super::*;
    use crate::time::TimeUnits;

    #[test]
    fn advance_and_stm() {
        let e0 = Epoch::from_gregorian_utc_at_midnight(2024, 1, 1);
        let x0 = DVector::from_vec(vec![7000.0, 0.0, 0.0, 0.0, 7.5, 0.0, 0.1]);
        let mut prop = LinearPropagator::new(e0, x0.clone()).unwrap();
        assert_eq!(prop.state_names()[6], "Param_1");

        prop.advance(10.seconds()).unwrap();
        prop.advance(-4.seconds()).unwrap();
        assert_eq!(prop.epoch(), e0 + 6.seconds());
        assert_eq!(prop.state()[1], 45.0);
        assert_eq!(prop.state()[6], 0.1);
        assert_eq!(prop.stm(), &LinearPropagator::transition(7, 6.0));
        assert_eq!(prop.stm() * &x0, *prop.state());

        prop.reset_stm();
        assert_eq!(prop.stm(), &DMatrix::identity(7, 7));

        assert!(LinearPropagator::new(e0, DVector::zeros(3)).is_err());
    }
}
