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

use super::{MeasurementModel, Observation, ObservationArc};
use crate::propagators::{PropagationError, Propagator};
use crate::time::Epoch;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;

/// Generates observations of a truth trajectory with zero-mean Gaussian noise.
#[derive(Clone, Debug)]
pub struct ArcSimulator<M: MeasurementModel> {
    pub model: M,
    /// Standard deviation of the noise added to each component
    pub sigma: f64,
    pub seed: u64,
}

impl<M: MeasurementModel> ArcSimulator<M> {
    pub fn new(model: M, sigma: f64, seed: u64) -> Self {
        Self { model, sigma, seed }
    }

    /// Propagates a copy of the truth to each epoch (in time order) and observes it.
    ///
    /// Epochs before the truth epoch, or at which the model cannot compute a value, are skipped.
    pub fn generate<P: Propagator + Clone>(
        &self,
        truth: &P,
        epochs: &[Epoch],
    ) -> Result<ObservationArc<M>, PropagationError> {
        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);
        let noise = if self.sigma > 0.0 {
            Normal::new(0.0, self.sigma).ok()
        } else {
            None
        };

        let mut sorted = epochs.to_vec();
        sorted.sort();

        let mut prop = truth.clone();
        let mut observations = Vec::with_capacity(sorted.len());
        for epoch in sorted {
            if epoch < prop.epoch() {
                warn!("skipping simulated epoch {epoch} before the truth epoch");
                continue;
            }
            let step = epoch - prop.epoch();
            prop.advance(step)?;

            match self.model.compute(epoch, prop.state()) {
                Some(computed) => {
                    let mut value = computed.value;
                    if let Some(dist) = &noise {
                        for v in value.iter_mut() {
                            *v += dist.sample(&mut rng);
                        }
                    }
                    observations.push(Observation::new(epoch, value));
                }
                None => debug!("no simulated measurement at {epoch}"),
            }
        }

        info!(
            "simulated {} observations with sigma = {:e}",
            observations.len(),
            self.sigma
        );

        Ok(ObservationArc::new(self.model.clone(), observations))
    }
}
