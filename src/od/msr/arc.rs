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

use super::{
    ComputedMeasurement, Direction, DiscreteEvent, EventStatus, MeasurementManager,
    MeasurementModel, Observation, TrimSide,
};
use crate::cosmic::epochs_match;
use crate::linalg::DVector;
use crate::time::Epoch;

/// An in-memory table of observations processed with a single measurement model.
#[derive(Clone, Debug)]
pub struct ObservationArc<M: MeasurementModel> {
    pub model: M,
    observations: Vec<Observation>,
    direction: Direction,
    /// Observations at or before this epoch are dropped (or kept at the epoch if the flag is set)
    lower: Option<(Epoch, bool)>,
    /// Observations at or after this epoch are dropped (or kept at the epoch if the flag is set)
    upper: Option<(Epoch, bool)>,
    cursor: Option<usize>,
    computed: Option<ComputedMeasurement>,
    events: Vec<Box<dyn DiscreteEvent>>,
    located: Vec<bool>,
}

impl<M: MeasurementModel> ObservationArc<M> {
    /// Builds the arc, sorting the observations in time.
    pub fn new(model: M, mut observations: Vec<Observation>) -> Self {
        observations.sort_by(|a, b| a.epoch.cmp(&b.epoch));
        Self {
            model,
            observations,
            direction: Direction::Forward,
            lower: None,
            upper: None,
            cursor: None,
            computed: None,
            events: Vec::new(),
            located: Vec::new(),
        }
    }

    /// Adds an event which must be located before each measurement is processed.
    pub fn with_event(mut self, event: Box<dyn DiscreteEvent>) -> Self {
        self.events.push(event);
        self.located.push(false);
        self
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Number of observations within the trimmed window.
    pub fn usable_count(&self) -> usize {
        (0..self.observations.len())
            .filter(|idx| self.is_usable(*idx))
            .count()
    }

    fn is_usable(&self, idx: usize) -> bool {
        let epoch = match self.observations.get(idx) {
            Some(obs) => obs.epoch,
            None => return false,
        };
        if let Some((bound, keep_equal)) = self.lower {
            if epochs_match(epoch, bound) {
                if !keep_equal {
                    return false;
                }
            } else if epoch < bound {
                return false;
            }
        }
        if let Some((bound, keep_equal)) = self.upper {
            if epochs_match(epoch, bound) {
                if !keep_equal {
                    return false;
                }
            } else if epoch > bound {
                return false;
            }
        }
        true
    }

    /// Next usable index strictly after `from` in the processing direction, or the first one if `from` is `None`.
    fn next_usable(&self, from: Option<usize>) -> Option<usize> {
        let n = self.observations.len();
        match self.direction {
            Direction::Forward => {
                let start = from.map_or(0, |idx| idx + 1);
                (start..n).find(|idx| self.is_usable(*idx))
            }
            Direction::Backward => {
                let end = match from {
                    Some(0) => return None,
                    Some(idx) => idx,
                    None => n,
                };
                (0..end).rev().find(|idx| self.is_usable(*idx))
            }
        }
    }
}

impl<M: MeasurementModel> MeasurementManager for ObservationArc<M> {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    fn prepare_for_processing(&mut self) {
        self.computed = None;
        self.cursor = self.next_usable(None);
        debug!(
            "{} of {} observations usable {:?}",
            self.usable_count(),
            self.observations.len(),
            self.direction
        );
    }

    fn trim(&mut self, epoch: Epoch, side: TrimSide, keep_equal: bool) {
        match side {
            TrimSide::Before => self.lower = Some((epoch, keep_equal)),
            TrimSide::After => self.upper = Some((epoch, keep_equal)),
        }
        if let Some(idx) = self.cursor {
            if !self.is_usable(idx) {
                self.cursor = self.next_usable(Some(idx));
            }
        }
    }

    fn observations(&self) -> &[Observation] {
        &self.observations
    }

    fn observations_mut(&mut self) -> &mut [Observation] {
        &mut self.observations
    }

    fn current_index(&self) -> Option<usize> {
        self.cursor
    }

    fn advance_observation(&mut self) -> bool {
        self.computed = None;
        self.cursor = match self.cursor {
            Some(idx) => self.next_usable(Some(idx)),
            None => None,
        };
        self.cursor.is_some()
    }

    fn seek(&mut self, record_num: usize) -> bool {
        if self.is_usable(record_num) {
            self.cursor = Some(record_num);
            self.computed = None;
            true
        } else {
            false
        }
    }

    fn calculate_measurements(&mut self, epoch: Epoch, state: &DVector<f64>) -> bool {
        self.computed = None;
        if self.cursor.is_none() {
            return false;
        }
        for (event, located) in self.events.iter_mut().zip(self.located.iter_mut()) {
            event.reset();
            *located = false;
        }
        self.computed = self.model.compute(epoch, state);
        self.computed.is_some()
    }

    fn computed(&self) -> Option<&ComputedMeasurement> {
        self.computed.as_ref()
    }

    fn event_count(&self) -> usize {
        if self.computed.is_some() {
            self.events.len()
        } else {
            0
        }
    }

    fn check_event(&mut self, index: usize, epoch: Epoch, state: &DVector<f64>) -> EventStatus {
        match self.events.get_mut(index) {
            Some(event) => {
                let status = event.check_status(epoch, state);
                if status == EventStatus::Located {
                    self.located[index] = true;
                }
                status
            }
            None => EventStatus::Located,
        }
    }

    fn process_event(&mut self, index: usize) -> bool {
        match self.located.get(index) {
            Some(located) => {
                if *located {
                    trace!("event {} consumed", self.events[index].name());
                }
                *located
            }
            None => false,
        }
    }

    fn processing_complete(&mut self) {
        self.computed = None;
        self.cursor = None;
    }
}

#[cfg(test)]
mod ut_arc {
    use super::*;
    use crate::od::msr::PositionModel;
    use crate::time::TimeUnits;

    fn arc() -> (Epoch, ObservationArc<PositionModel>) {
        let e0 = Epoch::from_gregorian_utc_at_midnight(2024, 1, 1);
        // Deliberately out of order
        let obs = [2, 0, 1, 3]
            .iter()
            .map(|k| Observation::new(e0 + (*k as i64).minutes(), DVector::from_element(3, *k as f64)))
            .collect();
        (e0, ObservationArc::new(PositionModel { sigma_km: 1.0 }, obs))
    }

    #[test]
    fn forward_and_backward_walks() {
        let (e0, mut arc) = arc();
        arc.prepare_for_processing();
        assert_eq!(arc.observation_epoch(), Some(e0));
        let mut seen = vec![arc.current_index().unwrap()];
        while arc.advance_observation() {
            seen.push(arc.current_index().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(arc.observation_epoch(), None);

        arc.set_direction(Direction::Backward);
        arc.prepare_for_processing();
        assert_eq!(arc.observation_epoch(), Some(e0 + 3.minutes()));
        arc.advance_observation();
        assert_eq!(arc.current_index(), Some(2));
    }

    #[test]
    fn trimming_persists() {
        let (e0, mut arc) = arc();
        arc.trim(e0 + 1.minutes(), TrimSide::Before, false);
        arc.prepare_for_processing();
        assert_eq!(arc.current_index(), Some(2));
        assert_eq!(arc.usable_count(), 2);
        assert!(!arc.seek(1));
        assert!(arc.seek(3));

        arc.trim(e0 + 3.minutes(), TrimSide::After, true);
        arc.trim(e0 + 1.minutes(), TrimSide::Before, true);
        arc.prepare_for_processing();
        assert_eq!(arc.usable_count(), 3);
        assert_eq!(arc.current_index(), Some(1));
    }

    #[test]
    fn compute_current() {
        let (e0, mut arc) = arc();
        let state = DVector::from_vec(vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert!(!arc.calculate_measurements(e0, &state));
        arc.prepare_for_processing();
        assert!(arc.calculate_measurements(e0, &state));
        assert_eq!(arc.computed().unwrap().value[1], 2.0);
        assert_eq!(arc.event_count(), 0);
        arc.processing_complete();
        assert!(arc.computed().is_none());
    }
}
