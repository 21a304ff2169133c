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

use super::estimate::{FilterSummary, MeasurementRecord, SmoothedRecord, UpdateRecord};
use super::filter::{
    cartesian_vnb_covariance, edit_counts, kalman, summarize, to_cartesian_covar, Action,
    Estimator, EstimatorState, SequentialFilter,
};
use super::msr::{MeasurementManager, TrimSide};
use super::{
    EmptyForwardPassSnafu, FilterNotSetSnafu, ODConfigSnafu, ODError, ODReportIoSnafu,
    ReentrantSnafu, UnknownStateSnafu,
};
use crate::cosmic::{epochs_match, CartesianGateway, FrameGateway};
use crate::io::report::{NullReport, ReportSink};
use crate::io::{ConfigError, ConfigRepr};
use crate::propagators::Propagator;
use crate::time::{Duration, Epoch, Unit};
use serde_derive::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use typed_builder::TypedBuilder;

mod algorithm;
pub use algorithm::{Combination, FraserPotter, SmoothingAlgorithm};

/// Default factor applied to the last forward covariance to seed the backward filter.
pub const BACKWARD_COVAR_INFLATION: f64 = 1.0e10;

/// Phase of the smoother, orthogonal to the estimator state it mirrors.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SmootherState {
    /// Running the forward then the backward filter
    #[default]
    Filtering,
    /// Combining the forward and backward records
    Smoothing,
    /// Predicting from the last smoothed estimate
    Predicting,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Pass {
    Forward,
    Backward,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(doc)]
pub struct SmootherConfig {
    /// Factor applied to the last forward covariance to initialize the backward filter
    #[builder(default = BACKWARD_COVAR_INFLATION)]
    #[serde(default = "default_inflation")]
    pub backward_inflation: f64,
    /// If set, predict for this many seconds from the last smoothed estimate
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub prediction_span: Option<f64>,
}

fn default_inflation() -> f64 {
    BACKWARD_COVAR_INFLATION
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConfigRepr for SmootherConfig {}

impl SmootherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backward_inflation <= 0.0 || !self.backward_inflation.is_finite() {
            return Err(ConfigError::NonPositiveValue {
                param: "BackwardCovarianceInflation",
                value: self.backward_inflation,
            });
        }
        if let Some(span) = self.prediction_span {
            if span < 0.0 || !span.is_finite() {
                return Err(ConfigError::NegativeValue {
                    param: "PredictionTimeSpan",
                    value: span,
                });
            }
        }
        Ok(())
    }
}

/// Forward/backward two-filter smoother.
///
/// The smoother owns the forward filter. It runs it to completion, then runs a backward filter over the same
/// observations, seeded from the last forward estimate with an inflated covariance and the forward edit flags. It
/// then walks the forward records one by one, combining each with the backward estimate at the same epoch with the
/// smoothing algorithm `S`, and recomputes the residuals at the smoothed states.
pub struct Smoother<P, M, G = CartesianGateway, S = FraserPotter>
where
    P: Propagator + Clone,
    M: MeasurementManager + Clone,
    G: FrameGateway,
    S: SmoothingAlgorithm,
{
    pub name: String,
    pub config: SmootherConfig,
    algorithm: S,
    filter: Option<SequentialFilter<P, M, G>>,
    backward: Option<SequentialFilter<P, M, G>>,
    /// Propagator and measurements as handed over, before any pass
    pristine: Option<(P, M)>,
    /// Measurements used to recompute the residuals at the smoothed states
    smoothing_msr: Option<M>,
    report: Box<dyn ReportSink>,
    state: EstimatorState,
    smoother_state: SmootherState,
    pass: Pass,
    forward_records: Vec<UpdateRecord>,
    backward_records: Vec<UpdateRecord>,
    smoothed: Vec<SmoothedRecord>,
    /// Index of the next forward record to smooth
    index: usize,
    /// Combination of the observation record being smoothed
    pending: Option<Combination>,
    forward_anchor: Option<Epoch>,
    summary: Option<FilterSummary>,
    no_output: bool,
    in_progress: bool,
    complete: bool,
}

impl<P, M, G> Smoother<P, M, G, FraserPotter>
where
    P: Propagator + Clone,
    M: MeasurementManager + Clone,
    G: FrameGateway,
{
    pub fn new(name: &str, config: SmootherConfig) -> Self {
        Self::with_algorithm(name, config, FraserPotter)
    }
}

impl<P, M, G, S> Smoother<P, M, G, S>
where
    P: Propagator + Clone,
    M: MeasurementManager + Clone,
    G: FrameGateway,
    S: SmoothingAlgorithm,
{
    pub fn with_algorithm(name: &str, config: SmootherConfig, algorithm: S) -> Self {
        Self {
            name: name.to_string(),
            config,
            algorithm,
            filter: None,
            backward: None,
            pristine: None,
            smoothing_msr: None,
            report: Box::new(NullReport),
            state: EstimatorState::Undefined,
            smoother_state: SmootherState::Filtering,
            pass: Pass::Forward,
            forward_records: Vec::new(),
            backward_records: Vec::new(),
            smoothed: Vec::new(),
            index: 0,
            pending: None,
            forward_anchor: None,
            summary: None,
            no_output: false,
            in_progress: false,
            complete: false,
        }
    }

    /// Sets the forward filter, which must not have been run yet.
    pub fn with_filter(mut self, filter: SequentialFilter<P, M, G>) -> Self {
        self.set_filter(filter);
        self
    }

    pub fn set_filter(&mut self, filter: SequentialFilter<P, M, G>) {
        self.filter = Some(filter);
        self.pristine = None;
    }

    pub fn with_report(mut self, report: Box<dyn ReportSink>) -> Self {
        self.report = report;
        self
    }

    pub fn filter(&self) -> Option<&SequentialFilter<P, M, G>> {
        self.filter.as_ref()
    }

    pub fn smoother_state(&self) -> SmootherState {
        self.smoother_state
    }

    /// Records of the forward pass, available once the forward filter has finished.
    pub fn forward_records(&self) -> &[UpdateRecord] {
        &self.forward_records
    }

    /// Records of the backward pass, in the backward processing order.
    pub fn backward_records(&self) -> &[UpdateRecord] {
        &self.backward_records
    }

    pub fn smoothed_records(&self) -> &[SmoothedRecord] {
        &self.smoothed
    }

    /// Records predicted after smoothing, if a prediction span is configured.
    pub fn predicted_records(&self) -> &[UpdateRecord] {
        match &self.filter {
            Some(filter) if self.smoother_state == SmootherState::Predicting => filter
                .records()
                .get(self.forward_records.len()..)
                .unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn summary(&self) -> Option<&FilterSummary> {
        self.summary.as_ref()
    }

    fn active_filter(&mut self) -> Result<&mut SequentialFilter<P, M, G>, ODError> {
        let filter = match (self.smoother_state, self.pass) {
            (SmootherState::Filtering, Pass::Backward) => self.backward.as_mut(),
            _ => self.filter.as_mut(),
        };
        filter.context(FilterNotSetSnafu)
    }

    fn filter_step(&mut self) -> Result<EstimatorState, ODError> {
        let (state, done) = {
            let active = self.active_filter()?;
            let state = active.advance_state()?;
            (state, active.is_complete())
        };
        if !done {
            return Ok(state);
        }
        match self.pass {
            Pass::Forward => self.begin_backward_pass(),
            Pass::Backward => self.begin_smoothing(),
        }
    }

    fn begin_backward_pass(&mut self) -> Result<EstimatorState, ODError> {
        let filter = self.filter.as_ref().context(FilterNotSetSnafu)?;
        let records = filter.records().to_vec();
        ensure!(
            records.iter().any(|rec| rec.is_obs),
            EmptyForwardPassSnafu
        );
        let (mut prop, msr) = self.pristine.clone().context(FilterNotSetSnafu)?;

        let first_epoch = records[0].epoch;
        let last = &records[records.len() - 1];
        prop.set_state(last.epoch, last.state.clone());
        prop.reset_stm();

        let mut config = filter.config.clone();
        config.input_warm_start_file = None;
        config.output_warm_start_file = None;
        config.prediction_span = None;
        config.anchor_epoch = None;

        let covar = &last.covar * self.config.backward_inflation;
        let mut backward = SequentialFilter::with_gateway(
            &format!("{} (backward)", self.name),
            prop,
            msr,
            filter.gateway().clone(),
            covar,
            config,
        );

        let mut inherited = 0;
        for msr in records.iter().filter_map(|rec| rec.measurement.as_ref()) {
            if let Some(obs) = backward.msr_mut().observations_mut().get_mut(msr.record_num) {
                obs.edit_flag = msr.edit_flag;
                inherited += 1;
            }
        }
        // The forward estimate at the first epoch already holds every earlier observation
        backward
            .msr_mut()
            .trim(first_epoch, TrimSide::Before, false);
        // Every forward time update needs a backward estimate at the same epoch
        backward.set_stop_epochs(
            records
                .iter()
                .filter(|rec| !rec.is_obs && !epochs_match(rec.epoch, first_epoch))
                .map(|rec| rec.epoch),
        );

        backward.initialize()?;
        backward.take_action(Action::UseProvidedFlags);
        backward.take_action(Action::NoOutput);
        backward.take_action(Action::RunBackwards);

        info!(
            "{} forward pass done with {} records, running backward from {} with {inherited} inherited edit flags",
            self.name,
            records.len(),
            last.epoch
        );

        self.forward_records = records;
        self.backward = Some(backward);
        self.pass = Pass::Backward;
        Ok(EstimatorState::Initializing)
    }

    fn begin_smoothing(&mut self) -> Result<EstimatorState, ODError> {
        let backward = self.backward.as_ref().context(FilterNotSetSnafu)?;
        self.backward_records = backward.records().to_vec();
        self.smoothing_msr = self.pristine.as_ref().map(|(_, msr)| msr.clone());
        self.smoothed.clear();
        self.index = 0;
        self.smoother_state = SmootherState::Smoothing;
        info!(
            "{} smoothing {} forward records with {} backward records",
            self.name,
            self.forward_records.len(),
            self.backward_records.len()
        );
        Ok(EstimatorState::Propagating)
    }

    /// Backward record at the epoch of the forward record: the same observation for observation records, preferably
    /// a time update otherwise.
    fn backward_match(&self, forward: &UpdateRecord) -> Option<&UpdateRecord> {
        let mut at_epoch = self
            .backward_records
            .iter()
            .filter(|rec| epochs_match(rec.epoch, forward.epoch));
        match &forward.measurement {
            Some(msr) => at_epoch.find(|rec| {
                rec.measurement
                    .as_ref()
                    .map_or(false, |bwd| bwd.record_num == msr.record_num)
            }),
            None => {
                let candidates: Vec<&UpdateRecord> = at_epoch.collect();
                candidates
                    .iter()
                    .find(|rec| !rec.is_obs)
                    .or_else(|| candidates.first())
                    .copied()
            }
        }
    }

    fn combine(&self, forward: &UpdateRecord) -> Result<Combination, ODError> {
        let filter = self.filter.as_ref().context(FilterNotSetSnafu)?;
        let gateway = filter.gateway();
        let tol = filter.config.cov_inv_tol;
        let fwd_covar = to_cartesian_covar(gateway, &forward.state, &forward.covar);
        // The backward pre-update estimate excludes the observation at this epoch
        let bwd = self.backward_match(forward).map(|rec| {
            (
                &rec.state_pre,
                to_cartesian_covar(gateway, &rec.state_pre, &rec.covar_bar),
            )
        });
        Ok(self.algorithm.combine(
            (&forward.state, &fwd_covar),
            bwd.as_ref().map(|(state, covar)| (*state, covar)),
            tol,
        ))
    }

    fn push_smoothed(
        &mut self,
        forward: &UpdateRecord,
        comb: Combination,
        measurement: Option<MeasurementRecord>,
    ) -> Result<(), ODError> {
        let filter = self.filter.as_ref().context(FilterNotSetSnafu)?;
        let fwd_covar = to_cartesian_covar(filter.gateway(), &forward.state, &forward.covar);
        let consistency = comb.consistency(&forward.state, &fwd_covar);
        let (vnb_covar, vnb_sigma) =
            cartesian_vnb_covariance(filter.gateway(), forward.epoch, &comb.state, &comb.covar);
        let record = SmoothedRecord {
            is_obs: forward.is_obs,
            epoch: forward.epoch,
            state: comb.state,
            covar: comb.covar,
            combined: comb.combined,
            consistency,
            vnb_covar,
            vnb_sigma,
            measurement,
        };
        if !self.no_output {
            self.report
                .smoother_update(&record)
                .context(ODReportIoSnafu)?;
        }
        self.smoothed.push(record);
        self.index += 1;
        Ok(())
    }

    /// Residuals of the forward observation re-evaluated at the smoothed state.
    fn smoothed_measurement(
        &mut self,
        forward: &MeasurementRecord,
        comb: &Combination,
    ) -> MeasurementRecord {
        let mut record = forward.clone();
        record.computed = None;
        record.postfit = None;
        record.scaled = None;
        record.innovation_covar = None;

        let covar = match self.filter.as_ref() {
            Some(filter) => {
                let cart_to_sf = filter.gateway().cartesian_to_solve_for(&comb.state);
                &cart_to_sf * &comb.covar * cart_to_sf.transpose()
            }
            None => return record,
        };
        let msr = match self.smoothing_msr.as_mut() {
            Some(msr) => msr,
            None => return record,
        };
        if !msr.seek(forward.record_num)
            || !msr.calculate_measurements(forward.epoch, &comb.state)
        {
            debug!(
                "{} could not recompute observation #{} @ {}",
                self.name, forward.record_num, forward.epoch
            );
            return record;
        }
        if let Some(computed) = msr.computed() {
            let m = forward.observed.len();
            let n = comb.state.len();
            if computed.value.len() == m
                && computed.sensitivity.shape() == (m, n)
                && forward.noise_covar.shape() == (m, m)
            {
                let s_k = kalman::innovation_covariance(
                    &computed.sensitivity,
                    &covar,
                    &forward.noise_covar,
                );
                let postfit = &forward.observed - &computed.value;
                record.scaled = Some(kalman::scaled_residuals(&postfit, &s_k));
                record.computed = Some(computed.value.clone());
                record.postfit = Some(postfit);
                record.innovation_covar = Some(s_k);
            }
        }
        record
    }

    fn find_time_step(&mut self) -> Result<EstimatorState, ODError> {
        while let Some(forward) = self.forward_records.get(self.index).cloned() {
            if forward.is_obs {
                return Ok(EstimatorState::Calculating);
            }
            let comb = self.combine(&forward)?;
            self.push_smoothed(&forward, comb, None)?;
        }
        Ok(EstimatorState::CheckingRun)
    }

    fn smooth_step(&mut self) -> Result<EstimatorState, ODError> {
        match self.state {
            EstimatorState::Propagating => self.find_time_step(),
            EstimatorState::Calculating | EstimatorState::Locating => {
                let forward = self.forward_records[self.index].clone();
                self.pending = Some(self.combine(&forward)?);
                Ok(EstimatorState::Estimating)
            }
            EstimatorState::Estimating => {
                let forward = self.forward_records[self.index].clone();
                let comb = match self.pending.take() {
                    Some(comb) => comb,
                    None => self.combine(&forward)?,
                };
                let measurement = forward
                    .measurement
                    .as_ref()
                    .map(|msr| self.smoothed_measurement(msr, &comb));
                self.push_smoothed(&forward, comb, measurement)?;
                Ok(EstimatorState::Propagating)
            }
            EstimatorState::CheckingRun => {
                self.check_completion()?;
                Ok(EstimatorState::Finished)
            }
            EstimatorState::Finished => self.run_complete(),
            state => UnknownStateSnafu {
                name: self.name.clone(),
                state,
            }
            .fail(),
        }
    }

    fn check_completion(&mut self) -> Result<(), ODError> {
        let filter = self.filter.as_ref().context(FilterNotSetSnafu)?;
        let last = self.smoothed.last().context(EmptyForwardPassSnafu)?;
        let counts = edit_counts(
            self.smoothed
                .iter()
                .filter_map(|rec| rec.measurement.as_ref().map(|msr| msr.edit_flag)),
        );
        let combined = self.smoothed.iter().filter(|rec| rec.combined).count();
        let summary = summarize(
            filter.gateway(),
            last.epoch,
            &last.state,
            last.covar.clone(),
            filter.config.cov_inv_tol,
            filter.iterations(),
            self.smoothed.len(),
            counts,
        );
        info!(
            "{} smoothed {} records ({combined} combined with the backward pass)\n{summary}",
            self.name,
            self.smoothed.len()
        );
        self.summary = Some(summary);
        Ok(())
    }

    fn run_complete(&mut self) -> Result<EstimatorState, ODError> {
        if !self.no_output {
            if let Some(summary) = &self.summary {
                self.report
                    .run_complete(summary)
                    .context(ODReportIoSnafu)?;
            }
        }

        if let Some(span) = self.prediction_span()? {
            let last = self.smoothed.last().context(EmptyForwardPassSnafu)?.clone();
            let filter = self.filter.as_mut().context(FilterNotSetSnafu)?;
            let cart_to_sf = filter.gateway().cartesian_to_solve_for(&last.state);
            let covar = &cart_to_sf * &last.covar * cart_to_sf.transpose();
            let state = filter.predict_from(last.epoch, last.state, covar, span)?;
            self.smoother_state = SmootherState::Predicting;
            return Ok(state);
        }

        info!("{} complete", self.name);
        self.complete = true;
        Ok(EstimatorState::Finished)
    }

    /// Span to predict from the last smoothed record: up to the anchor epoch of the forward filter if one was set,
    /// else the configured prediction span.
    fn prediction_span(&self) -> Result<Option<Duration>, ODError> {
        let last = self.smoothed.last().context(EmptyForwardPassSnafu)?;
        match self.forward_anchor {
            Some(anchor) if epochs_match(anchor, last.epoch) => Ok(None),
            Some(anchor) if anchor < last.epoch => {
                warn!(
                    "{} anchor epoch {anchor} is before the last smoothed record @ {}, not predicting",
                    self.name, last.epoch
                );
                Ok(None)
            }
            Some(anchor) => Ok(Some(anchor - last.epoch)),
            None => Ok(self
                .config
                .prediction_span
                .filter(|span| *span > 0.0)
                .map(|span| Unit::Second * span)),
        }
    }

    fn step(&mut self) -> Result<EstimatorState, ODError> {
        if self.state == EstimatorState::Undefined {
            return UnknownStateSnafu {
                name: self.name.clone(),
                state: self.state,
            }
            .fail();
        }
        if self.complete {
            return Ok(EstimatorState::Finished);
        }
        match self.smoother_state {
            SmootherState::Filtering => self.filter_step(),
            SmootherState::Smoothing => self.smooth_step(),
            SmootherState::Predicting => {
                let filter = self.filter.as_mut().context(FilterNotSetSnafu)?;
                let state = filter.advance_state()?;
                if filter.is_complete() {
                    info!("{} prediction complete @ {}", self.name, filter.epoch());
                    self.complete = true;
                }
                Ok(state)
            }
        }
    }
}

impl<P, M, G, S> Estimator for Smoother<P, M, G, S>
where
    P: Propagator + Clone,
    M: MeasurementManager + Clone,
    G: FrameGateway,
    S: SmoothingAlgorithm,
{
    fn initialize(&mut self) -> Result<(), ODError> {
        self.config.validate().context(ODConfigSnafu)?;
        let filter = self.filter.as_mut().context(FilterNotSetSnafu)?;

        if let Some((prop, msr)) = &self.pristine {
            *filter.prop_mut() = prop.clone();
            *filter.msr_mut() = msr.clone();
        } else {
            self.pristine = Some((filter.prop().clone(), filter.msr().clone()));
        }

        // Predictions are made from the smoothed estimate, never by the forward pass
        if filter.config.anchor_epoch.is_some() {
            self.forward_anchor = filter.config.anchor_epoch.take();
        }
        if let Some(span) = filter.config.prediction_span.take() {
            self.config.prediction_span.get_or_insert(span);
        }
        filter.take_action(Action::RunForwards);
        filter.take_action(Action::ComputeFlags);
        filter.initialize()?;

        self.backward = None;
        self.smoothing_msr = None;
        self.forward_records.clear();
        self.backward_records.clear();
        self.smoothed.clear();
        self.index = 0;
        self.pending = None;
        self.summary = None;
        self.pass = Pass::Forward;
        self.smoother_state = SmootherState::Filtering;
        self.state = EstimatorState::Initializing;
        self.complete = false;
        debug!("{} initialized", self.name);
        Ok(())
    }

    fn advance_state(&mut self) -> Result<EstimatorState, ODError> {
        ensure!(
            !self.in_progress,
            ReentrantSnafu {
                name: self.name.clone()
            }
        );
        self.in_progress = true;
        let result = self.step();
        self.in_progress = false;

        let next = result?;
        self.state = next;
        Ok(next)
    }

    fn state(&self) -> EstimatorState {
        self.state
    }

    fn time_step(&self) -> Duration {
        match (self.smoother_state, self.pass) {
            (SmootherState::Smoothing, _) => Duration::ZERO,
            (SmootherState::Filtering, Pass::Backward) => self
                .backward
                .as_ref()
                .map_or(Duration::ZERO, |f| f.time_step()),
            _ => self
                .filter
                .as_ref()
                .map_or(Duration::ZERO, |f| f.time_step()),
        }
    }

    fn take_action(&mut self, action: Action) -> bool {
        match action {
            Action::NoOutput => {
                self.no_output = true;
                true
            }
            _ => false,
        }
    }

    fn propagate(&mut self, step: Duration) -> Result<(), ODError> {
        if self.smoother_state == SmootherState::Smoothing {
            return Ok(());
        }
        self.active_filter()?.propagate(step)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}
