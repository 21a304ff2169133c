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

use super::kalman;
use super::{Action, Estimator, EstimatorState, FilterConfig};
use crate::cosmic::{epochs_match, CartesianGateway, FrameGateway};
use crate::io::report::{NullReport, ReportSink};
use crate::io::warmstart::{read_warm_start, write_warm_start};
use crate::linalg::{
    embed_block, information, symmetrize, DMatrix, DVector, Matrix3, Matrix6, Vector3,
};
use crate::od::estimate::{EditFlag, FilterSummary, MeasurementRecord, UpdateRecord};
use crate::od::msr::{Direction, EventStatus, MeasurementManager, TrimSide};
use crate::od::snc::{vnb_to_inertial, NoiseFrame, ProcessNoiseModel, MIN_NOISE_DT_S};
use crate::od::{
    NoParticipantSnafu, NonFiniteEstimateSnafu, ODConfigSnafu, ODError, ODPropSnafu,
    ODReportIoSnafu, ODWarmStartSnafu, ReentrantSnafu, SensitivityMismatchSnafu,
    UnknownStateSnafu,
};
use crate::propagators::Propagator;
use crate::time::{Duration, Epoch, Unit};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;

/// Position covariance of a solve-for covariance, rotated into the VNB frame, and its standard deviations.
pub(crate) fn vnb_covariance<G: FrameGateway>(
    gateway: &G,
    epoch: Epoch,
    state: &DVector<f64>,
    covar: &DMatrix<f64>,
) -> (Matrix3<f64>, Vector3<f64>) {
    if state.len() < 6 || covar.nrows() < 6 {
        return (Matrix3::zeros(), Vector3::zeros());
    }
    cartesian_vnb_covariance(gateway, epoch, state, &to_cartesian_covar(gateway, state, covar))
}

/// Position block of a Cartesian covariance rotated into the VNB frame, and its standard deviations.
pub(crate) fn cartesian_vnb_covariance<G: FrameGateway>(
    gateway: &G,
    epoch: Epoch,
    state: &DVector<f64>,
    cart: &DMatrix<f64>,
) -> (Matrix3<f64>, Vector3<f64>) {
    if state.len() < 6 || cart.nrows() < 3 {
        return (Matrix3::zeros(), Vector3::zeros());
    }
    let pos: Matrix3<f64> = cart.fixed_view::<3, 3>(0, 0).into_owned();
    let dcm = gateway.vnb_rotation(epoch, state);
    let vnb = dcm * pos * dcm.transpose();
    let sigma = Vector3::from_fn(|i, _| vnb[(i, i)].max(0.0).sqrt());
    (vnb, sigma)
}

/// Maps a solve-for covariance into the Cartesian representation of the provided state.
pub(crate) fn to_cartesian_covar<G: FrameGateway>(
    gateway: &G,
    state: &DVector<f64>,
    covar: &DMatrix<f64>,
) -> DMatrix<f64> {
    let sf_to_cart = gateway.solve_for_to_cartesian(state);
    let mut cart = &sf_to_cart * covar * sf_to_cart.transpose();
    symmetrize(&mut cart);
    cart
}

/// Counts the edit flags of all processed observations.
pub(crate) fn edit_counts<I: IntoIterator<Item = EditFlag>>(flags: I) -> BTreeMap<EditFlag, usize> {
    let mut counts = BTreeMap::new();
    for flag in flags {
        *counts.entry(flag).or_insert(0) += 1;
    }
    counts
}

/// Builds the report-ready products of a run from the final Cartesian state and covariance.
#[allow(clippy::too_many_arguments)]
pub(crate) fn summarize<G: FrameGateway>(
    gateway: &G,
    epoch: Epoch,
    state: &DVector<f64>,
    covar: DMatrix<f64>,
    cov_inv_tol: f64,
    iterations: usize,
    num_records: usize,
    edit_counts: BTreeMap<EditFlag, usize>,
) -> FilterSummary {
    let information = information(&covar, cov_inv_tol);
    if information.is_none() {
        warn!("final covariance @ {epoch} is singular to {cov_inv_tol:e}, no information matrix");
    }
    let kep = gateway.orbit_dual(state).and_then(|orbit| orbit.keplerian());
    let keplerian_covar = kep.as_ref().and_then(|(_, jac)| {
        if covar.nrows() < 6 || covar.ncols() < 6 {
            return None;
        }
        let cart: Matrix6<f64> = covar.fixed_view::<6, 6>(0, 0).into_owned();
        let mut kep_covar = jac * cart * jac.transpose();
        kep_covar = 0.5 * (kep_covar + kep_covar.transpose());
        // Degenerate element partials (e.g. the eccentricity of a circular orbit) are not finite
        kep_covar.iter().all(|v| v.is_finite()).then_some(kep_covar)
    });
    FilterSummary {
        epoch,
        state: state.clone(),
        keplerian: kep.map(|(elements, _)| elements),
        keplerian_covar,
        covar,
        information,
        iterations,
        num_records,
        edit_counts,
    }
}

/// A sequential (Kalman) filter driven as a discrete event state machine.
///
/// The filter owns the propagator and the measurement manager. An external driver repeatedly calls
/// [`Estimator::advance_state`] and, whenever the returned state is `Propagating`, propagates by
/// [`Estimator::time_step`] with [`Estimator::propagate`]. Every time update and measurement update is kept as an
/// [`UpdateRecord`], which the smoother consumes.
pub struct SequentialFilter<P, M, G = CartesianGateway>
where
    P: Propagator,
    M: MeasurementManager,
    G: FrameGateway,
{
    pub name: String,
    pub config: FilterConfig,
    prop: P,
    msr: M,
    gateway: G,
    report: Box<dyn ReportSink>,
    state: EstimatorState,
    direction: Direction,
    initial_covar: DMatrix<f64>,
    /// Solve-for covariance
    covar: DMatrix<f64>,
    /// Correction not yet rectified into the reference trajectory
    state_offset: DVector<f64>,
    start_epoch: Epoch,
    last_update_epoch: Epoch,
    next_msr_epoch: Option<Epoch>,
    next_noise_epoch: Option<Epoch>,
    /// Epochs at which a time update record is written even without an observation
    stop_epochs: Vec<Epoch>,
    time_step: Duration,
    /// dX/dS at the last STM reset
    prev_sf_to_cart: DMatrix<f64>,
    last_stm: DMatrix<f64>,
    last_noise: DMatrix<f64>,
    computed_ok: bool,
    records: Vec<UpdateRecord>,
    use_provided_flags: bool,
    no_output: bool,
    predicting: bool,
    prediction_only: bool,
    prediction_target: Option<Epoch>,
    in_progress: bool,
    complete: bool,
    iterations: usize,
    msr_count: usize,
    summary: Option<FilterSummary>,
}

impl<P: Propagator, M: MeasurementManager> SequentialFilter<P, M, CartesianGateway> {
    /// Builds a filter estimating the Cartesian state of the propagator, with the provided initial covariance.
    pub fn new(
        name: &str,
        prop: P,
        msr: M,
        initial_covar: DMatrix<f64>,
        config: FilterConfig,
    ) -> Self {
        Self::with_gateway(
            name,
            prop,
            msr,
            CartesianGateway::default(),
            initial_covar,
            config,
        )
    }
}

impl<P, M, G> SequentialFilter<P, M, G>
where
    P: Propagator,
    M: MeasurementManager,
    G: FrameGateway,
{
    pub fn with_gateway(
        name: &str,
        prop: P,
        msr: M,
        gateway: G,
        initial_covar: DMatrix<f64>,
        config: FilterConfig,
    ) -> Self {
        let n = prop.state().len();
        let epoch = prop.epoch();
        let direction = msr.direction();
        Self {
            name: name.to_string(),
            config,
            prop,
            msr,
            gateway,
            report: Box::new(NullReport),
            state: EstimatorState::Undefined,
            direction,
            covar: initial_covar.clone(),
            initial_covar,
            state_offset: DVector::zeros(n),
            start_epoch: epoch,
            last_update_epoch: epoch,
            next_msr_epoch: None,
            next_noise_epoch: None,
            stop_epochs: Vec::new(),
            time_step: Duration::ZERO,
            prev_sf_to_cart: DMatrix::identity(n, n),
            last_stm: DMatrix::identity(n, n),
            last_noise: DMatrix::zeros(n, n),
            computed_ok: false,
            records: Vec::new(),
            use_provided_flags: false,
            no_output: false,
            predicting: false,
            prediction_only: false,
            prediction_target: None,
            in_progress: false,
            complete: false,
            iterations: 0,
            msr_count: 0,
            summary: None,
        }
    }

    pub fn with_report(mut self, report: Box<dyn ReportSink>) -> Self {
        self.report = report;
        self
    }

    pub fn set_report(&mut self, report: Box<dyn ReportSink>) {
        self.report = report;
    }

    /// Predicts until this epoch once the observations are processed, or only predicts if `prediction_only` is set.
    pub fn set_anchor_epoch(&mut self, epoch: Epoch, prediction_only: bool) {
        self.config.anchor_epoch = Some(epoch);
        self.prediction_only = prediction_only;
    }

    /// Stops the propagation at each of these epochs to write a time update record, in addition to the observation
    /// epochs and the process noise boundaries.
    pub fn set_stop_epochs(&mut self, epochs: impl IntoIterator<Item = Epoch>) {
        self.stop_epochs = epochs.into_iter().collect();
        self.stop_epochs.sort();
        self.stop_epochs.dedup_by(|a, b| epochs_match(*a, *b));
        debug!("{} will stop at {} epochs", self.name, self.stop_epochs.len());
    }

    /// Replaces the covariance used at the next initialization.
    pub fn set_initial_covariance(&mut self, covar: DMatrix<f64>) {
        self.initial_covar = covar;
    }

    pub fn prop(&self) -> &P {
        &self.prop
    }

    pub fn prop_mut(&mut self) -> &mut P {
        &mut self.prop
    }

    pub fn msr(&self) -> &M {
        &self.msr
    }

    pub fn msr_mut(&mut self) -> &mut M {
        &mut self.msr
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn epoch(&self) -> Epoch {
        self.prop.epoch()
    }

    /// Current best estimate: the reference state corrected by any pending offset.
    pub fn estimate(&self) -> DVector<f64> {
        self.prop.state() + self.gateway.solve_for_to_cartesian(self.prop.state()) * &self.state_offset
    }

    /// Current solve-for covariance.
    pub fn covar(&self) -> &DMatrix<f64> {
        &self.covar
    }

    /// Correction kept apart from the reference trajectory while rectification is delayed.
    pub fn state_offset(&self) -> &DVector<f64> {
        &self.state_offset
    }

    /// All records of the current run, in processing order.
    pub fn records(&self) -> &[UpdateRecord] {
        &self.records
    }

    pub fn summary(&self) -> Option<&FilterSummary> {
        self.summary.as_ref()
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn is_predicting(&self) -> bool {
        self.predicting
    }

    pub fn uses_provided_flags(&self) -> bool {
        self.use_provided_flags
    }

    /// Next epoch at which process noise is added independently of the measurements.
    pub fn next_noise_epoch(&self) -> Option<Epoch> {
        self.next_noise_epoch
    }

    /// Starts predicting for the provided span from the current epoch, without processing any observation.
    pub fn begin_predicting(&mut self, span: Duration) -> Result<EstimatorState, ODError> {
        let target = self.prop.epoch() + self.signed(span.abs());
        let state = self.start_prediction(target)?;
        self.state = state;
        Ok(state)
    }

    /// Resets the estimate to the provided state and covariance, then predicts for the provided span.
    pub fn predict_from(
        &mut self,
        epoch: Epoch,
        state: DVector<f64>,
        covar: DMatrix<f64>,
        span: Duration,
    ) -> Result<EstimatorState, ODError> {
        let n = state.len();
        ensure!(
            covar.shape() == (n, n),
            SensitivityMismatchSnafu {
                what: "prediction covariance",
                need_rows: n,
                need_cols: n,
                got_rows: covar.nrows(),
                got_cols: covar.ncols(),
            }
        );
        self.prop.set_state(epoch, state);
        self.covar = covar;
        self.state_offset = DVector::zeros(n);
        self.reset_reference(epoch);
        self.begin_predicting(span)
    }

    fn signed(&self, step: Duration) -> Duration {
        match self.direction {
            Direction::Forward => step,
            Direction::Backward => -step,
        }
    }

    /// Whether `epoch` is at or past `target` in the direction of travel.
    fn reached(&self, epoch: Epoch, target: Epoch) -> bool {
        epochs_match(epoch, target) || self.direction.sign() * (epoch - target).to_seconds() > 0.0
    }

    /// Closest stop epoch strictly ahead of `epoch` in the direction of travel.
    fn next_stop_epoch(&self, epoch: Epoch) -> Option<Epoch> {
        let ahead = |stop: &&Epoch| !self.reached(epoch, **stop);
        match self.direction {
            Direction::Forward => self.stop_epochs.iter().find(ahead).copied(),
            Direction::Backward => self.stop_epochs.iter().rev().find(ahead).copied(),
        }
    }

    /// Shortens the step so that the propagation halts on the next noise boundary or stop epoch.
    fn clamp_step(&self, epoch: Epoch, mut step: Duration) -> Duration {
        for halt in [self.next_noise_epoch, self.next_stop_epoch(epoch)]
            .into_iter()
            .flatten()
        {
            let to_halt = halt - epoch;
            if to_halt.abs() < step.abs() {
                step = to_halt;
            }
        }
        step
    }

    fn reset_reference(&mut self, epoch: Epoch) {
        self.prop.reset_stm();
        self.prev_sf_to_cart = self.gateway.solve_for_to_cartesian(self.prop.state());
        self.last_update_epoch = epoch;
    }

    fn rectify_if_due(&mut self, epoch: Epoch) {
        if self.state_offset.iter().all(|v| *v == 0.0) {
            return;
        }
        if (epoch - self.start_epoch).abs() >= self.config.delay_rectify_duration() {
            let rectified = self.estimate();
            self.prop.set_state(epoch, rectified);
            self.state_offset.fill(0.0);
            self.prev_sf_to_cart = self.gateway.solve_for_to_cartesian(self.prop.state());
            trace!("{} rectified reference @ {epoch}", self.name);
        }
    }

    fn push_record(&mut self, record: UpdateRecord) -> Result<(), ODError> {
        if !self.no_output {
            self.report
                .filter_update(&record)
                .context(ODReportIoSnafu)?;
        }
        self.records.push(record);
        Ok(())
    }

    fn push_time_record(&mut self, epoch: Epoch) -> Result<(), ODError> {
        let state = self.estimate();
        let (vnb_covar, vnb_sigma) = vnb_covariance(&self.gateway, epoch, &state, &self.covar);
        self.push_record(UpdateRecord {
            is_obs: false,
            epoch,
            state_pre: state.clone(),
            state,
            covar_bar: self.covar.clone(),
            covar: self.covar.clone(),
            stm: self.last_stm.clone(),
            process_noise: self.last_noise.clone(),
            vnb_covar,
            vnb_sigma,
            measurement: None,
        })
    }

    /// Maps the covariance and the pending offset to the current epoch and adds the process noise accumulated since
    /// the previous update.
    fn time_update(&mut self, record: bool) -> Result<(), ODError> {
        let epoch = self.prop.epoch();
        let reference = self.prop.state().clone();
        let n = self.covar.nrows();

        let cart_to_sf = self.gateway.cartesian_to_solve_for(&reference);
        let stm = &cart_to_sf * self.prop.stm() * &self.prev_sf_to_cart;
        ensure!(
            stm.shape() == (n, n),
            SensitivityMismatchSnafu {
                what: "state transition matrix",
                need_rows: n,
                need_cols: n,
                got_rows: stm.nrows(),
                got_cols: stm.ncols(),
            }
        );

        let elapsed = (epoch - self.last_update_epoch).abs();
        let mut noise = DMatrix::zeros(n, n);
        if elapsed.to_seconds() >= MIN_NOISE_DT_S && !self.config.process_noise.is_none() {
            let mut q = self.config.process_noise.process_noise(elapsed, epoch);
            if self.config.noise_frame == NoiseFrame::VNB {
                q = vnb_to_inertial(&q, &self.gateway.vnb_rotation(epoch, &self.estimate()));
            }
            embed_block(&mut noise, &q, 0);
            noise = &cart_to_sf * noise * cart_to_sf.transpose();
        }

        let (covar_bar, offset) =
            kalman::time_update(&self.covar, &self.state_offset, &stm, &noise);
        ensure!(
            covar_bar.iter().chain(offset.iter()).all(|v| v.is_finite()),
            NonFiniteEstimateSnafu {
                epoch,
                action: "time update",
            }
        );
        self.covar = covar_bar;
        self.state_offset = offset;
        self.last_stm = stm;
        self.last_noise = noise;

        self.rectify_if_due(epoch);
        self.reset_reference(epoch);

        if let Some(noise_epoch) = self.next_noise_epoch {
            if self.reached(epoch, noise_epoch) {
                self.next_noise_epoch = self
                    .config
                    .process_noise_step_duration()
                    .map(|step| epoch + self.signed(step));
            }
        }

        if record {
            debug!("{} time update @ {epoch}", self.name);
            self.push_time_record(epoch)?;
        }
        Ok(())
    }

    fn complete_initialization(&mut self) -> Result<EstimatorState, ODError> {
        ensure!(
            self.prop.participant_count() > 0,
            NoParticipantSnafu {
                name: self.name.clone()
            }
        );
        self.config.validate().context(ODConfigSnafu)?;

        let n = self.prop.state().len();
        ensure!(
            self.initial_covar.shape() == (n, n),
            SensitivityMismatchSnafu {
                what: "initial covariance",
                need_rows: n,
                need_cols: n,
                got_rows: self.initial_covar.nrows(),
                got_cols: self.initial_covar.ncols(),
            }
        );

        self.msr.set_direction(self.direction);
        self.msr.prepare_for_processing();

        self.covar = self.initial_covar.clone();
        symmetrize(&mut self.covar);
        self.state_offset = DVector::zeros(n);
        self.warm_start()?;

        let epoch = self.prop.epoch();
        match self.direction {
            Direction::Forward => self.msr.trim(epoch, TrimSide::Before, true),
            Direction::Backward => self.msr.trim(epoch, TrimSide::After, true),
        }
        self.msr.prepare_for_processing();

        self.start_epoch = epoch;
        self.records.clear();
        self.summary = None;
        self.predicting = false;
        self.prediction_target = None;
        self.msr_count = 0;
        self.last_stm = DMatrix::identity(n, n);
        self.last_noise = DMatrix::zeros(n, n);
        self.reset_reference(epoch);

        self.next_msr_epoch = self.msr.observation_epoch();
        self.next_noise_epoch = self
            .config
            .process_noise_step_duration()
            .map(|step| epoch + self.signed(step));

        info!(
            "{} initialized @ {epoch} running {:?}, first observation @ {}",
            self.name,
            self.direction,
            self.next_msr_epoch
                .map_or("none".to_string(), |e| format!("{e}"))
        );

        self.push_time_record(epoch)?;

        if self.prediction_only {
            match self.prediction_goal() {
                Some(target) => return self.start_prediction(target),
                None => warn!("{} is prediction only but has no prediction target", self.name),
            }
        }

        self.find_time_step()
    }

    fn warm_start(&mut self) -> Result<(), ODError> {
        let path = match &self.config.input_warm_start_file {
            Some(path) => path.clone(),
            None => return Ok(()),
        };
        let selector = self
            .config
            .warm_start_epoch
            .selector(
                self.config.warm_start_epoch_format,
                self.msr.observation_epoch(),
            )
            .context(ODConfigSnafu)?;
        let rec = read_warm_start(&path, selector).context(ODWarmStartSnafu)?;

        let names = self.prop.state_names();
        let positions: Vec<Option<usize>> = rec
            .names
            .iter()
            .map(|name| names.iter().position(|known| known == name))
            .collect();

        let mut state = self.prop.state().clone();
        for (i, pos) in positions.iter().enumerate() {
            if let Some(j) = pos {
                state[*j] = rec.state[i];
            }
        }

        // Absent components keep their configured covariance
        let mut cart_covar = to_cartesian_covar(&self.gateway, &state, &self.covar);
        for (i, pos_i) in positions.iter().enumerate() {
            for (k, pos_k) in positions.iter().enumerate() {
                if let (Some(j), Some(l)) = (pos_i, pos_k) {
                    cart_covar[(*j, *l)] = rec.covar[(i, k)];
                }
            }
        }
        let cart_to_sf = self.gateway.cartesian_to_solve_for(&state);
        self.covar = &cart_to_sf * cart_covar * cart_to_sf.transpose();
        symmetrize(&mut self.covar);

        info!(
            "{} warm started from {path} @ {}: restored {} of {} components",
            self.name,
            rec.epoch,
            positions.iter().filter(|pos| pos.is_some()).count(),
            names.len()
        );
        self.prop.set_state(rec.epoch, state);
        Ok(())
    }

    fn find_time_step(&mut self) -> Result<EstimatorState, ODError> {
        let epoch = self.prop.epoch();

        if self.predicting {
            if !epochs_match(epoch, self.last_update_epoch) {
                self.time_update(true)?;
            }
            let target = self.prediction_target.unwrap_or(epoch);
            if self.reached(epoch, target) {
                self.time_step = Duration::ZERO;
                return Ok(EstimatorState::CheckingRun);
            }
            let mut step = target - epoch;
            if let Some(max_step) = self.config.process_noise_step_duration() {
                if step.abs() > max_step {
                    step = self.signed(max_step);
                }
            }
            self.time_step = step;
            return Ok(EstimatorState::Propagating);
        }

        match self.next_msr_epoch {
            Some(next) if epochs_match(epoch, next) => {
                self.time_update(false)?;
                self.time_step = Duration::ZERO;
                Ok(EstimatorState::Calculating)
            }
            Some(next) => {
                if !epochs_match(epoch, self.last_update_epoch) {
                    // Arrived on a process noise boundary
                    self.time_update(true)?;
                }
                if self.reached(epoch, next) {
                    warn!(
                        "{} is past observation @ {next} (now {epoch}), skipping it",
                        self.name
                    );
                    self.msr.advance_observation();
                    self.next_msr_epoch = self.msr.observation_epoch();
                    return self.find_time_step();
                }
                self.time_step = self.clamp_step(epoch, next - epoch);
                Ok(EstimatorState::Propagating)
            }
            None => {
                if !epochs_match(epoch, self.last_update_epoch) {
                    self.time_update(true)?;
                }
                if let Some(stop) = self.next_stop_epoch(epoch) {
                    // No observation left, but records are still expected further along
                    self.time_step = self.clamp_step(epoch, stop - epoch);
                    return Ok(EstimatorState::Propagating);
                }
                self.time_step = Duration::ZERO;
                Ok(EstimatorState::CheckingRun)
            }
        }
    }

    fn calculate(&mut self) -> EstimatorState {
        let epoch = self.prop.epoch();
        let reference = self.prop.state().clone();
        self.computed_ok = self.msr.calculate_measurements(epoch, &reference);
        if self.computed_ok && self.msr.event_count() > 0 {
            EstimatorState::Locating
        } else {
            EstimatorState::Estimating
        }
    }

    fn locate(&mut self) -> EstimatorState {
        let epoch = self.prop.epoch();
        let reference = self.prop.state().clone();
        let count = self.msr.event_count();
        let mut located = 0;
        for idx in 0..count {
            if self.msr.check_event(idx, epoch, &reference) == EventStatus::Located {
                located += 1;
            }
        }
        if located < count {
            trace!("{} located {located} of {count} events @ {epoch}", self.name);
            return EstimatorState::Locating;
        }
        for idx in 0..count {
            if !self.msr.process_event(idx) {
                warn!("{} event #{idx} was not consumed @ {epoch}", self.name);
            }
        }
        EstimatorState::Estimating
    }

    /// Observation noise if provided, else the model noise, else the default sigma.
    fn measurement_noise(
        &self,
        obs_noise: Option<&DMatrix<f64>>,
        model_noise: Option<&DMatrix<f64>>,
        size: usize,
    ) -> DMatrix<f64> {
        match (obs_noise, model_noise) {
            (Some(noise), _) => noise.clone(),
            (None, Some(noise)) if noise.iter().any(|v| *v != 0.0) => noise.clone(),
            _ => DMatrix::from_diagonal_element(size, size, self.config.default_msr_sigma.powi(2)),
        }
    }

    fn estimate_update(&mut self) -> Result<EstimatorState, ODError> {
        let epoch = self.prop.epoch();
        let (idx, obs) = match self
            .msr
            .current_index()
            .and_then(|idx| self.msr.observations().get(idx).map(|obs| (idx, obs.clone())))
        {
            Some(current) => current,
            None => {
                warn!("{} has no observation to process @ {epoch}", self.name);
                self.next_msr_epoch = None;
                return self.find_time_step();
            }
        };

        let m = obs.value.len();
        let reference = self.prop.state().clone();
        let state_pre = self.estimate();
        let covar_bar = self.covar.clone();
        let computed = if self.computed_ok {
            self.msr.computed().cloned()
        } else {
            None
        };

        let noise_covar = self.measurement_noise(
            obs.noise_covar.as_ref(),
            computed.as_ref().map(|c| &c.noise_covar),
            m,
        );
        ensure!(
            noise_covar.shape() == (m, m),
            SensitivityMismatchSnafu {
                what: "measurement noise",
                need_rows: m,
                need_cols: m,
                got_rows: noise_covar.nrows(),
                got_cols: noise_covar.ncols(),
            }
        );

        let mut msr_record = MeasurementRecord::not_computed(
            idx,
            obs.epoch,
            obs.value.clone(),
            noise_covar.clone(),
            EditFlag::NoComputedValue,
        );

        match computed {
            Some(computed) => {
                ensure!(
                    computed.value.len() == m,
                    SensitivityMismatchSnafu {
                        what: "computed measurement",
                        need_rows: m,
                        need_cols: 1_usize,
                        got_rows: computed.value.len(),
                        got_cols: 1_usize,
                    }
                );
                ensure!(
                    computed.sensitivity.shape() == (m, reference.len()),
                    SensitivityMismatchSnafu {
                        what: "measurement sensitivity",
                        need_rows: m,
                        need_cols: reference.len(),
                        got_rows: computed.sensitivity.nrows(),
                        got_cols: computed.sensitivity.ncols(),
                    }
                );

                let h_tilde =
                    &computed.sensitivity * self.gateway.solve_for_to_cartesian(&reference);
                let prefit = &obs.value - &computed.value;
                let innovation = &prefit - &h_tilde * &self.state_offset;
                let s_k = kalman::innovation_covariance(&h_tilde, &covar_bar, &noise_covar);
                let scaled = kalman::scaled_residuals(&innovation, &s_k);

                let flag = if !computed.feasibility.is_normal() {
                    computed.feasibility
                } else if self.use_provided_flags {
                    obs.edit_flag
                } else if obs.edit_flag == EditFlag::UserEdited {
                    EditFlag::UserEdited
                } else {
                    match kalman::sigma_edit(&innovation, &s_k, self.config.sigma_multiplier) {
                        Some(component) => {
                            msr_record.edited_component = Some(component);
                            EditFlag::SigmaEdited
                        }
                        None => EditFlag::Normal,
                    }
                };

                msr_record.computed = Some(computed.value);
                msr_record.prefit = Some(innovation);
                msr_record.scaled = Some(scaled);
                msr_record.innovation_covar = Some(s_k);
                msr_record.edit_flag = flag;

                if flag.is_normal() {
                    let update = kalman::measurement_update(
                        &covar_bar,
                        &self.state_offset,
                        &h_tilde,
                        &noise_covar,
                        &prefit,
                        self.config.covariance_update,
                        self.config.cov_inv_tol,
                    )?;
                    ensure!(
                        update
                            .covar
                            .iter()
                            .chain(update.state_deviation.iter())
                            .all(|v| v.is_finite()),
                        NonFiniteEstimateSnafu {
                            epoch,
                            action: "measurement update",
                        }
                    );
                    self.covar = update.covar;
                    self.state_offset = update.state_deviation;
                    msr_record.postfit = Some(update.postfit);
                    self.rectify_if_due(epoch);
                    debug!("{} msr update #{idx} @ {epoch}", self.name);
                } else {
                    debug!(
                        "{} rejected observation #{idx} @ {epoch} ({flag}), max scaled residual {:.3}",
                        self.name,
                        msr_record.max_scaled().unwrap_or(0.0)
                    );
                }
            }
            None => {
                warn!(
                    "{} observation #{idx} @ {epoch} has no computed value, ignoring it",
                    self.name
                );
            }
        }

        let state = self.estimate();
        let (vnb_covar, vnb_sigma) = vnb_covariance(&self.gateway, epoch, &state, &self.covar);
        self.push_record(UpdateRecord {
            is_obs: true,
            epoch,
            state_pre,
            state,
            covar_bar,
            covar: self.covar.clone(),
            stm: self.last_stm.clone(),
            process_noise: self.last_noise.clone(),
            vnb_covar,
            vnb_sigma,
            measurement: Some(msr_record),
        })?;
        self.msr_count += 1;

        self.msr.advance_observation();
        self.next_msr_epoch = self.msr.observation_epoch();
        self.find_time_step()
    }

    fn check_completion(&mut self) -> EstimatorState {
        self.iterations += 1;
        let epoch = self.prop.epoch();
        let state = self.estimate();
        let counts = edit_counts(self.records.iter().filter_map(|rec| rec.edit_flag()));
        let summary = summarize(
            &self.gateway,
            epoch,
            &state,
            to_cartesian_covar(&self.gateway, &state, &self.covar),
            self.config.cov_inv_tol,
            self.iterations,
            self.records.len(),
            counts,
        );
        if self.predicting {
            debug!("{} prediction reached {epoch}", self.name);
        } else {
            info!(
                "{} processed {} observations ({} records)\n{summary}",
                self.name,
                self.msr_count,
                self.records.len()
            );
        }
        self.summary = Some(summary);
        EstimatorState::Finished
    }

    fn prediction_goal(&self) -> Option<Epoch> {
        let epoch = self.prop.epoch();
        if let Some(anchor) = self.config.anchor_epoch {
            if self.reached(epoch, anchor) && !epochs_match(epoch, anchor) {
                warn!("{} anchor epoch {anchor} is behind {epoch}, not predicting", self.name);
                return None;
            }
            return Some(anchor);
        }
        self.config
            .prediction_span
            .filter(|span| *span > 0.0)
            .map(|span| epoch + self.signed(Unit::Second * span))
    }

    fn start_prediction(&mut self, target: Epoch) -> Result<EstimatorState, ODError> {
        info!(
            "{} predicting from {} until {target}",
            self.name,
            self.prop.epoch()
        );
        self.predicting = true;
        self.prediction_target = Some(target);
        self.next_msr_epoch = None;
        self.next_noise_epoch = None;
        self.complete = false;
        self.find_time_step()
    }

    fn write_output_warm_start(&self, path: &str) -> Result<(), ODError> {
        let names = self.prop.state_names();
        let rows: Vec<(Epoch, &DVector<f64>, DMatrix<f64>)> = self
            .records
            .iter()
            .map(|rec| {
                (
                    rec.epoch,
                    &rec.state,
                    to_cartesian_covar(&self.gateway, &rec.state, &rec.covar),
                )
            })
            .collect();
        write_warm_start(
            path,
            &names,
            self.config.warm_start_epoch_format,
            rows.iter().map(|(epoch, state, covar)| (*epoch, *state, covar)),
        )
        .context(ODWarmStartSnafu)
    }

    fn run_complete(&mut self) -> Result<EstimatorState, ODError> {
        if !self.predicting && !self.no_output {
            if let Some(summary) = &self.summary {
                self.report
                    .run_complete(summary)
                    .context(ODReportIoSnafu)?;
            }
            if let Some(path) = self.config.output_warm_start_file.clone() {
                self.write_output_warm_start(&path)?;
            }
        }
        self.msr.processing_complete();

        if !self.predicting {
            if let Some(target) = self.prediction_goal() {
                return self.start_prediction(target);
            }
        }

        info!("{} run complete @ {}", self.name, self.prop.epoch());
        self.complete = true;
        Ok(EstimatorState::Finished)
    }

    fn step(&mut self) -> Result<EstimatorState, ODError> {
        match self.state {
            EstimatorState::Undefined => UnknownStateSnafu {
                name: self.name.clone(),
                state: self.state,
            }
            .fail(),
            EstimatorState::Initializing => self.complete_initialization(),
            EstimatorState::Propagating => self.find_time_step(),
            EstimatorState::Calculating => Ok(self.calculate()),
            EstimatorState::Locating => Ok(self.locate()),
            EstimatorState::Estimating => self.estimate_update(),
            EstimatorState::CheckingRun => Ok(self.check_completion()),
            EstimatorState::Finished => {
                if self.complete {
                    Ok(EstimatorState::Finished)
                } else {
                    self.run_complete()
                }
            }
        }
    }
}

impl<P, M, G> Estimator for SequentialFilter<P, M, G>
where
    P: Propagator,
    M: MeasurementManager,
    G: FrameGateway,
{
    fn initialize(&mut self) -> Result<(), ODError> {
        self.config.validate().context(ODConfigSnafu)?;
        self.state = EstimatorState::Initializing;
        self.complete = false;
        self.predicting = false;
        debug!("{} configured: {}", self.name, self.config);
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
        if next != self.state {
            trace!("{}: {} -> {next}", self.name, self.state);
        }
        self.state = next;
        Ok(next)
    }

    fn state(&self) -> EstimatorState {
        self.state
    }

    fn time_step(&self) -> Duration {
        self.time_step
    }

    fn take_action(&mut self, action: Action) -> bool {
        match action {
            Action::RunBackwards | Action::RunForwards => {
                self.direction = if action == Action::RunBackwards {
                    Direction::Backward
                } else {
                    Direction::Forward
                };
                self.msr.set_direction(self.direction);
                self.state = EstimatorState::Initializing;
                self.complete = false;
                self.predicting = false;
                info!("{} will run {:?}", self.name, self.direction);
            }
            Action::UseProvidedFlags => self.use_provided_flags = true,
            Action::ComputeFlags => self.use_provided_flags = false,
            Action::NoOutput => self.no_output = true,
        }
        true
    }

    fn propagate(&mut self, step: Duration) -> Result<(), ODError> {
        self.prop.advance(step).context(ODPropSnafu)
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}
