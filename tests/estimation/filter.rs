use crate::{diag_covar, leo_state, position_arc, start_epoch};
use approx::assert_relative_eq;
use pretty_env_logger::try_init;
use rstest::*;
use seqod::linalg::{is_symmetric, trace, DMatrix, DVector};
use seqod::od::prelude::*;

type Kf = SequentialFilter<LinearPropagator, ObservationArc<PositionModel>>;

fn snc() -> ProcessNoise {
    ProcessNoise::SNC {
        accel_var: [1e-12, 1e-12, 1e-12],
        disable_time: None,
        start: None,
        decay: None,
    }
}

#[fixture]
fn truth() -> LinearPropagator {
    let _ = try_init().is_err();
    LinearPropagator::new(start_epoch(), leo_state(6)).unwrap()
}

fn filter(truth: &LinearPropagator, n: usize, config: FilterConfig) -> Kf {
    let mut initial = leo_state(n);
    initial[0] += 0.1;
    initial[4] -= 1e-4;
    let prop = LinearPropagator::new(start_epoch(), initial).unwrap();
    SequentialFilter::new(
        "kf",
        prop,
        position_arc(truth, 5),
        diag_covar(n, 1.0, 1e-6),
        config,
    )
}

#[rstest]
#[case(6)]
#[case(9)]
#[case(15)]
fn covariance_stays_symmetric(truth: LinearPropagator, #[case] n: usize) {
    let config = FilterConfig::builder()
        .process_noise(snc())
        .process_noise_step(30.0)
        .build();
    let mut kf = filter(&truth, n, config);
    kf.initialize().unwrap();
    kf.run().unwrap();

    assert!(kf.records().len() > 5);
    for rec in kf.records() {
        assert_eq!(rec.covar.shape(), (n, n));
        assert!(is_symmetric(&rec.covar), "{rec}");
        assert!(is_symmetric(&rec.covar_bar), "{rec}");
        // Extra parameters are never observed
        if n > 6 {
            assert_relative_eq!(rec.covar[(n - 1, n - 1)], 1e-6, max_relative = 1e-9);
        }
    }
}

#[rstest]
fn epochs_follow_the_direction(truth: LinearPropagator) {
    let mut kf = filter(&truth, 6, FilterConfig::default());
    kf.initialize().unwrap();
    kf.run().unwrap();
    assert!(kf
        .records()
        .windows(2)
        .all(|pair| pair[0].epoch <= pair[1].epoch));
    let forward_obs = kf.records().iter().filter(|rec| rec.is_obs).count();
    assert_eq!(forward_obs, 5);

    assert!(kf.take_action(Action::RunBackwards));
    assert_eq!(kf.state(), EstimatorState::Initializing);
    kf.run().unwrap();
    assert_eq!(kf.direction(), Direction::Backward);
    assert!(kf
        .records()
        .windows(2)
        .all(|pair| pair[0].epoch >= pair[1].epoch));
    assert_eq!(kf.records().iter().filter(|rec| rec.is_obs).count(), 5);

    assert!(kf.take_action(Action::RunForwards));
    kf.run().unwrap();
    assert_eq!(kf.direction(), Direction::Forward);
    assert!(kf
        .records()
        .windows(2)
        .all(|pair| pair[0].epoch <= pair[1].epoch));
    assert_eq!(kf.iterations(), 3);
}

#[rstest]
fn measurement_updates_reduce_uncertainty(truth: LinearPropagator) {
    let mut kf = filter(&truth, 6, FilterConfig::default());
    kf.initialize().unwrap();
    kf.run().unwrap();
    for rec in kf.records().iter().filter(|rec| rec.is_accepted_obs()) {
        assert!(trace(&rec.covar) <= trace(&rec.covar_bar));
    }
    // Exact observations pull the estimate back onto the truth
    let truth_pos = DVector::from_vec(vec![7000.0, 7.5 * 300.0, 0.0]);
    let final_err = kf.estimate().rows(0, 3).into_owned() - truth_pos;
    assert!(final_err.norm() < 1e-2, "{final_err}");
}

#[rstest]
#[case(6.0, EditFlag::Normal)]
#[case(6.001, EditFlag::SigmaEdited)]
fn sigma_edit_boundary(#[case] offset: f64, #[case] flag: EditFlag) {
    let _ = try_init().is_err();
    // P = 3 and R = 1 on each axis give a 3-sigma threshold of exactly 6 km
    let state = leo_state(6);
    let prop = LinearPropagator::new(start_epoch(), state.clone()).unwrap();
    let mut value = state.rows(0, 3).into_owned();
    value[0] += offset;
    let arc = ObservationArc::new(
        PositionModel { sigma_km: 1.0 },
        vec![Observation::new(start_epoch(), value)],
    );
    let mut kf = SequentialFilter::new(
        "edit",
        prop,
        arc,
        diag_covar(6, 3.0, 1e-6),
        FilterConfig::default(),
    );
    kf.initialize().unwrap();
    kf.run().unwrap();

    let obs = kf.records().iter().find(|rec| rec.is_obs).unwrap();
    assert_eq!(obs.edit_flag(), Some(flag));
    let msr = obs.measurement.as_ref().unwrap();
    assert_relative_eq!(msr.scaled.as_ref().unwrap()[0], offset / 2.0, epsilon = 1e-9);
    if flag == EditFlag::SigmaEdited {
        assert_eq!(msr.edited_component, Some(0));
        assert_eq!(obs.covar, obs.covar_bar);
    } else {
        assert!(trace(&obs.covar) < trace(&obs.covar_bar));
    }
}

#[rstest]
fn process_noise_cadence(truth: LinearPropagator) {
    let noise = snc();
    let config = FilterConfig::builder()
        .process_noise(noise.clone())
        .process_noise_step(60.0)
        .build();
    let arc = ArcSimulator::new(PositionModel { sigma_km: 0.01 }, 0.0, 0)
        .generate(&truth, &[start_epoch() + 150.seconds()])
        .unwrap();
    let prop = LinearPropagator::new(start_epoch(), leo_state(6)).unwrap();
    let mut kf = SequentialFilter::new("pn", prop, arc, diag_covar(6, 1.0, 1e-6), config);
    kf.initialize().unwrap();
    kf.run().unwrap();

    let epochs: Vec<Epoch> = kf.records().iter().map(|rec| rec.epoch).collect();
    assert_eq!(
        epochs,
        vec![
            start_epoch(),
            start_epoch() + 60.seconds(),
            start_epoch() + 120.seconds(),
            start_epoch() + 150.seconds()
        ]
    );
    let records = kf.records();
    assert!(!records[1].is_obs && !records[2].is_obs && records[3].is_obs);
    for (rec, elapsed) in records[1..].iter().zip([60.0, 60.0, 30.0]) {
        let q = noise.covariance(elapsed);
        assert_relative_eq!(rec.process_noise[(0, 0)], q[(0, 0)], max_relative = 1e-12);
        assert_relative_eq!(rec.process_noise[(3, 3)], q[(3, 3)], max_relative = 1e-12);
    }
}

#[rstest]
fn delayed_rectification_keeps_the_reference(truth: LinearPropagator) {
    let config = FilterConfig::builder().delay_rectify_span(120.0).build();
    let mut kf = filter(&truth, 6, config);
    kf.initialize().unwrap();

    // Run until the observation at 60 seconds is processed
    while kf.records().iter().filter(|rec| rec.is_obs).count() < 1 {
        let state = kf.advance_state().unwrap();
        if state == EstimatorState::Propagating {
            kf.propagate(kf.time_step()).unwrap();
        }
    }
    assert!(kf.state_offset().norm() > 0.0);
    assert_relative_eq!(kf.prop().state()[0], 7000.1, epsilon = 1e-9);

    kf.run().unwrap();
    assert_eq!(kf.state_offset().norm(), 0.0);
}

#[rstest]
fn predicts_after_the_last_observation(truth: LinearPropagator) {
    let config = FilterConfig::builder()
        .prediction_span(120.0)
        .process_noise(snc())
        .process_noise_step(60.0)
        .build();
    let mut kf = filter(&truth, 6, config);
    kf.initialize().unwrap();
    kf.run().unwrap();

    let last_obs = kf.records().iter().rposition(|rec| rec.is_obs).unwrap();
    let predicted = &kf.records()[last_obs + 1..];
    assert_eq!(predicted.len(), 2);
    assert_eq!(predicted[1].epoch, start_epoch() + 420.seconds());
    assert!(trace(&predicted[1].covar) > trace(&predicted[0].covar));
    assert_eq!(kf.epoch(), start_epoch() + 420.seconds());
}

#[rstest]
fn prediction_only_to_the_anchor(truth: LinearPropagator) {
    let mut kf = filter(&truth, 6, FilterConfig::default());
    kf.set_anchor_epoch(start_epoch() + 90.seconds(), true);
    kf.initialize().unwrap();
    kf.run().unwrap();
    assert!(kf.records().iter().all(|rec| !rec.is_obs));
    assert_eq!(kf.epoch(), start_epoch() + 90.seconds());
}

#[rstest]
fn rejects_a_propagator_without_participants(truth: LinearPropagator) {
    let mut kf = filter(&truth, 6, FilterConfig::default());
    kf.prop_mut().participants = 0;
    kf.initialize().unwrap();
    assert_eq!(
        kf.advance_state(),
        Err(ODError::NoParticipant {
            name: "kf".to_string()
        })
    );
}

#[rstest]
fn rejects_a_mismatched_covariance(truth: LinearPropagator) {
    let prop = LinearPropagator::new(start_epoch(), leo_state(6)).unwrap();
    let mut kf = SequentialFilter::new(
        "shape",
        prop,
        position_arc(&truth, 2),
        DMatrix::identity(5, 5),
        FilterConfig::default(),
    );
    kf.initialize().unwrap();
    assert!(matches!(
        kf.advance_state(),
        Err(ODError::SensitivityMismatch { .. })
    ));
}
