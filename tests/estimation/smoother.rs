use crate::{diag_covar, leo_state, output_path, position_arc, start_epoch};
use approx::assert_relative_eq;
use pretty_env_logger::try_init;
use rstest::*;
use seqod::linalg::trace;
use seqod::od::prelude::*;

type Engine = Smoother<LinearPropagator, ObservationArc<PositionModel>>;

#[fixture]
fn truth() -> LinearPropagator {
    let _ = try_init().is_err();
    LinearPropagator::new(start_epoch(), leo_state(6)).unwrap()
}

fn filter(
    truth: &LinearPropagator,
    config: FilterConfig,
) -> SequentialFilter<LinearPropagator, ObservationArc<PositionModel>> {
    let mut initial = leo_state(6);
    initial[0] -= 0.3;
    initial[3] += 2e-4;
    SequentialFilter::new(
        "fwd",
        LinearPropagator::new(start_epoch(), initial).unwrap(),
        position_arc(truth, 8),
        diag_covar(6, 1.0, 1e-6),
        config,
    )
}

#[rstest]
fn smoothing_never_loses_information(truth: LinearPropagator) {
    let config = FilterConfig::builder()
        .process_noise(ProcessNoise::SNC {
            accel_var: [1e-12; 3],
            disable_time: None,
            start: None,
            decay: None,
        })
        .process_noise_step(60.0)
        .build();
    let mut smoother = Engine::new("rts", SmootherConfig::default()).with_filter(filter(&truth, config));
    smoother.initialize().unwrap();
    smoother.run().unwrap();

    let forward = smoother.forward_records();
    let smoothed = smoother.smoothed_records();
    assert_eq!(forward.len(), smoothed.len());

    // The first forward record has nothing from the backward pass to combine with
    assert!(!smoothed[0].combined);
    assert_eq!(smoothed[0].state, forward[0].state);
    assert_eq!(smoothed[0].covar, forward[0].covar);
    assert_eq!(smoothed[0].consistency.norm(), 0.0);

    for (f, s) in forward.iter().zip(smoothed).skip(1) {
        assert_eq!(f.epoch, s.epoch);
        assert!(s.combined, "{s}");
        assert!(trace(&s.covar) <= trace(&f.covar) * (1.0 + 1e-9), "{s}");
        assert!(s.consistency.iter().all(|r| r.is_finite()));
    }

    // The smoothed estimate at the first observation benefits from all later ones
    let first_obs = forward.iter().position(|rec| rec.is_obs).unwrap();
    assert!(trace(&smoothed[first_obs].covar) < 0.5 * trace(&forward[first_obs].covar));
    assert_relative_eq!(smoothed[first_obs].state[0], 7000.0, epsilon = 1e-3);
}

#[rstest]
fn smooths_time_updates_between_observations(truth: LinearPropagator) {
    // Process noise boundaries every minute, observations every ninety seconds
    let epochs: Vec<Epoch> = [90.0, 180.0, 270.0]
        .iter()
        .map(|t| start_epoch() + Unit::Second * *t)
        .collect();
    let arc = ArcSimulator::new(PositionModel { sigma_km: 0.01 }, 0.0, 0)
        .generate(&truth, &epochs)
        .unwrap();
    let config = FilterConfig::builder()
        .process_noise(ProcessNoise::SNC {
            accel_var: [1e-12; 3],
            disable_time: None,
            start: None,
            decay: None,
        })
        .process_noise_step(60.0)
        .build();
    let mut fwd = filter(&truth, config);
    *fwd.msr_mut() = arc;
    let mut smoother = Engine::new("cadence", SmootherConfig::default()).with_filter(fwd);
    smoother.initialize().unwrap();
    smoother.run().unwrap();

    let offsets = |records: &[UpdateRecord], is_obs: bool| -> Vec<f64> {
        records
            .iter()
            .filter(|rec| rec.is_obs == is_obs)
            .map(|rec| (rec.epoch - start_epoch()).to_seconds())
            .collect()
    };
    let forward = smoother.forward_records();
    assert_eq!(offsets(forward, true), vec![90.0, 180.0, 270.0]);
    assert_eq!(offsets(forward, false), vec![0.0, 60.0, 120.0, 240.0]);

    // The backward pass halts on every forward time update
    let backward_updates = offsets(smoother.backward_records(), false);
    for t in [240.0, 120.0, 60.0] {
        assert!(backward_updates.contains(&t), "{t} missing from {backward_updates:?}");
    }

    let smoothed = smoother.smoothed_records();
    assert_eq!(forward.len(), smoothed.len());
    assert!(!smoothed[0].combined);
    for (f, s) in forward.iter().zip(smoothed).skip(1) {
        assert_eq!(f.epoch, s.epoch);
        assert!(s.combined, "{s}");
        assert!(trace(&s.covar) <= trace(&f.covar) * (1.0 + 1e-9), "{s}");
    }
}

#[rstest]
fn backward_pass_inherits_the_forward_edits(truth: LinearPropagator) {
    let mut fwd = filter(&truth, FilterConfig::default());
    // Corrupt the fourth observation so that the forward pass rejects it
    fwd.msr_mut().observations_mut()[3].value[1] += 10.0;
    let mut smoother = Engine::new("edits", SmootherConfig::default()).with_filter(fwd);
    smoother.initialize().unwrap();
    smoother.run().unwrap();

    let edited: Vec<usize> = smoother
        .forward_records()
        .iter()
        .filter_map(|rec| rec.measurement.as_ref())
        .filter(|msr| msr.edit_flag == EditFlag::SigmaEdited)
        .map(|msr| msr.record_num)
        .collect();
    assert_eq!(edited, vec![3]);

    let backward_edit = smoother
        .backward_records()
        .iter()
        .filter_map(|rec| rec.measurement.as_ref())
        .find(|msr| msr.record_num == 3)
        .unwrap();
    assert_eq!(backward_edit.edit_flag, EditFlag::SigmaEdited);
    assert_eq!(smoother.summary().unwrap().count(EditFlag::SigmaEdited), 1);
}

#[rstest]
fn backward_records_run_backward(truth: LinearPropagator) {
    let mut smoother =
        Engine::new("order", SmootherConfig::default()).with_filter(filter(&truth, FilterConfig::default()));
    smoother.initialize().unwrap();
    smoother.run().unwrap();
    assert!(smoother
        .backward_records()
        .windows(2)
        .all(|pair| pair[0].epoch >= pair[1].epoch));
    assert_eq!(
        smoother.backward_records()[0].epoch,
        smoother.forward_records().last().unwrap().epoch
    );
}

#[rstest]
fn reports_smoothed_records(truth: LinearPropagator) {
    let path = output_path("smoothed.txt");
    let mut smoother = Engine::new("report", SmootherConfig::default())
        .with_filter(filter(&truth, FilterConfig::default()))
        .with_report(Box::new(
            TextReport::new(&path, EpochFormat::UTCGregorian).unwrap(),
        ));
    smoother.initialize().unwrap();
    smoother.run().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let smoothed_lines = text.lines().filter(|line| line.contains(" S")).count();
    assert!(smoothed_lines >= smoother.smoothed_records().len());
    std::fs::remove_file(&path).unwrap();
}

#[rstest]
fn predicts_until_the_anchor(truth: LinearPropagator) {
    let mut fwd = filter(&truth, FilterConfig::default());
    fwd.set_anchor_epoch(start_epoch() + 600.seconds(), false);
    let mut smoother = Engine::new("anchor", SmootherConfig::default()).with_filter(fwd);
    smoother.initialize().unwrap();
    smoother.run().unwrap();

    assert_eq!(smoother.smoother_state(), SmootherState::Predicting);
    // The forward pass itself stops at the last observation
    assert_eq!(
        smoother.forward_records().last().unwrap().epoch,
        start_epoch() + 480.seconds()
    );
    let predicted = smoother.predicted_records();
    assert_eq!(
        predicted.last().unwrap().epoch,
        start_epoch() + 600.seconds()
    );
}

#[rstest]
fn smoother_without_filter() {
    let mut smoother = Engine::new("none", SmootherConfig::default());
    assert_eq!(smoother.initialize(), Err(ODError::FilterNotSet));
    let bad = SmootherConfig::builder().backward_inflation(-1.0).build();
    let mut smoother = Engine::new("bad", bad);
    assert!(matches!(
        smoother.initialize(),
        Err(ODError::ODConfigError { .. })
    ));
}
