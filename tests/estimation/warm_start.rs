use crate::{diag_covar, leo_state, output_path, position_arc, start_epoch};
use approx::assert_relative_eq;
use pretty_env_logger::try_init;
use rstest::*;
use seqod::io::warmstart::{read_warm_start, RowSelector};
use seqod::od::prelude::*;

type Kf = SequentialFilter<LinearPropagator, ObservationArc<PositionModel>>;

#[fixture]
fn truth() -> LinearPropagator {
    let _ = try_init().is_err();
    LinearPropagator::new(start_epoch(), leo_state(6)).unwrap()
}

fn filter(truth: &LinearPropagator, config: FilterConfig) -> Kf {
    let mut initial = leo_state(6);
    initial[1] -= 0.2;
    SequentialFilter::new(
        "ws",
        LinearPropagator::new(start_epoch(), initial).unwrap(),
        position_arc(truth, 5),
        diag_covar(6, 1.0, 1e-6),
        config,
    )
}

/// Runs a filter which writes every record to a warm-start file, returns that filter.
fn write_file(truth: &LinearPropagator, path: &str) -> Kf {
    let mut config = FilterConfig::default();
    config.set_output_warm_start_file(path).unwrap();
    let mut kf = filter(truth, config);
    kf.initialize().unwrap();
    kf.run().unwrap();
    kf
}

#[rstest]
fn resumes_from_the_last_record(truth: LinearPropagator) {
    let path = output_path("last.csv");
    let first = write_file(&truth, &path);

    let stored = read_warm_start(&path, RowSelector::Last).unwrap();
    assert_eq!(stored.names, vec!["X", "Y", "Z", "VX", "VY", "VZ"]);
    let last = first.records().last().unwrap();
    assert_eq!(stored.epoch, last.epoch);

    let mut config = FilterConfig::default();
    config.set_input_warm_start_file(&path).unwrap();
    config
        .set_warm_start_epoch("LastWarmStartRecord")
        .unwrap();
    let mut second = filter(&truth, config);
    second.initialize().unwrap();
    second.run().unwrap();

    let resumed = &second.records()[0];
    assert_eq!(resumed.epoch, start_epoch() + 300.seconds());
    for i in 0..6 {
        assert_relative_eq!(resumed.state[i], last.state[i], max_relative = 1e-14);
        for j in 0..6 {
            assert_relative_eq!(
                resumed.covar[(i, j)],
                last.covar[(i, j)],
                epsilon = 1e-20,
                max_relative = 1e-14
            );
        }
    }
    // Only the observation at the resumed epoch remains
    assert_eq!(second.records().iter().filter(|rec| rec.is_obs).count(), 1);
    std::fs::remove_file(&path).unwrap();
}

#[rstest]
fn resumes_before_the_first_observation(truth: LinearPropagator) {
    let path = output_path("first_msr.csv");
    write_file(&truth, &path);

    let mut config = FilterConfig::default();
    config.set_input_warm_start_file(&path).unwrap();
    config.set_warm_start_epoch("FirstMeasurement").unwrap();
    let mut kf = filter(&truth, config);
    kf.initialize().unwrap();
    kf.run().unwrap();
    assert_eq!(kf.records()[0].epoch, start_epoch());
    assert_eq!(kf.records().iter().filter(|rec| rec.is_obs).count(), 5);
    std::fs::remove_file(&path).unwrap();
}

#[rstest]
fn resumes_at_a_literal_epoch(truth: LinearPropagator) {
    let path = output_path("literal.csv");
    write_file(&truth, &path);

    let mut config = FilterConfig::default();
    config.set_input_warm_start_file(&path).unwrap();
    // Between the observations at 120 and 180 seconds
    config
        .set_warm_start_epoch("01 Jan 2024 00:02:30.000")
        .unwrap();
    let mut kf = filter(&truth, config);
    kf.initialize().unwrap();
    kf.run().unwrap();
    assert_eq!(kf.records()[0].epoch, start_epoch() + 120.seconds());
    std::fs::remove_file(&path).unwrap();
}

#[rstest]
fn missing_file(truth: LinearPropagator) {
    let mut config = FilterConfig::default();
    config
        .set_input_warm_start_file(&output_path("does_not_exist.csv"))
        .unwrap();
    let mut kf = filter(&truth, config);
    kf.initialize().unwrap();
    assert!(matches!(
        kf.advance_state(),
        Err(ODError::ODWarmStart { .. })
    ));
}

#[rstest]
fn no_qualifying_record(truth: LinearPropagator) {
    let path = output_path("too_late.csv");
    write_file(&truth, &path);

    let mut config = FilterConfig::default();
    config.set_input_warm_start_file(&path).unwrap();
    config
        .set_warm_start_epoch("31 Dec 2023 23:00:00.000")
        .unwrap();
    let mut kf = filter(&truth, config);
    kf.initialize().unwrap();
    assert!(matches!(
        kf.advance_state(),
        Err(ODError::ODWarmStart { .. })
    ));
    std::fs::remove_file(&path).unwrap();
}
