use crate::{diag_covar, output_path, start_epoch};
use pretty_env_logger::try_init;
use rstest::*;
use seqod::linalg::{trace, DVector, Vector3};
use seqod::od::prelude::*;

const SIGMA_KM: f64 = 1e-3;

#[fixture]
fn truth() -> LinearPropagator {
    let _ = try_init().is_err();
    let state = DVector::from_vec(vec![6778.0, 0.0, 0.0, 0.0, 7.6, 0.5]);
    LinearPropagator::new(start_epoch(), state).unwrap()
}

/// Noiseless ranges offset by exactly one sigma, alternating in sign.
#[fixture]
fn arc(truth: LinearPropagator) -> ObservationArc<RangeModel> {
    let model = RangeModel::new(Vector3::new(6378.0, 0.0, 0.0), SIGMA_KM);
    let epochs: Vec<Epoch> = (1..=10)
        .map(|k| start_epoch() + (60 * k as i64).seconds())
        .collect();
    let exact = ArcSimulator::new(model, 0.0, 0)
        .generate(&truth, &epochs)
        .unwrap();
    let observations = exact
        .observations()
        .iter()
        .enumerate()
        .map(|(k, obs)| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            Observation::new(obs.epoch, obs.value.add_scalar(sign * SIGMA_KM))
        })
        .collect();
    ObservationArc::new(model, observations)
}

#[rstest]
fn ten_minutes_of_range(truth: LinearPropagator, arc: ObservationArc<RangeModel>) {
    let mut initial = truth.state().clone();
    initial[0] += 0.05;
    initial[1] -= 0.05;
    initial[4] += 5e-5;
    let prop = LinearPropagator::new(start_epoch(), initial).unwrap();

    let report_path = output_path("range.csv");
    let config = FilterConfig::builder()
        .process_noise(ProcessNoise::SNC {
            accel_var: [1e-14; 3],
            disable_time: None,
            start: None,
            decay: None,
        })
        .build();
    let mut kf = SequentialFilter::new("range", prop, arc, diag_covar(6, 0.01, 1e-8), config)
        .with_report(Box::new(
            CsvExport::new(&report_path, EpochFormat::UTCGregorian).unwrap(),
        ));
    kf.initialize().unwrap();
    kf.run().unwrap();

    let summary = kf.summary().unwrap();
    assert_eq!(summary.count(EditFlag::SigmaEdited), 0);
    assert_eq!(summary.count(EditFlag::Normal), 10);
    assert!(summary.information.is_some());

    let obs: Vec<&UpdateRecord> = kf.records().iter().filter(|rec| rec.is_obs).collect();
    assert_eq!(obs.len(), 10);
    for rec in &obs {
        assert!(trace(&rec.covar) <= trace(&rec.covar_bar), "{rec}");
        let scaled = rec.measurement.as_ref().unwrap().max_scaled().unwrap();
        assert!(scaled < 3.0, "{rec}");
    }
    // Range only constrains the line of sight, so the total uncertainty must have shrunk
    assert!(trace(&obs[9].covar) < trace(&kf.records()[0].covar));

    // One header and one row per record
    let mut rdr = csv::Reader::from_path(&report_path).unwrap();
    assert_eq!(rdr.records().count(), kf.records().len());
    std::fs::remove_file(&report_path).unwrap();
}

#[rstest]
fn blocked_ranges_are_not_processed(truth: LinearPropagator, arc: ObservationArc<RangeModel>) {
    // Beyond 2000 km, the station cannot see the spacecraft
    let model = RangeModel {
        max_range_km: Some(2000.0),
        ..RangeModel::new(Vector3::new(6378.0, 0.0, 0.0), SIGMA_KM)
    };
    let arc = ObservationArc::new(model, arc.observations().to_vec());
    let mut kf = SequentialFilter::new(
        "blocked",
        truth.clone(),
        arc,
        diag_covar(6, 0.01, 1e-8),
        FilterConfig::default(),
    );
    kf.initialize().unwrap();
    kf.run().unwrap();

    let summary = kf.summary().unwrap();
    assert_eq!(summary.count(EditFlag::Normal), 4);
    assert_eq!(summary.count(EditFlag::Blocked), 6);
    for rec in kf.records().iter().filter(|rec| rec.edit_flag() == Some(EditFlag::Blocked)) {
        assert_eq!(rec.covar, rec.covar_bar);
    }
}

#[rstest]
fn noisy_range_without_process_noise(truth: LinearPropagator) {
    let model = RangeModel::new(Vector3::new(6378.0, 0.0, 0.0), SIGMA_KM);
    let epochs: Vec<Epoch> = (1..=10)
        .map(|k| start_epoch() + (60 * k as i64).seconds())
        .collect();
    let arc = ArcSimulator::new(model, SIGMA_KM, 7)
        .generate(&truth, &epochs)
        .unwrap();
    assert_eq!(arc.observations().len(), 10);

    let mut initial = truth.state().clone();
    initial[0] += 0.05;
    initial[4] -= 5e-5;
    let prop = LinearPropagator::new(start_epoch(), initial).unwrap();
    let config = FilterConfig::builder()
        .process_noise(ProcessNoise::None)
        .sigma_multiplier(4.0)
        .build();
    let mut kf = SequentialFilter::new("noisy", prop, arc, diag_covar(6, 0.01, 1e-8), config);
    kf.initialize().unwrap();
    kf.run().unwrap();

    let summary = kf.summary().unwrap();
    assert_eq!(summary.count(EditFlag::SigmaEdited), 0);
    assert_eq!(summary.count(EditFlag::Normal), 10);
    // Without process noise the uncertainty only ever shrinks
    for rec in kf.records().iter().filter(|rec| rec.is_accepted_obs()) {
        assert!(trace(&rec.covar) <= trace(&rec.covar_bar), "{rec}");
        assert!(rec.process_noise.iter().all(|q| *q == 0.0), "{rec}");
    }
}
