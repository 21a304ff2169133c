use seqod::io::ConfigError;
use seqod::od::prelude::*;

#[test]
fn filter_parameters_by_name() {
    let mut config = FilterConfig::default();
    config.set_parameter("ProcessNoiseTimeStep", "60").unwrap();
    config.set_parameter("ScaledResidualThreshold", "4.5").unwrap();
    config.set_parameter("DelayRectifyTimeSpan", "0").unwrap();
    config.set_parameter("WarmStartEpochFormat", "TAIModJulian").unwrap();
    config.set_parameter("WarmStartEpoch", "FirstMeasurement").unwrap();
    config.set_parameter("OutputWarmStartFile", "filter_ws.csv").unwrap();
    config.set_parameter("PredictionTimeSpan", "3600").unwrap();
    config.set_parameter("ProcessNoiseModel", "SNC").unwrap();

    assert_eq!(config.process_noise_step, 60.0);
    assert_eq!(config.sigma_multiplier, 4.5);
    assert_eq!(config.warm_start_epoch_format, EpochFormat::TAIModJulian);
    assert_eq!(config.warm_start_epoch, WarmStartEpoch::FirstMeasurement);
    assert_eq!(config.output_warm_start_file.as_deref(), Some("filter_ws.csv"));
    assert_eq!(config.prediction_span, Some(3600.0));
    assert!(matches!(config.process_noise, ProcessNoise::SNC { .. }));
    assert!(config.validate().is_ok());

    // Empty file names disable the warm start
    config.set_parameter("OutputWarmStartFile", "  ").unwrap();
    assert_eq!(config.output_warm_start_file, None);
}

#[test]
fn invalid_parameters() {
    let mut config = FilterConfig::default();
    assert!(matches!(
        config.set_parameter("ProcessNoiseTimeStep", "-1"),
        Err(ConfigError::NegativeValue { .. })
    ));
    assert!(matches!(
        config.set_parameter("ScaledResidualThreshold", "0"),
        Err(ConfigError::NonPositiveValue { .. })
    ));
    assert!(matches!(
        config.set_parameter("CovarianceInversionTolerance", "abc"),
        Err(ConfigError::InvalidParameter { .. })
    ));
    assert!(matches!(
        config.set_parameter("InputWarmStartFile", "ws*.csv"),
        Err(ConfigError::InvalidFileName { .. })
    ));
    assert!(matches!(
        config.set_parameter("WarmStartEpochFormat", "GPSWeeks"),
        Err(ConfigError::InvalidTimeSystem { .. })
    ));
    assert!(matches!(
        config.set_parameter("WarmStartEpoch", "not an epoch"),
        Err(ConfigError::InvalidEpoch { .. })
    ));
    assert!(matches!(
        config.set_parameter("ProcessNoiseModel", "Brownian"),
        Err(ConfigError::UnknownModel { .. })
    ));
    assert!(matches!(
        config.set_parameter("Tolerance", "1"),
        Err(ConfigError::UnknownModel { .. })
    ));
    // Failed assignments leave the configuration untouched
    assert_eq!(config, FilterConfig::default());
}

#[test]
fn filter_config_from_yaml() {
    let yaml = r#"
process_noise_step: 60.0
sigma_multiplier: 4.0
warm_start_epoch: LastWarmStartRecord
covariance_update: Simple
noise_frame: VNB
process_noise:
  model: SNC
  accel_var: [1.0e-12, 1.0e-12, 1.0e-12]
  decay: [3600.0, 3600.0, 3600.0]
"#;
    let config = FilterConfig::loads(yaml).unwrap();
    assert_eq!(config.process_noise_step, 60.0);
    assert_eq!(config.sigma_multiplier, 4.0);
    assert_eq!(config.covariance_update, CovarianceUpdate::Simple);
    assert_eq!(config.noise_frame, NoiseFrame::VNB);
    assert_eq!(config.cov_inv_tol, FilterConfig::default().cov_inv_tol);
    assert!(config.validate().is_ok());

    let bad = "sigma_multiplier: -3.0\n";
    let config = FilterConfig::loads(bad).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn smoother_config_from_yaml() {
    let config = SmootherConfig::loads("prediction_span: 600.0\n").unwrap();
    assert_eq!(config.backward_inflation, BACKWARD_COVAR_INFLATION);
    assert_eq!(config.prediction_span, Some(600.0));
    assert!(config.validate().is_ok());
}
