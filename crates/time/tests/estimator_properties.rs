//! Property tests for the round-trip estimator and the clock model.

use metronome_time::{
    ClockModel, EstimatorConfig, ManualClock, RoundTripEstimator, SharedTimeSource, SyncStatus,
    TimeSample,
};
use proptest::prelude::*;
use std::sync::Arc;

fn estimator() -> RoundTripEstimator {
    let clock: SharedTimeSource = Arc::new(ManualClock::new(0.0));
    RoundTripEstimator::new(EstimatorConfig::default(), clock).unwrap()
}

fn sample(t0: f64, offset: f64, out: f64, back: f64) -> TimeSample {
    let t1 = t0 + out + offset;
    TimeSample::new(t0, t1, t1, t0 + out + back)
}

proptest! {
    #[test]
    fn local_reference_mapping_is_invertible(
        offset in -1_000.0f64..1_000.0,
        drift in -5e-4f64..5e-4,
        anchor in 0.0f64..1e6,
        local in 0.0f64..1e6,
    ) {
        let model = ClockModel {
            offset,
            drift,
            anchor,
            confidence: 1.0,
            status: SyncStatus::Sync,
        };
        let back = model.to_local(model.to_reference(local));
        prop_assert!((back - local).abs() <= 1e-6 * local.abs().max(1.0));
    }

    #[test]
    fn symmetric_paths_recover_the_offset(
        offset in -10.0f64..10.0,
        one_way in 0.0001f64..0.05,
        samples in 1usize..30,
    ) {
        let mut est = estimator();
        let mut t0 = 50.0;
        for _ in 0..samples {
            est.observe(sample(t0, offset, one_way, one_way)).unwrap();
            t0 += 0.5;
        }
        let report = est.report();
        prop_assert!((report.offset - offset).abs() < 1e-6);
        prop_assert!((report.round_trip - 2.0 * one_way).abs() < 1e-9);
    }

    #[test]
    fn confidence_is_monotonic_while_training(
        delays in prop::collection::vec(0.001f64..0.004, 2..8),
    ) {
        let mut est = estimator();
        let mut t0 = 10.0;
        let mut previous = 0.0;
        for (i, delay) in delays.iter().enumerate() {
            // asymmetric paths make the measured offset wander
            let out = delay * if i % 2 == 0 { 0.3 } else { 0.7 };
            let report = est.observe(sample(t0, 0.1, out, delay - out)).unwrap();
            if report.status == SyncStatus::Training {
                prop_assert!(report.confidence >= previous);
            }
            previous = report.confidence;
            t0 += 0.25;
        }
    }

    #[test]
    fn rejected_samples_never_move_the_model(
        offset in -1.0f64..1.0,
        bad_delay in -1.0f64..-0.000001,
    ) {
        let mut est = estimator();
        for i in 0..5 {
            est.observe(sample(1.0 + i as f64, offset, 0.002, 0.002)).unwrap();
        }
        let before = est.model();
        let t0 = 20.0;
        let t1 = t0 + offset;
        let t2 = t1 - bad_delay + 0.001;
        let t3 = t0 + 0.001;
        prop_assert!(est.observe(TimeSample::new(t0, t1, t2, t3)).is_err());
        prop_assert_eq!(est.model(), before);
    }

    #[test]
    fn drift_stays_within_bounds(
        drift in -0.01f64..0.01,
        samples in 2usize..20,
    ) {
        let mut est = estimator();
        let max = est.config().max_drift;
        let mut t0 = 0.0;
        for _ in 0..samples {
            let offset = 0.3 + drift * t0;
            let _ = est.observe(sample(t0, offset, 0.002, 0.002));
            t0 += 1.0;
        }
        prop_assert!(est.model().drift.abs() <= max + f64::EPSILON);
    }
}
