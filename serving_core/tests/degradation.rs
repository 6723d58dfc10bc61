use chrono::{Duration, Utc};
use serving_core::configs::DegradationConfig;
use serving_core::degradation::policy::{BATCH_PROCESSING, MODEL_TRAINING, RULE_BASED_STRATEGY};
use serving_core::degradation::{DegradationInputs, TransitionKind};
use serving_core::{DegradationController, DegradationLevel, HardwareSample, ServiceMode};

fn inputs(sample: HardwareSample) -> DegradationInputs {
    DegradationInputs::from_sample(sample)
}

#[test]
fn heavy_cpu_alone_lands_on_heavy() {
    let controller = DegradationController::new(DegradationConfig::default());
    let sample = HardwareSample {
        cpu_percent: 96.0,
        ..HardwareSample::nominal()
    };
    let t = controller.evaluate(&inputs(sample)).expect("escalation");
    assert_eq!(t.to, DegradationLevel::Heavy);
    assert_eq!(controller.level(), DegradationLevel::Heavy);
    assert_eq!(controller.state().mode, ServiceMode::Minimal);
    assert!(!controller.is_feature_enabled(BATCH_PROCESSING));
    assert!(controller.is_feature_enabled(MODEL_TRAINING));
    assert!(!controller.is_fallback_active(RULE_BASED_STRATEGY));
}

#[test]
fn critical_holds_through_an_early_quiet_sample() {
    let controller = DegradationController::new(DegradationConfig {
        stability_period_secs: 120,
        ..DegradationConfig::default()
    });
    let t0 = Utc::now();
    let full_disk = HardwareSample {
        disk_percent: 97.0,
        ..HardwareSample::nominal()
    };
    controller.evaluate_at(&inputs(full_disk), t0).expect("escalation");
    assert_eq!(controller.level(), DegradationLevel::Critical);
    assert!(controller.is_fallback_active(RULE_BASED_STRATEGY));

    let quiet = inputs(HardwareSample::nominal());
    assert!(controller.evaluate_at(&quiet, t0 + Duration::seconds(10)).is_none());
    assert_eq!(controller.level(), DegradationLevel::Critical);

    let t = controller
        .evaluate_at(&quiet, t0 + Duration::seconds(121))
        .expect("recovery after the stability period");
    assert_eq!(t.kind, TransitionKind::Recovery);
    assert_eq!(controller.level(), DegradationLevel::Normal);
    assert!(!controller.is_fallback_active(RULE_BASED_STRATEGY));
    assert!(controller.watch_active_at(t0 + Duration::seconds(130)));
}

#[test]
fn recovery_never_precedes_the_stability_period() {
    let controller = DegradationController::new(DegradationConfig::default());
    let t0 = Utc::now();
    let cpu = |pct: f64| {
        inputs(HardwareSample {
            cpu_percent: pct,
            ..HardwareSample::nominal()
        })
    };
    // Alternating pressure: every escalation restarts the clock.
    let readings = [85.0, 10.0, 92.0, 10.0, 10.0, 97.0, 10.0, 10.0, 10.0];
    let mut last_escalation = t0;
    for (i, pct) in readings.iter().enumerate() {
        let now = t0 + Duration::seconds(30 * i as i64);
        if let Some(t) = controller.evaluate_at(&cpu(*pct), now) {
            if t.to > t.from {
                last_escalation = now;
            } else {
                assert!(now - last_escalation >= Duration::seconds(120), "recovered at step {i}");
            }
        }
    }
}

#[test]
fn forced_transitions_respect_ordering() {
    let controller = DegradationController::new(DegradationConfig::default());
    let t0 = Utc::now();
    assert!(controller
        .force_escalate_at(DegradationLevel::Moderate, "operator", t0)
        .is_some());
    assert!(controller.force_escalate_at(DegradationLevel::Light, "operator", t0).is_none());
    assert!(controller
        .force_recover_at(DegradationLevel::Normal, "operator", t0 + Duration::seconds(5))
        .is_none());
    let t = controller
        .force_recover_at(DegradationLevel::Normal, "operator", t0 + Duration::seconds(200))
        .expect("stability period elapsed");
    assert_eq!(t.kind, TransitionKind::ForcedRecovery);
    assert_eq!(controller.history().len(), 2);
}
