use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use serving_core::configs::{
    DegradationConfig, EngineConfig, ResourceLimits, RollbackConfig, RouterConfig, ThrottleConfig,
};
use serving_core::resources::ThrottleState;
use serving_core::testing::{ConstantFallback, ScriptedBackend, ScriptedProbe};
use serving_core::{
    DegradationLevel, HardwareSample, InferenceRequest, OptimizationType, Priority, RollbackReason, RouteStrategy,
    ServingEngine, ServingError, INFERENCE_OP,
};
use tokio_util::sync::CancellationToken;

fn config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        resources: ResourceLimits {
            max_threads: 2,
            ..ResourceLimits::default()
        },
        router: RouterConfig {
            reserved_immediate_slots: 1,
            ..RouterConfig::default()
        },
        degradation: DegradationConfig {
            training_interval_ms: 0,
            ..DegradationConfig::default()
        },
        rollback: RollbackConfig {
            storage_dir: dir.to_path_buf(),
            ..RollbackConfig::default()
        },
        ..EngineConfig::default()
    }
}

async fn engine_with(dir: &std::path::Path, backend: Arc<ScriptedBackend>) -> ServingEngine {
    start(config(dir), backend, Arc::new(ScriptedProbe::new(HardwareSample::nominal()))).await
}

async fn start(config: EngineConfig, backend: Arc<ScriptedBackend>, probe: Arc<ScriptedProbe>) -> ServingEngine {
    ServingEngine::builder(config, backend)
        .probe(probe)
        .fallback(Arc::new(ConstantFallback(json!({ "decision": "hold" }))))
        .start()
        .await
        .expect("engine starts")
}

/// Fast resource sampling and a pool wide enough that one call in flight
/// adds no thread pressure.
fn pressure_config(dir: &std::path::Path, max_delay_ms: u64) -> EngineConfig {
    let mut cfg = config(dir);
    cfg.resources.max_threads = 4;
    cfg.resources.monitor_interval_ms = 20;
    cfg.throttle = ThrottleConfig {
        max_delay_ms,
        ..ThrottleConfig::default()
    };
    cfg
}

fn cpu(percent: f64) -> HardwareSample {
    HardwareSample {
        cpu_percent: percent,
        ..HardwareSample::nominal()
    }
}

async fn throttle_until(engine: &ServingEngine, reached: impl Fn(&ThrottleState) -> bool) -> ThrottleState {
    for _ in 0..200 {
        let state = engine.resources().throttle_state();
        if reached(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("throttle never reached the expected state");
}

#[tokio::test]
async fn idle_engine_answers_directly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine_with(dir.path(), backend.clone()).await;

    let result = engine
        .submit(InferenceRequest::new(json!({ "x": 1 })).with_id("first"))
        .await
        .expect("served");
    assert_eq!(result.request_id, "first");
    assert_eq!(result.strategy, RouteStrategy::Direct);
    assert_eq!(result.output["input"]["x"], 1);
    assert!(!result.degraded);

    let stats = engine.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.by_strategy["direct"], 1);
    assert_eq!(stats.by_priority["NORMAL"], 1);
    assert_eq!(backend.single_calls(), 1);
    engine.close().await;
}

#[tokio::test]
async fn direct_calls_hold_only_the_inference_grant() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_latency(Duration::from_millis(150));
    let engine = engine_with(dir.path(), backend).await;

    let call = engine.submit(InferenceRequest::new(json!(1)).with_timeout(Duration::from_secs(2)));
    let during = async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.resources().active_allocations()
    };
    let (served, grants) = tokio::join!(call, during);
    served.expect("served");
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].operation, INFERENCE_OP);
    assert_eq!(grants[0].threads, 0);
    assert!(engine.resources().active_allocations().is_empty());
    engine.close().await;
}

#[tokio::test]
async fn urgent_requests_take_the_immediate_lane() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_with(dir.path(), Arc::new(ScriptedBackend::new())).await;
    let result = engine
        .submit(
            InferenceRequest::new(json!({ "x": 2 }))
                .with_urgency(0.95)
                .with_priority(Priority::Critical),
        )
        .await
        .expect("served");
    assert_eq!(result.strategy, RouteStrategy::Immediate);
    engine.close().await;
}

#[tokio::test]
async fn concurrent_load_is_batched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_latency(Duration::from_millis(40));
    let engine = engine_with(dir.path(), backend.clone()).await;

    let requests = (0..20).map(|i| {
        engine.submit(
            InferenceRequest::new(json!({ "i": i }))
                .with_id(format!("r{i}"))
                .with_timeout(Duration::from_secs(5)),
        )
    });
    let results = join_all(requests).await;

    let mut batched = 0;
    for (i, r) in results.into_iter().enumerate() {
        let r = r.expect("served");
        assert_eq!(r.request_id, format!("r{i}"));
        assert_eq!(r.output["input"]["i"], i);
        if r.strategy == RouteStrategy::Batched {
            batched += 1;
            assert!(r.batch_id.is_some());
        }
    }
    assert!(batched > 0);
    assert!(backend.batch_calls() > 0);
    let stats = engine.stats();
    assert_eq!(stats.completed, 20);
    assert_eq!(stats.by_strategy.values().sum::<u64>(), 20);
    engine.close().await;
}

#[tokio::test]
async fn deadline_and_cancellation_end_requests_early() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_latency(Duration::from_millis(300));
    let engine = engine_with(dir.path(), backend).await;

    let err = engine
        .submit(InferenceRequest::new(json!(1)).with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::Timeout(_)));
    assert!(err.retryable());

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = engine
        .submit_with_cancel(InferenceRequest::new(json!(2)), token)
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::Cancelled(_)));

    let stats = engine.stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.cancelled, 1);
    engine.close().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_admission() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_with(dir.path(), Arc::new(ScriptedBackend::new())).await;
    let err = engine
        .submit(InferenceRequest::new(json!(1)).with_urgency(1.5))
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::Validation(_)));
    assert!(!err.retryable());
    assert_eq!(engine.stats().rejected, 1);
    assert_eq!(engine.resources().stats().active_allocations, 0);
    engine.close().await;
}

#[tokio::test]
async fn critical_level_serves_from_the_fallback_and_refuses_training() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine_with(dir.path(), backend.clone()).await;
    engine
        .degradation()
        .force_escalate(DegradationLevel::Critical, "test")
        .expect("escalated");

    let result = engine.submit(InferenceRequest::new(json!(3))).await.expect("served");
    assert!(result.degraded);
    assert_eq!(result.fallback.as_deref(), Some("constant"));
    assert_eq!(result.output, json!({ "decision": "hold" }));
    assert_eq!(backend.single_calls(), 0);

    let err = engine.train(json!({ "rows": 10 })).await.unwrap_err();
    assert!(matches!(err, ServingError::DegradedService(_)));
    assert_eq!(backend.training_runs(), 0);
    engine.close().await;
}

#[tokio::test]
async fn training_intensity_follows_the_degradation_level() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    let engine = engine_with(dir.path(), backend.clone()).await;

    engine.train(json!({ "rows": 10 })).await.expect("trained");
    assert_eq!(backend.last_intensity(), Some(1.0));

    engine
        .degradation()
        .force_escalate(DegradationLevel::Moderate, "test")
        .expect("escalated");
    engine.train(json!({ "rows": 10 })).await.expect("trained");
    assert_eq!(backend.last_intensity(), Some(0.5));
    assert!(engine.tracker().current_metrics("training").is_some());
    engine.close().await;
}

#[tokio::test]
async fn optimizations_are_snapshotted_and_can_be_rolled_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_with(dir.path(), Arc::new(ScriptedBackend::new())).await;

    let err = engine
        .apply_optimization(OptimizationType::BatchSizeTuning, json!({ "batch_size_factor": 2.0 }), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::Validation(_)));
    assert!(engine.rollback().active_snapshots().is_empty());

    let err = engine
        .apply_optimization(OptimizationType::GpuAcceleration, json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::Validation(_)));

    let id = engine
        .apply_optimization(OptimizationType::BatchSizeTuning, json!({ "batch_size_factor": 0.5 }), None)
        .await
        .expect("applied");
    assert_eq!(engine.tunables().batch_size_factor(), 0.5);
    assert_eq!(engine.rollback().active_snapshots(), vec![id.clone()]);

    let event = engine
        .rollback()
        .rollback(&id, RollbackReason::Manual, "operator")
        .await
        .expect("rolled back");
    assert!(event.success);
    assert_eq!(engine.tunables().batch_size_factor(), 1.0);
    assert_eq!(engine.stats().rollbacks, 1);
    engine.close().await;
}

#[tokio::test]
async fn closed_engine_refuses_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_with(dir.path(), Arc::new(ScriptedBackend::new())).await;
    engine.close().await;
    let err = engine.submit(InferenceRequest::new(json!(1))).await.unwrap_err();
    assert!(matches!(err, ServingError::EngineClosed));
    assert!(matches!(
        engine.train(json!(1)).await.unwrap_err(),
        ServingError::EngineClosed
    ));
}

#[tokio::test]
async fn low_priority_requests_wait_out_a_pause() {
    let dir = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedProbe::new(HardwareSample::nominal()));
    let engine = start(pressure_config(dir.path(), 10), Arc::new(ScriptedBackend::new()), probe.clone()).await;

    probe.set(cpu(100.0));
    let state = throttle_until(&engine, |s| s.pause_non_critical).await;
    assert!(state.level > 0.8);

    let err = engine
        .submit(
            InferenceRequest::new(json!(1))
                .with_priority(Priority::Low)
                .with_timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::Timeout(_)));

    engine
        .submit(InferenceRequest::new(json!(2)).with_timeout(Duration::from_secs(2)))
        .await
        .expect("normal priority is not deferred");

    let low = engine.submit(
        InferenceRequest::new(json!(3))
            .with_priority(Priority::Low)
            .with_timeout(Duration::from_secs(3)),
    );
    let release = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        probe.set(HardwareSample::nominal());
    };
    let (served, ()) = tokio::join!(low, release);
    let served = served.expect("served once the pause lifts");
    assert!(served.latency_ms >= 90.0);
    assert_eq!(engine.stats().timed_out, 1);
    engine.close().await;
}

#[tokio::test]
async fn moderate_pressure_delays_in_proportion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedProbe::new(HardwareSample::nominal()));
    let engine = start(pressure_config(dir.path(), 200), Arc::new(ScriptedBackend::new()), probe.clone()).await;

    // 70% of an 80% limit: level (0.875 - 0.7) / 0.3.
    probe.set(cpu(70.0));
    let state = throttle_until(&engine, |s| s.level > 0.3).await;
    assert!(!state.reduce_batch && !state.pause_non_critical);
    let expected_ms = 200.0 * state.level;

    let delayed = engine
        .submit(InferenceRequest::new(json!(1)).with_timeout(Duration::from_secs(2)))
        .await
        .expect("served");
    assert!(delayed.latency_ms >= expected_ms - 5.0);

    probe.set(HardwareSample::nominal());
    throttle_until(&engine, |s| s.level == 0.0).await;
    let prompt = engine
        .submit(InferenceRequest::new(json!(2)).with_timeout(Duration::from_secs(2)))
        .await
        .expect("served");
    assert!(prompt.latency_ms < expected_ms);
    engine.close().await;
}

#[tokio::test]
async fn heavy_pressure_halves_the_batch_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    let probe = Arc::new(ScriptedProbe::new(HardwareSample::nominal()));
    let engine = start(pressure_config(dir.path(), 10), Arc::new(ScriptedBackend::new()), probe.clone()).await;
    let before = engine.stats().batch_target;

    // 72% of an 80% limit: level 2/3, above batch reduction, below pause.
    probe.set(cpu(72.0));
    let state = throttle_until(&engine, |s| s.reduce_batch).await;
    assert!(!state.pause_non_critical);
    let reduced = engine.stats().batch_target;
    assert!(reduced < before);
    assert!(reduced <= before.div_ceil(2));

    probe.set(HardwareSample::nominal());
    throttle_until(&engine, |s| !s.reduce_batch).await;
    assert_eq!(engine.stats().batch_target, before);
    engine.close().await;
}

#[tokio::test]
async fn requests_that_time_out_mid_batch_are_not_replayed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_fail_batches(true);
    backend.set_latency(Duration::from_millis(40));
    let engine = engine_with(dir.path(), backend.clone()).await;

    let requests = (0..20).map(|i| {
        engine.submit(
            InferenceRequest::new(json!({ "i": i }))
                .with_id(format!("t{i}"))
                .with_timeout(Duration::from_millis(120)),
        )
    });
    let results = join_all(requests).await;
    assert!(results.iter().any(|r| matches!(r, Err(ServingError::Timeout(_)))));
    let at_return = backend.single_calls();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    // Only calls already running on the two workers may still land.
    assert!(backend.single_calls() <= at_return + 2);
    let stats = engine.stats();
    assert_eq!(stats.completed + stats.timed_out, 20);
    assert_eq!(stats.queue_depth, 0);
    engine.close().await;
}

#[tokio::test]
async fn training_runs_are_spaced_while_frequency_is_reduced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    let mut cfg = config(dir.path());
    cfg.degradation.training_interval_ms = 200;
    let engine = start(cfg, backend.clone(), Arc::new(ScriptedProbe::new(HardwareSample::nominal()))).await;

    engine.train(json!({ "rows": 10 })).await.expect("trained");
    engine
        .degradation()
        .force_escalate(DegradationLevel::Moderate, "test")
        .expect("escalated");
    let err = engine.train(json!({ "rows": 10 })).await.unwrap_err();
    assert!(matches!(err, ServingError::DegradedService(_)));
    assert_eq!(backend.training_runs(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    engine.train(json!({ "rows": 10 })).await.expect("trained after the spacing");
    assert_eq!(backend.training_runs(), 2);
    engine.close().await;
}

#[tokio::test]
async fn hung_training_is_cut_by_the_training_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_latency(Duration::from_millis(300));
    let mut cfg = config(dir.path());
    cfg.router.training_timeout_ms = 50;
    let engine = start(cfg, backend, Arc::new(ScriptedProbe::new(HardwareSample::nominal()))).await;

    let err = engine.train(json!({ "rows": 10 })).await.unwrap_err();
    assert!(matches!(err, ServingError::Timeout(_)));
    assert_eq!(engine.stats().workers.timeouts, 1);
    engine.close().await;
}

#[tokio::test]
async fn degraded_levels_turn_off_profiling_and_optimization() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_with(dir.path(), Arc::new(ScriptedBackend::new())).await;
    let checked = |engine: &ServingEngine| {
        let e = engine.stats().enforcer;
        e.within_target + e.warnings + e.critical
    };

    engine.submit(InferenceRequest::new(json!(1))).await.expect("served");
    assert_eq!(checked(&engine), 1);

    engine
        .degradation()
        .force_escalate(DegradationLevel::Heavy, "test")
        .expect("escalated");
    engine.submit(InferenceRequest::new(json!(2))).await.expect("served");
    assert_eq!(checked(&engine), 1);

    engine
        .degradation()
        .force_escalate(DegradationLevel::Critical, "test")
        .expect("escalated");
    let err = engine
        .apply_optimization(OptimizationType::BatchSizeTuning, json!({ "batch_size_factor": 0.5 }), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServingError::DegradedService(_)));
    assert!(engine.rollback().active_snapshots().is_empty());
    engine.close().await;
}
