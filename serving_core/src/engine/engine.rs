//! # Serving Engine
//!
//! The orchestrator. `submit` is the only request entry point; everything
//! else runs in background tasks started by `EngineBuilder::start`.
//!
//! ## Request Path:
//! 1. Validation, then the per-request deadline and cancellation wrap the
//!    rest of the path.
//! 2. Critical-level fallback and the optional result cache answer without
//!    touching the backend.
//! 3. Throttle mitigations: low-priority work waits while non-critical work is
//!    paused, and every request absorbs the proportional delay.
//! 4. Admission through `ResourceManager::allocate_for_operation`.
//! 5. The router picks immediate, direct or batched dispatch.
//!
//! ## Background Tasks:
//! - **resources**: sampling, collection, throttle, emergency cleanup. The
//!   sampling period stretches while monitoring frequency is reduced.
//! - **degradation**: periodic state machine evaluation.
//! - **formation**: purges abandoned requests, forms batches once full or
//!   after the maximum wait, and sends them over a bounded channel.
//! - **executor**: runs each received batch on the worker pool.
//! - **maintenance**: consumes enforcer recommendations and, while quality
//!   monitoring is enabled, monitors active optimization snapshots.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batching::{
    Batch, BatchFormer, BatchItem, BatchProcessor, BatchSample, EnforcerStats, Lane, LoadSnapshot, PriorityQueueSet,
    RealTimePerformanceEnforcer, Recommendation, Router, WorkerPool, WorkerPoolStats,
};
use crate::configs::EngineConfig;
use crate::core::{
    BackendCapabilities, FallbackStrategy, HardwareProbe, HardwareSample, InferenceRequest, InferenceResult,
    ModelBackend, Prioritized, Priority, RouteStrategy, TrainingMetrics,
};
use crate::degradation::policy::{
    BATCH_PROCESSING, BATCH_SIZE, GPU_ACCELERATION, HARDWARE_OPTIMIZATION, MODEL_TRAINING, MONITORING_FREQUENCY,
    MULTI_DEVICE_COORDINATION, PROFILING, QUALITY_MONITORING, QUANTIZATION, RULE_BASED_STRATEGY, TRAINING_FREQUENCY,
    TRAINING_INTENSITY,
};
use crate::degradation::{DegradationController, DegradationInputs, DegradationLevel, ServiceMode};
use crate::engine::tunables::{Tunables, INFERENCE_OP};
use crate::errors::{Result, ServingError};
use crate::performance::{ExecutionMetrics, PerformanceTracker, TrackerCollector};
use crate::resources::{AllocationGuard, CachePriority, ResourceManager, ResourceManagerStats};
use crate::rollback::{OptimizationType, RollbackController, RollbackTarget};
use crate::utils::sys_info::SystemProbe;

const TRAINING_OP: &str = "training";
const GPU_HISTORY_SAMPLES: usize = 5;

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// A queued request waiting for batch formation.
struct Pending {
    request: InferenceRequest,
    reply: oneshot::Sender<Result<InferenceResult>>,
    started: Instant,
    degraded: bool,
    _grant: AllocationGuard,
}

impl Prioritized for Pending {
    fn priority(&self) -> Priority {
        self.request.priority
    }
}

impl BatchItem for Pending {
    fn features(&self) -> &Value {
        &self.request.features
    }

    fn abandoned(&self) -> Option<ServingError> {
        if self.started.elapsed() >= self.request.timeout {
            Some(ServingError::timeout(format!(
                "request {} exceeded {}ms",
                self.request.id,
                self.request.timeout.as_millis()
            )))
        } else if self.reply.is_closed() {
            Some(ServingError::Cancelled(self.request.id.clone()))
        } else {
            None
        }
    }
}

impl Pending {
    /// Answer with the abandonment error, if the caller is gone.
    fn settle_if_abandoned(self) -> Option<Self> {
        match self.abandoned() {
            Some(gone) => {
                let _ = self.reply.send(Err(gone));
                None
            }
            None => Some(self),
        }
    }
}

/// Decrements a gauge when the call it counts ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::AcqRel);
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    fallback_served: AtomicU64,
    by_strategy: [AtomicU64; 3],
    by_priority: [AtomicU64; 4],
}

fn strategy_index(strategy: RouteStrategy) -> usize {
    match strategy {
        RouteStrategy::Immediate => 0,
        RouteStrategy::Batched => 1,
        RouteStrategy::Direct => 2,
    }
}

/// # Engine Statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    /// Requests that passed validation.
    pub submitted: u64,
    /// Requests refused by validation.
    pub rejected: u64,
    /// Requests answered.
    pub completed: u64,
    /// Requests that failed for any reason but timeout or cancellation.
    pub failed: u64,
    /// Requests that exceeded their deadline.
    pub timed_out: u64,
    /// Requests abandoned by the client.
    pub cancelled: u64,
    /// Answers served from the result cache.
    pub cache_hits: u64,
    /// Answers produced by the fallback strategy.
    pub fallback_served: u64,
    /// Completions per dispatch path.
    pub by_strategy: BTreeMap<String, u64>,
    /// Submissions per priority tier.
    pub by_priority: BTreeMap<String, u64>,
    /// Requests waiting for batch formation.
    pub queue_depth: usize,
    /// Current batch target before queue clamping.
    pub batch_target: usize,
    /// Current throttle level.
    pub throttle_level: f64,
    /// Current degradation level.
    pub degradation_level: DegradationLevel,
    /// Current service mode.
    pub service_mode: ServiceMode,
    /// Rollbacks recorded, including those replayed from disk.
    pub rollbacks: usize,
    /// Failed rollbacks.
    pub rollback_failures: u64,
    /// Latency target compliance.
    pub enforcer: EnforcerStats,
    /// Worker pool counters.
    pub workers: WorkerPoolStats,
    /// Resource manager counters.
    pub resources: ResourceManagerStats,
}

struct EngineInner {
    config: EngineConfig,
    backend: Arc<dyn ModelBackend>,
    caps: BackendCapabilities,
    fallback: Option<Arc<dyn FallbackStrategy>>,
    resources: Arc<ResourceManager>,
    tracker: Arc<PerformanceTracker>,
    enforcer: RealTimePerformanceEnforcer,
    degradation: Arc<DegradationController>,
    rollback: Arc<RollbackController>,
    tunables: Arc<Tunables>,
    router: Router,
    former: BatchFormer,
    processor: BatchProcessor,
    pool: Arc<WorkerPool>,
    queue: Mutex<PriorityQueueSet<Pending>>,
    queue_signal: Notify,
    in_flight: AtomicUsize,
    immediate_in_flight: AtomicUsize,
    counters: Counters,
    last_training: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

/// # Engine Builder
///
/// Collects the collaborators of a `ServingEngine`. Without an explicit probe
/// the engine samples the host through `SystemProbe`.
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Arc<dyn ModelBackend>,
    probe: Option<Arc<dyn HardwareProbe>>,
    fallback: Option<Arc<dyn FallbackStrategy>>,
}

impl EngineBuilder {
    /// Use `probe` for hardware samples.
    pub fn probe(mut self, probe: Arc<dyn HardwareProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Serve through `fallback` while the rule-based fallback is active.
    pub fn fallback(mut self, fallback: Arc<dyn FallbackStrategy>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// # Start
    ///
    /// Validate the configuration, open the rollback store and spawn the
    /// background tasks. Must be called inside a tokio runtime.
    pub async fn start(self) -> Result<ServingEngine> {
        let config = self.config;
        config.validate()?;
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemProbe::new()) as Arc<dyn HardwareProbe>);
        let caps = self.backend.capabilities();

        let resources = Arc::new(ResourceManager::new(
            config.resources.clone(),
            config.gc.clone(),
            config.throttle.clone(),
            probe,
        ));
        let tracker = Arc::new(PerformanceTracker::new(config.performance.clone()));
        resources.register_collector(Arc::new(TrackerCollector::new(Arc::clone(&tracker))));
        let tunables = Arc::new(Tunables::new(config.resources.cache_results, Arc::clone(&tracker)));
        let target: Arc<dyn RollbackTarget> = tunables.clone();
        let rollback = Arc::new(RollbackController::open(config.rollback.clone(), target)?);
        let pool = Arc::new(WorkerPool::new(
            config.resources.max_threads,
            config.router.reserved_immediate_slots,
            config.router.backend_timeout(),
        ));
        resources.attach_worker_gauge(pool.busy_gauge());

        let inner = Arc::new(EngineInner {
            caps,
            fallback: self.fallback,
            enforcer: RealTimePerformanceEnforcer::new(&config.performance),
            degradation: Arc::new(DegradationController::new(config.degradation.clone())),
            router: Router::new(config.router.clone(), &config.batching),
            former: BatchFormer::new(config.batching.clone()),
            processor: BatchProcessor::new(Arc::clone(&self.backend), Arc::clone(&pool)),
            backend: self.backend,
            resources,
            tracker,
            rollback,
            tunables,
            pool,
            queue: Mutex::new(PriorityQueueSet::new()),
            queue_signal: Notify::new(),
            in_flight: AtomicUsize::new(0),
            immediate_in_flight: AtomicUsize::new(0),
            counters: Counters::default(),
            last_training: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });

        let cancel = CancellationToken::new();
        let (batch_tx, batch_rx) = mpsc::channel(inner.config.batching.channel_capacity);
        let sampler = Arc::clone(&inner);
        let frequency = Arc::clone(&inner.degradation);
        let tasks = vec![
            tokio::spawn(Arc::clone(&inner.resources).run(
                move || frequency.reduction_factor(MONITORING_FREQUENCY),
                cancel.child_token(),
            )),
            tokio::spawn(
                Arc::clone(&inner.degradation).run(move || sampler.degradation_inputs(), cancel.child_token()),
            ),
            tokio::spawn(Arc::clone(&inner).run_formation(batch_tx, cancel.child_token())),
            tokio::spawn(Arc::clone(&inner).run_executor(batch_rx)),
            tokio::spawn(Arc::clone(&inner).run_maintenance(cancel.child_token())),
        ];
        tracing::info!(
            max_threads = inner.config.resources.max_threads,
            memory_limit_mb = inner.config.resources.memory_limit_mb,
            batch_support = caps.batch_support,
            gpu = caps.gpu,
            "serving engine started"
        );
        Ok(ServingEngine {
            inner,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }
}

/// # Serving Engine
pub struct ServingEngine {
    inner: Arc<EngineInner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServingEngine {
    /// Builder for an engine around `backend`.
    pub fn builder(config: EngineConfig, backend: Arc<dyn ModelBackend>) -> EngineBuilder {
        EngineBuilder {
            config,
            backend,
            probe: None,
            fallback: None,
        }
    }

    /// Start an engine with the default probe and no fallback strategy.
    pub async fn start(config: EngineConfig, backend: Arc<dyn ModelBackend>) -> Result<Self> {
        Self::builder(config, backend).start().await
    }

    /// # Submit
    ///
    /// Serve one request. Fails with `Timeout` once the request's own timeout
    /// elapses, wherever it is at that point.
    pub async fn submit(&self, request: InferenceRequest) -> Result<InferenceResult> {
        self.submit_with_cancel(request, CancellationToken::new()).await
    }

    /// `submit`, abandoned with `Cancelled` as soon as `cancel` fires.
    pub async fn submit_with_cancel(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<InferenceResult> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ServingError::EngineClosed);
        }
        if let Err(e) = request.validate() {
            inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        inner.counters.by_priority[request.priority.index()].fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let timeout = request.timeout;
        let id = request.id.clone();
        let deadline = tokio::time::Instant::from_std(started + timeout);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ServingError::Cancelled(id.clone())),
            _ = tokio::time::sleep_until(deadline) => Err(ServingError::timeout(format!(
                "request {id} exceeded {}ms",
                timeout.as_millis()
            ))),
            served = inner.serve(request, started) => served,
        };
        inner.finish(&id, &outcome, elapsed_ms(started));
        outcome
    }

    /// # Apply Optimization
    ///
    /// Snapshot the current state and performance, then apply `optimization`
    /// with `config`. The snapshot is monitored by the maintenance task and
    /// rolled back automatically if the change turns out harmful. Returns the
    /// snapshot id.
    pub async fn apply_optimization(
        &self,
        optimization: OptimizationType,
        config: Value,
        artifact: Option<&Path>,
    ) -> Result<String> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ServingError::EngineClosed);
        }
        if !inner.degradation.is_feature_enabled(HARDWARE_OPTIMIZATION) {
            return Err(ServingError::DegradedService(format!(
                "hardware optimization disabled at level {}",
                inner.degradation.level()
            )));
        }
        match &optimization {
            OptimizationType::Quantization if !inner.degradation.is_feature_enabled(QUANTIZATION) => {
                return Err(ServingError::DegradedService(format!(
                    "quantization disabled at level {}",
                    inner.degradation.level()
                )));
            }
            OptimizationType::GpuAcceleration if !inner.caps.gpu => {
                return Err(ServingError::validation("backend has no GPU support"));
            }
            OptimizationType::GpuAcceleration if !inner.degradation.is_feature_enabled(GPU_ACCELERATION) => {
                return Err(ServingError::DegradedService("GPU use disabled under GPU memory pressure".into()));
            }
            OptimizationType::GpuAcceleration if !inner.degradation.is_feature_enabled(MULTI_DEVICE_COORDINATION) => {
                return Err(ServingError::DegradedService(format!(
                    "device coordination disabled at level {}",
                    inner.degradation.level()
                )));
            }
            _ => {}
        }
        inner.tunables.check(&optimization, &config)?;
        let previous = inner.tunables.snapshot_config(&optimization);
        let baseline = inner.tracker.current_metrics(INFERENCE_OP).unwrap_or_default();
        let id = inner
            .rollback
            .create_snapshot(optimization.clone(), previous, baseline, artifact)?;
        inner.tunables.apply(&optimization, &config)?;
        Ok(id)
    }

    /// # Train
    ///
    /// Hand `data` to the backend at the current training intensity, on the
    /// worker pool under the training timeout. Refused with `DegradedService`
    /// while training is disabled, while background work is paused, or when
    /// the previous run is more recent than the reduced training frequency
    /// allows.
    pub async fn train(&self, data: Value) -> Result<TrainingMetrics> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ServingError::EngineClosed);
        }
        if !inner.degradation.is_feature_enabled(MODEL_TRAINING) {
            return Err(ServingError::DegradedService(format!(
                "model training disabled at level {}",
                inner.degradation.level()
            )));
        }
        if inner.resources.throttle_state().pause_non_critical {
            return Err(ServingError::DegradedService(
                "background work paused under resource pressure".into(),
            ));
        }
        let spacing = inner
            .config
            .degradation
            .training_spacing(inner.degradation.reduction_factor(TRAINING_FREQUENCY));
        let _grant = {
            let mut last = inner.last_training.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = *last {
                let since = previous.elapsed();
                if since < spacing {
                    return Err(ServingError::DegradedService(format!(
                        "training frequency reduced at level {}, next run in {}ms",
                        inner.degradation.level(),
                        (spacing - since).as_millis()
                    )));
                }
            }
            // Busy pool workers already count as threads in use.
            let grant = inner
                .resources
                .allocate_for_operation(TRAINING_OP, inner.config.resources.request_memory_mb * 4.0, 0)?;
            *last = Some(Instant::now());
            grant
        };
        let intensity = inner.degradation.reduction_factor(TRAINING_INTENSITY);

        let backend = Arc::clone(&inner.backend);
        let started = Instant::now();
        let call = inner
            .pool
            .run_with_timeout(Lane::General, inner.config.router.training_timeout(), move || {
                backend.train(&data, intensity)
            })
            .await;
        let trained = match call {
            Ok(trained) => trained,
            Err(e) => {
                inner.tracker.record(ExecutionMetrics::failure(TRAINING_OP, elapsed_ms(started)));
                return Err(e);
            }
        };
        match trained {
            Ok(metrics) => {
                inner.tracker.record(ExecutionMetrics {
                    accuracy: metrics.accuracy,
                    training_time_ms: Some(metrics.duration_ms),
                    ..ExecutionMetrics::success(TRAINING_OP, metrics.duration_ms)
                });
                tracing::info!(intensity, loss = metrics.loss, duration_ms = metrics.duration_ms, "training run finished");
                Ok(metrics)
            }
            Err(e) => {
                inner.tracker.record(ExecutionMetrics::failure(TRAINING_OP, elapsed_ms(started)));
                Err(e.into())
            }
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let c = &inner.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let by_strategy = [RouteStrategy::Immediate, RouteStrategy::Batched, RouteStrategy::Direct]
            .into_iter()
            .map(|s| (s.to_string(), load(&c.by_strategy[strategy_index(s)])))
            .collect();
        let by_priority = Priority::DRAIN_ORDER
            .into_iter()
            .map(|p| (p.to_string(), load(&c.by_priority[p.index()])))
            .collect();
        let degradation = inner.degradation.state();
        EngineStats {
            submitted: load(&c.submitted),
            rejected: load(&c.rejected),
            completed: load(&c.completed),
            failed: load(&c.failed),
            timed_out: load(&c.timed_out),
            cancelled: load(&c.cancelled),
            cache_hits: load(&c.cache_hits),
            fallback_served: load(&c.fallback_served),
            by_strategy,
            by_priority,
            queue_depth: inner.queue.lock().unwrap_or_else(PoisonError::into_inner).len(),
            batch_target: inner.former.scaled_target(inner.batch_size_factor()),
            throttle_level: inner.resources.throttle_state().level,
            degradation_level: degradation.level,
            service_mode: degradation.mode,
            rollbacks: inner.rollback.history().len(),
            rollback_failures: inner.rollback.failures(),
            enforcer: inner.enforcer.stats(),
            workers: inner.pool.stats(),
            resources: inner.resources.stats(),
        }
    }

    /// The degradation controller, for operator control.
    pub fn degradation(&self) -> &DegradationController {
        &self.inner.degradation
    }

    /// The rollback controller.
    pub fn rollback(&self) -> &RollbackController {
        &self.inner.rollback
    }

    /// The resource manager.
    pub fn resources(&self) -> &ResourceManager {
        &self.inner.resources
    }

    /// The performance tracker.
    pub fn tracker(&self) -> &PerformanceTracker {
        &self.inner.tracker
    }

    /// The live tunables.
    pub fn tunables(&self) -> &Tunables {
        &self.inner.tunables
    }

    /// # Close
    ///
    /// Stop accepting work, stop the background tasks and fail whatever is
    /// still queued with `EngineClosed`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "engine task ended abnormally");
            }
        }
        self.inner.pool.close();
        let left = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.remove_where(|_| true)
        };
        for pending in left {
            let _ = pending.reply.send(Err(ServingError::EngineClosed));
        }
        tracing::info!("serving engine closed");
    }
}

impl Drop for ServingEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl EngineInner {
    async fn serve(&self, request: InferenceRequest, started: Instant) -> Result<InferenceResult> {
        let degraded = self.degradation.level() > DegradationLevel::Normal;

        if self.degradation.is_fallback_active(RULE_BASED_STRATEGY) {
            if let Some(fallback) = &self.fallback {
                self.counters.fallback_served.fetch_add(1, Ordering::Relaxed);
                let output = fallback.decide(&request.features);
                return Ok(InferenceResult {
                    request_id: request.id,
                    output,
                    latency_ms: elapsed_ms(started),
                    strategy: RouteStrategy::Direct,
                    batch_id: None,
                    individual_fallback_used: false,
                    degraded: true,
                    fallback: Some(fallback.name().to_string()),
                });
            }
        }

        let cache_key = self
            .tunables
            .cache_results()
            .then(|| crate::rollback::store::sha256_hex(request.features.to_string().as_bytes()));
        if let Some(key) = &cache_key {
            if let Some(output) = self.resources.cache_get(key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(InferenceResult {
                    request_id: request.id,
                    output,
                    latency_ms: elapsed_ms(started),
                    strategy: RouteStrategy::Direct,
                    batch_id: None,
                    individual_fallback_used: false,
                    degraded,
                    fallback: None,
                });
            }
        }

        self.apply_throttle(&request).await;
        let grant = self.resources.allocate_for_operation(
            INFERENCE_OP,
            self.config.resources.request_memory_mb,
            0,
        )?;
        let decision = self.router.route(
            &request,
            &self.load_snapshot(),
            self.degradation.is_feature_enabled(BATCH_PROCESSING),
            self.caps,
        );
        tracing::trace!(
            request_id = %request.id,
            strategy = %decision.strategy,
            reason = decision.reason,
            "request routed"
        );

        let result = match decision.strategy {
            RouteStrategy::Batched => self.enqueue(request, grant, started, degraded).await,
            strategy => {
                let served = self.call_single(request, strategy, started, degraded).await;
                drop(grant);
                served
            }
        };

        if let (Ok(r), Some(key)) = (&result, cache_key) {
            let size_mb = r.output.to_string().len() as f64 / (1024.0 * 1024.0);
            self.resources.cache_put(&key, r.output.clone(), size_mb, CachePriority::Normal);
        }
        result
    }

    async fn apply_throttle(&self, request: &InferenceRequest) {
        let state = self.resources.throttle_state();
        if state.pause_non_critical && request.priority == Priority::Low {
            tracing::debug!(request_id = %request.id, "deferring low-priority request under resource pressure");
            let poll = Duration::from_millis(self.config.throttle.max_delay_ms.max(1));
            while self.resources.throttle_state().pause_non_critical {
                tokio::time::sleep(poll).await;
            }
        }
        if !state.delay.is_zero() {
            tokio::time::sleep(state.delay).await;
        }
    }

    async fn call_single(
        &self,
        request: InferenceRequest,
        strategy: RouteStrategy,
        started: Instant,
        degraded: bool,
    ) -> Result<InferenceResult> {
        let (lane, gauge) = match strategy {
            RouteStrategy::Immediate => (Lane::Immediate, &self.immediate_in_flight),
            _ => (Lane::General, &self.in_flight),
        };
        let _in_flight = InFlight::enter(gauge);
        let backend = Arc::clone(&self.backend);
        let features = request.features;
        let prediction = self
            .pool
            .run(lane, move || backend.predict(&features))
            .await?
            .map_err(ServingError::from)?;
        Ok(InferenceResult {
            request_id: request.id,
            output: prediction.output,
            latency_ms: elapsed_ms(started),
            strategy,
            batch_id: None,
            individual_fallback_used: false,
            degraded,
            fallback: None,
        })
    }

    async fn enqueue(
        &self,
        request: InferenceRequest,
        grant: AllocationGuard,
        started: Instant,
        degraded: bool,
    ) -> Result<InferenceResult> {
        let (reply, answer) = oneshot::channel();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .enqueue(Pending {
                request,
                reply,
                started,
                degraded,
                _grant: grant,
            });
        self.queue_signal.notify_one();
        answer.await.unwrap_or(Err(ServingError::EngineClosed))
    }

    fn finish(&self, id: &str, outcome: &Result<InferenceResult>, latency_ms: f64) {
        let c = &self.counters;
        match outcome {
            Ok(r) => {
                c.completed.fetch_add(1, Ordering::Relaxed);
                c.by_strategy[strategy_index(r.strategy)].fetch_add(1, Ordering::Relaxed);
                self.tracker.record(ExecutionMetrics::success(INFERENCE_OP, latency_ms));
                if self.degradation.is_feature_enabled(PROFILING) {
                    let (_, recs) = self.enforcer.check(latency_ms);
                    for rec in recs {
                        self.tracker.push_recommendation(rec);
                    }
                }
            }
            Err(ServingError::Cancelled(_)) => {
                c.cancelled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(request_id = %id, "request cancelled by client");
            }
            Err(e) => {
                if matches!(e, ServingError::Timeout(_)) {
                    c.timed_out.fetch_add(1, Ordering::Relaxed);
                } else {
                    c.failed.fetch_add(1, Ordering::Relaxed);
                }
                self.tracker.record(ExecutionMetrics::failure(INFERENCE_OP, latency_ms));
                tracing::debug!(request_id = %id, kind = e.kind(), error = %e, "request failed");
            }
        }
    }

    /// Product of the degradation reduction, the tunable factor and the
    /// throttle's batch reduction.
    fn batch_size_factor(&self) -> f64 {
        let throttle = if self.resources.throttle_state().reduce_batch { 0.5 } else { 1.0 };
        self.degradation.reduction_factor(BATCH_SIZE) * self.tunables.batch_size_factor() * throttle
    }

    fn load_snapshot(&self) -> LoadSnapshot {
        let sample = self
            .resources
            .monitor()
            .latest()
            .map(|s| s.sample)
            .unwrap_or_else(HardwareSample::nominal);
        let workers = self.pool.stats();
        LoadSnapshot {
            queue_depth: self.queue.lock().unwrap_or_else(PoisonError::into_inner).len(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            immediate_in_flight: self.immediate_in_flight.load(Ordering::Acquire),
            general_slots: workers.general_slots,
            immediate_slots: workers.immediate_slots,
            cpu_percent: sample.cpu_percent,
            gpu_percent: sample.gpu_memory_percent,
            batch_target: self.former.scaled_target(self.batch_size_factor()),
        }
    }

    fn degradation_inputs(&self) -> DegradationInputs {
        let monitor = self.resources.monitor();
        let sample = monitor.latest().map(|s| s.sample).unwrap_or_else(HardwareSample::nominal);
        DegradationInputs {
            recent_gpu_memory_percent: monitor
                .recent_peak_gpu_memory(GPU_HISTORY_SAMPLES)
                .max(sample.gpu_memory_percent),
            sample,
            error_rate: self.tracker.recent_error_rate(),
            regression: self.tracker.has_regression(INFERENCE_OP),
        }
    }

    /// Drop cancelled and expired requests and return how many remain.
    fn purge_queue(&self) -> usize {
        let (dropped, remaining) = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let dropped = queue.remove_where(|p| p.abandoned().is_some());
            (dropped, queue.len())
        };
        if !dropped.is_empty() {
            tracing::trace!(dropped = dropped.len(), "purged abandoned requests");
            for pending in dropped {
                let _ = pending.settle_if_abandoned();
            }
        }
        remaining
    }

    async fn run_formation(self: Arc<Self>, batches: mpsc::Sender<Batch<Pending>>, cancel: CancellationToken) {
        let max_wait = self.config.batching.max_wait();
        'formation: loop {
            if self.purge_queue() == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break 'formation,
                    _ = self.queue_signal.notified() => {}
                }
            }
            let deadline = tokio::time::Instant::now() + max_wait;
            loop {
                if self.purge_queue() >= self.former.scaled_target(self.batch_size_factor()) {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break 'formation,
                    _ = self.queue_signal.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
            let factor = self.batch_size_factor();
            let batch = {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                self.former.form_batch(&mut queue, factor)
            };
            if let Some(batch) = batch {
                tracing::trace!(batch_id = %batch.id, size = batch.len(), optimal = batch.optimal_size, "batch formed");
                if batches.send(batch).await.is_err() {
                    break;
                }
            }
        }
        tracing::debug!("batch formation stopped");
    }

    async fn run_executor(self: Arc<Self>, mut batches: mpsc::Receiver<Batch<Pending>>) {
        while let Some(batch) = batches.recv().await {
            let engine = Arc::clone(&self);
            tokio::spawn(async move { engine.execute_batch(batch).await });
        }
    }

    async fn execute_batch(&self, mut batch: Batch<Pending>) {
        batch.items = std::mem::take(&mut batch.items)
            .into_iter()
            .filter_map(Pending::settle_if_abandoned)
            .collect();
        if batch.is_empty() {
            return;
        }
        let outcome = self.processor.process_batch(&mut batch).await;
        if batch.len() == batch.optimal_size && !outcome.fallback_used {
            self.former.record(BatchSample::new(batch.len(), outcome.elapsed_ms));
        }
        tracing::trace!(
            batch_id = %batch.id,
            size = batch.len(),
            succeeded = outcome.succeeded(),
            fallback = outcome.fallback_used,
            "batch processed"
        );
        let batch_id = batch.id;
        for (pending, result) in batch.items.into_iter().zip(outcome.results) {
            let answer = result.map(|item| InferenceResult {
                request_id: pending.request.id.clone(),
                output: item.output,
                latency_ms: elapsed_ms(pending.started),
                strategy: RouteStrategy::Batched,
                batch_id: Some(batch_id.clone()),
                individual_fallback_used: item.individual_fallback_used,
                degraded: pending.degraded,
                fallback: None,
            });
            let _ = pending.reply.send(answer);
        }
    }

    async fn run_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_millis(self.config.rollback.monitor_interval_ms.max(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_failures = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.maintain(&mut last_failures).await,
            }
        }
        tracing::debug!("maintenance stopped");
    }

    async fn maintain(&self, last_failures: &mut u64) {
        for rec in self.tracker.drain_recommendations() {
            match rec {
                Recommendation::ReduceBatchSize => {
                    let target = self.former.step_down();
                    tracing::debug!(batch_target = target, "latency over target, batch target reduced");
                }
                Recommendation::CheckDegradation => {
                    self.degradation.evaluate(&self.degradation_inputs());
                }
            }
        }

        let failures =
            self.counters.failed.load(Ordering::Relaxed) + self.counters.timed_out.load(Ordering::Relaxed);
        let errored = failures > *last_failures;
        *last_failures = failures;
        if !self.degradation.is_feature_enabled(QUALITY_MONITORING) {
            return;
        }
        let Some(current) = self.tracker.current_metrics(INFERENCE_OP) else {
            return;
        };
        for id in self.rollback.active_snapshots() {
            if let Err(e) = self.rollback.monitor(&id, &current, errored).await {
                tracing::error!(snapshot_id = %id, error = %e, "snapshot monitoring failed");
            }
        }
    }
}
