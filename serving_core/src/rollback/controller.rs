//! # Rollback Controller
//!
//! The safety net around optimizations. Before a change is applied a snapshot
//! captures the baseline; while it is active, `monitor` compares live metrics
//! against that baseline and, when a flag is raised and auto-rollback is
//! enabled, undoes the change on the spot.
//!
//! ## Core Functionality:
//! - **Snapshots**: persisted through `RollbackStore`, capped at
//!   `max_snapshots` with oldest-first eviction.
//! - **Monitoring**: a rolling latency window plus an error counter per
//!   snapshot. Flags: metric regression or worsening trend, error threshold,
//!   latency instability (coefficient of variation).
//! - **Rollback**: serialised per snapshot id, dispatched to the restore
//!   routine of the optimization type, recorded as an immutable event.
//! - **Restart recovery**: `open` replays the store.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::configs::RollbackConfig;
use crate::errors::{Result, ServingError};
use crate::performance::PerformanceMetrics;
use crate::rollback::snapshot::{
    OptimizationSnapshot, OptimizationType, RestoreRoutine, RollbackDecision, RollbackEvent, RollbackReason,
    RollbackReport, RollbackTarget,
};
use crate::rollback::store::RollbackStore;
use crate::utils::stats;

#[derive(Debug, Default)]
struct Tracking {
    latencies: VecDeque<f64>,
    errors: u32,
}

/// # Rollback Controller
pub struct RollbackController {
    config: RollbackConfig,
    store: RollbackStore,
    target: Arc<dyn RollbackTarget>,
    active: Mutex<BTreeMap<String, OptimizationSnapshot>>,
    tracking: Mutex<HashMap<String, Tracking>>,
    history: Mutex<Vec<RollbackEvent>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    failures: AtomicU64,
}

impl RollbackController {
    /// Open the controller on `config.storage_dir`, replaying persisted
    /// snapshots and history.
    pub fn open(config: RollbackConfig, target: Arc<dyn RollbackTarget>) -> Result<Self> {
        let store = RollbackStore::open(&config.storage_dir)?;
        let snapshots = store.load_snapshots()?;
        let history = store.load_history()?;
        tracing::info!(
            dir = %config.storage_dir.display(),
            active = snapshots.len(),
            history = history.len(),
            "rollback store opened"
        );
        let failures = history.iter().filter(|e| !e.success).count() as u64;
        Ok(Self {
            active: Mutex::new(snapshots.into_iter().map(|s| (s.id.clone(), s)).collect()),
            tracking: Mutex::new(HashMap::new()),
            history: Mutex::new(history),
            in_flight: Mutex::new(HashMap::new()),
            failures: AtomicU64::new(failures),
            config,
            store,
            target,
        })
    }

    /// # Create Snapshot
    ///
    /// Capture `baseline` and `config` before `optimization` is applied. When
    /// `artifact` is given it is copied into the store and hashed. Returns the
    /// snapshot id.
    pub fn create_snapshot(
        &self,
        optimization: OptimizationType,
        config: Value,
        baseline: PerformanceMetrics,
        artifact: Option<&Path>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let artifact = match artifact {
            Some(path) => Some(self.store.backup_artifact(&id, path)?),
            None => None,
        };
        let snapshot = OptimizationSnapshot {
            id: id.clone(),
            optimization,
            config,
            baseline,
            artifact,
            created_at: Utc::now(),
        };
        self.store.append_created(&snapshot)?;

        let evicted = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.insert(id.clone(), snapshot.clone());
            let mut evicted = Vec::new();
            while active.len() > self.config.max_snapshots {
                let oldest = active
                    .values()
                    .min_by_key(|s| s.created_at)
                    .map(|s| s.id.clone());
                match oldest.and_then(|oid| active.remove(&oid)) {
                    Some(s) => evicted.push(s),
                    None => break,
                }
            }
            evicted
        };
        for old in evicted {
            self.forget(&old.id);
            self.store.append_removed(&old.id)?;
            if let Some(backup) = &old.artifact {
                self.store.remove_backup(backup);
            }
            tracing::debug!(snapshot_id = %old.id, "oldest snapshot evicted");
        }
        tracing::info!(snapshot_id = %id, optimization = %snapshot.optimization, "snapshot created");
        Ok(id)
    }

    fn forget(&self, id: &str) {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
    }

    /// A snapshot still being monitored.
    pub fn snapshot(&self, id: &str) -> Option<OptimizationSnapshot> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Ids of active snapshots, oldest first.
    pub fn active_snapshots(&self) -> Vec<String> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut v: Vec<&OptimizationSnapshot> = active.values().collect();
        v.sort_by_key(|s| s.created_at);
        v.into_iter().map(|s| s.id.clone()).collect()
    }

    /// # Monitor
    ///
    /// Feed one observation of `current` for snapshot `id`. With
    /// auto-rollback enabled a raised flag rolls back before returning.
    pub async fn monitor(&self, id: &str, current: &PerformanceMetrics, error_occurred: bool) -> Result<RollbackDecision> {
        let snapshot = self
            .snapshot(id)
            .ok_or_else(|| ServingError::validation(format!("unknown snapshot '{id}'")))?;

        let (window, errors) = {
            let mut tracking = self.tracking.lock().unwrap_or_else(PoisonError::into_inner);
            let t = tracking.entry(id.to_string()).or_default();
            if t.latencies.len() == self.config.window_size {
                t.latencies.pop_front();
            }
            t.latencies.push_back(current.latency_ms);
            if error_occurred {
                t.errors += 1;
            }
            (t.latencies.iter().copied().collect::<Vec<f64>>(), t.errors)
        };

        let mut reasons = Vec::new();
        let mut details = self.regressions(&snapshot.baseline, current);
        if let Some(trend) = self.worsening_trend(&window) {
            details.push(format!("latency trend +{:.0}%", trend * 100.0));
        }
        if !details.is_empty() {
            reasons.push(RollbackReason::PerformanceDegradation);
        }
        if errors >= self.config.max_errors {
            reasons.push(RollbackReason::ErrorThresholdExceeded);
            details.push(format!("{errors} errors"));
        }
        if window.len() >= 3 {
            if let Some(cv) = stats::coefficient_of_variation(&window) {
                if cv >= 1.0 - self.config.stability_threshold {
                    reasons.push(RollbackReason::Instability);
                    details.push(format!("latency cv {cv:.2}"));
                }
            }
        }

        let mut decision = RollbackDecision {
            snapshot_id: id.to_string(),
            should_rollback: !reasons.is_empty(),
            reasons,
            details,
            executed: None,
        };
        if decision.should_rollback {
            if self.config.auto_rollback {
                let reason = decision.reasons[0];
                let event = self.execute(id, reason, decision.details.join(", ")).await?;
                decision.executed = Some(event);
            } else {
                tracing::warn!(snapshot_id = %id, reasons = ?decision.reasons, "rollback advised");
            }
        }
        Ok(decision)
    }

    fn regressions(&self, baseline: &PerformanceMetrics, current: &PerformanceMetrics) -> Vec<String> {
        let threshold = self.config.degradation_threshold;
        let mut out = Vec::new();
        let mut check = |metric: &str, base: f64, now: f64, higher_is_worse: bool| {
            if base <= 0.0 {
                return;
            }
            let change = if higher_is_worse { (now - base) / base } else { (base - now) / base };
            if change > threshold {
                out.push(format!("{metric} {base:.2} -> {now:.2}"));
            }
        };
        check("latency_ms", baseline.latency_ms, current.latency_ms, true);
        check("throughput", baseline.throughput, current.throughput, false);
        if let (Some(b), Some(c)) = (baseline.accuracy, current.accuracy) {
            check("accuracy", b, c, false);
        }
        if let (Some(b), Some(c)) = (baseline.training_time_ms, current.training_time_ms) {
            check("training_time_ms", b, c, true);
        }
        out
    }

    /// Relative rise of the newer half of the window over the older half.
    fn worsening_trend(&self, window: &[f64]) -> Option<f64> {
        if window.len() < 4 {
            return None;
        }
        let (older, newer) = window.split_at(window.len() / 2);
        let (a, b) = (stats::mean(older)?, stats::mean(newer)?);
        if a <= 0.0 {
            return None;
        }
        let rise = (b - a) / a;
        (rise > self.config.degradation_threshold).then_some(rise)
    }

    /// # Rollback
    ///
    /// Undo snapshot `id`. A failed restore is recorded and returned as
    /// `RollbackFailure`.
    pub async fn rollback(&self, id: &str, reason: RollbackReason, detail: &str) -> Result<RollbackEvent> {
        let event = self.execute(id, reason, detail.to_string()).await?;
        if event.success {
            Ok(event)
        } else {
            Err(ServingError::rollback_failure(
                id,
                event.error.unwrap_or_else(|| "restore failed".to_string()),
            ))
        }
    }

    async fn execute(&self, id: &str, reason: RollbackReason, detail: String) -> Result<RollbackEvent> {
        let gate = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight.entry(id.to_string()).or_default().clone()
        };
        let executed = {
            let _serialised = gate.lock().await;
            self.execute_serialised(id, reason, detail)
        };
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        executed
    }

    fn execute_serialised(&self, id: &str, reason: RollbackReason, detail: String) -> Result<RollbackEvent> {
        let Some(snapshot) = self.snapshot(id) else {
            // A concurrent rollback of the same id finished first: its event is the answer.
            return self
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .rev()
                .find(|e| e.snapshot_id == id)
                .cloned()
                .ok_or_else(|| ServingError::validation(format!("unknown snapshot '{id}'")));
        };

        let before = self.target.current_metrics();
        let started = Instant::now();
        let outcome = self.restore(&snapshot);
        let recovery_ms = started.elapsed().as_secs_f64() * 1000.0;
        let after = self.target.current_metrics();

        let event = RollbackEvent {
            snapshot_id: id.to_string(),
            optimization: snapshot.optimization.clone(),
            reason,
            detail,
            before,
            after,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            recovery_ms,
            timestamp: Utc::now(),
        };
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());

        // Failed restores are retired too so a broken routine cannot fire on
        // every monitoring tick.
        self.active.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        self.forget(id);
        if let Some(backup) = &snapshot.artifact {
            self.store.remove_backup(backup);
        }

        match &outcome {
            Ok(()) => tracing::warn!(
                snapshot_id = %id,
                optimization = %snapshot.optimization,
                reason = %reason,
                recovery_ms,
                "optimization rolled back"
            ),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    snapshot_id = %id,
                    optimization = %snapshot.optimization,
                    error = %e,
                    "rollback failed"
                );
            }
        }

        let persisted = self
            .store
            .append_event(&event)
            .and_then(|()| self.store.append_removed(id));
        if let Err(e) = persisted {
            if outcome.is_ok() {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            tracing::error!(snapshot_id = %id, error = %e, "rollback record not persisted");
            return Err(ServingError::rollback_failure(id, format!("rollback record not persisted: {e}")));
        }
        Ok(event)
    }

    fn restore(&self, snapshot: &OptimizationSnapshot) -> Result<()> {
        let routine = snapshot.optimization.restore_routine().ok_or_else(|| {
            ServingError::rollback_failure(
                &snapshot.id,
                format!("no restore routine for optimization '{}'", snapshot.optimization),
            )
        })?;
        match routine {
            RestoreRoutine::ArtifactRestore => {
                let backup = snapshot
                    .artifact
                    .as_ref()
                    .ok_or_else(|| ServingError::rollback_failure(&snapshot.id, "snapshot has no artifact backup"))?;
                self.store.restore_artifact(&snapshot.id, backup)
            }
            RestoreRoutine::FeatureDisable => {
                if let Some(backup) = &snapshot.artifact {
                    self.store.restore_artifact(&snapshot.id, backup)?;
                }
                self.target.disable_optimization(&snapshot.optimization)
            }
            RestoreRoutine::ConfigRevert => self.target.revert_config(&snapshot.optimization, &snapshot.config),
        }
    }

    /// Every recorded rollback, oldest first.
    pub fn history(&self) -> Vec<RollbackEvent> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Failed rollbacks since the store was created.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// # Report
    pub fn report(&self) -> RollbackReport {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let mut report = RollbackReport {
            total: history.len(),
            active_snapshots: self.active.lock().unwrap_or_else(PoisonError::into_inner).len(),
            ..RollbackReport::default()
        };
        let mut recovery = Vec::new();
        for e in history.iter() {
            if e.success {
                report.successful += 1;
                recovery.push(e.recovery_ms);
            } else {
                report.failed += 1;
            }
            if e.timestamp >= hour_ago {
                report.last_hour += 1;
            }
            *report.by_type.entry(e.optimization.to_string()).or_default() += 1;
            *report.by_reason.entry(e.reason.to_string()).or_default() += 1;
        }
        report.success_rate = if report.total == 0 {
            1.0
        } else {
            report.successful as f64 / report.total as f64
        };
        report.average_recovery_ms = stats::mean(&recovery).unwrap_or(0.0);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTarget;

    fn metrics(latency_ms: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            latency_ms,
            throughput: 1000.0 / latency_ms,
            memory_mb: 50.0,
            accuracy: Some(0.9),
            training_time_ms: None,
        }
    }

    fn controller(dir: &Path, auto: bool) -> (RollbackController, Arc<RecordingTarget>) {
        let target = Arc::new(RecordingTarget::default());
        let config = RollbackConfig {
            storage_dir: dir.to_path_buf(),
            auto_rollback: auto,
            max_snapshots: 3,
            ..RollbackConfig::default()
        };
        (RollbackController::open(config, target.clone()).expect("open"), target)
    }

    #[tokio::test]
    async fn advisory_mode_does_not_execute() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (c, target) = controller(dir.path(), false);
        let id = c
            .create_snapshot(OptimizationType::Quantization, Value::Null, metrics(10.0), None)
            .expect("snapshot");
        let d = c.monitor(&id, &metrics(30.0), false).await.expect("monitor");
        assert!(d.should_rollback);
        assert!(d.executed.is_none());
        assert!(target.disabled().is_empty());
        assert!(c.snapshot(&id).is_some());
    }

    #[tokio::test]
    async fn error_threshold_triggers_rollback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (c, target) = controller(dir.path(), true);
        let id = c
            .create_snapshot(OptimizationType::GpuAcceleration, Value::Null, metrics(10.0), None)
            .expect("snapshot");
        let mut last = None;
        for _ in 0..5 {
            last = Some(c.monitor(&id, &metrics(10.0), true).await.expect("monitor"));
        }
        let d = last.expect("decision");
        assert_eq!(d.reasons, vec![RollbackReason::ErrorThresholdExceeded]);
        assert!(d.executed.is_some());
        assert_eq!(target.disabled(), vec![OptimizationType::GpuAcceleration]);
    }

    #[tokio::test]
    async fn unknown_types_fail_explicitly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (c, _) = controller(dir.path(), false);
        let id = c
            .create_snapshot(OptimizationType::Custom("warmup".into()), Value::Null, metrics(10.0), None)
            .expect("snapshot");
        let err = c.rollback(&id, RollbackReason::Manual, "operator").await.unwrap_err();
        assert!(matches!(err, ServingError::RollbackFailure { .. }));
        assert_eq!(c.failures(), 1);
        assert_eq!(c.report().failed, 1);
    }

    #[tokio::test]
    async fn snapshot_cap_evicts_oldest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (c, _) = controller(dir.path(), false);
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(
                c.create_snapshot(OptimizationType::CacheTuning, Value::Null, metrics(10.0), None)
                    .expect("snapshot"),
            );
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let active = c.active_snapshots();
        assert_eq!(active.len(), 3);
        assert!(!active.contains(&ids[0]));
    }

    #[tokio::test]
    async fn unstable_latencies_are_flagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (c, _) = controller(dir.path(), false);
        let id = c
            .create_snapshot(OptimizationType::CacheTuning, Value::Null, metrics(10.0), None)
            .expect("snapshot");
        let mut d = None;
        for l in [2.0, 10.0, 2.0, 10.0] {
            d = Some(c.monitor(&id, &metrics(l), false).await.expect("monitor"));
        }
        assert!(d.expect("decision").reasons.contains(&RollbackReason::Instability));
    }
}
