//! # Degradation Controller
//!
//! The single writer of the process-wide `DegradationState`. It maps resource
//! and performance signals onto a required level and moves the current level
//! toward it under two rules:
//!
//! - **Escalation is immediate.** As soon as the required level is above the
//!   current one, the controller jumps straight to it.
//! - **Recovery waits.** A lower required level is only honoured once the
//!   stability period has passed since the last escalation. Recovery clears
//!   every reduction and fallback, applies the policy of the new level, and
//!   opens a stability watch during which the loop polls faster so returning
//!   pressure re-escalates without waiting for a full check interval.
//!
//! Every transition runs under the state's write lock, so transitions are
//! serialised. Time is passed in explicitly (`evaluate_at`) so that callers
//! and tests drive the clock; the background loop uses `Utc::now()`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::configs::DegradationConfig;
use crate::core::probe::HardwareSample;
use crate::degradation::level::{DegradationLevel, ServiceMode};
use crate::degradation::policy::policy_for;

/// Signals one evaluation decides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationInputs {
    /// Latest hardware sample.
    pub sample: HardwareSample,
    /// Failed fraction of recent requests.
    pub error_rate: f64,
    /// Whether a performance regression is currently flagged.
    pub regression: bool,
    /// Highest GPU memory utilisation over the recent samples.
    pub recent_gpu_memory_percent: f64,
}

impl DegradationInputs {
    /// Inputs derived from a sample alone.
    pub fn from_sample(sample: HardwareSample) -> Self {
        Self {
            recent_gpu_memory_percent: sample.gpu_memory_percent,
            sample,
            error_rate: 0.0,
            regression: false,
        }
    }
}

/// # Degradation State
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationState {
    /// Current level.
    pub level: DegradationLevel,
    /// Mode of the current level.
    pub mode: ServiceMode,
    /// Features switched off.
    pub disabled_features: BTreeSet<String>,
    /// Feature name to reduction factor.
    pub reductions: BTreeMap<String, f64>,
    /// Active fallbacks.
    pub active_fallbacks: BTreeSet<String>,
    /// Time of the last transition of any kind.
    pub last_transition: DateTime<Utc>,
    /// Time of the last upward transition.
    pub last_escalation: Option<DateTime<Utc>>,
}

/// How a transition came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    /// Required level rose.
    Escalation,
    /// Required level fell and the stability period had passed.
    Recovery,
    /// Operator escalation.
    ForcedEscalation,
    /// Operator recovery.
    ForcedRecovery,
    /// Pressure returned during a stability watch.
    ReEscalation,
}

/// One entry of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Level before.
    pub from: DegradationLevel,
    /// Level after.
    pub to: DegradationLevel,
    /// Kind.
    pub kind: TransitionKind,
    /// Signals that caused it.
    pub reason: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Report of the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationStatus {
    /// Current level.
    pub level: DegradationLevel,
    /// Current mode.
    pub mode: ServiceMode,
    /// Seconds since the last transition.
    pub time_at_level_secs: i64,
    /// End of the running stability watch.
    pub stability_watch_until: Option<DateTime<Utc>>,
    /// Features switched off.
    pub disabled_features: Vec<String>,
    /// Reduction factors.
    pub reductions: BTreeMap<String, f64>,
    /// Active fallbacks.
    pub active_fallbacks: Vec<String>,
    /// Transitions logged since start.
    pub transitions: usize,
}

struct Inner {
    state: DegradationState,
    history: VecDeque<Transition>,
    transitions_total: usize,
    watch_until: Option<DateTime<Utc>>,
}

/// # Degradation Controller
pub struct DegradationController {
    config: DegradationConfig,
    inner: RwLock<Inner>,
}

impl DegradationController {
    /// Controller starting at `Normal`.
    pub fn new(config: DegradationConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: DegradationState {
                    level: DegradationLevel::Normal,
                    mode: ServiceMode::FullPerformance,
                    disabled_features: BTreeSet::new(),
                    reductions: BTreeMap::new(),
                    active_fallbacks: BTreeSet::new(),
                    last_transition: Utc::now(),
                    last_escalation: None,
                },
                history: VecDeque::new(),
                transitions_total: 0,
                watch_until: None,
            }),
        }
    }

    /// # Required Level
    ///
    /// The highest level implied by any single signal, with the signals that
    /// implied it.
    pub fn required_level(&self, inputs: &DegradationInputs) -> (DegradationLevel, Vec<String>) {
        let c = &self.config;
        let s = &inputs.sample;
        let mut level = DegradationLevel::Normal;
        let mut reasons = Vec::new();
        let mut raise = |candidate: DegradationLevel, reason: String| {
            if candidate > DegradationLevel::Normal {
                reasons.push(reason);
            }
            level = level.max(candidate);
        };

        raise(Self::tiered(s.cpu_percent, c.cpu_thresholds), format!("cpu {:.1}%", s.cpu_percent));
        raise(
            Self::tiered(s.memory_percent, c.memory_thresholds),
            format!("memory {:.1}%", s.memory_percent),
        );
        if s.gpu_memory_percent > c.gpu_memory_threshold {
            raise(DegradationLevel::Moderate, format!("gpu memory {:.1}%", s.gpu_memory_percent));
        }
        if s.disk_percent > c.disk_critical_threshold {
            raise(DegradationLevel::Critical, format!("disk {:.1}%", s.disk_percent));
        }
        if s.memory_available_gb < c.min_available_memory_gb {
            raise(
                DegradationLevel::Critical,
                format!("available memory {:.2}GB", s.memory_available_gb),
            );
        }
        if inputs.error_rate >= c.error_rate_moderate {
            raise(DegradationLevel::Moderate, format!("error rate {:.2}", inputs.error_rate));
        } else if inputs.error_rate >= c.error_rate_light {
            raise(DegradationLevel::Light, format!("error rate {:.2}", inputs.error_rate));
        }
        if inputs.regression {
            raise(DegradationLevel::Light, "performance regression".to_string());
        }
        (level, reasons)
    }

    fn tiered(value: f64, thresholds: [f64; 3]) -> DegradationLevel {
        if value > thresholds[2] {
            DegradationLevel::Heavy
        } else if value > thresholds[1] {
            DegradationLevel::Moderate
        } else if value > thresholds[0] {
            DegradationLevel::Light
        } else {
            DegradationLevel::Normal
        }
    }

    /// Evaluate `inputs` now.
    pub fn evaluate(&self, inputs: &DegradationInputs) -> Option<Transition> {
        self.evaluate_at(inputs, Utc::now())
    }

    /// # Evaluate At
    ///
    /// One state machine step at time `now`. Returns the transition taken, if
    /// any.
    pub fn evaluate_at(&self, inputs: &DegradationInputs, now: DateTime<Utc>) -> Option<Transition> {
        let (required, reasons) = self.required_level(inputs);
        let reason = if reasons.is_empty() {
            "pressure cleared".to_string()
        } else {
            reasons.join(", ")
        };
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let current = inner.state.level;
        let watching = inner.watch_until.is_some_and(|until| now <= until);

        if required > current {
            let kind = if watching {
                TransitionKind::ReEscalation
            } else {
                TransitionKind::Escalation
            };
            return Some(self.transition(&mut inner, required, kind, reason, inputs, now));
        }

        if required < current {
            if !self.stability_elapsed(&inner.state, now) {
                tracing::trace!(%current, %required, "recovery deferred until stability period elapses");
                return None;
            }
            return Some(self.transition(&mut inner, required, TransitionKind::Recovery, reason, inputs, now));
        }

        if let Some(until) = inner.watch_until {
            if now > until {
                inner.watch_until = None;
                tracing::info!(level = %current, "stability watch completed");
            }
        }
        None
    }

    /// Escalate to `level` regardless of signals. No-op unless `level` is
    /// above the current level.
    pub fn force_escalate(&self, level: DegradationLevel, reason: &str) -> Option<Transition> {
        self.force_escalate_at(level, reason, Utc::now())
    }

    /// `force_escalate` at an explicit time.
    pub fn force_escalate_at(&self, level: DegradationLevel, reason: &str, now: DateTime<Utc>) -> Option<Transition> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if level <= inner.state.level {
            return None;
        }
        let inputs = DegradationInputs::from_sample(HardwareSample::nominal());
        Some(self.transition(
            &mut inner,
            level,
            TransitionKind::ForcedEscalation,
            reason.to_string(),
            &inputs,
            now,
        ))
    }

    /// Recover to `level`. Returns `None` if `level` is not below the current
    /// level or the stability period has not elapsed.
    pub fn force_recover(&self, level: DegradationLevel, reason: &str) -> Option<Transition> {
        self.force_recover_at(level, reason, Utc::now())
    }

    /// `force_recover` at an explicit time.
    pub fn force_recover_at(&self, level: DegradationLevel, reason: &str, now: DateTime<Utc>) -> Option<Transition> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if level >= inner.state.level {
            return None;
        }
        if !self.stability_elapsed(&inner.state, now) {
            tracing::warn!(
                current = %inner.state.level,
                requested = %level,
                "forced recovery refused: stability period not elapsed"
            );
            return None;
        }
        let inputs = DegradationInputs::from_sample(HardwareSample::nominal());
        Some(self.transition(
            &mut inner,
            level,
            TransitionKind::ForcedRecovery,
            reason.to_string(),
            &inputs,
            now,
        ))
    }

    fn stability_elapsed(&self, state: &DegradationState, now: DateTime<Utc>) -> bool {
        match state.last_escalation {
            None => true,
            Some(at) => now.signed_duration_since(at).to_std().unwrap_or(Duration::ZERO) >= self.config.stability_period(),
        }
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: DegradationLevel,
        kind: TransitionKind,
        reason: String,
        inputs: &DegradationInputs,
        now: DateTime<Utc>,
    ) -> Transition {
        let from = inner.state.level;
        let policy = policy_for(to, inputs.recent_gpu_memory_percent, self.config.gpu_disable_threshold);
        let escalating = to > from;

        // Recovery starts from a clean slate; escalation only adds.
        if escalating {
            inner.state.disabled_features.extend(policy.disabled);
            for (name, factor) in policy.reductions {
                let e = inner.state.reductions.entry(name).or_insert(1.0);
                *e = e.min(factor);
            }
            inner.state.active_fallbacks.extend(policy.fallbacks);
            inner.state.last_escalation = Some(now);
            if kind == TransitionKind::ReEscalation {
                inner.watch_until = None;
            }
        } else {
            inner.state.disabled_features = policy.disabled;
            inner.state.reductions = policy.reductions;
            inner.state.active_fallbacks = policy.fallbacks;
            inner.watch_until = Some(now + chrono::Duration::seconds(self.config.stability_watch_secs as i64));
        }
        inner.state.level = to;
        inner.state.mode = to.mode();
        inner.state.last_transition = now;

        let t = Transition {
            from,
            to,
            kind,
            reason,
            at: now,
        };
        if escalating {
            tracing::warn!(from = %from, to = %to, kind = ?kind, reason = %t.reason, "degradation escalated");
        } else {
            tracing::info!(from = %from, to = %to, kind = ?kind, reason = %t.reason, "degradation recovered");
        }
        if inner.history.len() == self.config.history_size.max(1) {
            inner.history.pop_front();
        }
        inner.history.push_back(t.clone());
        inner.transitions_total += 1;
        t
    }

    /// Current level.
    pub fn level(&self) -> DegradationLevel {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state.level
    }

    /// Copy of the full state.
    pub fn state(&self) -> DegradationState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state.clone()
    }

    /// Whether `feature` is enabled at the current level.
    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        !self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .disabled_features
            .contains(feature)
    }

    /// Reduction factor of `feature`; 1.0 when not reduced.
    pub fn reduction_factor(&self, feature: &str) -> f64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .reductions
            .get(feature)
            .copied()
            .unwrap_or(1.0)
    }

    /// Whether fallback `name` is active.
    pub fn is_fallback_active(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .active_fallbacks
            .contains(name)
    }

    /// Retained transitions, oldest first.
    pub fn history(&self) -> Vec<Transition> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Whether a stability watch is running at `now`.
    pub fn watch_active_at(&self, now: DateTime<Utc>) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .watch_until
            .is_some_and(|until| now <= until)
    }

    /// Delay before the next check: shorter while a stability watch runs.
    pub fn poll_interval(&self) -> Duration {
        if self.watch_active_at(Utc::now()) {
            Duration::from_millis(self.config.watch_interval_ms)
        } else {
            Duration::from_millis(self.config.check_interval_ms)
        }
    }

    /// Report at time `now`.
    pub fn status_at(&self, now: DateTime<Utc>) -> DegradationStatus {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        DegradationStatus {
            level: inner.state.level,
            mode: inner.state.mode,
            time_at_level_secs: now.signed_duration_since(inner.state.last_transition).num_seconds(),
            stability_watch_until: inner.watch_until.filter(|until| now <= *until),
            disabled_features: inner.state.disabled_features.iter().cloned().collect(),
            reductions: inner.state.reductions.clone(),
            active_fallbacks: inner.state.active_fallbacks.iter().cloned().collect(),
            transitions: inner.transitions_total,
        }
    }

    /// Report now.
    pub fn status(&self) -> DegradationStatus {
        self.status_at(Utc::now())
    }

    /// # Run
    ///
    /// Periodic evaluation until `cancel` fires. `inputs` is called once per
    /// check to gather fresh signals.
    pub async fn run<F>(self: Arc<Self>, inputs: F, cancel: CancellationToken)
    where
        F: Fn() -> DegradationInputs + Send + Sync + 'static,
    {
        tracing::info!(interval_ms = self.config.check_interval_ms, "degradation loop started");
        loop {
            let wait = self.poll_interval().max(Duration::from_millis(10));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    let signals = inputs();
                    self.evaluate(&signals);
                }
            }
        }
        tracing::info!("degradation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degradation::policy::{BATCH_PROCESSING, BATCH_SIZE, MODEL_TRAINING, RULE_BASED_STRATEGY};

    fn inputs(cpu: f64) -> DegradationInputs {
        DegradationInputs::from_sample(HardwareSample {
            cpu_percent: cpu,
            ..HardwareSample::nominal()
        })
    }

    #[test]
    fn heavy_cpu_yields_heavy_not_critical() {
        let c = DegradationController::new(DegradationConfig::default());
        let t = c.evaluate(&inputs(96.0)).expect("escalation");
        assert_eq!(t.to, DegradationLevel::Heavy);
        assert_eq!(c.level(), DegradationLevel::Heavy);
        assert!(!c.is_feature_enabled(BATCH_PROCESSING));
        assert!(c.is_feature_enabled(MODEL_TRAINING));
        assert_eq!(c.reduction_factor(BATCH_SIZE), 0.75);
        assert_eq!(c.reduction_factor("unknown"), 1.0);
    }

    #[test]
    fn recovery_waits_for_stability_period() {
        let c = DegradationController::new(DegradationConfig::default());
        let t0 = Utc::now();
        let mut critical = inputs(10.0);
        critical.sample.disk_percent = 99.0;
        c.evaluate_at(&critical, t0);
        assert_eq!(c.level(), DegradationLevel::Critical);
        assert!(c.is_fallback_active(RULE_BASED_STRATEGY));

        assert!(c.evaluate_at(&inputs(10.0), t0 + chrono::Duration::seconds(10)).is_none());
        assert_eq!(c.level(), DegradationLevel::Critical);

        let t = c
            .evaluate_at(&inputs(10.0), t0 + chrono::Duration::seconds(121))
            .expect("recovery");
        assert_eq!(t.kind, TransitionKind::Recovery);
        assert_eq!(c.level(), DegradationLevel::Normal);
        assert!(!c.is_fallback_active(RULE_BASED_STRATEGY));
        assert!(c.is_feature_enabled(BATCH_PROCESSING));
        assert!(c.watch_active_at(t0 + chrono::Duration::seconds(130)));

        // Pressure returns inside the watch.
        let t = c
            .evaluate_at(&inputs(85.0), t0 + chrono::Duration::seconds(140))
            .expect("re-escalation");
        assert_eq!(t.kind, TransitionKind::ReEscalation);
        assert_eq!(c.level(), DegradationLevel::Light);
    }

    #[test]
    fn forced_transitions_respect_invariants() {
        let c = DegradationController::new(DegradationConfig::default());
        let t0 = Utc::now();
        assert!(c.force_escalate_at(DegradationLevel::Moderate, "drill", t0).is_some());
        assert!(c.force_escalate_at(DegradationLevel::Light, "drill", t0).is_none());
        assert!(c
            .force_recover_at(DegradationLevel::Normal, "drill", t0 + chrono::Duration::seconds(5))
            .is_none());
        let t = c
            .force_recover_at(DegradationLevel::Light, "drill", t0 + chrono::Duration::seconds(200))
            .expect("forced recovery");
        assert_eq!(t.kind, TransitionKind::ForcedRecovery);
        assert_eq!(c.level(), DegradationLevel::Light);
        assert_eq!(c.history().len(), 2);
        assert_eq!(c.status().transitions, 2);
    }

    #[test]
    fn error_bursts_escalate() {
        let c = DegradationController::new(DegradationConfig::default());
        let mut i = inputs(10.0);
        i.error_rate = 0.3;
        assert_eq!(c.required_level(&i).0, DegradationLevel::Moderate);
        i.error_rate = 0.12;
        assert_eq!(c.required_level(&i).0, DegradationLevel::Light);
        i.error_rate = 0.0;
        i.regression = true;
        assert_eq!(c.required_level(&i).0, DegradationLevel::Light);
    }
}
