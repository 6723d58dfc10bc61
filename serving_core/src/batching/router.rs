//! # Request Router
//!
//! Chooses, per request, between the immediate lane, the batch queue and a
//! direct call on a general worker by estimating the completion time of each
//! and taking the cheapest. Urgent requests skip the comparison and always go
//! immediate.
//!
//! ## Cost Model:
//!
//! `service = base_latency * (0.5 + complexity) * (1 + cpu/100 [+ gpu/200])`
//!
//! - **Direct**: `service * (1 + in_flight / general_slots)`.
//! - **Immediate**: `service * (1 + immediate_in_flight / immediate_slots)`
//!   plus a lane penalty scaled by `1 - urgency`, so the reserved lane is not
//!   spent on requests that do not need it.
//! - **Batched**: the formation wait (zero once a full batch is already
//!   waiting, `max_wait` otherwise) plus the amortised batch call, delayed by
//!   the batches already ahead in the queue.

use serde::{Deserialize, Serialize};

use crate::configs::{BatchingConfig, RouterConfig};
use crate::core::backend::BackendCapabilities;
use crate::core::request::{InferenceRequest, RouteStrategy};

/// Load figures the router decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    /// Requests waiting in the batch queues.
    pub queue_depth: usize,
    /// Direct calls admitted and not yet finished.
    pub in_flight: usize,
    /// Immediate calls admitted and not yet finished.
    pub immediate_in_flight: usize,
    /// General worker permits.
    pub general_slots: usize,
    /// Reserved immediate permits.
    pub immediate_slots: usize,
    /// Host CPU utilisation.
    pub cpu_percent: f64,
    /// GPU memory utilisation.
    pub gpu_percent: f64,
    /// Size the batch former currently aims for.
    pub batch_target: usize,
}

/// What the router decided and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Chosen path.
    pub strategy: RouteStrategy,
    /// Estimated completion of the immediate path.
    pub immediate_ms: Option<f64>,
    /// Estimated completion of the batched path; `None` when excluded.
    pub batched_ms: Option<f64>,
    /// Estimated completion of the direct path.
    pub direct_ms: Option<f64>,
    /// Short explanation used in logs.
    pub reason: &'static str,
}

/// # Router
#[derive(Debug, Clone)]
pub struct Router {
    config: RouterConfig,
    max_wait_ms: f64,
}

impl Router {
    /// Router using `config` and the batch wait from `batching`.
    pub fn new(config: RouterConfig, batching: &BatchingConfig) -> Self {
        Self {
            config,
            max_wait_ms: batching.max_wait_ms as f64,
        }
    }

    /// # Route
    ///
    /// `batching_enabled` reflects the degradation policy; `caps` the backend.
    pub fn route(
        &self,
        request: &InferenceRequest,
        load: &LoadSnapshot,
        batching_enabled: bool,
        caps: BackendCapabilities,
    ) -> RouteDecision {
        let service = self.service_ms(request, load, caps);
        let immediate = self.immediate_ms(request, load, service);
        let direct = service * (1.0 + load.in_flight as f64 / load.general_slots.max(1) as f64);
        let batched = if batching_enabled && caps.batch_support && request.batch_eligible {
            Some(self.batched_ms(load, service))
        } else {
            None
        };

        if request.urgency >= self.config.urgent_threshold {
            return RouteDecision {
                strategy: RouteStrategy::Immediate,
                immediate_ms: immediate,
                batched_ms: batched,
                direct_ms: Some(direct),
                reason: "urgent",
            };
        }

        let mut best = (RouteStrategy::Direct, direct);
        if let Some(b) = batched {
            if b < best.1 {
                best = (RouteStrategy::Batched, b);
            }
        }
        if let Some(i) = immediate {
            if i < best.1 {
                best = (RouteStrategy::Immediate, i);
            }
        }
        RouteDecision {
            strategy: best.0,
            immediate_ms: immediate,
            batched_ms: batched,
            direct_ms: Some(direct),
            reason: "lowest expected completion",
        }
    }

    fn service_ms(&self, request: &InferenceRequest, load: &LoadSnapshot, caps: BackendCapabilities) -> f64 {
        let mut load_factor = 1.0 + load.cpu_percent.clamp(0.0, 100.0) / 100.0;
        if caps.gpu {
            load_factor += load.gpu_percent.clamp(0.0, 100.0) / 200.0;
        }
        self.config.base_latency_ms * (0.5 + request.complexity) * load_factor
    }

    fn immediate_ms(&self, request: &InferenceRequest, load: &LoadSnapshot, service: f64) -> Option<f64> {
        if load.immediate_slots == 0 {
            // Without reserved permits the immediate lane is the general lane.
            return if request.urgency >= self.config.urgent_threshold {
                Some(service * (1.0 + load.in_flight as f64 / load.general_slots.max(1) as f64))
            } else {
                None
            };
        }
        let contention = 1.0 + load.immediate_in_flight as f64 / load.immediate_slots as f64;
        Some(service * contention + self.config.immediate_lane_penalty_ms * (1.0 - request.urgency))
    }

    fn batched_ms(&self, load: &LoadSnapshot, service: f64) -> f64 {
        let target = load.batch_target.max(1);
        let size = (load.queue_depth + 1).min(target);
        let wait = if load.queue_depth + 1 >= target { 0.0 } else { self.max_wait_ms };
        let call = service * (1.0 + self.config.batch_efficiency * (size as f64 - 1.0));
        let batches_ahead = load.queue_depth / target;
        wait + call * (1.0 + batches_ahead as f64 / load.general_slots.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> Router {
        Router::new(RouterConfig::default(), &BatchingConfig::default())
    }

    fn idle() -> LoadSnapshot {
        LoadSnapshot {
            general_slots: 6,
            immediate_slots: 2,
            batch_target: 8,
            cpu_percent: 10.0,
            ..LoadSnapshot::default()
        }
    }

    #[test]
    fn urgent_requests_always_go_immediate() {
        let r = router();
        let req = InferenceRequest::new(json!(1)).with_urgency(0.95);
        let busy = LoadSnapshot {
            immediate_in_flight: 50,
            ..idle()
        };
        assert_eq!(
            r.route(&req, &busy, true, BackendCapabilities::default()).strategy,
            RouteStrategy::Immediate
        );
    }

    #[test]
    fn idle_engine_calls_directly_and_loaded_engine_batches() {
        let r = router();
        let req = InferenceRequest::new(json!(1));
        let d = r.route(&req, &idle(), true, BackendCapabilities::default());
        assert_eq!(d.strategy, RouteStrategy::Direct);

        let loaded = LoadSnapshot {
            in_flight: 60,
            immediate_in_flight: 20,
            queue_depth: 7,
            ..idle()
        };
        let d = r.route(&req, &loaded, true, BackendCapabilities::default());
        assert_eq!(d.strategy, RouteStrategy::Batched);
    }

    #[test]
    fn batching_is_excluded_when_unavailable() {
        let r = router();
        let loaded = LoadSnapshot {
            in_flight: 60,
            immediate_in_flight: 20,
            queue_depth: 7,
            ..idle()
        };
        let req = InferenceRequest::new(json!(1));
        let no_batch = BackendCapabilities {
            batch_support: false,
            gpu: false,
        };
        let d = r.route(&req, &loaded, true, no_batch);
        assert_ne!(d.strategy, RouteStrategy::Batched);
        assert!(d.batched_ms.is_none());

        let d = r.route(&req, &loaded, false, BackendCapabilities::default());
        assert_ne!(d.strategy, RouteStrategy::Batched);

        let ineligible = InferenceRequest::new(json!(1)).with_batch_eligible(false);
        let d = r.route(&ineligible, &loaded, true, BackendCapabilities::default());
        assert_ne!(d.strategy, RouteStrategy::Batched);
    }
}
