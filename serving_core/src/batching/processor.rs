//! # Batch Processor
//!
//! Executes a formed batch against the backend. One `predict_batch` call is
//! tried first; when it fails, times out or returns the wrong number of
//! outputs, the batch is replayed one item at a time through `predict`.
//!
//! Whatever happens, the outcome holds exactly one result per original item,
//! in batch order. Items answered by the replay carry
//! `individual_fallback_used = true`; an item whose single call fails gets an
//! error of its own without affecting its neighbours. An item whose caller
//! has given up by the time its turn comes is answered with its abandonment
//! error and never reaches the backend.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::batching::former::{Batch, BatchStatus};
use crate::batching::worker_pool::{Lane, WorkerPool};
use crate::core::backend::{BackendError, ModelBackend};
use crate::core::request::{InferenceRequest, Prioritized};
use crate::errors::{Result, ServingError};

/// Anything that can sit in a batch.
pub trait BatchItem: Prioritized {
    /// Payload handed to the backend.
    fn features(&self) -> &Value;

    /// `Timeout` or `Cancelled` once nobody waits for this item any more.
    fn abandoned(&self) -> Option<ServingError> {
        None
    }
}

impl BatchItem for InferenceRequest {
    fn features(&self) -> &Value {
        &self.features
    }
}

/// One successfully answered item.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedItem {
    /// Backend output.
    pub output: Value,
    /// Backend time attributed to this item.
    pub elapsed_ms: f64,
    /// Answered by the single-item replay.
    pub individual_fallback_used: bool,
}

/// Results of one batch, aligned with its items.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Batch id.
    pub batch_id: String,
    /// One entry per item, in batch order.
    pub results: Vec<Result<ProcessedItem>>,
    /// Wall time of the whole batch.
    pub elapsed_ms: f64,
    /// Whether the single-item replay ran.
    pub fallback_used: bool,
    /// Items skipped by the replay because their caller was gone.
    pub abandoned: usize,
}

impl BatchOutcome {
    /// Items that produced an output.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }
}

/// # Batch Processor
pub struct BatchProcessor {
    backend: Arc<dyn ModelBackend>,
    pool: Arc<WorkerPool>,
}

impl BatchProcessor {
    /// Processor calling `backend` through `pool`.
    pub fn new(backend: Arc<dyn ModelBackend>, pool: Arc<WorkerPool>) -> Self {
        Self { backend, pool }
    }

    /// # Process Batch
    ///
    /// One batched call, falling back to per-item calls on any failure.
    pub async fn process_batch<T: BatchItem>(&self, batch: &mut Batch<T>) -> BatchOutcome {
        let started = Instant::now();
        batch.status = BatchStatus::Processing;
        let features: Vec<Value> = batch.items.iter().map(|i| i.features().clone()).collect();
        let expected = features.len();

        let backend = Arc::clone(&self.backend);
        let call = self
            .pool
            .run(Lane::General, move || backend.predict_batch(&features))
            .await;

        let outcome = match call {
            Ok(Ok(prediction)) if prediction.outputs.len() == expected => {
                let per_item = prediction.elapsed_ms / expected.max(1) as f64;
                let results = prediction
                    .outputs
                    .into_iter()
                    .map(|output| {
                        Ok(ProcessedItem {
                            output,
                            elapsed_ms: per_item,
                            individual_fallback_used: false,
                        })
                    })
                    .collect();
                BatchOutcome {
                    batch_id: batch.id.clone(),
                    results,
                    elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                    fallback_used: false,
                    abandoned: 0,
                }
            }
            Ok(Ok(prediction)) => {
                tracing::warn!(
                    batch_id = %batch.id,
                    expected,
                    got = prediction.outputs.len(),
                    "batch output count mismatch, replaying items"
                );
                self.process_batch_with_fallback(batch, Vec::new()).await
            }
            Ok(Err(BackendError::Partial { completed, message })) => {
                tracing::warn!(batch_id = %batch.id, completed = completed.len(), %message, "partial batch failure");
                self.process_batch_with_fallback(batch, completed).await
            }
            Ok(Err(e)) => {
                tracing::warn!(batch_id = %batch.id, error = %e, "batch call failed, replaying items");
                self.process_batch_with_fallback(batch, Vec::new()).await
            }
            Err(e) => {
                tracing::warn!(batch_id = %batch.id, error = %e, "batch call did not complete, replaying items");
                self.process_batch_with_fallback(batch, Vec::new()).await
            }
        };

        batch.status = if outcome.succeeded() == 0 && expected > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        BatchOutcome {
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            ..outcome
        }
    }

    /// # Process Batch With Fallback
    ///
    /// Sequential single-item calls for every item past the `completed`
    /// prefix. Exactly one result per item; abandoned items are answered
    /// with their abandonment error instead of a backend call.
    pub async fn process_batch_with_fallback<T: BatchItem>(
        &self,
        batch: &Batch<T>,
        completed: Vec<Value>,
    ) -> BatchOutcome {
        let started = Instant::now();
        let mut results: Vec<Result<ProcessedItem>> = Vec::with_capacity(batch.items.len());
        let prefix = completed.len().min(batch.items.len());
        for output in completed.into_iter().take(prefix) {
            results.push(Ok(ProcessedItem {
                output,
                elapsed_ms: 0.0,
                individual_fallback_used: false,
            }));
        }

        let mut abandoned = 0;
        for item in &batch.items[prefix..] {
            if let Some(gone) = item.abandoned() {
                abandoned += 1;
                results.push(Err(gone));
                continue;
            }
            let backend = Arc::clone(&self.backend);
            let features = item.features().clone();
            let call = self.pool.run(Lane::General, move || backend.predict(&features)).await;
            let result = match call {
                Ok(Ok(p)) => Ok(ProcessedItem {
                    output: p.output,
                    elapsed_ms: p.elapsed_ms,
                    individual_fallback_used: true,
                }),
                Ok(Err(e)) => Err(ServingError::from(e)),
                Err(e) => Err(e),
            };
            results.push(result);
        }

        BatchOutcome {
            batch_id: batch.id.clone(),
            results,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            fallback_used: true,
            abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching::former::BatchFormer;
    use crate::batching::queue::PriorityQueueSet;
    use crate::configs::BatchingConfig;
    use crate::testing::ScriptedBackend;
    use crate::core::request::Priority;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Watched {
        request: InferenceRequest,
        gone: Arc<AtomicBool>,
    }

    impl Prioritized for Watched {
        fn priority(&self) -> Priority {
            self.request.priority
        }
    }

    impl BatchItem for Watched {
        fn features(&self) -> &Value {
            &self.request.features
        }

        fn abandoned(&self) -> Option<ServingError> {
            self.gone
                .load(Ordering::Acquire)
                .then(|| ServingError::Cancelled(self.request.id.clone()))
        }
    }

    fn batch_of(n: usize) -> Batch<InferenceRequest> {
        let mut q = PriorityQueueSet::new();
        for i in 0..n {
            q.enqueue(InferenceRequest::new(json!({ "i": i })));
        }
        BatchFormer::new(BatchingConfig::default())
            .form_batch(&mut q, 1.0)
            .expect("non-empty queue")
    }

    fn processor(backend: ScriptedBackend) -> BatchProcessor {
        BatchProcessor::new(
            Arc::new(backend),
            Arc::new(WorkerPool::new(4, 1, Duration::from_secs(2))),
        )
    }

    #[tokio::test]
    async fn successful_batches_are_not_replayed() {
        let p = processor(ScriptedBackend::new());
        let mut batch = batch_of(3);
        let outcome = p.process_batch(&mut batch).await;
        assert!(!outcome.fallback_used);
        assert_eq!(outcome.succeeded(), 3);
        assert_eq!(batch.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn partial_failures_keep_the_completed_prefix() {
        let backend = ScriptedBackend::new();
        backend.set_partial_batches(1);
        let p = processor(backend);
        let mut batch = batch_of(3);
        let outcome = p.process_batch(&mut batch).await;
        assert_eq!(outcome.results.len(), 3);
        let flags: Vec<bool> = outcome
            .results
            .iter()
            .map(|r| r.as_ref().map(|i| i.individual_fallback_used).unwrap_or(false))
            .collect();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[tokio::test]
    async fn replay_skips_items_nobody_waits_for() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_fail_batches(true);
        let p = BatchProcessor::new(
            backend.clone(),
            Arc::new(WorkerPool::new(4, 1, Duration::from_secs(2))),
        );
        let flags: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let mut q = PriorityQueueSet::new();
        for (i, gone) in flags.iter().enumerate() {
            q.enqueue(Watched {
                request: InferenceRequest::new(json!({ "i": i })).with_id(format!("w{i}")),
                gone: Arc::clone(gone),
            });
        }
        let mut batch = BatchFormer::new(BatchingConfig::default())
            .form_batch(&mut q, 1.0)
            .expect("non-empty queue");
        flags[1].store(true, Ordering::Release);
        flags[2].store(true, Ordering::Release);

        let outcome = p.process_batch(&mut batch).await;
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.abandoned, 2);
        assert!(outcome.results[0].is_ok());
        assert!(matches!(&outcome.results[1], Err(ServingError::Cancelled(id)) if id == "w1"));
        assert!(matches!(&outcome.results[2], Err(ServingError::Cancelled(id)) if id == "w2"));
        assert_eq!(backend.single_calls(), 1);
    }
}
