use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use serving_core::utils::stats::percentile;
use serving_core::{
    init_logging, load_config, BackendCapabilities, BackendError, BatchPrediction, InferenceRequest, ModelBackend,
    Prediction, Priority, ServingEngine, TrainingMetrics,
};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Drive a serving engine with synthetic load", long_about = None)]
struct Args {
    /// Test duration in seconds
    #[clap(short, long, default_value_t = 30)]
    duration_secs: u64,

    /// Concurrent clients
    #[clap(short, long, default_value_t = 32)]
    concurrency: usize,

    /// Synthetic backend latency per call in milliseconds
    #[clap(short = 'l', long, default_value_t = 4)]
    backend_latency_ms: u64,

    /// Fraction of backend calls that fail
    #[clap(short, long, default_value_t = 0.0)]
    failure_rate: f64,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 5)]
    report_interval_secs: u64,

    /// Optional JSON5 engine configuration
    #[clap(long, env = "SERVING_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Directory for rollback records
    #[clap(long, default_value = "./target/throughput_rollback")]
    rollback_dir: PathBuf,
}

/// Backend with a fixed per-call latency and a random failure rate.
struct SyntheticBackend {
    latency: Duration,
    failure_rate: f64,
}

impl SyntheticBackend {
    fn fails(&self) -> bool {
        self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate
    }

    fn score(features: &Value) -> Value {
        let x = features.get("x").and_then(Value::as_f64).unwrap_or(0.0);
        json!({ "score": (x * 0.37).sin().abs() })
    }
}

impl ModelBackend for SyntheticBackend {
    fn predict(&self, features: &Value) -> Result<Prediction, BackendError> {
        std::thread::sleep(self.latency);
        if self.fails() {
            return Err(BackendError::Failed("synthetic failure".into()));
        }
        Ok(Prediction {
            output: Self::score(features),
            elapsed_ms: self.latency.as_secs_f64() * 1000.0,
        })
    }

    fn predict_batch(&self, features: &[Value]) -> Result<BatchPrediction, BackendError> {
        // A batch costs one call plus a third of a call per extra item.
        let cost = self.latency.mul_f64(1.0 + features.len().saturating_sub(1) as f64 / 3.0);
        std::thread::sleep(cost);
        if self.fails() {
            return Err(BackendError::Failed("synthetic batch failure".into()));
        }
        Ok(BatchPrediction {
            outputs: features.iter().map(Self::score).collect(),
            elapsed_ms: cost.as_secs_f64() * 1000.0,
        })
    }

    fn train(&self, _data: &Value, intensity: f64) -> Result<TrainingMetrics, BackendError> {
        Ok(TrainingMetrics {
            loss: 0.1 / intensity.max(0.1),
            accuracy: None,
            duration_ms: 0.0,
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            batch_support: true,
            gpu: false,
        }
    }
}

#[derive(Default)]
struct Totals {
    ok: AtomicU64,
    failed: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
}

const LATENCY_WINDOW: usize = 50_000;

impl Totals {
    fn record(&self, latency_ms: f64, ok: bool) {
        if ok {
            self.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut l = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if l.len() == LATENCY_WINDOW {
            l.pop_front();
        }
        l.push_back(latency_ms);
    }
}

fn random_priority() -> Priority {
    match rand::random_range(0..100) {
        0..=4 => Priority::Critical,
        5..=24 => Priority::High,
        25..=84 => Priority::Normal,
        _ => Priority::Low,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("loading engine configuration")?;
    config.rollback.storage_dir = args.rollback_dir.clone();
    let _logging = init_logging(&config.logging).context("initialising logging")?;

    let backend = Arc::new(SyntheticBackend {
        latency: Duration::from_millis(args.backend_latency_ms),
        failure_rate: args.failure_rate.clamp(0.0, 1.0),
    });
    let engine = Arc::new(ServingEngine::start(config, backend).await?);
    let totals = Arc::new(Totals::default());
    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration_secs);

    let reporter = {
        let (engine, totals) = (Arc::clone(&engine), Arc::clone(&totals));
        let every = Duration::from_secs(args.report_interval_secs.max(1));
        tokio::spawn(async move {
            let mut last_ok = 0;
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let ok = totals.ok.load(Ordering::Relaxed);
                let latencies: Vec<f64> = totals
                    .latencies
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .copied()
                    .collect();
                let stats = engine.stats();
                let p = |q| percentile(&latencies, q).unwrap_or(0.0);

                println!("\n----- {}s Summary -----", every.as_secs());
                println!("Throughput: {:.1} req/s", (ok - last_ok) as f64 / every.as_secs_f64());
                println!(
                    "Latency: p50 {:.2}ms, p95 {:.2}ms, p99 {:.2}ms",
                    p(50.0),
                    p(95.0),
                    p(99.0)
                );
                println!(
                    "Failed: {}, timed out: {}, rejected: {}",
                    totals.failed.load(Ordering::Relaxed),
                    stats.timed_out,
                    stats.rejected
                );
                println!("Strategies: {:?}", stats.by_strategy);
                println!("Priorities: {:?}", stats.by_priority);
                println!(
                    "Batch target: {}, queue depth: {}, throttle: {:.2}",
                    stats.batch_target, stats.queue_depth, stats.throttle_level
                );
                println!(
                    "Degradation: {} ({:?}), rollbacks: {}",
                    stats.degradation_level, stats.service_mode, stats.rollbacks
                );
                println!("---------------------------");
                last_ok = ok;
            }
        })
    };

    println!(
        "Running {} clients for {}s against a {}ms backend...",
        args.concurrency, args.duration_secs, args.backend_latency_ms
    );
    let clients: Vec<_> = (0..args.concurrency)
        .map(|_| {
            let (engine, totals) = (Arc::clone(&engine), Arc::clone(&totals));
            tokio::spawn(async move {
                while Instant::now() < deadline {
                    let priority = random_priority();
                    let urgency = if priority == Priority::Critical { 0.95 } else { rand::random::<f64>() * 0.5 };
                    let request = InferenceRequest::new(json!({ "x": rand::random::<f64>() * 100.0 }))
                        .with_priority(priority)
                        .with_urgency(urgency)
                        .with_complexity(rand::random::<f64>());
                    let t = Instant::now();
                    let outcome = engine.submit(request).await;
                    totals.record(t.elapsed().as_secs_f64() * 1000.0, outcome.is_ok());
                }
            })
        })
        .collect();
    for client in clients {
        client.await.context("client task panicked")?;
    }
    reporter.abort();

    let elapsed = started.elapsed().as_secs_f64();
    let ok = totals.ok.load(Ordering::Relaxed);
    println!(
        "\nDone: {} ok, {} failed in {:.1}s ({:.1} req/s)",
        ok,
        totals.failed.load(Ordering::Relaxed),
        elapsed,
        ok as f64 / elapsed
    );
    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    engine.close().await;
    Ok(())
}
