use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use serving_core::configs::{GcConfig, ResourceLimits, ThrottleConfig};
use serving_core::testing::ScriptedProbe;
use serving_core::{HardwareSample, ResourceManager, ServingError};

const LIMIT_MB: f64 = 64.0;

fn manager() -> Arc<ResourceManager> {
    Arc::new(ResourceManager::new(
        ResourceLimits {
            memory_limit_mb: LIMIT_MB,
            cache_capacity_mb: 8.0,
            ..ResourceLimits::default()
        },
        GcConfig::default(),
        ThrottleConfig::default(),
        Arc::new(ScriptedProbe::new(HardwareSample::nominal())),
    ))
}

#[test]
fn concurrent_grants_never_exceed_the_limit() {
    let rm = manager();
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let outstanding = Arc::new(Mutex::new(0.0_f64));
    let peak = Arc::new(Mutex::new(0.0_f64));
    let denied = Arc::new(AtomicU64::new(0));

    let workers: Vec<_> = (0..threads)
        .map(|i| {
            let (rm, barrier) = (Arc::clone(&rm), Arc::clone(&barrier));
            let (outstanding, peak, denied) = (Arc::clone(&outstanding), Arc::clone(&peak), Arc::clone(&denied));
            thread::spawn(move || {
                barrier.wait();
                for round in 0..200 {
                    let mb = 1.0 + ((i + round) % 7) as f64;
                    match rm.allocate_for_operation("inference", mb, 0) {
                        Ok(guard) => {
                            {
                                let mut o = outstanding.lock().expect("lock");
                                *o += mb;
                                let mut p = peak.lock().expect("lock");
                                *p = p.max(*o);
                            }
                            assert!(rm.stats().reserved_mb <= LIMIT_MB + 1e-9);
                            thread::yield_now();
                            *outstanding.lock().expect("lock") -= mb;
                            drop(guard);
                        }
                        Err(ServingError::ResourceExhausted { .. }) => {
                            denied.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().expect("worker panicked");
    }

    assert!(*peak.lock().expect("lock") <= LIMIT_MB + 1e-9);
    let stats = rm.stats();
    assert_eq!(stats.active_allocations, 0);
    assert!(stats.reserved_mb.abs() < 1e-6);
    assert_eq!(stats.denied_allocations, denied.load(Ordering::Relaxed));
}

#[test]
fn negative_estimates_are_rejected() {
    let rm = manager();
    assert!(matches!(
        rm.allocate_for_operation("inference", -1.0, 0),
        Err(ServingError::Validation(_))
    ));
}

#[test]
fn light_degradation_stretches_resource_sampling() {
    use serving_core::configs::DegradationConfig;
    use serving_core::degradation::policy::MONITORING_FREQUENCY;
    use serving_core::{DegradationController, DegradationLevel};

    let rm = manager();
    let controller = DegradationController::new(DegradationConfig::default());
    let nominal = rm.sampling_interval(controller.reduction_factor(MONITORING_FREQUENCY));
    assert_eq!(nominal, rm.sampling_interval(1.0));

    controller
        .force_escalate(DegradationLevel::Light, "test")
        .expect("escalated");
    let light = rm.sampling_interval(controller.reduction_factor(MONITORING_FREQUENCY));
    assert!(light > nominal);
    assert_eq!(light, nominal * 2);
}
