//! Periodic background sweeps.
//!
//! A [`Sweep`] is one unit of recurring work (deriving readings, checking
//! uptime, pushing a replica). A [`SweepScheduler`] runs it on a fixed
//! cadence on the tokio runtime until stopped. A failing pass is logged and
//! retried on the next tick; it never kills the schedule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::Result;

/// Cadence for folding fresh readings into derived state.
pub const DERIVE_SWEEP_SECS: u64 = 1;
/// Cadence for liveness checks.
pub const UPTIME_SWEEP_SECS: u64 = 30;
/// Cadence for pushing the store to a replica.
pub const REPLICA_SWEEP_SECS: u64 = 300;

/// One unit of recurring background work.
#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run one pass. Errors are logged by the scheduler and the pass is
    /// retried on the next tick.
    async fn run(&self) -> Result<()>;
}

/// Runs a sweep on a fixed interval until stopped.
///
/// Stop is checked between ticks, so an in-flight pass always completes
/// before the task exits.
pub struct SweepScheduler {
    sweep: Arc<dyn Sweep>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    task_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl SweepScheduler {
    pub fn new(sweep: Arc<dyn Sweep>, interval: Duration) -> Self {
        Self {
            sweep,
            interval,
            running: Arc::new(RwLock::new(false)),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the background task. Starting an already running scheduler is
    /// a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            warn!("Sweep scheduler for {} already running", self.sweep.name());
            return Ok(());
        }
        *running = true;
        drop(running);

        let sweep = self.sweep.clone();
        let interval = self.interval;
        let running_flag = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let running = running_flag.read().await;
                if !*running {
                    break;
                }
                drop(running);

                if let Err(e) = sweep.run().await {
                    warn!("Sweep {} failed: {}", sweep.name(), e);
                }
            }
            info!("Sweep {} stopped", sweep.name());
        });

        let mut task_handle = self.task_handle.write().await;
        *task_handle = Some(handle);

        info!(
            "Sweep {} scheduled every {:?}",
            self.sweep.name(),
            self.interval
        );
        Ok(())
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);

        let mut task_handle = self.task_handle.write().await;
        if let Some(handle) = task_handle.take() {
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSweep {
        passes: AtomicUsize,
    }

    #[async_trait]
    impl Sweep for CountingSweep {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self) -> Result<()> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSweep;

    #[async_trait]
    impl Sweep for FailingSweep {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self) -> Result<()> {
            Err(crate::error::Error::Transport("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_scheduler_runs_the_sweep_repeatedly() {
        let sweep = Arc::new(CountingSweep {
            passes: AtomicUsize::new(0),
        });
        let scheduler = SweepScheduler::new(sweep.clone(), Duration::from_millis(10));

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        assert!(sweep.passes.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_stop_halts_the_schedule() {
        let sweep = Arc::new(CountingSweep {
            passes: AtomicUsize::new(0),
        });
        let scheduler = SweepScheduler::new(sweep.clone(), Duration::from_millis(10));

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);

        let settled = sweep.passes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sweep.passes.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn test_a_failing_pass_does_not_kill_the_schedule() {
        let scheduler = SweepScheduler::new(Arc::new(FailingSweep), Duration::from_millis(10));

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.is_running().await);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_is_a_no_op() {
        let sweep = Arc::new(CountingSweep {
            passes: AtomicUsize::new(0),
        });
        let scheduler = SweepScheduler::new(sweep, Duration::from_millis(10));

        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }
}
