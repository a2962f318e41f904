use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A background loop running one job per tick.
///
/// Each iteration is awaited before the next tick is taken and missed ticks
/// are skipped, so iterations never overlap. `stop` lets the in-flight
/// iteration finish before returning.
pub struct PeriodicTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    iterations: Arc<AtomicU64>,
}

impl PeriodicTask {
    /// Spawn the loop. The first iteration runs one `period` after start.
    /// Periods below `MIN_PERIOD` are raised to it.
    pub fn start<F>(name: &'static str, period: Duration, job: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let iterations = Arc::new(AtomicU64::new(0));
        let counter = iterations.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the first tick which fires immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        debug!("{}: running iteration", name);
                        job().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("{}: loop exited", name);
        });

        info!("{}: started (every {:?})", name, period);
        Self {
            name,
            shutdown_tx,
            handle,
            iterations,
        }
    }

    /// Completed iterations so far.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Signal the loop and wait for the in-flight iteration to drain.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!("{}: task ended abnormally: {}", self.name, e);
        }
        info!("{}: stopped", self.name);
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("iterations", &self.iterations())
            .finish()
    }
}
