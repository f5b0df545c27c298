// ABOUTME: Background sweep reconciling sandboxes past their deadline
// ABOUTME: Periodically marks expired records terminated and drops records past retention

use crate::manager::SandboxManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

struct SweepTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// Expiry monitor for sandboxes
pub struct ExpiryMonitor {
    manager: Arc<SandboxManager>,
    interval: Duration,
    task: Mutex<Option<SweepTask>>,
    sweeps: Arc<AtomicU64>,
}

impl ExpiryMonitor {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let interval = manager.settings().monitor_interval();
        Self::with_interval(manager, interval)
    }

    pub fn with_interval(manager: Arc<SandboxManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            task: Mutex::new(None),
            sweeps: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the sweep task; a second call while running is a no-op
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let manager = self.manager.clone();
        let sweeps = self.sweeps.clone();
        let shutdown = Arc::new(Notify::new());
        let stop_signal = shutdown.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            info!(interval = ?interval, "Expiry monitor started");

            loop {
                let expired = manager.sweep_expired().await;
                sweeps.fetch_add(1, Ordering::Relaxed);
                if expired > 0 {
                    info!(expired, "Terminated expired sandboxes");
                } else {
                    debug!("No expired sandboxes");
                }

                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = time::sleep(interval) => {}
                }
            }

            info!("Expiry monitor stopped");
        });

        *task = Some(SweepTask { handle, shutdown });
    }

    /// Stop the sweep task and wait for its current iteration to finish
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(SweepTask { handle, shutdown }) = task.take() else {
            return;
        };

        // A stored permit wakes the loop even if it is mid-sweep
        shutdown.notify_one();
        if let Err(e) = handle.await {
            warn!("Expiry monitor task ended abnormally: {}", e);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Sweeps completed since construction
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}
