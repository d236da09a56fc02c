//! Cancellable periodic runner shared by the monitoring daemons.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::Result;

/// One unit of periodic work.
pub trait DaemonTask: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run one iteration. Errors are logged and the loop carries on.
    fn run_once(&mut self) -> Result<()>;
}

/// Control side of a spawned daemon.
pub struct DaemonHandle {
    name: &'static str,
    active: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn resume(&self) {
        if !self.active.send_replace(true) {
            info!(daemon = self.name, "daemon resumed");
        }
    }

    pub fn suspend(&self) {
        if self.active.send_replace(false) {
            info!(daemon = self.name, "daemon suspended");
        }
    }

    /// Resumed and the loop is still alive.
    pub fn is_active(&self) -> bool {
        *self.active.borrow() && !self.task.is_finished()
    }

    /// Stop the loop and wait for the task to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            error!(daemon = self.name, "daemon task panicked: {e}");
        }
    }
}

/// Spawn `task` on the tokio runtime, ticking every `every`. The daemon
/// starts suspended; call [`DaemonHandle::resume`] to let it run.
pub fn spawn_daemon<T: DaemonTask>(mut task: T, every: Duration) -> DaemonHandle {
    let name = task.name();
    let (active_tx, mut active) = watch::channel(false);
    let (shutdown_tx, mut shutdown) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(daemon = name, interval_ms = every.as_millis() as u64, "daemon started");
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if !*active.borrow_and_update() {
                tokio::select! {
                    changed = active.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Start a fresh period so the first pass runs right away.
                        interval.reset_immediately();
                        continue;
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = interval.tick() => {
                    if !*active.borrow() {
                        continue;
                    }
                    debug!(daemon = name, "daemon pass");
                    if let Err(e) = task.run_once() {
                        error!(daemon = name, code = e.code(), "daemon pass failed: {e}");
                    }
                }
                changed = active.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(daemon = name, "daemon stopped");
    });

    DaemonHandle {
        name,
        active: active_tx,
        shutdown: shutdown_tx,
        task: handle,
    }
}
