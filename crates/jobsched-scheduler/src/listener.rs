use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{poison_err, Result, SchedulerError};
use crate::types::ControlState;

/// Receives control-state requests (pause, resume, abort) for running work.
///
/// Called synchronously from the mutator and from the control-state daemon,
/// so implementations should hand the request off rather than block.
pub trait ScheduleControlListener: Send + Sync {
    /// Stable name for log lines.
    fn name(&self) -> &str;

    /// An `Err` marks delivery as failed; the instance's control state is
    /// then forced to `failed`.
    fn on_control_state_changed(
        &self,
        schedule_id: &str,
        control_state: ControlState,
    ) -> std::result::Result<(), String>;
}

/// Registration-ordered set of control listeners.
///
/// The number of registered listeners is also published on a `watch`
/// channel so the monitor can wake the control-state daemon.
pub struct ControlListeners {
    listeners: RwLock<Vec<Arc<dyn ScheduleControlListener>>>,
    count: watch::Sender<usize>,
}

impl ControlListeners {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            listeners: RwLock::new(Vec::new()),
            count,
        }
    }

    pub fn register(&self, listener: Arc<dyn ScheduleControlListener>) -> Result<()> {
        let mut listeners = self.listeners.write().map_err(poison_err)?;
        debug!(listener = listener.name(), "control listener registered");
        listeners.push(listener);
        self.count.send_replace(listeners.len());
        Ok(())
    }

    /// Remove every listener with that name. Returns whether any was removed.
    pub fn unregister(&self, name: &str) -> Result<bool> {
        let mut listeners = self.listeners.write().map_err(poison_err)?;
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        self.count.send_replace(listeners.len());
        Ok(listeners.len() < before)
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the listener count.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Notify every listener in registration order, stopping at the first
    /// failure.
    pub fn notify(&self, schedule_id: &str, control_state: ControlState) -> Result<()> {
        // Snapshot so a listener may register others without deadlocking.
        let snapshot: Vec<_> = self.listeners.read().map_err(poison_err)?.clone();
        for listener in snapshot {
            if let Err(reason) = listener.on_control_state_changed(schedule_id, control_state) {
                warn!(
                    listener = listener.name(),
                    schedule_id,
                    %control_state,
                    reason = %reason,
                    "control listener failed"
                );
                return Err(SchedulerError::Listener {
                    id: schedule_id.to_string(),
                    reason: format!("{}: {reason}", listener.name()),
                });
            }
        }
        Ok(())
    }
}

impl Default for ControlListeners {
    fn default() -> Self {
        Self::new()
    }
}
