//! State machine transitions with optimistic concurrency.
//!
//! Every operation reads the instance, checks its guard, then writes through
//! [`Repository::update_schedule`] conditioned on the `row_version` it read
//! (plus the guarded field). `Ok(false)` means the guard did not hold or
//! another writer changed the row in between; nothing was written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument};

use crate::error::{Result, SchedulerError};
use crate::listener::ControlListeners;
use crate::query::{Expectation, SchedulePatch};
use crate::repository::Repository;
use crate::types::{CheckState, ControlState, Schedule, ScheduleState};

/// Attempts at forcing `control_state = failed` against concurrent writers.
const FORCE_FAILED_ATTEMPTS: usize = 3;

/// Timestamp side effects of entering `state`.
fn timestamp_patch(state: ScheduleState, now: DateTime<Utc>, patch: &mut SchedulePatch) {
    match state {
        ScheduleState::Run => patch.execute_start_time = Some(Some(now)),
        ScheduleState::End | ScheduleState::Failed | ScheduleState::Abort => {
            patch.execute_end_time = Some(Some(now))
        }
        ScheduleState::Initial | ScheduleState::Entry => {
            patch.execute_start_time = Some(None);
            patch.execute_end_time = Some(None);
        }
        ScheduleState::Retry | ScheduleState::Pause | ScheduleState::Disable => {}
    }
}

/// Whether a control request may follow `current` while the instance is in `state`.
fn control_allowed(current: ControlState, target: ControlState, state: ScheduleState) -> bool {
    match target {
        ControlState::Pause => {
            state == ScheduleState::Run
                && matches!(
                    current,
                    ControlState::Initial | ControlState::Resume | ControlState::Failed
                )
        }
        ControlState::Abort => state == ScheduleState::Run && current != ControlState::Abort,
        ControlState::Resume => state == ScheduleState::Pause && current == ControlState::Pause,
        ControlState::Initial | ControlState::Failed => false,
    }
}

pub struct StateMutator {
    repo: Arc<dyn Repository>,
    listeners: Arc<ControlListeners>,
}

impl StateMutator {
    pub fn new(repo: Arc<dyn Repository>, listeners: Arc<ControlListeners>) -> Self {
        Self { repo, listeners }
    }

    fn load(&self, id: &str) -> Result<Schedule> {
        self.repo
            .find_schedule(id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
    }

    /// Move `id` to `state`. Returns `false` when it already is in `state`
    /// or a concurrent writer won.
    pub fn change_state(&self, id: &str, state: ScheduleState) -> Result<bool> {
        let current = self.load(id)?;
        self.transition(&current, current.state, state)
    }

    /// [`change_state`](Self::change_state) from a textual state code.
    pub fn change_state_code(&self, id: &str, code: &str) -> Result<bool> {
        let state: ScheduleState = code.parse()?;
        self.change_state(id, state)
    }

    /// Move `id` to `state` only if it is currently in `expected`.
    pub fn compare_and_set_state(
        &self,
        id: &str,
        expected: ScheduleState,
        state: ScheduleState,
    ) -> Result<bool> {
        let current = self.load(id)?;
        if current.state != expected {
            return Ok(false);
        }
        self.transition(&current, expected, state)
    }

    fn transition(
        &self,
        current: &Schedule,
        expected: ScheduleState,
        state: ScheduleState,
    ) -> Result<bool> {
        if expected == state {
            return Ok(false);
        }
        let mut patch = SchedulePatch {
            state: Some(state),
            ..SchedulePatch::default()
        };
        timestamp_patch(state, Utc::now(), &mut patch);
        let expect = Expectation::version(current.row_version).state(expected);
        let written = self.repo.update_schedule(&current.id, &expect, &patch)?;
        if written {
            debug!(schedule_id = %current.id, from = %expected, to = %state, "state changed");
        }
        Ok(written)
    }

    /// Request pause, resume or abort of running work and notify listeners.
    ///
    /// A listener failure forces `control_state = failed` and is returned as
    /// [`SchedulerError::Listener`].
    #[instrument(skip(self), fields(schedule_id = %id))]
    pub fn change_control_state(&self, id: &str, target: ControlState) -> Result<bool> {
        if matches!(target, ControlState::Initial | ControlState::Failed) {
            return Err(SchedulerError::IllegalTransition {
                id: id.to_string(),
                target: target.to_string(),
            });
        }

        let current = self.load(id)?;
        if current.control_state == target
            || !control_allowed(current.control_state, target, current.state)
        {
            debug!(
                control_state = %current.control_state,
                state = %current.state,
                %target,
                "control request not applicable"
            );
            return Ok(false);
        }

        let expect = Expectation::version(current.row_version)
            .state(current.state)
            .control_state(current.control_state);
        let patch = SchedulePatch {
            control_state: Some(target),
            ..SchedulePatch::default()
        };
        if !self.repo.update_schedule(id, &expect, &patch)? {
            return Ok(false);
        }
        info!(%target, "control state requested");

        if let Err(e) = self.listeners.notify(id, target) {
            return Err(self.listener_failed(id, e));
        }
        Ok(true)
    }

    /// Re-deliver the current control request of `schedule` to every listener.
    /// Used by the control-state daemon.
    pub(crate) fn redeliver(&self, schedule: &Schedule) -> Result<()> {
        if !schedule.control_state.is_pending_request() {
            return Ok(());
        }
        if let Err(e) = self.listeners.notify(&schedule.id, schedule.control_state) {
            return Err(self.listener_failed(&schedule.id, e));
        }
        Ok(())
    }

    /// Mark `id` failed after a listener rejected its request. The listener
    /// error is what the caller sees; a storage error on the way is logged.
    fn listener_failed(&self, id: &str, listener_err: SchedulerError) -> SchedulerError {
        if let Err(e) = self.force_failed(id) {
            error!(schedule_id = %id, code = e.code(), "marking control state failed: {e}");
        }
        listener_err
    }

    /// Overwrite `control_state` with `failed`, retrying on version conflicts.
    fn force_failed(&self, id: &str) -> Result<()> {
        for _ in 0..FORCE_FAILED_ATTEMPTS {
            let current = self.load(id)?;
            if current.control_state == ControlState::Failed {
                return Ok(());
            }
            let patch = SchedulePatch {
                control_state: Some(ControlState::Failed),
                ..SchedulePatch::default()
            };
            if self
                .repo
                .update_schedule(id, &Expectation::version(current.row_version), &patch)?
            {
                return Ok(());
            }
        }
        error!(schedule_id = %id, "could not mark control state failed");
        Ok(())
    }

    /// Conditionally move `check_state` from `expected` to `state`.
    pub fn change_check_state(
        &self,
        id: &str,
        expected: CheckState,
        state: CheckState,
    ) -> Result<bool> {
        let current = self.load(id)?;
        if current.check_state != expected || expected == state {
            return Ok(false);
        }
        let expect = Expectation::version(current.row_version).check_state(expected);
        let patch = SchedulePatch {
            check_state: Some(state),
            ..SchedulePatch::default()
        };
        self.repo.update_schedule(id, &expect, &patch)
    }

    pub fn set_output(&self, id: &str, output: Option<String>) -> Result<bool> {
        self.patch(id, SchedulePatch {
            output: Some(output),
            ..SchedulePatch::default()
        })
    }

    pub fn set_executor_key(&self, id: &str, executor_key: Option<String>) -> Result<bool> {
        self.patch(id, SchedulePatch {
            executor_key: Some(executor_key),
            ..SchedulePatch::default()
        })
    }

    pub fn set_retry_end_time(
        &self,
        id: &str,
        retry_end_time: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.patch(id, SchedulePatch {
            retry_end_time: Some(retry_end_time),
            ..SchedulePatch::default()
        })
    }

    pub fn set_max_delay_time(&self, id: &str, max_delay_time: i64) -> Result<bool> {
        self.patch(id, SchedulePatch {
            max_delay_time: Some(max_delay_time),
            ..SchedulePatch::default()
        })
    }

    /// Version-conditioned write of a field patch.
    fn patch(&self, id: &str, patch: SchedulePatch) -> Result<bool> {
        let current = self.load(id)?;
        self.repo
            .update_schedule(id, &Expectation::version(current.row_version), &patch)
    }
}
