//! Filter, precondition and patch types shared by every repository adapter.
//!
//! Adapters may use their indexes (or SQL) to narrow the candidate set, but
//! the final decision always goes through [`ScheduleQuery::matches`] and
//! [`Expectation::matches`] so both backends answer identically.

use chrono::{DateTime, NaiveDate, Utc};

use crate::types::{CheckState, ControlState, Schedule, ScheduleState};

/// Conjunctive filter over schedule instances. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleQuery {
    pub master_id: Option<String>,
    /// Resolved group id.
    pub group_id: Option<String>,
    pub master_group_id: Option<String>,
    pub date: Option<NaiveDate>,
    /// Inclusive upper bound on `time`.
    pub time_to: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `time`.
    pub time_before: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the effective initial time.
    pub initial_time_to: Option<DateTime<Utc>>,
    pub states: Vec<ScheduleState>,
    pub excluded_states: Vec<ScheduleState>,
    pub control_states: Vec<ControlState>,
    pub excluded_check_state: Option<CheckState>,
    /// Only instances with `max_delay_time > 0`.
    pub with_max_delay: bool,
}

impl ScheduleQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn master(mut self, master_id: impl Into<String>) -> Self {
        self.master_id = Some(master_id.into());
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn master_group(mut self, master_group_id: impl Into<String>) -> Self {
        self.master_group_id = Some(master_group_id.into());
        self
    }

    pub fn on_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn up_to(mut self, time: DateTime<Utc>) -> Self {
        self.time_to = Some(time);
        self
    }

    pub fn before(mut self, time: DateTime<Utc>) -> Self {
        self.time_before = Some(time);
        self
    }

    pub fn initial_up_to(mut self, time: DateTime<Utc>) -> Self {
        self.initial_time_to = Some(time);
        self
    }

    pub fn in_states(mut self, states: &[ScheduleState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn not_in_states(mut self, states: &[ScheduleState]) -> Self {
        self.excluded_states = states.to_vec();
        self
    }

    pub fn in_control_states(mut self, states: &[ControlState]) -> Self {
        self.control_states = states.to_vec();
        self
    }

    pub fn check_state_not(mut self, state: CheckState) -> Self {
        self.excluded_check_state = Some(state);
        self
    }

    pub fn with_max_delay(mut self) -> Self {
        self.with_max_delay = true;
        self
    }

    pub fn matches(&self, s: &Schedule) -> bool {
        if self.master_id.as_ref().is_some_and(|m| *m != s.master_id) {
            return false;
        }
        if let Some(group) = &self.group_id {
            if !s.group_ids().any(|g| g == group) {
                return false;
            }
        }
        if let Some(master_group) = &self.master_group_id {
            if !s.master_group_ids.iter().any(|g| g == master_group) {
                return false;
            }
        }
        if self.date.is_some_and(|d| d != s.date()) {
            return false;
        }
        if self.time_to.is_some_and(|t| s.time > t) {
            return false;
        }
        if self.time_before.is_some_and(|t| s.time >= t) {
            return false;
        }
        if self
            .initial_time_to
            .is_some_and(|t| s.effective_initial_time() > t)
        {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&s.state) {
            return false;
        }
        if self.excluded_states.contains(&s.state) {
            return false;
        }
        if !self.control_states.is_empty() && !self.control_states.contains(&s.control_state) {
            return false;
        }
        if self.excluded_check_state == Some(s.check_state) {
            return false;
        }
        if self.with_max_delay && s.max_delay_time <= 0 {
            return false;
        }
        true
    }
}

/// Preconditions of a conditional write. `row_version` is always checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub row_version: i64,
    pub state: Option<ScheduleState>,
    pub control_state: Option<ControlState>,
    pub check_state: Option<CheckState>,
}

impl Expectation {
    /// Expect only the given row version; add field checks with the builders.
    pub fn version(row_version: i64) -> Self {
        Self {
            row_version,
            state: None,
            control_state: None,
            check_state: None,
        }
    }

    pub fn state(mut self, state: ScheduleState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn control_state(mut self, state: ControlState) -> Self {
        self.control_state = Some(state);
        self
    }

    pub fn check_state(mut self, state: CheckState) -> Self {
        self.check_state = Some(state);
        self
    }

    pub fn matches(&self, s: &Schedule) -> bool {
        s.row_version == self.row_version
            && self.state.map_or(true, |st| st == s.state)
            && self.control_state.map_or(true, |st| st == s.control_state)
            && self.check_state.map_or(true, |st| st == s.check_state)
    }
}

/// Changes to the mutable fields of an instance. `None` leaves a field alone;
/// `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePatch {
    pub state: Option<ScheduleState>,
    pub control_state: Option<ControlState>,
    pub check_state: Option<CheckState>,
    pub output: Option<Option<String>>,
    pub executor_key: Option<Option<String>>,
    pub retry_end_time: Option<Option<DateTime<Utc>>>,
    pub max_delay_time: Option<i64>,
    pub execute_start_time: Option<Option<DateTime<Utc>>>,
    pub execute_end_time: Option<Option<DateTime<Utc>>>,
}

impl SchedulePatch {
    /// Apply the patch and bump `row_version` by one.
    pub fn apply(&self, s: &mut Schedule) {
        if let Some(state) = self.state {
            s.state = state;
        }
        if let Some(state) = self.control_state {
            s.control_state = state;
        }
        if let Some(state) = self.check_state {
            s.check_state = state;
        }
        if let Some(output) = &self.output {
            s.output = output.clone();
        }
        if let Some(key) = &self.executor_key {
            s.executor_key = key.clone();
        }
        if let Some(t) = self.retry_end_time {
            s.retry_end_time = t;
        }
        if let Some(delay) = self.max_delay_time {
            s.max_delay_time = delay;
        }
        if let Some(t) = self.execute_start_time {
            s.execute_start_time = t;
        }
        if let Some(t) = self.execute_end_time {
            s.execute_end_time = t;
        }
        s.row_version += 1;
    }
}
