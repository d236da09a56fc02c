use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Lifecycle state of a schedule instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// Generated, waiting for its time and its dependencies.
    Initial,
    /// Claimed by an executor, not yet running.
    Entry,
    /// Currently being executed.
    Run,
    /// Finished successfully.
    End,
    /// Waiting for another attempt after a failure.
    Retry,
    /// Last execution returned an error.
    Failed,
    /// Execution suspended by a pause request.
    Pause,
    /// Execution cancelled by an abort request.
    Abort,
    /// Administratively switched off; satisfies dependents like `End`.
    Disable,
}

impl ScheduleState {
    pub const ALL: [ScheduleState; 9] = [
        ScheduleState::Initial,
        ScheduleState::Entry,
        ScheduleState::Run,
        ScheduleState::End,
        ScheduleState::Retry,
        ScheduleState::Failed,
        ScheduleState::Pause,
        ScheduleState::Abort,
        ScheduleState::Disable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::Initial => "initial",
            ScheduleState::Entry => "entry",
            ScheduleState::Run => "run",
            ScheduleState::End => "end",
            ScheduleState::Retry => "retry",
            ScheduleState::Failed => "failed",
            ScheduleState::Pause => "pause",
            ScheduleState::Abort => "abort",
            ScheduleState::Disable => "disable",
        }
    }

    /// No further execution will happen without an external reset.
    pub const FINISHED: [ScheduleState; 4] = [
        ScheduleState::End,
        ScheduleState::Disable,
        ScheduleState::Failed,
        ScheduleState::Abort,
    ];

    /// States from which an executor may pick the instance up.
    pub const EXECUTABLE: [ScheduleState; 2] = [ScheduleState::Initial, ScheduleState::Retry];

    /// Work in flight. Always blocks dependents.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ScheduleState::Entry | ScheduleState::Run | ScheduleState::Pause
        )
    }

    pub fn is_finished(&self) -> bool {
        Self::FINISHED.contains(self)
    }

}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScheduleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| SchedulerError::UnknownState(s.to_string()))
    }
}

/// Operator override channel, delivered to control listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Initial,
    Pause,
    Resume,
    Abort,
    /// Set when a listener failed to accept the last request.
    Failed,
}

impl ControlState {
    pub const ALL: [ControlState; 5] = [
        ControlState::Initial,
        ControlState::Pause,
        ControlState::Resume,
        ControlState::Abort,
        ControlState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlState::Initial => "initial",
            ControlState::Pause => "pause",
            ControlState::Resume => "resume",
            ControlState::Abort => "abort",
            ControlState::Failed => "failed",
        }
    }

    /// Requests that may still be waiting for listener delivery.
    pub const PENDING: [ControlState; 3] =
        [ControlState::Pause, ControlState::Resume, ControlState::Abort];

    pub fn is_pending_request(&self) -> bool {
        Self::PENDING.contains(self)
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ControlState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| SchedulerError::UnknownState(s.to_string()))
    }
}

/// Secondary diagnostic flag, independent of the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Initial,
    /// The instance is still unfinished past `time + max_delay_time`.
    Timeover,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Initial => "initial",
            CheckState::Timeover => "timeover",
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(CheckState::Initial),
            "timeover" => Ok(CheckState::Timeover),
            other => Err(SchedulerError::UnknownState(other.to_string())),
        }
    }
}

/// Edge to every occurrence of another master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterDependency {
    pub master_id: String,
    /// A failed or aborted predecessor still satisfies the edge.
    #[serde(default)]
    pub ignore_error: bool,
}

impl MasterDependency {
    pub fn new(master_id: impl Into<String>, ignore_error: bool) -> Self {
        Self {
            master_id: master_id.into(),
            ignore_error,
        }
    }
}

/// Edge to every member of a master group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDependency {
    pub master_group_id: String,
    #[serde(default)]
    pub ignore_error: bool,
}

impl GroupDependency {
    pub fn new(master_group_id: impl Into<String>, ignore_error: bool) -> Self {
        Self {
            master_group_id: master_group_id.into(),
            ignore_error,
        }
    }
}

/// Reusable template describing how and when to generate instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleMaster {
    pub id: String,
    pub task_name: String,
    /// Key used to pick the [`ScheduleMaker`](crate::maker::ScheduleMaker).
    pub schedule_type: String,
    #[serde(default)]
    pub input: Option<String>,
    /// First occurrence of the day (defaults to midnight).
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    /// Last allowed occurrence of the day, inclusive.
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    /// Milliseconds between occurrences; `None` or 0 means one per day.
    #[serde(default)]
    pub repeat_interval: Option<i64>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub executor_key: Option<String>,
    #[serde(default)]
    pub executor_type: Option<String>,
    #[serde(default)]
    pub retry_interval: Option<i64>,
    /// Time of day after which no retry is attempted.
    #[serde(default)]
    pub retry_end_time: Option<NaiveTime>,
    /// Milliseconds past `time` before an unfinished instance is flagged; 0 disables.
    #[serde(default)]
    pub max_delay_time: i64,
    /// Master groups this master belongs to.
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub depends: Vec<MasterDependency>,
    #[serde(default)]
    pub depends_on_group: Vec<GroupDependency>,
    /// Master group → groups every member of that group waits for.
    #[serde(default)]
    pub group_depends_on_group: BTreeMap<String, Vec<GroupDependency>>,
}

fn bool_true() -> bool {
    true
}

impl ScheduleMaster {
    /// Minimal enabled master with no dependencies.
    pub fn new(id: impl Into<String>, schedule_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            task_name: id.clone(),
            id,
            schedule_type: schedule_type.into(),
            input: None,
            start_time: None,
            end_time: None,
            repeat_interval: None,
            enabled: true,
            template: false,
            executor_key: None,
            executor_type: None,
            retry_interval: None,
            retry_end_time: None,
            max_delay_time: 0,
            group_ids: Vec::new(),
            depends: Vec::new(),
            depends_on_group: Vec::new(),
            group_depends_on_group: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, master_id: impl Into<String>, ignore_error: bool) -> Self {
        self.depends.push(MasterDependency::new(master_id, ignore_error));
        self
    }

    pub fn depends_on_group(
        mut self,
        master_group_id: impl Into<String>,
        ignore_error: bool,
    ) -> Self {
        self.depends_on_group
            .push(GroupDependency::new(master_group_id, ignore_error));
        self
    }

    pub fn in_group(mut self, master_group_id: impl Into<String>) -> Self {
        self.group_ids.push(master_group_id.into());
        self
    }

    /// Declare that every member of `master_group_id` waits for `depends_group`.
    pub fn group_depends_on(
        mut self,
        master_group_id: impl Into<String>,
        depends_group: impl Into<String>,
        ignore_error: bool,
    ) -> Self {
        self.group_depends_on_group
            .entry(master_group_id.into())
            .or_default()
            .push(GroupDependency::new(depends_group, ignore_error));
        self
    }

    pub fn starting_at(mut self, start: NaiveTime) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn repeating(mut self, interval_ms: i64, end: NaiveTime) -> Self {
        self.repeat_interval = Some(interval_ms);
        self.end_time = Some(end);
        self
    }

    pub fn with_max_delay(mut self, max_delay_ms: i64) -> Self {
        self.max_delay_time = max_delay_ms;
        self
    }

    pub fn with_executor(
        mut self,
        executor_type: Option<&str>,
        executor_key: Option<&str>,
    ) -> Self {
        self.executor_type = executor_type.map(str::to_string);
        self.executor_key = executor_key.map(str::to_string);
        self
    }
}

/// One concrete, time-stamped occurrence derived from a master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Assigned by the generator from the id sequence.
    pub id: String,
    pub master_id: String,
    /// Scheduled fire time.
    pub time: DateTime<Utc>,
    pub task_name: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    /// Original un-retried time; `time` when absent.
    #[serde(default)]
    pub initial_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_interval: Option<i64>,
    #[serde(default)]
    pub retry_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_delay_time: i64,
    pub state: ScheduleState,
    pub control_state: ControlState,
    pub check_state: CheckState,
    #[serde(default)]
    pub executor_key: Option<String>,
    #[serde(default)]
    pub executor_type: Option<String>,
    #[serde(default)]
    pub execute_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execute_end_time: Option<DateTime<Utc>>,
    /// Incremented by exactly one on every persisted mutation.
    #[serde(default)]
    pub row_version: i64,
    #[serde(default)]
    pub depends: Vec<MasterDependency>,
    #[serde(default)]
    pub depends_on_group: Vec<GroupDependency>,
    /// Keyed by this instance's own resolved group id.
    #[serde(default)]
    pub depends_in_group: BTreeMap<String, Vec<MasterDependency>>,
    /// Keyed by this instance's own resolved group id.
    #[serde(default)]
    pub group_depends_on_group: BTreeMap<String, Vec<GroupDependency>>,
    /// Master group → resolved group id for this generation batch.
    #[serde(default)]
    pub group_id_map: BTreeMap<String, String>,
    #[serde(default)]
    pub master_group_ids: Vec<String>,
}

impl Schedule {
    /// Fresh occurrence of `master` at `time`, copying the master's execution
    /// settings. Id and resolved dependencies are filled in by the generator.
    pub fn from_master(master: &ScheduleMaster, time: DateTime<Utc>) -> Self {
        let retry_end_time = master
            .retry_end_time
            .map(|t| time.date_naive().and_time(t).and_utc());
        Self {
            id: String::new(),
            master_id: master.id.clone(),
            time,
            task_name: master.task_name.clone(),
            input: master.input.clone(),
            output: None,
            initial_time: Some(time),
            retry_interval: master.retry_interval,
            retry_end_time,
            max_delay_time: master.max_delay_time,
            state: ScheduleState::Initial,
            control_state: ControlState::Initial,
            check_state: CheckState::Initial,
            executor_key: master.executor_key.clone(),
            executor_type: master.executor_type.clone(),
            execute_start_time: None,
            execute_end_time: None,
            row_version: 0,
            depends: Vec::new(),
            depends_on_group: Vec::new(),
            depends_in_group: BTreeMap::new(),
            group_depends_on_group: BTreeMap::new(),
            group_id_map: BTreeMap::new(),
            master_group_ids: Vec::new(),
        }
    }

    /// `initial_time`, falling back to `time`.
    pub fn effective_initial_time(&self) -> DateTime<Utc> {
        self.initial_time.unwrap_or(self.time)
    }

    /// Calendar date the instance is filed under.
    pub fn date(&self) -> NaiveDate {
        self.time.date_naive()
    }

    pub fn key(&self) -> ScheduleKey {
        ScheduleKey {
            time: self.time,
            id: self.id.clone(),
        }
    }

    /// Resolved group ids this instance belongs to.
    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.group_id_map.values().map(String::as_str)
    }

    pub fn has_dependencies(&self) -> bool {
        !self.depends.is_empty()
            || !self.depends_on_group.is_empty()
            || self.depends_in_group.values().any(|deps| !deps.is_empty())
            || self.group_depends_on_group.values().any(|deps| !deps.is_empty())
    }
}

/// Natural order of schedules: `time` ascending, ties broken by id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScheduleKey {
    pub time: DateTime<Utc>,
    pub id: String,
}
