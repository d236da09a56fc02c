//! Storage façade for masters and schedule instances.

use chrono::NaiveDate;

use crate::error::Result;
use crate::query::{Expectation, SchedulePatch, ScheduleQuery};
use crate::types::{Schedule, ScheduleMaster, ScheduleState};

/// Storage contract used by the generator, resolver, mutator and daemons.
///
/// Every adapter must:
/// - return schedules in natural order (`time`, then id);
/// - update all of its indexes together with the primary collection, so a
///   concurrent reader sees either the whole insert/remove or none of it;
/// - hand out owned copies, never references into its own state.
pub trait Repository: Send + Sync {
    /// Register a master, replacing any master with the same id.
    fn insert_master(&self, master: &ScheduleMaster) -> Result<()>;

    fn find_master(&self, id: &str) -> Result<Option<ScheduleMaster>>;

    /// All registered masters ordered by id.
    fn list_masters(&self) -> Result<Vec<ScheduleMaster>>;

    /// Returns `false` if no master had that id.
    fn remove_master(&self, id: &str) -> Result<bool>;

    /// Persist a new instance together with its group memberships.
    fn insert_schedule(&self, schedule: &Schedule) -> Result<()>;

    fn find_schedule(&self, id: &str) -> Result<Option<Schedule>>;

    fn find_schedules(&self, query: &ScheduleQuery) -> Result<Vec<Schedule>>;

    /// Conditional write: applies `patch` (bumping `row_version` by one) only
    /// when the stored row still satisfies `expect`. Returns whether a row
    /// was written; `false` means another writer got there first.
    fn update_schedule(
        &self,
        id: &str,
        expect: &Expectation,
        patch: &SchedulePatch,
    ) -> Result<bool>;

    /// Returns `false` if no instance had that id.
    fn remove_schedule(&self, id: &str) -> Result<bool>;

    /// Remove every instance matching `query`; returns how many went.
    fn remove_schedules(&self, query: &ScheduleQuery) -> Result<usize>;

    fn count_schedules(&self, query: &ScheduleQuery) -> Result<usize> {
        Ok(self.find_schedules(query)?.len())
    }

    fn find_schedules_by_master(&self, master_id: &str) -> Result<Vec<Schedule>> {
        self.find_schedules(&ScheduleQuery::new().master(master_id))
    }

    /// Members of a resolved group.
    fn find_schedules_by_group(&self, group_id: &str) -> Result<Vec<Schedule>> {
        self.find_schedules(&ScheduleQuery::new().group(group_id))
    }

    /// Members of a master group across all batches.
    fn find_schedules_by_master_group(&self, master_group_id: &str) -> Result<Vec<Schedule>> {
        self.find_schedules(&ScheduleQuery::new().master_group(master_group_id))
    }

    fn find_schedules_by_date(&self, date: NaiveDate) -> Result<Vec<Schedule>> {
        self.find_schedules(&ScheduleQuery::new().on_date(date))
    }

    fn find_schedules_by_state(&self, states: &[ScheduleState]) -> Result<Vec<Schedule>> {
        self.find_schedules(&ScheduleQuery::new().in_states(states))
    }

    fn count_schedules_by_date(&self, date: NaiveDate) -> Result<usize> {
        self.count_schedules(&ScheduleQuery::new().on_date(date))
    }

    fn remove_schedules_by_master(&self, master_id: &str) -> Result<usize> {
        self.remove_schedules(&ScheduleQuery::new().master(master_id))
    }

    fn remove_schedules_by_date(&self, date: NaiveDate) -> Result<usize> {
        self.remove_schedules(&ScheduleQuery::new().on_date(date))
    }
}
