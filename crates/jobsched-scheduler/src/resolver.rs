//! Dependency eligibility: may an instance run now, given its predecessors?
//!
//! Every edge kind reduces to a set of predecessor occurrences, which is then
//! filtered by the relevance rule (`initial_time` not after the requester's),
//! collapsed to one canonical occurrence per `(master, initial_time)` slot,
//! and checked state by state with [`is_satisfied`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace};

use crate::error::Result;
use crate::query::ScheduleQuery;
use crate::repository::Repository;
use crate::types::{Schedule, ScheduleState};

/// Whether a predecessor in `state` lets a dependent proceed.
///
/// Work in flight always blocks. Failed and aborted predecessors satisfy only
/// edges flagged `ignore_error`.
pub fn is_satisfied(state: ScheduleState, ignore_error: bool) -> bool {
    match state {
        s if s.is_in_flight() => false,
        ScheduleState::Failed | ScheduleState::Abort => ignore_error,
        s => s.is_finished(),
    }
}

/// Keep only the smallest-id occurrence per `(master, initial_time)`.
fn canonical(occurrences: Vec<Schedule>) -> Vec<Schedule> {
    let mut slots: BTreeMap<(String, DateTime<Utc>), Schedule> = BTreeMap::new();
    for s in occurrences {
        let slot = (s.master_id.clone(), s.effective_initial_time());
        match slots.get(&slot) {
            Some(kept) if kept.id <= s.id => {}
            _ => {
                slots.insert(slot, s);
            }
        }
    }
    slots.into_values().collect()
}

pub struct DependencyResolver {
    repo: Arc<dyn Repository>,
}

impl DependencyResolver {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// True when every edge of `s` is satisfied.
    pub fn is_eligible(&self, s: &Schedule) -> Result<bool> {
        if !s.has_dependencies() {
            return Ok(true);
        }
        let point = s.effective_initial_time();

        for dep in &s.depends {
            let query = ScheduleQuery::new().master(&dep.master_id).initial_up_to(point);
            if !self.all_satisfied(s, &query, None, dep.ignore_error)? {
                trace!(schedule_id = %s.id, depends_on = %dep.master_id, "blocked by master");
                return Ok(false);
            }
        }

        for dep in &s.depends_on_group {
            let query = ScheduleQuery::new()
                .master_group(&dep.master_group_id)
                .initial_up_to(point);
            if !self.all_satisfied(s, &query, None, dep.ignore_error)? {
                trace!(schedule_id = %s.id, depends_on = %dep.master_group_id, "blocked by group");
                return Ok(false);
            }
        }

        for (gid, deps) in &s.depends_in_group {
            for dep in deps {
                let query = ScheduleQuery::new()
                    .group(gid)
                    .master(&dep.master_id)
                    .initial_up_to(point);
                if !self.all_satisfied(s, &query, None, dep.ignore_error)? {
                    trace!(
                        schedule_id = %s.id,
                        group_id = %gid,
                        depends_on = %dep.master_id,
                        "blocked in group"
                    );
                    return Ok(false);
                }
            }
        }

        for (gid, deps) in &s.group_depends_on_group {
            if deps.is_empty() {
                continue;
            }
            // The whole resolved group waits until its earliest member could start.
            let earliest = self
                .repo
                .find_schedules_by_group(gid)?
                .iter()
                .map(Schedule::effective_initial_time)
                .min()
                .unwrap_or(point);
            for dep in deps {
                let query = ScheduleQuery::new()
                    .master_group(&dep.master_group_id)
                    .initial_up_to(earliest);
                if !self.all_satisfied(s, &query, Some(gid), dep.ignore_error)? {
                    trace!(
                        schedule_id = %s.id,
                        group_id = %gid,
                        depends_on = %dep.master_group_id,
                        "blocked by group on group"
                    );
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Canonical predecessors matched by `query`, minus `s` itself and, for
    /// group-on-group edges, minus the members of the depending group.
    fn all_satisfied(
        &self,
        s: &Schedule,
        query: &ScheduleQuery,
        own_group: Option<&String>,
        ignore_error: bool,
    ) -> Result<bool> {
        let predecessors = canonical(self.repo.find_schedules(query)?);
        Ok(predecessors
            .iter()
            .filter(|o| o.id != s.id)
            .filter(|o| own_group.map_or(true, |gid| !o.group_ids().any(|g| g == gid)))
            .all(|o| is_satisfied(o.state, ignore_error)))
    }

    /// Instances an executor may start at `now`, in natural order.
    ///
    /// Keeps `initial`/`retry` instances due by `now` whose executor key is
    /// unset or equal to `executor_key` and whose executor type is unset or
    /// listed in `executor_types`, then drops those with unmet dependencies.
    #[instrument(skip(self, executor_types), fields(types = executor_types.len()))]
    pub fn find_executable_schedules(
        &self,
        now: DateTime<Utc>,
        executor_types: &[String],
        executor_key: Option<&str>,
    ) -> Result<Vec<Schedule>> {
        let query = ScheduleQuery::new()
            .in_states(&ScheduleState::EXECUTABLE)
            .up_to(now);

        let mut executable = Vec::new();
        for s in self.repo.find_schedules(&query)? {
            if s.executor_key.as_deref().is_some_and(|k| Some(k) != executor_key) {
                continue;
            }
            if s
                .executor_type
                .as_ref()
                .is_some_and(|t| !executor_types.contains(t))
            {
                continue;
            }
            if self.is_eligible(&s)? {
                executable.push(s);
            }
        }
        debug!(count = executable.len(), "executable schedules found");
        Ok(executable)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::memory::MemoryRepository;
    use crate::types::ScheduleMaster;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, h, 0, 0).unwrap()
    }

    fn instance(id: &str, master: &ScheduleMaster, hour: u32, state: ScheduleState) -> Schedule {
        let mut s = Schedule::from_master(master, at(hour));
        s.id = id.into();
        s.state = state;
        s
    }

    #[test]
    fn satisfaction_table() {
        for ignore in [false, true] {
            assert!(!is_satisfied(ScheduleState::Run, ignore));
            assert!(!is_satisfied(ScheduleState::Entry, ignore));
            assert!(!is_satisfied(ScheduleState::Pause, ignore));
            assert!(!is_satisfied(ScheduleState::Initial, ignore));
            assert!(is_satisfied(ScheduleState::End, ignore));
            assert!(is_satisfied(ScheduleState::Disable, ignore));
        }
        assert!(!is_satisfied(ScheduleState::Failed, false));
        assert!(is_satisfied(ScheduleState::Failed, true));
        assert!(!is_satisfied(ScheduleState::Abort, false));
        assert!(is_satisfied(ScheduleState::Abort, true));
    }

    #[test]
    fn canonical_keeps_smallest_id_per_slot() {
        let a = ScheduleMaster::new("a", "once");
        let kept = canonical(vec![
            instance("0003", &a, 9, ScheduleState::Run),
            instance("0002", &a, 9, ScheduleState::End),
            instance("0004", &a, 10, ScheduleState::Run),
        ]);
        let ids: Vec<_> = kept.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["0002", "0004"]);
    }

    #[test]
    fn later_cycles_are_not_predecessors() {
        let repo = Arc::new(MemoryRepository::new());
        let a = ScheduleMaster::new("a", "once");
        repo.insert_schedule(&instance("0001", &a, 8, ScheduleState::End)).unwrap();
        repo.insert_schedule(&instance("0002", &a, 12, ScheduleState::Run)).unwrap();

        let b = ScheduleMaster::new("b", "once");
        let mut dependent = instance("0003", &b, 10, ScheduleState::Initial);
        dependent.depends.push(crate::types::MasterDependency::new("a", false));
        repo.insert_schedule(&dependent).unwrap();

        let resolver = DependencyResolver::new(repo);
        assert!(resolver.is_eligible(&dependent).unwrap());
    }

    #[test]
    fn self_dependency_ignores_the_requester() {
        let repo = Arc::new(MemoryRepository::new());
        let a = ScheduleMaster::new("a", "once").depends_on("a", false);
        let mut s = instance("0001", &a, 9, ScheduleState::Initial);
        s.depends = a.depends.clone();
        repo.insert_schedule(&s).unwrap();

        let resolver = DependencyResolver::new(repo);
        assert!(resolver.is_eligible(&s).unwrap());
    }

    #[test]
    fn executor_constraints_filter_candidates() {
        let repo = Arc::new(MemoryRepository::new());
        let keyed = ScheduleMaster::new("k", "once").with_executor(Some("shell"), Some("node-1"));
        let free = ScheduleMaster::new("f", "once");
        repo.insert_schedule(&instance("0001", &keyed, 9, ScheduleState::Initial)).unwrap();
        repo.insert_schedule(&instance("0002", &free, 9, ScheduleState::Retry)).unwrap();
        repo.insert_schedule(&instance("0003", &free, 11, ScheduleState::Initial)).unwrap();

        let resolver = DependencyResolver::new(repo);
        let ids = |types: &[String], key| -> Vec<String> {
            resolver
                .find_executable_schedules(at(10), types, key)
                .unwrap()
                .into_iter()
                .map(|s| s.id)
                .collect()
        };

        assert_eq!(ids(&["shell".to_string()], Some("node-1")), ["0001", "0002"]);
        assert_eq!(ids(&["shell".to_string()], Some("node-2")), ["0002"]);
        assert_eq!(ids(&[], Some("node-1")), ["0002"]);
    }
}
