//! In-process indexed [`Repository`].
//!
//! All collections live behind a single `RwLock`, so an insert or remove
//! updates the primary map and every index as one step. Indexes hold
//! [`ScheduleKey`]s in `BTreeSet`s, which keeps every lookup in natural order
//! without a separate sort.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::RwLock;

use chrono::NaiveDate;
use tracing::debug;

use crate::error::{poison_err, Result, SchedulerError};
use crate::query::{Expectation, SchedulePatch, ScheduleQuery};
use crate::repository::Repository;
use crate::types::{Schedule, ScheduleKey, ScheduleMaster};

#[derive(Debug, Default)]
struct MemoryState {
    masters: BTreeMap<String, ScheduleMaster>,
    schedules: HashMap<String, Schedule>,
    by_time: BTreeSet<ScheduleKey>,
    by_date: HashMap<NaiveDate, BTreeSet<ScheduleKey>>,
    by_master: HashMap<String, BTreeSet<ScheduleKey>>,
    /// Resolved group id → members.
    by_group: HashMap<String, BTreeSet<ScheduleKey>>,
    by_master_group: HashMap<String, BTreeSet<ScheduleKey>>,
}

fn index_insert<K: Eq + Hash>(
    index: &mut HashMap<K, BTreeSet<ScheduleKey>>,
    k: K,
    key: &ScheduleKey,
) {
    index.entry(k).or_default().insert(key.clone());
}

fn index_remove<K: Eq + Hash>(
    index: &mut HashMap<K, BTreeSet<ScheduleKey>>,
    k: &K,
    key: &ScheduleKey,
) {
    if let Some(set) = index.get_mut(k) {
        set.remove(key);
        if set.is_empty() {
            index.remove(k);
        }
    }
}

type KeyIter<'a> = Box<dyn Iterator<Item = &'a ScheduleKey> + 'a>;

impl MemoryState {
    fn insert(&mut self, schedule: Schedule) {
        let key = schedule.key();
        self.by_time.insert(key.clone());
        index_insert(&mut self.by_date, schedule.date(), &key);
        index_insert(&mut self.by_master, schedule.master_id.clone(), &key);
        for group in schedule.group_ids() {
            index_insert(&mut self.by_group, group.to_string(), &key);
        }
        for master_group in &schedule.master_group_ids {
            index_insert(&mut self.by_master_group, master_group.clone(), &key);
        }
        self.schedules.insert(schedule.id.clone(), schedule);
    }

    fn remove(&mut self, id: &str) -> Option<Schedule> {
        let schedule = self.schedules.remove(id)?;
        let key = schedule.key();
        self.by_time.remove(&key);
        index_remove(&mut self.by_date, &schedule.date(), &key);
        index_remove(&mut self.by_master, &schedule.master_id, &key);
        for group in schedule.group_ids() {
            index_remove(&mut self.by_group, &group.to_string(), &key);
        }
        for master_group in &schedule.master_group_ids {
            index_remove(&mut self.by_master_group, master_group, &key);
        }
        Some(schedule)
    }

    /// Smallest index that covers the query, in natural order.
    fn candidates<'a>(&'a self, query: &ScheduleQuery) -> KeyIter<'a> {
        fn from_set(set: Option<&BTreeSet<ScheduleKey>>) -> KeyIter<'_> {
            match set {
                Some(set) => Box::new(set.iter()),
                None => Box::new(std::iter::empty()),
            }
        }

        if let Some(master_id) = &query.master_id {
            from_set(self.by_master.get(master_id))
        } else if let Some(group) = &query.group_id {
            from_set(self.by_group.get(group))
        } else if let Some(master_group) = &query.master_group_id {
            from_set(self.by_master_group.get(master_group))
        } else if let Some(date) = &query.date {
            from_set(self.by_date.get(date))
        } else {
            Box::new(self.by_time.iter())
        }
    }

    fn query(&self, query: &ScheduleQuery) -> Vec<&Schedule> {
        self.candidates(query)
            .filter_map(|key| self.schedules.get(&key.id))
            .filter(|s| query.matches(s))
            .collect()
    }
}

/// Arena-style indexed store owned entirely by this struct.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn insert_master(&self, master: &ScheduleMaster) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.masters.insert(master.id.clone(), master.clone());
        debug!(master_id = %master.id, "master registered");
        Ok(())
    }

    fn find_master(&self, id: &str) -> Result<Option<ScheduleMaster>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.masters.get(id).cloned())
    }

    fn list_masters(&self) -> Result<Vec<ScheduleMaster>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.masters.values().cloned().collect())
    }

    fn remove_master(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.masters.remove(id).is_some())
    }

    fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.schedules.contains_key(&schedule.id) {
            return Err(SchedulerError::Storage(format!(
                "duplicate schedule id: {}",
                schedule.id
            )));
        }
        // Stored with the effective value so both adapters read back alike.
        let mut stored = schedule.clone();
        stored.initial_time = Some(stored.effective_initial_time());
        state.insert(stored);
        Ok(())
    }

    fn find_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.schedules.get(id).cloned())
    }

    fn find_schedules(&self, query: &ScheduleQuery) -> Result<Vec<Schedule>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.query(query).into_iter().cloned().collect())
    }

    fn count_schedules(&self, query: &ScheduleQuery) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.query(query).len())
    }

    fn update_schedule(
        &self,
        id: &str,
        expect: &Expectation,
        patch: &SchedulePatch,
    ) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        // Patches never touch time, ids or groups, so indexes stay valid.
        match state.schedules.get_mut(id) {
            Some(schedule) if expect.matches(schedule) => {
                patch.apply(schedule);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_schedule(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.remove(id).is_some())
    }

    fn remove_schedules(&self, query: &ScheduleQuery) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let ids: Vec<String> = state.query(query).into_iter().map(|s| s.id.clone()).collect();
        for id in &ids {
            state.remove(id);
        }
        debug!(count = ids.len(), "schedules removed");
        Ok(ids.len())
    }
}
