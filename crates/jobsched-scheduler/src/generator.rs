//! Materialises schedule instances from masters for one reference date.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result, SchedulerError};
use crate::maker::MakerRegistry;
use crate::repository::Repository;
use crate::sequence::IdGenerator;
use crate::types::{CheckState, ControlState, Schedule, ScheduleMaster, ScheduleState};

pub struct ScheduleGenerator {
    repo: Arc<dyn Repository>,
    ids: Arc<dyn IdGenerator>,
    makers: MakerRegistry,
}

/// Resolved group ids handed out during one `generate` call.
struct BatchGroups<'a> {
    ids: &'a dyn IdGenerator,
    resolved: HashMap<String, String>,
}

impl BatchGroups<'_> {
    fn resolve(&mut self, master_group_id: &str) -> Result<String> {
        if let Some(gid) = self.resolved.get(master_group_id) {
            return Ok(gid.clone());
        }
        let gid = self.ids.next_id()?;
        debug!(master_group_id, group_id = %gid, "group id resolved");
        self.resolved.insert(master_group_id.to_string(), gid.clone());
        Ok(gid)
    }
}

impl ScheduleGenerator {
    pub fn new(
        repo: Arc<dyn Repository>,
        ids: Arc<dyn IdGenerator>,
        makers: MakerRegistry,
    ) -> Self {
        Self { repo, ids, makers }
    }

    pub fn makers(&self) -> &MakerRegistry {
        &self.makers
    }

    /// Make, order and insert the occurrences of every enabled master for `date`.
    ///
    /// Any maker failure aborts before anything is written. A storage failure
    /// part-way through leaves the already inserted instances in place.
    pub fn generate(&self, date: NaiveDate, masters: &[ScheduleMaster]) -> Result<Vec<Schedule>> {
        let mut made: Vec<(Schedule, &ScheduleMaster)> = Vec::new();
        for master in masters.iter().filter(|m| m.enabled) {
            let maker = self
                .makers
                .resolve(&master.schedule_type)
                .ok_or_else(|| SchedulerError::NoMaker {
                    master_id: master.id.clone(),
                    schedule_type: master.schedule_type.clone(),
                })?;

            // The maker only ever sees a copy; stored templates stay untouched.
            let copy = master.clone();
            let occurrences = maker.make(date, &copy).map_err(|e| match e.kind() {
                ErrorKind::Manage => SchedulerError::make_storage(&master.id, e),
                _ => e,
            })?;
            made.extend(occurrences.into_iter().map(|s| (s, master)));
        }

        made.sort_by(|(a, am), (b, bm)| a.time.cmp(&b.time).then_with(|| am.id.cmp(&bm.id)));

        let by_id: HashMap<&str, &ScheduleMaster> =
            masters.iter().map(|m| (m.id.as_str(), m)).collect();
        let mut groups = BatchGroups {
            ids: self.ids.as_ref(),
            resolved: HashMap::new(),
        };

        let mut inserted = Vec::with_capacity(made.len());
        for (occurrence, master) in made {
            let schedule = match self.prepare(occurrence, master, &by_id, &mut groups) {
                Ok(s) => s,
                Err(e) => {
                    warn!(%date, inserted = inserted.len(), error = %e, "generation aborted");
                    return Err(e);
                }
            };
            if let Err(e) = self.repo.insert_schedule(&schedule) {
                warn!(%date, inserted = inserted.len(), error = %e, "generation aborted");
                return Err(e);
            }
            inserted.push(schedule);
        }

        info!(%date, count = inserted.len(), groups = groups.resolved.len(), "schedules generated");
        Ok(inserted)
    }

    /// Generate from every registered master unless `date` already has instances.
    ///
    /// Returns `None` when generation was skipped.
    pub fn generate_if_absent(&self, date: NaiveDate) -> Result<Option<Vec<Schedule>>> {
        let existing = self.repo.count_schedules_by_date(date)?;
        if existing > 0 {
            info!(%date, existing, "schedules already present, skipping generation");
            return Ok(None);
        }
        let masters = self.repo.list_masters()?;
        self.generate(date, &masters).map(Some)
    }

    /// Assign the id, reset lifecycle fields and derive the instance's edges.
    fn prepare(
        &self,
        mut s: Schedule,
        master: &ScheduleMaster,
        by_id: &HashMap<&str, &ScheduleMaster>,
        groups: &mut BatchGroups<'_>,
    ) -> Result<Schedule> {
        s.id = self.ids.next_id()?;
        s.master_id = master.id.clone();
        s.initial_time.get_or_insert(s.time);
        s.state = ScheduleState::Initial;
        s.control_state = ControlState::Initial;
        s.check_state = CheckState::Initial;
        s.row_version = 0;

        s.master_group_ids = master.group_ids.clone();
        s.group_id_map.clear();
        for master_group in &master.group_ids {
            let gid = groups.resolve(master_group)?;
            s.group_id_map.insert(master_group.clone(), gid);
        }

        s.depends.clear();
        s.depends_in_group.clear();
        for dep in &master.depends {
            let target_groups = match by_id.get(dep.master_id.as_str()) {
                Some(target) => target.group_ids.clone(),
                None => self
                    .repo
                    .find_master(&dep.master_id)?
                    .map(|m| m.group_ids)
                    .unwrap_or_default(),
            };
            let shared = master
                .group_ids
                .iter()
                .find(|g| target_groups.contains(g))
                .and_then(|g| s.group_id_map.get(g));
            match shared {
                Some(gid) => s
                    .depends_in_group
                    .entry(gid.clone())
                    .or_default()
                    .push(dep.clone()),
                None => s.depends.push(dep.clone()),
            }
        }

        s.depends_on_group = master.depends_on_group.clone();

        s.group_depends_on_group.clear();
        for (master_group, deps) in &master.group_depends_on_group {
            match s.group_id_map.get(master_group) {
                Some(gid) => s
                    .group_depends_on_group
                    .entry(gid.clone())
                    .or_default()
                    .extend(deps.iter().cloned()),
                None => debug!(
                    master_id = %master.id,
                    master_group = %master_group,
                    "group dependency keyed by a foreign group, ignored"
                ),
            }
        }

        Ok(s)
    }
}
