use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::init_db;
use crate::error::{poison_err, Result, SchedulerError};
use crate::query::{Expectation, SchedulePatch, ScheduleQuery};
use crate::repository::Repository;
use crate::types::{GroupDependency, MasterDependency, Schedule, ScheduleMaster};

const SCHEDULE_COLUMNS: &str = "id, master_id, time, initial_time, task_name, input, output,
     retry_interval, retry_end_time, max_delay_time, state, control_state, check_state,
     executor_key, executor_type, execute_start_time, execute_end_time, row_version,
     dependencies";

/// Resolved edges and group memberships, stored as one JSON column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DependencyColumn {
    #[serde(default)]
    depends: Vec<MasterDependency>,
    #[serde(default)]
    depends_on_group: Vec<GroupDependency>,
    #[serde(default)]
    depends_in_group: BTreeMap<String, Vec<MasterDependency>>,
    #[serde(default)]
    group_depends_on_group: BTreeMap<String, Vec<GroupDependency>>,
    #[serde(default)]
    group_id_map: BTreeMap<String, String>,
    #[serde(default)]
    master_group_ids: Vec<String>,
}

/// Raw column values, converted to a [`Schedule`] outside the rusqlite closure
/// so conversion failures surface as [`SchedulerError`]s.
struct ScheduleRow {
    id: String,
    master_id: String,
    time: i64,
    initial_time: i64,
    task_name: String,
    input: Option<String>,
    output: Option<String>,
    retry_interval: Option<i64>,
    retry_end_time: Option<i64>,
    max_delay_time: i64,
    state: String,
    control_state: String,
    check_state: String,
    executor_key: Option<String>,
    executor_type: Option<String>,
    execute_start_time: Option<i64>,
    execute_end_time: Option<i64>,
    row_version: i64,
    dependencies: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        master_id: row.get(1)?,
        time: row.get(2)?,
        initial_time: row.get(3)?,
        task_name: row.get(4)?,
        input: row.get(5)?,
        output: row.get(6)?,
        retry_interval: row.get(7)?,
        retry_end_time: row.get(8)?,
        max_delay_time: row.get(9)?,
        state: row.get(10)?,
        control_state: row.get(11)?,
        check_state: row.get(12)?,
        executor_key: row.get(13)?,
        executor_type: row.get(14)?,
        execute_start_time: row.get(15)?,
        execute_end_time: row.get(16)?,
        row_version: row.get(17)?,
        dependencies: row.get(18)?,
    })
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SchedulerError::Storage(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = SchedulerError;

    fn try_from(row: ScheduleRow) -> Result<Self> {
        let deps: DependencyColumn = serde_json::from_str(&row.dependencies)?;
        Ok(Schedule {
            id: row.id,
            master_id: row.master_id,
            time: from_millis(row.time)?,
            task_name: row.task_name,
            input: row.input,
            output: row.output,
            initial_time: Some(from_millis(row.initial_time)?),
            retry_interval: row.retry_interval,
            retry_end_time: opt_from_millis(row.retry_end_time)?,
            max_delay_time: row.max_delay_time,
            state: row.state.parse()?,
            control_state: row.control_state.parse()?,
            check_state: row.check_state.parse()?,
            executor_key: row.executor_key,
            executor_type: row.executor_type,
            execute_start_time: opt_from_millis(row.execute_start_time)?,
            execute_end_time: opt_from_millis(row.execute_end_time)?,
            row_version: row.row_version,
            depends: deps.depends,
            depends_on_group: deps.depends_on_group,
            depends_in_group: deps.depends_in_group,
            group_depends_on_group: deps.group_depends_on_group,
            group_id_map: deps.group_id_map,
            master_group_ids: deps.master_group_ids,
        })
    }
}

fn dependency_json(s: &Schedule) -> Result<String> {
    let column = DependencyColumn {
        depends: s.depends.clone(),
        depends_on_group: s.depends_on_group.clone(),
        depends_in_group: s.depends_in_group.clone(),
        group_depends_on_group: s.group_depends_on_group.clone(),
        group_id_map: s.group_id_map.clone(),
        master_group_ids: s.master_group_ids.clone(),
    };
    Ok(serde_json::to_string(&column)?)
}

/// Translate the indexable parts of a query into SQL. Everything else is
/// re-checked with [`ScheduleQuery::matches`] after the fetch.
fn where_clause(query: &ScheduleQuery) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(master_id) = &query.master_id {
        args.push(Box::new(master_id.clone()));
        clauses.push(format!("master_id = ?{}", args.len()));
    }
    if let Some(group) = &query.group_id {
        args.push(Box::new(group.clone()));
        clauses.push(format!(
            "id IN (SELECT schedule_id FROM schedule_groups WHERE group_id = ?{})",
            args.len()
        ));
    }
    if let Some(master_group) = &query.master_group_id {
        args.push(Box::new(master_group.clone()));
        clauses.push(format!(
            "id IN (SELECT schedule_id FROM schedule_groups WHERE master_group_id = ?{})",
            args.len()
        ));
    }
    if let Some(date) = &query.date {
        args.push(Box::new(date.to_string()));
        clauses.push(format!("schedule_date = ?{}", args.len()));
    }
    if let Some(t) = query.time_to {
        args.push(Box::new(to_millis(t)));
        clauses.push(format!("time <= ?{}", args.len()));
    }
    if let Some(t) = query.time_before {
        args.push(Box::new(to_millis(t)));
        clauses.push(format!("time < ?{}", args.len()));
    }
    if let Some(t) = query.initial_time_to {
        args.push(Box::new(to_millis(t)));
        clauses.push(format!("initial_time <= ?{}", args.len()));
    }
    if !query.states.is_empty() {
        let mut placeholders = Vec::with_capacity(query.states.len());
        for state in &query.states {
            args.push(Box::new(state.as_str()));
            placeholders.push(format!("?{}", args.len()));
        }
        clauses.push(format!("state IN ({})", placeholders.join(", ")));
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (sql, args)
}

fn select_schedules(conn: &Connection, query: &ScheduleQuery) -> Result<Vec<Schedule>> {
    let (filter, args) = where_clause(query);
    let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules {filter} ORDER BY time, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), read_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let schedule = Schedule::try_from(row)?;
        if query.matches(&schedule) {
            out.push(schedule);
        }
    }
    Ok(out)
}

fn select_schedule(conn: &Connection, id: &str) -> Result<Option<Schedule>> {
    let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1");
    let row = conn.query_row(&sql, [id], read_row).optional()?;
    row.map(Schedule::try_from).transpose()
}

fn delete_schedule(tx: &Transaction<'_>, id: &str) -> Result<bool> {
    tx.execute("DELETE FROM schedule_groups WHERE schedule_id = ?1", [id])?;
    let n = tx.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
    Ok(n > 0)
}

/// Relational [`Repository`] on a single SQLite connection.
///
/// The connection sits behind a `Mutex`; every compound write (instance plus
/// group rows, read-check-write updates) runs in one transaction while the
/// lock is held. Conditional updates still carry `row_version` in their
/// `WHERE` clause so writers in other processes sharing the file are caught.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fresh private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

impl Repository for SqliteRepository {
    fn insert_master(&self, master: &ScheduleMaster) -> Result<()> {
        let body = serde_json::to_string(master)?;
        let conn = self.conn.lock().map_err(poison_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO schedule_masters (id, schedule_type, enabled, body)
             VALUES (?1, ?2, ?3, ?4)",
            params![master.id, master.schedule_type, master.enabled, body],
        )?;
        debug!(master_id = %master.id, "master registered");
        Ok(())
    }

    fn find_master(&self, id: &str) -> Result<Option<ScheduleMaster>> {
        let conn = self.conn.lock().map_err(poison_err)?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM schedule_masters WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn list_masters(&self) -> Result<Vec<ScheduleMaster>> {
        let conn = self.conn.lock().map_err(poison_err)?;
        let mut stmt = conn.prepare("SELECT body FROM schedule_masters ORDER BY id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(SchedulerError::from))
            .collect()
    }

    fn remove_master(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(poison_err)?;
        let n = conn.execute("DELETE FROM schedule_masters WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id))]
    fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let deps = dependency_json(schedule)?;
        let mut conn = self.conn.lock().map_err(poison_err)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO schedules
             (id, master_id, time, schedule_date, initial_time, task_name, input, output,
              retry_interval, retry_end_time, max_delay_time, state, control_state,
              check_state, executor_key, executor_type, execute_start_time,
              execute_end_time, row_version, dependencies)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
            params![
                schedule.id,
                schedule.master_id,
                to_millis(schedule.time),
                schedule.date().to_string(),
                to_millis(schedule.effective_initial_time()),
                schedule.task_name,
                schedule.input,
                schedule.output,
                schedule.retry_interval,
                schedule.retry_end_time.map(to_millis),
                schedule.max_delay_time,
                schedule.state.as_str(),
                schedule.control_state.as_str(),
                schedule.check_state.as_str(),
                schedule.executor_key,
                schedule.executor_type,
                schedule.execute_start_time.map(to_millis),
                schedule.execute_end_time.map(to_millis),
                schedule.row_version,
                deps,
            ],
        )?;
        for (master_group, group) in &schedule.group_id_map {
            tx.execute(
                "INSERT INTO schedule_groups (schedule_id, master_group_id, group_id)
                 VALUES (?1, ?2, ?3)",
                params![schedule.id, master_group, group],
            )?;
        }
        // Memberships without a resolved group still need the master-group index.
        for master_group in &schedule.master_group_ids {
            if !schedule.group_id_map.contains_key(master_group) {
                tx.execute(
                    "INSERT INTO schedule_groups (schedule_id, master_group_id, group_id)
                     VALUES (?1, ?2, '')",
                    params![schedule.id, master_group],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn find_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.conn.lock().map_err(poison_err)?;
        select_schedule(&conn, id)
    }

    fn find_schedules(&self, query: &ScheduleQuery) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().map_err(poison_err)?;
        select_schedules(&conn, query)
    }

    fn update_schedule(
        &self,
        id: &str,
        expect: &Expectation,
        patch: &SchedulePatch,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().map_err(poison_err)?;
        let tx = conn.transaction()?;
        let Some(mut schedule) = select_schedule(&tx, id)? else {
            return Ok(false);
        };
        if !expect.matches(&schedule) {
            return Ok(false);
        }
        patch.apply(&mut schedule);

        let n = tx.execute(
            "UPDATE schedules
             SET state = ?1, control_state = ?2, check_state = ?3, output = ?4,
                 executor_key = ?5, retry_end_time = ?6, max_delay_time = ?7,
                 execute_start_time = ?8, execute_end_time = ?9,
                 row_version = row_version + 1
             WHERE id = ?10 AND row_version = ?11",
            params![
                schedule.state.as_str(),
                schedule.control_state.as_str(),
                schedule.check_state.as_str(),
                schedule.output,
                schedule.executor_key,
                schedule.retry_end_time.map(to_millis),
                schedule.max_delay_time,
                schedule.execute_start_time.map(to_millis),
                schedule.execute_end_time.map(to_millis),
                id,
                expect.row_version,
            ],
        )?;
        tx.commit()?;
        Ok(n == 1)
    }

    fn remove_schedule(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().map_err(poison_err)?;
        let tx = conn.transaction()?;
        let removed = delete_schedule(&tx, id)?;
        tx.commit()?;
        Ok(removed)
    }

    fn remove_schedules(&self, query: &ScheduleQuery) -> Result<usize> {
        let mut conn = self.conn.lock().map_err(poison_err)?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = select_schedules(&tx, query)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        for id in &ids {
            delete_schedule(&tx, id)?;
        }
        tx.commit()?;
        debug!(count = ids.len(), "schedules removed");
        Ok(ids.len())
    }
}
