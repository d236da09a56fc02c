use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedule_masters`, `schedules` and `schedule_groups` tables
/// (idempotent). Times are stored as UTC epoch milliseconds so range scans
/// and `ORDER BY time, id` follow the natural order exactly.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedule_masters (
            id             TEXT    NOT NULL PRIMARY KEY,
            schedule_type  TEXT    NOT NULL,
            enabled        INTEGER NOT NULL,
            body           TEXT    NOT NULL    -- JSON-encoded ScheduleMaster
        ) STRICT;

        CREATE TABLE IF NOT EXISTS schedules (
            id                  TEXT    NOT NULL PRIMARY KEY,
            master_id           TEXT    NOT NULL,
            time                INTEGER NOT NULL,
            schedule_date       TEXT    NOT NULL,   -- YYYY-MM-DD of `time`
            initial_time        INTEGER NOT NULL,
            task_name           TEXT    NOT NULL,
            input               TEXT,
            output              TEXT,
            retry_interval      INTEGER,
            retry_end_time      INTEGER,
            max_delay_time      INTEGER NOT NULL DEFAULT 0,
            state               TEXT    NOT NULL,
            control_state       TEXT    NOT NULL,
            check_state         TEXT    NOT NULL,
            executor_key        TEXT,
            executor_type       TEXT,
            execute_start_time  INTEGER,
            execute_end_time    INTEGER,
            row_version         INTEGER NOT NULL DEFAULT 0,
            dependencies        TEXT    NOT NULL    -- JSON-encoded resolved edges
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedules_time   ON schedules (time, id);
        CREATE INDEX IF NOT EXISTS idx_schedules_master ON schedules (master_id, initial_time);
        CREATE INDEX IF NOT EXISTS idx_schedules_date   ON schedules (schedule_date);
        CREATE INDEX IF NOT EXISTS idx_schedules_state  ON schedules (state, control_state);

        -- One row per (instance, master group) so group lookups stay indexed.
        CREATE TABLE IF NOT EXISTS schedule_groups (
            schedule_id      TEXT NOT NULL,
            master_group_id  TEXT NOT NULL,
            group_id         TEXT NOT NULL,
            PRIMARY KEY (schedule_id, master_group_id)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedule_groups_group
            ON schedule_groups (group_id);
        CREATE INDEX IF NOT EXISTS idx_schedule_groups_master_group
            ON schedule_groups (master_group_id);
        ",
    )?;
    Ok(())
}
