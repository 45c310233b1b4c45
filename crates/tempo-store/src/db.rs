use rusqlite::Connection;

use crate::error::Result;

/// Initialise the timetable schema in `conn`.
///
/// One job table per granularity, the unit of work table with its natural
/// key enforced by a UNIQUE constraint, and the freerun entry table.
pub fn init_db(conn: &Connection) -> Result<()> {
    let mut ddl = String::new();
    for table in ["job_hourly", "job_daily", "job_monthly", "job_yearly"] {
        ddl.push_str(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                process_name          TEXT    NOT NULL,
                timeperiod            TEXT    NOT NULL,
                state                 TEXT    NOT NULL,
                related_unit_of_work  INTEGER,
                number_of_failures    INTEGER NOT NULL DEFAULT 0,
                event_log             TEXT    NOT NULL DEFAULT '[]',   -- JSON array, newest first
                UNIQUE (process_name, timeperiod)
            ) STRICT;

            CREATE INDEX IF NOT EXISTS idx_{table}_timeperiod ON {table} (timeperiod);
            "
        ));
    }
    ddl.push_str(
        "
        CREATE TABLE IF NOT EXISTS unit_of_work (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            process_name       TEXT    NOT NULL,
            timeperiod         TEXT    NOT NULL,
            start_timeperiod   TEXT    NOT NULL,
            end_timeperiod     TEXT    NOT NULL,
            start_id           TEXT    NOT NULL,
            end_id             TEXT    NOT NULL,
            source             TEXT,
            sink               TEXT,
            arguments          TEXT    NOT NULL DEFAULT '{}',   -- JSON object
            state              TEXT    NOT NULL,
            created_at         TEXT    NOT NULL,                -- RFC 3339
            submitted_at       TEXT,
            started_at         TEXT,
            finished_at        TEXT,
            number_of_retries  INTEGER NOT NULL DEFAULT 0,
            uow_type           TEXT    NOT NULL,
            UNIQUE (process_name, timeperiod, start_id, end_id)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_unit_of_work_created_at ON unit_of_work (created_at);

        CREATE TABLE IF NOT EXISTS freerun_entry (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            process_name          TEXT    NOT NULL,
            entry_name            TEXT    NOT NULL,
            arguments             TEXT    NOT NULL DEFAULT '{}',
            related_unit_of_work  INTEGER,
            event_log             TEXT    NOT NULL DEFAULT '[]',
            UNIQUE (process_name, entry_name)
        ) STRICT;
        ",
    );
    conn.execute_batch(&ddl)?;
    Ok(())
}
