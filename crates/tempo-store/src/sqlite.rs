use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, instrument};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::{FreerunEntry, Job, JobCollection, UnitOfWork};

/// [`Store`] over a single SQLite connection.
///
/// The connection sits behind a `Mutex`; the timetable already serializes
/// its decisions, so contention here is limited to worker status updates.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap an already-open connection and make sure the schema exists.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=500;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

const JOB_COLUMNS: &str =
    "id, process_name, timeperiod, state, related_unit_of_work, number_of_failures, event_log";

const UOW_COLUMNS: &str = "id, process_name, timeperiod, start_timeperiod, end_timeperiod,
     start_id, end_id, source, sink, arguments, state, created_at, submitted_at,
     started_at, finished_at, number_of_retries, uow_type";

const FREERUN_COLUMNS: &str =
    "id, process_name, entry_name, arguments, related_unit_of_work, event_log";

impl Store for SqliteStore {
    fn get_job(
        &self,
        collection: JobCollection,
        process_name: &str,
        timeperiod: &str,
    ) -> Result<Job> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE process_name = ?1 AND timeperiod = ?2",
            collection.table()
        );
        db.query_row(&sql, params![process_name, timeperiod], row_to_job)
            .optional()?
            .ok_or_else(|| StoreError::not_found("job", format!("{process_name}@{timeperiod}")))
    }

    fn get_jobs(&self, collection: JobCollection, since: &str) -> Result<Vec<Job>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE timeperiod >= ?1 ORDER BY timeperiod, process_name",
            collection.table()
        );
        let mut stmt = db.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![since], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    #[instrument(skip(self, job), fields(job = %job))]
    fn update_job(&self, collection: JobCollection, job: &Job) -> Result<i64> {
        let event_log = serde_json::to_string(&job.event_log)?;
        let db = self.db.lock().unwrap();
        let sql = format!(
            "INSERT INTO {}
             (process_name, timeperiod, state, related_unit_of_work, number_of_failures, event_log)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (process_name, timeperiod) DO UPDATE SET
                 state                = excluded.state,
                 related_unit_of_work = excluded.related_unit_of_work,
                 number_of_failures   = excluded.number_of_failures,
                 event_log            = excluded.event_log
             RETURNING id",
            collection.table()
        );
        let id = db.query_row(
            &sql,
            params![
                job.process_name,
                job.timeperiod,
                job.state.to_string(),
                job.related_unit_of_work,
                job.number_of_failures,
                event_log
            ],
            |row| row.get(0),
        )?;
        debug!(id, "job persisted");
        Ok(id)
    }

    fn get_uow(&self, id: i64) -> Result<UnitOfWork> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {UOW_COLUMNS} FROM unit_of_work WHERE id = ?1");
        db.query_row(&sql, params![id], row_to_uow)
            .optional()?
            .ok_or_else(|| StoreError::not_found("unit of work", id))
    }

    fn get_uow_by_params(
        &self,
        process_name: &str,
        timeperiod: &str,
        start_id: &str,
        end_id: &str,
    ) -> Result<UnitOfWork> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {UOW_COLUMNS} FROM unit_of_work
             WHERE process_name = ?1 AND timeperiod = ?2 AND start_id = ?3 AND end_id = ?4"
        );
        db.query_row(
            &sql,
            params![process_name, timeperiod, start_id, end_id],
            row_to_uow,
        )
        .optional()?
        .ok_or_else(|| {
            StoreError::not_found(
                "unit of work",
                format!("{process_name}@{timeperiod} [{start_id}, {end_id})"),
            )
        })
    }

    fn get_uows_since(&self, created_since: DateTime<Utc>) -> Result<Vec<UnitOfWork>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {UOW_COLUMNS} FROM unit_of_work WHERE created_at >= ?1 ORDER BY created_at, id"
        );
        let mut stmt = db.prepare(&sql)?;
        let uows = stmt
            .query_map(params![timestamp(&created_since)], row_to_uow)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(uows)
    }

    #[instrument(
        skip(self, uow),
        fields(process = %uow.process_name, timeperiod = %uow.timeperiod)
    )]
    fn insert_uow(&self, uow: &UnitOfWork) -> Result<i64> {
        let arguments = serde_json::to_string(&uow.arguments)?;
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT INTO unit_of_work
             (process_name, timeperiod, start_timeperiod, end_timeperiod, start_id, end_id,
              source, sink, arguments, state, created_at, submitted_at, started_at,
              finished_at, number_of_retries, uow_type)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            params![
                uow.process_name,
                uow.timeperiod,
                uow.start_timeperiod,
                uow.end_timeperiod,
                uow.start_id,
                uow.end_id,
                uow.source,
                uow.sink,
                arguments,
                uow.state.to_string(),
                timestamp(&uow.created_at),
                uow.submitted_at.as_ref().map(timestamp),
                uow.started_at.as_ref().map(timestamp),
                uow.finished_at.as_ref().map(timestamp),
                uow.number_of_retries,
                uow.uow_type.to_string(),
            ],
        );
        match inserted {
            Ok(_) => {
                let id = db.last_insert_rowid();
                debug!(id, "unit of work inserted");
                Ok(id)
            }
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::DuplicateKey {
                    process_name: uow.process_name.clone(),
                    timeperiod: uow.timeperiod.clone(),
                    start_id: uow.start_id.clone(),
                    end_id: uow.end_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_uow(&self, uow: &UnitOfWork) -> Result<()> {
        let id = uow
            .id
            .ok_or_else(|| StoreError::not_found("unit of work", uow.key()))?;
        let arguments = serde_json::to_string(&uow.arguments)?;
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE unit_of_work SET
                 start_timeperiod = ?1, end_timeperiod = ?2, start_id = ?3, end_id = ?4,
                 source = ?5, sink = ?6, arguments = ?7, state = ?8,
                 submitted_at = ?9, started_at = ?10, finished_at = ?11,
                 number_of_retries = ?12
             WHERE id = ?13",
            params![
                uow.start_timeperiod,
                uow.end_timeperiod,
                uow.start_id,
                uow.end_id,
                uow.source,
                uow.sink,
                arguments,
                uow.state.to_string(),
                uow.submitted_at.as_ref().map(timestamp),
                uow.started_at.as_ref().map(timestamp),
                uow.finished_at.as_ref().map(timestamp),
                uow.number_of_retries,
                id
            ],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::not_found("unit of work", id));
        }
        Ok(())
    }

    fn get_freerun(&self, process_name: &str, entry_name: &str) -> Result<FreerunEntry> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {FREERUN_COLUMNS} FROM freerun_entry
             WHERE process_name = ?1 AND entry_name = ?2"
        );
        db.query_row(&sql, params![process_name, entry_name], row_to_freerun)
            .optional()?
            .ok_or_else(|| {
                StoreError::not_found("freerun entry", format!("{process_name}::{entry_name}"))
            })
    }

    fn get_freeruns(&self) -> Result<Vec<FreerunEntry>> {
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {FREERUN_COLUMNS} FROM freerun_entry ORDER BY process_name, entry_name"
        );
        let mut stmt = db.prepare(&sql)?;
        let entries = stmt
            .query_map([], row_to_freerun)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn update_freerun(&self, entry: &FreerunEntry) -> Result<i64> {
        let arguments = serde_json::to_string(&entry.arguments)?;
        let event_log = serde_json::to_string(&entry.event_log)?;
        let db = self.db.lock().unwrap();
        let id = db.query_row(
            "INSERT INTO freerun_entry
             (process_name, entry_name, arguments, related_unit_of_work, event_log)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (process_name, entry_name) DO UPDATE SET
                 arguments            = excluded.arguments,
                 related_unit_of_work = excluded.related_unit_of_work,
                 event_log            = excluded.event_log
             RETURNING id",
            params![
                entry.process_name,
                entry.entry_name,
                arguments,
                entry.related_unit_of_work,
                event_log
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }
}

/// Only the natural-key index may turn an insert failure into
/// [`StoreError::DuplicateKey`]; other constraint failures stay database errors.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation
                && inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Fixed-width RFC 3339 so that text comparison follows time order.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    column: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, e.into())
}

fn parse_text<T: std::str::FromStr<Err = String>>(
    row: &Row<'_>,
    column: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e: String| conversion_error(column, e))
}

fn parse_json<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    column: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(column, e))
}

fn parse_timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(column, e))
    })
    .transpose()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: Some(row.get(0)?),
        process_name: row.get(1)?,
        timeperiod: row.get(2)?,
        state: parse_text(row, 3)?,
        related_unit_of_work: row.get(4)?,
        number_of_failures: row.get(5)?,
        event_log: parse_json(row, 6)?,
    })
}

fn row_to_uow(row: &Row<'_>) -> rusqlite::Result<UnitOfWork> {
    let created_at = parse_timestamp(row, 11)?
        .ok_or_else(|| conversion_error(11, "created_at is NULL".to_string()))?;
    Ok(UnitOfWork {
        id: Some(row.get(0)?),
        process_name: row.get(1)?,
        timeperiod: row.get(2)?,
        start_timeperiod: row.get(3)?,
        end_timeperiod: row.get(4)?,
        start_id: row.get(5)?,
        end_id: row.get(6)?,
        source: row.get(7)?,
        sink: row.get(8)?,
        arguments: parse_json(row, 9)?,
        state: parse_text(row, 10)?,
        created_at,
        submitted_at: parse_timestamp(row, 12)?,
        started_at: parse_timestamp(row, 13)?,
        finished_at: parse_timestamp(row, 14)?,
        number_of_retries: row.get(15)?,
        uow_type: parse_text(row, 16)?,
    })
}

fn row_to_freerun(row: &Row<'_>) -> rusqlite::Result<FreerunEntry> {
    Ok(FreerunEntry {
        id: Some(row.get(0)?),
        process_name: row.get(1)?,
        entry_name: row.get(2)?,
        arguments: parse_json(row, 3)?,
        related_unit_of_work: row.get(4)?,
        event_log: parse_json(row, 5)?,
    })
}
