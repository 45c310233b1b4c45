use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{FreerunEntry, Job, JobCollection, UnitOfWork};

/// Persistence collaborator of the timetable.
///
/// Lookups of a single record return [`StoreError::NotFound`] when absent so
/// that callers can tell a soft lookup failure from an unreachable database.
///
/// [`StoreError::NotFound`]: crate::StoreError::NotFound
pub trait Store: Send + Sync {
    fn get_job(&self, collection: JobCollection, process_name: &str, timeperiod: &str)
        -> Result<Job>;

    /// Every job in `collection` with `timeperiod >= since`, ascending.
    fn get_jobs(&self, collection: JobCollection, since: &str) -> Result<Vec<Job>>;

    /// Insert or update by `(process_name, timeperiod)`; returns the row id.
    fn update_job(&self, collection: JobCollection, job: &Job) -> Result<i64>;

    fn get_uow(&self, id: i64) -> Result<UnitOfWork>;

    /// Lookup by the natural key.
    fn get_uow_by_params(
        &self,
        process_name: &str,
        timeperiod: &str,
        start_id: &str,
        end_id: &str,
    ) -> Result<UnitOfWork>;

    fn get_uows_since(&self, created_since: DateTime<Utc>) -> Result<Vec<UnitOfWork>>;

    /// Fails with [`StoreError::DuplicateKey`] when the natural key is taken.
    ///
    /// [`StoreError::DuplicateKey`]: crate::StoreError::DuplicateKey
    fn insert_uow(&self, uow: &UnitOfWork) -> Result<i64>;

    fn update_uow(&self, uow: &UnitOfWork) -> Result<()>;

    fn get_freerun(&self, process_name: &str, entry_name: &str) -> Result<FreerunEntry>;

    fn get_freeruns(&self) -> Result<Vec<FreerunEntry>>;

    /// Insert or update by `(process_name, entry_name)`; returns the row id.
    fn update_freerun(&self, entry: &FreerunEntry) -> Result<i64>;
}
