//! `tempo-store`: persisted job records, units of work and freerun entries.
//!
//! Job records are partitioned by granularity into `job_hourly`,
//! `job_daily`, `job_monthly` and `job_yearly`. Units of work are unique on
//! `(process_name, timeperiod, start_id, end_id)`; a second insert with the
//! same key fails with [`StoreError::DuplicateKey`] so that callers can
//! recover the existing record instead.

pub mod db;
pub mod error;
pub mod retry;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use retry::{with_reconnect, Reconnecting, RetryPolicy};
pub use sqlite::SqliteStore;
pub use store::Store;
pub use types::{
    FreerunEntry, Job, JobCollection, JobState, MqTransmission, UnitOfWork, UowState, UowType,
};
