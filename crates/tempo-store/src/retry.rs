use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::store::Store;
use crate::types::{FreerunEntry, Job, JobCollection, UnitOfWork};

/// Bounded retry budget for transient persistence faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: tempo_core::config::PERSISTENCE_RETRIES,
            delay: Duration::from_millis(tempo_core::config::RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_settings(settings: &tempo_core::config::SchedulerSettings) -> Self {
        Self::new(
            settings.persistence_retries,
            Duration::from_millis(settings.retry_delay_ms),
        )
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// retry budget is spent. Blocks the calling thread between attempts.
pub fn with_reconnect<T>(
    policy: RetryPolicy,
    operation: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "persistence call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(operation, attempt, err = %e, "transient persistence failure, retrying");
                std::thread::sleep(policy.delay);
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(operation, attempt, err = %e, "persistence retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// [`Store`] decorator that routes every call through [`with_reconnect`].
pub struct Reconnecting<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Store> Reconnecting<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Store> Store for Reconnecting<S> {
    fn get_job(
        &self,
        collection: JobCollection,
        process_name: &str,
        timeperiod: &str,
    ) -> Result<Job> {
        with_reconnect(self.policy, "get_job", || {
            self.inner.get_job(collection, process_name, timeperiod)
        })
    }

    fn get_jobs(&self, collection: JobCollection, since: &str) -> Result<Vec<Job>> {
        with_reconnect(self.policy, "get_jobs", || self.inner.get_jobs(collection, since))
    }

    fn update_job(&self, collection: JobCollection, job: &Job) -> Result<i64> {
        with_reconnect(self.policy, "update_job", || self.inner.update_job(collection, job))
    }

    fn get_uow(&self, id: i64) -> Result<UnitOfWork> {
        with_reconnect(self.policy, "get_uow", || self.inner.get_uow(id))
    }

    fn get_uow_by_params(
        &self,
        process_name: &str,
        timeperiod: &str,
        start_id: &str,
        end_id: &str,
    ) -> Result<UnitOfWork> {
        with_reconnect(self.policy, "get_uow_by_params", || {
            self.inner
                .get_uow_by_params(process_name, timeperiod, start_id, end_id)
        })
    }

    fn get_uows_since(&self, created_since: DateTime<Utc>) -> Result<Vec<UnitOfWork>> {
        with_reconnect(self.policy, "get_uows_since", || {
            self.inner.get_uows_since(created_since)
        })
    }

    fn insert_uow(&self, uow: &UnitOfWork) -> Result<i64> {
        with_reconnect(self.policy, "insert_uow", || self.inner.insert_uow(uow))
    }

    fn update_uow(&self, uow: &UnitOfWork) -> Result<()> {
        with_reconnect(self.policy, "update_uow", || self.inner.update_uow(uow))
    }

    fn get_freerun(&self, process_name: &str, entry_name: &str) -> Result<FreerunEntry> {
        with_reconnect(self.policy, "get_freerun", || {
            self.inner.get_freerun(process_name, entry_name)
        })
    }

    fn get_freeruns(&self) -> Result<Vec<FreerunEntry>> {
        with_reconnect(self.policy, "get_freeruns", || self.inner.get_freeruns())
    }

    fn update_freerun(&self, entry: &FreerunEntry) -> Result<i64> {
        with_reconnect(self.policy, "update_freerun", || self.inner.update_freerun(entry))
    }
}
