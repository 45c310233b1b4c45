use thiserror::Error;

/// Errors surfaced by one scheduler trigger.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Timetable(#[from] tempo_timetable::TimetableError),

    #[error("Store error: {0}")]
    Store(#[from] tempo_store::StoreError),

    #[error(transparent)]
    Core(#[from] tempo_core::CoreError),

    /// The blocking task running a trigger did not complete.
    #[error("Trigger task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
