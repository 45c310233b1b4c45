use tempo_core::config::StateMachineKind;
use tempo_core::CoreError;
use tempo_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimetableError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Process {0} is not managed by any tree")]
    UnknownProcess(String),

    #[error("Tree not found: {0}")]
    UnknownTree(String),

    #[error("Process {process_name} is driven by {kind}, which has no managed state machine")]
    UnsupportedStateMachine {
        process_name: String,
        kind: StateMachineKind,
    },

    /// A unit of work could not be located even after duplicate recovery.
    #[error(
        "MANUAL INTERVENTION REQUIRED: unable to locate unit of work for \
         {process_name}@{timeperiod}"
    )]
    ManualIntervention {
        process_name: String,
        timeperiod: String,
    },

    /// Discrete windows count their follow-ups with an integer `end_id`.
    #[error("Unit of work {uow} carries non-numeric end_id {end_id:?}")]
    InvalidMarker { uow: String, end_id: String },

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Tree node {process_name}@{timeperiod} has no job record")]
    Detached {
        process_name: String,
        timeperiod: String,
    },
}

impl TimetableError {
    /// Soft lookup failure, answered by the failure counter rather than escalated.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TimetableError::Store(e) if e.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, TimetableError>;
