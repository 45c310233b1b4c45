use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid timeperiod {timeperiod}: {reason}")]
    InvalidTimeperiod { timeperiod: String, reason: String },

    #[error("Qualifier {qualifier} is not supported by {operation}")]
    UnsupportedQualifier {
        qualifier: String,
        operation: &'static str,
    },

    #[error("Invalid grouping {grouping} for {qualifier} (allowed 1..={upper})")]
    InvalidGrouping {
        qualifier: String,
        grouping: u32,
        upper: u32,
    },
}

impl CoreError {
    pub(crate) fn timeperiod(timeperiod: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidTimeperiod {
            timeperiod: timeperiod.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
