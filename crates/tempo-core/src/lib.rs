//! `tempo-core`: shared building blocks for the tempo orchestrator.
//!
//! * [`time`]: canonical timeperiod strings and calendar-correct arithmetic
//! * [`grouping`]: "every N periods" bucketing of raw timeperiods
//! * [`config`]: the immutable process/tree configuration read at startup
//! * [`clock`]: wall clock that tests can pin

pub mod clock;
pub mod config;
pub mod error;
pub mod grouping;
pub mod time;

pub use clock::Clock;
pub use error::{CoreError, Result};
pub use grouping::TimeperiodGrouping;
pub use time::Qualifier;
