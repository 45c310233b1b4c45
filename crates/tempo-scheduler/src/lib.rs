//! `tempo-scheduler`: tokio control loop over the timetable.
//!
//! # Overview
//!
//! Every managed process and every freerun entry gets its own
//! `tokio::time::interval`. A tick runs its handler on the blocking pool
//! while holding the shared [`Timetable`](tempo_timetable::Timetable) lock,
//! so decisions never interleave.
//!
//! | Timer          | Handler                                   |
//! |----------------|-------------------------------------------|
//! | managed process | [`engine::fire_managed_worker`]          |
//! | freerun entry  | [`engine::fire_freerun_worker`]           |
//! | housekeeping   | [`engine::housekeeping`] (rebuild + validate) |
//!
//! Worker status reports arrive on an mpsc channel and are routed to the
//! owning state machine's `notify`.

pub mod engine;
pub mod error;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
