use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_core::Qualifier;

/// Number of events kept in a job or freerun event log.
pub const EVENT_LOG_MAX_SIZE: usize = 128;

/// Lifecycle of a job record.
///
/// `Embryo -> InProgress -> FinalRun -> {Processed, Skipped, Noop}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Placeholder created when the tree materializes the timeperiod.
    Embryo,
    /// A unit of work is active for the timeperiod.
    InProgress,
    /// Last run before the window is closed.
    FinalRun,
    Processed,
    /// Muted after repeated failures or by an operator. Only a reprocess
    /// request brings it back.
    Skipped,
    /// Nothing to process for the window.
    Noop,
}

impl JobState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Embryo | JobState::InProgress | JobState::FinalRun
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobState::Processed | JobState::Skipped | JobState::Noop
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Embryo => "embryo",
            JobState::InProgress => "in_progress",
            JobState::FinalRun => "final_run",
            JobState::Processed => "processed",
            JobState::Skipped => "skipped",
            JobState::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "embryo" => Ok(JobState::Embryo),
            "in_progress" => Ok(JobState::InProgress),
            "final_run" => Ok(JobState::FinalRun),
            "processed" => Ok(JobState::Processed),
            "skipped" => Ok(JobState::Skipped),
            "noop" => Ok(JobState::Noop),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Lifecycle of a unit of work, mutated by workers and the garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UowState {
    Requested,
    InProgress,
    Processed,
    Canceled,
    /// Failed at the worker or invalidated by a reprocess request; the
    /// garbage collector moves it back to `Requested`.
    Invalid,
    Noop,
}

impl UowState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            UowState::Requested | UowState::InProgress | UowState::Invalid
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            UowState::Processed | UowState::Canceled | UowState::Noop
        )
    }
}

impl std::fmt::Display for UowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UowState::Requested => "requested",
            UowState::InProgress => "in_progress",
            UowState::Processed => "processed",
            UowState::Canceled => "canceled",
            UowState::Invalid => "invalid",
            UowState::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UowState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "requested" => Ok(UowState::Requested),
            "in_progress" => Ok(UowState::InProgress),
            "processed" => Ok(UowState::Processed),
            "canceled" => Ok(UowState::Canceled),
            "invalid" => Ok(UowState::Invalid),
            "noop" => Ok(UowState::Noop),
            other => Err(format!("unknown unit of work state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UowType {
    Managed,
    Freerun,
}

impl std::fmt::Display for UowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UowType::Managed => write!(f, "managed"),
            UowType::Freerun => write!(f, "freerun"),
        }
    }
}

impl std::str::FromStr for UowType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "managed" => Ok(UowType::Managed),
            "freerun" => Ok(UowType::Freerun),
            other => Err(format!("unknown unit of work type: {other}")),
        }
    }
}

/// Physical partition holding the job records of one granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobCollection {
    Hourly,
    Daily,
    Monthly,
    Yearly,
}

impl JobCollection {
    pub fn for_qualifier(qualifier: Qualifier) -> Option<Self> {
        match qualifier {
            Qualifier::Hourly => Some(JobCollection::Hourly),
            Qualifier::Daily => Some(JobCollection::Daily),
            Qualifier::Monthly => Some(JobCollection::Monthly),
            Qualifier::Yearly => Some(JobCollection::Yearly),
            Qualifier::RealTime => None,
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            JobCollection::Hourly => "job_hourly",
            JobCollection::Daily => "job_daily",
            JobCollection::Monthly => "job_monthly",
            JobCollection::Yearly => "job_yearly",
        }
    }
}

/// Persisted state of one (process, timeperiod) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Row id; `None` until the first `update_job`.
    pub id: Option<i64>,
    pub process_name: String,
    pub timeperiod: String,
    pub state: JobState,
    pub related_unit_of_work: Option<i64>,
    pub number_of_failures: u32,
    /// Newest first, at most [`EVENT_LOG_MAX_SIZE`] entries.
    pub event_log: Vec<String>,
}

impl Job {
    pub fn embryo(process_name: &str, timeperiod: &str) -> Self {
        Self {
            id: None,
            process_name: process_name.to_string(),
            timeperiod: timeperiod.to_string(),
            state: JobState::Embryo,
            related_unit_of_work: None,
            number_of_failures: 0,
            event_log: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_processed(&self) -> bool {
        self.state == JobState::Processed
    }

    pub fn is_skipped(&self) -> bool {
        self.state == JobState::Skipped
    }

    pub fn is_noop(&self) -> bool {
        self.state == JobState::Noop
    }

    pub fn add_log_entry(&mut self, entry: impl Into<String>) {
        push_event(&mut self.event_log, entry.into());
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} [{}]", self.process_name, self.timeperiod, self.state)
    }
}

/// One concrete execution request handed to a worker.
///
/// The natural key `(process_name, timeperiod, start_id, end_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub id: Option<i64>,
    pub process_name: String,
    pub timeperiod: String,
    pub start_timeperiod: String,
    pub end_timeperiod: String,
    /// Opaque lower data-range marker.
    pub start_id: String,
    /// Opaque upper data-range marker.
    pub end_id: String,
    pub source: Option<String>,
    pub sink: Option<String>,
    pub arguments: BTreeMap<String, serde_json::Value>,
    pub state: UowState,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub number_of_retries: u32,
    pub uow_type: UowType,
}

impl UnitOfWork {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_processed(&self) -> bool {
        self.state == UowState::Processed
    }

    pub fn is_canceled(&self) -> bool {
        self.state == UowState::Canceled
    }

    pub fn is_noop(&self) -> bool {
        self.state == UowState::Noop
    }

    pub fn is_invalid(&self) -> bool {
        self.state == UowState::Invalid
    }

    /// Display id for logs; `-` before the row is inserted.
    pub fn key(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => "-".to_string(),
        }
    }
}

/// Persistent companion of a configured freerun entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreerunEntry {
    pub id: Option<i64>,
    pub process_name: String,
    pub entry_name: String,
    pub arguments: BTreeMap<String, serde_json::Value>,
    pub related_unit_of_work: Option<i64>,
    pub event_log: Vec<String>,
}

impl FreerunEntry {
    pub fn new(
        process_name: &str,
        entry_name: &str,
        arguments: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: None,
            process_name: process_name.to_string(),
            entry_name: entry_name.to_string(),
            arguments,
            related_unit_of_work: None,
            event_log: Vec::new(),
        }
    }

    /// `process::entry`, the name freerun UOWs are filed under.
    pub fn schedulable_name(&self) -> String {
        schedulable_name(&self.process_name, &self.entry_name)
    }

    pub fn add_log_entry(&mut self, entry: impl Into<String>) {
        push_event(&mut self.event_log, entry.into());
    }
}

pub fn schedulable_name(process_name: &str, entry_name: &str) -> String {
    format!("{process_name}::{entry_name}")
}

/// Dispatch message: the worker fetches the full UOW by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqTransmission {
    pub process_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_name: Option<String>,
    pub unit_of_work_id: i64,
}

fn push_event(log: &mut Vec<String>, entry: String) {
    log.insert(0, entry);
    log.truncate(EVENT_LOG_MAX_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(JobState::FinalRun.is_active());
        assert!(!JobState::FinalRun.is_finished());
        assert!(JobState::Noop.is_finished());
        assert!(UowState::Invalid.is_active());
        assert!(UowState::Canceled.is_finished());
        assert!(!UowState::Invalid.is_finished());
    }

    #[test]
    fn event_log_is_newest_first_and_bounded() {
        let mut job = Job::embryo("p", "2024010100");
        for i in 0..200 {
            job.add_log_entry(format!("event {i}"));
        }
        assert_eq!(job.event_log.len(), EVENT_LOG_MAX_SIZE);
        assert_eq!(job.event_log[0], "event 199");
        assert_eq!(job.event_log[EVENT_LOG_MAX_SIZE - 1], "event 72");
    }

    #[test]
    fn states_round_trip_through_str() {
        for s in [JobState::Embryo, JobState::FinalRun, JobState::Skipped] {
            assert_eq!(s.to_string().parse::<JobState>().unwrap(), s);
        }
        for s in [UowState::Requested, UowState::Invalid, UowState::Noop] {
            assert_eq!(s.to_string().parse::<UowState>().unwrap(), s);
        }
        assert!("unknown".parse::<JobState>().is_err());
    }

    #[test]
    fn transmission_omits_missing_entry_name() {
        let msg = MqTransmission {
            process_name: "p".into(),
            entry_name: None,
            unit_of_work_id: 7,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"process_name":"p","unit_of_work_id":7}"#);
    }
}
