//! State machines that move job records through
//! EMBRYO → IN_PROGRESS → FINAL_RUN → {PROCESSED, SKIPPED, NOOP}.
//!
//! Each variant decides, for one job at a time, whether to emit a unit of
//! work, wait, or resolve the job from the state of its current unit of work.
//! Shared behaviour (dispatch, blocking policies, reprocess, skip and
//! duplicate-safe unit-of-work creation) lives in the provided methods of
//! [`StateMachine`].

pub mod continuous;
pub mod discrete;
pub mod freerun;
pub mod recomputing;
pub mod simple_discrete;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn, Level};

use tempo_core::config::StateMachineKind;
use tempo_store::{Job, JobState, MqTransmission, StoreError, UnitOfWork, UowState, UowType};

use crate::error::{Result, TimetableError};
use crate::publisher::Publisher;
use crate::source::DataSource;
use crate::timetable::Timetable;

pub use continuous::ContinuousStateMachine;
pub use discrete::DiscreteStateMachine;
pub use freerun::FreerunStateMachine;
pub use recomputing::RecomputingStateMachine;
pub use simple_discrete::SimpleDiscreteStateMachine;

pub trait StateMachine: Send + Sync {
    fn kind(&self) -> StateMachineKind;

    fn publisher(&self) -> &dyn Publisher;

    /// Whether `state` appears in this variant's transition table.
    fn handles(&self, _state: JobState) -> bool {
        true
    }

    /// `[start, end)` timeperiods a unit of work for `job` covers.
    fn window(&self, timetable: &Timetable, job: &Job) -> Result<(String, String)>;

    fn process_embryo(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()>;

    fn process_in_progress(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()>;

    fn process_final_run(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        let message = format!("{job} reached FINAL_RUN, which {} does not use", self.kind());
        log_event(timetable, job, Level::ERROR, message)
    }

    /// IN_PROGRESS handling while the window is still live: keep the
    /// current unit of work or emit a fresh one. `recycle` allows a
    /// recovered duplicate that already finished to be requested again.
    fn open_window(
        &self,
        timetable: &mut Timetable,
        job: &mut Job,
        uow: &UnitOfWork,
        recycle: bool,
    ) -> Result<()>;

    /// React to a status change reported for `uow`.
    fn notify(&self, timetable: &mut Timetable, uow: &UnitOfWork) -> Result<()>;

    /// Dispatch on the job state. Lookup failures bump the failure counter
    /// instead of propagating.
    fn manage_job(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        if !self.handles(job.state) {
            let message = format!(
                "state {} is unreachable for the {} state machine",
                job.state,
                self.kind()
            );
            return log_event(timetable, job, Level::ERROR, message);
        }
        let outcome = match job.state {
            JobState::Embryo => self.process_embryo(timetable, job),
            JobState::InProgress => self.process_in_progress(timetable, job),
            JobState::FinalRun => self.process_final_run(timetable, job),
            JobState::Processed | JobState::Skipped | JobState::Noop => {
                let message = format!("{job} is finished and no longer managed");
                return log_event(timetable, job, Level::WARN, message);
            }
        };

        match outcome {
            Err(e) if e.is_not_found() => {
                let reason = format!("Increasing fail counter for {job}: {e}");
                warn!(process = %job.process_name, timeperiod = %job.timeperiod, "{reason}");
                timetable.failed_on_processing_job_record(
                    &job.process_name,
                    &job.timeperiod,
                    &reason,
                )?;
                *job = timetable.job_record(&job.process_name, &job.timeperiod)?;
                Ok(())
            }
            other => other,
        }
    }

    /// Manage `job` once its children are finished, or earlier when the
    /// variant works on live windows and every dependency is healthy.
    fn manage_job_with_blocking_children(
        &self,
        timetable: &mut Timetable,
        job: &mut Job,
    ) -> Result<()> {
        let run_on_active = timetable
            .process_config(&job.process_name)?
            .run_on_active_timeperiod();
        if timetable.is_job_record_finalizable(job)? {
            return self.manage_job(timetable, job);
        }
        if run_on_active && timetable.dependent_on_composite_state(job)?.all_healthy() {
            return self.manage_job(timetable, job);
        }
        let message = format!(
            "{job} is blocked by unprocessed children or dependencies; \
             waiting another tick"
        );
        log_event(timetable, job, Level::INFO, message)
    }

    /// Manage `job` once every dependency is processed; a skipped
    /// dependency skips the job.
    fn manage_job_with_blocking_dependencies(
        &self,
        timetable: &mut Timetable,
        job: &mut Job,
    ) -> Result<()> {
        let run_on_active = timetable
            .process_config(&job.process_name)?
            .run_on_active_timeperiod();
        let composite = timetable.dependent_on_composite_state(job)?;
        if composite.all_processed() || (run_on_active && composite.all_healthy()) {
            return self.manage_job(timetable, job);
        }
        if composite.skipped_present() {
            let message = format!(
                "{job} is skipped: dependencies {:?} were skipped",
                composite.skipped
            );
            log_event(timetable, job, Level::WARN, message)?;
            return self.skip_job(timetable, job);
        }
        let message = format!(
            "{job} is blocked by unprocessed dependencies {:?}; waiting another tick",
            composite.unprocessed
        );
        log_event(timetable, job, Level::INFO, message)
    }

    /// Reset the failure counter and reopen the job. Without a readable unit
    /// of work it returns to EMBRYO; otherwise its unfinished unit of work
    /// is canceled and a fresh one is emitted.
    fn reprocess_job(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        job.number_of_failures = 0;
        let related = match job.related_unit_of_work {
            Some(uow_id) => match timetable.store().get_uow(uow_id) {
                Ok(uow) => Some(uow),
                Err(e) if e.is_not_found() => {
                    let message = format!("{job} points at unit of work {uow_id}, which is gone");
                    log_event(timetable, job, Level::WARN, message)?;
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        let Some(mut uow) = related else {
            job.state = JobState::Embryo;
            job.related_unit_of_work = None;
            let message = "Transferred job to EMBRYO for reprocessing".to_string();
            log_event(timetable, job, Level::INFO, message)?;
            return timetable.update_job_state(job);
        };

        cancel_uow(timetable, &mut uow)?;
        job.state = JobState::InProgress;
        let message = format!("Reprocessing: superseding unit of work {}", uow.key());
        log_event(timetable, job, Level::INFO, message)?;
        timetable.update_job_state(job)?;
        self.open_window(timetable, job, &uow, true)
    }

    /// Force SKIPPED and cancel the unfinished unit of work, if any.
    fn skip_job(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        job.state = JobState::Skipped;
        if let Some(uow_id) = job.related_unit_of_work {
            match timetable.store().get_uow(uow_id) {
                Ok(mut uow) => cancel_uow(timetable, &mut uow)?,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        let message = format!(
            "Transferred job {}@{} to SKIPPED",
            job.process_name, job.timeperiod
        );
        log_event(timetable, job, Level::WARN, message)?;
        timetable.update_job_state(job)
    }

    /// Create and publish a unit of work for `job`.
    ///
    /// A concurrent insert of the same natural key is recovered by reading
    /// the existing record back; the flag in the result reports that case.
    fn insert_and_publish_uow(
        &self,
        timetable: &mut Timetable,
        job: &mut Job,
        start_id: &str,
        end_id: &str,
        recycle: bool,
    ) -> Result<(UnitOfWork, bool)> {
        let (start_timeperiod, end_timeperiod) = self.window(timetable, job)?;
        let process = timetable.process_config(&job.process_name)?;
        let now = timetable.now();
        let mut uow = UnitOfWork {
            id: None,
            process_name: job.process_name.clone(),
            timeperiod: job.timeperiod.clone(),
            start_timeperiod,
            end_timeperiod,
            start_id: start_id.to_string(),
            end_id: end_id.to_string(),
            source: process.source.clone(),
            sink: process.sink.clone(),
            arguments: process.arguments.clone(),
            state: UowState::Requested,
            created_at: now,
            submitted_at: Some(now),
            started_at: None,
            finished_at: None,
            number_of_retries: 0,
            uow_type: UowType::Managed,
        };

        let is_duplicate = match timetable.store().insert_uow(&uow) {
            Ok(id) => {
                uow.id = Some(id);
                false
            }
            Err(StoreError::DuplicateKey { .. }) => {
                warn!(
                    process = %uow.process_name,
                    timeperiod = %uow.timeperiod,
                    start_id,
                    end_id,
                    "Catching up with latest unit of work"
                );
                match timetable.store().get_uow_by_params(
                    &uow.process_name,
                    &uow.timeperiod,
                    &uow.start_id,
                    &uow.end_id,
                ) {
                    Ok(existing) => {
                        uow = existing;
                        true
                    }
                    Err(e) if e.is_not_found() => {
                        return Err(manual_intervention(timetable, job, &uow)?)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        if is_duplicate && recycle && uow.is_finished() {
            uow.state = UowState::Requested;
            uow.number_of_retries = 0;
            uow.submitted_at = Some(now);
            uow.started_at = None;
            uow.finished_at = None;
            timetable.store().update_uow(&uow)?;
            info!(uow = %uow.key(), process = %uow.process_name, "recycled finished unit of work");
        }

        let Some(unit_of_work_id) = uow.id else {
            return Err(manual_intervention(timetable, job, &uow)?);
        };
        self.publisher().publish(&MqTransmission {
            process_name: uow.process_name.clone(),
            entry_name: None,
            unit_of_work_id,
        })?;
        info!(
            uow = unit_of_work_id,
            process = %uow.process_name,
            timeperiod = %uow.timeperiod,
            start_id = %uow.start_id,
            end_id = %uow.end_id,
            duplicate = is_duplicate,
            "Published unit of work"
        );
        Ok((uow, is_duplicate))
    }
}

/// Lookup of the concrete state machine for each managed [`StateMachineKind`].
#[derive(Clone, Default)]
pub struct Registry {
    machines: HashMap<StateMachineKind, Arc<dyn StateMachine>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every managed variant, sharing one publisher and one data source.
    pub fn standard(publisher: Arc<dyn Publisher>, source: Arc<dyn DataSource>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DiscreteStateMachine::new(Arc::clone(&publisher))));
        registry.register(Arc::new(SimpleDiscreteStateMachine::new(Arc::clone(&publisher))));
        registry.register(Arc::new(ContinuousStateMachine::new(
            Arc::clone(&publisher),
            Arc::clone(&source),
        )));
        registry.register(Arc::new(RecomputingStateMachine::new(publisher, source)));
        registry
    }

    pub fn register(&mut self, machine: Arc<dyn StateMachine>) {
        self.machines.insert(machine.kind(), machine);
    }

    pub fn get(&self, kind: StateMachineKind) -> Option<Arc<dyn StateMachine>> {
        self.machines.get(&kind).cloned()
    }
}

/// Log at `level` and record the message in the job's event log.
pub(crate) fn log_event(
    timetable: &mut Timetable,
    job: &mut Job,
    level: Level,
    message: String,
) -> Result<()> {
    let (process, timeperiod) = (&job.process_name, &job.timeperiod);
    match level {
        Level::ERROR => error!(process = %process, timeperiod = %timeperiod, "{message}"),
        Level::WARN => warn!(process = %process, timeperiod = %timeperiod, "{message}"),
        _ => info!(process = %process, timeperiod = %timeperiod, "{message}"),
    }
    timetable.add_log_entry(job, &message)
}

/// Unit of work the job currently points at.
pub(crate) fn related_uow(timetable: &Timetable, job: &Job) -> Result<UnitOfWork> {
    let id = job.related_unit_of_work.ok_or_else(|| StoreError::NotFound {
        entity: "unit of work",
        key: format!("related to {job}"),
    })?;
    Ok(timetable.store().get_uow(id)?)
}

pub(crate) fn cancel_uow(timetable: &Timetable, uow: &mut UnitOfWork) -> Result<()> {
    if uow.is_finished() {
        return Ok(());
    }
    uow.state = UowState::Canceled;
    uow.finished_at = Some(timetable.now());
    timetable.store().update_uow(uow)?;
    info!(uow = %uow.key(), process = %uow.process_name, "canceled unit of work");
    Ok(())
}

/// Record the failed duplicate recovery on the job and build the error.
fn manual_intervention(
    timetable: &mut Timetable,
    job: &mut Job,
    uow: &UnitOfWork,
) -> Result<TimetableError> {
    let message = format!(
        "MANUAL INTERVENTION REQUIRED! Unable to locate unit of work for {}@{} [{}, {})",
        uow.process_name, uow.timeperiod, uow.start_id, uow.end_id
    );
    log_event(timetable, job, Level::ERROR, message)?;
    timetable.update_job_state(job)?;
    Ok(TimetableError::ManualIntervention {
        process_name: uow.process_name.clone(),
        timeperiod: uow.timeperiod.clone(),
    })
}
