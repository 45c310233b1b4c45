use std::sync::Arc;

use tracing::{debug, Level};

use tempo_core::config::StateMachineKind;
use tempo_store::{Job, JobState, UnitOfWork, UowState};

use super::{log_event, related_uow, StateMachine};
use crate::error::{Result, TimetableError};
use crate::publisher::Publisher;
use crate::timetable::Timetable;

/// One unit of work per closed window, covering the whole grouped window.
///
/// The first unit of work carries markers `0/0`; every follow-up emitted
/// while the window is still open or not finalizable bumps `end_id`.
pub struct DiscreteStateMachine {
    publisher: Arc<dyn Publisher>,
}

impl DiscreteStateMachine {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

impl StateMachine for DiscreteStateMachine {
    fn kind(&self) -> StateMachineKind {
        StateMachineKind::Discrete
    }

    fn publisher(&self) -> &dyn Publisher {
        self.publisher.as_ref()
    }

    fn window(&self, timetable: &Timetable, job: &Job) -> Result<(String, String)> {
        let grouping = timetable.process_config(&job.process_name)?.grouping()?;
        Ok(grouping.bounds(&job.timeperiod)?)
    }

    fn process_embryo(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        emit_initial(self, timetable, job)
    }

    fn process_in_progress(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        process_in_progress(self, timetable, job)
    }

    /// Never entered by this variant; a job left in FINAL_RUN by another
    /// variant is resolved like a closed window.
    fn process_final_run(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        let uow = related_uow(timetable, job)?;
        resolve(timetable, job, &uow)
    }

    fn open_window(
        &self,
        timetable: &mut Timetable,
        job: &mut Job,
        uow: &UnitOfWork,
        recycle: bool,
    ) -> Result<()> {
        open_window(self, timetable, job, uow, recycle)
    }

    fn notify(&self, timetable: &mut Timetable, uow: &UnitOfWork) -> Result<()> {
        notify(timetable, uow)
    }
}

pub(super) fn emit_initial(
    machine: &dyn StateMachine,
    timetable: &mut Timetable,
    job: &mut Job,
) -> Result<()> {
    let (uow, _) = machine.insert_and_publish_uow(timetable, job, "0", "0", false)?;
    timetable.update_job_record(job, &uow, JobState::InProgress)
}

pub(super) fn process_in_progress(
    machine: &dyn StateMachine,
    timetable: &mut Timetable,
    job: &mut Job,
) -> Result<()> {
    let actual = timetable.actual_timeperiod(&job.process_name)?;
    let finalizable = timetable.is_job_record_finalizable(job)?;
    let uow = related_uow(timetable, job)?;

    if job.timeperiod == actual || !finalizable {
        machine.open_window(timetable, job, &uow, false)
    } else if job.timeperiod < actual {
        resolve(timetable, job, &uow)
    } else {
        let message = format!("{job} has timeperiod from the future vs current {actual}");
        log_event(timetable, job, Level::ERROR, message)
    }
}

/// Wait for an active unit of work; once it finishes, emit a follow-up
/// with the next `end_id`.
pub(super) fn open_window(
    machine: &dyn StateMachine,
    timetable: &mut Timetable,
    job: &mut Job,
    uow: &UnitOfWork,
    recycle: bool,
) -> Result<()> {
    if uow.is_active() {
        debug!(job = %job, uow = %uow.key(), state = %uow.state, "unit of work still active");
        return Ok(());
    }
    let end_id = uow
        .end_id
        .parse::<i64>()
        .map_err(|_| TimetableError::InvalidMarker {
            uow: uow.key(),
            end_id: uow.end_id.clone(),
        })?
        + 1;
    let (next, _) =
        machine.insert_and_publish_uow(timetable, job, "0", &end_id.to_string(), recycle)?;
    timetable.update_job_record(job, &next, JobState::InProgress)
}

/// Settle a closed, finalizable window from the state of its unit of work.
pub(super) fn resolve(timetable: &mut Timetable, job: &mut Job, uow: &UnitOfWork) -> Result<()> {
    let next = match uow.state {
        UowState::Processed => Some(JobState::Processed),
        UowState::Noop => Some(JobState::Noop),
        UowState::Canceled => Some(JobState::Skipped),
        UowState::Requested | UowState::InProgress => {
            let message = format!(
                "Suppressed new unit of work for {job}: waiting for {} [{}]",
                uow.key(),
                uow.state
            );
            log_event(timetable, job, Level::INFO, message)?;
            None
        }
        UowState::Invalid => {
            let message = format!(
                "Unit of work {} for {job} is invalid; relying on garbage collection",
                uow.key()
            );
            log_event(timetable, job, Level::INFO, message)?;
            None
        }
    };
    if let Some(state) = next {
        timetable.update_job_record(job, uow, state)?;
    }
    timetable.build_tree_for(&job.process_name)
}

pub(super) fn notify(timetable: &mut Timetable, uow: &UnitOfWork) -> Result<()> {
    let mut job = timetable.job_record(&uow.process_name, &uow.timeperiod)?;
    if job.state != JobState::InProgress || job.related_unit_of_work != uow.id {
        debug!(
            job = %job,
            uow = %uow.key(),
            "status report does not concern the current unit of work"
        );
        return Ok(());
    }
    let actual = timetable.actual_timeperiod(&job.process_name)?;
    if job.timeperiod < actual && timetable.is_job_record_finalizable(&mut job)? {
        resolve(timetable, &mut job, uow)
    } else {
        debug!(
            job = %job,
            uow = %uow.key(),
            "window still open or not finalizable; state change suppressed"
        );
        Ok(())
    }
}
