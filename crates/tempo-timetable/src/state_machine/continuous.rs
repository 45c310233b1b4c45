use std::sync::Arc;

use tracing::{debug, Level};

use tempo_core::config::StateMachineKind;
use tempo_core::time::increment;
use tempo_store::{with_reconnect, Job, JobState, UnitOfWork, UowState};

use super::{log_event, related_uow, StateMachine};
use crate::error::Result;
use crate::publisher::Publisher;
use crate::source::DataSource;
use crate::timetable::Timetable;

/// Re-runs the live `[tp, tp+1)` window as its data grows, then issues one
/// FINAL_RUN unit of work once the window closes and is finalizable.
pub struct ContinuousStateMachine {
    publisher: Arc<dyn Publisher>,
    source: Arc<dyn DataSource>,
}

impl ContinuousStateMachine {
    pub fn new(publisher: Arc<dyn Publisher>, source: Arc<dyn DataSource>) -> Self {
        Self { publisher, source }
    }
}

impl StateMachine for ContinuousStateMachine {
    fn kind(&self) -> StateMachineKind {
        StateMachineKind::Continuous
    }

    fn publisher(&self) -> &dyn Publisher {
        self.publisher.as_ref()
    }

    fn window(&self, timetable: &Timetable, job: &Job) -> Result<(String, String)> {
        let qualifier = timetable.process_config(&job.process_name)?.qualifier;
        let end = increment(qualifier, &job.timeperiod, 1)?;
        Ok((job.timeperiod.clone(), end))
    }

    fn process_embryo(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        let source = self.source.as_ref();
        compute_and_transfer(self, source, timetable, job, JobState::InProgress, false)
    }

    fn process_in_progress(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        process_in_progress(self, self.source.as_ref(), timetable, job)
    }

    fn process_final_run(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        process_final_run(timetable, job)
    }

    fn open_window(
        &self,
        timetable: &mut Timetable,
        job: &mut Job,
        uow: &UnitOfWork,
        recycle: bool,
    ) -> Result<()> {
        open_window(self, self.source.as_ref(), timetable, job, uow, recycle)
    }

    fn notify(&self, timetable: &mut Timetable, uow: &UnitOfWork) -> Result<()> {
        notify(self, timetable, uow)
    }
}

/// Data-range markers for the job's window, with the same reconnect budget
/// as the store.
fn range_bounds(
    machine: &dyn StateMachine,
    source: &dyn DataSource,
    timetable: &Timetable,
    job: &Job,
) -> Result<(String, String)> {
    let (start_timeperiod, end_timeperiod) = machine.window(timetable, job)?;
    let source_name = timetable.process_config(&job.process_name)?.source.clone();
    Ok(with_reconnect(timetable.retry_policy(), "range_bounds", || {
        source.range_bounds(source_name.as_deref(), &start_timeperiod, &end_timeperiod)
    })?)
}

/// Emit a unit of work over the current data range and move the job to
/// `target`. A duplicate FINAL_RUN unit of work is settled immediately.
pub(super) fn compute_and_transfer(
    machine: &dyn StateMachine,
    source: &dyn DataSource,
    timetable: &mut Timetable,
    job: &mut Job,
    target: JobState,
    recycle: bool,
) -> Result<()> {
    let (start_id, end_id) = range_bounds(machine, source, timetable, job)?;
    let (uow, is_duplicate) =
        machine.insert_and_publish_uow(timetable, job, &start_id, &end_id, recycle)?;
    timetable.update_job_record(job, &uow, target)?;
    if target == JobState::FinalRun && is_duplicate {
        machine.process_final_run(timetable, job)?;
    }
    Ok(())
}

pub(super) fn process_in_progress(
    machine: &dyn StateMachine,
    source: &dyn DataSource,
    timetable: &mut Timetable,
    job: &mut Job,
) -> Result<()> {
    let actual = timetable.actual_timeperiod(&job.process_name)?;
    let finalizable = timetable.is_job_record_finalizable(job)?;
    let uow = related_uow(timetable, job)?;

    if job.timeperiod == actual || !finalizable {
        machine.open_window(timetable, job, &uow, false)
    } else if job.timeperiod < actual {
        compute_and_transfer(machine, source, timetable, job, JobState::FinalRun, false)
    } else {
        let message = format!("{job} has timeperiod from the future vs current {actual}");
        log_event(timetable, job, Level::ERROR, message)
    }
}

/// A unit of work that has not started yet (or failed) is rescoped in
/// place; otherwise a new one covers the grown range.
pub(super) fn open_window(
    machine: &dyn StateMachine,
    source: &dyn DataSource,
    timetable: &mut Timetable,
    job: &mut Job,
    uow: &UnitOfWork,
    recycle: bool,
) -> Result<()> {
    if uow.is_invalid() || uow.state == UowState::Requested {
        update_scope(machine, source, timetable, job, uow)
    } else {
        compute_and_transfer(machine, source, timetable, job, JobState::InProgress, recycle)
    }
}

fn update_scope(
    machine: &dyn StateMachine,
    source: &dyn DataSource,
    timetable: &mut Timetable,
    job: &mut Job,
    uow: &UnitOfWork,
) -> Result<()> {
    let (_, end_id) = range_bounds(machine, source, timetable, job)?;
    if end_id == uow.end_id {
        debug!(job = %job, uow = %uow.key(), "processing range unchanged");
        return Ok(());
    }
    let mut uow = uow.clone();
    uow.end_id = end_id;
    timetable.store().update_uow(&uow)?;
    let message = format!(
        "Updated processing range of unit of work {} to end at {}",
        uow.key(),
        uow.end_id
    );
    log_event(timetable, job, Level::INFO, message)
}

pub(super) fn process_final_run(timetable: &mut Timetable, job: &mut Job) -> Result<()> {
    let uow = related_uow(timetable, job)?;
    let next = match uow.state {
        UowState::Processed => Some(JobState::Processed),
        UowState::Canceled => Some(JobState::Skipped),
        UowState::Noop => Some(JobState::Noop),
        _ => {
            let message = format!(
                "Suppressed state change for {job}: waiting for {} [{}]",
                uow.key(),
                uow.state
            );
            log_event(timetable, job, Level::INFO, message)?;
            None
        }
    };
    if let Some(state) = next {
        timetable.update_job_record(job, &uow, state)?;
    }
    timetable.build_tree_for(&job.process_name)
}

pub(super) fn notify(
    machine: &dyn StateMachine,
    timetable: &mut Timetable,
    uow: &UnitOfWork,
) -> Result<()> {
    let mut job = timetable.job_record(&uow.process_name, &uow.timeperiod)?;
    if job.state == JobState::FinalRun && job.related_unit_of_work == uow.id {
        machine.process_final_run(timetable, &mut job)
    } else {
        debug!(job = %job, uow = %uow.key(), "no FINAL_RUN pending; state change suppressed");
        Ok(())
    }
}
