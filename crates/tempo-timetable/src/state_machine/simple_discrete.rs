use std::sync::Arc;

use tempo_core::config::StateMachineKind;
use tempo_core::time::increment;
use tempo_store::{Job, JobState, UnitOfWork};

use super::{discrete, StateMachine};
use crate::error::Result;
use crate::publisher::Publisher;
use crate::timetable::Timetable;

/// Discrete processing over the raw `[tp, tp+1)` window without a FINAL_RUN
/// step: jobs resolve straight from IN_PROGRESS.
pub struct SimpleDiscreteStateMachine {
    publisher: Arc<dyn Publisher>,
}

impl SimpleDiscreteStateMachine {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }
}

impl StateMachine for SimpleDiscreteStateMachine {
    fn kind(&self) -> StateMachineKind {
        StateMachineKind::SimpleDiscrete
    }

    fn publisher(&self) -> &dyn Publisher {
        self.publisher.as_ref()
    }

    fn handles(&self, state: JobState) -> bool {
        state != JobState::FinalRun
    }

    fn window(&self, timetable: &Timetable, job: &Job) -> Result<(String, String)> {
        let qualifier = timetable.process_config(&job.process_name)?.qualifier;
        let end = increment(qualifier, &job.timeperiod, 1)?;
        Ok((job.timeperiod.clone(), end))
    }

    fn process_embryo(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        discrete::emit_initial(self, timetable, job)
    }

    fn process_in_progress(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        discrete::process_in_progress(self, timetable, job)
    }

    fn open_window(
        &self,
        timetable: &mut Timetable,
        job: &mut Job,
        uow: &UnitOfWork,
        recycle: bool,
    ) -> Result<()> {
        discrete::open_window(self, timetable, job, uow, recycle)
    }

    fn notify(&self, timetable: &mut Timetable, uow: &UnitOfWork) -> Result<()> {
        discrete::notify(timetable, uow)
    }
}
