use std::sync::Arc;

use tempo_core::config::StateMachineKind;
use tempo_store::{Job, JobState, UnitOfWork};

use super::{continuous, StateMachine};
use crate::error::Result;
use crate::publisher::Publisher;
use crate::source::DataSource;
use crate::timetable::Timetable;

/// Continuous processing over the grouped window: every run recomputes the
/// whole group from its first raw period.
pub struct RecomputingStateMachine {
    publisher: Arc<dyn Publisher>,
    source: Arc<dyn DataSource>,
}

impl RecomputingStateMachine {
    pub fn new(publisher: Arc<dyn Publisher>, source: Arc<dyn DataSource>) -> Self {
        Self { publisher, source }
    }
}

impl StateMachine for RecomputingStateMachine {
    fn kind(&self) -> StateMachineKind {
        StateMachineKind::Recomputing
    }

    fn publisher(&self) -> &dyn Publisher {
        self.publisher.as_ref()
    }

    fn window(&self, timetable: &Timetable, job: &Job) -> Result<(String, String)> {
        let grouping = timetable.process_config(&job.process_name)?.grouping()?;
        Ok(grouping.bounds(&job.timeperiod)?)
    }

    fn process_embryo(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        let source = self.source.as_ref();
        continuous::compute_and_transfer(self, source, timetable, job, JobState::InProgress, false)
    }

    fn process_in_progress(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        continuous::process_in_progress(self, self.source.as_ref(), timetable, job)
    }

    fn process_final_run(&self, timetable: &mut Timetable, job: &mut Job) -> Result<()> {
        continuous::process_final_run(timetable, job)
    }

    fn open_window(
        &self,
        timetable: &mut Timetable,
        job: &mut Job,
        uow: &UnitOfWork,
        recycle: bool,
    ) -> Result<()> {
        continuous::open_window(self, self.source.as_ref(), timetable, job, uow, recycle)
    }

    fn notify(&self, timetable: &mut Timetable, uow: &UnitOfWork) -> Result<()> {
        continuous::notify(self, timetable, uow)
    }
}
