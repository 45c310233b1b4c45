use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use tempo_core::config::{BlockingType, FreerunConfig, StateMachineKind};
use tempo_core::time::{increment, to_datetime};
use tempo_store::{Job, MqTransmission, UowType};
use tempo_timetable::{FreerunStateMachine, Timetable};

use crate::error::{Result, SchedulerError};

/// Drives the timetable from tokio timers until shutdown.
pub struct SchedulerEngine {
    timetable: Arc<Mutex<Timetable>>,
    freerun: Arc<FreerunStateMachine>,
    /// Worker status reports; `None` when nothing reports back.
    status_rx: Option<mpsc::Receiver<MqTransmission>>,
}

impl SchedulerEngine {
    pub fn new(
        timetable: Timetable,
        freerun: FreerunStateMachine,
        status_rx: Option<mpsc::Receiver<MqTransmission>>,
    ) -> Self {
        Self {
            timetable: Arc::new(Mutex::new(timetable)),
            freerun: Arc::new(freerun),
            status_rx,
        }
    }

    /// Shared handle on the timetable the triggers operate on.
    pub fn timetable(&self) -> Arc<Mutex<Timetable>> {
        Arc::clone(&self.timetable)
    }

    /// Main event loop. Starts one timer per process and freerun entry and
    /// serves status reports until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        let triggers = self.spawn_triggers(&shutdown);

        loop {
            tokio::select! {
                report = next_report(&mut self.status_rx) => match report {
                    Some(report) => {
                        let timetable = Arc::clone(&self.timetable);
                        let outcome =
                            tokio::task::spawn_blocking(move || handle_status(&timetable, &report))
                                .await;
                        if let Err(e) = flatten(outcome) {
                            error!("status report failed: {e}");
                        }
                    }
                    None => {
                        debug!("status channel closed");
                        self.status_rx = None;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }

        for trigger in triggers {
            if let Err(e) = trigger.await {
                warn!("trigger task ended abnormally: {e}");
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    fn spawn_triggers(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let (config, housekeeping_every) = {
            let timetable = self.timetable.lock().unwrap();
            let config = timetable.config().clone();
            let every = Duration::from_secs(config.scheduler.housekeeping_interval_secs);
            (config, every)
        };
        let mut triggers = Vec::new();

        for (name, process) in &config.processes {
            if process.state_machine == StateMachineKind::Freerun {
                continue;
            }
            if !process.is_on {
                info!(process = %name, "process is off; no trigger scheduled");
                continue;
            }
            if self.timetable.lock().unwrap().get_tree(name).is_err() {
                warn!(process = %name, "process belongs to no tree; no trigger scheduled");
                continue;
            }
            let timetable = Arc::clone(&self.timetable);
            let process_name = name.clone();
            triggers.push(tokio::spawn(every(
                name.clone(),
                Duration::from_secs(process.trigger_interval_secs),
                shutdown.clone(),
                move || fire_managed_worker(&timetable, &process_name),
            )));
        }

        for entry in config.freerun.iter().filter(|entry| entry.is_on) {
            let timetable = Arc::clone(&self.timetable);
            let freerun = Arc::clone(&self.freerun);
            let schedulable = entry.clone();
            triggers.push(tokio::spawn(every(
                format!("{}::{}", entry.process_name, entry.entry_name),
                Duration::from_secs(entry.trigger_interval_secs),
                shutdown.clone(),
                move || fire_freerun_worker(&timetable, &freerun, &schedulable),
            )));
        }

        let timetable = Arc::clone(&self.timetable);
        triggers.push(tokio::spawn(every(
            "housekeeping".to_string(),
            housekeeping_every,
            shutdown.clone(),
            move || housekeeping(&timetable),
        )));

        info!(count = triggers.len(), "triggers scheduled");
        triggers
    }
}

/// Request the next job of `process_name` and drive it one step. A job that
/// finishes on this step hands over to the next one in the same tick.
#[instrument(skip(timetable))]
pub fn fire_managed_worker(timetable: &Mutex<Timetable>, process_name: &str) -> Result<()> {
    let mut guard = timetable.lock().unwrap();
    let timetable = &mut *guard;
    let process = timetable.process_config(process_name)?.clone();
    let machine = timetable.state_machine_for(process_name)?;
    let lag = chrono::Duration::minutes(timetable.config().scheduler.lag_minutes);

    let mut previous: Option<Job> = None;
    loop {
        let mut job = timetable.get_next_job_record(process_name)?;
        if previous
            .as_ref()
            .is_some_and(|p| p.timeperiod == job.timeperiod)
        {
            return Ok(());
        }

        if !process.run_on_active_timeperiod() {
            let due = to_datetime(&increment(process.qualifier, &job.timeperiod, 1)?)? + lag;
            if timetable.now() <= due {
                info!(
                    timeperiod = %job.timeperiod,
                    due = %due.format("%Y-%m-%d %H:%M:%S"),
                    "job will not be triggered until its window closes"
                );
                return Ok(());
            }
        }

        match process.blocking {
            BlockingType::Normal => machine.manage_job(timetable, &mut job)?,
            BlockingType::Dependencies => {
                machine.manage_job_with_blocking_dependencies(timetable, &mut job)?
            }
            BlockingType::Children => {
                machine.manage_job_with_blocking_children(timetable, &mut job)?
            }
        }

        if !job.is_finished() {
            return Ok(());
        }
        previous = Some(job);
    }
}

/// One trigger of a freerun lane. Holds the timetable lock so freerun
/// decisions never interleave with managed ones.
#[instrument(skip_all, fields(process = %entry.process_name, entry = %entry.entry_name))]
pub fn fire_freerun_worker(
    timetable: &Mutex<Timetable>,
    freerun: &FreerunStateMachine,
    entry: &FreerunConfig,
) -> Result<()> {
    let _guard = timetable.lock().unwrap();
    freerun.manage_schedulable(entry)?;
    Ok(())
}

/// Extend every tree to the present and re-run validation.
pub fn housekeeping(timetable: &Mutex<Timetable>) -> Result<()> {
    let mut timetable = timetable.lock().unwrap();
    timetable.build_trees()?;
    timetable.validate()?;
    debug!("housekeeping complete");
    Ok(())
}

/// Route a worker status report to the state machine that owns the unit
/// of work. Reports from freerun lanes carry no tree state and are ignored.
pub fn handle_status(timetable: &Mutex<Timetable>, report: &MqTransmission) -> Result<()> {
    let mut guard = timetable.lock().unwrap();
    let timetable = &mut *guard;
    let uow = timetable.store().get_uow(report.unit_of_work_id)?;
    if uow.uow_type != UowType::Managed {
        info!(
            entry = %uow.process_name,
            uow = %uow.key(),
            "status report from a freerun lane; ignoring"
        );
        return Ok(());
    }
    info!(
        process = %uow.process_name,
        timeperiod = %uow.timeperiod,
        state = %uow.state,
        "status report received"
    );
    let machine = timetable.state_machine_for(&uow.process_name)?;
    machine.notify(timetable, &uow)?;
    Ok(())
}

/// Run `task` on the blocking pool every `period` until shutdown.
fn every<F>(
    label: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) -> impl Future<Output = ()> + Send + 'static
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    let task = Arc::new(task);
    async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let task = Arc::clone(&task);
                    let outcome = tokio::task::spawn_blocking(move || task()).await;
                    if let Err(e) = flatten(outcome) {
                        error!(trigger = %label, "trigger failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(trigger = %label, "trigger stopped");
                        break;
                    }
                }
            }
        }
    }
}

async fn next_report(rx: &mut Option<mpsc::Receiver<MqTransmission>>) -> Option<MqTransmission> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn flatten(outcome: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    outcome.map_err(|e| SchedulerError::Join(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tempo_core::config::TempoConfig;
    use tempo_core::Clock;
    use tempo_store::{JobCollection, JobState, SqliteStore, Store, UowState};
    use tempo_timetable::{ChannelPublisher, ClockSource, Publisher, Registry};

    const HOURLY: &str = r#"
[scheduler]
start_timeperiod = "2024010100"

[processes.hourly_agg]
qualifier = "hourly"
state_machine = "discrete"

[processes.cleanup]
qualifier = "real_time"
state_machine = "freerun"

[trees.site]
processes = ["hourly_agg"]

[[freerun]]
process_name = "cleanup"
entry_name = "nightly"
"#;

    struct Fixture {
        timetable: Timetable,
        freerun: FreerunStateMachine,
        store: Arc<SqliteStore>,
        dispatched: mpsc::Receiver<MqTransmission>,
    }

    fn at(h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, min, 0).unwrap()
    }

    fn fixture(now: DateTime<Utc>) -> Fixture {
        let config = Arc::new(TempoConfig::from_toml(HOURLY).unwrap());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Clock::pinned(now);
        let (publisher, dispatched) = ChannelPublisher::new(16);
        let publisher: Arc<dyn Publisher> = Arc::new(publisher);
        let registry = Registry::standard(
            Arc::clone(&publisher),
            Arc::new(ClockSource::new(clock.clone())),
        );
        let timetable =
            Timetable::new(Arc::clone(&config), store.clone(), registry, clock.clone()).unwrap();
        let freerun = FreerunStateMachine::new(config, store.clone(), publisher, clock);
        Fixture {
            timetable,
            freerun,
            store,
            dispatched,
        }
    }

    fn hourly_job(store: &SqliteStore, timeperiod: &str) -> Job {
        store
            .get_job(JobCollection::Hourly, "hourly_agg", timeperiod)
            .unwrap()
    }

    #[test]
    fn job_is_not_triggered_within_lag() {
        let mut f = fixture(at(1, 3));
        let timetable = Mutex::new(f.timetable);

        fire_managed_worker(&timetable, "hourly_agg").unwrap();

        assert!(f.dispatched.try_recv().is_err());
        let job = timetable
            .lock()
            .unwrap()
            .job_record("hourly_agg", "2024010100")
            .unwrap();
        assert_eq!(job.state, JobState::Embryo);
    }

    #[test]
    fn closed_window_emits_unit_of_work() {
        let mut f = fixture(at(2, 30));
        let timetable = Mutex::new(f.timetable);

        fire_managed_worker(&timetable, "hourly_agg").unwrap();

        let message = f.dispatched.try_recv().unwrap();
        assert_eq!(message.process_name, "hourly_agg");
        assert_eq!(message.entry_name, None);
        let job = hourly_job(&f.store, "2024010100");
        assert_eq!(job.state, JobState::InProgress);
        assert_eq!(job.related_unit_of_work, Some(message.unit_of_work_id));
        assert!(f.dispatched.try_recv().is_err());
    }

    #[test]
    fn status_report_resolves_job_and_next_tick_moves_on() {
        let mut f = fixture(at(2, 30));
        let timetable = Mutex::new(f.timetable);

        fire_managed_worker(&timetable, "hourly_agg").unwrap();
        let message = f.dispatched.try_recv().unwrap();
        let mut uow = f.store.get_uow(message.unit_of_work_id).unwrap();
        uow.state = UowState::Processed;
        f.store.update_uow(&uow).unwrap();

        handle_status(&timetable, &message).unwrap();
        assert_eq!(hourly_job(&f.store, "2024010100").state, JobState::Processed);

        fire_managed_worker(&timetable, "hourly_agg").unwrap();
        let next = f.dispatched.try_recv().unwrap();
        let uow = f.store.get_uow(next.unit_of_work_id).unwrap();
        assert_eq!(uow.timeperiod, "2024010101");
    }

    #[test]
    fn freerun_status_report_is_ignored() {
        let mut f = fixture(at(2, 30));
        let entry = f.timetable.config().freerun[0].clone();
        let timetable = Mutex::new(f.timetable);

        fire_freerun_worker(&timetable, &f.freerun, &entry).unwrap();
        let message = f.dispatched.try_recv().unwrap();
        assert_eq!(message.entry_name.as_deref(), Some("nightly"));

        handle_status(&timetable, &message).unwrap();
        assert_eq!(hourly_job(&f.store, "2024010100").state, JobState::Embryo);
    }

    #[test]
    fn housekeeping_extends_the_tree() {
        let f = fixture(at(2, 30));
        let clock = f.timetable.clock().clone();
        let timetable = Mutex::new(f.timetable);
        let nodes = |t: &Mutex<Timetable>| t.lock().unwrap().get_tree("hourly_agg").unwrap().len();
        assert_eq!(nodes(&timetable), 3);

        clock.set(at(5, 30));
        housekeeping(&timetable).unwrap();

        assert_eq!(nodes(&timetable), 6);
        let stored = hourly_job(&f.store, "2024010105");
        assert_eq!(stored.state, JobState::Embryo);
    }

    #[tokio::test]
    async fn engine_dispatches_and_serves_status_until_shutdown() {
        let mut f = fixture(at(2, 30));
        let (status_tx, status_rx) = mpsc::channel(8);
        let engine = SchedulerEngine::new(f.timetable, f.freerun, Some(status_rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(shutdown_rx));

        let mut managed = None;
        let mut freerun = None;
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(5), f.dispatched.recv())
                .await
                .unwrap()
                .unwrap();
            match message.entry_name {
                Some(_) => freerun = Some(message),
                None => managed = Some(message),
            }
        }
        let managed = managed.unwrap();
        assert_eq!(freerun.unwrap().process_name, "cleanup");

        let mut uow = f.store.get_uow(managed.unit_of_work_id).unwrap();
        uow.state = UowState::Processed;
        f.store.update_uow(&uow).unwrap();
        status_tx.send(managed).await.unwrap();

        let mut state = JobState::InProgress;
        for _ in 0..100 {
            state = hourly_job(&f.store, "2024010100").state;
            if state == JobState::Processed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, JobState::Processed);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
