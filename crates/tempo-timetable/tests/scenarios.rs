use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc::Receiver;

use tempo_core::config::TempoConfig;
use tempo_core::Clock;
use tempo_store::{
    FreerunEntry, Job, JobCollection, JobState, MqTransmission, Result as StoreResult,
    SqliteStore, Store, StoreError, UnitOfWork, UowState, UowType,
};
use tempo_timetable::{
    ChannelPublisher, ClockSource, FreerunStateMachine, Registry, SkipPolicy, Timetable,
    TimetableError, TxContext,
};

const HOURLY: &str = r#"
[scheduler]
start_timeperiod = "2024010100"

[processes.hourly_agg]
qualifier = "hourly"
state_machine = "discrete"

[trees.site]
processes = ["hourly_agg"]
"#;

const SITE: &str = r#"
[scheduler]
start_timeperiod = "2024010100"

[processes.daily_agg]
qualifier = "daily"
state_machine = "discrete"

[processes.hourly_agg]
qualifier = "hourly"
state_machine = "discrete"

[processes.hourly_report]
qualifier = "hourly"
state_machine = "discrete"

[trees.site]
processes = ["hourly_agg", "daily_agg"]

[trees.report]
processes = ["hourly_report"]
dependent_on = ["site"]
"#;

const STREAM: &str = r#"
[scheduler]
start_timeperiod = "2024010110"

[processes.hourly_stream]
qualifier = "hourly"
state_machine = "continuous"

[trees.stream]
processes = ["hourly_stream"]
"#;

const RECOMPUTE: &str = r#"
[scheduler]
start_timeperiod = "2024010100"

[processes.hourly_recompute]
qualifier = "hourly"
time_grouping = 3
state_machine = "recomputing"

[trees.recompute]
processes = ["hourly_recompute"]
"#;

const FREERUN: &str = r#"
[processes.cleanup]
qualifier = "real_time"
state_machine = "freerun"
arguments = { mode = "full" }

[[freerun]]
process_name = "cleanup"
entry_name = "nightly"
arguments = { batch = 10 }
"#;

struct Harness {
    timetable: Timetable,
    store: Arc<SqliteStore>,
    clock: Clock,
    dispatched: Receiver<MqTransmission>,
}

fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

fn seeded(document: &str, now: DateTime<Utc>, seed: impl FnOnce(&SqliteStore)) -> Harness {
    let config = Arc::new(TempoConfig::from_toml(document).unwrap());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed(&store);

    let clock = Clock::pinned(now);
    let (publisher, dispatched) = ChannelPublisher::new(64);
    let registry = Registry::standard(
        Arc::new(publisher),
        Arc::new(ClockSource::new(clock.clone())),
    );
    let timetable = Timetable::new(config, store.clone(), registry, clock.clone()).unwrap();
    Harness {
        timetable,
        store,
        clock,
        dispatched,
    }
}

fn unit_of_work(process: &str, timeperiod: &str, state: UowState) -> UnitOfWork {
    UnitOfWork {
        id: None,
        process_name: process.to_string(),
        timeperiod: timeperiod.to_string(),
        start_timeperiod: timeperiod.to_string(),
        end_timeperiod: timeperiod.to_string(),
        start_id: "0".to_string(),
        end_id: "0".to_string(),
        source: None,
        sink: None,
        arguments: Default::default(),
        state,
        created_at: at(2024, 1, 1, 0, 0),
        submitted_at: None,
        started_at: None,
        finished_at: None,
        number_of_retries: 0,
        uow_type: UowType::Managed,
    }
}

fn seed_job(
    store: &SqliteStore,
    collection: JobCollection,
    process: &str,
    timeperiod: &str,
    state: JobState,
    uow_state: Option<UowState>,
) {
    let mut job = Job::embryo(process, timeperiod);
    job.state = state;
    if let Some(uow_state) = uow_state {
        let uow = unit_of_work(process, timeperiod, uow_state);
        job.related_unit_of_work = Some(store.insert_uow(&uow).unwrap());
    }
    store.update_job(collection, &job).unwrap();
}

fn settle(store: &SqliteStore, id: i64, state: UowState) {
    let mut uow = store.get_uow(id).unwrap();
    uow.state = state;
    store.update_uow(&uow).unwrap();
}

fn manage(h: &mut Harness, process: &str) -> Job {
    let mut job = h.timetable.get_next_job_record(process).unwrap();
    let machine = h.timetable.state_machine_for(process).unwrap();
    machine.manage_job(&mut h.timetable, &mut job).unwrap();
    job
}

#[test]
fn discrete_hourly_job_runs_to_processed() {
    let mut h = seeded(HOURLY, at(2024, 1, 1, 0, 30), |_| {});

    let job = manage(&mut h, "hourly_agg");
    assert_eq!(job.state, JobState::InProgress);
    let first = h.dispatched.try_recv().unwrap().unit_of_work_id;
    let uow = h.store.get_uow(first).unwrap();
    assert_eq!(uow.start_timeperiod, "2024010100");
    assert_eq!(uow.end_timeperiod, "2024010101");
    assert_eq!((uow.start_id.as_str(), uow.end_id.as_str()), ("0", "0"));
    assert_eq!(uow.state, UowState::Requested);

    // Live window, unit of work still running: nothing new.
    h.clock.set(at(2024, 1, 1, 0, 40));
    manage(&mut h, "hourly_agg");
    assert!(h.dispatched.try_recv().is_err());

    // Finished while the window is live: follow-up with the next end_id.
    settle(&h.store, first, UowState::Processed);
    let job = manage(&mut h, "hourly_agg");
    let second = h.dispatched.try_recv().unwrap().unit_of_work_id;
    assert_ne!(second, first);
    assert_eq!(h.store.get_uow(second).unwrap().end_id, "1");
    assert_eq!(job.related_unit_of_work, Some(second));

    settle(&h.store, second, UowState::Processed);
    h.clock.set(at(2024, 1, 1, 2, 10));
    let job = manage(&mut h, "hourly_agg");
    assert_eq!(job.state, JobState::Processed);

    let stored = h
        .store
        .get_job(JobCollection::Hourly, "hourly_agg", "2024010100")
        .unwrap();
    assert_eq!(stored.state, JobState::Processed);
    assert_eq!(h.timetable.get_tree("hourly_agg").unwrap().len(), 3);
}

#[test]
fn concurrent_embryo_handling_shares_one_unit_of_work() {
    let mut h = seeded(HOURLY, at(2024, 1, 1, 0, 30), |_| {});
    let machine = h.timetable.state_machine_for("hourly_agg").unwrap();

    let mut first = h.timetable.get_next_job_record("hourly_agg").unwrap();
    let mut second = first.clone();
    machine.manage_job(&mut h.timetable, &mut first).unwrap();
    machine.manage_job(&mut h.timetable, &mut second).unwrap();

    assert_eq!(second.state, JobState::InProgress);
    assert_eq!(first.related_unit_of_work, second.related_unit_of_work);
    assert_eq!(h.store.get_uows_since(at(2023, 1, 1, 0, 0)).unwrap().len(), 1);

    let a = h.dispatched.try_recv().unwrap();
    let b = h.dispatched.try_recv().unwrap();
    assert_eq!(a.unit_of_work_id, b.unit_of_work_id);
}

#[test]
fn day_with_one_live_hour_is_not_skipped() {
    let now = at(2024, 1, 5, 0, 30);
    let mut h = seeded(SITE, now, |store| {
        for hour in 0..24 {
            let state = if hour == 23 { JobState::InProgress } else { JobState::Skipped };
            let tp = format!("20240101{hour:02}");
            seed_job(store, JobCollection::Hourly, "hourly_agg", &tp, state, None);
        }
    });

    let day = h.timetable.job_record("daily_agg", "2024010100").unwrap();
    assert_ne!(day.state, JobState::Skipped);

    let tree = h.timetable.get_tree("daily_agg").unwrap();
    let node = tree.find_node("daily_agg", "2024010100").unwrap();
    let policy = SkipPolicy::from_settings(&h.timetable.config().scheduler);
    assert!(!tree.should_skip(node, &policy, now));
}

#[test]
fn day_with_every_hour_skipped_is_skipped_on_validation() {
    let mut h = seeded(SITE, at(2024, 1, 5, 0, 30), |store| {
        for hour in 0..24 {
            let tp = format!("20240101{hour:02}");
            seed_job(store, JobCollection::Hourly, "hourly_agg", &tp, JobState::Skipped, None);
        }
    });

    let day = h.timetable.job_record("daily_agg", "2024010100").unwrap();
    assert_eq!(day.state, JobState::Skipped);
    // The latest day has no younger sibling and stays open.
    let today = h.timetable.job_record("daily_agg", "2024010500").unwrap();
    assert_eq!(today.state, JobState::Embryo);
}

#[test]
fn finalizable_waits_for_every_child() {
    let mut h = seeded(SITE, at(2024, 1, 2, 3, 0), |store| {
        seed_job(
            store,
            JobCollection::Daily,
            "daily_agg",
            "2024010100",
            JobState::InProgress,
            None,
        );
        for hour in 0..24 {
            let state = if hour == 5 { JobState::InProgress } else { JobState::Processed };
            let tp = format!("20240101{hour:02}");
            seed_job(store, JobCollection::Hourly, "hourly_agg", &tp, state, None);
        }
    });

    let mut day = h.timetable.job_record("daily_agg", "2024010100").unwrap();
    assert!(!h.timetable.is_job_record_finalizable(&mut day).unwrap());

    let mut hour = h.timetable.job_record("hourly_agg", "2024010105").unwrap();
    hour.state = JobState::Processed;
    h.timetable.update_job_state(&mut hour).unwrap();
    assert!(h.timetable.is_job_record_finalizable(&mut day).unwrap());
}

#[test]
fn unfinished_dependency_blocks_finalization() {
    let mut h = seeded(SITE, at(2024, 1, 1, 2, 0), |store| {
        seed_job(
            store,
            JobCollection::Hourly,
            "hourly_agg",
            "2024010100",
            JobState::InProgress,
            None,
        );
        seed_job(
            store,
            JobCollection::Hourly,
            "hourly_report",
            "2024010100",
            JobState::InProgress,
            None,
        );
    });

    let mut report = h.timetable.job_record("hourly_report", "2024010100").unwrap();
    assert!(!h.timetable.is_job_record_finalizable(&mut report).unwrap());
    assert!(report.event_log[0].contains("is blocked by unfinished"));
}

#[test]
fn reprocess_cascades_to_ancestors_and_dependants() {
    let mut h = seeded(SITE, at(2024, 1, 1, 0, 30), |store| {
        let processed = Some(UowState::Processed);
        seed_job(
            store,
            JobCollection::Hourly,
            "hourly_agg",
            "2024010100",
            JobState::Processed,
            processed,
        );
        seed_job(
            store,
            JobCollection::Daily,
            "daily_agg",
            "2024010100",
            JobState::Processed,
            processed,
        );
        seed_job(
            store,
            JobCollection::Hourly,
            "hourly_report",
            "2024010100",
            JobState::Processed,
            processed,
        );
    });

    let node = h.timetable.locate("hourly_agg", "2024010100").unwrap();
    let mut tx = TxContext::default();
    h.timetable.reprocess_tree_node(node, &mut tx).unwrap();
    assert_eq!(tx.len(), 3);

    for process in ["hourly_agg", "daily_agg", "hourly_report"] {
        let job = h.timetable.job_record(process, "2024010100").unwrap();
        assert_eq!(job.state, JobState::InProgress, "{process}");
        assert_eq!(job.number_of_failures, 0);
        let uow = h.store.get_uow(job.related_unit_of_work.unwrap()).unwrap();
        assert_eq!(uow.state, UowState::Requested, "{process}");
        assert_eq!(uow.end_id, "1");
    }
    let mut published = 0;
    while h.dispatched.try_recv().is_ok() {
        published += 1;
    }
    assert_eq!(published, 3);
}

#[test]
fn reprocess_leaves_pristine_embryo_alone() {
    let mut h = seeded(HOURLY, at(2024, 1, 1, 0, 30), |_| {});
    let node = h.timetable.locate("hourly_agg", "2024010100").unwrap();
    h.timetable.reprocess_tree_node(node, &mut TxContext::default()).unwrap();

    let job = h.timetable.job_record("hourly_agg", "2024010100").unwrap();
    assert_eq!(job.state, JobState::Embryo);
    assert!(h.dispatched.try_recv().is_err());
}

#[test]
fn skip_cascades_to_descendants_but_keeps_finished_ones() {
    let mut h = seeded(SITE, at(2024, 1, 1, 1, 30), |store| {
        seed_job(
            store,
            JobCollection::Hourly,
            "hourly_agg",
            "2024010100",
            JobState::Processed,
            None,
        );
        seed_job(
            store,
            JobCollection::Hourly,
            "hourly_agg",
            "2024010101",
            JobState::InProgress,
            Some(UowState::InProgress),
        );
    });

    let day = h.timetable.locate("daily_agg", "2024010100").unwrap();
    h.timetable.skip_tree_node(day, &mut TxContext::default()).unwrap();

    let state = |h: &mut Harness, p: &str, tp: &str| h.timetable.job_record(p, tp).unwrap().state;
    assert_eq!(state(&mut h, "daily_agg", "2024010100"), JobState::Skipped);
    assert_eq!(state(&mut h, "hourly_agg", "2024010100"), JobState::Processed);
    assert_eq!(state(&mut h, "hourly_agg", "2024010101"), JobState::Skipped);

    let live = h.timetable.job_record("hourly_agg", "2024010101").unwrap();
    let uow = h.store.get_uow(live.related_unit_of_work.unwrap()).unwrap();
    assert_eq!(uow.state, UowState::Canceled);
}

/// Claims every insert collides, then cannot find the colliding record.
struct FlakyStore {
    inner: SqliteStore,
}

impl Store for FlakyStore {
    fn get_job(&self, c: JobCollection, p: &str, t: &str) -> StoreResult<Job> {
        self.inner.get_job(c, p, t)
    }
    fn get_jobs(&self, c: JobCollection, since: &str) -> StoreResult<Vec<Job>> {
        self.inner.get_jobs(c, since)
    }
    fn update_job(&self, c: JobCollection, job: &Job) -> StoreResult<i64> {
        self.inner.update_job(c, job)
    }
    fn get_uow(&self, id: i64) -> StoreResult<UnitOfWork> {
        self.inner.get_uow(id)
    }
    fn get_uow_by_params(&self, p: &str, t: &str, _s: &str, _e: &str) -> StoreResult<UnitOfWork> {
        Err(StoreError::NotFound {
            entity: "unit of work",
            key: format!("{p}@{t}"),
        })
    }
    fn get_uows_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<UnitOfWork>> {
        self.inner.get_uows_since(since)
    }
    fn insert_uow(&self, uow: &UnitOfWork) -> StoreResult<i64> {
        Err(StoreError::DuplicateKey {
            process_name: uow.process_name.clone(),
            timeperiod: uow.timeperiod.clone(),
            start_id: uow.start_id.clone(),
            end_id: uow.end_id.clone(),
        })
    }
    fn update_uow(&self, uow: &UnitOfWork) -> StoreResult<()> {
        self.inner.update_uow(uow)
    }
    fn get_freerun(&self, p: &str, e: &str) -> StoreResult<FreerunEntry> {
        self.inner.get_freerun(p, e)
    }
    fn get_freeruns(&self) -> StoreResult<Vec<FreerunEntry>> {
        self.inner.get_freeruns()
    }
    fn update_freerun(&self, entry: &FreerunEntry) -> StoreResult<i64> {
        self.inner.update_freerun(entry)
    }
}

#[test]
fn lost_duplicate_requires_manual_intervention() {
    let config = Arc::new(TempoConfig::from_toml(HOURLY).unwrap());
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::open_in_memory().unwrap(),
    });
    let clock = Clock::pinned(at(2024, 1, 1, 0, 30));
    let (publisher, mut dispatched) = ChannelPublisher::new(8);
    let registry = Registry::standard(
        Arc::new(publisher),
        Arc::new(ClockSource::new(clock.clone())),
    );
    let mut timetable = Timetable::new(config, store.clone(), registry, clock).unwrap();

    let mut job = timetable.get_next_job_record("hourly_agg").unwrap();
    let machine = timetable.state_machine_for("hourly_agg").unwrap();
    let err = machine.manage_job(&mut timetable, &mut job).unwrap_err();
    assert!(matches!(err, TimetableError::ManualIntervention { .. }));

    let stored = store
        .get_job(JobCollection::Hourly, "hourly_agg", "2024010100")
        .unwrap();
    assert_eq!(stored.state, JobState::Embryo);
    assert!(stored.event_log[0].contains("MANUAL INTERVENTION REQUIRED"));
    assert!(dispatched.try_recv().is_err());
}

#[test]
fn missing_unit_of_work_counts_failures_until_skip() {
    let mut h = seeded(HOURLY, at(2024, 1, 4, 0, 30), |store| {
        let mut job = Job::embryo("hourly_agg", "2024010100");
        job.state = JobState::InProgress;
        job.related_unit_of_work = Some(999);
        store.update_job(JobCollection::Hourly, &job).unwrap();
    });
    let machine = h.timetable.state_machine_for("hourly_agg").unwrap();

    for expected in 1..=3 {
        let mut job = h.timetable.job_record("hourly_agg", "2024010100").unwrap();
        machine.manage_job(&mut h.timetable, &mut job).unwrap();
        assert_eq!(job.number_of_failures, expected);
        assert_eq!(job.state, JobState::InProgress);
    }

    let mut job = h.timetable.job_record("hourly_agg", "2024010100").unwrap();
    machine.manage_job(&mut h.timetable, &mut job).unwrap();
    assert_eq!(job.state, JobState::Skipped);
    assert_eq!(job.number_of_failures, 4);
}

#[test]
fn fresh_leaf_stays_on_life_support() {
    let mut h = seeded(HOURLY, at(2024, 1, 1, 5, 0), |store| {
        let mut job = Job::embryo("hourly_agg", "2024010100");
        job.state = JobState::InProgress;
        job.related_unit_of_work = Some(999);
        job.number_of_failures = 10;
        store.update_job(JobCollection::Hourly, &job).unwrap();
    });
    let machine = h.timetable.state_machine_for("hourly_agg").unwrap();

    let mut job = h.timetable.job_record("hourly_agg", "2024010100").unwrap();
    machine.manage_job(&mut h.timetable, &mut job).unwrap();
    assert_eq!(job.number_of_failures, 11);
    assert_eq!(job.state, JobState::InProgress);
}

#[test]
fn continuous_job_rescopes_then_final_runs() {
    let mut h = seeded(STREAM, at(2024, 1, 1, 10, 15), |_| {});
    let machine = h.timetable.state_machine_for("hourly_stream").unwrap();

    let job = manage(&mut h, "hourly_stream");
    assert_eq!(job.state, JobState::InProgress);
    let first = h.dispatched.try_recv().unwrap().unit_of_work_id;
    let uow = h.store.get_uow(first).unwrap();
    assert_eq!(uow.start_id, "20240101100000");
    assert_eq!(uow.end_id, "20240101101500");

    // Not picked up yet: the pending unit of work is widened in place.
    h.clock.set(at(2024, 1, 1, 10, 20));
    manage(&mut h, "hourly_stream");
    assert!(h.dispatched.try_recv().is_err());
    assert_eq!(h.store.get_uow(first).unwrap().end_id, "20240101102000");

    // Running: a new unit of work covers the grown range.
    settle(&h.store, first, UowState::InProgress);
    h.clock.set(at(2024, 1, 1, 10, 40));
    let job = manage(&mut h, "hourly_stream");
    let second = h.dispatched.try_recv().unwrap().unit_of_work_id;
    assert_eq!(job.related_unit_of_work, Some(second));
    assert_eq!(h.store.get_uow(second).unwrap().end_id, "20240101104000");

    // Window closed: one final run over the full range.
    h.clock.set(at(2024, 1, 1, 11, 5));
    let job = manage(&mut h, "hourly_stream");
    assert_eq!(job.state, JobState::FinalRun);
    let last = h.dispatched.try_recv().unwrap().unit_of_work_id;
    assert_eq!(h.store.get_uow(last).unwrap().end_id, "20240101110000");

    settle(&h.store, last, UowState::Processed);
    let uow = h.store.get_uow(last).unwrap();
    machine.notify(&mut h.timetable, &uow).unwrap();
    let job = h.timetable.job_record("hourly_stream", "2024010110").unwrap();
    assert_eq!(job.state, JobState::Processed);
}

#[test]
fn skipped_dependency_skips_the_dependant() {
    let mut h = seeded(SITE, at(2024, 1, 1, 0, 30), |store| {
        seed_job(store, JobCollection::Hourly, "hourly_agg", "2024010100", JobState::Skipped, None);
    });
    let machine = h.timetable.state_machine_for("hourly_report").unwrap();

    let mut job = h.timetable.get_next_job_record("hourly_report").unwrap();
    machine
        .manage_job_with_blocking_dependencies(&mut h.timetable, &mut job)
        .unwrap();
    assert_eq!(job.state, JobState::Skipped);
    let stored = h
        .store
        .get_job(JobCollection::Hourly, "hourly_report", "2024010100")
        .unwrap();
    assert_eq!(stored.state, JobState::Skipped);
}

#[test]
fn unprocessed_dependency_keeps_the_dependant_waiting() {
    let mut h = seeded(SITE, at(2024, 1, 1, 0, 30), |store| {
        seed_job(
            store,
            JobCollection::Hourly,
            "hourly_agg",
            "2024010100",
            JobState::InProgress,
            None,
        );
    });
    let machine = h.timetable.state_machine_for("hourly_report").unwrap();

    let mut job = h.timetable.get_next_job_record("hourly_report").unwrap();
    machine
        .manage_job_with_blocking_dependencies(&mut h.timetable, &mut job)
        .unwrap();
    assert_eq!(job.state, JobState::Embryo);
    assert!(job.event_log[0].contains("blocked by unprocessed dependencies"));
    assert!(h.dispatched.try_recv().is_err());
}

#[test]
fn simple_discrete_logs_unreachable_final_run() {
    const SIMPLE: &str = r#"
[processes.simple]
qualifier = "hourly"
state_machine = "simple_discrete"

[trees.simple]
processes = ["simple"]
"#;
    let mut h = seeded(SIMPLE, at(2024, 1, 1, 0, 30), |store| {
        seed_job(store, JobCollection::Hourly, "simple", "2024010100", JobState::FinalRun, None);
    });

    let job = manage(&mut h, "simple");
    assert_eq!(job.state, JobState::FinalRun);
    assert!(job.event_log[0].contains("unreachable"));
}

#[test]
fn freerun_lane_keeps_one_unit_of_work_in_flight() {
    let config = Arc::new(TempoConfig::from_toml(FREERUN).unwrap());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Clock::pinned(at(2024, 1, 1, 3, 0));
    let (publisher, mut dispatched) = ChannelPublisher::new(8);
    let freerun = FreerunStateMachine::new(
        config.clone(),
        store.clone(),
        Arc::new(publisher),
        clock.clone(),
    );
    let entry = &config.freerun[0];

    freerun.manage_schedulable(entry).unwrap();
    let message = dispatched.try_recv().unwrap();
    assert_eq!(message.process_name, "cleanup");
    assert_eq!(message.entry_name.as_deref(), Some("nightly"));
    let uow = store.get_uow(message.unit_of_work_id).unwrap();
    assert_eq!(uow.process_name, "cleanup::nightly");
    assert_eq!(uow.uow_type, UowType::Freerun);
    assert_eq!(uow.timeperiod, "20240101030000");
    assert!(uow.arguments.contains_key("mode") && uow.arguments.contains_key("batch"));

    // Still requested: republished, not replaced.
    freerun.manage_schedulable(entry).unwrap();
    assert_eq!(dispatched.try_recv().unwrap().unit_of_work_id, message.unit_of_work_id);

    settle(&store, message.unit_of_work_id, UowState::Processed);
    clock.advance(chrono::Duration::minutes(1));
    freerun.manage_schedulable(entry).unwrap();
    let next = dispatched.try_recv().unwrap().unit_of_work_id;
    assert_ne!(next, message.unit_of_work_id);

    freerun.cancel_uow(entry).unwrap();
    assert_eq!(store.get_uow(next).unwrap().state, UowState::Canceled);

    let persisted = store.get_freerun("cleanup", "nightly").unwrap();
    assert_eq!(persisted.related_unit_of_work, Some(next));
    assert!(!persisted.event_log.is_empty());
}

#[test]
fn freerun_entry_keeps_its_unit_of_work_when_dispatch_fails() {
    let config = Arc::new(TempoConfig::from_toml(FREERUN).unwrap());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Clock::pinned(at(2024, 1, 1, 3, 0));
    let (publisher, dispatched) = ChannelPublisher::new(8);
    drop(dispatched);
    let freerun =
        FreerunStateMachine::new(config.clone(), store.clone(), Arc::new(publisher), clock);
    let entry = &config.freerun[0];

    let err = freerun.manage_schedulable(entry).unwrap_err();
    assert!(matches!(err, TimetableError::Dispatch(_)), "{err}");
    let persisted = store.get_freerun("cleanup", "nightly").unwrap();
    let id = persisted.related_unit_of_work.unwrap();
    assert_eq!(store.get_uow(id).unwrap().state, UowState::Requested);

    // The next trigger republishes the same unit of work instead of adding one.
    assert!(freerun.manage_schedulable(entry).is_err());
    assert_eq!(store.get_uows_since(at(2023, 1, 1, 0, 0)).unwrap().len(), 1);
}

#[test]
fn reprocess_without_its_unit_of_work_returns_to_embryo() {
    let mut h = seeded(HOURLY, at(2024, 1, 1, 0, 30), |store| {
        let mut job = Job::embryo("hourly_agg", "2024010100");
        job.state = JobState::Processed;
        job.related_unit_of_work = Some(999);
        job.number_of_failures = 2;
        store.update_job(JobCollection::Hourly, &job).unwrap();
    });

    let node = h.timetable.locate("hourly_agg", "2024010100").unwrap();
    h.timetable
        .reprocess_tree_node(node, &mut TxContext::default())
        .unwrap();

    let job = h.timetable.job_record("hourly_agg", "2024010100").unwrap();
    assert_eq!(job.state, JobState::Embryo);
    assert_eq!(job.number_of_failures, 0);
    assert_eq!(job.related_unit_of_work, None);
    assert!(job.event_log.iter().any(|e| e.contains("which is gone")));
    let stored = h
        .store
        .get_job(JobCollection::Hourly, "hourly_agg", "2024010100")
        .unwrap();
    assert_eq!(stored.state, JobState::Embryo);
    assert!(h.dispatched.try_recv().is_err());
}

#[test]
fn non_numeric_discrete_marker_is_an_error() {
    let mut h = seeded(HOURLY, at(2024, 1, 1, 0, 30), |store| {
        let mut uow = unit_of_work("hourly_agg", "2024010100", UowState::Processed);
        uow.end_id = "tail".to_string();
        let mut job = Job::embryo("hourly_agg", "2024010100");
        job.state = JobState::InProgress;
        job.related_unit_of_work = Some(store.insert_uow(&uow).unwrap());
        store.update_job(JobCollection::Hourly, &job).unwrap();
    });
    let machine = h.timetable.state_machine_for("hourly_agg").unwrap();

    let mut job = h.timetable.get_next_job_record("hourly_agg").unwrap();
    let err = machine.manage_job(&mut h.timetable, &mut job).unwrap_err();
    assert!(
        matches!(&err, TimetableError::InvalidMarker { end_id, .. } if end_id == "tail"),
        "{err}"
    );
    assert!(h.dispatched.try_recv().is_err());
    assert_eq!(h.store.get_uows_since(at(2023, 1, 1, 0, 0)).unwrap().len(), 1);
}

#[test]
fn recomputing_job_reruns_the_whole_group() {
    let mut h = seeded(RECOMPUTE, at(2024, 1, 1, 1, 15), |_| {});
    let machine = h.timetable.state_machine_for("hourly_recompute").unwrap();

    // Hours 00..=03 share the group closing at 03.
    let job = manage(&mut h, "hourly_recompute");
    assert_eq!(job.timeperiod, "2024010103");
    assert_eq!(job.state, JobState::InProgress);
    let first = h.dispatched.try_recv().unwrap().unit_of_work_id;
    let uow = h.store.get_uow(first).unwrap();
    assert_eq!(uow.start_timeperiod, "2024010100");
    assert_eq!(uow.end_timeperiod, "2024010104");
    assert_eq!(uow.start_id, "20240101000000");
    assert_eq!(uow.end_id, "20240101011500");

    // Still requested: the pending unit of work is widened in place.
    h.clock.set(at(2024, 1, 1, 1, 45));
    manage(&mut h, "hourly_recompute");
    assert!(h.dispatched.try_recv().is_err());
    assert_eq!(h.store.get_uow(first).unwrap().end_id, "20240101014500");

    // Finished while the group is live: the next run starts over from hour 00.
    settle(&h.store, first, UowState::Processed);
    h.clock.set(at(2024, 1, 1, 2, 30));
    let job = manage(&mut h, "hourly_recompute");
    let second = h.dispatched.try_recv().unwrap().unit_of_work_id;
    assert_ne!(second, first);
    assert_eq!(job.related_unit_of_work, Some(second));
    let uow = h.store.get_uow(second).unwrap();
    assert_eq!(uow.start_id, "20240101000000");
    assert_eq!(uow.end_id, "20240101023000");

    // Group closed: the final run is capped at the group end.
    settle(&h.store, second, UowState::Processed);
    h.clock.set(at(2024, 1, 1, 4, 30));
    let job = manage(&mut h, "hourly_recompute");
    assert_eq!(job.timeperiod, "2024010103");
    assert_eq!(job.state, JobState::FinalRun);
    let last = h.dispatched.try_recv().unwrap().unit_of_work_id;
    assert_eq!(h.store.get_uow(last).unwrap().end_id, "20240101040000");

    settle(&h.store, last, UowState::Processed);
    let uow = h.store.get_uow(last).unwrap();
    machine.notify(&mut h.timetable, &uow).unwrap();
    let job = h.timetable.job_record("hourly_recompute", "2024010103").unwrap();
    assert_eq!(job.state, JobState::Processed);

    let next = h.timetable.get_next_job_record("hourly_recompute").unwrap();
    assert_eq!(next.timeperiod, "2024010106");
}
