use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tempo_core::config::TempoConfig;
use tempo_core::Clock;
use tempo_store::{Reconnecting, RetryPolicy, SqliteStore, Store};
use tempo_timetable::{
    ChannelPublisher, ClockSource, FreerunStateMachine, Publisher, Registry, Timetable,
};
use tempo_scheduler::SchedulerEngine;

#[derive(Parser)]
#[command(name = "tempo-scheduler")]
#[command(about = "Time-window job orchestrator")]
struct Args {
    /// Configuration file (falls back to TEMPO_CONFIG, then ~/.tempo/tempo.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Capacity of the in-process dispatch queue
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempo_scheduler=info,tempo_timetable=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(TempoConfig::load(args.config.as_deref())?);
    info!(
        processes = config.processes.len(),
        trees = config.trees.len(),
        freerun = config.freerun.len(),
        "configuration loaded"
    );

    let db_path = &config.database.path;
    ensure_parent_dir(db_path)?;
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn Store> = Arc::new(Reconnecting::new(
        SqliteStore::open(db_path)?,
        RetryPolicy::from_settings(&config.scheduler),
    ));

    // Dispatch queue: state machines → workers
    let (publisher, mut dispatched) = ChannelPublisher::new(args.queue_capacity);
    let publisher: Arc<dyn Publisher> = Arc::new(publisher);
    tokio::spawn(async move {
        while let Some(message) = dispatched.recv().await {
            info!(
                process = %message.process_name,
                entry = message.entry_name.as_deref().unwrap_or("-"),
                uow = message.unit_of_work_id,
                "unit of work dispatched"
            );
        }
    });

    // Status queue: workers → state machines
    let (status_tx, status_rx) = tokio::sync::mpsc::channel(256);

    let clock = Clock::system();
    let registry = Registry::standard(
        Arc::clone(&publisher),
        Arc::new(ClockSource::new(clock.clone())),
    );
    let timetable = Timetable::new(
        Arc::clone(&config),
        Arc::clone(&store),
        registry,
        clock.clone(),
    )?;
    let freerun = FreerunStateMachine::new(config, store, publisher, clock);
    let engine = SchedulerEngine::new(timetable, freerun, Some(status_rx));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    let _ = shutdown_tx.send(true);
    drop(status_tx);
    handle.await?;
    Ok(())
}

fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    Ok(())
}
