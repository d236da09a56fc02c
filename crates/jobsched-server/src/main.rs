use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::Parser;
use jobsched_core::{JobschedConfig, SequenceKind, StorageBackend};
use jobsched_scheduler::{
    ClusterGate, ControlState, FileSequence, IdGenerator, MemoryRepository, Repository,
    ScheduleControlListener, ScheduleManager, SqliteRepository, TimeoverEvent, UuidIdGenerator,
};
use tracing::{info, warn};

mod masters;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "jobsched-server")]
#[command(about = "Generates schedule instances and runs the control-state and timeover monitors")]
#[command(version)]
struct Args {
    /// Config file path (falls back to $JOBSCHED_CONFIG, then ~/.jobsched/jobsched.toml).
    #[arg(short, long)]
    config: Option<String>,

    /// Reference date (YYYY-MM-DD) for start-up generation. Defaults to today (UTC).
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Generate for the reference date, then exit without starting the monitor.
    #[arg(long)]
    generate_only: bool,

    /// With clustering enabled, start as leader instead of follower.
    #[arg(long)]
    leader: bool,
}

/// Logs every control request. Real executors register their own listener.
struct LoggingListener;

impl ScheduleControlListener for LoggingListener {
    fn name(&self) -> &str {
        "log"
    }

    fn on_control_state_changed(
        &self,
        schedule_id: &str,
        control_state: ControlState,
    ) -> Result<(), String> {
        info!(schedule_id, %control_state, "control request");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobsched_server=info,jobsched_scheduler=info".into()),
        )
        .init();

    // load config: --config > JOBSCHED_CONFIG env > ~/.jobsched/jobsched.toml
    let config_path = args.config.clone().or_else(|| std::env::var("JOBSCHED_CONFIG").ok());
    let config = JobschedConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        JobschedConfig::default()
    });

    let repo = open_repository(&config)?;
    let ids = open_sequence(&config)?;
    let manager = ScheduleManager::from_config(repo, ids, &config.generator)?;

    if let Some(path) = &config.generator.masters_path {
        let loaded = masters::load_masters(std::path::Path::new(path))?;
        for master in &loaded {
            manager.register_master(master)?;
        }
        info!(count = loaded.len(), path = %path, "masters registered");
    }

    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    if config.generator.generate_on_start || args.generate_only {
        match manager.generate_if_absent(date)? {
            Some(made) => info!(%date, count = made.len(), "start-up generation complete"),
            None => info!(%date, "start-up generation skipped"),
        }
    }
    if args.generate_only {
        return Ok(());
    }

    manager.add_control_listener(Arc::new(LoggingListener))?;

    let gate = config.cluster.enabled.then(ClusterGate::new);
    if let Some(gate) = &gate {
        if args.leader {
            gate.on_become_leader();
        } else {
            info!("cluster mode: monitor waits for leadership");
        }
    }

    // Timeover events: TimeoverDaemon → log sink
    let (timeover_tx, mut timeover_rx) = tokio::sync::mpsc::channel::<TimeoverEvent>(256);
    tokio::spawn(async move {
        while let Some(event) = timeover_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "timeover"),
                Err(e) => warn!(
                    schedule_id = %event.schedule_id,
                    "unserialisable timeover event: {e}"
                ),
            }
        }
    });

    let monitor = manager.spawn_monitor(&config.monitor, gate.as_ref(), Some(timeover_tx));
    info!("jobsched server running, Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    monitor.shutdown().await;
    Ok(())
}

fn open_repository(config: &JobschedConfig) -> anyhow::Result<Arc<dyn Repository>> {
    match config.database.backend {
        StorageBackend::Memory => {
            info!("using in-memory storage");
            Ok(Arc::new(MemoryRepository::new()))
        }
        StorageBackend::Sqlite => {
            let db_path = &config.database.path;
            ensure_parent_dir(db_path);
            info!(path = %db_path, "opening SQLite database");
            let db = rusqlite::Connection::open(db_path)?;
            db.execute_batch("PRAGMA journal_mode=WAL;")?;
            Ok(Arc::new(SqliteRepository::new(db)?))
        }
    }
}

fn open_sequence(config: &JobschedConfig) -> anyhow::Result<Arc<dyn IdGenerator>> {
    Ok(match config.sequence.kind {
        SequenceKind::File => Arc::new(FileSequence::open(&config.sequence.path)?),
        SequenceKind::Uuid => Arc::new(UuidIdGenerator),
    })
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
