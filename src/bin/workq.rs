//! workq CLI: run workers and inspect the shared queue.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use workq::claim::{ClaimStrategy, StrategyKind};
use workq::config::{Config, ScheduleConfig, SweepConfig, parse_duration};
use workq::db::Db;
use workq::error::{Error, Result};
use workq::model::{NewWorkItem, WorkId, WorkItem};
use workq::runner::{LogFailureHandler, LoopConfig, ResilientLoop};
use workq::schedule::{Scheduler, TaskRegistry};
use workq::store::{ClaimStore, LockingStore};
use workq::sweep::StaleClaimSweeper;
use workq::telemetry::{TelemetryConfig, init_telemetry};
use workq::worker::{ClaimWorker, Processor};

#[derive(Parser)]
#[command(name = "workq", about = "Work queue coordination over Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run worker loops and scheduled tasks until Ctrl-C
    Serve,
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Enqueue pending work items
    Enqueue {
        /// Application-defined item name
        name: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Number of identical items to enqueue
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Show item counts by status
    Status,
    /// Show a work item
    Show {
        /// Work item ID
        id: String,
    },
    /// Release stale claims once
    Sweep {
        /// Claims older than this are returned to pending (e.g. "5m")
        #[arg(long)]
        older_than: String,
    },
}

/// Context handed to scheduled task factories.
struct TaskContext {
    store: Arc<dyn ClaimStore>,
    sweep: Option<SweepConfig>,
}

/// Stand-in processor for `serve`: logs each item and marks it done.
struct LogProcessor;

#[async_trait::async_trait]
impl Processor for LogProcessor {
    async fn process(&self, item: &WorkItem, _cancel: &CancellationToken) -> Result<()> {
        info!(id = %item.id, name = %item.name, payload = %item.payload, "processed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Work { action } => {
            let url = std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL is not set"))?;
            let db = Db::connect(&url).await?;
            db.migrate().await?;

            match action {
                WorkAction::Enqueue {
                    name,
                    payload,
                    count,
                } => cmd_work_enqueue(&db, name, payload, count).await,
                WorkAction::Status => cmd_work_status(&db).await,
                WorkAction::Show { id } => cmd_work_show(&db, id).await,
                WorkAction::Sweep { older_than } => cmd_work_sweep(&db, older_than).await,
            }
        }
    }
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let worker = &config.worker;
    let db = Db::connect_with(config.database_url.expose_secret(), worker.pool_size()).await?;
    db.migrate().await?;
    let db = Arc::new(db);

    // Resolve schedules before spawning anything: an unknown task is fatal.
    let mut schedules = match &config.schedules_path {
        Some(path) => ScheduleConfig::load(path)?,
        None => ScheduleConfig::default(),
    };
    if let Some(sweep) = config.sweep {
        schedules = schedules.with_default(StaleClaimSweeper::key(), sweep.interval);
    }
    let mut registry: TaskRegistry<TaskContext> = TaskRegistry::new();
    registry.register_type::<StaleClaimSweeper, _>(|ctx: &TaskContext| {
        let sweep = ctx.sweep.ok_or_else(|| {
            Error::Config("stale-claim sweeper needs WORKQ_STALE_THRESHOLD".to_string())
        })?;
        Ok(StaleClaimSweeper::new(Arc::clone(&ctx.store), sweep.threshold))
    });
    let entries = registry.resolve(
        &schedules,
        &TaskContext {
            store: db.clone(),
            sweep: config.sweep,
        },
    )?;

    let strategy = match worker.strategy {
        StrategyKind::Lease => ClaimStrategy::LeaseBased(db.clone()),
        StrategyKind::Transaction => ClaimStrategy::TransactionScoped(db.clone()),
    };
    info!(
        strategy = %worker.strategy,
        workers = worker.workers,
        batch_size = worker.batch_size,
        schedules = entries.len(),
        "starting"
    );

    let scheduler = Scheduler::new().with_shutdown_grace(worker.shutdown_grace);
    scheduler.register_all(entries)?;

    let cancel = CancellationToken::new();
    let processor: Arc<dyn Processor> = Arc::new(LogProcessor);
    let handler = Arc::new(LogFailureHandler::new(worker.failure_backoff));
    let loops: Vec<_> = (0..worker.workers)
        .map(|i| {
            let factory =
                ClaimWorker::new(strategy.clone(), Arc::clone(&processor), worker.batch_size);
            let name = format!("{}#{i}", factory.owner_name());
            let runner = Arc::new(ResilientLoop::new(
                LoopConfig::new(name)
                    .idle_delay(worker.idle_delay)
                    .shutdown_grace(worker.shutdown_grace),
                Arc::new(factory),
                handler.clone(),
            ));
            runner.spawn(cancel.clone())
        })
        .collect();

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    cancel.cancel();

    for handle in loops {
        match handle.await {
            Ok(stats) => info!(
                iterations = stats.iterations,
                processed = stats.processed,
                failures = stats.failures,
                "worker stopped"
            ),
            Err(e) => warn!("worker task failed: {e}"),
        }
    }
    scheduler.stop().await;
    Ok(())
}

async fn cmd_work_enqueue(
    db: &Db,
    name: String,
    payload: Option<String>,
    count: usize,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let items = (0..count)
        .map(|_| NewWorkItem::new(&name).payload(payload.clone()))
        .collect();
    let items = db.enqueue_many(items).await?;

    for item in &items {
        println!("Enqueued: {} ({})", item.id, item.name);
    }
    Ok(())
}

async fn cmd_work_status(db: &Db) -> anyhow::Result<()> {
    let counts = db.count_by_status().await?;
    let available = db.count_available().await?;

    println!("{:<10}  {:>10}", "STATUS", "COUNT");
    println!("{}", "-".repeat(22));
    println!("{:<10}  {:>10}", "pending", counts.pending);
    println!("{:<10}  {:>10}", "claimed", counts.claimed);
    println!("{:<10}  {:>10}", "done", counts.done);
    println!("{}", "-".repeat(22));
    println!("{:<10}  {:>10}", "total", counts.total());
    println!("\n{available} pending item(s) not locked by an open transaction");
    Ok(())
}

async fn cmd_work_show(db: &Db, id: String) -> anyhow::Result<()> {
    let id = WorkId(uuid::Uuid::parse_str(&id)?);
    let item = db.get_work_item(id).await?;

    println!("ID:         {}", item.id);
    println!("Name:       {}", item.name);
    println!("Status:     {}", item.status);
    println!("Owner:      {}", item.owner.as_deref().unwrap_or("-"));
    println!(
        "Claimed At: {}",
        item.claimed_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Attempts:   {}", item.attempts);
    println!(
        "Payload:    {}",
        serde_json::to_string_pretty(&item.payload)?
    );
    println!("Created:    {}", item.created_at);
    println!("Updated:    {}", item.updated_at);
    Ok(())
}

async fn cmd_work_sweep(db: &Db, older_than: String) -> anyhow::Result<()> {
    let threshold: Duration = parse_duration("--older-than", &older_than)?;
    let sweeper = StaleClaimSweeper::new(Arc::new(db.clone()), threshold);
    let released = sweeper.sweep().await?;
    println!("Released {released} stale claim(s)");
    Ok(())
}
