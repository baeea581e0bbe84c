//! `dagflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    : API server, scheduler and dispatchers in one process.
//! - `scheduler`: only the dependency scheduler and retention cleanup.
//! - `worker`   : only task dispatchers.
//! - `migrate`  : run pending database migrations.
//! - `validate` : validate a workflow JSON file.
//! - `import`   : validate a workflow JSON file and store it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use db::pool::{self, PoolSettings};
use db::PgStore;
use engine::{DependencyScheduler, EngineConfig, EngineContext, RetryPolicy, TaskDispatcher};
use nodes::NodeRegistry;
use queue::PgQueue;

#[derive(Parser)]
#[command(name = "dagflow", about = "Durable DAG workflow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API with a scheduler and dispatchers.
    Serve {
        #[arg(long, env = "DAGFLOW_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
        #[arg(long, env = "DAGFLOW_WORKERS", default_value_t = 4)]
        workers: usize,
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run the dependency scheduler and retention cleanup.
    Scheduler {
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run task dispatchers.
    Worker {
        #[arg(long, env = "DAGFLOW_WORKERS", default_value_t = 4)]
        workers: usize,
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[command(flatten)]
        db: DatabaseArgs,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Validate a workflow definition and store it as a new version.
    Import {
        path: PathBuf,
        /// Defaults to the file name without extension.
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        db: DatabaseArgs,
    },
}

#[derive(Args)]
struct DatabaseArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, env = "DAGFLOW_DB_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
    #[arg(long, env = "DAGFLOW_DB_ACQUIRE_TIMEOUT_SECS", default_value_t = 5)]
    acquire_timeout_secs: u64,
}

impl DatabaseArgs {
    fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

#[derive(Args)]
struct EngineArgs {
    #[arg(long, env = "DAGFLOW_SCHEDULER_INTERVAL_SECS", default_value_t = 30)]
    scheduler_interval_secs: u64,
    #[arg(long, env = "DAGFLOW_CLEANUP_INTERVAL_SECS", default_value_t = 3600)]
    cleanup_interval_secs: u64,
    #[arg(long, env = "DAGFLOW_RETENTION_HOURS", default_value_t = 24)]
    retention_hours: u64,
    #[arg(long, env = "DAGFLOW_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,
    #[arg(long, env = "DAGFLOW_HANDLER_TIMEOUT_SECS", default_value_t = 60)]
    handler_timeout_secs: u64,
    #[arg(long, env = "DAGFLOW_STALE_TASK_SECS", default_value_t = 300)]
    stale_task_secs: u64,
    #[arg(long, env = "DAGFLOW_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        EngineConfig {
            scheduler_interval: Duration::from_secs(self.scheduler_interval_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            retention: Duration::from_secs(self.retention_hours * 60 * 60),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            stale_task_after: Duration::from_secs(self.stale_task_secs),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { bind, workers, db, engine } => {
            let ctx = connect(&db, engine.config()).await?;
            let shutdown = shutdown_on_ctrl_c();

            let mut tasks = JoinSet::new();
            spawn_scheduler(&mut tasks, &ctx, &shutdown);
            spawn_dispatchers(&mut tasks, &ctx, &shutdown, workers);

            let served = api::serve(bind, ctx, shutdown.clone()).await;
            shutdown.cancel();
            while tasks.join_next().await.is_some() {}
            served.context("api server failed")?;
        }
        Command::Scheduler { db, engine } => {
            let ctx = connect(&db, engine.config()).await?;
            let shutdown = shutdown_on_ctrl_c();
            let mut tasks = JoinSet::new();
            spawn_scheduler(&mut tasks, &ctx, &shutdown);
            while tasks.join_next().await.is_some() {}
        }
        Command::Worker { workers, db, engine } => {
            let ctx = connect(&db, engine.config()).await?;
            let shutdown = shutdown_on_ctrl_c();
            let mut tasks = JoinSet::new();
            spawn_dispatchers(&mut tasks, &ctx, &shutdown, workers);
            while tasks.join_next().await.is_some() {}
        }
        Command::Migrate { db } => {
            info!("Running migrations");
            let pool = pool::create_pool(
                &db.database_url,
                &PoolSettings { max_connections: 2, ..db.pool_settings() },
            )
            .await?;
            pool::run_migrations(&pool).await?;
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let definition = read_definition(&path)?;
            let (workflow, order) = engine::parse_workflow(&workflow_name(&path, None), definition)?;
            println!(
                "✅ Workflow '{}' is valid ({} nodes). Execution order: {order:?}",
                workflow.name,
                workflow.nodes.len()
            );
        }
        Command::Import { path, name, db } => {
            let definition = read_definition(&path)?;
            let name = workflow_name(&path, name);
            let ctx = connect(&db, EngineConfig::default()).await?;
            let row = engine::register_workflow(&ctx, &name, definition).await?;
            println!("✅ Imported '{}' version {} as {}", row.name, row.version, row.id);
        }
    }

    Ok(())
}

async fn connect(db: &DatabaseArgs, config: EngineConfig) -> Result<EngineContext> {
    let pool = pool::create_pool(&db.database_url, &db.pool_settings())
        .await
        .context("failed to connect to database")?;
    let http = reqwest::Client::builder()
        .user_agent(concat!("dagflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build http client")?;

    let ctx = EngineContext::new(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(PgQueue::new(pool)),
        NodeRegistry::with_builtins(http),
    )
    .with_config(config);
    info!(node_types = ?ctx.registry.node_types(), "engine ready");
    Ok(ctx)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => error!(error = %err, "failed to listen for ctrl-c"),
        }
        trigger.cancel();
    });
    token
}

fn spawn_scheduler(tasks: &mut JoinSet<()>, ctx: &EngineContext, shutdown: &CancellationToken) {
    let scheduler = DependencyScheduler::new(ctx.clone());
    let shutdown = shutdown.clone();
    tasks.spawn(async move { scheduler.run(shutdown).await });
}

fn spawn_dispatchers(
    tasks: &mut JoinSet<()>,
    ctx: &EngineContext,
    shutdown: &CancellationToken,
    workers: usize,
) {
    info!(workers, "starting dispatchers");
    for _ in 0..workers.max(1) {
        let dispatcher = TaskDispatcher::new(ctx.clone());
        let shutdown = shutdown.clone();
        tasks.spawn(async move { dispatcher.run(shutdown).await });
    }
}

fn read_definition(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn workflow_name(path: &Path, explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workflow".to_string())
    })
}
