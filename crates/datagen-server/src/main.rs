use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use datagen_core::DatagenConfig;
use datagen_generator::BuiltinGenerator;
use datagen_scheduler::output::OutputDispatcher;
use datagen_scheduler::{cron, SchedulerService, TaskStore};

mod cli;

use cli::{Args, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datagen_server=info,datagen_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    // load config: --config > DATAGEN_CONFIG env > ~/.datagen/datagen.toml
    let config_path = args.config.clone().or_else(|| std::env::var("DATAGEN_CONFIG").ok());
    let config = DatagenConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        DatagenConfig::default()
    });

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Cron {
            expression,
            tz,
            count,
        } => {
            let tz = tz.unwrap_or_else(|| config.scheduler.default_timezone.clone());
            preview_cron(&expression, &tz, count)
        }
    }
}

async fn run(config: DatagenConfig) -> anyhow::Result<()> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    let store = Arc::new(TaskStore::new(db)?);
    info!("database migrations complete");

    let dispatcher = Arc::new(OutputDispatcher::new(&config.output)?);
    let service = SchedulerService::new(
        &config.scheduler,
        store,
        Arc::new(BuiltinGenerator::new()),
        dispatcher,
    );

    let armed = service.start()?;
    info!(
        armed,
        workers = config.scheduler.workers,
        timezone = %config.scheduler.default_timezone,
        "datagen scheduler running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    if !service.stop().await {
        warn!("some runs were still in flight at shutdown");
    }
    Ok(())
}

/// Print the description and upcoming fire times of `expression`.
fn preview_cron(expression: &str, tz_name: &str, count: usize) -> anyhow::Result<()> {
    let tz = cron::parse_timezone(tz_name)?;
    let times = cron::next_fire_times(expression, tz, count)?;
    println!("{}", cron::describe(expression));
    for at in times {
        println!("  {}", at.with_timezone(&tz).to_rfc3339());
    }
    Ok(())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
