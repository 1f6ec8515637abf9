use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sharemirror::config::{AppConfig, DeletionPolicy};
use sharemirror::core::{LockCoordinator, Orchestrator};
use sharemirror::{adapters, context, db, logging};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sharemirror")]
#[command(about = "File-share backup replication daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured target on its interval
    Daemon,
    /// Run one target now and print the result
    Run { name: String },
    /// Show lock history
    Status {
        #[arg(long)]
        backup: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Mark abandoned running locks as failed
    Reap,
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    mount_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    stale_after_hours: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    connect_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, value_parser = parse_deletion_policy)]
    deletion_policy: Option<DeletionPolicy>,
}

fn parse_deletion_policy(s: &str) -> Result<DeletionPolicy, String> {
    match s {
        "accumulate" => Ok(DeletionPolicy::Accumulate),
        "mirror" => Ok(DeletionPolicy::Mirror),
        other => Err(format!("unknown deletion policy '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))
        .context("Failed to load configuration")?;
    logging::init(&config.logging);

    let db_conn = db::init(&config.database_path).await?;
    let ctx = context::AppContext::new(config, db_conn);

    match cli.command {
        Commands::Daemon => run_daemon(ctx).await.context("Daemon exited with an error")?,
        Commands::Run { name } => run_once(ctx, &name).await?,
        Commands::Status { backup, limit } => run_status(ctx, backup.as_deref(), limit).await?,
        Commands::Reap => run_reap(ctx).await?,
    }

    Ok(())
}

async fn run_daemon(ctx: context::AppContext) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::new(&ctx, adapters::get_connector(&ctx.config)));
    let reap_every = Duration::from_secs(ctx.config.reap_interval_secs);
    orchestrator.start(ctx.config.targets.clone(), reap_every).await
}

async fn run_once(ctx: context::AppContext, name: &str) -> Result<()> {
    let target = ctx.config.target(name)?.clone();
    let orchestrator = Orchestrator::new(&ctx, adapters::get_connector(&ctx.config));

    match orchestrator.run(&target).await? {
        sharemirror::core::RunOutcome::Completed(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        sharemirror::core::RunOutcome::Skipped { backup_name } => {
            println!("{} is already running, skipped", backup_name);
        }
    }
    Ok(())
}

async fn run_status(ctx: context::AppContext, backup: Option<&str>, limit: u32) -> Result<()> {
    let locks = LockCoordinator::new(ctx.db.clone(), ctx.config.stale_after());
    let records = locks.history(backup, limit).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn run_reap(ctx: context::AppContext) -> Result<()> {
    let locks = LockCoordinator::new(ctx.db.clone(), ctx.config.stale_after());
    let reaped = locks.reap_stale().await?;
    println!("Reclaimed {} abandoned run(s)", reaped.len());
    Ok(())
}
