use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use warehouse_sync::{Config, Manager, SystemClock};

#[derive(Parser)]
#[command(name = "warehouse-sync")]
#[command(about = "Replicates tables from MySQL and PostgreSQL sources into a warehouse")]
#[command(long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "sync.yml", env = "WAREHOUSE_SYNC_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full batch load for every planned table
    Batch,
    /// Reload the recent window for plans with refresh-recent enabled
    RefreshRecent,
    /// Run the continuous incremental loop
    Incremental,
    /// Batch-load tables the registry has never seen, then follow
    /// incrementally
    Run,
    /// Parse and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{e:#}");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> warehouse_sync::Result<()> {
    let config = Config::load(&cli.config)?;

    if matches!(cli.command, Commands::CheckConfig) {
        tracing::info!("configuration is valid");
        return Ok(());
    }

    let manager = Manager::from_config(&config, Arc::new(SystemClock))?;

    // First ctrl-c requests a graceful stop; in-flight loads finish. A
    // second ctrl-c aborts without waiting for them.
    let stop = manager.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stop requested, finishing in-flight work");
            stop.stop();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("second interrupt, aborting");
            std::process::exit(1);
        }
    });

    match cli.command {
        Commands::Batch => manager.batch_nonactive().await?,
        Commands::RefreshRecent => manager.refresh_recent().await?,
        Commands::Incremental => manager.incremental().await?,
        Commands::Run => {
            manager.batch_missing().await?;
            manager.incremental().await?;
        }
        Commands::CheckConfig => unreachable!("handled above"),
    }

    Ok(())
}
