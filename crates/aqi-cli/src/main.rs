use std::sync::Arc;

use anyhow::{Context, Result};
use aqi_core::DEFAULT_REGION;
use aqi_storage::{PgPoolConfig, PgStationStore};
use aqi_sync::{
    horizon_from_days, maybe_build_scheduler, service_from_config, start_scheduler, SyncConfig,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aqi-cli")]
#[command(about = "Air quality station ingest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle for a region.
    Reconcile {
        #[arg(long, default_value = DEFAULT_REGION)]
        region: String,
    },
    /// Delete rows older than the retention horizon.
    Sweep {
        #[arg(long)]
        days: Option<i64>,
    },
    Migrate,
    /// Serve the query API, plus the scheduler when enabled.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Reconcile {
        region: DEFAULT_REGION.to_string(),
    });
    match command {
        Commands::Reconcile { region } => {
            let service = service_from_config(&config).await?;
            let outcome = service.reconcile(&region).await?;
            println!(
                "reconcile complete: region={} updated={} inserted={}",
                region, outcome.updated, outcome.inserted
            );
        }
        Commands::Sweep { days } => {
            let service = service_from_config(&config).await?;
            let horizon = match days {
                Some(days) => horizon_from_days(days)?,
                None => config.retention_horizon(),
            };
            let outcome = service.sweep(horizon).await?;
            println!("sweep complete: deleted={}", outcome.deleted);
        }
        Commands::Migrate => {
            if config.uses_memory_store() {
                println!("DATABASE_URL=memory; nothing to migrate");
                return Ok(());
            }
            let store = PgStationStore::connect(
                &config.database_url,
                PgPoolConfig {
                    max_connections: config.db_max_connections,
                    ..Default::default()
                },
            )
            .await
            .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let service = Arc::new(service_from_config(&config).await?);
            let scheduler = maybe_build_scheduler(Arc::clone(&service), &config).await?;
            if let Some(sched) = &scheduler {
                start_scheduler(sched, &service, &config).await?;
            }
            aqi_web::serve(service, config.web_port).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
                info!("scheduler stopped");
            }
        }
    }

    Ok(())
}
