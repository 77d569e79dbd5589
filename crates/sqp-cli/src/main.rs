use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqp_extract::{Extractor, FixtureWarehouse, HttpWarehouse, WarehouseSource};
use sqp_storage::{DestinationStore, HttpClientConfig, MemoryStore, PgStore, RefreshStore};
use sqp_sync::{
    apply_registry, ErrorTracker, HealthThresholds, Monitor, RefreshRegistry, RefreshScheduler,
    SchedulerConfig, SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sqp")]
#[command(about = "Search query performance sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one refresh cycle and exit.
    Cycle,
    /// Run cycles on the configured cron until interrupted.
    Schedule,
    /// Serve the JSON operational API.
    Serve,
    /// Seed refresh configs and dependencies from the registry.
    Setup {
        #[arg(long)]
        registry: Option<PathBuf>,
        /// Delete configs that are no longer listed.
        #[arg(long)]
        prune: bool,
    },
    /// Purge old history and fail abandoned runs.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Write a parquet run-history snapshot.
    Export {
        #[arg(long, default_value = "reports")]
        dir: PathBuf,
        #[arg(long, default_value_t = 10_000)]
        limit: usize,
    },
    /// Apply database migrations.
    Migrate,
}

struct Components {
    scheduler: Arc<RefreshScheduler>,
    monitor: Arc<Monitor>,
}

async fn stores(
    config: &SyncConfig,
) -> Result<(Arc<dyn RefreshStore>, Arc<dyn DestinationStore>)> {
    match &config.database_url {
        Some(url) => {
            let store = Arc::new(
                PgStore::connect(url, config.max_concurrency as u32 + 2)
                    .await
                    .context("connecting to DATABASE_URL")?,
            );
            Ok((store.clone(), store))
        }
        None => {
            warn!("DATABASE_URL is not set; using the in-process store");
            let store = Arc::new(MemoryStore::default());
            let registry = RefreshRegistry::load(config.registry_path()).await?;
            apply_registry(store.as_ref(), &registry, false).await?;
            Ok((store.clone(), store))
        }
    }
}

async fn warehouse(config: &SyncConfig) -> Result<Arc<dyn WarehouseSource>> {
    match &config.warehouse_url {
        Some(url) => {
            let http = HttpClientConfig::for_warehouse(url.clone())
                .with_bearer_token(config.warehouse_token.clone())
                .with_timeout(Duration::from_secs(config.http_timeout_secs))
                .with_max_in_flight(config.max_concurrency);
            Ok(Arc::new(HttpWarehouse::connect("warehouse", http)?))
        }
        None => {
            let fixture = FixtureWarehouse::open(&config.warehouse_fixture)
                .await
                .with_context(|| {
                    format!("opening warehouse fixture {}", config.warehouse_fixture.display())
                })?;
            Ok(Arc::new(fixture))
        }
    }
}

async fn components(config: &SyncConfig) -> Result<Components> {
    let (store, destination) = stores(config).await?;
    let source = warehouse(config).await?;
    let tracker = Arc::new(ErrorTracker::default());
    let scheduler = Arc::new(RefreshScheduler::new(
        store.clone(),
        destination,
        Extractor::new(source),
        tracker.clone(),
        SchedulerConfig::from_sync_config(config),
    ));
    let monitor = Arc::new(Monitor::new(
        store,
        tracker,
        scheduler.cycle_handle(),
        HealthThresholds::default(),
    ));
    Ok(Components { scheduler, monitor })
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Cycle) {
        Commands::Cycle => {
            let parts = components(&config).await?;
            let report = parts.scheduler.run_cycle().await?;
            let summary = report.summary();
            println!(
                "cycle complete: cycle_id={} due={} succeeded={} partial={} failed={} blocked={} skipped={}",
                report.cycle_id,
                summary.due,
                summary.succeeded,
                summary.partial,
                summary.failed,
                summary.blocked,
                summary.already_running
            );
        }
        Commands::Schedule => {
            let parts = components(&config).await?;
            let sched = parts
                .scheduler
                .clone()
                .build_cron_scheduler(&config.cycle_cron)
                .await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.cycle_cron, "scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            parts.scheduler.cancel();
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let parts = components(&config).await?;
            let sched = if config.scheduler_enabled {
                let sched = parts
                    .scheduler
                    .clone()
                    .build_cron_scheduler(&config.cycle_cron)
                    .await?;
                sched.start().await.context("starting scheduler")?;
                Some(sched)
            } else {
                None
            };
            let state = sqp_web::AppState::new(parts.scheduler.clone(), parts.monitor.clone());
            sqp_web::serve(state, config.web_port).await?;
            if let Some(mut sched) = sched {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Setup { registry, prune } => {
            let url = config
                .database_url
                .as_deref()
                .context("setup writes to the database; set DATABASE_URL")?;
            let store = PgStore::connect(url, 2).await?;
            let path = registry.unwrap_or_else(|| config.registry_path());
            let registry = RefreshRegistry::load(&path).await?;
            let report = apply_registry(&store, &registry, prune).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Cleanup { days } => {
            let parts = components(&config).await?;
            let report = parts.monitor.cleanup_old_data(days).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Export { dir, limit } => {
            let parts = components(&config).await?;
            let manifest = parts.monitor.write_history_snapshot(&dir, limit).await?;
            println!("snapshot manifest: {}", manifest.display());
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("migrate needs DATABASE_URL")?;
            let store = PgStore::connect(url, 2).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
