use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use esteira_geo::app::ports::{DatabasePort, StoragePort};
use esteira_geo::config::Config;
use esteira_geo::infra::{HttpObjectStore, LocalFsStorage, MirroredStorage, SqliteDatabase};
use esteira_geo::logging;
use esteira_geo::observability;
use esteira_geo::pipeline::{run_once, seed, watcher, CancellationFlag};

#[derive(Parser)]
#[command(name = "esteira_geo")]
#[command(about = "Layered flood-area pipeline: raw -> validated -> classified -> partitioned")]
#[command(version = "0.1.0")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every layer transition once, then load the database
    Run,
    /// Write the sample Porto Alegre dataset into the raw layer
    Seed {
        /// Add duplicates, padded strings, missing values and a self-intersecting polygon
        #[arg(long)]
        with_anomalies: bool,
    },
    /// Poll the raw layer and run the pipeline whenever it changes
    Watch,
    /// Print affected/unaffected counts from the database
    Stats,
    /// Create the mirror buckets (idempotent)
    InitBuckets,
}

fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn StoragePort>> {
    let local: Arc<dyn StoragePort> = Arc::new(LocalFsStorage::new(&config.storage.data_root));
    let storage = match &config.mirror {
        Some(mirror) => {
            let store = HttpObjectStore::new(mirror.clone()).context("building object store client")?;
            info!("🪞 Mirroring layers to {}", mirror.endpoint);
            MirroredStorage::new(local, Some(Arc::new(store)), config.retry.clone())
        }
        None => MirroredStorage::local_only(local),
    };
    Ok(Arc::new(storage))
}

fn open_database(config: &Config) -> Option<Arc<dyn DatabasePort>> {
    if !config.database.enabled {
        return None;
    }
    match SqliteDatabase::open(&config.database.path) {
        Ok(db) => Some(Arc::new(db)),
        Err(e) => {
            // The run still publishes its layers; the load step reports the gap.
            warn!("⚠️ Database {} unavailable: {}", config.database.path.display(), e);
            None
        }
    }
}

async fn stats(config: &Config) -> anyhow::Result<()> {
    let db = SqliteDatabase::open(&config.database.path)
        .with_context(|| format!("opening database {}", config.database.path.display()))?;
    let counts = db.query_counts().await?;
    println!("\n📊 Classification summary ({})", config.database.path.display());
    println!("   Total individuals: {}", counts.total);
    println!("   Affected:          {} ({:.1}%)", counts.affected, counts.affected_percent());
    println!("   Unaffected:        {}", counts.unaffected);

    let by_area = db.counts_by_area().await?;
    if !by_area.is_empty() {
        println!("\n🗺️ Affected by hazard area:");
        for area in by_area {
            println!(
                "   [{}] {} ({}): {}",
                area.hazard_area_id,
                area.name,
                area.severity.as_deref().unwrap_or("unknown"),
                area.affected
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init_logging(&config.logging);
    observability::init_metrics(&config.metrics);

    let cancel = CancellationFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 Interrupt received, stopping after the current step");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Run => {
            let storage = build_storage(&config)?;
            let database = open_database(&config);
            if database.is_none() && config.database.enabled && config.pipeline.fail_on_database_error {
                anyhow::bail!("database {} is unavailable", config.database.path.display());
            }
            match run_once(&config, storage, database, cancel).await {
                Ok(summary) => {
                    println!("\n📊 Run {}", summary.run_id);
                    println!("   Affected:   {}", summary.partitioned.affected);
                    println!("   Unaffected: {}", summary.partitioned.unaffected);
                    println!("   Total:      {} ({:.1}% affected)", summary.partitioned.all, summary.affected_percent());
                    if summary.mirror_failures > 0 {
                        println!("   ⚠️  {} artifacts not mirrored", summary.mirror_failures);
                    }
                }
                Err(e) => {
                    error!("Pipeline run failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Commands::Seed { with_anomalies } => {
            let storage = build_storage(&config)?;
            let summary = seed::seed_raw(storage.as_ref(), &config.pipeline, with_anomalies).await?;
            println!(
                "🌱 Seeded {} hazard areas and {} individuals",
                summary.hazard_areas, summary.individuals
            );
        }
        Commands::Watch => {
            let storage = build_storage(&config)?;
            let database = open_database(&config);
            watcher::watch(&config, storage, database, cancel).await?;
        }
        Commands::Stats => stats(&config).await?,
        Commands::InitBuckets => {
            let mirror = config
                .mirror
                .clone()
                .context("no [mirror] section or ESTEIRA_MIRROR_ENDPOINT configured")?;
            let store = HttpObjectStore::new(mirror)?;
            let created = store.ensure_buckets(&config.retry).await?;
            if created.is_empty() {
                println!("All buckets already exist");
            } else {
                println!("Created buckets: {}", created.join(", "));
            }
        }
    }

    Ok(())
}
