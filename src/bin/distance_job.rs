use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use portal_sync::distance::{self, DistanceContext};
use portal_sync::geo::GoogleMapsClient;
use portal_sync::model::JobMode;
use portal_sync::{config, db};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Start, advance and inspect distance-matrix jobs")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Missing,
    All,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue a job, or show the one this user already has open
    Start {
        #[arg(long)]
        user: String,
        #[arg(long, value_enum, default_value = "missing")]
        mode: Mode,
    },
    /// Run a single tick of a job
    Tick { job: i64 },
    /// Tick a job until it finishes
    Run {
        job: i64,
        /// Pause between ticks in milliseconds
        #[arg(long, default_value = "0")]
        pause_ms: u64,
    },
    /// Print a job and its error rows
    Status { job: i64 },
    /// Cancel a queued or running job
    Cancel { job: i64 },
    /// Register one destination city
    AddCity {
        name: String,
        /// Two-letter state code
        state: String,
    },
    /// Load destination cities from a `name,state` CSV file
    SeedCities { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let context = || -> Result<DistanceContext> {
        let maps = GoogleMapsClient::new(&cfg.google.base_url, cfg.google.api_key.clone())?;
        Ok(DistanceContext::from_config(pool.clone(), Arc::new(maps), &cfg.google))
    };

    match args.command {
        Command::Start { user, mode } => {
            let mode = match mode {
                Mode::Missing => JobMode::Missing,
                Mode::All => JobMode::All,
            };
            let outcome = distance::start_job(&pool, &user, mode).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Tick { job } => {
            let report = distance::tick(&context()?, job).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run { job, pause_ms } => {
            let finished =
                distance::run_to_completion(&context()?, job, Duration::from_millis(pause_ms)).await?;
            info!(job, status = finished.status.as_str(), "job finished");
            println!("{}", serde_json::to_string_pretty(&finished)?);
        }
        Command::Status { job } => {
            let found = distance::get_job(&pool, job)
                .await?
                .ok_or_else(|| anyhow!("distance job {} not found", job))?;
            println!("{}", serde_json::to_string_pretty(&found)?);
            for (city_id, phase, message) in db::jobs::list_job_errors(&pool, job).await? {
                println!("city={:?} phase={} {}", city_id, phase, message);
            }
        }
        Command::Cancel { job } => {
            if distance::cancel_job(&pool, job).await? {
                println!("job {} cancelled", job);
            } else {
                println!("job {} is not active", job);
            }
        }
        Command::AddCity { name, state } => {
            let id = db::jobs::upsert_city(&pool, name.trim(), &state.trim().to_uppercase()).await?;
            println!("city {} registered as {}", name.trim(), id);
        }
        Command::SeedCities { file } => {
            let input = std::fs::File::open(&file)
                .with_context(|| format!("failed to open {}", file.display()))?;
            let summary = distance::seed_cities(&pool, input).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
