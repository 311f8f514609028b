use anyhow::{anyhow, Context, Result};
use clap::Parser;
use portal_sync::import::{self, ImportOptions};
use portal_sync::{config, db};
use std::fs::File;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(author, version, about = "Import products from a CSV file")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// CSV file to import
    file: Option<PathBuf>,

    /// Print the CSV template and exit
    #[arg(long)]
    template: bool,

    /// Overwrite products that already exist instead of skipping them
    #[arg(long)]
    update_existing: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.template {
        print!("{}", import::template_csv());
        return Ok(());
    }
    let path = args
        .file
        .ok_or_else(|| anyhow!("a CSV file is required (or use --template)"))?;

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    let options = ImportOptions {
        update_existing: args.update_existing,
    };
    let summary = import::import_products(&pool, file, options).await?;
    for err in &summary.errors {
        warn!(line = err.line, message = %err.message, "row rejected");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
