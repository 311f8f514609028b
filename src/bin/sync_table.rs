use anyhow::{anyhow, Result};
use clap::Parser;
use portal_sync::browser::{force_sync_steps, LocalSyncBackend};
use portal_sync::protheus::ProtheusClient;
use portal_sync::sync::SyncContext;
use portal_sync::telegram::{self, TelegramNotifier};
use portal_sync::{config, db};
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::Bot;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sync ERP tables into their mirror tables and finalize the sync logs"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Table id from the config; every configured table when omitted
    #[arg(long)]
    table: Option<String>,

    /// Send each sync summary to linked Telegram chats
    #[arg(long)]
    notify: bool,
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

    let erp = ProtheusClient::from_config(&cfg.protheus)?;
    let ctx = SyncContext::from_config(pool.clone(), Arc::new(erp), &cfg);
    let backend = LocalSyncBackend::new(ctx);

    let table_ids: Vec<String> = match &args.table {
        Some(id) => {
            if cfg.protheus.table(id).is_none() {
                return Err(anyhow!("table {} is not configured", id));
            }
            vec![id.clone()]
        }
        None => cfg.protheus.tables.iter().map(|t| t.id.clone()).collect(),
    };

    let notifier = args
        .notify
        .then(|| TelegramNotifier::new(Bot::new(cfg.telegram.bot_token.clone())));

    let mut failed = 0;
    for table_id in &table_ids {
        let report = force_sync_steps(&backend, table_id).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        for warning in &report.warnings {
            warn!(table = %table_id, %warning, "sync step warning");
        }
        match (&report.summary, &notifier) {
            (Some(summary), Some(notifier)) => {
                let sent =
                    telegram::notify_sync_summary(&pool, notifier, table_id, &summary.counts).await?;
                info!(table = %table_id, sent, "sync summary sent");
            }
            (None, _) => failed += 1,
            _ => {}
        }
    }

    if failed > 0 {
        return Err(anyhow!("{} of {} table syncs failed", failed, table_ids.len()));
    }
    Ok(())
}
