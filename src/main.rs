use anyhow::Result;
use clap::Parser;
use portal_sync::distance::{self, DistanceContext};
use portal_sync::geo::GoogleMapsClient;
use portal_sync::{config, db, handlers};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    // Distance-job worker: one tick at a time, idle polling when nothing is queued.
    let maps = GoogleMapsClient::new(&cfg.google.base_url, cfg.google.api_key.clone())?;
    let ctx = DistanceContext::from_config(pool.clone(), Arc::new(maps), &cfg.google);
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let error_sleep = Duration::from_secs(cfg.app.max_backoff_seconds.clamp(1, 5));
    tokio::spawn(async move {
        loop {
            match distance::work_once(&ctx).await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(poll_sleep).await,
                Err(err) => {
                    error!(?err, "distance worker error");
                    tokio::time::sleep(error_sleep).await;
                }
            }
        }
    });

    let bot = Bot::new(cfg.telegram.bot_token.clone());

    info!(bot = %cfg.telegram.bot_username, "starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let pool = pool.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &pool, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    Ok(())
}
