use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use portal_sync::mirror::{self, DeletedFilter, DynamicQuery, SortSpec};
use portal_sync::prefs::SqlitePreferences;
use portal_sync::tasks::RecentTaskTypes;
use portal_sync::{config, db, telegram};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::Bot;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect mirror tables, manage Telegram links and check task payloads")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Page through a mirror table
    Query {
        table: String,
        #[arg(long, default_value = "0")]
        page: u32,
        #[arg(long)]
        page_size: Option<u32>,
        #[arg(long)]
        search: Option<String>,
        /// Equality filter, `column=value`; repeatable
        #[arg(long = "filter")]
        filters: Vec<String>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        include_deleted: bool,
    },
    /// List records flagged as deleted by the last sync
    Deleted {
        table: String,
        #[arg(long, default_value = "0")]
        page: u32,
    },
    /// Clear the deletion flag on records
    Restore {
        table: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Issue a Telegram link code for a portal user
    LinkCode { user: String },
    /// Set the bot webhook from config (or remove it with --remove)
    SetWebhook {
        #[arg(long)]
        remove: bool,
    },
    /// Validate a task payload and record its type as recently used
    Task {
        task_type: String,
        /// JSON object with the type-specific fields
        payload: String,
    },
    /// Show the recently used task types
    RecentTasks,
}

fn parse_filter(raw: &str) -> Result<(String, Value)> {
    let (column, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("filter must look like column=value: {}", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((column.trim().to_string(), value))
}

fn recent_tasks(pool: &db::Pool) -> RecentTaskTypes {
    RecentTaskTypes::new(Arc::new(SqlitePreferences::new(pool.clone())))
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

    let table_cfg = |id: &str| {
        cfg.protheus
            .table(id)
            .cloned()
            .ok_or_else(|| anyhow!("table {} is not configured", id))
    };

    match args.command {
        Command::Query {
            table,
            page,
            page_size,
            search,
            filters,
            sort,
            desc,
            include_deleted,
        } => {
            let table = table_cfg(&table)?;
            let query = DynamicQuery {
                page,
                page_size: page_size.unwrap_or(cfg.browser.page_size),
                search,
                filters: filters
                    .iter()
                    .map(|f| parse_filter(f))
                    .collect::<Result<_>>()?,
                sort: sort.map(|column| SortSpec {
                    column,
                    descending: desc,
                }),
                deleted: if include_deleted {
                    DeletedFilter::Include
                } else {
                    DeletedFilter::Exclude
                },
            };
            let result = mirror::query_dynamic_table(&pool, &table, &query).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Deleted { table, page } => {
            let table = table_cfg(&table)?;
            let query = DynamicQuery {
                page,
                page_size: cfg.browser.page_size,
                deleted: DeletedFilter::Only,
                ..Default::default()
            };
            let result = mirror::query_dynamic_table(&pool, &table, &query).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Restore { table, ids } => {
            let table = table_cfg(&table)?;
            let restored = mirror::restore(&pool, &table, &ids).await?;
            println!("restored {} of {} records", restored, ids.len());
        }
        Command::LinkCode { user } => {
            let ttl = Duration::minutes(cfg.telegram.link_code_ttl_minutes);
            let code = telegram::create_link_code(&pool, &user, ttl).await?;
            println!("code: {}", code.code);
            println!("expires: {}", code.expires_at);
            println!("link: {}", telegram::deep_link(&cfg.telegram.bot_username, &code.code));
        }
        Command::SetWebhook { remove } => {
            let bot = Bot::new(cfg.telegram.bot_token.clone());
            let url = if remove {
                None
            } else {
                Some(
                    cfg.telegram
                        .webhook_url
                        .as_deref()
                        .ok_or_else(|| anyhow!("telegram.webhook_url is not set"))?,
                )
            };
            telegram::set_webhook(&bot, url).await?;
        }
        Command::Task { task_type, payload } => {
            let raw: Value = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let (task, recent) = recent_tasks(&pool).accept(&task_type, &raw).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            println!("recent: {}", recent.join(", "));
        }
        Command::RecentTasks => {
            println!("{}", recent_tasks(&pool).list().await?.join("\n"));
        }
    }
    Ok(())
}
