//! Telegram notification linking.
//!
//! A portal user asks for a short-lived code, then sends `/link <code>` to the
//! bot (or opens the bot's deep link). Redeeming the code ties the Telegram
//! chat to the portal user so sync summaries can be delivered there.

use crate::db::{self, Pool, SyncCounts};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use teloxide::prelude::*;
use tracing::{info, instrument, warn};

pub const CODE_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Issue a fresh code for `user_id`, replacing any unused one.
#[instrument(skip_all, fields(user = %user_id))]
pub async fn create_link_code(pool: &Pool, user_id: &str, ttl: Duration) -> Result<LinkCode> {
    let code: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(CODE_LEN)
        .collect::<String>()
        .to_uppercase();
    let expires_at = Utc::now() + ttl;
    db::replace_link_code(pool, user_id, &code, expires_at).await?;
    info!(%expires_at, "link code issued");
    Ok(LinkCode { code, expires_at })
}

pub fn deep_link(bot_username: &str, code: &str) -> String {
    format!("https://t.me/{}?start={}", bot_username.trim_start_matches('@'), code)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// `/start`, optionally with a deep-link code.
    Start(Option<String>),
    Link(Option<String>),
    Unlink,
    Status,
}

/// Parse a bot command, accepting the `/cmd@bot_name` form.
pub fn parse_command(text: &str) -> Option<LinkCommand> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.split_whitespace();
    let head = parts.next()?;
    let name = head[1..].split('@').next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    match name.as_str() {
        "start" => Some(LinkCommand::Start(arg)),
        "link" => Some(LinkCommand::Link(arg)),
        "unlink" => Some(LinkCommand::Unlink),
        "status" => Some(LinkCommand::Status),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked { user_id: String },
    Expired,
    Unknown,
    AlreadyUsed,
}

#[instrument(skip_all, fields(chat = chat_id))]
pub async fn redeem_link_code(
    pool: &Pool,
    code: &str,
    chat_id: i64,
    username: Option<&str>,
) -> Result<LinkOutcome> {
    let code = code.trim().to_uppercase();
    let Some(row) = db::find_link_code(pool, &code).await? else {
        return Ok(LinkOutcome::Unknown);
    };
    if row.used_at.is_some() {
        return Ok(LinkOutcome::AlreadyUsed);
    }
    if row.expires_at <= Utc::now() {
        return Ok(LinkOutcome::Expired);
    }
    if !db::consume_link_code(pool, &code, &row.user_id, chat_id, username).await? {
        return Ok(LinkOutcome::AlreadyUsed);
    }
    info!(user = %row.user_id, "chat linked");
    Ok(LinkOutcome::Linked {
        user_id: row.user_id,
    })
}

pub async fn unlink_chat(pool: &Pool, chat_id: i64) -> Result<u64> {
    db::delete_links_for_chat(pool, chat_id).await
}

pub async fn linked_chats(pool: &Pool, user_id: &str) -> Result<Vec<i64>> {
    db::chats_for_user(pool, user_id).await
}

pub async fn all_linked_chats(pool: &Pool) -> Result<Vec<i64>> {
    db::all_linked_chats(pool).await
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<()> {
        self.bot
            .send_message(ChatId(chat_id), text.to_string())
            .await
            .context("telegram send failed")?;
        Ok(())
    }
}

pub fn format_sync_summary(table_id: &str, counts: &SyncCounts) -> String {
    let mut text = format!(
        "Sync {}: {} fetched, {} new, {} updated, {} unchanged, {} flagged for deletion",
        table_id, counts.fetched, counts.created, counts.updated, counts.unchanged, counts.deleted
    );
    if counts.errors > 0 {
        text.push_str(&format!(", {} errors", counts.errors));
    }
    if counts.blobs_downloaded + counts.blobs_skipped + counts.blob_errors > 0 {
        text.push_str(&format!(
            "\nFiles: {} stored, {} unchanged, {} failed",
            counts.blobs_downloaded, counts.blobs_skipped, counts.blob_errors
        ));
    }
    text
}

/// Send a sync summary to every linked chat. Returns how many sends succeeded.
#[instrument(skip_all, fields(table = %table_id))]
pub async fn notify_sync_summary(
    pool: &Pool,
    notifier: &dyn Notifier,
    table_id: &str,
    counts: &SyncCounts,
) -> Result<usize> {
    let text = format_sync_summary(table_id, counts);
    let mut sent = 0;
    for chat_id in all_linked_chats(pool).await? {
        match notifier.notify(chat_id, &text).await {
            Ok(()) => sent += 1,
            Err(err) => warn!(chat_id, ?err, "sync notification failed"),
        }
    }
    Ok(sent)
}

/// Point the bot at `url`, or remove the webhook when `url` is `None`.
pub async fn set_webhook(bot: &Bot, url: Option<&str>) -> Result<()> {
    match url {
        Some(url) => {
            let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid webhook url {}", url))?;
            bot.set_webhook(parsed).await.context("setWebhook failed")?;
            info!(%url, "webhook set");
        }
        None => {
            bot.delete_webhook().await.context("deleteWebhook failed")?;
            info!("webhook removed");
        }
    }
    Ok(())
}
