use super::model::{LinkCodeRow, SyncCounts};
use super::Pool;
use crate::model::{SyncLog, SyncStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

#[instrument(skip_all, fields(table = %table_id))]
pub async fn create_sync_log(pool: &Pool, table_id: &str, started_at: DateTime<Utc>) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sync_logs (table_id, status, started_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(table_id)
    .bind(SyncStatus::Running.as_str())
    .bind(started_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn finish_sync_log(
    pool: &Pool,
    id: i64,
    status: SyncStatus,
    counts: &SyncCounts,
    duration_ms: i64,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_logs SET status = ?, finished_at = ?, duration_ms = ?, fetched = ?, \
         created = ?, updated = ?, unchanged = ?, deleted = ?, errors = ?, \
         blobs_downloaded = ?, blobs_skipped = ?, blob_errors = ?, error_message = ? \
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(duration_ms)
    .bind(counts.fetched)
    .bind(counts.created)
    .bind(counts.updated)
    .bind(counts.unchanged)
    .bind(counts.deleted)
    .bind(counts.errors)
    .bind(counts.blobs_downloaded)
    .bind(counts.blobs_skipped)
    .bind(counts.blob_errors)
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to persist sync log")?;
    Ok(())
}

/// Overwrite the reconciled counters and close a log left in `running`.
#[instrument(skip_all)]
pub async fn finalize_sync_log(
    pool: &Pool,
    id: i64,
    created: i64,
    updated: i64,
    deleted: i64,
) -> Result<()> {
    let now = Utc::now();
    let res = sqlx::query(
        "UPDATE sync_logs SET created = ?, updated = ?, deleted = ?, finalized_at = ?, \
         status = CASE WHEN status = 'running' THEN 'completed' ELSE status END, \
         finished_at = COALESCE(finished_at, ?) \
         WHERE id = ?",
    )
    .bind(created)
    .bind(updated)
    .bind(deleted)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("sync log {} not found", id));
    }
    Ok(())
}

pub async fn get_sync_log(pool: &Pool, id: i64) -> Result<Option<SyncLog>> {
    let row = sqlx::query("SELECT * FROM sync_logs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(sync_log_from_row).transpose()
}

pub async fn latest_sync_log(pool: &Pool, table_id: &str) -> Result<Option<SyncLog>> {
    let row = sqlx::query("SELECT * FROM sync_logs WHERE table_id = ? ORDER BY id DESC LIMIT 1")
        .bind(table_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(sync_log_from_row).transpose()
}

fn sync_log_from_row(row: &SqliteRow) -> Result<SyncLog> {
    let id: i64 = row.get("id");
    let status_str: String = row.get("status");
    let status = SyncStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("sync log {} has unknown status {}", id, status_str))?;
    Ok(SyncLog {
        id,
        table_id: row.get("table_id"),
        status,
        started_at: row.get("started_at"),
        finished_at: row.try_get("finished_at").ok().flatten(),
        duration_ms: row.try_get("duration_ms").ok().flatten(),
        fetched: row.get("fetched"),
        created: row.get("created"),
        updated: row.get("updated"),
        unchanged: row.get("unchanged"),
        deleted: row.get("deleted"),
        errors: row.get("errors"),
        blobs_downloaded: row.get("blobs_downloaded"),
        blobs_skipped: row.get("blobs_skipped"),
        blob_errors: row.get("blob_errors"),
        error_message: row.try_get("error_message").ok().flatten(),
        finalized_at: row.try_get("finalized_at").ok().flatten(),
    })
}

pub async fn get_preference(pool: &Pool, scope: &str, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>(
        "SELECT value FROM preferences WHERE scope = ? AND key = ?",
    )
    .bind(scope)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(value)
}

pub async fn set_preference(pool: &Pool, scope: &str, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO preferences (scope, key, value, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (scope, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(scope)
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Store a fresh link code, dropping any unused code the user still had.
#[instrument(skip_all)]
pub async fn replace_link_code(
    pool: &Pool,
    user_id: &str,
    code: &str,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM telegram_link_codes WHERE user_id = ? AND used_at IS NULL")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO telegram_link_codes (code, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(code)
    .bind(user_id)
    .bind(expires_at)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn find_link_code(pool: &Pool, code: &str) -> Result<Option<LinkCodeRow>> {
    let row = sqlx::query(
        "SELECT code, user_id, expires_at, used_at FROM telegram_link_codes WHERE code = ?",
    )
    .bind(code)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| LinkCodeRow {
        code: row.get("code"),
        user_id: row.get("user_id"),
        expires_at: row.get("expires_at"),
        used_at: row.try_get("used_at").ok().flatten(),
    }))
}

/// Mark the code used and link the chat in one transaction. Returns false when
/// the code was consumed concurrently.
#[instrument(skip_all)]
pub async fn consume_link_code(
    pool: &Pool,
    code: &str,
    user_id: &str,
    chat_id: i64,
    username: Option<&str>,
) -> Result<bool> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE telegram_link_codes SET used_at = ? WHERE code = ? AND used_at IS NULL",
    )
    .bind(now)
    .bind(code)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        return Ok(false);
    }
    sqlx::query(
        "INSERT INTO telegram_links (user_id, chat_id, username, linked_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (user_id, chat_id) DO UPDATE SET username = excluded.username, linked_at = excluded.linked_at",
    )
    .bind(user_id)
    .bind(chat_id)
    .bind(username)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

pub async fn delete_links_for_chat(pool: &Pool, chat_id: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM telegram_links WHERE chat_id = ?")
        .bind(chat_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn users_for_chat(pool: &Pool, chat_id: i64) -> Result<Vec<String>> {
    let users = sqlx::query_scalar::<_, String>(
        "SELECT user_id FROM telegram_links WHERE chat_id = ? ORDER BY user_id",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;
    Ok(users)
}

pub async fn chats_for_user(pool: &Pool, user_id: &str) -> Result<Vec<i64>> {
    let chats = sqlx::query_scalar::<_, i64>(
        "SELECT chat_id FROM telegram_links WHERE user_id = ? ORDER BY chat_id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(chats)
}

pub async fn all_linked_chats(pool: &Pool) -> Result<Vec<i64>> {
    let chats =
        sqlx::query_scalar::<_, i64>("SELECT DISTINCT chat_id FROM telegram_links ORDER BY chat_id")
            .fetch_all(pool)
            .await?;
    Ok(chats)
}
