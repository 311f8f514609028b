//! ERP table sync: fetch, diff by content hash, upsert, soft delete, blobs.

use crate::config::{Config, Protheus, TableConfig};
use crate::db::{self, Pool, SyncCounts};
use crate::mirror::{self, MirrorRecord, RecordChange};
use crate::model::{CellValue, SyncLog, SyncStatus};
use crate::protheus::cast::cast_value;
use crate::protheus::{build_select, field, ErpError, ErpProxy, Row};
use crate::retry::{retry_with_backoff, RetryPolicy};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Everything a sync run needs, constructed once and passed explicitly.
#[derive(Clone)]
pub struct SyncContext {
    pub pool: Pool,
    pub erp: Arc<dyn ErpProxy>,
    pub protheus: Protheus,
    pub blob_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl SyncContext {
    pub fn from_config(pool: Pool, erp: Arc<dyn ErpProxy>, cfg: &Config) -> Self {
        Self {
            pool,
            erp,
            protheus: cfg.protheus.clone(),
            blob_dir: PathBuf::from(cfg.app.resolved_data_dir()).join("blobs"),
            retry: RetryPolicy::new(
                4,
                Duration::from_millis(500),
                Duration::from_secs(cfg.app.max_backoff_seconds.max(1)),
            ),
        }
    }

    pub fn table(&self, table_id: &str) -> Result<&TableConfig> {
        self.protheus
            .table(table_id)
            .ok_or_else(|| anyhow!("unknown table {}", table_id))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub log_id: i64,
    pub table_id: String,
    pub counts: SyncCounts,
}

/// Composite business key: key field values, trimmed, joined with `|`.
/// `None` when every part is blank.
pub fn compute_key(table: &TableConfig, row: &Row) -> Option<String> {
    let parts: Vec<String> = table
        .key_fields
        .iter()
        .map(|k| match field(row, k) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .collect();
    if parts.iter().all(|p| p.is_empty()) {
        return None;
    }
    Some(parts.join("|"))
}

/// Cast a fetched row into the stored column order.
pub fn mapped_values(table: &TableConfig, row: &Row) -> Vec<CellValue> {
    table
        .stored_columns()
        .map(|col| cast_value(col.cast, field(row, &col.source).unwrap_or(&Value::Null)))
        .collect()
}

/// SHA-256 hex over the canonical (target-sorted) mapped values.
pub fn content_hash(table: &TableConfig, values: &[CellValue]) -> String {
    let canonical: BTreeMap<&str, &CellValue> = table
        .stored_columns()
        .map(|c| c.target.as_str())
        .zip(values.iter())
        .collect();
    let json = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}

struct Fetched {
    key: String,
    row: Row,
    values: Vec<CellValue>,
    hash: Option<String>,
}

#[instrument(skip_all, fields(table = %table_id))]
pub async fn run_sync(ctx: &SyncContext, table_id: &str) -> Result<SyncSummary> {
    let table = ctx.table(table_id)?;
    let started = Instant::now();
    let log_id = db::create_sync_log(&ctx.pool, table_id, chrono::Utc::now()).await?;
    let mut counts = SyncCounts::default();

    // Once the log row exists every failure must close it as failed.
    if let Err(err) = sync_into_log(ctx, table, log_id, started, &mut counts).await {
        let msg = format!("{:#}", err);
        error!(log_id, %msg, "sync aborted");
        fail_log(ctx, log_id, &counts, started, &msg).await;
        return Err(err.context(format!("sync of {} failed", table_id)));
    }

    info!(
        log_id,
        fetched = counts.fetched,
        created = counts.created,
        updated = counts.updated,
        unchanged = counts.unchanged,
        deleted = counts.deleted,
        errors = counts.errors,
        duration_ms = started.elapsed().as_millis() as i64,
        "sync completed"
    );
    Ok(SyncSummary {
        log_id,
        table_id: table_id.to_string(),
        counts,
    })
}

async fn sync_into_log(
    ctx: &SyncContext,
    table: &TableConfig,
    log_id: i64,
    started: Instant,
    counts: &mut SyncCounts,
) -> Result<()> {
    mirror::prepare_columns(&ctx.pool, table, &ctx.retry)
        .await
        .context("failed to prepare mirror table")?;

    let sql = build_select(table);
    let rows = retry_with_backoff(&ctx.retry, ErpError::is_server_error, || {
        ctx.erp.query(&sql)
    })
    .await
    .map_err(|err| anyhow!(err).context("ERP query failed"))?;
    counts.fetched = rows.len() as i64;

    let mut records: Vec<Fetched> = Vec::with_capacity(rows.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let Some(key) = compute_key(table, &row) else {
            warn!(log_id, "row without key values; skipped");
            counts.errors += 1;
            continue;
        };
        let values = mapped_values(table, &row);
        let hash = table.hash_enabled.then(|| content_hash(table, &values));
        let item = Fetched {
            key: key.clone(),
            row,
            values,
            hash,
        };
        match positions.get(&key) {
            Some(&pos) => {
                warn!(log_id, %key, "duplicate key in fetch; keeping last occurrence");
                records[pos] = item;
            }
            None => {
                positions.insert(key, records.len());
                records.push(item);
            }
        }
    }

    let stored = mirror::load_hashes(&ctx.pool, table)
        .await
        .context("failed to load stored hashes")?;
    let mut pending: Vec<MirrorRecord> = Vec::new();
    for item in &records {
        let change = match stored.get(&item.key) {
            None => RecordChange::Create,
            Some(existing) => {
                if table.hash_enabled && existing.is_some() && *existing == item.hash {
                    counts.unchanged += 1;
                    continue;
                }
                RecordChange::Update
            }
        };
        pending.push(MirrorRecord {
            protheus_id: item.key.clone(),
            values: item.values.clone(),
            hash: item.hash.clone(),
            change,
        });
    }

    let batch_size = ctx.protheus.upsert_batch_size.max(1);
    for batch in pending.chunks(batch_size) {
        match mirror::upsert_batch(&ctx.pool, table, batch, log_id).await {
            Ok(()) => batch.iter().for_each(|r| count_change(counts, r.change)),
            Err(err) => {
                warn!(log_id, ?err, size = batch.len(), "batch upsert failed; retrying one by one");
                for record in batch {
                    match mirror::upsert_one(&ctx.pool, table, record, log_id).await {
                        Ok(()) => count_change(counts, record.change),
                        Err(err) => {
                            warn!(log_id, key = %record.protheus_id, ?err, "row upsert failed");
                            counts.errors += 1;
                        }
                    }
                }
            }
        }
    }

    if records.is_empty() && counts.fetched > 0 {
        // A fetch with no keyed rows never flags the mirror.
        warn!(log_id, fetched = counts.fetched, "no keyed rows in fetch; skipping soft-delete reconciliation");
    } else {
        let active: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
        match mirror::reconcile_deletions(&ctx.pool, table, &active, log_id).await {
            Ok(flagged) => counts.deleted = flagged as i64,
            Err(err) => {
                warn!(log_id, ?err, "soft-delete reconciliation failed");
                counts.errors += 1;
            }
        }
    }

    if !table.blobs.is_empty() {
        sync_blobs(ctx, table, &records, counts).await;
    }

    let duration_ms = started.elapsed().as_millis() as i64;
    db::finish_sync_log(
        &ctx.pool,
        log_id,
        SyncStatus::Completed,
        counts,
        duration_ms,
        None,
    )
    .await
    .context("failed to close sync log")?;
    Ok(())
}

fn count_change(counts: &mut SyncCounts, change: RecordChange) {
    match change {
        RecordChange::Create => counts.created += 1,
        RecordChange::Update => counts.updated += 1,
    }
}

async fn fail_log(ctx: &SyncContext, log_id: i64, counts: &SyncCounts, started: Instant, msg: &str) {
    let duration_ms = started.elapsed().as_millis() as i64;
    if let Err(err) =
        db::finish_sync_log(&ctx.pool, log_id, SyncStatus::Failed, counts, duration_ms, Some(msg)).await
    {
        error!(log_id, ?err, "could not mark sync log failed");
    }
}

async fn sync_blobs(ctx: &SyncContext, table: &TableConfig, records: &[Fetched], counts: &mut SyncCounts) {
    for item in records {
        for blob in &table.blobs {
            match sync_one_blob(ctx, table, item, &blob.field, &blob.id_column).await {
                Ok(true) => counts.blobs_downloaded += 1,
                Ok(false) => counts.blobs_skipped += 1,
                Err(err) => {
                    warn!(key = %item.key, field = %blob.field, ?err, "blob sync failed");
                    counts.blob_errors += 1;
                }
            }
        }
    }
}

/// Returns `true` when new content was stored, `false` when the stored hash
/// already matched.
async fn sync_one_blob(
    ctx: &SyncContext,
    table: &TableConfig,
    item: &Fetched,
    blob_field: &str,
    id_column: &str,
) -> Result<bool> {
    let download_id = match field(&item.row, id_column) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(anyhow!("row has no value for {}", id_column)),
    };
    let blob = retry_with_backoff(&ctx.retry, ErpError::is_server_error, || {
        ctx.erp.download(&download_id)
    })
    .await?;
    let hash = hex::encode(Sha256::digest(&blob.bytes));
    let stored = mirror::blob_hash_for(&ctx.pool, &table.id, &item.key, blob_field).await?;
    if stored.as_deref() == Some(hash.as_str()) {
        return Ok(false);
    }

    tokio::fs::create_dir_all(&ctx.blob_dir)
        .await
        .with_context(|| format!("failed to create {}", ctx.blob_dir.display()))?;
    let path = ctx.blob_dir.join(&hash);
    if tokio::fs::metadata(&path).await.is_err() {
        tokio::fs::write(&path, &blob.bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    mirror::record_blob(
        &ctx.pool,
        &table.id,
        &item.key,
        blob_field,
        &hash,
        blob.mime_type.as_deref(),
        blob.size,
        &path.to_string_lossy(),
    )
    .await?;
    Ok(true)
}

/// Recount created/updated/deleted from the mirror rows stamped with the log
/// id and close the log.
#[instrument(skip_all, fields(table = %table.id, log_id))]
pub async fn finalize_log(pool: &Pool, table: &TableConfig, log_id: i64) -> Result<SyncLog> {
    let (created, updated, deleted) = mirror::reconciled_counts(pool, table, log_id).await?;
    db::finalize_sync_log(pool, log_id, created, updated, deleted).await?;
    db::get_sync_log(pool, log_id)
        .await?
        .ok_or_else(|| anyhow!("sync log {} vanished", log_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, Config};
    use serde_json::json;

    fn sample_table() -> TableConfig {
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        cfg.protheus.tables[0].clone()
    }

    fn row(v: Value) -> Row {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn key_joins_trimmed_parts() {
        let table = sample_table();
        let r = row(json!({ "A1_FILIAL": "  ", "A1_COD": "000123 ", "A1_LOJA": "01" }));
        assert_eq!(compute_key(&table, &r).as_deref(), Some("|000123|01"));
        let blank = row(json!({ "A1_FILIAL": " ", "A1_COD": "", "A1_LOJA": null }));
        assert_eq!(compute_key(&table, &blank), None);
    }

    #[test]
    fn hash_ignores_erp_padding_but_sees_changes() {
        let table = sample_table();
        let a = row(json!({ "A1_COD": "1", "A1_NOME": "ACME   ", "A1_LC": "10,5" }));
        let b = row(json!({ "A1_COD": "1", "A1_NOME": "ACME", "A1_LC": 10.5 }));
        let c = row(json!({ "A1_COD": "1", "A1_NOME": "ACME LTDA", "A1_LC": 10.5 }));
        let ha = content_hash(&table, &mapped_values(&table, &a));
        let hb = content_hash(&table, &mapped_values(&table, &b));
        let hc = content_hash(&table, &mapped_values(&table, &c));
        assert_eq!(ha, hb);
        assert_ne!(ha, hc);
        assert_eq!(ha.len(), 64);
    }
}
