//! Physical mirror tables for ERP data.
//!
//! Each configured ERP table is mirrored into its own SQLite table whose
//! columns follow the configured mapping, plus bookkeeping columns for change
//! tracking and soft deletion. Identifiers are validated by `config` before
//! they reach any statement built here.

use crate::config::TableConfig;
use crate::model::{Cast, CellValue};
use crate::retry::{retry_with_backoff, RetryPolicy};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument};

const KEY_CHUNK: usize = 500;
const SOFT_DELETE_COLUMNS: [(&str, &str); 2] = [
    ("pending_deletion", "INTEGER NOT NULL DEFAULT 0"),
    ("pending_deletion_at", "TEXT"),
];

/// Whether a fetched row creates or updates its mirror row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordChange {
    Create,
    Update,
}

/// One row ready to be upserted. `values` follow `TableConfig::stored_columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRecord {
    pub protheus_id: String,
    pub values: Vec<CellValue>,
    pub hash: Option<String>,
    pub change: RecordChange,
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bind_cell<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &CellValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        CellValue::Null => query.bind(None::<String>),
        CellValue::Int(i) => query.bind(*i),
        CellValue::Real(f) => query.bind(*f),
        CellValue::Bool(b) => query.bind(*b),
        CellValue::Text(s) => query.bind(s.clone()),
    }
}

pub async fn table_columns(pool: &SqlitePool, mirror_table: &str) -> Result<Vec<String>> {
    let cols = sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?)")
        .bind(mirror_table)
        .fetch_all(pool)
        .await?;
    Ok(cols)
}

/// Create the mirror table if needed and add mapped columns that are missing.
#[instrument(skip_all, fields(table = %table.mirror_table))]
pub async fn ensure_table(pool: &SqlitePool, table: &TableConfig) -> Result<Vec<String>> {
    let name = quote_ident(&table.mirror_table);
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         id INTEGER PRIMARY KEY AUTOINCREMENT, \
         protheus_id TEXT NOT NULL UNIQUE, \
         record_hash TEXT, \
         is_new_record INTEGER NOT NULL DEFAULT 0, \
         was_updated_last_sync INTEGER NOT NULL DEFAULT 0, \
         last_sync_id INTEGER, \
         created_at TEXT NOT NULL, \
         updated_at TEXT NOT NULL",
        name
    );
    for col in table.stored_columns() {
        ddl.push_str(&format!(", {} {}", quote_ident(&col.target), col.cast.sql_type()));
    }
    ddl.push(')');
    sqlx::query(&ddl).execute(pool).await?;

    let existing = table_columns(pool, &table.mirror_table).await?;
    let mut added = Vec::new();
    for col in table.stored_columns() {
        if !existing.iter().any(|c| c.eq_ignore_ascii_case(&col.target)) {
            let alter = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                name,
                quote_ident(&col.target),
                col.cast.sql_type()
            );
            sqlx::query(&alter).execute(pool).await?;
            info!(column = %col.target, "added mapped column");
            added.push(col.target.clone());
        }
    }
    Ok(added)
}

/// Make sure the soft-delete columns exist and are visible, retrying the
/// visibility check within `policy`. Returns the columns that were added.
#[instrument(skip_all, fields(table = %table.mirror_table))]
pub async fn prepare_columns(
    pool: &SqlitePool,
    table: &TableConfig,
    policy: &RetryPolicy,
) -> Result<Vec<String>> {
    let mut added = ensure_table(pool, table).await?;
    let existing = table_columns(pool, &table.mirror_table).await?;
    for (column, decl) in SOFT_DELETE_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            let alter = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(&table.mirror_table),
                column,
                decl
            );
            sqlx::query(&alter).execute(pool).await?;
            info!(column, "added soft-delete column");
            added.push(column.to_string());
        }
    }

    retry_with_backoff(
        policy,
        |_: &anyhow::Error| true,
        || async {
            let cols = table_columns(pool, &table.mirror_table).await?;
            match SOFT_DELETE_COLUMNS
                .iter()
                .find(|(c, _)| !cols.iter().any(|x| x == c))
            {
                Some((missing, _)) => Err(anyhow!("column {} not visible yet", missing)),
                None => Ok(()),
            }
        },
    )
    .await?;
    Ok(added)
}

/// Stored hash per ERP key. A `None` hash means the row was written with
/// hashing disabled.
pub async fn load_hashes(
    pool: &SqlitePool,
    table: &TableConfig,
) -> Result<HashMap<String, Option<String>>> {
    let sql = format!(
        "SELECT protheus_id, record_hash FROM {}",
        quote_ident(&table.mirror_table)
    );
    let rows = sqlx::query_as::<_, (String, Option<String>)>(&sql)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().collect())
}

fn upsert_sql(table: &TableConfig) -> String {
    let targets: Vec<String> = table
        .stored_columns()
        .map(|c| quote_ident(&c.target))
        .collect();
    let mut columns = vec!["protheus_id".to_string()];
    columns.extend(targets.iter().cloned());
    columns.extend(
        [
            "record_hash",
            "is_new_record",
            "was_updated_last_sync",
            "last_sync_id",
            "pending_deletion",
            "pending_deletion_at",
            "created_at",
            "updated_at",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut updates: Vec<String> = targets
        .iter()
        .map(|t| format!("{t} = excluded.{t}"))
        .collect();
    updates.extend(
        [
            "record_hash = excluded.record_hash",
            "is_new_record = excluded.is_new_record",
            "was_updated_last_sync = excluded.was_updated_last_sync",
            "last_sync_id = excluded.last_sync_id",
            "pending_deletion = 0",
            "pending_deletion_at = NULL",
            "updated_at = excluded.updated_at",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (protheus_id) DO UPDATE SET {}",
        quote_ident(&table.mirror_table),
        columns.join(", "),
        placeholders,
        updates.join(", ")
    )
}

async fn upsert_record<'e, E>(exec: E, sql: &str, record: &MirrorRecord, sync_id: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now();
    let mut query = sqlx::query(sql).bind(record.protheus_id.clone());
    for value in &record.values {
        query = bind_cell(query, value);
    }
    query
        .bind(record.hash.clone())
        .bind(record.change == RecordChange::Create)
        .bind(record.change == RecordChange::Update)
        .bind(sync_id)
        .bind(false)
        .bind(None::<String>)
        .bind(now)
        .bind(now)
        .execute(exec)
        .await
        .with_context(|| format!("failed to upsert {}", record.protheus_id))?;
    Ok(())
}

/// Upsert a batch atomically; any failure rolls back the whole batch.
#[instrument(skip_all, fields(table = %table.mirror_table, n = records.len()))]
pub async fn upsert_batch(
    pool: &SqlitePool,
    table: &TableConfig,
    records: &[MirrorRecord],
    sync_id: i64,
) -> Result<()> {
    let sql = upsert_sql(table);
    let mut tx = pool.begin().await?;
    for record in records {
        upsert_record(&mut *tx, &sql, record, sync_id).await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn upsert_one(
    pool: &SqlitePool,
    table: &TableConfig,
    record: &MirrorRecord,
    sync_id: i64,
) -> Result<()> {
    upsert_record(pool, &upsert_sql(table), record, sync_id).await
}

/// Two-phase soft delete against the set of keys seen in the current fetch.
///
/// Phase one flags every live row whose key is absent; phase two clears the
/// flag on rows that came back. Both phases share one transaction, so a crash
/// in between leaves the previous state intact. Returns the number of rows
/// newly flagged.
#[instrument(skip_all, fields(table = %table.mirror_table, active = active_keys.len()))]
pub async fn reconcile_deletions(
    pool: &SqlitePool,
    table: &TableConfig,
    active_keys: &[String],
    sync_id: i64,
) -> Result<u64> {
    let name = quote_ident(&table.mirror_table);
    let mut tx = pool.begin().await?;
    sqlx::query("CREATE TEMP TABLE IF NOT EXISTS sync_active_keys (protheus_id TEXT PRIMARY KEY)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM temp.sync_active_keys")
        .execute(&mut *tx)
        .await?;
    for chunk in active_keys.chunks(KEY_CHUNK) {
        let sql = format!(
            "INSERT OR IGNORE INTO temp.sync_active_keys (protheus_id) VALUES {}",
            vec!["(?)"; chunk.len()].join(", ")
        );
        let mut query = sqlx::query(&sql);
        for key in chunk {
            query = query.bind(key.clone());
        }
        query.execute(&mut *tx).await?;
    }

    let flagged = sqlx::query(&format!(
        "UPDATE {} SET pending_deletion = 1, pending_deletion_at = ?, is_new_record = 0, \
         was_updated_last_sync = 0, last_sync_id = ? \
         WHERE COALESCE(pending_deletion, 0) = 0 \
         AND protheus_id NOT IN (SELECT protheus_id FROM temp.sync_active_keys)",
        name
    ))
    .bind(Utc::now())
    .bind(sync_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let restored = sqlx::query(&format!(
        "UPDATE {} SET pending_deletion = 0, pending_deletion_at = NULL \
         WHERE pending_deletion = 1 \
         AND protheus_id IN (SELECT protheus_id FROM temp.sync_active_keys)",
        name
    ))
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query("DELETE FROM temp.sync_active_keys")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    debug!(flagged, restored, "soft-delete reconciliation done");
    Ok(flagged)
}

/// Clear change flags on rows the given sync did not touch.
#[instrument(skip_all, fields(table = %table.mirror_table))]
pub async fn finalize_flags(pool: &SqlitePool, table: &TableConfig, sync_id: i64) -> Result<u64> {
    let res = sqlx::query(&format!(
        "UPDATE {} SET is_new_record = 0, was_updated_last_sync = 0 \
         WHERE (last_sync_id IS NULL OR last_sync_id != ?) \
         AND (is_new_record = 1 OR was_updated_last_sync = 1)",
        quote_ident(&table.mirror_table)
    ))
    .bind(sync_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// `(created, updated, deleted)` recounted from the rows a sync touched.
pub async fn reconciled_counts(
    pool: &SqlitePool,
    table: &TableConfig,
    sync_id: i64,
) -> Result<(i64, i64, i64)> {
    let sql = format!(
        "SELECT \
         COALESCE(SUM(CASE WHEN is_new_record = 1 AND COALESCE(pending_deletion, 0) = 0 THEN 1 ELSE 0 END), 0), \
         COALESCE(SUM(CASE WHEN was_updated_last_sync = 1 AND COALESCE(pending_deletion, 0) = 0 THEN 1 ELSE 0 END), 0), \
         COALESCE(SUM(CASE WHEN pending_deletion = 1 THEN 1 ELSE 0 END), 0) \
         FROM {} WHERE last_sync_id = ?",
        quote_ident(&table.mirror_table)
    );
    let counts = sqlx::query_as::<_, (i64, i64, i64)>(&sql)
        .bind(sync_id)
        .fetch_one(pool)
        .await?;
    Ok(counts)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub column: String,
    pub descending: bool,
}

/// Which rows a dynamic query returns with respect to soft deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedFilter {
    #[default]
    Exclude,
    Include,
    Only,
}

/// Parameters of `query_dynamic_table`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicQuery {
    pub page: u32,
    pub page_size: u32,
    pub search: Option<String>,
    pub filters: BTreeMap<String, Value>,
    pub sort: Option<SortSpec>,
    pub deleted: DeletedFilter,
}

/// One page of a mirror table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicPage {
    pub data: Vec<Map<String, Value>>,
    pub total_count: i64,
    pub columns: Vec<String>,
}

fn visible_columns(table: &TableConfig, existing: &[String]) -> Vec<String> {
    let mut cols = vec!["protheus_id".to_string()];
    cols.extend(table.stored_columns().map(|c| c.target.clone()));
    for extra in [
        "is_new_record",
        "was_updated_last_sync",
        "pending_deletion",
        "pending_deletion_at",
        "updated_at",
    ] {
        cols.push(extra.to_string());
    }
    cols.retain(|c| existing.iter().any(|e| e == c));
    cols
}

fn filter_value(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::Null,
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => CellValue::Int(i),
            None => CellValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Text(other.to_string()),
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Paginated, searchable, filterable, sortable read over a mirror table.
#[instrument(skip_all, fields(table = %table.mirror_table, page = query.page))]
pub async fn query_dynamic_table(
    pool: &SqlitePool,
    table: &TableConfig,
    query: &DynamicQuery,
) -> Result<DynamicPage> {
    let existing = table_columns(pool, &table.mirror_table).await?;
    if existing.is_empty() {
        return Ok(DynamicPage {
            data: Vec::new(),
            total_count: 0,
            columns: std::iter::once("protheus_id".to_string())
                .chain(table.stored_columns().map(|c| c.target.clone()))
                .collect(),
        });
    }
    let columns = visible_columns(table, &existing);
    let has_soft_delete = existing.iter().any(|c| c == "pending_deletion");

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<CellValue> = Vec::new();

    if has_soft_delete {
        match query.deleted {
            DeletedFilter::Exclude => clauses.push("COALESCE(pending_deletion, 0) = 0".into()),
            DeletedFilter::Only => clauses.push("pending_deletion = 1".into()),
            DeletedFilter::Include => {}
        }
    } else if query.deleted == DeletedFilter::Only {
        clauses.push("1 = 0".into());
    }

    if let Some(term) = query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let mut searchable = vec!["protheus_id".to_string()];
        searchable.extend(
            table
                .stored_columns()
                .filter(|c| matches!(c.cast, Cast::Text | Cast::Date | Cast::Timestamp))
                .map(|c| c.target.clone()),
        );
        searchable.retain(|c| existing.iter().any(|e| e == c));
        let pattern = format!("%{}%", escape_like(term));
        let ors: Vec<String> = searchable
            .iter()
            .map(|c| {
                binds.push(CellValue::Text(pattern.clone()));
                format!("{} LIKE ? ESCAPE '\\'", quote_ident(c))
            })
            .collect();
        clauses.push(format!("({})", ors.join(" OR ")));
    }

    for (column, value) in &query.filters {
        if !columns.iter().any(|c| c == column) {
            return Err(anyhow!("unknown filter column {}", column));
        }
        match filter_value(value) {
            CellValue::Null => clauses.push(format!("{} IS NULL", quote_ident(column))),
            cell => {
                clauses.push(format!("{} = ?", quote_ident(column)));
                binds.push(cell);
            }
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let name = quote_ident(&table.mirror_table);

    let count_sql = format!("SELECT COUNT(*) FROM {}{}", name, where_sql);
    let mut count_query = sqlx::query(&count_sql);
    for b in &binds {
        count_query = bind_cell(count_query, b);
    }
    let total_count: i64 = count_query.fetch_one(pool).await?.get(0);

    let order = match &query.sort {
        Some(sort) if columns.iter().any(|c| c == &sort.column) => format!(
            "{} {}, id ASC",
            quote_ident(&sort.column),
            if sort.descending { "DESC" } else { "ASC" }
        ),
        Some(sort) => return Err(anyhow!("unknown sort column {}", sort.column)),
        None => "id ASC".to_string(),
    };
    let page_size = query.page_size.max(1);
    let select_sql = format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        name,
        where_sql,
        order
    );
    let mut select = sqlx::query(&select_sql);
    for b in &binds {
        select = bind_cell(select, b);
    }
    let rows = select
        .bind(i64::from(page_size))
        .bind(i64::from(query.page) * i64::from(page_size))
        .fetch_all(pool)
        .await?;

    let data = rows
        .iter()
        .map(|row| row_to_json(row, table))
        .collect::<Result<Vec<_>>>()?;
    Ok(DynamicPage {
        data,
        total_count,
        columns,
    })
}

fn row_to_json(row: &SqliteRow, table: &TableConfig) -> Result<Map<String, Value>> {
    use sqlx::Column;
    let mut out = Map::new();
    for (i, col) in row.columns().iter().enumerate() {
        let name = col.name();
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            out.insert(name.to_string(), Value::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_string();
        let is_bool = matches!(
            name,
            "is_new_record" | "was_updated_last_sync" | "pending_deletion"
        ) || table
            .stored_columns()
            .any(|c| c.target == name && c.cast == Cast::Boolean);
        let value = match type_name.as_str() {
            "INTEGER" | "BOOLEAN" => {
                let i: i64 = row.try_get(i)?;
                if is_bool {
                    Value::Bool(i != 0)
                } else {
                    Value::from(i)
                }
            }
            "REAL" => Value::from(row.try_get::<f64, _>(i)?),
            "BLOB" => Value::Null,
            _ => Value::String(row.try_get::<String, _>(i)?),
        };
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

/// Restore soft-deleted rows by key. Returns how many rows changed.
#[instrument(skip_all, fields(table = %table.mirror_table, n = protheus_ids.len()))]
pub async fn restore(pool: &SqlitePool, table: &TableConfig, protheus_ids: &[String]) -> Result<u64> {
    let mut restored = 0;
    for chunk in protheus_ids.chunks(KEY_CHUNK) {
        let sql = format!(
            "UPDATE {} SET pending_deletion = 0, pending_deletion_at = NULL, updated_at = ? \
             WHERE pending_deletion = 1 AND protheus_id IN ({})",
            quote_ident(&table.mirror_table),
            vec!["?"; chunk.len()].join(", ")
        );
        let mut query = sqlx::query(&sql).bind(Utc::now());
        for id in chunk {
            query = query.bind(id.clone());
        }
        restored += query.execute(pool).await?.rows_affected();
    }
    Ok(restored)
}

/// Stored content hash of a record's blob field, if any.
pub async fn blob_hash_for(
    pool: &SqlitePool,
    table_id: &str,
    protheus_id: &str,
    field: &str,
) -> Result<Option<String>> {
    let hash = sqlx::query_scalar::<_, String>(
        "SELECT content_hash FROM mirror_blobs WHERE table_id = ? AND protheus_id = ? AND field = ?",
    )
    .bind(table_id)
    .bind(protheus_id)
    .bind(field)
    .fetch_optional(pool)
    .await?;
    Ok(hash)
}

#[allow(clippy::too_many_arguments)]
pub async fn record_blob(
    pool: &SqlitePool,
    table_id: &str,
    protheus_id: &str,
    field: &str,
    content_hash: &str,
    mime_type: Option<&str>,
    size: i64,
    path: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO mirror_blobs (table_id, protheus_id, field, content_hash, mime_type, size, path, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (table_id, protheus_id, field) DO UPDATE SET content_hash = excluded.content_hash, \
         mime_type = excluded.mime_type, size = excluded.size, path = excluded.path, updated_at = excluded.updated_at",
    )
    .bind(table_id)
    .bind(protheus_id)
    .bind(field)
    .bind(content_hash)
    .bind(mime_type)
    .bind(size)
    .bind(path)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
