//! Read access to mirrored tables for interactive browsing.
//!
//! `SyncedDataBrowser` keeps the query state of one table view. Responses are
//! tagged with a monotonically increasing request id and only the latest one
//! is applied; the last good page is kept as a snapshot so a failed refetch
//! does not blank the view.

use crate::config::Protheus;
use crate::db::{self, Pool};
use crate::mirror::{self, DeletedFilter, DynamicPage, DynamicQuery, SortSpec};
use crate::model::SyncLog;
use crate::prefs::PreferenceStore;
use crate::sync::{self, SyncContext, SyncSummary};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[async_trait]
pub trait DynamicTableSource: Send + Sync {
    async fn query_dynamic_table(&self, table_id: &str, query: &DynamicQuery) -> Result<DynamicPage>;

    async fn list_deleted(&self, table_id: &str, page: u32, page_size: u32) -> Result<DynamicPage>;

    async fn restore(&self, table_id: &str, protheus_ids: &[String]) -> Result<u64>;
}

/// Steps of a forced sync, each callable on its own.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn prepare_columns(&self, table_id: &str) -> Result<Vec<String>>;

    async fn run_sync(&self, table_id: &str) -> Result<SyncSummary>;

    async fn finalize_flags(&self, table_id: &str, log_id: i64) -> Result<u64>;

    async fn finalize_log(&self, table_id: &str, log_id: i64) -> Result<SyncLog>;

    async fn latest_log(&self, table_id: &str) -> Result<Option<SyncLog>>;
}

#[derive(Clone)]
pub struct MirrorSource {
    pool: Pool,
    protheus: Protheus,
}

impl MirrorSource {
    pub fn new(pool: Pool, protheus: Protheus) -> Self {
        Self { pool, protheus }
    }
}

#[async_trait]
impl DynamicTableSource for MirrorSource {
    async fn query_dynamic_table(&self, table_id: &str, query: &DynamicQuery) -> Result<DynamicPage> {
        let table = self
            .protheus
            .table(table_id)
            .ok_or_else(|| anyhow!("unknown table {}", table_id))?;
        mirror::query_dynamic_table(&self.pool, table, query).await
    }

    async fn list_deleted(&self, table_id: &str, page: u32, page_size: u32) -> Result<DynamicPage> {
        let query = DynamicQuery {
            page,
            page_size,
            deleted: DeletedFilter::Only,
            sort: Some(SortSpec {
                column: "pending_deletion_at".into(),
                descending: true,
            }),
            ..Default::default()
        };
        self.query_dynamic_table(table_id, &query).await
    }

    async fn restore(&self, table_id: &str, protheus_ids: &[String]) -> Result<u64> {
        let table = self
            .protheus
            .table(table_id)
            .ok_or_else(|| anyhow!("unknown table {}", table_id))?;
        mirror::restore(&self.pool, table, protheus_ids).await
    }
}

/// Runs every sync step in-process against the local database.
#[derive(Clone)]
pub struct LocalSyncBackend {
    ctx: SyncContext,
}

impl LocalSyncBackend {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SyncBackend for LocalSyncBackend {
    async fn prepare_columns(&self, table_id: &str) -> Result<Vec<String>> {
        let table = self.ctx.table(table_id)?;
        mirror::prepare_columns(&self.ctx.pool, table, &self.ctx.retry).await
    }

    async fn run_sync(&self, table_id: &str) -> Result<SyncSummary> {
        sync::run_sync(&self.ctx, table_id).await
    }

    async fn finalize_flags(&self, table_id: &str, log_id: i64) -> Result<u64> {
        let table = self.ctx.table(table_id)?;
        mirror::finalize_flags(&self.ctx.pool, table, log_id).await
    }

    async fn finalize_log(&self, table_id: &str, log_id: i64) -> Result<SyncLog> {
        let table = self.ctx.table(table_id)?;
        sync::finalize_log(&self.ctx.pool, table, log_id).await
    }

    async fn latest_log(&self, table_id: &str) -> Result<Option<SyncLog>> {
        db::latest_sync_log(&self.ctx.pool, table_id).await
    }
}

/// What a forced sync did. Step failures are collected as warnings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ForceSyncReport {
    pub added_columns: Vec<String>,
    pub summary: Option<SyncSummary>,
    pub flags_cleared: Option<u64>,
    pub log: Option<SyncLog>,
    pub warnings: Vec<String>,
}

/// prepare columns → sync → finalize flags → finalize log. A failing step is
/// recorded and the later steps still run.
#[instrument(skip_all, fields(table = %table_id))]
pub async fn force_sync_steps(backend: &dyn SyncBackend, table_id: &str) -> ForceSyncReport {
    let mut report = ForceSyncReport::default();

    match backend.prepare_columns(table_id).await {
        Ok(added) => report.added_columns = added,
        Err(err) => {
            warn!(?err, "column preparation failed");
            report.warnings.push(format!("prepare columns: {:#}", err));
        }
    }

    let mut log_id = None;
    match backend.run_sync(table_id).await {
        Ok(summary) => {
            log_id = Some(summary.log_id);
            report.summary = Some(summary);
        }
        Err(err) => {
            warn!(?err, "sync failed");
            report.warnings.push(format!("sync: {:#}", err));
            match backend.latest_log(table_id).await {
                Ok(Some(log)) => log_id = Some(log.id),
                Ok(None) => {}
                Err(err) => report.warnings.push(format!("latest log: {:#}", err)),
            }
        }
    }

    let Some(log_id) = log_id else {
        report.warnings.push("no sync log to finalize".into());
        return report;
    };

    match backend.finalize_flags(table_id, log_id).await {
        Ok(n) => report.flags_cleared = Some(n),
        Err(err) => {
            warn!(?err, log_id, "flag finalization failed");
            report.warnings.push(format!("finalize flags: {:#}", err));
        }
    }
    match backend.finalize_log(table_id, log_id).await {
        Ok(log) => report.log = Some(log),
        Err(err) => {
            warn!(?err, log_id, "log finalization failed");
            report.warnings.push(format!("finalize log: {:#}", err));
        }
    }
    info!(log_id, warnings = report.warnings.len(), "forced sync finished");
    report
}

/// Last successfully applied page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub data: Vec<Map<String, Value>>,
    pub columns: Vec<String>,
    pub total_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied,
    /// A newer request was issued while this one was in flight.
    Stale,
    /// A newer change arrived during the debounce window.
    Superseded,
    Failed(String),
}

#[derive(Default)]
struct BrowserState {
    query: DynamicQuery,
    snapshot: Snapshot,
    last_error: Option<String>,
}

pub struct SyncedDataBrowser {
    table_id: String,
    source: Arc<dyn DynamicTableSource>,
    backend: Arc<dyn SyncBackend>,
    prefs: Arc<dyn PreferenceStore>,
    debounce: Duration,
    state: Mutex<BrowserState>,
    request_seq: AtomicU64,
    change_seq: AtomicU64,
}

impl SyncedDataBrowser {
    /// Build a browser for `table_id`, restoring remembered sort and page size.
    pub async fn open(
        table_id: &str,
        source: Arc<dyn DynamicTableSource>,
        backend: Arc<dyn SyncBackend>,
        prefs: Arc<dyn PreferenceStore>,
        default_page_size: u32,
        debounce: Duration,
    ) -> Self {
        let mut query = DynamicQuery {
            page_size: default_page_size.max(1),
            ..Default::default()
        };
        let scope = pref_scope(table_id);
        match prefs.get(&scope, "sort").await {
            Ok(Some(v)) => query.sort = serde_json::from_value(v).ok(),
            Ok(None) => {}
            Err(err) => warn!(?err, "could not load sort preference"),
        }
        match prefs.get(&scope, "page_size").await {
            Ok(Some(v)) => {
                if let Some(n) = v.as_u64().filter(|n| *n > 0 && *n <= u32::MAX as u64) {
                    query.page_size = n as u32;
                }
            }
            Ok(None) => {}
            Err(err) => warn!(?err, "could not load page size preference"),
        }
        Self {
            table_id: table_id.to_string(),
            source,
            backend,
            prefs,
            debounce,
            state: Mutex::new(BrowserState {
                query,
                ..Default::default()
            }),
            request_seq: AtomicU64::new(0),
            change_seq: AtomicU64::new(0),
        }
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub async fn query(&self) -> DynamicQuery {
        self.state.lock().await.query.clone()
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    /// Fetch the current query. Only the most recently issued request may
    /// update the snapshot.
    pub async fn refresh(&self) -> FetchOutcome {
        let request_id = self.request_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let query = self.query().await;
        let result = self.source.query_dynamic_table(&self.table_id, &query).await;

        let mut state = self.state.lock().await;
        if self.request_seq.load(Ordering::SeqCst) != request_id {
            return FetchOutcome::Stale;
        }
        match result {
            Ok(page) => {
                state.snapshot = Snapshot {
                    data: page.data,
                    columns: page.columns,
                    total_count: page.total_count,
                };
                state.last_error = None;
                FetchOutcome::Applied
            }
            Err(err) => {
                let msg = format!("{:#}", err);
                warn!(table = %self.table_id, %msg, "refresh failed; keeping last snapshot");
                state.last_error = Some(msg.clone());
                FetchOutcome::Failed(msg)
            }
        }
    }

    async fn refresh_debounced(&self) -> FetchOutcome {
        let generation = self.change_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.debounce.is_zero() {
            tokio::time::sleep(self.debounce).await;
        }
        if self.change_seq.load(Ordering::SeqCst) != generation {
            return FetchOutcome::Superseded;
        }
        self.refresh().await
    }

    pub async fn set_search(&self, term: &str) -> FetchOutcome {
        {
            let mut state = self.state.lock().await;
            let term = term.trim();
            state.query.search = (!term.is_empty()).then(|| term.to_string());
            state.query.page = 0;
        }
        self.refresh_debounced().await
    }

    pub async fn set_filter(&self, column: &str, value: Value) -> FetchOutcome {
        {
            let mut state = self.state.lock().await;
            state.query.filters.insert(column.to_string(), value);
            state.query.page = 0;
        }
        self.refresh_debounced().await
    }

    pub async fn clear_filters(&self) -> FetchOutcome {
        {
            let mut state = self.state.lock().await;
            state.query.filters.clear();
            state.query.search = None;
            state.query.page = 0;
        }
        self.refresh_debounced().await
    }

    pub async fn set_sort(&self, sort: Option<SortSpec>) -> FetchOutcome {
        {
            let mut state = self.state.lock().await;
            state.query.sort = sort.clone();
            state.query.page = 0;
        }
        self.remember("sort", serde_json::to_value(&sort).unwrap_or(Value::Null))
            .await;
        self.refresh().await
    }

    pub async fn set_page(&self, page: u32) -> FetchOutcome {
        self.state.lock().await.query.page = page;
        self.refresh().await
    }

    pub async fn set_page_size(&self, page_size: u32) -> FetchOutcome {
        let page_size = page_size.max(1);
        {
            let mut state = self.state.lock().await;
            state.query.page_size = page_size;
            state.query.page = 0;
        }
        self.remember("page_size", json!(page_size)).await;
        self.refresh().await
    }

    async fn remember(&self, key: &str, value: Value) {
        if let Err(err) = self.prefs.set(&pref_scope(&self.table_id), key, value).await {
            warn!(?err, key, "could not save browser preference");
        }
    }

    /// Run the full sync pipeline for this table, then refresh the view.
    pub async fn force_sync(&self) -> ForceSyncReport {
        let mut report = force_sync_steps(self.backend.as_ref(), &self.table_id).await;
        if let FetchOutcome::Failed(msg) = self.refresh().await {
            report.warnings.push(format!("refresh: {}", msg));
        }
        report
    }

    /// Poll the latest sync log until it reaches a terminal status.
    pub async fn wait_for_sync(&self, poll_interval: Duration, timeout: Duration) -> Result<SyncLog> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(log) = self.backend.latest_log(&self.table_id).await? {
                if log.status.is_terminal() {
                    return Ok(log);
                }
            }
            if tokio::time::Instant::now() + poll_interval > deadline {
                return Err(anyhow!(
                    "sync of {} still running after {:?}",
                    self.table_id,
                    timeout
                ));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn deleted_records(&self, page: u32) -> Result<DynamicPage> {
        let page_size = self.query().await.page_size;
        self.source.list_deleted(&self.table_id, page, page_size).await
    }

    /// Clear the soft-delete marker on the given records and refresh.
    pub async fn restore(&self, protheus_ids: &[String]) -> Result<u64> {
        let restored = self.source.restore(&self.table_id, protheus_ids).await?;
        info!(table = %self.table_id, restored, "records restored");
        self.refresh().await;
        Ok(restored)
    }
}

fn pref_scope(table_id: &str) -> String {
    format!("browser:{}", table_id)
}
