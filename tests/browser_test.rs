use anyhow::{anyhow, Result};
use chrono::Utc;
use portal_sync::browser::{
    force_sync_steps, DynamicTableSource, FetchOutcome, MirrorSource, SyncBackend,
    SyncedDataBrowser,
};
use portal_sync::config::{Protheus, TableConfig};
use portal_sync::db::SyncCounts;
use portal_sync::mirror::{self, DeletedFilter, DynamicPage, DynamicQuery, MirrorRecord, RecordChange, SortSpec};
use portal_sync::model::{CellValue, SyncLog, SyncStatus};
use portal_sync::prefs::{MemoryPreferences, PreferenceStore};
use portal_sync::retry::RetryPolicy;
use portal_sync::sync::SyncSummary;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn page_of(label: &str) -> DynamicPage {
    let mut row = Map::new();
    row.insert("protheus_id".into(), json!(label));
    DynamicPage {
        data: vec![row],
        total_count: 1,
        columns: vec!["protheus_id".into()],
    }
}

/// Answers with a page named after the search term, after a per-term delay.
#[derive(Clone, Default)]
struct ScriptedSource {
    delays_ms: Arc<Mutex<Vec<(String, u64)>>>,
    failures: Arc<Mutex<VecDeque<String>>>,
    seen: Arc<Mutex<Vec<DynamicQuery>>>,
}

impl ScriptedSource {
    async fn delay(&self, term: &str, ms: u64) {
        self.delays_ms.lock().await.push((term.to_string(), ms));
    }

    async fn fail_next(&self, message: &str) {
        self.failures.lock().await.push_back(message.to_string());
    }

    async fn seen(&self) -> Vec<DynamicQuery> {
        self.seen.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl DynamicTableSource for ScriptedSource {
    async fn query_dynamic_table(&self, _table_id: &str, query: &DynamicQuery) -> Result<DynamicPage> {
        self.seen.lock().await.push(query.clone());
        let term = query.search.clone().unwrap_or_else(|| "all".into());
        let delay = self
            .delays_ms
            .lock()
            .await
            .iter()
            .find(|(t, _)| *t == term)
            .map(|(_, ms)| *ms)
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if let Some(message) = self.failures.lock().await.pop_front() {
            return Err(anyhow!(message));
        }
        Ok(page_of(&term))
    }

    async fn list_deleted(&self, _table_id: &str, _page: u32, _page_size: u32) -> Result<DynamicPage> {
        Ok(DynamicPage::default())
    }

    async fn restore(&self, _table_id: &str, protheus_ids: &[String]) -> Result<u64> {
        Ok(protheus_ids.len() as u64)
    }
}

fn sync_log(id: i64, status: SyncStatus) -> SyncLog {
    SyncLog {
        id,
        table_id: "clientes".into(),
        status,
        started_at: Utc::now(),
        finished_at: None,
        duration_ms: None,
        fetched: 0,
        created: 0,
        updated: 0,
        unchanged: 0,
        deleted: 0,
        errors: 0,
        blobs_downloaded: 0,
        blobs_skipped: 0,
        blob_errors: 0,
        error_message: None,
        finalized_at: None,
    }
}

#[derive(Clone, Default)]
struct FakeBackend {
    fail_prepare: bool,
    fail_sync: bool,
    latest: Arc<Mutex<VecDeque<SyncLog>>>,
    steps: Arc<Mutex<Vec<String>>>,
}

impl FakeBackend {
    async fn steps(&self) -> Vec<String> {
        self.steps.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl SyncBackend for FakeBackend {
    async fn prepare_columns(&self, _table_id: &str) -> Result<Vec<String>> {
        self.steps.lock().await.push("prepare".into());
        if self.fail_prepare {
            return Err(anyhow!("database is locked"));
        }
        Ok(vec!["pending_deletion".into()])
    }

    async fn run_sync(&self, table_id: &str) -> Result<SyncSummary> {
        self.steps.lock().await.push("sync".into());
        if self.fail_sync {
            return Err(anyhow!("ERP proxy error 502"));
        }
        Ok(SyncSummary {
            log_id: 7,
            table_id: table_id.to_string(),
            counts: SyncCounts {
                fetched: 3,
                created: 1,
                ..Default::default()
            },
        })
    }

    async fn finalize_flags(&self, _table_id: &str, log_id: i64) -> Result<u64> {
        self.steps.lock().await.push(format!("flags:{}", log_id));
        Ok(2)
    }

    async fn finalize_log(&self, _table_id: &str, log_id: i64) -> Result<SyncLog> {
        self.steps.lock().await.push(format!("log:{}", log_id));
        Ok(sync_log(log_id, SyncStatus::Completed))
    }

    async fn latest_log(&self, _table_id: &str) -> Result<Option<SyncLog>> {
        let mut latest = self.latest.lock().await;
        if latest.len() > 1 {
            return Ok(latest.pop_front());
        }
        Ok(latest.front().cloned())
    }
}

async fn open(
    source: &ScriptedSource,
    backend: &FakeBackend,
    prefs: Arc<dyn PreferenceStore>,
    debounce_ms: u64,
) -> SyncedDataBrowser {
    SyncedDataBrowser::open(
        "clientes",
        Arc::new(source.clone()),
        Arc::new(backend.clone()),
        prefs,
        50,
        Duration::from_millis(debounce_ms),
    )
    .await
}

#[tokio::test(start_paused = true)]
async fn slow_earlier_response_is_discarded() {
    let source = ScriptedSource::default();
    source.delay("A", 50).await;
    source.delay("B", 10).await;
    let browser = open(&source, &FakeBackend::default(), Arc::new(MemoryPreferences::default()), 0).await;

    let (first, second) = tokio::join!(browser.set_search("A"), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        browser.set_search("B").await
    });

    assert_eq!(first, FetchOutcome::Stale);
    assert_eq!(second, FetchOutcome::Applied);
    let snapshot = browser.snapshot().await;
    assert_eq!(snapshot.data[0]["protheus_id"], json!("B"));
}

#[tokio::test(start_paused = true)]
async fn typing_within_debounce_window_issues_one_request() {
    let source = ScriptedSource::default();
    let browser = open(&source, &FakeBackend::default(), Arc::new(MemoryPreferences::default()), 300).await;

    let (first, second) = tokio::join!(browser.set_search("ac"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        browser.set_search("acme").await
    });

    assert_eq!(first, FetchOutcome::Superseded);
    assert_eq!(second, FetchOutcome::Applied);
    let seen = source.seen().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].search.as_deref(), Some("acme"));
    assert_eq!(seen[0].page, 0);
}

#[tokio::test]
async fn failed_refresh_keeps_last_snapshot() {
    let source = ScriptedSource::default();
    let browser = open(&source, &FakeBackend::default(), Arc::new(MemoryPreferences::default()), 0).await;

    assert_eq!(browser.refresh().await, FetchOutcome::Applied);
    let good = browser.snapshot().await;

    source.fail_next("connection reset").await;
    assert!(matches!(browser.set_page(3).await, FetchOutcome::Failed(_)));
    assert_eq!(browser.snapshot().await, good);
    assert!(browser.last_error().await.unwrap().contains("connection reset"));
    assert_eq!(browser.query().await.page, 3);

    assert_eq!(browser.refresh().await, FetchOutcome::Applied);
    assert_eq!(browser.last_error().await, None);
}

#[tokio::test]
async fn sort_and_page_size_are_remembered_per_table() {
    let prefs: Arc<dyn PreferenceStore> = Arc::new(MemoryPreferences::default());
    let source = ScriptedSource::default();
    let backend = FakeBackend::default();

    let browser = open(&source, &backend, prefs.clone(), 0).await;
    assert_eq!(browser.query().await.page_size, 50);
    browser
        .set_sort(Some(SortSpec {
            column: "nome".into(),
            descending: true,
        }))
        .await;
    browser.set_page_size(25).await;
    browser.set_search("acme").await;

    let reopened = open(&source, &backend, prefs.clone(), 0).await;
    let query = reopened.query().await;
    assert_eq!(query.page_size, 25);
    assert_eq!(query.sort.unwrap().column, "nome");
    assert_eq!(query.search, None);

    let other = SyncedDataBrowser::open(
        "produtos",
        Arc::new(source.clone()),
        Arc::new(backend.clone()),
        prefs,
        50,
        Duration::ZERO,
    )
    .await;
    assert_eq!(other.query().await.sort, None);
}

#[tokio::test]
async fn force_sync_runs_every_step_despite_failures() {
    let backend = FakeBackend {
        fail_prepare: true,
        ..Default::default()
    };
    let report = force_sync_steps(&backend, "clientes").await;
    assert_eq!(backend.steps().await, vec!["prepare", "sync", "flags:7", "log:7"]);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("database is locked"));
    assert_eq!(report.summary.unwrap().counts.created, 1);
    assert_eq!(report.flags_cleared, Some(2));
    assert_eq!(report.log.unwrap().id, 7);
}

#[tokio::test]
async fn failed_sync_still_finalizes_latest_log() {
    let backend = FakeBackend {
        fail_sync: true,
        ..Default::default()
    };
    backend.latest.lock().await.push_back(sync_log(9, SyncStatus::Failed));
    let source = ScriptedSource::default();
    let browser = open(&source, &backend, Arc::new(MemoryPreferences::default()), 0).await;

    let report = browser.force_sync().await;
    assert!(report.summary.is_none());
    assert_eq!(backend.steps().await, vec!["prepare", "sync", "flags:9", "log:9"]);
    assert!(report.warnings.iter().any(|w| w.contains("502")));
    assert_eq!(browser.snapshot().await.total_count, 1);
}

#[tokio::test(start_paused = true)]
async fn wait_for_sync_polls_until_terminal() {
    let backend = FakeBackend::default();
    {
        let mut latest = backend.latest.lock().await;
        latest.push_back(sync_log(3, SyncStatus::Running));
        latest.push_back(sync_log(3, SyncStatus::Running));
        latest.push_back(sync_log(3, SyncStatus::Completed));
    }
    let browser = open(&ScriptedSource::default(), &backend, Arc::new(MemoryPreferences::default()), 0).await;
    let log = browser
        .wait_for_sync(Duration::from_millis(500), Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(log.status, SyncStatus::Completed);

    let stuck = FakeBackend::default();
    stuck.latest.lock().await.push_back(sync_log(4, SyncStatus::Running));
    let browser = open(&ScriptedSource::default(), &stuck, Arc::new(MemoryPreferences::default()), 0).await;
    assert!(browser
        .wait_for_sync(Duration::from_millis(500), Duration::from_secs(2))
        .await
        .is_err());
}

fn products_table() -> TableConfig {
    serde_yaml::from_str(
        r#"
id: "produtos"
source_table: "SB1010"
mirror_table: "protheus_produtos"
key_fields: ["B1_COD"]
columns:
  - { source: "B1_COD", target: "codigo" }
  - { source: "B1_DESC", target: "descricao" }
  - { source: "B1_PRV1", target: "preco", cast: "NUMERIC" }
  - { source: "B1_ATIVO", target: "ativo", cast: "BOOLEAN" }
"#,
    )
    .unwrap()
}

fn product(code: &str, desc: &str, price: f64, active: bool) -> MirrorRecord {
    MirrorRecord {
        protheus_id: code.to_string(),
        values: vec![
            CellValue::Text(code.to_string()),
            CellValue::Text(desc.to_string()),
            CellValue::Real(price),
            CellValue::Bool(active),
        ],
        hash: None,
        change: RecordChange::Create,
    }
}

async fn seeded_products(pool: &sqlx::SqlitePool) -> TableConfig {
    let table = products_table();
    let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
    mirror::prepare_columns(pool, &table, &policy).await.unwrap();
    let records = vec![
        product("P01", "ACIDO CITRICO 50%", 12.5, true),
        product("P02", "ACME SOLVENTE", 40.0, false),
        product("P03", "GLICERINA", 8.0, true),
        product("P04", "SODA CAUSTICA", 20.0, true),
    ];
    mirror::upsert_batch(pool, &table, &records, 1).await.unwrap();
    let active: Vec<String> = ["P01", "P02", "P03"].iter().map(|s| s.to_string()).collect();
    mirror::reconcile_deletions(pool, &table, &active, 2).await.unwrap();
    table
}

fn codes(page: &DynamicPage) -> Vec<String> {
    page.data
        .iter()
        .map(|row| row["protheus_id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn dynamic_query_filters_sorts_and_hides_deleted_rows() {
    let pool = setup_pool().await;
    let table = seeded_products(&pool).await;

    let all = mirror::query_dynamic_table(
        &pool,
        &table,
        &DynamicQuery {
            page_size: 10,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(all.total_count, 3);
    assert_eq!(codes(&all), vec!["P01", "P02", "P03"]);
    assert!(all.columns.contains(&"preco".to_string()));
    assert_eq!(all.data[0]["ativo"], json!(true));
    assert_eq!(all.data[1]["ativo"], json!(false));
    assert_eq!(all.data[0]["preco"], json!(12.5));

    let mut query = DynamicQuery {
        page_size: 10,
        search: Some("ac".into()),
        ..Default::default()
    };
    query.filters.insert("ativo".into(), json!(true));
    let searched = mirror::query_dynamic_table(&pool, &table, &query).await.unwrap();
    assert_eq!(codes(&searched), vec!["P01"]);

    let literal = DynamicQuery {
        page_size: 10,
        search: Some("50%".into()),
        ..Default::default()
    };
    let found = mirror::query_dynamic_table(&pool, &table, &literal).await.unwrap();
    assert_eq!(codes(&found), vec!["P01"]);

    let sorted = DynamicQuery {
        page: 1,
        page_size: 2,
        sort: Some(SortSpec {
            column: "preco".into(),
            descending: true,
        }),
        deleted: DeletedFilter::Include,
        ..Default::default()
    };
    let page = mirror::query_dynamic_table(&pool, &table, &sorted).await.unwrap();
    assert_eq!(page.total_count, 4);
    assert_eq!(codes(&page), vec!["P01", "P03"]);

    let mut unknown = DynamicQuery {
        page_size: 10,
        ..Default::default()
    };
    unknown.filters.insert("nope".into(), Value::Null);
    assert!(mirror::query_dynamic_table(&pool, &table, &unknown).await.is_err());
}

#[tokio::test]
async fn dynamic_query_on_missing_table_is_empty() {
    let pool = setup_pool().await;
    let page = mirror::query_dynamic_table(
        &pool,
        &products_table(),
        &DynamicQuery {
            page_size: 10,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page.total_count, 0);
    assert!(page.data.is_empty());
    assert_eq!(page.columns[0], "protheus_id");
}

#[tokio::test]
async fn deleted_records_can_be_listed_and_restored() {
    let pool = setup_pool().await;
    let table = seeded_products(&pool).await;
    let protheus = Protheus {
        base_url: "http://erp.invalid/".into(),
        api_key: None,
        upsert_batch_size: 100,
        tables: vec![table],
    };
    let source = MirrorSource::new(pool.clone(), protheus);
    let browser = SyncedDataBrowser::open(
        "produtos",
        Arc::new(source),
        Arc::new(FakeBackend::default()),
        Arc::new(MemoryPreferences::default()),
        10,
        Duration::ZERO,
    )
    .await;

    let deleted = browser.deleted_records(0).await.unwrap();
    assert_eq!(codes(&deleted), vec!["P04"]);
    assert_eq!(deleted.data[0]["pending_deletion"], json!(true));
    assert!(deleted.data[0]["pending_deletion_at"].is_string());

    let restored = browser
        .restore(&["P04".to_string(), "P01".to_string()])
        .await
        .unwrap();
    assert_eq!(restored, 1);
    assert_eq!(browser.snapshot().await.total_count, 4);
    assert!(browser.deleted_records(0).await.unwrap().data.is_empty());
}
