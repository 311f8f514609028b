use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Protheus, TableConfig};
use crate::protheus::model::DownloadResponse;

pub mod cast;
pub mod model;

pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ErpError {
    #[error("ERP proxy unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("ERP proxy error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected ERP payload: {0}")]
    Payload(String),
}

impl ErpError {
    pub fn is_server_error(&self) -> bool {
        match self {
            ErpError::Transport(_) => true,
            ErpError::Status { status, .. } => *status >= 500,
            ErpError::Payload(_) => false,
        }
    }
}

/// Binary field content returned by the per-record download endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedBlob {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub size: i64,
}

/// SQL-over-HTTP access to the ERP.
#[async_trait]
pub trait ErpProxy: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, ErpError>;

    async fn download(&self, id: &str) -> Result<DownloadedBlob, ErpError>;
}

#[derive(Clone)]
pub struct ProtheusClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl fmt::Debug for ProtheusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtheusClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ProtheusClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("invalid ERP proxy url {}", base))?;
        let http = Client::builder()
            .user_agent("portal-sync/0.1")
            .build()
            .context("failed to build ERP http client")?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn from_config(cfg: &Protheus) -> Result<Self> {
        Self::new(&cfg.base_url, cfg.api_key.clone())
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    pub fn build_sql_request(&self, sql: &str) -> Result<reqwest::Request> {
        let endpoint = self.base_url.join("sql").context("invalid ERP base URL")?;
        self.authorize(self.http.post(endpoint))
            .header("Content-Type", "application/json")
            .json(&json!({ "query": sql }))
            .build()
            .context("failed to build ERP sql request")
    }

    pub fn build_download_request(&self, id: &str) -> Result<reqwest::Request> {
        let mut endpoint = self.base_url.join("download/").context("invalid ERP base URL")?;
        endpoint
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("ERP base URL cannot be a base"))?
            .pop_if_empty()
            .push(id);
        self.authorize(self.http.get(endpoint))
            .build()
            .context("failed to build ERP download request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String, ErpError> {
        let url = request.url().clone();
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, %status, "ERP proxy returned an error");
            return Err(ErpError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(res.text().await?)
    }
}

#[async_trait]
impl ErpProxy for ProtheusClient {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, ErpError> {
        let request = self
            .build_sql_request(sql)
            .map_err(|e| ErpError::Payload(e.to_string()))?;
        info!(url = %request.url(), "querying ERP proxy");
        debug!(sql, "ERP query");
        let body = self.execute(request).await?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| ErpError::Payload(format!("invalid JSON: {}", e)))?;
        let rows = normalize_rows(value)?;
        info!(rows = rows.len(), "ERP query returned");
        Ok(rows)
    }

    async fn download(&self, id: &str) -> Result<DownloadedBlob, ErpError> {
        let request = self
            .build_download_request(id)
            .map_err(|e| ErpError::Payload(e.to_string()))?;
        let body = self.execute(request).await?;
        let payload: DownloadResponse = serde_json::from_str(&body)
            .map_err(|e| ErpError::Payload(format!("invalid download JSON: {}", e)))?;
        decode_download(payload)
    }
}

pub fn decode_download(payload: DownloadResponse) -> Result<DownloadedBlob, ErpError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.data.trim())
        .map_err(|e| ErpError::Payload(format!("invalid base64 blob: {}", e)))?;
    let size = payload.size.unwrap_or(bytes.len() as i64);
    Ok(DownloadedBlob {
        bytes,
        mime_type: payload.mime_type.filter(|m| !m.is_empty()),
        size,
    })
}

/// Coerce the proxy's inconsistent JSON into a list of rows.
///
/// Accepts an array of objects, an object keyed by row index
/// (`{"0": {...}, "1": {...}}`), or either of those wrapped in `data`/`rows`.
pub fn normalize_rows(value: Value) -> Result<Vec<Row>, ErpError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map),
                other => Err(ErpError::Payload(format!(
                    "row {} is not an object: {}",
                    i, other
                ))),
            })
            .collect(),
        Value::Object(mut map) => {
            if map.is_empty() {
                return Ok(Vec::new());
            }
            if let Some(Value::String(msg)) = map.get("error") {
                return Err(ErpError::Payload(msg.clone()));
            }
            if !has_numeric_keys(&map) {
                for wrapper in ["data", "rows"] {
                    if let Some(inner) = map.remove(wrapper) {
                        return normalize_rows(inner);
                    }
                }
                return Err(ErpError::Payload(
                    "object payload without numeric row keys".to_string(),
                ));
            }
            let mut indexed: Vec<(usize, Value)> = map
                .into_iter()
                .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
                .collect();
            indexed.sort_by_key(|(i, _)| *i);
            normalize_rows(Value::Array(indexed.into_iter().map(|(_, v)| v).collect()))
        }
        Value::Null => Ok(Vec::new()),
        other => Err(ErpError::Payload(format!("unexpected payload: {}", other))),
    }
}

fn has_numeric_keys(map: &Row) -> bool {
    !map.is_empty() && map.keys().all(|k| k.parse::<usize>().is_ok())
}

/// Single SELECT for a mirrored table. Binary columns are left out of the
/// projection; their content comes through the download endpoint.
pub fn build_select(table: &TableConfig) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for col in table.stored_columns() {
        if !columns.contains(&col.source.as_str()) {
            columns.push(col.source.as_str());
        }
    }
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table.source_table);
    if let Some(filter) = table.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
    sql
}

/// Look up a column in an ERP row, tolerating case differences in the keys.
pub fn field<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    row.get(name).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}
