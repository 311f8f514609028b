//! Configuration loader and validator for the portal sync service.
use crate::model::Cast;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

static IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Column names owned by the mirror bookkeeping; mapped columns may not reuse them.
pub const RESERVED_COLUMNS: &[&str] = &[
    "id",
    "protheus_id",
    "record_hash",
    "is_new_record",
    "was_updated_last_sync",
    "last_sync_id",
    "pending_deletion",
    "pending_deletion_at",
    "created_at",
    "updated_at",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub protheus: Protheus,
    pub google: Google,
    pub telegram: Telegram,
    #[serde(default)]
    pub browser: Browser,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

/// ERP proxy settings and the tables mirrored from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Protheus {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub upsert_batch_size: usize,
    pub tables: Vec<TableConfig>,
}

impl Protheus {
    pub fn table(&self, id: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.id == id)
    }
}

/// One mirrored ERP table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableConfig {
    pub id: String,
    pub source_table: String,
    pub mirror_table: String,
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default = "default_true")]
    pub hash_enabled: bool,
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub blobs: Vec<BlobConfig>,
}

impl TableConfig {
    pub fn column_for_source(&self, source: &str) -> Option<&ColumnConfig> {
        self.columns.iter().find(|c| c.source == source)
    }

    /// Columns stored in the mirror table; binary ones are never projected.
    pub fn stored_columns(&self) -> impl Iterator<Item = &ColumnConfig> {
        self.columns
            .iter()
            .filter(move |c| !c.cast.is_binary() && !self.is_blob_field(&c.source))
    }

    pub fn is_blob_field(&self, source: &str) -> bool {
        self.blobs.iter().any(|b| b.field == source)
    }
}

/// Source column → mirror column mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnConfig {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub cast: Cast,
}

/// Binary field fetched through the per-record download endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobConfig {
    pub field: String,
    pub id_column: String,
}

/// Google Maps settings for the distance-matrix job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Google {
    pub api_key: String,
    #[serde(default = "default_google_base")]
    pub base_url: String,
    pub origin: Origin,
    pub geocode_batch_size: usize,
    pub matrix_batch_size: usize,
    pub tick_budget_seconds: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

/// Fixed reference point every city distance is measured from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Origin {
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub bot_username: String,
    pub link_code_ttl_minutes: i64,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Synced-data browser defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Browser {
    pub page_size: u32,
    pub debounce_ms: u64,
}

impl Default for Browser {
    fn default() -> Self {
        Self {
            page_size: 50,
            debounce_ms: 300,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_google_base() -> String {
    "https://maps.googleapis.com/".to_string()
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        let dir = self.app.resolved_data_dir();
        if dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/portal.db", self.app.resolved_data_dir()))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.protheus.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("protheus.base_url must be non-empty"));
    }
    if cfg.protheus.upsert_batch_size == 0 {
        return Err(ConfigError::Invalid("protheus.upsert_batch_size must be > 0"));
    }
    for (i, table) in cfg.protheus.tables.iter().enumerate() {
        validate_table(table)?;
        if cfg.protheus.tables[..i].iter().any(|t| t.id == table.id) {
            return Err(ConfigError::Invalid("protheus.tables ids must be unique"));
        }
    }

    if cfg.google.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("google.api_key must be non-empty"));
    }
    if cfg.google.geocode_batch_size == 0 || cfg.google.matrix_batch_size == 0 {
        return Err(ConfigError::Invalid("google batch sizes must be > 0"));
    }
    if cfg.google.matrix_batch_size > 25 {
        return Err(ConfigError::Invalid("google.matrix_batch_size must be <= 25"));
    }
    if cfg.google.max_attempts == 0 {
        return Err(ConfigError::Invalid("google.max_attempts must be > 0"));
    }
    if !(-90.0..=90.0).contains(&cfg.google.origin.latitude)
        || !(-180.0..=180.0).contains(&cfg.google.origin.longitude)
    {
        return Err(ConfigError::Invalid("google.origin coordinates out of range"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.link_code_ttl_minutes <= 0 {
        return Err(ConfigError::Invalid("telegram.link_code_ttl_minutes must be > 0"));
    }

    if cfg.browser.page_size == 0 {
        return Err(ConfigError::Invalid("browser.page_size must be > 0"));
    }

    Ok(())
}

fn validate_table(table: &TableConfig) -> Result<(), ConfigError> {
    if table.id.trim().is_empty() {
        return Err(ConfigError::Invalid("protheus.tables[].id must be non-empty"));
    }
    if !IDENT.is_match(&table.source_table) {
        return Err(ConfigError::Invalid("protheus.tables[].source_table must be an identifier"));
    }
    if !IDENT.is_match(&table.mirror_table) {
        return Err(ConfigError::Invalid("protheus.tables[].mirror_table must be an identifier"));
    }
    if table.key_fields.is_empty() {
        return Err(ConfigError::Invalid("protheus.tables[].key_fields must be non-empty"));
    }
    if table.columns.is_empty() {
        return Err(ConfigError::Invalid("protheus.tables[].columns must be non-empty"));
    }
    for col in &table.columns {
        if !IDENT.is_match(&col.source) || !IDENT.is_match(&col.target) {
            return Err(ConfigError::Invalid("protheus.tables[].columns must use identifiers"));
        }
        if RESERVED_COLUMNS.contains(&col.target.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid("protheus.tables[].columns[].target is reserved"));
        }
    }
    for key in &table.key_fields {
        match table.column_for_source(key) {
            Some(col) if !col.cast.is_binary() && !table.is_blob_field(key) => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "protheus.tables[].key_fields must name non-binary columns",
                ))
            }
        }
    }
    for blob in &table.blobs {
        if !IDENT.is_match(&blob.field) {
            return Err(ConfigError::Invalid("protheus.tables[].blobs[].field must be an identifier"));
        }
        match table.column_for_source(&blob.id_column) {
            Some(col) if !col.cast.is_binary() && !table.is_blob_field(&blob.id_column) => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "protheus.tables[].blobs[].id_column must be a mapped non-binary column",
                ))
            }
        }
    }
    Ok(())
}

/// Returns the sample configuration shipped as `config.example.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 1000
  max_backoff_seconds: 60

protheus:
  base_url: "https://erp-proxy.example.com/"
  api_key: "YOUR_PROXY_API_KEY"
  upsert_batch_size: 200
  tables:
    - id: "sa1"
      source_table: "SA1010"
      mirror_table: "protheus_sa1"
      key_fields: ["A1_FILIAL", "A1_COD", "A1_LOJA"]
      filter: "D_E_L_E_T_ = ' '"
      hash_enabled: true
      columns:
        - { source: "A1_FILIAL", target: "filial", cast: "TEXT" }
        - { source: "A1_COD", target: "codigo", cast: "TEXT" }
        - { source: "A1_LOJA", target: "loja", cast: "TEXT" }
        - { source: "A1_NOME", target: "nome", cast: "TEXT" }
        - { source: "A1_MSBLQL", target: "bloqueado", cast: "BOOLEAN" }
        - { source: "A1_DTCAD", target: "data_cadastro", cast: "DATE" }
        - { source: "A1_LC", target: "limite_credito", cast: "NUMERIC" }
        - { source: "R_E_C_N_O_", target: "recno", cast: "INTEGER" }
        - { source: "A1_FOTO", target: "foto", cast: "BLOB" }
      blobs:
        - { field: "A1_FOTO", id_column: "R_E_C_N_O_" }

google:
  api_key: "YOUR_GOOGLE_MAPS_KEY"
  origin:
    label: "Sede"
    latitude: -23.5505
    longitude: -46.6333
  geocode_batch_size: 10
  matrix_batch_size: 25
  tick_budget_seconds: 20
  max_attempts: 4
  base_delay_ms: 500

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  bot_username: "portal_alerts_bot"
  link_code_ttl_minutes: 15

browser:
  page_size: 50
  debounce_ms: 300
"#
}
