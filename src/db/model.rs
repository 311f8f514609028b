//! Counters and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-run counters persisted on a sync log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub fetched: i64,
    pub created: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub deleted: i64,
    pub errors: i64,
    pub blobs_downloaded: i64,
    pub blobs_skipped: i64,
    pub blob_errors: i64,
}

/// City slice the distance job works on.
#[derive(Debug, Clone)]
pub struct CityCandidate {
    pub id: i64,
    pub name: String,
    pub state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl CityCandidate {
    pub fn address(&self) -> String {
        format!("{}, {}, Brasil", self.name.trim(), self.state.trim())
    }
}

/// Stored Telegram link code.
#[derive(Debug, Clone)]
pub struct LinkCodeRow {
    pub code: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}
