use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-column cast applied to values coming from the ERP proxy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cast {
    #[default]
    Text,
    Integer,
    Numeric,
    Boolean,
    Date,
    Timestamp,
    Json,
    Blob,
    Binary,
    Image,
    Varbinary,
}

impl Cast {
    pub fn is_binary(&self) -> bool {
        matches!(self, Cast::Blob | Cast::Binary | Cast::Image | Cast::Varbinary)
    }

    /// SQLite column affinity used when creating mirror columns.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Cast::Integer | Cast::Boolean => "INTEGER",
            Cast::Numeric => "REAL",
            _ => "TEXT",
        }
    }
}

/// A cast value ready to be bound into the mirror table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Int(i64),
    Real(f64),
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SyncStatus::Running),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "cancelled" => Some(JobStatus::Cancelled),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Geocoding,
    Matrix,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Geocoding => "geocoding",
            JobPhase::Matrix => "matrix",
        }
    }

    pub fn parse_phase(s: &str) -> Option<Self> {
        match s {
            "geocoding" => Some(JobPhase::Geocoding),
            "matrix" => Some(JobPhase::Matrix),
            _ => None,
        }
    }
}

/// Which cities a distance job covers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Only cities without a measured distance.
    Missing,
    /// Every city, re-measuring existing distances.
    All,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Missing => "missing",
            JobMode::All => "all",
        }
    }

    pub fn parse_mode(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(JobMode::Missing),
            "all" => Some(JobMode::All),
            _ => None,
        }
    }
}

/// Provenance of a stored city distance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistanceSource {
    Matrix,
    Haversine,
    PendingMatrix,
}

impl DistanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceSource::Matrix => "matrix",
            DistanceSource::Haversine => "haversine",
            DistanceSource::PendingMatrix => "pending_matrix",
        }
    }

    pub fn parse_source(s: &str) -> Option<Self> {
        match s {
            "matrix" => Some(DistanceSource::Matrix),
            "haversine" => Some(DistanceSource::Haversine),
            "pending_matrix" => Some(DistanceSource::PendingMatrix),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: i64,
    pub table_id: String,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub fetched: i64,
    pub created: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub deleted: i64,
    pub errors: i64,
    pub blobs_downloaded: i64,
    pub blobs_skipped: i64,
    pub blob_errors: i64,
    pub error_message: Option<String>,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceJob {
    pub id: i64,
    pub created_by: String,
    pub status: JobStatus,
    pub phase: JobPhase,
    pub mode: JobMode,
    pub total: i64,
    pub processed: i64,
    pub geocoded: i64,
    pub failed: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub id: i64,
    pub name: String,
    pub state: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub distance_km: Option<f64>,
    pub duration_minutes: Option<f64>,
    pub distance_source: Option<DistanceSource>,
    pub route_unavailable: bool,
}
