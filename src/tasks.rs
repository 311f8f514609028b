//! Typed task payloads and the remembered list of recently used task types.

use crate::prefs::PreferenceStore;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub const RECENT_LIMIT: usize = 5;
const RECENT_SCOPE: &str = "tasks";
const RECENT_KEY: &str = "recent_types";

/// Payload of a CRM task, keyed by task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Call {
        phone: String,
        #[serde(default)]
        contact_name: Option<String>,
        #[serde(default)]
        scheduled_at: Option<DateTime<Utc>>,
    },
    Email {
        to: Vec<String>,
        subject: String,
        #[serde(default)]
        body: Option<String>,
    },
    Meeting {
        starts_at: DateTime<Utc>,
        #[serde(default)]
        duration_minutes: Option<u32>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        attendees: Vec<String>,
    },
    FollowUp {
        due_date: NaiveDate,
        #[serde(default)]
        notes: Option<String>,
    },
    Visit {
        address: String,
        #[serde(default)]
        city: Option<String>,
        #[serde(default)]
        scheduled_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Error)]
pub enum TaskPayloadError {
    #[error("unknown task type {0}")]
    UnknownType(String),
    #[error("invalid {task_type} payload: {source}")]
    Invalid {
        task_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {task_type} payload: {message}")]
    Rule { task_type: String, message: String },
}

pub const TASK_TYPES: [&str; 5] = ["call", "email", "meeting", "follow_up", "visit"];

impl TaskPayload {
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskPayload::Call { .. } => "call",
            TaskPayload::Email { .. } => "email",
            TaskPayload::Meeting { .. } => "meeting",
            TaskPayload::FollowUp { .. } => "follow_up",
            TaskPayload::Visit { .. } => "visit",
        }
    }

    /// Validate an untyped payload stored next to its task type column.
    pub fn parse(task_type: &str, raw: &Value) -> Result<Self, TaskPayloadError> {
        let task_type = task_type.trim().to_ascii_lowercase();
        if !TASK_TYPES.contains(&task_type.as_str()) {
            return Err(TaskPayloadError::UnknownType(task_type));
        }
        let mut tagged = match raw {
            Value::Object(map) => map.clone(),
            Value::Null => Default::default(),
            other => {
                return Err(TaskPayloadError::Rule {
                    task_type,
                    message: format!("expected an object, got {}", other),
                })
            }
        };
        tagged.insert("type".into(), Value::String(task_type.clone()));
        let payload: TaskPayload =
            serde_json::from_value(Value::Object(tagged)).map_err(|source| TaskPayloadError::Invalid {
                task_type: task_type.clone(),
                source,
            })?;
        payload.check().map_err(|message| TaskPayloadError::Rule { task_type, message })?;
        Ok(payload)
    }

    fn check(&self) -> Result<(), String> {
        match self {
            TaskPayload::Call { phone, .. } if phone.trim().is_empty() => Err("phone is empty".into()),
            TaskPayload::Email { to, .. } if to.is_empty() => Err("no recipients".into()),
            TaskPayload::Email { to, .. } if to.iter().any(|a| !a.contains('@')) => {
                Err("recipient without @".into())
            }
            TaskPayload::Email { subject, .. } if subject.trim().is_empty() => {
                Err("subject is empty".into())
            }
            TaskPayload::Meeting {
                duration_minutes: Some(0),
                ..
            } => Err("duration must be positive".into()),
            TaskPayload::Visit { address, .. } if address.trim().is_empty() => {
                Err("address is empty".into())
            }
            _ => Ok(()),
        }
    }
}

/// Most recently used task types, most recent first, persisted through the
/// injected preference store.
#[derive(Clone)]
pub struct RecentTaskTypes {
    store: Arc<dyn PreferenceStore>,
}

impl RecentTaskTypes {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let value = self.store.get(RECENT_SCOPE, RECENT_KEY).await?;
        let list = match value {
            Some(v) => serde_json::from_value::<Vec<String>>(v).unwrap_or_else(|err| {
                warn!(?err, "discarding malformed recent task types");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(list
            .into_iter()
            .filter(|t| TASK_TYPES.contains(&t.as_str()))
            .take(RECENT_LIMIT)
            .collect())
    }

    /// Validate a payload and move its type to the front of the recent list.
    pub async fn accept(&self, task_type: &str, raw: &Value) -> Result<(TaskPayload, Vec<String>)> {
        let payload = TaskPayload::parse(task_type, raw)?;
        let recent = self.remember(payload.task_type()).await?;
        Ok((payload, recent))
    }

    pub async fn remember(&self, task_type: &str) -> Result<Vec<String>> {
        let task_type = task_type.trim().to_ascii_lowercase();
        let mut list = self.list().await?;
        if !TASK_TYPES.contains(&task_type.as_str()) {
            return Ok(list);
        }
        list.retain(|t| *t != task_type);
        list.insert(0, task_type);
        list.truncate(RECENT_LIMIT);
        self.store
            .set(RECENT_SCOPE, RECENT_KEY, serde_json::to_value(&list)?)
            .await?;
        Ok(list)
    }
}
