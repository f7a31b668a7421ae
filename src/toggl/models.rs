use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single time entry as returned by `GET /me/time_entries`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimeEntry {
    pub id: i64,
    pub workspace_id: i64,
    #[serde(default)]
    pub project_id: Option<i64>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub stop: Option<DateTime<Utc>>,
    /// Duration in seconds. Negative while the entry is running.
    pub duration: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Remaining fields of the record, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A project as returned by `GET /workspaces/{workspace_id}/projects/{project_id}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
