//! Wire DTOs for the upstream service.
//!
//! # Design
//! These types mirror the mock-server's schema but are defined independently;
//! the integration tests catch any drift between the two crates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A task as returned by `GET /tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
    pub project_id: String,
    pub section_id: Option<String>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub priority: u8,
    pub due_string: Option<String>,
    pub due_date: Option<String>,
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub checked: bool,
}

/// Body of `POST /sync`.
#[derive(Debug, Serialize)]
pub struct SyncRequest<'a> {
    pub commands: Vec<SyncCommand<'a>>,
}

/// One command as the upstream expects it. `uuid` carries the correlation id.
#[derive(Debug, Serialize)]
pub struct SyncCommand<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub uuid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<&'a str>,
    pub args: &'a Map<String, Value>,
}

/// Body returned by `POST /sync`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SyncResponse {
    #[serde(default)]
    pub sync_status: HashMap<String, SyncStatus>,
    #[serde(default)]
    pub temp_id_mapping: HashMap<String, String>,
}

/// Per-command status: the string `"ok"` or an error object.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SyncStatus {
    Ok(String),
    Error(SyncCommandError),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SyncCommandError {
    pub error: String,
    pub error_code: Option<i64>,
    pub http_code: Option<u16>,
}

impl SyncStatus {
    /// The failure message for this command, `None` when it succeeded.
    pub fn failure(&self) -> Option<String> {
        match self {
            SyncStatus::Ok(s) if s == "ok" => None,
            SyncStatus::Ok(other) => Some(format!("unexpected status `{other}`")),
            SyncStatus::Error(e) => Some(match e.http_code {
                Some(code) => format!("{} (HTTP {code})", e.error),
                None => e.error.clone(),
            }),
        }
    }
}
