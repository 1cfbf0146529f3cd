//! Stateless HTTP request builder and response parser for the upstream API.
//!
//! # Design
//! `TodoClient` holds only a `base_url` and an optional bearer token and
//! carries no mutable state between calls. Each operation is split into a
//! `build_*` method that produces an `HttpRequest` and a `parse_*` method that
//! consumes an `HttpResponse`. The engine executes the round-trip in between
//! through a [`Transport`](crate::transport::Transport), which keeps this
//! module deterministic and free of I/O.

use serde_json::{Map, Value};

use crate::bulk::BulkAction;
use crate::command::Command;
use crate::error::{classify_status, ApiError, StatusClass};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::ratelimit::advertised_wait;
use crate::types::{SyncCommand, SyncRequest, SyncResponse, Task};

#[derive(Debug, Clone)]
pub struct TodoClient {
    base_url: String,
    token: Option<String>,
}

impl TodoClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, json_body: bool) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if json_body {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        if let Some(token) = &self.token {
            headers.push(("authorization".to_string(), format!("Bearer {token}")));
        }
        headers
    }

    /// One `POST /sync` carrying `commands` in order.
    pub fn build_sync(&self, commands: &[Command]) -> Result<HttpRequest, ApiError> {
        let payload = SyncRequest {
            commands: commands
                .iter()
                .map(|c| SyncCommand {
                    kind: c.kind.wire_name(),
                    uuid: &c.correlation_id,
                    temp_id: c.temp_id.as_deref(),
                    args: &c.args,
                })
                .collect(),
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| ApiError::SerializationError(e.to_string()))?;
        Ok(HttpRequest {
            method: HttpMethod::Post,
            path: format!("{}/sync", self.base_url),
            headers: self.headers(true),
            body: Some(body),
        })
    }

    /// The single-task REST call for one bulk item.
    ///
    /// `complete` and `uncomplete` ignore `fields`.
    pub fn build_task_mutation(
        &self,
        task_id: &str,
        action: BulkAction,
        fields: &Map<String, Value>,
    ) -> Result<HttpRequest, ApiError> {
        let (suffix, body) = match action {
            BulkAction::Update => ("", Some(fields)),
            BulkAction::Move => ("/move", Some(fields)),
            BulkAction::Complete => ("/close", None),
            BulkAction::Uncomplete => ("/reopen", None),
        };
        let body = body
            .map(|f| {
                serde_json::to_string(f).map_err(|e| ApiError::SerializationError(e.to_string()))
            })
            .transpose()?;
        Ok(HttpRequest {
            method: HttpMethod::Post,
            path: format!("{}/tasks/{task_id}{suffix}", self.base_url),
            headers: self.headers(body.is_some()),
            body,
        })
    }

    pub fn build_get_task(&self, task_id: &str) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Get,
            path: format!("{}/tasks/{task_id}", self.base_url),
            headers: self.headers(false),
            body: None,
        }
    }

    pub fn parse_sync(&self, response: HttpResponse) -> Result<SyncResponse, ApiError> {
        check_status(&response, &[200])?;
        serde_json::from_str(&response.body)
            .map_err(|e| ApiError::DeserializationError(e.to_string()))
    }

    /// Accepts both the `200` with a task body and the bare `204`.
    pub fn parse_task_mutation(&self, response: HttpResponse) -> Result<(), ApiError> {
        check_status(&response, &[200, 204])
    }

    pub fn parse_get_task(&self, response: HttpResponse) -> Result<Task, ApiError> {
        check_status(&response, &[200])?;
        serde_json::from_str(&response.body)
            .map_err(|e| ApiError::DeserializationError(e.to_string()))
    }
}

/// Map non-success status codes to the appropriate `ApiError` variant.
fn check_status(response: &HttpResponse, expected: &[u16]) -> Result<(), ApiError> {
    if expected.contains(&response.status) {
        return Ok(());
    }
    match classify_status(response.status) {
        StatusClass::NotFound => Err(ApiError::NotFound),
        StatusClass::RateLimited => Err(ApiError::RateLimited {
            retry_after: advertised_wait(response),
        }),
        StatusClass::Success | StatusClass::ClientError | StatusClass::ServerError => {
            Err(ApiError::HttpError {
                status: response.status,
                body: upstream_message(&response.body),
            })
        }
    }
}

/// The `error` field of a JSON error body, or the raw body.
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}
