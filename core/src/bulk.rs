//! Bulk Task Operator: one mutation applied independently to many tasks.
//!
//! A [`BulkRequest`] is deduplicated and validated in full before anything
//! is sent. Each task then gets its own REST call through the retry layer;
//! calls run through a bounded ordered stream so results come back in input
//! order whatever the completion order. A failing task never affects its
//! siblings and nothing is rolled back.

use std::collections::HashSet;
use std::fmt;

use futures_util::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::aggregate::{BulkResult, ItemOutcome};
use crate::engine::Upstream;
use crate::error::{ApiError, EngineError, ValidationError};
use crate::ratelimit::BudgetClass;
use crate::retry::RetryError;
use crate::transport::Transport;

/// Upper bound on unique task ids per bulk request.
pub const MAX_BULK_TASKS: usize = 50;

const UPDATE_FIELDS: &[&str] = &[
    "due_string",
    "due_date",
    "due_datetime",
    "due_lang",
    "priority",
    "labels",
    "assignee_id",
    "duration",
    "duration_unit",
    "deadline_date",
];

const MOVE_FIELDS: &[&str] = &["project_id", "section_id", "parent_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Update,
    Complete,
    Uncomplete,
    Move,
}

impl BulkAction {
    /// Fields a request for this action may carry.
    pub fn allowed_fields(self) -> &'static [&'static str] {
        match self {
            BulkAction::Update => UPDATE_FIELDS,
            BulkAction::Move => MOVE_FIELDS,
            BulkAction::Complete | BulkAction::Uncomplete => &[],
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BulkAction::Update => "update",
            BulkAction::Complete => "complete",
            BulkAction::Uncomplete => "uncomplete",
            BulkAction::Move => "move",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown bulk action `{0}`, expected update, complete, uncomplete or move")]
pub struct UnknownBulkAction(pub String);

impl std::str::FromStr for BulkAction {
    type Err = UnknownBulkAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(BulkAction::Update),
            "complete" => Ok(BulkAction::Complete),
            "uncomplete" => Ok(BulkAction::Uncomplete),
            "move" => Ok(BulkAction::Move),
            other => Err(UnknownBulkAction(other.to_string())),
        }
    }
}

/// One mutation applied to many tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRequest {
    pub action: BulkAction,
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl BulkRequest {
    pub fn new<I, S>(action: BulkAction, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action,
            task_ids: task_ids.into_iter().map(Into::into).collect(),
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Task ids with later duplicates removed, first occurrences kept in order.
    pub fn deduplicated_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.task_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    /// Checks the whole request and returns the ids to mutate.
    pub fn validate(&self, max_tasks: usize) -> Result<Vec<String>, ValidationError> {
        if let Some(position) = self.task_ids.iter().position(|id| id.trim().is_empty()) {
            return Err(ValidationError::EmptyTaskId { position });
        }
        if let Some(position) = self.task_ids.iter().position(|id| !is_path_safe(id)) {
            return Err(ValidationError::InvalidTaskId {
                position,
                id: self.task_ids[position].clone(),
            });
        }
        let ids = self.deduplicated_ids();
        if ids.is_empty() {
            return Err(ValidationError::NoTaskIds);
        }
        if ids.len() > max_tasks {
            return Err(ValidationError::TooManyTaskIds {
                count: ids.len(),
                max: max_tasks,
            });
        }
        self.validate_fields()?;
        Ok(ids)
    }

    fn validate_fields(&self) -> Result<(), ValidationError> {
        let allowed = self.action.allowed_fields();
        if let Some(field) = self.fields.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(ValidationError::DisallowedField {
                field: field.clone(),
                action: self.action,
                allowed: if allowed.is_empty() {
                    "none".to_string()
                } else {
                    allowed.join(", ")
                },
            });
        }

        match self.action {
            BulkAction::Update => {
                if self.fields.is_empty() {
                    return Err(ValidationError::MissingFields { action: self.action });
                }
                if let Some(priority) = self.fields.get("priority") {
                    if !priority.as_u64().is_some_and(|p| (1..=4).contains(&p)) {
                        return Err(invalid("priority", "must be an integer between 1 and 4"));
                    }
                }
                if let Some(labels) = self.fields.get("labels") {
                    let all_strings = labels
                        .as_array()
                        .is_some_and(|items| items.iter().all(Value::is_string));
                    if !all_strings {
                        return Err(invalid("labels", "must be a list of strings"));
                    }
                }
            }
            BulkAction::Move => {
                if self.fields.len() != 1 {
                    return Err(ValidationError::MissingFields { action: self.action });
                }
                for (field, value) in &self.fields {
                    if !value.as_str().is_some_and(|s| !s.trim().is_empty()) {
                        return Err(invalid(field, "must be a non-empty string"));
                    }
                }
            }
            BulkAction::Complete | BulkAction::Uncomplete => {}
        }
        Ok(())
    }
}

/// Task ids go into the request path, so they must not be able to address
/// another endpoint.
fn is_path_safe(id: &str) -> bool {
    let reserved = |c: char| {
        matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_whitespace() || c.is_control()
    };
    id != "." && id != ".." && !id.chars().any(reserved)
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

pub(crate) struct BulkOperator<'a, T> {
    pub upstream: Upstream<'a, T>,
    pub max_tasks: usize,
    pub max_concurrency: usize,
}

impl<T: Transport> BulkOperator<'_, T> {
    pub async fn execute(
        &self,
        request: &BulkRequest,
        deadline: Instant,
    ) -> Result<BulkResult, EngineError> {
        let started = Instant::now();
        let ids = request.validate(self.max_tasks)?;
        tracing::debug!(
            action = %request.action,
            tasks = ids.len(),
            duplicates = request.task_ids.len() - ids.len(),
            "bulk request validated"
        );

        let results: Vec<ItemOutcome> = stream::iter(&ids)
            .map(|id| self.mutate(id, request, deadline))
            .buffered(self.max_concurrency.max(1))
            .try_collect()
            .await?;

        let result = BulkResult::from_outcomes(results, started.elapsed());
        tracing::info!(
            action = %request.action,
            total = result.total_tasks,
            successful = result.successful,
            failed = result.failed,
            elapsed_ms = result.execution_time_ms,
            "bulk request finished"
        );
        Ok(result)
    }

    /// Mutates one task. Only rate-limit exhaustion escapes as `Err`.
    async fn mutate(
        &self,
        task_id: &str,
        request: &BulkRequest,
        deadline: Instant,
    ) -> Result<ItemOutcome, EngineError> {
        if Instant::now() >= deadline {
            return Ok(ItemOutcome::failed(task_id, "deadline exceeded"));
        }

        let http = match self
            .upstream
            .client
            .build_task_mutation(task_id, request.action, &request.fields)
        {
            Ok(http) => http,
            Err(e) => return Ok(ItemOutcome::failed(task_id, e.to_string())),
        };

        let response = match self.upstream.send(BudgetClass::Rest, deadline, http).await {
            Ok(response) => response,
            Err(RetryError::RateLimited { retry_after, .. }) => {
                return Err(EngineError::RateLimited { retry_after });
            }
            Err(RetryError::DeadlineExceeded) => {
                return Ok(ItemOutcome::failed(task_id, "deadline exceeded"));
            }
            Err(RetryError::Transport(e)) => {
                tracing::debug!(task_id, error = %e, "task call failed in transport");
                return Ok(ItemOutcome::failed(task_id, e.to_string()));
            }
        };

        Ok(match self.upstream.client.parse_task_mutation(response) {
            Ok(()) => ItemOutcome::succeeded(task_id),
            Err(ApiError::NotFound) => {
                ItemOutcome::failed(task_id, format!("task {task_id} not found"))
            }
            Err(e) => ItemOutcome::failed(task_id, e.to_string()),
        })
    }
}
