//! Public result shapes and the logic that folds per-item outcomes into them.
//!
//! Both executors record one outcome per item, indexed by input position, and
//! hand the whole vector over once every item is resolved. Counts are derived
//! here and nowhere else, so `completed + failed` always equals the number of
//! items.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;

use crate::command::Command;
use crate::error::EngineError;

/// Operation-level failure carried inside a result value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<f64>,
}

impl From<&EngineError> for ErrorSummary {
    fn from(err: &EngineError) -> Self {
        Self {
            message: err.to_string(),
            retryable: err.is_retryable(),
            retry_after_secs: err.retry_after().map(|d| d.as_secs_f64()),
        }
    }
}

/// Outcome of one bulk task mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub task_id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn succeeded(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkResult {
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    /// One entry per deduplicated task id, in input order.
    pub results: Vec<ItemOutcome>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

impl BulkResult {
    pub fn from_outcomes(results: Vec<ItemOutcome>, elapsed: Duration) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            total_tasks: results.len(),
            successful,
            failed: results.len() - successful,
            results,
            execution_time_ms: millis(elapsed),
            error: None,
        }
    }

    /// A request that failed as a whole. No per-task results are reported.
    pub fn rejected(err: &EngineError, elapsed: Duration) -> Self {
        Self {
            total_tasks: 0,
            successful: 0,
            failed: 0,
            results: Vec::new(),
            execution_time_ms: millis(elapsed),
            error: Some(err.into()),
        }
    }
}

/// A failed command, identified by its position in the submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandError {
    pub command_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    /// The batch passed validation and was sent upstream.
    pub accepted: bool,
    pub completed_count: usize,
    pub failed_count: usize,
    /// Ordered by `command_index`.
    pub errors: Vec<CommandError>,
    pub temp_id_mapping: BTreeMap<String, String>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

impl BatchResult {
    /// Folds per-command outcomes (`Err` holds the failure message) into a
    /// result.
    ///
    /// Only mapping entries whose create command succeeded are kept.
    pub fn from_outcomes(
        commands: &[Command],
        outcomes: Vec<Result<(), String>>,
        mapping: &HashMap<String, String>,
        elapsed: Duration,
    ) -> Self {
        let mut errors = Vec::new();
        let mut temp_id_mapping = BTreeMap::new();
        for (index, (command, outcome)) in commands.iter().zip(outcomes).enumerate() {
            match outcome {
                Ok(()) => {
                    if let Some(temp_id) = &command.temp_id {
                        if let Some(real) = mapping.get(temp_id) {
                            temp_id_mapping.insert(temp_id.clone(), real.clone());
                        }
                    }
                }
                Err(error) => errors.push(CommandError {
                    command_index: index,
                    temp_id: command.temp_id.clone(),
                    error,
                }),
            }
        }
        Self {
            accepted: true,
            completed_count: commands.len() - errors.len(),
            failed_count: errors.len(),
            errors,
            temp_id_mapping,
            execution_time_ms: millis(elapsed),
            error: None,
        }
    }

    /// A batch rejected outright: nothing was applied upstream.
    pub fn rejected(err: &EngineError, elapsed: Duration) -> Self {
        Self {
            accepted: false,
            completed_count: 0,
            failed_count: 0,
            errors: Vec::new(),
            temp_id_mapping: BTreeMap::new(),
            execution_time_ms: millis(elapsed),
            error: Some(err.into()),
        }
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
