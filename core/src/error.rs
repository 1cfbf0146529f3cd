//! Error types for the batch engine.
//!
//! # Design
//! Three layers, matching where a failure is detected:
//! - [`ValidationError`]: pre-flight input problems. Nothing reached the
//!   upstream.
//! - [`ApiError`]: how one upstream response was interpreted. `NotFound` gets
//!   a dedicated variant because callers distinguish "the entity does not
//!   exist" from "the server returned an unexpected status".
//! - [`EngineError`]: the only errors that fail a whole invocation.
//!   Per-item failures never become an `EngineError`; they are collected into
//!   the result instead.

use std::time::Duration;

use crate::bulk::BulkAction;
use crate::command::CommandKind;
use crate::transport::TransportError;

/// How an HTTP status code is treated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 429. The only status the retry coordinator retries.
    RateLimited,
    NotFound,
    /// Any other 4xx. Non-retryable, reported per item.
    ClientError,
    /// 5xx. Non-retryable, reported per item.
    ServerError,
}

impl StatusClass {
    pub fn is_retryable(self) -> bool {
        self == StatusClass::RateLimited
    }
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        429 => StatusClass::RateLimited,
        404 => StatusClass::NotFound,
        500..=599 => StatusClass::ServerError,
        _ => StatusClass::ClientError,
    }
}

/// Errors returned by `TodoClient` parse and build methods.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// The server returned 404.
    #[error("resource not found")]
    NotFound,

    /// The server returned 429.
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// The server returned a non-2xx status other than 404 and 429.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body could not be deserialized into the expected type.
    #[error("deserialization failed: {0}")]
    DeserializationError(String),

    /// The request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    SerializationError(String),
}

/// Pre-flight rejection of a batch or bulk request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("commands must be a JSON array")]
    NotAList,

    #[error("command {index} is malformed: {reason}")]
    MalformedCommand { index: usize, reason: String },

    #[error("command {index} has unknown type `{kind}`")]
    UnknownCommandType { index: usize, kind: String },

    #[error("batch contains no commands")]
    EmptyBatch,

    #[error("batch has {len} commands, the maximum is {max}")]
    BatchTooLarge { len: usize, max: usize },

    #[error("command {index} has an empty correlation_id")]
    MissingCorrelationId { index: usize },

    #[error("command {index} reuses correlation_id `{correlation_id}`")]
    DuplicateCorrelationId { index: usize, correlation_id: String },

    #[error("command {index} has an empty temp_id")]
    EmptyTempId { index: usize },

    #[error("command {index} reuses temp_id `{temp_id}`")]
    DuplicateTempId { index: usize, temp_id: String },

    #[error(
        "command {index} of type `{kind}` does not create an entity and cannot carry a temp_id"
    )]
    TempIdOnNonCreate { index: usize, kind: CommandKind },

    #[error("commands {indices:?} reference each other's temp_ids in a cycle")]
    DependencyCycle { indices: Vec<usize> },

    #[error("no task ids given")]
    NoTaskIds,

    #[error("{count} unique task ids given, the maximum is {max}")]
    TooManyTaskIds { count: usize, max: usize },

    #[error("task id at position {position} is empty")]
    EmptyTaskId { position: usize },

    /// The id would not stay a single URL path segment.
    #[error("task id `{id}` at position {position} contains a reserved character")]
    InvalidTaskId { position: usize, id: String },

    #[error("field `{field}` is not allowed for bulk {action}; allowed fields: {allowed}")]
    DisallowedField {
        field: String,
        action: BulkAction,
        allowed: String,
    },

    #[error("bulk {action} requires at least one field")]
    MissingFields { action: BulkAction },

    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: String, reason: String },
}

/// An invocation-level failure. Nothing in the result can be trusted
/// beyond what the variant says.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Retries were exhausted while the upstream kept answering 429.
    #[error(
        "rate limited by upstream, retry the whole operation later{}",
        fmt_hint(.retry_after)
    )]
    RateLimited { retry_after: Option<Duration> },

    /// The shared batch submission itself failed with a non-2xx status or
    /// an unreadable body.
    #[error("upstream rejected the request: {0}")]
    Upstream(#[from] ApiError),

    #[error("upstream unreachable: {0}")]
    Transport(#[from] TransportError),

    #[error("deadline exceeded before the request could be completed")]
    DeadlineExceeded,
}

fn fmt_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (suggested wait {:.1}s)", d.as_secs_f64()),
        None => String::new(),
    }
}

impl EngineError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::RateLimited { .. }
            | EngineError::Transport(_)
            | EngineError::DeadlineExceeded => true,
            EngineError::Upstream(ApiError::HttpError { status, .. }) => {
                classify_status(*status) == StatusClass::ServerError
            }
            EngineError::Upstream(ApiError::RateLimited { .. }) => true,
            EngineError::Validation(_) | EngineError::Upstream(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::RateLimited { retry_after }
            | EngineError::Upstream(ApiError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_status_ranges() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(204), StatusClass::Success);
        assert_eq!(classify_status(429), StatusClass::RateLimited);
        assert_eq!(classify_status(404), StatusClass::NotFound);
        assert_eq!(classify_status(403), StatusClass::ClientError);
        assert_eq!(classify_status(503), StatusClass::ServerError);
        assert!(classify_status(429).is_retryable());
        assert!(!classify_status(503).is_retryable());
    }

    #[test]
    fn rate_limited_message_carries_hint() {
        let err = EngineError::RateLimited {
            retry_after: Some(Duration::from_millis(2500)),
        };
        assert!(err.to_string().contains("2.5s"));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn only_server_errors_upstream_are_retryable() {
        let server = EngineError::Upstream(ApiError::HttpError {
            status: 502,
            body: "bad gateway".to_string(),
        });
        let client = EngineError::Upstream(ApiError::HttpError {
            status: 400,
            body: "bad request".to_string(),
        });
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(EngineError::DeadlineExceeded
            .to_string()
            .contains("before the request could be completed"));
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = EngineError::from(ValidationError::EmptyBatch);
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn disallowed_field_names_the_field() {
        let err = ValidationError::DisallowedField {
            field: "content".to_string(),
            action: BulkAction::Update,
            allowed: "due_string".to_string(),
        };
        assert!(err.to_string().contains("`content`"));
        assert!(err.to_string().contains("bulk update"));
    }
}
