//! Batch and bulk mutation engine for the todo service.
//!
//! # Overview
//! Applies many mutations in one logical request and reports every item's
//! outcome independently:
//! - [`Engine::execute_batch`] submits heterogeneous commands through the
//!   upstream sync endpoint, staging them so that commands referencing a
//!   `temp_id` run after the command that creates it.
//! - [`Engine::execute_bulk`] applies one mutation to a deduplicated set of
//!   tasks with one REST call per task.
//!
//! Every upstream call goes through the retry coordinator, which retries
//! HTTP 429 within a bounded budget and shares back-off state through a
//! [`RateLimitTracker`] with one budget per endpoint class.
//!
//! # Design
//! - `TodoClient` is stateless. Each operation is split into `build_*`
//!   (produces an `HttpRequest`) and `parse_*` (consumes an `HttpResponse`),
//!   so the I/O boundary is explicit and sits behind the [`Transport`] trait.
//! - Nothing is global: the tracker and the configuration are constructed by
//!   the host and injected into the [`Engine`].
//! - DTOs are defined independently from the mock-server crate; integration
//!   tests catch schema drift.

pub mod aggregate;
mod batch;
pub mod bulk;
pub mod client;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod retry;
pub mod transport;
pub mod types;

pub use aggregate::{BatchResult, BulkResult, CommandError, ErrorSummary, ItemOutcome};
pub use bulk::{BulkAction, BulkRequest};
pub use client::TodoClient;
pub use command::{parse_commands, Command, CommandKind};
pub use config::{AppConfig, EngineConfig};
pub use engine::Engine;
pub use error::{ApiError, EngineError, ValidationError};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use ratelimit::{BudgetClass, RateLimitTracker};
pub use retry::RetryPolicy;
pub use transport::{Transport, TransportError, UreqTransport};
