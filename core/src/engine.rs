//! The surface tool handlers call: [`Engine::execute_batch`] and
//! [`Engine::execute_bulk`].
//!
//! An `Engine` owns the stateless client, a transport and the shared
//! [`RateLimitTracker`]. Every invocation gets its own deadline and its own
//! result; the tracker is the only state that outlives a call.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;

use crate::aggregate::{BatchResult, BulkResult};
use crate::batch::BatchExecutor;
use crate::bulk::{BulkOperator, BulkRequest};
use crate::client::TodoClient;
use crate::command::{parse_commands, Command};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::http::{HttpRequest, HttpResponse};
use crate::ratelimit::{BudgetClass, RateLimitTracker, MAX_UPSTREAM_WAIT};
use crate::retry::{RetryCoordinator, RetryError, RetryPolicy};
use crate::transport::Transport;

/// Borrowed view of everything one upstream call needs.
pub(crate) struct Upstream<'a, T> {
    pub client: &'a TodoClient,
    pub transport: &'a T,
    pub tracker: &'a RateLimitTracker,
    pub policy: &'a RetryPolicy,
}

impl<T: Transport> Upstream<'_, T> {
    /// Executes `request` through the retry coordinator.
    pub async fn send(
        &self,
        class: BudgetClass,
        deadline: Instant,
        request: HttpRequest,
    ) -> Result<HttpResponse, RetryError> {
        let transport = self.transport;
        let response = RetryCoordinator::new(self.policy, self.tracker)
            .call(class, Some(deadline), || transport.execute(request.clone()))
            .await?;
        if self.tracker.is_low(class) {
            let remaining = self.tracker.snapshot(class).remaining;
            tracing::debug!(%class, ?remaining, "rate-limit budget running low");
        }
        Ok(response)
    }
}

pub struct Engine<T> {
    client: TodoClient,
    transport: T,
    tracker: Arc<RateLimitTracker>,
    config: EngineConfig,
}

impl<T: Transport> Engine<T> {
    pub fn new(client: TodoClient, transport: T, config: EngineConfig) -> Self {
        let tracker = Arc::new(RateLimitTracker::new(config.low_water_mark));
        Self {
            client,
            transport,
            tracker,
            config,
        }
    }

    /// Shares an existing tracker, e.g. between engines talking to the same
    /// account.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<RateLimitTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &Arc<RateLimitTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &TodoClient {
        &self.client
    }

    fn upstream(&self) -> Upstream<'_, T> {
        Upstream {
            client: &self.client,
            transport: &self.transport,
            tracker: &self.tracker,
            policy: &self.config.retry,
        }
    }

    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.config.deadline)
            .unwrap_or_else(|| now + MAX_UPSTREAM_WAIT)
    }

    /// Runs a command batch.
    ///
    /// `Err` means nothing was applied: the batch was invalid, or the first
    /// submission failed as a whole. Per-command failures are in the
    /// returned result.
    pub async fn execute_batch(&self, commands: &[Command]) -> Result<BatchResult, EngineError> {
        BatchExecutor {
            upstream: self.upstream(),
            max_batch_size: self.config.max_batch_size,
        }
        .execute(commands, self.deadline())
        .await
    }

    /// Parses tool-handler JSON and runs it as a batch.
    pub async fn execute_batch_json(&self, commands: &Value) -> Result<BatchResult, EngineError> {
        let commands = parse_commands(commands)?;
        self.execute_batch(&commands).await
    }

    /// Applies one mutation to every task in `request`.
    ///
    /// `Err` covers validation failures and rate-limit exhaustion. Every
    /// other failure is reported per task.
    pub async fn execute_bulk(&self, request: &BulkRequest) -> Result<BulkResult, EngineError> {
        BulkOperator {
            upstream: self.upstream(),
            max_tasks: self.config.max_bulk_tasks,
            max_concurrency: self.config.max_concurrency,
        }
        .execute(request, self.deadline())
        .await
    }
}
