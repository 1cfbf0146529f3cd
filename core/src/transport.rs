//! Execution of [`HttpRequest`] values.
//!
//! The engine never performs I/O itself; it hands requests to a
//! [`Transport`]. [`UreqTransport`] is the production implementation used by
//! the CLI host. Tests plug in transports that talk to the mock upstream
//! in-process.

use std::future::Future;
use std::time::Duration;

use crate::http::{HttpMethod, HttpRequest, HttpResponse};

/// Errors that prevent a request from producing any HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection refused, DNS failure, timeout and the like.
    #[error("request failed: {0}")]
    Request(String),

    /// The blocking worker running the request panicked or was cancelled.
    #[error("transport task failed: {0}")]
    Task(String),
}

/// Async transport for executing plain-data HTTP requests.
///
/// Implementations return every HTTP status as `Ok`, 4xx and 5xx included.
/// Only failures that produced no response at all are `Err`.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

/// Blocking `ureq` agent driven from `spawn_blocking`.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        // Status codes are data here; the client interprets them.
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .new_agent();
        Self { agent }
    }
}

impl Transport for UreqTransport {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send {
        let agent = self.agent.clone();
        async move {
            tokio::task::spawn_blocking(move || execute_blocking(&agent, request))
                .await
                .map_err(|e| TransportError::Task(e.to_string()))?
        }
    }
}

fn execute_blocking(
    agent: &ureq::Agent,
    req: HttpRequest,
) -> Result<HttpResponse, TransportError> {
    let result = match req.method {
        HttpMethod::Get => {
            let mut builder = agent.get(&req.path);
            for (k, v) in &req.headers {
                builder = builder.header(k.as_str(), v.as_str());
            }
            builder.call()
        }
        HttpMethod::Post => {
            let mut builder = agent.post(&req.path);
            for (k, v) in &req.headers {
                builder = builder.header(k.as_str(), v.as_str());
            }
            match req.body {
                Some(body) => builder.send(body.as_bytes()),
                None => builder.send_empty(),
            }
        }
    };
    let mut response = result.map_err(|e| TransportError::Request(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| TransportError::Request(e.to_string()))?;

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
