//! Test harness shared by the engine-level test files.
//!
//! `RouterTransport` drives the mock upstream's axum router in-process with
//! `tower::ServiceExt::oneshot`, so scenarios need no sockets.
//! `spawn_mock` starts the same router on a random local port for tests that
//! go over real HTTP.

#![allow(dead_code)]

use std::net::SocketAddr;

use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use mock_server::MockState;
use todo_batch::{
    Engine, EngineConfig, HttpRequest, HttpResponse, TodoClient, Transport, TransportError,
};
use tower::ServiceExt;

pub const BASE_URL: &str = "http://mock.local";

pub struct RouterTransport {
    router: axum::Router,
}

impl RouterTransport {
    pub fn new(state: MockState) -> Self {
        Self {
            router: mock_server::app_with_state(state),
        }
    }
}

impl Transport for RouterTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = Request::builder()
            .method(request.method.as_str())
            .uri(&request.path);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let http_request = builder
            .body(Body::from(request.body.unwrap_or_default()))
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let response = match self.router.clone().oneshot(http_request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?
            .to_bytes();

        Ok(HttpResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

pub fn engine(state: &MockState) -> Engine<RouterTransport> {
    engine_with(state, EngineConfig::default())
}

pub fn engine_with(state: &MockState, config: EngineConfig) -> Engine<RouterTransport> {
    Engine::new(
        TodoClient::new(BASE_URL),
        RouterTransport::new(state.clone()),
        config,
    )
}

pub async fn seed_tasks(state: &MockState, count: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        ids.push(state.seed_task(&format!("task {i}")).await);
    }
    ids
}

/// Starts the mock upstream on a random port in a background thread.
pub fn spawn_mock(state: MockState) -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run_with_state(listener, state).await
        })
        .unwrap();
    });

    addr
}
