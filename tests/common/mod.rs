#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use runstream::{AppState, Relay, RelayConfig, Secret};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;

pub const API_KEY: &str = "test-key";

#[derive(Debug, Clone)]
pub enum Step {
    Send(String),
    Pause(u64),
    /// Close the response body. Without it the engine holds the stream open
    /// with keep-alives until the client goes away.
    End,
}

pub fn data(json: &str) -> Step {
    Step::Send(format!("data: {json}\n\n"))
}

#[derive(Clone, Default)]
struct EngineState {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Vec<Step>>>>>,
    connections: Arc<AtomicUsize>,
    abandoned: Arc<AtomicUsize>,
}

/// Stand-in for the workflow engine's credentialed status stream.
pub struct FakeEngine {
    pub url: String,
    state: EngineState,
}

impl FakeEngine {
    pub async fn start() -> Self {
        let state = EngineState::default();
        let app = Router::new()
            .route("/workflow/status/{run_id}/stream", get(engine_stream))
            .with_state(state.clone());
        let url = spawn_server(app).await;
        Self { url, state }
    }

    /// Queues the steps served on the next connection for `run_id`.
    pub fn script(&self, run_id: &str, steps: Vec<Step>) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .entry(run_id.to_string())
            .or_default()
            .push_back(steps);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Waits until `n` held-open streams have seen their client disappear.
    pub async fn wait_abandoned(&self, n: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.state.abandoned.load(Ordering::SeqCst) >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

async fn engine_stream(State(st): State<EngineState>, Path(run_id): Path<String>, headers: HeaderMap) -> Response {
    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some(API_KEY) {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }
    if run_id.starts_with("missing") {
        return (StatusCode::NOT_FOUND, "Run not found").into_response();
    }
    st.connections.fetch_add(1, Ordering::SeqCst);

    let steps = st
        .scripts
        .lock()
        .unwrap()
        .get_mut(&run_id)
        .and_then(|q| q.pop_front())
        .unwrap_or_default();

    let (tx, rx) = mpsc::channel::<Result<String, Infallible>>(16);
    tokio::spawn(async move {
        for step in steps {
            match step {
                Step::Send(s) => {
                    if tx.send(Ok(s)).await.is_err() {
                        st.abandoned.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                }
                Step::Pause(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                Step::End => return,
            }
        }
        loop {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if tx.send(Ok(": keep-alive\n\n".to_string())).await.is_err() {
                break;
            }
        }
        st.abandoned.fetch_add(1, Ordering::SeqCst);
    });

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Accepts connections and never answers.
pub async fn silent_engine() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
        }
    });
    format!("http://{addr}")
}

/// An address nothing listens on.
pub async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub fn relay_config(upstream: &str, api_key: Option<&str>) -> RelayConfig {
    RelayConfig {
        upstream_base_url: upstream.to_string(),
        api_key: api_key.map(Secret::new),
        connect_timeout_ms: 1_000,
        response_timeout_ms: 2_000,
        ..RelayConfig::default()
    }
}

pub async fn start_relay(upstream: &str) -> String {
    let relay = Relay::new(relay_config(upstream, Some(API_KEY))).unwrap();
    spawn_server(runstream::router(AppState::new(relay))).await
}

async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
