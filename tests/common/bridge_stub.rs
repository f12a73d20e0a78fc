use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::StatusCode;
use openai2daisi::remote::CLIENT_KEY_HEADER;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Canned replies for each bridge endpoint.
#[derive(Clone)]
pub struct BridgeScript {
    pub issue: (StatusCode, Value),
    pub models: Value,
    pub create: (StatusCode, Value),
    /// Raw NDJSON body returned by `send`.
    pub send: String,
    pub stats: (StatusCode, String),
}

impl Default for BridgeScript {
    fn default() -> Self {
        Self {
            issue: (
                StatusCode::OK,
                json!({"client_key": "ck-remote-1", "key_expiration": 1_900_000_000u64}),
            ),
            models: json!({"models": [{"name": "llama-3", "enabled": true}]}),
            create: (StatusCode::OK, json!({"session_id": "s-42"})),
            send: concat!(
                "{\"type\":\"thinking\",\"content\":\"<think>plan</think>\"}\n",
                "{\"type\":\"text\",\"content\":\"Hello\"}\n",
                "{\"type\":\"text\",\"content\":\" from the bridge\",\"session_token_count\":30,\"message_token_count\":4}\n",
            )
            .to_string(),
            stats: (
                StatusCode::OK,
                json!({"session_token_count": 31, "last_message_token_count": 5}).to_string(),
            ),
        }
    }
}

/// One request the stub received.
#[derive(Debug, Clone)]
pub struct Hit {
    pub method: Method,
    pub path: String,
    pub client_key: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct StubState {
    script: BridgeScript,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl StubState {
    fn record(&self, method: Method, uri: &Uri, headers: &HeaderMap, body: &Bytes) {
        let hit = Hit {
            method,
            path: uri.path().to_string(),
            client_key: headers
                .get(CLIENT_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: serde_json::from_slice(body).unwrap_or(Value::Null),
        };
        self.hits.lock().unwrap().push(hit);
    }
}

pub struct BridgeStub {
    pub base_url: String,
    hits: Arc<Mutex<Vec<Hit>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl BridgeStub {
    pub async fn start(script: BridgeScript) -> Self {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(StubState {
            script,
            hits: hits.clone(),
        });

        let router = Router::new()
            .route("/v1/auth/client-keys", post(issue_handler))
            .route("/v1/models", get(models_handler))
            .route("/v1/inference/sessions", post(create_handler))
            .route("/v1/inference/sessions/:id/send", post(send_handler))
            .route("/v1/inference/sessions/:id/stats", get(stats_handler))
            .route(
                "/v1/inference/sessions/:id",
                axum::routing::delete(close_handler),
            )
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub bridge");
        let addr = listener.local_addr().expect("stub bridge local addr");
        let (tx, rx) = oneshot::channel::<()>();

        let server = axum::serve(listener, router.into_make_service());
        tokio::spawn(async move {
            tokio::select! {
                res = server => {
                    if let Err(err) = res {
                        eprintln!("Stub bridge server error: {err:?}");
                    }
                }
                _ = rx => {}
            }
        });

        BridgeStub {
            base_url: format!("http://{}", addr),
            hits,
            shutdown: Some(tx),
        }
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }

    /// Hits whose path ends with `suffix`.
    pub fn hits_to(&self, suffix: &str) -> Vec<Hit> {
        self.hits()
            .into_iter()
            .filter(|h| h.path.ends_with(suffix))
            .collect()
    }
}

impl Drop for BridgeStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn issue_handler(
    State(state): State<Arc<StubState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record(Method::POST, &uri, &headers, &body);
    let (status, body) = state.script.issue.clone();
    (status, Json(body)).into_response()
}

async fn models_handler(
    State(state): State<Arc<StubState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.record(Method::GET, &uri, &headers, &Bytes::new());
    Json(state.script.models.clone()).into_response()
}

async fn create_handler(
    State(state): State<Arc<StubState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record(Method::POST, &uri, &headers, &body);
    let (status, body) = state.script.create.clone();
    (status, Json(body)).into_response()
}

async fn send_handler(
    State(state): State<Arc<StubState>>,
    Path(_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record(Method::POST, &uri, &headers, &body);
    (
        [(http::header::CONTENT_TYPE, "application/x-ndjson")],
        state.script.send.clone(),
    )
        .into_response()
}

async fn stats_handler(
    State(state): State<Arc<StubState>>,
    Path(_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.record(Method::GET, &uri, &headers, &Bytes::new());
    let (status, body) = state.script.stats.clone();
    if status == StatusCode::NO_CONTENT {
        return status.into_response();
    }
    (
        status,
        [(http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

async fn close_handler(
    State(state): State<Arc<StubState>>,
    Path(_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> StatusCode {
    state.record(Method::DELETE, &uri, &headers, &Bytes::new());
    StatusCode::NO_CONTENT
}
