#![allow(dead_code)]

//! Shared helpers for integration tests.
//!
//! `ScriptedBackend` stands in for the session network: it issues tokens,
//! opens sessions that replay a fixed list of chunks, and counts every call so
//! tests can assert on what reached the backend. `TestServer` runs the real
//! router on an ephemeral local port.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use openai2daisi::backend::{
    Backend, BackendError, BackendModel, BackendStatus, ChunkStream, CreateSessionRequest,
    InferenceSession, IssuedToken, ResponseChunk, SendRequest, SessionStats,
};
use openai2daisi::credentials::CredentialCache;
use openai2daisi::server::{build_router, AppState};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub mod bridge_stub;

pub const SECRET: &str = "sk-daisi-test-secret";

#[derive(Default)]
pub struct ScriptedBackend {
    chunks: Vec<Result<ResponseChunk, BackendError>>,
    models: Vec<BackendModel>,
    stats: Option<SessionStats>,
    issue_error: Option<BackendError>,
    create_error: Option<BackendError>,
    issue_delay: Option<Duration>,

    pub issue_calls: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub created: Mutex<Vec<(String, CreateSessionRequest)>>,
    pub sent: Arc<Mutex<Vec<SendRequest>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each part becomes one text chunk.
    pub fn with_text(mut self, parts: &[&str]) -> Self {
        self.chunks = parts
            .iter()
            .map(|p| Ok(ResponseChunk::text(*p)))
            .collect();
        self
    }

    pub fn with_chunk(mut self, chunk: ResponseChunk) -> Self {
        self.chunks.push(Ok(chunk));
        self
    }

    pub fn with_models(mut self, models: &[(&str, bool)]) -> Self {
        self.models = models
            .iter()
            .map(|(name, enabled)| BackendModel {
                name: name.to_string(),
                enabled: *enabled,
            })
            .collect();
        self
    }

    pub fn with_stats(mut self, session: i64, last_message: i64) -> Self {
        self.stats = Some(SessionStats {
            session_token_count: session,
            last_message_token_count: last_message,
        });
        self
    }

    pub fn failing_issue(mut self, status: BackendStatus) -> Self {
        self.issue_error = Some(BackendError::new(status, "issuance failed"));
        self
    }

    pub fn failing_create(mut self, status: BackendStatus) -> Self {
        self.create_error = Some(BackendError::new(status, "create failed"));
        self
    }

    pub fn slow_issue(mut self, delay: Duration) -> Self {
        self.issue_delay = Some(delay);
        self
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Poll until `n` sessions have been closed (closing may trail the response).
    pub async fn wait_for_closes(&self, n: usize) {
        for _ in 0..200 {
            if self.closes() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(self.closes(), n, "sessions closed");
    }
}

struct ScriptedSession {
    chunks: Vec<Result<ResponseChunk, BackendError>>,
    stats: Option<SessionStats>,
    closes: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<SendRequest>>>,
}

#[async_trait]
impl InferenceSession for ScriptedSession {
    async fn send(&mut self, request: SendRequest) -> Result<ChunkStream, BackendError> {
        self.sent.lock().unwrap().push(request);
        Ok(futures_util::stream::iter(self.chunks.clone()).boxed())
    }

    async fn stats(&mut self) -> Result<Option<SessionStats>, BackendError> {
        Ok(self.stats)
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn issue_token(&self, secret: &str) -> Result<IssuedToken, BackendError> {
        let n = self.issue_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.issue_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.issue_error {
            return Err(err.clone());
        }
        Ok(IssuedToken {
            token: format!("session-token-{n}-for-{}", secret.len()),
            expires_at: None,
        })
    }

    async fn create_session(
        &self,
        token: &str,
        request: CreateSessionRequest,
    ) -> Result<Box<dyn InferenceSession>, BackendError> {
        self.created
            .lock()
            .unwrap()
            .push((token.to_string(), request));
        if let Some(err) = &self.create_error {
            return Err(err.clone());
        }
        Ok(Box::new(ScriptedSession {
            chunks: self.chunks.clone(),
            stats: self.stats,
            closes: self.closes.clone(),
            sent: self.sent.clone(),
        }))
    }

    async fn list_models(&self, _token: &str) -> Result<Vec<BackendModel>, BackendError> {
        Ok(self.models.clone())
    }
}

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    join: JoinHandle<()>,
    client: reqwest::Client,
}

impl TestServer {
    /// Spawn the application router backed by `backend` on an ephemeral port.
    pub async fn spawn<B: Backend + 'static>(backend: Arc<B>) -> Self {
        let credentials = Arc::new(CredentialCache::new(
            backend.clone(),
            Duration::from_secs(3600),
        ));
        let app = build_router(Arc::new(AppState::new(backend, credentials)));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("test listener addr");
        let join = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app.into_make_service()).await {
                eprintln!("test server error: {err:?}");
            }
        });

        TestServer {
            base_url: format!("http://{addr}"),
            addr,
            join,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed building reqwest client"),
        }
    }

    pub async fn get(&self, path: &str, auth_bearer: Option<&str>) -> reqwest::Response {
        let mut rb = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(b) = auth_bearer {
            rb = rb.bearer_auth(b);
        }
        rb.send().await.expect("GET request")
    }

    pub async fn post_json<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
        auth_bearer: Option<&str>,
    ) -> reqwest::Response {
        let mut rb = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(b) = auth_bearer {
            rb = rb.bearer_auth(b);
        }
        rb.json(body).send().await.expect("POST request")
    }

    pub async fn post_raw(
        &self,
        path: &str,
        body: &'static str,
        authorization: Option<&str>,
    ) -> reqwest::Response {
        let mut rb = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(http::header::CONTENT_TYPE, "application/json");
        if let Some(value) = authorization {
            rb = rb.header(http::header::AUTHORIZATION, value);
        }
        rb.body(body).send().await.expect("POST request")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.join.abort();
    }
}

pub fn chat_body(stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": "llama-3",
        "messages": [
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": "Say hello"}
        ],
        "stream": stream
    })
}

/// Payloads of every `data:` line in an SSE body.
pub fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

/// Assert an OpenAI error envelope and return it.
pub async fn expect_error(
    resp: reqwest::Response,
    status: u16,
    kind: &str,
    code: &str,
) -> serde_json::Value {
    assert_eq!(resp.status().as_u16(), status);
    let body: serde_json::Value = resp.json().await.expect("error body is JSON");
    assert_eq!(body["error"]["type"], kind, "{body}");
    assert_eq!(body["error"]["code"], code, "{body}");
    assert!(body["error"]["message"].is_string(), "{body}");
    body
}
