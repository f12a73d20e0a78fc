//! [`Backend`] over the HTTP bridge that fronts the session network.
//!
//! Session-scoped calls carry the session token in `x-daisi-client-key`.
//! Replies to `send` are newline-delimited JSON: one [`ResponseChunk`] per
//! line, or an `{"error": {...}}` line if generation fails part way.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{
    Backend, BackendError, BackendModel, BackendStatus, ChunkStream, CreateSessionRequest,
    InferenceSession, IssuedToken, ResponseChunk, SendRequest, SessionStats,
};
use crate::config::GatewayConfig;
use crate::util::build_http_client;

pub const CLIENT_KEY_HEADER: &str = "x-daisi-client-key";

/// Placeholder key for calls made before a session token exists.
const NO_KEY: &str = "NOKEY";

#[derive(Debug, Serialize)]
struct ClientKeyRequest<'a> {
    secret_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClientKeyResponse {
    client_key: String,
    /// Unix seconds.
    #[serde(default)]
    key_expiration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<BackendModel>,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamLine {
    Failure { error: ErrorBody },
    Chunk(ResponseChunk),
}

#[derive(Clone)]
pub struct RemoteBackend {
    http: reqwest::Client,
    base_url: String,
}

impl RemoteBackend {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(build_http_client(config), config.backend_url.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn issue_token(&self, secret: &str) -> Result<IssuedToken, BackendError> {
        let resp = self
            .http
            .post(self.url("/v1/auth/client-keys"))
            .header(CLIENT_KEY_HEADER, NO_KEY)
            .json(&ClientKeyRequest { secret_key: secret })
            .send()
            .await
            .map_err(transport_error)?;
        let issued: ClientKeyResponse = decode(check(resp).await?).await?;
        Ok(IssuedToken {
            token: issued.client_key,
            expires_at: issued.key_expiration.map(expiry_from_unix),
        })
    }

    async fn create_session(
        &self,
        token: &str,
        request: CreateSessionRequest,
    ) -> Result<Box<dyn InferenceSession>, BackendError> {
        let resp = self
            .http
            .post(self.url("/v1/inference/sessions"))
            .header(CLIENT_KEY_HEADER, token)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let created: SessionCreated = decode(check(resp).await?).await?;
        debug!(session_id = %created.session_id, "bridge session created");
        Ok(Box::new(RemoteSession {
            http: self.http.clone(),
            session_url: self.url(&format!("/v1/inference/sessions/{}", created.session_id)),
            token: token.to_string(),
        }))
    }

    async fn list_models(&self, token: &str) -> Result<Vec<BackendModel>, BackendError> {
        let resp = self
            .http
            .get(self.url("/v1/models"))
            .header(CLIENT_KEY_HEADER, token)
            .send()
            .await
            .map_err(transport_error)?;
        let listed: ModelsResponse = decode(check(resp).await?).await?;
        Ok(listed.models)
    }
}

struct RemoteSession {
    http: reqwest::Client,
    session_url: String,
    token: String,
}

#[async_trait]
impl InferenceSession for RemoteSession {
    async fn send(&mut self, request: SendRequest) -> Result<ChunkStream, BackendError> {
        let resp = self
            .http
            .post(format!("{}/send", self.session_url))
            .header(CLIENT_KEY_HEADER, &self.token)
            .header(http::header::ACCEPT, "application/x-ndjson")
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        Ok(ndjson_chunks(check(resp).await?.bytes_stream()))
    }

    async fn stats(&mut self) -> Result<Option<SessionStats>, BackendError> {
        let resp = self
            .http
            .get(format!("{}/stats", self.session_url))
            .header(CLIENT_KEY_HEADER, &self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check(resp).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = resp.bytes().await.map_err(transport_error)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| BackendError::new(BackendStatus::Internal, format!("malformed stats: {e}")))
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        let resp = self
            .http
            .delete(&self.session_url)
            .header(CLIENT_KEY_HEADER, &self.token)
            .send()
            .await
            .map_err(transport_error)?;
        check(resp).await.map(|_| ())
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::new(BackendStatus::DeadlineExceeded, e.to_string())
    } else {
        BackendError::new(BackendStatus::Unavailable, e.to_string())
    }
}

fn status_for_http(status: StatusCode) -> BackendStatus {
    match status {
        StatusCode::UNAUTHORIZED => BackendStatus::Unauthenticated,
        StatusCode::FORBIDDEN => BackendStatus::PermissionDenied,
        StatusCode::NOT_FOUND => BackendStatus::NotFound,
        StatusCode::BAD_REQUEST => BackendStatus::InvalidArgument,
        StatusCode::TOO_MANY_REQUESTS => BackendStatus::ResourceExhausted,
        StatusCode::SERVICE_UNAVAILABLE => BackendStatus::Unavailable,
        StatusCode::GATEWAY_TIMEOUT => BackendStatus::DeadlineExceeded,
        _ => BackendStatus::Internal,
    }
}

fn error_from_body(body: ErrorBody, fallback: BackendStatus) -> BackendError {
    let status = body
        .code
        .as_deref()
        .and_then(BackendStatus::from_code_name)
        .unwrap_or(fallback);
    let message = body.message.unwrap_or_else(|| status.to_string());
    BackendError::new(status, message)
}

/// Pass successful responses through; turn anything else into a
/// [`BackendError`].
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.bytes().await.unwrap_or_default();
    let parsed: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
    let mut err = error_from_body(parsed, status_for_http(status));
    if err.message == err.status.as_str() && !body.is_empty() {
        err.message = String::from_utf8_lossy(&body).trim().to_string();
    }
    Err(err)
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
    let body = resp.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&body).map_err(|e| {
        BackendError::new(
            BackendStatus::Internal,
            format!("malformed bridge response: {e}"),
        )
    })
}

fn parse_line(line: &[u8]) -> Result<ResponseChunk, BackendError> {
    match serde_json::from_slice::<StreamLine>(line) {
        Ok(StreamLine::Chunk(chunk)) => Ok(chunk),
        Ok(StreamLine::Failure { error }) => Err(error_from_body(error, BackendStatus::Internal)),
        Err(e) => Err(BackendError::new(
            BackendStatus::Internal,
            format!("malformed stream line: {e}"),
        )),
    }
}

/// Longest NDJSON line accepted from the bridge.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Split a byte stream into NDJSON lines and decode each one. Blank lines are
/// skipped; a transport error or a line longer than [`MAX_LINE_BYTES`] ends
/// the stream after being reported.
pub fn ndjson_chunks<S>(body: S) -> ChunkStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    // (body, buffered bytes, bytes of `buf` known to hold no newline, eof)
    let state = (Box::pin(body), Vec::<u8>::new(), 0usize, false);
    futures_util::stream::unfold(state, |(mut body, mut buf, mut scanned, mut eof)| async move {
        loop {
            if let Some(offset) = buf[scanned..].iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=scanned + offset).collect();
                scanned = 0;
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((parse_line(&line), (body, buf, scanned, eof)));
            }
            scanned = buf.len();
            if scanned > MAX_LINE_BYTES {
                buf.clear();
                let err = BackendError::new(
                    BackendStatus::Internal,
                    format!("stream line exceeds {MAX_LINE_BYTES} bytes"),
                );
                return Some((Err(err), (body, buf, 0, true)));
            }
            if eof {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut buf);
                return Some((parse_line(&line), (body, buf, 0, eof)));
            }
            match body.next().await {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(transport_error(e)), (body, buf, 0, true)));
                }
                None => eof = true,
            }
        }
    })
    .boxed()
}

fn expiry_from_unix(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}
