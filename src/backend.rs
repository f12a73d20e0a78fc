//! Session backend collaborator interface.
//!
//! The gateway never speaks the backend protocol directly. Everything it needs
//! (issuing a session token for a caller secret, opening an inference session,
//! streaming a reply, reading session stats, closing the session, listing
//! models) goes through the [`Backend`] and [`InferenceSession`] traits.
//! `crate::remote` provides the HTTP bridge implementation; tests script their
//! own.

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

/// Canonical RPC status codes reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendStatus {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl BackendStatus {
    /// Parse a status from its canonical name (`RESOURCE_EXHAUSTED`,
    /// `resource_exhausted`, `ResourceExhausted` all work).
    pub fn from_code_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        let status = match normalized.as_str() {
            "ok" => BackendStatus::Ok,
            "cancelled" | "canceled" => BackendStatus::Cancelled,
            "unknown" => BackendStatus::Unknown,
            "invalidargument" => BackendStatus::InvalidArgument,
            "deadlineexceeded" => BackendStatus::DeadlineExceeded,
            "notfound" => BackendStatus::NotFound,
            "alreadyexists" => BackendStatus::AlreadyExists,
            "permissiondenied" => BackendStatus::PermissionDenied,
            "resourceexhausted" => BackendStatus::ResourceExhausted,
            "failedprecondition" => BackendStatus::FailedPrecondition,
            "aborted" => BackendStatus::Aborted,
            "outofrange" => BackendStatus::OutOfRange,
            "unimplemented" => BackendStatus::Unimplemented,
            "internal" => BackendStatus::Internal,
            "unavailable" => BackendStatus::Unavailable,
            "dataloss" => BackendStatus::DataLoss,
            "unauthenticated" => BackendStatus::Unauthenticated,
            _ => return None,
        };
        Some(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Ok => "OK",
            BackendStatus::Cancelled => "CANCELLED",
            BackendStatus::Unknown => "UNKNOWN",
            BackendStatus::InvalidArgument => "INVALID_ARGUMENT",
            BackendStatus::DeadlineExceeded => "DEADLINE_EXCEEDED",
            BackendStatus::NotFound => "NOT_FOUND",
            BackendStatus::AlreadyExists => "ALREADY_EXISTS",
            BackendStatus::PermissionDenied => "PERMISSION_DENIED",
            BackendStatus::ResourceExhausted => "RESOURCE_EXHAUSTED",
            BackendStatus::FailedPrecondition => "FAILED_PRECONDITION",
            BackendStatus::Aborted => "ABORTED",
            BackendStatus::OutOfRange => "OUT_OF_RANGE",
            BackendStatus::Unimplemented => "UNIMPLEMENTED",
            BackendStatus::Internal => "INTERNAL",
            BackendStatus::Unavailable => "UNAVAILABLE",
            BackendStatus::DataLoss => "DATA_LOSS",
            BackendStatus::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by (or while talking to) the session backend.
#[derive(Debug, Clone, Error)]
#[error("backend {status}: {message}")]
pub struct BackendError {
    pub status: BackendStatus,
    pub message: String,
}

impl BackendError {
    pub fn new(status: BackendStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// True when the backend refused the caller's secret itself, as opposed to
    /// being unreachable or overloaded.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self.status,
            BackendStatus::Unavailable
                | BackendStatus::DeadlineExceeded
                | BackendStatus::ResourceExhausted
        )
    }
}

/// Result of exchanging a caller secret for a session token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    /// `None` when the backend did not say; the cache applies its default TTL.
    pub expires_at: Option<SystemTime>,
}

/// Reasoning budget requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkLevel {
    Basic,
    Skilled,
}

/// Parameters for opening an inference session.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub model_name: String,
    pub initialization_prompt: Option<String>,
    pub think_level: ThinkLevel,
}

/// One prompt sent into an open session.
///
/// Unset generation parameters stay `None` and are omitted on the wire, so
/// the backend keeps its own defaults for them.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub text: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub seed: Option<i64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
}

/// Classification of a streamed backend chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    ToolContent,
    Thinking,
    #[serde(other)]
    Control,
}

/// One unit of streamed backend output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseChunk {
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    #[serde(default)]
    pub content: String,
    /// Running token count for the whole session (0 when not reported).
    #[serde(default)]
    pub session_token_count: i64,
    /// Running token count for the message being generated.
    #[serde(default)]
    pub message_token_count: i64,
}

impl ResponseChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Text,
            content: content.into(),
            session_token_count: 0,
            message_token_count: 0,
        }
    }

    /// Only text and tool-content chunks contribute visible output.
    pub fn is_content(&self) -> bool {
        matches!(self.kind, ChunkKind::Text | ChunkKind::ToolContent)
    }
}

/// Session-level token statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_token_count: i64,
    pub last_message_token_count: i64,
}

/// A model the backend knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendModel {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
}

/// Streamed reply to a [`SendRequest`].
pub type ChunkStream = BoxStream<'static, Result<ResponseChunk, BackendError>>;

/// An open, per-call inference session.
///
/// Sessions are never shared; the pipeline that opened one owns it and closes
/// it exactly once.
#[async_trait]
pub trait InferenceSession: Send {
    async fn send(&mut self, request: SendRequest) -> Result<ChunkStream, BackendError>;

    async fn stats(&mut self) -> Result<Option<SessionStats>, BackendError>;

    async fn close(&mut self) -> Result<(), BackendError>;
}

/// Entry point to the session backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Exchange a long-lived caller secret for a short-lived session token.
    async fn issue_token(&self, secret: &str) -> Result<IssuedToken, BackendError>;

    async fn create_session(
        &self,
        token: &str,
        request: CreateSessionRequest,
    ) -> Result<Box<dyn InferenceSession>, BackendError>;

    async fn list_models(&self, token: &str) -> Result<Vec<BackendModel>, BackendError>;
}
