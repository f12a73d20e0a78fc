//! Per-call translation pipeline.
//!
//! Each inbound call is driven by its own spawned task:
//!
//! 1. open a backend session with the caller's session token
//! 2. send the prompt
//! 3. drain the chunk stream to its natural end, accumulating content chunks
//! 4. clean the accumulated text once
//! 5. answer with one JSON body, or with SSE events (role, content, stop, `[DONE]`)
//! 6. close the session, exactly once, on every path
//!
//! The handler future owns a [`DropGuard`] for the task's cancellation token
//! (moved into the SSE body when streaming), so a client that goes away
//! cancels the drain without the task writing anything further. Failures
//! before any output exist become a JSON error; once SSE events have been
//! sent a failure is logged and the stream simply ends without `[DONE]`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backend::{
    Backend, BackendError, BackendStatus, ChunkStream, CreateSessionRequest, InferenceSession,
    ResponseChunk, SendRequest, SessionStats,
};
use crate::conversion::{self, CallInfo};
use crate::credentials::Credential;
use crate::errors::ApiError;
use crate::models::{ChatCompletionRequest, CompletionRequest};
use crate::sanitize;
use crate::usage;
use crate::util::{new_request_id, sse_done, sse_event, unix_now};

/// Public API a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStyle {
    Chat,
    Completion,
}

impl CallStyle {
    pub fn id_prefix(self) -> &'static str {
        match self {
            CallStyle::Chat => "chatcmpl-",
            CallStyle::Completion => "cmpl-",
        }
    }
}

/// A validated call, already mapped to backend requests.
#[derive(Debug, Clone)]
pub struct Call {
    pub style: CallStyle,
    pub model: String,
    pub session: CreateSessionRequest,
    pub send: SendRequest,
    pub stream: bool,
    pub include_usage: bool,
}

impl Call {
    pub fn chat(req: &ChatCompletionRequest) -> Self {
        Self {
            style: CallStyle::Chat,
            model: req.model.clone(),
            session: conversion::chat_session_request(req),
            send: conversion::chat_send_request(req),
            stream: req.stream,
            include_usage: req
                .stream_options
                .as_ref()
                .map(|o| o.include_usage)
                .unwrap_or(false),
        }
    }

    pub fn completion(req: &CompletionRequest) -> Self {
        Self {
            style: CallStyle::Completion,
            model: req.model.clone(),
            session: conversion::completion_session_request(req),
            send: conversion::completion_send_request(req),
            stream: req.stream,
            include_usage: req
                .stream_options
                .as_ref()
                .map(|o| o.include_usage)
                .unwrap_or(false),
        }
    }
}

/// Run one call against the backend and produce the HTTP response.
pub async fn execute(
    backend: Arc<dyn Backend>,
    credential: Arc<Credential>,
    call: Call,
) -> Response {
    let info = CallInfo {
        id: new_request_id(call.style.id_prefix()),
        model: call.model.clone(),
        created: unix_now(),
    };
    let span = info_span!("call", request_id = %info.id, model = %info.model, stream = call.stream);

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let (reply_tx, reply_rx) = oneshot::channel();
    let (events_tx, events_rx) = mpsc::channel(8);

    let driver = Driver {
        call,
        info,
        cancel,
        events: events_tx,
    };
    tokio::spawn(driver.run(backend, credential, reply_tx).instrument(span));

    match reply_rx.await {
        Ok(Ok(Reply::Complete(response))) => response,
        Ok(Ok(Reply::Streaming)) => sse_response(events_rx, guard),
        Ok(Err(err)) => err.into_response(),
        Err(_) => ApiError::Internal("call task ended without a reply".into()).into_response(),
    }
}

fn sse_response(events: mpsc::Receiver<Event>, guard: DropGuard) -> Response {
    let body = futures_util::stream::unfold((events, guard), |(mut events, guard)| async move {
        events
            .recv()
            .await
            .map(|event| (Ok::<_, Infallible>(event), (events, guard)))
    });
    Sse::new(body).into_response()
}

enum Reply {
    Complete(Response),
    /// Events follow on the channel.
    Streaming,
}

enum Drain {
    Done {
        text: String,
        last: Option<ResponseChunk>,
    },
    Failed(BackendError),
    Cancelled,
}

struct Driver {
    call: Call,
    info: CallInfo,
    cancel: CancellationToken,
    events: mpsc::Sender<Event>,
}

impl Driver {
    async fn run(
        self,
        backend: Arc<dyn Backend>,
        credential: Arc<Credential>,
        reply: oneshot::Sender<Result<Reply, ApiError>>,
    ) {
        let created = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("call cancelled before the session opened");
                return;
            }
            created = backend.create_session(&credential.token, self.call.session.clone()) => created,
        };
        let mut session = match created {
            Ok(session) => SessionGuard::new(session),
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };
        debug!("session opened");

        self.converse(&mut session, reply).await;
        session.close().await;
    }

    async fn converse(
        &self,
        session: &mut SessionGuard,
        reply: oneshot::Sender<Result<Reply, ApiError>>,
    ) {
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("call cancelled before the prompt was sent");
                return;
            }
            sent = session.send(self.call.send.clone()) => sent,
        };
        let stream = match sent {
            Ok(stream) => stream,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };

        if self.call.stream {
            if reply.send(Ok(Reply::Streaming)).is_err() {
                debug!("caller went away before streaming started");
                return;
            }
            self.stream_events(stream).await;
        } else {
            match self.complete(session, stream).await {
                Some(result) => {
                    let _ = reply.send(result);
                }
                None => debug!("call cancelled while reading the backend stream"),
            }
        }
    }

    /// Non-streaming: `None` when the call was cancelled.
    async fn complete(
        &self,
        session: &mut SessionGuard,
        stream: ChunkStream,
    ) -> Option<Result<Reply, ApiError>> {
        let (text, last) = match self.drain(stream).await {
            Drain::Done { text, last } => (text, last),
            Drain::Failed(err) => return Some(Err(err.into())),
            Drain::Cancelled => return None,
        };
        let content = sanitize::clean(&text);

        let stats = match session.stats().await {
            Ok(stats) => stats,
            Err(err) => {
                debug!(status = %err.status, "session stats unavailable: {}", err.message);
                None
            }
        };
        let usage = usage::from_session_stats(stats.as_ref())
            .or_else(|| usage::from_last_chunk(last.as_ref()));

        info!(chars = content.len(), has_usage = usage.is_some(), "call completed");
        let response = match self.call.style {
            CallStyle::Chat => Json(conversion::chat_response(&self.info, content, usage)).into_response(),
            CallStyle::Completion => {
                Json(conversion::completion_response(&self.info, content, usage)).into_response()
            }
        };
        Some(Ok(Reply::Complete(response)))
    }

    async fn stream_events(&self, stream: ChunkStream) {
        if self.call.style == CallStyle::Chat
            && !self.emit(&conversion::chat_role_chunk(&self.info)).await
        {
            return;
        }

        let (text, last) = match self.drain(stream).await {
            Drain::Done { text, last } => (text, last),
            Drain::Failed(err) => {
                error!(status = %err.status, "backend stream failed after output started: {}", err.message);
                return;
            }
            Drain::Cancelled => {
                debug!("stream cancelled by the caller");
                return;
            }
        };
        let content = sanitize::clean(&text);
        let usage = if self.call.include_usage {
            usage::from_last_chunk(last.as_ref())
        } else {
            None
        };

        let has_content = !content.is_empty();
        let delivered = match self.call.style {
            CallStyle::Chat => {
                (!has_content
                    || self
                        .emit(&conversion::chat_content_chunk(&self.info, content))
                        .await)
                    && self.emit(&conversion::chat_stop_chunk(&self.info, usage)).await
            }
            CallStyle::Completion => {
                (!has_content
                    || self
                        .emit(&conversion::completion_chunk(&self.info, content, None, None))
                        .await)
                    && self
                        .emit(&conversion::completion_chunk(
                            &self.info,
                            String::new(),
                            Some("stop"),
                            usage,
                        ))
                        .await
            }
        };
        if delivered && self.events.send(sse_done()).await.is_ok() {
            info!(has_content, "stream completed");
        } else {
            debug!("caller went away before the stream finished");
        }
    }

    /// Read every chunk in order, keeping content text and the last chunk seen.
    async fn drain(&self, mut stream: ChunkStream) -> Drain {
        let mut text = String::new();
        let mut last = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Drain::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_content() {
                        text.push_str(&chunk.content);
                    }
                    last = Some(chunk);
                }
                Some(Err(err)) if err.status == BackendStatus::Cancelled => return Drain::Cancelled,
                Some(Err(err)) => return Drain::Failed(err),
                None => return Drain::Done { text, last },
            }
        }
    }

    /// Send one JSON event; false once the caller is gone.
    async fn emit<T: Serialize>(&self, value: &T) -> bool {
        let event = match sse_event(value) {
            Ok(event) => event,
            Err(e) => {
                error!("failed to encode stream event: {e}");
                return false;
            }
        };
        self.events.send(event).await.is_ok()
    }
}

/// Owns a backend session and closes it exactly once.
///
/// [`close`](Self::close) is the normal path. If the guard is dropped
/// without it (the task panicked or was aborted) the close is spawned
/// instead.
struct SessionGuard {
    session: Option<Box<dyn InferenceSession>>,
}

impl SessionGuard {
    fn new(session: Box<dyn InferenceSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    async fn send(&mut self, request: SendRequest) -> Result<ChunkStream, BackendError> {
        match self.session.as_mut() {
            Some(session) => session.send(request).await,
            None => Err(closed()),
        }
    }

    async fn stats(&mut self) -> Result<Option<SessionStats>, BackendError> {
        match self.session.as_mut() {
            Some(session) => session.stats().await,
            None => Err(closed()),
        }
    }

    async fn close(mut self) {
        if let Some(session) = self.session.take() {
            close_session(session).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(close_session(session));
                }
                Err(_) => warn!("no runtime available to close the backend session"),
            }
        }
    }
}

fn closed() -> BackendError {
    BackendError::new(BackendStatus::FailedPrecondition, "session already closed")
}

async fn close_session(mut session: Box<dyn InferenceSession>) {
    match session.close().await {
        Ok(()) => debug!("session closed"),
        Err(err) => warn!(status = %err.status, "error closing backend session: {}", err.message),
    }
}
