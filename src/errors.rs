//! API error taxonomy.
//!
//! Every error leaving the gateway is rendered as the OpenAI envelope
//! `{"error": {"message", "type", "param", "code"}}`. Backend failures go
//! through [`translate`]; unclassified failures are logged in full and
//! reported with a generic message.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use thiserror::Error;

use crate::backend::{BackendError, BackendStatus};
use crate::models::{ErrorBody, ErrorEnvelope};

/// Map a backend status to `(http status, error type, error code)`.
pub fn translate(status: BackendStatus) -> (StatusCode, &'static str, &'static str) {
    match status {
        BackendStatus::Unauthenticated => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "invalid_api_key",
        ),
        BackendStatus::PermissionDenied => {
            (StatusCode::FORBIDDEN, "permission_error", "permission_denied")
        }
        BackendStatus::NotFound => (StatusCode::NOT_FOUND, "invalid_request_error", "not_found"),
        BackendStatus::InvalidArgument => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_argument",
        ),
        BackendStatus::ResourceExhausted => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "rate_limit_exceeded",
        ),
        BackendStatus::Unavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            "server_error",
            "service_unavailable",
        ),
        BackendStatus::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "server_error", "timeout"),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "internal_error",
        ),
    }
}

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or incomplete request (400).
    #[error("{message}")]
    InvalidRequest {
        message: String,
        code: &'static str,
        param: Option<&'static str>,
    },

    /// Missing, malformed or rejected credentials (401).
    #[error("{message}")]
    Authentication {
        message: String,
        kind: &'static str,
        code: &'static str,
    },

    #[error("The model '{0}' does not exist.")]
    ModelNotFound(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Anything unexpected; details are logged, never returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn invalid_body() -> Self {
        ApiError::InvalidRequest {
            message: "Invalid request body.".into(),
            code: "invalid_request",
            param: None,
        }
    }

    pub fn model_required() -> Self {
        ApiError::InvalidRequest {
            message: "The 'model' field is required.".into(),
            code: "model_required",
            param: Some("model"),
        }
    }

    pub fn messages_required() -> Self {
        ApiError::InvalidRequest {
            message: "The 'messages' field must contain at least one message.".into(),
            code: "messages_required",
            param: Some("messages"),
        }
    }

    /// No usable `Authorization: Bearer` header.
    pub fn missing_api_key() -> Self {
        ApiError::Authentication {
            message: "Incorrect API key provided. You can find your API key (DAISI Secret Key) in the DAISI dashboard.".into(),
            kind: "invalid_request_error",
            code: "invalid_api_key",
        }
    }

    /// The backend refused to issue a session token for the secret.
    pub fn credential_rejected(detail: &str) -> Self {
        ApiError::Authentication {
            message: format!("Authentication failed: {detail}"),
            kind: "authentication_error",
            code: "invalid_api_key",
        }
    }

    /// A handler ran without a resolved credential attached to the request.
    pub fn credential_missing() -> Self {
        ApiError::Authentication {
            message: "Authentication credential not found.".into(),
            kind: "authentication_error",
            code: "auth_error",
        }
    }

    pub fn embeddings_unsupported() -> Self {
        ApiError::NotImplemented(
            "Embeddings are not supported by the DAISI network at this time.".into(),
        )
    }

    /// Status, type, code, param and caller-facing message for this error.
    fn parts(&self) -> (StatusCode, &'static str, &'static str, Option<&'static str>, String) {
        match self {
            ApiError::InvalidRequest {
                message,
                code,
                param,
            } => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                *code,
                *param,
                message.clone(),
            ),
            ApiError::Authentication {
                message,
                kind,
                code,
            } => (StatusCode::UNAUTHORIZED, *kind, *code, None, message.clone()),
            ApiError::ModelNotFound(_) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "model_not_found",
                Some("model"),
                self.to_string(),
            ),
            ApiError::NotImplemented(message) => (
                StatusCode::NOT_IMPLEMENTED,
                "invalid_request_error",
                "not_implemented",
                None,
                message.clone(),
            ),
            ApiError::Backend(err) => {
                let (status, kind, code) = translate(err.status);
                (status, kind, code, None, err.message.clone())
            }
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "internal_error",
                None,
                "An internal server error occurred.".into(),
            ),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let (_, kind, code, param, message) = self.parts();
        ErrorEnvelope {
            error: ErrorBody {
                message,
                kind: kind.to_string(),
                param: param.map(str::to_string),
                code: Some(code.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Backend(err) => {
                tracing::error!(status = %err.status, detail = %err.message, "backend error");
            }
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "unhandled error");
            }
            _ => {}
        }
        (self.status(), Json(self.envelope())).into_response()
    }
}
