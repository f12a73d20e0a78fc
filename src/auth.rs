//! Bearer authentication.
//!
//! Every `/v1` route requires `Authorization: Bearer <secret>`. The secret is
//! exchanged for a backend session token through the shared
//! [`CredentialCache`](crate::credentials::CredentialCache) and the resulting
//! `Arc<Credential>` is attached to the request extensions for handlers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::header::AUTHORIZATION;
use http::HeaderMap;
use tracing::warn;

use crate::credentials::secret_suffix;
use crate::errors::ApiError;
use crate::server::AppState;

const BEARER_PREFIX: &str = "bearer ";

/// Extract the bearer secret. The scheme is matched case-insensitively and an
/// empty (or all-whitespace) token counts as absent.
pub fn bearer_secret(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let scheme = value.get(..BEARER_PREFIX.len())?;
    if !scheme.eq_ignore_ascii_case(BEARER_PREFIX) {
        return None;
    }
    let token = value[BEARER_PREFIX.len()..].trim();
    (!token.is_empty()).then_some(token)
}

/// Middleware: resolve the caller's credential or reject with 401.
///
/// Transient backend failures while issuing (unavailable, timeout, rate
/// limited) are reported through the usual status translation instead of as
/// an authentication failure.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(secret) = bearer_secret(request.headers()).map(str::to_string) else {
        return ApiError::missing_api_key().into_response();
    };

    match state.credentials.resolve(&secret).await {
        Ok(credential) => {
            request.extensions_mut().insert(credential);
            next.run(request).await
        }
        Err(err) if err.is_rejection() => {
            warn!(
                secret = %format!("...{}", secret_suffix(&secret)),
                status = %err.status,
                "credential rejected by backend"
            );
            ApiError::credential_rejected(&err.message).into_response()
        }
        Err(err) => ApiError::Backend(err).into_response(),
    }
}
