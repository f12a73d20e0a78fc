use axum::{
    body::Bytes,
    extract::{Path, State},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::backend::{Backend, BackendModel};
use crate::credentials::{Credential, CredentialCache};
use crate::errors::ApiError;
use crate::models::{ChatCompletionRequest, CompletionRequest, ModelList, ModelObject};
use crate::pipeline::{self, Call};
use crate::util::{cors_layer_from_env, unix_now};

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub credentials: Arc<CredentialCache>,
}

impl AppState {
    pub fn new(backend: Arc<dyn Backend>, credentials: Arc<CredentialCache>) -> Self {
        Self {
            backend,
            credentials,
        }
    }
}

/// Build the Axum router.
///
/// `/health` is open; every `/v1` route runs behind [`crate::auth::authenticate`].
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/:id", get(get_model))
        .route("/v1/embeddings", post(embeddings))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::authenticate,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer_from_env()),
        )
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn require_credential(
    credential: Option<Extension<Arc<Credential>>>,
) -> Result<Arc<Credential>, ApiError> {
    credential
        .map(|Extension(c)| c)
        .ok_or_else(ApiError::credential_missing)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!("rejecting request body: {e}");
        ApiError::invalid_body()
    })
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    credential: Option<Extension<Arc<Credential>>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: ChatCompletionRequest = parse_body(&body)?;
    if req.model.trim().is_empty() {
        return Err(ApiError::model_required());
    }
    if req.messages.is_empty() {
        return Err(ApiError::messages_required());
    }
    let credential = require_credential(credential)?;
    Ok(pipeline::execute(state.backend.clone(), credential, Call::chat(&req)).await)
}

async fn completions(
    State(state): State<Arc<AppState>>,
    credential: Option<Extension<Arc<Credential>>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: CompletionRequest = parse_body(&body)?;
    if req.model.trim().is_empty() {
        return Err(ApiError::model_required());
    }
    let credential = require_credential(credential)?;
    Ok(pipeline::execute(state.backend.clone(), credential, Call::completion(&req)).await)
}

fn model_object(model: BackendModel, created: u64) -> ModelObject {
    ModelObject {
        id: model.name,
        object: "model".into(),
        created,
        owned_by: "daisi".into(),
    }
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    credential: Option<Extension<Arc<Credential>>>,
) -> Result<Json<ModelList>, ApiError> {
    let credential = require_credential(credential)?;
    let models = state.backend.list_models(&credential.token).await?;
    let created = unix_now();
    Ok(Json(ModelList {
        object: "list".into(),
        data: models
            .into_iter()
            .filter(|m| m.enabled)
            .map(|m| model_object(m, created))
            .collect(),
    }))
}

async fn get_model(
    State(state): State<Arc<AppState>>,
    credential: Option<Extension<Arc<Credential>>>,
    Path(id): Path<String>,
) -> Result<Json<ModelObject>, ApiError> {
    let credential = require_credential(credential)?;
    let models = state.backend.list_models(&credential.token).await?;
    models
        .into_iter()
        .filter(|m| m.enabled)
        .find(|m| m.name.eq_ignore_ascii_case(&id))
        .map(|m| Json(model_object(m, unix_now())))
        .ok_or(ApiError::ModelNotFound(id))
}

async fn embeddings() -> ApiError {
    ApiError::embeddings_unsupported()
}
