#![forbid(unsafe_code)]
#![doc = r#"
openai2daisi

Serve the OpenAI Chat Completions / Completions HTTP surface on top of the DAISI session backend.

Crate highlights
- Server (in `server`): `/v1/chat/completions`, `/v1/completions`, `/v1/models`, `/v1/models/{id}`, `/v1/embeddings` (501), `/health`.
- Each call opens one backend session, drains its streamed reply, cleans the text once, and answers as JSON or SSE (`pipeline`).
- Caller secrets are exchanged for short-lived session tokens and cached (`credentials`).
- The backend is reached through the `backend::Backend` trait; `remote::RemoteBackend` implements it over the HTTP bridge.

Modules
- `models`: OpenAI wire data structures.
- `backend`: collaborator traits and chunk/stats types.
- `remote`: reqwest client for the bridge.
- `credentials`: secret → session token cache with periodic sweep.
- `auth`: bearer extraction and authentication middleware.
- `conversion`: request/response mapping.
- `sanitize`: cleanup of accumulated model output.
- `usage`: token usage derivation.
- `errors`: status translation and the OpenAI error envelope.
- `pipeline`: per-call orchestration with guaranteed session teardown.
- `config`, `util`: settings, tracing, CORS, SSE helpers.
"#]

pub mod auth;
pub mod backend;
pub mod config;
pub mod conversion;
pub mod credentials;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod remote;
pub mod sanitize;
pub mod server;
pub mod usage;
pub mod util;

pub use crate::backend::{Backend, BackendError, BackendStatus, InferenceSession};
pub use crate::credentials::{Credential, CredentialCache};
pub use crate::errors::ApiError;
pub use crate::server::{build_router, AppState};

// Re-export model namespaces for convenience (downstream users can do `use openai2daisi::chat`).
pub use crate::models::{chat, completion};
