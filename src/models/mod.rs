//! Data models for the OpenAI-compatible surface.
//!
//! This module groups three submodules:
//! - `chat`: Chat Completions request, response and streaming chunk types.
//! - `completion`: legacy text Completions request and response types.
//! - `openai`: shapes shared by every route (usage, error envelope, models).
//!
//! The mapping logic between these types and the session backend lives in
//! `crate::conversion`.

pub mod chat;
pub mod completion;
pub mod openai;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Role,
    ToolDefinition,
};
pub use completion::{CompletionRequest, CompletionResponse};
pub use openai::{ErrorBody, ErrorEnvelope, ModelList, ModelObject, Usage};
