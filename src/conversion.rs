//! Request and response mapping between the OpenAI wire shapes and the
//! session backend.
//!
//! Inbound: a chat request becomes a session (model, optional initialization
//! prompt from the first system message, think level) plus one prompt
//! rendered as a `Role: content` transcript. A completion request sends its
//! prompt verbatim. Outbound: cleaned text is wrapped into a full response or
//! into one of the three streamed chunk kinds (role, content, stop).

use serde_json::Value;

use crate::backend::{CreateSessionRequest, SendRequest, ThinkLevel};
use crate::models::chat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatDelta,
    ChatMessage, ChatResponseMessage, ChatStreamChoice, Role,
};
use crate::models::completion::{CompletionChoice, CompletionRequest, CompletionResponse};
use crate::models::Usage;

/// Line the transcript ends with so the model answers as the assistant.
pub const RESPONDER_PROMPT: &str = "Assistant:";

/// Identity shared by every object emitted for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub id: String,
    pub model: String,
    pub created: u64,
}

/// Flatten a chat message `content` value to plain text.
///
/// Strings pass through, `null` is empty, an array of content parts keeps
/// only its `text` parts (newline-joined), and any other JSON is rendered as
/// JSON text.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Text for a legacy completion `prompt`.
pub fn prompt_text(prompt: &Value) -> String {
    match prompt {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn role_prefix(role: &Role) -> String {
    match role {
        Role::User => "User:".into(),
        Role::Assistant => "Assistant:".into(),
        Role::Tool => "Tool:".into(),
        Role::System => "System:".into(),
        Role::Other(name) => format!("{name}:"),
    }
}

/// Render the non-system messages as a transcript ending in an open
/// `Assistant:` line.
pub fn format_transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages.iter().filter(|m| m.role != Role::System) {
        out.push_str(&role_prefix(&message.role));
        out.push(' ');
        out.push_str(&content_text(&message.content));
        out.push('\n');
    }
    out.push_str(RESPONDER_PROMPT);
    out
}

pub fn chat_session_request(req: &ChatCompletionRequest) -> CreateSessionRequest {
    let initialization_prompt = req
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| content_text(&m.content));
    // Tool definitions have no backend counterpart; ask for deeper reasoning
    // instead.
    let think_level = match &req.tools {
        Some(tools) if !tools.is_empty() => ThinkLevel::Skilled,
        _ => ThinkLevel::Basic,
    };
    CreateSessionRequest {
        model_name: req.model.clone(),
        initialization_prompt,
        think_level,
    }
}

pub fn chat_send_request(req: &ChatCompletionRequest) -> SendRequest {
    SendRequest {
        text: format_transcript(&req.messages),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens.or(req.max_completion_tokens),
        seed: req.seed,
        frequency_penalty: req.frequency_penalty,
        presence_penalty: req.presence_penalty,
    }
}

pub fn completion_session_request(req: &CompletionRequest) -> CreateSessionRequest {
    CreateSessionRequest {
        model_name: req.model.clone(),
        initialization_prompt: None,
        think_level: ThinkLevel::Basic,
    }
}

pub fn completion_send_request(req: &CompletionRequest) -> SendRequest {
    SendRequest {
        text: prompt_text(&req.prompt),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        seed: req.seed,
        frequency_penalty: req.frequency_penalty,
        presence_penalty: req.presence_penalty,
    }
}

// ============================================================================
// Outbound
// ============================================================================

pub fn chat_response(info: &CallInfo, content: String, usage: Option<Usage>) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: info.id.clone(),
        object: "chat.completion".into(),
        created: info.created,
        model: info.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant".into(),
                content,
            },
            finish_reason: Some("stop".into()),
        }],
        usage,
    }
}

fn chat_chunk(
    info: &CallInfo,
    delta: ChatDelta,
    finish_reason: Option<&str>,
    usage: Option<Usage>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: info.id.clone(),
        object: "chat.completion.chunk".into(),
        created: info.created,
        model: info.model.clone(),
        choices: vec![ChatStreamChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(str::to_string),
        }],
        usage,
    }
}

/// First streamed event: announces the assistant role with empty content.
pub fn chat_role_chunk(info: &CallInfo) -> ChatCompletionChunk {
    chat_chunk(
        info,
        ChatDelta {
            role: Some("assistant".into()),
            content: Some(String::new()),
        },
        None,
        None,
    )
}

pub fn chat_content_chunk(info: &CallInfo, content: String) -> ChatCompletionChunk {
    chat_chunk(
        info,
        ChatDelta {
            role: None,
            content: Some(content),
        },
        None,
        None,
    )
}

pub fn chat_stop_chunk(info: &CallInfo, usage: Option<Usage>) -> ChatCompletionChunk {
    chat_chunk(info, ChatDelta::default(), Some("stop"), usage)
}

pub fn completion_response(
    info: &CallInfo,
    text: String,
    usage: Option<Usage>,
) -> CompletionResponse {
    completion_chunk(info, text, Some("stop"), usage)
}

/// Streamed completion events share the response shape.
pub fn completion_chunk(
    info: &CallInfo,
    text: String,
    finish_reason: Option<&str>,
    usage: Option<Usage>,
) -> CompletionResponse {
    CompletionResponse {
        id: info.id.clone(),
        object: "text_completion".into(),
        created: info.created,
        model: info.model.clone(),
        choices: vec![CompletionChoice {
            text,
            index: 0,
            finish_reason: finish_reason.map(str::to_string),
        }],
        usage,
    }
}
