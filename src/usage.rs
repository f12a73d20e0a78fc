//! Token usage derivation.
//!
//! The backend reports counts per session, not per request, so the prompt
//! share is always derived by subtraction. Results are not clamped: if the
//! backend's counters disagree the prompt count comes out negative and is
//! reported that way.

use crate::backend::{ResponseChunk, SessionStats};
use crate::models::Usage;

/// Usage from a session-stats query.
pub fn from_session_stats(stats: Option<&SessionStats>) -> Option<Usage> {
    let stats = stats?;
    let completion = stats.last_message_token_count;
    let total = stats.session_token_count;
    Some(Usage {
        prompt_tokens: total - completion,
        completion_tokens: completion,
        total_tokens: total,
    })
}

/// Usage from the inline counters of the last streamed chunk.
///
/// A chunk whose session counter is zero carries no counters at all.
pub fn from_last_chunk(chunk: Option<&ResponseChunk>) -> Option<Usage> {
    let chunk = chunk?;
    if chunk.session_token_count == 0 {
        return None;
    }
    Some(Usage {
        prompt_tokens: chunk.session_token_count - chunk.message_token_count,
        completion_tokens: chunk.message_token_count,
        total_tokens: chunk.session_token_count,
    })
}
