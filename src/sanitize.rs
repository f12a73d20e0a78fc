//! Cleanup of accumulated model output before it reaches the caller.
//!
//! The backend interleaves reasoning traces (`<think>...</think>`) with the
//! visible answer, may wrap the answer in `<response>` tags, and tends to run
//! on into the next conversation turn. `clean` removes all three.

use once_cell::sync::Lazy;
use regex::Regex;

/// Trailing artifacts the model emits when it starts writing the next turn.
/// Each is compared in its trimmed form; entries that trim to nothing are
/// skipped.
pub const ANTI_PROMPTS: &[&str] = &["User:", "User:\n", "\n\n\n", "###"];

static THINK_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think-span pattern is valid"));

/// Clean raw accumulated output.
///
/// In order:
/// 1. drop every non-overlapping `<think>...</think>` span (multi-line too)
/// 2. drop literal `<response>` / `</response>` tags, keeping their content
/// 3. trim trailing whitespace
/// 4. for each anti-prompt, in order, strip one trailing occurrence and trim again
///
/// Step 4 is a single pass per pattern, not a fixpoint.
pub fn clean(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let without_think = THINK_SPAN.replace_all(raw, "");
    let unwrapped = without_think
        .replace("<response>", "")
        .replace("</response>", "");

    let mut cleaned = unwrapped.trim_end().to_string();
    for anti_prompt in ANTI_PROMPTS {
        let pattern = anti_prompt.trim();
        if pattern.is_empty() {
            continue;
        }
        if let Some(stripped) = cleaned.strip_suffix(pattern) {
            cleaned = stripped.trim_end().to_string();
        }
    }
    cleaned
}
