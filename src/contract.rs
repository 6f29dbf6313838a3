//! Reduction of free-form stage output to structured values.
//!
//! Models wrap JSON in code fences or prose. [`extract_candidate`] applies a
//! fixed rule: strip the surrounding fence markers and whitespace, then take
//! the span from the first `{` to the last `}` when both exist in that
//! order, otherwise the whole trimmed text. The candidate is then parsed
//! strictly and checked against the stage's [`OutputKind`].

use serde_json::Value;

use crate::error::PipelineError;
use crate::stage::OutputKind;

const FENCE: &str = "```";

/// The substring of `raw` that should hold the stage's JSON.
pub fn extract_candidate(raw: &str) -> &str {
    let text = strip_fences(raw);
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix(FENCE) {
        // Drop the info string ("json", "JSON", ...) that follows the opening fence.
        text = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix(FENCE) {
        text = rest;
    }
    text.trim()
}

/// Parse one stage's raw output according to its expected kind.
pub fn parse_stage_output(
    stage: &str,
    kind: &OutputKind,
    raw: &str,
    excerpt_chars: usize,
) -> Result<Value, PipelineError> {
    let required = match kind {
        OutputKind::FreeText => return Ok(Value::String(raw.trim().to_string())),
        OutputKind::Json { required } => required,
    };

    let fail = |reason: String| PipelineError::StageParse {
        stage: stage.to_string(),
        reason,
        excerpt: excerpt(raw, excerpt_chars),
    };

    if raw.trim().is_empty() {
        return Err(fail("empty output".into()));
    }

    let value: Value = serde_json::from_str(extract_candidate(raw))
        .map_err(|e| fail(format!("invalid JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| fail("expected a JSON object".into()))?;
    let missing: Vec<&str> = required
        .iter()
        .map(String::as_str)
        .filter(|key| !object.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(fail(format!("missing keys: {}", missing.join(", "))));
    }

    Ok(value)
}

/// The first `max_chars` characters of `raw` on a single line.
pub fn excerpt(raw: &str, max_chars: usize) -> String {
    let flat: String = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = flat.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
