//! Model-output JSON recovery.
//!
//! Models are asked for strict JSON but routinely wrap it in markdown
//! fences or prose. One shared utility implements the recovery ladder used
//! by the decomposer, summarizer, reasoner, and enumerator: strict parse,
//! then fence trimming, then extraction of the first balanced `{...}`
//! block. Anything past that is a parse error.

use serde_json::Value;

use crate::error::{NexusError, NexusResult};

/// Parse model output as JSON, recovering from common wrapping.
pub fn parse_json_or_extract(text: &str) -> NexusResult<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let unfenced = strip_markdown_fences(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Ok(value);
    }

    if let Some(block) = extract_first_object(unfenced) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return Ok(value);
        }
    }

    Err(NexusError::Parse(format!(
        "model output is not JSON (first 120 chars: {:?})",
        trimmed.chars().take(120).collect::<String>()
    )))
}

/// Remove enclosing ```json / ``` fences when present.
pub fn strip_markdown_fences(text: &str) -> &str {
    let mut out = text.trim();
    if let Some(rest) = out.strip_prefix("```json") {
        out = rest;
    } else if let Some(rest) = out.strip_prefix("```") {
        out = rest;
    }
    if let Some(rest) = out.strip_suffix("```") {
        out = rest;
    }
    out.trim()
}

/// Locate the first balanced top-level `{...}` block, ignoring braces
/// inside string literals.
fn extract_first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_json_passes_through() {
        let value = parse_json_or_extract(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_fenced_json_is_recovered() {
        let text = "```json\n{\"subspaces\": []}\n```";
        let value = parse_json_or_extract(text).unwrap();
        assert_eq!(value, json!({"subspaces": []}));
    }

    #[test]
    fn test_bare_fence_is_recovered() {
        let text = "```\n{\"x\": true}\n```";
        assert_eq!(parse_json_or_extract(text).unwrap(), json!({"x": true}));
    }

    #[test]
    fn test_prose_wrapped_object_is_extracted() {
        let text = "Here is the decomposition you asked for:\n{\"title\": \"AI\", \"subtopics\": []}\nLet me know if you need more.";
        let value = parse_json_or_extract(text).unwrap();
        assert_eq!(value["title"], json!("AI"));
    }

    #[test]
    fn test_braces_inside_strings_do_not_break_extraction() {
        let text = "note: {\"text\": \"uses { and } freely\", \"n\": 2} trailing";
        let value = parse_json_or_extract(text).unwrap();
        assert_eq!(value["n"], json!(2));
    }

    #[test]
    fn test_nested_objects_extract_whole_block() {
        let text = "x {\"a\": {\"b\": {\"c\": 3}}} y";
        let value = parse_json_or_extract(text).unwrap();
        assert_eq!(value["a"]["b"]["c"], json!(3));
    }

    #[test]
    fn test_non_json_is_a_parse_error() {
        let result = parse_json_or_extract("not json");
        assert!(matches!(result, Err(NexusError::Parse(_))));
    }

    #[test]
    fn test_unbalanced_object_is_a_parse_error() {
        let result = parse_json_or_extract("{\"a\": 1");
        assert!(matches!(result, Err(NexusError::Parse(_))));
    }
}
