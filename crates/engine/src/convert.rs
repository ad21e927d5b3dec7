//! Conversion of raw agent responses into structured stage outputs.

use serde_json::{json, Value};

/// Finds the JSON document in an agent response.
///
/// Agents usually answer in markdown. In order of preference the document is
/// taken from a fenced json block, from a fenced block of any other language
/// whose body starts with `{` or `[`, from an unterminated json fence, or from
/// the whole text. Returns `None` if none of these parse.
pub fn find_json(raw: &str) -> Option<Value> {
    fenced_blocks(raw)
        .into_iter()
        .filter_map(|(lang, body)| {
            let body = body.trim();
            let looks_like_json = body.starts_with('{') || body.starts_with('[');
            (lang == "json" || looks_like_json).then_some((lang == "json", body))
        })
        // Prefer explicitly tagged blocks.
        .max_by_key(|(tagged, _)| *tagged)
        .and_then(|(_, body)| serde_json::from_str(body).ok())
        .or_else(|| unterminated_json_fence(raw))
        .or_else(|| serde_json::from_str(raw.trim()).ok())
}

/// Structured output of a stage: the embedded JSON document, or the raw text
/// wrapped as `{"text": ...}`.
pub fn extract_json(raw: &str) -> Value {
    find_json(raw).unwrap_or_else(|| json!({ "text": raw }))
}

/// `(language, body)` of every closed ``` fence, in order.
fn fenced_blocks(raw: &str) -> Vec<(&str, &str)> {
    let mut blocks = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(line_end) = after_open.find('\n') else {
            break;
        };
        let lang = after_open[..line_end].trim();
        let body_start = &after_open[line_end + 1..];
        let Some(close) = body_start.find("```") else {
            break;
        };
        blocks.push((lang, &body_start[..close]));
        rest = &body_start[close + 3..];
    }
    blocks
}

fn unterminated_json_fence(raw: &str) -> Option<Value> {
    let body = raw.trim().strip_prefix("```json")?;
    let body = body.trim().trim_end_matches('`').trim();
    if body.starts_with('{') || body.starts_with('[') {
        serde_json::from_str(body).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fences_are_unwrapped() {
        let raw = "Here is the plan:\n```json\n{\"is_valid\": true, \"issues\": []}\n```\nDone.";
        assert_eq!(extract_json(raw), json!({"is_valid": true, "issues": []}));
    }

    #[test]
    fn tagged_fences_win_over_untagged_ones() {
        let raw = "```\n{\"draft\": 1}\n```\n\n```json\n{\"final\": 2}\n```";
        assert_eq!(extract_json(raw), json!({"final": 2}));
    }

    #[test]
    fn untagged_fences_need_a_json_body() {
        let raw = "```python\nprint('hi')\n```\n```\n[1, 2]\n```";
        assert_eq!(extract_json(raw), json!([1, 2]));
    }

    #[test]
    fn unterminated_fences_and_bare_json_are_accepted() {
        assert_eq!(extract_json("```json\n{\"a\": 1}\n"), json!({"a": 1}));
        assert_eq!(extract_json("  {\"b\": 2}  "), json!({"b": 2}));
    }

    #[test]
    fn prose_is_wrapped_as_text() {
        let raw = "I could not produce a design.";
        assert_eq!(extract_json(raw), json!({ "text": raw }));
        assert_eq!(find_json(raw), None);
    }
}
