//! Response parsing for batched calls.
//!
//! Models are asked for `{"items": [{"id": ..., "<text field>": ...}]}`.
//! One round of tolerant repair is applied before giving up: markdown
//! fences stripped, trailing commas removed, curly quotes straightened.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::{LlmErrorKind, LocPipeError, Result};

/// Strip a single ```...``` fence wrapping the whole payload.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// One-shot JSON repair: fences, trailing commas, curly quotes.
pub fn repair_json(text: &str) -> String {
    let stripped = strip_fences(text);
    let mut out = String::with_capacity(stripped.len());
    let mut chars = stripped.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{201c}' | '\u{201d}' => out.push('"'),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            ',' => {
                // Drop a comma that only precedes a closing bracket.
                let mut lookahead = chars.clone();
                let mut next_meaningful = None;
                for n in lookahead.by_ref() {
                    if !n.is_whitespace() {
                        next_meaningful = Some(n);
                        break;
                    }
                }
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    continue;
                }
                out.push(',');
            }
            other => out.push(other),
        }
    }
    out
}

/// Parse a batched response into `id -> text`.
///
/// The response must carry every expected id unless `partial_match` is
/// set; a response matching none of the ids is a parse failure either
/// way. Parse failures are retryable.
pub fn parse_items(
    text: &str,
    expected_ids: &[String],
    partial_match: bool,
) -> Result<HashMap<String, String>> {
    let value: Value = serde_json::from_str(text)
        .or_else(|_| serde_json::from_str(&repair_json(text)))
        .map_err(|e| {
            LocPipeError::llm(
                LlmErrorKind::Parse,
                format!("response is not valid JSON: {}", e),
                None,
            )
        })?;

    let items = value
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            LocPipeError::llm(LlmErrorKind::Parse, "response has no 'items' array", None)
        })?;

    let mut out = HashMap::new();
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let Some(id) = obj.get("id").map(value_to_id) else {
            continue;
        };
        // The payload is the first non-id string field; structured
        // payloads (e.g. review issue lists) are carried as JSON text.
        let payload = obj
            .iter()
            .find(|(k, v)| k.as_str() != "id" && v.is_string())
            .and_then(|(_, v)| v.as_str().map(String::from))
            .or_else(|| {
                obj.iter()
                    .find(|(k, _)| k.as_str() != "id")
                    .map(|(_, v)| v.to_string())
            });
        if let Some(payload) = payload {
            out.insert(id, payload);
        }
    }

    let expected: HashSet<&str> = expected_ids.iter().map(String::as_str).collect();
    let missing: Vec<&str> = expected
        .iter()
        .filter(|id| !out.contains_key(**id))
        .copied()
        .collect();

    if !missing.is_empty() && !partial_match {
        return Err(LocPipeError::llm(
            LlmErrorKind::Parse,
            format!("response missing ids: {}", missing.join(", ")),
            None,
        ));
    }
    if !expected.is_empty() && expected.iter().all(|id| !out.contains_key(*id)) {
        return Err(LocPipeError::llm(
            LlmErrorKind::Parse,
            "response matched none of the requested ids",
            None,
        ));
    }

    // Only surface the ids that were asked for.
    out.retain(|k, _| expected.contains(k.as_str()));
    Ok(out)
}

fn value_to_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_clean_response() {
        let text = r#"{"items": [{"id": "A", "target_text": "привет"}, {"id": "B", "target_text": "пока"}]}"#;
        let out = parse_items(text, &ids(&["A", "B"]), false).unwrap();
        assert_eq!(out["A"], "привет");
        assert_eq!(out["B"], "пока");
    }

    #[test]
    fn test_parse_strips_markdown_fences() {
        let text = "```json\n{\"items\": [{\"id\": \"A\", \"text\": \"ok\"}]}\n```";
        let out = parse_items(text, &ids(&["A"]), false).unwrap();
        assert_eq!(out["A"], "ok");
    }

    #[test]
    fn test_parse_repairs_trailing_comma() {
        let text = r#"{"items": [{"id": "A", "text": "ok"},]}"#;
        let out = parse_items(text, &ids(&["A"]), false).unwrap();
        assert_eq!(out["A"], "ok");
    }

    #[test]
    fn test_parse_repairs_curly_quotes() {
        let text = "{\u{201c}items\u{201d}: [{\u{201c}id\u{201d}: \u{201c}A\u{201d}, \u{201c}text\u{201d}: \u{201c}ok\u{201d}}]}";
        let out = parse_items(text, &ids(&["A"]), false).unwrap();
        assert_eq!(out["A"], "ok");
    }

    #[test]
    fn test_missing_id_fails_without_partial_match() {
        let text = r#"{"items": [{"id": "A", "text": "ok"}]}"#;
        let err = parse_items(text, &ids(&["A", "B"]), false).unwrap_err();
        assert!(matches!(
            err,
            LocPipeError::Llm {
                kind: LlmErrorKind::Parse,
                retryable: true,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_id_allowed_with_partial_match() {
        let text = r#"{"items": [{"id": "A", "text": "ok"}]}"#;
        let out = parse_items(text, &ids(&["A", "B"]), true).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["A"], "ok");
    }

    #[test]
    fn test_superset_response_filtered_to_expected() {
        let text = r#"{"items": [{"id": "A", "text": "ok"}, {"id": "Z", "text": "stray"}]}"#;
        let out = parse_items(text, &ids(&["A"]), false).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!out.contains_key("Z"));
    }

    #[test]
    fn test_numeric_ids_coerced() {
        let text = r#"{"items": [{"id": 7, "text": "ok"}]}"#;
        let out = parse_items(text, &ids(&["7"]), false).unwrap();
        assert_eq!(out["7"], "ok");
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = parse_items("not json at all", &ids(&["A"]), false).unwrap_err();
        assert!(matches!(
            err,
            LocPipeError::Llm {
                kind: LlmErrorKind::Parse,
                ..
            }
        ));
    }

    #[test]
    fn test_no_items_key_is_parse_error() {
        let err = parse_items(r#"{"rows": []}"#, &ids(&["A"]), false).unwrap_err();
        assert!(err.to_string().contains("items"));
    }

    #[test]
    fn test_empty_match_with_partial_still_fails() {
        let text = r#"{"items": [{"id": "Z", "text": "stray"}]}"#;
        let err = parse_items(text, &ids(&["A"]), true).unwrap_err();
        assert!(matches!(
            err,
            LocPipeError::Llm {
                kind: LlmErrorKind::Parse,
                ..
            }
        ));
    }

    #[test]
    fn test_structured_payload_carried_as_json_text() {
        let text = r#"{"items": [{"id": "A", "issues": [{"type": "style", "severity": "minor"}]}]}"#;
        let out = parse_items(text, &ids(&["A"]), false).unwrap();
        let issues: Value = serde_json::from_str(&out["A"]).unwrap();
        assert_eq!(issues[0]["type"], "style");
    }

    #[test]
    fn test_repair_json_preserves_interior_commas() {
        let repaired = repair_json(r#"{"a": [1, 2, 3], "b": "x, y"}"#);
        let v: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["a"].as_array().unwrap().len(), 3);
        assert_eq!(v["b"], "x, y");
    }

    #[test]
    fn test_strip_fences_without_language_tag() {
        assert_eq!(strip_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_fences("{}"), "{}");
    }
}
