//! Shared helpers for reading structured data out of model output.

use serde_json::Value;

/// Extract the first JSON object or array embedded in free-form model output.
///
/// Handles fenced code blocks and prose around the payload. Brace counting is
/// string-aware so braces inside JSON strings do not end the scan early.
pub fn extract_json_value(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    let start = text.find(['{', '['])?;
    let open = text[start..].chars().next()?;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let candidate = &text[start..start + i + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }

    None
}

/// Look up a numeric field in a JSON object, accepting numbers encoded as strings.
pub fn number_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_plain_object() {
        let value = extract_json_value(r#"{"score": 82}"#).unwrap();
        assert_eq!(value, json!({"score": 82}));
    }

    #[test]
    fn test_extract_with_prose_and_fence() {
        let text = "Here is my review:\n```json\n{\"score\": 71, \"notes\": \"ok\"}\n```\nThanks";
        let value = extract_json_value(text).unwrap();
        assert_eq!(value["score"], json!(71));
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"Result: {"notes": "use {curly} braces", "score": 90} trailing }"#;
        let value = extract_json_value(text).unwrap();
        assert_eq!(value["notes"], json!("use {curly} braces"));
    }

    #[test]
    fn test_extract_array() {
        let value = extract_json_value("items: [1, 2, 3]").unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn test_no_json() {
        assert!(extract_json_value("No JSON here").is_none());
        assert!(extract_json_value(r#"{"key": "value""#).is_none());
    }

    #[test]
    fn test_number_field_accepts_strings() {
        let value = json!({"a": 4.5, "b": "70", "c": true});
        assert_eq!(number_field(&value, "a"), Some(4.5));
        assert_eq!(number_field(&value, "b"), Some(70.0));
        assert_eq!(number_field(&value, "c"), None);
        assert_eq!(number_field(&value, "missing"), None);
    }
}
