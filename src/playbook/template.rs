//! `{{path}}` template rendering and context path lookup.
//!
//! The run context is a JSON object shaped as
//! `{"inputs": {..}, "steps": {id: output}, "loop": {..}}`. Paths are dotted;
//! a bare name that is not one of the roots resolves against `inputs` first,
//! then `steps`.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_\-\.\[\]]+)(\?)?\s*\}\}").expect("placeholder regex is valid")
});

const ROOTS: &[&str] = &["inputs", "steps", "loop", "out"];

/// Resolve a dotted path against the context.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let first = path.split('.').next().unwrap_or_default();
    if ROOTS.contains(&first) {
        return walk(context, path);
    }
    walk(context, &format!("inputs.{}", path)).or_else(|| walk(context, &format!("steps.{}", path)))
}

fn walk<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a JSON value as template text.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Placeholders referenced by a template, as `(path, optional)`.
pub fn placeholders(template: &str) -> Vec<(String, bool)> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| (c[1].to_string(), c.get(2).is_some()))
        .collect()
}

/// Render `template` against `context`.
///
/// Fails with the list of required placeholders that did not resolve.
pub fn render(template: &str, context: &Value) -> Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
        let path = &caps[1];
        let optional = caps.get(2).is_some();
        match lookup(context, path) {
            Some(value) if !value.is_null() => render_value(value),
            _ => {
                if !optional {
                    missing.push(path.to_string());
                }
                String::new()
            }
        }
    });
    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        missing.dedup();
        Err(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "inputs": {"topic": "rust", "count": 3},
            "steps": {"A": "draft text", "B": {"content": "answer", "items": ["x", "y"]}},
            "loop": {"iteration": 2}
        })
    }

    #[test]
    fn test_lookup_roots_and_bare_names() {
        let ctx = context();
        assert_eq!(lookup(&ctx, "inputs.topic"), Some(&json!("rust")));
        assert_eq!(lookup(&ctx, "topic"), Some(&json!("rust")));
        assert_eq!(lookup(&ctx, "B.content"), Some(&json!("answer")));
        assert_eq!(lookup(&ctx, "steps.B.items.1"), Some(&json!("y")));
        assert_eq!(lookup(&ctx, "loop.iteration"), Some(&json!(2)));
        assert_eq!(lookup(&ctx, "nothing.here"), None);
    }

    #[test]
    fn test_render_resolves_values() {
        let out = render("Write {{count}} notes on {{ topic }} using {{steps.A}}", &context()).unwrap();
        assert_eq!(out, "Write 3 notes on rust using draft text");
    }

    #[test]
    fn test_render_reports_missing_required() {
        let err = render("{{topic}} {{audience}} {{tone}}", &context()).unwrap_err();
        assert_eq!(err, vec!["audience".to_string(), "tone".to_string()]);
    }

    #[test]
    fn test_optional_placeholder_renders_empty() {
        let out = render("[{{audience?}}]", &context()).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_placeholders_listing() {
        let found = placeholders("{{a}} and {{b?}}");
        assert_eq!(found, vec![("a".to_string(), false), ("b".to_string(), true)]);
    }
}
