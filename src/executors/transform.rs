//! `transform` steps: declarative reshaping of prior results.
//!
//! Operations run in order and each writes one field of the output object.
//! Later operations can read earlier fields through `out.<field>`.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{StepContext, StepExecutor, StepOutcome, StepOutput, step_error};
use crate::errors::{EngineError, EngineResult};
use crate::playbook::template::{self, lookup, render_value};
use crate::playbook::{TransformConfig, TransformOp};
use crate::util::extract_json_value;

pub struct TransformExecutor;

impl TransformExecutor {
    /// Apply `config` to `values`, returning the output object.
    pub fn apply(step_id: &str, config: &TransformConfig, values: &Value) -> EngineResult<Value> {
        let mut scope = values.clone();
        if let Value::Object(map) = &mut scope {
            map.insert("out".to_string(), Value::Object(Map::new()));
        }

        for op in &config.operations {
            let (field, value) = apply_op(step_id, op, &scope)?;
            if let Some(Value::Object(out)) = scope.get_mut("out") {
                out.insert(field, value);
            }
        }

        Ok(scope
            .get_mut("out")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }
}

#[async_trait]
impl StepExecutor for TransformExecutor {
    type Config = TransformConfig;

    async fn execute(
        &self,
        step_id: &str,
        config: &TransformConfig,
        ctx: &StepContext<'_>,
    ) -> EngineResult<StepOutcome> {
        let output = Self::apply(step_id, config, ctx.values)?;
        Ok(StepOutcome::Completed(StepOutput::free(output)))
    }
}

fn read_path<'a>(step_id: &str, scope: &'a Value, path: &str) -> EngineResult<&'a Value> {
    lookup(scope, path).ok_or_else(|| step_error(step_id, format!("path '{}' not found", path)))
}

fn apply_op(step_id: &str, op: &TransformOp, scope: &Value) -> EngineResult<(String, Value)> {
    let read = |path: &str| read_path(step_id, scope, path);
    let text = |path: &str| read(path).map(render_value);

    let result = match op {
        TransformOp::Set { field, template } => {
            let rendered = template::render(template, scope).map_err(|missing| {
                step_error(
                    step_id,
                    format!("unresolved template variables: {}", missing.join(", ")),
                )
            })?;
            (field.clone(), Value::String(rendered))
        }
        TransformOp::Pick { field, path } => (field.clone(), read(path)?.clone()),
        TransformOp::Json { field, path } => {
            let parsed = match read(path)? {
                Value::String(s) => parse_json_text(step_id, path, s)?,
                other => other.clone(),
            };
            (field.clone(), parsed)
        }
        TransformOp::Split {
            field,
            path,
            separator,
        } => {
            let parts = text(path)?
                .split(separator.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect();
            (field.clone(), Value::Array(parts))
        }
        TransformOp::Join {
            field,
            path,
            separator,
        } => {
            let joined = match read(path)? {
                Value::Array(items) => items
                    .iter()
                    .map(render_value)
                    .collect::<Vec<_>>()
                    .join(separator.as_str()),
                other => render_value(other),
            };
            (field.clone(), Value::String(joined))
        }
        TransformOp::Upper { field, path } => (field.clone(), Value::String(text(path)?.to_uppercase())),
        TransformOp::Lower { field, path } => (field.clone(), Value::String(text(path)?.to_lowercase())),
        TransformOp::Trim { field, path } => (field.clone(), Value::String(text(path)?.trim().to_string())),
        TransformOp::Length { field, path } => {
            let len = match read(path)? {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                Value::Null => 0,
                other => render_value(other).chars().count(),
            };
            (field.clone(), Value::from(len))
        }
    };
    Ok(result)
}

fn parse_json_text(step_id: &str, path: &str, text: &str) -> Result<Value, EngineError> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        return Ok(value);
    }
    extract_json_value(text)
        .ok_or_else(|| step_error(step_id, format!("no JSON found at '{}'", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(ops: Value) -> TransformConfig {
        serde_json::from_value(json!({ "operations": ops })).unwrap()
    }

    fn context() -> Value {
        json!({
            "inputs": {"name": "Ada"},
            "steps": {
                "B": {"content": "Here:\n```json\n{\"items\": [\"a\", \"b\"]}\n```"},
                "list": "one, two,, three"
            }
        })
    }

    #[test]
    fn test_operations_chain_through_out() {
        let cfg = config(json!([
            {"op": "json", "field": "parsed", "path": "steps.B.content"},
            {"op": "pick", "field": "items", "path": "out.parsed.items"},
            {"op": "join", "field": "joined", "path": "out.items", "separator": "+"},
            {"op": "length", "field": "count", "path": "out.items"},
            {"op": "set", "field": "greeting", "template": "Hi {{name}}, {{out.count}} items"},
            {"op": "upper", "field": "shout", "path": "out.greeting"}
        ]));
        let out = TransformExecutor::apply("D", &cfg, &context()).unwrap();
        assert_eq!(out["items"], json!(["a", "b"]));
        assert_eq!(out["joined"], "a+b");
        assert_eq!(out["count"], 2);
        assert_eq!(out["greeting"], "Hi Ada, 2 items");
        assert_eq!(out["shout"], "HI ADA, 2 ITEMS");
    }

    #[test]
    fn test_split_drops_empty_parts() {
        let cfg = config(json!([
            {"op": "split", "field": "parts", "path": "steps.list", "separator": ","},
            {"op": "trim", "field": "first", "path": "out.parts.0"},
            {"op": "lower", "field": "name", "path": "name"}
        ]));
        let out = TransformExecutor::apply("D", &cfg, &context()).unwrap();
        assert_eq!(out["parts"], json!(["one", "two", "three"]));
        assert_eq!(out["first"], "one");
        assert_eq!(out["name"], "ada");
    }

    #[test]
    fn test_missing_path_is_fatal() {
        let cfg = config(json!([{"op": "pick", "field": "x", "path": "steps.nope"}]));
        let err = TransformExecutor::apply("D", &cfg, &context()).unwrap_err();
        assert!(matches!(err, EngineError::StepExecution { ref message, .. } if message.contains("steps.nope")));
    }

    #[test]
    fn test_json_without_payload_fails() {
        let cfg = config(json!([{"op": "json", "field": "x", "path": "name"}]));
        assert!(TransformExecutor::apply("D", &cfg, &context()).is_err());
    }
}
