//! `{{token}}` substitution.
//!
//! Deliberately limited: dot-walk lookups into step outputs and input data,
//! plus `execution.timestamp` and `template.<name>`. No arithmetic, no
//! function calls, no array indexing. Missing references expand to the empty
//! string with a warning; explicit `null` values also expand empty but stay
//! silent (they are intentionally empty, not missing).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").expect("static regex"))
}

/// The substitution environment: step outputs by name, the workflow's input
/// data, an execution timestamp, and optional template texts.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionEnv {
    outputs: BTreeMap<String, Value>,
    input_data: Value,
    timestamp: String,
    templates: BTreeMap<String, String>,
}

impl SubstitutionEnv {
    pub fn new(input_data: Value) -> Self {
        Self {
            outputs: BTreeMap::new(),
            input_data,
            timestamp: chrono::Utc::now().to_rfc3339(),
            templates: BTreeMap::new(),
        }
    }

    pub fn with_templates(mut self, templates: BTreeMap<String, String>) -> Self {
        self.templates = templates;
        self
    }

    /// Records one step's output under its output name.
    pub fn insert(&mut self, name: &str, value: Value) {
        self.outputs.insert(name.to_string(), value);
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn input_data(&self) -> &Value {
        &self.input_data
    }

    /// Resolves one dotted token to a value, or `None` when the root or any
    /// path segment is missing.
    pub fn resolve(&self, token: &str) -> Option<Value> {
        let mut parts = token.split('.');
        let root = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        match root {
            "input_data" => walk(&self.input_data, &rest),
            "execution" => match rest.as_slice() {
                ["timestamp"] => Some(Value::String(self.timestamp.clone())),
                _ => None,
            },
            "template" => match rest.as_slice() {
                [name] => self
                    .templates
                    .get(*name)
                    .map(|text| Value::String(text.clone())),
                _ => None,
            },
            step => {
                let value = self.outputs.get(step)?;
                walk(value, &rest)
            }
        }
    }
}

fn walk(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// Renders a resolved value into template text: strings verbatim, `null`
/// empty, everything else compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expands every `{{token}}` in `template` against `env`.
pub fn substitute(template: &str, env: &SubstitutionEnv) -> String {
    token_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = &caps[1];
            match env.resolve(token) {
                Some(value) => render_value(&value),
                None => {
                    warn!(%token, "unresolved substitution token; expanding empty");
                    String::new()
                }
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> SubstitutionEnv {
        let mut env = SubstitutionEnv::new(json!({"city": "Oslo", "nested": {"k": "v"}}));
        env.insert("fetch", json!("raw text"));
        env.insert(
            "analyze",
            json!({"verdict": "ok", "scores": {"accuracy": 9}}),
        );
        env.insert("maybe", Value::Null);
        env
    }

    #[test]
    fn plain_step_output() {
        assert_eq!(substitute("result: {{fetch}}", &env()), "result: raw text");
    }

    #[test]
    fn dot_walk_into_step_output_and_input_data() {
        let env = env();
        assert_eq!(substitute("{{analyze.verdict}}", &env), "ok");
        assert_eq!(substitute("{{analyze.scores.accuracy}}", &env), "9");
        assert_eq!(substitute("{{input_data.city}}", &env), "Oslo");
        assert_eq!(substitute("{{input_data.nested.k}}", &env), "v");
    }

    #[test]
    fn missing_reference_expands_empty() {
        let env = env();
        assert_eq!(substitute("[{{ghost}}]", &env), "[]");
        assert_eq!(substitute("[{{analyze.nope.deeper}}]", &env), "[]");
    }

    #[test]
    fn explicit_null_expands_empty() {
        assert_eq!(substitute("[{{maybe}}]", &env()), "[]");
    }

    #[test]
    fn no_residual_braces_for_resolved_keys() {
        let out = substitute("{{fetch}} and {{analyze.verdict}}", &env());
        assert!(!out.contains("{{"));
        assert_eq!(out, "raw text and ok");
    }

    #[test]
    fn non_string_values_render_as_compact_json() {
        let mut env = SubstitutionEnv::new(Value::Null);
        env.insert("list", json!([1, 2, 3]));
        assert_eq!(substitute("{{list}}", &env), "[1,2,3]");
    }

    #[test]
    fn execution_timestamp_is_rfc3339() {
        let out = substitute("{{execution.timestamp}}", &env());
        assert!(chrono::DateTime::parse_from_rfc3339(&out).is_ok());
    }

    #[test]
    fn template_lookup() {
        let env = SubstitutionEnv::new(Value::Null).with_templates(
            [("greeting".to_string(), "Hello there".to_string())].into(),
        );
        assert_eq!(substitute("{{template.greeting}}", &env), "Hello there");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        assert_eq!(substitute("{{ fetch }}", &env()), "raw text");
    }
}
