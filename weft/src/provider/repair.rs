//! Tool-argument JSON repair.
//!
//! Streamed tool arguments sometimes arrive truncated (trailing comma,
//! unclosed object, or nothing at all). Repair is only attempted after a
//! strict parse failed; the original is kept alongside the repaired form in
//! the logs.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static regex"))
}

/// Whether `input` parses as JSON.
pub fn is_valid_json(input: &str) -> bool {
    serde_json::from_str::<serde::de::IgnoredAny>(input).is_ok()
}

/// Applies the repair transformations unconditionally: trims whitespace,
/// strips trailing commas, closes an unclosed object, and maps empty input
/// to `{}`. Idempotent on its own output.
pub fn repair_json(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    let mut repaired = trailing_comma_re().replace_all(trimmed, "$1").into_owned();
    while repaired.ends_with(',') {
        repaired.pop();
        repaired.truncate(repaired.trim_end().len());
    }
    let opens = repaired.matches('{').count();
    let closes = repaired.matches('}').count();
    for _ in closes..opens {
        repaired.push('}');
    }
    repaired
}

/// Returns parseable JSON for `input`: the input itself when valid, the
/// repaired form when the repair succeeds, `{}` as the last resort.
pub fn validate_or_repair(input: &str) -> String {
    if is_valid_json(input) && !input.trim().is_empty() {
        return input.to_string();
    }
    let repaired = repair_json(input);
    if is_valid_json(&repaired) {
        debug!(original = %input, repaired = %repaired, "repaired tool-call JSON");
        return repaired;
    }
    warn!(original = %input, "tool-call JSON unrepairable; substituting empty object");
    "{}".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_json_passes_through_unchanged() {
        let input = r#"{"q": "hi"}"#;
        assert_eq!(validate_or_repair(input), input);
    }

    #[test]
    fn empty_input_becomes_empty_object() {
        assert_eq!(validate_or_repair(""), "{}");
        assert_eq!(validate_or_repair("   "), "{}");
    }

    #[test]
    fn trailing_comma_is_stripped() {
        assert_eq!(validate_or_repair(r#"{"a": 1,}"#), r#"{"a": 1}"#);
        assert_eq!(validate_or_repair(r#"{"a": [1, 2,]}"#), r#"{"a": [1, 2]}"#);
    }

    #[test]
    fn unclosed_object_is_closed() {
        assert_eq!(validate_or_repair(r#"{"path": "/x""#), r#"{"path": "/x"}"#);
        assert_eq!(
            validate_or_repair(r#"{"outer": {"inner": 1"#),
            r#"{"outer": {"inner": 1}}"#
        );
    }

    #[test]
    fn trailing_comma_then_unclosed() {
        assert_eq!(validate_or_repair(r#"{"a": 1,"#), r#"{"a": 1}"#);
    }

    #[test]
    fn repair_is_idempotent_on_repairable_shapes() {
        for input in [r#"{"a": 1,}"#, r#"{"a": 1"#, "", r#"{"b": [1,]"#] {
            let once = repair_json(input);
            let twice = repair_json(&once);
            assert_eq!(once, twice, "second repair changed {input:?}");
        }
    }

    #[test]
    fn repair_preserves_already_valid_input_modulo_whitespace() {
        let input = r#"  {"a": 1}  "#;
        assert_eq!(repair_json(input), r#"{"a": 1}"#);
    }

    #[test]
    fn unrepairable_input_degrades_to_empty_object() {
        assert_eq!(validate_or_repair("][not json"), "{}");
    }
}
