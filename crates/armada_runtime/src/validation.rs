//! Output conversion and validators.

use regex::Regex;
use serde_json::Value;

use armada_workflow::policy::{ConversionMethod, ValidationMethod};

use crate::error::RunError;
use crate::expression::stringify;
use crate::result::ValidationDetail;

// ─────────────────────────────────────────────────────────────────────────────
// Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Converts raw job output according to `method`.
///
/// # Errors
///
/// Returns [`RunError::Conversion`] when structured parsing fails.
pub fn convert(output: Value, method: ConversionMethod) -> Result<Value, RunError> {
    match method {
        ConversionMethod::None => Ok(output),
        ConversionMethod::Text => Ok(Value::String(stringify(&output))),
        ConversionMethod::Json => match output {
            Value::String(text) => serde_json::from_str(&text)
                .map_err(|err| RunError::Conversion(format!("output is not valid JSON: {err}"))),
            structured => Ok(structured),
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validators
// ─────────────────────────────────────────────────────────────────────────────

/// Runs a validator against converted output. The returned detail is never
/// negated; the caller applies negation.
///
/// # Errors
///
/// Returns [`RunError::Validation`] for a malformed validator, such as an
/// invalid regular expression.
pub fn validate(method: &ValidationMethod, output: &Value) -> Result<ValidationDetail, RunError> {
    let (matched, missing) = match method {
        ValidationMethod::Text {
            content,
            regex,
            strip,
        } => {
            let text = stringify(output);
            let (text, content) = if *strip {
                (text.trim(), content.trim())
            } else {
                (text.as_str(), content.as_str())
            };
            let matched = if *regex {
                Regex::new(content)
                    .map_err(|err| RunError::Validation(format!("invalid pattern '{content}': {err}")))?
                    .is_match(text)
            } else {
                text.contains(content)
            };
            (matched, None)
        }
        ValidationMethod::DictEqual { reference } => (structured(output) == *reference, None),
        ValidationMethod::DictIncluded { reference } => {
            let missing = residue(reference, &structured(output));
            (missing.is_none(), missing)
        }
    };
    Ok(ValidationDetail {
        matched,
        negated: false,
        missing,
    })
}

/// Returns true if `output` contains everything `reference` describes.
#[must_use]
pub fn dict_included(output: &Value, reference: &Value) -> bool {
    residue(reference, output).is_none()
}

/// Parses textual output so structural validators can compare it.
fn structured(output: &Value) -> Value {
    match output {
        Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| output.clone()),
        other => other.clone(),
    }
}

/// Consumes `reference` against `output` and returns what was not matched,
/// or `None` when the whole reference was consumed.
///
/// Objects match key by key. List items are matched one to one: each
/// reference item consumes a distinct output item that fully contains it,
/// chosen so that as many reference items as possible are matched.
fn residue(reference: &Value, output: &Value) -> Option<Value> {
    match (reference, output) {
        (Value::Object(expected), Value::Object(actual)) => {
            let remaining: serde_json::Map<String, Value> = expected
                .iter()
                .filter_map(|(key, value)| {
                    let left = match actual.get(key) {
                        Some(found) => residue(value, found),
                        None => Some(value.clone()),
                    };
                    left.map(|left| (key.clone(), left))
                })
                .collect();
            (!remaining.is_empty()).then_some(Value::Object(remaining))
        }
        (Value::Array(expected), Value::Array(actual)) => {
            let assigned = match_items(expected, actual);
            let remaining: Vec<Value> = expected
                .iter()
                .zip(&assigned)
                .filter(|(_, slot)| slot.is_none())
                .map(|(item, _)| item.clone())
                .collect();
            (!remaining.is_empty()).then_some(Value::Array(remaining))
        }
        (Value::Number(a), Value::Number(b)) if a.as_f64() == b.as_f64() => None,
        (expected, actual) if expected == actual => None,
        (expected, _) => Some(expected.clone()),
    }
}

/// Maximum bipartite matching of reference items onto output items that
/// contain them. Returns, per reference item, the index of its output item.
fn match_items(expected: &[Value], actual: &[Value]) -> Vec<Option<usize>> {
    let fits: Vec<Vec<usize>> = expected
        .iter()
        .map(|item| {
            actual
                .iter()
                .enumerate()
                .filter(|(_, candidate)| residue(item, candidate).is_none())
                .map(|(index, _)| index)
                .collect()
        })
        .collect();

    let mut owner: Vec<Option<usize>> = vec![None; actual.len()];
    for item in 0..expected.len() {
        let mut seen = vec![false; actual.len()];
        augment(item, &fits, &mut owner, &mut seen);
    }

    let mut assigned = vec![None; expected.len()];
    for (slot, item) in owner.iter().enumerate() {
        if let Some(item) = item {
            assigned[*item] = Some(slot);
        }
    }
    assigned
}

fn augment(
    item: usize,
    fits: &[Vec<usize>],
    owner: &mut [Option<usize>],
    seen: &mut [bool],
) -> bool {
    for &slot in &fits[item] {
        if seen[slot] {
            continue;
        }
        seen[slot] = true;
        let free = match owner[slot] {
            None => true,
            Some(other) => augment(other, fits, owner, seen),
        };
        if free {
            owner[slot] = Some(item);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(content: &str, regex: bool, strip: bool) -> ValidationMethod {
        ValidationMethod::Text {
            content: content.into(),
            regex,
            strip,
        }
    }

    #[test]
    fn conversion_modes() {
        assert_eq!(convert(json!({"a": 1}), ConversionMethod::None).unwrap(), json!({"a": 1}));
        assert_eq!(convert(json!({"a": 1}), ConversionMethod::Text).unwrap(), json!(r#"{"a":1}"#));
        assert_eq!(convert(json!(r#"{"a": 1}"#), ConversionMethod::Json).unwrap(), json!({"a": 1}));
        assert!(matches!(
            convert(json!("not json"), ConversionMethod::Json),
            Err(RunError::Conversion(_))
        ));
    }

    #[test]
    fn text_substring_and_regex() {
        let output = json!("  Interface up, 0 errors  ");
        assert!(validate(&text("0 errors", false, false), &output).unwrap().matched);
        assert!(!validate(&text("down", false, false), &output).unwrap().matched);
        assert!(validate(&text(r"^Interface \w+", true, true), &output).unwrap().matched);
        assert!(!validate(&text(r"^Interface \w+", true, false), &output).unwrap().matched);
    }

    #[test]
    fn invalid_pattern_is_a_validation_error() {
        let err = validate(&text("(", true, false), &json!("x")).unwrap_err();
        assert!(matches!(err, RunError::Validation(_)));
    }

    #[test]
    fn dict_equal_parses_text_output() {
        let method = ValidationMethod::DictEqual {
            reference: json!({"status": "ok"}),
        };
        assert!(validate(&method, &json!(r#"{"status": "ok"}"#)).unwrap().matched);
        assert!(!validate(&method, &json!({"status": "ok", "extra": 1})).unwrap().matched);
    }

    #[test]
    fn inclusion_reports_missing_entries() {
        let reference = json!({"interfaces": [{"name": "eth0", "up": true}], "vendor": "acme"});
        let output = json!({"interfaces": [{"name": "eth1", "up": true}], "vendor": "acme"});
        let method = ValidationMethod::DictIncluded {
            reference: reference.clone(),
        };
        let detail = validate(&method, &output).unwrap();
        assert!(!detail.matched);
        assert_eq!(
            detail.missing,
            Some(json!({"interfaces": [{"name": "eth0", "up": true}]}))
        );
    }

    #[test]
    fn inclusion_consumes_list_items_once() {
        let reference = json!([1, 1]);
        assert!(!dict_included(&json!([1, 2]), &reference));
        assert!(dict_included(&json!([2, 1, 1]), &reference));
    }

    #[test]
    fn empty_items_do_not_steal_specific_matches() {
        let document = json!({"ifaces": [{"name": "eth0"}, {}, {"name": "eth1"}]});
        assert!(dict_included(&document, &document));
        let nested = json!({"a": [0, {}, {"a": 0}]});
        assert!(dict_included(&nested, &nested));
        assert!(dict_included(&json!([{"a": 1}, {}]), &json!([{}, {"a": 1}])));
        assert!(!dict_included(&json!([{"a": 1}]), &json!([{}, {"a": 1}])));
    }
}
