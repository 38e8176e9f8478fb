use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::{get, parse_path, resolve};
use crate::RewriteError;

/// Comparison applied to a path before an operation runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionOperation {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub invert: bool,
    #[serde(default)]
    pub pass_missing_key: bool,
}

/// Evaluate a condition list under AND/OR logic (OR when unspecified).
/// An empty list always passes.
pub fn check_conditions(
    doc: &Value,
    conditions: &[ConditionOperation],
    logic: &str,
) -> Result<bool, RewriteError> {
    if conditions.is_empty() {
        return Ok(true);
    }
    let and = logic.eq_ignore_ascii_case("AND");
    for condition in conditions {
        let hit = check_single(doc, condition)?;
        if and && !hit {
            return Ok(false);
        }
        if !and && hit {
            return Ok(true);
        }
    }
    Ok(and)
}

fn check_single(doc: &Value, condition: &ConditionOperation) -> Result<bool, RewriteError> {
    let current = resolve(doc, &parse_path(&condition.path))
        .and_then(|segments| get(doc, &segments).cloned());
    let Some(current) = current else {
        // Missing key short-circuits; invert does not apply here.
        return Ok(condition.pass_missing_key);
    };

    let mode = condition.mode.to_ascii_lowercase();
    let result = match mode.as_str() {
        "full" => compare_equal(&current, &condition.value),
        "prefix" => as_text(&current).starts_with(&as_text(&condition.value)),
        "suffix" => as_text(&current).ends_with(&as_text(&condition.value)),
        "contains" => as_text(&current).contains(&as_text(&condition.value)),
        "gt" | "gte" | "lt" | "lte" => compare_numeric(&current, &condition.value, &mode),
        other => {
            return Err(RewriteError::UnsupportedConditionMode(other.to_string()));
        }
    };
    Ok(if condition.invert { !result } else { result })
}

/// Equality over matching JSON scalar types. Booleans compare as booleans,
/// numbers as numbers, strings as strings; mismatched types never match.
fn compare_equal(current: &Value, target: &Value) -> bool {
    match (current, target) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).is_some_and(|(x, y)| x == y)
        }
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            current == target
        }
        _ => false,
    }
}

/// Ordered comparison; anything other than number-vs-number fails.
fn compare_numeric(current: &Value, target: &Value, mode: &str) -> bool {
    let (Some(lhs), Some(rhs)) = (current.as_f64(), target.as_f64()) else {
        return false;
    };
    match mode {
        "gt" => lhs > rhs,
        "gte" => lhs >= rhs,
        "lt" => lhs < rhs,
        "lte" => lhs <= rhs,
        _ => false,
    }
}

/// String rendering used by the substring modes, matching how the source
/// document printed scalars.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(path: &str, mode: &str, value: Value) -> ConditionOperation {
        ConditionOperation {
            path: path.to_string(),
            mode: mode.to_string(),
            value,
            invert: false,
            pass_missing_key: false,
        }
    }

    #[test]
    fn and_requires_all() {
        let doc = json!({"model": "m-large", "stream": true});
        let conditions = vec![
            cond("model", "prefix", json!("m")),
            cond("stream", "full", json!(true)),
        ];
        assert!(check_conditions(&doc, &conditions, "AND").unwrap());
        let conditions = vec![
            cond("model", "prefix", json!("x")),
            cond("stream", "full", json!(true)),
        ];
        assert!(!check_conditions(&doc, &conditions, "AND").unwrap());
    }

    #[test]
    fn or_is_default() {
        let doc = json!({"model": "m"});
        let conditions = vec![
            cond("model", "full", json!("other")),
            cond("model", "suffix", json!("m")),
        ];
        assert!(check_conditions(&doc, &conditions, "").unwrap());
    }

    #[test]
    fn equality_requires_matching_types() {
        let doc = json!({"n": 1, "s": "1", "b": true});
        assert!(!check_single(&doc, &cond("n", "full", json!("1"))).unwrap());
        assert!(check_single(&doc, &cond("n", "full", json!(1.0))).unwrap());
        assert!(check_single(&doc, &cond("b", "full", json!(true))).unwrap());
        assert!(!check_single(&doc, &cond("s", "full", json!(1))).unwrap());
    }

    #[test]
    fn numeric_with_non_numeric_side_fails() {
        let doc = json!({"t": "abc", "n": 3});
        assert!(!check_single(&doc, &cond("t", "gt", json!(1))).unwrap());
        assert!(!check_single(&doc, &cond("n", "gte", json!("2"))).unwrap());
        assert!(check_single(&doc, &cond("n", "gte", json!(3))).unwrap());
    }

    #[test]
    fn missing_key_behavior() {
        let doc = json!({});
        assert!(!check_single(&doc, &cond("absent", "full", json!(1))).unwrap());
        let mut passing = cond("absent", "full", json!(1));
        passing.pass_missing_key = true;
        assert!(check_single(&doc, &passing).unwrap());
        // invert must not flip the missing-key outcome
        passing.invert = true;
        assert!(check_single(&doc, &passing).unwrap());
    }

    #[test]
    fn invert_flips_result() {
        let doc = json!({"model": "gpt"});
        let mut inverted = cond("model", "prefix", json!("gpt"));
        inverted.invert = true;
        assert!(!check_single(&doc, &inverted).unwrap());
    }

    #[test]
    fn unknown_mode_is_an_error() {
        let doc = json!({"a": 1});
        assert!(check_single(&doc, &cond("a", "regex", json!("x"))).is_err());
    }
}
