use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::{check_conditions, ConditionOperation};
use crate::path::{get, parse_path, remove, resolve, set};
use crate::RewriteError;

/// One entry of a structured rewrite program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamOperation {
    #[serde(default)]
    pub path: String,
    /// delete, set, move, prepend, append. Required; entries without a mode
    /// make the whole program fall back to the legacy merge shape.
    pub mode: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub keep_origin: bool,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub conditions: Vec<ConditionOperation>,
    /// AND or OR; OR when unspecified.
    #[serde(default)]
    pub logic: String,
}

/// Run the operations in order against the document. Condition-gated skips
/// are silent; execution errors abort the remaining program.
pub fn apply_operations(
    doc: &mut Value,
    operations: &[ParamOperation],
) -> Result<(), RewriteError> {
    for op in operations {
        if !check_conditions(doc, &op.conditions, &op.logic)? {
            continue;
        }
        match op.mode.as_str() {
            "delete" => {
                if let Some(segments) = resolve(doc, &parse_path(&op.path)) {
                    remove(doc, &segments);
                }
            }
            "set" => {
                let Some(segments) = resolve(doc, &parse_path(&op.path)) else {
                    continue;
                };
                if op.keep_origin && get(doc, &segments).is_some() {
                    continue;
                }
                set(doc, &segments, op.value.clone());
            }
            "move" => move_value(doc, &op.from, &op.to)?,
            "prepend" => modify_value(doc, op, true)?,
            "append" => modify_value(doc, op, false)?,
            other => return Err(RewriteError::UnknownOperation(other.to_string())),
        }
    }
    Ok(())
}

/// Read `from`, assign at `to`, then delete `from`. A missing source is an
/// error; an unresolvable destination skips the move.
fn move_value(doc: &mut Value, from: &str, to: &str) -> Result<(), RewriteError> {
    let from_segments = resolve(doc, &parse_path(from))
        .filter(|segments| get(doc, segments).is_some())
        .ok_or_else(|| RewriteError::MissingSource(from.to_string()))?;
    let Some(to_segments) = resolve(doc, &parse_path(to)) else {
        return Ok(());
    };
    let value = get(doc, &from_segments)
        .cloned()
        .ok_or_else(|| RewriteError::MissingSource(from.to_string()))?;
    set(doc, &to_segments, value);
    // The assignment may have shifted array positions `from` pointed into,
    // so re-resolve before deleting.
    if let Some(segments) = resolve(doc, &parse_path(from)) {
        remove(doc, &segments);
    }
    Ok(())
}

/// prepend/append semantics by current target type: element-wise concat for
/// arrays (a list value flattens), string concat for strings, key merge for
/// objects.
fn modify_value(doc: &mut Value, op: &ParamOperation, prepend: bool) -> Result<(), RewriteError> {
    let Some(segments) = resolve(doc, &parse_path(&op.path)) else {
        return Ok(());
    };
    let Some(current) = get(doc, &segments).cloned() else {
        return Err(RewriteError::UnsupportedTarget {
            mode: op.mode.clone(),
            path: op.path.clone(),
        });
    };
    let next = match current {
        Value::Array(existing) => Value::Array(concat_array(existing, &op.value, prepend)),
        Value::String(existing) => Value::String(concat_string(&existing, &op.value, prepend)),
        Value::Object(existing) => Value::Object(merge_objects(existing, &op.value, op.keep_origin)?),
        _ => {
            return Err(RewriteError::UnsupportedTarget {
                mode: op.mode.clone(),
                path: op.path.clone(),
            });
        }
    };
    set(doc, &segments, next);
    Ok(())
}

fn concat_array(existing: Vec<Value>, value: &Value, prepend: bool) -> Vec<Value> {
    let added: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    if prepend {
        let mut out = added;
        out.extend(existing);
        out
    } else {
        let mut out = existing;
        out.extend(added);
        out
    }
}

fn concat_string(existing: &str, value: &Value, prepend: bool) -> String {
    let added = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if prepend {
        format!("{added}{existing}")
    } else {
        format!("{existing}{added}")
    }
}

/// Merge `value` into the existing object. With `keep_origin`, existing
/// non-null keys win on conflict.
fn merge_objects(
    mut existing: Map<String, Value>,
    value: &Value,
    keep_origin: bool,
) -> Result<Map<String, Value>, RewriteError> {
    let incoming = match value {
        Value::Object(map) => map.clone(),
        other => serde_json::from_value(other.clone())?,
    };
    for (key, incoming_value) in incoming {
        let replace = !keep_origin
            || matches!(existing.get(&key), None | Some(Value::Null));
        if replace {
            existing.insert(key, incoming_value);
        }
    }
    Ok(existing)
}
