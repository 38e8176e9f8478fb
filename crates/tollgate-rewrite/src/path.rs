//! Dot-indexed JSON paths with array indices.
//!
//! Negative indices are resolved against the array length found in the
//! document at resolution time, so `items.-1` always means "last element of
//! items as the document currently stands". Resolution happens once per
//! operation, immediately before it runs.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    NegIndex(i64),
}

pub fn parse_path(path: &str) -> Vec<Segment> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .map(|part| {
            if let Ok(index) = part.parse::<usize>() {
                Segment::Index(index)
            } else if part.starts_with('-') && part[1..].chars().all(|c| c.is_ascii_digit()) {
                match part.parse::<i64>() {
                    Ok(neg) => Segment::NegIndex(neg),
                    Err(_) => Segment::Key(part.to_string()),
                }
            } else {
                Segment::Key(part.to_string())
            }
        })
        .collect()
}

/// Replace negative indices with concrete ones by walking the document.
///
/// Returns `None` when a negative index cannot be resolved (its array is
/// missing, not an array, or the index is out of range); the caller skips the
/// operation in that case. Positive segments pointing at missing values still
/// resolve, because assignment may create them.
pub fn resolve(doc: &Value, segments: &[Segment]) -> Option<Vec<Segment>> {
    let mut resolved = Vec::with_capacity(segments.len());
    let mut cursor: Option<&Value> = Some(doc);
    for segment in segments {
        match segment {
            Segment::NegIndex(neg) => {
                let array = cursor?.as_array()?;
                let index = array.len() as i64 + neg;
                if index < 0 || index >= array.len() as i64 {
                    return None;
                }
                let index = index as usize;
                cursor = array.get(index);
                resolved.push(Segment::Index(index));
            }
            Segment::Index(index) => {
                cursor = cursor.and_then(|value| value.as_array()).and_then(|a| a.get(*index));
                resolved.push(Segment::Index(*index));
            }
            Segment::Key(key) => {
                cursor = cursor.and_then(|value| value.get(key.as_str()));
                resolved.push(Segment::Key(key.clone()));
            }
        }
    }
    Some(resolved)
}

pub fn get<'a>(doc: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut cursor = doc;
    for segment in segments {
        cursor = match segment {
            Segment::Key(key) => cursor.get(key.as_str())?,
            Segment::Index(index) => cursor.as_array()?.get(*index)?,
            Segment::NegIndex(_) => return None,
        };
    }
    Some(cursor)
}

/// Assign `value` at the path, creating missing objects along the way and
/// padding arrays with nulls for out-of-bounds positive indices.
pub fn set(doc: &mut Value, segments: &[Segment], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *doc = value;
        return;
    };
    let mut cursor = doc;
    for segment in parents {
        cursor = match segment {
            Segment::Key(key) => {
                if !cursor.is_object() {
                    *cursor = Value::Object(serde_json::Map::new());
                }
                cursor
                    .as_object_mut()
                    .expect("object ensured above")
                    .entry(key.clone())
                    .or_insert(Value::Null)
            }
            Segment::Index(index) => {
                if !cursor.is_array() {
                    *cursor = Value::Array(Vec::new());
                }
                let array = cursor.as_array_mut().expect("array ensured above");
                while array.len() <= *index {
                    array.push(Value::Null);
                }
                &mut array[*index]
            }
            Segment::NegIndex(_) => return,
        };
    }
    match last {
        Segment::Key(key) => {
            if !cursor.is_object() {
                *cursor = Value::Object(serde_json::Map::new());
            }
            cursor
                .as_object_mut()
                .expect("object ensured above")
                .insert(key.clone(), value);
        }
        Segment::Index(index) => {
            if !cursor.is_array() {
                *cursor = Value::Array(Vec::new());
            }
            let array = cursor.as_array_mut().expect("array ensured above");
            while array.len() <= *index {
                array.push(Value::Null);
            }
            array[*index] = value;
        }
        Segment::NegIndex(_) => {}
    }
}

/// Remove the path; missing paths are a no-op.
pub fn remove(doc: &mut Value, segments: &[Segment]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut cursor = doc;
    for segment in parents {
        cursor = match segment {
            Segment::Key(key) => cursor.get_mut(key.as_str())?,
            Segment::Index(index) => cursor.as_array_mut()?.get_mut(*index)?,
            Segment::NegIndex(_) => return None,
        };
    }
    match last {
        Segment::Key(key) => cursor.as_object_mut()?.remove(key.as_str()),
        Segment::Index(index) => {
            let array = cursor.as_array_mut()?;
            if *index < array.len() {
                Some(array.remove(*index))
            } else {
                None
            }
        }
        Segment::NegIndex(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_keys_and_indices() {
        assert_eq!(
            parse_path("messages.0.content"),
            vec![
                Segment::Key("messages".into()),
                Segment::Index(0),
                Segment::Key("content".into()),
            ]
        );
        assert_eq!(
            parse_path("messages.-1"),
            vec![Segment::Key("messages".into()), Segment::NegIndex(-1)]
        );
    }

    #[test]
    fn negative_index_resolves_to_last_element() {
        let doc = json!({"items": [1, 2, 3]});
        let resolved = resolve(&doc, &parse_path("items.-1")).unwrap();
        assert_eq!(get(&doc, &resolved), Some(&json!(3)));
    }

    #[test]
    fn negative_index_out_of_range_fails_resolution() {
        let doc = json!({"items": [1, 2]});
        assert!(resolve(&doc, &parse_path("items.-3")).is_none());
        assert!(resolve(&doc, &parse_path("missing.-1")).is_none());
    }

    #[test]
    fn set_creates_missing_parents() {
        let mut doc = json!({});
        set(&mut doc, &parse_path("a.b.c"), json!(1));
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn set_pads_arrays() {
        let mut doc = json!({"arr": [0]});
        set(&mut doc, &parse_path("arr.3"), json!("x"));
        assert_eq!(doc, json!({"arr": [0, null, null, "x"]}));
    }

    #[test]
    fn remove_missing_is_noop() {
        let mut doc = json!({"a": 1});
        assert!(remove(&mut doc, &parse_path("b.c")).is_none());
        assert_eq!(doc, json!({"a": 1}));
    }
}
