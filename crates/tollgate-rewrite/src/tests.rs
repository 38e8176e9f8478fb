use serde_json::{json, Map, Value};

use super::*;

fn program(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("program must be an object"),
    }
}

fn apply(body: Value, prog: Value) -> Value {
    let bytes = apply_param_override(
        &serde_json::to_vec(&body).unwrap(),
        &program(prog),
    )
    .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn empty_program_returns_body_unchanged() {
    let body = br#"{"model":"m"}"#;
    let out = apply_param_override(body, &Map::new()).unwrap();
    assert_eq!(out, body.to_vec());
}

#[test]
fn legacy_shape_merges_top_level() {
    let out = apply(
        json!({"model": "m", "temperature": 0.9}),
        json!({"temperature": 0.1, "max_tokens": 128}),
    );
    assert_eq!(out, json!({"model": "m", "temperature": 0.1, "max_tokens": 128}));
}

#[test]
fn operations_without_mode_fall_back_to_legacy() {
    // An entry missing `mode` disqualifies the structured shape; the whole
    // program, `operations` key included, merges at the top level.
    let out = apply(
        json!({"model": "m"}),
        json!({"operations": [{"path": "x"}]}),
    );
    assert_eq!(out["operations"], json!([{"path": "x"}]));
}

#[test]
fn set_and_get_round_trip() {
    let out = apply(
        json!({"model": "m"}),
        json!({"operations": [{"path": "temperature", "mode": "set", "value": 0.2}]}),
    );
    assert_eq!(out["temperature"], json!(0.2));
}

#[test]
fn set_keep_origin_skips_existing() {
    let out = apply(
        json!({"temperature": 0.9}),
        json!({"operations": [
            {"path": "temperature", "mode": "set", "value": 0.2, "keep_origin": true},
            {"path": "top_p", "mode": "set", "value": 0.5, "keep_origin": true},
        ]}),
    );
    assert_eq!(out["temperature"], json!(0.9));
    assert_eq!(out["top_p"], json!(0.5));
}

#[test]
fn delete_removes_path() {
    let out = apply(
        json!({"a": 1, "b": 2}),
        json!({"operations": [{"path": "a", "mode": "delete"}]}),
    );
    assert_eq!(out, json!({"b": 2}));
}

#[test]
fn move_then_move_back_is_identity() {
    let body = json!({"a": {"x": [1, 2]}, "keep": true});
    let once = apply(
        body.clone(),
        json!({"operations": [{"mode": "move", "from": "a", "to": "b"}]}),
    );
    assert_eq!(once, json!({"b": {"x": [1, 2]}, "keep": true}));
    let back = apply(
        once,
        json!({"operations": [{"mode": "move", "from": "b", "to": "a"}]}),
    );
    assert_eq!(back, body);
}

#[test]
fn move_missing_source_aborts_program() {
    let body = serde_json::to_vec(&json!({"a": 1})).unwrap();
    let err = apply_param_override(
        &body,
        &program(json!({"operations": [
            {"mode": "move", "from": "missing", "to": "b"},
        ]})),
    )
    .unwrap_err();
    assert!(matches!(err, RewriteError::MissingSource(_)));
}

#[test]
fn append_flattens_array_value() {
    let out = apply(
        json!({"stop": ["a"]}),
        json!({"operations": [{"path": "stop", "mode": "append", "value": ["b", "c"]}]}),
    );
    assert_eq!(out["stop"], json!(["a", "b", "c"]));
}

#[test]
fn prepend_on_string_concatenates() {
    let out = apply(
        json!({"prompt": "world"}),
        json!({"operations": [{"path": "prompt", "mode": "prepend", "value": "hello "}]}),
    );
    assert_eq!(out["prompt"], json!("hello world"));
}

#[test]
fn append_merges_objects_with_keep_origin() {
    let out = apply(
        json!({"metadata": {"a": 1, "b": null}}),
        json!({"operations": [{
            "path": "metadata", "mode": "append",
            "value": {"a": 9, "b": 2, "c": 3}, "keep_origin": true,
        }]}),
    );
    assert_eq!(out["metadata"], json!({"a": 1, "b": 2, "c": 3}));
}

#[test]
fn append_on_number_aborts() {
    let body = serde_json::to_vec(&json!({"n": 3})).unwrap();
    let err = apply_param_override(
        &body,
        &program(json!({"operations": [{"path": "n", "mode": "append", "value": 1}]})),
    )
    .unwrap_err();
    assert!(matches!(err, RewriteError::UnsupportedTarget { .. }));
}

#[test]
fn condition_and_gates_operation() {
    // Spec scenario: prefix+full under AND rewrites temperature.
    let out = apply(
        json!({"model": "m", "stream": true, "temperature": 0.9}),
        json!({"operations": [{
            "path": "temperature", "mode": "set", "value": 0.2,
            "conditions": [
                {"path": "model", "mode": "prefix", "value": "m"},
                {"path": "stream", "mode": "full", "value": true},
            ],
            "logic": "AND",
        }]}),
    );
    assert_eq!(out["temperature"], json!(0.2));
}

#[test]
fn false_condition_leaves_target_untouched() {
    let out = apply(
        json!({"model": "other", "temperature": 0.9}),
        json!({"operations": [{
            "path": "temperature", "mode": "set", "value": 0.2,
            "conditions": [{"path": "model", "mode": "prefix", "value": "m"}],
            "logic": "AND",
        }]}),
    );
    assert_eq!(out["temperature"], json!(0.9));
}

#[test]
fn negative_index_targets_last_element() {
    let out = apply(
        json!({"messages": [{"role": "system"}, {"role": "user"}]}),
        json!({"operations": [{"path": "messages.-1.name", "mode": "set", "value": "caller"}]}),
    );
    assert_eq!(out["messages"][1]["name"], json!("caller"));
    assert_eq!(out["messages"][0], json!({"role": "system"}));
}

#[test]
fn out_of_range_negative_index_skips_operation() {
    let body = json!({"messages": [{"role": "user"}]});
    let out = apply(
        body.clone(),
        json!({"operations": [{"path": "messages.-5.name", "mode": "set", "value": "x"}]}),
    );
    assert_eq!(out, body);
}

#[test]
fn negative_index_resolves_per_operation() {
    // The first append changes the array length, so `-1` in the second
    // operation must see the new last element.
    let out = apply(
        json!({"stop": ["a", "b"]}),
        json!({"operations": [
            {"path": "stop", "mode": "append", "value": "c"},
            {"path": "stop.-1", "mode": "set", "value": "z"},
        ]}),
    );
    assert_eq!(out["stop"], json!(["a", "b", "z"]));
}

#[test]
fn operations_apply_in_order() {
    let out = apply(
        json!({}),
        json!({"operations": [
            {"path": "a", "mode": "set", "value": 1},
            {"path": "a", "mode": "set", "value": 2},
        ]}),
    );
    assert_eq!(out["a"], json!(2));
}

#[test]
fn unknown_operation_mode_aborts() {
    let body = serde_json::to_vec(&json!({})).unwrap();
    let err = apply_param_override(
        &body,
        &program(json!({"operations": [{"path": "a", "mode": "replace", "value": 1}]})),
    )
    .unwrap_err();
    assert!(matches!(err, RewriteError::UnknownOperation(_)));
}
