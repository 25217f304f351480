//! Structural equality, merge, and normalization over JSON-shaped data.
//!
//! All helpers assume acyclic JSON values (string | number | boolean | null |
//! array | object). Functions, class instances, and cyclic references are
//! outside the contract; callers hold deep copies via `Value::clone`.

use serde_json::{Map, Value};

/// Structural deep equality. Numbers compare by f64 value, so `1` and `1.0`
/// are equal; objects compare by key set regardless of insertion order;
/// arrays compare element-wise in order.
pub fn deep_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| deep_eq(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).map(|w| deep_eq(v, w)).unwrap_or(false))
        }
        _ => false,
    }
}

/// Shallow spread: every key of `patch` overwrites the corresponding key of
/// `base`. Mirrors `{ ...base, ...patch }`.
pub fn merge_objects(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut out = base.clone();
    for (k, v) in patch {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// Shallow spread when both sides are JSON objects; non-objects pass the
/// patch through unchanged.
pub fn merge_values(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(b), Value::Object(p)) => Value::Object(merge_objects(b, p)),
        _ => patch.clone(),
    }
}

/// Normalize a view `items` array for comparison: strip default-valued
/// properties from each item and sort by item name, so default injection and
/// element order never register as changes.
pub fn normalize_view_items(items: &Value) -> Value {
    let arr = match items {
        Value::Array(arr) => arr,
        other => return other.clone(),
    };
    let mut normalized: Vec<Value> = arr.iter().map(normalize_view_item).collect();
    normalized.sort_by(|a, b| {
        let ka = a.get("name").and_then(Value::as_str).unwrap_or("");
        let kb = b.get("name").and_then(Value::as_str).unwrap_or("");
        ka.cmp(kb)
    });
    Value::Array(normalized)
}

/// Strip default-valued properties from one view item: `span_cols == 12`,
/// `order == 0`, empty strings, `title == name`, false behavior flags, and
/// an empty `widget_options` bag.
pub fn normalize_view_item(item: &Value) -> Value {
    let obj = match item {
        Value::Object(obj) => obj,
        other => return other.clone(),
    };
    let name = obj.get("name").and_then(Value::as_str).unwrap_or("");
    let mut out = Map::new();
    for (k, v) in obj {
        if is_default_item_prop(k, v, name) {
            continue;
        }
        out.insert(k.clone(), v.clone());
    }
    Value::Object(out)
}

fn is_default_item_prop(key: &str, value: &Value, item_name: &str) -> bool {
    match key {
        "span_cols" => value.as_f64() == Some(12.0),
        "order" => value.as_f64() == Some(0.0),
        "title" => value.as_str() == Some(item_name) || value.as_str() == Some(""),
        "required" | "disabled" | "readonly" => value == &Value::Bool(false),
        "widget_options" => matches!(value, Value::Object(m) if m.is_empty()),
        _ => matches!(value, Value::String(s) if s.is_empty()) || value.is_null(),
    }
}

/// Equality for view patch values: the `items` key is compared after
/// normalization, everything else structurally.
pub fn view_prop_eq(key: &str, a: &Value, b: &Value) -> bool {
    if key == "items" {
        deep_eq(&normalize_view_items(a), &normalize_view_items(b))
    } else {
        deep_eq(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_eq_numbers_by_value() {
        assert!(deep_eq(&json!(1), &json!(1.0)));
        assert!(!deep_eq(&json!(1), &json!(2)));
    }

    #[test]
    fn deep_eq_objects_ignore_key_order() {
        assert!(deep_eq(&json!({"a": 1, "b": [2, 3]}), &json!({"b": [2, 3], "a": 1})));
        assert!(!deep_eq(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn deep_eq_arrays_are_ordered() {
        assert!(!deep_eq(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn merge_is_shallow() {
        let base = json!({"a": {"x": 1}, "b": 2});
        let patch = json!({"a": {"y": 2}});
        let merged = merge_values(&base, &patch);
        assert_eq!(merged, json!({"a": {"y": 2}, "b": 2}));
    }

    #[test]
    fn items_differing_only_in_defaults_and_order_are_equal() {
        let a = json!([
            {"name": "age", "span_cols": 12, "order": 0, "required": false, "widget_options": {}},
            {"name": "name", "title": "name"}
        ]);
        let b = json!([
            {"name": "name"},
            {"name": "age"}
        ]);
        assert!(view_prop_eq("items", &a, &b));
    }

    #[test]
    fn items_with_real_differences_are_not_equal() {
        let a = json!([{"name": "age", "span_cols": 6}]);
        let b = json!([{"name": "age"}]);
        assert!(!view_prop_eq("items", &a, &b));
    }

    #[test]
    fn title_equal_to_name_is_a_default() {
        let item = json!({"name": "age", "title": "age", "widget": "number"});
        assert_eq!(normalize_view_item(&item), json!({"name": "age", "widget": "number"}));
    }
}
