//! Traversal helpers for nested object graphs.

use crate::error::Result;
use crate::pickle::Value;

/// Rebuild `value` with `function` applied to every node matching `is_leaf`.
///
/// Lists, tuples, sets, dict values and the contents of generic objects are
/// traversed; dict keys and non-matching scalars are left as they are. A
/// matching node is handed to `function` whole and not descended into.
pub fn apply_to_collection<P, F>(value: Value, is_leaf: &P, function: &mut F) -> Result<Value>
where
    P: Fn(&Value) -> bool,
    F: FnMut(Value) -> Result<Value>,
{
    if is_leaf(&value) {
        return function(value);
    }
    let mut map_all = |items: Vec<Value>| -> Result<Vec<Value>> {
        items
            .into_iter()
            .map(|v| apply_to_collection(v, is_leaf, function))
            .collect()
    };
    Ok(match value {
        Value::List(items) => Value::List(map_all(items)?),
        Value::Tuple(items) => Value::Tuple(map_all(items)?),
        Value::Set(items) => Value::Set(map_all(items)?),
        Value::Dict(entries) => Value::Dict(map_entries(entries, is_leaf, function)?),
        Value::Object(mut obj) => {
            obj.args = map_all(std::mem::take(&mut obj.args))?;
            obj.list_items = map_all(std::mem::take(&mut obj.list_items))?;
            if let Some(state) = obj.state.take() {
                obj.state = Some(Box::new(apply_to_collection(*state, is_leaf, function)?));
            }
            obj.dict_items = map_entries(std::mem::take(&mut obj.dict_items), is_leaf, function)?;
            Value::Object(obj)
        }
        other => other,
    })
}

fn map_entries<P, F>(
    entries: Vec<(Value, Value)>,
    is_leaf: &P,
    function: &mut F,
) -> Result<Vec<(Value, Value)>>
where
    P: Fn(&Value) -> bool,
    F: FnMut(Value) -> Result<Value>,
{
    entries
        .into_iter()
        .map(|(k, v)| Ok((k, apply_to_collection(v, is_leaf, function)?)))
        .collect()
}

/// Call `visit` with a dotted path for every tensor, placeholder and storage in `value`.
///
/// Dict entries contribute their key (string keys as-is, others via `Debug`),
/// sequence items their index, and object state is entered transparently.
pub fn for_each_tensor<F>(value: &Value, visit: &mut F)
where
    F: FnMut(&str, &Value),
{
    walk(value, &mut String::new(), visit);
}

fn walk<F>(value: &Value, path: &mut String, visit: &mut F)
where
    F: FnMut(&str, &Value),
{
    match value {
        Value::Tensor(_) | Value::Lazy(_) | Value::Storage(_) => visit(path, value),
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
            for (i, item) in items.iter().enumerate() {
                descend(path, &i.to_string(), |p| walk(item, p, visit));
            }
        }
        Value::Dict(entries) => walk_entries(entries, path, visit),
        Value::Object(obj) => {
            for (i, arg) in obj.args.iter().enumerate() {
                descend(path, &i.to_string(), |p| walk(arg, p, visit));
            }
            if let Some(state) = &obj.state {
                walk(state, path, visit);
            }
            for (i, item) in obj.list_items.iter().enumerate() {
                descend(path, &i.to_string(), |p| walk(item, p, visit));
            }
            walk_entries(&obj.dict_items, path, visit);
        }
        _ => {}
    }
}

fn walk_entries<F>(entries: &[(Value, Value)], path: &mut String, visit: &mut F)
where
    F: FnMut(&str, &Value),
{
    for (k, v) in entries {
        let key = match k {
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            other => format!("{other:?}"),
        };
        descend(path, &key, |p| walk(v, p, visit));
    }
}

fn descend(path: &mut String, segment: &str, f: impl FnOnce(&mut String)) {
    let len = path.len();
    if !path.is_empty() {
        path.push('.');
    }
    path.push_str(segment);
    f(path);
    path.truncate(len);
}
