//! Naming convention translation between host and script.
//!
//! The host names things in `snake_case`; scripts see `camelCase`. Every
//! value that crosses the boundary (hook names, provider method names, map
//! keys of marshaled payloads) goes through these functions.

use serde_json::{Map, Value};

/// `on_get_anime` → `onGetAnime`.
pub fn to_script_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            // Leading underscores survive; only word separators are folded.
            if out.is_empty() {
                out.push(ch);
            } else {
                upper_next = true;
            }
            continue;
        }
        if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// `onGetAnime` → `on_get_anime`.
pub fn to_host_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_uppercase() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Rename every object key in `value` to script case, recursively.
pub fn keys_to_script(value: Value) -> Value {
    rename_keys(value, &to_script_case)
}

/// Rename every object key in `value` to host case, recursively.
pub fn keys_to_host(value: Value) -> Value {
    rename_keys(value, &to_host_case)
}

fn rename_keys(value: Value, rename: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (rename(&k), rename_keys(v, rename)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| rename_keys(v, rename)).collect())
        }
        other => other,
    }
}
