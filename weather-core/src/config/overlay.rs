//! Layer merging and the environment-variable overlay.
//!
//! Every layer is a `serde_yaml::Value` mapping. Later layers win per
//! fully-qualified key path; non-mapping values are replaced wholesale.

use serde_yaml::{Mapping, Value};
use std::ffi::OsString;

use super::ConfigError;

/// Separator between nesting levels in overlay variable names.
pub const NESTING_SEPARATOR: &str = "__";

/// Deep-merge `layer` into `base`.
pub fn merge(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Mapping(base), Value::Mapping(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

/// Set `value` at `path`, turning any scalar met on the way into a mapping.
pub fn insert_path(node: &mut Value, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        *node = value;
        return;
    };

    if !node.is_mapping() {
        *node = Value::Mapping(Mapping::new());
    }

    if let Value::Mapping(map) = node {
        if !map.contains_key(head.as_str()) {
            map.insert(Value::String(head.clone()), Value::Null);
        }
        if let Some(child) = map.get_mut(head.as_str()) {
            insert_path(child, rest, value);
        }
    }
}

/// Map an overlay variable name onto a key path.
///
/// `APP_HTTP__PORT` becomes `["http", "port"]`. Names outside the prefix, and
/// the bare prefix itself, yield `Ok(None)`.
pub fn key_path(name: &str, prefix: &str) -> Result<Option<Vec<String>>, ConfigError> {
    let Some(rest) = name.strip_prefix(prefix) else {
        return Ok(None);
    };
    if rest.is_empty() {
        return Ok(None);
    }

    let lowered = rest.to_lowercase();
    let path: Vec<String> = lowered.split(NESTING_SEPARATOR).map(str::to_owned).collect();

    if path.iter().any(String::is_empty) {
        return Err(ConfigError::EnvOverlay {
            key: name.to_owned(),
            reason: format!("empty key segment in `{}`", path.join(".")),
        });
    }

    Ok(Some(path))
}

/// Whitespace-separated values become sequences so list fields can be set.
pub fn overlay_value(raw: &str) -> Value {
    if raw.contains(char::is_whitespace) {
        Value::Sequence(raw.split_whitespace().map(|t| Value::String(t.to_owned())).collect())
    } else {
        Value::String(raw.to_owned())
    }
}

/// Build the overlay tree from every variable carrying `prefix`.
///
/// Variables are applied in name order, so a parent key set as a scalar is
/// always superseded by its nested keys.
pub fn env_overlay<'a, I>(vars: I, prefix: &str) -> Result<Value, ConfigError>
where
    I: IntoIterator<Item = &'a (OsString, OsString)>,
{
    let mut entries = Vec::new();

    for (name, value) in vars {
        let lossy = name.to_string_lossy();
        if !lossy.starts_with(prefix) {
            continue;
        }

        let name = name.to_str().ok_or_else(|| ConfigError::EnvOverlay {
            key: lossy.to_string(),
            reason: "variable name is not valid UTF-8".to_owned(),
        })?;
        let Some(path) = key_path(name, prefix)? else {
            continue;
        };
        let value = value.to_str().ok_or_else(|| ConfigError::EnvOverlay {
            key: name.to_owned(),
            reason: "value is not valid UTF-8".to_owned(),
        })?;

        entries.push((name, path, overlay_value(value)));
    }

    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut tree = Value::Mapping(Mapping::new());
    for (name, path, value) in entries {
        tracing::trace!(variable = name, key = %path.join("."), "applying env override");
        insert_path(&mut tree, &path, value);
    }

    Ok(tree)
}
