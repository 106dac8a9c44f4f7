//! Process-wide configuration registry.
//!
//! Values live under dotted keys (`fiber.stack_size`) and can be loaded from
//! a YAML document, where nesting maps to the dots:
//!
//! ```yaml
//! fiber:
//!   stack_size: 131072
//! ```
//!
//! Lookups deserialize through `serde`, so any `Deserialize` type works as a
//! target. Unknown keys simply report `None`; callers supply their defaults
//! through [`get_or`].
//!
//! The runtime itself consumes a single key: `fiber.stack_size`, the default
//! fiber stack size in bytes (1 MiB if unset).

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::Value;

use crate::Result;

/// Default per-fiber stack size in bytes, used when `fiber.stack_size` is
/// not configured.
pub const DEFAULT_FIBER_STACK_SIZE: usize = 1024 * 1024;

static REGISTRY: Lazy<RwLock<HashMap<String, Value>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Look up `key`, deserializing the stored value into `T`.
///
/// Returns `None` when the key is absent or the stored value does not fit
/// `T` (a mismatch is also logged, since it is almost always a typo in the
/// config file rather than an intentional shape change).
pub fn get<T: DeserializeOwned>(key: &str) -> Option<T> {
    let registry = REGISTRY.read().unwrap();
    let value = registry.get(key)?;
    match serde_yaml::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("config key `{}` has unexpected shape: {}", key, e);
            None
        }
    }
}

/// Look up `key`, falling back to `default` when absent or mismatched.
pub fn get_or<T: DeserializeOwned>(key: &str, default: T) -> T {
    get(key).unwrap_or(default)
}

/// Store `value` under `key`, replacing any previous value.
pub fn set<T: Serialize>(key: &str, value: T) {
    let value = serde_yaml::to_value(value).expect("config values serialize infallibly");
    REGISTRY.write().unwrap().insert(key.to_string(), value);
}

/// Load a YAML document into the registry.
///
/// Nested mappings flatten into dotted keys; scalars and sequences are
/// stored as-is. Keys already present are overwritten, keys not mentioned in
/// the document are left untouched.
pub fn load_yaml(source: &str) -> Result<()> {
    let root: Value = serde_yaml::from_str(source)?;
    let mut registry = REGISTRY.write().unwrap();
    flatten("", &root, &mut registry);
    Ok(())
}

fn flatten(prefix: &str, value: &Value, out: &mut HashMap<String, Value>) {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let name = match k.as_str() {
                    Some(s) => s.to_string(),
                    None => continue,
                };
                let key = if prefix.is_empty() {
                    name
                } else {
                    format!("{}.{}", prefix, name)
                };
                flatten(&key, v, out);
            }
        }
        _ if prefix.is_empty() => {}
        _ => {
            out.insert(prefix.to_string(), value.clone());
        }
    }
}

/// The configured default fiber stack size.
pub(crate) fn fiber_stack_size() -> usize {
    get_or("fiber.stack_size", DEFAULT_FIBER_STACK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_nesting_flattens_to_dotted_keys() {
        load_yaml("test_cfg:\n  inner:\n    leaf: 17\n  flag: true\n").unwrap();
        assert_eq!(get::<u32>("test_cfg.inner.leaf"), Some(17));
        assert_eq!(get::<bool>("test_cfg.flag"), Some(true));
        assert_eq!(get::<u32>("test_cfg.missing"), None);
    }

    #[test]
    fn mismatched_shape_falls_back_to_default() {
        set("test_cfg.text", "not a number");
        assert_eq!(get_or::<u64>("test_cfg.text", 42), 42);
    }

    #[test]
    fn stack_size_default_applies() {
        assert_eq!(get_or("test_cfg.absent_stack", DEFAULT_FIBER_STACK_SIZE), DEFAULT_FIBER_STACK_SIZE);
    }
}
