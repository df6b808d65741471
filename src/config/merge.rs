//! Layer merging for configuration values
//!
//! - Objects: merged key by key, recursively
//! - Arrays: replaced wholesale by the later layer
//! - Scalars (including null): later layer wins

use serde_json::Value;

/// Merge `overlay` on top of `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut merged), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let value = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay,
    }
}

/// Fold layers in precedence order (first is lowest).
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}
