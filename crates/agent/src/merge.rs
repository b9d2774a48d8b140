//! Deep merge for schemaless browser policy documents.

use serde_json::Value;

/// Merge `source` into `dest`.
///
/// For each key in the source: absent in the destination → adopt; both
/// objects → recurse; both arrays → append; anything else → the source
/// overwrites.
pub fn deep_merge(dest: &mut Value, source: &Value) {
    match (dest, source) {
        (Value::Object(dest), Value::Object(source)) => {
            for (key, value) in source {
                match dest.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        dest.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(dest), Value::Array(source)) => {
            dest.extend(source.iter().cloned());
        }
        (dest, source) => {
            *dest = source.clone();
        }
    }
}
