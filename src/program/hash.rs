//! Property hashing for change detection.
//!
//! Hashes are computed over a canonical JSON rendering (object keys sorted),
//! so two property bags that differ only in key order hash the same.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::builder::Program;

/// Hasher for resource properties and whole programs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertyHasher;

impl PropertyHasher {
    /// Creates a new property hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a resource's type and properties.
    #[must_use]
    pub fn hash_resource(&self, resource_type: &str, properties: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(properties).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the entire program.
    ///
    /// This hash changes when any resource, dependency or export changes.
    #[must_use]
    pub fn hash_program(&self, program: &Program) -> String {
        let mut hasher = Sha256::new();

        for resource in program.resources() {
            hasher.update(resource.name.as_bytes());
            hasher.update(
                self.hash_resource(&resource.resource_type, &resource.properties)
                    .as_bytes(),
            );

            let mut deps: Vec<_> = resource.depends_on.iter().collect();
            deps.sort();
            for dep in deps {
                hasher.update(dep.as_bytes());
            }
            hasher.update([0u8]);
        }

        // Exports are kept in a BTreeMap, so iteration is already sorted.
        for (name, export) in program.exports() {
            hasher.update(name.as_bytes());
            if let Ok(value) = serde_json::to_value(export) {
                hasher.update(canonical_json(&value).as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Returns a short version of a hash, for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        &hash[..hash.len().min(12)]
    }
}

/// Renders a JSON value with object keys in sorted order.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
