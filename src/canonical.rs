//! Canonical serialization.
//!
//! Every persisted object hashes to the SHA-256 of its canonical form:
//! a strict, sorted-by-key textual encoding over `serde_json::Value`.
//! Any two implementations that serialize the same logical object MUST
//! produce byte-identical output, or hashes diverge across replicas.
//!
//! Rules: object keys sorted lexicographically; keys whose value equals
//! the type's recipe default are omitted; numbers/strings/bools/arrays/
//! nested objects render in a single canonical form (no whitespace, no
//! trailing commas, `$type$` is a logical first field but sorts like
//! any other key since `$` sorts before alphanumerics in UTF-8).

use crate::error::{CoreError, CoreResult};
use ring::digest;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{OnceLock, RwLock};

pub type Hash = [u8; 32];

/// Per-`$type$` default field values, registered by whoever owns that
/// type's recipe (`object_store::FileObjectStore::register_recipe`
/// wires `Recipe::default_values` in here). `canonicalize` consults
/// this so a key whose value equals its type's default never appears
/// in the canonical form — two replicas that disagree only on whether
/// they wrote the default explicitly still hash identically.
fn recipe_defaults_registry() -> &'static RwLock<HashMap<String, HashMap<String, Value>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, HashMap<String, Value>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register the default field values for one `$type$` name.
pub fn register_recipe_defaults(type_name: &str, defaults: HashMap<String, Value>) {
    recipe_defaults_registry().write().unwrap().insert(type_name.to_string(), defaults);
}

fn defaults_for(type_name: &str) -> Option<HashMap<String, Value>> {
    recipe_defaults_registry().read().unwrap().get(type_name).cloned()
}

pub fn hash_hex(h: &Hash) -> String {
    hex::encode(h)
}

pub fn hash_from_hex(s: &str) -> CoreResult<Hash> {
    let bytes = hex::decode(s).map_err(|e| CoreError::Invalid(format!("bad hash hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::Invalid("hash must be 32 bytes".into()))
}

/// Render `value` as canonical bytes: sorted keys, no insignificant
/// whitespace, deterministic across platforms.
pub fn canonicalize<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let v = serde_json::to_value(value)
        .map_err(|e| CoreError::Invalid(format!("serialize failed: {e}")))?;
    let sorted = sort_value(v);
    serde_json::to_vec(&sorted).map_err(|e| CoreError::Invalid(format!("serialize failed: {e}")))
}

pub fn canonical_hash<T: Serialize>(value: &T) -> CoreResult<Hash> {
    let bytes = canonicalize(value)?;
    Ok(hash_bytes(&bytes))
}

pub fn hash_bytes(bytes: &[u8]) -> Hash {
    let digest = digest::digest(&digest::SHA256, bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Recursively rewrite a `Value` so that every object renders with
/// sorted keys via a `BTreeMap`, which `serde_json` serializes in key
/// order, and drops keys whose value equals that `$type$`'s registered
/// recipe default.
fn sort_value(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let defaults = map.get("$type$").and_then(|v| v.as_str()).and_then(defaults_for);
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .filter(|(k, v)| {
                    k == "$type$"
                        || match &defaults {
                            Some(d) => d.get(k).map_or(true, |default| default != v),
                            None => true,
                        }
                })
                .map(|(k, v)| (k, sort_value(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn canonical_hash_is_deterministic() {
        let v = json!({"$type$": "Thing", "x": 1});
        assert_eq!(canonical_hash(&v).unwrap(), canonical_hash(&v).unwrap());
    }

    #[test]
    fn different_values_hash_differently() {
        let a = json!({"x": 1});
        let b = json!({"x": 2});
        assert_ne!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn hash_hex_roundtrip() {
        let h = hash_bytes(b"hello");
        let hex = hash_hex(&h);
        assert_eq!(hash_from_hex(&hex).unwrap(), h);
    }

    #[test]
    fn recipe_default_valued_keys_are_omitted_from_canonical_form() {
        let mut defaults = std::collections::HashMap::new();
        defaults.insert("retracted".to_string(), json!(false));
        register_recipe_defaults("Thing", defaults);

        let explicit_default = json!({"$type$": "Thing", "retracted": false, "n": 1});
        let omitted = json!({"$type$": "Thing", "n": 1});
        assert_eq!(canonicalize(&explicit_default).unwrap(), canonicalize(&omitted).unwrap());

        let non_default = json!({"$type$": "Thing", "retracted": true, "n": 1});
        assert_ne!(canonicalize(&explicit_default).unwrap(), canonicalize(&non_default).unwrap());
    }
}
