//! Canonical serialization of keyword arguments and identity hashing.
//!
//! Execution identities are SHA-1 digests over a deterministic textual
//! encoding of the function name and its effective arguments. The encoding
//! must be reproducible across runs and processes, so maps are rewritten as
//! key-ordered pair lists before rendering.

use crate::{Kwargs, Value};
use serde::Serialize;
use sha1::{Digest, Sha1};

/// Capability a value type may implement to define its own cache identity.
///
/// The serializer checks for this capability before falling back to generic
/// structural encoding: a fingerprinted value enters the cache key as a
/// `[type-id, fingerprint]` pair via [`fingerprinted`], so domain objects do
/// not need a full structural encoding to participate in identity hashing.
pub trait Fingerprint {
    fn fingerprint(&self) -> String;
}

/// Convert a fingerprint-capable value into its cache-key form.
pub fn fingerprinted<T: Fingerprint>(value: &T) -> Value {
    Value::Array(vec![
        Value::String(std::any::type_name::<T>().to_string()),
        Value::String(value.fingerprint()),
    ])
}

/// Structural fallback for plain serde types entering a kwargs map.
pub fn to_value<T: Serialize>(value: &T) -> crate::error::Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Rewrite a value into a canonical form: maps become key-sorted
/// `[key, value]` pair lists, sequences are rewritten element-wise, scalars
/// pass through. The result renders to the same JSON text regardless of the
/// original map ordering.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Array(
                keys.into_iter()
                    .map(|key| {
                        Value::Array(vec![Value::String(key.clone()), canonical(&map[key])])
                    })
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Canonical textual encoding of a single value.
pub fn serialize_value(value: &Value) -> String {
    canonical(value).to_string()
}

/// Canonical textual encoding of a kwargs map, independent of insertion
/// order.
pub fn serialize_kwargs(kwargs: &Kwargs) -> String {
    let pairs: Vec<Value> = kwargs
        .iter()
        .map(|(key, value)| Value::Array(vec![Value::String(key.clone()), canonical(value)]))
        .collect();
    Value::Array(pairs).to_string()
}

/// SHA-1 digest over the function name and both kwargs maps, hex-encoded.
pub fn identity_digest(function: &str, kwargs: &Kwargs, context_kwargs: &Kwargs) -> String {
    let mut hasher = Sha1::new();
    hasher.update(function.as_bytes());
    hasher.update(serialize_kwargs(kwargs).as_bytes());
    hasher.update(serialize_kwargs(context_kwargs).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs_from(pairs: &[(&str, Value)]) -> Kwargs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_identity_stable_across_orderings() {
        let a = kwargs_from(&[("x", json!(1)), ("y", json!({"b": 2, "a": 1}))]);
        let b = kwargs_from(&[("y", json!({"a": 1, "b": 2})), ("x", json!(1))]);
        let empty = Kwargs::new();

        assert_eq!(
            identity_digest("f", &a, &empty),
            identity_digest("f", &b, &empty)
        );
    }

    #[test]
    fn test_identity_differs_on_value_change() {
        let a = kwargs_from(&[("x", json!(1))]);
        let b = kwargs_from(&[("x", json!(2))]);
        let empty = Kwargs::new();

        assert_ne!(
            identity_digest("f", &a, &empty),
            identity_digest("f", &b, &empty)
        );
        assert_ne!(
            identity_digest("f", &a, &empty),
            identity_digest("g", &a, &empty)
        );
    }

    #[test]
    fn test_context_kwargs_participate_in_identity() {
        let explicit = kwargs_from(&[("x", json!(1))]);
        let ctx_a = kwargs_from(&[("a", json!(1))]);
        let ctx_b = kwargs_from(&[("a", json!(2))]);

        assert_ne!(
            identity_digest("f", &explicit, &ctx_a),
            identity_digest("f", &explicit, &ctx_b)
        );
    }

    #[test]
    fn test_nested_map_encoding_is_order_independent() {
        assert_eq!(
            serialize_value(&json!({"b": [1, {"z": 1, "a": 2}], "a": null})),
            serialize_value(&json!({"a": null, "b": [1, {"a": 2, "z": 1}]})),
        );
    }

    #[test]
    fn test_structural_encoding_of_serde_types() {
        #[derive(serde::Serialize)]
        struct Window {
            start: u64,
            end: u64,
        }

        let value = to_value(&Window { start: 3, end: 9 }).unwrap();
        assert_eq!(value, json!({"start": 3, "end": 9}));
        // And the canonical rendering is usable as a kwargs entry.
        assert_eq!(serialize_value(&value), r#"[["end",9],["start",3]]"#);
    }

    #[test]
    fn test_fingerprint_capability() {
        struct Corpus {
            revision: u64,
        }

        impl Fingerprint for Corpus {
            fn fingerprint(&self) -> String {
                format!("corpus-r{}", self.revision)
            }
        }

        let value = fingerprinted(&Corpus { revision: 7 });
        let rendered = serialize_value(&value);
        assert!(rendered.contains("corpus-r7"));
        assert!(rendered.contains("Corpus"));
    }
}
