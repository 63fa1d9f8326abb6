//! JSON patch encoding
//!
//! The patch is a generic value diff between the pod exactly as the API
//! server sent it and the mutated pod, so any field the mutation touched
//! shows up without hand-written operations.

use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use serde_json::{Map, Value};

use super::error::Result;

/// Rebuild every object with its keys in sorted order and null members dropped.
///
/// serde_json may be built with `preserve_order`, in which case key order
/// would follow the input bytes and leak into the diff. The API server sends
/// unset fields such as `metadata.creationTimestamp` as explicit nulls, which
/// the typed pod omits on re-serialization; Kubernetes treats both as absent.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.into_iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Compute the patch transforming `original` into `mutated`
pub fn diff(original: &[u8], mutated: &Pod) -> Result<Patch> {
    let original: Value = serde_json::from_slice(original)?;
    let mutated = serde_json::to_value(mutated)?;
    Ok(json_patch::diff(
        &canonicalize(original),
        &canonicalize(mutated),
    ))
}

/// Compute and serialize the patch transforming `original` into `mutated`
pub fn encode(original: &[u8], mutated: &Pod) -> Result<Vec<u8>> {
    let patch = diff(original, mutated)?;
    Ok(serde_json::to_vec(&patch)?)
}
