//! Merge-patch construction.
//!
//! JSON merge patches only delete map keys that are explicitly set to
//! `null`, so status patches are built as the new value plus a `null` for
//! every key the old value had and the new one dropped. Including
//! `metadata.resourceVersion` makes the API server reject the patch with
//! 409 when the object changed since it was read.

use serde::Serialize;
use serde_json::{Map, Value, json};

/// `new`, with `null` for every object key present in `old` but not in `new`.
pub fn merge_diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut out = Map::new();
            for (key, value) in new {
                let merged = match old.get(key) {
                    Some(prev) => merge_diff(prev, value),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                out.insert(key.clone(), Value::Null);
            }
            Value::Object(out)
        }
        _ => new.clone(),
    }
}

/// Status merge patch, compare-and-swap on `resource_version` when given.
pub fn status_patch<S: Serialize>(
    original: Option<&S>,
    status: &S,
    resource_version: Option<&str>,
) -> Result<Value, serde_json::Error> {
    let new = serde_json::to_value(status)?;
    let body = match original {
        Some(old) => merge_diff(&serde_json::to_value(old)?, &new),
        None => new,
    };
    Ok(with_resource_version(json!({ "status": body }), resource_version))
}

/// Finalizer merge patch, compare-and-swap on `resource_version` when given.
pub fn finalizers_patch(finalizers: &[String], resource_version: Option<&str>) -> Value {
    with_resource_version(
        json!({ "metadata": { "finalizers": finalizers } }),
        resource_version,
    )
}

fn with_resource_version(mut patch: Value, resource_version: Option<&str>) -> Value {
    if let Some(rv) = resource_version {
        let metadata = patch
            .as_object_mut()
            .map(|o| o.entry("metadata").or_insert_with(|| json!({})));
        if let Some(Value::Object(meta)) = metadata {
            meta.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_diff_nulls_removed_keys() {
        let old = json!({"ipv4": {"allocated": {"10.0.0.5": "aa", "10.0.0.6": "bb"}, "used": 2}});
        let new = json!({"ipv4": {"allocated": {"10.0.0.6": "bb"}, "used": 1}});
        let diff = merge_diff(&old, &new);
        assert_eq!(diff["ipv4"]["allocated"]["10.0.0.5"], Value::Null);
        assert_eq!(diff["ipv4"]["allocated"]["10.0.0.6"], "bb");
        assert_eq!(diff["ipv4"]["used"], 1);
    }

    #[test]
    fn test_merge_diff_replaces_arrays() {
        let old = json!({"conditions": [{"type": "Ready"}], "agentPodRef": {"name": "a"}});
        let new = json!({"conditions": []});
        let diff = merge_diff(&old, &new);
        assert_eq!(diff["conditions"], json!([]));
        assert_eq!(diff["agentPodRef"], Value::Null);
    }

    #[test]
    fn test_status_patch_carries_resource_version() {
        let patch = status_patch(None, &json!({"used": 1}), Some("42")).unwrap();
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["status"]["used"], 1);

        let patch = status_patch(None, &json!({}), None).unwrap();
        assert!(patch.get("metadata").is_none());
    }

    #[test]
    fn test_finalizers_patch() {
        let patch = finalizers_patch(&["a/b".to_string()], Some("7"));
        assert_eq!(patch, json!({"metadata": {"finalizers": ["a/b"], "resourceVersion": "7"}}));
    }
}
