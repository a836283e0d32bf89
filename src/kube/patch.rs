//! JSON-patch builders for pod annotations and finalizers.
//!
//! Ops are built as plain JSON values and converted once when applied,
//! so the `test` preconditions (optimistic concurrency on the state
//! annotation, index check on finalizer removal) stay easy to read.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::Api;
use serde_json::{json, Value};

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn annotation_path(key: &str) -> String {
    format!("/metadata/annotations/{}", escape_pointer(key))
}

/// Upserts an annotation; an empty value removes it instead.
pub(crate) fn annotation_patch(key: &str, value: &str) -> Value {
    if value.is_empty() {
        json!({"op": "remove", "path": annotation_path(key)})
    } else {
        json!({"op": "add", "path": annotation_path(key), "value": value})
    }
}

/// Precondition: the annotation currently holds exactly `value`.
pub(crate) fn test_annotation(key: &str, value: &str) -> Value {
    json!({"op": "test", "path": annotation_path(key), "value": value})
}

/// Appends the finalizer unless already present, creating the list
/// under a nil precondition when the pod has none.
pub(crate) fn add_finalizer_patches(meta: &ObjectMeta, finalizer: &str) -> Vec<Value> {
    let finalizers = meta.finalizers.as_deref().unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return vec![];
    }

    let mut patches = vec![];
    if finalizers.is_empty() {
        patches.push(json!({"op": "test", "path": "/metadata/finalizers", "value": null}));
        patches.push(json!({"op": "add", "path": "/metadata/finalizers", "value": []}));
    }
    patches.push(json!({"op": "add", "path": "/metadata/finalizers/-", "value": finalizer}));
    patches
}

/// Removes the finalizer at its current index, guarded by a `test` op
/// so a concurrent list change fails the patch instead of removing the
/// wrong entry.
pub(crate) fn remove_finalizer_patches(meta: &ObjectMeta, finalizer: &str) -> Vec<Value> {
    let finalizers = meta.finalizers.as_deref().unwrap_or_default();
    let Some(index) = finalizers.iter().position(|f| f == finalizer) else {
        return vec![];
    };

    vec![
        json!({"op": "test", "path": format!("/metadata/finalizers/{index}"), "value": finalizer}),
        json!({"op": "remove", "path": format!("/metadata/finalizers/{index}")}),
    ]
}

pub(crate) async fn patch_pod(api: &Api<Pod>, name: &str, patches: Vec<Value>) -> Result<()> {
    if patches.is_empty() {
        return Ok(());
    }

    let patch: json_patch::Patch =
        serde_json::from_value(Value::Array(patches)).context("invalid JSON patch")?;
    api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
        .await
        .with_context(|| format!("failed to patch pod {name}"))?;
    Ok(())
}

/// Whether the pod behind a failed call is gone (404), looking through
/// any context wrapped around the kube error.
pub(crate) fn pod_is_gone(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<kube::Error>()
            .is_some_and(|err| matches!(err, kube::Error::Api(response) if response.code == 404))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_finalizers(finalizers: &[&str]) -> ObjectMeta {
        ObjectMeta {
            finalizers: if finalizers.is_empty() {
                None
            } else {
                Some(finalizers.iter().map(|f| f.to_string()).collect())
            },
            ..Default::default()
        }
    }

    #[test]
    fn annotation_keys_are_pointer_escaped() {
        let patch = annotation_patch("runner-manager.dev/runner-state", "x");
        assert_eq!(
            patch["path"],
            "/metadata/annotations/runner-manager.dev~1runner-state"
        );
        assert_eq!(patch["op"], "add");
    }

    #[test]
    fn empty_value_removes_the_annotation() {
        let patch = annotation_patch("a/b", "");
        assert_eq!(patch["op"], "remove");
    }

    #[test]
    fn first_finalizer_tests_for_nil() {
        let patches = add_finalizer_patches(&meta_with_finalizers(&[]), "f");
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[0]["op"], "test");
        assert_eq!(patches[0]["value"], serde_json::Value::Null);
        assert_eq!(patches[2]["path"], "/metadata/finalizers/-");
    }

    #[test]
    fn existing_finalizer_is_not_duplicated() {
        let patches = add_finalizer_patches(&meta_with_finalizers(&["f"]), "f");
        assert!(patches.is_empty());
    }

    #[test]
    fn appending_to_existing_list_skips_the_nil_test() {
        let patches = add_finalizer_patches(&meta_with_finalizers(&["other"]), "f");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0]["op"], "add");
    }

    #[test]
    fn removal_tests_the_index() {
        let patches = remove_finalizer_patches(&meta_with_finalizers(&["other", "f"]), "f");
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0]["op"], "test");
        assert_eq!(patches[0]["path"], "/metadata/finalizers/1");
        assert_eq!(patches[1]["op"], "remove");
    }

    #[test]
    fn removing_a_missing_finalizer_is_empty() {
        let patches = remove_finalizer_patches(&meta_with_finalizers(&["other"]), "f");
        assert!(patches.is_empty());
    }

    #[test]
    fn patches_decode_as_a_json_patch() {
        let ops = vec![
            test_annotation("a", "old"),
            annotation_patch("a", "new"),
        ];
        let patch: json_patch::Patch = serde_json::from_value(Value::Array(ops)).unwrap();
        assert_eq!(patch.0.len(), 2);
    }
}
