//! Overlay patches
//!
//! Overlays are JSON-pointer edits applied to the mutated object just before
//! it is written. The applier works on plain JSON; turning the result back
//! into a typed object is the caller's job, so that a patch which breaks the
//! object shape surfaces as an invalid object rather than an overlay error.

use json_patch::Patch;
use kube::api::DynamicObject;
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use crate::crd::{GroupVersionKind, OverlayPatch, OverlayPatchType};
use crate::sync::ManagedObject;
use crate::Error;

/// Applies overlay patches to an object of a given kind
#[cfg_attr(test, automock)]
pub trait OverlayApplier: Send + Sync {
    /// Apply `patches` when `obj` is of kind `gvk`; otherwise return it unchanged
    fn apply_overlay(
        &self,
        obj: &DynamicObject,
        gvk: &GroupVersionKind,
        patches: &[OverlayPatch],
    ) -> Result<Value, Error>;
}

/// [`OverlayApplier`] built on RFC 6902 JSON patches
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonPatchOverlay;

impl OverlayApplier for JsonPatchOverlay {
    fn apply_overlay(
        &self,
        obj: &DynamicObject,
        gvk: &GroupVersionKind,
        patches: &[OverlayPatch],
    ) -> Result<Value, Error> {
        let mut doc = serde_json::to_value(obj).map_err(|e| Error::serialization(e.to_string()))?;
        if patches.is_empty() || obj.gvk().as_ref() != Some(gvk) {
            return Ok(doc);
        }

        for overlay in patches {
            let Some(patch) = to_json_patch(&doc, overlay)? else {
                continue;
            };
            json_patch::patch(&mut doc, &patch.0)
                .map_err(|e| Error::overlay(format!("{:?} {}: {e}", overlay.type_, overlay.path)))?;
        }
        Ok(doc)
    }
}

/// Translate one overlay into a JSON patch against the current document.
///
/// Returns `None` for removals of paths that do not exist.
fn to_json_patch(doc: &Value, overlay: &OverlayPatch) -> Result<Option<Patch>, Error> {
    let exists = doc.pointer(&overlay.path).is_some();
    let ops = match overlay.type_ {
        OverlayPatchType::Replace => {
            let op = if exists { "replace" } else { "add" };
            json!([{ "op": op, "path": overlay.path, "value": overlay_value(overlay)? }])
        }
        OverlayPatchType::Remove if exists => json!([{ "op": "remove", "path": overlay.path }]),
        OverlayPatchType::Remove => return Ok(None),
    };
    serde_json::from_value(ops)
        .map(Some)
        .map_err(|e| Error::overlay(format!("invalid patch path {:?}: {e}", overlay.path)))
}

fn overlay_value(overlay: &OverlayPatch) -> Result<Value, Error> {
    match (&overlay.value, overlay.parse_value) {
        (Some(Value::String(raw)), true) => serde_yaml::from_str(raw)
            .map_err(|e| Error::overlay(format!("could not parse value for {}: {e}", overlay.path))),
        (Some(value), _) => Ok(value.clone()),
        (None, _) => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::{ObjectMeta, TypeMeta};

    fn deployment() -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: json!({"spec": {"replicas": 3, "paused": false}}),
        }
    }

    fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "Deployment")
    }

    fn replace(path: &str, value: Value) -> OverlayPatch {
        OverlayPatch {
            type_: OverlayPatchType::Replace,
            path: path.to_string(),
            value: Some(value),
            parse_value: false,
        }
    }

    fn remove(path: &str) -> OverlayPatch {
        OverlayPatch {
            type_: OverlayPatchType::Remove,
            path: path.to_string(),
            value: None,
            parse_value: false,
        }
    }

    #[test]
    fn replace_existing_and_add_missing() {
        let patched = JsonPatchOverlay
            .apply_overlay(
                &deployment(),
                &gvk(),
                &[replace("/spec/replicas", json!(1)), replace("/spec/minReadySeconds", json!(5))],
            )
            .unwrap();
        assert_eq!(patched["spec"]["replicas"], 1);
        assert_eq!(patched["spec"]["minReadySeconds"], 5);
    }

    #[test]
    fn remove_existing_and_ignore_missing() {
        let patched = JsonPatchOverlay
            .apply_overlay(&deployment(), &gvk(), &[remove("/spec/paused"), remove("/spec/strategy")])
            .unwrap();
        assert!(patched["spec"].get("paused").is_none());
        assert_eq!(patched["spec"]["replicas"], 3);
    }

    #[test]
    fn parse_value_reads_yaml() {
        let overlay = OverlayPatch {
            parse_value: true,
            ..replace("/spec/selector", json!("matchLabels:\n  app: web\n"))
        };
        let patched = JsonPatchOverlay
            .apply_overlay(&deployment(), &gvk(), &[overlay])
            .unwrap();
        assert_eq!(patched["spec"]["selector"]["matchLabels"]["app"], "web");
    }

    #[test]
    fn other_kinds_are_left_alone() {
        let other = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let patched = JsonPatchOverlay
            .apply_overlay(&deployment(), &other, &[replace("/spec/replicas", json!(1))])
            .unwrap();
        assert_eq!(patched["spec"]["replicas"], 3);
    }

    #[test]
    fn bad_paths_are_overlay_errors() {
        let err = JsonPatchOverlay
            .apply_overlay(&deployment(), &gvk(), &[replace("/spec/template/spec/x", json!(1))])
            .unwrap_err();
        assert!(matches!(err, Error::Overlay(_)), "{err}");
        assert!(err.is_retryable());
    }
}
