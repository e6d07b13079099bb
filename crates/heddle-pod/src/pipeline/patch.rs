//! podSpecPatch handling
//!
//! Patches use strategic-merge semantics over the pod spec's JSON form:
//! objects merge key by key, lists of named objects merge element-wise on
//! their merge key, every other list is replaced, and `null` deletes.

use k8s_openapi::api::core::v1::PodSpec;
use serde_json::{Map, Value};
use tracing::debug;

use heddle_common::yaml::parse_yaml;
use heddle_common::{Error, Result};

use crate::types::{Template, WorkflowSpec};

/// Directive key understood on list elements and objects
const PATCH_DIRECTIVE: &str = "$patch";

/// Merge key of the list stored under `field`, for lists that merge element-wise
fn merge_key(field: &str) -> Option<&'static str> {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "volumes" | "env"
        | "imagePullSecrets" | "resourceClaims" | "readinessGates" => Some("name"),
        "volumeMounts" => Some("mountPath"),
        "volumeDevices" => Some("devicePath"),
        "ports" => Some("containerPort"),
        "hostAliases" => Some("ip"),
        "topologySpreadConstraints" => Some("topologyKey"),
        _ => None,
    }
}

fn is_delete_directive(value: &Value) -> bool {
    value.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("delete")
}

/// Strategic merge of `patch` into `base`
pub fn strategic_merge(base: Value, patch: &Value) -> Value {
    merge_value(base, patch, None)
}

fn merge_value(base: Value, patch: &Value, field: Option<&str>) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => Value::Object(merge_object(base, patch)),
        (Value::Array(base), Value::Array(items)) => match field.and_then(merge_key) {
            Some(key) => Value::Array(merge_list(base, items, key)),
            None => Value::Array(items.clone()),
        },
        (_, patch) => strip_directives(patch.clone()),
    }
}

fn merge_object(mut base: Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    if patch.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("replace") {
        return match strip_directives(Value::Object(patch.clone())) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
    }
    for (key, value) in patch {
        if key == PATCH_DIRECTIVE {
            continue;
        }
        if value.is_null() {
            base.remove(key);
            continue;
        }
        let merged = match base.remove(key) {
            Some(existing) => merge_value(existing, value, Some(key)),
            None => strip_directives(value.clone()),
        };
        base.insert(key.clone(), merged);
    }
    base
}

fn merge_list(mut base: Vec<Value>, patch: &[Value], key: &str) -> Vec<Value> {
    for item in patch {
        let Some(id) = item.get(key).filter(|v| !v.is_null()) else {
            base.push(strip_directives(item.clone()));
            continue;
        };
        let position = base.iter().position(|b| b.get(key) == Some(id));
        match (position, is_delete_directive(item)) {
            (Some(idx), true) => {
                base.remove(idx);
            }
            (None, true) => {}
            (Some(idx), false) => {
                let existing = base.remove(idx);
                base.insert(idx, merge_value(existing, item, None));
            }
            (None, false) => base.push(strip_directives(item.clone())),
        }
    }
    base
}

/// Remove patch directives and nulls from a value that is inserted as-is
fn strip_directives(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, v)| k != PATCH_DIRECTIVE && !v.is_null())
                .map(|(k, v)| (k, strip_directives(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_directives).collect()),
        other => other,
    }
}

fn parse_patch(patch: &str, origin: &str) -> Result<Value> {
    parse_yaml(patch, origin).map_err(|e| Error::bad_request(e.to_string()))
}

/// Combined patch for a step: workflow patch first, template patch on top
///
/// Either patch may be JSON or YAML. The result is JSON.
pub fn merge_pod_spec_patches(wf: &WorkflowSpec, tmpl: &Template) -> Result<Option<String>> {
    let patches = [
        (
            "workflow podSpecPatch",
            wf.pod_spec_patch.as_deref().filter(|_| wf.has_pod_spec_patch()),
        ),
        (
            "template podSpecPatch",
            tmpl.pod_spec_patch.as_deref().filter(|_| tmpl.has_pod_spec_patch()),
        ),
    ];
    let mut merged: Option<Value> = None;
    for (origin, patch) in patches {
        let Some(patch) = patch else { continue };
        let value = parse_patch(patch, origin).map_err(|e| {
            Error::bad_request_for_field(
                "podSpecPatch",
                format!(
                    "failed to merge the workflow podSpecPatch with the template podSpecPatch \
                     due to invalid format: {}",
                    e
                ),
            )
        })?;
        merged = Some(match merged {
            Some(base) => strategic_merge(base, &value),
            None => value,
        });
    }
    merged
        .map(|v| serde_json::to_string(&v))
        .transpose()
        .map_err(|e| Error::internal_with_context("pod-spec-patch", e.to_string()))
}

/// Apply an already-substituted patch to the pod spec
///
/// The patch must read as a pod spec on its own; otherwise the step is a bad
/// request and nothing is merged.
pub fn apply_pod_spec_patch(spec: PodSpec, patch: &str) -> Result<PodSpec> {
    let invalid = |e: String| {
        Error::bad_request_for_field(
            "podSpecPatch",
            format!("invalid podSpecPatch {:?}: {}", patch, e),
        )
    };
    let patch_value = parse_patch(patch, "podSpecPatch").map_err(|e| invalid(e.to_string()))?;
    if !patch_value.is_object() {
        return Err(invalid("expected an object".to_string()));
    }

    // A patch rarely repeats the required container list; validate with an
    // empty one standing in
    let mut standalone = patch_value.clone();
    if let Value::Object(map) = &mut standalone {
        map.entry("containers").or_insert_with(|| Value::Array(vec![]));
    }
    serde_json::from_value::<PodSpec>(standalone).map_err(|e| invalid(e.to_string()))?;

    let base = serde_json::to_value(&spec)
        .map_err(|e| Error::internal_with_context("pod-spec-patch", e.to_string()))?;
    let merged = strategic_merge(base, &patch_value);
    debug!("applied podSpecPatch");
    serde_json::from_value(merged).map_err(|e| {
        Error::internal_with_context(
            "pod-spec-patch",
            format!("error in unmarshalling after merge the patch: {}", e),
        )
    })
}
