//! `{{...}}` placeholder substitution
//!
//! Substitution runs over the serialized JSON form of an object, so values
//! are JSON-escaped before they are spliced in.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodSpec};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::Serialize;

use heddle_common::{Error, Result};

use crate::constants::{ENV_TEMPLATE, LOCAL_VAR_POD_NAME};
use crate::types::Template;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder pattern is valid"));

/// Parameter table keyed by placeholder name
pub type Params = BTreeMap<String, String>;

fn escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Substitute every known placeholder in `text`
///
/// Unknown placeholders are left in place when `allow_unresolved` is set and
/// are an error otherwise.
pub fn replace(text: &str, params: &Params, allow_unresolved: bool) -> Result<String> {
    let mut unresolved = None;
    let replaced = PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
        let tag = caps[1].trim();
        match params.get(tag) {
            Some(value) => escape(value),
            None => {
                if unresolved.is_none() {
                    unresolved = Some(tag.to_string());
                }
                caps[0].to_string()
            }
        }
    });
    match unresolved {
        Some(tag) if !allow_unresolved => Err(Error::bad_request(format!(
            "failed to resolve {{{{{}}}}}",
            tag
        ))),
        _ => Ok(replaced.into_owned()),
    }
}

/// Parameters visible to a step's pod: workflow globals, the template's
/// input parameters and the pod's own name
pub fn pod_params(globals: &Params, tmpl: &Template, pod_name: &str) -> Params {
    let mut params = globals.clone();
    for param in &tmpl.inputs.parameters {
        if let Some(value) = &param.value {
            params.insert(format!("inputs.parameters.{}", param.name), value.clone());
        }
    }
    params.insert(LOCAL_VAR_POD_NAME.to_string(), pod_name.to_string());
    params
}

fn substitute_json<T: Serialize + DeserializeOwned>(
    obj: &T,
    params: &Params,
    what: &str,
) -> Result<T> {
    let text = serde_json::to_string(obj).map_err(|e| {
        Error::internal_with_context("substitute", format!("failed to marshal {}: {}", what, e))
    })?;
    let replaced = replace(&text, params, true)?;
    serde_json::from_str(&replaced).map_err(|e| {
        Error::internal_with_context(
            "substitute",
            format!("failed to unmarshal {} after substitution: {}", what, e),
        )
    })
}

/// Substitute placeholders throughout the pod
///
/// Placeholders the controller cannot resolve are left for the executor.
pub fn substitute_pod(pod: &Pod, params: &Params) -> Result<Pod> {
    substitute_json(pod, params, "pod")
}

/// Fail on the first placeholder left in `obj`
pub fn verify_resolved<T: Serialize>(obj: &T) -> Result<()> {
    let text = serde_json::to_string(obj)?;
    match PLACEHOLDER.captures(&text) {
        Some(caps) => Err(Error::bad_request(format!(
            "failed to resolve {}",
            &caps[0]
        ))),
        None => Ok(()),
    }
}

/// Check the archive location the executor will receive has no placeholders
///
/// The location comes from cluster configuration, where nothing downstream
/// could resolve it.
pub fn verify_archive_location(spec: &PodSpec) -> Result<()> {
    let serialized = spec
        .containers
        .iter()
        .flat_map(|c| c.env.iter().flatten())
        .find(|e| e.name == ENV_TEMPLATE)
        .and_then(|e| e.value.as_deref());
    let Some(serialized) = serialized else {
        return Ok(());
    };
    let tmpl: Template = serde_json::from_str(serialized).map_err(|e| {
        Error::internal_with_context("substitute", format!("failed to unmarshal template: {}", e))
    })?;
    match &tmpl.archive_location {
        Some(location) => verify_resolved(location),
        None => Ok(()),
    }
}
