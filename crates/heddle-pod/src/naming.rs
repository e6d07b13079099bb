//! Deterministic node IDs and pod names
//!
//! Pod names are derived from stable step identity only, so a retried create
//! for the same step always targets the same object name.

use serde::Deserialize;

use crate::constants::MAX_K8S_NAME_LENGTH;

/// Length reserved for the `-<hash>` suffix of v2 pod names
const HASH_SUFFIX_LENGTH: usize = 11;

/// Pod naming scheme
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodNameVersion {
    /// Pod name equals node ID
    V1,
    /// `<workflow>-<template>-<hash(node name)>`
    #[default]
    V2,
}

/// 32-bit FNV-1a
fn fnv32a(input: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    input.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    })
}

/// Node ID for a node name within a workflow
///
/// The workflow's root node shares the workflow's name.
pub fn node_id(workflow_name: &str, node_name: &str) -> String {
    if workflow_name == node_name {
        return workflow_name.to_string();
    }
    format!("{}-{}", workflow_name, fnv32a(node_name))
}

/// Pod name for a step
pub fn pod_name(
    workflow_name: &str,
    node_name: &str,
    template_name: &str,
    node_id: &str,
    version: PodNameVersion,
) -> String {
    match version {
        PodNameVersion::V1 => node_id.to_string(),
        PodNameVersion::V2 => {
            if workflow_name == node_name {
                return workflow_name.to_string();
            }
            let prefix = if template_name.is_empty() {
                workflow_name.to_string()
            } else {
                format!("{}-{}", workflow_name, template_name)
            };
            format!(
                "{}-{}",
                truncate(&prefix, MAX_K8S_NAME_LENGTH - HASH_SUFFIX_LENGTH),
                fnv32a(node_name)
            )
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
