//! Scheduling constraints and pod metadata
//!
//! Every constraint is taken from the template when set there and from the
//! workflow otherwise. Host aliases are the exception: both lists apply.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::constants::HOSTNAME_LABEL;
use crate::types::{Metadata, Template, WorkflowSpec};

fn non_empty(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|v| !v.is_empty())
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

/// Apply node selection, affinity, tolerations and the remaining scheduling knobs
pub fn add_scheduling_constraints(
    mut spec: PodSpec,
    tmpl: &Template,
    wf: &WorkflowSpec,
) -> PodSpec {
    if let Some(selector) =
        non_empty_map(&tmpl.node_selector).or_else(|| non_empty_map(&wf.node_selector))
    {
        spec.node_selector = Some(selector);
    }
    if let Some(affinity) = tmpl.affinity.as_ref().or(wf.affinity.as_ref()) {
        spec.affinity = Some(affinity.clone());
    }
    let tolerations = if tmpl.tolerations.is_empty() {
        &wf.tolerations
    } else {
        &tmpl.tolerations
    };
    if !tolerations.is_empty() {
        spec.tolerations = Some(tolerations.clone());
    }
    if let Some(name) = non_empty(&tmpl.scheduler_name).or(non_empty(&wf.scheduler_name)) {
        spec.scheduler_name = Some(name.clone());
    }
    if let Some(class) =
        non_empty(&tmpl.priority_class_name).or(non_empty(&wf.pod_priority_class_name))
    {
        spec.priority_class_name = Some(class.clone());
    }
    if let Some(priority) = tmpl.priority.or(wf.pod_priority) {
        spec.priority = Some(priority);
    }

    let aliases: Vec<_> = wf
        .host_aliases
        .iter()
        .chain(&tmpl.host_aliases)
        .cloned()
        .collect();
    if !aliases.is_empty() {
        spec.host_aliases.get_or_insert_with(Vec::new).extend(aliases);
    }

    if let Some(sc) = tmpl.security_context.as_ref().or(wf.security_context.as_ref()) {
        spec.security_context = Some(sc.clone());
    }
    spec
}

/// Keep a retried step off the hosts its earlier attempts failed on
///
/// The exclusion is added to every required node selector term, since terms
/// are ORed and any one of them could otherwise admit a failed host.
pub fn add_retry_anti_affinity(mut spec: PodSpec, failed_hosts: Vec<String>) -> PodSpec {
    if failed_hosts.is_empty() {
        return spec;
    }
    let requirement = NodeSelectorRequirement {
        key: HOSTNAME_LABEL.to_string(),
        operator: "NotIn".to_string(),
        values: Some(failed_hosts),
    };

    let required = spec
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);

    if required.node_selector_terms.is_empty() {
        required.node_selector_terms.push(NodeSelectorTerm {
            match_expressions: Some(vec![requirement]),
            match_fields: None,
        });
    } else {
        for term in &mut required.node_selector_terms {
            term.match_expressions
                .get_or_insert_with(Vec::new)
                .push(requirement.clone());
        }
    }
    spec
}

fn merge_metadata(meta: &mut ObjectMeta, extra: &Metadata) {
    if !extra.labels.is_empty() {
        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(extra.labels.clone());
    }
    if !extra.annotations.is_empty() {
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(extra.annotations.clone());
    }
}

/// Add workflow pod metadata, then template metadata on top
pub fn add_metadata(mut meta: ObjectMeta, tmpl: &Template, wf: &WorkflowSpec) -> ObjectMeta {
    if let Some(pod_metadata) = &wf.pod_metadata {
        merge_metadata(&mut meta, pod_metadata);
    }
    merge_metadata(&mut meta, &tmpl.metadata);
    meta
}
