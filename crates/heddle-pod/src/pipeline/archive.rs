//! Default archive location for a step's logs and artifacts

use tracing::debug;

use crate::cluster::ArtifactRepository;
use crate::types::{Template, WorkflowSpec};

/// Whether the step's container logs are archived
///
/// Controller-enabled archiving always wins. Otherwise the template's setting
/// beats the workflow's, and archiving stays off when neither says.
pub fn is_archive_logs(tmpl: &Template, repo: &dyn ArtifactRepository, wf: &WorkflowSpec) -> bool {
    if repo.is_archive_logs() {
        return true;
    }
    tmpl.archive_location
        .as_ref()
        .and_then(|l| l.archive_logs)
        .or(wf.archive_logs)
        .unwrap_or(false)
}

/// Fill in the repository's location when the step needs one and has none
///
/// A location is needed when logs are archived or any artifact has no
/// location of its own.
pub fn add_archive_location(
    mut tmpl: Template,
    repo: &dyn ArtifactRepository,
    wf: &WorkflowSpec,
) -> Template {
    if tmpl.archive_location.as_ref().is_some_and(|l| l.has_location()) {
        return tmpl;
    }
    let archive_logs = is_archive_logs(&tmpl, repo, wf);
    let need_location = archive_logs
        || tmpl
            .inputs
            .artifacts
            .iter()
            .chain(&tmpl.outputs.artifacts)
            .any(|a| !a.has_location());
    debug!(template = %tmpl.name, need_location, "resolving archive location");
    if need_location {
        let mut location = repo.to_location();
        location.archive_logs = Some(archive_logs);
        tmpl.archive_location = Some(location);
    }
    tmpl
}
