//! Volume resolution and artifact plumbing
//!
//! Pod volumes come from four places: executor plumbing, user references
//! resolved against the template and workflow, credential secrets, and the
//! shared emptyDirs the executor stages inputs and scripts through.

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PodSpec, SecretVolumeSource, Volume, VolumeMount,
};
use tracing::{debug, info};

use heddle_common::{Error, Result};

use super::secrets::SecretVolumes;
use super::{find_container_mut, push_mounts};
use crate::config::ControllerConfig;
use crate::constants::{
    ARTIFACT_BASE_DIR, INIT_CONTAINER_NAME, INPUT_ARTIFACTS_VOLUME_NAME, MAIN_CONTAINER_NAME,
    MAIN_FILESYSTEM_DIR, STAGING_DIR, STAGING_VOLUME_NAME, VAR_RUN_PATH, VAR_RUN_VOLUME_NAME,
    WAIT_CONTAINER_NAME,
};
use crate::executor::docker_sock_volume;
use crate::types::{Template, TemplateType};

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Executor scratch volume
pub fn var_run_volume() -> Volume {
    empty_dir(VAR_RUN_VOLUME_NAME)
}

/// Mount of the executor scratch volume, present on every container
pub fn var_run_mount() -> VolumeMount {
    VolumeMount {
        name: VAR_RUN_VOLUME_NAME.to_string(),
        mount_path: VAR_RUN_PATH.to_string(),
        ..Default::default()
    }
}

/// Add `volume` unless the pod already has it
///
/// A different volume under the same name would leave the pod with
/// duplicate names and mounts bound to the wrong source, so that is a bad
/// request.
pub(crate) fn add_volume(volumes: &mut Vec<Volume>, volume: Volume) -> Result<()> {
    match volumes.iter().find(|v| v.name == volume.name) {
        None => volumes.push(volume),
        Some(existing) if *existing == volume => {}
        Some(_) => {
            return Err(Error::bad_request(format!(
                "volume name '{}' is already used by another volume in the pod",
                volume.name
            )));
        }
    }
    Ok(())
}

/// Volumes every pod starts with
///
/// Kubeconfig secret (when configured), executor scratch space, the engine
/// socket for the docker executor, then the template's own volumes.
pub fn base_volumes(tmpl: &Template, config: &ControllerConfig) -> Result<Vec<Volume>> {
    let mut volumes = Vec::new();
    if let Some(kube_config) = &config.kube_config {
        volumes.push(Volume {
            name: kube_config.volume_name().to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(kube_config.secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes.push(var_run_volume());
    if config.container_runtime_executor.mounts_docker_socket() {
        volumes.push(docker_sock_volume(tmpl, config));
    }
    for volume in &tmpl.volumes {
        add_volume(&mut volumes, volume.clone())?;
    }
    Ok(volumes)
}

/// Path of `path` as seen from an executor container through main's filesystem
pub fn main_filesystem_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        MAIN_FILESYSTEM_DIR.to_string()
    } else {
        format!("{}/{}", MAIN_FILESYSTEM_DIR, trimmed)
    }
}

fn is_windows_unc_path(path: &str, tmpl: &Template) -> bool {
    tmpl.targets_windows() && path.starts_with(r"\\")
}

/// Resolve every volume the user's containers mount, then attach credential secrets
///
/// Names resolve against template volumes, then workflow volumes, then the
/// workflow's generated claims. Each resolved volume is added once, and a
/// credential secret may not reuse the name of a volume already in the pod.
pub fn add_volume_references(
    mut spec: PodSpec,
    tmpl: &Template,
    workflow_volumes: &[Volume],
    claims: &[Volume],
) -> Result<PodSpec> {
    if !tmpl.template_type().mounts_user_volumes() {
        return Ok(spec);
    }

    let lookup = |name: &str| {
        tmpl.volumes
            .iter()
            .chain(workflow_volumes)
            .chain(claims)
            .find(|v| v.name == name)
    };

    let referenced = tmpl
        .volume_mounts()
        .iter()
        .chain(
            tmpl.init_containers
                .iter()
                .chain(&tmpl.sidecars)
                .flat_map(|c| c.container.volume_mounts.iter().flatten()),
        );

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    for mount in referenced {
        let volume = lookup(&mount.name).ok_or_else(|| {
            Error::bad_request(format!("volume '{}' not found in workflow spec", mount.name))
        })?;
        add_volume(volumes, volume.clone())?;
    }

    let (secret_volumes, secret_mounts) = SecretVolumes::from_template(tmpl).into_volumes();
    for volume in secret_volumes {
        add_volume(volumes, volume)?;
    }

    if let Some(wait) = find_container_mut(&mut spec.containers, WAIT_CONTAINER_NAME) {
        push_mounts(wait, secret_mounts.iter().cloned());
    }
    if let Some(init) = spec
        .init_containers
        .as_mut()
        .and_then(|c| find_container_mut(c, INIT_CONTAINER_NAME))
    {
        push_mounts(init, secret_mounts.iter().cloned());
    }
    if tmpl.template_type() == TemplateType::Data {
        if let Some(main) = find_container_mut(&mut spec.containers, MAIN_CONTAINER_NAME) {
            push_mounts(main, secret_mounts);
        }
    }

    Ok(spec)
}

/// Share an emptyDir between init (which loads input artifacts) and main
///
/// An artifact whose path sits inside a user volume mount is not mounted:
/// the outer bind mount would hide it, so init writes into the user's volume
/// instead.
pub fn add_input_artifact_volumes(mut spec: PodSpec, tmpl: &Template) -> Result<PodSpec> {
    if tmpl.inputs.artifacts.is_empty() {
        return Ok(spec);
    }

    add_volume(
        spec.volumes.get_or_insert_with(Vec::new),
        empty_dir(INPUT_ARTIFACTS_VOLUME_NAME),
    )?;

    if let Some(init) = spec
        .init_containers
        .as_mut()
        .and_then(|c| find_container_mut(c, INIT_CONTAINER_NAME))
    {
        let base = VolumeMount {
            name: INPUT_ARTIFACTS_VOLUME_NAME.to_string(),
            mount_path: ARTIFACT_BASE_DIR.to_string(),
            ..Default::default()
        };
        // init may have to load straight into a user volume
        let user_mounts = tmpl
            .volume_mounts()
            .iter()
            .filter(|m| !is_windows_unc_path(&m.mount_path, tmpl))
            .map(|m| VolumeMount {
                mount_path: main_filesystem_path(&m.mount_path),
                ..m.clone()
            });
        push_mounts(init, std::iter::once(base).chain(user_mounts));
    }

    let Some(main) = find_container_mut(&mut spec.containers, MAIN_CONTAINER_NAME) else {
        return Ok(spec);
    };
    for art in &tmpl.inputs.artifacts {
        if art.path.is_empty() {
            return Err(Error::bad_request_for_field(
                format!("inputs.artifacts.{}", art.name),
                format!("inputs.artifacts.{} did not specify a path", art.name),
            ));
        }
        if art.optional && !art.has_location_or_key() {
            info!(
                artifact = %art.name,
                path = %art.path,
                "skip volume mount: optional artifact was not provided"
            );
            continue;
        }
        if let Some(overlap) = tmpl.overlapping_volume_mount(&art.path) {
            debug!(
                artifact = %art.name,
                path = %art.path,
                mount = %overlap.name,
                mount_path = %overlap.mount_path,
                "skip volume mount: overlaps with user mount"
            );
            continue;
        }
        push_mounts(
            main,
            [VolumeMount {
                name: INPUT_ARTIFACTS_VOLUME_NAME.to_string(),
                mount_path: art.path.clone(),
                sub_path: Some(art.name.clone()),
                ..Default::default()
            }],
        );
    }
    Ok(spec)
}

/// Share an emptyDir between init (which writes the script) and main
pub fn add_script_staging_volume(mut spec: PodSpec) -> Result<PodSpec> {
    add_volume(
        spec.volumes.get_or_insert_with(Vec::new),
        empty_dir(STAGING_VOLUME_NAME),
    )?;

    let mount = VolumeMount {
        name: STAGING_VOLUME_NAME.to_string(),
        mount_path: STAGING_DIR.to_string(),
        ..Default::default()
    };
    if let Some(init) = spec
        .init_containers
        .as_mut()
        .and_then(|c| find_container_mut(c, INIT_CONTAINER_NAME))
    {
        push_mounts(init, [mount.clone()]);
    }
    let main = find_container_mut(&mut spec.containers, MAIN_CONTAINER_NAME).ok_or_else(|| {
        Error::internal_with_context("script-staging", "unable to locate main container")
    })?;
    push_mounts(main, [mount]);
    Ok(spec)
}

/// Mirror main's mounts into the wait container under main's filesystem prefix
///
/// The wait container then collects outputs written to mounted volumes
/// directly. Mirrors are always writable since they may overlap.
pub fn add_output_artifact_volumes(mut spec: PodSpec, tmpl: &Template) -> PodSpec {
    if !tmpl.template_type().needs_wait_container() {
        return spec;
    }

    let mirrored: Vec<VolumeMount> = spec
        .containers
        .iter()
        .filter(|c| c.name == MAIN_CONTAINER_NAME)
        .flat_map(|c| c.volume_mounts.iter().flatten())
        .filter(|m| !is_windows_unc_path(&m.mount_path, tmpl))
        .map(|m| VolumeMount {
            mount_path: main_filesystem_path(&m.mount_path),
            read_only: None,
            ..m.clone()
        })
        .collect();

    match find_container_mut(&mut spec.containers, WAIT_CONTAINER_NAME) {
        Some(wait) => push_mounts(wait, mirrored),
        None => info!("could not find wait container in pod spec"),
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorVariant;
    use crate::types::{
        Artifact, ArtifactLocation, DataTemplate, S3Artifact, SecretKeySelector, TemplateBody,
        UserContainer,
    };
    use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaimVolumeSource};

    fn mount(name: &str, path: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        }
    }

    fn named(name: &str) -> Container {
        Container {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn pvc(name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: format!("wf-{}", name),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn template_with_mounts(mounts: Vec<VolumeMount>) -> Template {
        Template::container(
            "t",
            Container {
                name: MAIN_CONTAINER_NAME.to_string(),
                volume_mounts: Some(mounts),
                ..Default::default()
            },
        )
    }

    fn pod_spec(main_mounts: Vec<VolumeMount>) -> PodSpec {
        PodSpec {
            containers: vec![
                named(WAIT_CONTAINER_NAME),
                Container {
                    volume_mounts: Some(main_mounts),
                    ..named(MAIN_CONTAINER_NAME)
                },
            ],
            init_containers: Some(vec![named(INIT_CONTAINER_NAME)]),
            volumes: Some(vec![var_run_volume()]),
            ..Default::default()
        }
    }

    fn volume_names(spec: &PodSpec) -> Vec<&str> {
        spec.volumes
            .iter()
            .flatten()
            .map(|v| v.name.as_str())
            .collect()
    }

    fn mounts_of<'a>(containers: &'a [Container], name: &str) -> Vec<&'a VolumeMount> {
        containers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.volume_mounts.iter().flatten().collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_base_volumes_per_executor() {
        let tmpl = Template::container("t", Container::default());
        let config = ControllerConfig::default();
        let names: Vec<_> = base_volumes(&tmpl, &config)
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["var-run-heddle"]);

        let docker = ControllerConfig {
            container_runtime_executor: ExecutorVariant::Docker,
            kube_config: Some(crate::config::KubeConfigSettings {
                secret_name: "kc".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let names: Vec<_> = base_volumes(&tmpl, &docker)
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["kubeconfig", "var-run-heddle", "docker-sock"]);
    }

    #[test]
    fn test_volume_resolution_precedence_and_dedup() {
        let mut tmpl = template_with_mounts(vec![mount("data", "/data"), mount("data", "/again")]);
        tmpl.sidecars.push(UserContainer {
            container: Container {
                volume_mounts: Some(vec![mount("cache", "/cache")]),
                ..named("redis")
            },
            mirror_volume_mounts: None,
        });
        let mut local = pvc("data");
        local.persistent_volume_claim.as_mut().unwrap().claim_name = "template-data".into();
        tmpl.volumes.push(local);

        let spec = add_volume_references(
            pod_spec(vec![]),
            &tmpl,
            &[pvc("data"), pvc("cache")],
            &[],
        )
        .unwrap();

        assert_eq!(volume_names(&spec), vec!["var-run-heddle", "data", "cache"]);
        let data = &spec.volumes.as_ref().unwrap()[1];
        assert_eq!(
            data.persistent_volume_claim.as_ref().unwrap().claim_name,
            "template-data"
        );
    }

    #[test]
    fn test_claims_resolve_last() {
        let tmpl = template_with_mounts(vec![mount("workdir", "/work")]);
        let spec = add_volume_references(pod_spec(vec![]), &tmpl, &[], &[pvc("workdir")]).unwrap();
        assert_eq!(volume_names(&spec), vec!["var-run-heddle", "workdir"]);
    }

    #[test]
    fn test_unresolved_volume_is_bad_request() {
        let tmpl = template_with_mounts(vec![mount("missing", "/m")]);
        let err = add_volume_references(pod_spec(vec![]), &tmpl, &[], &[]).unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
        assert!(err
            .to_string()
            .contains("volume 'missing' not found in workflow spec"));
    }

    #[test]
    fn test_secret_volume_may_not_shadow_user_volume() {
        let mut tmpl = template_with_mounts(vec![mount("creds", "/scratch")]);
        tmpl.inputs.artifacts.push(Artifact {
            location: ArtifactLocation {
                s3: Some(S3Artifact {
                    access_key_secret: Some(SecretKeySelector::new("creds", "a")),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Artifact::new("in", "/in")
        });
        let err = add_volume_references(pod_spec(vec![]), &tmpl, &[pvc("creds")], &[])
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
        assert!(err.to_string().contains("volume name 'creds' is already used"));
    }

    #[test]
    fn test_identical_volume_is_added_once() {
        let mut volumes = vec![pvc("data")];
        add_volume(&mut volumes, pvc("data")).unwrap();
        assert_eq!(volumes.len(), 1);

        let mut other = pvc("data");
        other.persistent_volume_claim.as_mut().unwrap().claim_name = "elsewhere".into();
        assert!(matches!(
            add_volume(&mut volumes, other).unwrap_err(),
            Error::BadRequest { .. }
        ));
    }

    #[test]
    fn test_template_volume_may_not_shadow_executor_volume() {
        let mut tmpl = Template::container("t", Container::default());
        tmpl.volumes.push(pvc(VAR_RUN_VOLUME_NAME));
        let err = base_volumes(&tmpl, &ControllerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[test]
    fn test_generated_emptydirs_may_not_shadow_user_volumes() {
        let mut tmpl = template_with_mounts(vec![]);
        tmpl.inputs.artifacts = vec![Artifact::new("code", "/src")];
        let mut spec = pod_spec(vec![]);
        spec.volumes
            .as_mut()
            .unwrap()
            .push(pvc(INPUT_ARTIFACTS_VOLUME_NAME));
        assert!(matches!(
            add_input_artifact_volumes(spec, &tmpl).unwrap_err(),
            Error::BadRequest { .. }
        ));

        let mut spec = pod_spec(vec![]);
        spec.volumes.as_mut().unwrap().push(pvc(STAGING_VOLUME_NAME));
        assert!(matches!(
            add_script_staging_volume(spec).unwrap_err(),
            Error::BadRequest { .. }
        ));
    }

    #[test]
    fn test_secret_mounts_go_to_executor_containers() {
        let mut tmpl = template_with_mounts(vec![]);
        tmpl.inputs.artifacts.push(Artifact {
            location: ArtifactLocation {
                s3: Some(S3Artifact {
                    access_key_secret: Some(SecretKeySelector::new("creds", "a")),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Artifact::new("in", "/in")
        });
        let spec = add_volume_references(pod_spec(vec![]), &tmpl, &[], &[]).unwrap();
        assert_eq!(mounts_of(&spec.containers, WAIT_CONTAINER_NAME).len(), 1);
        assert_eq!(
            mounts_of(spec.init_containers.as_ref().unwrap(), INIT_CONTAINER_NAME).len(),
            1
        );
        assert!(mounts_of(&spec.containers, MAIN_CONTAINER_NAME).is_empty());
    }

    #[test]
    fn test_data_template_mounts_secrets_on_main() {
        let mut source = Artifact::new("src", "");
        source.location.s3 = Some(S3Artifact {
            secret_key_secret: Some(SecretKeySelector::new("creds", "s")),
            ..Default::default()
        });
        let tmpl = Template::with_body(
            "d",
            TemplateBody::Data(DataTemplate {
                source: crate::types::DataSource {
                    artifact_paths: Some(source),
                },
                transformation: vec![],
            }),
        );
        let spec = PodSpec {
            containers: vec![named(MAIN_CONTAINER_NAME)],
            ..Default::default()
        };
        let spec = add_volume_references(spec, &tmpl, &[], &[]).unwrap();
        assert_eq!(mounts_of(&spec.containers, MAIN_CONTAINER_NAME).len(), 1);
    }

    #[test]
    fn test_input_artifacts_shared_with_init_and_main() {
        let mut tmpl = template_with_mounts(vec![mount("data", "/data")]);
        tmpl.inputs.artifacts = vec![
            Artifact::new("code", "/src"),
            Artifact::new("nested", "/data/sub"),
        ];
        let spec = add_input_artifact_volumes(pod_spec(vec![mount("data", "/data")]), &tmpl)
            .unwrap();

        assert!(volume_names(&spec).contains(&INPUT_ARTIFACTS_VOLUME_NAME));
        let init = mounts_of(spec.init_containers.as_ref().unwrap(), INIT_CONTAINER_NAME);
        assert_eq!(init[0].mount_path, ARTIFACT_BASE_DIR);
        assert_eq!(init[1].mount_path, "/mainctrfs/data");

        let main = mounts_of(&spec.containers, MAIN_CONTAINER_NAME);
        let artifact_mounts: Vec<_> = main
            .iter()
            .filter(|m| m.name == INPUT_ARTIFACTS_VOLUME_NAME)
            .collect();
        assert_eq!(artifact_mounts.len(), 1);
        assert_eq!(artifact_mounts[0].mount_path, "/src");
        assert_eq!(artifact_mounts[0].sub_path.as_deref(), Some("code"));
    }

    #[test]
    fn test_optional_missing_artifact_is_skipped() {
        let mut tmpl = template_with_mounts(vec![]);
        let mut art = Artifact::new("maybe", "/maybe");
        art.optional = true;
        tmpl.inputs.artifacts = vec![art];
        let spec = add_input_artifact_volumes(pod_spec(vec![]), &tmpl).unwrap();
        assert!(mounts_of(&spec.containers, MAIN_CONTAINER_NAME).is_empty());
    }

    #[test]
    fn test_artifact_without_path_is_rejected() {
        let mut tmpl = template_with_mounts(vec![]);
        tmpl.inputs.artifacts = vec![Artifact::new("nopath", "")];
        let err = add_input_artifact_volumes(pod_spec(vec![]), &tmpl).unwrap_err();
        assert!(err
            .to_string()
            .contains("inputs.artifacts.nopath did not specify a path"));
    }

    #[test]
    fn test_script_staging_volume() {
        let spec = add_script_staging_volume(pod_spec(vec![])).unwrap();
        assert!(volume_names(&spec).contains(&STAGING_VOLUME_NAME));
        assert_eq!(
            mounts_of(&spec.containers, MAIN_CONTAINER_NAME)[0].mount_path,
            STAGING_DIR
        );

        let no_main = PodSpec {
            containers: vec![named(WAIT_CONTAINER_NAME)],
            ..Default::default()
        };
        assert!(matches!(
            add_script_staging_volume(no_main).unwrap_err(),
            Error::Internal { .. }
        ));
    }

    #[test]
    fn test_output_mirroring_into_wait() {
        let tmpl = template_with_mounts(vec![]);
        let mut ro = mount("data", "/data");
        ro.read_only = Some(true);
        let spec = add_output_artifact_volumes(pod_spec(vec![ro]), &tmpl);
        let wait = mounts_of(&spec.containers, WAIT_CONTAINER_NAME);
        assert_eq!(wait.len(), 1);
        assert_eq!(wait[0].mount_path, "/mainctrfs/data");
        assert_eq!(wait[0].read_only, None);
    }

    #[test]
    fn test_main_filesystem_path() {
        assert_eq!(main_filesystem_path("/data/"), "/mainctrfs/data");
        assert_eq!(main_filesystem_path("/"), "/mainctrfs");
        assert_eq!(main_filesystem_path("/a/b"), "/mainctrfs/a/b");
    }
}
