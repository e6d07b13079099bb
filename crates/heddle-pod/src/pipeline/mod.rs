//! Synthesis stages, applied in order by the synthesizer
//!
//! Stages take the pod spec by value and hand back the next state, so no
//! stage ever observes a half-applied change from another.

pub mod archive;
pub mod containers;
pub mod deadline;
pub mod patch;
pub mod scheduling;
pub mod secrets;
pub mod service_account;
pub mod substitute;
pub mod volumes;

use k8s_openapi::api::core::v1::{Container, VolumeMount};

use crate::constants::MAIN_CONTAINER_NAME;

/// First container in `containers` named `name`
pub(crate) fn find_container_mut<'a>(
    containers: &'a mut [Container],
    name: &str,
) -> Option<&'a mut Container> {
    containers.iter_mut().find(|c| c.name == name)
}

/// The user's main container, if the pod has one
pub(crate) fn main_container(containers: &[Container]) -> Option<&Container> {
    containers.iter().find(|c| c.name == MAIN_CONTAINER_NAME)
}

pub(crate) fn push_mounts(
    container: &mut Container,
    mounts: impl IntoIterator<Item = VolumeMount>,
) {
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .extend(mounts);
}
