//! Credential secret aggregation
//!
//! Artifact backends reference credentials as (secret, key) pairs. Every
//! distinct secret becomes one secret volume, and every distinct pair one
//! key-to-path item inside it, no matter how many artifacts share them.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{KeyToPath, SecretVolumeSource, Volume, VolumeMount};

use crate::constants::SECRET_VOL_MOUNT_PATH;
use crate::types::{SecretKeySelector, Template};

/// Secret volumes keyed by secret name
#[derive(Debug, Default)]
pub struct SecretVolumes {
    items: BTreeMap<String, Vec<KeyToPath>>,
    seen: HashSet<(String, String)>,
}

impl SecretVolumes {
    /// Collect every credential the template's artifacts reference
    ///
    /// Scans the archive location, outputs, inputs and a data template's
    /// source artifact.
    pub fn from_template(tmpl: &Template) -> Self {
        let mut volumes = Self::default();
        if let Some(location) = &tmpl.archive_location {
            volumes.extend(location.secret_selectors());
        }
        for art in tmpl.outputs.artifacts.iter().chain(&tmpl.inputs.artifacts) {
            volumes.extend(art.location.secret_selectors());
        }
        if let Some(art) = tmpl.data_source_artifact() {
            volumes.extend(art.location.secret_selectors());
        }
        volumes
    }

    fn extend<'a>(&mut self, selectors: impl IntoIterator<Item = &'a SecretKeySelector>) {
        for selector in selectors {
            self.add(selector);
        }
    }

    /// Record one reference; incomplete selectors are ignored
    pub fn add(&mut self, selector: &SecretKeySelector) {
        if selector.name.is_empty() || selector.key.is_empty() {
            return;
        }
        if !self
            .seen
            .insert((selector.name.clone(), selector.key.clone()))
        {
            return;
        }
        self.items
            .entry(selector.name.clone())
            .or_default()
            .push(KeyToPath {
                key: selector.key.clone(),
                path: selector.key.clone(),
                mode: None,
            });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Volumes plus the read-only mounts that expose them to executor containers
    pub fn into_volumes(self) -> (Vec<Volume>, Vec<VolumeMount>) {
        self.items
            .into_iter()
            .map(|(name, items)| {
                let volume = Volume {
                    name: name.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(name.clone()),
                        items: Some(items),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                let mount = VolumeMount {
                    mount_path: format!("{}/{}", SECRET_VOL_MOUNT_PATH, name),
                    name,
                    read_only: Some(true),
                    ..Default::default()
                };
                (volume, mount)
            })
            .unzip()
    }
}
