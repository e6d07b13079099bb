//! Artifact locations and the credentials they reference

use serde::{Deserialize, Serialize};

/// Reference to one key of a Secret in the workflow's namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    /// Secret name
    #[serde(default)]
    pub name: String,
    /// Key within the secret
    #[serde(default)]
    pub key: String,
    /// Whether the secret or key may be absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

impl SecretKeySelector {
    /// Create a selector for `name`/`key`
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            optional: None,
        }
    }
}

/// S3-compatible object store location
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Artifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_secret: Option<SecretKeySelector>,
}

/// Git repository location
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitArtifact {
    #[serde(default)]
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key_secret: Option<SecretKeySelector>,
}

/// Artifactory location
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactoryArtifact {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeySelector>,
}

/// HDFS location
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HdfsArtifact {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub path: String,
    #[serde(
        default,
        rename = "krbCCacheSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub krb_ccache_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub krb_keytab_secret: Option<SecretKeySelector>,
}

/// Alibaba OSS location
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OssArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_secret: Option<SecretKeySelector>,
}

/// Google Cloud Storage location
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_key_secret: Option<SecretKeySelector>,
}

/// Plain HTTP(S) download
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpArtifact {
    #[serde(default)]
    pub url: String,
}

/// Inline artifact contents
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawArtifact {
    #[serde(default)]
    pub data: String,
}

/// Where an artifact lives; at most one backend is expected to be set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactLocation {
    /// Whether container logs are archived to this location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_logs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifactory: Option<ArtifactoryArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdfs: Option<HdfsArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oss: Option<OssArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawArtifact>,
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

impl ArtifactLocation {
    /// True when a backend is configured with enough detail to read or write
    pub fn has_location(&self) -> bool {
        self.s3
            .as_ref()
            .is_some_and(|s| is_set(&s.bucket) && is_set(&s.key))
            || self.git.as_ref().is_some_and(|g| !g.repo.is_empty())
            || self.artifactory.as_ref().is_some_and(|a| !a.url.is_empty())
            || self
                .hdfs
                .as_ref()
                .is_some_and(|h| !h.addresses.is_empty() && !h.path.is_empty())
            || self
                .oss
                .as_ref()
                .is_some_and(|o| is_set(&o.bucket) && is_set(&o.key))
            || self
                .gcs
                .as_ref()
                .is_some_and(|g| is_set(&g.bucket) && is_set(&g.key))
            || self.http.as_ref().is_some_and(|h| !h.url.is_empty())
            || self.raw.as_ref().is_some_and(|r| !r.data.is_empty())
    }

    /// True when a backend names a key, to be resolved against the archive location
    pub fn has_key(&self) -> bool {
        self.s3.as_ref().is_some_and(|s| is_set(&s.key))
            || self.oss.as_ref().is_some_and(|o| is_set(&o.key))
            || self.gcs.as_ref().is_some_and(|g| is_set(&g.key))
            || self.hdfs.as_ref().is_some_and(|h| !h.path.is_empty())
    }

    /// Credential secrets referenced by the configured backend
    ///
    /// Only the first configured backend is consulted, in the order
    /// S3, Git, Artifactory, HDFS, OSS, GCS.
    pub fn secret_selectors(&self) -> Vec<&SecretKeySelector> {
        let selectors = if let Some(s3) = &self.s3 {
            vec![&s3.access_key_secret, &s3.secret_key_secret]
        } else if let Some(git) = &self.git {
            vec![
                &git.username_secret,
                &git.password_secret,
                &git.ssh_private_key_secret,
            ]
        } else if let Some(artifactory) = &self.artifactory {
            vec![&artifactory.username_secret, &artifactory.password_secret]
        } else if let Some(hdfs) = &self.hdfs {
            vec![&hdfs.krb_ccache_secret, &hdfs.krb_keytab_secret]
        } else if let Some(oss) = &self.oss {
            vec![&oss.access_key_secret, &oss.secret_key_secret]
        } else if let Some(gcs) = &self.gcs {
            vec![&gcs.service_account_key_secret]
        } else {
            vec![]
        };
        selectors.into_iter().flatten().collect()
    }
}

/// A named input or output artifact of a template
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    /// Container path the artifact is loaded to or collected from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(flatten)]
    pub location: ArtifactLocation,
}

impl Artifact {
    /// Create an artifact with only a name and path
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// True when the artifact carries a complete location
    pub fn has_location(&self) -> bool {
        self.location.has_location()
    }

    /// True when the artifact can be resolved at all
    pub fn has_location_or_key(&self) -> bool {
        self.location.has_location() || self.location.has_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3(bucket: Option<&str>, key: Option<&str>) -> ArtifactLocation {
        ArtifactLocation {
            s3: Some(S3Artifact {
                bucket: bucket.map(String::from),
                key: key.map(String::from),
                access_key_secret: Some(SecretKeySelector::new("s3-creds", "access")),
                secret_key_secret: Some(SecretKeySelector::new("s3-creds", "secret")),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_has_location_requires_bucket_and_key() {
        assert!(s3(Some("b"), Some("k")).has_location());
        assert!(!s3(Some("b"), None).has_location());
        assert!(!s3(None, Some("k")).has_location());
        assert!(!ArtifactLocation::default().has_location());
    }

    #[test]
    fn test_key_only_artifact_is_resolvable() {
        let art = Artifact {
            location: s3(None, Some("outputs/report.tgz")),
            ..Artifact::new("report", "/tmp/report")
        };
        assert!(!art.has_location());
        assert!(art.has_location_or_key());
        assert!(!Artifact::new("bare", "/tmp").has_location_or_key());
    }

    #[test]
    fn test_secret_selectors_follow_backend() {
        let location = s3(Some("b"), Some("k"));
        let names: Vec<_> = location
            .secret_selectors()
            .into_iter()
            .map(|s| (s.name.as_str(), s.key.as_str()))
            .collect();
        assert_eq!(names, vec![("s3-creds", "access"), ("s3-creds", "secret")]);

        let gcs = ArtifactLocation {
            gcs: Some(GcsArtifact {
                service_account_key_secret: Some(SecretKeySelector::new("gcs", "sa.json")),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(gcs.secret_selectors().len(), 1);
    }

    #[test]
    fn test_artifact_deserializes_flattened_location() {
        let json = serde_json::json!({
            "name": "code",
            "path": "/src",
            "git": {
                "repo": "https://example.com/repo.git",
                "sshPrivateKeySecret": {"name": "git-ssh", "key": "id_rsa"}
            }
        });
        let art: Artifact = serde_json::from_value(json).unwrap();
        assert!(art.has_location());
        assert_eq!(art.location.secret_selectors()[0].name, "git-ssh");
    }

    #[test]
    fn test_hdfs_secret_field_name() {
        let json = serde_json::json!({
            "addresses": ["nn:8020"],
            "path": "/data",
            "krbCCacheSecret": {"name": "krb", "key": "ccache"}
        });
        let hdfs: HdfsArtifact = serde_json::from_value(json).unwrap();
        assert_eq!(hdfs.krb_ccache_secret.unwrap().key, "ccache");
    }
}
