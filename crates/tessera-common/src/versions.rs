//! Component version table
//!
//! Maps a Kubernetes version to the etcd, pause, CoreDNS and containerd
//! versions that ship with it. The table is consumed, never produced, by
//! the provisioning core: reconcilers look up the images they run and the
//! join authority reports the Kubernetes version to nodes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Table shipped with the operator, used when no file is configured
const DEFAULT_VERSIONS_YAML: &str = r#"
defaultKubernetesVersion: "1.32.2"
versions:
  - kubernetesVersion: "1.32.2"
    etcdVersion: "3.5.16-0"
    pauseVersion: "3.10"
    corednsVersion: "1.11.3"
    containerdVersion: "2.0.2"
  - kubernetesVersion: "1.31.6"
    etcdVersion: "3.5.15-0"
    pauseVersion: "3.10"
    corednsVersion: "1.11.3"
    containerdVersion: "1.7.25"
  - kubernetesVersion: "1.30.10"
    etcdVersion: "3.5.15-0"
    pauseVersion: "3.9"
    corednsVersion: "1.11.1"
    containerdVersion: "1.7.25"
"#;

/// Errors from loading or querying the version table
#[derive(Debug, Error)]
pub enum VersionError {
    /// The requested Kubernetes version is not in the table
    #[error("unknown kubernetes version {0:?}")]
    Unknown(String),

    /// The table could not be read
    #[error("failed to read version table {path}: {source}")]
    Io {
        /// Path that was read
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The table could not be parsed
    #[error("failed to parse version table: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The table is internally inconsistent
    #[error("invalid version table: {0}")]
    Invalid(String),
}

/// Versions of the components that accompany one Kubernetes release
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersions {
    /// Kubernetes version (without a leading `v`)
    pub kubernetes_version: String,
    /// etcd image tag
    pub etcd_version: String,
    /// Pause (sandbox) image tag
    pub pause_version: String,
    /// CoreDNS image tag
    pub coredns_version: String,
    /// containerd version expected on nodes
    pub containerd_version: String,
}

/// Lookup table keyed by Kubernetes version
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionTable {
    /// Version used when a cluster does not pin one
    pub default_kubernetes_version: String,
    /// Known releases
    pub versions: Vec<ComponentVersions>,
}

impl VersionTable {
    /// The table shipped with the operator
    pub fn builtin() -> Result<Self, VersionError> {
        Self::from_yaml(DEFAULT_VERSIONS_YAML)
    }

    /// Parse a table from YAML
    pub fn from_yaml(input: &str) -> Result<Self, VersionError> {
        let table: Self = serde_yaml::from_str(input)?;
        table.validate()?;
        Ok(table)
    }

    /// Load a table from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VersionError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| VersionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    fn validate(&self) -> Result<(), VersionError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.versions {
            if !seen.insert(entry.kubernetes_version.as_str()) {
                return Err(VersionError::Invalid(format!(
                    "kubernetes version {:?} listed twice",
                    entry.kubernetes_version
                )));
            }
        }
        if !seen.contains(self.default_kubernetes_version.as_str()) {
            return Err(VersionError::Invalid(format!(
                "default kubernetes version {:?} is not listed",
                self.default_kubernetes_version
            )));
        }
        Ok(())
    }

    /// Look up the component versions for a Kubernetes version.
    ///
    /// A leading `v` is accepted (`v1.32.2` and `1.32.2` are the same release).
    pub fn get(&self, kubernetes_version: &str) -> Result<&ComponentVersions, VersionError> {
        let wanted = kubernetes_version.trim_start_matches('v');
        self.versions
            .iter()
            .find(|v| v.kubernetes_version == wanted)
            .ok_or_else(|| VersionError::Unknown(kubernetes_version.to_string()))
    }

    /// Component versions of the default Kubernetes version
    pub fn default_versions(&self) -> Result<&ComponentVersions, VersionError> {
        self.get(&self.default_kubernetes_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_table_parses_and_has_default() {
        let table = VersionTable::builtin().unwrap();
        let default = table.default_versions().unwrap();
        assert_eq!(default.kubernetes_version, table.default_kubernetes_version);
    }

    #[test]
    fn lookup_accepts_leading_v() {
        let table = VersionTable::builtin().unwrap();
        let a = table.get("1.31.6").unwrap();
        let b = table.get("v1.31.6").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.etcd_version, "3.5.15-0");
    }

    #[test]
    fn unknown_version_is_an_error() {
        let table = VersionTable::builtin().unwrap();
        let err = table.get("1.0.0").unwrap_err();
        assert!(matches!(err, VersionError::Unknown(v) if v == "1.0.0"));
    }

    #[test]
    fn duplicate_versions_are_rejected() {
        let yaml = r#"
defaultKubernetesVersion: "1.32.2"
versions:
  - {kubernetesVersion: "1.32.2", etcdVersion: a, pauseVersion: b, corednsVersion: c, containerdVersion: d}
  - {kubernetesVersion: "1.32.2", etcdVersion: a, pauseVersion: b, corednsVersion: c, containerdVersion: d}
"#;
        assert!(matches!(
            VersionTable::from_yaml(yaml),
            Err(VersionError::Invalid(_))
        ));
    }

    #[test]
    fn default_must_be_listed() {
        let yaml = r#"
defaultKubernetesVersion: "9.9.9"
versions:
  - {kubernetesVersion: "1.32.2", etcdVersion: a, pauseVersion: b, corednsVersion: c, containerdVersion: d}
"#;
        assert!(matches!(
            VersionTable::from_yaml(yaml),
            Err(VersionError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = VersionTable::from_file("/nonexistent/versions.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/versions.yaml"));
    }
}
