//! Keyed collection of clusters

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::warn;

use tessera_common::crd;

use crate::{Cluster, ClusterError, Result};

/// Bulk export that failed for some clusters.
///
/// `exported` holds the documents of every cluster that did encode, in the
/// same format a fully successful export produces.
#[derive(Debug, Error)]
#[error("failed to export {} cluster(s): {}", .failures.len(), summary(.failures))]
pub struct BulkExportError {
    /// Documents of the clusters that encoded successfully
    pub exported: String,
    /// One error per cluster that failed to encode
    pub failures: Vec<ClusterError>,
}

fn summary(failures: &[ClusterError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Clusters keyed by name, iterated in name order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterMap {
    clusters: BTreeMap<String, Cluster>,
}

impl ClusterMap {
    /// An empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a map from versioned objects, failing on the first bad one
    pub fn from_versioned_list(versioned: &[crd::Cluster]) -> Result<Self> {
        let mut map = Self::new();
        for cluster in versioned {
            map.insert(Cluster::from_versioned(cluster)?);
        }
        Ok(map)
    }

    /// Insert a cluster under its name, returning the one it replaced
    pub fn insert(&mut self, cluster: Cluster) -> Option<Cluster> {
        self.clusters.insert(cluster.name().to_string(), cluster)
    }

    /// Cluster by name
    pub fn get(&self, name: &str) -> Option<&Cluster> {
        self.clusters.get(name)
    }

    /// Mutable cluster by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cluster> {
        self.clusters.get_mut(name)
    }

    /// Remove a cluster by name
    pub fn remove(&mut self, name: &str) -> Option<Cluster> {
        self.clusters.remove(name)
    }

    /// Number of clusters
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Clusters in name order
    pub fn iter(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    /// Every cluster's YAML document, each preceded by `---\n`.
    ///
    /// A cluster that fails to encode does not stop the others; all failures
    /// are reported together with the documents that did encode.
    pub fn specs(&self) -> std::result::Result<String, BulkExportError> {
        self.specs_with(Cluster::specs)
    }

    fn specs_with<F>(&self, encode: F) -> std::result::Result<String, BulkExportError>
    where
        F: Fn(&Cluster) -> Result<String>,
    {
        let mut exported = String::new();
        let mut failures = Vec::new();
        for cluster in self.clusters.values() {
            match encode(cluster) {
                Ok(spec) => {
                    exported.push_str("---\n");
                    exported.push_str(&spec);
                }
                Err(e) => {
                    warn!(cluster = %cluster.name(), error = %e, "cluster export failed");
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            Ok(exported)
        } else {
            Err(BulkExportError { exported, failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str) -> Cluster {
        Cluster::new(name, "10.0.0.0/24", vec![], vec![]).unwrap()
    }

    #[test]
    fn specs_are_separated_and_ordered_by_name() {
        let mut map = ClusterMap::new();
        map.insert(cluster("beta"));
        map.insert(cluster("alpha"));

        let specs = map.specs().unwrap();
        assert!(specs.starts_with("---\n"));
        assert_eq!(specs.lines().filter(|l| *l == "---").count(), 2);

        let alpha = specs.find("name: alpha").unwrap();
        let beta = specs.find("name: beta").unwrap();
        assert!(alpha < beta);
    }

    #[test]
    fn empty_map_exports_nothing() {
        assert_eq!(ClusterMap::new().specs().unwrap(), "");
    }

    #[test]
    fn failures_are_aggregated_not_swallowed() {
        let mut map = ClusterMap::new();
        map.insert(cluster("good"));
        map.insert(cluster("bad"));

        let err = map
            .specs_with(|c| {
                if c.name() == "bad" {
                    Err(ClusterError::Encoding {
                        cluster: c.name().to_string(),
                        message: "boom".to_string(),
                    })
                } else {
                    c.specs()
                }
            })
            .unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert!(err.to_string().contains("\"bad\""));
        assert!(err.exported.starts_with("---\n"));
        assert!(err.exported.contains("name: good"));
        assert!(!err.exported.contains("name: bad"));
    }

    #[test]
    fn versioned_list_round_trips() {
        let mut map = ClusterMap::new();
        map.insert(cluster("one"));
        map.insert(cluster("two"));

        let versioned: Vec<_> = map.iter().map(Cluster::export).collect();
        let restored = ClusterMap::from_versioned_list(&versioned).unwrap();
        assert_eq!(restored, map);
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn insert_replaces_by_name() {
        let mut map = ClusterMap::new();
        assert!(map.insert(cluster("demo")).is_none());
        assert!(map.insert(cluster("demo")).is_some());
        assert_eq!(map.len(), 1);
        assert!(map.remove("demo").is_some());
        assert!(map.is_empty());
    }
}
