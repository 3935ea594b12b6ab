//! Cluster aggregate for tessera
//!
//! - [`Cluster`]: a managed cluster's control-plane identity (certificate
//!   authorities, etcd and API server leaves, VPN CIDR and peers, join key)
//! - [`ClusterMap`]: a keyed collection of clusters with bulk YAML export
//! - [`convert`]: the mapping between [`Cluster`] and the versioned object
//! - [`store`]: optimistic-concurrency persistence of versioned clusters
//! - [`components`]: control-plane component reconcilers over a hypervisor

#![deny(missing_docs)]

pub mod cluster;
pub mod components;
pub mod convert;
pub mod map;
pub mod store;

pub use cluster::{Cluster, EtcdServer, KubeApiServer};
pub use map::{BulkExportError, ClusterMap};
pub use store::{
    create_cluster, update_cluster, ClusterStore, InMemoryClusterStore, KubeClusterStore, Versioned,
};

use thiserror::Error;

/// Errors from cluster operations
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The cluster name is not a valid object name
    #[error("invalid cluster name {0:?}")]
    InvalidName(String),

    /// Certificate authority or leaf failure
    #[error(transparent)]
    Pki(#[from] tessera_pki::PkiError),

    /// VPN CIDR, allocation or key failure
    #[error(transparent)]
    Vpn(#[from] tessera_vpn::VpnError),

    /// No VPN peer with this name
    #[error("vpn peer {name:?} not found")]
    PeerNotFound {
        /// Requested peer name
        name: String,
    },

    /// A VPN peer with this name already exists
    #[error("vpn peer {name:?} already exists")]
    DuplicatePeer {
        /// Requested peer name
        name: String,
    },

    /// The peer cannot be removed
    #[error("vpn peer {name:?} cannot be removed")]
    ProtectedPeer {
        /// Requested peer name
        name: String,
    },

    /// The cluster carries no join key, so join requests cannot be served
    #[error("cluster {cluster:?} has no join key")]
    MissingJoinKey {
        /// Cluster name
        cluster: String,
    },

    /// The cluster could not be encoded
    #[error("could not encode cluster {cluster:?}: {message}")]
    Encoding {
        /// Cluster name
        cluster: String,
        /// Encoder message
        message: String,
    },

    /// A versioned object could not be converted into a cluster
    #[error("could not convert versioned cluster {cluster:?}: {message}")]
    Conversion {
        /// Cluster name
        cluster: String,
        /// What was wrong
        message: String,
    },

    /// Object store or hypervisor failure
    #[error(transparent)]
    Api(#[from] tessera_common::Error),
}

impl ClusterError {
    /// Whether this is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Api(e) if e.is_conflict())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;
