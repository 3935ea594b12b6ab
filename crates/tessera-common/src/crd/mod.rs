//! Custom Resource Definitions for tessera
//!
//! This module contains the versioned (wire) schema persisted by the
//! declarative API. The in-memory aggregates live in `tessera-cluster`
//! and are converted to and from these types explicitly.

mod cluster;
mod node_join_request;
mod types;

pub use cluster::{
    CertificateAuthorities, Cluster, ClusterSpec, ClusterStatus, EtcdServer, KubeApiServer,
    VpnPeer,
};
pub use node_join_request::{
    NodeJoinRequest, NodeJoinRequestSpec, NodeJoinRequestStatus, ISSUED_CONDITION,
};
pub use types::{Certificate, Ciphered, Condition, ConditionStatus, KeyPair};
