//! Common types for tessera: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod versions;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all tessera custom resources
pub const API_GROUP: &str = "tessera.dev";

/// Label naming the managed cluster a NodeJoinRequest targets
pub const CLUSTER_LABEL_KEY: &str = "tessera.dev/cluster";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "tessera-operator";

/// Name of the VPN peer generated for every cluster at creation time
pub const CONTROL_PLANE_INGRESS_PEER: &str = "control-plane-ingress";
