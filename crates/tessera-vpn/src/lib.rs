//! VPN overlay addressing for tessera clusters
//!
//! Every cluster owns a VPN CIDR fixed at creation. Peers (the control-plane
//! ingress first, then one per joined node) receive addresses sequentially:
//! the n-th allocation gets `network + n + 1`, rendered as a host network
//! (`/32` or `/128`). Each peer also gets a fresh WireGuard key pair.
//!
//! Addresses are never recycled. Removing a peer does not make its address
//! available again because the allocation index only ever grows.

#![deny(missing_docs)]

pub mod allocator;
pub mod keys;
pub mod peer;

pub use allocator::{host_network, parse_cidr, request_vpn_ip};
pub use keys::VpnKeyPair;
pub use peer::VpnPeer;

use ipnet::IpNet;
use thiserror::Error;

/// VPN errors
#[derive(Debug, Error)]
pub enum VpnError {
    /// The CIDR string could not be parsed
    #[error("invalid VPN CIDR {cidr:?}: {reason}")]
    InvalidCidr {
        /// The rejected input
        cidr: String,
        /// Parser message
        reason: String,
    },

    /// Every address of the CIDR has been handed out
    #[error("VPN address space {cidr} exhausted")]
    AddressExhausted {
        /// The exhausted CIDR
        cidr: IpNet,
    },

    /// Key material could not be generated
    #[error("VPN key generation failed: {0}")]
    KeyGeneration(String),

    /// Persisted key material is malformed
    #[error("invalid VPN key: {0}")]
    InvalidKey(String),

    /// A persisted peer address is not a host address
    #[error("invalid VPN peer address {0:?}")]
    InvalidAddress(String),
}

/// Result type for VPN operations
pub type Result<T> = std::result::Result<T, VpnError>;
