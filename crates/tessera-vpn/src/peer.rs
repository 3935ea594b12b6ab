//! VPN peers

use std::net::IpAddr;

use ipnet::IpNet;

use crate::allocator::host_network;
use crate::{Result, VpnError, VpnKeyPair};

/// A participant in a cluster's VPN overlay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpnPeer {
    name: String,
    address: IpNet,
    keys: VpnKeyPair,
}

impl VpnPeer {
    /// Create a peer at `ip` with the given key pair
    pub fn new(name: impl Into<String>, ip: IpAddr, keys: VpnKeyPair) -> Self {
        Self {
            name: name.into(),
            address: host_network(ip),
            keys,
        }
    }

    /// Load a persisted peer; the address must be a host network
    pub fn from_parts(name: &str, address: &str, private_key: &str, public_key: &str) -> Result<Self> {
        let net: IpNet = address
            .parse()
            .map_err(|_| VpnError::InvalidAddress(address.to_string()))?;
        if net.prefix_len() != net.max_prefix_len() {
            return Err(VpnError::InvalidAddress(address.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            address: net,
            keys: VpnKeyPair::from_base64(private_key, public_key)?,
        })
    }

    /// Peer name, unique within its cluster
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host network of the peer (`/32` or `/128`)
    pub fn address(&self) -> IpNet {
        self.address
    }

    /// The peer's address without its prefix
    pub fn ip(&self) -> IpAddr {
        self.address.addr()
    }

    /// The peer's WireGuard key pair
    pub fn keys(&self) -> &VpnKeyPair {
        &self.keys
    }
}
