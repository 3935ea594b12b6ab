//! The cluster aggregate
//!
//! A [`Cluster`] is created complete: certificate authorities, the etcd and
//! API server identities, the service account and join keys, and the
//! `control-plane-ingress` VPN peer are all generated before the value is
//! returned. Any failure aborts creation.
//!
//! The aggregate is not internally synchronised. Concurrent mutation goes
//! through [`crate::store::update_cluster`].

use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, info, instrument};

use tessera_common::CONTROL_PLANE_INGRESS_PEER;
use tessera_pki::{CaRole, Certificate, CertificateAuthorities, CertificateAuthority, JoinKey, SigningKeyPair};
use tessera_vpn::{parse_cidr, request_vpn_ip, VpnKeyPair, VpnPeer};

use crate::{ClusterError, Result};

/// Common name of the etcd serving certificate
pub const ETCD_SERVER_COMMON_NAME: &str = "etcd";

/// Common name of the API server serving certificate
pub const API_SERVER_COMMON_NAME: &str = "kube-apiserver";

/// Common name of the client certificate the API server presents to etcd
pub const API_SERVER_ETCD_CLIENT_COMMON_NAME: &str = "kube-apiserver-etcd-client";

/// Group of the API server's etcd client certificate
pub const API_SERVER_ETCD_CLIENT_ORGANIZATION: &str = "system:masters";

/// SANs every etcd serving certificate carries in addition to the extra SANs
const ETCD_SERVER_BASE_SANS: &[&str] = &["localhost", "127.0.0.1"];

/// SANs every API server serving certificate carries in addition to the extra SANs
const API_SERVER_BASE_SANS: &[&str] = &[
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
    "localhost",
    "127.0.0.1",
];

fn leaf_sans(base: &[&str], extra: &[String]) -> Vec<String> {
    let mut sans: Vec<String> = base.iter().map(|s| s.to_string()).collect();
    for san in extra {
        if !sans.contains(san) {
            sans.push(san.clone());
        }
    }
    sans
}

/// Validate a cluster name as a DNS-1123 subdomain
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ClusterError::InvalidName(name.to_string()))
    }
}

/// etcd server identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdServer {
    /// Authority that signed the serving certificate
    pub ca: Arc<CertificateAuthority>,
    /// Serving certificate and key
    pub tls: Certificate,
    /// Caller-supplied SANs on top of the built-in ones
    pub extra_sans: Vec<String>,
}

impl EtcdServer {
    fn new(ca: Arc<CertificateAuthority>, extra_sans: Vec<String>) -> Result<Self> {
        let tls = ca.issue_certificate(
            ETCD_SERVER_COMMON_NAME,
            &leaf_sans(ETCD_SERVER_BASE_SANS, &extra_sans),
        )?;
        Ok(Self {
            ca,
            tls,
            extra_sans,
        })
    }
}

/// API server identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeApiServer {
    /// Authority that signed the serving certificate
    pub ca: Arc<CertificateAuthority>,
    /// Serving certificate and key
    pub tls: Certificate,
    /// Service account token signing key pair
    pub service_account: SigningKeyPair,
    /// Client certificate presented to etcd, signed by the etcd client
    /// authority. Absent on objects written before it was introduced.
    pub etcd_client: Option<Certificate>,
    /// Caller-supplied SANs on top of the built-in ones
    pub extra_sans: Vec<String>,
}

impl KubeApiServer {
    fn new(
        ca: Arc<CertificateAuthority>,
        etcd_ca: &CertificateAuthority,
        extra_sans: Vec<String>,
    ) -> Result<Self> {
        let tls = ca.issue_certificate(
            API_SERVER_COMMON_NAME,
            &leaf_sans(API_SERVER_BASE_SANS, &extra_sans),
        )?;
        Ok(Self {
            ca,
            tls,
            service_account: SigningKeyPair::generate()?,
            etcd_client: Some(issue_etcd_client(etcd_ca)?),
            extra_sans,
        })
    }
}

/// Client certificate the API server uses to authenticate to etcd
pub(crate) fn issue_etcd_client(etcd_ca: &CertificateAuthority) -> Result<Certificate> {
    Ok(etcd_ca.issue_client_certificate(
        API_SERVER_ETCD_CLIENT_COMMON_NAME,
        API_SERVER_ETCD_CLIENT_ORGANIZATION,
    )?)
}

/// A managed cluster's control-plane identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub(crate) name: String,
    pub(crate) certificate_authorities: CertificateAuthorities,
    pub(crate) etcd_server: EtcdServer,
    pub(crate) api_server: KubeApiServer,
    /// etcd client endpoints, maintained by the etcd reconciler
    pub storage_client_endpoints: Vec<String>,
    /// etcd peer endpoints, maintained by the etcd reconciler
    pub storage_peer_endpoints: Vec<String>,
    pub(crate) vpn_cidr: IpNet,
    pub(crate) vpn_peers: Vec<VpnPeer>,
    pub(crate) vpn_allocation_counter: u64,
    pub(crate) join_key: Option<JoinKey>,
}

impl Cluster {
    /// Create a cluster with a fresh certificate hierarchy and its
    /// `control-plane-ingress` VPN peer.
    #[instrument(skip(etcd_extra_sans, api_server_extra_sans))]
    pub fn new(
        name: &str,
        vpn_cidr: &str,
        etcd_extra_sans: Vec<String>,
        api_server_extra_sans: Vec<String>,
    ) -> Result<Self> {
        validate_name(name)?;
        let vpn_cidr = parse_cidr(vpn_cidr)?;

        let certificate_authorities = CertificateAuthorities::new()?;
        let etcd_server = EtcdServer::new(
            certificate_authorities.get(CaRole::EtcdClient).clone(),
            etcd_extra_sans,
        )?;
        let api_server = KubeApiServer::new(
            certificate_authorities.get(CaRole::ApiServerClient).clone(),
            certificate_authorities.get(CaRole::EtcdClient),
            api_server_extra_sans,
        )?;
        debug!("issued control plane certificates");

        let mut cluster = Self {
            name: name.to_string(),
            certificate_authorities,
            etcd_server,
            api_server,
            storage_client_endpoints: Vec::new(),
            storage_peer_endpoints: Vec::new(),
            vpn_cidr,
            vpn_peers: Vec::new(),
            vpn_allocation_counter: 0,
            join_key: Some(JoinKey::generate()?),
        };
        cluster.generate_vpn_peer(CONTROL_PLANE_INGRESS_PEER)?;

        info!(cluster = %name, vpn_cidr = %vpn_cidr, "cluster created");
        Ok(cluster)
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Certificate authorities, one per role
    pub fn certificate_authorities(&self) -> &CertificateAuthorities {
        &self.certificate_authorities
    }

    /// etcd server identity
    pub fn etcd_server(&self) -> &EtcdServer {
        &self.etcd_server
    }

    /// API server identity
    pub fn api_server(&self) -> &KubeApiServer {
        &self.api_server
    }

    /// VPN CIDR, fixed at creation
    pub fn vpn_cidr(&self) -> IpNet {
        self.vpn_cidr
    }

    /// VPN peers in allocation order
    pub fn vpn_peers(&self) -> &[VpnPeer] {
        &self.vpn_peers
    }

    /// Number of VPN addresses handed out so far
    pub fn vpn_allocation_counter(&self) -> u64 {
        self.vpn_allocation_counter
    }

    /// Key pair unwrapping the symmetric keys of join requests
    pub fn join_key(&self) -> Result<&JoinKey> {
        self.join_key.as_ref().ok_or_else(|| ClusterError::MissingJoinKey {
            cluster: self.name.clone(),
        })
    }

    /// Allocate the next VPN address with a fresh key pair and record the
    /// peer under `name`.
    ///
    /// Addresses still held by a peer are skipped, so a counter restored
    /// from an older object never hands out a duplicate.
    #[instrument(skip(self), fields(cluster = %self.name))]
    pub fn generate_vpn_peer(&mut self, name: &str) -> Result<&VpnPeer> {
        if self.vpn_peers.iter().any(|p| p.name() == name) {
            return Err(ClusterError::DuplicatePeer {
                name: name.to_string(),
            });
        }

        let mut counter = self.vpn_allocation_counter;
        let ip = loop {
            let ip = request_vpn_ip(&self.vpn_cidr, counter)?;
            counter += 1;
            if !self.vpn_peers.iter().any(|p| p.ip() == ip) {
                break ip;
            }
        };
        let keys = VpnKeyPair::generate()?;

        self.vpn_allocation_counter = counter;
        let index = self.vpn_peers.len();
        self.vpn_peers.push(VpnPeer::new(name, ip, keys));

        let peer = &self.vpn_peers[index];
        info!(peer = %name, address = %peer.address(), "vpn peer allocated");
        Ok(peer)
    }

    /// Look up a VPN peer by name
    pub fn vpn_peer(&self, name: &str) -> Result<&VpnPeer> {
        self.vpn_peers
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| ClusterError::PeerNotFound {
                name: name.to_string(),
            })
    }

    /// Remove a VPN peer. Its address is not handed out again.
    ///
    /// The `control-plane-ingress` peer cannot be removed.
    pub fn remove_vpn_peer(&mut self, name: &str) -> Result<VpnPeer> {
        if name == CONTROL_PLANE_INGRESS_PEER {
            return Err(ClusterError::ProtectedPeer {
                name: name.to_string(),
            });
        }
        let index = self
            .vpn_peers
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| ClusterError::PeerNotFound {
                name: name.to_string(),
            })?;
        let peer = self.vpn_peers.remove(index);
        info!(cluster = %self.name, peer = %name, "vpn peer removed");
        Ok(peer)
    }

    /// YAML rendering of the versioned object
    pub fn specs(&self) -> Result<String> {
        serde_yaml::to_string(&self.export()).map_err(|e| ClusterError::Encoding {
            cluster: self.name.clone(),
            message: e.to_string(),
        })
    }
}
