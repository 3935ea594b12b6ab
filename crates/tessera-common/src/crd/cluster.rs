//! Cluster Custom Resource Definition
//!
//! The Cluster CRD is the persisted, versioned form of a managed cluster's
//! control plane: its certificate authorities, the etcd and API server
//! identities, the VPN CIDR and the VPN peers allocated from it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Certificate, KeyPair};

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tessera.dev",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced = false,
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"VPN CIDR","type":"string","jsonPath":".spec.vpnCIDR"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// The five certificate authorities of this cluster
    pub certificate_authorities: CertificateAuthorities,

    /// API server identity
    pub api_server: KubeApiServer,

    /// etcd server identity
    pub etcd_server: EtcdServer,

    /// CIDR of the cluster's VPN overlay, in its string form
    #[serde(rename = "vpnCIDR")]
    pub vpn_cidr: String,

    /// Key pair used to unwrap the symmetric keys of node join requests.
    /// Clusters without one cannot serve join requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_key: Option<KeyPair>,
}

/// Certificate authorities, one per role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthorities {
    /// CA trusted by API server clients
    pub api_server_client: Certificate,
    /// General purpose signing CA
    pub certificate_signer: Certificate,
    /// CA for kubelet serving certificates
    pub kubelet: Certificate,
    /// CA trusted by etcd clients
    pub etcd_client: Certificate,
    /// CA for etcd peer traffic
    pub etcd_peer: Certificate,
}

/// API server identity
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeApiServer {
    /// CA that signed the serving certificate
    pub ca: Certificate,
    /// PEM serving certificate
    pub tls_cert: String,
    /// PEM serving private key
    pub tls_private_key: String,
    /// Service account signing key pair
    pub service_account: KeyPair,
    /// Client certificate the API server presents to etcd
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_client: Option<Certificate>,
    /// Extra subject alternative names of the serving certificate
    #[serde(rename = "extraSANs", default, skip_serializing_if = "Vec::is_empty")]
    pub extra_sans: Vec<String>,
}

/// etcd server identity
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdServer {
    /// CA that signed the serving certificate
    pub ca: Certificate,
    /// PEM serving certificate
    pub tls_cert: String,
    /// PEM serving private key
    pub tls_private_key: String,
    /// Extra subject alternative names of the serving certificate
    #[serde(rename = "extraSANs", default, skip_serializing_if = "Vec::is_empty")]
    pub extra_sans: Vec<String>,
}

/// A participant in the cluster's VPN overlay
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VpnPeer {
    /// Peer name, unique within the cluster
    pub name: String,
    /// Host address with a full-length mask (e.g. 10.0.0.1/32)
    pub address: String,
    /// WireGuard private key, base64
    pub private_key: String,
    /// WireGuard public key, base64
    pub public_key: String,
}

/// Status for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// etcd client endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_client_endpoints: Vec<String>,

    /// etcd peer endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_peer_endpoints: Vec<String>,

    /// VPN peers in allocation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpn_peers: Vec<VpnPeer>,

    /// Number of VPN addresses handed out so far.
    ///
    /// When absent the number of peers is used, which is what objects
    /// written before the counter existed imply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpn_allocation_counter: Option<u64>,
}
