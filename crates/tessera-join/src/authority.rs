//! Authority side of the join protocol
//!
//! [`JoinAuthority`] turns a pending join request into a complete, sealed
//! status. Nothing is written to the request here; the caller persists the
//! status returned by [`JoinStatusBuilder::commit`] in a single write so the
//! `Issued` condition never appears before the fields it vouches for.

use base64::{engine::general_purpose::STANDARD, Engine};
use ipnet::IpNet;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use tessera_cluster::{Cluster, ClusterError};
use tessera_common::crd::{
    Condition, ConditionStatus, NodeJoinRequest, NodeJoinRequestSpec, NodeJoinRequestStatus,
    ISSUED_CONDITION,
};
use tessera_common::CONTROL_PLANE_INGRESS_PEER;
use tessera_pki::{CaRole, Certificate};
use tessera_vpn::VpnPeer;

use crate::cipher::SymmetricKey;
use crate::{JoinError, Result};

/// Organization Kubernetes maps node client certificates to
pub const NODES_GROUP: &str = "system:nodes";

/// Prefix of a node's user name in its client certificate
pub const NODE_USER_PREFIX: &str = "system:node:";

const KUBELET_PKI_DIR: &str = "/var/lib/kubelet/pki";

/// Cluster-wide settings the authority fills into every join status
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorityConfig {
    /// API server endpoint used when a request does not name one
    pub api_server_endpoint: String,
    /// Kubernetes version reported to joining nodes
    pub kubernetes_version: String,
    /// Whether nodes join over the VPN
    pub vpn_enabled: bool,
    /// Cluster DNS domain written to the kubelet configuration
    pub cluster_domain: String,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            api_server_endpoint: "https://127.0.0.1:6443".to_string(),
            kubernetes_version: "1.32.2".to_string(),
            vpn_enabled: true,
            cluster_domain: "cluster.local".to_string(),
        }
    }
}

/// A VPN peer as a joining node sees it: no private key
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    /// Peer name
    pub name: String,
    /// Peer host address
    pub address: IpNet,
    /// Base64 WireGuard public key
    pub public_key: String,
}

impl From<&VpnPeer> for PeerEntry {
    fn from(peer: &VpnPeer) -> Self {
        Self {
            name: peer.name().to_string(),
            address: peer.address(),
            public_key: peer.keys().public_key_base64(),
        }
    }
}

/// Fulfils node join requests for the clusters it manages
#[derive(Clone, Debug, Default)]
pub struct JoinAuthority {
    config: AuthorityConfig,
}

impl JoinAuthority {
    /// An authority with the given settings
    pub fn new(config: AuthorityConfig) -> Self {
        Self { config }
    }

    /// Settings in use
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Unwrap the symmetric key a node put in its request
    pub fn unwrap_symmetric_key(
        &self,
        cluster: &Cluster,
        spec: &NodeJoinRequestSpec,
    ) -> Result<SymmetricKey> {
        let wrapped = STANDARD
            .decode(spec.symmetric_key.trim())
            .map_err(|e| JoinError::InvalidSymmetricKey(format!("not base64: {e}")))?;
        let raw = cluster.join_key()?.decrypt(&wrapped)?;
        SymmetricKey::from_bytes(&raw)
    }

    /// The VPN peer for `node`, allocating it on first use.
    ///
    /// Calling this again for the same node returns the peer allocated the
    /// first time, so a retried request never consumes a second address.
    pub fn allocate_peer(
        cluster: &mut Cluster,
        node: &str,
    ) -> std::result::Result<VpnPeer, ClusterError> {
        if node == CONTROL_PLANE_INGRESS_PEER {
            return Err(ClusterError::ProtectedPeer {
                name: node.to_string(),
            });
        }
        match cluster.vpn_peer(node) {
            Ok(peer) => {
                debug!(node, address = %peer.address(), "reusing vpn peer");
                Ok(peer.clone())
            }
            Err(ClusterError::PeerNotFound { .. }) => Ok(cluster.generate_vpn_peer(node)?.clone()),
            Err(e) => Err(e),
        }
    }

    /// Fulfil `request` against an in-memory cluster: unwrap the key,
    /// allocate the node's peer and issue the sealed status.
    pub fn fulfill(
        &self,
        cluster: &mut Cluster,
        request: &NodeJoinRequest,
    ) -> Result<NodeJoinRequestStatus> {
        let key = self.unwrap_symmetric_key(cluster, &request.spec)?;
        let peer = Self::allocate_peer(cluster, &request.name_any())?;
        self.issue(cluster, request, &key, &peer)
    }

    /// Build and seal the complete status for `request`, whose node has
    /// already been given `peer`.
    #[instrument(skip_all, fields(cluster = %cluster.name(), node = %request.name_any()))]
    pub fn issue(
        &self,
        cluster: &Cluster,
        request: &NodeJoinRequest,
        key: &SymmetricKey,
        peer: &VpnPeer,
    ) -> Result<NodeJoinRequestStatus> {
        let node = request.name_any();
        let endpoint = request
            .spec
            .api_server_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(&self.config.api_server_endpoint);

        let client_cert = cluster
            .certificate_authorities()
            .get(CaRole::CertificateSigner)
            .issue_client_certificate(&format!("{NODE_USER_PREFIX}{node}"), NODES_GROUP)?;
        let kube_config = render_kubeconfig(cluster, &node, endpoint, &client_cert)?;
        let kubelet_config = render_kubelet_config(&self.config, &request.spec, peer)?;

        let mut sans = vec![node.clone()];
        if self.config.vpn_enabled {
            sans.push(peer.ip().to_string());
        }
        let server_cert = cluster
            .certificate_authorities()
            .get(CaRole::Kubelet)
            .issue_certificate(&node, &sans)?;

        let mut builder = JoinStatusBuilder::new(&node, key, self.config.vpn_enabled);
        builder
            .kubernetes_version(&self.config.kubernetes_version)?
            .vpn_address(peer.address())?
            .vpn_private_key(&peer.keys().private_key_base64())?
            .kube_config(&kube_config)?
            .kubelet_config(&kubelet_config)?
            .kubelet_server_certificate(&server_cert)?;
        for other in cluster.vpn_peers().iter().filter(|p| p.name() != node) {
            builder.vpn_peer(&PeerEntry::from(other))?;
        }

        let status = builder.commit()?;
        info!(address = %peer.address(), %endpoint, "join request issued");
        Ok(status)
    }
}

/// Kubeconfig for the node's kubelet: trusts the API server authority and
/// authenticates with a `system:node:<node>` client certificate.
fn render_kubeconfig(
    cluster: &Cluster,
    node: &str,
    endpoint: &str,
    client_cert: &Certificate,
) -> Result<String> {
    let ca = cluster
        .certificate_authorities()
        .get(CaRole::ApiServerClient)
        .certificate_pem();
    let user = format!("{NODE_USER_PREFIX}{node}");

    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster.name(),
            "cluster": {
                "server": endpoint,
                "certificate-authority-data": STANDARD.encode(ca),
            },
        }],
        "users": [{
            "name": user,
            "user": {
                "client-certificate-data": STANDARD.encode(client_cert.certificate_pem()),
                "client-key-data": STANDARD.encode(client_cert.private_key_pem()),
            },
        }],
        "contexts": [{
            "name": "default",
            "context": {
                "cluster": cluster.name(),
                "user": user,
            },
        }],
        "current-context": "default",
    });
    serde_yaml::to_string(&kubeconfig).map_err(|e| JoinError::Encoding(e.to_string()))
}

fn render_kubelet_config(
    config: &AuthorityConfig,
    spec: &NodeJoinRequestSpec,
    peer: &VpnPeer,
) -> Result<String> {
    let mut kubelet = json!({
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "kind": "KubeletConfiguration",
        "authentication": {
            "anonymous": { "enabled": false },
            "webhook": { "enabled": true },
        },
        "authorization": { "mode": "Webhook" },
        "cgroupDriver": "systemd",
        "clusterDomain": config.cluster_domain,
        "containerRuntimeEndpoint": spec.container_runtime_endpoint,
        "imageServiceEndpoint": spec.image_service_endpoint,
        "tlsCertFile": format!("{KUBELET_PKI_DIR}/kubelet.crt"),
        "tlsPrivateKeyFile": format!("{KUBELET_PKI_DIR}/kubelet.key"),
    });
    if config.vpn_enabled {
        kubelet["address"] = json!(peer.ip().to_string());
    }
    serde_yaml::to_string(&kubelet).map_err(|e| JoinError::Encoding(e.to_string()))
}

/// Collects sealed status fields and commits them together with `Issued=True`
pub struct JoinStatusBuilder<'a> {
    request: String,
    key: &'a SymmetricKey,
    status: NodeJoinRequestStatus,
}

impl<'a> JoinStatusBuilder<'a> {
    /// Start an empty status for `request`, sealing with `key`
    pub fn new(request: &str, key: &'a SymmetricKey, vpn_enabled: bool) -> Self {
        Self {
            request: request.to_string(),
            key,
            status: NodeJoinRequestStatus {
                vpn_enabled,
                ..Default::default()
            },
        }
    }

    /// Seal the Kubernetes version
    pub fn kubernetes_version(&mut self, version: &str) -> Result<&mut Self> {
        self.status.kubernetes_version = self.key.seal_str("kubernetesVersion", version)?;
        Ok(self)
    }

    /// Seal the node's VPN address
    pub fn vpn_address(&mut self, address: IpNet) -> Result<&mut Self> {
        self.status.vpn_address = self.key.seal_str("vpnAddress", &address.to_string())?;
        Ok(self)
    }

    /// Seal the node's VPN private key
    pub fn vpn_private_key(&mut self, private_key: &str) -> Result<&mut Self> {
        self.status.vpn_private_key = self.key.seal_str("vpnPrivateKey", private_key)?;
        Ok(self)
    }

    /// Seal and append one VPN peer
    pub fn vpn_peer(&mut self, peer: &PeerEntry) -> Result<&mut Self> {
        let encoded = serde_json::to_vec(peer).map_err(|e| JoinError::Encoding(e.to_string()))?;
        self.status.vpn_peers.push(self.key.seal("vpnPeers", &encoded)?);
        Ok(self)
    }

    /// Seal the kubelet kubeconfig
    pub fn kube_config(&mut self, kubeconfig: &str) -> Result<&mut Self> {
        self.status.kube_config = self.key.seal_str("kubeConfig", kubeconfig)?;
        Ok(self)
    }

    /// Seal the kubelet configuration
    pub fn kubelet_config(&mut self, kubelet_config: &str) -> Result<&mut Self> {
        self.status.kubelet_config = self.key.seal_str("kubeletConfig", kubelet_config)?;
        Ok(self)
    }

    /// Seal the kubelet serving certificate and its key
    pub fn kubelet_server_certificate(&mut self, certificate: &Certificate) -> Result<&mut Self> {
        self.status.kubelet_server_certificate = self
            .key
            .seal_str("kubeletServerCertificate", certificate.certificate_pem())?;
        self.status.kubelet_server_private_key = self
            .key
            .seal_str("kubeletServerPrivateKey", certificate.private_key_pem())?;
        Ok(self)
    }

    /// Mark the status issued.
    ///
    /// Refuses while any sealed field is still empty.
    pub fn commit(self) -> Result<NodeJoinRequestStatus> {
        let missing = self.status.missing_fields();
        if !missing.is_empty() {
            return Err(JoinError::Incomplete {
                request: self.request,
                missing,
            });
        }

        let mut status = self.status;
        status.conditions.push(Condition::new(
            ISSUED_CONDITION,
            ConditionStatus::True,
            "Issued",
            "join material is available",
        ));
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_pki::verify_issued_by;

    fn demo() -> Cluster {
        Cluster::new("demo", "10.0.0.0/16", vec![], vec![]).unwrap()
    }

    fn request(cluster: &Cluster, node: &str, key: &SymmetricKey) -> NodeJoinRequest {
        let wrapped = cluster.join_key().unwrap().public_key().encrypt(key.as_bytes()).unwrap();
        NodeJoinRequest::new(
            node,
            NodeJoinRequestSpec {
                symmetric_key: STANDARD.encode(wrapped),
                api_server_endpoint: None,
                container_runtime_endpoint: "unix:///run/containerd/containerd.sock".to_string(),
                image_service_endpoint: "unix:///run/containerd/containerd.sock".to_string(),
            },
        )
    }

    // =========================================================================
    // Status builder
    // =========================================================================

    #[test]
    fn builder_refuses_to_commit_with_empty_fields() {
        let key = SymmetricKey::generate().unwrap();
        let mut builder = JoinStatusBuilder::new("node-a", &key, true);
        builder.kubernetes_version("1.32.2").unwrap();

        match builder.commit() {
            Err(JoinError::Incomplete { request, missing }) => {
                assert_eq!(request, "node-a");
                assert!(missing.contains(&"kubeConfig"));
                assert!(!missing.contains(&"kubernetesVersion"));
            }
            other => panic!("expected incomplete, got {other:?}"),
        }
    }

    #[test]
    fn vpn_enabled_stays_plain() {
        let key = SymmetricKey::generate().unwrap();
        let builder = JoinStatusBuilder::new("node-a", &key, true);
        assert!(builder.status.vpn_enabled);
        assert!(builder.status.conditions.is_empty());
    }

    // =========================================================================
    // Fulfilment
    // =========================================================================

    #[test]
    fn fulfilled_status_is_issued_and_complete() {
        let mut cluster = demo();
        let key = SymmetricKey::generate().unwrap();
        let authority = JoinAuthority::default();
        let req = request(&cluster, "node-a", &key);

        let status = authority.fulfill(&mut cluster, &req).unwrap();

        assert!(status.is_issued());
        assert!(status.is_complete());
        assert!(status.vpn_enabled);
        assert_eq!(status.vpn_peers.len(), 1);
        assert_eq!(
            key.open_string("vpnAddress", &status.vpn_address).unwrap().as_str(),
            "10.0.0.2/32"
        );
        assert_eq!(
            key.open_string("kubernetesVersion", &status.kubernetes_version)
                .unwrap()
                .as_str(),
            "1.32.2"
        );
    }

    #[test]
    fn retried_request_reuses_the_peer() {
        let mut cluster = demo();
        let key = SymmetricKey::generate().unwrap();
        let authority = JoinAuthority::default();
        let req = request(&cluster, "node-a", &key);

        authority.fulfill(&mut cluster, &req).unwrap();
        let status = authority.fulfill(&mut cluster, &req).unwrap();

        assert_eq!(cluster.vpn_peers().len(), 2);
        assert_eq!(cluster.vpn_allocation_counter(), 2);
        assert_eq!(
            key.open_string("vpnAddress", &status.vpn_address).unwrap().as_str(),
            "10.0.0.2/32"
        );
    }

    #[test]
    fn node_cannot_claim_the_ingress_peer() {
        let mut cluster = demo();
        let key = SymmetricKey::generate().unwrap();
        let req = request(&cluster, CONTROL_PLANE_INGRESS_PEER, &key);
        let err = JoinAuthority::default()
            .fulfill(&mut cluster, &req)
            .unwrap_err();
        assert!(matches!(
            err,
            JoinError::Cluster(ClusterError::ProtectedPeer { .. })
        ));
    }

    #[test]
    fn cluster_without_join_key_cannot_serve_requests() {
        let cluster = demo();
        let key = SymmetricKey::generate().unwrap();
        let req = request(&cluster, "node-a", &key);

        let mut exported = cluster.export();
        exported.spec.join_key = None;
        let mut keyless = Cluster::from_versioned(&exported).unwrap();

        let err = JoinAuthority::default()
            .fulfill(&mut keyless, &req)
            .unwrap_err();
        assert!(matches!(
            err,
            JoinError::Cluster(ClusterError::MissingJoinKey { .. })
        ));
        assert_eq!(err.to_string(), "cluster \"demo\" has no join key");
        assert!(!err.is_retryable());
        assert_eq!(keyless.vpn_peers().len(), 1);
    }

    #[test]
    fn garbage_symmetric_key_allocates_nothing() {
        let mut cluster = demo();
        let key = SymmetricKey::generate().unwrap();
        let mut req = request(&cluster, "node-a", &key);
        req.spec.symmetric_key = STANDARD.encode(b"not wrapped with the join key");

        assert!(JoinAuthority::default().fulfill(&mut cluster, &req).is_err());
        assert_eq!(cluster.vpn_peers().len(), 1);
    }

    #[test]
    fn kubelet_certificate_chains_to_the_kubelet_authority() {
        let mut cluster = demo();
        let key = SymmetricKey::generate().unwrap();
        let req = request(&cluster, "node-a", &key);
        let status = JoinAuthority::default().fulfill(&mut cluster, &req).unwrap();

        let cert = key
            .open_string("kubeletServerCertificate", &status.kubelet_server_certificate)
            .unwrap();
        let kubelet_ca = cluster.certificate_authorities().get(CaRole::Kubelet);
        assert!(verify_issued_by(&cert, kubelet_ca).unwrap());

        let info = tessera_pki::CertificateInfo::from_pem(&cert).unwrap();
        assert!(info.subject_alt_names.contains(&"node-a".to_string()));
        assert!(info.subject_alt_names.contains(&"10.0.0.2".to_string()));
    }

    #[test]
    fn kubeconfig_uses_request_endpoint_when_given() {
        let mut cluster = demo();
        let key = SymmetricKey::generate().unwrap();
        let mut req = request(&cluster, "node-a", &key);
        req.spec.api_server_endpoint = Some("https://10.0.0.1:6443".to_string());

        let status = JoinAuthority::default().fulfill(&mut cluster, &req).unwrap();
        let kubeconfig = key.open_string("kubeConfig", &status.kube_config).unwrap();
        let parsed: serde_json::Value = serde_yaml::from_str(&kubeconfig).unwrap();

        assert_eq!(
            parsed["clusters"][0]["cluster"]["server"],
            "https://10.0.0.1:6443"
        );
        assert_eq!(parsed["users"][0]["name"], "system:node:node-a");
    }

    #[test]
    fn vpn_disabled_keeps_address_out_of_the_kubelet() {
        let mut cluster = demo();
        let key = SymmetricKey::generate().unwrap();
        let authority = JoinAuthority::new(AuthorityConfig {
            vpn_enabled: false,
            ..Default::default()
        });
        let req = request(&cluster, "node-a", &key);
        let status = authority.fulfill(&mut cluster, &req).unwrap();

        assert!(!status.vpn_enabled);
        let kubelet = key.open_string("kubeletConfig", &status.kubelet_config).unwrap();
        let parsed: serde_json::Value = serde_yaml::from_str(&kubelet).unwrap();
        assert!(parsed.get("address").is_none());
        assert_eq!(
            parsed["containerRuntimeEndpoint"],
            "unix:///run/containerd/containerd.sock"
        );
    }
}
