//! Node side of the join protocol

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use ipnet::IpNet;
use kube::ResourceExt;
use tracing::debug;
use zeroize::Zeroizing;

use tessera_common::crd::{NodeJoinRequest, NodeJoinRequestSpec};
use tessera_common::CLUSTER_LABEL_KEY;
use tessera_pki::JoinPublicKey;

use crate::authority::PeerEntry;
use crate::cipher::SymmetricKey;
use crate::{JoinError, Result};

/// Everything a node needs to start its kubelet, opened from an issued
/// join request
pub struct JoinBootstrap {
    /// Kubernetes version of the cluster
    pub kubernetes_version: String,
    /// Whether the node should bring up the VPN
    pub vpn_enabled: bool,
    /// The node's VPN host address
    pub vpn_address: IpNet,
    /// The node's base64 WireGuard private key
    pub vpn_private_key: Zeroizing<String>,
    /// Peers the node connects to
    pub vpn_peers: Vec<PeerEntry>,
    /// Kubeconfig for the kubelet
    pub kube_config: Zeroizing<String>,
    /// Kubelet configuration
    pub kubelet_config: String,
    /// Kubelet serving certificate (PEM)
    pub kubelet_server_certificate: String,
    /// Kubelet serving key (PEM)
    pub kubelet_server_private_key: Zeroizing<String>,
}

impl fmt::Debug for JoinBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinBootstrap")
            .field("kubernetes_version", &self.kubernetes_version)
            .field("vpn_enabled", &self.vpn_enabled)
            .field("vpn_address", &self.vpn_address)
            .field("vpn_peers", &self.vpn_peers)
            .finish_non_exhaustive()
    }
}

/// A node's half of one join handshake
#[derive(Debug)]
pub struct JoinSession {
    node: String,
    key: SymmetricKey,
}

impl JoinSession {
    /// Start a session for `node` with a fresh symmetric key
    pub fn new(node: impl Into<String>) -> Result<Self> {
        Ok(Self::with_key(node, SymmetricKey::generate()?))
    }

    /// Resume a session with a key kept from an earlier run
    pub fn with_key(node: impl Into<String>, key: SymmetricKey) -> Self {
        Self {
            node: node.into(),
            key,
        }
    }

    /// Node name, also the request name
    pub fn node(&self) -> &str {
        &self.node
    }

    /// The session's symmetric key
    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Request spec with the symmetric key wrapped for `join_key`
    pub fn spec(
        &self,
        join_key: &JoinPublicKey,
        container_runtime_endpoint: &str,
        image_service_endpoint: &str,
        api_server_endpoint: Option<&str>,
    ) -> Result<NodeJoinRequestSpec> {
        let wrapped = join_key.encrypt(self.key.as_bytes())?;
        Ok(NodeJoinRequestSpec {
            symmetric_key: STANDARD.encode(wrapped),
            api_server_endpoint: api_server_endpoint.map(str::to_string),
            container_runtime_endpoint: container_runtime_endpoint.to_string(),
            image_service_endpoint: image_service_endpoint.to_string(),
        })
    }

    /// A request for this node addressed to `cluster`
    pub fn request(&self, cluster: &str, spec: NodeJoinRequestSpec) -> NodeJoinRequest {
        let mut request = NodeJoinRequest::new(&self.node, spec);
        request.metadata.labels = Some(BTreeMap::from([(
            CLUSTER_LABEL_KEY.to_string(),
            cluster.to_string(),
        )]));
        request
    }

    /// Open the status of an issued request.
    ///
    /// Nothing is read until `Issued=True` is observed. An issued request
    /// with empty fields is reported with the names of the missing fields.
    pub fn decrypt_status(&self, request: &NodeJoinRequest) -> Result<JoinBootstrap> {
        let name = request.name_any();
        let status = match request.status.as_ref() {
            Some(status) if status.is_issued() => status,
            _ => return Err(JoinError::NotIssued { request: name }),
        };
        let missing = status.missing_fields();
        if !missing.is_empty() {
            return Err(JoinError::Incomplete {
                request: name,
                missing,
            });
        }

        let key = &self.key;
        let vpn_address = key.open_string("vpnAddress", &status.vpn_address)?;
        let vpn_address = vpn_address
            .parse::<IpNet>()
            .map_err(|e| JoinError::Encoding(format!("vpnAddress: {e}")))?;

        let vpn_peers = status
            .vpn_peers
            .iter()
            .map(|sealed| {
                let bytes = key.open("vpnPeers", sealed)?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| JoinError::Encoding(format!("vpnPeers: {e}")))
            })
            .collect::<Result<Vec<PeerEntry>>>()?;

        let bootstrap = JoinBootstrap {
            kubernetes_version: key
                .open_string("kubernetesVersion", &status.kubernetes_version)?
                .as_str()
                .to_string(),
            vpn_enabled: status.vpn_enabled,
            vpn_address,
            vpn_private_key: key.open_string("vpnPrivateKey", &status.vpn_private_key)?,
            vpn_peers,
            kube_config: key.open_string("kubeConfig", &status.kube_config)?,
            kubelet_config: key
                .open_string("kubeletConfig", &status.kubelet_config)?
                .as_str()
                .to_string(),
            kubelet_server_certificate: key
                .open_string(
                    "kubeletServerCertificate",
                    &status.kubelet_server_certificate,
                )?
                .as_str()
                .to_string(),
            kubelet_server_private_key: key.open_string(
                "kubeletServerPrivateKey",
                &status.kubelet_server_private_key,
            )?,
        };
        debug!(request = %name, address = %bootstrap.vpn_address, "join status opened");
        Ok(bootstrap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::crd::{
        Ciphered, Condition, ConditionStatus, NodeJoinRequestStatus, ISSUED_CONDITION,
    };
    use tessera_pki::JoinKey;

    const CONTAINERD: &str = "unix:///run/containerd/containerd.sock";

    #[test]
    fn spec_wraps_the_key_for_the_join_key() {
        let join_key = JoinKey::generate().unwrap();
        let session = JoinSession::new("node-a").unwrap();
        let spec = session
            .spec(join_key.public_key(), CONTAINERD, CONTAINERD, None)
            .unwrap();

        let wrapped = STANDARD.decode(&spec.symmetric_key).unwrap();
        let unwrapped = join_key.decrypt(&wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), session.key().as_bytes());
        assert_eq!(spec.api_server_endpoint, None);
    }

    #[test]
    fn request_is_labelled_with_the_cluster() {
        let session = JoinSession::new("node-a").unwrap();
        let request = session.request("demo", NodeJoinRequestSpec::default());
        assert_eq!(request.name_any(), "node-a");
        assert_eq!(request.labels()[CLUSTER_LABEL_KEY], "demo");
    }

    #[test]
    fn pending_request_is_not_read() {
        let session = JoinSession::new("node-a").unwrap();
        let mut request = session.request("demo", NodeJoinRequestSpec::default());
        assert!(matches!(
            session.decrypt_status(&request),
            Err(JoinError::NotIssued { .. })
        ));

        // Fields present but no Issued condition: still not read
        let key = session.key();
        request.status = Some(NodeJoinRequestStatus {
            kubernetes_version: key.seal_str("kubernetesVersion", "1.32.2").unwrap(),
            ..Default::default()
        });
        assert!(matches!(
            session.decrypt_status(&request),
            Err(JoinError::NotIssued { .. })
        ));
    }

    #[test]
    fn issued_request_with_missing_fields_is_reported() {
        let session = JoinSession::new("node-a").unwrap();
        let mut request = session.request("demo", NodeJoinRequestSpec::default());
        request.status = Some(NodeJoinRequestStatus {
            kubernetes_version: Ciphered::from_encoded("c2VhbGVk"),
            conditions: vec![Condition::new(
                ISSUED_CONDITION,
                ConditionStatus::True,
                "Issued",
                "",
            )],
            ..Default::default()
        });

        match session.decrypt_status(&request) {
            Err(JoinError::Incomplete { missing, .. }) => {
                assert!(missing.contains(&"kubeConfig"));
                assert!(!missing.contains(&"kubernetesVersion"));
            }
            other => panic!("expected incomplete, got {other:?}"),
        }
    }

    #[test]
    fn debug_output_hides_secrets() {
        let bootstrap = JoinBootstrap {
            kubernetes_version: "1.32.2".to_string(),
            vpn_enabled: true,
            vpn_address: "10.0.0.2/32".parse().unwrap(),
            vpn_private_key: Zeroizing::new("private".to_string()),
            vpn_peers: vec![],
            kube_config: Zeroizing::new("kubeconfig".to_string()),
            kubelet_config: String::new(),
            kubelet_server_certificate: String::new(),
            kubelet_server_private_key: Zeroizing::new("server-key".to_string()),
        };
        let rendered = format!("{bootstrap:?}");
        assert!(rendered.contains("10.0.0.2/32"));
        assert!(!rendered.contains("private"));
        assert!(!rendered.contains("server-key"));
    }
}
