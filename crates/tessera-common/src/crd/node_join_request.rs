//! NodeJoinRequest Custom Resource Definition
//!
//! A NodeJoinRequest is a single-use request/response object. The joining
//! node fills in the spec; the managing authority fills in the status and
//! flips the `Issued` condition to `True` once every field is written.
//! Consumers must not read the status before `Issued` is `True`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Ciphered, Condition, ConditionStatus};

/// Condition type set to `True` once a join request's status is complete
pub const ISSUED_CONDITION: &str = "Issued";

/// Specification for a NodeJoinRequest, supplied by the joining node
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tessera.dev",
    version = "v1alpha1",
    kind = "NodeJoinRequest",
    plural = "nodejoinrequests",
    shortname = "njr",
    status = "NodeJoinRequestStatus",
    namespaced,
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Issued","type":"string","jsonPath":".status.conditions[?(@.type==\"Issued\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeJoinRequestSpec {
    /// Symmetric key chosen by the node, encrypted with the cluster's
    /// public join key and base64-encoded
    pub symmetric_key: String,

    /// API server endpoint the generated kubeconfig points at. Falls back
    /// to the cluster's default endpoint when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_endpoint: Option<String>,

    /// Local container runtime endpoint (e.g. unix:///run/containerd/containerd.sock)
    pub container_runtime_endpoint: String,

    /// Local image service endpoint, usually the same as the runtime endpoint
    pub image_service_endpoint: String,
}

/// Status for a NodeJoinRequest, written by the managing authority
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeJoinRequestStatus {
    /// Kubernetes version of the cluster being joined
    #[serde(default, skip_serializing_if = "Ciphered::is_empty")]
    pub kubernetes_version: Ciphered,

    /// Whether the cluster has its VPN enabled. Not ciphered.
    #[serde(default)]
    pub vpn_enabled: bool,

    /// VPN address allocated to the node
    #[serde(default, skip_serializing_if = "Ciphered::is_empty")]
    pub vpn_address: Ciphered,

    /// WireGuard private key of the node's VPN peer
    #[serde(default, skip_serializing_if = "Ciphered::is_empty")]
    pub vpn_private_key: Ciphered,

    /// VPN peers the node connects to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpn_peers: Vec<Ciphered>,

    /// Kubeconfig contents for the kubelet
    #[serde(default, skip_serializing_if = "Ciphered::is_empty")]
    pub kube_config: Ciphered,

    /// Kubelet configuration contents
    #[serde(default, skip_serializing_if = "Ciphered::is_empty")]
    pub kubelet_config: Ciphered,

    /// Kubelet server certificate
    #[serde(default, skip_serializing_if = "Ciphered::is_empty")]
    pub kubelet_server_certificate: Ciphered,

    /// Kubelet server private key
    #[serde(default, skip_serializing_if = "Ciphered::is_empty")]
    pub kubelet_server_private_key: Ciphered,

    /// Conditions of this request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeJoinRequestStatus {
    /// Names of the ciphered fields that have not been written yet
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let fields: [(&'static str, bool); 8] = [
            ("kubernetesVersion", self.kubernetes_version.is_empty()),
            ("vpnAddress", self.vpn_address.is_empty()),
            ("vpnPrivateKey", self.vpn_private_key.is_empty()),
            ("vpnPeers", self.vpn_peers.is_empty()),
            ("kubeConfig", self.kube_config.is_empty()),
            ("kubeletConfig", self.kubelet_config.is_empty()),
            (
                "kubeletServerCertificate",
                self.kubelet_server_certificate.is_empty(),
            ),
            (
                "kubeletServerPrivateKey",
                self.kubelet_server_private_key.is_empty(),
            ),
        ];
        fields
            .into_iter()
            .filter_map(|(name, missing)| missing.then_some(name))
            .collect()
    }

    /// Whether every ciphered field has been written
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Whether the `Issued` condition is `True`
    pub fn is_issued(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == ISSUED_CONDITION && c.status == ConditionStatus::True)
    }
}

impl NodeJoinRequest {
    /// Whether the managing authority has committed this request
    pub fn is_issued(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_issued())
    }
}
