//! Control-plane component reconcilers
//!
//! A [`Component`] turns a cluster and its component versions into the
//! containers that must run on a hypervisor. Pulling images and managing
//! processes is the [`Hypervisor`]'s business; reconcilers only describe
//! the desired containers and hand them over.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use tessera_common::versions::ComponentVersions;
use tessera_common::Error;
use tessera_pki::CaRole;

use crate::cluster::issue_etcd_client;
use crate::{Cluster, Result};

/// Registry all control-plane images are pulled from
pub const IMAGE_REGISTRY: &str = "registry.k8s.io";

const ETCD_PKI_DIR: &str = "/etc/etcd/pki";
const KUBE_PKI_DIR: &str = "/etc/kubernetes/pki";
const DEFAULT_ETCD_ENDPOINT: &str = "https://127.0.0.1:2379";

/// A container a hypervisor should run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name, unique per cluster on a hypervisor
    pub name: String,
    /// Fully qualified image reference
    pub image: String,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Files to place in the container, path to contents
    pub files: BTreeMap<String, String>,
}

/// Where control-plane containers run
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Make sure `container` runs for `cluster`, replacing a differing one
    async fn ensure_container(
        &self,
        cluster: &str,
        container: &ContainerSpec,
    ) -> std::result::Result<(), Error>;
}

/// A control-plane component
pub trait Component: Send + Sync {
    /// Component name used in logs
    fn name(&self) -> &'static str;

    /// Containers this component needs for `cluster`
    fn containers(
        &self,
        cluster: &Cluster,
        versions: &ComponentVersions,
    ) -> Result<Vec<ContainerSpec>>;
}

/// Hand every container of `component` to `hypervisor`
#[instrument(skip_all, fields(component = component.name(), cluster = %cluster.name()))]
pub async fn reconcile_component(
    component: &dyn Component,
    hypervisor: &dyn Hypervisor,
    cluster: &Cluster,
    versions: &ComponentVersions,
) -> Result<()> {
    for container in component.containers(cluster, versions)? {
        hypervisor.ensure_container(cluster.name(), &container).await?;
        debug!(container = %container.name, image = %container.image, "container ensured");
    }
    Ok(())
}

/// The components every cluster's control plane runs, in start order
pub fn control_plane_components() -> Vec<Box<dyn Component>> {
    vec![Box::new(Etcd), Box::new(KubeApiServer), Box::new(KubeScheduler)]
}

fn image(name: &str, tag: &str) -> String {
    format!("{IMAGE_REGISTRY}/{name}:{tag}")
}

fn kube_tag(versions: &ComponentVersions) -> String {
    format!("v{}", versions.kubernetes_version.trim_start_matches('v'))
}

/// etcd, serving clients with the etcd server leaf
pub struct Etcd;

impl Component for Etcd {
    fn name(&self) -> &'static str {
        "etcd"
    }

    fn containers(
        &self,
        cluster: &Cluster,
        versions: &ComponentVersions,
    ) -> Result<Vec<ContainerSpec>> {
        let server = cluster.etcd_server();
        let peer_ca = cluster.certificate_authorities().get(CaRole::EtcdPeer);

        let advertise = if cluster.storage_client_endpoints.is_empty() {
            DEFAULT_ETCD_ENDPOINT.to_string()
        } else {
            cluster.storage_client_endpoints.join(",")
        };

        let files = BTreeMap::from([
            (format!("{ETCD_PKI_DIR}/server.crt"), server.tls.certificate_pem().to_string()),
            (format!("{ETCD_PKI_DIR}/server.key"), server.tls.private_key_pem().to_string()),
            (format!("{ETCD_PKI_DIR}/client-ca.crt"), server.ca.certificate_pem().to_string()),
            (format!("{ETCD_PKI_DIR}/peer-ca.crt"), peer_ca.certificate_pem().to_string()),
        ]);

        Ok(vec![ContainerSpec {
            name: "etcd".to_string(),
            image: image("etcd", &versions.etcd_version),
            args: vec![
                format!("--name={}", cluster.name()),
                "--data-dir=/var/lib/etcd".to_string(),
                "--listen-client-urls=https://0.0.0.0:2379".to_string(),
                format!("--advertise-client-urls={advertise}"),
                "--listen-peer-urls=https://0.0.0.0:2380".to_string(),
                format!("--cert-file={ETCD_PKI_DIR}/server.crt"),
                format!("--key-file={ETCD_PKI_DIR}/server.key"),
                "--client-cert-auth=true".to_string(),
                format!("--trusted-ca-file={ETCD_PKI_DIR}/client-ca.crt"),
                format!("--peer-trusted-ca-file={ETCD_PKI_DIR}/peer-ca.crt"),
            ],
            files,
        }])
    }
}

/// The Kubernetes API server
pub struct KubeApiServer;

impl Component for KubeApiServer {
    fn name(&self) -> &'static str {
        "kube-apiserver"
    }

    fn containers(
        &self,
        cluster: &Cluster,
        versions: &ComponentVersions,
    ) -> Result<Vec<ContainerSpec>> {
        let server = cluster.api_server();
        let cas = cluster.certificate_authorities();

        let etcd_client = match &server.etcd_client {
            Some(cert) => cert.clone(),
            None => {
                warn!(cluster = %cluster.name(), "no stored etcd client certificate, issuing one");
                issue_etcd_client(cas.get(CaRole::EtcdClient))?
            }
        };

        let etcd_servers = if cluster.storage_client_endpoints.is_empty() {
            DEFAULT_ETCD_ENDPOINT.to_string()
        } else {
            cluster.storage_client_endpoints.join(",")
        };

        let files = BTreeMap::from([
            (format!("{KUBE_PKI_DIR}/apiserver.crt"), server.tls.certificate_pem().to_string()),
            (format!("{KUBE_PKI_DIR}/apiserver.key"), server.tls.private_key_pem().to_string()),
            (
                format!("{KUBE_PKI_DIR}/client-ca.crt"),
                cas.get(CaRole::CertificateSigner).certificate_pem().to_string(),
            ),
            (
                format!("{KUBE_PKI_DIR}/kubelet-ca.crt"),
                cas.get(CaRole::Kubelet).certificate_pem().to_string(),
            ),
            (
                format!("{KUBE_PKI_DIR}/etcd-ca.crt"),
                cas.get(CaRole::EtcdClient).certificate_pem().to_string(),
            ),
            (
                format!("{KUBE_PKI_DIR}/apiserver-etcd-client.crt"),
                etcd_client.certificate_pem().to_string(),
            ),
            (
                format!("{KUBE_PKI_DIR}/apiserver-etcd-client.key"),
                etcd_client.private_key_pem().to_string(),
            ),
            (format!("{KUBE_PKI_DIR}/sa.pub"), server.service_account.public_key_pem().to_string()),
            (format!("{KUBE_PKI_DIR}/sa.key"), server.service_account.private_key_pem().to_string()),
        ]);

        Ok(vec![ContainerSpec {
            name: "kube-apiserver".to_string(),
            image: image("kube-apiserver", &kube_tag(versions)),
            args: vec![
                "--secure-port=6443".to_string(),
                "--authorization-mode=Node,RBAC".to_string(),
                format!("--etcd-servers={etcd_servers}"),
                format!("--etcd-cafile={KUBE_PKI_DIR}/etcd-ca.crt"),
                format!("--etcd-certfile={KUBE_PKI_DIR}/apiserver-etcd-client.crt"),
                format!("--etcd-keyfile={KUBE_PKI_DIR}/apiserver-etcd-client.key"),
                format!("--tls-cert-file={KUBE_PKI_DIR}/apiserver.crt"),
                format!("--tls-private-key-file={KUBE_PKI_DIR}/apiserver.key"),
                format!("--client-ca-file={KUBE_PKI_DIR}/client-ca.crt"),
                format!("--kubelet-certificate-authority={KUBE_PKI_DIR}/kubelet-ca.crt"),
                "--service-account-issuer=https://kubernetes.default.svc.cluster.local".to_string(),
                format!("--service-account-key-file={KUBE_PKI_DIR}/sa.pub"),
                format!("--service-account-signing-key-file={KUBE_PKI_DIR}/sa.key"),
            ],
            files,
        }])
    }
}

/// The Kubernetes scheduler
pub struct KubeScheduler;

impl Component for KubeScheduler {
    fn name(&self) -> &'static str {
        "kube-scheduler"
    }

    fn containers(
        &self,
        _cluster: &Cluster,
        versions: &ComponentVersions,
    ) -> Result<Vec<ContainerSpec>> {
        Ok(vec![ContainerSpec {
            name: "kube-scheduler".to_string(),
            image: image("kube-scheduler", &kube_tag(versions)),
            args: vec!["--bind-address=127.0.0.1".to_string()],
            files: BTreeMap::new(),
        }])
    }
}
