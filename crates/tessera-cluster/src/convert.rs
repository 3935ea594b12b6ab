//! Conversion between [`Cluster`] and the versioned `Cluster` object
//!
//! The mapping is lossless in both directions:
//! `Cluster::from_versioned(&cluster.export())` equals `cluster`.

use std::collections::HashSet;
use std::sync::Arc;

use tessera_common::{crd, CONTROL_PLANE_INGRESS_PEER};
use tessera_pki::{
    CaRole, Certificate, CertificateAuthorities, CertificateAuthority, JoinKey, SigningKeyPair,
};
use tessera_vpn::{parse_cidr, VpnPeer};

use crate::cluster::validate_name;
use crate::{Cluster, ClusterError, EtcdServer, KubeApiServer, Result};

fn export_authority(ca: &CertificateAuthority) -> crd::Certificate {
    crd::Certificate {
        certificate: ca.certificate_pem().to_string(),
        private_key: ca.private_key_pem().to_string(),
    }
}

fn export_peer(peer: &VpnPeer) -> crd::VpnPeer {
    crd::VpnPeer {
        name: peer.name().to_string(),
        address: peer.address().to_string(),
        private_key: peer.keys().private_key_base64(),
        public_key: peer.keys().public_key_base64(),
    }
}

impl Cluster {
    /// The versioned object for this cluster
    pub fn export(&self) -> crd::Cluster {
        let cas = &self.certificate_authorities;
        let spec = crd::ClusterSpec {
            certificate_authorities: crd::CertificateAuthorities {
                api_server_client: export_authority(cas.get(CaRole::ApiServerClient)),
                certificate_signer: export_authority(cas.get(CaRole::CertificateSigner)),
                kubelet: export_authority(cas.get(CaRole::Kubelet)),
                etcd_client: export_authority(cas.get(CaRole::EtcdClient)),
                etcd_peer: export_authority(cas.get(CaRole::EtcdPeer)),
            },
            api_server: crd::KubeApiServer {
                ca: export_authority(&self.api_server.ca),
                tls_cert: self.api_server.tls.certificate_pem().to_string(),
                tls_private_key: self.api_server.tls.private_key_pem().to_string(),
                service_account: crd::KeyPair {
                    public_key: self.api_server.service_account.public_key_pem().to_string(),
                    private_key: self.api_server.service_account.private_key_pem().to_string(),
                },
                etcd_client: self.api_server.etcd_client.as_ref().map(|cert| crd::Certificate {
                    certificate: cert.certificate_pem().to_string(),
                    private_key: cert.private_key_pem().to_string(),
                }),
                extra_sans: self.api_server.extra_sans.clone(),
            },
            etcd_server: crd::EtcdServer {
                ca: export_authority(&self.etcd_server.ca),
                tls_cert: self.etcd_server.tls.certificate_pem().to_string(),
                tls_private_key: self.etcd_server.tls.private_key_pem().to_string(),
                extra_sans: self.etcd_server.extra_sans.clone(),
            },
            vpn_cidr: self.vpn_cidr.to_string(),
            join_key: self.join_key.as_ref().map(|key| crd::KeyPair {
                public_key: key.public_key().pem().to_string(),
                private_key: key.private_key_pem().to_string(),
            }),
        };

        let mut versioned = crd::Cluster::new(&self.name, spec);
        versioned.status = Some(crd::ClusterStatus {
            storage_client_endpoints: self.storage_client_endpoints.clone(),
            storage_peer_endpoints: self.storage_peer_endpoints.clone(),
            vpn_peers: self.vpn_peers.iter().map(export_peer).collect(),
            vpn_allocation_counter: Some(self.vpn_allocation_counter),
        });
        versioned
    }

    /// Rebuild a cluster from its versioned object, validating every piece
    /// of key material.
    pub fn from_versioned(versioned: &crd::Cluster) -> Result<Self> {
        let name = versioned
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Conversion {
                cluster: String::new(),
                message: "metadata.name is not set".to_string(),
            })?;
        validate_name(&name)?;
        Importer { name: &name }.import(versioned)
    }
}

impl From<&Cluster> for crd::Cluster {
    fn from(cluster: &Cluster) -> Self {
        cluster.export()
    }
}

impl TryFrom<&crd::Cluster> for Cluster {
    type Error = ClusterError;

    fn try_from(versioned: &crd::Cluster) -> Result<Self> {
        Cluster::from_versioned(versioned)
    }
}

/// Names the cluster and the offending field on every conversion error
struct Importer<'a> {
    name: &'a str,
}

impl Importer<'_> {
    fn fail(&self, field: &str, err: impl std::fmt::Display) -> ClusterError {
        ClusterError::Conversion {
            cluster: self.name.to_string(),
            message: format!("{field}: {err}"),
        }
    }

    fn authority(&self, field: &str, cert: &crd::Certificate) -> Result<CertificateAuthority> {
        CertificateAuthority::from_pem(&cert.certificate, &cert.private_key)
            .map_err(|e| self.fail(field, e))
    }

    /// Share the role authority when the component's CA is that authority
    fn component_ca(
        &self,
        field: &str,
        cert: &crd::Certificate,
        role_ca: &Arc<CertificateAuthority>,
    ) -> Result<Arc<CertificateAuthority>> {
        let ca = self.authority(field, cert)?;
        if ca == **role_ca {
            Ok(role_ca.clone())
        } else {
            Ok(Arc::new(ca))
        }
    }

    fn import(&self, versioned: &crd::Cluster) -> Result<Cluster> {
        let spec = &versioned.spec;
        let status = versioned.status.clone().unwrap_or_default();

        let wire_cas = &spec.certificate_authorities;
        let certificate_authorities = CertificateAuthorities::try_from_fn(|role| {
            let (field, cert) = match role {
                CaRole::ApiServerClient => ("apiServerClient", &wire_cas.api_server_client),
                CaRole::CertificateSigner => ("certificateSigner", &wire_cas.certificate_signer),
                CaRole::Kubelet => ("kubelet", &wire_cas.kubelet),
                CaRole::EtcdClient => ("etcdClient", &wire_cas.etcd_client),
                CaRole::EtcdPeer => ("etcdPeer", &wire_cas.etcd_peer),
            };
            self.authority(&format!("spec.certificateAuthorities.{field}"), cert)
        })?;

        let etcd_server = EtcdServer {
            ca: self.component_ca(
                "spec.etcdServer.ca",
                &spec.etcd_server.ca,
                certificate_authorities.get(CaRole::EtcdClient),
            )?,
            tls: Certificate::from_pem(&spec.etcd_server.tls_cert, &spec.etcd_server.tls_private_key)
                .map_err(|e| self.fail("spec.etcdServer.tlsCert", e))?,
            extra_sans: spec.etcd_server.extra_sans.clone(),
        };

        let api_server = KubeApiServer {
            ca: self.component_ca(
                "spec.apiServer.ca",
                &spec.api_server.ca,
                certificate_authorities.get(CaRole::ApiServerClient),
            )?,
            tls: Certificate::from_pem(&spec.api_server.tls_cert, &spec.api_server.tls_private_key)
                .map_err(|e| self.fail("spec.apiServer.tlsCert", e))?,
            service_account: SigningKeyPair::from_pem(
                &spec.api_server.service_account.public_key,
                &spec.api_server.service_account.private_key,
            )
            .map_err(|e| self.fail("spec.apiServer.serviceAccount", e))?,
            etcd_client: spec
                .api_server
                .etcd_client
                .as_ref()
                .map(|cert| {
                    Certificate::from_pem(&cert.certificate, &cert.private_key)
                        .map_err(|e| self.fail("spec.apiServer.etcdClient", e))
                })
                .transpose()?,
            extra_sans: spec.api_server.extra_sans.clone(),
        };

        let vpn_cidr = parse_cidr(&spec.vpn_cidr).map_err(|e| self.fail("spec.vpnCIDR", e))?;

        let join_key = spec
            .join_key
            .as_ref()
            .map(|key| {
                JoinKey::from_pem(&key.public_key, &key.private_key)
                    .map_err(|e| self.fail("spec.joinKey", e))
            })
            .transpose()?;

        let vpn_peers = self.peers(&status.vpn_peers, vpn_cidr)?;
        let vpn_allocation_counter = status
            .vpn_allocation_counter
            .unwrap_or(vpn_peers.len() as u64)
            .max(vpn_peers.len() as u64);

        Ok(Cluster {
            name: self.name.to_string(),
            certificate_authorities,
            etcd_server,
            api_server,
            storage_client_endpoints: status.storage_client_endpoints,
            storage_peer_endpoints: status.storage_peer_endpoints,
            vpn_cidr,
            vpn_peers,
            vpn_allocation_counter,
            join_key,
        })
    }

    fn peers(&self, wire: &[crd::VpnPeer], cidr: ipnet::IpNet) -> Result<Vec<VpnPeer>> {
        if !wire.iter().any(|p| p.name == CONTROL_PLANE_INGRESS_PEER) {
            return Err(self.fail(
                "status.vpnPeers",
                format!("missing the {CONTROL_PLANE_INGRESS_PEER:?} peer"),
            ));
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        wire.iter()
            .enumerate()
            .map(|(i, p)| {
                let field = format!("status.vpnPeers[{i}]");
                let peer = VpnPeer::from_parts(&p.name, &p.address, &p.private_key, &p.public_key)
                    .map_err(|e| self.fail(&field, e))?;
                if !cidr.contains(&peer.ip()) {
                    return Err(self.fail(&field, format!("{} is outside {cidr}", peer.address())));
                }
                if !names.insert(peer.name().to_string()) {
                    return Err(self.fail(&field, format!("duplicate name {:?}", peer.name())));
                }
                if !addresses.insert(peer.ip()) {
                    return Err(self.fail(&field, format!("duplicate address {}", peer.address())));
                }
                Ok(peer)
            })
            .collect()
    }
}
