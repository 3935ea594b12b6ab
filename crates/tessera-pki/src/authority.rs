//! Certificate authorities and leaf issuance
//!
//! A cluster owns exactly one authority per [`CaRole`]. Authorities are
//! self-signed, never mutated, and shared by reference between the
//! components they sign for.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::debug;
use x509_parser::prelude::*;

use crate::{PkiError, Result};

/// Validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for leaf certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Organization recorded on authorities and server leaves
const ORGANIZATION: &str = "tessera";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(years * 365))
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    dn
}

fn generate_key(what: &str) -> Result<KeyPair> {
    KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate {what} key: {e}")))
}

fn san_type(san: &str) -> Result<SanType> {
    if let Ok(ip) = san.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    if san.is_empty() || san.chars().any(char::is_whitespace) {
        return Err(PkiError::InvalidSan {
            san: san.to_string(),
            reason: "empty or contains whitespace".to_string(),
        });
    }
    Ia5String::try_from(san.to_string())
        .map(SanType::DnsName)
        .map_err(|e| PkiError::InvalidSan {
            san: san.to_string(),
            reason: e.to_string(),
        })
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

/// The five fixed authority roles of a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CaRole {
    /// Trusted by clients of the API server
    ApiServerClient,
    /// General purpose signer (kubelet client credentials)
    CertificateSigner,
    /// Signs kubelet serving certificates
    Kubelet,
    /// Trusted by clients of etcd
    EtcdClient,
    /// Signs etcd peer traffic
    EtcdPeer,
}

impl CaRole {
    /// Every role, in the order authorities are generated
    pub const ALL: [CaRole; 5] = [
        CaRole::ApiServerClient,
        CaRole::CertificateSigner,
        CaRole::Kubelet,
        CaRole::EtcdClient,
        CaRole::EtcdPeer,
    ];

    /// Field name of the role in the versioned cluster object
    pub fn as_str(&self) -> &'static str {
        match self {
            CaRole::ApiServerClient => "apiServerClient",
            CaRole::CertificateSigner => "certificateSigner",
            CaRole::Kubelet => "kubelet",
            CaRole::EtcdClient => "etcdClient",
            CaRole::EtcdPeer => "etcdPeer",
        }
    }

    fn common_name(&self) -> &'static str {
        match self {
            CaRole::ApiServerClient => "tessera-apiserver-client-ca",
            CaRole::CertificateSigner => "tessera-certificate-signer-ca",
            CaRole::Kubelet => "tessera-kubelet-ca",
            CaRole::EtcdClient => "tessera-etcd-client-ca",
            CaRole::EtcdPeer => "tessera-etcd-peer-ca",
        }
    }
}

impl fmt::Display for CaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information parsed out of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organization, if any
    pub organization: Option<String>,
    /// DNS names and IP addresses from the SAN extension
    pub subject_alt_names: Vec<String>,
    /// Whether the certificate may sign other certificates
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {e}")))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .map(str::to_string);

        let subject_alt_names = match cert.subject_alternative_name() {
            Ok(Some(ext)) => ext
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    GeneralName::IPAddress(bytes) => ip_from_bytes(bytes).map(|ip| ip.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                return Err(PkiError::ParseError(format!(
                    "failed to parse subject alternative names: {e}"
                )))
            }
        };

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organization,
            subject_alt_names,
            is_ca: cert.is_ca(),
        })
    }

    /// Seconds remaining until the certificate expires
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - ::time::OffsetDateTime::now_utc().unix_timestamp()
    }

    /// Check if the certificate has expired
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() <= 0
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Check that `cert_pem` carries a valid signature from `authority`
pub fn verify_issued_by(cert_pem: &str, authority: &CertificateAuthority) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {e}")))?;

    let ca_der = parse_pem(authority.certificate_pem())?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA certificate: {e}")))?;

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

/// A leaf certificate with its private key, both PEM
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    certificate_pem: String,
    private_key_pem: String,
}

impl Certificate {
    /// Load a leaf from persisted PEM, validating both halves
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(private_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {e}")))?;
        parse_pem(certificate_pem)?;
        Ok(Self {
            certificate_pem: certificate_pem.to_string(),
            private_key_pem: private_key_pem.to_string(),
        })
    }

    /// PEM certificate
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// PEM private key
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Parsed certificate details
    pub fn info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.certificate_pem)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("certificate_pem", &self.certificate_pem)
            .finish_non_exhaustive()
    }
}

/// A self-signed certificate authority
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone, so it is re-parsed per use)
    key_pem: String,
    cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, ORGANIZATION);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = generate_key("CA")?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {e}"))
        })?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            cert_pem: cert.pem(),
        })
    }

    /// Load a CA from persisted PEM, validating both halves
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {e}")))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            key_pem: key_pem.to_string(),
            cert_pem: cert_pem.to_string(),
        })
    }

    /// PEM CA certificate, for distribution to clients
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM CA private key, for persistence
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Parsed CA certificate details
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.cert_pem)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem).map_err(|e| {
            PkiError::AuthorityUnavailable(format!("failed to load CA key: {e}"))
        })
    }

    fn sign(&self, params: CertificateParams, what: &str) -> Result<Certificate> {
        let leaf_key = generate_key(what)?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).map_err(|e| {
            PkiError::AuthorityUnavailable(format!("failed to create issuer: {e}"))
        })?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign {what} cert: {e}"))
        })?;

        Ok(Certificate {
            certificate_pem: cert.pem(),
            private_key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Issue a serving certificate carrying exactly `sans`.
    ///
    /// Each SAN that parses as an IP address becomes an IP SAN, everything
    /// else a DNS SAN. The leaf is valid for both server and client
    /// authentication since etcd and the API server use one identity for both.
    pub fn issue_certificate<S: AsRef<str>>(
        &self,
        common_name: &str,
        sans: &[S],
    ) -> Result<Certificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, ORGANIZATION);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = sans
            .iter()
            .map(|san| san_type(san.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let cert = self.sign(params, "server")?;
        debug!(common_name, sans = sans.len(), "issued server certificate");
        Ok(cert)
    }

    /// Issue a client certificate for `common_name` in `organization`.
    ///
    /// Kubernetes maps the CN to the user and the O to its group.
    pub fn issue_client_certificate(
        &self,
        common_name: &str,
        organization: &str,
    ) -> Result<Certificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, organization);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = self.sign(params, "client")?;
        debug!(common_name, organization, "issued client certificate");
        Ok(cert)
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

/// One authority per [`CaRole`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateAuthorities {
    api_server_client: Arc<CertificateAuthority>,
    certificate_signer: Arc<CertificateAuthority>,
    kubelet: Arc<CertificateAuthority>,
    etcd_client: Arc<CertificateAuthority>,
    etcd_peer: Arc<CertificateAuthority>,
}

impl CertificateAuthorities {
    /// Generate five independent self-signed authorities.
    ///
    /// The first failure aborts; no partial set is returned.
    pub fn new() -> Result<Self> {
        let authorities = Self::try_from_fn(|role| CertificateAuthority::new(role.common_name()))?;
        debug!("generated certificate authorities");
        Ok(authorities)
    }

    /// Build the set by resolving each role in [`CaRole::ALL`] order
    pub fn try_from_fn<E, F>(mut f: F) -> std::result::Result<Self, E>
    where
        F: FnMut(CaRole) -> std::result::Result<CertificateAuthority, E>,
    {
        Ok(Self {
            api_server_client: Arc::new(f(CaRole::ApiServerClient)?),
            certificate_signer: Arc::new(f(CaRole::CertificateSigner)?),
            kubelet: Arc::new(f(CaRole::Kubelet)?),
            etcd_client: Arc::new(f(CaRole::EtcdClient)?),
            etcd_peer: Arc::new(f(CaRole::EtcdPeer)?),
        })
    }

    /// The authority for `role`
    pub fn get(&self, role: CaRole) -> &Arc<CertificateAuthority> {
        match role {
            CaRole::ApiServerClient => &self.api_server_client,
            CaRole::CertificateSigner => &self.certificate_signer,
            CaRole::Kubelet => &self.kubelet,
            CaRole::EtcdClient => &self.etcd_client,
            CaRole::EtcdPeer => &self.etcd_peer,
        }
    }
}

/// An asymmetric signing key pair, both halves PEM
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKeyPair {
    public_key_pem: String,
    private_key_pem: String,
}

impl SigningKeyPair {
    /// Generate a fresh key pair
    pub fn generate() -> Result<Self> {
        let key = generate_key("signing")?;
        Ok(Self {
            public_key_pem: key.public_key_pem(),
            private_key_pem: key.serialize_pem(),
        })
    }

    /// Load a persisted key pair, checking the halves belong together
    pub fn from_pem(public_key_pem: &str, private_key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(private_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse signing key: {e}")))?;
        if key.public_key_pem().trim() != public_key_pem.trim() {
            return Err(PkiError::ParseError(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(Self {
            public_key_pem: public_key_pem.to_string(),
            private_key_pem: private_key_pem.to_string(),
        })
    }

    /// PEM public key
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// PEM private key
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public_key_pem", &self.public_key_pem)
            .finish_non_exhaustive()
    }
}
