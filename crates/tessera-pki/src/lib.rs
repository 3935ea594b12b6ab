//! PKI for tessera clusters
//!
//! Every managed cluster carries its own certificate authority hierarchy:
//!
//! - **Authorities**: five self-signed CAs, one per [`CaRole`], created
//!   together by [`CertificateAuthorities::new`]
//! - **Leaf certificates**: issued by exactly one authority with the SAN set
//!   supplied by the caller ([`CertificateAuthority::issue_certificate`])
//! - **Signing keys**: the API server's service account key pair
//!   ([`SigningKeyPair`])
//! - **Join key**: an RSA key pair whose public half nodes use to wrap the
//!   symmetric key of their join request ([`JoinKey`], [`JoinPublicKey`])
//!
//! Authorities and certificates are immutable values. Rotation means issuing
//! a new certificate and replacing the reference to the old one.

#![deny(missing_docs)]

pub mod authority;
pub mod join_key;

pub use authority::{
    parse_pem, verify_issued_by, CaRole, Certificate, CertificateAuthorities,
    CertificateAuthority, CertificateInfo, SigningKeyPair,
};
pub use join_key::{JoinKey, JoinPublicKey};

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// The authority's stored key or certificate can no longer be used
    #[error("certificate authority unavailable: {0}")]
    AuthorityUnavailable(String),

    /// A subject alternative name is neither an IP address nor a valid DNS name
    #[error("invalid subject alternative name {san:?}: {reason}")]
    InvalidSan {
        /// The rejected SAN
        san: String,
        /// Why it was rejected
        reason: String,
    },

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("parsing error: {0}")]
    ParseError(String),

    /// Encryption with a join key failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption with a join key failed
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
