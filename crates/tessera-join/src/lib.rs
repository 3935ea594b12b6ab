//! Node join protocol for tessera
//!
//! A joining node and the managing authority talk through a single
//! `NodeJoinRequest` object:
//!
//! 1. The node picks a symmetric key, wraps it with the cluster's public join
//!    key and posts the request ([`JoinSession::spec`]).
//! 2. The authority unwraps the key, allocates the node's VPN peer, issues its
//!    credentials and writes every sensitive status field sealed with the
//!    symmetric key ([`JoinAuthority::fulfill`]).
//! 3. `Issued=True` is written last, in the same status write, once every
//!    field is present ([`JoinStatusBuilder::commit`]).
//! 4. The node opens the status only after it observes `Issued=True`
//!    ([`JoinSession::decrypt_status`]).
//!
//! [`controller`] drives step 2 and 3 from a kube-runtime controller.

#![deny(missing_docs)]

pub mod authority;
pub mod cipher;
pub mod controller;
pub mod node;

pub use authority::{AuthorityConfig, JoinAuthority, JoinStatusBuilder, PeerEntry};
pub use cipher::SymmetricKey;
pub use controller::{error_policy, reconcile, Context, JoinRequestClient, KubeJoinRequestClient};
pub use node::{JoinBootstrap, JoinSession};

use thiserror::Error;

/// Errors from the join protocol
#[derive(Debug, Error)]
pub enum JoinError {
    /// Key wrapping or credential issuance failed
    #[error(transparent)]
    Pki(#[from] tessera_pki::PkiError),

    /// The target cluster rejected the allocation or could not be loaded
    #[error(transparent)]
    Cluster(#[from] tessera_cluster::ClusterError),

    /// Kubernetes API failure
    #[error(transparent)]
    Api(#[from] tessera_common::Error),

    /// The unwrapped symmetric key is unusable
    #[error("invalid symmetric key: {0}")]
    InvalidSymmetricKey(String),

    /// A field could not be sealed
    #[error("could not seal {field}: {message}")]
    Seal {
        /// Status field being sealed
        field: String,
        /// Underlying failure
        message: String,
    },

    /// A field could not be opened: wrong key, tampered or malformed ciphertext
    #[error("could not open {field}: wrong key or tampered ciphertext")]
    Open {
        /// Status field being opened
        field: String,
    },

    /// The request has not been issued yet
    #[error("join request {request:?} is not issued yet")]
    NotIssued {
        /// Request name
        request: String,
    },

    /// The request is marked issued but fields are empty
    #[error("join request {request:?} is issued but missing {missing:?}")]
    Incomplete {
        /// Request name
        request: String,
        /// Empty ciphered fields
        missing: Vec<&'static str>,
    },

    /// Bootstrap material could not be rendered or parsed
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl JoinError {
    /// Whether retrying the same request later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            JoinError::Api(e) | JoinError::Cluster(tessera_cluster::ClusterError::Api(e)) => {
                e.is_retryable()
            }
            _ => false,
        }
    }
}

/// Result type for join operations
pub type Result<T> = std::result::Result<T, JoinError>;
