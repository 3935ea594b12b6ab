//! WireGuard (X25519) key pairs

use std::fmt;

use aws_lc_rs::agreement::{PrivateKey, X25519};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::Zeroizing;

use crate::{Result, VpnError};

const KEY_LEN: usize = 32;

/// Clamp a scalar the way WireGuard does before use
fn clamp(key: &mut [u8; KEY_LEN]) {
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
}

fn derive_public(private: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN]> {
    let key = PrivateKey::from_private_key(&X25519, private)
        .map_err(|e| VpnError::KeyGeneration(format!("invalid private key: {e}")))?;
    let public = key
        .compute_public_key()
        .map_err(|e| VpnError::KeyGeneration(format!("failed to derive public key: {e}")))?;
    <[u8; KEY_LEN]>::try_from(public.as_ref())
        .map_err(|_| VpnError::KeyGeneration("unexpected public key length".to_string()))
}

fn decode_key(what: &str, encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|e| VpnError::InvalidKey(format!("{what} key is not base64: {e}")))?,
    );
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        VpnError::InvalidKey(format!(
            "{what} key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

/// A WireGuard key pair
#[derive(Clone, PartialEq, Eq)]
pub struct VpnKeyPair {
    private_key: Zeroizing<[u8; KEY_LEN]>,
    public_key: [u8; KEY_LEN],
}

impl VpnKeyPair {
    /// Generate a fresh key pair from 32 random, clamped bytes
    pub fn generate() -> Result<Self> {
        let mut private_key = Zeroizing::new([0u8; KEY_LEN]);
        aws_lc_rs::rand::fill(&mut *private_key)
            .map_err(|_| VpnError::KeyGeneration("random source unavailable".to_string()))?;
        clamp(&mut private_key);

        let public_key = derive_public(&private_key)?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Load a persisted key pair from its base64 halves, checking they match
    pub fn from_base64(private_key: &str, public_key: &str) -> Result<Self> {
        let private_key = Zeroizing::new(decode_key("private", private_key)?);
        let public_key = decode_key("public", public_key)?;
        if derive_public(&private_key)? != public_key {
            return Err(VpnError::InvalidKey(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Base64 private key, as WireGuard configuration expects it
    pub fn private_key_base64(&self) -> String {
        STANDARD.encode(self.private_key.as_slice())
    }

    /// Base64 public key, as WireGuard configuration expects it
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key)
    }
}

impl fmt::Debug for VpnKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpnKeyPair")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}
