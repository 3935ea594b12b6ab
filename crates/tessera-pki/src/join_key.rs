//! Cluster join key
//!
//! Nodes choose a symmetric key for their join request and wrap it with the
//! cluster's public join key (RSA-OAEP with SHA-256). Only the holder of the
//! private half, the managing authority, can unwrap it.

use std::fmt;

use aws_lc_rs::encoding::AsDer;
use aws_lc_rs::rsa::{
    KeySize, OaepPrivateDecryptingKey, OaepPublicEncryptingKey, PrivateDecryptingKey,
    PublicEncryptingKey, OAEP_SHA256_MGF1SHA256,
};
use zeroize::Zeroizing;

use crate::{PkiError, Result};

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

fn decode_pem(pem_data: &str, tag: &str) -> Result<Vec<u8>> {
    let parsed = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {e}")))?;
    if parsed.tag() != tag {
        return Err(PkiError::ParseError(format!(
            "expected PEM block {tag:?}, found {:?}",
            parsed.tag()
        )));
    }
    Ok(parsed.contents().to_vec())
}

fn encode_pem(tag: &str, der: &[u8]) -> String {
    ::pem::encode(&::pem::Pem::new(tag, der.to_vec()))
}

fn load_private(private_key_pem: &str) -> Result<PrivateDecryptingKey> {
    let der = Zeroizing::new(decode_pem(private_key_pem, PRIVATE_KEY_TAG)?);
    PrivateDecryptingKey::from_pkcs8(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse join key: {e}")))
}

fn load_public(public_key_pem: &str) -> Result<PublicEncryptingKey> {
    let der = decode_pem(public_key_pem, PUBLIC_KEY_TAG)?;
    PublicEncryptingKey::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse join public key: {e}")))
}

fn public_pem_of(key: &PrivateDecryptingKey) -> Result<String> {
    let der = key
        .public_key()
        .as_der()
        .map_err(|_| PkiError::KeyGenerationFailed("failed to encode join public key".into()))?;
    Ok(encode_pem(PUBLIC_KEY_TAG, der.as_ref()))
}

/// The cluster's RSA join key pair
#[derive(Clone, PartialEq, Eq)]
pub struct JoinKey {
    private_key_pem: Zeroizing<String>,
    public: JoinPublicKey,
}

impl JoinKey {
    /// Generate a fresh 2048-bit key pair
    pub fn generate() -> Result<Self> {
        let key = PrivateDecryptingKey::generate(KeySize::Rsa2048)
            .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate join key: {e}")))?;
        let der = key
            .as_der()
            .map_err(|_| PkiError::KeyGenerationFailed("failed to encode join key".into()))?;

        Ok(Self {
            private_key_pem: Zeroizing::new(encode_pem(PRIVATE_KEY_TAG, der.as_ref())),
            public: JoinPublicKey {
                pem: public_pem_of(&key)?,
            },
        })
    }

    /// Load a persisted key pair, checking the halves belong together
    pub fn from_pem(public_key_pem: &str, private_key_pem: &str) -> Result<Self> {
        let key = load_private(private_key_pem)?;
        let public = JoinPublicKey::from_pem(public_key_pem)?;
        if decode_pem(&public_pem_of(&key)?, PUBLIC_KEY_TAG)?
            != decode_pem(public_key_pem, PUBLIC_KEY_TAG)?
        {
            return Err(PkiError::ParseError(
                "join public key does not match private key".to_string(),
            ));
        }

        Ok(Self {
            private_key_pem: Zeroizing::new(private_key_pem.to_string()),
            public,
        })
    }

    /// The public half, handed to joining nodes
    pub fn public_key(&self) -> &JoinPublicKey {
        &self.public
    }

    /// PEM (PKCS#8) private key, for persistence
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Unwrap a ciphertext produced by [`JoinPublicKey::encrypt`]
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let key = OaepPrivateDecryptingKey::new(load_private(&self.private_key_pem)?)
            .map_err(|e| PkiError::DecryptionFailed(e.to_string()))?;

        let mut out = Zeroizing::new(vec![0u8; key.min_output_size()]);
        let len = key
            .decrypt(&OAEP_SHA256_MGF1SHA256, ciphertext, out.as_mut_slice(), None)
            .map_err(|_| PkiError::DecryptionFailed("ciphertext rejected".to_string()))?
            .len();
        out.truncate(len);
        Ok(out)
    }
}

impl fmt::Debug for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinKey")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Public half of a [`JoinKey`] (SPKI PEM)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinPublicKey {
    pem: String,
}

impl JoinPublicKey {
    /// Load a public key from PEM
    pub fn from_pem(public_key_pem: &str) -> Result<Self> {
        load_public(public_key_pem)?;
        Ok(Self {
            pem: public_key_pem.to_string(),
        })
    }

    /// PEM encoding
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Wrap `plaintext` so only the private half can read it
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = OaepPublicEncryptingKey::new(load_public(&self.pem)?)
            .map_err(|e| PkiError::EncryptionFailed(e.to_string()))?;

        let mut out = vec![0u8; key.ciphertext_size()];
        let len = key
            .encrypt(&OAEP_SHA256_MGF1SHA256, plaintext, &mut out, None)
            .map_err(|_| PkiError::EncryptionFailed("plaintext too long for join key".into()))?
            .len();
        out.truncate(len);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_secret_unwraps_with_private_half() {
        let key = JoinKey::generate().expect("join key should generate");
        let secret = [7u8; 32];

        let wrapped = key.public_key().encrypt(&secret).unwrap();
        assert_ne!(wrapped.as_slice(), secret.as_slice());

        let unwrapped = key.decrypt(&wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), secret.as_slice());
    }

    #[test]
    fn other_key_cannot_unwrap() {
        let key = JoinKey::generate().unwrap();
        let other = JoinKey::generate().unwrap();

        let wrapped = key.public_key().encrypt(b"symmetric key").unwrap();
        assert!(matches!(
            other.decrypt(&wrapped),
            Err(PkiError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = JoinKey::generate().unwrap();
        let mut wrapped = key.public_key().encrypt(b"symmetric key").unwrap();
        wrapped[10] ^= 0x01;
        assert!(key.decrypt(&wrapped).is_err());
    }

    #[test]
    fn key_survives_pem_round_trip() {
        let key = JoinKey::generate().unwrap();
        assert!(key.private_key_pem().contains("BEGIN PRIVATE KEY"));
        assert!(key.public_key().pem().contains("BEGIN PUBLIC KEY"));

        let loaded = JoinKey::from_pem(key.public_key().pem(), key.private_key_pem())
            .expect("persisted join key should load");
        assert_eq!(key, loaded);

        let wrapped = key.public_key().encrypt(b"hello").unwrap();
        assert_eq!(loaded.decrypt(&wrapped).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn mismatched_halves_are_rejected() {
        let a = JoinKey::generate().unwrap();
        let b = JoinKey::generate().unwrap();
        assert!(JoinKey::from_pem(b.public_key().pem(), a.private_key_pem()).is_err());
    }

    #[test]
    fn wrong_pem_block_is_rejected() {
        let key = JoinKey::generate().unwrap();
        assert!(JoinPublicKey::from_pem(key.private_key_pem()).is_err());
    }
}
