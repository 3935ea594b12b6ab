//! Field-level sealing of join request status values
//!
//! Each value is sealed on its own with AES-256-GCM under the node's
//! symmetric key. The stored form is `base64(nonce || ciphertext || tag)`
//! with a fresh random 96-bit nonce per value. The status field name is
//! bound as associated data, so a ciphertext moved to another field fails
//! to open.

use std::fmt;

use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use tessera_common::crd::Ciphered;

use crate::{JoinError, Result};

/// Length in bytes of a join symmetric key
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// A node's AES-256 join key
#[derive(Clone)]
pub struct SymmetricKey {
    bytes: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
}

impl SymmetricKey {
    /// Generate a fresh random key
    pub fn generate() -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
        aws_lc_rs::rand::fill(&mut bytes[..])
            .map_err(|_| JoinError::InvalidSymmetricKey("random generator failed".to_string()))?;
        Ok(Self { bytes })
    }

    /// Use `bytes` as the key; it must be exactly 32 bytes long
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; SYMMETRIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            JoinError::InvalidSymmetricKey(format!(
                "expected {SYMMETRIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            bytes: Zeroizing::new(array),
        })
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    fn aead_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, self.as_bytes())
            .map_err(|_| JoinError::InvalidSymmetricKey("rejected by AES-256-GCM".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Seal `plaintext` as the value of status field `field`
    pub fn seal(&self, field: &str, plaintext: &[u8]) -> Result<Ciphered> {
        let seal_error = |message: &str| JoinError::Seal {
            field: field.to_string(),
            message: message.to_string(),
        };

        let key = self.aead_key()?;
        let mut nonce = [0u8; NONCE_LEN];
        aws_lc_rs::rand::fill(&mut nonce).map_err(|_| seal_error("random generator failed"))?;

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(field.as_bytes()),
            &mut in_out,
        )
        .map_err(|_| seal_error("AES-256-GCM seal failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&in_out);
        Ok(Ciphered::from_encoded(STANDARD.encode(sealed)))
    }

    /// Seal a string value
    pub fn seal_str(&self, field: &str, plaintext: &str) -> Result<Ciphered> {
        self.seal(field, plaintext.as_bytes())
    }

    /// Open the value of status field `field`.
    ///
    /// Fails if the value was sealed under another key, for another field,
    /// or was modified in any way.
    pub fn open(&self, field: &str, ciphered: &Ciphered) -> Result<Zeroizing<Vec<u8>>> {
        let open_error = || JoinError::Open {
            field: field.to_string(),
        };

        let sealed = STANDARD
            .decode(ciphered.as_encoded())
            .map_err(|_| open_error())?;
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(open_error());
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| open_error())?;

        let key = self.aead_key()?;
        let mut in_out = Zeroizing::new(ciphertext.to_vec());
        let plaintext_len = key
            .open_in_place(nonce, Aad::from(field.as_bytes()), in_out.as_mut_slice())
            .map_err(|_| open_error())?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }

    /// Open a value that was sealed with [`SymmetricKey::seal_str`]
    pub fn open_string(&self, field: &str, ciphered: &Ciphered) -> Result<Zeroizing<String>> {
        let bytes = self.open(field, ciphered)?;
        let text = std::str::from_utf8(&bytes).map_err(|_| JoinError::Open {
            field: field.to_string(),
        })?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.as_slice() == other.bytes.as_slice()
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([redacted])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_value_opens_with_the_same_key() {
        let key = SymmetricKey::generate().unwrap();
        let sealed = key.seal_str("kubeConfig", "apiVersion: v1").unwrap();

        assert_ne!(sealed.as_encoded(), "apiVersion: v1");
        assert_eq!(
            key.open_string("kubeConfig", &sealed).unwrap().as_str(),
            "apiVersion: v1"
        );
    }

    #[test]
    fn every_seal_uses_a_fresh_nonce() {
        let key = SymmetricKey::generate().unwrap();
        let a = key.seal_str("vpnAddress", "10.0.0.2/32").unwrap();
        let b = key.seal_str("vpnAddress", "10.0.0.2/32").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_is_detected() {
        let key = SymmetricKey::generate().unwrap();
        let other = SymmetricKey::generate().unwrap();
        let sealed = key.seal_str("kubernetesVersion", "1.32.2").unwrap();

        let err = other.open("kubernetesVersion", &sealed).unwrap_err();
        assert!(matches!(err, JoinError::Open { field } if field == "kubernetesVersion"));
    }

    #[test]
    fn flipped_byte_is_detected() {
        let key = SymmetricKey::generate().unwrap();
        let sealed = key.seal_str("kubeletConfig", "kind: KubeletConfiguration").unwrap();

        let mut raw = STANDARD.decode(sealed.as_encoded()).unwrap();
        let last = raw.len() - 1;
        raw[NONCE_LEN] ^= 0x01;
        raw[last] ^= 0x80;
        let tampered = Ciphered::from_encoded(STANDARD.encode(raw));

        assert!(key.open("kubeletConfig", &tampered).is_err());
    }

    #[test]
    fn value_moved_to_another_field_does_not_open() {
        let key = SymmetricKey::generate().unwrap();
        let sealed = key.seal_str("kubeletServerPrivateKey", "secret").unwrap();
        assert!(key.open("kubeletServerCertificate", &sealed).is_err());
    }

    #[test]
    fn truncated_and_non_base64_values_are_rejected() {
        let key = SymmetricKey::generate().unwrap();
        assert!(key
            .open("vpnAddress", &Ciphered::from_encoded("AAAA"))
            .is_err());
        assert!(key
            .open("vpnAddress", &Ciphered::from_encoded("not base64!"))
            .is_err());
    }

    #[test]
    fn key_length_is_enforced() {
        assert!(matches!(
            SymmetricKey::from_bytes(&[0u8; 16]),
            Err(JoinError::InvalidSymmetricKey(_))
        ));
        let key = SymmetricKey::from_bytes(&[7u8; SYMMETRIC_KEY_LEN]).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; SYMMETRIC_KEY_LEN]);
    }

    #[test]
    fn debug_redacts_key_material() {
        let key = SymmetricKey::from_bytes(&[0xAB; SYMMETRIC_KEY_LEN]).unwrap();
        assert_eq!(format!("{key:?}"), "SymmetricKey([redacted])");
    }
}
