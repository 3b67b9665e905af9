//! Archive encryption
//!
//! Container file format: `nonce(12) || ciphertext || auth_tag(16)`.
//! ChaCha20-Poly1305 appends the tag to its ciphertext, so sealing is
//! nonce-prefix plus one AEAD pass. The key is derived from a high-entropy
//! operator secret with Argon2id and a fixed salt; decryption rejects
//! anything shorter than nonce + tag before touching the cipher.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::types::{HelmsmanError, Result};

/// Nonce length (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Fixed KDF salt; the secret itself carries the entropy
const KDF_SALT: &[u8; 16] = b"helmsman-archive";

/// Argon2id parameters for deriving the archive key
const KDF_MEMORY_KB: u32 = 65536;
const KDF_ITERATIONS: u32 = 3;
const KDF_PARALLELISM: u32 = 4;

/// AEAD wrapper around the derived archive key
pub struct ArchiveCipher {
    cipher: ChaCha20Poly1305,
}

impl ArchiveCipher {
    /// Derive the archive key from the configured secret
    pub fn derive(secret: &str) -> Result<Self> {
        let params = Params::new(KDF_MEMORY_KB, KDF_ITERATIONS, KDF_PARALLELISM, Some(32))
            .map_err(|e| HelmsmanError::Internal(format!("invalid Argon2 params: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(secret.as_bytes(), KDF_SALT, key.as_mut())
            .map_err(|e| HelmsmanError::Internal(format!("archive key derivation failed: {}", e)))?;

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_ref())),
        })
    }

    /// Encrypt an archive: random nonce, then `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| HelmsmanError::Internal(format!("archive encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a sealed archive, verifying the auth tag
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + AUTH_TAG_LEN {
            return Err(HelmsmanError::BadRequest(format!(
                "sealed archive too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                HelmsmanError::BadRequest("archive decryption failed (tampered or wrong key)".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = ArchiveCipher::derive("a-high-entropy-operator-secret-0123456789").unwrap();
        let sealed = cipher.seal(b"tarball bytes").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 13 + AUTH_TAG_LEN);
        assert_eq!(cipher.open(&sealed).unwrap(), b"tarball bytes");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = ArchiveCipher::derive("secret-one-0123456789-0123456789").unwrap();
        let b = ArchiveCipher::derive("secret-two-0123456789-0123456789").unwrap();
        let sealed = a.seal(b"data").unwrap();
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn test_tamper_rejected() {
        let cipher = ArchiveCipher::derive("a-high-entropy-operator-secret-0123456789").unwrap();
        let mut sealed = cipher.seal(b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_short_input_rejected_before_decrypt() {
        let cipher = ArchiveCipher::derive("a-high-entropy-operator-secret-0123456789").unwrap();
        assert!(cipher.open(&[0u8; NONCE_LEN + AUTH_TAG_LEN - 1]).is_err());
        assert!(cipher.open(b"").is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let cipher = ArchiveCipher::derive("a-high-entropy-operator-secret-0123456789").unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }
}
