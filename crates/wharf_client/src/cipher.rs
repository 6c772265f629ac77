//! Document encryption seam.
//!
//! The engine never touches key material directly; it encrypts and
//! decrypts through [`DocumentCipher`]. The shipped implementation is
//! AES-256-GCM with a random 96-bit nonce prepended to each ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{ClientError, ClientResult};

const NONCE_LEN: usize = 12;

/// Symmetric cipher for document payloads.
pub trait DocumentCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> ClientResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> ClientResult<Vec<u8>>;
}

/// AES-256-GCM document cipher. Output layout: `nonce(12) ‖ ciphertext+tag`.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }
}

impl DocumentCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> ClientResult<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| ClientError::Integrity("encryption failed".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> ClientResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(ClientError::Integrity(
                "ciphertext shorter than nonce".to_string(),
            ));
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| ClientError::Integrity("ciphertext authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = AesGcmCipher::new([7u8; 32]);
        let ciphertext = cipher.encrypt(b"attack at dawn").unwrap();
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_nonces_are_fresh() {
        let cipher = AesGcmCipher::new([7u8; 32]);
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b, "two encryptions of the same plaintext must differ");
    }

    #[test]
    fn test_tampering_detected() {
        let cipher = AesGcmCipher::new([7u8; 32]);
        let mut ciphertext = cipher.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&ciphertext).unwrap_err(),
            ClientError::Integrity(_)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = AesGcmCipher::new([1u8; 32]);
        let b = AesGcmCipher::new([2u8; 32]);
        let ciphertext = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_ciphertext() {
        let cipher = AesGcmCipher::new([7u8; 32]);
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
    }
}
