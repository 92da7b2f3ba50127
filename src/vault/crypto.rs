use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::errors::{BrokerError, Result};

const NONCE_LEN: usize = 12;

/// AES-256-GCM helper for secret-bearing credential fields.
///
/// Output layout is `base64(nonce || ciphertext || tag)` with a fresh random
/// 12-byte nonce per call.
///
/// Key derivation is deliberately naive: the operator secret is copied into a
/// 32-byte buffer, zero-padded if shorter and truncated if longer. There is no
/// KDF, so a short or low-entropy secret yields a weak key. Operators should
/// supply 32 random bytes.
pub struct CredentialCipher {
    key: Zeroizing<[u8; 32]>,
}

impl CredentialCipher {
    pub fn new(secret: &str) -> Self {
        Self {
            key: Zeroizing::new(derive_key(secret.as_bytes())),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| BrokerError::Encryption(format!("invalid key length: {:?}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| BrokerError::Encryption(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| BrokerError::Encryption(format!("ciphertext is not base64: {}", e)))?;
        if data.len() < NONCE_LEN {
            return Err(BrokerError::Encryption("ciphertext too short".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| BrokerError::Encryption(format!("invalid key length: {:?}", e)))?;
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BrokerError::Encryption("decryption failed (corrupt data or wrong key)".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| BrokerError::Encryption(format!("plaintext is not UTF-8: {}", e)))
    }
}

/// Zero-pad or truncate `secret` to exactly 32 bytes.
pub fn derive_key(secret: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    let n = secret.len().min(32);
    key[..n].copy_from_slice(&secret[..n]);
    key
}

/// How the operator secret was fitted to the key size. Used by `key check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFit {
    Exact,
    Padded { missing: usize },
    Truncated { dropped: usize },
}

pub fn key_fit(secret: &[u8]) -> KeyFit {
    match secret.len() {
        32 => KeyFit::Exact,
        n if n < 32 => KeyFit::Padded { missing: 32 - n },
        n => KeyFit::Truncated { dropped: n - 32 },
    }
}
