//! Thin AEAD wrapper around the out-of-scope crypto primitive (spec §1, §9).
//!
//! The core never hand-rolls AES-GCM; it calls through this trait so the
//! SecretManager and Emitter stay unit-testable without a live cipher.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use parking_lot::Mutex;
use rand::RngCore;

use crate::error::CoreError;

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// AES-256-GCM encrypt/decrypt plus IV generation, injected so the rest of
/// the core depends on a trait object, not a concrete cipher crate.
pub trait CryptoProvider: Send + Sync {
    /// Encrypts `plaintext` under `key` with random `aad` bound in, using a
    /// freshly generated 12-byte IV. Returns `(iv, ciphertext_with_tag)`.
    fn encrypt(&self, key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<([u8; IV_LEN], Vec<u8>), CoreError>;

    /// Decrypts `ciphertext_with_tag` (ciphertext followed by the 16-byte
    /// GCM tag) under `key`/`iv`/`aad`.
    fn decrypt(&self, key: &[u8], iv: &[u8; IV_LEN], aad: &[u8], ciphertext_with_tag: &[u8]) -> Result<Vec<u8>, CoreError>;
}

/// The production `CryptoProvider`, backed by the `aes-gcm` crate. The
/// crypto context sits behind a single mutex because the underlying
/// primitive is not reentrant (spec §5).
pub struct Aes256GcmProvider {
    // Guards nothing stateful in aes-gcm itself today, but keeps the
    // contract explicit and gives us one place to serialize against if a
    // future primitive needs it.
    _lock: Mutex<()>,
}

impl Default for Aes256GcmProvider {
    fn default() -> Self {
        Aes256GcmProvider { _lock: Mutex::new(()) }
    }
}

impl Aes256GcmProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoProvider for Aes256GcmProvider {
    fn encrypt(&self, key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<([u8; IV_LEN], Vec<u8>), CoreError> {
        let _guard = self._lock.lock();
        if key.len() != KEY_LEN {
            return Err(CoreError::Other(format!("key length {} != {KEY_LEN}", key.len())));
        }
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| CoreError::Other(format!("AES-GCM encrypt failed: {e}")))?;
        Ok((iv, ciphertext))
    }

    fn decrypt(&self, key: &[u8], iv: &[u8; IV_LEN], aad: &[u8], ciphertext_with_tag: &[u8]) -> Result<Vec<u8>, CoreError> {
        let _guard = self._lock.lock();
        if key.len() != KEY_LEN {
            return Err(CoreError::Other(format!("key length {} != {KEY_LEN}", key.len())));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Nonce::from_slice(iv);
        cipher
            .decrypt(nonce, Payload { msg: ciphertext_with_tag, aad })
            .map_err(|e| CoreError::Other(format!("AES-GCM decrypt failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let provider = Aes256GcmProvider::new();
        let key = [0x42u8; KEY_LEN];
        let aad = b"topic-seq-aad";
        let plaintext = b"hello from the device";
        let (iv, ct) = provider.encrypt(&key, aad, plaintext).unwrap();
        let pt = provider.decrypt(&key, &iv, aad, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let provider = Aes256GcmProvider::new();
        let key = [0x11u8; KEY_LEN];
        let aad = b"aad";
        let (iv, mut ct) = provider.encrypt(&key, aad, b"payload").unwrap();
        ct[0] ^= 0xff;
        assert!(provider.decrypt(&key, &iv, aad, &ct).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let provider = Aes256GcmProvider::new();
        let key_a = [0x01u8; KEY_LEN];
        let key_b = [0x02u8; KEY_LEN];
        let (iv, ct) = provider.encrypt(&key_a, b"aad", b"payload").unwrap();
        assert!(provider.decrypt(&key_b, &iv, b"aad", &ct).is_err());
    }
}
