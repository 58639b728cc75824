//! The cryptographic capability and its AES-256-GCM default.

use crate::crypto::envelope::Envelope;
use crate::error::{CoreError, CoreResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Algorithm label written into envelopes by the default provider.
pub const AES_256_GCM: &str = "AES-256-GCM";

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// A 256-bit key, zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Builds a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly 32 bytes are supplied.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CoreError::invalid_key_size(bytes.len(), KEY_SIZE));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AEAD capability consumed by the envelope codec.
///
/// Implementations produce complete envelopes so an alternative provider
/// can choose its own algorithm label and versioning.
pub trait CryptoProvider: Send + Sync {
    /// Encrypts `plaintext`, binding `aad` into the authentication tag.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CoreResult<Envelope>;

    /// Decrypts an envelope produced by [`encrypt`](Self::encrypt).
    ///
    /// Any key, nonce, ciphertext, or AAD mismatch is an error; the caller
    /// never receives partially-authenticated plaintext.
    fn decrypt(&self, envelope: &Envelope, aad: &[u8]) -> CoreResult<Vec<u8>>;
}

/// The default provider: AES-256-GCM with a random nonce per envelope.
pub struct Aes256GcmProvider {
    cipher: Aes256Gcm,
    key_id: String,
}

impl Aes256GcmProvider {
    /// Creates a provider for `key`, labeling envelopes with `key_id`.
    #[must_use]
    pub fn new(key: EncryptionKey, key_id: impl Into<String>) -> Self {
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        Self {
            cipher,
            key_id: key_id.into(),
        }
    }

    /// The key label written into envelopes.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl std::fmt::Debug for Aes256GcmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes256GcmProvider")
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl CryptoProvider for Aes256GcmProvider {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CoreResult<Envelope> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CoreError::encryption_failed("AEAD encryption error"))?;

        Ok(Envelope {
            version: 1,
            algorithm: AES_256_GCM.to_owned(),
            key_id: self.key_id.clone(),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn decrypt(&self, envelope: &Envelope, aad: &[u8]) -> CoreResult<Vec<u8>> {
        if envelope.algorithm != AES_256_GCM {
            return Err(CoreError::UnsupportedAlgorithm {
                algorithm: envelope.algorithm.clone(),
            });
        }
        if envelope.key_id != self.key_id {
            return Err(CoreError::UnknownKeyId {
                key_id: envelope.key_id.clone(),
            });
        }

        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|_| CoreError::malformed_envelope("nonce is not base64"))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CoreError::malformed_envelope("nonce has wrong length"));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|_| CoreError::malformed_envelope("ciphertext is not base64"))?;

        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad,
                },
            )
            .map_err(|_| CoreError::decryption_failed("AEAD authentication failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Aes256GcmProvider {
        Aes256GcmProvider::new(EncryptionKey::generate(), "k1")
    }

    #[test]
    fn roundtrip_with_aad() {
        let p = provider();
        let envelope = p.encrypt(b"secret", b"products:1").unwrap();
        assert_eq!(envelope.version, 1);
        assert_eq!(envelope.algorithm, AES_256_GCM);
        assert_eq!(envelope.key_id, "k1");

        let plain = p.decrypt(&envelope, b"products:1").unwrap();
        assert_eq!(plain, b"secret");
    }

    #[test]
    fn aad_mismatch_fails() {
        let p = provider();
        let envelope = p.encrypt(b"secret", b"products:1").unwrap();
        assert!(p.decrypt(&envelope, b"products:2").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let a = provider();
        let b = provider();
        let envelope = a.encrypt(b"secret", b"aad").unwrap();
        assert!(b.decrypt(&envelope, b"aad").is_err());
    }

    #[test]
    fn unknown_algorithm_fails_loudly() {
        let p = provider();
        let mut envelope = p.encrypt(b"secret", b"aad").unwrap();
        envelope.algorithm = "XCHACHA20".into();
        let err = p.decrypt(&envelope, b"aad").unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedAlgorithm { .. }));
    }

    #[test]
    fn foreign_key_id_fails() {
        let p = provider();
        let mut envelope = p.encrypt(b"secret", b"aad").unwrap();
        envelope.key_id = "k9".into();
        let err = p.decrypt(&envelope, b"aad").unwrap_err();
        assert!(matches!(err, CoreError::UnknownKeyId { .. }));
    }

    #[test]
    fn corrupted_ciphertext_fails() {
        let p = provider();
        let mut envelope = p.encrypt(b"data", b"aad").unwrap();
        let mut raw = BASE64.decode(&envelope.ciphertext).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        envelope.ciphertext = BASE64.encode(raw);
        assert!(p.decrypt(&envelope, b"aad").is_err());
    }

    #[test]
    fn nonces_are_fresh() {
        let p = provider();
        let a = p.encrypt(b"same", b"aad").unwrap();
        let b = p.encrypt(b"same", b"aad").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn key_size_enforced() {
        assert!(EncryptionKey::from_bytes(&[0u8; 16]).is_err());
        assert!(EncryptionKey::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = EncryptionKey::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
