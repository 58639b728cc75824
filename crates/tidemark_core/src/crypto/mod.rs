//! End-to-end encryption: authenticated envelopes with associated data.
//!
//! Rows and CRDT update payloads are wrapped in AEAD envelopes before they
//! reach the remote. The associated data binds a ciphertext to the record
//! it belongs to, so a ciphertext copied onto another row fails to decrypt.
//!
//! ## Security model
//!
//! - AES-256-GCM by default, behind the [`CryptoProvider`] capability
//! - Fresh 12-byte random nonce per encryption
//! - Key bytes are zeroized on drop
//! - Key management stays outside this crate; callers supply key material
//!   and a `key_id` label

mod envelope;
mod provider;

pub use envelope::{
    decode_plain_payload, encode_plain_payload, AadContext, AadScheme, Envelope, EnvelopeCodec,
    LogKind,
};
pub use provider::{Aes256GcmProvider, CryptoProvider, EncryptionKey, AES_256_GCM, NONCE_SIZE};
