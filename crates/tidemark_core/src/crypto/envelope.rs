//! Envelope records and the row-level codec.

use crate::crypto::provider::CryptoProvider;
use crate::error::{CoreError, CoreResult};
use crate::record::{RecordId, RecordIdInput};
use crate::value::{Row, Value, FIELD_ID, FIELD_SYNC_DELETED, FIELD_UPDATED_AT};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An authenticated encrypted envelope.
///
/// The in-memory serde form uses the compact labels `{v, alg, kid, n, ct}`;
/// rows stored on the remote carry the full field names (see
/// [`Envelope::write_into`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope format version.
    #[serde(rename = "v")]
    pub version: i64,
    /// AEAD algorithm label.
    #[serde(rename = "alg")]
    pub algorithm: String,
    /// Label of the key that produced the ciphertext.
    #[serde(rename = "kid")]
    pub key_id: String,
    /// Base64 nonce.
    #[serde(rename = "n")]
    pub nonce: String,
    /// Base64 ciphertext (tag included).
    #[serde(rename = "ct")]
    pub ciphertext: String,
}

/// Stored field names, in row order.
const ENVELOPE_FIELDS: [&str; 5] = ["version", "algorithm", "key_id", "nonce", "ciphertext"];

impl Envelope {
    /// Writes the envelope into a row under the full field names.
    pub fn write_into(&self, row: &mut Row) {
        row.set("version", self.version);
        row.set("algorithm", self.algorithm.as_str());
        row.set("key_id", self.key_id.as_str());
        row.set("nonce", self.nonce.as_str());
        row.set("ciphertext", self.ciphertext.as_str());
    }

    /// Reads an envelope from a stored row.
    ///
    /// Returns `Ok(None)` when no envelope fields are present, an error
    /// when only some of them are.
    pub fn from_row(row: &Row) -> CoreResult<Option<Self>> {
        let present = ENVELOPE_FIELDS
            .iter()
            .filter(|f| row.contains(f))
            .count();
        if present == 0 {
            return Ok(None);
        }
        if present < ENVELOPE_FIELDS.len() {
            return Err(CoreError::malformed_envelope(
                "row carries a partial envelope",
            ));
        }

        let text = |field: &str| -> CoreResult<String> {
            row.get(field)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| CoreError::malformed_envelope(format!("{field} is not text")))
        };
        let version = row
            .get("version")
            .and_then(Value::as_int)
            .ok_or_else(|| CoreError::malformed_envelope("version is not an integer"))?;

        Ok(Some(Self {
            version,
            algorithm: text("algorithm")?,
            key_id: text("key_id")?,
            nonce: text("nonce")?,
            ciphertext: text("ciphertext")?,
        }))
    }

    /// Removes envelope fields from a row.
    pub fn strip_from(row: &mut Row) {
        for field in ENVELOPE_FIELDS {
            row.remove(field);
        }
    }
}

/// Which log-row payload an update envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// An incremental update.
    Update,
    /// A full snapshot.
    Snapshot,
}

impl LogKind {
    /// The plaintext column the payload lives in when E2EE is off.
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            LogKind::Update => "update_bytes",
            LogKind::Snapshot => "snapshot_bytes",
        }
    }
}

/// Inputs to associated-data derivation.
#[derive(Debug, Clone, Copy)]
pub struct AadContext<'a> {
    /// Table of the base row the payload belongs to.
    pub base_table: &'a str,
    /// Key of the base row.
    pub record_key: &'a str,
    /// Log table, for update/snapshot payloads.
    pub log_table: Option<&'a str>,
}

/// How associated data is derived for an envelope.
#[derive(Clone)]
pub enum AadScheme {
    /// `"<base_table>:<key>"` for base rows,
    /// `"<log_table>:<base_table>:<doc_key>"` for log rows.
    Default,
    /// The same fixed string for every envelope.
    Fixed(String),
    /// Caller-supplied derivation.
    Custom(Arc<dyn Fn(&AadContext<'_>) -> String + Send + Sync>),
}

impl AadScheme {
    /// Derives the associated data for a context.
    #[must_use]
    pub fn derive(&self, ctx: &AadContext<'_>) -> String {
        match self {
            AadScheme::Default => match ctx.log_table {
                None => format!("{}:{}", ctx.base_table, ctx.record_key),
                Some(log) => format!("{}:{}:{}", log, ctx.base_table, ctx.record_key),
            },
            AadScheme::Fixed(aad) => aad.clone(),
            AadScheme::Custom(derive) => derive(ctx),
        }
    }
}

impl std::fmt::Debug for AadScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AadScheme::Default => f.write_str("AadScheme::Default"),
            AadScheme::Fixed(aad) => write!(f, "AadScheme::Fixed({aad:?})"),
            AadScheme::Custom(_) => f.write_str("AadScheme::Custom(..)"),
        }
    }
}

/// Encrypts and decrypts rows and log payloads.
#[derive(Clone)]
pub struct EnvelopeCodec {
    provider: Arc<dyn CryptoProvider>,
    aad: AadScheme,
}

impl EnvelopeCodec {
    /// Creates a codec with the default AAD derivation.
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self {
            provider,
            aad: AadScheme::Default,
        }
    }

    /// Overrides the AAD derivation.
    #[must_use]
    pub fn with_aad(mut self, aad: AadScheme) -> Self {
        self.aad = aad;
        self
    }

    /// Encrypts a base row.
    ///
    /// Every application field is folded into the ciphertext; `id` and the
    /// sync fields stay plaintext columns so the remote can filter on them.
    pub fn encode_base_row(&self, row: &Row, id: &RecordId) -> CoreResult<Row> {
        let mut payload = row.clone();
        payload.remove(FIELD_ID);
        let passthrough: Vec<(String, Value)> = [FIELD_SYNC_DELETED, FIELD_UPDATED_AT]
            .iter()
            .filter_map(|f| payload.remove(f).map(|v| ((*f).to_owned(), v)))
            .collect();

        let plaintext = serde_json::to_vec(&payload.to_json())?;
        let aad = self.aad.derive(&AadContext {
            base_table: id.table(),
            record_key: id.key(),
            log_table: None,
        });
        let envelope = self.provider.encrypt(&plaintext, aad.as_bytes())?;

        let mut out = Row::new().with(FIELD_ID, id.clone());
        envelope.write_into(&mut out);
        for (field, value) in passthrough {
            out.set(field, value);
        }
        Ok(out)
    }

    /// Decrypts a base row fetched from the remote.
    ///
    /// Strips the envelope fields, decrypts the ciphertext into an object
    /// payload, and merges it with the plaintext leftovers and the row's
    /// `id`. Rows without an envelope pass through unchanged.
    pub fn decode_base_row(&self, row: &Row) -> CoreResult<Row> {
        let Some(envelope) = Envelope::from_row(row)? else {
            return Ok(row.clone());
        };
        let id_value = row
            .id()
            .cloned()
            .ok_or_else(|| CoreError::malformed_envelope("encrypted row has no id"))?;
        let canonical = RecordIdInput::from_value(&id_value)
            .and_then(|input| input.to_canonical_string())
            .ok_or_else(|| CoreError::malformed_envelope("encrypted row id is not a record id"))?;
        let (table, key) = canonical
            .split_once(':')
            .ok_or_else(|| CoreError::malformed_envelope("encrypted row id is not canonical"))?;

        let aad = self.aad.derive(&AadContext {
            base_table: table,
            record_key: key,
            log_table: None,
        });
        let plaintext = self.provider.decrypt(&envelope, aad.as_bytes())?;
        let payload: serde_json::Value = serde_json::from_slice(&plaintext)?;
        let payload = Row::from_json(payload).ok_or(CoreError::PayloadNotObject)?;

        let mut out = row.clone();
        Envelope::strip_from(&mut out);
        out.merge(payload);
        out.set(FIELD_ID, id_value);
        Ok(out)
    }

    /// Encrypts a log payload into envelope fields.
    pub fn encode_update(
        &self,
        bytes: &[u8],
        log_table: &str,
        doc: &RecordId,
        kind: LogKind,
    ) -> CoreResult<Row> {
        let aad = self.log_aad(log_table, doc.table(), doc.key(), kind);
        let envelope = self.provider.encrypt(bytes, aad.as_bytes())?;
        let mut out = Row::new();
        envelope.write_into(&mut out);
        Ok(out)
    }

    /// Recovers a log payload from a stored row.
    ///
    /// Envelope rows are decrypted; plaintext rows fall back to the
    /// base64 column named by `kind`.
    pub fn decode_update(&self, row: &Row, log_table: &str, kind: LogKind) -> CoreResult<Vec<u8>> {
        match Envelope::from_row(row)? {
            Some(envelope) => {
                let doc = row
                    .get("doc")
                    .and_then(RecordIdInput::from_value)
                    .and_then(|input| input.to_canonical_string())
                    .ok_or_else(|| CoreError::malformed_envelope("log row has no doc id"))?;
                let (base_table, doc_key) = doc
                    .split_once(':')
                    .ok_or_else(|| CoreError::malformed_envelope("log row doc is not canonical"))?;
                let aad = self.log_aad(log_table, base_table, doc_key, kind);
                self.provider.decrypt(&envelope, aad.as_bytes())
            }
            None => decode_plain_payload(row, kind),
        }
    }

    fn log_aad(&self, log_table: &str, base_table: &str, doc_key: &str, _kind: LogKind) -> String {
        self.aad.derive(&AadContext {
            base_table,
            record_key: doc_key,
            log_table: Some(log_table),
        })
    }
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("aad", &self.aad)
            .finish()
    }
}

/// Reads the plaintext base64 payload column from a log row.
pub fn decode_plain_payload(row: &Row, kind: LogKind) -> CoreResult<Vec<u8>> {
    let text = row
        .get(kind.field())
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::malformed_envelope(format!("log row has no {}", kind.field())))?;
    BASE64
        .decode(text)
        .map_err(|_| CoreError::malformed_envelope(format!("{} is not base64", kind.field())))
}

/// Writes a plaintext payload into the base64 column for `kind`.
pub fn encode_plain_payload(row: &mut Row, bytes: &[u8], kind: LogKind) {
    row.set(kind.field(), BASE64.encode(bytes));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::provider::{Aes256GcmProvider, EncryptionKey};

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(Arc::new(Aes256GcmProvider::new(
            EncryptionKey::generate(),
            "k2",
        )))
    }

    #[test]
    fn envelope_row_roundtrip() {
        let envelope = Envelope {
            version: 1,
            algorithm: "AES-256-GCM".into(),
            key_id: "k2".into(),
            nonce: "bm9uY2U=".into(),
            ciphertext: "Y3Q=".into(),
        };
        let mut row = Row::new();
        envelope.write_into(&mut row);
        assert!(row.contains("ciphertext"));
        let back = Envelope::from_row(&row).unwrap().unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn partial_envelope_is_an_error() {
        let mut row = Row::new();
        row.set("nonce", "bm9uY2U=");
        assert!(Envelope::from_row(&row).is_err());
        assert!(Envelope::from_row(&Row::new()).unwrap().is_none());
    }

    #[test]
    fn compact_serde_labels() {
        let envelope = Envelope {
            version: 1,
            algorithm: "AES-256-GCM".into(),
            key_id: "k2".into(),
            nonce: "n".into(),
            ciphertext: "ct".into(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("v").is_some());
        assert!(json.get("alg").is_some());
        assert!(json.get("kid").is_some());
        assert!(json.get("version").is_none());
    }

    #[test]
    fn base_row_roundtrip_keeps_sync_fields_plain() {
        let codec = codec();
        let id = RecordId::parse("secret_note:1").unwrap();
        let row = Row::new()
            .with("id", id.clone())
            .with("title", "Top Secret")
            .with(FIELD_SYNC_DELETED, false);

        let stored = codec.encode_base_row(&row, &id).unwrap();
        assert!(stored.contains("ciphertext"));
        assert!(stored.get("title").is_none());
        // Sync fields remain filterable.
        assert_eq!(stored.get(FIELD_SYNC_DELETED), Some(&Value::Bool(false)));

        let decoded = codec.decode_base_row(&stored).unwrap();
        assert_eq!(
            decoded.get("title"),
            Some(&Value::Str("Top Secret".into()))
        );
        assert_eq!(decoded.id(), Some(&Value::Record(id)));
    }

    #[test]
    fn base_aad_binds_record_identity() {
        let codec = codec();
        let id = RecordId::parse("secret_note:1").unwrap();
        let row = Row::new().with("id", id.clone()).with("title", "x");
        let mut stored = codec.encode_base_row(&row, &id).unwrap();

        // Graft the ciphertext onto another record: AAD no longer matches.
        stored.set("id", RecordId::parse("secret_note:2").unwrap());
        assert!(codec.decode_base_row(&stored).is_err());
    }

    #[test]
    fn update_payload_roundtrip() {
        let codec = codec();
        let doc = RecordId::parse("doc:abc").unwrap();
        let mut row = codec
            .encode_update(b"update-bytes", "crdt_update", &doc, LogKind::Update)
            .unwrap();
        row.set("doc", doc.clone());

        let bytes = codec
            .decode_update(&row, "crdt_update", LogKind::Update)
            .unwrap();
        assert_eq!(bytes, b"update-bytes");
    }

    #[test]
    fn update_aad_covers_log_and_base_table() {
        let captured = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&captured);
        let codec = EnvelopeCodec::new(Arc::new(Aes256GcmProvider::new(
            EncryptionKey::generate(),
            "k2",
        )))
        .with_aad(AadScheme::Custom(Arc::new(move |ctx| {
            let aad = AadScheme::Default.derive(ctx);
            seen.lock().push(aad.clone());
            aad
        })));

        let doc = RecordId::parse("doc:abc").unwrap();
        codec
            .encode_update(b"x", "crdt_update", &doc, LogKind::Update)
            .unwrap();
        assert_eq!(captured.lock().as_slice(), ["crdt_update:doc:abc"]);
    }

    #[test]
    fn plain_payload_roundtrip() {
        let mut row = Row::new();
        encode_plain_payload(&mut row, b"snap", LogKind::Snapshot);
        assert!(row.contains("snapshot_bytes"));
        let bytes = decode_plain_payload(&row, LogKind::Snapshot).unwrap();
        assert_eq!(bytes, b"snap");
        assert!(decode_plain_payload(&row, LogKind::Update).is_err());
    }

    #[test]
    fn fixed_aad_override() {
        let codec = codec().with_aad(AadScheme::Fixed("pinned".into()));
        let id = RecordId::parse("t:1").unwrap();
        let row = Row::new().with("id", id.clone()).with("x", 1i64);
        let stored = codec.encode_base_row(&row, &id).unwrap();
        let decoded = codec.decode_base_row(&stored).unwrap();
        assert_eq!(decoded.get("x"), Some(&Value::Int(1)));
    }
}
