//! Nostr event model, canonical hashing, signing, and verification.

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Profile metadata (NIP-01).
pub const KIND_METADATA: u32 = 0;
/// Encrypted direct message (NIP-04).
pub const KIND_DM: u32 = 4;
/// Zap request (NIP-57).
pub const KIND_ZAP_REQUEST: u32 = 9734;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element denotes the type and the rest hold data, e.g.
/// `["p", "<pubkey>"]` references a recipient and
/// `["relays", "wss://a", "wss://b"]` lists relay URLs. Tags are stored
/// verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag referencing a recipient public key.
    pub fn p(pubkey: &str) -> Self {
        Tag(vec!["p".into(), pubkey.into()])
    }

    /// First value of the tag named `key`, if present.
    pub fn value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
        tags.iter()
            .find(|Tag(fields)| fields.first().map(String::as_str) == Some(key))
            .and_then(|Tag(fields)| fields.get(1))
            .map(String::as_str)
    }
}

/// Signed, content-addressed protocol event.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "8f2a...",
///   "kind": 4,
///   "created_at": 1700000000,
///   "tags": [["p", "b3c4..."]],
///   "content": "base64?iv=base64",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical body).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Kind number, e.g. `0`, `4`, or `9734`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Event body awaiting an id and signature.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl EventDraft {
    /// Assemble an unsigned event. No validation beyond shape.
    pub fn new(
        kind: u32,
        pubkey: impl Into<String>,
        created_at: u64,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: content.into(),
        }
    }

    /// SHA-256 over the canonical body serialization. Deterministic: the id
    /// doubles as the content address and the zap correlation token.
    pub fn id_hash(&self) -> Result<[u8; 32]> {
        event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Compute the id and sign it, producing a finished event.
    pub fn sign(self, keypair: &Keypair) -> Result<Event> {
        let hash = self.id_hash()?;
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| Error::Signing(format!("bad digest: {e}")))?;
        let secp = Secp256k1::new();
        let sig = secp.sign_schnorr(&msg, keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey: self.pubkey,
            kind: self.kind,
            created_at: self.created_at,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

impl Event {
    /// Recompute the id from the body, compare against the stored id, then
    /// check the Schnorr signature against the author key. Events failing
    /// either check must be dropped, never displayed or acted upon.
    pub fn verify(&self) -> Result<()> {
        let hash = event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if hex::encode(hash) != self.id {
            return Err(Error::InvalidEvent("id mismatch".into()));
        }
        let sig_bytes =
            hex::decode(&self.sig).map_err(|_| Error::InvalidEvent("sig not hex".into()))?;
        let sig = Signature::from_slice(&sig_bytes)
            .map_err(|_| Error::InvalidEvent("malformed signature".into()))?;
        let pk_bytes =
            hex::decode(&self.pubkey).map_err(|_| Error::InvalidEvent("pubkey not hex".into()))?;
        let pk = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|_| Error::InvalidEvent("malformed pubkey".into()))?;
        let msg = Message::from_digest_slice(&hash)
            .map_err(|e| Error::InvalidEvent(format!("bad digest: {e}")))?;
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &msg, &pk)
            .map_err(|_| Error::InvalidEvent("signature mismatch".into()))
    }
}

/// Canonical serialization `[0, pubkey, created_at, kind, tags, content]`
/// hashed with SHA-256. `id` and `sig` never enter the hash input.
fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data =
        serde_json::to_vec(&arr).map_err(|e| Error::Signing(format!("serialization: {e}")))?;
    Ok(Sha256::digest(&data).into())
}

/// Current Unix timestamp in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
