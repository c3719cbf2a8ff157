//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Event serialization for hashing
//! - Event signing through a [`Signer`] (Schnorr keys with the `full` feature)
//! - Event verification (requires `full` feature)

use crate::crypto::{Hasher, Signer};
#[cfg(feature = "full")]
use crate::crypto::{EventVerifier, Keys, SchnorrVerifier, Sha256Hasher};
#[cfg(feature = "full")]
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// The unsigned part of this event, as covered by its id.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// First value of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// A template for creating events (without pubkey, which comes from the signer).
///
/// # Examples
///
/// ```
/// use nostr::EventTemplate;
///
/// let template = EventTemplate {
///     created_at: 1_700_000_000,
///     kind: 1,
///     tags: vec![vec!["t".to_string(), "nostr".to_string()]],
///     content: "Hello Nostr!".to_string(),
/// };
/// assert_eq!(template.kind, nostr::KIND_SHORT_TEXT_NOTE);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;

/// Generate a random 32-byte secret key.
#[cfg(feature = "full")]
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the public key (x-only, 32 bytes) from a secret key.
#[cfg(feature = "full")]
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], Nip01Error> {
    Ok(Keys::from_secret_key(secret_key)?.public_key_bytes())
}

/// Get the public key as a hex string from a secret key.
#[cfg(feature = "full")]
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !validate_unsigned_event(event) {
        return Err(Nip01Error::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Compute the event id (hex digest of the canonical serialization).
pub fn compute_event_id(event: &UnsignedEvent, hasher: &dyn Hasher) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(hex::encode(hasher.sha256(serialized.as_bytes())))
}

/// Get the event hash (id) from an unsigned event using sha256.
#[cfg(feature = "full")]
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    compute_event_id(event, &Sha256Hasher)
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Validate an unsigned event structure.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    is_lower_hex(&event.pubkey, 64)
}

/// Validate a signed event structure (not including signature verification).
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Sign an event template with any [`Signer`], hashing with `hasher`.
pub fn sign_event(
    template: &EventTemplate,
    signer: &dyn Signer,
    hasher: &dyn Hasher,
) -> Result<Event, Nip01Error> {
    let unsigned = UnsignedEvent {
        pubkey: signer.public_key_hex(),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    let digest = hasher.sha256(serialize_event(&unsigned)?.as_bytes());
    let sig = signer.sign(&digest)?;

    Ok(Event {
        id: hex::encode(digest),
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig),
    })
}

/// Sign an event template with a secret key, producing a complete signed event.
#[cfg(feature = "full")]
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, Nip01Error> {
    let keys = Keys::from_secret_key(secret_key)?;
    sign_event(template, &keys, &Sha256Hasher)
}

/// Verify an event's signature and id.
///
/// Returns `Ok(false)` for any structural, hash or signature mismatch.
#[cfg(feature = "full")]
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    match SchnorrVerifier::new().verify(event) {
        Ok(()) => Ok(true),
        Err(Nip01Error::InvalidEvent(_))
        | Err(Nip01Error::InvalidSignature(_))
        | Err(Nip01Error::InvalidPublicKey(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events<E: std::borrow::Borrow<Event>>(events: &mut [E]) {
    events.sort_by(|a, b| {
        let (a, b) = (a.borrow(), b.borrow());
        match b.created_at.cmp(&a.created_at) {
            std::cmp::Ordering::Equal => a.id.cmp(&b.id),
            other => other,
        }
    });
}

#[cfg(all(test, feature = "full"))]
mod tests {
    use super::*;

    const TEST_PRIVATE_KEY: &str =
        "d217c1ff2f8a65c3e3a1740db3b9f58b8c848bb45e26d00ed4714e4a0f4ceecf";

    fn test_private_key() -> [u8; 32] {
        let bytes = hex::decode(TEST_PRIVATE_KEY).unwrap();
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        key
    }

    fn note(content: &str) -> EventTemplate {
        EventTemplate {
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: content.to_string(),
            created_at: 1617932115,
        }
    }

    #[test]
    fn test_public_key_generation() {
        let sk = generate_secret_key();
        let pk = get_public_key_hex(&sk).unwrap();
        assert_eq!(pk.len(), 64);
        assert_eq!(get_public_key_hex(&sk).unwrap(), pk);
    }

    #[test]
    fn test_finalize_event_creates_signed_event() {
        let private_key = test_private_key();
        let public_key = get_public_key_hex(&private_key).unwrap();

        let template = note("Hello, world!");
        let event = finalize_event(&template, &private_key).unwrap();

        assert_eq!(event.kind, template.kind);
        assert_eq!(event.content, template.content);
        assert_eq!(event.created_at, template.created_at);
        assert_eq!(event.pubkey, public_key);
        assert!(validate_event(&event));
        assert_eq!(event.id, get_event_hash(&event.unsigned()).unwrap());
    }

    #[test]
    fn test_serialize_event_valid() {
        let public_key = get_public_key_hex(&test_private_key()).unwrap();

        let unsigned = UnsignedEvent {
            pubkey: public_key.clone(),
            created_at: 1617932115,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };

        let serialized = serialize_event(&unsigned).unwrap();
        let expected = format!("[0,\"{}\",1617932115,1,[],\"Hello, world!\"]", public_key);
        assert_eq!(serialized, expected);
    }

    #[test]
    fn test_serialize_event_rejects_bad_pubkey() {
        let mut unsigned = UnsignedEvent {
            pubkey: "invalid".to_string(),
            created_at: 1617932115,
            kind: KIND_SHORT_TEXT_NOTE,
            tags: vec![],
            content: "Hello, world!".to_string(),
        };
        assert!(serialize_event(&unsigned).is_err());

        unsigned.pubkey = get_public_key_hex(&test_private_key())
            .unwrap()
            .to_uppercase();
        assert!(!validate_unsigned_event(&unsigned));
    }

    #[test]
    fn test_verify_event_valid_signature() {
        let event = finalize_event(&note("Hello, world!"), &test_private_key()).unwrap();
        assert!(verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_event_tampered_signature() {
        let mut event = finalize_event(&note("Hello, world!"), &test_private_key()).unwrap();
        event.sig.replace_range(0..3, "666");
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_event_tampered_content() {
        let mut event = finalize_event(&note("Hello, world!"), &test_private_key()).unwrap();
        event.content = "Goodbye".to_string();
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_verify_event_wrong_pubkey() {
        let other = get_public_key_hex(&generate_secret_key()).unwrap();
        let mut event = finalize_event(&note("Hello, world!"), &test_private_key()).unwrap();
        event.pubkey = other;
        assert!(!verify_event(&event).unwrap());
    }

    #[test]
    fn test_event_with_special_characters_in_content() {
        let template = note("Hello\nWorld\t\"quotes\" and \\backslash");
        let event = finalize_event(&template, &test_private_key()).unwrap();
        assert!(verify_event(&event).unwrap());

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert!(verify_event(&parsed).unwrap());
    }

    #[test]
    fn test_tag_values() {
        let mut template = note("tagged");
        template.tags = vec![
            vec!["e".to_string(), "abc".to_string()],
            vec!["p".to_string(), "def".to_string()],
            vec!["e".to_string(), "ghi".to_string(), "wss://relay".to_string()],
            vec!["e".to_string()],
        ];
        let event = finalize_event(&template, &test_private_key()).unwrap();
        let values: Vec<&str> = event.tag_values("e").collect();
        assert_eq!(values, vec!["abc", "ghi"]);
    }

    #[test]
    fn test_sort_events() {
        let base = finalize_event(&note("x"), &test_private_key()).unwrap();
        let mk = |id: &str, created_at: u64| Event {
            id: id.to_string(),
            created_at,
            ..base.clone()
        };
        let mut events = vec![
            mk("abc123", 1610000000),
            mk("abc124", 1620000000),
            mk("abc125", 1620000000),
        ];

        sort_events(&mut events);

        assert_eq!(events[0].id, "abc124");
        assert_eq!(events[1].id, "abc125");
        assert_eq!(events[2].id, "abc123");
    }
}
