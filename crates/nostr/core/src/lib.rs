//! Nostr event model for OpenAgents relay clients.
//!
//! This crate provides:
//! - NIP-01: Event structure, canonical serialization and id hashing
//! - Signing and Schnorr verification capabilities (`Hasher`, `Signer`, `EventVerifier`)
//! - Default secp256k1 / sha256 implementations of those capabilities
//!
//! # Features
//!
//! - `full` (default): key generation, signing and signature verification
//! - without `full`: just the Event type, serialization and the capability traits

mod crypto;
mod nip01;

pub use crypto::{EventVerifier, Hasher, Signer};
#[cfg(feature = "full")]
pub use crypto::{Keys, SchnorrVerifier, Sha256Hasher};

pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_SHORT_TEXT_NOTE, Nip01Error,
    UnsignedEvent, compute_event_id, serialize_event, sign_event, sort_events,
    validate_event, validate_unsigned_event,
};
#[cfg(feature = "full")]
pub use nip01::{
    finalize_event, generate_secret_key, get_event_hash, get_public_key, get_public_key_hex,
    verify_event,
};
