//! Hashing, signing and verification capabilities.
//!
//! Relay clients only depend on the traits; the secp256k1 / sha256
//! implementations are available with the `full` feature.

use crate::nip01::{Event, Nip01Error};
#[cfg(feature = "full")]
use crate::nip01::{serialize_event, validate_event};
#[cfg(feature = "full")]
use bitcoin::hashes::{Hash, sha256};
#[cfg(feature = "full")]
use bitcoin::secp256k1::{
    Keypair, Message, Secp256k1, SecretKey, VerifyOnly, XOnlyPublicKey, schnorr,
};

/// Produces 32-byte digests.
pub trait Hasher: Send + Sync {
    fn sha256(&self, data: &[u8]) -> [u8; 32];
}

/// Signs 32-byte digests on behalf of a single public key.
pub trait Signer: Send + Sync {
    /// Lowercase hex x-only public key.
    fn public_key_hex(&self) -> String;

    /// BIP-340 signature over `digest`.
    fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], Nip01Error>;
}

/// Decides whether an inbound event may be trusted.
///
/// Implementations check structure, that the id is the hash of the canonical
/// serialization, and that `sig` is valid for `pubkey` over `id`.
pub trait EventVerifier: Send + Sync {
    fn verify(&self, event: &Event) -> Result<(), Nip01Error>;
}

/// sha256 hasher.
#[cfg(feature = "full")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

#[cfg(feature = "full")]
impl Hasher for Sha256Hasher {
    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        sha256::Hash::hash(data).to_byte_array()
    }
}

/// A secp256k1 keypair used as a [`Signer`].
#[cfg(feature = "full")]
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_key: XOnlyPublicKey,
}

#[cfg(feature = "full")]
impl Keys {
    pub fn from_secret_key(secret_key: &[u8; 32]) -> Result<Self, Nip01Error> {
        let secp = Secp256k1::signing_only();
        let sk = SecretKey::from_slice(secret_key)
            .map_err(|e| Nip01Error::Signing(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let (public_key, _parity) = keypair.x_only_public_key();
        Ok(Self {
            keypair,
            public_key,
        })
    }

    /// Fresh random keys.
    pub fn generate() -> Self {
        loop {
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(keys) = Self::from_secret_key(&crate::nip01::generate_secret_key()) {
                return keys;
            }
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key.serialize()
    }
}

#[cfg(feature = "full")]
impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "full")]
impl Signer for Keys {
    fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], Nip01Error> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(*digest);
        let sig = secp.sign_schnorr_no_aux_rand(&message, &self.keypair);
        Ok(sig.serialize())
    }
}

/// Default [`EventVerifier`]: sha256 id check plus BIP-340 Schnorr signature.
#[cfg(feature = "full")]
pub struct SchnorrVerifier {
    secp: Secp256k1<VerifyOnly>,
}

#[cfg(feature = "full")]
impl SchnorrVerifier {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }
}

#[cfg(feature = "full")]
impl Default for SchnorrVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "full")]
impl EventVerifier for SchnorrVerifier {
    fn verify(&self, event: &Event) -> Result<(), Nip01Error> {
        if !validate_event(event) {
            return Err(Nip01Error::InvalidEvent(format!(
                "malformed id, pubkey or sig on {}",
                event.id
            )));
        }

        let digest = Sha256Hasher.sha256(serialize_event(&event.unsigned())?.as_bytes());
        if hex::encode(digest) != event.id {
            return Err(Nip01Error::InvalidEvent(format!(
                "id {} does not match event hash",
                event.id
            )));
        }

        let sig_bytes =
            hex::decode(&event.sig).map_err(|e| Nip01Error::InvalidHex(e.to_string()))?;
        let sig = schnorr::Signature::from_slice(&sig_bytes)
            .map_err(|e| Nip01Error::InvalidSignature(e.to_string()))?;
        let pubkey_bytes =
            hex::decode(&event.pubkey).map_err(|e| Nip01Error::InvalidHex(e.to_string()))?;
        let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|e| Nip01Error::InvalidPublicKey(e.to_string()))?;

        self.secp
            .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
            .map_err(|e| Nip01Error::InvalidSignature(e.to_string()))
    }
}
