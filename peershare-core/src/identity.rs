//! Peer identity: keypair and the 16-byte peer ID derived from it.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

const PEER_ID_LEN: usize = 16;

/// Peer public key (32 bytes, X25519).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Peer ID: truncated SHA-256 of the public key. Canonical text form is 32 lowercase hex chars.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Derive a peer ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&digest[..PEER_ID_LEN]);
        PeerId(id)
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A peer ID string that is not 32 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer id {0:?}")]
pub struct InvalidPeerId(pub String);

impl FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut id = [0u8; PEER_ID_LEN];
        hex::decode_to_slice(trimmed, &mut id).map_err(|_| InvalidPeerId(s.to_string()))?;
        Ok(PeerId(id))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// X25519 keypair. Only the public key and peer ID leave this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a new random keypair and derive the peer ID from its public key.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from stored secret bytes, so a node keeps its peer ID across restarts.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Secret bytes for persisting the identity. Keep private.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}
