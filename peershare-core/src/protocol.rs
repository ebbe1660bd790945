//! PeerShare wire protocol: records, message types, and version.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Current protocol version. Carried in announcements and transfer requests.
pub const PROTOCOL_VERSION: u8 = 1;

/// Gossip topic for file announcements.
pub const ANNOUNCE_TOPIC: &str = "file-announce-v1";

/// Stream protocol identifier for file transfer.
pub const TRANSFER_PROTOCOL: &str = "/file-sharing/1.0.0";

/// Error text the responder sends for unknown files and malformed requests.
pub const NOT_FOUND_MESSAGE: &str = "not found or invalid request";

/// A file this peer holds and serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub payload: Vec<u8>,
    /// Unix millis.
    pub created_at: u64,
}

/// A file some other peer announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableFileRecord {
    pub peer_id: PeerId,
    pub file_id: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    /// Sender's timestamp from the announcement (unix millis). Informational only.
    pub announced_at: u64,
    /// Local arrival time (unix millis). Used for expiry.
    pub received_at: u64,
}

/// Gossip announcement body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub peer_id: PeerId,
    pub file_id: String,
    pub file_name: String,
    pub file_size_bytes: u64,
    pub timestamp: u64,
}

impl Announcement {
    /// Build the announcement for a locally shared file.
    pub fn for_file(peer_id: PeerId, file: &SharedFile) -> Self {
        Self {
            peer_id,
            file_id: file.id.clone(),
            file_name: file.name.clone(),
            file_size_bytes: file.size_bytes,
            timestamp: now_millis(),
        }
    }

    pub fn into_record(self, received_at: u64) -> AvailableFileRecord {
        AvailableFileRecord {
            peer_id: self.peer_id,
            file_id: self.file_id,
            file_name: self.file_name,
            file_size_bytes: self.file_size_bytes,
            announced_at: self.timestamp,
            received_at,
        }
    }
}

/// Everything published on the gossip bus. JSON, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum GossipMessage {
    Announcement {
        version: u8,
        #[serde(flatten)]
        body: Announcement,
    },
}

/// Serialize an announcement to UTF-8 JSON for the gossip bus.
pub fn encode_announcement(announcement: &Announcement) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&GossipMessage::Announcement {
        version: PROTOCOL_VERSION,
        body: announcement.clone(),
    })
}

/// Parse and validate an announcement received from the gossip bus.
pub fn decode_announcement(bytes: &[u8]) -> Result<Announcement, DecodeError> {
    let GossipMessage::Announcement { version, body } = serde_json::from_slice(bytes)?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    if body.file_id.is_empty() {
        return Err(DecodeError::Invalid("empty file id"));
    }
    Ok(body)
}

/// Messages on a transfer stream. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMessage {
    /// Requester asks for one file by ID.
    Request { version: u8, file_id: String },
    /// Responder returns the full file record.
    File(Arc<SharedFile>),
    /// Responder could not serve the request.
    Error { message: String },
}

impl TransferMessage {
    pub fn request(file_id: impl Into<String>) -> Self {
        TransferMessage::Request {
            version: PROTOCOL_VERSION,
            file_id: file_id.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TransferMessage::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Size of `encode()` output, computed without building it.
    pub fn encoded_len(&self) -> Result<u64, bincode::Error> {
        bincode::serialized_size(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Payload could not be parsed into a known message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed announcement: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed transfer message: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid message: {0}")]
    Invalid(&'static str),
}

/// Milliseconds since the unix epoch. Clock before 1970 reads as 0.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
