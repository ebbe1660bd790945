//! PeerShare core: file catalog, gossip announcements, and the point-to-point transfer protocol.
//! No sockets of its own; the host supplies an [`Overlay`] and feeds its events in.

pub mod announce;
pub mod catalog;
pub mod config;
pub mod identity;
pub mod memory;
pub mod overlay;
pub mod protocol;
pub mod sharing;
pub mod transfer;
pub mod wire;

pub use announce::{AnnounceError, AnnounceOutcome, Announcer};
pub use catalog::Catalog;
pub use config::Config;
pub use identity::{InvalidPeerId, Keypair, PeerId, PublicKey};
pub use overlay::{BoxedStream, Overlay, OverlayError, OverlayEvent, StreamHandler};
pub use protocol::{
    Announcement, AvailableFileRecord, DecodeError, SharedFile, TransferMessage, ANNOUNCE_TOPIC,
    PROTOCOL_VERSION, TRANSFER_PROTOCOL,
};
pub use sharing::{FileEvent, FileSharing, ShareError};
pub use transfer::{RequestError, TransferRequester, TransferResponder, MAX_REQUEST_FRAME_LEN};
pub use wire::{
    decode_frame, encode_frame, read_frame, read_frame_idle, write_frame, FrameError,
};
