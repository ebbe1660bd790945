//! What the core needs from the overlay: a pub/sub bus and directed streams.
//!
//! The host implements [`Overlay`] (see `memory` for the in-process one, or the node's TCP
//! transport) and feeds [`OverlayEvent`]s into the file-sharing context.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::identity::PeerId;

/// A bidirectional byte stream to one remote peer.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Events the overlay delivers to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// A message arrived on a subscribed topic.
    Gossip {
        topic: String,
        source: PeerId,
        data: Vec<u8>,
    },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

/// Serves inbound streams for one protocol. Called once per stream, concurrently.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle_stream(&self, remote: PeerId, stream: BoxedStream);
}

#[async_trait]
pub trait Overlay: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Broadcast `data` on `topic` to every connected peer.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), OverlayError>;

    /// Start delivering `topic` messages as [`OverlayEvent::Gossip`].
    fn subscribe(&self, topic: &str) -> Result<(), OverlayError>;

    /// Open a direct stream to `peer` speaking `protocol`.
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream, OverlayError>;

    /// Register the handler for inbound streams of `protocol`. One handler per protocol.
    fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> Result<(), OverlayError>;

    /// Take the event receiver. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<OverlayEvent>>;
}

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("no connected peers to publish to")]
    NoPeers,
    #[error("peer {0} is not reachable")]
    PeerUnreachable(PeerId),
    #[error("peer {peer} does not support {protocol}")]
    UnsupportedProtocol { peer: PeerId, protocol: String },
    #[error("protocol {0} already has a handler")]
    AlreadyHandled(String),
    #[error("dial timed out")]
    DialTimeout,
    #[error("overlay is shut down")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
