//! In-process overlay: peers in one `MemoryNetwork` gossip over channels and stream over
//! `tokio::io::duplex` pipes. Used by tests and by hosts that embed several peers in one process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identity::{Keypair, PeerId};
use crate::overlay::{BoxedStream, Overlay, OverlayError, OverlayEvent, StreamHandler};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Registry of in-process peers and the links between them.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<PeerId, Arc<MemoryNode>>>,
}

struct MemoryNode {
    peer_id: PeerId,
    events_tx: mpsc::UnboundedSender<OverlayEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<OverlayEvent>>>,
    topics: Mutex<HashSet<String>>,
    handlers: Mutex<HashMap<String, Arc<dyn StreamHandler>>>,
    links: Mutex<HashSet<PeerId>>,
}

impl MemoryNode {
    fn emit(&self, event: OverlayEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a peer with a fresh identity.
    pub fn join(self: &Arc<Self>) -> Arc<MemoryOverlay> {
        self.join_as(Keypair::generate().peer_id())
    }

    pub fn join_as(self: &Arc<Self>, peer_id: PeerId) -> Arc<MemoryOverlay> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let node = Arc::new(MemoryNode {
            peer_id,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            topics: Mutex::new(HashSet::new()),
            handlers: Mutex::new(HashMap::new()),
            links: Mutex::new(HashSet::new()),
        });
        lock(&self.nodes).insert(peer_id, node.clone());
        Arc::new(MemoryOverlay {
            network: self.clone(),
            node,
        })
    }

    /// Link two peers. Both sides see `PeerConnected`. Linking an existing pair is a no-op.
    pub fn connect(&self, a: &PeerId, b: &PeerId) -> Result<(), OverlayError> {
        let (na, nb) = {
            let nodes = lock(&self.nodes);
            let na = nodes.get(a).cloned().ok_or(OverlayError::PeerUnreachable(*a))?;
            let nb = nodes.get(b).cloned().ok_or(OverlayError::PeerUnreachable(*b))?;
            (na, nb)
        };
        let added = lock(&na.links).insert(*b);
        lock(&nb.links).insert(*a);
        if added {
            na.emit(OverlayEvent::PeerConnected(*b));
            nb.emit(OverlayEvent::PeerConnected(*a));
        }
        Ok(())
    }

    /// Unlink two peers. Both sides see `PeerDisconnected`.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let pair = {
            let nodes = lock(&self.nodes);
            (nodes.get(a).cloned(), nodes.get(b).cloned())
        };
        if let (Some(na), Some(nb)) = pair {
            let removed = lock(&na.links).remove(b);
            lock(&nb.links).remove(a);
            if removed {
                na.emit(OverlayEvent::PeerDisconnected(*b));
                nb.emit(OverlayEvent::PeerDisconnected(*a));
            }
        }
    }

    fn node(&self, peer: &PeerId) -> Option<Arc<MemoryNode>> {
        lock(&self.nodes).get(peer).cloned()
    }
}

/// One peer's view of a `MemoryNetwork`.
pub struct MemoryOverlay {
    network: Arc<MemoryNetwork>,
    node: Arc<MemoryNode>,
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.node.peer_id
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), OverlayError> {
        let links: Vec<PeerId> = lock(&self.node.links).iter().copied().collect();
        if links.is_empty() {
            return Err(OverlayError::NoPeers);
        }
        for peer in links {
            let Some(remote) = self.network.node(&peer) else {
                continue;
            };
            if !lock(&remote.topics).contains(topic) {
                continue;
            }
            trace!(from = %self.node.peer_id, to = %peer, topic, "memory gossip");
            remote.emit(OverlayEvent::Gossip {
                topic: topic.to_string(),
                source: self.node.peer_id,
                data: data.clone(),
            });
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), OverlayError> {
        lock(&self.node.topics).insert(topic.to_string());
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream, OverlayError> {
        if !lock(&self.node.links).contains(peer) {
            return Err(OverlayError::PeerUnreachable(*peer));
        }
        let remote = self
            .network
            .node(peer)
            .ok_or(OverlayError::PeerUnreachable(*peer))?;
        let handler = lock(&remote.handlers).get(protocol).cloned().ok_or_else(|| {
            OverlayError::UnsupportedProtocol {
                peer: *peer,
                protocol: protocol.to_string(),
            }
        })?;
        let (local_end, remote_end) = tokio::io::duplex(PIPE_CAPACITY);
        let from = self.node.peer_id;
        tokio::spawn(async move {
            handler.handle_stream(from, Box::new(remote_end)).await;
        });
        Ok(Box::new(local_end))
    }

    fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> Result<(), OverlayError> {
        let mut handlers = lock(&self.node.handlers);
        if handlers.contains_key(protocol) {
            return Err(OverlayError::AlreadyHandled(protocol.to_string()));
        }
        handlers.insert(protocol.to_string(), handler);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<OverlayEvent>> {
        lock(&self.node.events_rx).take()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
