//! TCP overlay: one long-lived gossip connection per peer plus a fresh connection per transfer stream.
//!
//! Every connection opens with a fixed handshake: version, peer id, listen port, channel kind.
//! Stream connections then name their protocol and wait for a one-byte status.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use peershare_core::wire::{encode_frame, read_frame};
use peershare_core::{
    BoxedStream, Overlay, OverlayError, OverlayEvent, PeerId, StreamHandler, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const HANDSHAKE_SIZE: usize = 1 + 16 + 2 + 1; // version + peer_id + listen_port + channel
const CHANNEL_GOSSIP: u8 = 0;
const CHANNEL_STREAM: u8 = 1;
const STATUS_OK: u8 = 0;
const STATUS_UNSUPPORTED: u8 = 1;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Gossip frames are small; cap them well below the transfer limit.
const MAX_GOSSIP_FRAME: u32 = 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct GossipFrame {
    topic: String,
    data: Vec<u8>,
}

struct Hello {
    peer_id: PeerId,
    listen_port: u16,
    channel: u8,
}

struct Link {
    conn_id: u64,
    dialer: PeerId,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct TcpOverlay {
    local: PeerId,
    listen_port: u16,
    links: Mutex<HashMap<PeerId, Link>>,
    handlers: Mutex<HashMap<String, Arc<dyn StreamHandler>>>,
    topics: Mutex<HashSet<String>>,
    events_tx: mpsc::UnboundedSender<OverlayEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<OverlayEvent>>>,
    next_conn: AtomicU64,
}

impl TcpOverlay {
    /// `listen_port` is advertised in handshakes so accepted peers can dial us back for streams.
    pub fn new(local: PeerId, listen_port: u16) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local,
            listen_port,
            links: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashSet::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            next_conn: AtomicU64::new(0),
        })
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        lock(&self.links).contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<(PeerId, SocketAddr)> {
        let mut peers: Vec<_> = lock(&self.links)
            .iter()
            .map(|(id, link)| (*id, link.addr))
            .collect();
        peers.sort();
        peers
    }

    /// Accept loop. Each inbound connection is handshaken on its own task.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.accept(stream, from).await {
                            debug!(%from, error = %e, "inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Dial `addr` and open the gossip connection. Returns the remote peer id.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, OverlayError> {
        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| OverlayError::DialTimeout)??;
        stream.set_nodelay(true)?;
        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            stream.write_all(&self.handshake_bytes(CHANNEL_GOSSIP)).await?;
            stream.flush().await?;
            read_handshake(&mut stream).await
        })
        .await
        .map_err(|_| OverlayError::DialTimeout)??;
        if hello.peer_id == self.local {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "dialed ourselves").into());
        }
        self.attach(stream, hello.peer_id, addr, self.local);
        Ok(hello.peer_id)
    }

    async fn accept(self: Arc<Self>, mut stream: TcpStream, from: SocketAddr) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))??;
        if hello.peer_id == self.local {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "connection from ourselves"));
        }
        stream.write_all(&self.handshake_bytes(hello.channel)).await?;
        stream.flush().await?;
        match hello.channel {
            CHANNEL_GOSSIP => {
                let addr = SocketAddr::new(from.ip(), hello.listen_port);
                self.attach(stream, hello.peer_id, addr, hello.peer_id);
                Ok(())
            }
            CHANNEL_STREAM => {
                let protocol = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_protocol(&mut stream))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))??;
                let handler = lock(&self.handlers).get(&protocol).cloned();
                match handler {
                    Some(handler) => {
                        stream.write_all(&[STATUS_OK]).await?;
                        stream.flush().await?;
                        trace!(peer = %hello.peer_id, %protocol, "inbound stream");
                        handler.handle_stream(hello.peer_id, Box::new(stream)).await;
                    }
                    None => {
                        debug!(peer = %hello.peer_id, %protocol, "no handler for protocol");
                        stream.write_all(&[STATUS_UNSUPPORTED]).await?;
                        stream.flush().await?;
                    }
                }
                Ok(())
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown channel kind {}", other),
            )),
        }
    }

    /// Register a gossip connection. When both sides dial each other at once, both keep the
    /// connection dialed by the lower peer id; a redial from the same side replaces the old one.
    fn attach(self: &Arc<Self>, stream: TcpStream, remote: PeerId, addr: SocketAddr, dialer: PeerId) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let preferred = self.local.min(remote);
        let is_new = {
            let mut links = lock(&self.links);
            let current_dialer = links.get(&remote).map(|l| l.dialer);
            if let Some(current) = current_dialer {
                if dialer != current && dialer != preferred {
                    debug!(peer = %remote, "dropping duplicate connection");
                    return;
                }
            }
            links.insert(
                remote,
                Link {
                    conn_id,
                    dialer,
                    addr,
                    tx,
                },
            );
            current_dialer.is_none()
        };
        if is_new {
            info!(peer = %remote, %addr, "peer connected");
            let _ = self.events_tx.send(OverlayEvent::PeerConnected(remote));
        }

        let (mut reader, mut writer) = stream.into_split();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, MAX_GOSSIP_FRAME).await {
                    Ok(payload) => this.on_gossip_frame(remote, &payload),
                    Err(e) => {
                        debug!(peer = %remote, error = %e, "gossip connection closed");
                        break;
                    }
                }
            }
            this.detach(remote, conn_id);
        });
    }

    fn detach(&self, remote: PeerId, conn_id: u64) {
        let removed = {
            let mut links = lock(&self.links);
            match links.get(&remote) {
                Some(link) if link.conn_id == conn_id => links.remove(&remote).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(peer = %remote, "peer disconnected");
            let _ = self.events_tx.send(OverlayEvent::PeerDisconnected(remote));
        }
    }

    fn on_gossip_frame(&self, source: PeerId, payload: &[u8]) {
        let frame: GossipFrame = match bincode::deserialize(payload) {
            Ok(f) => f,
            Err(e) => {
                debug!(peer = %source, error = %e, "undecodable gossip frame");
                return;
            }
        };
        if !lock(&self.topics).contains(&frame.topic) {
            trace!(peer = %source, topic = %frame.topic, "gossip for unsubscribed topic");
            return;
        }
        let _ = self.events_tx.send(OverlayEvent::Gossip {
            topic: frame.topic,
            source,
            data: frame.data,
        });
    }

    fn handshake_bytes(&self, channel: u8) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[0] = PROTOCOL_VERSION;
        out[1..17].copy_from_slice(self.local.as_bytes());
        out[17..19].copy_from_slice(&self.listen_port.to_le_bytes());
        out[19] = channel;
        out
    }
}

#[async_trait]
impl Overlay for TcpOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), OverlayError> {
        let frame = GossipFrame {
            topic: topic.to_string(),
            data,
        };
        let payload = bincode::serialize(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let bytes = encode_frame(&payload, MAX_GOSSIP_FRAME)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let links = lock(&self.links);
        if links.is_empty() {
            return Err(OverlayError::NoPeers);
        }
        for (peer, link) in links.iter() {
            if link.tx.send(bytes.clone()).is_err() {
                trace!(peer = %peer, "gossip writer gone");
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), OverlayError> {
        lock(&self.topics).insert(topic.to_string());
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<BoxedStream, OverlayError> {
        let addr = lock(&self.links)
            .get(peer)
            .map(|l| l.addr)
            .ok_or(OverlayError::PeerUnreachable(*peer))?;
        let unsupported = || OverlayError::UnsupportedProtocol {
            peer: *peer,
            protocol: protocol.to_string(),
        };
        let name_len = u8::try_from(protocol.len()).map_err(|_| unsupported())?;

        let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| OverlayError::DialTimeout)??;
        stream.set_nodelay(true)?;
        let mut hello = self.handshake_bytes(CHANNEL_STREAM).to_vec();
        hello.push(name_len);
        hello.extend_from_slice(protocol.as_bytes());
        let (remote, status) = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            stream.write_all(&hello).await?;
            stream.flush().await?;
            let remote = read_handshake(&mut stream).await?;
            let mut status = [0u8; 1];
            stream.read_exact(&mut status).await?;
            Ok::<_, io::Error>((remote, status[0]))
        })
        .await
        .map_err(|_| OverlayError::DialTimeout)??;
        if remote.peer_id != *peer {
            warn!(expected = %peer, got = %remote.peer_id, %addr, "peer id changed at address");
            return Err(OverlayError::PeerUnreachable(*peer));
        }
        if status != STATUS_OK {
            return Err(unsupported());
        }
        Ok(Box::new(stream))
    }

    fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) -> Result<(), OverlayError> {
        let mut handlers = lock(&self.handlers);
        if handlers.contains_key(protocol) {
            return Err(OverlayError::AlreadyHandled(protocol.to_string()));
        }
        handlers.insert(protocol.to_string(), handler);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<OverlayEvent>> {
        lock(&self.events_rx).take()
    }
}

/// Keep dialing configured peers that are not connected.
pub async fn maintain_peers(overlay: Arc<TcpOverlay>, peers: Vec<String>, every: Duration) {
    if peers.is_empty() {
        return;
    }
    let mut known: HashMap<String, PeerId> = HashMap::new();
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        for target in &peers {
            if known.get(target).is_some_and(|id| overlay.is_connected(id)) {
                continue;
            }
            match dial(&overlay, target).await {
                Ok(id) => {
                    known.insert(target.clone(), id);
                }
                Err(e) => debug!(peer = %target, error = %e, "dial failed"),
            }
        }
    }
}

/// Resolve `target` (host:port) and connect to the first address that answers.
pub async fn dial(overlay: &Arc<TcpOverlay>, target: &str) -> Result<PeerId, OverlayError> {
    let mut last = OverlayError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} did not resolve", target),
    ));
    for addr in tokio::net::lookup_host(target).await? {
        match overlay.connect(addr).await {
            Ok(id) => return Ok(id),
            Err(e) => last = e,
        }
    }
    Err(last)
}

async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Hello> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    reader.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut peer_id = [0u8; 16];
    peer_id.copy_from_slice(&buf[1..17]);
    Ok(Hello {
        peer_id: PeerId::from_bytes(peer_id),
        listen_port: u16::from_le_bytes([buf[17], buf[18]]),
        channel: buf[19],
    })
}

async fn read_protocol<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u8().await? as usize;
    let mut name = vec![0u8; len];
    reader.read_exact(&mut name).await?;
    String::from_utf8(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
