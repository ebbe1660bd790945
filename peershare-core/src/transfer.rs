//! Point-to-point file transfer: one framed request, one framed response, per stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::identity::{InvalidPeerId, PeerId};
use crate::overlay::{BoxedStream, Overlay, OverlayError, StreamHandler};
use crate::protocol::{
    DecodeError, SharedFile, TransferMessage, NOT_FOUND_MESSAGE, PROTOCOL_VERSION,
    TRANSFER_PROTOCOL,
};
use crate::wire::{self, FrameError};

/// Upper bound on a request frame. A request carries only a version and a file id.
pub const MAX_REQUEST_FRAME_LEN: u32 = 4 * 1024;

/// Serves files from the catalog's shared table. Register once under [`TRANSFER_PROTOCOL`].
pub struct TransferResponder {
    catalog: Arc<Catalog>,
    max_frame_len: u32,
    request_timeout: Duration,
}

impl TransferResponder {
    /// `request_timeout` bounds how long an inbound stream may stay silent before its request.
    pub fn new(catalog: Arc<Catalog>, max_frame_len: u32, request_timeout: Duration) -> Self {
        Self {
            catalog,
            max_frame_len,
            request_timeout,
        }
    }

    /// Handle one inbound stream to completion. Never panics on peer misbehaviour; every failure
    /// short of a dead stream is answered with an `Error` message.
    pub async fn serve<S>(&self, remote: PeerId, stream: &mut S)
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let response = match self.read_request(stream).await {
            Ok(request) => self.lookup(remote, request),
            Err(e) => {
                debug!(peer = %remote, error = %e, "bad transfer request");
                TransferMessage::error(e.to_string())
            }
        };
        let bytes = self.encode_response(remote, &response);
        if let Err(e) = wire::write_frame(stream, &bytes, self.max_frame_len).await {
            debug!(peer = %remote, error = %e, "stream closed before response was delivered");
            return;
        }
        let _ = stream.shutdown().await;
    }

    async fn read_request<S>(&self, stream: &mut S) -> Result<TransferMessage, ServeError>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let limit = self.max_frame_len.min(MAX_REQUEST_FRAME_LEN);
        let frame = tokio::time::timeout(self.request_timeout, wire::read_frame(stream, limit))
            .await
            .map_err(|_| ServeError::Timeout(self.request_timeout))??;
        Ok(TransferMessage::decode(&frame)?)
    }

    fn lookup(&self, remote: PeerId, request: TransferMessage) -> TransferMessage {
        match request {
            TransferMessage::Request { version, file_id } if version == PROTOCOL_VERSION => {
                match self.catalog.get_shared(&file_id) {
                    Some(file) => {
                        info!(peer = %remote, file_id = %file_id, size = file.size_bytes, "serving file");
                        TransferMessage::File(file)
                    }
                    None => {
                        debug!(peer = %remote, file_id = %file_id, "requested file not shared");
                        TransferMessage::error(NOT_FOUND_MESSAGE)
                    }
                }
            }
            other => {
                debug!(peer = %remote, message = ?kind(&other), "unexpected transfer message");
                TransferMessage::error(NOT_FOUND_MESSAGE)
            }
        }
    }

    /// Encode `response`, falling back to an `Error` message if it cannot be sent as one frame.
    fn encode_response(&self, remote: PeerId, response: &TransferMessage) -> Vec<u8> {
        let failure = match response.encode() {
            Ok(bytes) if bytes.len() <= self.max_frame_len as usize => return bytes,
            Ok(bytes) => format!("response of {} bytes exceeds frame limit", bytes.len()),
            Err(e) => format!("failed to encode response: {}", e),
        };
        warn!(peer = %remote, error = %failure, "sending error response instead");
        // An Error message is a few dozen bytes; encoding it cannot fail.
        TransferMessage::error(failure).encode().unwrap_or_default()
    }
}

#[async_trait]
impl StreamHandler for TransferResponder {
    async fn handle_stream(&self, remote: PeerId, mut stream: BoxedStream) {
        self.serve(remote, &mut stream).await;
    }
}

fn kind(msg: &TransferMessage) -> &'static str {
    match msg {
        TransferMessage::Request { .. } => "request",
        TransferMessage::File(_) => "file",
        TransferMessage::Error { .. } => "error",
    }
}

#[derive(Debug, thiserror::Error)]
enum ServeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no request within {0:?}")]
    Timeout(Duration),
}

/// Fetches files from remote responders.
pub struct TransferRequester {
    overlay: Arc<dyn Overlay>,
    max_frame_len: u32,
    timeout: Duration,
}

impl TransferRequester {
    pub fn new(overlay: Arc<dyn Overlay>, max_frame_len: u32, timeout: Duration) -> Self {
        Self {
            overlay,
            max_frame_len,
            timeout,
        }
    }

    /// Fetch `file_id` from `peer_id`. No retries. The stream is shut down on every exit path.
    ///
    /// The timeout bounds the wait for the response to start and every stall after that, not the
    /// whole transfer, so large files over slow links still complete.
    pub async fn request_file(&self, peer_id: &str, file_id: &str) -> Result<SharedFile, RequestError> {
        let peer: PeerId = peer_id.parse()?;
        let mut stream = self
            .overlay
            .open_stream(&peer, TRANSFER_PROTOCOL)
            .await
            .map_err(RequestError::Dial)?;
        let result = self.exchange(&mut stream, file_id).await;
        let _ = stream.shutdown().await;
        drop(stream);
        match &result {
            Ok(file) => debug!(peer = %peer, file_id, size = file.size_bytes, "file received"),
            Err(e) => debug!(peer = %peer, file_id, error = %e, "file request failed"),
        }
        result
    }

    async fn exchange(&self, stream: &mut BoxedStream, file_id: &str) -> Result<SharedFile, RequestError> {
        let request = TransferMessage::request(file_id).encode().map_err(DecodeError::from)?;
        tokio::time::timeout(
            self.timeout,
            wire::write_frame(stream, &request, MAX_REQUEST_FRAME_LEN),
        )
        .await
        .map_err(|_| RequestError::Timeout(self.timeout))??;
        let frame = wire::read_frame_idle(stream, self.max_frame_len, self.timeout)
            .await
            .map_err(|e| match e {
                FrameError::Idle(d) => RequestError::Timeout(d),
                e => RequestError::Frame(e),
            })?;
        match TransferMessage::decode(&frame)? {
            TransferMessage::File(file) => {
                if file.id != file_id {
                    return Err(RequestError::UnexpectedResponse(format!(
                        "asked for {} but got {}",
                        file_id, file.id
                    )));
                }
                if file.payload.len() as u64 != file.size_bytes {
                    return Err(RequestError::UnexpectedResponse(format!(
                        "payload is {} bytes, record says {}",
                        file.payload.len(),
                        file.size_bytes
                    )));
                }
                Ok(Arc::try_unwrap(file).unwrap_or_else(|shared| (*shared).clone()))
            }
            TransferMessage::Error { message } => Err(RequestError::Remote(message)),
            TransferMessage::Request { .. } => Err(RequestError::UnexpectedResponse(
                "peer answered with a request".into(),
            )),
        }
    }
}

/// Why `request_file` failed.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    InvalidPeerId(#[from] InvalidPeerId),
    #[error("dial failed: {0}")]
    Dial(OverlayError),
    #[error("peer sent nothing for {0:?}")]
    Timeout(Duration),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RequestError {
    /// True when the responder reported that it does not have the file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RequestError::Remote(m) if m == NOT_FOUND_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::protocol::now_millis;
    use crate::wire::DEFAULT_MAX_FRAME_LEN;

    const WAIT: Duration = Duration::from_secs(5);

    fn file(id: &str, len: usize) -> SharedFile {
        SharedFile {
            id: id.into(),
            name: format!("{}.bin", id),
            mime_type: "application/octet-stream".into(),
            size_bytes: len as u64,
            payload: vec![id.as_bytes()[0]; len],
            created_at: now_millis(),
        }
    }

    struct Setup {
        requester: TransferRequester,
        server_id: PeerId,
        catalog: Arc<Catalog>,
    }

    fn setup(timeout: Duration) -> Setup {
        let net = MemoryNetwork::new();
        let client = net.join();
        let server = net.join();
        net.connect(&client.local_peer_id(), &server.local_peer_id())
            .unwrap();
        let catalog = Arc::new(Catalog::new());
        server
            .handle(
                TRANSFER_PROTOCOL,
                Arc::new(TransferResponder::new(catalog.clone(), DEFAULT_MAX_FRAME_LEN, WAIT)),
            )
            .unwrap();
        Setup {
            requester: TransferRequester::new(client, DEFAULT_MAX_FRAME_LEN, timeout),
            server_id: server.local_peer_id(),
            catalog,
        }
    }

    #[tokio::test]
    async fn fetch_existing_file() {
        let s = setup(Duration::from_secs(5));
        s.catalog.put_shared(file("a", 2048));
        let got = s
            .requester
            .request_file(&s.server_id.to_string(), "a")
            .await
            .unwrap();
        assert_eq!(got.payload.len(), 2048);
        assert_eq!(got.name, "a.bin");
    }

    #[tokio::test]
    async fn absent_file_is_remote_not_found() {
        let s = setup(Duration::from_secs(5));
        let err = s
            .requester
            .request_file(&s.server_id.to_string(), "missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "got {:?}", err);
    }

    #[tokio::test]
    async fn malformed_peer_id() {
        let s = setup(Duration::from_secs(5));
        assert!(matches!(
            s.requester.request_file("nope", "a").await,
            Err(RequestError::InvalidPeerId(_))
        ));
    }

    #[tokio::test]
    async fn unknown_peer_is_dial_error() {
        let s = setup(Duration::from_secs(5));
        let stranger = crate::identity::Keypair::generate().peer_id();
        assert!(matches!(
            s.requester.request_file(&stranger.to_string(), "a").await,
            Err(RequestError::Dial(OverlayError::PeerUnreachable(_)))
        ));
    }

    struct Silent;

    #[async_trait]
    impl StreamHandler for Silent {
        async fn handle_stream(&self, _remote: PeerId, stream: BoxedStream) {
            // Hold the stream open without answering.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        }
    }

    #[tokio::test]
    async fn silent_responder_times_out() {
        let net = MemoryNetwork::new();
        let client = net.join();
        let server = net.join();
        net.connect(&client.local_peer_id(), &server.local_peer_id())
            .unwrap();
        server.handle(TRANSFER_PROTOCOL, Arc::new(Silent)).unwrap();
        let requester =
            TransferRequester::new(client, DEFAULT_MAX_FRAME_LEN, Duration::from_millis(100));
        let err = requester
            .request_file(&server.local_peer_id().to_string(), "a")
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Timeout(_)));
    }

    #[tokio::test]
    async fn responder_answers_garbage_with_error() {
        let catalog = Arc::new(Catalog::new());
        let responder = TransferResponder::new(catalog, DEFAULT_MAX_FRAME_LEN, WAIT);
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = crate::identity::Keypair::generate().peer_id();
        let serve = tokio::spawn(async move {
            responder.serve(peer, &mut server).await;
        });
        wire::write_frame(&mut client, b"\xff\xff\xff\xff junk", DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        let frame = wire::read_frame(&mut client, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert!(matches!(
            TransferMessage::decode(&frame).unwrap(),
            TransferMessage::Error { .. }
        ));
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn responder_rejects_non_request_and_wrong_version() {
        let catalog = Arc::new(Catalog::new());
        catalog.put_shared(file("a", 4));
        let responder = Arc::new(TransferResponder::new(catalog, DEFAULT_MAX_FRAME_LEN, WAIT));
        let peer = crate::identity::Keypair::generate().peer_id();
        for msg in [
            TransferMessage::error("hello"),
            TransferMessage::Request {
                version: PROTOCOL_VERSION + 1,
                file_id: "a".into(),
            },
        ] {
            let (mut client, mut server) = tokio::io::duplex(1024);
            let r = responder.clone();
            let serve = tokio::spawn(async move { r.serve(peer, &mut server).await });
            wire::write_frame(&mut client, &msg.encode().unwrap(), DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap();
            let frame = wire::read_frame(&mut client, DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap();
            assert_eq!(
                TransferMessage::decode(&frame).unwrap(),
                TransferMessage::error(NOT_FOUND_MESSAGE)
            );
            serve.await.unwrap();
        }
    }

    #[tokio::test]
    async fn responder_survives_closed_stream() {
        let catalog = Arc::new(Catalog::new());
        let responder = TransferResponder::new(catalog, DEFAULT_MAX_FRAME_LEN, WAIT);
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        let peer = crate::identity::Keypair::generate().peer_id();
        // Returns instead of panicking.
        responder.serve(peer, &mut server).await;
    }

    #[tokio::test]
    async fn oversized_file_becomes_error_response() {
        let catalog = Arc::new(Catalog::new());
        catalog.put_shared(file("big", 4096));
        let net = MemoryNetwork::new();
        let client = net.join();
        let server = net.join();
        net.connect(&client.local_peer_id(), &server.local_peer_id())
            .unwrap();
        server
            .handle(
                TRANSFER_PROTOCOL,
                Arc::new(TransferResponder::new(catalog, 1024, WAIT)),
            )
            .unwrap();
        let requester = TransferRequester::new(client, 1024, Duration::from_secs(5));
        let err = requester
            .request_file(&server.local_peer_id().to_string(), "big")
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Remote(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn concurrent_requests_from_two_peers() {
        let net = MemoryNetwork::new();
        let server = net.join();
        let c1 = net.join();
        let c2 = net.join();
        net.connect(&c1.local_peer_id(), &server.local_peer_id())
            .unwrap();
        net.connect(&c2.local_peer_id(), &server.local_peer_id())
            .unwrap();
        let catalog = Arc::new(Catalog::new());
        catalog.put_shared(file("x", 200_000));
        catalog.put_shared(file("y", 150_000));
        server
            .handle(
                TRANSFER_PROTOCOL,
                Arc::new(TransferResponder::new(catalog, DEFAULT_MAX_FRAME_LEN, WAIT)),
            )
            .unwrap();
        let server_id = server.local_peer_id().to_string();
        let r1 = TransferRequester::new(c1, DEFAULT_MAX_FRAME_LEN, Duration::from_secs(5));
        let r2 = TransferRequester::new(c2, DEFAULT_MAX_FRAME_LEN, Duration::from_secs(5));
        let (a, b) = tokio::join!(
            r1.request_file(&server_id, "x"),
            r2.request_file(&server_id, "y")
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.payload.len(), 200_000);
        assert!(a.payload.iter().all(|&byte| byte == b'x'));
        assert_eq!(b.payload.len(), 150_000);
        assert!(b.payload.iter().all(|&byte| byte == b'y'));
    }

    /// Answers with a valid file response, written in small chunks with pauses between them.
    struct Trickle {
        chunks: usize,
        pause: Duration,
        stall_after: Option<usize>,
    }

    #[async_trait]
    impl StreamHandler for Trickle {
        async fn handle_stream(&self, _remote: PeerId, mut stream: BoxedStream) {
            let request = wire::read_frame(&mut stream, MAX_REQUEST_FRAME_LEN).await.unwrap();
            let file_id = match TransferMessage::decode(&request).unwrap() {
                TransferMessage::Request { file_id, .. } => file_id,
                other => panic!("unexpected {:?}", other),
            };
            let body = TransferMessage::File(Arc::new(file(&file_id, 1024)))
                .encode()
                .unwrap();
            let frame = wire::encode_frame(&body, DEFAULT_MAX_FRAME_LEN).unwrap();
            let size = frame.len().div_ceil(self.chunks);
            for (i, part) in frame.chunks(size).enumerate() {
                if Some(i) == self.stall_after {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                if stream.write_all(part).await.is_err() {
                    return;
                }
                let _ = stream.flush().await;
                tokio::time::sleep(self.pause).await;
            }
        }
    }

    fn trickle_setup(handler: Trickle, timeout: Duration) -> (TransferRequester, PeerId) {
        let net = MemoryNetwork::new();
        let client = net.join();
        let server = net.join();
        net.connect(&client.local_peer_id(), &server.local_peer_id())
            .unwrap();
        server.handle(TRANSFER_PROTOCOL, Arc::new(handler)).unwrap();
        (
            TransferRequester::new(client, DEFAULT_MAX_FRAME_LEN, timeout),
            server.local_peer_id(),
        )
    }

    #[tokio::test]
    async fn slow_steady_transfer_completes() {
        let (requester, server) = trickle_setup(
            Trickle {
                chunks: 9,
                pause: Duration::from_millis(60),
                stall_after: None,
            },
            Duration::from_millis(200),
        );
        // Whole transfer takes ~540ms; no single gap reaches the 200ms timeout.
        let got = requester
            .request_file(&server.to_string(), "slow")
            .await
            .unwrap();
        assert_eq!(got.id, "slow");
        assert_eq!(got.payload.len(), 1024);
    }

    #[tokio::test]
    async fn stall_mid_transfer_times_out() {
        let (requester, server) = trickle_setup(
            Trickle {
                chunks: 9,
                pause: Duration::from_millis(10),
                stall_after: Some(3),
            },
            Duration::from_millis(200),
        );
        let err = requester
            .request_file(&server.to_string(), "stuck")
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Timeout(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn responder_caps_request_size() {
        let responder = TransferResponder::new(Arc::new(Catalog::new()), DEFAULT_MAX_FRAME_LEN, WAIT);
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = crate::identity::Keypair::generate().peer_id();
        let serve = tokio::spawn(async move { responder.serve(peer, &mut server).await });
        // Only the header: the responder must refuse before reading any body.
        client
            .write_all(&(MAX_REQUEST_FRAME_LEN + 1).to_le_bytes())
            .await
            .unwrap();
        let frame = wire::read_frame(&mut client, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        match TransferMessage::decode(&frame).unwrap() {
            TransferMessage::Error { message } => assert!(message.contains("exceeds"), "{}", message),
            other => panic!("unexpected {:?}", other),
        }
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn responder_gives_up_on_silent_requester() {
        let responder =
            TransferResponder::new(Arc::new(Catalog::new()), DEFAULT_MAX_FRAME_LEN, Duration::from_millis(50));
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = crate::identity::Keypair::generate().peer_id();
        tokio::time::timeout(Duration::from_secs(2), responder.serve(peer, &mut server))
            .await
            .expect("serve returns once the request wait expires");
        let frame = wire::read_frame(&mut client, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert!(matches!(
            TransferMessage::decode(&frame).unwrap(),
            TransferMessage::Error { .. }
        ));
    }
}
