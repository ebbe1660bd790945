//! Announcements: publish shared files on the gossip topic and fold received ones into the catalog.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::identity::PeerId;
use crate::overlay::{Overlay, OverlayError};
use crate::protocol::{
    decode_announcement, encode_announcement, now_millis, Announcement, AvailableFileRecord,
    DecodeError, SharedFile, ANNOUNCE_TOPIC,
};

/// Why an announcement was not published.
#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Publish(#[from] OverlayError),
}

/// Result of processing one announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Our own announcement; nothing stored.
    Ignored,
    /// Inserted or overwrote this record.
    Stored(AvailableFileRecord),
}

pub struct Announcer {
    local: PeerId,
    catalog: Arc<Catalog>,
    overlay: Arc<dyn Overlay>,
}

impl Announcer {
    pub fn new(catalog: Arc<Catalog>, overlay: Arc<dyn Overlay>) -> Self {
        Self {
            local: overlay.local_peer_id(),
            catalog,
            overlay,
        }
    }

    /// Publish `file` on the announce topic, then run the same bytes through our own subscriber path.
    ///
    /// A failure is returned for the caller to report; the local share stays in place.
    pub async fn announce(&self, file: &SharedFile) -> Result<(), AnnounceError> {
        let announcement = Announcement::for_file(self.local, file);
        let bytes = encode_announcement(&announcement)?;
        let published = self.overlay.publish(ANNOUNCE_TOPIC, bytes.clone()).await;
        self.handle_gossip(self.local, &bytes);
        Ok(published?)
    }

    /// Decode and apply one announcement.
    pub fn on_announcement(&self, raw: &[u8]) -> Result<AnnounceOutcome, DecodeError> {
        let announcement = decode_announcement(raw)?;
        if announcement.peer_id == self.local {
            return Ok(AnnounceOutcome::Ignored);
        }
        let record = announcement.into_record(now_millis());
        self.catalog.put_available(record.clone());
        Ok(AnnounceOutcome::Stored(record))
    }

    /// Subscriber boundary: never fails. Malformed messages are logged and dropped.
    pub fn handle_gossip(&self, source: PeerId, raw: &[u8]) -> Option<AvailableFileRecord> {
        match self.on_announcement(raw) {
            Ok(AnnounceOutcome::Stored(record)) => {
                debug!(
                    peer = %record.peer_id,
                    file_id = %record.file_id,
                    name = %record.file_name,
                    "file announced"
                );
                Some(record)
            }
            Ok(AnnounceOutcome::Ignored) => None,
            Err(e) => {
                warn!(source = %source, error = %e, "dropping malformed announcement");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::memory::MemoryNetwork;
    use crate::overlay::OverlayEvent;

    fn file(id: &str, name: &str) -> SharedFile {
        SharedFile {
            id: id.into(),
            name: name.into(),
            mime_type: "text/plain".into(),
            size_bytes: 4,
            payload: b"data".to_vec(),
            created_at: 0,
        }
    }

    fn announcer() -> (Announcer, Arc<Catalog>) {
        let net = MemoryNetwork::new();
        let overlay = net.join();
        let catalog = Arc::new(Catalog::new());
        (Announcer::new(catalog.clone(), overlay), catalog)
    }

    fn foreign(peer: PeerId, file_id: &str, name: &str) -> Vec<u8> {
        let a = Announcement {
            peer_id: peer,
            file_id: file_id.into(),
            file_name: name.into(),
            file_size_bytes: 4,
            timestamp: 1,
        };
        encode_announcement(&a).unwrap()
    }

    #[tokio::test]
    async fn own_announcement_not_stored() {
        let (announcer, catalog) = announcer();
        // No peers: publish fails, but the self-consume still runs and still filters.
        let result = announcer.announce(&file("a", "a.txt")).await;
        assert!(matches!(
            result,
            Err(AnnounceError::Publish(OverlayError::NoPeers))
        ));
        assert_eq!(catalog.available_len(), 0);
    }

    #[test]
    fn self_peer_ignored() {
        let (announcer, catalog) = announcer();
        let raw = foreign(announcer.local, "x", "x.txt");
        assert_eq!(
            announcer.on_announcement(&raw).unwrap(),
            AnnounceOutcome::Ignored
        );
        assert_eq!(catalog.available_len(), 0);
    }

    #[test]
    fn last_announcement_wins() {
        let (announcer, catalog) = announcer();
        let peer = Keypair::generate().peer_id();
        announcer.handle_gossip(peer, &foreign(peer, "x", "first.txt"));
        let second = announcer
            .handle_gossip(peer, &foreign(peer, "x", "second.txt"))
            .unwrap();
        assert_eq!(second.file_name, "second.txt");
        let all = catalog.list_available();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].file_name, "second.txt");
        assert_eq!(all[0].peer_id, peer);
    }

    #[test]
    fn malformed_is_swallowed() {
        let (announcer, catalog) = announcer();
        let peer = Keypair::generate().peer_id();
        assert!(announcer.on_announcement(b"\xff\x00garbage").is_err());
        assert!(announcer.handle_gossip(peer, b"\xff\x00garbage").is_none());
        // Later good messages still land.
        assert!(announcer
            .handle_gossip(peer, &foreign(peer, "y", "y.txt"))
            .is_some());
        assert_eq!(catalog.available_len(), 1);
    }

    #[tokio::test]
    async fn published_bytes_reach_peer() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        b.subscribe(ANNOUNCE_TOPIC).unwrap();
        net.connect(&a.local_peer_id(), &b.local_peer_id()).unwrap();

        let catalog_a = Arc::new(Catalog::new());
        let announcer_a = Announcer::new(catalog_a, a.clone());
        announcer_a.announce(&file("f", "f.txt")).await.unwrap();

        let catalog_b = Arc::new(Catalog::new());
        let announcer_b = Announcer::new(catalog_b.clone(), b.clone());
        let mut rx = b.take_events().unwrap();
        loop {
            match rx.recv().await.unwrap() {
                OverlayEvent::Gossip { source, data, .. } => {
                    let record = announcer_b.handle_gossip(source, &data).unwrap();
                    assert_eq!(record.peer_id, a.local_peer_id());
                    assert_eq!(record.file_name, "f.txt");
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(catalog_b.available_len(), 1);
    }
}
