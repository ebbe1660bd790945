//! Host-facing API: `FileSharing` owns the catalog and both protocol roles, receives overlay
//! events from the host, and reports what happened on a `FileEvent` channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::announce::Announcer;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::identity::PeerId;
use crate::overlay::{Overlay, OverlayError, OverlayEvent};
use crate::protocol::{
    now_millis, AvailableFileRecord, SharedFile, TransferMessage, ANNOUNCE_TOPIC, TRANSFER_PROTOCOL,
};
use crate::transfer::{RequestError, TransferRequester, TransferResponder};

/// Something the UI or CLI may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    FileShared { file_id: String, name: String },
    FileRemoved { file_id: String },
    /// A remote peer announced (or re-announced) a file.
    FileAnnounced(AvailableFileRecord),
    /// `request_file` completed.
    FileReceived {
        peer_id: PeerId,
        file_id: String,
        name: String,
        size_bytes: u64,
    },
    /// Announced records dropped because a peer left or its records expired.
    RecordsDropped { peer_id: Option<PeerId>, count: usize },
}

/// Main coordinator. One per process; share it by `Arc`.
pub struct FileSharing {
    local: PeerId,
    config: Config,
    catalog: Arc<Catalog>,
    announcer: Announcer,
    requester: TransferRequester,
    events: mpsc::UnboundedSender<FileEvent>,
}

impl FileSharing {
    /// Build the context, register the transfer responder and subscribe to announcements.
    pub fn new(
        overlay: Arc<dyn Overlay>,
        config: Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FileEvent>), OverlayError> {
        let catalog = Arc::new(Catalog::new());
        let responder = Arc::new(TransferResponder::new(
            catalog.clone(),
            config.max_frame_len,
            config.request_timeout,
        ));
        overlay.handle(TRANSFER_PROTOCOL, responder)?;
        overlay.subscribe(ANNOUNCE_TOPIC)?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let fs = Self {
            local: overlay.local_peer_id(),
            announcer: Announcer::new(catalog.clone(), overlay.clone()),
            requester: TransferRequester::new(overlay, config.max_frame_len, config.request_timeout),
            catalog,
            config,
            events,
        };
        Ok((fs, events_rx))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Store a file locally and announce it. Returns the new file id.
    ///
    /// The file stays shared even if the announcement could not be published.
    pub async fn share_file(
        &self,
        payload: Vec<u8>,
        name: &str,
        mime_type: &str,
        size_bytes: u64,
    ) -> Result<String, ShareError> {
        if name.trim().is_empty() {
            return Err(ShareError::EmptyName);
        }
        if payload.len() as u64 != size_bytes {
            return Err(ShareError::SizeMismatch {
                declared: size_bytes,
                actual: payload.len() as u64,
            });
        }
        let file = Arc::new(SharedFile {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes,
            payload,
            created_at: now_millis(),
        });
        // The responder sends the whole record in one frame; refuse files it could never serve.
        let response_len = TransferMessage::File(file.clone())
            .encoded_len()
            .unwrap_or(u64::MAX);
        if response_len > u64::from(self.config.max_frame_len) {
            return Err(ShareError::TooLarge {
                size: size_bytes,
                response_len,
                max: self.config.max_frame_len,
            });
        }
        let id = file.id.clone();
        self.catalog.put_shared(file.clone());
        info!(file_id = %id, name, size = size_bytes, "file shared");
        self.emit(FileEvent::FileShared {
            file_id: id.clone(),
            name: name.to_string(),
        });
        if let Err(e) = self.announcer.announce(&file).await {
            warn!(file_id = %id, error = %e, "announcement not published");
        }
        Ok(id)
    }

    pub fn get_shared_files(&self) -> Vec<Arc<SharedFile>> {
        self.catalog.list_shared()
    }

    pub fn get_available_files(&self) -> Vec<AvailableFileRecord> {
        self.catalog.list_available()
    }

    /// Stop sharing a file. Peers that already saw the announcement keep listing it.
    pub fn remove_shared_file(&self, file_id: &str) -> bool {
        let removed = self.catalog.remove_shared(file_id).is_some();
        if removed {
            info!(file_id, "file unshared");
            self.emit(FileEvent::FileRemoved {
                file_id: file_id.to_string(),
            });
        }
        removed
    }

    /// Fetch a file from a remote peer.
    pub async fn request_file(&self, peer_id: &str, file_id: &str) -> Result<SharedFile, RequestError> {
        let file = self.requester.request_file(peer_id, file_id).await?;
        if let Ok(peer) = peer_id.parse() {
            self.emit(FileEvent::FileReceived {
                peer_id: peer,
                file_id: file.id.clone(),
                name: file.name.clone(),
                size_bytes: file.size_bytes,
            });
        }
        Ok(file)
    }

    /// Publish an announcement for every shared file. Returns how many were published.
    pub async fn reannounce_all(&self) -> usize {
        let mut published = 0;
        for file in self.catalog.list_shared() {
            match self.announcer.announce(&file).await {
                Ok(()) => published += 1,
                Err(e) => debug!(file_id = %file.id, error = %e, "re-announce not published"),
            }
        }
        published
    }

    /// Apply one overlay event.
    pub async fn on_overlay_event(&self, event: OverlayEvent) {
        match event {
            OverlayEvent::Gossip {
                topic,
                source,
                data,
            } => {
                if topic != ANNOUNCE_TOPIC {
                    return;
                }
                if let Some(record) = self.announcer.handle_gossip(source, &data) {
                    self.emit(FileEvent::FileAnnounced(record));
                }
            }
            OverlayEvent::PeerConnected(peer) => {
                let n = self.reannounce_all().await;
                debug!(peer = %peer, announced = n, "peer connected, re-announced shared files");
            }
            OverlayEvent::PeerDisconnected(peer) => {
                if self.config.forget_on_disconnect {
                    let count = self.catalog.remove_available_from(&peer);
                    if count > 0 {
                        info!(peer = %peer, count, "forgot files of departed peer");
                        self.emit(FileEvent::RecordsDropped {
                            peer_id: Some(peer),
                            count,
                        });
                    }
                }
            }
        }
    }

    /// Drop expired announced records, if a TTL is configured.
    pub fn expire(&self) -> usize {
        let Some(ttl) = self.config.available_ttl else {
            return 0;
        };
        let count = self.catalog.expire_available(now_millis(), ttl);
        if count > 0 {
            info!(count, "expired announced files");
            self.emit(FileEvent::RecordsDropped {
                peer_id: None,
                count,
            });
        }
        count
    }

    /// Event loop: apply overlay events until the overlay closes its channel.
    pub async fn run(self: Arc<Self>, mut overlay_events: mpsc::UnboundedReceiver<OverlayEvent>) {
        let period = self.config.expiry_interval.max(std::time::Duration::from_millis(1));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = overlay_events.recv() => match event {
                    Some(event) => self.on_overlay_event(event).await,
                    None => break,
                },
                _ = sweep.tick(), if self.config.available_ttl.is_some() => {
                    self.expire();
                }
            }
        }
        debug!("overlay event channel closed");
    }

    fn emit(&self, event: FileEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("file name is empty")]
    EmptyName,
    #[error("declared size {declared} does not match payload size {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("file of {size} bytes needs a {response_len}-byte response, over the transfer limit of {max}")]
    TooLarge { size: u64, response_len: u64, max: u32 },
}
