//! Catalog: locally shared files and remotely announced files.
//!
//! Two independent tables, each behind its own lock. Every operation takes the lock for the
//! duration of a map access only; callers never hold it across I/O.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::identity::PeerId;
use crate::protocol::{AvailableFileRecord, SharedFile};

#[derive(Default)]
pub struct Catalog {
    shared: RwLock<HashMap<String, Arc<SharedFile>>>,
    available: RwLock<HashMap<String, AvailableFileRecord>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a locally shared file. Returns the previous entry with the same id, if any.
    pub fn put_shared(&self, file: impl Into<Arc<SharedFile>>) -> Option<Arc<SharedFile>> {
        let file = file.into();
        write(&self.shared).insert(file.id.clone(), file)
    }

    pub fn remove_shared(&self, id: &str) -> Option<Arc<SharedFile>> {
        write(&self.shared).remove(id)
    }

    pub fn get_shared(&self, id: &str) -> Option<Arc<SharedFile>> {
        read(&self.shared).get(id).cloned()
    }

    /// All shared files, oldest first.
    pub fn list_shared(&self) -> Vec<Arc<SharedFile>> {
        let mut files: Vec<Arc<SharedFile>> = read(&self.shared).values().cloned().collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        files
    }

    pub fn shared_len(&self) -> usize {
        read(&self.shared).len()
    }

    /// Upsert by file id. Whatever arrives last wins; timestamps are not compared.
    pub fn put_available(&self, record: AvailableFileRecord) -> Option<AvailableFileRecord> {
        write(&self.available).insert(record.file_id.clone(), record)
    }

    /// All announced files, oldest announcement first.
    pub fn list_available(&self) -> Vec<AvailableFileRecord> {
        let mut records: Vec<AvailableFileRecord> =
            read(&self.available).values().cloned().collect();
        records.sort_by(|a, b| {
            a.announced_at
                .cmp(&b.announced_at)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        records
    }

    pub fn get_available(&self, file_id: &str) -> Option<AvailableFileRecord> {
        read(&self.available).get(file_id).cloned()
    }

    pub fn available_len(&self) -> usize {
        read(&self.available).len()
    }

    /// Forget everything a peer announced. Returns how many records were dropped.
    pub fn remove_available_from(&self, peer: &PeerId) -> usize {
        let mut table = write(&self.available);
        let before = table.len();
        table.retain(|_, r| r.peer_id != *peer);
        before - table.len()
    }

    /// Drop records that arrived more than `ttl` before `now_millis`. Returns how many were dropped.
    pub fn expire_available(&self, now_millis: u64, ttl: Duration) -> usize {
        let cutoff = now_millis.saturating_sub(ttl.as_millis() as u64);
        let mut table = write(&self.available);
        let before = table.len();
        table.retain(|_, r| r.received_at >= cutoff);
        before - table.len()
    }
}

// A panic while holding the lock leaves the map itself intact; keep serving it.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn file(id: &str, created_at: u64) -> SharedFile {
        SharedFile {
            id: id.into(),
            name: format!("{}.bin", id),
            mime_type: "application/octet-stream".into(),
            size_bytes: 3,
            payload: vec![1, 2, 3],
            created_at,
        }
    }

    fn record(peer: PeerId, file_id: &str, name: &str, received_at: u64) -> AvailableFileRecord {
        AvailableFileRecord {
            peer_id: peer,
            file_id: file_id.into(),
            file_name: name.into(),
            file_size_bytes: 10,
            announced_at: received_at,
            received_at,
        }
    }

    #[test]
    fn shared_put_get_remove() {
        let c = Catalog::new();
        assert!(c.put_shared(file("a", 1)).is_none());
        assert_eq!(c.get_shared("a").unwrap().name, "a.bin");
        assert_eq!(c.shared_len(), 1);
        assert!(c.remove_shared("a").is_some());
        assert!(c.get_shared("a").is_none());
        assert!(c.remove_shared("a").is_none());
    }

    #[test]
    fn list_shared_sorted_by_creation() {
        let c = Catalog::new();
        c.put_shared(file("late", 30));
        c.put_shared(file("early", 10));
        c.put_shared(file("mid", 20));
        let ids: Vec<String> = c.list_shared().iter().map(|f| f.id.clone()).collect();
        assert_eq!(ids, ["early", "mid", "late"]);
    }

    #[test]
    fn available_last_write_wins() {
        let c = Catalog::new();
        let peer = Keypair::generate().peer_id();
        c.put_available(record(peer, "x", "first", 5));
        // Older timestamp but later arrival still wins.
        let prev = c.put_available(record(peer, "x", "second", 1));
        assert_eq!(prev.unwrap().file_name, "first");
        let all = c.list_available();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].file_name, "second");
    }

    #[test]
    fn remove_available_from_peer() {
        let c = Catalog::new();
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        c.put_available(record(a, "1", "a1", 1));
        c.put_available(record(a, "2", "a2", 2));
        c.put_available(record(b, "3", "b3", 3));
        assert_eq!(c.remove_available_from(&a), 2);
        assert_eq!(c.available_len(), 1);
        assert!(c.get_available("3").is_some());
    }

    #[test]
    fn expire_drops_only_old_records() {
        let c = Catalog::new();
        let peer = Keypair::generate().peer_id();
        c.put_available(record(peer, "old", "old", 1_000));
        c.put_available(record(peer, "new", "new", 9_000));
        let dropped = c.expire_available(10_000, Duration::from_secs(5));
        assert_eq!(dropped, 1);
        assert!(c.get_available("old").is_none());
        assert!(c.get_available("new").is_some());
    }

    #[test]
    fn concurrent_put_and_get() {
        let c = Arc::new(Catalog::new());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        c.put_shared(file(&format!("{}-{}", t, i), i));
                    }
                })
            })
            .collect();
        let reader = {
            let c = c.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    for f in c.list_shared() {
                        assert_eq!(f.payload.len() as u64, f.size_bytes);
                    }
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(c.shared_len(), 400);
    }
}
