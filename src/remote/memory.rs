//! In-memory remote backend.
//!
//! Backs the test suite and offline development: a table of wire rows keyed
//! by id, an eager change feed, and failure injection for exercising the
//! sync client's retry and idempotency paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::WireRecord;

use super::backend::{ChangeEvent, ChangeFeed, ChangeKind, RemoteBackend, SyncOperation};
use super::RemoteError;

/// Buffer size for in-memory change feeds; large enough that tests never
/// block on a slow consumer.
const FEED_BUFFER_SIZE: usize = 64;

#[derive(Default)]
pub struct MemoryBackend {
    rows: Mutex<HashMap<String, WireRecord>>,
    subscribers: Mutex<Vec<mpsc::Sender<ChangeEvent>>>,
    /// Remaining mutating calls that fail with a server error.
    fail_remaining: AtomicU32,
    insert_calls: AtomicU32,
    update_calls: AtomicU32,
    delete_calls: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` mutating calls fail with a transient server error.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of calls seen for one operation kind. Lets tests assert that
    /// coalescing and pre-checks avoided duplicate network calls.
    pub fn call_count(&self, op: SyncOperation) -> u32 {
        match op {
            SyncOperation::Insert => self.insert_calls.load(Ordering::SeqCst),
            SyncOperation::Update => self.update_calls.load(Ordering::SeqCst),
            SyncOperation::Delete => self.delete_calls.load(Ordering::SeqCst),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("rows lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<WireRecord> {
        self.rows.lock().expect("rows lock").get(id).cloned()
    }

    /// Seed a row without emitting a feed event, as if it existed before the
    /// client connected.
    pub fn seed(&self, record: WireRecord) {
        self.rows
            .lock()
            .expect("rows lock")
            .insert(record.id.clone(), record);
    }

    fn take_failure(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock");
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Change feed subscriber full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn select_by_id(&self, id: &str) -> Result<Option<WireRecord>, RemoteError> {
        Ok(self.rows.lock().expect("rows lock").get(id).cloned())
    }

    async fn select_all(&self) -> Result<Vec<WireRecord>, RemoteError> {
        Ok(self.rows.lock().expect("rows lock").values().cloned().collect())
    }

    async fn select_by_worker(&self, worker_id: &str) -> Result<Vec<WireRecord>, RemoteError> {
        Ok(self
            .rows
            .lock()
            .expect("rows lock")
            .values()
            .filter(|r| r.worker_ids.iter().any(|w| w == worker_id))
            .cloned()
            .collect())
    }

    async fn insert(&self, record: WireRecord) -> Result<(), RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(RemoteError::Server("injected failure".to_string()));
        }
        if record.id.is_empty() {
            return Err(RemoteError::InvalidIdentifier("empty id".to_string()));
        }
        {
            let mut rows = self.rows.lock().expect("rows lock");
            if rows.contains_key(&record.id) {
                return Err(RemoteError::DuplicateKey(record.id.clone()));
            }
            rows.insert(record.id.clone(), record.clone());
        }
        self.emit(ChangeEvent {
            kind: ChangeKind::Insert,
            old: None,
            new: Some(record),
        });
        Ok(())
    }

    async fn update(&self, id: &str, record: WireRecord) -> Result<(), RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(RemoteError::Server("injected failure".to_string()));
        }
        if id.is_empty() {
            return Err(RemoteError::InvalidIdentifier("empty id".to_string()));
        }
        let old = {
            let mut rows = self.rows.lock().expect("rows lock");
            let old = rows.get(id).cloned();
            rows.insert(id.to_string(), record.clone());
            old
        };
        self.emit(ChangeEvent {
            kind: ChangeKind::Update,
            old,
            new: Some(record),
        });
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(RemoteError::Server("injected failure".to_string()));
        }
        let removed: Vec<WireRecord> = {
            let mut rows = self.rows.lock().expect("rows lock");
            ids.iter().filter_map(|id| rows.remove(id)).collect()
        };
        for old in removed {
            self.emit(ChangeEvent {
                kind: ChangeKind::Delete,
                old: Some(old),
                new: None,
            });
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<ChangeFeed, RemoteError> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER_SIZE);
        self.subscribers.lock().expect("subscribers lock").push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> WireRecord {
        WireRecord {
            id: id.to_string(),
            client_id: "c1".to_string(),
            location_id: "l1".to_string(),
            date: Some("2026-08-26".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_then_duplicate_key() {
        let backend = MemoryBackend::new();
        backend.insert(record("e1")).await.expect("first insert");
        let err = backend.insert(record("e1")).await.expect_err("duplicate");
        assert!(err.is_already_satisfied());
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next(1);
        assert!(backend.insert(record("e1")).await.is_err());
        assert!(backend.insert(record("e1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_feed_receives_mutations() {
        let backend = MemoryBackend::new();
        let mut feed = backend.subscribe().await.expect("subscribe");

        backend.insert(record("e1")).await.expect("insert");
        backend.delete(&["e1".to_string()]).await.expect("delete");

        let first = feed.recv().await.expect("insert event");
        assert_eq!(first.kind, ChangeKind::Insert);
        let second = feed.recv().await.expect("delete event");
        assert_eq!(second.kind, ChangeKind::Delete);
        assert_eq!(second.record().map(|r| r.id.as_str()), Some("e1"));
    }

    #[tokio::test]
    async fn test_select_by_worker_containment() {
        let backend = MemoryBackend::new();
        let mut r = record("e1");
        r.worker_ids = vec!["w1".to_string(), "w2".to_string()];
        backend.seed(r);
        backend.seed(record("e2"));

        let rows = backend.select_by_worker("w2").await.expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "e1");
    }
}
