use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::WireRecord;

use super::RemoteError;

/// Outbound mutation kind tracked by the sync client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOperation {
    Insert,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Insert => "insert",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// One inbound change-feed event, with before/after row payloads.
/// Deletes carry only `old`; inserts only `new`; updates may carry both.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub old: Option<WireRecord>,
    pub new: Option<WireRecord>,
}

impl ChangeEvent {
    /// The payload that identifies the affected row: `new` when present,
    /// otherwise `old`.
    pub fn record(&self) -> Option<&WireRecord> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// Receiver half of a change-feed subscription. The feed ends (returns
/// `None`) when the transport drops, which the ingestion pipeline treats as
/// a connection error.
pub type ChangeFeed = mpsc::Receiver<ChangeEvent>;

/// The remote system of record: a tabular persistence API with a change
/// feed. Implementations cover the HTTP service and the in-memory test
/// backend; the sync client and ingestion pipeline only see this seam.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Equality select by primary key.
    async fn select_by_id(&self, id: &str) -> Result<Option<WireRecord>, RemoteError>;

    /// Full table scan, used by reconciliation.
    async fn select_all(&self) -> Result<Vec<WireRecord>, RemoteError>;

    /// Containment select: rows whose worker list includes this worker.
    async fn select_by_worker(&self, worker_id: &str) -> Result<Vec<WireRecord>, RemoteError>;

    async fn insert(&self, record: WireRecord) -> Result<(), RemoteError>;

    /// Update by primary key.
    async fn update(&self, id: &str, record: WireRecord) -> Result<(), RemoteError>;

    /// Delete by id list.
    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError>;

    /// Open a change-feed subscription for the table.
    async fn subscribe(&self) -> Result<ChangeFeed, RemoteError>;
}
