//! Outbound sync client.
//!
//! Pushes a locally-applied mutation to the remote system of record with an
//! existence pre-check for inserts, exponential backoff on transient
//! failures, and idempotency handling: duplicate keys count as success,
//! malformed identifiers fail fast. Concurrent calls for the same
//! `(operation, entry id)` pair coalesce onto the in-flight attempt instead
//! of issuing duplicate network calls.
//!
//! A failed sync never rolls back the caller's local write; the caller is
//! expected to surface "saved locally, not yet synced" instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::models::{to_wire, ScheduleEntry};

use super::backend::{RemoteBackend, SyncOperation};
use super::RemoteError;

/// How an individual sync call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The remote applied the mutation.
    Applied,
    /// The desired state already held remotely (existence pre-check hit or
    /// duplicate-key collision).
    AlreadyApplied,
}

/// Failure shape shared with coalesced waiters. Broadcast payloads must be
/// `Clone`, which the raw error is not.
#[derive(Debug, Clone)]
struct SharedFailure {
    fatal: bool,
    message: String,
}

type OpKey = (SyncOperation, String);
type SharedResult = Result<SyncOutcome, SharedFailure>;

pub struct SyncClient {
    backend: Arc<dyn RemoteBackend>,
    max_retries: u32,
    in_flight: Mutex<HashMap<OpKey, broadcast::Sender<SharedResult>>>,
}

impl SyncClient {
    pub fn new(backend: Arc<dyn RemoteBackend>, max_retries: u32) -> Self {
        Self {
            backend,
            max_retries,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Push one entry mutation to the remote, retrying transient failures up
    /// to the configured ceiling.
    pub async fn sync(
        &self,
        entry: &ScheduleEntry,
        op: SyncOperation,
    ) -> Result<SyncOutcome, RemoteError> {
        self.sync_with_retries(entry, op, self.max_retries).await
    }

    pub async fn sync_with_retries(
        &self,
        entry: &ScheduleEntry,
        op: SyncOperation,
        max_retries: u32,
    ) -> Result<SyncOutcome, RemoteError> {
        let key: OpKey = (op, entry.id.clone());

        // Single-slot de-duplication: the first caller for a key runs the
        // network attempt, later callers await its broadcast outcome.
        let (tx, waiting_rx) = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                (None, Some(existing.subscribe()))
            } else {
                let (tx, _rx) = broadcast::channel(1);
                in_flight.insert(key.clone(), tx.clone());
                (Some(tx), None)
            }
        };

        if let Some(mut rx) = waiting_rx {
            debug!(
                entry_id = %entry.id,
                op = op.as_str(),
                "Coalescing onto in-flight sync call"
            );
            return match rx.recv().await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(failure)) if failure.fatal => {
                    Err(RemoteError::InvalidIdentifier(failure.message))
                }
                Ok(Err(failure)) => Err(RemoteError::Exhausted(failure.message)),
                Err(_) => Err(RemoteError::Exhausted(
                    "in-flight sync dropped without an outcome".to_string(),
                )),
            };
        }

        let tx = tx.expect("first caller holds the broadcast sender");
        let result = self.run(entry, op, max_retries).await;

        self.in_flight.lock().await.remove(&key);
        let shared = match &result {
            Ok(outcome) => Ok(*outcome),
            Err(e) => Err(SharedFailure {
                fatal: e.is_fatal(),
                message: e.to_string(),
            }),
        };
        // No waiters is fine; send only fails when nobody coalesced.
        let _ = tx.send(shared);

        result
    }

    async fn run(
        &self,
        entry: &ScheduleEntry,
        op: SyncOperation,
        max_retries: u32,
    ) -> Result<SyncOutcome, RemoteError> {
        if op == SyncOperation::Insert {
            match self.backend.select_by_id(&entry.id).await {
                Ok(Some(_)) => {
                    debug!(entry_id = %entry.id, "Insert pre-check: id already exists remotely");
                    return Ok(SyncOutcome::AlreadyApplied);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "Insert pre-check failed, attempting insert anyway");
                }
            }
        }

        let record = to_wire(entry);
        let mut attempt = 0u32;
        loop {
            let result = match op {
                SyncOperation::Insert => self.backend.insert(record.clone()).await,
                SyncOperation::Update => self.backend.update(&entry.id, record.clone()).await,
                SyncOperation::Delete => {
                    self.backend.delete(std::slice::from_ref(&entry.id)).await
                }
            };

            match result {
                Ok(()) => return Ok(SyncOutcome::Applied),
                Err(e) if e.is_already_satisfied() => {
                    debug!(entry_id = %entry.id, op = op.as_str(), "Duplicate key treated as success");
                    return Ok(SyncOutcome::AlreadyApplied);
                }
                Err(e) if e.is_fatal() => {
                    warn!(entry_id = %entry.id, op = op.as_str(), error = %e, "Fatal sync failure, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > max_retries {
                        warn!(
                            entry_id = %entry.id,
                            op = op.as_str(),
                            attempts = attempt,
                            error = %e,
                            "Sync retries exhausted"
                        );
                        return Err(RemoteError::Exhausted(e.to_string()));
                    }
                    let delay = Duration::from_secs(1u64 << attempt); // 2^attempt seconds
                    warn!(
                        entry_id = %entry.id,
                        op = op.as_str(),
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Sync attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
