//! Realtime change-ingestion pipeline.
//!
//! Subscribes to the remote change feed, filters events for relevance, and
//! applies them to the local store and memory cache without re-triggering
//! outbound sync - inbound application never calls the sync client, which
//! is what prevents feedback loops. Application is idempotent since the
//! optimistic local write for our own mutations already happened by the
//! time the confirmed event arrives.
//!
//! Delivery is deliberately at-most-once: an event arriving while another
//! is still being applied is dropped (and logged), not queued; the next
//! full reconciliation catches anything missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::MemoryCache;
use crate::engine::EngineStatus;
use crate::error::EngineError;
use crate::models::{from_wire, sort_entries, ScheduleEntry, WeeklySchedule};
use crate::remote::{ChangeEvent, ChangeKind, RemoteBackend, RemoteError};
use crate::store::LocalStore;

/// Whether an inbound event changed local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeApplied {
    Applied,
    Skipped,
}

/// Per-subscription connection state machine. Terminal only on explicit
/// teardown (`Closed`) or reconnect exhaustion (`Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Subscribed,
    Error,
    TimedOut,
    Reconnecting,
    /// Reconnect attempts exhausted; manual resync required.
    Failed,
    Closed,
}

/// Fetch all relevant remote rows and overwrite the local store with them,
/// grouped by recomputed week id. Shared by the pipeline's initial load and
/// the engine's explicit refresh. Returns the number of entries loaded.
pub(crate) async fn reconcile(
    backend: &Arc<dyn RemoteBackend>,
    store: &Arc<LocalStore>,
    cache: &Arc<StdMutex<MemoryCache>>,
    status: &watch::Sender<EngineStatus>,
    worker_filter: Option<&str>,
) -> Result<usize, EngineError> {
    let rows = match worker_filter {
        Some(worker) => backend.select_by_worker(worker).await?,
        None => backend.select_all().await?,
    };

    let mut schedule = WeeklySchedule::new();
    for row in rows {
        let entry = from_wire(row);
        if entry.missing_identity() {
            debug!("Skipping remote row missing identity fields");
            continue;
        }
        schedule.entry(entry.week_id.clone()).or_default().push(entry);
    }
    for entries in schedule.values_mut() {
        sort_entries(entries);
    }
    let count = schedule.values().map(Vec::len).sum();

    store.save_all(&schedule)?;
    cache.lock().expect("cache lock").invalidate_all();
    status.send_modify(|s| s.last_sync_time = Some(Utc::now()));

    info!(entries = count, "Reconciled local store from remote");
    Ok(count)
}

pub struct RealtimePipeline {
    inner: Arc<PipelineInner>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

struct PipelineInner {
    backend: Arc<dyn RemoteBackend>,
    store: Arc<LocalStore>,
    cache: Arc<StdMutex<MemoryCache>>,
    status: watch::Sender<EngineStatus>,
    state: watch::Sender<ChannelState>,
    worker_filter: Option<String>,
    /// Single-flight guard across the spawned per-event appliers:
    /// `try_lock` failure means another apply is in progress and the new
    /// event is dropped.
    applying: Mutex<()>,
    events_dropped: AtomicU64,
    base_delay: Duration,
    max_attempts: u32,
}

impl RealtimePipeline {
    pub(crate) fn new(
        backend: Arc<dyn RemoteBackend>,
        store: Arc<LocalStore>,
        cache: Arc<StdMutex<MemoryCache>>,
        status: watch::Sender<EngineStatus>,
        worker_filter: Option<String>,
        base_delay_ms: u64,
        max_attempts: u32,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(PipelineInner {
                backend,
                store,
                cache,
                status,
                state,
                worker_filter,
                applying: Mutex::new(()),
                events_dropped: AtomicU64::new(0),
                base_delay: Duration::from_millis(base_delay_ms),
                max_attempts,
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Events discarded by the single-flight guard since the pipeline was
    /// created. Each discard is also logged at warn level.
    pub fn dropped_events(&self) -> u64 {
        self.inner.events_dropped.load(Ordering::Relaxed)
    }

    /// Spawn the subscription loop. Idempotent: a second start while the
    /// loop is running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().expect("task lock");
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            debug!("Realtime pipeline already running");
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            inner.run().await;
        }));
    }

    /// Explicit teardown: the only way to reach `Closed`.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().expect("task lock").take() {
            task.abort();
        }
        self.inner.state.send_replace(ChannelState::Closed);
        self.inner
            .status
            .send_modify(|s| s.is_connected = false);
        info!("Realtime pipeline closed");
    }

    /// Manual full reconciliation, the recovery path after `Failed`.
    pub async fn resync(&self) -> Result<usize, EngineError> {
        reconcile(
            &self.inner.backend,
            &self.inner.store,
            &self.inner.cache,
            &self.inner.status,
            self.inner.worker_filter.as_deref(),
        )
        .await
    }
}

impl PipelineInner {
    fn set_state(&self, state: ChannelState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Realtime channel state change");
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ChannelState::Connecting);

            match self.backend.subscribe().await {
                Ok(mut feed) => {
                    let loaded = reconcile(
                        &self.backend,
                        &self.store,
                        &self.cache,
                        &self.status,
                        self.worker_filter.as_deref(),
                    )
                    .await;
                    match loaded {
                        Ok(_) => {
                            attempt = 0;
                            self.set_state(ChannelState::Subscribed);
                            self.status.send_modify(|s| {
                                s.is_connected = true;
                                s.error = None;
                            });

                            // Each event gets its own apply task; the
                            // single-flight guard inside handle_event drops
                            // events that arrive while an apply is running
                            // rather than queueing them behind it.
                            while let Some(event) = feed.recv().await {
                                let inner = Arc::clone(&self);
                                tokio::spawn(async move {
                                    inner.handle_event(event).await;
                                });
                            }
                            warn!("Realtime change feed closed by transport");
                            self.set_state(ChannelState::Error);
                        }
                        Err(e) => {
                            warn!(error = %e, "Initial reconciliation failed");
                            self.set_state(ChannelState::Error);
                        }
                    }
                }
                Err(RemoteError::Timeout) => {
                    warn!("Realtime subscription timed out");
                    self.set_state(ChannelState::TimedOut);
                }
                Err(e) => {
                    warn!(error = %e, "Realtime subscription failed");
                    self.set_state(ChannelState::Error);
                }
            }

            self.status.send_modify(|s| s.is_connected = false);

            attempt += 1;
            if attempt > self.max_attempts {
                warn!(
                    attempts = attempt - 1,
                    "Reconnect attempts exhausted, manual resync required"
                );
                self.set_state(ChannelState::Failed);
                self.status.send_modify(|s| {
                    s.error = Some(
                        EngineError::ChannelFailed(
                            "reconnect attempts exhausted, manual resync required"
                                .to_string(),
                        )
                        .to_string(),
                    );
                });
                return;
            }

            self.set_state(ChannelState::Reconnecting);
            // Linear backoff: delay grows with the attempt number.
            let delay = self.base_delay * attempt;
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    async fn handle_event(&self, event: ChangeEvent) {
        let Some(record) = event.record() else {
            debug!(kind = event.kind.as_str(), "Discarding event without a payload");
            return;
        };
        let entry = from_wire(record.clone());

        // Relevance filter: configured deployments only ingest one worker's
        // assignments.
        if let Some(ref worker) = self.worker_filter {
            if !entry.worker_ids.iter().any(|w| w == worker) {
                debug!(id = %entry.id, "Event filtered as irrelevant");
                return;
            }
        }

        // Single-flight: drop, do not queue. The next reconciliation heals.
        let Ok(_guard) = self.applying.try_lock() else {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = %entry.id,
                kind = event.kind.as_str(),
                "Ingestion busy, dropping realtime event (at-most-once policy)"
            );
            return;
        };

        let mut schedule = self.store.load_all();
        let applied = match event.kind {
            ChangeKind::Insert => apply_insert(&mut schedule, entry),
            ChangeKind::Update => apply_update(&mut schedule, entry),
            ChangeKind::Delete => apply_delete(&mut schedule, &entry.week_id, &entry.id),
        };

        match applied {
            ChangeApplied::Skipped => {}
            ChangeApplied::Applied => {
                if let Err(e) = self.store.save_all(&schedule) {
                    warn!(error = %e, "Failed to persist ingested event");
                    return;
                }
                self.cache.lock().expect("cache lock").invalidate_all();
                self.status
                    .send_modify(|s| s.last_sync_time = Some(Utc::now()));
            }
        }
    }
}

fn apply_insert(schedule: &mut WeeklySchedule, entry: ScheduleEntry) -> ChangeApplied {
    let week = schedule.entry(entry.week_id.clone()).or_default();
    if week.iter().any(|e| e.id == entry.id) {
        debug!(id = %entry.id, "Insert event already applied locally, discarding");
        return ChangeApplied::Skipped;
    }
    debug!(id = %entry.id, week_id = %entry.week_id, "Ingesting remote insert");
    week.push(entry);
    sort_entries(week);
    ChangeApplied::Applied
}

fn apply_update(schedule: &mut WeeklySchedule, entry: ScheduleEntry) -> ChangeApplied {
    // Locate by id anywhere: a date change moves the entry between weeks.
    let mut found = false;
    for entries in schedule.values_mut() {
        let before = entries.len();
        entries.retain(|e| e.id != entry.id);
        if entries.len() < before {
            found = true;
        }
    }
    schedule.retain(|_, entries| !entries.is_empty());

    if !found {
        debug!(id = %entry.id, "Update event for unknown entry, treating as insert");
    } else {
        debug!(id = %entry.id, week_id = %entry.week_id, "Ingesting remote update");
    }
    let week = schedule.entry(entry.week_id.clone()).or_default();
    week.push(entry);
    sort_entries(week);
    ChangeApplied::Applied
}

fn apply_delete(schedule: &mut WeeklySchedule, week_id: &str, id: &str) -> ChangeApplied {
    let Some(week) = schedule.get_mut(week_id) else {
        debug!(week_id, id, "Delete event for unknown week, discarding");
        return ChangeApplied::Skipped;
    };
    let before = week.len();
    week.retain(|e| e.id != id);
    if week.len() == before {
        debug!(week_id, id, "Delete event for unknown id, discarding");
        return ChangeApplied::Skipped;
    }
    if week.is_empty() {
        schedule.remove(week_id);
    }
    debug!(week_id, id, "Ingesting remote delete");
    ChangeApplied::Applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{to_wire, WireRecord};
    use crate::remote::{ChangeFeed, MemoryBackend, SyncOperation};
    use async_trait::async_trait;
    use chrono::NaiveDate;

    fn entry(id: &str, worker: &str) -> ScheduleEntry {
        let mut e = ScheduleEntry::new(
            id,
            "c1",
            "l1",
            NaiveDate::from_ymd_opt(2026, 8, 26).expect("valid date"),
        );
        e.worker_ids = vec![worker.to_string()];
        e.hours = 8.0;
        e.normalize();
        e
    }

    fn pipeline_for(
        backend: Arc<dyn RemoteBackend>,
        store: Arc<LocalStore>,
        filter: Option<String>,
    ) -> (RealtimePipeline, watch::Receiver<EngineStatus>) {
        let cache = Arc::new(StdMutex::new(MemoryCache::new()));
        let (status, status_rx) = watch::channel(EngineStatus::default());
        let pipeline = RealtimePipeline::new(backend, store, cache, status, filter, 10, 3);
        (pipeline, status_rx)
    }

    async fn wait_for_state(pipeline: &RealtimePipeline, wanted: ChannelState) {
        let mut rx = pipeline.watch_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow() == wanted {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .expect("state reached in time");
    }

    #[tokio::test]
    async fn test_subscribe_reconciles_and_ingests_inserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).expect("store"));
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(to_wire(&entry("seeded", "w1")));

        let (pipeline, _status_rx) = pipeline_for(backend.clone(), store.clone(), None);
        pipeline.start();
        wait_for_state(&pipeline, ChannelState::Subscribed).await;

        // Initial reconciliation pulled the seeded row
        assert_eq!(
            store.load_all().get("2026-08-24").map(Vec::len),
            Some(1)
        );

        // A remote insert flows through the feed into the store
        backend
            .insert(to_wire(&entry("live", "w2")))
            .await
            .expect("remote insert");
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let weeks = store.load_all();
                if weeks.get("2026-08-24").map(Vec::len) == Some(2) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("insert ingested");

        pipeline.shutdown();
        assert_eq!(pipeline.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_duplicate_insert_event_applies_once() {
        let mut schedule = WeeklySchedule::new();

        let applied = apply_insert(&mut schedule, entry("e1", "w1"));
        assert_eq!(applied, ChangeApplied::Applied);
        let again = apply_insert(&mut schedule, entry("e1", "w1"));
        assert_eq!(again, ChangeApplied::Skipped);
        assert_eq!(schedule.get("2026-08-24").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_update_for_unknown_entry_becomes_insert() {
        let mut schedule = WeeklySchedule::new();
        let applied = apply_update(&mut schedule, entry("e1", "w1"));
        assert_eq!(applied, ChangeApplied::Applied);
        assert_eq!(schedule.get("2026-08-24").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_update_moves_entry_across_weeks() {
        let mut schedule = WeeklySchedule::new();
        apply_insert(&mut schedule, entry("e1", "w1"));

        let mut moved = entry("e1", "w1");
        moved.date = NaiveDate::from_ymd_opt(2026, 9, 2).expect("valid date");
        moved.normalize();
        apply_update(&mut schedule, moved);

        assert!(schedule.get("2026-08-24").is_none());
        assert_eq!(schedule.get("2026-08-31").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_silent() {
        let mut schedule = WeeklySchedule::new();
        apply_insert(&mut schedule, entry("e1", "w1"));

        assert_eq!(
            apply_delete(&mut schedule, "2026-08-24", "missing"),
            ChangeApplied::Skipped
        );
        assert_eq!(
            apply_delete(&mut schedule, "1999-01-04", "e1"),
            ChangeApplied::Skipped
        );
        assert_eq!(schedule.get("2026-08-24").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_relevance_filter_discards_other_workers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).expect("store"));
        let backend = Arc::new(MemoryBackend::new());

        let (pipeline, _status_rx) =
            pipeline_for(backend.clone(), store.clone(), Some("w1".to_string()));
        pipeline.start();
        wait_for_state(&pipeline, ChannelState::Subscribed).await;

        backend
            .insert(to_wire(&entry("mine", "w1")))
            .await
            .expect("insert");
        backend
            .insert(to_wire(&entry("other", "w2")))
            .await
            .expect("insert");

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let weeks = store.load_all();
                let ids: Vec<String> = weeks
                    .values()
                    .flatten()
                    .map(|e| e.id.clone())
                    .collect();
                if ids.contains(&"mine".to_string()) {
                    assert!(!ids.contains(&"other".to_string()));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relevant event ingested");

        pipeline.shutdown();
        assert_eq!(backend.call_count(SyncOperation::Insert), 2);
    }

    /// Backend whose subscription always fails, for exercising the
    /// reconnect policy.
    struct Unreachable;

    #[async_trait]
    impl RemoteBackend for Unreachable {
        async fn select_by_id(&self, _id: &str) -> Result<Option<WireRecord>, RemoteError> {
            Err(RemoteError::Server("unreachable".to_string()))
        }
        async fn select_all(&self) -> Result<Vec<WireRecord>, RemoteError> {
            Err(RemoteError::Server("unreachable".to_string()))
        }
        async fn select_by_worker(
            &self,
            _worker_id: &str,
        ) -> Result<Vec<WireRecord>, RemoteError> {
            Err(RemoteError::Server("unreachable".to_string()))
        }
        async fn insert(&self, _record: WireRecord) -> Result<(), RemoteError> {
            Err(RemoteError::Server("unreachable".to_string()))
        }
        async fn update(&self, _id: &str, _record: WireRecord) -> Result<(), RemoteError> {
            Err(RemoteError::Server("unreachable".to_string()))
        }
        async fn delete(&self, _ids: &[String]) -> Result<(), RemoteError> {
            Err(RemoteError::Server("unreachable".to_string()))
        }
        async fn subscribe(&self) -> Result<ChangeFeed, RemoteError> {
            Err(RemoteError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_reaches_failed_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).expect("store"));
        let (pipeline, status_rx) = pipeline_for(Arc::new(Unreachable), store, None);

        pipeline.start();
        wait_for_state(&pipeline, ChannelState::Failed).await;

        let error = status_rx.borrow().error.clone().expect("failure surfaced");
        assert!(error.contains("realtime channel failed"));
    }

    #[tokio::test]
    async fn test_event_during_apply_is_dropped_not_queued() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).expect("store"));
        let backend = Arc::new(MemoryBackend::new());

        let (pipeline, _status_rx) = pipeline_for(backend.clone(), store.clone(), None);
        pipeline.start();
        wait_for_state(&pipeline, ChannelState::Subscribed).await;

        // Hold the apply slot as if an ingestion were in progress; the next
        // event must be discarded, not queued behind it.
        let guard = pipeline.inner.applying.lock().await;
        backend
            .insert(to_wire(&entry("blocked", "w1")))
            .await
            .expect("insert while busy");
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.dropped_events() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("event dropped");
        drop(guard);

        backend
            .insert(to_wire(&entry("after", "w1")))
            .await
            .expect("insert after release");
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ids: Vec<String> = store
                    .load_all()
                    .values()
                    .flatten()
                    .map(|e| e.id.clone())
                    .collect();
                if ids.contains(&"after".to_string()) {
                    assert!(!ids.contains(&"blocked".to_string()));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("later event applied");
        assert_eq!(pipeline.dropped_events(), 1);
    }
}
