//! Engine facade.
//!
//! `ScheduleEngine` ties the layers together behind one handle: reads go
//! memory cache first then durable store, mutations follow local-first
//! ordering (validate, persist locally, update caches, then push to the
//! remote in the background). A failed remote push never rolls back the
//! local write; the status channel reports "saved locally, not synced"
//! instead.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{fingerprint, MemoryCache};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{
    current_week_id, sort_entries, week_id_of, EntryPatch, PaymentType, ScheduleEntry,
    ScheduleStats, DEFAULT_OVERTIME_MULTIPLIER,
};
use crate::realtime::{reconcile, ChannelState, RealtimePipeline};
use crate::remote::{RemoteBackend, SyncClient, SyncOperation};
use crate::stats::compute_stats_with_threshold;
use crate::store::{DebouncedSaver, LocalStore};

/// Connectivity and sync posture, published over a watch channel so
/// callers can render it without polling.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    /// Realtime subscription currently established.
    pub is_connected: bool,
    /// At least one background sync push is in flight.
    pub is_syncing: bool,
    /// Last successful exchange with the remote, inbound or outbound.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Most recent unresolved failure, cleared by the next success.
    pub error: Option<String>,
}

/// Cheap-to-clone handle over the shared engine state.
#[derive(Clone)]
pub struct ScheduleEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<LocalStore>,
    saver: DebouncedSaver,
    cache: Arc<StdMutex<MemoryCache>>,
    sync: Arc<SyncClient>,
    backend: Arc<dyn RemoteBackend>,
    status: watch::Sender<EngineStatus>,
    pipeline: StdMutex<Option<RealtimePipeline>>,
    syncs_in_flight: AtomicU32,
    /// Serializes load-modify-save mutation cycles across engine handles.
    write_lock: tokio::sync::Mutex<()>,
}

impl ScheduleEngine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn RemoteBackend>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(LocalStore::new(config.storage_dir()?)?);
        let saver = DebouncedSaver::new(store.clone(), config.debounce_ms);
        let sync = Arc::new(SyncClient::new(backend.clone(), config.max_sync_retries));
        let (status, _) = watch::channel(EngineStatus::default());

        info!(storage_dir = %store.storage_dir().display(), "Schedule engine initialized");
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                saver,
                cache: Arc::new(StdMutex::new(MemoryCache::new())),
                sync,
                backend,
                status,
                pipeline: StdMutex::new(None),
                syncs_in_flight: AtomicU32::new(0),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ==================== Reads ====================

    /// One week's entries, cache-first. The empty week is an ordinary
    /// result, not an error.
    pub async fn get_week_schedule(
        &self,
        week_id: &str,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        self.get_week_schedule_with(week_id, false).await
    }

    /// As `get_week_schedule`, but `force_refresh` reconciles from the
    /// remote first.
    pub async fn get_week_schedule_with(
        &self,
        week_id: &str,
        force_refresh: bool,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        if force_refresh {
            self.refresh_from_remote().await?;
        }

        if let Some(entries) = self.lock_cache().get_week(week_id) {
            debug!(week_id, "Week cache hit");
            return Ok(entries);
        }

        let schedule = self.inner.store.load_all();
        let entries = schedule.get(week_id).cloned().unwrap_or_default();
        self.lock_cache().put_week(week_id, entries.clone());
        Ok(entries)
    }

    /// The weekly pay and hours aggregate, served from the fingerprinted
    /// stats cache when the week's entries are unchanged.
    pub async fn get_week_stats(&self, week_id: &str) -> Result<ScheduleStats, EngineError> {
        let entries = self.get_week_schedule(week_id).await?;
        let fp = fingerprint(&entries);

        if let Some(stats) = self.lock_cache().get_stats(&fp) {
            debug!(week_id, "Stats cache hit");
            return Ok(stats);
        }

        let stats =
            compute_stats_with_threshold(&entries, self.inner.config.overtime_threshold);
        self.lock_cache().put_stats(&fp, stats.clone());
        Ok(stats)
    }

    pub fn current_week_id(&self) -> String {
        current_week_id()
    }

    pub fn week_id_from_date(&self, date: NaiveDate) -> String {
        week_id_of(date)
    }

    // ==================== Mutations ====================

    /// Add one entry to a week: normalize, persist locally, then push to
    /// the remote in the background. The entry's date decides the week it
    /// actually lands in; a mismatched `week_id` argument is corrected.
    /// Returns the normalized entry as stored.
    pub async fn add_entry(
        &self,
        week_id: &str,
        mut entry: ScheduleEntry,
    ) -> Result<ScheduleEntry, EngineError> {
        // Creation-time defaults from the engine configuration: a missing
        // rate and the stock multiplier take the configured values.
        if entry.payment_type == PaymentType::Hourly && entry.hourly_rate == 0.0 {
            entry.hourly_rate = self.inner.config.default_hourly_rate;
        }
        if entry.overtime_multiplier == DEFAULT_OVERTIME_MULTIPLIER {
            entry.overtime_multiplier = self.inner.config.overtime_multiplier;
        }
        entry.normalize();
        if entry.missing_identity() {
            return Err(EngineError::Validation(
                "entry requires non-empty id, client_id and location_id".to_string(),
            ));
        }
        if entry.week_id != week_id {
            debug!(
                id = %entry.id,
                requested = week_id,
                actual = %entry.week_id,
                "Entry filed under the week its date belongs to"
            );
        }

        let _write = self.inner.write_lock.lock().await;
        let mut schedule = self.inner.store.load_all();
        // Ids are globally unique, so the scan covers every week: the same
        // id under two different weeks would diverge from the remote, which
        // holds one row per id.
        if let Some(existing) = schedule.values().flatten().find(|e| e.id == entry.id) {
            return Err(EngineError::Validation(format!(
                "entry {} already exists in week {}",
                entry.id, existing.week_id
            )));
        }
        let week = schedule.entry(entry.week_id.clone()).or_default();
        week.push(entry.clone());
        sort_entries(week);
        let week_snapshot = week.clone();
        self.inner.store.save_all(&schedule)?;

        {
            let mut cache = self.lock_cache();
            cache.put_week(&entry.week_id, week_snapshot);
            cache.note_mutation();
        }

        debug!(id = %entry.id, week_id = %entry.week_id, "Entry added locally");
        self.spawn_sync(entry.clone(), SyncOperation::Insert);
        Ok(entry)
    }

    /// Apply a partial update to one entry. A date change moves the entry
    /// to its new week.
    pub async fn update_entry(
        &self,
        week_id: &str,
        id: &str,
        patch: &EntryPatch,
    ) -> Result<ScheduleEntry, EngineError> {
        let _write = self.inner.write_lock.lock().await;
        let mut schedule = self.inner.store.load_all();
        let entry = apply_patch(&mut schedule, week_id, id, patch)?;
        self.inner.store.save_all(&schedule)?;

        if entry.week_id != week_id {
            debug!(id, from = week_id, to = %entry.week_id, "Entry moved between weeks");
            self.lock_cache().invalidate_all();
        } else {
            let week_snapshot = schedule.get(week_id).cloned().unwrap_or_default();
            let mut cache = self.lock_cache();
            cache.put_week(week_id, week_snapshot);
            cache.note_mutation();
        }

        self.spawn_sync(entry.clone(), SyncOperation::Update);
        Ok(entry)
    }

    /// Remove one entry. Unknown week or id is an error and leaves the
    /// store untouched.
    pub async fn delete_entry(&self, week_id: &str, id: &str) -> Result<(), EngineError> {
        let _write = self.inner.write_lock.lock().await;
        let mut schedule = self.inner.store.load_all();
        let removed = remove_entry(&mut schedule, week_id, id)?;
        self.inner.store.save_all(&schedule)?;

        {
            let week_snapshot = schedule.get(week_id).cloned().unwrap_or_default();
            let mut cache = self.lock_cache();
            cache.put_week(week_id, week_snapshot);
            cache.note_mutation();
        }

        debug!(id, week_id, "Entry deleted locally");
        self.spawn_sync(removed, SyncOperation::Delete);
        Ok(())
    }

    /// Apply several patches in one pass with debounced persistence.
    /// Validates every id up front so a missing one fails the whole batch
    /// before anything is written.
    pub async fn update_entries(
        &self,
        week_id: &str,
        updates: &[(String, EntryPatch)],
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        let _write = self.inner.write_lock.lock().await;
        let mut schedule = self.inner.store.load_all();
        {
            let week = schedule.get(week_id).map(Vec::as_slice).unwrap_or(&[]);
            for (id, _) in updates {
                if !week.iter().any(|e| &e.id == id) {
                    return Err(EngineError::NotFound {
                        week_id: week_id.to_string(),
                        id: id.clone(),
                    });
                }
            }
        }

        let mut updated = Vec::with_capacity(updates.len());
        for (id, patch) in updates {
            let entry = apply_patch(&mut schedule, week_id, id, patch)?;
            updated.push(entry);
            self.inner.saver.schedule(schedule.clone()).await;
        }
        self.inner.saver.flush().await;
        self.lock_cache().invalidate_all();

        for entry in &updated {
            self.spawn_sync(entry.clone(), SyncOperation::Update);
        }
        Ok(updated)
    }

    /// Remove several entries in one pass with debounced persistence. As
    /// with `update_entries`, any unknown id fails the batch up front.
    pub async fn delete_entries(
        &self,
        week_id: &str,
        ids: &[String],
    ) -> Result<(), EngineError> {
        let _write = self.inner.write_lock.lock().await;
        let mut schedule = self.inner.store.load_all();
        {
            let week = schedule.get(week_id).map(Vec::as_slice).unwrap_or(&[]);
            for id in ids {
                if !week.iter().any(|e| &e.id == id) {
                    return Err(EngineError::NotFound {
                        week_id: week_id.to_string(),
                        id: id.clone(),
                    });
                }
            }
        }

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            removed.push(remove_entry(&mut schedule, week_id, id)?);
            self.inner.saver.schedule(schedule.clone()).await;
        }
        self.inner.saver.flush().await;
        self.lock_cache().invalidate_all();

        for entry in removed {
            self.spawn_sync(entry, SyncOperation::Delete);
        }
        Ok(())
    }

    // ==================== Remote ====================

    /// Pull the full relevant remote state and overwrite local storage with
    /// it. Returns the number of entries loaded.
    pub async fn refresh_from_remote(&self) -> Result<usize, EngineError> {
        reconcile(
            &self.inner.backend,
            &self.inner.store,
            &self.inner.cache,
            &self.inner.status,
            self.inner.config.worker_filter.as_deref(),
        )
        .await
    }

    /// Start the realtime change-ingestion pipeline. Idempotent while a
    /// pipeline is already running.
    pub fn start_realtime(&self) {
        let mut slot = self.inner.pipeline.lock().expect("pipeline lock");
        let pipeline = slot.get_or_insert_with(|| {
            RealtimePipeline::new(
                self.inner.backend.clone(),
                self.inner.store.clone(),
                self.inner.cache.clone(),
                self.inner.status.clone(),
                self.inner.config.worker_filter.clone(),
                self.inner.config.reconnect_base_delay_ms,
                self.inner.config.max_reconnect_attempts,
            )
        });
        pipeline.start();
    }

    /// Tear down the realtime pipeline if one is running.
    pub fn stop_realtime(&self) {
        if let Some(pipeline) = self.inner.pipeline.lock().expect("pipeline lock").take() {
            pipeline.shutdown();
        }
    }

    /// Current realtime channel state, if a pipeline exists.
    pub fn realtime_state(&self) -> Option<ChannelState> {
        self.inner
            .pipeline
            .lock()
            .expect("pipeline lock")
            .as_ref()
            .map(RealtimePipeline::state)
    }

    /// Manual full reconciliation; the recovery path once the realtime
    /// channel reports `Failed`.
    pub async fn resync(&self) -> Result<usize, EngineError> {
        self.refresh_from_remote().await
    }

    // ==================== Status ====================

    pub fn status(&self) -> EngineStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.subscribe()
    }

    // ==================== Internals ====================

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, MemoryCache> {
        self.inner.cache.lock().expect("cache lock")
    }

    /// Background remote push. The local write already succeeded; failure
    /// here only surfaces through the status channel.
    fn spawn_sync(&self, entry: ScheduleEntry, op: SyncOperation) {
        let inner = self.inner.clone();
        inner.syncs_in_flight.fetch_add(1, Ordering::SeqCst);
        inner.status.send_modify(|s| s.is_syncing = true);

        tokio::spawn(async move {
            let result = inner.sync.sync(&entry, op).await;
            let remaining = inner.syncs_in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
            match result {
                Ok(outcome) => {
                    debug!(id = %entry.id, op = op.as_str(), ?outcome, "Sync push resolved");
                    inner.status.send_modify(|s| {
                        s.is_syncing = remaining > 0;
                        s.last_sync_time = Some(Utc::now());
                        s.error = None;
                    });
                }
                Err(e) => {
                    warn!(
                        id = %entry.id,
                        op = op.as_str(),
                        error = %e,
                        "Entry saved locally but not synced"
                    );
                    inner.status.send_modify(|s| {
                        s.is_syncing = remaining > 0;
                        s.error = Some(EngineError::SyncFailed(e.to_string()).to_string());
                    });
                }
            }
        });
    }
}

/// Patch one entry inside the schedule map, moving it between weeks when the
/// date changed. Returns the normalized updated entry.
fn apply_patch(
    schedule: &mut crate::models::WeeklySchedule,
    week_id: &str,
    id: &str,
    patch: &EntryPatch,
) -> Result<ScheduleEntry, EngineError> {
    let not_found = || EngineError::NotFound {
        week_id: week_id.to_string(),
        id: id.to_string(),
    };
    let week = schedule.get_mut(week_id).ok_or_else(not_found)?;
    let pos = week.iter().position(|e| e.id == id).ok_or_else(not_found)?;

    let mut entry = week.remove(pos);
    patch.apply(&mut entry);
    entry.normalize();

    if week.is_empty() && entry.week_id != week_id {
        schedule.remove(week_id);
    }
    let target = schedule.entry(entry.week_id.clone()).or_default();
    target.push(entry.clone());
    sort_entries(target);
    Ok(entry)
}

/// Remove one entry from its stated week, dropping the week when it ends up
/// empty. Returns the removed entry.
fn remove_entry(
    schedule: &mut crate::models::WeeklySchedule,
    week_id: &str,
    id: &str,
) -> Result<ScheduleEntry, EngineError> {
    let not_found = || EngineError::NotFound {
        week_id: week_id.to_string(),
        id: id.to_string(),
    };
    let week = schedule.get_mut(week_id).ok_or_else(not_found)?;
    let pos = week.iter().position(|e| e.id == id).ok_or_else(not_found)?;
    let removed = week.remove(pos);
    if week.is_empty() {
        schedule.remove(week_id);
    }
    Ok(removed)
}
