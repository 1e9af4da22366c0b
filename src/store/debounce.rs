use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::WeeklySchedule;

use super::LocalStore;

/// Coalesces rapid successive saves into one write after a short quiet
/// period, bounding I/O volume. Entry mutations use the store's immediate
/// save instead; this path serves bursts such as bulk updates.
pub struct DebouncedSaver {
    store: Arc<LocalStore>,
    delay: Duration,
    pending: Mutex<PendingSave>,
}

#[derive(Default)]
struct PendingSave {
    timer: Option<JoinHandle<()>>,
    latest: Option<Arc<WeeklySchedule>>,
}

impl DebouncedSaver {
    pub fn new(store: Arc<LocalStore>, delay_ms: u64) -> Self {
        Self {
            store,
            delay: Duration::from_millis(delay_ms),
            pending: Mutex::new(PendingSave::default()),
        }
    }

    /// Schedule a save of this snapshot. A save already pending is replaced:
    /// only the most recent snapshot within a quiet period hits disk.
    pub async fn schedule(&self, schedule: WeeklySchedule) {
        let snapshot = Arc::new(schedule);
        let mut pending = self.pending.lock().await;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
            debug!("Replaced pending debounced save");
        }
        pending.latest = Some(snapshot.clone());

        let store = self.store.clone();
        let delay = self.delay;
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = store.save_all(&snapshot) {
                warn!(error = %e, "Debounced save failed");
            }
        }));
    }

    /// Write any pending snapshot immediately, cancelling the quiet-period
    /// timer. Used before returns that must not leave data only in memory.
    pub async fn flush(&self) {
        let mut pending = self.pending.lock().await;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        if let Some(snapshot) = pending.latest.take() {
            if let Err(e) = self.store.save_all(&snapshot) {
                warn!(error = %e, "Flush save failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScheduleEntry;
    use chrono::NaiveDate;

    fn schedule_with(ids: &[&str]) -> WeeklySchedule {
        let mut schedule = WeeklySchedule::new();
        let entries = ids
            .iter()
            .map(|id| {
                let mut e = ScheduleEntry::new(
                    *id,
                    "c1",
                    "l1",
                    NaiveDate::from_ymd_opt(2026, 8, 26).expect("valid date"),
                );
                e.normalize();
                e
            })
            .collect();
        schedule.insert("2026-08-24".to_string(), entries);
        schedule
    }

    #[tokio::test]
    async fn test_rapid_saves_coalesce_into_one_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).expect("store"));
        let saver = DebouncedSaver::new(store.clone(), 50);

        saver.schedule(schedule_with(&["e1"])).await;
        saver.schedule(schedule_with(&["e1", "e2"])).await;
        saver.schedule(schedule_with(&["e1", "e2", "e3"])).await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.save_count(), 1);
        let loaded = store.load_all();
        assert_eq!(loaded.get("2026-08-24").map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_flush_writes_pending_snapshot_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).expect("store"));
        let saver = DebouncedSaver::new(store.clone(), 10_000);

        saver.schedule(schedule_with(&["e1"])).await;
        saver.flush().await;

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load_all().get("2026-08-24").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::new(dir.path().to_path_buf()).expect("store"));
        let saver = DebouncedSaver::new(store.clone(), 50);
        saver.flush().await;
        assert_eq!(store.save_count(), 0);
    }
}
