use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{ScheduleEntry, WeeklySchedule};

/// Bumped whenever the entry shape changes. Old document versions are
/// abandoned on disk rather than migrated in place.
pub const SCHEMA_VERSION: u32 = 3;

/// On-disk envelope for the schedule document.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    weeks: WeeklySchedule,
}

/// Durable key-value persistence for the full weekly schedule, serialized as
/// one JSON document. Sole owner of authoritative client-side state; the
/// memory cache is a disposable projection over it.
pub struct LocalStore {
    storage_dir: PathBuf,
    saves: AtomicU64,
}

impl LocalStore {
    pub fn new(storage_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&storage_dir)
            .with_context(|| format!("Failed to create storage dir: {}", storage_dir.display()))?;
        Ok(Self {
            storage_dir,
            saves: AtomicU64::new(0),
        })
    }

    fn document_path(&self) -> PathBuf {
        self.storage_dir
            .join(format!("schedule_v{}.json", SCHEMA_VERSION))
    }

    /// Load the full schedule. Corrupt data is treated as absence, never an
    /// error: a missing or unparsable document yields an empty map, and
    /// entries missing required identity fields are filtered out silently.
    pub fn load_all(&self) -> WeeklySchedule {
        let path = self.document_path();
        if !path.exists() {
            return WeeklySchedule::new();
        }

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read schedule document, treating as empty");
                return WeeklySchedule::new();
            }
        };

        let document: StoredDocument = match serde_json::from_str(&contents) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt schedule document, treating as empty");
                return WeeklySchedule::new();
            }
        };

        let mut weeks = document.weeks;
        for (week_id, entries) in weeks.iter_mut() {
            let before = entries.len();
            entries.retain(|e: &ScheduleEntry| !e.missing_identity());
            if entries.len() < before {
                debug!(
                    week_id = %week_id,
                    dropped = before - entries.len(),
                    "Filtered entries missing identity fields"
                );
            }
        }
        weeks.retain(|_, entries| !entries.is_empty());
        weeks
    }

    /// Overwrite the whole document. After writing, a read-back verification
    /// runs; a verification failure is logged but not fatal since in-memory
    /// state stays authoritative for the session.
    pub fn save_all(&self, schedule: &WeeklySchedule) -> Result<()> {
        let document = StoredDocument {
            schema_version: SCHEMA_VERSION,
            weeks: schedule.clone(),
        };
        let path = self.document_path();
        let contents = serde_json::to_string_pretty(&document)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write schedule document: {}", path.display()))?;
        self.saves.fetch_add(1, Ordering::Relaxed);

        self.verify_saved(schedule);
        Ok(())
    }

    fn verify_saved(&self, expected: &WeeklySchedule) {
        let reloaded = self.load_all();
        let expected_count: usize = expected.values().map(Vec::len).sum();
        let actual_count: usize = reloaded.values().map(Vec::len).sum();
        if expected_count != actual_count {
            warn!(
                expected = expected_count,
                actual = actual_count,
                "Save verification mismatch, in-memory state remains authoritative"
            );
        }
    }

    /// Number of completed writes. Used by tests and coalescing diagnostics.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn storage_dir(&self) -> &PathBuf {
        &self.storage_dir
    }
}
