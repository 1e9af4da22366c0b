//! In-memory cache layer over the local durable store.
//!
//! Two cache families: per-week entry caches and fingerprinted stats caches,
//! plus a monotonically increasing version counter bumped on every mutation.
//! The cache is a disposable projection - `invalidate_all` is the only
//! sanctioned way to guarantee freshness after a structural change, since
//! partial invalidation has proven unreliable in this engine's history.

use std::collections::HashMap;

use tracing::debug;

use crate::models::{ScheduleEntry, ScheduleStats};

#[derive(Default)]
pub struct MemoryCache {
    weeks: HashMap<String, Vec<ScheduleEntry>>,
    stats: HashMap<String, ScheduleStats>,
    version: u64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_week(&self, week_id: &str) -> Option<Vec<ScheduleEntry>> {
        self.weeks.get(week_id).cloned()
    }

    pub fn put_week(&mut self, week_id: &str, entries: Vec<ScheduleEntry>) {
        self.weeks.insert(week_id.to_string(), entries);
    }

    pub fn get_stats(&self, fingerprint: &str) -> Option<ScheduleStats> {
        self.stats.get(fingerprint).cloned()
    }

    pub fn put_stats(&mut self, fingerprint: &str, stats: ScheduleStats) {
        self.stats.insert(fingerprint.to_string(), stats);
    }

    /// Record a mutation: bump the version counter and drop derived stats,
    /// which are cheap to recompute and easy to leave stale.
    pub fn note_mutation(&mut self) {
        self.version += 1;
        self.stats.clear();
    }

    /// Clear every cache and bump the version counter.
    pub fn invalidate_all(&mut self) {
        let weeks = self.weeks.len();
        let stats = self.stats.len();
        self.weeks.clear();
        self.stats.clear();
        self.version += 1;
        debug!(
            weeks_dropped = weeks,
            stats_dropped = stats,
            version = self.version,
            "Invalidated all caches"
        );
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Fingerprint of a week's entries: each contributing entry's mutable fields
/// (id, status, hours, payment type, amount), sorted and joined. Two entry
/// sets with equal fingerprints produce equal stats.
pub fn fingerprint(entries: &[ScheduleEntry]) -> String {
    let mut parts: Vec<String> = entries
        .iter()
        .map(|e| {
            format!(
                "{}:{}:{}:{}:{}",
                e.id,
                e.status.as_str(),
                e.hours,
                e.payment_type.as_str(),
                e.fingerprint_amount()
            )
        })
        .collect();
    parts.sort();
    parts.join("|")
}
