use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::week::{week_id_of, weekday_index};

/// Sentinel worker id substituted when an entry arrives with no assigned
/// workers. An entry is never persisted with an empty worker list.
pub const UNASSIGNED_WORKER: &str = "unassigned";

/// Default overtime pay multiplier when none is specified.
pub const DEFAULT_OVERTIME_MULTIPLIER: f64 = 1.5;

/// Lifecycle status of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Scheduled => "scheduled",
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Completed => "completed",
            EntryStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a status string, tolerating legacy spellings. Unknown values
    /// fall back to `Scheduled` rather than failing.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "in_progress" | "in-progress" | "inprogress" => EntryStatus::InProgress,
            "completed" | "complete" | "done" => EntryStatus::Completed,
            "cancelled" | "canceled" => EntryStatus::Cancelled,
            _ => EntryStatus::Scheduled,
        }
    }
}

/// How an entry is paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    #[default]
    Hourly,
    FlatRate,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Hourly => "hourly",
            PaymentType::FlatRate => "flat_rate",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "flat_rate" | "flat-rate" | "flatrate" | "flat" | "fixed" => PaymentType::FlatRate,
            _ => PaymentType::Hourly,
        }
    }
}

/// A single time-boxed work assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub client_id: String,
    pub location_id: String,
    /// Assigned workers. Never empty after normalization; the first element
    /// doubles as the legacy single-worker field on the wire.
    #[serde(default)]
    pub worker_ids: Vec<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub hours: f64,
    #[serde(default)]
    pub status: EntryStatus,
    /// Week partition key. Always `week_id_of(date)` after normalization;
    /// a mismatch is a data-integrity bug that gets corrected on write.
    #[serde(default)]
    pub week_id: String,
    #[serde(default)]
    pub payment_type: PaymentType,
    #[serde(default)]
    pub hourly_rate: f64,
    #[serde(default)]
    pub flat_rate_amount: f64,
    #[serde(default = "default_overtime_multiplier")]
    pub overtime_multiplier: f64,
    #[serde(default)]
    pub bonus: f64,
    #[serde(default)]
    pub deduction: f64,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_overtime_multiplier() -> f64 {
    DEFAULT_OVERTIME_MULTIPLIER
}

impl ScheduleEntry {
    /// Create a minimal entry with defaults for the optional fields.
    pub fn new(id: impl Into<String>, client_id: impl Into<String>, location_id: impl Into<String>, date: NaiveDate) -> Self {
        let date_week = week_id_of(date);
        Self {
            id: id.into(),
            client_id: client_id.into(),
            location_id: location_id.into(),
            worker_ids: vec![UNASSIGNED_WORKER.to_string()],
            date,
            start_time: None,
            end_time: None,
            hours: 0.0,
            status: EntryStatus::Scheduled,
            week_id: date_week,
            payment_type: PaymentType::Hourly,
            hourly_rate: 0.0,
            flat_rate_amount: 0.0,
            overtime_multiplier: DEFAULT_OVERTIME_MULTIPLIER,
            bonus: 0.0,
            deduction: 0.0,
            notes: None,
            updated_at: Utc::now(),
        }
    }

    /// Legacy single-worker alias: the first of the worker list.
    pub fn primary_worker(&self) -> Option<&str> {
        self.worker_ids.first().map(|w| w.as_str())
    }

    /// Zero-based weekday of the entry's date (Monday = 0).
    pub fn weekday(&self) -> u32 {
        weekday_index(self.date)
    }

    /// True when the entry lacks the identity fields a stored entry must
    /// carry. Such entries are filtered out on load rather than failing it.
    pub fn missing_identity(&self) -> bool {
        self.id.is_empty() || self.client_id.is_empty() || self.location_id.is_empty()
    }

    /// The payment amount that feeds the stats-cache fingerprint.
    pub fn fingerprint_amount(&self) -> f64 {
        match self.payment_type {
            PaymentType::Hourly => self.hourly_rate,
            PaymentType::FlatRate => self.flat_rate_amount,
        }
    }

    /// Enforce the entry invariants in place:
    /// - `week_id` always equals `week_id_of(date)`
    /// - worker list is never empty (sentinel substituted)
    /// - numeric fields are never negative
    /// - overtime multiplier is at least 1.0
    pub fn normalize(&mut self) {
        let computed = week_id_of(self.date);
        if self.week_id != computed {
            if !self.week_id.is_empty() {
                tracing::debug!(
                    id = %self.id,
                    stored = %self.week_id,
                    computed = %computed,
                    "correcting week id mismatch"
                );
            }
            self.week_id = computed;
        }

        self.worker_ids.retain(|w| !w.trim().is_empty());
        if self.worker_ids.is_empty() {
            self.worker_ids.push(UNASSIGNED_WORKER.to_string());
        }

        self.hours = self.hours.max(0.0);
        self.hourly_rate = self.hourly_rate.max(0.0);
        self.flat_rate_amount = self.flat_rate_amount.max(0.0);
        self.bonus = self.bonus.max(0.0);
        self.deduction = self.deduction.max(0.0);
        self.overtime_multiplier = self.overtime_multiplier.max(1.0);
    }
}

/// Partial update for a schedule entry. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryPatch {
    pub client_id: Option<String>,
    pub location_id: Option<String>,
    pub worker_ids: Option<Vec<String>>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<Option<String>>,
    pub end_time: Option<Option<String>>,
    pub hours: Option<f64>,
    pub status: Option<EntryStatus>,
    pub payment_type: Option<PaymentType>,
    pub hourly_rate: Option<f64>,
    pub flat_rate_amount: Option<f64>,
    pub overtime_multiplier: Option<f64>,
    pub bonus: Option<f64>,
    pub deduction: Option<f64>,
    pub notes: Option<Option<String>>,
}

impl EntryPatch {
    /// Apply the patch to an entry. The caller is expected to re-normalize
    /// afterwards since a date change moves the entry to another week.
    pub fn apply(&self, entry: &mut ScheduleEntry) {
        if let Some(v) = &self.client_id {
            entry.client_id = v.clone();
        }
        if let Some(v) = &self.location_id {
            entry.location_id = v.clone();
        }
        if let Some(v) = &self.worker_ids {
            entry.worker_ids = v.clone();
        }
        if let Some(v) = self.date {
            entry.date = v;
        }
        if let Some(v) = &self.start_time {
            entry.start_time = v.clone();
        }
        if let Some(v) = &self.end_time {
            entry.end_time = v.clone();
        }
        if let Some(v) = self.hours {
            entry.hours = v;
        }
        if let Some(v) = self.status {
            entry.status = v;
        }
        if let Some(v) = self.payment_type {
            entry.payment_type = v;
        }
        if let Some(v) = self.hourly_rate {
            entry.hourly_rate = v;
        }
        if let Some(v) = self.flat_rate_amount {
            entry.flat_rate_amount = v;
        }
        if let Some(v) = self.overtime_multiplier {
            entry.overtime_multiplier = v;
        }
        if let Some(v) = self.bonus {
            entry.bonus = v;
        }
        if let Some(v) = self.deduction {
            entry.deduction = v;
        }
        if let Some(v) = &self.notes {
            entry.notes = v.clone();
        }
        entry.updated_at = Utc::now();
    }
}

/// Sort a week's entries in display order: weekday, then start time, then id
/// as a stable tiebreaker.
pub fn sort_entries(entries: &mut [ScheduleEntry]) {
    entries.sort_by(|a, b| {
        a.weekday()
            .cmp(&b.weekday())
            .then_with(|| a.start_time.cmp(&b.start_time))
            .then_with(|| a.id.cmp(&b.id))
    });
}
