//! Domain types for the schedule engine.
//!
//! This module contains the data structures the engine moves around:
//!
//! - `ScheduleEntry`, `EntryPatch`: a work assignment and its partial update
//! - `EntryStatus`, `PaymentType`: lifecycle and pay classification
//! - `WireRecord` plus `to_wire`/`from_wire`: the remote row codec
//! - `ScheduleStats`: the derived weekly aggregate
//! - week-id helpers: Monday-anchored partition key math

mod entry;
mod stats;
pub mod week;
pub mod wire;

pub use entry::{
    sort_entries, EntryPatch, EntryStatus, PaymentType, ScheduleEntry,
    DEFAULT_OVERTIME_MULTIPLIER, UNASSIGNED_WORKER,
};
pub use stats::ScheduleStats;
pub use week::{current_week_id, week_id_of, weekday_index};
pub use wire::{from_wire, to_wire, WireRecord};

use std::collections::BTreeMap;

/// The full client-side schedule: week id mapped to that week's entries,
/// ordered by weekday then start time.
pub type WeeklySchedule = BTreeMap<String, Vec<ScheduleEntry>>;
