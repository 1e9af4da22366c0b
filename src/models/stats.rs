use serde::{Deserialize, Serialize};

/// Derived aggregate over one week's entries. Never persisted; recomputed on
/// demand and cached by content fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStats {
    /// Scheduled hours summed over non-cancelled entries.
    pub total_hours: f64,
    /// Worker-hours at or under the weekly overtime threshold.
    pub regular_hours: f64,
    /// Worker-hours beyond the threshold.
    pub overtime_hours: f64,
    pub completed_count: usize,
    pub pending_count: usize,
    pub hourly_job_count: usize,
    pub flat_rate_job_count: usize,
    pub total_hourly_amount: f64,
    pub total_flat_rate_amount: f64,
    pub total_bonuses: f64,
    pub total_deductions: f64,
    pub total_payroll: f64,
    /// Mean hourly rate across hourly entries, 0 when there are none.
    pub average_hourly_rate: f64,
    /// Completed entries as a percentage of non-cancelled entries.
    pub utilization_rate: f64,
}
