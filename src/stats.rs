//! Stats and pay calculator.
//!
//! Pure aggregation over one week's entries. Deterministic and
//! order-independent: the input is re-sorted internally before the
//! per-worker overtime ledger runs. Results are cached by the caller using
//! the fingerprint from the cache layer.

use std::collections::HashMap;

use crate::models::{EntryStatus, PaymentType, ScheduleEntry, ScheduleStats};

/// Weekly hours at or under which a worker's time is regular pay.
pub const DEFAULT_OVERTIME_THRESHOLD: f64 = 40.0;

/// A flat-rate entry's amount is split evenly across its co-assigned
/// workers. The shares always sum to the fixed amount; hours never enter
/// into it.
pub fn flat_rate_share(entry: &ScheduleEntry) -> f64 {
    let workers = entry.worker_ids.len().max(1);
    entry.flat_rate_amount / workers as f64
}

/// Compute the weekly aggregate with the default 40-hour overtime threshold.
pub fn compute_stats(entries: &[ScheduleEntry]) -> ScheduleStats {
    compute_stats_with_threshold(entries, DEFAULT_OVERTIME_THRESHOLD)
}

/// Compute the weekly aggregate.
///
/// Per entry: regular hours are the portion that keeps each assigned
/// worker's running weekly total at or under the threshold; the excess is
/// overtime paid at `hourly_rate * overtime_multiplier`. Flat-rate entries
/// contribute their fixed amount regardless of hours. Cancelled entries are
/// excluded entirely.
///
/// `total_hours` counts each entry's scheduled hours once, while
/// `regular_hours`/`overtime_hours` are worker-hours: an entry with two
/// assigned workers accrues its hours (and hourly pay) once per worker, so
/// their sum can exceed `total_hours`.
pub fn compute_stats_with_threshold(
    entries: &[ScheduleEntry],
    overtime_threshold: f64,
) -> ScheduleStats {
    // Fix an evaluation order so the per-worker running totals come out the
    // same no matter how the caller ordered the slice.
    let mut active: Vec<&ScheduleEntry> = entries
        .iter()
        .filter(|e| e.status != EntryStatus::Cancelled)
        .collect();
    active.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.start_time.cmp(&b.start_time))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut stats = ScheduleStats::default();
    let mut worker_hours: HashMap<&str, f64> = HashMap::new();
    let mut hourly_rate_sum = 0.0;

    for entry in &active {
        stats.total_hours += entry.hours;
        match entry.status {
            EntryStatus::Completed => stats.completed_count += 1,
            EntryStatus::Scheduled | EntryStatus::InProgress => stats.pending_count += 1,
            EntryStatus::Cancelled => {}
        }

        match entry.payment_type {
            PaymentType::Hourly => {
                stats.hourly_job_count += 1;
                hourly_rate_sum += entry.hourly_rate;

                for worker in &entry.worker_ids {
                    let prior = worker_hours.entry(worker.as_str()).or_insert(0.0);
                    let capacity = (overtime_threshold - *prior).max(0.0);
                    let regular = entry.hours.min(capacity);
                    let overtime = entry.hours - regular;
                    *prior += entry.hours;

                    stats.regular_hours += regular;
                    stats.overtime_hours += overtime;
                    stats.total_hourly_amount += regular * entry.hourly_rate
                        + overtime * entry.hourly_rate * entry.overtime_multiplier;
                }
            }
            PaymentType::FlatRate => {
                stats.flat_rate_job_count += 1;
                // The fixed amount, never multiplied by hours. Each
                // co-assigned worker earns an equal share; the shares sum
                // back to the entry's amount.
                let share = flat_rate_share(entry);
                stats.total_flat_rate_amount += share * entry.worker_ids.len().max(1) as f64;
            }
        }

        stats.total_bonuses += entry.bonus;
        stats.total_deductions += entry.deduction;
    }

    stats.total_payroll = stats.total_hourly_amount + stats.total_flat_rate_amount
        + stats.total_bonuses
        - stats.total_deductions;
    if stats.hourly_job_count > 0 {
        stats.average_hourly_rate = hourly_rate_sum / stats.hourly_job_count as f64;
    }
    let counted = stats.completed_count + stats.pending_count;
    if counted > 0 {
        stats.utilization_rate = stats.completed_count as f64 / counted as f64 * 100.0;
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, day).expect("valid test date")
    }

    fn hourly(id: &str, day: u32, hours: f64, rate: f64, worker: &str) -> ScheduleEntry {
        let mut e = ScheduleEntry::new(id, "c1", "l1", d(day));
        e.worker_ids = vec![worker.to_string()];
        e.hours = hours;
        e.hourly_rate = rate;
        e.normalize();
        e
    }

    fn flat(id: &str, day: u32, amount: f64, workers: &[&str]) -> ScheduleEntry {
        let mut e = ScheduleEntry::new(id, "c1", "l1", d(day));
        e.worker_ids = workers.iter().map(|w| w.to_string()).collect();
        e.payment_type = PaymentType::FlatRate;
        e.flat_rate_amount = amount;
        e.hours = 3.0; // must not affect flat-rate pay
        e.normalize();
        e
    }

    #[test]
    fn test_single_hourly_entry_scenario() {
        let entries = vec![hourly("e1", 24, 10.0, 20.0, "w1")];
        let stats = compute_stats(&entries);
        assert_eq!(stats.total_hours, 10.0);
        assert_eq!(stats.total_hourly_amount, 200.0);
        assert_eq!(stats.total_flat_rate_amount, 0.0);
        assert_eq!(stats.total_payroll, 200.0);
    }

    #[test]
    fn test_overtime_splits_at_threshold() {
        // 25h + 20h in the same week: 40 regular, 5 overtime at 1.5x
        let entries = vec![
            hourly("e1", 24, 25.0, 20.0, "w1"),
            hourly("e2", 26, 20.0, 20.0, "w1"),
        ];
        let stats = compute_stats(&entries);
        assert_eq!(stats.regular_hours, 40.0);
        assert_eq!(stats.overtime_hours, 5.0);
        // 40 * 20 + 5 * 20 * 1.5
        assert_eq!(stats.total_hourly_amount, 950.0);
    }

    #[test]
    fn test_overtime_is_order_independent() {
        let a = hourly("e1", 24, 25.0, 20.0, "w1");
        let b = hourly("e2", 26, 20.0, 20.0, "w1");
        let forward = compute_stats(&[a.clone(), b.clone()]);
        let reverse = compute_stats(&[b, a]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_overtime_tracked_per_worker() {
        // Two different workers each stay under the threshold
        let entries = vec![
            hourly("e1", 24, 25.0, 20.0, "w1"),
            hourly("e2", 26, 20.0, 20.0, "w2"),
        ];
        let stats = compute_stats(&entries);
        assert_eq!(stats.regular_hours, 45.0);
        assert_eq!(stats.overtime_hours, 0.0);
    }

    #[test]
    fn test_flat_rate_not_multiplied_by_hours() {
        let entries = vec![flat("e1", 24, 120.0, &["w1"])];
        let stats = compute_stats(&entries);
        // 120, not 120 * 3 hours
        assert_eq!(stats.total_flat_rate_amount, 120.0);
        assert_eq!(stats.total_payroll, 120.0);
    }

    #[test]
    fn test_flat_rate_split_sums_to_amount() {
        let entry = flat("e1", 24, 120.0, &["w1", "w2"]);
        assert_eq!(flat_rate_share(&entry), 60.0);
        let n = entry.worker_ids.len() as f64;
        assert_eq!(flat_rate_share(&entry) * n, entry.flat_rate_amount);

        let solo = flat("e2", 25, 120.0, &["w1"]);
        assert_eq!(flat_rate_share(&solo), 120.0);
    }

    #[test]
    fn test_multi_worker_hourly_entry_accrues_worker_hours() {
        // One 10h entry with two workers: scheduled hours count once, but
        // each worker's ledger (and pay) accrues the full 10h.
        let mut e = hourly("e1", 24, 10.0, 20.0, "w1");
        e.worker_ids = vec!["w1".to_string(), "w2".to_string()];
        let stats = compute_stats(&[e]);
        assert_eq!(stats.total_hours, 10.0);
        assert_eq!(stats.regular_hours, 20.0);
        assert_eq!(stats.overtime_hours, 0.0);
        assert_eq!(stats.total_hourly_amount, 400.0);
    }

    #[test]
    fn test_cancelled_entries_excluded() {
        let mut cancelled = hourly("e1", 24, 10.0, 20.0, "w1");
        cancelled.status = EntryStatus::Cancelled;
        let entries = vec![cancelled, hourly("e2", 25, 5.0, 20.0, "w1")];
        let stats = compute_stats(&entries);
        assert_eq!(stats.total_hours, 5.0);
        assert_eq!(stats.hourly_job_count, 1);
    }

    #[test]
    fn test_bonus_and_deduction_roll_into_payroll() {
        let mut e = hourly("e1", 24, 10.0, 20.0, "w1");
        e.bonus = 50.0;
        e.deduction = 30.0;
        let stats = compute_stats(&[e]);
        assert_eq!(stats.total_payroll, 220.0);
    }

    #[test]
    fn test_utilization_and_average_rate() {
        let mut done = hourly("e1", 24, 8.0, 30.0, "w1");
        done.status = EntryStatus::Completed;
        let entries = vec![done, hourly("e2", 25, 8.0, 10.0, "w1")];
        let stats = compute_stats(&entries);
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.utilization_rate, 50.0);
        assert_eq!(stats.average_hourly_rate, 20.0);
    }

    #[test]
    fn test_empty_input_yields_default() {
        assert_eq!(compute_stats(&[]), ScheduleStats::default());
    }
}
