//! Entry codec: mapping between the semantic `ScheduleEntry` and the remote
//! table's row shape.
//!
//! Both directions are total functions. Decoding applies field defaults,
//! coerces numeric-looking strings to numbers, and reconciles the legacy
//! single-worker column with the worker-list column. The round trip
//! `from_wire(to_wire(e))` preserves id, workers, hours, payment type and
//! amounts for every normalized entry.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{
    EntryStatus, PaymentType, ScheduleEntry, DEFAULT_OVERTIME_MULTIPLIER, UNASSIGNED_WORKER,
};
use super::week::week_id_of;

/// A numeric wire field that some producers send as a string.
/// `"12.5"` and `12.5` decode identically; anything unparsable reads as zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Num(f64),
    Text(String),
}

impl Numeric {
    /// Coerced value, clamped non-negative.
    pub fn value(&self) -> f64 {
        let raw = match self {
            Numeric::Num(n) => *n,
            Numeric::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        };
        if raw.is_finite() {
            raw.max(0.0)
        } else {
            0.0
        }
    }
}

impl Default for Numeric {
    fn default() -> Self {
        Numeric::Num(0.0)
    }
}

impl From<f64> for Numeric {
    fn from(n: f64) -> Self {
        Numeric::Num(n)
    }
}

/// One row of the remote `schedule_entries` table. Column names are
/// snake_case; camelCase aliases cover rows written by the legacy client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireRecord {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "clientId", default)]
    pub client_id: String,
    #[serde(alias = "locationId", default)]
    pub location_id: String,
    /// Multi-worker column. Wins over `worker_id` when both are present.
    #[serde(alias = "workerIds", alias = "assignedWorkers", default)]
    pub worker_ids: Vec<String>,
    /// Legacy single-worker column, kept as "first of the list" on encode.
    #[serde(alias = "workerId", default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(alias = "startTime", default)]
    pub start_time: Option<String>,
    #[serde(alias = "endTime", default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub hours: Numeric,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(alias = "weekId", default)]
    pub week_id: Option<String>,
    #[serde(alias = "paymentType", default)]
    pub payment_type: Option<String>,
    #[serde(alias = "hourlyRate", default)]
    pub hourly_rate: Option<Numeric>,
    #[serde(alias = "flatRateAmount", default)]
    pub flat_rate_amount: Numeric,
    #[serde(alias = "overtimeMultiplier", default)]
    pub overtime_multiplier: Option<Numeric>,
    #[serde(default)]
    pub bonus: Numeric,
    #[serde(default)]
    pub deduction: Numeric,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(alias = "updatedAt", default)]
    pub updated_at: Option<String>,
}

/// Encode an entry as a wire row. Total: never fails.
pub fn to_wire(entry: &ScheduleEntry) -> WireRecord {
    WireRecord {
        id: entry.id.clone(),
        client_id: entry.client_id.clone(),
        location_id: entry.location_id.clone(),
        worker_ids: entry.worker_ids.clone(),
        worker_id: entry.primary_worker().map(|w| w.to_string()),
        date: Some(entry.date.format("%Y-%m-%d").to_string()),
        start_time: entry.start_time.clone(),
        end_time: entry.end_time.clone(),
        hours: entry.hours.into(),
        status: Some(entry.status.as_str().to_string()),
        week_id: Some(entry.week_id.clone()),
        payment_type: Some(entry.payment_type.as_str().to_string()),
        hourly_rate: Some(entry.hourly_rate.into()),
        flat_rate_amount: entry.flat_rate_amount.into(),
        overtime_multiplier: Some(entry.overtime_multiplier.into()),
        bonus: entry.bonus.into(),
        deduction: entry.deduction.into(),
        notes: entry.notes.clone(),
        updated_at: Some(entry.updated_at.to_rfc3339()),
    }
}

/// Decode a wire row into a normalized entry. Total: malformed fields fall
/// back to defaults instead of failing, and the week id is recomputed from
/// the date regardless of what the row claims.
pub fn from_wire(record: WireRecord) -> ScheduleEntry {
    let date = record
        .date
        .as_deref()
        .and_then(parse_wire_date)
        .unwrap_or_else(|| Utc::now().date_naive());

    // Worker pair reconciliation: the list wins; fall back to the legacy
    // single-worker column; an empty pair gets the sentinel.
    let mut worker_ids: Vec<String> = record
        .worker_ids
        .into_iter()
        .filter(|w| !w.trim().is_empty())
        .collect();
    if worker_ids.is_empty() {
        if let Some(w) = record.worker_id.filter(|w| !w.trim().is_empty()) {
            worker_ids.push(w);
        }
    }
    if worker_ids.is_empty() {
        worker_ids.push(UNASSIGNED_WORKER.to_string());
    }

    let updated_at = record
        .updated_at
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut entry = ScheduleEntry {
        id: record.id,
        client_id: record.client_id,
        location_id: record.location_id,
        worker_ids,
        date,
        start_time: record.start_time,
        end_time: record.end_time,
        hours: record.hours.value(),
        status: record
            .status
            .as_deref()
            .map(EntryStatus::parse)
            .unwrap_or_default(),
        week_id: week_id_of(date),
        payment_type: record
            .payment_type
            .as_deref()
            .map(PaymentType::parse)
            .unwrap_or_default(),
        hourly_rate: record.hourly_rate.map(|n| n.value()).unwrap_or(0.0),
        flat_rate_amount: record.flat_rate_amount.value(),
        overtime_multiplier: record
            .overtime_multiplier
            .map(|n| n.value())
            .unwrap_or(DEFAULT_OVERTIME_MULTIPLIER),
        bonus: record.bonus.value(),
        deduction: record.deduction.value(),
        notes: record.notes,
        updated_at,
    };
    entry.normalize();
    entry
}

/// Dates arrive as `YYYY-MM-DD` or as a full RFC 3339 timestamp.
fn parse_wire_date(s: &str) -> Option<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> ScheduleEntry {
        let mut entry = ScheduleEntry::new(
            "e1",
            "client-7",
            "loc-3",
            NaiveDate::from_ymd_opt(2026, 8, 26).expect("valid date"),
        );
        entry.worker_ids = vec!["w1".to_string(), "w2".to_string()];
        entry.hours = 7.5;
        entry.status = EntryStatus::InProgress;
        entry.payment_type = PaymentType::FlatRate;
        entry.hourly_rate = 22.0;
        entry.flat_rate_amount = 300.0;
        entry.bonus = 10.0;
        entry.normalize();
        entry
    }

    #[test]
    fn test_round_trip_preserves_semantic_fields() {
        let entry = sample_entry();
        let decoded = from_wire(to_wire(&entry));
        assert_eq!(decoded.id, entry.id);
        assert_eq!(decoded.worker_ids, entry.worker_ids);
        assert_eq!(decoded.hours, entry.hours);
        assert_eq!(decoded.payment_type, entry.payment_type);
        assert_eq!(decoded.hourly_rate, entry.hourly_rate);
        assert_eq!(decoded.flat_rate_amount, entry.flat_rate_amount);
        assert_eq!(decoded.bonus, entry.bonus);
        assert_eq!(decoded.week_id, entry.week_id);
        assert_eq!(decoded.date, entry.date);
    }

    #[test]
    fn test_encode_keeps_legacy_worker_column_in_step() {
        let entry = sample_entry();
        let record = to_wire(&entry);
        assert_eq!(record.worker_id.as_deref(), Some("w1"));
        assert_eq!(record.worker_ids, vec!["w1", "w2"]);
    }

    #[test]
    fn test_decode_numeric_strings() {
        let json = r#"{
            "id": "e2",
            "client_id": "c1",
            "location_id": "l1",
            "date": "2026-08-25",
            "hours": "6.5",
            "hourlyRate": "18",
            "workerId": "w9"
        }"#;
        let record: WireRecord = serde_json::from_str(json).expect("wire record parses");
        let entry = from_wire(record);
        assert_eq!(entry.hours, 6.5);
        assert_eq!(entry.hourly_rate, 18.0);
        assert_eq!(entry.worker_ids, vec!["w9"]);
        assert_eq!(entry.payment_type, PaymentType::Hourly); // default
    }

    #[test]
    fn test_decode_defaults_and_sentinel_worker() {
        let record = WireRecord {
            id: "e3".to_string(),
            client_id: "c".to_string(),
            location_id: "l".to_string(),
            date: Some("2026-08-24".to_string()),
            ..Default::default()
        };
        let entry = from_wire(record);
        assert_eq!(entry.worker_ids, vec![UNASSIGNED_WORKER]);
        assert_eq!(entry.payment_type, PaymentType::Hourly);
        assert_eq!(entry.overtime_multiplier, DEFAULT_OVERTIME_MULTIPLIER);
        assert_eq!(entry.week_id, "2026-08-24");
    }

    #[test]
    fn test_decode_recomputes_week_id_over_stored_one() {
        let record = WireRecord {
            id: "e4".to_string(),
            client_id: "c".to_string(),
            location_id: "l".to_string(),
            date: Some("2026-08-26".to_string()),
            week_id: Some("1999-01-04".to_string()),
            ..Default::default()
        };
        let entry = from_wire(record);
        assert_eq!(entry.week_id, "2026-08-24");
    }

    #[test]
    fn test_decode_negative_numbers_clamped() {
        let record = WireRecord {
            id: "e5".to_string(),
            client_id: "c".to_string(),
            location_id: "l".to_string(),
            date: Some("2026-08-26".to_string()),
            hours: Numeric::Num(-3.0),
            flat_rate_amount: Numeric::Text("-50".to_string()),
            ..Default::default()
        };
        let entry = from_wire(record);
        assert_eq!(entry.hours, 0.0);
        assert_eq!(entry.flat_rate_amount, 0.0);
    }
}
