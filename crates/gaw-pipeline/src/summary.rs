//! Summary-payload handling: field extraction, eligibility, and batch
//! selection with tie expansion.
//!
//! Remote records are loosely typed; only the fields named here are ever
//! interpreted, and the full record is preserved as an opaque bag for the
//! ruleset resolver's heuristics.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Aliases accepted for the report identifier, in precedence order.
pub const REPORT_ID_ALIASES: [&str; 7] = [
    "ID",
    "Id",
    "auditId",
    "audit_id",
    "id",
    "reportId",
    "report_id",
];

/// Completion-timestamp fields, in precedence order.
const COMPLETED_AT_FIELDS: [&str; 3] = ["Updated_On", "EndTime", "Date"];

/// Known certification-number aliases.
pub const CERT_ALIASES: [&str; 7] = [
    "Certification_Number",
    "CertificationNumber",
    "certification_number",
    "Certificate_Number",
    "CertificateNumber",
    "CertNo",
    "cert_no",
];

/// One summary record with its typed extraction and the preserved raw bag.
#[derive(Debug, Clone)]
pub struct SummaryItem {
    pub report_id: String,
    pub completed_at: DateTime<Utc>,
    pub certification_number: Option<String>,
    pub raw: Value,
}

/// Scalar field as a trimmed string; numbers coerce (audit ids are numeric
/// in some tenant configurations).
fn field_string(record: &Value, key: &str) -> Option<String> {
    let v = record.get(key)?;
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn first_field(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| field_string(record, k))
}

/// Parse a remote timestamp as UTC. The provider writes
/// `YYYY-MM-DD HH:MM:SS`; the space becomes `T` and a `Z` is appended
/// unless an offset is already present. Bare dates read as midnight.
pub fn parse_remote_instant(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let normalised = s.replacen(' ', "T", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalised) {
        return Some(dt.with_timezone(&Utc));
    }
    let mut with_zone = normalised.clone();
    with_zone.push('Z');
    if let Ok(dt) = DateTime::parse_from_rfc3339(&with_zone) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(&normalised, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    None
}

/// Extract the typed fields from one summary record. Records without both a
/// report id and a parseable completion instant are dropped by ingestion.
pub fn extract_summary_item(raw: &Value) -> Option<SummaryItem> {
    let report_id = first_field(raw, &REPORT_ID_ALIASES)?;
    let completed_at = COMPLETED_AT_FIELDS
        .iter()
        .find_map(|k| field_string(raw, k).as_deref().and_then(parse_remote_instant))?;
    Some(SummaryItem {
        report_id,
        completed_at,
        certification_number: first_field(raw, &CERT_ALIASES),
        raw: raw.clone(),
    })
}

/// Items inside `(lower, upper]` bounds. Items exactly at the lower bound
/// are kept: the watermark parks on the newest committed instant, and ties
/// at that instant must stay visible so an interrupted run can be resumed
/// through the ledger.
pub fn eligible_items(
    items: Vec<SummaryItem>,
    lower: DateTime<Utc>,
    upper: Option<DateTime<Utc>>,
) -> Vec<SummaryItem> {
    items
        .into_iter()
        .filter(|item| item.completed_at >= lower)
        .filter(|item| upper.map_or(true, |u| item.completed_at <= u))
        .collect()
}

/// Sort ascending by `(completed_at, report_id)`, take `batch_size`, then
/// widen to include every item tied on the last selected instant. Without
/// the widening a same-timestamp group could be split across runs and the
/// watermark would silently drop the unselected half.
pub fn select_batch(mut items: Vec<SummaryItem>, batch_size: usize) -> Vec<SummaryItem> {
    items.sort_by(|a, b| {
        a.completed_at
            .cmp(&b.completed_at)
            .then_with(|| a.report_id.cmp(&b.report_id))
    });
    if items.len() <= batch_size {
        return items;
    }
    let cutoff = items[batch_size - 1].completed_at;
    let end = items[batch_size..]
        .iter()
        .take_while(|item| item.completed_at == cutoff)
        .count()
        + batch_size;
    items.truncate(end);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, ts: &str) -> SummaryItem {
        SummaryItem {
            report_id: id.to_string(),
            completed_at: parse_remote_instant(ts).unwrap(),
            certification_number: None,
            raw: Value::Null,
        }
    }

    #[test]
    fn provider_timestamp_space_form_parses_as_utc() {
        let dt = parse_remote_instant("2024-08-01 10:00:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-08-01T10:00:00+00:00");
    }

    #[test]
    fn iso_and_date_only_forms_parse() {
        assert_eq!(
            parse_remote_instant("2024-08-01T10:00:00Z").unwrap().to_rfc3339(),
            "2024-08-01T10:00:00+00:00"
        );
        assert_eq!(
            parse_remote_instant("2024-08-01").unwrap().to_rfc3339(),
            "2024-08-01T00:00:00+00:00"
        );
        assert!(parse_remote_instant("01/08/2024").is_none());
        assert!(parse_remote_instant("").is_none());
    }

    #[test]
    fn id_aliases_and_numeric_ids_are_accepted() {
        let a = extract_summary_item(&json!({"ID": "R1", "Updated_On": "2024-08-01 10:00:00"}))
            .unwrap();
        assert_eq!(a.report_id, "R1");

        let b = extract_summary_item(&json!({"audit_id": 42, "EndTime": "2024-08-01 11:00:00"}))
            .unwrap();
        assert_eq!(b.report_id, "42");

        // Updated_On is preferred over the fallbacks.
        let c = extract_summary_item(&json!({
            "id": "R3",
            "Updated_On": "2024-08-01 10:00:00",
            "EndTime": "2024-08-02 10:00:00"
        }))
        .unwrap();
        assert_eq!(c.completed_at, parse_remote_instant("2024-08-01 10:00:00").unwrap());
    }

    #[test]
    fn records_without_id_or_instant_are_dropped() {
        assert!(extract_summary_item(&json!({"Updated_On": "2024-08-01 10:00:00"})).is_none());
        assert!(extract_summary_item(&json!({"ID": "R1"})).is_none());
        assert!(extract_summary_item(&json!({"ID": "R1", "Updated_On": "last tuesday"})).is_none());
        assert!(extract_summary_item(&json!({"ID": "", "Updated_On": "2024-08-01 10:00:00"}))
            .is_none());
    }

    #[test]
    fn cert_alias_is_picked_up() {
        let item = extract_summary_item(&json!({
            "ID": "R1",
            "Updated_On": "2024-08-01 10:00:00",
            "Certification_Number": "MCS-001"
        }))
        .unwrap();
        assert_eq!(item.certification_number.as_deref(), Some("MCS-001"));
    }

    #[test]
    fn bounds_keep_lower_edge_and_respect_upper() {
        let lower = parse_remote_instant("2024-08-01 10:00:00").unwrap();
        let upper = parse_remote_instant("2024-08-01 12:00:00");
        let kept = eligible_items(
            vec![
                item("old", "2024-08-01 09:59:59"),
                item("edge", "2024-08-01 10:00:00"),
                item("in", "2024-08-01 11:00:00"),
                item("late", "2024-08-01 12:00:01"),
            ],
            lower,
            upper,
        );
        let ids: Vec<_> = kept.iter().map(|i| i.report_id.as_str()).collect();
        assert_eq!(ids, ["edge", "in"]);
    }

    #[test]
    fn batch_selection_expands_timestamp_ties() {
        // batch_size = 2, but A/B/C share an instant: all three selected.
        let selected = select_batch(
            vec![
                item("D", "2024-08-01 10:00:01"),
                item("B", "2024-08-01 10:00:00"),
                item("C", "2024-08-01 10:00:00"),
                item("A", "2024-08-01 10:00:00"),
            ],
            2,
        );
        let ids: Vec<_> = selected.iter().map(|i| i.report_id.as_str()).collect();
        assert_eq!(ids, ["A", "B", "C"]);
    }

    #[test]
    fn batch_selection_without_ties_is_a_plain_prefix() {
        let selected = select_batch(
            vec![
                item("B", "2024-08-01 10:00:02"),
                item("A", "2024-08-01 10:00:01"),
                item("C", "2024-08-01 10:00:03"),
            ],
            2,
        );
        let ids: Vec<_> = selected.iter().map(|i| i.report_id.as_str()).collect();
        assert_eq!(ids, ["A", "B"]);
    }

    #[test]
    fn small_batches_pass_through() {
        let selected = select_batch(vec![item("A", "2024-08-01 10:00:00")], 50);
        assert_eq!(selected.len(), 1);
    }
}
