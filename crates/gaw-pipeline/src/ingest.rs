//! Ingest stage: one transaction per selected item, ledger first.
//!
//! The caller (orchestrator) owns eligibility and batch selection; this
//! stage only commits items and reports what it managed. The watermark is
//! advanced by the orchestrator, and only when no item here failed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use gaw_db::{insert_report, try_mark_processed, MarkOutcome, NewReport, JOB_INGESTION};

use crate::summary::SummaryItem;

/// Loosely-typed metadata lifted off the summary record into the optional
/// report columns, when the provider happens to send it.
fn metadata_field(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        raw.get(k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn new_report(item: &SummaryItem, run_id: Uuid) -> NewReport {
    NewReport {
        report_id: item.report_id.clone(),
        completed_at: item.completed_at,
        certification_number: item.certification_number.clone(),
        ingest_run_id: run_id,
        rule_set_name: metadata_field(&item.raw, &["RuleSet", "RuleSetName", "rule_set"]),
        technology_type: metadata_field(
            &item.raw,
            &["Technology_Type", "TechnologyType", "Technology", "technology"],
        ),
        assessment_type: metadata_field(
            &item.raw,
            &["Assessment_Type", "AssessmentType", "assessment"],
        ),
        template_name: metadata_field(
            &item.raw,
            &["Template_Name", "TemplateName", "Checklist", "checklist_name"],
        ),
    }
}

#[derive(Debug, Default, Clone)]
pub struct IngestOutcome {
    pub ingested: u64,
    pub already_processed: u64,
    pub failed: u64,
    /// Items whose transaction rolled back; excluded from downstream work.
    pub failed_ids: Vec<String>,
    /// Greatest committed completion instant; drives watermark advancement.
    pub max_committed: Option<DateTime<Utc>>,
}

/// Commit each selected item in its own transaction: ledger insert first,
/// then the report row. A ledger collision means a concurrent or earlier
/// run owns the item; nothing else is written for it.
pub async fn ingest_batch(
    pool: &PgPool,
    items: &[SummaryItem],
    run_id: Uuid,
    dry_run: bool,
) -> Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();

    for item in items {
        if dry_run {
            // Eligibility already consulted the ledger; count the write
            // that would have happened.
            outcome.ingested += 1;
            outcome.max_committed = Some(
                outcome
                    .max_committed
                    .map_or(item.completed_at, |m| m.max(item.completed_at)),
            );
            continue;
        }

        match ingest_one(pool, item, run_id).await {
            Ok(MarkOutcome::Marked) => {
                outcome.ingested += 1;
                outcome.max_committed = Some(
                    outcome
                        .max_committed
                        .map_or(item.completed_at, |m| m.max(item.completed_at)),
                );
            }
            Ok(MarkOutcome::AlreadyProcessed) => outcome.already_processed += 1,
            Err(err) => {
                outcome.failed += 1;
                outcome.failed_ids.push(item.report_id.clone());
                warn!(report_id = %item.report_id, error = %err, "ingest failed for item");
            }
        }
    }

    Ok(outcome)
}

async fn ingest_one(pool: &PgPool, item: &SummaryItem, run_id: Uuid) -> Result<MarkOutcome> {
    let mut tx = pool.begin().await?;
    let mark = try_mark_processed(&mut *tx, JOB_INGESTION, &item.report_id, run_id).await?;
    if mark == MarkOutcome::AlreadyProcessed {
        tx.rollback().await?;
        return Ok(MarkOutcome::AlreadyProcessed);
    }
    insert_report(&mut *tx, &new_report(item, run_id)).await?;
    tx.commit().await?;
    Ok(MarkOutcome::Marked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_lifting_is_tolerant() {
        let raw = json!({
            "ID": "R1",
            "Technology_Type": " Solar PV ",
            "Template_Name": "",
            "assessment": "Initial"
        });
        let item = SummaryItem {
            report_id: "R1".into(),
            completed_at: Utc::now(),
            certification_number: None,
            raw,
        };
        let report = new_report(&item, Uuid::new_v4());
        assert_eq!(report.technology_type.as_deref(), Some("Solar PV"));
        assert_eq!(report.assessment_type.as_deref(), Some("Initial"));
        assert_eq!(report.template_name, None, "empty strings do not count");
        assert_eq!(report.rule_set_name, None);
    }
}
