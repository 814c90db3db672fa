//! Score stage: evaluate a resolved rule set over persisted answers and
//! commit findings plus the roll-up score row.
//!
//! The ledger key carries the rule set version, so a report can be scored
//! once per `(name, version)` and re-published rule sets never rewrite
//! history for versions already applied.

use std::collections::HashMap;
use std::fmt;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use gaw_db::{
    insert_finding_or_coalesce_text, scoring_item_key, try_mark_processed, upsert_score,
    was_processed, MarkOutcome, NewFinding, NewScore, JOB_SCORING,
};
use gaw_rules::{evaluate, RuleDocument};

#[derive(Debug)]
pub enum ScoreError {
    /// Malformed rule material; the whole run must fail.
    Run(anyhow::Error),
    /// Per-item storage failure; counted, run continues.
    Item(anyhow::Error),
}

impl fmt::Display for ScoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreError::Run(e) | ScoreError::Item(e) => write!(f, "{e:#}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScoreOutcome {
    Scored { major_count: u32, minor_count: u32 },
    AlreadyProcessed,
    /// Preconditions not met; counted as skipped with a structured reason.
    NotEligible { reason: String },
}

/// Score one report against one rule document.
pub async fn score_report(
    pool: &PgPool,
    doc: &RuleDocument,
    report_id: &str,
    answers: &HashMap<String, Option<String>>,
    run_id: Uuid,
    scored_at: DateTime<Utc>,
    dry_run: bool,
) -> Result<ScoreOutcome, ScoreError> {
    if answers.is_empty() {
        return Ok(ScoreOutcome::NotEligible {
            reason: "no answers persisted for report".to_string(),
        });
    }
    if !answers.keys().any(|k| doc.eligibility_keys().contains(k)) {
        return Ok(ScoreOutcome::NotEligible {
            reason: format!(
                "no answer key overlaps rule set {} {}",
                doc.rule_set_name, doc.rule_set_version
            ),
        });
    }

    let item_key = scoring_item_key(report_id, &doc.rule_set_name, &doc.rule_set_version);

    // Evaluation is pure; a BadRule here means the document cache let a
    // malformed document through, which fails the run before any writes.
    let evaluation = evaluate(doc, answers).map_err(|e| ScoreError::Run(e.into()))?;

    if dry_run {
        let already = was_processed(pool, JOB_SCORING, &item_key)
            .await
            .map_err(ScoreError::Item)?;
        if already {
            return Ok(ScoreOutcome::AlreadyProcessed);
        }
        return Ok(ScoreOutcome::Scored {
            major_count: evaluation.major_count,
            minor_count: evaluation.minor_count,
        });
    }

    let mut tx = pool
        .begin()
        .await
        .context("score begin failed")
        .map_err(ScoreError::Item)?;

    let mark = try_mark_processed(&mut *tx, JOB_SCORING, &item_key, run_id)
        .await
        .map_err(ScoreError::Item)?;
    if mark == MarkOutcome::AlreadyProcessed {
        tx.rollback()
            .await
            .context("score rollback failed")
            .map_err(ScoreError::Item)?;
        return Ok(ScoreOutcome::AlreadyProcessed);
    }

    for finding in &evaluation.findings {
        insert_finding_or_coalesce_text(
            &mut *tx,
            &NewFinding {
                report_id: report_id.to_string(),
                rule_set_name: doc.rule_set_name.clone(),
                rule_set_version: doc.rule_set_version.clone(),
                question_key: finding.question_key.clone(),
                answer_value: finding.answer_value.clone(),
                severity: finding.severity.as_str().to_string(),
                finding_code: finding.code.clone(),
                major_non_compliant_text: finding.major_non_compliant_text.clone(),
                minor_non_compliant_text: finding.minor_non_compliant_text.clone(),
                score_run_id: run_id,
            },
        )
        .await
        .map_err(ScoreError::Item)?;
    }

    upsert_score(
        &mut *tx,
        &NewScore {
            report_id: report_id.to_string(),
            rule_set_name: doc.rule_set_name.clone(),
            rule_set_version: doc.rule_set_version.clone(),
            major_count: evaluation.major_count as i32,
            minor_count: evaluation.minor_count as i32,
            score_value: evaluation.score_value.clone(),
            outcome: evaluation.outcome.clone(),
            score_run_id: run_id,
            scored_at,
        },
    )
    .await
    .map_err(ScoreError::Item)?;

    tx.commit()
        .await
        .context("score commit failed")
        .map_err(ScoreError::Item)?;

    Ok(ScoreOutcome::Scored {
        major_count: evaluation.major_count,
        minor_count: evaluation.minor_count,
    })
}
