//! Domain rows: reports, answers, findings, scores.
//!
//! Write paths are shaped for the per-item transaction discipline: the
//! stage opens a transaction, marks the ledger, then calls these with the
//! transaction connection. Duplicate-key handling is part of the contract
//! (answers are insert-if-absent, finding text back-fills via coalesce,
//! scores overwrite).

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewReport {
    pub report_id: String,
    pub completed_at: DateTime<Utc>,
    pub certification_number: Option<String>,
    pub ingest_run_id: Uuid,
    pub rule_set_name: Option<String>,
    pub technology_type: Option<String>,
    pub assessment_type: Option<String>,
    pub template_name: Option<String>,
}

pub async fn insert_report(conn: &mut PgConnection, report: &NewReport) -> Result<()> {
    sqlx::query(
        r#"
        insert into reports (
            report_id, completed_at, certification_number, ingest_run_id,
            rule_set_name, technology_type, assessment_type, template_name
        ) values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&report.report_id)
    .bind(report.completed_at)
    .bind(&report.certification_number)
    .bind(report.ingest_run_id)
    .bind(&report.rule_set_name)
    .bind(&report.technology_type)
    .bind(&report.assessment_type)
    .bind(&report.template_name)
    .execute(&mut *conn)
    .await
    .context("insert_report failed")?;
    Ok(())
}

/// Set the certification number only when the column is currently empty.
/// Returns whether a row was updated.
pub async fn update_report_cert_if_empty(
    conn: &mut PgConnection,
    report_id: &str,
    cert: &str,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update reports
        set certification_number = $2
        where report_id = $1
          and (certification_number is null or certification_number = '')
        "#,
    )
    .bind(report_id)
    .bind(cert)
    .execute(&mut *conn)
    .await
    .context("update_report_cert_if_empty failed")?;
    Ok(res.rows_affected() > 0)
}

pub async fn report_certificate<'e>(
    ex: impl PgExecutor<'e>,
    report_id: &str,
) -> Result<Option<String>> {
    let row = sqlx::query("select certification_number from reports where report_id = $1")
        .bind(report_id)
        .fetch_optional(ex)
        .await
        .context("report_certificate failed")?;
    match row {
        Some(r) => Ok(r
            .try_get::<Option<String>, _>("certification_number")?
            .filter(|c| !c.is_empty())),
        None => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct NewAnswer {
    pub report_id: String,
    pub question_key: String,
    pub answer_value: Option<String>,
    pub section: Option<String>,
    pub question_text: Option<String>,
    pub enrich_run_id: Uuid,
}

/// Insert an answer row; a duplicate `(report_id, question_key)` is ignored.
/// Returns whether a row was written.
pub async fn insert_answer_if_absent(conn: &mut PgConnection, answer: &NewAnswer) -> Result<bool> {
    let res = sqlx::query(
        r#"
        insert into report_answers (
            report_id, question_key, answer_value, section, question_text, enrich_run_id
        ) values ($1, $2, $3, $4, $5, $6)
        on conflict (report_id, question_key) do nothing
        "#,
    )
    .bind(&answer.report_id)
    .bind(&answer.question_key)
    .bind(&answer.answer_value)
    .bind(&answer.section)
    .bind(&answer.question_text)
    .bind(answer.enrich_run_id)
    .execute(&mut *conn)
    .await
    .context("insert_answer_if_absent failed")?;
    Ok(res.rows_affected() > 0)
}

pub async fn count_answers(conn: &mut PgConnection, report_id: &str) -> Result<i64> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from report_answers where report_id = $1")
            .bind(report_id)
            .fetch_one(&mut *conn)
            .await
            .context("count_answers failed")?;
    Ok(n)
}

/// Answer map for the evaluator. Values keep their stored nullability.
pub async fn load_answers<'e>(
    ex: impl PgExecutor<'e>,
    report_id: &str,
) -> Result<HashMap<String, Option<String>>> {
    let rows = sqlx::query("select question_key, answer_value from report_answers where report_id = $1")
        .bind(report_id)
        .fetch_all(ex)
        .await
        .context("load_answers failed")?;
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        out.insert(
            row.try_get::<String, _>("question_key")?,
            row.try_get::<Option<String>, _>("answer_value")?,
        );
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct NewFinding {
    pub report_id: String,
    pub rule_set_name: String,
    pub rule_set_version: String,
    pub question_key: String,
    pub answer_value: Option<String>,
    pub severity: String,
    pub finding_code: Option<String>,
    pub major_non_compliant_text: Option<String>,
    pub minor_non_compliant_text: Option<String>,
    pub score_run_id: Uuid,
}

/// Insert a finding. On a duplicate key only the severity-text columns may
/// be back-filled, and only where currently null; nothing else is mutated.
pub async fn insert_finding_or_coalesce_text(
    conn: &mut PgConnection,
    finding: &NewFinding,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into findings (
            report_id, rule_set_name, rule_set_version, question_key,
            answer_value, severity, finding_code,
            major_non_compliant_text, minor_non_compliant_text,
            score_run_id, created_at
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
        on conflict (report_id, rule_set_name, rule_set_version, question_key)
        do update set
            major_non_compliant_text =
                coalesce(findings.major_non_compliant_text, excluded.major_non_compliant_text),
            minor_non_compliant_text =
                coalesce(findings.minor_non_compliant_text, excluded.minor_non_compliant_text)
        "#,
    )
    .bind(&finding.report_id)
    .bind(&finding.rule_set_name)
    .bind(&finding.rule_set_version)
    .bind(&finding.question_key)
    .bind(&finding.answer_value)
    .bind(&finding.severity)
    .bind(&finding.finding_code)
    .bind(&finding.major_non_compliant_text)
    .bind(&finding.minor_non_compliant_text)
    .bind(finding.score_run_id)
    .execute(&mut *conn)
    .await
    .context("insert_finding_or_coalesce_text failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewScore {
    pub report_id: String,
    pub rule_set_name: String,
    pub rule_set_version: String,
    pub major_count: i32,
    pub minor_count: i32,
    pub score_value: Option<String>,
    pub outcome: String,
    pub score_run_id: Uuid,
    pub scored_at: DateTime<Utc>,
}

/// Insert the roll-up row; a re-score overwrites counts, value, outcome,
/// run id, and timestamp.
pub async fn upsert_score(conn: &mut PgConnection, score: &NewScore) -> Result<()> {
    sqlx::query(
        r#"
        insert into scores (
            report_id, rule_set_name, rule_set_version,
            major_count, minor_count, score_value, outcome, score_run_id, scored_at
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        on conflict (report_id, rule_set_name, rule_set_version)
        do update set
            major_count = excluded.major_count,
            minor_count = excluded.minor_count,
            score_value = excluded.score_value,
            outcome = excluded.outcome,
            score_run_id = excluded.score_run_id,
            scored_at = excluded.scored_at
        "#,
    )
    .bind(&score.report_id)
    .bind(&score.rule_set_name)
    .bind(&score.rule_set_version)
    .bind(score.major_count)
    .bind(score.minor_count)
    .bind(&score.score_value)
    .bind(&score.outcome)
    .bind(score.score_run_id)
    .bind(score.scored_at)
    .execute(&mut *conn)
    .await
    .context("upsert_score failed")?;
    Ok(())
}

/// The optional metadata columns the resolver is interested in. Deployments
/// predating a column simply lack it; the probe keeps reads tolerant.
pub const OPTIONAL_REPORT_COLUMNS: [&str; 4] = [
    "rule_set_name",
    "technology_type",
    "assessment_type",
    "template_name",
];

#[derive(Debug, Clone)]
pub struct MetadataColumns {
    present: Vec<String>,
}

impl MetadataColumns {
    pub fn present(&self) -> &[String] {
        &self.present
    }

    /// Build from an explicit column list (tests, or callers that already
    /// know their schema).
    pub fn from_columns(cols: &[&str]) -> Self {
        MetadataColumns {
            present: cols.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Probe `information_schema` once per run for the optional columns.
pub async fn probe_report_columns<'e>(ex: impl PgExecutor<'e>) -> Result<MetadataColumns> {
    let rows = sqlx::query(
        r#"
        select column_name
        from information_schema.columns
        where table_schema = 'public'
          and table_name = 'reports'
          and column_name = any($1)
        "#,
    )
    .bind(
        OPTIONAL_REPORT_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>(),
    )
    .fetch_all(ex)
    .await
    .context("probe_report_columns failed")?;

    let mut present = Vec::with_capacity(rows.len());
    for row in rows {
        present.push(row.try_get::<String, _>("column_name")?);
    }
    Ok(MetadataColumns { present })
}

/// Load the present optional metadata columns for one report. Column names
/// come from the fixed allowlist above, never from input, so interpolating
/// them into the select list is safe.
pub async fn load_report_metadata<'e>(
    ex: impl PgExecutor<'e>,
    report_id: &str,
    columns: &MetadataColumns,
) -> Result<BTreeMap<String, String>> {
    if columns.present().is_empty() {
        return Ok(BTreeMap::new());
    }
    let select_list = columns.present().join(", ");
    let sql = format!("select {select_list} from reports where report_id = $1");
    let row = sqlx::query(&sql)
        .bind(report_id)
        .fetch_optional(ex)
        .await
        .context("load_report_metadata failed")?;

    let mut out = BTreeMap::new();
    if let Some(row) = row {
        for col in columns.present() {
            if let Some(value) = row.try_get::<Option<String>, _>(col.as_str())? {
                if !value.trim().is_empty() {
                    out.insert(col.clone(), value);
                }
            }
        }
    }
    Ok(out)
}
