//! Watermark, run history, and the processed-items ledger.
//!
//! The ledger's primary key is the synchronisation mechanism for the whole
//! platform: a duplicate insert is translated into [`MarkOutcome::AlreadyProcessed`]
//! and never surfaces as an error.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::{is_unique_violation, truncate_chars};

pub const JOB_INGESTION: &str = "GoAuditsIngestion";
pub const JOB_ENRICHMENT: &str = "GoAuditsEnrichment";
pub const JOB_SCORING: &str = "GoAuditsScoring";

/// Ledger item key for a scoring attempt.
pub fn scoring_item_key(report_id: &str, name: &str, version: &str) -> String {
    format!("{report_id}|{name}|{version}")
}

/// Returns the stored watermark and whether the row existed. An absent row
/// reads as the Unix epoch so first runs consider everything eligible.
pub async fn get_watermark<'e>(
    ex: impl PgExecutor<'e>,
    job_name: &str,
) -> Result<(DateTime<Utc>, bool)> {
    let row = sqlx::query("select utc_instant from watermark where job_name = $1")
        .bind(job_name)
        .fetch_optional(ex)
        .await
        .context("get_watermark failed")?;
    match row {
        Some(r) => Ok((r.try_get("utc_instant")?, true)),
        None => Ok((DateTime::<Utc>::UNIX_EPOCH, false)),
    }
}

pub async fn upsert_watermark<'e>(
    ex: impl PgExecutor<'e>,
    job_name: &str,
    instant: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into watermark (job_name, utc_instant, updated_at)
        values ($1, $2, now())
        on conflict (job_name)
        do update set utc_instant = excluded.utc_instant, updated_at = now()
        "#,
    )
    .bind(job_name)
    .bind(instant)
    .execute(ex)
    .await
    .context("upsert_watermark failed")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: Uuid,
    pub job_name: String,
    pub status: RunStatus,
    pub message: String,
    pub correlation_id: String,
}

pub async fn insert_run<'e>(ex: impl PgExecutor<'e>, run: &NewRun) -> Result<()> {
    sqlx::query(
        r#"
        insert into run_history (run_id, job_name, status, message, correlation_id, started_at)
        values ($1, $2, $3, $4, $5, now())
        "#,
    )
    .bind(run.run_id)
    .bind(&run.job_name)
    .bind(run.status.as_str())
    .bind(truncate_chars(&run.message, 4000))
    .bind(&run.correlation_id)
    .execute(ex)
    .await
    .context("insert_run failed")?;
    Ok(())
}

/// Final update of a run-history row; the row is append-history afterwards.
pub async fn finish_run<'e>(
    ex: impl PgExecutor<'e>,
    run_id: Uuid,
    status: RunStatus,
    message: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        update run_history
        set status = $2, message = $3, completed_at = now()
        where run_id = $1
        "#,
    )
    .bind(run_id)
    .bind(status.as_str())
    .bind(truncate_chars(message, 4000))
    .execute(ex)
    .await
    .context("finish_run failed")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyProcessed,
}

/// Insert a ledger entry inside the caller's transaction. A primary-key
/// collision means another run got there first; that is the designed
/// idempotency path, not an error.
pub async fn try_mark_processed(
    conn: &mut PgConnection,
    job_name: &str,
    item_key: &str,
    run_id: Uuid,
) -> Result<MarkOutcome> {
    let res = sqlx::query(
        r#"
        insert into processed_items (job_name, item_key, run_id, processed_at)
        values ($1, $2, $3, now())
        "#,
    )
    .bind(job_name)
    .bind(item_key)
    .bind(run_id)
    .execute(&mut *conn)
    .await;

    match res {
        Ok(_) => Ok(MarkOutcome::Marked),
        Err(err) if is_unique_violation(&err) => Ok(MarkOutcome::AlreadyProcessed),
        Err(err) => Err(err).context("try_mark_processed failed"),
    }
}

/// Read-only ledger probe, used by dry runs and by stages that want to skip
/// remote work for items already committed.
pub async fn was_processed<'e>(
    ex: impl PgExecutor<'e>,
    job_name: &str,
    item_key: &str,
) -> Result<bool> {
    let row = sqlx::query("select 1 as one from processed_items where job_name = $1 and item_key = $2")
        .bind(job_name)
        .bind(item_key)
        .fetch_optional(ex)
        .await
        .context("was_processed failed")?;
    Ok(row.is_some())
}

/// Which of `keys` are already ledgered for `job_name`. One round trip.
pub async fn processed_subset<'e>(
    ex: impl PgExecutor<'e>,
    job_name: &str,
    keys: &[String],
) -> Result<HashSet<String>> {
    if keys.is_empty() {
        return Ok(HashSet::new());
    }
    let rows = sqlx::query(
        "select item_key from processed_items where job_name = $1 and item_key = any($2)",
    )
    .bind(job_name)
    .bind(keys)
    .fetch_all(ex)
    .await
    .context("processed_subset failed")?;
    rows.iter()
        .map(|r| r.try_get::<String, _>("item_key").map_err(Into::into))
        .collect()
}
