//! Notification outbox materialisation.
//!
//! Derives `Pending` outbox rows from scores joined with the installation
//! and installer lookups. Presence is keyed on
//! `(report_id, rule_set_name, rule_set_version)`; the unique index plus the
//! insert-if-absent makes the whole operation idempotent.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    pub inserted: u64,
    pub skipped_already_exists: u64,
    pub missing_recipient: u64,
}

/// Which scores are considered for materialisation.
#[derive(Debug, Clone)]
pub enum OutboxScope {
    /// Every score without an outbox row.
    All,
    /// Only the given report ids (one batch's worth).
    Batch(Vec<String>),
}

const CANDIDATES_ALL: &str = r#"
    select s.report_id, s.rule_set_name, s.rule_set_version,
           r.certification_number,
           ins.contact_email, ins.company_name,
           exists (
               select 1 from email_outbox e
               where e.report_id = s.report_id
                 and e.rule_set_name = s.rule_set_name
                 and e.rule_set_version = s.rule_set_version
           ) as already_queued
    from scores s
    join reports r on r.report_id = s.report_id
    left join installations ii on ii.certificate_number = r.certification_number
    left join installers ins on ins.installer_id = ii.installer_id
    order by s.report_id, s.rule_set_name, s.rule_set_version
"#;

const CANDIDATES_BATCH: &str = r#"
    select s.report_id, s.rule_set_name, s.rule_set_version,
           r.certification_number,
           ins.contact_email, ins.company_name,
           exists (
               select 1 from email_outbox e
               where e.report_id = s.report_id
                 and e.rule_set_name = s.rule_set_name
                 and e.rule_set_version = s.rule_set_version
           ) as already_queued
    from scores s
    join reports r on r.report_id = s.report_id
    join outbox_batch_ids b on b.report_id = s.report_id
    left join installations ii on ii.certificate_number = r.certification_number
    left join installers ins on ins.installer_id = ii.installer_id
    order by s.report_id, s.rule_set_name, s.rule_set_version
"#;

/// Materialise pending outbox rows for `scope`.
///
/// `template_for` chooses the notification template per
/// `(rule_set_name, rule_set_version)`. With `dry_run` the candidate scan
/// runs and counts are produced, but nothing is written.
pub async fn materialise_outbox<F>(
    pool: &PgPool,
    scope: &OutboxScope,
    template_for: F,
    dry_run: bool,
) -> Result<OutboxCounts>
where
    F: Fn(&str, &str) -> String + Send + Sync,
{
    let mut tx = pool.begin().await.context("outbox begin failed")?;

    let candidates = match scope {
        OutboxScope::All => sqlx::query(CANDIDATES_ALL)
            .fetch_all(&mut *tx)
            .await
            .context("outbox candidate scan failed")?,
        OutboxScope::Batch(report_ids) => {
            if report_ids.is_empty() {
                return Ok(OutboxCounts::default());
            }
            sqlx::query(
                "create temporary table outbox_batch_ids (report_id text primary key) on commit drop",
            )
            .execute(&mut *tx)
            .await
            .context("outbox temp table failed")?;
            sqlx::query(
                "insert into outbox_batch_ids (report_id) select distinct unnest($1::text[])",
            )
            .bind(report_ids)
            .execute(&mut *tx)
            .await
            .context("outbox temp fill failed")?;
            sqlx::query(CANDIDATES_BATCH)
                .fetch_all(&mut *tx)
                .await
                .context("outbox candidate scan failed")?
        }
    };

    let mut counts = OutboxCounts::default();
    for row in candidates {
        let already: bool = row.try_get("already_queued")?;
        if already {
            counts.skipped_already_exists += 1;
            continue;
        }
        let report_id: String = row.try_get("report_id")?;
        let name: String = row.try_get("rule_set_name")?;
        let version: String = row.try_get("rule_set_version")?;
        let cert: Option<String> = row.try_get("certification_number")?;
        let email: Option<String> = row.try_get("contact_email")?;
        let company: Option<String> = row.try_get("company_name")?;

        if dry_run {
            counts.inserted += 1;
            if email.is_none() {
                counts.missing_recipient += 1;
            }
            continue;
        }

        let template = template_for(&name, &version);
        let res = sqlx::query(
            r#"
            insert into email_outbox (
                report_id, rule_set_name, rule_set_version,
                certificate_number, recipient_email, company_name,
                template_name, status, attempt_count
            ) values ($1, $2, $3, $4, $5, $6, $7, 'Pending', 0)
            on conflict (report_id, rule_set_name, rule_set_version) do nothing
            "#,
        )
        .bind(&report_id)
        .bind(&name)
        .bind(&version)
        .bind(&cert)
        .bind(&email)
        .bind(&company)
        .bind(&template)
        .execute(&mut *tx)
        .await
        .context("outbox insert failed")?;

        if res.rows_affected() == 0 {
            counts.skipped_already_exists += 1;
        } else {
            counts.inserted += 1;
            if email.is_none() {
                counts.missing_recipient += 1;
            }
        }
    }

    tx.commit().await.context("outbox commit failed")?;
    Ok(counts)
}
