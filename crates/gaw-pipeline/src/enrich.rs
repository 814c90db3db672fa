//! Enrich stage: fetch per-report details, extract the certificate and the
//! per-question answers, persist them, and mark the report enriched.
//!
//! The detail payload is a flat array of rows tagged with `RecordType`; only
//! `Detail` rows carry answers. Question keys prefer the provider's
//! `QUESTION_ID`; otherwise a stable key is derived from the question text.

use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use gaw_db::{
    count_answers, insert_answer_if_absent, report_certificate, try_mark_processed,
    update_report_cert_if_empty, was_processed, NewAnswer, JOB_ENRICHMENT,
};
use gaw_remote::{ApiClient, RemoteError};
use gaw_rules::value_to_answer_string;

/// Base request object the details endpoint requires; `audit_id` is merged
/// in per report. The extra keys are externally defined by the provider and
/// must be present (empty) for a detail-level response.
fn details_request_body(report_id: &str) -> Value {
    json!({
        "audit_id": report_id,
        "client_id": "",
        "location_id": "",
        "checklist_id": "",
        "user_id": "",
        "start_date": "",
        "end_date": "",
        "status": "",
        "jsonflag": true,
        "records": 0,
        "offset": 0
    })
}

const MAX_QUESTION_KEY: usize = 256;
const KEY_DIGEST_HEX: usize = 40;
const MAX_ANSWER_VALUE: usize = 4000;
const MAX_SECTION: usize = 200;
const MAX_QUESTION_TEXT: usize = 1000;
const MAX_CERT: usize = 100;

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Derive a stable question key from question text: lowercase, collapse
/// whitespace, keep `[a-z0-9]` runs joined by single underscores. Keys that
/// would exceed 256 chars are truncated and suffixed with the SHA-1 of the
/// full derivation so distinct long questions stay distinct.
///
/// The derivation is idempotent: applying it to its own output returns the
/// same key.
pub fn derive_question_key(question: &str) -> String {
    let lowered = question.to_lowercase();
    let mut key = String::with_capacity(lowered.len());
    let mut pending_sep = false;
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !key.is_empty() {
                key.push('_');
            }
            pending_sep = false;
            key.push(ch);
        } else {
            pending_sep = true;
        }
    }

    if key.chars().count() <= MAX_QUESTION_KEY {
        return key;
    }
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    // Trim a trailing separator so the digest join never produces a double
    // underscore, which would not survive re-derivation.
    let prefix =
        truncate_chars(&key, MAX_QUESTION_KEY - KEY_DIGEST_HEX - 1).trim_end_matches('_');
    format!("{prefix}_{}", &digest[..KEY_DIGEST_HEX])
}

fn row_string(row: &Value, key: &str) -> Option<String> {
    let v = row.get(key)?;
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

/// Question key for one detail row: `QUESTION_ID` when present and
/// non-empty, otherwise derived from the question text.
fn question_key_for(row: &Value) -> Option<(String, bool)> {
    if let Some(id) = row_string(row, "QUESTION_ID") {
        return Some((truncate_chars(&id, MAX_QUESTION_KEY).to_string(), false));
    }
    let question = row_string(row, "Question")?;
    let derived = derive_question_key(&question);
    if derived.is_empty() {
        None
    } else {
        Some((derived, true))
    }
}

/// Answer in its stored string form: null stays null, scalars coerce,
/// structured values serialise; capped at 4000 chars.
fn answer_value_of(row: &Value) -> Option<String> {
    let raw = row.get("Answer")?;
    value_to_answer_string(raw).map(|s| truncate_chars(&s, MAX_ANSWER_VALUE).to_string())
}

/// `Section`, with a meaningful `GroupName` appended.
fn section_of(row: &Value) -> Option<String> {
    let section = row_string(row, "Section").unwrap_or_default();
    let group = row_string(row, "GroupName").filter(|g| g != "N/A");
    let combined = match (section.is_empty(), group) {
        (false, Some(g)) => format!("{section} | {g}"),
        (false, None) => section,
        (true, Some(g)) => g,
        (true, None) => return None,
    };
    Some(truncate_chars(&combined, MAX_SECTION).to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedAnswer {
    pub question_key: String,
    pub answer_value: Option<String>,
    pub section: Option<String>,
    pub question_text: Option<String>,
    /// Key came from question text rather than `QUESTION_ID`.
    pub derived_key: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DetailExtract {
    pub certificate: Option<String>,
    pub answers: Vec<ExtractedAnswer>,
}

/// Extract certificate and answers from a details payload. Fails when the
/// payload carries no `Detail` rows at all.
pub fn extract_details(rows: &[Value]) -> Result<DetailExtract, String> {
    let detail_rows: Vec<&Value> = rows
        .iter()
        .filter(|row| {
            row.get("RecordType")
                .and_then(Value::as_str)
                .is_some_and(|t| t == "Detail")
        })
        .collect();
    if detail_rows.is_empty() {
        return Err("details response contains no Detail rows".to_string());
    }

    let certificate = detail_rows.iter().find_map(|row| {
        let by_id = row_string(row, "QUESTION_ID").as_deref() == Some("1");
        let by_text = row_string(row, "Question")
            .is_some_and(|q| q.to_lowercase().contains("certificate number"));
        if !by_id && !by_text {
            return None;
        }
        let answer = row.get("Answer").and_then(value_to_answer_string)?;
        let trimmed = answer.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(truncate_chars(trimmed, MAX_CERT).to_string())
        }
    });

    let mut seen: HashSet<String> = HashSet::new();
    let mut answers = Vec::new();
    for row in &detail_rows {
        let Some((question_key, derived_key)) = question_key_for(row) else {
            continue;
        };
        // First occurrence wins within one response.
        if !seen.insert(question_key.clone()) {
            continue;
        }
        answers.push(ExtractedAnswer {
            question_key,
            answer_value: answer_value_of(row),
            section: section_of(row),
            question_text: row_string(row, "Question")
                .map(|q| truncate_chars(&q, MAX_QUESTION_TEXT).to_string()),
            derived_key,
        });
    }

    Ok(DetailExtract {
        certificate,
        answers,
    })
}

/// How an enrich attempt failed.
#[derive(Debug)]
pub enum EnrichError {
    /// Remote rejected our credentials; aborts the whole run.
    FatalAuth(RemoteError),
    /// Anything else; counted and the run moves on.
    Item(anyhow::Error),
}

impl fmt::Display for EnrichError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichError::FatalAuth(e) => write!(f, "{e}"),
            EnrichError::Item(e) => write!(f, "{e:#}"),
        }
    }
}

#[derive(Debug)]
pub enum EnrichOutcome {
    Enriched {
        /// Answer map, usable by scoring without a store round trip.
        answers: HashMap<String, Option<String>>,
        /// Report still has no certificate after this enrichment.
        cert_missing: bool,
        /// Raw payload rows, kept for ruleset-resolution heuristics.
        payload_rows: Vec<Value>,
    },
    AlreadyProcessed,
}

/// Enrich one report. The remote call happens outside the transaction; the
/// cert update, answer inserts, and the enrichment ledger entry commit
/// together.
#[allow(clippy::too_many_arguments)]
pub async fn enrich_report(
    pool: &PgPool,
    client: &ApiClient,
    details_url: &str,
    bearer: &str,
    report_id: &str,
    run_id: Uuid,
    dry_run: bool,
    validate_keys: bool,
) -> Result<EnrichOutcome, EnrichError> {
    let already = was_processed(pool, JOB_ENRICHMENT, report_id)
        .await
        .map_err(EnrichError::Item)?;
    if already {
        return Ok(EnrichOutcome::AlreadyProcessed);
    }

    let rows = client
        .post_json(details_url, &details_request_body(report_id), bearer)
        .await
        .map_err(|e| {
            if e.is_fatal_auth() {
                EnrichError::FatalAuth(e)
            } else {
                EnrichError::Item(anyhow!("details call failed: {e}"))
            }
        })?;

    let extract = extract_details(&rows).map_err(|reason| EnrichError::Item(anyhow!(reason)))?;

    if validate_keys {
        for answer in extract.answers.iter().filter(|a| a.derived_key) {
            let again = derive_question_key(&answer.question_key);
            if again != answer.question_key {
                warn!(
                    report_id,
                    question_key = %answer.question_key,
                    rederived = %again,
                    "derived question key is unstable"
                );
            }
        }
    }

    let answer_map: HashMap<String, Option<String>> = extract
        .answers
        .iter()
        .map(|a| (a.question_key.clone(), a.answer_value.clone()))
        .collect();

    if dry_run {
        let stored = report_certificate(pool, report_id)
            .await
            .map_err(EnrichError::Item)?;
        let cert_missing = extract.certificate.is_none() && stored.is_none();
        return Ok(EnrichOutcome::Enriched {
            answers: answer_map,
            cert_missing,
            payload_rows: rows,
        });
    }

    let cert_missing = persist(pool, report_id, run_id, &extract)
        .await
        .map_err(EnrichError::Item)?;

    Ok(EnrichOutcome::Enriched {
        answers: answer_map,
        cert_missing,
        payload_rows: rows,
    })
}

/// One transaction: conditional cert update, answer inserts, then the
/// ledger entry once answers are known to exist. Returns whether the report
/// still lacks a certificate.
async fn persist(
    pool: &PgPool,
    report_id: &str,
    run_id: Uuid,
    extract: &DetailExtract,
) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await.context("enrich begin failed")?;

    if let Some(cert) = &extract.certificate {
        update_report_cert_if_empty(&mut *tx, report_id, cert).await?;
    }

    for answer in &extract.answers {
        insert_answer_if_absent(
            &mut *tx,
            &NewAnswer {
                report_id: report_id.to_string(),
                question_key: answer.question_key.clone(),
                answer_value: answer.answer_value.clone(),
                section: answer.section.clone(),
                question_text: answer.question_text.clone(),
                enrich_run_id: run_id,
            },
        )
        .await?;
    }

    let persisted = count_answers(&mut *tx, report_id).await?;
    if persisted > 0 {
        try_mark_processed(&mut *tx, JOB_ENRICHMENT, report_id, run_id).await?;
    }
    let current_cert = report_certificate(&mut *tx, report_id).await?;

    tx.commit().await.context("enrich commit failed")?;
    // A certificate only counts as missing once the report actually holds
    // answers; a row that produced nothing will be retried next run.
    Ok(persisted > 0 && current_cert.is_none())
}
