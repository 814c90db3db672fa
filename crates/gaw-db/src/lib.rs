//! Postgres gateway and state store for the GoAudits workers.
//!
//! This crate owns the connection pool, the embedded baseline migrations,
//! and every SQL statement in the system. It does not interpret domain
//! semantics beyond the table contracts: stages decide *what* to write,
//! this crate decides *how*.

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

pub use sqlx::PgPool;

pub mod domain;
pub mod outbox;
pub mod state;

pub use domain::{
    count_answers, insert_answer_if_absent, insert_finding_or_coalesce_text, insert_report,
    load_answers, load_report_metadata, probe_report_columns, report_certificate,
    update_report_cert_if_empty, upsert_score, MetadataColumns, NewAnswer, NewFinding, NewReport,
    NewScore, OPTIONAL_REPORT_COLUMNS,
};
pub use outbox::{materialise_outbox, OutboxCounts, OutboxScope};
pub use state::{
    finish_run, get_watermark, insert_run, processed_subset, scoring_item_key, try_mark_processed,
    upsert_watermark, was_processed, MarkOutcome, NewRun, RunStatus, JOB_ENRICHMENT, JOB_INGESTION,
    JOB_SCORING,
};

pub const ENV_DB_URL: &str = "GAW_DATABASE_URL";

/// Login role used when composing a connection from host + database + token.
pub const DB_USER: &str = "goaudits_worker";

/// Three workers share the pool and each per-item transaction holds one
/// connection, so the pool size is part of the concurrency contract.
pub const POOL_MAX_CONNECTIONS: u32 = 3;

/// Connect using a full connection URL.
pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect using `GAW_DATABASE_URL`. Used by tests and local development.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Connect with host + database and a short-lived access token in the
/// password slot. The core never sees a static password.
pub async fn connect_with_token(host: &str, database: &str, token: &str) -> Result<PgPool> {
    let opts = PgConnectOptions::new()
        .host(host)
        .database(database)
        .username(DB_USER)
        .password(token)
        .ssl_mode(PgSslMode::Require);
    let pool = PgPoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to connect to Postgres at {host}/{database}"))?;
    Ok(pool)
}

/// Apply the embedded baseline migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Connectivity + schema-presence check for `gaw db status`.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'watermark'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_watermark_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_watermark_table: bool,
}

/// SQLSTATE 23505: unique or primary-key violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        db_err.code().as_deref() == Some("23505")
    } else {
        false
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::truncate_chars;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("abcdef", 4), "abcd");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("áéíóú", 3), "áéí");
    }
}
