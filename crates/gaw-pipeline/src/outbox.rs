//! Outbox materialisation policy: which scope, and which template per rule
//! set. The SQL lives in `gaw_db::outbox`; this module owns the naming.

use anyhow::Result;
use sqlx::PgPool;

use gaw_config::MaterialiseScope;
use gaw_db::{OutboxCounts, OutboxScope};

/// Notification template for a `(rule_set_name, rule_set_version)` pair.
pub fn template_for(name: &str, version: &str) -> String {
    format!("{}-audit-outcome-{}", name.to_lowercase(), version)
}

/// Materialise pending outbox rows. In batch scope only the given report
/// ids are considered.
pub async fn materialise(
    pool: &PgPool,
    scope: MaterialiseScope,
    batch_report_ids: Vec<String>,
    dry_run: bool,
) -> Result<OutboxCounts> {
    let scope = match scope {
        MaterialiseScope::All => OutboxScope::All,
        MaterialiseScope::Batch => OutboxScope::Batch(batch_report_ids),
    };
    gaw_db::materialise_outbox(pool, &scope, template_for, dry_run).await
}
