//! Pipeline orchestrator: binds the stages, runs the per-report work on a
//! small cooperative worker pool, and writes the run-history summary.
//!
//! The summary fetch and ingest phase are strictly sequential; only the
//! per-report enrich/resolve/score work runs on workers. Three workers
//! match the SQL pool size and bound load on the remote API; that pairing
//! is a contract, not an incidental default.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use gaw_config::Settings;
use gaw_db::{
    finish_run, get_watermark, insert_run, load_answers, load_report_metadata,
    probe_report_columns, processed_subset, upsert_watermark, MetadataColumns, NewRun, RunStatus,
    JOB_INGESTION,
};
use gaw_remote::{ApiClient, Clock};
use gaw_rules::{cached_document, resolve_ruleset, CatalogEntry, Resolution, RulesetCatalog};

use crate::counters::Counters;
use crate::enrich::{enrich_report, EnrichError, EnrichOutcome};
use crate::ingest::ingest_batch;
use crate::outbox::materialise;
use crate::score::{score_report, ScoreError, ScoreOutcome};
use crate::summary::{eligible_items, extract_summary_item, select_batch, SummaryItem};

/// Worker-pool width for per-report details work. Matches the SQL pool.
pub const DETAILS_CONCURRENCY: usize = 3;

/// Run-history job name for the unified pipeline run.
pub const JOB_PIPELINE: &str = "GoAuditsPipeline";

pub struct PipelineDeps {
    pub pool: PgPool,
    pub client: ApiClient,
    pub bearer: String,
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub succeeded: bool,
    pub summary: String,
}

/// Execute one batch end to end.
///
/// Per-item failures are absorbed into counters; the returned report is
/// `succeeded = false` only for run-level failures (auth, summary fetch,
/// malformed rule material, cancellation). Errors from this function itself
/// mean the run could not even be recorded.
pub async fn run_pipeline(deps: PipelineDeps) -> Result<RunReport> {
    let run_id = Uuid::new_v4();
    let correlation_id = Uuid::new_v4().to_string();
    let counters = Arc::new(Counters::default());
    let dry_run = deps.settings.dry_run;

    if !dry_run {
        insert_run(
            &deps.pool,
            &NewRun {
                run_id,
                job_name: JOB_PIPELINE.to_string(),
                status: RunStatus::Running,
                message: String::new(),
                correlation_id: correlation_id.clone(),
            },
        )
        .await
        .context("recording run start failed")?;
    }
    info!(%run_id, %correlation_id, dry_run, "pipeline run starting");

    let outcome = execute(&deps, run_id, &counters).await;

    let summary = counters.summary_line();
    match outcome {
        Ok(()) => {
            if !dry_run {
                finish_run(&deps.pool, run_id, RunStatus::Succeeded, &summary).await?;
            }
            info!(%run_id, %summary, "pipeline run succeeded");
            Ok(RunReport {
                run_id,
                succeeded: true,
                summary,
            })
        }
        Err(err) => {
            let message = format!("{summary} | Error: {err:#}");
            if !dry_run {
                if let Err(finish_err) =
                    finish_run(&deps.pool, run_id, RunStatus::Failed, &message).await
                {
                    warn!(error = %finish_err, "failed to record run failure");
                }
            }
            warn!(%run_id, error = %format!("{err:#}"), "pipeline run failed");
            Ok(RunReport {
                run_id,
                succeeded: false,
                summary: message,
            })
        }
    }
}

/// POST body for the summary endpoint. The empty/zero fields are required
/// by the provider even when unused.
fn summary_request_body(
    lower: DateTime<Utc>,
    upper: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Value {
    json!({
        "start_date": lower.format("%Y-%m-%d").to_string(),
        "end_date": upper.unwrap_or(now).format("%Y-%m-%d").to_string(),
        "status": "Completed",
        "jsonflag": true,
        "filterId": 0,
        "client_id": "",
        "location_id": "",
        "user_id": "",
        "records": 0,
        "archived": false
    })
}

/// What to write to the watermark row after ingest, if anything.
///
/// The watermark only advances when every selected item committed, and
/// never moves backwards. A missing row is created even by an empty batch
/// so the next run starts from a recorded position.
fn watermark_after_ingest(
    current: DateTime<Utc>,
    exists: bool,
    ingest: &crate::ingest::IngestOutcome,
) -> Option<DateTime<Utc>> {
    if ingest.failed > 0 {
        return None;
    }
    match ingest.max_committed {
        Some(max) if max > current || !exists => Some(max.max(current)),
        None if !exists => Some(current),
        _ => None,
    }
}

async fn execute(deps: &PipelineDeps, run_id: Uuid, counters: &Arc<Counters>) -> Result<()> {
    let settings = &deps.settings;
    let pool = &deps.pool;

    // Load every configured rule document up front: malformed rule material
    // fails the run before any remote call or write.
    let mut catalog = RulesetCatalog::default();
    for (name, version) in &settings.ruleset_versions {
        let doc = cached_document(&settings.rules_dir, name, version)
            .map_err(|e| anyhow!("rule document for {name} {version}: {e}"))?;
        catalog.entries.push(CatalogEntry {
            name: doc.rule_set_name.clone(),
            version: doc.rule_set_version.clone(),
            eligibility: doc.eligibility_keys().clone(),
        });
    }

    let probe = probe_report_columns(pool).await?;
    let (watermark, watermark_exists) = get_watermark(pool, JOB_INGESTION).await?;
    let lower = settings.start_date.map_or(watermark, |s| s.max(watermark));
    let upper = settings.end_date;

    // Summary fetch and ingest run sequentially, before any worker starts.
    let body = summary_request_body(lower, upper, deps.clock.now());
    let rows = deps
        .client
        .post_json(&settings.summary_url, &body, &deps.bearer)
        .await
        .map_err(|e| anyhow!("summary fetch failed: {e}"))?;
    Counters::add(&counters.fetched, rows.len() as u64);

    let items: Vec<SummaryItem> = rows.iter().filter_map(extract_summary_item).collect();
    let eligible = eligible_items(items, lower, upper);
    Counters::add(&counters.eligible, eligible.len() as u64);

    let keys: Vec<String> = eligible.iter().map(|i| i.report_id.clone()).collect();
    let ledgered = processed_subset(pool, JOB_INGESTION, &keys).await?;
    let (already, fresh): (Vec<SummaryItem>, Vec<SummaryItem>) = eligible
        .into_iter()
        .partition(|i| ledgered.contains(&i.report_id));
    Counters::add(&counters.ingest_already_processed, already.len() as u64);

    let selected = select_batch(fresh, settings.batch_size);
    Counters::add(&counters.selected, selected.len() as u64);

    let ingest = ingest_batch(pool, &selected, run_id, settings.dry_run).await?;
    Counters::add(&counters.ingested, ingest.ingested);
    Counters::add(&counters.ingest_already_processed, ingest.already_processed);
    Counters::add(&counters.ingest_failed, ingest.failed);

    if !settings.dry_run {
        if let Some(next) = watermark_after_ingest(watermark, watermark_exists, &ingest) {
            upsert_watermark(pool, JOB_INGESTION, next).await?;
        }
    }

    // Per-report work: freshly selected items plus re-examined ones already
    // in the ingest ledger (their enrich or score may still be owed).
    let failed_ids: HashSet<String> = ingest.failed_ids.into_iter().collect();
    let queue: VecDeque<SummaryItem> = selected
        .into_iter()
        .filter(|i| !failed_ids.contains(&i.report_id))
        .chain(already)
        .collect();
    let batch_ids: Vec<String> = queue.iter().map(|i| i.report_id.clone()).collect();

    let ctx = Arc::new(WorkerCtx {
        pool: pool.clone(),
        client: deps.client.clone(),
        details_url: settings.details_url.clone(),
        bearer: deps.bearer.clone(),
        rules_dir: settings.rules_dir.clone(),
        catalog,
        probe,
        counters: Arc::clone(counters),
        queue: Mutex::new(queue),
        abort: AtomicBool::new(false),
        fatal: Mutex::new(None),
        run_id,
        dry_run: settings.dry_run,
        validate_keys: settings.validate_keys,
        clock: Arc::clone(&deps.clock),
    });

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let ctx = Arc::clone(&ctx);
        let cancelled = Arc::clone(&cancelled);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("cancellation requested; letting in-flight items finish");
                cancelled.store(true, Ordering::Relaxed);
                ctx.abort.store(true, Ordering::Relaxed);
            }
        });
    }

    if !ctx.queue.lock().expect("queue poisoned").is_empty() {
        let mut handles = Vec::with_capacity(DETAILS_CONCURRENCY);
        for worker_id in 0..DETAILS_CONCURRENCY {
            handles.push(tokio::spawn(worker_loop(Arc::clone(&ctx), worker_id)));
        }
        for handle in handles {
            handle.await.map_err(|e| anyhow!("worker task failed: {e}"))?;
        }
    }

    if cancelled.load(Ordering::Relaxed) {
        bail!("cancelled by signal");
    }
    if let Some(fatal) = ctx.fatal.lock().expect("fatal slot poisoned").take() {
        bail!(fatal);
    }

    if settings.materialise_email {
        let counts = materialise(pool, settings.materialise_scope, batch_ids, settings.dry_run)
            .await
            .context("outbox materialisation failed")?;
        Counters::add(&counters.email_outbox_inserted, counts.inserted);
        info!(
            inserted = counts.inserted,
            skipped_already_exists = counts.skipped_already_exists,
            missing_recipient = counts.missing_recipient,
            "outbox materialised"
        );
    }

    Ok(())
}

struct WorkerCtx {
    pool: PgPool,
    client: ApiClient,
    details_url: String,
    bearer: String,
    rules_dir: PathBuf,
    catalog: RulesetCatalog,
    probe: MetadataColumns,
    counters: Arc<Counters>,
    queue: Mutex<VecDeque<SummaryItem>>,
    abort: AtomicBool,
    fatal: Mutex<Option<String>>,
    run_id: Uuid,
    dry_run: bool,
    validate_keys: bool,
    clock: Arc<dyn Clock>,
}

impl WorkerCtx {
    /// First fatal error wins; every worker stops dequeueing.
    fn record_fatal(&self, message: String) {
        self.abort.store(true, Ordering::Relaxed);
        let mut slot = self.fatal.lock().expect("fatal slot poisoned");
        if slot.is_none() {
            *slot = Some(message);
        }
    }
}

/// Drain the shared queue cooperatively until it is empty or the run aborts.
async fn worker_loop(ctx: Arc<WorkerCtx>, worker_id: usize) {
    loop {
        if ctx.abort.load(Ordering::Relaxed) {
            return;
        }
        let item = ctx.queue.lock().expect("queue poisoned").pop_front();
        let Some(item) = item else { return };
        process_item(&ctx, &item, worker_id).await;
    }
}

/// Enrich, resolve, and score one report. Failures are counted, logged with
/// the report id, and never abort the run unless they are fatal-auth or
/// malformed rule material.
async fn process_item(ctx: &WorkerCtx, item: &SummaryItem, worker_id: usize) {
    let report_id = item.report_id.as_str();
    let c = ctx.counters.as_ref();

    let (answers, payload_rows) = match enrich_report(
        &ctx.pool,
        &ctx.client,
        &ctx.details_url,
        &ctx.bearer,
        report_id,
        ctx.run_id,
        ctx.dry_run,
        ctx.validate_keys,
    )
    .await
    {
        Ok(EnrichOutcome::Enriched {
            answers,
            cert_missing,
            payload_rows,
        }) => {
            Counters::bump(&c.details_processed);
            if cert_missing {
                Counters::bump(&c.cert_missing);
            }
            (answers, payload_rows)
        }
        Ok(EnrichOutcome::AlreadyProcessed) => {
            Counters::bump(&c.details_already_processed);
            // Enrichment was committed by an earlier run; scoring works off
            // the persisted answers instead.
            match load_answers(&ctx.pool, report_id).await {
                Ok(answers) => (answers, Vec::new()),
                Err(err) => {
                    Counters::bump(&c.score_failed);
                    warn!(report_id, worker_id, error = %format!("{err:#}"), "answer reload failed");
                    return;
                }
            }
        }
        Err(EnrichError::FatalAuth(err)) => {
            ctx.record_fatal(format!("details call for {report_id}: {err}"));
            return;
        }
        Err(EnrichError::Item(err)) => {
            Counters::bump(&c.details_failed);
            warn!(report_id, worker_id, error = %format!("{err:#}"), "details processing failed");
            return;
        }
    };

    let metadata = match load_report_metadata(&ctx.pool, report_id, &ctx.probe).await {
        Ok(metadata) => metadata,
        Err(err) => {
            Counters::bump(&c.score_failed);
            warn!(report_id, worker_id, error = %format!("{err:#}"), "metadata load failed");
            return;
        }
    };

    let question_keys: HashSet<String> = answers.keys().cloned().collect();
    let (name, version) =
        match resolve_ruleset(&metadata, &payload_rows, &question_keys, &ctx.catalog) {
            Resolution::Resolved { name, version } => (name, version),
            Resolution::Unresolved { reason } => {
                Counters::bump(&c.skipped_not_eligible);
                info!(report_id, %reason, "report not eligible for scoring");
                return;
            }
        };

    let doc = match cached_document(&ctx.rules_dir, &name, &version) {
        Ok(doc) => doc,
        Err(err) => {
            ctx.record_fatal(format!("rule document for {name} {version}: {err}"));
            return;
        }
    };

    match score_report(
        &ctx.pool,
        &doc,
        report_id,
        &answers,
        ctx.run_id,
        ctx.clock.now(),
        ctx.dry_run,
    )
    .await
    {
        Ok(ScoreOutcome::Scored {
            major_count,
            minor_count,
        }) => {
            Counters::bump(&c.score_processed);
            info!(report_id, rule_set = %name, version = %version, major_count, minor_count, "report scored");
        }
        Ok(ScoreOutcome::AlreadyProcessed) => Counters::bump(&c.score_already_processed),
        Ok(ScoreOutcome::NotEligible { reason }) => {
            Counters::bump(&c.skipped_not_eligible);
            info!(report_id, %reason, "report not eligible for scoring");
        }
        Err(ScoreError::Run(err)) => {
            ctx.record_fatal(format!("scoring aborted: {err:#}"));
        }
        Err(ScoreError::Item(err)) => {
            Counters::bump(&c.score_failed);
            warn!(report_id, worker_id, error = %format!("{err:#}"), "scoring failed");
        }
    }
}
