//! The unified GoAudits pipeline: ingest, enrich, score, and the outbox.
//!
//! One process runs one batch to completion and exits. Stages share the
//! same guarantees: incremental progress via the ingestion watermark,
//! per-item idempotency via the processed-items ledger, and per-report
//! transactional side effects. The orchestrator binds the stages and runs
//! the per-report work on a small cooperative worker pool.

pub mod counters;
pub mod enrich;
pub mod ingest;
pub mod orchestrator;
pub mod outbox;
pub mod score;
pub mod summary;

pub use counters::Counters;
pub use orchestrator::{run_pipeline, PipelineDeps, RunReport};
