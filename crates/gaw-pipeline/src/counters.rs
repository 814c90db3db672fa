//! Run counters shared across the worker pool.
//!
//! Per-item failures never abort the run; they only show up here and in
//! per-item log lines. The formatted summary is the run-history message and
//! the operator's primary surface.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub fetched: AtomicU64,
    pub eligible: AtomicU64,
    pub selected: AtomicU64,
    pub ingested: AtomicU64,
    pub ingest_already_processed: AtomicU64,
    pub ingest_failed: AtomicU64,
    pub details_processed: AtomicU64,
    pub details_already_processed: AtomicU64,
    pub details_failed: AtomicU64,
    pub cert_missing: AtomicU64,
    pub score_processed: AtomicU64,
    pub score_already_processed: AtomicU64,
    pub score_failed: AtomicU64,
    pub skipped_not_eligible: AtomicU64,
    pub email_outbox_inserted: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// The one-line run summary recorded on the run-history row.
    pub fn summary_line(&self) -> String {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        format!(
            "Fetched={} Eligible={} Selected={} Ingested={} IngestAlreadyProcessed={} \
             IngestFailed={} DetailsProcessed={} DetailsAlreadyProcessed={} DetailsFailed={} \
             CertMissing={} ScoreProcessed={} ScoreAlreadyProcessed={} ScoreFailed={} \
             SkippedNotEligible={} EmailOutboxInserted={}",
            get(&self.fetched),
            get(&self.eligible),
            get(&self.selected),
            get(&self.ingested),
            get(&self.ingest_already_processed),
            get(&self.ingest_failed),
            get(&self.details_processed),
            get(&self.details_already_processed),
            get(&self.details_failed),
            get(&self.cert_missing),
            get(&self.score_processed),
            get(&self.score_already_processed),
            get(&self.score_failed),
            get(&self.skipped_not_eligible),
            get(&self.email_outbox_inserted),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_is_stable() {
        let c = Counters::default();
        Counters::add(&c.fetched, 10);
        Counters::add(&c.eligible, 4);
        Counters::add(&c.selected, 3);
        Counters::add(&c.ingested, 3);
        Counters::bump(&c.score_processed);
        assert_eq!(
            c.summary_line(),
            "Fetched=10 Eligible=4 Selected=3 Ingested=3 IngestAlreadyProcessed=0 \
             IngestFailed=0 DetailsProcessed=0 DetailsAlreadyProcessed=0 DetailsFailed=0 \
             CertMissing=0 ScoreProcessed=1 ScoreAlreadyProcessed=0 ScoreFailed=0 \
             SkippedNotEligible=0 EmailOutboxInserted=0"
        );
    }
}
