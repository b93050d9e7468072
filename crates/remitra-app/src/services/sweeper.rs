//! Recovery sweeper.
//!
//! A periodic idempotent pass with three independent repairs, each bounded to
//! a small batch per run and paced between re-dispatches:
//!
//! 1. jobs stuck `queued` past the staleness window (dispatch silently lost)
//!    are re-run directly, awaiting the outcome;
//! 2. `retryable` jobs idle past the cooldown are reset to `queued` and
//!    re-run the same way;
//! 3. documents stuck non-terminal whose page jobs are all terminal get their
//!    rollup re-run, full-refund path included.
//!
//! Every repair only touches records past a staleness window, so the sweeper
//! never races a worker that is actively progressing a fresh job, and it is
//! safe to run concurrently with itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::services::dispatch::JobRef;
use crate::services::jobs::{JobStore, JobStoreError, PageJobStatus};
use crate::services::ledger::CreditLedger;
use crate::services::worker::ExtractionWorker;

/// Configuration for the sweep pass.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Age after which a `queued` job counts as lost (milliseconds).
    pub queued_stale_ms: i64,
    /// Idle time before a `retryable` job is re-queued (milliseconds).
    pub retry_cooldown_ms: i64,
    /// Age after which a non-terminal document is checked for an orphaned
    /// rollup (milliseconds).
    pub document_stale_ms: i64,
    /// Maximum records repaired per category per run.
    pub batch_limit: usize,
    /// Pause between individual re-dispatches.
    pub pacing: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            queued_stale_ms: 900_000,      // 15 minutes
            retry_cooldown_ms: 300_000,    // 5 minutes
            document_stale_ms: 1_800_000,  // 30 minutes
            batch_limit: 25,
            pacing: Duration::from_millis(500),
        }
    }
}

/// Report of one sweep execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// Stale queued jobs that were re-run.
    pub redispatched: Vec<String>,
    /// Retryable jobs reset to queued and re-run.
    pub requeued: Vec<String>,
    /// Documents whose orphaned rollup was completed.
    pub finalized: Vec<String>,
    /// Records inspected but left alone.
    pub skipped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.redispatched.is_empty()
            && self.requeued.is_empty()
            && self.finalized.is_empty()
            && self.skipped == 0
    }

    pub fn total(&self) -> usize {
        self.redispatched.len() + self.requeued.len() + self.finalized.len() + self.skipped
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("sweep configuration invalid: {0}")]
    InvalidConfig(String),
}

pub struct Sweeper {
    jobs: JobStore,
    ledger: CreditLedger,
    worker: Arc<ExtractionWorker>,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(
        jobs: JobStore,
        ledger: CreditLedger,
        worker: Arc<ExtractionWorker>,
        config: SweepConfig,
    ) -> Self {
        Self {
            jobs,
            ledger,
            worker,
            config,
        }
    }

    /// Run one sweep pass.
    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        if self.config.queued_stale_ms <= 0
            || self.config.retry_cooldown_ms <= 0
            || self.config.document_stale_ms <= 0
        {
            return Err(SweepError::InvalidConfig(
                "staleness thresholds must be positive".to_string(),
            ));
        }
        if self.config.batch_limit == 0 {
            return Err(SweepError::InvalidConfig(
                "batch limit must be positive".to_string(),
            ));
        }

        let mut report = SweepReport::default();
        self.redispatch_stale_queued(&mut report).await?;
        self.requeue_cooled_retryable(&mut report).await?;
        self.finalize_orphaned_documents(&mut report)?;

        if !report.is_empty() {
            info!(
                redispatched = report.redispatched.len(),
                requeued = report.requeued.len(),
                finalized = report.finalized.len(),
                skipped = report.skipped,
                "sweep pass complete"
            );
        }
        Ok(report)
    }

    /// Repair 1: queued jobs whose dispatch was lost. Unlike the
    /// orchestrator's fire-and-forget, the sweeper awaits each worker so one
    /// pass re-dispatches each job exactly once.
    async fn redispatch_stale_queued(&self, report: &mut SweepReport) -> Result<(), SweepError> {
        let stale = self
            .jobs
            .list_stale_queued(self.config.queued_stale_ms, self.config.batch_limit)?;
        for (index, job) in stale.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.pacing).await;
            }
            let key = job.key();
            let job_ref = JobRef {
                document_id: job.document_id,
                page_number: job.page_number,
                tenant_id: job.tenant_id,
            };
            match self.worker.run(&job_ref).await {
                Ok(_) => report.redispatched.push(key),
                Err(err) => {
                    warn!(job = %key, error = %err, "stale job re-dispatch failed");
                    report.skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// Repair 2: retryable jobs past their cooldown go back to queued and run
    /// immediately.
    async fn requeue_cooled_retryable(&self, report: &mut SweepReport) -> Result<(), SweepError> {
        let due = self
            .jobs
            .list_retryable_due(self.config.retry_cooldown_ms, self.config.batch_limit)?;
        for (index, job) in due.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.pacing).await;
            }
            let requeued = self.jobs.requeue_job(&job.document_id, job.page_number)?;
            if requeued.status != PageJobStatus::Queued {
                report.skipped += 1;
                continue;
            }
            let key = job.key();
            let job_ref = JobRef {
                document_id: job.document_id,
                page_number: job.page_number,
                tenant_id: job.tenant_id,
            };
            match self.worker.run(&job_ref).await {
                Ok(_) => report.requeued.push(key),
                Err(err) => {
                    warn!(job = %key, error = %err, "requeued job re-dispatch failed");
                    report.skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// Repair 3: documents stuck non-terminal whose jobs all finished, the
    /// crash window between worker finalize and rollup. Re-running the rollup
    /// is idempotent and includes the all-failed refund path.
    fn finalize_orphaned_documents(&self, report: &mut SweepReport) -> Result<(), SweepError> {
        let stuck = self
            .jobs
            .list_stuck_documents(self.config.document_stale_ms, self.config.batch_limit)?;
        for document in stuck {
            match self
                .jobs
                .rollup_document(&self.ledger, &document.document_id)?
            {
                Some(status) => {
                    info!(
                        document_id = %document.document_id,
                        status = status.as_str(),
                        "orphaned document finalized"
                    );
                    report.finalized.push(document.document_id);
                }
                None => report.skipped += 1,
            }
        }
        Ok(())
    }
}
