//! Extraction worker: drives one page job to a terminal or retryable state.
//!
//! The worker owns the whole page lifecycle: fetch the page object, call the
//! extraction service with bounded in-call retry, deduplicate, replace the
//! page's line items, transition the job, and trigger the document rollup.
//! Item persistence is all-or-nothing per page; a half-extracted page never
//! reaches the analytical store.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::PAGE_OBJECT_BUCKET;
use crate::services::dedup::dedup_items;
use crate::services::dispatch::JobRef;
use crate::services::extract::{ExtractError, ExtractionClient, ExtractionOutcome, PagePayload};
use crate::services::items::{ItemStore, ItemStoreError, LineItem};
use crate::services::jobs::{JobStore, JobStoreError, PageJob, PageJobStatus};
use crate::services::ledger::CreditLedger;
use crate::services::object_store::{ObjectStore, ObjectStoreError};

/// Bounded retry for transient extraction errors within one worker run.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total call attempts, first call included.
    pub max_calls: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_calls: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Exponential backoff with jitter, capped to the policy window.
fn retry_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    use rand::Rng;
    let exponent = attempt.min(16);
    let multiplier = 2_u64.saturating_pow(exponent);
    let delay_ms = (policy.base_delay.as_millis() as u64).saturating_mul(multiplier);
    let capped = delay_ms.min(policy.max_delay.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    let final_ms = ((capped as f64) * jitter) as u64;
    Duration::from_millis(final_ms.clamp(
        policy.base_delay.as_millis() as u64,
        policy.max_delay.as_millis() as u64,
    ))
}

/// Terminal disposition of one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Job is `succeeded` with this many items persisted.
    Succeeded { items: usize },
    /// Job consumed an attempt and waits for the sweeper's cooldown.
    Retryable,
    /// Job is permanently `failed`.
    Failed,
    /// Job was already terminal; nothing was done.
    AlreadyTerminal,
}

/// Infrastructure-level worker errors: these mean the run could not even
/// record its own failure in the job store.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("page job not found for {document_id} page {page_number}")]
    UnknownJob {
        document_id: String,
        page_number: u32,
    },
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("item persistence task failed: {0}")]
    PersistJoin(String),
}

pub struct ExtractionWorker {
    jobs: JobStore,
    ledger: CreditLedger,
    objects: Arc<dyn ObjectStore>,
    items: Arc<ItemStore>,
    client: Arc<dyn ExtractionClient>,
    retry: RetryPolicy,
}

impl ExtractionWorker {
    pub fn new(
        jobs: JobStore,
        ledger: CreditLedger,
        objects: Arc<dyn ObjectStore>,
        items: Arc<ItemStore>,
        client: Arc<dyn ExtractionClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            jobs,
            ledger,
            objects,
            items,
            client,
            retry,
        }
    }

    /// Run one page job to a terminal or retryable state.
    pub async fn run(&self, job_ref: &JobRef) -> Result<WorkerOutcome, WorkerError> {
        let job = self
            .jobs
            .get_page_job(&job_ref.document_id, job_ref.page_number)?
            .ok_or_else(|| WorkerError::UnknownJob {
                document_id: job_ref.document_id.clone(),
                page_number: job_ref.page_number,
            })?;

        if job.status.is_terminal() {
            debug!(
                document_id = %job.document_id,
                page = job.page_number,
                status = ?job.status,
                "skipping terminal page job"
            );
            return Ok(WorkerOutcome::AlreadyTerminal);
        }

        let png = match self.objects.get(PAGE_OBJECT_BUCKET, &job.object_key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                // A vanished page object will not come back; transient IO might.
                let permanent = matches!(err, ObjectStoreError::NotFound { .. });
                return self
                    .fail(&job, &format!("page object fetch failed: {err}"), permanent)
                    .await;
            }
        };

        let payload = PagePayload {
            document_id: job.document_id.clone(),
            page_number: job.page_number,
            png,
        };

        let outcome = match self.call_with_retry(&payload).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let permanent = !err.is_retryable();
                return self.fail(&job, &err.to_string(), permanent).await;
            }
        };

        // An empty payload is a successful zero-item extraction: blank page,
        // cover page, or a page with no remittance rows.
        let deduped = dedup_items(outcome.items);
        let lines: Vec<LineItem> = deduped
            .into_iter()
            .enumerate()
            .map(|(ordinal, item)| {
                LineItem::from_extracted(&job.document_id, job.page_number, ordinal as u32, item)
            })
            .collect();

        if let Err(err) = self.persist_page(&job, lines.clone()).await {
            return self.fail(&job, &format!("item persistence failed: {err}"), false).await;
        }

        let item_count = lines.len();
        self.jobs.mark_job_succeeded(
            &job.document_id,
            job.page_number,
            item_count as u32,
            Some(outcome.raw_response),
        )?;

        // Exception evaluation is a best-effort side effect; it must never
        // fail the page.
        self.refresh_review_flags(&job);

        self.jobs.rollup_document(&self.ledger, &job.document_id)?;
        Ok(WorkerOutcome::Succeeded { items: item_count })
    }

    /// Call the extraction service with bounded retry. Only rate-limit and
    /// unavailable errors retry, honoring the server's pacing hint over the
    /// local backoff schedule.
    async fn call_with_retry(
        &self,
        payload: &PagePayload,
    ) -> Result<ExtractionOutcome, ExtractError> {
        let mut attempt: u32 = 0;
        loop {
            match self.client.extract_page(payload).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.retry.max_calls {
                        return Err(err);
                    }
                    let delay = err
                        .retry_hint()
                        .unwrap_or_else(|| retry_backoff(&self.retry, attempt - 1));
                    warn!(
                        document_id = %payload.document_id,
                        page = payload.page_number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying extraction call"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn persist_page(&self, job: &PageJob, lines: Vec<LineItem>) -> Result<(), WorkerError> {
        let items = Arc::clone(&self.items);
        let document_id = job.document_id.clone();
        let page_number = job.page_number;
        tokio::task::spawn_blocking(move || items.replace_page(&document_id, page_number, &lines))
            .await
            .map_err(|e| WorkerError::PersistJoin(e.to_string()))?
            .map_err(|e: ItemStoreError| WorkerError::PersistJoin(e.to_string()))
    }

    fn refresh_review_flags(&self, job: &PageJob) {
        match self.items.evaluate_document(&job.document_id) {
            Ok(report) => {
                let status = if report.needs_review() {
                    crate::services::jobs::ReviewStatus::NeedsReview
                } else {
                    crate::services::jobs::ReviewStatus::None
                };
                if let Err(err) = self.jobs.set_review(
                    &job.document_id,
                    status,
                    report.review_reasons,
                    report.found_revenue,
                ) {
                    warn!(document_id = %job.document_id, error = %err, "review flag update failed");
                }
            }
            Err(err) => {
                warn!(document_id = %job.document_id, error = %err, "exception evaluation failed");
            }
        }
    }

    /// Record a failure per the state machine and roll up when terminal.
    async fn fail(
        &self,
        job: &PageJob,
        message: &str,
        permanent: bool,
    ) -> Result<WorkerOutcome, WorkerError> {
        let updated =
            self.jobs
                .mark_job_failed(&job.document_id, job.page_number, message, permanent)?;
        if updated.status == PageJobStatus::Failed {
            self.jobs.rollup_document(&self.ledger, &job.document_id)?;
            Ok(WorkerOutcome::Failed)
        } else {
            Ok(WorkerOutcome::Retryable)
        }
    }
}
