//! Split & enqueue orchestration.
//!
//! One uploaded document becomes one page object and one page job per page,
//! then workers are dispatched in fixed-size batches with an inter-batch
//! delay. Page materialization and job creation are both idempotent so a
//! re-entered orchestration converges instead of duplicating work; dispatch
//! failures are non-fatal because the sweeper re-fires lost jobs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{info, warn};

use crate::constants::PAGE_OBJECT_BUCKET;
use crate::pdf::{self, PdfError};
use crate::services::dispatch::{JobRef, TaskDispatcher};
use crate::services::jobs::{ChargeOutcome, Document, JobStore, JobStoreError, PageJob};
use crate::services::ledger::{CreditLedger, LedgerError};
use crate::services::object_store::{ObjectStore, ObjectStoreError, StoreKind, page_key};

/// Where the uploaded document's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSource {
    Url(String),
    Object {
        store: StoreKind,
        bucket: String,
        key: String,
    },
}

/// One upload to fan out.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub document_id: String,
    pub tenant_id: String,
    pub source: PageSource,
}

/// What the orchestration accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub document_id: String,
    pub page_count: u32,
    pub jobs_created: u32,
    pub jobs_dispatched: u32,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("document `{0}` is already terminal; use reprocess")]
    AlreadyTerminal(String),
    #[error("insufficient credits for {document_id}: {page_count} pages required")]
    InsufficientCredits {
        document_id: String,
        page_count: u32,
    },
    #[error("document exceeds the page ceiling: {page_count} > {max_pages}")]
    TooManyPages { page_count: u32, max_pages: u32 },
    #[error("document has no pages")]
    EmptyDocument,
    #[error("failed to download source document: {0}")]
    Download(String),
    #[error(transparent)]
    Pdf(#[from] PdfError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Objects(#[from] ObjectStoreError),
    #[error("page render task failed: {0}")]
    RenderJoin(String),
}

/// Tuning for the fan-out phase.
#[derive(Debug, Clone, bon::Builder)]
pub struct OrchestratorConfig {
    #[builder(default = crate::constants::DEFAULT_MAX_PAGES_PER_DOCUMENT)]
    pub max_pages: u32,
    #[builder(default = crate::constants::DEFAULT_MAX_JOB_ATTEMPTS)]
    pub max_attempts: u32,
    #[builder(default = crate::constants::DEFAULT_RENDER_WIDTH)]
    pub render_width: u32,
    #[builder(default = crate::constants::DEFAULT_DISPATCH_BATCH_SIZE)]
    pub batch_size: usize,
    #[builder(default = Duration::from_millis(crate::constants::DEFAULT_DISPATCH_BATCH_DELAY_MS))]
    pub batch_delay: Duration,
}

pub struct Orchestrator {
    jobs: JobStore,
    ledger: CreditLedger,
    primary: Arc<dyn ObjectStore>,
    secondary: Arc<dyn ObjectStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    http: reqwest::Client,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        jobs: JobStore,
        ledger: CreditLedger,
        primary: Arc<dyn ObjectStore>,
        secondary: Arc<dyn ObjectStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            jobs,
            ledger,
            primary,
            secondary,
            dispatcher,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Fan one document out into page jobs and dispatch workers.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestSummary, OrchestratorError> {
        let document = match self.jobs.get_document(&request.document_id)? {
            Some(existing) => {
                if existing.status.is_terminal() {
                    return Err(OrchestratorError::AlreadyTerminal(request.document_id));
                }
                existing
            }
            None => {
                let document = Document::new(&request.document_id, &request.tenant_id);
                self.jobs.create_document(&document)?;
                document
            }
        };

        let bytes = self.download(&request.source).await?;

        let page_count = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || pdf::page_count(&bytes))
                .await
                .map_err(|e| OrchestratorError::RenderJoin(e.to_string()))??
        };

        // Admission checks happen before any job-store fan-out or charge.
        if page_count == 0 {
            self.jobs.fail_document(
                &document.document_id,
                "empty_document",
                "document has no pages",
            )?;
            return Err(OrchestratorError::EmptyDocument);
        }
        if page_count > self.config.max_pages {
            let message = format!(
                "document has {page_count} pages; ceiling is {}",
                self.config.max_pages
            );
            self.jobs
                .fail_document(&document.document_id, "too_many_pages", &message)?;
            return Err(OrchestratorError::TooManyPages {
                page_count,
                max_pages: self.config.max_pages,
            });
        }

        match self
            .jobs
            .charge_and_mark_processing(&self.ledger, &document.document_id, page_count)?
        {
            ChargeOutcome::InsufficientCredits => {
                self.jobs.fail_document(
                    &document.document_id,
                    "insufficient_credits",
                    &format!("{page_count} page credits required"),
                )?;
                return Err(OrchestratorError::InsufficientCredits {
                    document_id: document.document_id.clone(),
                    page_count,
                });
            }
            ChargeOutcome::Charged | ChargeOutcome::AlreadyCharged => {}
        }

        // Everything from here until all job rows exist refunds in full on
        // failure: the tenant paid for a fan-out that never happened.
        let jobs = match self
            .materialize_pages(&request, &document, bytes, page_count)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(
                    document_id = %document.document_id,
                    error = %err,
                    "fan-out failed; refunding full page charge"
                );
                self.ledger
                    .refund(&document.tenant_id, u64::from(page_count))?;
                self.jobs.fail_document(
                    &document.document_id,
                    "enqueue_failed",
                    &format!("page fan-out failed: {err}"),
                )?;
                return Err(err);
            }
        };

        let jobs_created = jobs.iter().filter(|(_, created)| *created).count() as u32;
        let dispatched = self.dispatch_in_batches(&request, &jobs).await;

        info!(
            document_id = %document.document_id,
            page_count,
            jobs_created,
            dispatched,
            "document fanned out"
        );
        Ok(IngestSummary {
            document_id: document.document_id.clone(),
            page_count,
            jobs_created,
            jobs_dispatched: dispatched,
        })
    }

    async fn download(&self, source: &PageSource) -> Result<Bytes, OrchestratorError> {
        match source {
            PageSource::Url(url) => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| OrchestratorError::Download(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(OrchestratorError::Download(format!(
                        "{url} returned {}",
                        response.status()
                    )));
                }
                response
                    .bytes()
                    .await
                    .map_err(|e| OrchestratorError::Download(e.to_string()))
            }
            PageSource::Object { store, bucket, key } => {
                let backend = match store {
                    StoreKind::Primary => &self.primary,
                    StoreKind::Secondary => &self.secondary,
                };
                Ok(backend.get(bucket, key).await?)
            }
        }
    }

    /// Render and upload page objects and create job rows, skipping whatever
    /// already exists from an earlier interrupted run.
    async fn materialize_pages(
        &self,
        request: &IngestRequest,
        document: &Document,
        bytes: Bytes,
        page_count: u32,
    ) -> Result<Vec<(PageJob, bool)>, OrchestratorError> {
        let render_width = self.config.render_width;
        let pages = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || pdf::render_pages_to_png(&bytes, render_width))
                .await
                .map_err(|e| OrchestratorError::RenderJoin(e.to_string()))??
        };
        debug_assert_eq!(pages.len() as u32, page_count);

        let mut jobs = Vec::with_capacity(pages.len());
        for page in pages {
            let page_number = page.page_index as u32 + 1;
            let key = page_key(&document.document_id, page_number);

            if self.primary.head(PAGE_OBJECT_BUCKET, &key).await?.is_none() {
                self.primary
                    .put(PAGE_OBJECT_BUCKET, &key, Bytes::from(page.png_data))
                    .await?;
            }

            let job = PageJob::new(
                &document.document_id,
                page_number,
                &request.tenant_id,
                &key,
                self.config.max_attempts,
            );
            let created = self.jobs.create_page_job(&job)?;
            jobs.push((job, created));
        }
        Ok(jobs)
    }

    /// Fire workers in fixed-size batches with an inter-batch delay. Failures
    /// here are logged, never propagated: the job rows exist, and the sweeper
    /// re-fires anything whose dispatch was lost.
    async fn dispatch_in_batches(
        &self,
        request: &IngestRequest,
        jobs: &[(PageJob, bool)],
    ) -> u32 {
        let mut dispatched = 0u32;
        for (batch_index, batch) in jobs.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            for (job, _) in batch {
                let job_ref = JobRef {
                    document_id: job.document_id.clone(),
                    page_number: job.page_number,
                    tenant_id: request.tenant_id.clone(),
                };
                match self.dispatcher.dispatch(job_ref).await {
                    Ok(()) => dispatched += 1,
                    Err(err) => {
                        warn!(
                            document_id = %job.document_id,
                            page = job.page_number,
                            error = %err,
                            "worker dispatch not accepted; sweeper will recover"
                        );
                    }
                }
            }
        }
        dispatched
    }
}
