//! Durable document and page-job records with the extraction state machine.
//!
//! One `Document` per upload, one `PageJob` per (document, page). Page jobs
//! move `queued -> {succeeded | retryable | failed}`, with `retryable` jobs
//! re-queued by the sweeper after a cooldown. Once every page job is terminal
//! the document rollup derives the parent status and, for the all-failed
//! case, refunds the full page charge in the same write transaction.

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::DEFAULT_MAX_JOB_ATTEMPTS;
use crate::services::ledger::{CreditLedger, LedgerError};

const DOCUMENTS_DB: &str = "documents";
const PAGE_JOBS_DB: &str = "page_jobs";

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_JOB_ATTEMPTS
}

/// Lifecycle state of one uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    PartialFailure,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed | DocumentStatus::PartialFailure | DocumentStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::PartialFailure => "partial_failure",
            DocumentStatus::Failed => "failed",
        }
    }
}

/// Lifecycle state of one page job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageJobStatus {
    Queued,
    Retryable,
    Failed,
    Succeeded,
}

impl PageJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PageJobStatus::Succeeded | PageJobStatus::Failed)
    }
}

/// Review outcome attached to a document by exception evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    None,
    NeedsReview,
    Reviewed,
}

/// Parent record aggregating a document's page jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub tenant_id: String,
    pub status: DocumentStatus,
    pub page_count: u32,
    pub items_extracted: u32,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub exported_at_ms: Option<i64>,
    #[serde(default)]
    pub export_batch_id: Option<String>,
    #[serde(default)]
    pub found_revenue: bool,
    #[serde(default)]
    pub review_status: ReviewStatus,
    #[serde(default)]
    pub review_reasons: Vec<String>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub total_paid: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub total_patient_responsibility: Option<Decimal>,
    #[serde(default)]
    pub claim_count: Option<u32>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Document {
    #[must_use]
    pub fn new(document_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        let document_id = document_id.into();
        debug_assert!(!document_id.is_empty());
        let now_ms = current_timestamp_ms();
        Self {
            document_id,
            tenant_id: tenant_id.into(),
            status: DocumentStatus::Pending,
            page_count: 0,
            items_extracted: 0,
            error_code: None,
            error_message: None,
            exported_at_ms: None,
            export_batch_id: None,
            found_revenue: false,
            review_status: ReviewStatus::default(),
            review_reasons: Vec::new(),
            total_paid: None,
            total_patient_responsibility: None,
            claim_count: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn is_export_locked(&self) -> bool {
        self.exported_at_ms.is_some()
    }
}

/// Unit-of-work record for one page of one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageJob {
    pub document_id: String,
    pub page_number: u32,
    pub tenant_id: String,
    pub status: PageJobStatus,
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub object_key: String,
    pub items_extracted: u32,
    #[serde(default)]
    pub raw_response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl PageJob {
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        page_number: u32,
        tenant_id: impl Into<String>,
        object_key: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        let document_id = document_id.into();
        debug_assert!(!document_id.is_empty());
        debug_assert!(max_attempts > 0);
        let now_ms = current_timestamp_ms();
        Self {
            document_id,
            page_number,
            tenant_id: tenant_id.into(),
            status: PageJobStatus::Queued,
            attempts: 0,
            max_attempts,
            object_key: object_key.into(),
            items_extracted: 0,
            raw_response: None,
            error: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn key(&self) -> String {
        page_job_key(&self.document_id, self.page_number)
    }
}

/// Store key for a page job; zero-padded so prefix scans stay ordered.
pub fn page_job_key(document_id: &str, page_number: u32) -> String {
    format!("{document_id}/page-{page_number:03}")
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

/// Result of the admission charge step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged,
    AlreadyCharged,
    InsufficientCredits,
}

/// Errors emitted by the job store.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("document `{0}` already exists")]
    DuplicateDocument(String),
    #[error("document `{0}` not found")]
    DocumentNotFound(String),
    #[error("page job `{0}` not found")]
    JobNotFound(String),
}

/// LMDB-backed persistence for documents and page jobs.
#[derive(Debug, Clone)]
pub struct JobStore {
    env: Env,
    documents: Database<Str, Bytes>,
    page_jobs: Database<Str, Bytes>,
}

impl JobStore {
    pub fn open(env: &Env) -> Result<Self, JobStoreError> {
        let (documents, page_jobs) = {
            let mut wtxn = env.write_txn()?;
            let documents = env.create_database::<Str, Bytes>(&mut wtxn, Some(DOCUMENTS_DB))?;
            let page_jobs = env.create_database::<Str, Bytes>(&mut wtxn, Some(PAGE_JOBS_DB))?;
            wtxn.commit()?;
            (documents, page_jobs)
        };
        Ok(Self {
            env: env.clone(),
            documents,
            page_jobs,
        })
    }

    pub fn create_document(&self, document: &Document) -> Result<(), JobStoreError> {
        debug_assert!(!document.document_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        if self
            .documents
            .get(&wtxn, document.document_id.as_str())?
            .is_some()
        {
            return Err(JobStoreError::DuplicateDocument(
                document.document_id.clone(),
            ));
        }
        let encoded = encode_to_vec(document, config::standard())?;
        self.documents
            .put(&mut wtxn, document.document_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_document(&self, document_id: &str) -> Result<Option<Document>, JobStoreError> {
        let rtxn = self.env.read_txn()?;
        let value = self.documents.get(&rtxn, document_id)?;
        match value {
            Some(raw) => {
                let (document, _) = decode_from_slice::<Document, _>(raw, config::standard())?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    pub fn put_document(&self, document: &Document) -> Result<(), JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(document, config::standard())?;
        self.documents
            .put(&mut wtxn, document.document_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    /// Apply `mutate` to an existing document inside one write transaction.
    pub fn update_document<F>(&self, document_id: &str, mutate: F) -> Result<Document, JobStoreError>
    where
        F: FnOnce(&mut Document),
    {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .documents
            .get(&wtxn, document_id)?
            .ok_or_else(|| JobStoreError::DocumentNotFound(document_id.to_string()))?;
        let (mut document, _) = decode_from_slice::<Document, _>(raw, config::standard())?;
        mutate(&mut document);
        document.updated_at_ms = current_timestamp_ms();
        let encoded = encode_to_vec(&document, config::standard())?;
        self.documents
            .put(&mut wtxn, document_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(document)
    }

    pub fn mark_document_processing(
        &self,
        document_id: &str,
        page_count: u32,
    ) -> Result<Document, JobStoreError> {
        self.update_document(document_id, |doc| {
            doc.status = DocumentStatus::Processing;
            doc.page_count = page_count;
            doc.error_code = None;
            doc.error_message = None;
        })
    }

    pub fn fail_document(
        &self,
        document_id: &str,
        code: &str,
        message: &str,
    ) -> Result<Document, JobStoreError> {
        self.update_document(document_id, |doc| {
            doc.status = DocumentStatus::Failed;
            doc.error_code = Some(code.to_string());
            doc.error_message = Some(message.to_string());
        })
    }

    /// Admission step: charge the tenant for `page_count` pages and move the
    /// document to `processing`, in one transaction. A document that already
    /// fanned out (non-zero page count, past `pending`) is not charged again,
    /// which keeps a re-entered orchestration from double-charging.
    pub fn charge_and_mark_processing(
        &self,
        ledger: &CreditLedger,
        document_id: &str,
        page_count: u32,
    ) -> Result<ChargeOutcome, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .documents
            .get(&wtxn, document_id)?
            .ok_or_else(|| JobStoreError::DocumentNotFound(document_id.to_string()))?;
        let (mut document, _) = decode_from_slice::<Document, _>(raw, config::standard())?;

        let already_charged =
            document.page_count > 0 && document.status != DocumentStatus::Pending;
        if !already_charged && !ledger.charge_txn(&mut wtxn, &document.tenant_id, u64::from(page_count))? {
            return Ok(ChargeOutcome::InsufficientCredits);
        }

        document.status = DocumentStatus::Processing;
        document.page_count = page_count;
        document.error_code = None;
        document.error_message = None;
        document.updated_at_ms = current_timestamp_ms();
        let encoded = encode_to_vec(&document, config::standard())?;
        self.documents
            .put(&mut wtxn, document_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(if already_charged {
            ChargeOutcome::AlreadyCharged
        } else {
            ChargeOutcome::Charged
        })
    }

    /// Create the page job unless one already exists for this
    /// (document, page). Returns whether a new row was created; an existing
    /// row is never replaced, only re-queued through its own transitions.
    pub fn create_page_job(&self, job: &PageJob) -> Result<bool, JobStoreError> {
        debug_assert!(job.status == PageJobStatus::Queued);
        let key = job.key();
        let mut wtxn = self.env.write_txn()?;
        if self.page_jobs.get(&wtxn, key.as_str())?.is_some() {
            return Ok(false);
        }
        let encoded = encode_to_vec(job, config::standard())?;
        self.page_jobs
            .put(&mut wtxn, key.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(true)
    }

    pub fn get_page_job(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<Option<PageJob>, JobStoreError> {
        let key = page_job_key(document_id, page_number);
        let rtxn = self.env.read_txn()?;
        match self.page_jobs.get(&rtxn, key.as_str())? {
            Some(raw) => {
                let (job, _) = decode_from_slice::<PageJob, _>(raw, config::standard())?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// All page jobs belonging to one document, ordered by page number.
    pub fn jobs_for_document(&self, document_id: &str) -> Result<Vec<PageJob>, JobStoreError> {
        let prefix = format!("{document_id}/page-");
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.page_jobs.prefix_iter(&rtxn, prefix.as_str())? {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<PageJob, _>(raw, config::standard())?;
            out.push(job);
        }
        Ok(out)
    }

    fn put_job_txn(
        &self,
        wtxn: &mut heed::RwTxn,
        job: &PageJob,
    ) -> Result<(), JobStoreError> {
        let encoded = encode_to_vec(job, config::standard())?;
        self.page_jobs
            .put(wtxn, job.key().as_str(), encoded.as_slice())?;
        Ok(())
    }

    fn load_job_txn(
        &self,
        wtxn: &heed::RwTxn,
        document_id: &str,
        page_number: u32,
    ) -> Result<PageJob, JobStoreError> {
        let key = page_job_key(document_id, page_number);
        let raw = self
            .page_jobs
            .get(wtxn, key.as_str())?
            .ok_or(JobStoreError::JobNotFound(key))?;
        let (job, _) = decode_from_slice::<PageJob, _>(raw, config::standard())?;
        Ok(job)
    }

    /// Terminal success transition: record the extracted-item count and the
    /// raw response audit payload.
    pub fn mark_job_succeeded(
        &self,
        document_id: &str,
        page_number: u32,
        items_extracted: u32,
        raw_response: Option<String>,
    ) -> Result<PageJob, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let mut job = self.load_job_txn(&wtxn, document_id, page_number)?;
        job.status = PageJobStatus::Succeeded;
        job.items_extracted = items_extracted;
        job.raw_response = raw_response;
        job.error = None;
        job.updated_at_ms = current_timestamp_ms();
        self.put_job_txn(&mut wtxn, &job)?;
        wtxn.commit()?;
        Ok(job)
    }

    /// Failure transition. Always consumes one attempt; `permanent` failures
    /// and exhausted budgets go straight to `failed`, everything else becomes
    /// `retryable` for the sweeper.
    pub fn mark_job_failed(
        &self,
        document_id: &str,
        page_number: u32,
        error: &str,
        permanent: bool,
    ) -> Result<PageJob, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let mut job = self.load_job_txn(&wtxn, document_id, page_number)?;
        job.attempts = job.attempts.saturating_add(1);
        job.status = if permanent || job.attempts >= job.max_attempts {
            PageJobStatus::Failed
        } else {
            PageJobStatus::Retryable
        };
        job.error = Some(error.to_string());
        job.updated_at_ms = current_timestamp_ms();
        self.put_job_txn(&mut wtxn, &job)?;
        wtxn.commit()?;
        Ok(job)
    }

    /// Sweep transition: `retryable -> queued`. Jobs in any other state are
    /// returned unchanged so repeated sweeps stay idempotent.
    pub fn requeue_job(
        &self,
        document_id: &str,
        page_number: u32,
    ) -> Result<PageJob, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let mut job = self.load_job_txn(&wtxn, document_id, page_number)?;
        if job.status != PageJobStatus::Retryable {
            return Ok(job);
        }
        job.status = PageJobStatus::Queued;
        job.updated_at_ms = current_timestamp_ms();
        self.put_job_txn(&mut wtxn, &job)?;
        wtxn.commit()?;
        Ok(job)
    }

    /// Derive the document's terminal status once every page job is terminal.
    ///
    /// Idempotent: an already-terminal document is left untouched, which is
    /// what guarantees the all-failed refund happens exactly once: the
    /// refund and the terminal transition commit in the same transaction.
    /// Returns the newly assigned status, or `None` when nothing changed.
    pub fn rollup_document(
        &self,
        ledger: &CreditLedger,
        document_id: &str,
    ) -> Result<Option<DocumentStatus>, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .documents
            .get(&wtxn, document_id)?
            .ok_or_else(|| JobStoreError::DocumentNotFound(document_id.to_string()))?;
        let (mut document, _) = decode_from_slice::<Document, _>(raw, config::standard())?;
        if document.status.is_terminal() {
            return Ok(None);
        }

        let prefix = format!("{document_id}/page-");
        let mut succeeded: u32 = 0;
        let mut terminal: u32 = 0;
        let mut items: u32 = 0;
        for entry in self.page_jobs.prefix_iter(&wtxn, prefix.as_str())? {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<PageJob, _>(raw, config::standard())?;
            match job.status {
                PageJobStatus::Succeeded => {
                    succeeded += 1;
                    terminal += 1;
                    items = items.saturating_add(job.items_extracted);
                }
                PageJobStatus::Failed => terminal += 1,
                PageJobStatus::Queued | PageJobStatus::Retryable => {}
            }
        }

        let total = document.page_count;
        if total == 0 || terminal < total {
            return Ok(None);
        }

        let status = if succeeded == total {
            document.items_extracted = items;
            document.error_code = None;
            document.error_message = None;
            DocumentStatus::Completed
        } else if succeeded > 0 {
            document.items_extracted = items;
            document.error_code = Some("partial_failure".to_string());
            document.error_message = Some(format!("{succeeded} of {total} pages processed"));
            DocumentStatus::PartialFailure
        } else {
            // Nothing extracted: the whole page charge is returned, in this
            // same transaction.
            ledger.refund_txn(&mut wtxn, &document.tenant_id, u64::from(total))?;
            document.items_extracted = 0;
            document.error_code = Some("extraction_failed".to_string());
            document.error_message = Some(format!("0 of {total} pages processed"));
            DocumentStatus::Failed
        };

        document.status = status;
        document.updated_at_ms = current_timestamp_ms();
        let encoded = encode_to_vec(&document, config::standard())?;
        self.documents
            .put(&mut wtxn, document_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(Some(status))
    }

    /// Jobs sitting in `queued` whose last update is older than the
    /// threshold; their dispatch was lost.
    pub fn list_stale_queued(
        &self,
        age_threshold_ms: i64,
        limit: usize,
    ) -> Result<Vec<PageJob>, JobStoreError> {
        self.list_jobs_by_status_older_than(PageJobStatus::Queued, age_threshold_ms, limit)
    }

    /// Jobs in `retryable` that have cooled down past the retry window.
    pub fn list_retryable_due(
        &self,
        cooldown_ms: i64,
        limit: usize,
    ) -> Result<Vec<PageJob>, JobStoreError> {
        self.list_jobs_by_status_older_than(PageJobStatus::Retryable, cooldown_ms, limit)
    }

    fn list_jobs_by_status_older_than(
        &self,
        status: PageJobStatus,
        age_threshold_ms: i64,
        limit: usize,
    ) -> Result<Vec<PageJob>, JobStoreError> {
        debug_assert!(limit > 0);
        debug_assert!(age_threshold_ms >= 0);
        let cutoff_ms = current_timestamp_ms().saturating_sub(age_threshold_ms);
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.page_jobs.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<PageJob, _>(raw, config::standard())?;
            if job.status == status && job.updated_at_ms <= cutoff_ms {
                out.push(job);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Documents stuck non-terminal past the threshold; candidates for an
    /// orphaned rollup after a crash between worker finalize and rollup.
    pub fn list_stuck_documents(
        &self,
        age_threshold_ms: i64,
        limit: usize,
    ) -> Result<Vec<Document>, JobStoreError> {
        debug_assert!(limit > 0);
        let cutoff_ms = current_timestamp_ms().saturating_sub(age_threshold_ms);
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.documents.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (document, _) = decode_from_slice::<Document, _>(raw, config::standard())?;
            let stuck = matches!(
                document.status,
                DocumentStatus::Queued | DocumentStatus::Processing
            );
            if stuck && document.updated_at_ms <= cutoff_ms {
                out.push(document);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Stamp the export lock and computed summary stats on a document.
    #[allow(clippy::too_many_arguments)]
    pub fn stamp_export(
        &self,
        document_id: &str,
        batch_id: &str,
        exported_at_ms: i64,
        total_paid: Decimal,
        total_patient_responsibility: Decimal,
        claim_count: u32,
    ) -> Result<Document, JobStoreError> {
        self.update_document(document_id, |doc| {
            doc.exported_at_ms = Some(exported_at_ms);
            doc.export_batch_id = Some(batch_id.to_string());
            doc.total_paid = Some(total_paid);
            doc.total_patient_responsibility = Some(total_patient_responsibility);
            doc.claim_count = Some(claim_count);
        })
    }

    /// Release an export lock so the document can be re-encoded.
    pub fn clear_export_lock(&self, document_id: &str) -> Result<Document, JobStoreError> {
        self.update_document(document_id, |doc| {
            doc.exported_at_ms = None;
            doc.export_batch_id = None;
        })
    }

    /// Write back the outcome of exception evaluation.
    pub fn set_review(
        &self,
        document_id: &str,
        review_status: ReviewStatus,
        review_reasons: Vec<String>,
        found_revenue: bool,
    ) -> Result<Document, JobStoreError> {
        self.update_document(document_id, |doc| {
            doc.review_status = review_status;
            doc.review_reasons = review_reasons;
            doc.found_revenue = found_revenue;
        })
    }

    /// Operator reprocess: reset the document and every page job back to the
    /// queued state with fresh attempt budgets. Existing rows are reused, not
    /// re-created. Returns the re-queued jobs for dispatch.
    pub fn reset_for_reprocess(&self, document_id: &str) -> Result<Vec<PageJob>, JobStoreError> {
        let mut wtxn = self.env.write_txn()?;
        let raw = self
            .documents
            .get(&wtxn, document_id)?
            .ok_or_else(|| JobStoreError::DocumentNotFound(document_id.to_string()))?;
        let (mut document, _) = decode_from_slice::<Document, _>(raw, config::standard())?;
        document.status = DocumentStatus::Queued;
        document.items_extracted = 0;
        document.error_code = None;
        document.error_message = None;
        document.exported_at_ms = None;
        document.export_batch_id = None;
        document.updated_at_ms = current_timestamp_ms();
        let encoded = encode_to_vec(&document, config::standard())?;
        self.documents
            .put(&mut wtxn, document_id, encoded.as_slice())?;

        let prefix = format!("{document_id}/page-");
        let mut jobs = Vec::new();
        for entry in self.page_jobs.prefix_iter(&wtxn, prefix.as_str())? {
            let (_, raw) = entry?;
            let (job, _) = decode_from_slice::<PageJob, _>(raw, config::standard())?;
            jobs.push(job);
        }
        for job in &mut jobs {
            job.status = PageJobStatus::Queued;
            job.attempts = 0;
            job.items_extracted = 0;
            job.raw_response = None;
            job.error = None;
            job.updated_at_ms = current_timestamp_ms();
            self.put_job_txn(&mut wtxn, job)?;
        }
        wtxn.commit()?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;
    use crate::services::state::open_state_env;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: JobStore,
        ledger: CreditLedger,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("paths");
        let env = open_state_env(&paths).expect("env");
        Fixture {
            _temp: temp,
            store: JobStore::open(&env).expect("job store"),
            ledger: CreditLedger::open(&env).expect("ledger"),
        }
    }

    fn seed_document(fx: &Fixture, document_id: &str, pages: u32) {
        let mut doc = Document::new(document_id, "tenant-a");
        doc.status = DocumentStatus::Processing;
        doc.page_count = pages;
        fx.store.create_document(&doc).expect("create document");
        for page in 1..=pages {
            let job = PageJob::new(document_id, page, "tenant-a", format!("{document_id}/page-{page:03}.png"), 3);
            assert!(fx.store.create_page_job(&job).expect("create job"));
        }
    }

    #[test]
    fn admission_charge_debits_once_and_marks_processing() {
        let fx = fixture();
        fx.ledger.grant("tenant-a", 5).expect("grant");
        let doc = Document::new("doc-1", "tenant-a");
        fx.store.create_document(&doc).expect("create");

        let outcome = fx
            .store
            .charge_and_mark_processing(&fx.ledger, "doc-1", 3)
            .expect("charge");
        assert_eq!(outcome, ChargeOutcome::Charged);
        assert_eq!(fx.ledger.balance("tenant-a").expect("balance"), 2);
        let doc = fx.store.get_document("doc-1").expect("get").expect("doc");
        assert_eq!(doc.status, DocumentStatus::Processing);
        assert_eq!(doc.page_count, 3);

        // A re-entered orchestration must not charge again.
        let outcome = fx
            .store
            .charge_and_mark_processing(&fx.ledger, "doc-1", 3)
            .expect("recharge");
        assert_eq!(outcome, ChargeOutcome::AlreadyCharged);
        assert_eq!(fx.ledger.balance("tenant-a").expect("balance"), 2);
    }

    #[test]
    fn admission_charge_rejects_insufficient_balance_without_mutation() {
        let fx = fixture();
        fx.ledger.grant("tenant-a", 2).expect("grant");
        let doc = Document::new("doc-1", "tenant-a");
        fx.store.create_document(&doc).expect("create");

        let outcome = fx
            .store
            .charge_and_mark_processing(&fx.ledger, "doc-1", 3)
            .expect("charge");
        assert_eq!(outcome, ChargeOutcome::InsufficientCredits);
        assert_eq!(fx.ledger.balance("tenant-a").expect("balance"), 2);
        let doc = fx.store.get_document("doc-1").expect("get").expect("doc");
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    #[test]
    fn page_job_creation_is_idempotent() {
        let fx = fixture();
        seed_document(&fx, "doc-1", 1);
        let job = PageJob::new("doc-1", 1, "tenant-a", "doc-1/page-001.png", 3);
        assert!(!fx.store.create_page_job(&job).expect("second create"));
    }

    #[test]
    fn failure_consumes_attempts_until_budget_exhausted() {
        let fx = fixture();
        seed_document(&fx, "doc-1", 1);

        let job = fx
            .store
            .mark_job_failed("doc-1", 1, "rate limited", false)
            .expect("fail");
        assert_eq!(job.status, PageJobStatus::Retryable);
        assert_eq!(job.attempts, 1);

        fx.store.requeue_job("doc-1", 1).expect("requeue");
        fx.store
            .mark_job_failed("doc-1", 1, "rate limited", false)
            .expect("fail");
        let job = fx
            .store
            .mark_job_failed("doc-1", 1, "rate limited", false)
            .expect("fail");
        assert_eq!(job.status, PageJobStatus::Failed);
        assert_eq!(job.attempts, 3);
    }

    #[test]
    fn permanent_failure_skips_retry_budget() {
        let fx = fixture();
        seed_document(&fx, "doc-1", 1);
        let job = fx
            .store
            .mark_job_failed("doc-1", 1, "malformed response", true)
            .expect("fail");
        assert_eq!(job.status, PageJobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn requeue_leaves_non_retryable_jobs_alone() {
        let fx = fixture();
        seed_document(&fx, "doc-1", 1);
        let job = fx.store.requeue_job("doc-1", 1).expect("requeue");
        assert_eq!(job.status, PageJobStatus::Queued);
        fx.store
            .mark_job_succeeded("doc-1", 1, 2, None)
            .expect("succeed");
        let job = fx.store.requeue_job("doc-1", 1).expect("requeue");
        assert_eq!(job.status, PageJobStatus::Succeeded);
    }

    #[test]
    fn rollup_waits_for_all_terminal() {
        let fx = fixture();
        seed_document(&fx, "doc-1", 2);
        fx.store
            .mark_job_succeeded("doc-1", 1, 2, None)
            .expect("succeed");
        let outcome = fx
            .store
            .rollup_document(&fx.ledger, "doc-1")
            .expect("rollup");
        assert!(outcome.is_none());
        let doc = fx.store.get_document("doc-1").expect("get").expect("doc");
        assert_eq!(doc.status, DocumentStatus::Processing);
    }

    #[test]
    fn rollup_completed_sums_items() {
        let fx = fixture();
        seed_document(&fx, "doc-1", 3);
        for page in 1..=3 {
            fx.store
                .mark_job_succeeded("doc-1", page, 2, None)
                .expect("succeed");
        }
        let outcome = fx
            .store
            .rollup_document(&fx.ledger, "doc-1")
            .expect("rollup");
        assert_eq!(outcome, Some(DocumentStatus::Completed));
        let doc = fx.store.get_document("doc-1").expect("get").expect("doc");
        assert_eq!(doc.items_extracted, 6);
        assert!(doc.error_message.is_none());
    }

    #[test]
    fn rollup_partial_failure_reports_page_ratio_and_keeps_credits() {
        let fx = fixture();
        fx.ledger.grant("tenant-a", 10).expect("grant");
        assert!(fx.ledger.charge("tenant-a", 2).expect("charge"));
        seed_document(&fx, "doc-1", 2);

        fx.store
            .mark_job_succeeded("doc-1", 1, 1, None)
            .expect("succeed");
        for _ in 0..3 {
            fx.store
                .mark_job_failed("doc-1", 2, "boom", false)
                .expect("fail");
            fx.store.requeue_job("doc-1", 2).expect("requeue");
        }
        let job = fx.store.get_page_job("doc-1", 2).expect("get").expect("job");
        assert_eq!(job.status, PageJobStatus::Failed);

        let outcome = fx
            .store
            .rollup_document(&fx.ledger, "doc-1")
            .expect("rollup");
        assert_eq!(outcome, Some(DocumentStatus::PartialFailure));
        let doc = fx.store.get_document("doc-1").expect("get").expect("doc");
        assert_eq!(doc.items_extracted, 1);
        assert_eq!(doc.error_message.as_deref(), Some("1 of 2 pages processed"));
        // Partial consumption is intentional: no refund.
        assert_eq!(fx.ledger.balance("tenant-a").expect("balance"), 8);
    }

    #[test]
    fn rollup_total_failure_refunds_full_charge_once() {
        let fx = fixture();
        fx.ledger.grant("tenant-a", 5).expect("grant");
        assert!(fx.ledger.charge("tenant-a", 1).expect("charge"));
        seed_document(&fx, "doc-1", 1);

        fx.store
            .mark_job_failed("doc-1", 1, "boom", true)
            .expect("fail");

        let outcome = fx
            .store
            .rollup_document(&fx.ledger, "doc-1")
            .expect("rollup");
        assert_eq!(outcome, Some(DocumentStatus::Failed));
        assert_eq!(fx.ledger.balance("tenant-a").expect("balance"), 5);

        // Idempotent: a second rollup must not refund again.
        let outcome = fx
            .store
            .rollup_document(&fx.ledger, "doc-1")
            .expect("rollup");
        assert!(outcome.is_none());
        assert_eq!(fx.ledger.balance("tenant-a").expect("balance"), 5);
    }

    #[test]
    fn rollup_is_order_independent() {
        // Same terminal assignment reached in different orders must yield the
        // same document status.
        for order in [[1_u32, 2, 3], [3, 1, 2], [2, 3, 1]] {
            let fx = fixture();
            seed_document(&fx, "doc-1", 3);
            for page in order {
                if page == 2 {
                    fx.store
                        .mark_job_failed("doc-1", page, "boom", true)
                        .expect("fail");
                } else {
                    fx.store
                        .mark_job_succeeded("doc-1", page, 1, None)
                        .expect("succeed");
                }
            }
            let outcome = fx
                .store
                .rollup_document(&fx.ledger, "doc-1")
                .expect("rollup");
            assert_eq!(outcome, Some(DocumentStatus::PartialFailure));
        }
    }

    #[test]
    fn stale_listing_respects_status_and_age() {
        let fx = fixture();
        seed_document(&fx, "doc-1", 2);
        fx.store
            .mark_job_succeeded("doc-1", 2, 1, None)
            .expect("succeed");

        // Zero threshold makes every queued job stale immediately.
        let stale = fx.store.list_stale_queued(0, 10).expect("list");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].page_number, 1);

        // A large threshold hides fresh jobs.
        let stale = fx.store.list_stale_queued(3_600_000, 10).expect("list");
        assert!(stale.is_empty());
    }

    #[test]
    fn reprocess_resets_document_and_jobs() {
        let fx = fixture();
        seed_document(&fx, "doc-1", 2);
        fx.store
            .mark_job_failed("doc-1", 1, "boom", true)
            .expect("fail");
        fx.store
            .mark_job_failed("doc-1", 2, "boom", true)
            .expect("fail");
        fx.store
            .rollup_document(&fx.ledger, "doc-1")
            .expect("rollup");

        let jobs = fx.store.reset_for_reprocess("doc-1").expect("reset");
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == PageJobStatus::Queued));
        assert!(jobs.iter().all(|j| j.attempts == 0));
        let doc = fx.store.get_document("doc-1").expect("get").expect("doc");
        assert_eq!(doc.status, DocumentStatus::Queued);
        assert!(doc.error_message.is_none());
    }
}
