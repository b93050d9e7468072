//! Orchestration layer for IO-bound pipeline services.
//!
//! Modules exposed here coordinate durable state (LMDB, SQLite), object
//! storage, and the external extraction service. Pure transforms live in
//! `remitra-edi` or dedicated modules so concurrency and resource accounting
//! stay localized.

pub mod dedup;
pub mod dispatch;
pub mod export;
pub mod extract;
pub mod items;
pub mod jobs;
pub mod ledger;
pub mod object_store;
pub mod orchestrator;
pub mod state;
pub mod sweeper;
pub mod worker;

pub use dedup::dedup_items;
pub use dispatch::{DispatchError, JobRef, TaskDispatcher, TokioDispatcher};
pub use export::{ExportError, ExportResult, ExportService, ProfileStore, TenantProfile};
pub use extract::{
    ExtractError, ExtractedItem, ExtractionClient, ExtractionOutcome, GenericRateLimiter,
    HttpExtractionClient, PagePayload,
};
pub use items::{
    ExceptionReport, ItemEdits, ItemKey, ItemStore, ItemStoreError, LineItem, ReconciliationRow,
    ReconciliationState,
};
pub use jobs::{
    ChargeOutcome, Document, DocumentStatus, JobStore, JobStoreError, PageJob, PageJobStatus,
    ReviewStatus, page_job_key,
};
pub use ledger::{CreditLedger, LedgerError};
pub use object_store::{
    FsObjectStore, ObjectMeta, ObjectStore, ObjectStoreError, StoreKind, page_key,
};
pub use orchestrator::{
    IngestRequest, IngestSummary, Orchestrator, OrchestratorConfig, OrchestratorError, PageSource,
};
pub use state::{StateEnvError, open_state_env};
pub use sweeper::{SweepConfig, SweepError, SweepReport, Sweeper};
pub use worker::{ExtractionWorker, RetryPolicy, WorkerError, WorkerOutcome};
