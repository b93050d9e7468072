//! Application-level error type shared across the binary and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::pdf::PdfError;
use crate::services::{
    DispatchError, ExportError, ExtractError, ItemStoreError, JobStoreError, LedgerError,
    ObjectStoreError, OrchestratorError, StateEnvError, SweepError, WorkerError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    State(#[from] StateEnvError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Jobs(#[from] Box<JobStoreError>),
    #[error(transparent)]
    Items(#[from] ItemStoreError),
    #[error(transparent)]
    Objects(#[from] ObjectStoreError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Sweep(#[from] SweepError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Pdf(#[from] PdfError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("document `{0}` not found")]
    DocumentNotFound(String),
    #[error("no billing profile for tenant `{0}`")]
    ProfileNotFound(String),
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u64, available: u64 },
    #[error("{0}")]
    InvalidArgument(String),
}

impl From<JobStoreError> for AppError {
    fn from(e: JobStoreError) -> Self {
        AppError::Jobs(Box::new(e))
    }
}
