//! Worker invocation abstraction.
//!
//! Dispatch returns only "accepted for execution": the worker owns its own
//! terminal-state transition and the sweeper is the backstop for invocations
//! that are accepted but never run to completion. Callers therefore wait on a
//! short acceptance ack, never on the worker itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::services::worker::ExtractionWorker;

/// Addressable identity of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub document_id: String,
    pub page_number: u32,
    pub tenant_id: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch confirmation timed out")]
    ConfirmationTimeout,
    #[error("worker task rejected the dispatch")]
    Rejected,
}

/// Fire a worker invocation for a job. Implementations must not block on the
/// worker's completion.
#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, job: JobRef) -> Result<(), DispatchError>;
}

/// In-process dispatcher: spawns the worker on the runtime and confirms
/// acceptance over a oneshot channel.
pub struct TokioDispatcher {
    worker: Arc<ExtractionWorker>,
    confirm_timeout: Duration,
}

impl TokioDispatcher {
    pub fn new(worker: Arc<ExtractionWorker>, confirm_timeout: Duration) -> Self {
        Self {
            worker,
            confirm_timeout,
        }
    }
}

#[async_trait::async_trait]
impl TaskDispatcher for TokioDispatcher {
    async fn dispatch(&self, job: JobRef) -> Result<(), DispatchError> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            let _ = accepted_tx.send(());
            let document_id = job.document_id.clone();
            let page_number = job.page_number;
            if let Err(err) = worker.run(&job).await {
                warn!(
                    document_id,
                    page = page_number,
                    error = %err,
                    "dispatched worker failed outside the job state machine"
                );
            }
        });

        match tokio::time::timeout(self.confirm_timeout, accepted_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DispatchError::Rejected),
            Err(_) => Err(DispatchError::ConfirmationTimeout),
        }
    }
}
