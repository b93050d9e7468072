//! Remitra: page-level remittance extraction pipeline and export.
//!
//! An uploaded remittance document fans out into one job per page; workers
//! drive each page through the external extraction service, deduplicate the
//! results, and persist them page-atomically; a rollup derives the document's
//! terminal status; a periodic sweeper repairs lost dispatches and orphaned
//! rollups; and reconciled documents encode into an electronic remittance
//! file via `remitra-edi`.

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod paths;
pub mod pdf;
pub mod services;
