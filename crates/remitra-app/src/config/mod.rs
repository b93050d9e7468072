//! Configuration loading and XDG path helpers.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_DISPATCH_BATCH_DELAY_MS, DEFAULT_DISPATCH_BATCH_SIZE,
    DEFAULT_DISPATCH_CONFIRM_TIMEOUT_MS, DEFAULT_EXTRACTION_MODEL, DEFAULT_MAX_JOB_ATTEMPTS,
    DEFAULT_MAX_PAGES_PER_DOCUMENT, DEFAULT_RENDER_WIDTH,
};

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub dispatch: DispatchConfig,
    pub limits: LimitsConfig,
    pub sweep: SweepSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Model identifier sent to the extraction service.
    pub model: String,
    /// Client-side request meter (requests per second).
    pub requests_per_second: u32,
    /// In-call retry bound for transient upstream errors.
    pub max_calls: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub confirm_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    pub max_pages: u32,
    pub max_attempts: u32,
    pub render_width: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SweepSettings {
    pub queued_stale_ms: i64,
    pub retry_cooldown_ms: i64,
    pub document_stale_ms: i64,
    pub batch_limit: usize,
    pub pacing_ms: u64,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let builder = Config::builder()
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .set_default("extraction.model", DEFAULT_EXTRACTION_MODEL)?
        .set_default("extraction.requests_per_second", 4_i64)?
        .set_default("extraction.max_calls", 3_i64)?
        .set_default("dispatch.batch_size", DEFAULT_DISPATCH_BATCH_SIZE as i64)?
        .set_default(
            "dispatch.batch_delay_ms",
            DEFAULT_DISPATCH_BATCH_DELAY_MS as i64,
        )?
        .set_default(
            "dispatch.confirm_timeout_ms",
            DEFAULT_DISPATCH_CONFIRM_TIMEOUT_MS as i64,
        )?
        .set_default("limits.max_pages", DEFAULT_MAX_PAGES_PER_DOCUMENT as i64)?
        .set_default("limits.max_attempts", DEFAULT_MAX_JOB_ATTEMPTS as i64)?
        .set_default("limits.render_width", DEFAULT_RENDER_WIDTH as i64)?
        .set_default("sweep.queued_stale_ms", 900_000_i64)? // 15 minutes
        .set_default("sweep.retry_cooldown_ms", 300_000_i64)? // 5 minutes
        .set_default("sweep.document_stale_ms", 1_800_000_i64)? // 30 minutes
        .set_default("sweep.batch_limit", 25_i64)?
        .set_default("sweep.pacing_ms", 500_i64)?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("REMITRA").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("io", "remitra", "remitra").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}
