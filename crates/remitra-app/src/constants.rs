//! Cross-cutting application constants.

/// Hard ceiling on pages per uploaded document; protects the downstream
/// fan-out and bounds the credit charge.
pub const DEFAULT_MAX_PAGES_PER_DOCUMENT: u32 = 200;

/// Attempt budget per page job before it is permanently failed.
pub const DEFAULT_MAX_JOB_ATTEMPTS: u32 = 3;

/// Target width (pixels) when rasterizing a page for extraction.
pub const DEFAULT_RENDER_WIDTH: u32 = 2048;

/// Bucket holding materialized page objects.
pub const PAGE_OBJECT_BUCKET: &str = "pages";

/// Default extraction model identifier.
pub const DEFAULT_EXTRACTION_MODEL: &str = "gemini-2.5-flash";

/// Worker dispatch batching: jobs per batch and delay between batches.
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 5;
pub const DEFAULT_DISPATCH_BATCH_DELAY_MS: u64 = 2_000;

/// How long the orchestrator waits for a worker invocation to be accepted.
pub const DEFAULT_DISPATCH_CONFIRM_TIMEOUT_MS: u64 = 1_500;

/// Confidence floor below which an extracted item flags the document for
/// review.
pub const REVIEW_CONFIDENCE_FLOOR: f32 = 0.60;
