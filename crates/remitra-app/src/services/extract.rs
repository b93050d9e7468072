//! External extraction service client.
//!
//! The service receives one rendered page plus a structured-output
//! instruction and returns a typed list of payment line items. Only two error
//! classes are retryable (rate limiting and temporary unavailability); the
//! worker treats everything else as permanent for the page attempt.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use chrono::NaiveDate;
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use reqwest::{Client as HttpClient, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use remitra_edi::LineKind;

pub type GenericRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const STRUCTURED_INSTRUCTION: &str = "You are a meticulous medical-billing analyst. The image is one \
page of an insurance remittance advice. Return ONLY a JSON array of line items. Each item has: \
line_type (medical_service | incentive_bonus | adjustment | summary_total), patient_name, member_id, \
service_date (YYYY-MM-DD), procedure_code, billed_amount, allowed_amount, paid_amount, \
patient_responsibility, adjustment_amount, deductible, coinsurance, copay, contractual_adjustment, \
non_covered, claim_number, payer_name, payment_date (YYYY-MM-DD), check_number, check_amount, \
confidence (0..1). Use null for anything not printed on the page. Emit one summary_total item for a \
check/EFT total row when present. Return [] for blank or cover pages.";

/// One page handed to the extraction service.
#[derive(Debug, Clone)]
pub struct PagePayload {
    pub document_id: String,
    pub page_number: u32,
    pub png: Bytes,
}

/// One extracted line item as returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub line_type: LineKind,
    #[serde(default)]
    pub patient_name: Option<String>,
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub service_date: Option<NaiveDate>,
    #[serde(default)]
    pub procedure_code: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub billed_amount: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub allowed_amount: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub paid_amount: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub patient_responsibility: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub adjustment_amount: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub deductible: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub coinsurance: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub copay: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub contractual_adjustment: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub non_covered: Option<Decimal>,
    #[serde(default)]
    pub claim_number: Option<String>,
    #[serde(default)]
    pub payer_name: Option<String>,
    #[serde(default)]
    pub payment_date: Option<NaiveDate>,
    #[serde(default)]
    pub check_number: Option<String>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub check_amount: Option<Decimal>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Parsed items plus the raw response body kept for the job's audit trail.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub items: Vec<ExtractedItem>,
    pub raw_response: String,
}

/// Errors produced by the extraction client.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction service rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("extraction service temporarily unavailable")]
    Unavailable,

    #[error("missing GOOGLE_AI_API_KEY or GEMINI_API_KEY environment variable")]
    MissingApiKey,

    #[error("extraction service rejected the request ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("malformed extraction response: {0}")]
    MalformedResponse(String),

    #[error("extraction transport error: {0}")]
    Transport(String),
}

impl ExtractError {
    /// Only rate limiting and unavailability are worth retrying in place.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExtractError::RateLimited { .. } | ExtractError::Unavailable
        )
    }

    /// Server-provided pacing hint, when one was returned.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            ExtractError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Trait abstracting the extraction service so workers are testable.
#[async_trait::async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn extract_page(&self, payload: &PagePayload) -> Result<ExtractionOutcome, ExtractError>;
}

/// HTTP client for a Gemini-style `generateContent` endpoint.
#[derive(Clone)]
pub struct HttpExtractionClient {
    http: HttpClient,
    api_key: String,
    model: String,
    endpoint: String,
    limiter: Arc<GenericRateLimiter>,
}

impl HttpExtractionClient {
    pub fn from_env(
        model: impl Into<String>,
        requests_per_second: u32,
    ) -> Result<Self, ExtractError> {
        let model = model.into();
        debug_assert!(!model.trim().is_empty());

        let api_key = std::env::var("GOOGLE_AI_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| ExtractError::MissingApiKey)?;

        let quota = Quota::per_second(
            NonZeroU32::new(requests_per_second.max(1)).expect("non-zero quota"),
        );
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExtractError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            model,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }
}

#[async_trait::async_trait]
impl ExtractionClient for HttpExtractionClient {
    async fn extract_page(&self, payload: &PagePayload) -> Result<ExtractionOutcome, ExtractError> {
        self.limiter.until_ready().await;

        let body = serde_json::json!({
            "system_instruction": {
                "parts": [{ "text": STRUCTURED_INSTRUCTION }]
            },
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inline_data": {
                            "mime_type": "image/png",
                            "data": BASE64_STANDARD.encode(&payload.png),
                        }
                    },
                    { "text": "Extract every payment line item from this page." }
                ]
            }],
            "generationConfig": {
                "temperature": 0.0,
                "response_mime_type": "application/json"
            }
        });

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.endpoint, self.model, self.api_key
        );
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(&response);
            return Err(ExtractError::RateLimited { retry_after });
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(ExtractError::Unavailable);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractError::Upstream {
                status: status.as_u16(),
                message: truncate(&message, 512),
            });
        }

        let raw_response = response
            .text()
            .await
            .map_err(classify_transport_error)?;
        let items = parse_items(&raw_response)?;
        debug!(
            document_id = %payload.document_id,
            page = payload.page_number,
            items = items.len(),
            "extraction response parsed"
        );
        Ok(ExtractionOutcome {
            items,
            raw_response,
        })
    }
}

fn classify_transport_error(e: reqwest::Error) -> ExtractError {
    if e.is_timeout() || e.is_connect() {
        ExtractError::Unavailable
    } else {
        ExtractError::Transport(e.to_string())
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

/// Pull the model's JSON text out of the response envelope and parse the item
/// list. A present-but-empty payload is a successful zero-item extraction
/// (blank or cover page); a payload that fails to parse is malformed.
fn parse_items(raw: &str) -> Result<Vec<ExtractedItem>, ExtractError> {
    let envelope: GenerateContentResponse = serde_json::from_str(raw)
        .map_err(|e| ExtractError::MalformedResponse(format!("response envelope: {e}")))?;

    let text = envelope
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    // Accept either a bare array or an object wrapping one under `items`.
    #[derive(Deserialize)]
    struct ItemsWrapper {
        #[serde(default)]
        items: Vec<ExtractedItem>,
    }

    if let Ok(items) = serde_json::from_str::<Vec<ExtractedItem>>(trimmed) {
        return Ok(items);
    }
    serde_json::from_str::<ItemsWrapper>(trimmed)
        .map(|w| w.items)
        .map_err(|e| ExtractError::MalformedResponse(format!("item list: {e}")))
}
