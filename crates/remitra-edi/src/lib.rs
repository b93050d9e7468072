//! Electronic remittance advice encoding.
//!
//! This crate is pure: it takes reconciled line items plus a billing profile
//! and produces the flat, line-oriented remittance file. Grouping items into
//! claims, deriving claim statuses, and breaking adjustments into categorized
//! entries all happen here; fetching the data and stamping export locks is the
//! caller's job.

use thiserror::Error;

pub mod claims;
pub mod envelope;
pub mod segment;

pub use claims::{
    Adjustment, AdjustmentGroup, Claim, ClaimStatus, LineKind, ServiceLine, TransactionInput,
    group_claims, line_adjustments,
};
pub use envelope::{DocumentTotals, EncodeRequest, RemittanceFile, encode};
pub use segment::{ELEMENT_SEPARATOR, SEGMENT_TERMINATOR, Segment, fmt_amount};

/// Billing identity of the tenant receiving the payments.
///
/// Tax id and provider id are structurally required by the output grammar, so
/// encoding fails closed when either is missing or blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingProfile {
    pub name: String,
    pub tax_id: Option<String>,
    pub provider_id: Option<String>,
    pub address: Vec<String>,
}

impl BillingProfile {
    /// Validate the fields the envelope cannot be emitted without.
    pub fn require_identifiers(&self) -> Result<(&str, &str), EncodeError> {
        let tax_id = self
            .tax_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(EncodeError::MissingTaxId)?;
        let provider_id = self
            .provider_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(EncodeError::MissingProviderId)?;
        Ok((tax_id, provider_id))
    }
}

/// Errors emitted while encoding a remittance file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("billing profile has no tax id; refusing to generate")]
    MissingTaxId,
    #[error("billing profile has no provider id; refusing to generate")]
    MissingProviderId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_requires_both_identifiers() {
        let mut profile = BillingProfile {
            name: "Acme Medical Group".to_string(),
            tax_id: Some("12-3456789".to_string()),
            provider_id: Some("1629384756".to_string()),
            address: vec![],
        };
        assert!(profile.require_identifiers().is_ok());

        profile.tax_id = Some("   ".to_string());
        assert_eq!(
            profile.require_identifiers().unwrap_err(),
            EncodeError::MissingTaxId
        );

        profile.tax_id = Some("12-3456789".to_string());
        profile.provider_id = None;
        assert_eq!(
            profile.require_identifiers().unwrap_err(),
            EncodeError::MissingProviderId
        );
    }
}
