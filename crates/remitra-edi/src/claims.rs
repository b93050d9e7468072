//! Claim grouping and adjustment breakdowns.
//!
//! Line items arrive flat from the analytical store; this module folds them
//! into claims keyed by claim number (falling back to patient + member when a
//! claim number is absent), derives a dominant claim status, and expands each
//! service line's dollar deltas into categorized adjustment entries.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Classification of an extracted line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    MedicalService,
    IncentiveBonus,
    Adjustment,
    SummaryTotal,
}

/// One payment line as handed to the encoder. Summary rows never reach this
/// type; their data arrives through [`TransactionInput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLine {
    pub kind: LineKind,
    pub claim_number: Option<String>,
    pub patient_name: Option<String>,
    pub member_id: Option<String>,
    pub procedure_code: Option<String>,
    pub service_date: Option<NaiveDate>,
    pub billed: Option<Decimal>,
    pub allowed: Option<Decimal>,
    pub paid: Option<Decimal>,
    pub patient_responsibility: Option<Decimal>,
    pub adjustment: Option<Decimal>,
    pub deductible: Option<Decimal>,
    pub coinsurance: Option<Decimal>,
    pub copay: Option<Decimal>,
    pub contractual_adjustment: Option<Decimal>,
    pub non_covered: Option<Decimal>,
}

/// One document's worth of encoder input: the payment-level facts from the
/// document's summary row plus its non-summary lines.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionInput {
    pub document_id: String,
    pub payer_name: Option<String>,
    pub payment_date: Option<NaiveDate>,
    pub check_number: Option<String>,
    pub check_amount: Option<Decimal>,
    pub lines: Vec<ServiceLine>,
}

/// Dominant outcome of a claim, ordered by escalation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimStatus {
    Paid,
    PartiallyPaid,
    Adjusted,
    Denied,
}

impl ClaimStatus {
    /// Status code emitted in the claim payment segment.
    pub fn code(self) -> &'static str {
        match self {
            ClaimStatus::Paid => "1",
            ClaimStatus::PartiallyPaid => "2",
            ClaimStatus::Adjusted => "3",
            ClaimStatus::Denied => "4",
        }
    }
}

/// A claim assembled from lines sharing a claim key.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub claim_number: Option<String>,
    pub patient_name: Option<String>,
    pub member_id: Option<String>,
    pub status: ClaimStatus,
    pub billed_total: Decimal,
    pub paid_total: Decimal,
    pub patient_responsibility_total: Decimal,
    pub lines: Vec<ServiceLine>,
}

/// Grouping identity: claim number when present, else patient + member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ClaimKey {
    Number(String),
    PatientMember(String, String),
}

fn claim_key(line: &ServiceLine) -> ClaimKey {
    if let Some(number) = line.claim_number.as_deref() {
        let trimmed = number.trim();
        if !trimmed.is_empty() {
            return ClaimKey::Number(trimmed.to_ascii_uppercase());
        }
    }
    ClaimKey::PatientMember(
        normalize_name(line.patient_name.as_deref().unwrap_or("")),
        line.member_id
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_ascii_uppercase(),
    )
}

/// Collapse whitespace runs and case so "Doe,  Jane" and "DOE, JANE" agree.
pub(crate) fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

fn amount(value: Option<Decimal>) -> Decimal {
    value.unwrap_or_default()
}

/// Outcome of a single line, feeding the claim's dominant status.
fn line_status(line: &ServiceLine) -> ClaimStatus {
    let billed = amount(line.billed);
    let paid = amount(line.paid);
    if billed > Decimal::ZERO && paid.is_zero() {
        return ClaimStatus::Denied;
    }
    if line.kind == LineKind::Adjustment || amount(line.adjustment) != Decimal::ZERO {
        return ClaimStatus::Adjusted;
    }
    if paid > Decimal::ZERO && paid < billed {
        return ClaimStatus::PartiallyPaid;
    }
    ClaimStatus::Paid
}

/// Fold flat lines into claims, preserving first-appearance order.
pub fn group_claims(lines: &[ServiceLine]) -> Vec<Claim> {
    let mut order: Vec<ClaimKey> = Vec::new();
    let mut grouped: std::collections::HashMap<ClaimKey, Vec<&ServiceLine>> =
        std::collections::HashMap::new();

    for line in lines {
        let key = claim_key(line);
        if !grouped.contains_key(&key) {
            order.push(key.clone());
        }
        grouped.entry(key).or_default().push(line);
    }

    order
        .into_iter()
        .map(|key| {
            let members = grouped.remove(&key).unwrap_or_default();
            let status = members
                .iter()
                .map(|line| line_status(line))
                .max()
                .unwrap_or(ClaimStatus::Paid);
            let billed_total = members.iter().map(|l| amount(l.billed)).sum();
            let paid_total = members.iter().map(|l| amount(l.paid)).sum();
            let patient_responsibility_total = members
                .iter()
                .map(|l| amount(l.patient_responsibility))
                .sum();
            let first = members.first();
            Claim {
                claim_number: first.and_then(|l| {
                    l.claim_number
                        .as_deref()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                }),
                patient_name: first.and_then(|l| l.patient_name.clone()),
                member_id: first.and_then(|l| l.member_id.clone()),
                status,
                billed_total,
                paid_total,
                patient_responsibility_total,
                lines: members.into_iter().cloned().collect(),
            }
        })
        .collect()
}

/// Adjustment group codes in the output grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentGroup {
    PatientResponsibility,
    Contractual,
    OtherAdjustment,
}

impl AdjustmentGroup {
    pub fn code(self) -> &'static str {
        match self {
            AdjustmentGroup::PatientResponsibility => "PR",
            AdjustmentGroup::Contractual => "CO",
            AdjustmentGroup::OtherAdjustment => "OA",
        }
    }
}

/// One categorized adjustment entry for a service line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjustment {
    pub group: AdjustmentGroup,
    pub reason_code: &'static str,
    pub amount: Decimal,
}

/// Expand a service line's dollar deltas into adjustment entries.
///
/// When any granular breakdown field is populated, each non-zero category
/// becomes its own entry and any gap between the line's total adjustment and
/// the granular sum is emitted as an unexplained remainder. Lines without a
/// breakdown fall back to a single contractual entry inferred from
/// billed minus paid.
pub fn line_adjustments(line: &ServiceLine) -> Vec<Adjustment> {
    let granular: [(Option<Decimal>, AdjustmentGroup, &'static str); 5] = [
        (line.deductible, AdjustmentGroup::PatientResponsibility, "1"),
        (
            line.coinsurance,
            AdjustmentGroup::PatientResponsibility,
            "2",
        ),
        (line.copay, AdjustmentGroup::PatientResponsibility, "3"),
        (
            line.contractual_adjustment,
            AdjustmentGroup::Contractual,
            "45",
        ),
        (line.non_covered, AdjustmentGroup::PatientResponsibility, "96"),
    ];

    let has_granular = granular.iter().any(|(value, _, _)| value.is_some());
    let mut entries = Vec::new();

    if has_granular {
        let mut explained = Decimal::ZERO;
        for (value, group, reason) in granular {
            let value = amount(value);
            if !value.is_zero() {
                explained += value;
                entries.push(Adjustment {
                    group,
                    reason_code: reason,
                    amount: value,
                });
            }
        }
        let remainder = amount(line.adjustment) - explained;
        if !remainder.is_zero() {
            entries.push(Adjustment {
                group: AdjustmentGroup::OtherAdjustment,
                reason_code: "23",
                amount: remainder,
            });
        }
    } else {
        let inferred = amount(line.billed) - amount(line.paid);
        if !inferred.is_zero() {
            entries.push(Adjustment {
                group: AdjustmentGroup::Contractual,
                reason_code: "45",
                amount: inferred,
            });
        }
    }

    entries
}
