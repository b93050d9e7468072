//! Merging of near-duplicate extracted items.
//!
//! The extraction service frequently re-reads the same printed row (carried
//! headers, wrapped tables), so items colliding on (claim number, normalized
//! patient name, normalized procedure code, service date, paid amount) are
//! merged: the item with the higher quality score wins, blank fields are
//! filled from the loser, and the surviving confidence is the max of the two.
//! Check-total rows (`summary_total`) are never merged with anything.

use rust_decimal::Decimal;

use remitra_edi::LineKind;

use crate::services::extract::ExtractedItem;

/// Collision key for near-duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    claim_number: String,
    patient_name: String,
    procedure_code: String,
    service_date: Option<chrono::NaiveDate>,
    paid_cents: Option<i64>,
}

fn normalize(value: Option<&str>) -> String {
    value
        .unwrap_or("")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

fn paid_cents(value: Option<Decimal>) -> Option<i64> {
    value.map(|v| (v * Decimal::from(100)).round().try_into().unwrap_or(i64::MAX))
}

fn key_of(item: &ExtractedItem) -> DedupKey {
    DedupKey {
        claim_number: normalize(item.claim_number.as_deref()),
        patient_name: normalize(item.patient_name.as_deref()),
        procedure_code: normalize(item.procedure_code.as_deref()),
        service_date: item.service_date,
        paid_cents: paid_cents(item.paid_amount),
    }
}

/// Heuristic ranking between colliding items: populated-field count plus a
/// confidence tiebreak. Deliberately preserved as-is from the source system;
/// a stricter identity rule is not inferred.
fn quality_score(item: &ExtractedItem) -> f64 {
    let mut populated = 0u32;
    let strings = [
        &item.patient_name,
        &item.member_id,
        &item.procedure_code,
        &item.claim_number,
        &item.payer_name,
        &item.check_number,
    ];
    for value in strings {
        if value.as_deref().map(str::trim).filter(|s| !s.is_empty()).is_some() {
            populated += 1;
        }
    }
    let amounts = [
        item.billed_amount,
        item.allowed_amount,
        item.paid_amount,
        item.patient_responsibility,
        item.adjustment_amount,
        item.deductible,
        item.coinsurance,
        item.copay,
        item.contractual_adjustment,
        item.non_covered,
        item.check_amount,
    ];
    for value in amounts {
        if value.is_some() {
            populated += 1;
        }
    }
    if item.service_date.is_some() {
        populated += 1;
    }
    if item.payment_date.is_some() {
        populated += 1;
    }

    f64::from(populated) + f64::from(item.confidence.unwrap_or(0.0)) / 100.0
}

fn fill_blank_strings(target: &mut Option<String>, source: &Option<String>) {
    let blank = target
        .as_deref()
        .map(str::trim)
        .map_or(true, str::is_empty);
    if blank {
        if let Some(value) = source {
            *target = Some(value.clone());
        }
    }
}

fn fill_blank<T: Copy>(target: &mut Option<T>, source: Option<T>) {
    if target.is_none() {
        *target = source;
    }
}

/// Merge `loser` into `winner`: blanks filled, confidence maxed.
fn merge_into(winner: &mut ExtractedItem, loser: &ExtractedItem) {
    fill_blank_strings(&mut winner.patient_name, &loser.patient_name);
    fill_blank_strings(&mut winner.member_id, &loser.member_id);
    fill_blank_strings(&mut winner.procedure_code, &loser.procedure_code);
    fill_blank_strings(&mut winner.claim_number, &loser.claim_number);
    fill_blank_strings(&mut winner.payer_name, &loser.payer_name);
    fill_blank_strings(&mut winner.check_number, &loser.check_number);

    fill_blank(&mut winner.service_date, loser.service_date);
    fill_blank(&mut winner.payment_date, loser.payment_date);
    fill_blank(&mut winner.billed_amount, loser.billed_amount);
    fill_blank(&mut winner.allowed_amount, loser.allowed_amount);
    fill_blank(&mut winner.paid_amount, loser.paid_amount);
    fill_blank(&mut winner.patient_responsibility, loser.patient_responsibility);
    fill_blank(&mut winner.adjustment_amount, loser.adjustment_amount);
    fill_blank(&mut winner.deductible, loser.deductible);
    fill_blank(&mut winner.coinsurance, loser.coinsurance);
    fill_blank(&mut winner.copay, loser.copay);
    fill_blank(&mut winner.contractual_adjustment, loser.contractual_adjustment);
    fill_blank(&mut winner.non_covered, loser.non_covered);
    fill_blank(&mut winner.check_amount, loser.check_amount);

    winner.confidence = match (winner.confidence, loser.confidence) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
}

/// Deduplicate a page's extracted items, preserving first-appearance order.
pub fn dedup_items(items: Vec<ExtractedItem>) -> Vec<ExtractedItem> {
    let mut out: Vec<ExtractedItem> = Vec::with_capacity(items.len());
    let mut index: std::collections::HashMap<DedupKey, usize> = std::collections::HashMap::new();

    for item in items {
        if item.line_type == LineKind::SummaryTotal {
            out.push(item);
            continue;
        }
        let key = key_of(&item);
        match index.get(&key) {
            Some(&slot) => {
                let existing = &mut out[slot];
                if quality_score(&item) > quality_score(existing) {
                    let mut winner = item;
                    merge_into(&mut winner, existing);
                    *existing = winner;
                } else {
                    merge_into(existing, &item);
                }
            }
            None => {
                index.insert(key, out.len());
                out.push(item);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn base_item() -> ExtractedItem {
        ExtractedItem {
            line_type: LineKind::MedicalService,
            patient_name: Some("JANE DOE".to_string()),
            member_id: None,
            service_date: NaiveDate::from_ymd_opt(2024, 1, 5),
            procedure_code: Some("99213".to_string()),
            billed_amount: None,
            allowed_amount: None,
            paid_amount: Some(dec!(150.00)),
            patient_responsibility: None,
            adjustment_amount: None,
            deductible: None,
            coinsurance: None,
            copay: None,
            contractual_adjustment: None,
            non_covered: None,
            claim_number: Some("C1".to_string()),
            payer_name: None,
            payment_date: None,
            check_number: None,
            check_amount: None,
            confidence: Some(0.70),
        }
    }

    #[test]
    fn colliding_items_merge_with_union_of_fields_and_max_confidence() {
        let mut first = base_item();
        first.member_id = Some("M100".to_string());
        first.confidence = Some(0.70);

        let mut second = base_item();
        second.patient_name = Some("Jane  Doe".to_string()); // same after normalization
        second.billed_amount = Some(dec!(200));
        second.payer_name = Some("BlueSky Health".to_string());
        second.confidence = Some(0.95);

        let merged = dedup_items(vec![first, second]);
        assert_eq!(merged.len(), 1);
        let item = &merged[0];
        assert_eq!(item.member_id.as_deref(), Some("M100"));
        assert_eq!(item.billed_amount, Some(dec!(200)));
        assert_eq!(item.payer_name.as_deref(), Some("BlueSky Health"));
        assert_eq!(item.confidence, Some(0.95));
    }

    #[test]
    fn higher_quality_item_wins_field_conflicts() {
        let mut sparse = base_item();
        sparse.billed_amount = Some(dec!(999));
        sparse.confidence = Some(0.9);

        let mut rich = base_item();
        rich.billed_amount = Some(dec!(200));
        rich.member_id = Some("M100".to_string());
        rich.payer_name = Some("BlueSky Health".to_string());
        rich.allowed_amount = Some(dec!(180));
        rich.confidence = Some(0.8);

        let merged = dedup_items(vec![sparse, rich]);
        assert_eq!(merged.len(), 1);
        // The richer item wins the conflicting billed amount.
        assert_eq!(merged[0].billed_amount, Some(dec!(200)));
        assert_eq!(merged[0].confidence, Some(0.9));
    }

    #[test]
    fn differing_paid_amounts_do_not_collide() {
        let first = base_item();
        let mut second = base_item();
        second.paid_amount = Some(dec!(150.01));
        let merged = dedup_items(vec![first, second]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn summary_totals_never_merge() {
        let mut first = base_item();
        first.line_type = LineKind::SummaryTotal;
        let mut second = base_item();
        second.line_type = LineKind::SummaryTotal;
        let merged = dedup_items(vec![first, second]);
        assert_eq!(merged.len(), 2);
    }

    proptest! {
        #[test]
        fn key_normalization_is_idempotent(raw in "[a-zA-Z .,']{0,48}") {
            let once = normalize(Some(&raw));
            prop_assert_eq!(normalize(Some(once.as_str())), once.clone());
            prop_assert!(!once.contains("  "));
            prop_assert!(!once.chars().any(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn order_of_first_appearance_is_preserved() {
        let mut other = base_item();
        other.claim_number = Some("C2".to_string());
        let dup = base_item();
        let merged = dedup_items(vec![base_item(), other, dup]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].claim_number.as_deref(), Some("C1"));
        assert_eq!(merged[1].claim_number.as_deref(), Some("C2"));
    }
}
