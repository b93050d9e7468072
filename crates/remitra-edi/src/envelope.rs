//! Envelope construction: one transaction set per document inside a single
//! interchange, with exact declared counts.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use crate::claims::{TransactionInput, group_claims, line_adjustments};
use crate::segment::{Segment, fmt_amount, fmt_date, fmt_timestamp};
use crate::{BillingProfile, EncodeError};

/// Everything needed to encode one remittance file.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub profile: BillingProfile,
    pub transactions: Vec<TransactionInput>,
    /// Interchange control number, supplied by the caller so encoding stays
    /// deterministic.
    pub control_number: u32,
    pub timestamp: NaiveDateTime,
}

/// Per-document stats computed during encoding, persisted by the caller for
/// later display.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentTotals {
    pub document_id: String,
    pub total_paid: Decimal,
    pub total_patient_responsibility: Decimal,
    pub claim_count: usize,
}

/// The encoded file plus metadata for export stamping.
#[derive(Debug, Clone)]
pub struct RemittanceFile {
    pub content: String,
    pub transaction_count: usize,
    pub totals: Vec<DocumentTotals>,
}

/// Encode one envelope. The transaction-set trailer of each set declares that
/// set's exact segment count (header and trailer included), and the group
/// trailer declares the exact number of transaction sets; both are structural
/// invariants of the format.
pub fn encode(request: &EncodeRequest) -> Result<RemittanceFile, EncodeError> {
    let (tax_id, provider_id) = request.profile.require_identifiers()?;
    let (date, time) = fmt_timestamp(request.timestamp);
    let control = format!("{:09}", request.control_number);

    let mut lines: Vec<String> = Vec::new();
    lines.push(
        Segment::new("ISA")
            .element(tax_id)
            .element(provider_id)
            .element(&date)
            .element(&time)
            .element(&control)
            .render(),
    );
    lines.push(
        Segment::new("GS")
            .element("HP")
            .element(tax_id)
            .element(provider_id)
            .element(&date)
            .element(&time)
            .element(request.control_number.to_string())
            .render(),
    );

    let mut totals = Vec::with_capacity(request.transactions.len());
    for (index, transaction) in request.transactions.iter().enumerate() {
        let set_control = format!("{:04}", index + 1);
        let (set_lines, set_totals) =
            encode_transaction_set(&request.profile, provider_id, tax_id, transaction, &set_control);
        lines.extend(set_lines);
        totals.push(set_totals);
    }

    lines.push(
        Segment::new("GE")
            .element(request.transactions.len().to_string())
            .element(request.control_number.to_string())
            .render(),
    );
    lines.push(Segment::new("IEA").element("1").element(&control).render());

    let mut content = lines.join("\n");
    content.push('\n');

    Ok(RemittanceFile {
        content,
        transaction_count: request.transactions.len(),
        totals,
    })
}

fn encode_transaction_set(
    profile: &BillingProfile,
    provider_id: &str,
    tax_id: &str,
    transaction: &TransactionInput,
    set_control: &str,
) -> (Vec<String>, DocumentTotals) {
    let claims = group_claims(&transaction.lines);

    let total_paid: Decimal = claims.iter().map(|c| c.paid_total).sum();
    let total_patient_responsibility: Decimal = claims
        .iter()
        .map(|c| c.patient_responsibility_total)
        .sum();
    let payment_amount = transaction.check_amount.unwrap_or(total_paid);

    let mut segments: Vec<Segment> = Vec::new();
    segments.push(Segment::new("ST").element("835").element(set_control));
    segments.push(
        Segment::new("BPR")
            .element("I")
            .element(fmt_amount(payment_amount))
            .element("C")
            .element("ACH"),
    );
    segments.push(
        Segment::new("TRN")
            .element("1")
            .element(
                transaction
                    .check_number
                    .as_deref()
                    .unwrap_or(&transaction.document_id),
            ),
    );
    if let Some(date) = transaction.payment_date {
        segments.push(Segment::new("DTM").element("405").element(fmt_date(date)));
    }
    segments.push(
        Segment::new("N1")
            .element("PR")
            .optional(transaction.payer_name.as_deref()),
    );
    segments.push(
        Segment::new("N1")
            .element("PE")
            .element(&profile.name)
            .element("XX")
            .element(provider_id),
    );
    segments.push(Segment::new("REF").element("TJ").element(tax_id));
    if let Some(first) = profile.address.first() {
        segments.push(Segment::new("N3").element(first));
    }
    if profile.address.len() > 1 {
        segments.push(Segment::new("N4").element(profile.address[1..].join(" ")));
    }

    for claim in &claims {
        segments.push(
            Segment::new("CLP")
                .optional(claim.claim_number.as_deref())
                .element(claim.status.code())
                .element(fmt_amount(claim.billed_total))
                .element(fmt_amount(claim.paid_total))
                .element(fmt_amount(claim.patient_responsibility_total)),
        );
        if claim.patient_name.is_some() || claim.member_id.is_some() {
            let mut nm1 = Segment::new("NM1")
                .element("QC")
                .element("1")
                .optional(claim.patient_name.as_deref());
            if claim.member_id.is_some() {
                nm1 = nm1.element("MI").optional(claim.member_id.as_deref());
            }
            segments.push(nm1);
        }

        for line in &claim.lines {
            let procedure = line
                .procedure_code
                .as_deref()
                .map(|code| format!("HC:{code}"))
                .unwrap_or_else(|| "HC".to_string());
            segments.push(
                Segment::new("SVC")
                    .element(procedure)
                    .element(fmt_amount(line.billed.unwrap_or_default()))
                    .element(fmt_amount(line.paid.unwrap_or_default())),
            );
            if let Some(date) = line.service_date {
                segments.push(Segment::new("DTM").element("472").element(fmt_date(date)));
            }
            for adjustment in line_adjustments(line) {
                segments.push(
                    Segment::new("CAS")
                        .element(adjustment.group.code())
                        .element(adjustment.reason_code)
                        .element(fmt_amount(adjustment.amount)),
                );
            }
        }
    }

    // SE counts every segment in the set, itself included.
    let segment_count = segments.len() + 1;
    segments.push(
        Segment::new("SE")
            .element(segment_count.to_string())
            .element(set_control),
    );

    let rendered = segments.into_iter().map(|s| s.render()).collect();
    (
        rendered,
        DocumentTotals {
            document_id: transaction.document_id.clone(),
            total_paid,
            total_patient_responsibility,
            claim_count: claims.len(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::{LineKind, ServiceLine};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn profile() -> BillingProfile {
        BillingProfile {
            name: "Acme Medical Group".to_string(),
            tax_id: Some("12-3456789".to_string()),
            provider_id: Some("1629384756".to_string()),
            address: vec!["100 Main St".to_string(), "Springfield IL 62704".to_string()],
        }
    }

    fn service_line(claim: &str, paid: Decimal) -> ServiceLine {
        ServiceLine {
            kind: LineKind::MedicalService,
            claim_number: Some(claim.to_string()),
            patient_name: Some("DOE JANE".to_string()),
            member_id: Some("M100".to_string()),
            procedure_code: Some("99213".to_string()),
            service_date: NaiveDate::from_ymd_opt(2024, 1, 5),
            billed: Some(dec!(200)),
            allowed: None,
            paid: Some(paid),
            patient_responsibility: Some(dec!(10)),
            adjustment: None,
            deductible: None,
            coinsurance: None,
            copay: None,
            contractual_adjustment: None,
            non_covered: None,
        }
    }

    fn transaction(document_id: &str, lines: Vec<ServiceLine>) -> TransactionInput {
        TransactionInput {
            document_id: document_id.to_string(),
            payer_name: Some("BlueSky Health".to_string()),
            payment_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            check_number: Some("CHK-881".to_string()),
            check_amount: Some(dec!(150)),
            lines,
        }
    }

    fn request(transactions: Vec<TransactionInput>) -> EncodeRequest {
        EncodeRequest {
            profile: profile(),
            transactions,
            control_number: 42,
            timestamp: NaiveDate::from_ymd_opt(2024, 2, 2)
                .unwrap()
                .and_hms_opt(9, 30, 0)
                .unwrap(),
        }
    }

    fn declared_and_actual_counts(content: &str) -> Vec<(usize, usize)> {
        let mut counts = Vec::new();
        let mut current: Option<usize> = None;
        for line in content.lines() {
            if line.starts_with("ST*") {
                current = Some(0);
            }
            if let Some(count) = current.as_mut() {
                *count += 1;
            }
            if line.starts_with("SE*") {
                let declared: usize = line
                    .trim_end_matches('~')
                    .split('*')
                    .nth(1)
                    .unwrap()
                    .parse()
                    .unwrap();
                counts.push((declared, current.take().unwrap()));
            }
        }
        counts
    }

    #[test]
    fn empty_envelope_declares_zero_transaction_sets() {
        let file = encode(&request(vec![])).unwrap();
        assert_eq!(file.transaction_count, 0);
        assert!(file.content.contains("GE*0*42~"));
        assert!(!file.content.contains("ST*"));
        assert!(file.content.contains("IEA*1*000000042~"));
    }

    #[test]
    fn trailer_counts_match_emitted_counts() {
        let transactions = vec![
            transaction("doc-1", vec![service_line("C1", dec!(150))]),
            transaction(
                "doc-2",
                vec![service_line("C2", dec!(150)), service_line("C3", dec!(0))],
            ),
            transaction("doc-3", vec![]),
        ];
        let file = encode(&request(transactions)).unwrap();

        let header_count = file.content.lines().filter(|l| l.starts_with("ST*")).count();
        assert_eq!(header_count, 3);
        assert!(file.content.contains("GE*3*42~"));

        for (declared, actual) in declared_and_actual_counts(&file.content) {
            assert_eq!(declared, actual);
        }
    }

    #[test]
    fn every_segment_line_is_terminated() {
        let file = encode(&request(vec![transaction(
            "doc-1",
            vec![service_line("C1", dec!(150))],
        )]))
        .unwrap();
        for line in file.content.lines() {
            assert!(line.ends_with('~'), "unterminated segment: {line}");
        }
    }

    #[test]
    fn totals_cover_each_document() {
        let file = encode(&request(vec![transaction(
            "doc-1",
            vec![service_line("C1", dec!(150)), service_line("C1", dec!(25))],
        )]))
        .unwrap();
        assert_eq!(file.totals.len(), 1);
        let totals = &file.totals[0];
        assert_eq!(totals.document_id, "doc-1");
        assert_eq!(totals.total_paid, dec!(175));
        assert_eq!(totals.total_patient_responsibility, dec!(20));
        assert_eq!(totals.claim_count, 1);
    }

    #[test]
    fn missing_provider_id_fails_closed() {
        let mut req = request(vec![]);
        req.profile.provider_id = None;
        assert_eq!(encode(&req).unwrap_err(), EncodeError::MissingProviderId);
    }

    #[test]
    fn denied_claim_emits_denied_status_code() {
        let file = encode(&request(vec![transaction(
            "doc-1",
            vec![service_line("C1", dec!(0))],
        )]))
        .unwrap();
        assert!(file.content.contains("CLP*C1*4*200*0*10~"));
    }
}
