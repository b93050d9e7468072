//! Export flow: encoding reconciled documents, export locking, and the
//! fail-closed billing profile checks.

use std::sync::Arc;

use rust_decimal_macros::dec;
use tempfile::TempDir;

use remitra_app::paths::AppPaths;
use remitra_app::services::{
    CreditLedger, Document, DocumentStatus, ExportError, ExportService, ExtractedItem, ItemStore,
    JobStore, LineItem, ProfileStore, TenantProfile, open_state_env,
};
use remitra_edi::LineKind;

struct Fixture {
    _temp: TempDir,
    jobs: JobStore,
    items: Arc<ItemStore>,
    profiles: ProfileStore,
    service: ExportService,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("paths");
    let env = open_state_env(&paths).expect("env");
    let jobs = JobStore::open(&env).expect("jobs");
    let _ledger = CreditLedger::open(&env).expect("ledger");
    let items = Arc::new(ItemStore::open_in_memory().expect("items"));
    let profiles = ProfileStore::open(&env).expect("profiles");
    let service = ExportService::new(jobs.clone(), Arc::clone(&items), profiles.clone());
    Fixture {
        _temp: temp,
        jobs,
        items,
        profiles,
        service,
    }
}

fn profile(tenant: &str) -> TenantProfile {
    TenantProfile {
        tenant_id: tenant.to_string(),
        name: "Acme Medical Group".to_string(),
        tax_id: Some("12-3456789".to_string()),
        provider_id: Some("1629384756".to_string()),
        address: vec!["100 Main St".to_string(), "Springfield IL 62704".to_string()],
    }
}

fn item(kind: LineKind, claim: Option<&str>, paid: Option<rust_decimal::Decimal>) -> ExtractedItem {
    ExtractedItem {
        line_type: kind,
        patient_name: Some("DOE JANE".to_string()),
        member_id: Some("M100".to_string()),
        service_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 5),
        procedure_code: Some("99213".to_string()),
        billed_amount: Some(dec!(200)),
        allowed_amount: None,
        paid_amount: paid,
        patient_responsibility: Some(dec!(10)),
        adjustment_amount: None,
        deductible: None,
        coinsurance: None,
        copay: None,
        contractual_adjustment: None,
        non_covered: None,
        claim_number: claim.map(str::to_string),
        payer_name: Some("BlueSky Health".to_string()),
        payment_date: chrono::NaiveDate::from_ymd_opt(2024, 2, 1),
        check_number: Some("CHK-881".to_string()),
        check_amount: None,
        confidence: Some(0.9),
    }
}

/// Seed one completed document with a summary row and two service lines.
fn seed_completed_document(fx: &Fixture, document_id: &str) {
    let mut doc = Document::new(document_id, "tenant-a");
    doc.status = DocumentStatus::Completed;
    doc.page_count = 1;
    doc.items_extracted = 3;
    fx.jobs.create_document(&doc).expect("create document");

    let mut summary = item(LineKind::SummaryTotal, None, None);
    summary.check_amount = Some(dec!(225));
    let rows = vec![
        item(LineKind::MedicalService, Some("C1"), Some(dec!(150))),
        item(LineKind::MedicalService, Some("C2"), Some(dec!(75))),
        summary,
    ];
    let lines: Vec<LineItem> = rows
        .into_iter()
        .enumerate()
        .map(|(i, it)| LineItem::from_extracted(document_id, 1, i as u32, it))
        .collect();
    fx.items.replace_page(document_id, 1, &lines).expect("seed items");
}

#[test]
fn generate_encodes_stamps_and_locks() {
    let fx = fixture();
    fx.profiles.put(&profile("tenant-a")).expect("profile");
    seed_completed_document(&fx, "doc-1");
    seed_completed_document(&fx, "doc-2");

    let result = fx
        .service
        .generate("tenant-a", &["doc-1".to_string(), "doc-2".to_string()])
        .expect("generate");

    // Envelope integrity: two transaction sets, declared counts exact.
    let st_count = result.content.lines().filter(|l| l.starts_with("ST*")).count();
    assert_eq!(st_count, 2);
    assert!(result.content.contains("GE*2*"));
    for line in result.content.lines() {
        assert!(line.ends_with('~'), "unterminated segment: {line}");
    }
    // The check total from the summary row rides the payment segment.
    assert!(result.content.contains("BPR*I*225*C*ACH~"));
    assert!(result.content.contains("N1*PR*BlueSky Health~"));
    assert!(result.content.contains("REF*TJ*12-3456789~"));

    // Both documents are stamped with the shared batch id and their stats.
    for document_id in ["doc-1", "doc-2"] {
        let doc = fx.jobs.get_document(document_id).expect("get").expect("doc");
        assert_eq!(doc.export_batch_id.as_deref(), Some(result.batch_id.as_str()));
        assert_eq!(doc.exported_at_ms, Some(result.exported_at_ms));
        assert_eq!(doc.total_paid, Some(dec!(225)));
        assert_eq!(doc.total_patient_responsibility, Some(dec!(20)));
        assert_eq!(doc.claim_count, Some(2));
    }
}

#[test]
fn export_locked_document_requires_unlock() {
    let fx = fixture();
    fx.profiles.put(&profile("tenant-a")).expect("profile");
    seed_completed_document(&fx, "doc-1");

    let first = fx
        .service
        .generate("tenant-a", &["doc-1".to_string()])
        .expect("first export");

    let err = fx
        .service
        .generate("tenant-a", &["doc-1".to_string()])
        .unwrap_err();
    match err {
        ExportError::ExportLocked { document_id, batch_id } => {
            assert_eq!(document_id, "doc-1");
            assert_eq!(batch_id, first.batch_id);
        }
        other => panic!("expected export lock error, got {other:?}"),
    }

    fx.service.unlock("doc-1").expect("unlock");
    fx.service
        .generate("tenant-a", &["doc-1".to_string()])
        .expect("re-export after unlock");
}

#[test]
fn missing_provider_id_fails_closed() {
    let fx = fixture();
    let mut incomplete = profile("tenant-a");
    incomplete.provider_id = None;
    fx.profiles.put(&incomplete).expect("profile");
    seed_completed_document(&fx, "doc-1");

    let err = fx
        .service
        .generate("tenant-a", &["doc-1".to_string()])
        .unwrap_err();
    assert!(matches!(err, ExportError::Encode(_)));

    // Nothing was stamped.
    let doc = fx.jobs.get_document("doc-1").expect("get").expect("doc");
    assert!(doc.export_batch_id.is_none());
}

#[test]
fn non_terminal_document_is_rejected() {
    let fx = fixture();
    fx.profiles.put(&profile("tenant-a")).expect("profile");

    let mut doc = Document::new("doc-1", "tenant-a");
    doc.status = DocumentStatus::Processing;
    doc.page_count = 2;
    fx.jobs.create_document(&doc).expect("create");

    let err = fx
        .service
        .generate("tenant-a", &["doc-1".to_string()])
        .unwrap_err();
    assert!(matches!(err, ExportError::NotReconciled { .. }));
}

#[test]
fn foreign_tenant_documents_are_rejected() {
    let fx = fixture();
    fx.profiles.put(&profile("tenant-b")).expect("profile");
    seed_completed_document(&fx, "doc-1"); // owned by tenant-a

    let err = fx
        .service
        .generate("tenant-b", &["doc-1".to_string()])
        .unwrap_err();
    assert!(matches!(err, ExportError::WrongTenant { .. }));
}

#[test]
fn missing_profile_is_rejected_before_touching_documents() {
    let fx = fixture();
    seed_completed_document(&fx, "doc-1");
    let err = fx
        .service
        .generate("tenant-a", &["doc-1".to_string()])
        .unwrap_err();
    assert!(matches!(err, ExportError::MissingProfile(_)));
}
