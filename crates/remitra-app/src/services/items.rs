//! Analytical store for extracted line items.
//!
//! One wide SQLite table, written exclusively through parameterized
//! statements. Writes are page-scoped delete-then-insert so a re-run worker
//! converges instead of duplicating. Two derived views support the UI layer:
//! `payment_items` (non-summary rows joined to their document's check-total
//! row) and `reconciliation` (per-document check total vs sum of lines).

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use remitra_edi::LineKind;

use crate::constants::REVIEW_CONFIDENCE_FLOOR;
use crate::services::extract::ExtractedItem;
use crate::services::jobs::current_timestamp_ms;

#[derive(Debug, Error)]
pub enum ItemStoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt stored value in column `{column}`: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("line item not found: {document_id} page {page_number} ordinal {ordinal}")]
    NotFound {
        document_id: String,
        page_number: u32,
        ordinal: u32,
    },
}

/// One persisted line item row. `ordinal` is the item's position within its
/// page after dedup; (document_id, page_number, ordinal) is the composite row
/// identity used by field-level edits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub document_id: String,
    pub page_number: u32,
    pub ordinal: u32,
    #[serde(flatten)]
    pub item: ExtractedItem,
}

impl LineItem {
    pub fn from_extracted(
        document_id: impl Into<String>,
        page_number: u32,
        ordinal: u32,
        item: ExtractedItem,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            page_number,
            ordinal,
            item,
        }
    }
}

/// Composite row identity for edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemKey {
    pub document_id: String,
    pub page_number: u32,
    pub ordinal: u32,
}

/// Field-level edits; a `Some` sets the column, absent fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct ItemEdits {
    pub patient_name: Option<String>,
    pub member_id: Option<String>,
    pub service_date: Option<NaiveDate>,
    pub procedure_code: Option<String>,
    pub billed_amount: Option<Decimal>,
    pub allowed_amount: Option<Decimal>,
    pub paid_amount: Option<Decimal>,
    pub patient_responsibility: Option<Decimal>,
    pub adjustment_amount: Option<Decimal>,
    pub deductible: Option<Decimal>,
    pub coinsurance: Option<Decimal>,
    pub copay: Option<Decimal>,
    pub contractual_adjustment: Option<Decimal>,
    pub non_covered: Option<Decimal>,
    pub claim_number: Option<String>,
    pub payer_name: Option<String>,
    pub payment_date: Option<NaiveDate>,
    pub check_number: Option<String>,
    pub check_amount: Option<Decimal>,
}

/// Three-state reconciliation of a document's check total against its lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationState {
    Balanced,
    Unbalanced,
    NoCheckTotal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationRow {
    pub document_id: String,
    pub check_total: Option<Decimal>,
    pub line_total: Decimal,
    pub delta: Option<Decimal>,
    pub state: ReconciliationState,
}

/// Outcome of exception evaluation over a document's items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionReport {
    pub review_reasons: Vec<String>,
    pub found_revenue: bool,
}

impl ExceptionReport {
    pub fn needs_review(&self) -> bool {
        !self.review_reasons.is_empty()
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS line_items (
    id INTEGER PRIMARY KEY,
    document_id TEXT NOT NULL,
    page_number INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    line_type TEXT NOT NULL,
    patient_name TEXT,
    member_id TEXT,
    service_date TEXT,
    procedure_code TEXT,
    billed_amount TEXT,
    allowed_amount TEXT,
    paid_amount TEXT,
    patient_responsibility TEXT,
    adjustment_amount TEXT,
    deductible TEXT,
    coinsurance TEXT,
    copay TEXT,
    contractual_adjustment TEXT,
    non_covered TEXT,
    claim_number TEXT,
    payer_name TEXT,
    payment_date TEXT,
    check_number TEXT,
    check_amount TEXT,
    confidence REAL,
    created_at_ms INTEGER NOT NULL,
    UNIQUE (document_id, page_number, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_line_items_document
    ON line_items (document_id, page_number, ordinal);

CREATE VIEW IF NOT EXISTS payment_items AS
SELECT i.*,
       s.payer_name AS summary_payer_name,
       s.payment_date AS summary_payment_date,
       s.check_number AS summary_check_number,
       s.check_amount AS summary_check_amount
FROM line_items i
LEFT JOIN line_items s
    ON s.id = (
        SELECT MIN(s2.id) FROM line_items s2
        WHERE s2.document_id = i.document_id AND s2.line_type = 'summary_total'
    )
WHERE i.line_type != 'summary_total';

CREATE VIEW IF NOT EXISTS reconciliation AS
SELECT t.document_id AS document_id,
       s.check_amount AS check_total,
       t.line_total AS line_total,
       CASE
           WHEN s.check_amount IS NULL THEN 'no_check_total'
           WHEN ABS(CAST(s.check_amount AS REAL) - t.line_total) < 0.005 THEN 'balanced'
           ELSE 'unbalanced'
       END AS state
FROM (
    SELECT document_id,
           COALESCE(SUM(CAST(paid_amount AS REAL)), 0.0) AS line_total
    FROM line_items
    WHERE line_type != 'summary_total'
    GROUP BY document_id
) t
LEFT JOIN line_items s
    ON s.id = (
        SELECT MIN(s2.id) FROM line_items s2
        WHERE s2.document_id = t.document_id AND s2.line_type = 'summary_total'
    );
"#;

const ITEM_COLUMNS: &str = "document_id, page_number, ordinal, line_type, patient_name, member_id, \
service_date, procedure_code, billed_amount, allowed_amount, paid_amount, patient_responsibility, \
adjustment_amount, deductible, coinsurance, copay, contractual_adjustment, non_covered, \
claim_number, payer_name, payment_date, check_number, check_amount, confidence";

/// SQLite-backed line item store. Connection access is serialized; callers on
/// async paths wrap calls in `spawn_blocking`.
#[derive(Debug)]
pub struct ItemStore {
    conn: Mutex<Connection>,
}

impl ItemStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ItemStoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, ItemStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Replace the complete item set for one (document, page) in a single SQL
    /// transaction. Either every item lands or none do, which is what makes a
    /// duplicate-dispatched worker convergent.
    pub fn replace_page(
        &self,
        document_id: &str,
        page_number: u32,
        items: &[LineItem],
    ) -> Result<(), ItemStoreError> {
        debug_assert!(
            items
                .iter()
                .all(|i| i.document_id == document_id && i.page_number == page_number)
        );
        let mut conn = self.conn.lock().expect("item store mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM line_items WHERE document_id = ?1 AND page_number = ?2",
            params![document_id, page_number],
        )?;
        {
            let sql = format!(
                "INSERT INTO line_items ({ITEM_COLUMNS}, created_at_ms) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                  ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)"
            );
            let mut stmt = tx.prepare(&sql)?;
            let now_ms = current_timestamp_ms();
            for line in items {
                let item = &line.item;
                stmt.execute(params![
                    line.document_id,
                    line.page_number,
                    line.ordinal,
                    line_kind_str(item.line_type),
                    item.patient_name,
                    item.member_id,
                    item.service_date.map(|d| d.to_string()),
                    item.procedure_code,
                    dec_sql(item.billed_amount),
                    dec_sql(item.allowed_amount),
                    dec_sql(item.paid_amount),
                    dec_sql(item.patient_responsibility),
                    dec_sql(item.adjustment_amount),
                    dec_sql(item.deductible),
                    dec_sql(item.coinsurance),
                    dec_sql(item.copay),
                    dec_sql(item.contractual_adjustment),
                    dec_sql(item.non_covered),
                    item.claim_number,
                    item.payer_name,
                    item.payment_date.map(|d| d.to_string()),
                    item.check_number,
                    dec_sql(item.check_amount),
                    item.confidence,
                    now_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The deduplicated, ordered item set for one document.
    pub fn items_for_document(&self, document_id: &str) -> Result<Vec<LineItem>, ItemStoreError> {
        let conn = self.conn.lock().expect("item store mutex poisoned");
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM line_items WHERE document_id = ?1 \
             ORDER BY page_number, ordinal"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![document_id], row_to_line_item)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Batched fetch for several documents at once.
    pub fn items_for_documents(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, Vec<LineItem>>, ItemStoreError> {
        if document_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock().expect("item store mutex poisoned");
        let placeholders = vec!["?"; document_ids.len()].join(", ");
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM line_items WHERE document_id IN ({placeholders}) \
             ORDER BY document_id, page_number, ordinal"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(document_ids.iter()),
            row_to_line_item,
        )?;
        let mut out: HashMap<String, Vec<LineItem>> = HashMap::new();
        for row in rows {
            let item = row??;
            out.entry(item.document_id.clone()).or_default().push(item);
        }
        Ok(out)
    }

    /// The document's check-total row, when the extraction found one.
    pub fn summary_row(&self, document_id: &str) -> Result<Option<LineItem>, ItemStoreError> {
        let conn = self.conn.lock().expect("item store mutex poisoned");
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM line_items \
             WHERE document_id = ?1 AND line_type = 'summary_total' \
             ORDER BY page_number, ordinal LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let row = stmt
            .query_row(params![document_id], row_to_line_item)
            .optional()?;
        row.transpose()
    }

    /// Apply field-level edits to one row identified by its composite key.
    pub fn update_item(&self, key: &ItemKey, edits: &ItemEdits) -> Result<LineItem, ItemStoreError> {
        let mut assignments: Vec<&'static str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        macro_rules! set_text {
            ($field:expr, $column:literal) => {
                if let Some(value) = &$field {
                    assignments.push(concat!($column, " = ?"));
                    values.push(Box::new(value.clone()));
                }
            };
        }
        macro_rules! set_dec {
            ($field:expr, $column:literal) => {
                if let Some(value) = $field {
                    assignments.push(concat!($column, " = ?"));
                    values.push(Box::new(value.to_string()));
                }
            };
        }

        set_text!(edits.patient_name, "patient_name");
        set_text!(edits.member_id, "member_id");
        set_text!(edits.procedure_code, "procedure_code");
        set_text!(edits.claim_number, "claim_number");
        set_text!(edits.payer_name, "payer_name");
        set_text!(edits.check_number, "check_number");
        if let Some(date) = edits.service_date {
            assignments.push("service_date = ?");
            values.push(Box::new(date.to_string()));
        }
        if let Some(date) = edits.payment_date {
            assignments.push("payment_date = ?");
            values.push(Box::new(date.to_string()));
        }
        set_dec!(edits.billed_amount, "billed_amount");
        set_dec!(edits.allowed_amount, "allowed_amount");
        set_dec!(edits.paid_amount, "paid_amount");
        set_dec!(edits.patient_responsibility, "patient_responsibility");
        set_dec!(edits.adjustment_amount, "adjustment_amount");
        set_dec!(edits.deductible, "deductible");
        set_dec!(edits.coinsurance, "coinsurance");
        set_dec!(edits.copay, "copay");
        set_dec!(edits.contractual_adjustment, "contractual_adjustment");
        set_dec!(edits.non_covered, "non_covered");
        set_dec!(edits.check_amount, "check_amount");

        if !assignments.is_empty() {
            let conn = self.conn.lock().expect("item store mutex poisoned");
            let sql = format!(
                "UPDATE line_items SET {} WHERE document_id = ? AND page_number = ? AND ordinal = ?",
                assignments.join(", ")
            );
            values.push(Box::new(key.document_id.clone()));
            values.push(Box::new(key.page_number));
            values.push(Box::new(key.ordinal));
            let changed = conn.execute(
                &sql,
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            )?;
            if changed == 0 {
                return Err(ItemStoreError::NotFound {
                    document_id: key.document_id.clone(),
                    page_number: key.page_number,
                    ordinal: key.ordinal,
                });
            }
        }

        self.get_item(key)?
            .ok_or_else(|| ItemStoreError::NotFound {
                document_id: key.document_id.clone(),
                page_number: key.page_number,
                ordinal: key.ordinal,
            })
    }

    pub fn get_item(&self, key: &ItemKey) -> Result<Option<LineItem>, ItemStoreError> {
        let conn = self.conn.lock().expect("item store mutex poisoned");
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM line_items \
             WHERE document_id = ?1 AND page_number = ?2 AND ordinal = ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let row = stmt
            .query_row(
                params![key.document_id, key.page_number, key.ordinal],
                row_to_line_item,
            )
            .optional()?;
        row.transpose()
    }

    /// Exact reconciliation for one document, computed with decimal math over
    /// the base table (the `reconciliation` view serves analytical scans).
    pub fn reconciliation(&self, document_id: &str) -> Result<ReconciliationRow, ItemStoreError> {
        let items = self.items_for_document(document_id)?;
        let mut line_total = Decimal::ZERO;
        let mut check_total: Option<Decimal> = None;
        for line in &items {
            if line.item.line_type == LineKind::SummaryTotal {
                if check_total.is_none() {
                    check_total = line.item.check_amount;
                }
            } else if let Some(paid) = line.item.paid_amount {
                line_total += paid;
            }
        }
        let (delta, state) = match check_total {
            Some(check) => {
                let delta = check - line_total;
                let state = if delta.is_zero() {
                    ReconciliationState::Balanced
                } else {
                    ReconciliationState::Unbalanced
                };
                (Some(delta), state)
            }
            None => (None, ReconciliationState::NoCheckTotal),
        };
        Ok(ReconciliationRow {
            document_id: document_id.to_string(),
            check_total,
            line_total,
            delta,
            state,
        })
    }

    /// Evaluate review exceptions and the found-revenue flag for a document.
    pub fn evaluate_document(&self, document_id: &str) -> Result<ExceptionReport, ItemStoreError> {
        let items = self.items_for_document(document_id)?;
        let reconciliation = self.reconciliation(document_id)?;

        let mut reasons = Vec::new();
        let low_confidence = items.iter().any(|line| {
            line.item.line_type != LineKind::SummaryTotal
                && line
                    .item
                    .confidence
                    .map_or(false, |c| c < REVIEW_CONFIDENCE_FLOOR)
        });
        if low_confidence {
            reasons.push("low_confidence".to_string());
        }
        if reconciliation.state == ReconciliationState::Unbalanced {
            reasons.push("unbalanced".to_string());
        }
        let missing_claim = items.iter().any(|line| {
            line.item.line_type == LineKind::MedicalService
                && line
                    .item
                    .claim_number
                    .as_deref()
                    .map(str::trim)
                    .map_or(true, str::is_empty)
        });
        if missing_claim {
            reasons.push("missing_claim_number".to_string());
        }

        let found_revenue = items.iter().any(|line| {
            line.item.line_type == LineKind::IncentiveBonus
                && line.item.paid_amount.map_or(false, |p| p > Decimal::ZERO)
        });

        Ok(ExceptionReport {
            review_reasons: reasons,
            found_revenue,
        })
    }

    /// Per-document rows of the `reconciliation` view, for analytical scans.
    pub fn reconciliation_view(&self) -> Result<Vec<(String, String)>, ItemStoreError> {
        let conn = self.conn.lock().expect("item store mutex poisoned");
        let mut stmt = conn.prepare("SELECT document_id, state FROM reconciliation ORDER BY document_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn line_kind_str(kind: LineKind) -> &'static str {
    match kind {
        LineKind::MedicalService => "medical_service",
        LineKind::IncentiveBonus => "incentive_bonus",
        LineKind::Adjustment => "adjustment",
        LineKind::SummaryTotal => "summary_total",
    }
}

fn line_kind_from_str(value: &str) -> Result<LineKind, ItemStoreError> {
    match value {
        "medical_service" => Ok(LineKind::MedicalService),
        "incentive_bonus" => Ok(LineKind::IncentiveBonus),
        "adjustment" => Ok(LineKind::Adjustment),
        "summary_total" => Ok(LineKind::SummaryTotal),
        other => Err(ItemStoreError::Corrupt {
            column: "line_type",
            value: other.to_string(),
        }),
    }
}

fn dec_sql(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn dec_col(value: Option<String>, column: &'static str) -> Result<Option<Decimal>, ItemStoreError> {
    value
        .map(|raw| {
            Decimal::from_str(&raw).map_err(|_| ItemStoreError::Corrupt { column, value: raw })
        })
        .transpose()
}

fn date_col(value: Option<String>, column: &'static str) -> Result<Option<NaiveDate>, ItemStoreError> {
    value
        .map(|raw| {
            NaiveDate::from_str(&raw).map_err(|_| ItemStoreError::Corrupt { column, value: raw })
        })
        .transpose()
}

type ItemRowResult = Result<LineItem, ItemStoreError>;

fn row_to_line_item(row: &Row<'_>) -> rusqlite::Result<ItemRowResult> {
    let document_id: String = row.get(0)?;
    let page_number: u32 = row.get(1)?;
    let ordinal: u32 = row.get(2)?;
    let line_type: String = row.get(3)?;

    let build = || -> ItemRowResult {
        Ok(LineItem {
            document_id: document_id.clone(),
            page_number,
            ordinal,
            item: ExtractedItem {
                line_type: line_kind_from_str(&line_type)?,
                patient_name: row.get(4)?,
                member_id: row.get(5)?,
                service_date: date_col(row.get(6)?, "service_date")?,
                procedure_code: row.get(7)?,
                billed_amount: dec_col(row.get(8)?, "billed_amount")?,
                allowed_amount: dec_col(row.get(9)?, "allowed_amount")?,
                paid_amount: dec_col(row.get(10)?, "paid_amount")?,
                patient_responsibility: dec_col(row.get(11)?, "patient_responsibility")?,
                adjustment_amount: dec_col(row.get(12)?, "adjustment_amount")?,
                deductible: dec_col(row.get(13)?, "deductible")?,
                coinsurance: dec_col(row.get(14)?, "coinsurance")?,
                copay: dec_col(row.get(15)?, "copay")?,
                contractual_adjustment: dec_col(row.get(16)?, "contractual_adjustment")?,
                non_covered: dec_col(row.get(17)?, "non_covered")?,
                claim_number: row.get(18)?,
                payer_name: row.get(19)?,
                payment_date: date_col(row.get(20)?, "payment_date")?,
                check_number: row.get(21)?,
                check_amount: dec_col(row.get(22)?, "check_amount")?,
                confidence: row.get(23)?,
            },
        })
    };
    Ok(build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(kind: LineKind, claim: Option<&str>, paid: Option<Decimal>) -> ExtractedItem {
        ExtractedItem {
            line_type: kind,
            patient_name: Some("JANE DOE".to_string()),
            member_id: Some("M100".to_string()),
            service_date: NaiveDate::from_ymd_opt(2024, 1, 5),
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
            payment_date: NaiveDate::from_ymd_opt(2024, 2, 1),
            check_number: Some("CHK-1".to_string()),
            check_amount: None,
            confidence: Some(0.9),
        }
    }

    fn summary(check_amount: Decimal) -> ExtractedItem {
        let mut s = item(LineKind::SummaryTotal, None, None);
        s.check_amount = Some(check_amount);
        s
    }

    fn lines(document_id: &str, page: u32, items: Vec<ExtractedItem>) -> Vec<LineItem> {
        items
            .into_iter()
            .enumerate()
            .map(|(i, it)| LineItem::from_extracted(document_id, page, i as u32, it))
            .collect()
    }

    #[test]
    fn replace_page_is_idempotent() {
        let store = ItemStore::open_in_memory().expect("open");
        let page_items = lines(
            "doc-1",
            1,
            vec![
                item(LineKind::MedicalService, Some("C1"), Some(dec!(150))),
                item(LineKind::MedicalService, Some("C2"), Some(dec!(75))),
            ],
        );

        store.replace_page("doc-1", 1, &page_items).expect("first");
        store.replace_page("doc-1", 1, &page_items).expect("second");

        let fetched = store.items_for_document("doc-1").expect("fetch");
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].item.claim_number.as_deref(), Some("C1"));
        assert_eq!(fetched[0].item.paid_amount, Some(dec!(150)));
    }

    #[test]
    fn replace_page_only_touches_its_own_page() {
        let store = ItemStore::open_in_memory().expect("open");
        store
            .replace_page(
                "doc-1",
                1,
                &lines("doc-1", 1, vec![item(LineKind::MedicalService, Some("C1"), Some(dec!(10)))]),
            )
            .expect("page 1");
        store
            .replace_page(
                "doc-1",
                2,
                &lines("doc-1", 2, vec![item(LineKind::MedicalService, Some("C2"), Some(dec!(20)))]),
            )
            .expect("page 2");

        store.replace_page("doc-1", 2, &[]).expect("clear page 2");
        let fetched = store.items_for_document("doc-1").expect("fetch");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].page_number, 1);
    }

    #[test]
    fn update_item_applies_field_edits_by_composite_key() {
        let store = ItemStore::open_in_memory().expect("open");
        store
            .replace_page(
                "doc-1",
                1,
                &lines("doc-1", 1, vec![item(LineKind::MedicalService, None, Some(dec!(10)))]),
            )
            .expect("seed");

        let key = ItemKey {
            document_id: "doc-1".to_string(),
            page_number: 1,
            ordinal: 0,
        };
        let edits = ItemEdits {
            claim_number: Some("C-FIXED".to_string()),
            paid_amount: Some(dec!(12.50)),
            ..ItemEdits::default()
        };
        let updated = store.update_item(&key, &edits).expect("update");
        assert_eq!(updated.item.claim_number.as_deref(), Some("C-FIXED"));
        assert_eq!(updated.item.paid_amount, Some(dec!(12.50)));
        // Untouched fields survive.
        assert_eq!(updated.item.procedure_code.as_deref(), Some("99213"));
    }

    #[test]
    fn update_missing_item_errors() {
        let store = ItemStore::open_in_memory().expect("open");
        let key = ItemKey {
            document_id: "doc-1".to_string(),
            page_number: 1,
            ordinal: 9,
        };
        let edits = ItemEdits {
            claim_number: Some("C1".to_string()),
            ..ItemEdits::default()
        };
        assert!(matches!(
            store.update_item(&key, &edits),
            Err(ItemStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn reconciliation_three_states() {
        let store = ItemStore::open_in_memory().expect("open");

        // Balanced: lines sum to the check total.
        store
            .replace_page(
                "doc-bal",
                1,
                &lines(
                    "doc-bal",
                    1,
                    vec![
                        item(LineKind::MedicalService, Some("C1"), Some(dec!(150))),
                        item(LineKind::MedicalService, Some("C2"), Some(dec!(50))),
                        summary(dec!(200)),
                    ],
                ),
            )
            .expect("seed");
        let row = store.reconciliation("doc-bal").expect("reconcile");
        assert_eq!(row.state, ReconciliationState::Balanced);
        assert_eq!(row.delta, Some(Decimal::ZERO));

        // Unbalanced: totals disagree.
        store
            .replace_page(
                "doc-unbal",
                1,
                &lines(
                    "doc-unbal",
                    1,
                    vec![
                        item(LineKind::MedicalService, Some("C1"), Some(dec!(150))),
                        summary(dec!(200)),
                    ],
                ),
            )
            .expect("seed");
        let row = store.reconciliation("doc-unbal").expect("reconcile");
        assert_eq!(row.state, ReconciliationState::Unbalanced);
        assert_eq!(row.delta, Some(dec!(50)));

        // No check total present.
        store
            .replace_page(
                "doc-nocheck",
                1,
                &lines(
                    "doc-nocheck",
                    1,
                    vec![item(LineKind::MedicalService, Some("C1"), Some(dec!(150)))],
                ),
            )
            .expect("seed");
        let row = store.reconciliation("doc-nocheck").expect("reconcile");
        assert_eq!(row.state, ReconciliationState::NoCheckTotal);
        assert_eq!(row.delta, None);

        // The SQL view agrees on states.
        let view: HashMap<String, String> =
            store.reconciliation_view().expect("view").into_iter().collect();
        assert_eq!(view.get("doc-bal").map(String::as_str), Some("balanced"));
        assert_eq!(view.get("doc-unbal").map(String::as_str), Some("unbalanced"));
        assert_eq!(
            view.get("doc-nocheck").map(String::as_str),
            Some("no_check_total")
        );
    }

    #[test]
    fn exception_evaluation_flags_reasons_and_found_revenue() {
        let store = ItemStore::open_in_memory().expect("open");
        let mut bonus = item(LineKind::IncentiveBonus, Some("C2"), Some(dec!(25)));
        bonus.confidence = Some(0.95);
        let mut shaky = item(LineKind::MedicalService, None, Some(dec!(150)));
        shaky.confidence = Some(0.40);
        store
            .replace_page(
                "doc-1",
                1,
                &lines("doc-1", 1, vec![shaky, bonus, summary(dec!(500))]),
            )
            .expect("seed");

        let report = store.evaluate_document("doc-1").expect("evaluate");
        assert!(report.needs_review());
        assert!(report.review_reasons.contains(&"low_confidence".to_string()));
        assert!(report.review_reasons.contains(&"unbalanced".to_string()));
        assert!(
            report
                .review_reasons
                .contains(&"missing_claim_number".to_string())
        );
        assert!(report.found_revenue);
    }

    #[test]
    fn payment_items_view_joins_summary_row() {
        let store = ItemStore::open_in_memory().expect("open");
        store
            .replace_page(
                "doc-1",
                1,
                &lines(
                    "doc-1",
                    1,
                    vec![
                        item(LineKind::MedicalService, Some("C1"), Some(dec!(150))),
                        summary(dec!(150)),
                    ],
                ),
            )
            .expect("seed");

        let conn = store.conn.lock().expect("mutex");
        let (count, check): (i64, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*), MAX(summary_check_amount) FROM payment_items WHERE document_id = ?1",
                params!["doc-1"],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("view query");
        assert_eq!(count, 1);
        assert_eq!(check.as_deref(), Some("150"));
    }
}
