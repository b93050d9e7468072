//! Remittance file generation and export stamping.
//!
//! Pulls reconciled documents' line items out of the analytical store, hands
//! them to the encoder, and stamps every included document with a shared
//! export batch id plus its computed summary stats. Export-locked documents
//! must be explicitly unlocked before they can be re-encoded.

use std::sync::Arc;

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::Utc;
use heed::byteorder::BigEndian;
use heed::types::{Bytes, Str, U64};
use heed::{Database, Env};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use remitra_edi::{
    BillingProfile, DocumentTotals, EncodeError as EdiEncodeError, EncodeRequest, LineKind,
    ServiceLine, TransactionInput, encode,
};

use crate::services::items::{ItemStore, ItemStoreError, LineItem};
use crate::services::jobs::{DocumentStatus, JobStore, JobStoreError, current_timestamp_ms};

const PROFILES_DB: &str = "profiles";
const EXPORT_META_DB: &str = "export_meta";
const CONTROL_SEQ_KEY: &str = "control_seq";

/// Stored billing identity for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub address: Vec<String>,
}

impl TenantProfile {
    fn billing_profile(&self) -> BillingProfile {
        BillingProfile {
            name: self.name.clone(),
            tax_id: self.tax_id.clone(),
            provider_id: self.provider_id.clone(),
            address: self.address.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no billing profile for tenant `{0}`")]
    MissingProfile(String),
    #[error("document `{0}` not found")]
    DocumentNotFound(String),
    #[error("document `{document_id}` is {status:?}, not reconciled")]
    NotReconciled {
        document_id: String,
        status: DocumentStatus,
    },
    #[error("document `{document_id}` is export-locked by batch {batch_id}; unlock it first")]
    ExportLocked {
        document_id: String,
        batch_id: String,
    },
    #[error("document `{document_id}` belongs to tenant `{owner}`, not `{requested}`")]
    WrongTenant {
        document_id: String,
        owner: String,
        requested: String,
    },
    #[error(transparent)]
    Encode(#[from] EdiEncodeError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Items(#[from] ItemStoreError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    ValueEncode(#[from] EncodeError),
    #[error(transparent)]
    ValueDecode(#[from] DecodeError),
}

/// The generated file plus its export-stamp metadata.
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub batch_id: String,
    pub content: String,
    pub exported_at_ms: i64,
    pub totals: Vec<DocumentTotals>,
}

/// LMDB-backed tenant billing profiles plus the export control sequence.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    env: Env,
    profiles: Database<Str, Bytes>,
    meta: Database<Str, U64<BigEndian>>,
}

impl ProfileStore {
    pub fn open(env: &Env) -> Result<Self, ExportError> {
        let (profiles, meta) = {
            let mut wtxn = env.write_txn()?;
            let profiles =
                env.create_database::<Str, Bytes>(&mut wtxn, Some(PROFILES_DB))?;
            let meta =
                env.create_database::<Str, U64<BigEndian>>(&mut wtxn, Some(EXPORT_META_DB))?;
            wtxn.commit()?;
            (profiles, meta)
        };
        Ok(Self {
            env: env.clone(),
            profiles,
            meta,
        })
    }

    pub fn put(&self, profile: &TenantProfile) -> Result<(), ExportError> {
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(profile, config::standard())?;
        self.profiles
            .put(&mut wtxn, profile.tenant_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, tenant_id: &str) -> Result<Option<TenantProfile>, ExportError> {
        let rtxn = self.env.read_txn()?;
        match self.profiles.get(&rtxn, tenant_id)? {
            Some(raw) => {
                let (profile, _) = decode_from_slice::<TenantProfile, _>(raw, config::standard())?;
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    /// Monotonic interchange control number, persisted across runs.
    fn next_control_number(&self) -> Result<u32, ExportError> {
        let mut wtxn = self.env.write_txn()?;
        let next = self.meta.get(&wtxn, CONTROL_SEQ_KEY)?.unwrap_or(0) + 1;
        self.meta.put(&mut wtxn, CONTROL_SEQ_KEY, &next)?;
        wtxn.commit()?;
        Ok((next % u64::from(u32::MAX)) as u32)
    }
}

pub struct ExportService {
    jobs: JobStore,
    items: Arc<ItemStore>,
    profiles: ProfileStore,
}

impl ExportService {
    pub fn new(jobs: JobStore, items: Arc<ItemStore>, profiles: ProfileStore) -> Self {
        Self {
            jobs,
            items,
            profiles,
        }
    }

    /// Generate one remittance file covering the given reconciled documents
    /// and stamp each with the export lock and its summary stats.
    pub fn generate(
        &self,
        tenant_id: &str,
        document_ids: &[String],
    ) -> Result<ExportResult, ExportError> {
        let profile = self
            .profiles
            .get(tenant_id)?
            .ok_or_else(|| ExportError::MissingProfile(tenant_id.to_string()))?;

        // Validate every document before encoding anything.
        for document_id in document_ids {
            let document = self
                .jobs
                .get_document(document_id)?
                .ok_or_else(|| ExportError::DocumentNotFound(document_id.clone()))?;
            if document.tenant_id != tenant_id {
                return Err(ExportError::WrongTenant {
                    document_id: document_id.clone(),
                    owner: document.tenant_id,
                    requested: tenant_id.to_string(),
                });
            }
            if !matches!(
                document.status,
                DocumentStatus::Completed | DocumentStatus::PartialFailure
            ) {
                return Err(ExportError::NotReconciled {
                    document_id: document_id.clone(),
                    status: document.status,
                });
            }
            if let Some(batch_id) = document.export_batch_id {
                return Err(ExportError::ExportLocked {
                    document_id: document_id.clone(),
                    batch_id,
                });
            }
        }

        let mut by_document = self.items.items_for_documents(document_ids)?;
        let transactions: Vec<TransactionInput> = document_ids
            .iter()
            .map(|document_id| {
                let items = by_document.remove(document_id).unwrap_or_default();
                build_transaction(document_id, items)
            })
            .collect();

        let request = EncodeRequest {
            profile: profile.billing_profile(),
            transactions,
            control_number: self.profiles.next_control_number()?,
            timestamp: Utc::now().naive_utc(),
        };
        let file = encode(&request)?;

        let batch_id = Uuid::new_v4().to_string();
        let exported_at_ms = current_timestamp_ms();
        for totals in &file.totals {
            self.jobs.stamp_export(
                &totals.document_id,
                &batch_id,
                exported_at_ms,
                totals.total_paid,
                totals.total_patient_responsibility,
                totals.claim_count as u32,
            )?;
        }

        info!(
            batch_id = %batch_id,
            documents = file.totals.len(),
            "remittance file generated"
        );
        Ok(ExportResult {
            batch_id,
            content: file.content,
            exported_at_ms,
            totals: file.totals,
        })
    }

    /// Release a document's export lock so it can be re-encoded.
    pub fn unlock(&self, document_id: &str) -> Result<(), ExportError> {
        self.jobs.clear_export_lock(document_id)?;
        Ok(())
    }
}

/// Fold a document's stored items into encoder input: the first summary row
/// carries the payment-level facts, non-summary rows become service lines.
fn build_transaction(document_id: &str, items: Vec<LineItem>) -> TransactionInput {
    let mut payer_name = None;
    let mut payment_date = None;
    let mut check_number = None;
    let mut check_amount = None;
    let mut lines = Vec::with_capacity(items.len());

    for line in items {
        let item = line.item;
        if item.line_type == LineKind::SummaryTotal {
            if check_amount.is_none() {
                payer_name = payer_name.or(item.payer_name);
                payment_date = payment_date.or(item.payment_date);
                check_number = check_number.or(item.check_number);
                check_amount = item.check_amount;
            }
            continue;
        }
        // Payment-level facts also ride on ordinary lines; keep the first.
        payer_name = payer_name.or_else(|| item.payer_name.clone());
        payment_date = payment_date.or(item.payment_date);
        check_number = check_number.or_else(|| item.check_number.clone());

        lines.push(ServiceLine {
            kind: item.line_type,
            claim_number: item.claim_number,
            patient_name: item.patient_name,
            member_id: item.member_id,
            procedure_code: item.procedure_code,
            service_date: item.service_date,
            billed: item.billed_amount,
            allowed: item.allowed_amount,
            paid: item.paid_amount,
            patient_responsibility: item.patient_responsibility,
            adjustment: item.adjustment_amount,
            deductible: item.deductible,
            coinsurance: item.coinsurance,
            copay: item.copay,
            contractual_adjustment: item.contractual_adjustment,
            non_covered: item.non_covered,
        });
    }

    TransactionInput {
        document_id: document_id.to_string(),
        payer_name,
        payment_date,
        check_number,
        check_amount,
        lines,
    }
}
