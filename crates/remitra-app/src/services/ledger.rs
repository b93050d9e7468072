//! Per-tenant page-credit ledger.
//!
//! One balance row per tenant. `charge` is a single read-modify-write inside
//! an LMDB write transaction, which serializes concurrent charges: two callers
//! can never both succeed when only one has sufficient balance.

use heed::byteorder::BigEndian;
use heed::types::{Str, U64};
use heed::{Database, Env, RwTxn};
use thiserror::Error;
use tracing::warn;

const CREDITS_DB: &str = "credits";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Heed(#[from] heed::Error),
}

/// LMDB-backed credit balances.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    env: Env,
    balances: Database<Str, U64<BigEndian>>,
}

impl CreditLedger {
    pub fn open(env: &Env) -> Result<Self, LedgerError> {
        let balances = {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<Str, U64<BigEndian>>(&mut wtxn, Some(CREDITS_DB))?;
            wtxn.commit()?;
            db
        };
        Ok(Self {
            env: env.clone(),
            balances,
        })
    }

    /// Atomically deduct `amount` credits. Returns `false` without mutating
    /// anything when the balance is insufficient (or the tenant is unknown).
    pub fn charge(&self, tenant_id: &str, amount: u64) -> Result<bool, LedgerError> {
        debug_assert!(!tenant_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let balance = self.balances.get(&wtxn, tenant_id)?.unwrap_or(0);
        if balance < amount {
            // Dropping the transaction aborts it; no state was touched.
            return Ok(false);
        }
        self.balances.put(&mut wtxn, tenant_id, &(balance - amount))?;
        wtxn.commit()?;
        Ok(true)
    }

    /// Add credits back. A refund for a tenant without a balance row is logged
    /// and ignored; the caller's operation must not fail over it.
    pub fn refund(&self, tenant_id: &str, amount: u64) -> Result<(), LedgerError> {
        let mut wtxn = self.env.write_txn()?;
        self.refund_txn(&mut wtxn, tenant_id, amount)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Charge inside a caller-owned transaction, so the debit commits
    /// atomically with the caller's own writes (orchestrator admission).
    /// Returns `false` without touching the balance when it is insufficient.
    pub(crate) fn charge_txn(
        &self,
        wtxn: &mut RwTxn,
        tenant_id: &str,
        amount: u64,
    ) -> Result<bool, LedgerError> {
        let balance = self.balances.get(wtxn, tenant_id)?.unwrap_or(0);
        if balance < amount {
            return Ok(false);
        }
        self.balances.put(wtxn, tenant_id, &(balance - amount))?;
        Ok(true)
    }

    /// Refund inside a caller-owned transaction, so the credit movement
    /// commits atomically with the caller's own writes (document rollup).
    pub(crate) fn refund_txn(
        &self,
        wtxn: &mut RwTxn,
        tenant_id: &str,
        amount: u64,
    ) -> Result<(), LedgerError> {
        match self.balances.get(wtxn, tenant_id)? {
            Some(balance) => {
                self.balances
                    .put(wtxn, tenant_id, &balance.saturating_add(amount))?;
            }
            None => {
                warn!(tenant_id, amount, "refund for unknown tenant ignored");
            }
        }
        Ok(())
    }

    /// Current balance; unknown tenants read as zero.
    pub fn balance(&self, tenant_id: &str) -> Result<u64, LedgerError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.balances.get(&rtxn, tenant_id)?.unwrap_or(0))
    }

    /// Operator grant: creates the tenant row when absent. Returns the new
    /// balance.
    pub fn grant(&self, tenant_id: &str, amount: u64) -> Result<u64, LedgerError> {
        debug_assert!(!tenant_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let balance = self.balances.get(&wtxn, tenant_id)?.unwrap_or(0);
        let updated = balance.saturating_add(amount);
        self.balances.put(&mut wtxn, tenant_id, &updated)?;
        wtxn.commit()?;
        Ok(updated)
    }
}
