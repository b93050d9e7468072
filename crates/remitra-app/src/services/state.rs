//! Shared LMDB environment for durable coordination state.
//!
//! Documents, page jobs, credit balances, and billing profiles live in one
//! environment so a rollup can commit a terminal document transition and its
//! credit refund in a single write transaction.

use heed::{Env, EnvOpenOptions};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};

const STATE_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB
const STATE_ENV_MAX_DBS: u32 = 8;

#[derive(Debug, Error)]
pub enum StateEnvError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
}

/// Open (or create) the state environment under the application paths.
pub fn open_state_env(paths: &AppPaths) -> Result<Env, StateEnvError> {
    let path = paths.state_lmdb_dir()?;
    debug_assert!(path.exists());

    let mut options = EnvOpenOptions::new();
    options.max_dbs(STATE_ENV_MAX_DBS);
    options.map_size(STATE_ENV_MAP_SIZE_BYTES);
    let env = unsafe {
        // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
        options.open(&path)?
    };
    Ok(env)
}
