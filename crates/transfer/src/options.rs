//! Transfer options.

use std::path::Path;

use bulkferry_aio::PoolConfig;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_RESUME_BOUNDARIES, TransferError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Carry modification times across transfers.
    pub preserve_timestamps: bool,
    /// Allocate reader and writer pools in shared memory.
    pub use_shared_memory: bool,
    pub pool: PoolConfig,
    /// File sizes above which resume support is probed before resuming.
    pub resume_boundaries: Vec<u64>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            preserve_timestamps: false,
            use_shared_memory: false,
            pool: PoolConfig::default(),
            resume_boundaries: DEFAULT_RESUME_BOUNDARIES.to_vec(),
        }
    }
}

impl TransferOptions {
    pub fn from_json(json: &str) -> Result<Self, TransferError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Resume boundaries, largest first, without duplicates.
    pub fn boundaries(&self) -> Vec<u64> {
        let mut b = self.resume_boundaries.clone();
        b.sort_unstable_by(|a, b| b.cmp(a));
        b.dedup();
        b
    }
}
