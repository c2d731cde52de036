//! Persisted cache index (`cache_index.json` under the cache root).

use std::collections::BTreeMap;
use std::path::Path;

use aim_common::fs::write_json_atomic;
use aim_common::CacheError;
use serde::{Deserialize, Serialize};

use crate::entry::CacheEntry;

/// Index file name under the cache root
pub const INDEX_FILE: &str = "cache_index.json";

const INDEX_VERSION: u32 = 1;

/// model id → entry, as written to disk
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CacheIndex {
    /// Format version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Entries by model id
    #[serde(default)]
    pub entries: BTreeMap<String, CacheEntry>,
}

fn default_version() -> u32 {
    INDEX_VERSION
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl CacheIndex {
    /// Read the index, or start empty if the file does not exist
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(index_error(path, e)),
        };
        let index: Self = serde_json::from_slice(&data).map_err(|e| index_error(path, e))?;
        if index.version > INDEX_VERSION {
            return Err(index_error(
                path,
                format!("unsupported index version {}", index.version),
            ));
        }
        Ok(index)
    }

    /// Rewrite the index atomically
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        write_json_atomic(path, self).map_err(|e| index_error(path, e))
    }

    /// Sum of all entry sizes, reserved included
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }
}

fn index_error(path: &Path, e: impl std::fmt::Display) -> CacheError {
    CacheError::Index {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}
