use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LedgerError;
use crate::persist::write_atomic;

/// Persisted state of one egress identity, keyed by identifier in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub last_used: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub use_count: u64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Durable record of previously used identities and their cooldowns.
///
/// The file is a JSON object `{identifier: LedgerEntry}` rewritten atomically
/// on every save. A ledger without a path keeps nothing across restarts.
#[derive(Debug)]
pub struct ResourceLedger {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl ResourceLedger {
    /// A ledger stored as JSON at `path`. Nothing is read until [`load`](Self::load).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// A ledger that forgets everything on drop.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reads the ledger. A missing file is an empty ledger.
    pub fn load(&self) -> Result<BTreeMap<String, LedgerEntry>, LedgerError> {
        let Some(path) = &self.path else {
            return Ok(BTreeMap::new());
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).map_err(|source| LedgerError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    /// Replaces the stored entries atomically.
    pub fn save(&self, entries: &BTreeMap<String, LedgerEntry>) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(entries).map_err(|source| LedgerError::Json {
            path: path.display().to_string(),
            source,
        })?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        write_atomic(path, &json).map_err(|source| LedgerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), entries = entries.len(), "resource ledger saved");
        Ok(())
    }
}
