//! Durable key-value storage used for sessions and query snapshots.
//!
//! | Key | Value |
//! |-----|-------|
//! | [`SESSION_ID_KEY`](crate::session::SESSION_ID_KEY) | session id |
//! | [`SESSION_SECRET_KEY`](crate::session::SESSION_SECRET_KEY) | session secret |
//! | query client id | last complete snapshot |

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};

// ============================================================================
// Storage
// ============================================================================

/// A durable key-value store.
///
/// Implementations absorb their own failures: a failed write is logged and
/// the value is simply absent on the next read.
pub trait Storage: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`.
    fn set(&self, key: &str, value: Value);

    /// Removes every entry.
    fn clear(&self);
}

// ============================================================================
// MemoryStorage
// ============================================================================

/// Process-local storage; contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<FxHashMap<String, Value>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if nothing is stored.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.entries.write().insert(key.to_string(), value);
    }

    fn clear(&self) {
        self.entries.write().clear();
    }
}

// ============================================================================
// FileStorage
// ============================================================================

/// Storage persisted as a single JSON document.
///
/// The whole document is rewritten on every mutation.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: RwLock<FxHashMap<String, Value>>,
}

impl FileStorage {
    /// Opens the document at `path`, creating an empty one if missing.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file exists but cannot be read
    /// - [`Error::Storage`] if the file is not a JSON object
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text)
                .map_err(|e| Error::storage(format!("{}: {e}", path.display())))?
        } else {
            FxHashMap::default()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Returns the document path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &FxHashMap<String, Value>) {
        let result = serde_json::to_string(entries)
            .map_err(Error::from)
            .and_then(|text| fs::write(&self.path, text).map_err(Error::from));

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to persist storage");
        }
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value);
        self.persist(&entries);
    }

    fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.persist(&entries);
    }
}

// ============================================================================
// Tests
// ============================================================================
