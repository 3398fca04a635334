//! Resumable session credentials.
//!
//! The server issues an `(id, secret)` pair on `sessionNew`. The pair is
//! persisted so a later connection can prove ownership of the session with a
//! signature instead of starting over.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::storage::Storage;

// ============================================================================
// Constants
// ============================================================================

/// Storage key for the session id.
pub const SESSION_ID_KEY: &str = "SI";

/// Storage key for the session secret.
pub const SESSION_SECRET_KEY: &str = "SS";

// ============================================================================
// Session
// ============================================================================

/// Session identifier and secret, backed by durable storage.
pub struct Session {
    id: Option<String>,
    secret: Option<String>,
    storage: Arc<dyn Storage>,
}

impl Session {
    /// Loads whatever credentials were persisted by a previous connection.
    #[must_use]
    pub fn load(storage: Arc<dyn Storage>) -> Self {
        let read = |key| match storage.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let id = read(SESSION_ID_KEY);
        let secret = read(SESSION_SECRET_KEY);

        Self {
            id,
            secret,
            storage,
        }
    }

    /// Returns the session id, if any.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns the session secret, if any.
    #[inline]
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Returns `true` if there are credentials worth trying to reuse.
    #[inline]
    #[must_use]
    pub fn can_resume(&self) -> bool {
        self.id.is_some() && self.secret.is_some()
    }

    /// Stores new credentials.
    ///
    /// If `id` differs from the persisted one, all persisted state is cleared
    /// first so nothing from the previous identity survives.
    pub fn set(&mut self, id: impl Into<String>, secret: impl Into<String>) {
        let id = id.into();
        let secret = secret.into();

        let previous = self.storage.get(SESSION_ID_KEY);
        if previous.as_ref().and_then(Value::as_str) != Some(id.as_str()) {
            debug!(session = %id, "Session changed, clearing storage");
            self.storage.clear();
        }

        self.storage.set(SESSION_ID_KEY, Value::String(id.clone()));
        self.storage.set(SESSION_SECRET_KEY, Value::String(secret.clone()));
        self.id = Some(id);
        self.secret = Some(secret);
    }

    /// Signs a resume attempt made at `timestamp` (ms since epoch).
    ///
    /// Returns `None` without credentials.
    #[must_use]
    pub fn signature(&self, timestamp: u64) -> Option<String> {
        let id = self.id.as_deref()?;
        let secret = self.secret.as_deref()?;
        let digest = Sha256::digest(format!("{id}_{secret}_{timestamp}").as_bytes());
        Some(hex::encode(digest))
    }
}

// ============================================================================
// Tests
// ============================================================================
