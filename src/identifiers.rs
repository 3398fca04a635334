//! Type-safe identifiers for requests and subscriptions.
//!
//! | Type | Minted by | Lifetime |
//! |------|-----------|----------|
//! | [`RequestId`] | client, monotonically from 1 | one connection |
//! | [`ClientId`] | client, hash of name + params | process |
//! | [`ServerId`] | server, on a successful watch | one connection |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

// ============================================================================
// RequestId
// ============================================================================

/// Correlates an outgoing request with the server's response.
///
/// The wire value `0` means "no request id" and is never minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw request id.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Converts a wire value, mapping `0` to `None`.
    #[inline]
    #[must_use]
    pub const fn from_wire(id: u64) -> Option<Self> {
        if id == 0 { None } else { Some(Self(id)) }
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ClientId
// ============================================================================

/// Deterministic identity of a `(name, params)` subscription.
///
/// Two queries with the same name and structurally equal params (object key
/// order ignored) share one `ClientId`, and therefore one server subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Computes the identity for a publication name and its params.
    #[must_use]
    pub fn for_query(name: &str, params: &Value) -> Self {
        let canonical = canonicalize(params);
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(b"_");
        hasher.update(canonical.to_string().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Returns the hash as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuilds `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// ============================================================================
// ServerId
// ============================================================================

/// Opaque subscription handle assigned by the server.
///
/// Kept in whichever JSON form the server used so it can be echoed back
/// verbatim in `unwatch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerId {
    /// Numeric handle.
    Number(u64),
    /// String handle.
    Text(String),
}

impl ServerId {
    /// Extracts a handle from a response value.
    ///
    /// Accepts a bare handle or an object carrying it under `id`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(map) => map.get("id").and_then(Self::from_value),
            other => serde_json::from_value(other.clone()).ok(),
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ServerId {
    fn from(id: u64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
