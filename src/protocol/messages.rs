//! Typed message payloads.
//!
//! Requests borrow from the caller; responses own their data.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::{ClientId, ServerId};

// ============================================================================
// Handshake
// ============================================================================

/// Client proposal of protocol versions.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectRequest<'a> {
    /// Supported version tokens, most preferred first.
    pub versions: &'a [&'a str],
}

/// Server choice of protocol version.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchProtocolResponse {
    /// The version to adopt.
    pub version: String,
}

/// Error response, shared by every phase.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    /// Server supplied error payload.
    #[serde(default)]
    pub error: Value,
}

// ============================================================================
// V1 - Sessions
// ============================================================================

/// Request for a brand-new session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionNewRequest {}

/// Newly issued session credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionNewResponse {
    /// Session id.
    pub session: String,
    /// Secret used to sign resume attempts.
    pub secret: String,
}

/// Attempt to resume a persisted session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReuseRequest<'a> {
    /// Persisted session id.
    pub session: &'a str,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Hex SHA-256 of `{session}_{secret}_{timestamp}`.
    pub signature: &'a str,
}

// ============================================================================
// V1 - Subscriptions
// ============================================================================

/// Subscribe to a publication.
#[derive(Debug, Clone, Serialize)]
pub struct WatchRequest<'a> {
    /// Client identity of the query.
    pub id: &'a ClientId,
    /// Publication name.
    pub name: &'a str,
    /// Publication params.
    pub params: &'a Value,
}

/// Server acknowledgement of a watch.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchResponse {
    /// Handle for the new subscription.
    pub id: ServerId,
}

/// Drop a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct UnwatchRequest<'a> {
    /// Handle returned by the watch.
    pub id: &'a ServerId,
}

/// Server acknowledgement of an unwatch.
#[derive(Debug, Clone, Deserialize)]
pub struct UnwatchResponse {
    /// Handle of the dropped subscription.
    pub handle: ServerId,
}

/// One chunk of a query snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchDataEvent {
    /// Subscription handle.
    pub id: ServerId,
    /// Snapshot version; servers that do not version snapshots omit it.
    #[serde(default)]
    pub version: u64,
    /// 1-based sequence number of this chunk.
    pub part: u32,
    /// Number of chunks in this version.
    pub total: u32,
    /// Chunk text.
    pub stream: String,
}

// ============================================================================
// V1 - Actions
// ============================================================================

/// Execute a server action.
#[derive(Debug, Clone, Serialize)]
pub struct ExecRequest<'a> {
    /// Action name.
    pub name: &'a str,
    /// Action params.
    pub params: &'a Value,
}

// ============================================================================
// Tests
// ============================================================================
