//! Error types for the sync client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use rosa_client::{Client, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     let total = client.exec("cart.total", serde_json::json!({})).await?;
//!     println!("{total}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::UnknownProtocol`] |
//! | Connection | [`Error::Connection`], [`Error::Disconnected`], [`Error::NotConnected`] |
//! | Protocol | [`Error::Protocol`], [`Error::Unsupported`], [`Error::Server`] |
//! | Correlation | [`Error::RequestTimeout`], [`Error::DuplicateRequest`] |
//! | Subscription | [`Error::Reassembly`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Storage`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// Code reported when a capability is invoked without an active protocol.
pub const NOT_CONNECTED_CODE: u32 = 1;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// The server asked for a protocol version this client does not speak.
    #[error("Unknown protocol version: {version}")]
    UnknownProtocol {
        /// Version token received from the server.
        version: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The transport closed while the request was pending.
    #[error("Disconnected")]
    Disconnected,

    /// A capability was invoked while no protocol is active.
    #[error("Not connected (code {code})")]
    NotConnected {
        /// Numeric failure code, always [`NOT_CONNECTED_CODE`].
        code: u32,
    },

    /// The client actor has stopped.
    #[error("Client closed")]
    ClientClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Operation is not available in the current protocol phase.
    #[error("{operation} is not supported during the {phase} phase")]
    Unsupported {
        /// The rejected operation.
        operation: &'static str,
        /// Version token of the active protocol.
        phase: &'static str,
    },

    /// The server answered with an error response.
    #[error("Server error: {message}")]
    Server {
        /// Human readable form of the error payload.
        message: String,
        /// Raw error payload as sent by the server.
        payload: Value,
    },

    /// Protocol violation or unexpected message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Correlation Errors
    // ========================================================================
    /// No response arrived in time.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// A request ID was registered twice while still outstanding.
    #[error("Request {request_id} is already pending")]
    DuplicateRequest {
        /// The colliding request ID.
        request_id: RequestId,
    },

    // ========================================================================
    // Subscription Errors
    // ========================================================================
    /// Chunked snapshot could not be reassembled.
    #[error("Inconsistent snapshot version {version}: {message}")]
    Reassembly {
        /// Snapshot version being reassembled.
        version: u64,
        /// Description of the inconsistency.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// Durable storage failure.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an unknown protocol error.
    #[inline]
    pub fn unknown_protocol(version: impl Into<String>) -> Self {
        Self::UnknownProtocol {
            version: version.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates the fail-fast error for calls made without a protocol.
    #[inline]
    pub fn not_connected() -> Self {
        Self::NotConnected {
            code: NOT_CONNECTED_CODE,
        }
    }

    /// Creates an unsupported operation error.
    #[inline]
    pub fn unsupported(operation: &'static str, phase: &'static str) -> Self {
        Self::Unsupported { operation, phase }
    }

    /// Creates a server error from an error payload.
    pub fn server(payload: Value) -> Self {
        let message = match &payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| payload.to_string(), str::to_string),
            other => other.to_string(),
        };
        Self::Server { message, payload }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a duplicate request error.
    #[inline]
    pub fn duplicate_request(request_id: RequestId) -> Self {
        Self::DuplicateRequest { request_id }
    }

    /// Creates a reassembly error.
    #[inline]
    pub fn reassembly(version: u64, message: impl Into<String>) -> Self {
        Self::Reassembly {
            version,
            message: message.into(),
        }
    }

    /// Creates a storage error.
    #[inline]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns the numeric failure code, if this error carries one.
    #[inline]
    #[must_use]
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::NotConnected { code } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if the request failed because the link went away.
    #[inline]
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::NotConnected { .. } | Self::Connection { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed once the connection is re-established.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. }
                | Self::Disconnected
                | Self::NotConnected { .. }
                | Self::Connection { .. }
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
