//! Wire protocol.
//!
//! A connection always starts in the handshake phase and switches to a
//! versioned protocol once the server picks one of the proposed versions.
//!
//! # Phases
//!
//! | Phase | Token | Capabilities |
//! |-------|-------|--------------|
//! | Handshake | `handshake` | version negotiation only |
//! | V1 | `v1` | sessions, `watch`, `unwatch`, `exec`, chunked push |
//!
//! Capabilities are not methods on a shared trait: the handshake variant has
//! none, and callers asking for one get [`Error::Unsupported`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `handshake` | Version negotiation |
//! | `messages` | Typed payloads for every message type |
//! | `v1` | Session, subscription and exec protocol |

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use crate::connection::wire::Wire;
use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Submodules
// ============================================================================

/// Version negotiation phase.
pub mod handshake;

/// Typed message payloads.
pub mod messages;

/// Versioned protocol, revision 1.
pub mod v1;

// ============================================================================
// Re-exports
// ============================================================================

pub(crate) use handshake::HandshakeProtocol;
pub(crate) use v1::V1Protocol;

// ============================================================================
// Message
// ============================================================================

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Correlation id; `None` for fire-and-forget messages and pushes.
    pub request_id: Option<RequestId>,
    /// Message type token.
    pub kind: String,
    /// Message payload.
    pub payload: Value,
}

impl Message {
    /// Creates a message correlated to `request_id`.
    #[inline]
    #[must_use]
    pub fn request(request_id: RequestId, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: Some(request_id),
            kind: kind.into(),
            payload,
        }
    }

    /// Creates an uncorrelated message.
    #[inline]
    #[must_use]
    pub fn event(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: None,
            kind: kind.into(),
            payload,
        }
    }

    /// Deserializes the payload into a typed message body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] naming the message type on mismatch.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::protocol(format!("malformed {} payload: {e}", self.kind)))
    }
}

// ============================================================================
// Effect
// ============================================================================

/// Connection-level changes requested while handling a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Adopt the named protocol version.
    SwitchProtocol(String),
    /// The session is established.
    Ready,
}

// ============================================================================
// Protocol
// ============================================================================

/// The active protocol of a connection.
pub(crate) enum Protocol {
    /// Negotiating a version.
    Handshake(HandshakeProtocol),
    /// Versioned protocol, revision 1.
    V1(V1Protocol),
}

impl Protocol {
    /// Returns the version token.
    #[inline]
    pub(crate) fn version(&self) -> &'static str {
        match self {
            Self::Handshake(_) => handshake::VERSION,
            Self::V1(_) => v1::VERSION,
        }
    }

    /// Called once the transport is open.
    pub(crate) fn on_connect(&mut self, wire: &mut Wire) -> Result<()> {
        match self {
            Self::Handshake(handshake) => handshake.on_connect(wire),
            Self::V1(_) => Ok(()),
        }
    }
}

/// Borrows the versioned protocol for `operation`.
///
/// # Errors
///
/// - [`Error::NotConnected`] without an active protocol
/// - [`Error::Unsupported`] during the handshake phase
pub(crate) fn versioned<'a>(
    protocol: &'a mut Option<Protocol>,
    operation: &'static str,
) -> Result<&'a mut V1Protocol> {
    match protocol {
        None => Err(Error::not_connected()),
        Some(Protocol::V1(v1)) => Ok(v1),
        Some(other) => Err(Error::unsupported(operation, other.version())),
    }
}

// ============================================================================
// Tests
// ============================================================================
