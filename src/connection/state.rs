//! Connection lifecycle states and events.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a connection.
///
/// ```text
/// Disconnected ──► Connecting ──► HandshakePending ──► Ready
///       ▲               │                │               │
///       └───────────────┴──── close ─────┴───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport opening.
    Connecting,
    /// Transport open, negotiating version and session.
    HandshakePending,
    /// Session established.
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::HandshakePending => "handshake_pending",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

// ============================================================================
// ConnectionEvent
// ============================================================================

/// Notification published by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport is being opened.
    Connecting,
    /// The transport is open.
    Connected,
    /// The session is established.
    Ready,
    /// The transport closed.
    Disconnected {
        /// Reason reported by the transport.
        reason: String,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number since the last ready session.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The server selected a protocol version this client does not speak.
    /// The transport is closed and a reconnect is scheduled.
    ProtocolRejected {
        /// Version token the server asked for.
        version: String,
    },
    /// The state changed.
    StateChanged {
        /// State after the change.
        new: ConnectionState,
        /// State before the change.
        old: ConnectionState,
    },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::HandshakePending.to_string(), "handshake_pending");
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
    }
}
