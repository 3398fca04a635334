//! Transport layer.
//!
//! A transport is a bidirectional text-frame duplex. The connection never
//! touches sockets directly: it asks a [`Connector`] for a fresh
//! [`Transport`] on every connect attempt and learns about its lifecycle
//! through [`TransportEvent`]s.
//!
//! # Lifecycle
//!
//! ```text
//! Connector::open ──► Open ──► Data* ──► Close
//!                 └──────────────────────► Close   (connect failed)
//! ```
//!
//! Exactly one `Close` is reported per transport instance.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | `tokio-tungstenite` client transport |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket client transport.
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use websocket::WebSocketConnector;

// ============================================================================
// Types
// ============================================================================

/// Lifecycle and data notifications from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The link is open and `send` will deliver.
    Open,
    /// A text frame arrived.
    Data(String),
    /// The link is gone, with a human readable reason.
    Close(String),
}

/// Sink the connector reports [`TransportEvent`]s into.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

// ============================================================================
// Traits
// ============================================================================

/// One live (or connecting) link to the server.
pub trait Transport: Send + Sync {
    /// Returns `true` while frames can be delivered.
    fn is_open(&self) -> bool;

    /// Sends a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is already gone.
    fn send(&self, frame: String) -> Result<()>;

    /// Closes the link. A `Close` event follows.
    fn close(&self);
}

/// Factory for transports.
pub trait Connector: Send + Sync {
    /// Starts opening a new transport that reports into `events`.
    fn open(&self, events: TransportEvents) -> Arc<dyn Transport>;
}
