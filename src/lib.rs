//! Rosa client - real-time subscription sync over a single WebSocket.
//!
//! This library keeps a set of server-side query subscriptions alive over
//! one persistent connection, reassembles the chunked snapshots the server
//! pushes, and hands them to registered callbacks.
//!
//! # Architecture
//!
//! The client follows a single-writer model:
//!
//! - **Connection task**: owns state, protocol, pending requests and queries
//! - **Handles**: [`Client`], [`Connection`] and [`QueryView`] send commands
//! - **Transport**: a [`Connector`] opens a fresh text-frame duplex per attempt
//!
//! Key design principles:
//!
//! - Equal `(name, params)` collapse onto one query and one server subscription
//! - Every request settles exactly once: response, error, timeout or disconnect
//! - Links drop with the transport and are re-established on the next session
//! - Snapshots persist to [`Storage`] and are read back lazily
//!
//! # Quick Start
//!
//! ```no_run
//! use rosa_client::{Client, Result, callback};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder()
//!         .endpoint("wss://sync.example.com/socket")
//!         .build()?;
//!     client.connect()?;
//!
//!     let _subscription = client
//!         .watch("items", json!({"listId": 7}), callback(|view| {
//!             println!("items: {:?}", view.data());
//!         }))
//!         .await?;
//!
//!     client.wait_ready().await?;
//!     let total = client.exec("cart.total", json!({"cart": 1})).await?;
//!     println!("total: {total}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`] and [`ClientBuilder`] |
//! | [`codec`] | Frame and extended JSON encoding |
//! | [`config`] | [`ClientConfig`] and policies |
//! | [`connection`] | Connection task and [`Connection`] handle |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Request, client and server ids |
//! | [`protocol`] | Handshake and versioned protocols |
//! | [`query`] | Queries, views and subscriptions |
//! | [`session`] | Resumable session credentials |
//! | [`storage`] | Durable key-value storage |
//! | [`transport`] | Transport traits and WebSocket connector |

// ============================================================================
// Modules
// ============================================================================

/// Consumer entry point.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Frame codec and extended JSON values.
pub mod codec;

/// Client configuration.
pub mod config;

/// Connection runtime.
///
/// Internal task plus the public [`Connection`] handle.
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Identifiers for requests and subscriptions.
pub mod identifiers;

/// Wire protocol.
pub mod protocol;

/// Queries and subscriptions.
pub mod query;

/// Session credentials.
pub mod session;

/// Durable storage.
pub mod storage;

/// Transport layer.
///
/// WebSocket client transport plus the traits custom transports implement.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, ClientBuilder};

// Configuration types
pub use config::{ClientConfig, OfflinePolicy, ReconnectPolicy};

// Connection types
pub use connection::{Connection, ConnectionEvent, ConnectionState};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ClientId, RequestId, ServerId};

// Query types
pub use query::{QueryCallback, QueryState, QueryView, Subscription, callback};

// Storage types
pub use storage::{FileStorage, MemoryStorage, Storage};

// Transport types
pub use transport::{Connector, Transport, TransportEvent, WebSocketConnector};
