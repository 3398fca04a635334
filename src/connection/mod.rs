//! Connection runtime.
//!
//! One spawned task owns everything mutable about a connection: state,
//! protocol, request tracker, query store and the request id counter. The
//! public [`Connection`] handle talks to it over a command channel, so all
//! mutation happens on a single writer.
//!
//! # Architecture
//!
//! ```text
//! Connection ──Command──►┐
//! QueryView ──Command───►│
//!                        ▼
//! Transport ──Event──► ConnectionCore ──Message──► outbound worker ──► Transport
//!                        │
//!                        ├──► watch::Sender<ConnectionState>
//!                        └──► broadcast::Sender<ConnectionEvent>
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | Connection task |
//! | `state` | [`ConnectionState`] and [`ConnectionEvent`] |
//! | `tracker` | Pending request bookkeeping |
//! | `wire` | Request id minting and outbound queue |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::identifiers::{ClientId, ServerId};
use crate::query::view::QueryShared;
use crate::query::{QueryCallback, QueryView, Subscription};
use crate::storage::Storage;
use crate::transport::Connector;

// ============================================================================
// Submodules
// ============================================================================

pub(crate) mod core;
pub(crate) mod state;
pub(crate) mod tracker;
pub(crate) mod wire;

// ============================================================================
// Re-exports
// ============================================================================

pub use state::{ConnectionEvent, ConnectionState};

use self::core::ConnectionCore;

// ============================================================================
// Commands
// ============================================================================

/// One-shot reply channel.
pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Protocol capability calls, subject to the offline policy.
pub(crate) enum Call {
    Exec {
        name: String,
        params: Value,
        reply: Reply<Value>,
    },
    Watch {
        name: String,
        params: Value,
        reply: Reply<QueryView>,
    },
    Unwatch {
        server_id: ServerId,
        reply: Reply<Value>,
    },
    UnwatchAll {
        callback: QueryCallback,
        reply: Reply<()>,
    },
}

impl Call {
    /// Fails the call without running it.
    pub(crate) fn reject(self, error: Error) {
        match self {
            Self::Exec { reply, .. } | Self::Unwatch { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::Watch { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::UnwatchAll { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Messages handled by the connection task.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Shutdown,
    Call(Call),
    /// Returns the query for `(name, params)` without touching the server.
    Query {
        name: String,
        params: Value,
        reply: oneshot::Sender<QueryView>,
    },
    /// Creates the query if needed and registers `callback` on it.
    Subscribe {
        name: String,
        params: Value,
        callback: QueryCallback,
        reply: oneshot::Sender<QueryView>,
    },
    AddSubscriber {
        shared: Arc<QueryShared>,
        callback: QueryCallback,
    },
    RemoveSubscriber {
        client_id: ClientId,
        callback: QueryCallback,
    },
    /// Removes `callback` from every query.
    UnsubscribeAll {
        callback: QueryCallback,
    },
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to a connection task.
///
/// Cloning is cheap; all clones drive the same connection. The task stops
/// on [`shutdown`](Self::shutdown) or once every handle is dropped.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connection {
    /// Spawns the connection task. Nothing is opened until
    /// [`connect`](Self::connect).
    pub(crate) fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(config.event_capacity);

        let core = ConnectionCore::new(
            config,
            connector,
            storage,
            commands_tx.downgrade(),
            state_tx,
            events_tx.clone(),
        );
        tokio::spawn(core.run(commands_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens a transport unless one is already open or opening.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] after shutdown.
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Closes the current transport. A reconnect is scheduled as for any
    /// other close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] after shutdown.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Stops the connection task, failing everything still pending.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns `true` once the session is established.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Subscribes to connection events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Waits until the session is established.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the task stops first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| *state == ConnectionState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| Error::ClientClosed)
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Executes the server action `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] without an active protocol
    /// - [`Error::Unsupported`] during the handshake
    /// - [`Error::Server`] if the server rejects the call
    /// - [`Error::RequestTimeout`] or [`Error::Disconnected`] if no response arrives
    pub async fn exec(&self, name: &str, params: Value) -> Result<Value> {
        self.call(|reply| Call::Exec {
            name: name.to_string(),
            params,
            reply,
        })
        .await
    }

    /// Returns the query for `(name, params)` and subscribes it on the server.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] without an active protocol
    /// - [`Error::Unsupported`] during the handshake
    pub async fn watch(&self, name: &str, params: Value) -> Result<QueryView> {
        self.call(|reply| Call::Watch {
            name: name.to_string(),
            params,
            reply,
        })
        .await
    }

    /// Drops the server subscription under `server_id`.
    ///
    /// # Errors
    ///
    /// Same as [`exec`](Self::exec).
    pub async fn unwatch(&self, server_id: ServerId) -> Result<Value> {
        self.call(|reply| Call::Unwatch { server_id, reply }).await
    }

    /// Removes `callback` from every query.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] without an active protocol
    /// - [`Error::Unsupported`] during the handshake
    pub async fn unwatch_all(&self, callback: &QueryCallback) -> Result<()> {
        let callback = Arc::clone(callback);
        self.call(|reply| Call::UnwatchAll { callback, reply }).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns the query for `(name, params)` without subscribing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] after shutdown.
    pub async fn query(&self, name: &str, params: Value) -> Result<QueryView> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Query {
            name: name.to_string(),
            params,
            reply,
        })?;
        rx.await.map_err(|_| Error::ClientClosed)
    }

    /// Registers `callback` on the query for `(name, params)`.
    ///
    /// Works in every state; the query is subscribed on the server once the
    /// session is ready. The callback runs once right away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] after shutdown.
    pub async fn subscribe(
        &self,
        name: &str,
        params: Value,
        callback: QueryCallback,
    ) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            name: name.to_string(),
            params,
            callback: Arc::clone(&callback),
            reply,
        })?;
        let view = rx.await.map_err(|_| Error::ClientClosed)?;
        Ok(Subscription::new(view, callback))
    }

    /// Removes `callback` from every query, in every state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] after shutdown.
    pub fn unsubscribe_all(&self, callback: &QueryCallback) -> Result<()> {
        self.send(Command::UnsubscribeAll {
            callback: Arc::clone(callback),
        })
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ClientClosed)
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Call) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call(build(reply)))?;
        rx.await.map_err(|_| Error::ClientClosed)?
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
