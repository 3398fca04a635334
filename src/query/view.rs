//! Consumer-facing query handles.
//!
//! A [`QueryView`] is a cheap, cloneable window onto one query. It reads the
//! shared state directly and routes subscription changes back to the
//! connection task, which owns the subscriber lists.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::error;

use crate::connection::Command;
use crate::error::{Error, Result};
use crate::identifiers::ClientId;
use crate::storage::Storage;

// ============================================================================
// Types
// ============================================================================

/// Callback invoked with the query view on every delivered snapshot.
///
/// Callbacks are compared by pointer: registering the same `Arc` twice is a
/// no-op.
pub type QueryCallback = Arc<dyn Fn(&QueryView) + Send + Sync>;

/// Wraps a closure as a [`QueryCallback`].
#[inline]
#[must_use]
pub fn callback<F>(f: F) -> QueryCallback
where
    F: Fn(&QueryView) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Invokes `callback` with `view`, containing a panic to this one call.
///
/// Returns `false` if the callback panicked.
pub(crate) fn notify(callback: &QueryCallback, view: &QueryView) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(view))) {
        Ok(()) => true,
        Err(_) => {
            error!(query = %view.id(), "Subscriber panicked");
            false
        }
    }
}

/// Lifecycle of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryState {
    /// Not subscribed on the server.
    #[default]
    Inactive,
    /// A `watch` request is in flight.
    Requested,
    /// The server acknowledged the subscription.
    Confirmed,
    /// A complete snapshot has been delivered.
    Ready,
    /// The subscription request failed.
    Error,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Requested => "requested",
            Self::Confirmed => "confirmed",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

// ============================================================================
// QueryShared
// ============================================================================

/// In-memory copy of the snapshot.
struct CachedData {
    value: Value,
    last_access: Instant,
}

/// State shared between the connection task and every view of a query.
pub(crate) struct QueryShared {
    id: ClientId,
    name: String,
    params: Value,
    state: RwLock<QueryState>,
    data: Mutex<Option<CachedData>>,
    storage: Arc<dyn Storage>,
    data_ttl: Duration,
}

impl QueryShared {
    pub(crate) fn new(
        name: &str,
        params: Value,
        storage: Arc<dyn Storage>,
        data_ttl: Duration,
    ) -> Self {
        Self {
            id: ClientId::for_query(name, &params),
            name: name.to_string(),
            params,
            state: RwLock::new(QueryState::Inactive),
            data: Mutex::new(None),
            storage,
            data_ttl,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> &ClientId {
        &self.id
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn params(&self) -> &Value {
        &self.params
    }

    #[inline]
    pub(crate) fn state(&self) -> QueryState {
        *self.state.read()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: QueryState) {
        *self.state.write() = state;
    }

    /// Persists a complete snapshot and keeps it in memory.
    pub(crate) fn set_data(&self, value: Value) {
        self.storage.set(self.id.as_str(), value.clone());
        *self.data.lock() = Some(CachedData {
            value,
            last_access: Instant::now(),
        });
    }

    /// Returns the snapshot, loading it from storage when the in-memory copy
    /// was dropped.
    pub(crate) fn data(&self) -> Option<Value> {
        let now = Instant::now();
        let mut cached = self.data.lock();

        if let Some(entry) = cached.as_mut()
            && now.duration_since(entry.last_access) < self.data_ttl
        {
            entry.last_access = now;
            return Some(entry.value.clone());
        }

        let value = self.storage.get(self.id.as_str())?;
        *cached = Some(CachedData {
            value: value.clone(),
            last_access: now,
        });
        Some(value)
    }

    /// Drops the in-memory copy if it has not been read within the TTL.
    pub(crate) fn release_idle_data(&self, now: Instant) {
        let mut cached = self.data.lock();
        if cached
            .as_ref()
            .is_some_and(|entry| now.duration_since(entry.last_access) >= self.data_ttl)
        {
            *cached = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn has_cached_data(&self) -> bool {
        self.data.lock().is_some()
    }
}

// ============================================================================
// QueryView
// ============================================================================

/// Read handle on a query.
#[derive(Clone)]
pub struct QueryView {
    shared: Arc<QueryShared>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl QueryView {
    pub(crate) fn new(
        shared: Arc<QueryShared>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self { shared, commands }
    }

    /// Deterministic identity of this query.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ClientId {
        self.shared.id()
    }

    /// Publication name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Publication params.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &Value {
        self.shared.params()
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> QueryState {
        self.shared.state()
    }

    /// Latest complete snapshot, if one was ever delivered or persisted.
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        self.shared.data()
    }

    /// Registers `callback` for snapshots of this query.
    ///
    /// The callback is invoked once right away with the current view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub fn subscribe(&self, callback: QueryCallback) -> Result<Subscription> {
        self.send(Command::AddSubscriber {
            shared: Arc::clone(&self.shared),
            callback: Arc::clone(&callback),
        })?;
        Ok(Subscription::new(self.clone(), callback))
    }

    fn send(&self, command: Command) -> Result<()> {
        let commands = self.commands.upgrade().ok_or(Error::ClientClosed)?;
        commands.send(command).map_err(|_| Error::ClientClosed)
    }
}

impl PartialEq for QueryView {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for QueryView {}

impl fmt::Debug for QueryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryView")
            .field("id", self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A registered callback on one query.
pub struct Subscription {
    view: QueryView,
    callback: QueryCallback,
}

impl Subscription {
    pub(crate) fn new(view: QueryView, callback: QueryCallback) -> Self {
        Self { view, callback }
    }

    /// The query this subscription is attached to.
    #[inline]
    #[must_use]
    pub fn view(&self) -> &QueryView {
        &self.view
    }

    /// The registered callback.
    #[inline]
    #[must_use]
    pub fn callback(&self) -> &QueryCallback {
        &self.callback
    }

    /// Removes the callback.
    ///
    /// Once a query has no callbacks left it becomes eligible for eviction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub fn unsubscribe(self) -> Result<()> {
        self.view.send(Command::RemoveSubscriber {
            client_id: self.view.id().clone(),
            callback: self.callback,
        })
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("query", self.view.id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
