//! Connection-side state of one query.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::codec::decode_value;
use crate::connection::Command;
use crate::error::Result;
use crate::identifiers::{ClientId, ServerId};

use super::reassembly::{Chunk, Progress, Reassembly};
use super::view::{QueryCallback, QueryShared, QueryState, QueryView, notify};

// ============================================================================
// LinkState
// ============================================================================

/// Server subscription status of a query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum LinkState {
    /// No subscription on the server.
    #[default]
    Unlinked,
    /// A `watch` is in flight.
    Pending,
    /// Subscribed under the given handle.
    Linked(ServerId),
}

// ============================================================================
// Query
// ============================================================================

/// A query with its subscribers, link status and reassembly buffer.
pub(crate) struct Query {
    shared: Arc<QueryShared>,
    commands: mpsc::WeakUnboundedSender<Command>,
    link: LinkState,
    subscribers: Vec<QueryCallback>,
    unused_since: Option<Instant>,
    reassembly: Reassembly,
}

impl Query {
    pub(crate) fn new(
        shared: Arc<QueryShared>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            shared,
            commands,
            link: LinkState::Unlinked,
            subscribers: Vec::new(),
            unused_since: Some(Instant::now()),
            reassembly: Reassembly::default(),
        }
    }

    #[inline]
    pub(crate) fn client_id(&self) -> &ClientId {
        self.shared.id()
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        self.shared.name()
    }

    #[inline]
    pub(crate) fn params(&self) -> &Value {
        self.shared.params()
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Arc<QueryShared> {
        &self.shared
    }

    #[inline]
    pub(crate) fn state(&self) -> QueryState {
        self.shared.state()
    }

    pub(crate) fn view(&self) -> QueryView {
        QueryView::new(Arc::clone(&self.shared), self.commands.clone())
    }

    // ========================================================================
    // Link
    // ========================================================================

    #[inline]
    pub(crate) fn link_state(&self) -> &LinkState {
        &self.link
    }

    #[inline]
    pub(crate) fn is_unlinked(&self) -> bool {
        self.link == LinkState::Unlinked
    }

    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        self.link == LinkState::Pending
    }

    pub(crate) fn server_id(&self) -> Option<&ServerId> {
        match &self.link {
            LinkState::Linked(server_id) => Some(server_id),
            _ => None,
        }
    }

    /// A `watch` for this query was sent.
    pub(crate) fn begin_link(&mut self) {
        self.link = LinkState::Pending;
        self.shared.set_state(QueryState::Requested);
    }

    /// The server acknowledged the `watch`.
    pub(crate) fn confirm_link(&mut self, server_id: ServerId) {
        debug!(query = %self.client_id(), server = %server_id, "Query linked");
        self.link = LinkState::Linked(server_id);
        self.shared.set_state(QueryState::Confirmed);
    }

    /// The `watch` failed.
    pub(crate) fn fail_link(&mut self) {
        self.link = LinkState::Unlinked;
        self.shared.set_state(QueryState::Error);
    }

    /// Forgets the server subscription, keeping the query state.
    pub(crate) fn reset_link(&mut self) {
        self.link = LinkState::Unlinked;
        self.reassembly = Reassembly::default();
    }

    /// The query left the store.
    pub(crate) fn retire(&mut self) {
        self.reset_link();
        self.shared.set_state(QueryState::Inactive);
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    /// Adds `callback` unless it is already registered.
    pub(crate) fn add_subscriber(&mut self, callback: QueryCallback) -> bool {
        self.unused_since = None;
        if self.has_subscriber(&callback) {
            return false;
        }
        self.subscribers.push(callback);
        true
    }

    /// Removes `callback`; returns `true` if it was registered.
    pub(crate) fn remove_subscriber(&mut self, callback: &QueryCallback) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|cb| !Arc::ptr_eq(cb, callback));
        let removed = self.subscribers.len() != before;

        if removed && self.subscribers.is_empty() {
            self.unused_since = Some(Instant::now());
        }
        removed
    }

    pub(crate) fn has_subscriber(&self, callback: &QueryCallback) -> bool {
        self.subscribers.iter().any(|cb| Arc::ptr_eq(cb, callback))
    }

    #[inline]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns `true` if the query has had no subscribers for at least `grace`.
    pub(crate) fn is_unused(&self, grace: Duration, now: Instant) -> bool {
        self.subscribers.is_empty()
            && self
                .unused_since
                .is_some_and(|since| now.duration_since(since) >= grace)
    }

    // ========================================================================
    // Data
    // ========================================================================

    /// Feeds one chunk into the reassembly buffer.
    ///
    /// On completion the snapshot is decoded, persisted, the query becomes
    /// ready and every subscriber is notified. Returns `true` in that case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reassembly`](crate::Error::Reassembly) for inconsistent
    /// chunks, or a decode error for a snapshot that is not valid JSON.
    pub(crate) fn receive_chunk(&mut self, chunk: Chunk) -> Result<bool> {
        let Progress::Complete { version, text } = self.reassembly.push(chunk)? else {
            return Ok(false);
        };

        let value = decode_value(&text)?;
        debug!(query = %self.client_id(), version, "Snapshot complete");
        self.shared.set_data(value);
        self.shared.set_state(QueryState::Ready);
        self.broadcast();
        Ok(true)
    }

    /// Invokes every subscriber with the current view.
    pub(crate) fn broadcast(&self) {
        let view = self.view();
        for callback in &self.subscribers {
            notify(callback, &view);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::query::view::callback;
    use crate::storage::{MemoryStorage, Storage};

    fn query() -> (Query, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let shared = QueryShared::new(
            "items",
            json!({"listId": 7}),
            Arc::clone(&storage),
            Duration::from_secs(1),
        );
        let (commands_tx, _commands_rx) = mpsc::unbounded_channel();
        (Query::new(Arc::new(shared), commands_tx.downgrade()), storage)
    }

    fn chunk(version: u64, sequence: u32, total: u32, data: &str) -> Chunk {
        Chunk {
            version,
            sequence,
            total,
            data: data.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_are_deduplicated() {
        let (mut query, _) = query();
        let cb = callback(|_| {});

        assert!(query.add_subscriber(Arc::clone(&cb)));
        assert!(!query.add_subscriber(Arc::clone(&cb)));
        assert_eq!(query.subscriber_count(), 1);

        assert!(query.remove_subscriber(&cb));
        assert!(!query.remove_subscriber(&cb));
        assert_eq!(query.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unused_after_grace() {
        let (mut query, _) = query();
        let grace = Duration::from_secs(10);
        let cb = callback(|_| {});

        query.add_subscriber(Arc::clone(&cb));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!query.is_unused(grace, Instant::now()));

        query.remove_subscriber(&cb);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!query.is_unused(grace, Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(query.is_unused(grace, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_snapshot_notifies_and_persists() {
        let (mut query, storage) = query();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        query.add_subscriber(callback(move |view| {
            assert_eq!(view.state(), QueryState::Ready);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!query.receive_chunk(chunk(1, 2, 2, "2]")).expect("chunk"));
        assert!(query.receive_chunk(chunk(1, 1, 2, "[1,")).expect("chunk"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.view().data(), Some(json!([1, 2])));
        assert_eq!(storage.get(query.client_id().as_str()), Some(json!([1, 2])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_snapshot_is_error() {
        let (mut query, _) = query();
        assert!(query.receive_chunk(chunk(1, 1, 1, "{oops")).is_err());
        assert_eq!(query.state(), QueryState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_transitions() {
        let (mut query, _) = query();
        assert!(query.is_unlinked());

        query.begin_link();
        assert!(query.is_pending());
        assert_eq!(query.state(), QueryState::Requested);

        query.confirm_link(ServerId::Number(42));
        assert_eq!(query.server_id(), Some(&ServerId::Number(42)));
        assert_eq!(query.state(), QueryState::Confirmed);

        query.reset_link();
        assert!(query.is_unlinked());
        assert_eq!(query.state(), QueryState::Confirmed);

        query.begin_link();
        query.fail_link();
        assert_eq!(query.link_state(), &LinkState::Unlinked);
        assert_eq!(query.state(), QueryState::Error);
    }
}
