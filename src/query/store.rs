//! Registry of live queries.
//!
//! Queries are keyed by [`ClientId`]; a secondary index maps server handles
//! back to client ids for routing pushed data. A server handle is in the
//! index exactly while its query is linked under it.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::Command;
use crate::error::{Error, Result};
use crate::identifiers::{ClientId, ServerId};
use crate::storage::Storage;

use super::entry::Query;
use super::reassembly::Chunk;
use super::view::{QueryCallback, QueryShared};

// ============================================================================
// QueryStore
// ============================================================================

/// Owns every query of a connection.
pub(crate) struct QueryStore {
    queries: FxHashMap<ClientId, Query>,
    by_server: FxHashMap<ServerId, ClientId>,
    storage: Arc<dyn Storage>,
    commands: mpsc::WeakUnboundedSender<Command>,
    data_ttl: Duration,
}

impl QueryStore {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        commands: mpsc::WeakUnboundedSender<Command>,
        data_ttl: Duration,
    ) -> Self {
        Self {
            queries: FxHashMap::default(),
            by_server: FxHashMap::default(),
            storage,
            commands,
            data_ttl,
        }
    }

    /// Returns the query for `(name, params)`, creating it if needed.
    pub(crate) fn get_or_create(&mut self, name: &str, params: Value) -> &mut Query {
        let client_id = ClientId::for_query(name, &params);
        self.queries.entry(client_id).or_insert_with(|| {
            let shared = QueryShared::new(name, params, Arc::clone(&self.storage), self.data_ttl);
            debug!(query = %shared.id(), name, "Query created");
            Query::new(Arc::new(shared), self.commands.clone())
        })
    }

    /// Returns the query a view points at, re-inserting it if it was evicted.
    pub(crate) fn adopt(&mut self, shared: &Arc<QueryShared>) -> &mut Query {
        self.queries.entry(shared.id().clone()).or_insert_with(|| {
            debug!(query = %shared.id(), "Query re-adopted");
            Query::new(Arc::clone(shared), self.commands.clone())
        })
    }

    #[inline]
    pub(crate) fn get(&self, client_id: &ClientId) -> Option<&Query> {
        self.queries.get(client_id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, client_id: &ClientId) -> Option<&mut Query> {
        self.queries.get_mut(client_id)
    }

    /// Looks a query up by its server handle.
    pub(crate) fn by_server_id(&mut self, server_id: &ServerId) -> Option<&mut Query> {
        let client_id = self.by_server.get(server_id)?;
        self.queries.get_mut(client_id)
    }

    /// Ids of every query, in no particular order.
    pub(crate) fn client_ids(&self) -> Vec<ClientId> {
        self.queries.keys().cloned().collect()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.queries.len()
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Settles a `watch` for `client_id`.
    pub(crate) fn on_watch_result(&mut self, client_id: &ClientId, outcome: Result<Value>) {
        let Some(query) = self.queries.get_mut(client_id) else {
            debug!(query = %client_id, "Watch settled for unknown query");
            return;
        };
        if !query.is_pending() {
            debug!(query = %client_id, "Watch settled for query no longer pending");
            return;
        }

        let server_id = outcome.and_then(|value| {
            ServerId::from_value(&value)
                .ok_or_else(|| Error::protocol(format!("watch response without handle: {value}")))
        });

        match server_id {
            Ok(server_id) => {
                query.confirm_link(server_id.clone());
                self.by_server.insert(server_id, client_id.clone());
            }
            Err(e) => {
                warn!(query = %client_id, error = %e, "Watch failed");
                query.fail_link();
            }
        }
    }

    /// Settles an `unwatch` sent on behalf of `client_id`.
    pub(crate) fn on_unwatch_result(&mut self, client_id: &ClientId, outcome: Result<Value>) {
        match outcome {
            Ok(_) => debug!(query = %client_id, "Unwatch acknowledged"),
            Err(e) => warn!(query = %client_id, error = %e, "Unwatch failed"),
        }
    }

    /// The server dropped the subscription under `server_id`.
    pub(crate) fn mark_inactive(&mut self, server_id: &ServerId) {
        let Some(client_id) = self.by_server.remove(server_id) else {
            debug!(server = %server_id, "Unwatch for unknown handle");
            return;
        };
        if let Some(query) = self.queries.get_mut(&client_id) {
            query.retire();
        }
    }

    /// Marks every query unlinked and clears the handle index.
    pub(crate) fn reset_links(&mut self) {
        self.by_server.clear();
        for query in self.queries.values_mut() {
            query.reset_link();
        }
    }

    // ========================================================================
    // Data
    // ========================================================================

    /// Routes a pushed chunk to the query linked under `server_id`.
    ///
    /// # Errors
    ///
    /// Propagates reassembly and decode failures.
    pub(crate) fn receive_chunk(&mut self, server_id: &ServerId, chunk: Chunk) -> Result<()> {
        let Some(query) = self.by_server_id(server_id) else {
            debug!(server = %server_id, "Data for unknown handle");
            return Ok(());
        };
        query.receive_chunk(chunk)?;
        Ok(())
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    pub(crate) fn remove_subscriber(&mut self, client_id: &ClientId, callback: &QueryCallback) {
        if let Some(query) = self.queries.get_mut(client_id) {
            query.remove_subscriber(callback);
        }
    }

    /// Removes `callback` from every query.
    pub(crate) fn unsubscribe_all(&mut self, callback: &QueryCallback) {
        for query in self.queries.values_mut() {
            query.remove_subscriber(callback);
        }
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    /// Removes queries unused for at least `grace`.
    ///
    /// Queries with a `watch` in flight stay until it settles.
    pub(crate) fn take_unused(&mut self, grace: Duration, now: Instant) -> Vec<Query> {
        let evicted: Vec<ClientId> = self
            .queries
            .iter()
            .filter(|(_, query)| query.is_unused(grace, now) && !query.is_pending())
            .map(|(client_id, _)| client_id.clone())
            .collect();

        evicted
            .into_iter()
            .filter_map(|client_id| {
                let query = self.queries.remove(&client_id)?;
                if let Some(server_id) = query.server_id() {
                    self.by_server.remove(server_id);
                }
                Some(query)
            })
            .collect()
    }

    /// Drops in-memory snapshots that were not read recently.
    pub(crate) fn release_idle_data(&self, now: Instant) {
        for query in self.queries.values() {
            query.shared().release_idle_data(now);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::query::view::{QueryState, callback};
    use crate::storage::MemoryStorage;

    fn store() -> (QueryStore, mpsc::UnboundedSender<Command>) {
        let (commands_tx, _commands_rx) = mpsc::unbounded_channel();
        let store = QueryStore::new(
            Arc::new(MemoryStorage::new()),
            commands_tx.downgrade(),
            Duration::from_secs(1),
        );
        (store, commands_tx)
    }

    fn link(store: &mut QueryStore, name: &str, handle: u64) -> ClientId {
        let query = store.get_or_create(name, json!({}));
        query.begin_link();
        let client_id = query.client_id().clone();
        store.on_watch_result(&client_id, Ok(json!(handle)));
        client_id
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_params_share_one_query() {
        let (mut store, _tx) = store();
        let a = store
            .get_or_create("items", json!({"a": 1, "b": 2}))
            .client_id()
            .clone();
        let b = store
            .get_or_create("items", json!({"b": 2, "a": 1}))
            .client_id()
            .clone();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_result_indexes_handle() {
        let (mut store, _tx) = store();
        let client_id = link(&mut store, "items", 42);

        let query = store.by_server_id(&ServerId::Number(42)).expect("linked");
        assert_eq!(query.client_id(), &client_id);
        assert_eq!(query.state(), QueryState::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_error_marks_query() {
        let (mut store, _tx) = store();
        let query = store.get_or_create("items", json!({}));
        query.begin_link();
        let client_id = query.client_id().clone();

        store.on_watch_result(&client_id, Err(Error::Disconnected));
        let query = store.get(&client_id).expect("query");
        assert!(query.is_unlinked());
        assert_eq!(query.state(), QueryState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_inactive_unlinks() {
        let (mut store, _tx) = store();
        let client_id = link(&mut store, "items", 5);

        store.mark_inactive(&ServerId::Number(5));
        assert!(store.by_server_id(&ServerId::Number(5)).is_none());
        let query = store.get(&client_id).expect("query");
        assert!(query.is_unlinked());
        assert_eq!(query.state(), QueryState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_for_unknown_handle_ignored() {
        let (mut store, _tx) = store();
        let chunk = Chunk {
            version: 0,
            sequence: 1,
            total: 1,
            data: "[]".to_string(),
        };
        assert!(store.receive_chunk(&ServerId::Number(9), chunk).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_unused_respects_grace_and_subscribers() {
        let (mut store, _tx) = store();
        let grace = Duration::from_secs(10);
        let cb = callback(|_| {});

        let kept = store.get_or_create("kept", json!({})).client_id().clone();
        store.get_mut(&kept).expect("query").add_subscriber(Arc::clone(&cb));
        let linked = link(&mut store, "linked", 3);

        tokio::time::advance(Duration::from_secs(10)).await;
        let evicted = store.take_unused(grace, Instant::now());
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].client_id(), &linked);
        assert!(store.get(&kept).is_some());
        assert!(store.by_server_id(&ServerId::Number(3)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_query_not_evicted() {
        let (mut store, _tx) = store();
        store.get_or_create("items", json!({})).begin_link();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(store.take_unused(Duration::from_secs(10), Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_all_and_reset_links() {
        let (mut store, _tx) = store();
        let cb = callback(|_| {});
        let a = link(&mut store, "a", 1);
        let b = link(&mut store, "b", 2);
        for id in [&a, &b] {
            store.get_mut(id).expect("query").add_subscriber(Arc::clone(&cb));
        }

        store.unsubscribe_all(&cb);
        assert_eq!(store.get(&a).expect("a").subscriber_count(), 0);
        assert_eq!(store.get(&b).expect("b").subscriber_count(), 0);

        store.reset_links();
        assert!(store.get(&a).expect("a").is_unlinked());
        assert!(store.by_server_id(&ServerId::Number(2)).is_none());
    }
}
