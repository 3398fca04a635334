//! Consumer entry point.
//!
//! [`Client`] wraps a [`Connection`] with the operations applications use
//! day to day: subscribing callbacks to queries and executing actions.
//! Subscriptions work in every connection state; the client links them on
//! the server whenever a session becomes ready.
//!
//! # Example
//!
//! ```no_run
//! use rosa_client::{Client, callback};
//! use serde_json::json;
//!
//! # async fn example() -> rosa_client::Result<()> {
//! let client = Client::builder()
//!     .endpoint("wss://sync.example.com/socket")
//!     .build()?;
//! client.connect()?;
//!
//! let subscription = client
//!     .watch("items", json!({"listId": 7}), callback(|view| {
//!         println!("{:?} -> {:?}", view.state(), view.data());
//!     }))
//!     .await?;
//!
//! client.wait_ready().await?;
//! let total = client.exec("cart.total", json!({"cart": 1})).await?;
//! println!("{total}");
//!
//! client.unwatch(subscription)?;
//! client.shutdown();
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;
use tokio::sync::broadcast;

use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::error::Result;
use crate::query::{QueryCallback, QueryView, Subscription};

// ============================================================================
// Submodules
// ============================================================================

/// Client builder.
pub mod builder;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientBuilder;

// ============================================================================
// Client
// ============================================================================

/// Sync client.
///
/// Cloning is cheap; clones share one connection.
#[derive(Debug, Clone)]
pub struct Client {
    connection: Connection,
}

impl Client {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_connection(connection: Connection) -> Self {
        Self { connection }
    }

    /// The underlying connection, for raw protocol calls.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts connecting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`](crate::Error::ClientClosed) after shutdown.
    pub fn connect(&self) -> Result<()> {
        self.connection.connect()
    }

    /// Closes the current transport; the client reconnects after the
    /// configured delay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`](crate::Error::ClientClosed) after shutdown.
    pub fn disconnect(&self) -> Result<()> {
        self.connection.disconnect()
    }

    /// Stops the client for good.
    pub fn shutdown(&self) {
        self.connection.shutdown();
    }

    /// Current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Returns `true` once the session is established.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.connection.is_ready()
    }

    /// Subscribes to connection events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.events()
    }

    /// Waits until the session is established.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`](crate::Error::ClientClosed) if the
    /// client shuts down first.
    pub async fn wait_ready(&self) -> Result<()> {
        self.connection.wait_ready().await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns the query for `(name, params)` without subscribing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`](crate::Error::ClientClosed) after shutdown.
    pub async fn query(&self, name: &str, params: Value) -> Result<QueryView> {
        self.connection.query(name, params).await
    }

    /// Registers `callback` on the query for `(name, params)`.
    ///
    /// The callback runs once right away and again on every snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`](crate::Error::ClientClosed) after shutdown.
    pub async fn watch(
        &self,
        name: &str,
        params: Value,
        callback: QueryCallback,
    ) -> Result<Subscription> {
        self.connection.subscribe(name, params, callback).await
    }

    /// Removes a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`](crate::Error::ClientClosed) after shutdown.
    pub fn unwatch(&self, subscription: Subscription) -> Result<()> {
        subscription.unsubscribe()
    }

    /// Removes `callback` from every query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`](crate::Error::ClientClosed) after shutdown.
    pub fn unwatch_all(&self, callback: &QueryCallback) -> Result<()> {
        self.connection.unsubscribe_all(callback)
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Executes the server action `name`.
    ///
    /// # Errors
    ///
    /// See [`Connection::exec`].
    pub async fn exec(&self, name: &str, params: Value) -> Result<Value> {
        self.connection.exec(name, params).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::identifiers::ClientId;
    use crate::query::{QueryState, callback};
    use crate::transport::testing::{MockConnector, MockLink, settle};

    type Seen = Arc<Mutex<Vec<(ClientId, QueryState, Option<Value>)>>>;

    fn client() -> (Client, Arc<MockConnector>) {
        let connector = MockConnector::new();
        let client = Client::builder()
            .connector(connector.clone())
            .build()
            .expect("build");
        (client, connector)
    }

    fn recorder() -> (QueryCallback, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = callback(move |view| {
            sink.lock()
                .push((view.id().clone(), view.state(), view.data()));
        });
        (cb, seen)
    }

    async fn handshake(client: &Client, connector: &MockConnector) -> MockLink {
        client.connect().expect("connect");
        settle().await;
        let link = connector.latest();
        link.accept();
        settle().await;
        link.push(0, "switchProtocol", json!({"version": "v1"}));
        settle().await;
        let id = link.last_request_id("sessionNew");
        link.push(id, "sessionNew", json!({"session": "s", "secret": "k"}));
        settle().await;
        link
    }

    #[tokio::test(start_paused = true)]
    async fn test_watches_before_ready_share_one_subscription() {
        let (client, connector) = client();
        let params = json!({"listId": 7});
        let expected = ClientId::for_query("items", &params);

        let (first, seen_first) = recorder();
        let (second, seen_second) = recorder();
        let a = client.watch("items", params.clone(), first).await.expect("watch");
        let b = client.watch("items", params.clone(), second).await.expect("watch");
        assert_eq!(a.view(), b.view());

        // Each callback ran once on registration.
        assert_eq!(seen_first.lock().len(), 1);
        assert_eq!(seen_second.lock().len(), 1);

        let link = handshake(&client, &connector).await;
        assert!(client.is_ready());

        let watches = link.sent_of("watch");
        assert_eq!(watches.len(), 1);
        let (request_id, payload) = &watches[0];
        assert_eq!(
            payload,
            &json!({"id": expected.as_str(), "name": "items", "params": {"listId": 7}})
        );

        link.push(*request_id, "watch", json!({"id": 42}));
        settle().await;
        link.push(
            0,
            "watchData",
            json!({"id": 42, "version": 1, "part": 1, "total": 1, "stream": "[{\"n\":1}]"}),
        );
        settle().await;

        for seen in [&seen_first, &seen_second] {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            let (id, state, data) = &seen[1];
            assert_eq!(id, &expected);
            assert_eq!(*state, QueryState::Ready);
            assert_eq!(data, &Some(json!([{"n": 1}])));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_version_supersedes_partial_snapshot() {
        let (client, connector) = client();
        let (cb, seen) = recorder();
        let subscription = client.watch("items", json!({}), cb).await.expect("watch");

        let link = handshake(&client, &connector).await;
        let id = link.last_request_id("watch");
        link.push(id, "watch", json!({"id": 42}));
        settle().await;

        let chunk = |version: u64, part: u32, total: u32, stream: &str| {
            json!({"id": 42, "version": version, "part": part, "total": total, "stream": stream})
        };
        link.push(0, "watchData", chunk(2, 1, 3, "[1,"));
        link.push(0, "watchData", chunk(3, 1, 2, "[\"a\","));
        link.push(0, "watchData", chunk(2, 2, 3, "2,"));
        link.push(0, "watchData", chunk(3, 2, 2, "\"b\"]"));
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].2, Some(json!(["a", "b"])));
        assert_eq!(subscription.view().data(), Some(json!(["a", "b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_does_not_touch_server() {
        let (client, connector) = client();
        let link = handshake(&client, &connector).await;

        let view = client.query("items", json!({})).await.expect("query");
        settle().await;
        assert_eq!(view.state(), QueryState::Inactive);
        assert!(link.sent_of("watch").is_empty());

        let _subscription = view.subscribe(callback(|_| {})).expect("subscribe");
        settle().await;
        assert_eq!(link.sent_of("watch").len(), 1);
        assert_eq!(view.state(), QueryState::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_all_stops_notifications() {
        let (client, connector) = client();
        let (cb, seen) = recorder();
        client.watch("a", json!({}), Arc::clone(&cb)).await.expect("watch");
        client.watch("b", json!({}), Arc::clone(&cb)).await.expect("watch");
        assert_eq!(seen.lock().len(), 2);

        let link = handshake(&client, &connector).await;
        for (request_id, payload) in link.sent_of("watch") {
            let handle = if payload["name"] == json!("a") { 1 } else { 2 };
            link.push(request_id, "watch", json!({"id": handle}));
        }
        settle().await;

        client.unwatch_all(&cb).expect("unwatch all");
        settle().await;
        link.push(0, "watchData", json!({"id": 1, "part": 1, "total": 1, "stream": "[]"}));
        settle().await;
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_survives_in_storage() {
        let (client, connector) = client();
        let (cb, _seen) = recorder();
        let subscription = client.watch("items", json!({}), cb).await.expect("watch");

        let link = handshake(&client, &connector).await;
        link.push(link.last_request_id("watch"), "watch", json!({"id": 3}));
        settle().await;
        link.push(0, "watchData", json!({"id": 3, "part": 1, "total": 1, "stream": "{\"v\":1}"}));
        settle().await;

        // Past the in-memory TTL and a sweep; the value comes back from storage.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(subscription.view().data(), Some(json!({"v": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready() {
        let (client, connector) = client();
        let waiter = tokio::spawn({
            let client = client.clone();
            async move { client.wait_ready().await }
        });

        let _link = handshake(&client, &connector).await;
        waiter.await.expect("join").expect("ready");
    }
}
