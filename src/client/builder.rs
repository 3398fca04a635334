//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`Client`] instances.
//!
//! # Example
//!
//! ```no_run
//! use rosa_client::Client;
//!
//! # async fn example() -> rosa_client::Result<()> {
//! let client = Client::builder()
//!     .endpoint("wss://sync.example.com/socket")
//!     .build()?;
//! client.connect()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::{ClientConfig, OfflinePolicy, ReconnectPolicy};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::storage::{MemoryStorage, Storage};
use crate::transport::{Connector, WebSocketConnector};

use super::Client;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`] instance.
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct ClientBuilder {
    /// Server endpoint.
    endpoint: Option<String>,
    /// Custom transport factory; overrides the endpoint.
    connector: Option<Arc<dyn Connector>>,
    /// Durable storage; in-memory when unset.
    storage: Option<Arc<dyn Storage>>,
    /// Tuning knobs.
    config: ClientConfig,
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a new builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the WebSocket endpoint (`ws://` or `wss://`).
    #[must_use]
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Uses a custom transport factory instead of the WebSocket endpoint.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the durable storage for sessions and snapshots.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Sets the offline policy.
    #[must_use]
    pub fn offline_policy(mut self, policy: OfflinePolicy) -> Self {
        self.config.offline = policy;
        self
    }

    /// Sets how long a query without subscribers is kept.
    #[must_use]
    pub fn eviction_grace(mut self, grace: Duration) -> Self {
        self.config.eviction_grace = grace;
        self
    }

    /// Builds the client and spawns its connection task.
    ///
    /// Must be called within a Tokio runtime. Nothing is opened until
    /// [`Client::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if neither an endpoint nor a connector is
    /// set, the endpoint is not a WebSocket URL, or a setting is invalid.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        let connector = self.resolve_connector()?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let connection = Connection::spawn(self.config, connector, storage);
        Ok(Client::from_connection(connection))
    }

    fn resolve_connector(&self) -> Result<Arc<dyn Connector>> {
        if let Some(connector) = &self.connector {
            return Ok(Arc::clone(connector));
        }

        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            Error::config("Endpoint is required. Use .endpoint() or .connector() to set it.")
        })?;
        let url = validate_endpoint(endpoint)?;
        Ok(Arc::new(WebSocketConnector::new(url)))
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("endpoint", &self.endpoint)
            .field("connector", &self.connector.is_some())
            .field("storage", &self.storage.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Parses `endpoint` and checks for a WebSocket scheme.
fn validate_endpoint(endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::config(format!("Invalid endpoint '{endpoint}': {e}")))?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::config(format!(
            "Endpoint scheme must be ws or wss, got '{other}'"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
