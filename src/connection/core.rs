//! Connection task.
//!
//! [`ConnectionCore`] is the single writer for all connection state. Its
//! loop multiplexes expired request timers, transport events, commands, the
//! reconnect timer and the eviction sweep.

// ============================================================================
// Imports
// ============================================================================

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep, interval, sleep};
use tracing::{debug, error, info, trace, warn};

use crate::codec::decode_frame;
use crate::config::{ClientConfig, OfflinePolicy};
use crate::error::{Error, Result};
use crate::identifiers::{ClientId, RequestId};
use crate::protocol::v1::Context;
use crate::protocol::{
    Effect, HandshakeProtocol, Message, Protocol, V1Protocol, handshake, v1, versioned,
};
use crate::query::view::notify;
use crate::query::{QueryCallback, QueryStore, QueryView};
use crate::session::Session;
use crate::storage::Storage;
use crate::transport::{Connector, Transport, TransportEvent};

use super::state::{ConnectionEvent, ConnectionState};
use super::tracker::Settled;
use super::wire::{Completion, Wire, run_outbound};
use super::{Call, Command};

// ============================================================================
// Link
// ============================================================================

/// A transport with its inbound queue and outbound worker.
struct Link {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    writer: JoinHandle<()>,
}

// ============================================================================
// ConnectionCore
// ============================================================================

/// State owned by the connection task.
pub(crate) struct ConnectionCore {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    storage: Arc<dyn Storage>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    protocol: Option<Protocol>,
    link: Option<Link>,
    wire: Wire,
    expired_rx: mpsc::UnboundedReceiver<RequestId>,
    store: QueryStore,
    /// Calls held by [`OfflinePolicy::Queue`] until ready.
    parked: Vec<Call>,
    reconnect_attempt: u32,
    reconnect_at: Option<Pin<Box<Sleep>>>,
}

impl ConnectionCore {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn Storage>,
        commands: mpsc::WeakUnboundedSender<Command>,
        state_tx: watch::Sender<ConnectionState>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let wire = Wire::new(expired_tx, config.request_timeout);
        let store = QueryStore::new(Arc::clone(&storage), commands, config.data_ttl);

        Self {
            config,
            connector,
            storage,
            state: ConnectionState::Disconnected,
            state_tx,
            events,
            protocol: None,
            link: None,
            wire,
            expired_rx,
            store,
            parked: Vec::new(),
            reconnect_attempt: 0,
            reconnect_at: None,
        }
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Runs until shutdown or until every handle is dropped.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut sweep = interval(self.config.eviction_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                Some(request_id) = self.expired_rx.recv() => {
                    self.on_request_expired(request_id);
                }

                event = next_transport_event(&mut self.link) => {
                    self.on_transport_event(event);
                }

                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            debug!("Shutdown requested");
                            break;
                        }
                        Some(command) => self.on_command(command),
                    }
                }

                () = reconnect_due(&mut self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect();
                }

                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }

        self.teardown();
        debug!("Connection task terminated");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Shutdown => {}
            Command::Call(call) => self.on_call(call),

            Command::Query { name, params, reply } => {
                let view = self.store.get_or_create(&name, params).view();
                let _ = reply.send(view);
            }

            Command::Subscribe {
                name,
                params,
                callback,
                reply,
            } => {
                let client_id = self.store.get_or_create(&name, params).client_id().clone();
                if let Some(view) = self.add_subscriber(&client_id, callback) {
                    let _ = reply.send(view);
                }
            }

            Command::AddSubscriber { shared, callback } => {
                let client_id = self.store.adopt(&shared).client_id().clone();
                self.add_subscriber(&client_id, callback);
            }

            Command::RemoveSubscriber {
                client_id,
                callback,
            } => self.store.remove_subscriber(&client_id, &callback),

            Command::UnsubscribeAll { callback } => self.store.unsubscribe_all(&callback),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens a new transport unless one exists.
    fn connect(&mut self) {
        if self.link.is_some() {
            trace!("Connect ignored, transport already present");
            return;
        }

        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        let _ = self.events.send(ConnectionEvent::Connecting);
        if let Err(e) = self.set_protocol(handshake::VERSION) {
            error!(error = %e, "Failed to enter handshake");
            return;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.connector.open(events_tx);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_outbound(outbound_rx, Arc::clone(&transport)));
        self.wire.attach(outbound_tx);

        self.link = Some(Link {
            transport,
            events: events_rx,
            writer,
        });
        debug!("Transport opening");
    }

    /// Closes the current transport; the close event does the cleanup.
    fn disconnect(&mut self) {
        match &self.link {
            Some(link) => link.transport.close(),
            None => trace!("Disconnect ignored, no transport"),
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Data(text) => self.on_data(&text),
            TransportEvent::Close(reason) => self.on_close(reason),
        }
    }

    fn on_open(&mut self) {
        if self.protocol.is_none() {
            warn!("Transport opened without a protocol");
            return;
        }

        info!("Transport connected");
        self.set_state(ConnectionState::HandshakePending);
        let _ = self.events.send(ConnectionEvent::Connected);

        if let Some(protocol) = self.protocol.as_mut()
            && let Err(e) = protocol.on_connect(&mut self.wire)
        {
            warn!(error = %e, "Failed to start handshake");
        }
    }

    fn on_close(&mut self, reason: String) {
        let Some(link) = self.link.take() else {
            return;
        };

        link.writer.abort();
        drop(link);
        self.wire.detach();
        self.protocol = None;

        info!(%reason, "Transport closed");
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Disconnected {
            reason: reason.clone(),
        });

        for settled in self.wire.tracker().flush() {
            self.complete(settled);
        }
        self.store.reset_links();

        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        let attempt = self.reconnect_attempt;
        let delay = self.config.reconnect.delay(attempt);

        debug!(attempt, ?delay, "Reconnect scheduled");
        let _ = self
            .events
            .send(ConnectionEvent::Reconnecting { attempt, delay });
        self.reconnect_at = Some(Box::pin(sleep(delay)));
    }

    /// Releases everything on shutdown.
    fn teardown(&mut self) {
        self.reconnect_at = None;
        if let Some(link) = self.link.take() {
            link.transport.close();
            link.writer.abort();
        }
        self.wire.detach();
        self.protocol = None;
        self.set_state(ConnectionState::Disconnected);

        for settled in self.wire.tracker().flush() {
            self.complete(settled);
        }
        for call in self.parked.drain(..) {
            call.reject(Error::ClientClosed);
        }
    }

    fn set_state(&mut self, new: ConnectionState) {
        let old = self.state;
        self.state = new;
        self.state_tx.send_replace(new);

        if old != new {
            debug!(%old, %new, "Connection state changed");
        }

        if new == ConnectionState::Ready && old != ConnectionState::Ready {
            info!("Connection ready");
            self.reconnect_attempt = 0;
            let _ = self.events.send(ConnectionEvent::Ready);
            self.link_all();
            self.replay_parked();
        }

        let _ = self.events.send(ConnectionEvent::StateChanged { new, old });
    }

    // ========================================================================
    // Protocol
    // ========================================================================

    fn set_protocol(&mut self, version: &str) -> Result<()> {
        let protocol = match version {
            handshake::VERSION => Protocol::Handshake(HandshakeProtocol::new()),
            v1::VERSION => {
                let mut v1 = V1Protocol::new(Session::load(Arc::clone(&self.storage)));
                v1.request_session(&mut self.wire)?;
                Protocol::V1(v1)
            }
            other => {
                error!(version = other, "Server selected an unknown protocol, closing");
                let _ = self.events.send(ConnectionEvent::ProtocolRejected {
                    version: other.to_string(),
                });
                self.disconnect();
                return Err(Error::unknown_protocol(other));
            }
        };

        debug!(version = protocol.version(), "Protocol set");
        self.protocol = Some(protocol);
        Ok(())
    }

    fn on_data(&mut self, text: &str) {
        let message = match decode_frame(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        let request_id = message.request_id;
        if let Some(request_id) = request_id {
            self.wire.tracker().clear_timeout(request_id);
        }
        trace!(kind = %message.kind, ?request_id, "Message received");

        let outcome = self.dispatch(&message);

        let Some(request_id) = request_id else {
            if let Err(e) = outcome {
                warn!(kind = %message.kind, error = %e, "Failed to handle message");
            }
            return;
        };

        let settled = match outcome {
            Ok(value) => self
                .wire
                .tracker()
                .resolve(request_id, value.unwrap_or(Value::Null)),
            Err(e) if self.wire.tracker().is_pending(request_id) => {
                self.wire.tracker().error(request_id, e)
            }
            Err(e) => {
                warn!(kind = %message.kind, %request_id, error = %e, "Failed to handle message");
                None
            }
        };

        if let Some(settled) = settled {
            self.complete(settled);
        }
    }

    fn dispatch(&mut self, message: &Message) -> Result<Option<Value>> {
        let mut effects = Vec::new();

        let result = match self.protocol.as_mut() {
            None => Err(Error::protocol("message received without a protocol")),
            Some(Protocol::Handshake(handshake)) => handshake.on_data(message, &mut effects),
            Some(Protocol::V1(v1)) => {
                let mut ctx = Context {
                    wire: &mut self.wire,
                    store: &mut self.store,
                    effects: &mut effects,
                };
                v1.on_data(message, &mut ctx)
            }
        };

        for effect in effects {
            match effect {
                Effect::SwitchProtocol(version) => self.set_protocol(&version)?,
                Effect::Ready => self.set_state(ConnectionState::Ready),
            }
        }

        result
    }

    fn on_request_expired(&mut self, request_id: RequestId) {
        if let Some(settled) = self.wire.tracker().expire(request_id) {
            warn!(%request_id, "Request timed out");
            self.complete(settled);
        }
    }

    /// Delivers a settled request to its completion.
    fn complete(&mut self, settled: Settled<Completion>) {
        let Settled { callback, outcome } = settled;
        match callback {
            Completion::Reply(reply) => {
                let _ = reply.send(outcome);
            }
            Completion::SessionReuse => self.on_session_reuse(outcome),
            Completion::Watch(client_id) => self.store.on_watch_result(&client_id, outcome),
            Completion::Unwatch(client_id) => self.store.on_unwatch_result(&client_id, outcome),
        }
    }

    fn on_session_reuse(&mut self, outcome: Result<Value>) {
        if !matches!(self.protocol, Some(Protocol::V1(_))) {
            debug!("Session reuse settled after the protocol changed");
            return;
        }

        match outcome {
            Ok(_) => {
                info!("Session resumed");
                self.set_state(ConnectionState::Ready);
            }
            Err(e) => {
                warn!(error = %e, "Session reuse failed, requesting a new session");
                if let Some(Protocol::V1(v1)) = self.protocol.as_mut()
                    && let Err(e) = v1.request_session_new(&mut self.wire)
                {
                    warn!(error = %e, "Failed to request a new session");
                }
            }
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn on_call(&mut self, call: Call) {
        if self.config.offline == OfflinePolicy::Queue && self.state != ConnectionState::Ready {
            trace!(parked = self.parked.len() + 1, "Call parked until ready");
            self.parked.push(call);
            return;
        }

        match call {
            Call::Exec {
                name,
                params,
                reply,
            } => match versioned(&mut self.protocol, "exec") {
                Ok(v1) => {
                    if let Err(e) =
                        v1.exec(&mut self.wire, &name, &params, Completion::Reply(reply))
                    {
                        warn!(name, error = %e, "Failed to send exec");
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Call::Watch {
                name,
                params,
                reply,
            } => {
                let result = versioned(&mut self.protocol, "watch")
                    .and_then(|v1| v1.watch(&mut self.store, &mut self.wire, &name, params));
                let _ = reply.send(result);
            }

            Call::Unwatch { server_id, reply } => match versioned(&mut self.protocol, "unwatch") {
                Ok(v1) => {
                    if let Err(e) =
                        v1.unwatch(&mut self.wire, &server_id, Completion::Reply(reply))
                    {
                        warn!(server = %server_id, error = %e, "Failed to send unwatch");
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Call::UnwatchAll { callback, reply } => {
                let result = versioned(&mut self.protocol, "unwatch_all")
                    .map(|v1| v1.unwatch_all(&mut self.store, &callback));
                let _ = reply.send(result);
            }
        }
    }

    fn replay_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }

        let parked = std::mem::take(&mut self.parked);
        debug!(count = parked.len(), "Replaying parked calls");
        for call in parked {
            self.on_call(call);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Registers `callback`, links the query and invokes the callback once.
    fn add_subscriber(
        &mut self,
        client_id: &ClientId,
        callback: QueryCallback,
    ) -> Option<QueryView> {
        let query = self.store.get_mut(client_id)?;
        query.add_subscriber(Arc::clone(&callback));
        let view = query.view();

        self.link_query(client_id);
        notify(&callback, &view);
        Some(view)
    }

    /// Subscribes one query on the server if the session is ready.
    fn link_query(&mut self, client_id: &ClientId) {
        if self.state != ConnectionState::Ready {
            return;
        }
        let Some(Protocol::V1(v1)) = self.protocol.as_mut() else {
            return;
        };
        let Some(query) = self.store.get_mut(client_id) else {
            return;
        };
        if let Err(e) = v1.link(query, &mut self.wire) {
            warn!(query = %client_id, error = %e, "Failed to link query");
        }
    }

    /// Subscribes every unlinked query on the server.
    fn link_all(&mut self) {
        for client_id in self.store.client_ids() {
            self.link_query(&client_id);
        }
    }

    /// Evicts queries without subscribers and drops idle snapshots.
    fn sweep(&mut self) {
        let now = Instant::now();
        self.store.release_idle_data(now);

        for mut query in self.store.take_unused(self.config.eviction_grace, now) {
            if let Some(server_id) = query.server_id()
                && let Some(Protocol::V1(v1)) = self.protocol.as_mut()
            {
                let completion = Completion::Unwatch(query.client_id().clone());
                if let Err(e) = v1.unwatch(&mut self.wire, server_id, completion) {
                    warn!(query = %query.client_id(), error = %e, "Failed to send unwatch");
                }
            }
            query.retire();
            debug!(query = %query.client_id(), "Query evicted");
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Next event of the current transport; pending forever without one.
async fn next_transport_event(link: &mut Option<Link>) -> TransportEvent {
    match link {
        Some(link) => match link.events.recv().await {
            Some(event) => event,
            None => TransportEvent::Close("transport dropped".to_string()),
        },
        None => pending().await,
    }
}

/// Completes when the reconnect timer fires; pending forever without one.
async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
