//! Versioned protocol, revision 1.
//!
//! Adds sessions, query subscriptions with chunked snapshot delivery, and
//! server actions.
//!
//! # Messages
//!
//! | Type | Direction | Payload |
//! |------|-----------|---------|
//! | `sessionNew` | ⇄ | `{}` / `{session, secret}` |
//! | `sessionReuse` | ⇄ | `{session, timestamp, signature}` / any |
//! | `watch` | ⇄ | `{id, name, params}` / `{id}` |
//! | `unwatch` | ⇄ | `{id}` / `{handle}` |
//! | `watchData` | ← | `{id, version, part, total, stream}` |
//! | `exec` | ⇄ | `{name, params}` / any |
//! | `error` | ← | `{error}` |

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, info};

use crate::connection::wire::{Completion, Wire};
use crate::error::{Error, Result};
use crate::identifiers::{RequestId, ServerId};
use crate::query::{Chunk, Query, QueryCallback, QueryStore, QueryView};
use crate::session::Session;

use super::messages::{
    ErrorResponse, ExecRequest, SessionNewRequest, SessionNewResponse, SessionReuseRequest,
    UnwatchRequest, UnwatchResponse, WatchDataEvent, WatchRequest, WatchResponse,
};
use super::{Effect, Message};

// ============================================================================
// Constants
// ============================================================================

/// Version token.
pub const VERSION: &str = "v1";

/// Request a fresh session.
pub const SESSION_NEW: &str = "sessionNew";

/// Resume a persisted session.
pub const SESSION_REUSE: &str = "sessionReuse";

/// Subscribe to a publication.
pub const WATCH: &str = "watch";

/// Drop a subscription.
pub const UNWATCH: &str = "unwatch";

/// Pushed snapshot chunk.
pub const WATCH_DATA: &str = "watchData";

/// Execute a server action.
pub const EXEC: &str = "exec";

/// Error response.
pub const ERROR: &str = "error";

// ============================================================================
// Context
// ============================================================================

/// Connection state a message handler may touch.
pub(crate) struct Context<'a> {
    pub(crate) wire: &'a mut Wire,
    pub(crate) store: &'a mut QueryStore,
    pub(crate) effects: &'a mut Vec<Effect>,
}

// ============================================================================
// V1Protocol
// ============================================================================

/// Protocol state once `v1` was negotiated.
pub(crate) struct V1Protocol {
    session: Session,
}

impl V1Protocol {
    pub(crate) fn new(session: Session) -> Self {
        Self { session }
    }

    #[inline]
    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Resumes the persisted session if there is one, else asks for a new one.
    pub(crate) fn request_session(&mut self, wire: &mut Wire) -> Result<()> {
        let timestamp = unix_millis();
        if let (Some(session), Some(signature)) =
            (self.session.id(), self.session.signature(timestamp))
        {
            debug!(session, "Resuming session");
            let request = SessionReuseRequest {
                session,
                timestamp,
                signature: &signature,
            };
            wire.send_message(SESSION_REUSE, &request, Some(Completion::SessionReuse))?;
            return Ok(());
        }

        self.request_session_new(wire)
    }

    /// Asks the server for a brand-new session.
    ///
    /// The response is handled in [`on_data`](Self::on_data).
    pub(crate) fn request_session_new(&mut self, wire: &mut Wire) -> Result<()> {
        debug!("Requesting new session");
        wire.send_message(SESSION_NEW, &SessionNewRequest::default(), None)?;
        Ok(())
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handles one inbound message.
    ///
    /// The returned value resolves the pending request correlated with the
    /// message, if any; an error rejects it.
    pub(crate) fn on_data(&mut self, message: &Message, ctx: &mut Context<'_>) -> Result<Option<Value>> {
        match message.kind.as_str() {
            SESSION_NEW => {
                let response: SessionNewResponse = message.parse()?;
                info!(session = %response.session, "Session established");
                self.session.set(response.session, response.secret);
                ctx.effects.push(Effect::Ready);
                Ok(None)
            }

            WATCH => {
                let response: WatchResponse = message.parse()?;
                Ok(Some(serde_json::to_value(response.id)?))
            }

            UNWATCH => {
                let response: UnwatchResponse = message.parse()?;
                ctx.store.mark_inactive(&response.handle);
                Ok(Some(message.payload.clone()))
            }

            WATCH_DATA => {
                let event: WatchDataEvent = message.parse()?;
                let chunk = Chunk {
                    version: event.version,
                    sequence: event.part,
                    total: event.total,
                    data: event.stream,
                };
                ctx.store.receive_chunk(&event.id, chunk)?;
                Ok(None)
            }

            ERROR => {
                let response: ErrorResponse = message.parse()?;
                Err(Error::server(response.error))
            }

            // sessionReuse, exec and anything newer resolve with the payload
            _ => Ok(Some(message.payload.clone())),
        }
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Returns the query for `(name, params)`, subscribing it on the server.
    pub(crate) fn watch(
        &mut self,
        store: &mut QueryStore,
        wire: &mut Wire,
        name: &str,
        params: Value,
    ) -> Result<QueryView> {
        let query = store.get_or_create(name, params);
        self.link(query, wire)?;
        Ok(query.view())
    }

    /// Sends a `watch` for `query` unless it is already linked or pending.
    pub(crate) fn link(&mut self, query: &mut Query, wire: &mut Wire) -> Result<()> {
        if !query.is_unlinked() {
            return Ok(());
        }

        let request = WatchRequest {
            id: query.client_id(),
            name: query.name(),
            params: query.params(),
        };
        let completion = Completion::Watch(query.client_id().clone());
        let request_id = wire.send_message(WATCH, &request, Some(completion))?;
        debug!(query = %query.client_id(), %request_id, "Watch sent");
        query.begin_link();
        Ok(())
    }

    /// Drops the server subscription under `server_id`.
    pub(crate) fn unwatch(
        &mut self,
        wire: &mut Wire,
        server_id: &ServerId,
        completion: Completion,
    ) -> Result<RequestId> {
        wire.send_message(UNWATCH, &UnwatchRequest { id: server_id }, Some(completion))
    }

    /// Removes `callback` from every query.
    pub(crate) fn unwatch_all(&mut self, store: &mut QueryStore, callback: &QueryCallback) {
        store.unsubscribe_all(callback);
    }

    /// Executes the server action `name`.
    pub(crate) fn exec(
        &mut self,
        wire: &mut Wire,
        name: &str,
        params: &Value,
        completion: Completion,
    ) -> Result<RequestId> {
        wire.send_message(EXEC, &ExecRequest { name, params }, Some(completion))
    }
}

/// Milliseconds since the Unix epoch.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::connection::Command;
    use crate::query::QueryState;
    use crate::session::{SESSION_ID_KEY, SESSION_SECRET_KEY};
    use crate::storage::{MemoryStorage, Storage};

    struct Harness {
        wire: Wire,
        outbound: mpsc::UnboundedReceiver<Message>,
        store: QueryStore,
        storage: Arc<dyn Storage>,
        _commands: mpsc::UnboundedSender<Command>,
    }

    impl Harness {
        fn new() -> Self {
            let (expired_tx, _expired_rx) = mpsc::unbounded_channel();
            let mut wire = Wire::new(expired_tx, Duration::from_secs(1));
            let (outbound_tx, outbound) = mpsc::unbounded_channel();
            wire.attach(outbound_tx);

            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
            let (commands, _commands_rx) = mpsc::unbounded_channel();
            let store = QueryStore::new(
                Arc::clone(&storage),
                commands.downgrade(),
                Duration::from_secs(1),
            );

            Self {
                wire,
                outbound,
                store,
                storage,
                _commands: commands,
            }
        }

        fn protocol(&self) -> V1Protocol {
            V1Protocol::new(Session::load(Arc::clone(&self.storage)))
        }

        fn deliver(&mut self, v1: &mut V1Protocol, message: Message) -> (Result<Option<Value>>, Vec<Effect>) {
            let mut effects = Vec::new();
            let mut ctx = Context {
                wire: &mut self.wire,
                store: &mut self.store,
                effects: &mut effects,
            };
            let result = v1.on_data(&message, &mut ctx);
            (result, effects)
        }

        fn sent(&mut self) -> Vec<Message> {
            let mut sent = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                sent.push(message);
            }
            sent
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_without_credentials() {
        let mut h = Harness::new();
        let mut v1 = h.protocol();
        v1.request_session(&mut h.wire).expect("request");

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SESSION_NEW);
        assert_eq!(sent[0].payload, json!({}));
        assert_eq!(h.wire.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_with_persisted_credentials() {
        let mut h = Harness::new();
        h.storage.set(SESSION_ID_KEY, json!("s1"));
        h.storage.set(SESSION_SECRET_KEY, json!("k1"));

        let mut v1 = h.protocol();
        v1.request_session(&mut h.wire).expect("request");

        let sent = h.sent();
        assert_eq!(sent[0].kind, SESSION_REUSE);
        let payload = &sent[0].payload;
        assert_eq!(payload["session"], json!("s1"));
        let timestamp = payload["timestamp"].as_u64().expect("timestamp");
        assert_eq!(
            payload["signature"].as_str(),
            v1.session().signature(timestamp).as_deref()
        );
        assert_eq!(h.wire.pending_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_new_response_stores_credentials() {
        let mut h = Harness::new();
        let mut v1 = h.protocol();

        let message = Message::request(
            RequestId::new(1),
            SESSION_NEW,
            json!({"session": "abc", "secret": "xyz"}),
        );
        let (result, effects) = h.deliver(&mut v1, message);
        assert!(result.expect("handled").is_none());
        assert_eq!(effects, vec![Effect::Ready]);
        assert_eq!(h.storage.get(SESSION_ID_KEY), Some(json!("abc")));
        assert!(v1.session().can_resume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_sent_once_per_query() {
        let mut h = Harness::new();
        let mut v1 = h.protocol();

        let first = v1
            .watch(&mut h.store, &mut h.wire, "items", json!({"listId": 1}))
            .expect("watch");
        let second = v1
            .watch(&mut h.store, &mut h.wire, "items", json!({"listId": 1}))
            .expect("watch");
        assert_eq!(first, second);
        assert_eq!(first.state(), QueryState::Requested);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, WATCH);
        assert_eq!(
            sent[0].payload,
            json!({"id": first.id().as_str(), "name": "items", "params": {"listId": 1}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_response_returns_handle() {
        let mut h = Harness::new();
        let mut v1 = h.protocol();

        let message = Message::request(RequestId::new(2), WATCH, json!({"id": 42}));
        let (result, _) = h.deliver(&mut v1, message);
        assert_eq!(result.expect("handled"), Some(json!(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_data_routed_by_handle() {
        let mut h = Harness::new();
        let mut v1 = h.protocol();

        let view = v1
            .watch(&mut h.store, &mut h.wire, "items", json!({}))
            .expect("watch");
        h.store.on_watch_result(view.id(), Ok(json!(42)));

        let chunk = json!({"id": 42, "version": 1, "part": 1, "total": 1, "stream": "[\"a\"]"});
        let (result, _) = h.deliver(&mut v1, Message::event(WATCH_DATA, chunk));
        assert!(result.expect("handled").is_none());
        assert_eq!(view.state(), QueryState::Ready);
        assert_eq!(view.data(), Some(json!(["a"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_response_unlinks() {
        let mut h = Harness::new();
        let mut v1 = h.protocol();

        let view = v1
            .watch(&mut h.store, &mut h.wire, "items", json!({}))
            .expect("watch");
        h.store.on_watch_result(view.id(), Ok(json!("h-1")));

        let message = Message::request(RequestId::new(9), UNWATCH, json!({"handle": "h-1"}));
        let (result, _) = h.deliver(&mut v1, message);
        assert!(result.is_ok());
        assert_eq!(view.state(), QueryState::Inactive);
        assert!(h.store.get(view.id()).expect("query").is_unlinked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_and_unknown_messages() {
        let mut h = Harness::new();
        let mut v1 = h.protocol();

        let (result, _) = h.deliver(
            &mut v1,
            Message::request(RequestId::new(3), ERROR, json!({"error": "denied"})),
        );
        let err = result.err().expect("error");
        assert!(matches!(err, Error::Server { ref message, .. } if message == "denied"));

        let (result, _) = h.deliver(
            &mut v1,
            Message::request(RequestId::new(4), "ping", json!({"t": 1})),
        );
        assert_eq!(result.expect("handled"), Some(json!({"t": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_registers_completion() {
        let mut h = Harness::new();
        let mut v1 = h.protocol();
        let (reply_tx, _reply_rx) = tokio::sync::oneshot::channel();

        let request_id = v1
            .exec(&mut h.wire, "cart.total", &json!({"cart": 1}), Completion::Reply(reply_tx))
            .expect("exec");
        assert!(h.wire.tracker().is_pending(request_id));

        let sent = h.sent();
        assert_eq!(sent[0].kind, EXEC);
        assert_eq!(sent[0].payload, json!({"name": "cart.total", "params": {"cart": 1}}));
    }
}
