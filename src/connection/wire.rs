//! Outbound side of a connection.
//!
//! [`Wire`] is the only place request ids are minted. It registers the
//! completion with the tracker before queueing the frame, so a response can
//! never arrive for an id the tracker has not seen.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::codec::encode_frame;
use crate::error::Result;
use crate::identifiers::{ClientId, RequestId};
use crate::protocol::Message;
use crate::transport::Transport;

use super::tracker::RequestTracker;

// ============================================================================
// Completion
// ============================================================================

/// What to do once a request settles.
#[derive(Debug)]
pub(crate) enum Completion {
    /// Hand the outcome to a waiting caller.
    Reply(oneshot::Sender<Result<Value>>),
    /// Session resume attempt.
    SessionReuse,
    /// Subscription request for a query.
    Watch(ClientId),
    /// Subscription drop for an evicted query.
    Unwatch(ClientId),
}

// ============================================================================
// Wire
// ============================================================================

/// Request id counter, pending request tracker and outbound queue.
pub(crate) struct Wire {
    next_request_id: u64,
    tracker: RequestTracker<Completion>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    request_timeout: Duration,
}

impl Wire {
    pub(crate) fn new(
        expired_tx: mpsc::UnboundedSender<RequestId>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            next_request_id: 1,
            tracker: RequestTracker::new(expired_tx),
            outbound: None,
            request_timeout,
        }
    }

    /// Routes outgoing messages into `outbound`.
    pub(crate) fn attach(&mut self, outbound: mpsc::UnboundedSender<Message>) {
        self.outbound = Some(outbound);
    }

    /// Drops the outbound queue; unsent messages are discarded.
    pub(crate) fn detach(&mut self) {
        self.outbound = None;
    }

    /// Sends a message, registering `completion` if a response is expected.
    ///
    /// A request id is minted for every message. Without a completion the
    /// response, if any, is handled by the protocol alone.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`](crate::Error::Json) if the payload cannot be serialized
    /// - [`Error::DuplicateRequest`](crate::Error::DuplicateRequest) if the id is in use
    pub(crate) fn send_message<P: Serialize + ?Sized>(
        &mut self,
        kind: &str,
        payload: &P,
        completion: Option<Completion>,
    ) -> Result<RequestId> {
        let payload = serde_json::to_value(payload)?;
        let request_id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;

        if let Some(completion) = completion {
            self.tracker
                .create(request_id, completion, self.request_timeout)?;
        }

        let message = Message::request(request_id, kind, payload);
        match &self.outbound {
            Some(outbound) if outbound.send(message).is_ok() => {
                trace!(%request_id, kind, "Message queued");
            }
            _ => debug!(%request_id, kind, "No outbound queue, message dropped"),
        }

        Ok(request_id)
    }

    /// Pending request tracker.
    #[inline]
    pub(crate) fn tracker(&mut self) -> &mut RequestTracker<Completion> {
        &mut self.tracker
    }

    /// Number of requests awaiting a response.
    #[inline]
    pub(crate) fn pending_requests(&self) -> usize {
        self.tracker.len()
    }
}

// ============================================================================
// Outbound Worker
// ============================================================================

/// Encodes queued messages and writes them to `transport` in order.
///
/// Messages dequeued while the transport is not open are dropped.
pub(crate) async fn run_outbound(
    mut outbound: mpsc::UnboundedReceiver<Message>,
    transport: Arc<dyn Transport>,
) {
    while let Some(message) = outbound.recv().await {
        if !transport.is_open() {
            debug!(kind = %message.kind, "Transport not open, dropping message");
            continue;
        }

        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %message.kind, error = %e, "Failed to encode message");
                continue;
            }
        };

        if let Err(e) = transport.send(frame) {
            warn!(kind = %message.kind, error = %e, "Failed to send message");
        }
    }

    trace!("Outbound worker terminated");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::transport::Connector;
    use crate::transport::testing::{MockConnector, settle};

    fn wire() -> Wire {
        let (expired_tx, _expired_rx) = mpsc::unbounded_channel();
        Wire::new(expired_tx, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_request_ids_are_sequential_from_one() {
        let mut wire = wire();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        wire.attach(outbound_tx);

        let first = wire.send_message("exec", &json!({}), None).expect("send");
        let second = wire.send_message("exec", &json!({}), None).expect("send");
        assert_eq!(first.as_u64(), 1);
        assert_eq!(second.as_u64(), 2);

        let queued = outbound_rx.try_recv().expect("queued");
        assert_eq!(queued.request_id, Some(first));
    }

    #[tokio::test]
    async fn test_completion_registered_even_without_outbound() {
        let mut wire = wire();
        let (reply_tx, _reply_rx) = oneshot::channel();

        let id = wire
            .send_message("exec", &json!({}), Some(Completion::Reply(reply_tx)))
            .expect("send");
        assert!(wire.tracker().is_pending(id));
        assert_eq!(wire.pending_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_drops_while_closed() {
        let connector = MockConnector::new();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = connector.open(events_tx);
        let link = connector.latest();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_outbound(outbound_rx, transport));

        outbound_tx
            .send(Message::request(RequestId::new(1), "connect", json!({})))
            .expect("queue");
        settle().await;
        assert!(link.sent().is_empty());

        link.accept();
        outbound_tx
            .send(Message::request(RequestId::new(2), "exec", json!({"name": "x"})))
            .expect("queue");
        settle().await;
        assert_eq!(
            link.sent(),
            vec![(2, "exec".to_string(), json!({"name": "x"}))]
        );
    }
}
