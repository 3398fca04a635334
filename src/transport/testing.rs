//! In-memory transport for driving connection scenarios in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};

use super::{Connector, Transport, TransportEvent, TransportEvents};

/// Records every transport it opens.
#[derive(Default)]
pub(crate) struct MockConnector {
    links: Mutex<Vec<MockLink>>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of transports opened so far.
    pub(crate) fn opened(&self) -> usize {
        self.links.lock().len()
    }

    /// The most recently opened transport.
    pub(crate) fn latest(&self) -> MockLink {
        self.links
            .lock()
            .last()
            .cloned()
            .expect("no transport opened yet")
    }
}

impl Connector for MockConnector {
    fn open(&self, events: TransportEvents) -> Arc<dyn Transport> {
        let link = MockLink {
            events,
            open: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        };
        self.links.lock().push(link.clone());
        Arc::new(link)
    }
}

/// Server side of one mock transport.
#[derive(Clone)]
pub(crate) struct MockLink {
    events: TransportEvents,
    open: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockLink {
    /// Completes the connect.
    pub(crate) fn accept(&self) {
        self.open.store(true, Ordering::Release);
        let _ = self.events.send(TransportEvent::Open);
    }

    /// Delivers a frame to the client.
    pub(crate) fn push(&self, request_id: u64, kind: &str, payload: Value) {
        let text = serde_json::to_string(&(request_id, kind, payload)).expect("frame");
        self.push_raw(text);
    }

    /// Delivers raw text to the client.
    pub(crate) fn push_raw(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Data(text.into()));
    }

    /// Simulates the server dropping the link.
    pub(crate) fn drop_link(&self, reason: &str) {
        self.open.store(false, Ordering::Release);
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(TransportEvent::Close(reason.to_string()));
        }
    }

    /// Frames the client sent, decoded as `(request_id, type, payload)`.
    pub(crate) fn sent(&self) -> Vec<(u64, String, Value)> {
        self.sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).expect("client frame"))
            .collect()
    }

    /// Frames of one type the client sent.
    pub(crate) fn sent_of(&self, kind: &str) -> Vec<(u64, Value)> {
        self.sent()
            .into_iter()
            .filter(|(_, k, _)| k == kind)
            .map(|(id, _, payload)| (id, payload))
            .collect()
    }

    /// Request id of the last frame of `kind`.
    pub(crate) fn last_request_id(&self, kind: &str) -> u64 {
        self.sent_of(kind)
            .last()
            .map(|(id, _)| *id)
            .unwrap_or_else(|| panic!("no {kind} frame sent"))
    }
}

impl Transport for MockLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, frame: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::connection("mock link closed"));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.drop_link("closed by client");
    }
}

/// Lets every spawned task run until idle (paused clock auto-advances).
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Routes crate logs to the test output; honours `RUST_LOG`.
pub(crate) fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rosa_client=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
