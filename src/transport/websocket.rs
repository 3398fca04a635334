//! WebSocket client transport.
//!
//! Each [`WebSocketConnector::open`] spawns a socket task that:
//!
//! - Connects to the endpoint (`connect_async`)
//! - Forwards incoming text frames as [`TransportEvent::Data`]
//! - Writes outgoing frames queued through [`Transport::send`]
//! - Reports a single [`TransportEvent::Close`] when the link ends

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::{Connector, Transport, TransportEvent, TransportEvents};

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the socket task.
enum SocketCommand {
    /// Write a text frame.
    Send(String),
    /// Close the socket.
    Close,
}

// ============================================================================
// WebSocketConnector
// ============================================================================

/// Opens WebSocket transports to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    /// Creates a connector for `url` (`ws://` or `wss://`).
    #[inline]
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Returns the endpoint.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, events: TransportEvents) -> Arc<dyn Transport> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_socket(
            self.url.clone(),
            command_rx,
            events,
            Arc::clone(&open),
        ));

        Arc::new(WebSocketTransport { command_tx, open })
    }
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Handle to a socket task.
struct WebSocketTransport {
    command_tx: mpsc::UnboundedSender<SocketCommand>,
    open: Arc<AtomicBool>,
}

impl Transport for WebSocketTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, frame: String) -> Result<()> {
        self.command_tx
            .send(SocketCommand::Send(frame))
            .map_err(|_| Error::connection("socket task has exited"))
    }

    fn close(&self) {
        let _ = self.command_tx.send(SocketCommand::Close);
    }
}

// ============================================================================
// Socket Task
// ============================================================================

/// Drives one WebSocket from connect to close.
async fn run_socket(
    url: Url,
    mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    events: TransportEvents,
    open: Arc<AtomicBool>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let error = Error::from(e);
            warn!(url = %url, error = %error, "WebSocket connect failed");
            let _ = events.send(TransportEvent::Close(error.to_string()));
            return;
        }
    };

    debug!(url = %url, "WebSocket connected");
    open.store(true, Ordering::Release);
    let _ = events.send(TransportEvent::Open);

    let (mut ws_write, mut ws_read) = stream.split();

    let reason = loop {
        tokio::select! {
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        trace!(len = text.len(), "Frame received");
                        let _ = events.send(TransportEvent::Data(text.to_string()));
                    }

                    Some(Ok(Message::Close(frame))) => {
                        debug!("WebSocket closed by remote");
                        break frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }

                    Some(Err(e)) => {
                        let error = Error::from(e);
                        warn!(error = %error, "WebSocket read failed");
                        break error.to_string();
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break "stream ended".to_string();
                    }

                    // Ignore Binary, Ping, Pong
                    _ => {}
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(SocketCommand::Send(frame)) => {
                        if let Err(e) = ws_write.send(Message::Text(frame.into())).await {
                            let error = Error::from(e);
                            warn!(error = %error, "Failed to send frame");
                            break error.to_string();
                        }
                    }

                    Some(SocketCommand::Close) => {
                        debug!("Close requested");
                        let _ = ws_write.close().await;
                        break "closed by client".to_string();
                    }

                    None => {
                        let _ = ws_write.close().await;
                        break "transport dropped".to_string();
                    }
                }
            }
        }
    };

    open.store(false, Ordering::Release);
    let _ = events.send(TransportEvent::Close(reason));
}

// ============================================================================
// Tests
// ============================================================================
