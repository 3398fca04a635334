//! Version negotiation.
//!
//! On open the client proposes the versions it speaks; the server answers
//! with `switchProtocol` naming the one to adopt.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::wire::Wire;
use crate::error::Result;

use super::messages::{ConnectRequest, ErrorResponse, SwitchProtocolResponse};
use super::{Effect, Message, v1};

// ============================================================================
// Constants
// ============================================================================

/// Version token of the handshake phase.
pub const VERSION: &str = "handshake";

/// Client proposal.
pub const CONNECT: &str = "connect";

/// Server choice of version.
pub const SWITCH_PROTOCOL: &str = "switchProtocol";

/// Error response.
pub const ERROR: &str = "error";

/// Versions offered to the server, most preferred first.
pub const SUPPORTED_VERSIONS: &[&str] = &[v1::VERSION];

// ============================================================================
// HandshakeProtocol
// ============================================================================

/// Pre-version phase of a connection.
#[derive(Debug, Default)]
pub(crate) struct HandshakeProtocol;

impl HandshakeProtocol {
    pub(crate) fn new() -> Self {
        Self
    }

    /// Proposes the supported versions.
    pub(crate) fn on_connect(&mut self, wire: &mut Wire) -> Result<()> {
        let request = ConnectRequest {
            versions: SUPPORTED_VERSIONS,
        };
        wire.send_message(CONNECT, &request, None)?;
        Ok(())
    }

    /// Handles one inbound message.
    pub(crate) fn on_data(
        &mut self,
        message: &Message,
        effects: &mut Vec<Effect>,
    ) -> Result<Option<Value>> {
        match message.kind.as_str() {
            SWITCH_PROTOCOL => {
                let response: SwitchProtocolResponse = message.parse()?;
                debug!(version = %response.version, "Server selected protocol");
                effects.push(Effect::SwitchProtocol(response.version));
            }

            ERROR => {
                // The server closes the link after a failed handshake.
                let response: ErrorResponse = message.parse()?;
                warn!(error = %response.error, "Handshake rejected");
            }

            other => {
                debug!(kind = other, "Ignoring message during handshake");
            }
        }

        Ok(None)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::sync::mpsc;

    fn wire() -> (Wire, mpsc::UnboundedReceiver<Message>) {
        let (expired_tx, _expired_rx) = mpsc::unbounded_channel();
        let mut wire = Wire::new(expired_tx, std::time::Duration::from_secs(1));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        wire.attach(outbound_tx);
        (wire, outbound_rx)
    }

    #[tokio::test]
    async fn test_on_connect_proposes_versions() {
        let (mut wire, mut outbound) = wire();
        HandshakeProtocol::new().on_connect(&mut wire).expect("connect");

        let message = outbound.try_recv().expect("frame");
        assert_eq!(message.kind, CONNECT);
        assert_eq!(message.payload, json!({"versions": ["v1"]}));
        assert_eq!(wire.pending_requests(), 0);
    }

    #[test]
    fn test_switch_protocol_effect() {
        let mut effects = Vec::new();
        let message = Message::event(SWITCH_PROTOCOL, json!({"version": "v1"}));

        let result = HandshakeProtocol::new()
            .on_data(&message, &mut effects)
            .expect("handled");
        assert!(result.is_none());
        assert_eq!(effects, vec![Effect::SwitchProtocol("v1".to_string())]);
    }

    #[test]
    fn test_error_and_unknown_are_absorbed() {
        let mut effects = Vec::new();
        let mut handshake = HandshakeProtocol::new();

        let error = Message::event(ERROR, json!({"error": "no common version"}));
        assert!(handshake.on_data(&error, &mut effects).is_ok());

        let unknown = Message::event("watchData", json!({}));
        assert!(handshake.on_data(&unknown, &mut effects).is_ok());
        assert!(effects.is_empty());
    }
}
