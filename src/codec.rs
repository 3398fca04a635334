//! Wire codec for frames and payload values.
//!
//! A frame is the JSON triple `[requestId, type, payload]`. Payloads are plain
//! JSON extended with two primitive kinds:
//!
//! | Kind | Encoding |
//! |------|----------|
//! | Date | `{"$date": <ms since epoch>}` |
//! | Binary | `{"$binary": "<base64>"}` |

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::Message;

// ============================================================================
// Constants
// ============================================================================

const DATE_KEY: &str = "$date";
const BINARY_KEY: &str = "$binary";

// ============================================================================
// Frames
// ============================================================================

/// Serializes a message as a wire frame.
///
/// # Errors
///
/// Returns [`Error::Json`] if the payload cannot be serialized.
pub fn encode_frame(message: &Message) -> Result<String> {
    let request_id = message.request_id.map_or(0, RequestId::as_u64);
    let frame = (request_id, message.kind.as_str(), &message.payload);
    Ok(serde_json::to_string(&frame)?)
}

/// Parses a wire frame into a message.
///
/// # Errors
///
/// Returns [`Error::Json`] if the text is not a `[id, type, payload]` triple.
pub fn decode_frame(text: &str) -> Result<Message> {
    let (request_id, kind, payload): (u64, String, Value) = serde_json::from_str(text)?;
    Ok(Message {
        request_id: RequestId::from_wire(request_id),
        kind,
        payload,
    })
}

/// Parses a reassembled snapshot.
///
/// # Errors
///
/// Returns [`Error::Json`] if the text is not valid JSON.
pub fn decode_value(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(Error::from)
}

// ============================================================================
// Extended Values
// ============================================================================

/// Encodes a timestamp (milliseconds since the Unix epoch).
#[inline]
#[must_use]
pub fn date(ms: i64) -> Value {
    json!({ DATE_KEY: ms })
}

/// Encodes a binary blob.
#[inline]
#[must_use]
pub fn binary(bytes: &[u8]) -> Value {
    json!({ BINARY_KEY: BASE64.encode(bytes) })
}

/// Decodes a timestamp value, if `value` is one.
#[must_use]
pub fn as_date(value: &Value) -> Option<i64> {
    single_key(value, DATE_KEY)?.as_i64()
}

/// Decodes a binary value, if `value` is one.
#[must_use]
pub fn as_binary(value: &Value) -> Option<Vec<u8>> {
    let encoded = single_key(value, BINARY_KEY)?.as_str()?;
    BASE64.decode(encoded).ok()
}

fn single_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(key)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame() {
        let message = Message::request(RequestId::new(3), "exec", json!({"name": "ping"}));
        let text = encode_frame(&message).expect("encode");
        assert_eq!(text, r#"[3,"exec",{"name":"ping"}]"#);
    }

    #[test]
    fn test_encode_frame_without_request_id() {
        let message = Message::event("connect", json!({"versions": ["v1"]}));
        let text = encode_frame(&message).expect("encode");
        assert!(text.starts_with("[0,"));
    }

    #[test]
    fn test_decode_frame() {
        let message = decode_frame(r#"[12,"watch",{"id":42}]"#).expect("decode");
        assert_eq!(message.request_id, Some(RequestId::new(12)));
        assert_eq!(message.kind, "watch");
        assert_eq!(message.payload, json!({"id": 42}));

        let push = decode_frame(r#"[0,"watchData",{}]"#).expect("decode");
        assert_eq!(push.request_id, None);
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"type":"exec"}"#).is_err());
        assert!(decode_frame(r#"["x","exec",{}]"#).is_err());
    }

    #[test]
    fn test_extended_values() {
        let stamp = date(1_700_000_000_000);
        assert_eq!(as_date(&stamp), Some(1_700_000_000_000));
        assert_eq!(as_binary(&stamp), None);

        let blob = binary(&[0, 1, 2, 255]);
        assert_eq!(blob, json!({"$binary": "AAEC/w=="}));
        assert_eq!(as_binary(&blob), Some(vec![0, 1, 2, 255]));

        assert_eq!(as_date(&json!({"$date": 1, "extra": true})), None);
    }
}
