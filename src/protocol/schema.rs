//! Structured message schema boundary
//!
//! The real protocol serializes control messages with protobuf; the core
//! only needs `encode`/`decode` keyed by message type, so any schema can be
//! plugged in. [`JsonSchema`] is a self-describing implementation used for
//! loopback setups and tests.

use bytes::Bytes;

use super::MessageType;
use crate::error::Error;

/// Serializes and parses structured control messages
pub trait SchemaCodec: Send + Sync {
    /// Serialize a message body for the wire
    fn encode(&self, message_type: MessageType, body: &serde_json::Value) -> Result<Bytes, Error>;

    /// Parse a payload received for the given type
    fn decode(&self, message_type: MessageType, payload: &[u8]) -> Result<serde_json::Value, Error>;
}

/// JSON encoding of control messages
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchema;

impl SchemaCodec for JsonSchema {
    fn encode(&self, message_type: MessageType, body: &serde_json::Value) -> Result<Bytes, Error> {
        serde_json::to_vec(body)
            .map(Bytes::from)
            .map_err(|e| Error::Schema {
                message_type,
                reason: e.to_string(),
            })
    }

    fn decode(&self, message_type: MessageType, payload: &[u8]) -> Result<serde_json::Value, Error> {
        // Messages with every field unset serialize to nothing
        if payload.is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_slice(payload).map_err(|e| Error::Schema {
            message_type,
            reason: e.to_string(),
        })
    }
}
