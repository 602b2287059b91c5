//! Wire protocol definitions
//!
//! Every record on the stream is `[u16 type][u32 length][payload]`, both
//! integers big-endian. Type 1 carries raw voice packets; every other type is
//! a structured control message handled by a [`schema::SchemaCodec`].

pub mod schema;
pub mod varint;
pub mod voice;

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::FRAME_PREFIX_LEN;
use crate::error::TransportError;

pub use schema::{JsonSchema, SchemaCodec};

/// Structured message types, keyed by their wire id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageType {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
    SuggestConfig = 25,
}

impl MessageType {
    /// All known types in id order
    pub const ALL: [MessageType; 26] = [
        MessageType::Version,
        MessageType::UdpTunnel,
        MessageType::Authenticate,
        MessageType::Ping,
        MessageType::Reject,
        MessageType::ServerSync,
        MessageType::ChannelRemove,
        MessageType::ChannelState,
        MessageType::UserRemove,
        MessageType::UserState,
        MessageType::BanList,
        MessageType::TextMessage,
        MessageType::PermissionDenied,
        MessageType::Acl,
        MessageType::QueryUsers,
        MessageType::CryptSetup,
        MessageType::ContextActionModify,
        MessageType::ContextAction,
        MessageType::UserList,
        MessageType::VoiceTarget,
        MessageType::PermissionQuery,
        MessageType::CodecVersion,
        MessageType::UserStats,
        MessageType::RequestBlob,
        MessageType::ServerConfig,
        MessageType::SuggestConfig,
    ];

    /// Convert from wire id
    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Wire id
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Protocol name, as used in the schema (`UserState`, `UDPTunnel`)
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Version => "Version",
            MessageType::UdpTunnel => "UDPTunnel",
            MessageType::Authenticate => "Authenticate",
            MessageType::Ping => "Ping",
            MessageType::Reject => "Reject",
            MessageType::ServerSync => "ServerSync",
            MessageType::ChannelRemove => "ChannelRemove",
            MessageType::ChannelState => "ChannelState",
            MessageType::UserRemove => "UserRemove",
            MessageType::UserState => "UserState",
            MessageType::BanList => "BanList",
            MessageType::TextMessage => "TextMessage",
            MessageType::PermissionDenied => "PermissionDenied",
            MessageType::Acl => "ACL",
            MessageType::QueryUsers => "QueryUsers",
            MessageType::CryptSetup => "CryptSetup",
            MessageType::ContextActionModify => "ContextActionModify",
            MessageType::ContextAction => "ContextAction",
            MessageType::UserList => "UserList",
            MessageType::VoiceTarget => "VoiceTarget",
            MessageType::PermissionQuery => "PermissionQuery",
            MessageType::CodecVersion => "CodecVersion",
            MessageType::UserStats => "UserStats",
            MessageType::RequestBlob => "RequestBlob",
            MessageType::ServerConfig => "ServerConfig",
            MessageType::SuggestConfig => "SuggestConfig",
        }
    }

    /// Look a type up by protocol name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }

    /// Lowercase, hyphenated event name (`UserState` -> `user-state`)
    pub fn event_name(self) -> String {
        match self {
            MessageType::UdpTunnel => "udp-tunnel".to_string(),
            MessageType::Acl => "acl".to_string(),
            other => hyphenate(other.name()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn hyphenate(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// The 6-byte record prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    pub type_id: u16,
    pub length: u32,
}

impl FramePrefix {
    pub fn new(type_id: u16, length: u32) -> Self {
        Self { type_id, length }
    }

    /// Parse from exactly [`FRAME_PREFIX_LEN`] bytes
    pub fn parse(bytes: &[u8; FRAME_PREFIX_LEN]) -> Self {
        Self {
            type_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            length: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.type_id);
        buf.put_u32(self.length);
    }
}

/// Build a complete record: prefix followed by payload
pub fn encode_frame(type_id: u16, payload: &[u8]) -> Result<Bytes, TransportError> {
    let length = u32::try_from(payload.len())
        .map_err(|_| TransportError::PayloadTooLarge(payload.len()))?;
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + payload.len());
    FramePrefix::new(type_id, length).write_to(&mut buf);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// A decoded structured message
///
/// The body is whatever the schema codec produced; the core only reads a
/// handful of well-known fields (`session`, `reason`, `opus`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub message_type: MessageType,
    pub body: serde_json::Value,
}

impl ControlMessage {
    pub fn new(message_type: MessageType, body: serde_json::Value) -> Self {
        Self { message_type, body }
    }

    /// Read an unsigned integer field
    pub fn u32_field(&self, key: &str) -> Option<u32> {
        self.body
            .get(key)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
    }

    /// Read a boolean field
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(|v| v.as_bool())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_table() {
        assert_eq!(MessageType::ALL.len(), 26);
        for (id, ty) in MessageType::ALL.iter().enumerate() {
            assert_eq!(ty.id() as usize, id);
            assert_eq!(MessageType::from_id(id as u16), Some(*ty));
            assert_eq!(MessageType::from_name(ty.name()), Some(*ty));
        }
        assert_eq!(MessageType::from_id(26), None);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(MessageType::UserState.event_name(), "user-state");
        assert_eq!(MessageType::ServerSync.event_name(), "server-sync");
        assert_eq!(MessageType::Ping.event_name(), "ping");
        assert_eq!(MessageType::UdpTunnel.event_name(), "udp-tunnel");
        assert_eq!(MessageType::Acl.event_name(), "acl");
    }

    #[test]
    fn test_prefix_layout() {
        let frame = encode_frame(9, &[1, 2, 3]).unwrap();
        assert_eq!(&frame[..], &[0, 9, 0, 0, 0, 3, 1, 2, 3]);

        let prefix = FramePrefix::parse(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(prefix, FramePrefix::new(1, 256));
    }
}
