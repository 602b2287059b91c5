//! Error types for the voice client core

use thiserror::Error;

use crate::protocol::MessageType;

/// Main error type for the client core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Varint error: {0}")]
    Varint(#[from] VarintError),

    #[error("Voice packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Failed to decode {message_type} message: {reason}")]
    Schema {
        message_type: MessageType,
        reason: String,
    },

    /// A server rejection arrived and nobody subscribed to errors.
    #[error("Unobserved server rejection: {0}")]
    UnobservedRejection(ServerRejection),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Varint codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VarintError {
    #[error("64-bit varints are not supported")]
    Unsupported64Bit,

    #[error("Negative varint escape followed by another negative form: {0:#04x}")]
    NestedNegative(u8),

    #[error("Varint truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Value out of varint range: {0}")]
    OutOfRange(i64),
}

/// Voice packet encode/decode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Sub-frame of {length} bytes exceeds the {max} byte limit of the codec family")]
    SubFrameTooLarge { length: usize, max: usize },

    #[error("Unknown voice codec type: {0}")]
    UnknownCodec(u8),

    #[error("Voice packet truncated")]
    Truncated,

    #[error("Empty voice packet")]
    EmptyPacket,

    #[error("Whisper target out of range: {0}")]
    InvalidTarget(u8),

    #[error("Family B packets carry one sub-frame, got {0}")]
    TooManySubFrames(usize),

    #[error("Invalid {0} field in voice header")]
    InvalidField(&'static str),

    #[error("Voice packet of {0} bytes does not fit a frame")]
    TooLarge(usize),

    #[error("Varint error in voice header: {0}")]
    Varint(#[from] VarintError),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Codec not supported: {0}")]
    Unsupported(String),
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
}

/// Errors scoped to a single outbound voice stream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("Resampler failed: {0}")]
    Resample(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Stream closed")]
    Closed,
}

/// A `Reject` message reported by the server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRejection {
    pub message_type: MessageType,
    pub reason: Option<String>,
    pub data: serde_json::Value,
}

impl ServerRejection {
    pub fn new(message_type: MessageType, data: serde_json::Value) -> Self {
        let reason = ["details", "reason"]
            .iter()
            .find_map(|key| data.get(key).and_then(|v| v.as_str()))
            .map(str::to_owned);
        Self {
            message_type,
            reason,
            data,
        }
    }
}

impl std::fmt::Display for ServerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' message received from the server", self.message_type)?;
        match &self.reason {
            Some(reason) => write!(f, ": \"{}\"", reason),
            None => Ok(()),
        }
    }
}

/// Result type alias for the client core
pub type Result<T> = std::result::Result<T, Error>;
