//! Voice packet codec
//!
//! Voice packets travel inside `UDPTunnel` records:
//!
//! ```text
//! outbound: [codec:3 | target:5] [varint sequence]                 [sub-frames...]
//! inbound:  [codec:3 | target:5] [varint session] [varint sequence] [sub-frames...]
//! ```
//!
//! Family A codecs (CELT, Speex) chain sub-frames, each behind a one byte
//! header `[more:1 | length:7]`. Family B (Opus) carries a single sub-frame
//! whose header is a varint packing `[terminator:1 | length:13]`.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::varint::{decode_varint, write_varint};
use super::{encode_frame, MessageType};
use crate::constants::MAX_VOICE_TARGET;
use crate::error::PacketError;

/// Longest family A sub-frame
pub const FAMILY_A_MAX_LEN: usize = 0x7F;

/// Longest family B sub-frame
pub const FAMILY_B_MAX_LEN: usize = 0x1FFF;

const FAMILY_A_CONTINUATION: u8 = 0x80;
const FAMILY_B_TERMINATOR: i64 = 0x2000;

/// Codec carried in the top three bits of the packet tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VoiceCodec {
    CeltAlpha = 0,
    Speex = 2,
    CeltBeta = 3,
    Opus = 4,
}

/// Sub-frame layout shared by a group of codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecFamily {
    /// 1-byte `[more | length]` headers, sub-frames chain
    A,
    /// varint `[terminator | length]` header, one sub-frame per packet
    B,
}

impl CodecFamily {
    pub fn max_sub_frame_len(self) -> usize {
        match self {
            CodecFamily::A => FAMILY_A_MAX_LEN,
            CodecFamily::B => FAMILY_B_MAX_LEN,
        }
    }
}

impl VoiceCodec {
    /// Parse the 3-bit type field; `1` is the ping type and carries no audio
    pub fn from_type(value: u8) -> Option<Self> {
        match value {
            0 => Some(VoiceCodec::CeltAlpha),
            2 => Some(VoiceCodec::Speex),
            3 => Some(VoiceCodec::CeltBeta),
            4 => Some(VoiceCodec::Opus),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u8 {
        self as u8
    }

    pub fn family(self) -> CodecFamily {
        match self {
            VoiceCodec::Opus => CodecFamily::B,
            VoiceCodec::CeltAlpha | VoiceCodec::Speex | VoiceCodec::CeltBeta => CodecFamily::A,
        }
    }
}

impl fmt::Display for VoiceCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoiceCodec::CeltAlpha => "CELT alpha",
            VoiceCodec::Speex => "Speex",
            VoiceCodec::CeltBeta => "CELT beta",
            VoiceCodec::Opus => "Opus",
        };
        f.write_str(name)
    }
}

/// One decoded sub-frame, ready for a jitter buffer
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceEntry {
    pub session: u32,
    pub sequence: u64,
    pub timestamp: Duration,
    pub codec: VoiceCodec,
    pub payload: Bytes,
    pub terminator: bool,
}

/// A decoded inbound voice packet
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub codec: VoiceCodec,
    pub target: u8,
    pub session: u32,
    pub entries: Vec<VoiceEntry>,
}

/// Timestamp of a sequence number at a fixed frame cadence
pub fn timestamp_for(sequence: u64, frame_duration: Duration) -> Duration {
    let nanos = frame_duration.as_nanos().saturating_mul(sequence as u128);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Build an outbound voice packet (without the record prefix)
///
/// Every sub-frame consumes one sequence number starting at `sequence`.
/// Oversized sub-frames are rejected before anything is built. Family B
/// packets hold exactly one sub-frame; `terminator` only applies to them.
pub fn encode_packet(
    codec: VoiceCodec,
    target: u8,
    sequence: u64,
    frames: &[Bytes],
    terminator: bool,
) -> Result<Bytes, PacketError> {
    if target > MAX_VOICE_TARGET {
        return Err(PacketError::InvalidTarget(target));
    }
    if frames.is_empty() {
        return Err(PacketError::EmptyPacket);
    }

    let family = codec.family();
    let max = family.max_sub_frame_len();
    if let Some(frame) = frames.iter().find(|f| f.len() > max) {
        return Err(PacketError::SubFrameTooLarge {
            length: frame.len(),
            max,
        });
    }
    if family == CodecFamily::B && frames.len() != 1 {
        return Err(PacketError::TooManySubFrames(frames.len()));
    }

    let sequence = i64::try_from(sequence).map_err(|_| PacketError::InvalidField("sequence"))?;
    let audio_len: usize = frames.iter().map(|f| f.len() + 2).sum();
    let mut buf = BytesMut::with_capacity(1 + 6 + audio_len);
    buf.put_u8(codec.type_bits() << 5 | target);
    write_varint(&mut buf, sequence)?;

    match family {
        CodecFamily::A => {
            let last = frames.len() - 1;
            for (i, frame) in frames.iter().enumerate() {
                let more = if i < last { FAMILY_A_CONTINUATION } else { 0 };
                buf.put_u8(more | frame.len() as u8);
                buf.extend_from_slice(frame);
            }
        }
        CodecFamily::B => {
            let frame = &frames[0];
            let mut header = frame.len() as i64;
            if terminator {
                header |= FAMILY_B_TERMINATOR;
            }
            write_varint(&mut buf, header)?;
            buf.extend_from_slice(frame);
        }
    }

    Ok(buf.freeze())
}

/// Build a complete `UDPTunnel` record around a voice packet
pub fn encode_tunnel_frame(
    codec: VoiceCodec,
    target: u8,
    sequence: u64,
    frames: &[Bytes],
    terminator: bool,
) -> Result<Bytes, PacketError> {
    let packet = encode_packet(codec, target, sequence, frames, terminator)?;
    encode_frame(MessageType::UdpTunnel.id(), &packet).map_err(|_| PacketError::TooLarge(packet.len()))
}

/// Decode an inbound voice packet into jitter buffer entries
pub fn decode_packet(data: &Bytes, frame_duration: Duration) -> Result<DecodedPacket, PacketError> {
    let tag = *data.first().ok_or(PacketError::EmptyPacket)?;
    let codec_bits = tag >> 5;
    let target = tag & 0x1F;
    let codec = VoiceCodec::from_type(codec_bits).ok_or(PacketError::UnknownCodec(codec_bits))?;

    let mut offset = 1;
    let (session, len) = decode_varint(&data[offset..])?;
    offset += len;
    let (sequence, len) = decode_varint(&data[offset..])?;
    offset += len;

    let session = u32::try_from(session).map_err(|_| PacketError::InvalidField("session"))?;
    let mut sequence = u64::try_from(sequence).map_err(|_| PacketError::InvalidField("sequence"))?;

    let mut entries = Vec::new();
    let mut push = |sequence: u64, payload: Bytes, terminator: bool| {
        entries.push(VoiceEntry {
            session,
            sequence,
            timestamp: timestamp_for(sequence, frame_duration),
            codec,
            payload,
            terminator,
        });
    };

    match codec.family() {
        CodecFamily::A => {
            while offset < data.len() {
                let header = data[offset];
                let length = (header & 0x7F) as usize;
                if length == 0 {
                    break;
                }
                let start = offset + 1;
                let end = start + length;
                if end > data.len() {
                    return Err(PacketError::Truncated);
                }
                push(sequence, data.slice(start..end), false);
                sequence += 1;
                offset = end;
                if header & FAMILY_A_CONTINUATION == 0 {
                    break;
                }
            }
        }
        CodecFamily::B => {
            let (header, len) = decode_varint(&data[offset..])?;
            offset += len;
            let length = (header & FAMILY_B_MAX_LEN as i64) as usize;
            let terminator = header & FAMILY_B_TERMINATOR != 0;
            let end = offset + length;
            if end > data.len() {
                return Err(PacketError::Truncated);
            }
            // Anything past the sub-frame is positional audio data
            push(sequence, data.slice(offset..end), terminator);
        }
    }

    Ok(DecodedPacket {
        codec,
        target,
        session,
        entries,
    })
}

/// Rewrite an outbound packet as the server relays it, inserting `session`
///
/// Used by loopback relays and tests standing in for a server.
pub fn relay_packet(packet: &[u8], session: u32) -> Result<Bytes, PacketError> {
    let tag = *packet.first().ok_or(PacketError::EmptyPacket)?;
    let mut buf = BytesMut::with_capacity(packet.len() + 5);
    buf.put_u8(tag);
    write_varint(&mut buf, session as i64)?;
    buf.extend_from_slice(&packet[1..]);
    Ok(buf.freeze())
}
