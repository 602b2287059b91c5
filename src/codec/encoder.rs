//! Opus encoder wrapper
//!
//! Low-latency mono Opus encoding at the wire frame size.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};
use serde::{Deserialize, Serialize};

use super::VoiceEncoder;
use crate::constants::{FRAME_SAMPLES, WIRE_SAMPLE_RATE};
use crate::error::CodecError;
use crate::protocol::voice::{VoiceCodec, FAMILY_B_MAX_LEN};

/// Opus encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusSettings {
    pub sample_rate: u32,
    /// Samples per channel in one frame
    pub frame_size: usize,
    pub bitrate: u32,
    pub vbr: bool,
    pub fec: bool,
    pub packet_loss_perc: u8,
}

impl Default for OpusSettings {
    fn default() -> Self {
        Self {
            sample_rate: WIRE_SAMPLE_RATE,
            frame_size: FRAME_SAMPLES,
            bitrate: 40_000,
            vbr: true,
            fec: false,
            packet_loss_perc: 0,
        }
    }
}

/// Opus encoder with voice settings
pub struct OpusEncoder {
    encoder: Encoder,
    settings: OpusSettings,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a new mono VoIP encoder
    pub fn new(settings: OpusSettings) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(settings.sample_rate, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &settings)?;

        Ok(Self {
            encoder,
            settings,
            encode_buffer: vec![0u8; FAMILY_B_MAX_LEN],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, settings: &OpusSettings) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(settings.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(settings.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        encoder
            .set_inband_fec(settings.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if settings.fec {
            encoder
                .set_packet_loss_perc(settings.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    /// Update bitrate dynamically
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        self.encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        self.settings.bitrate = bitrate;
        Ok(())
    }

    pub fn settings(&self) -> &OpusSettings {
        &self.settings
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced
    }
}

impl VoiceEncoder for OpusEncoder {
    fn codec(&self) -> VoiceCodec {
        VoiceCodec::Opus
    }

    /// Input must hold exactly one frame of mono samples
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        if pcm.len() != self.settings.frame_size {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let size = self
            .encoder
            .encode(pcm, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }
}
