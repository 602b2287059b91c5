//! Opus decoder wrapper
//!
//! Mono decoding with packet loss concealment for empty payloads.

use opus::{Channels, Decoder};

use super::VoiceDecoder;
use crate::error::CodecError;

/// Longest Opus frame: 120 ms at 48 kHz
const MAX_FRAME_SAMPLES: usize = 48000 * 120 / 1000;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    frame_size: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    frames_decoded: u64,
    /// Frames concealed (PLC used)
    frames_lost: u64,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, frame_size: usize) -> Result<Self, CodecError> {
        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            frame_size,
            decode_buffer: vec![0i16; MAX_FRAME_SAMPLES],
            frames_decoded: 0,
            frames_lost: 0,
        })
    }

    /// Generate packet loss concealment samples for one frame
    pub fn decode_plc(&mut self) -> Result<Vec<i16>, CodecError> {
        let buffer = &mut self.decode_buffer[..self.frame_size];
        let samples = self
            .decoder
            .decode(&[], buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_lost += 1;
        Ok(self.decode_buffer[..samples].to_vec())
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_lost(&self) -> u64 {
        self.frames_lost
    }
}

impl VoiceDecoder for OpusDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
        if payload.is_empty() {
            return self.decode_plc();
        }

        let samples = self
            .decoder
            .decode(payload, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_decoded += 1;
        Ok(self.decode_buffer[..samples].to_vec())
    }
}
