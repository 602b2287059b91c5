//! Input PCM formats and conversion to wire format
//!
//! Each queued input frame goes through rescale, gain, downmix and resample,
//! in that order, ending as 48 kHz mono i16. Steps whose input already
//! matches the target are skipped.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Buf;
use rubato::{FftFixedIn, Resampler};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{WIRE_CHANNELS, WIRE_SAMPLE_RATE};
use crate::error::StreamError;

/// Byte order of multi-byte samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
}

/// Layout of PCM handed to a voice input
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcmFormat {
    pub bit_depth: u16,
    pub signed: bool,
    pub endian: Endian,
    pub channels: u16,
    pub sample_rate: u32,
    /// Linear gain applied after rescaling
    pub gain: f32,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::wire()
    }
}

impl PcmFormat {
    /// 16-bit signed little-endian mono at the wire rate
    pub fn wire() -> Self {
        Self {
            bit_depth: 16,
            signed: true,
            endian: Endian::Little,
            channels: WIRE_CHANNELS,
            sample_rate: WIRE_SAMPLE_RATE,
            gain: 1.0,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bit_depth as usize).div_ceil(8).max(1)
    }

    /// Samples per channel in one frame
    pub fn frame_samples(&self, frame_duration: Duration) -> usize {
        (self.sample_rate as u128 * frame_duration.as_nanos() / 1_000_000_000) as usize
    }

    /// Bytes in one interleaved frame
    pub fn frame_bytes(&self, frame_duration: Duration) -> usize {
        self.frame_samples(frame_duration) * self.channels as usize * self.bytes_per_sample()
    }

    /// Bytes of one silent sample, used to pad a partial frame
    pub fn silence(&self) -> Vec<u8> {
        let width = self.bytes_per_sample();
        if self.signed {
            return vec![0; width];
        }
        let mid = 1u64 << (width * 8 - 1);
        let bytes = mid.to_le_bytes();
        match self.endian {
            Endian::Little => bytes[..width].to_vec(),
            Endian::Big => bytes[..width].iter().rev().copied().collect(),
        }
    }

    /// Reject layouts no frame can be built from
    pub fn validate(&self, frame_duration: Duration) -> Result<(), StreamError> {
        if self.channels == 0 {
            return Err(StreamError::UnsupportedChannels(self.channels));
        }
        if self.frame_samples(frame_duration) == 0 {
            return Err(StreamError::UnsupportedSampleRate(self.sample_rate));
        }
        Ok(())
    }

    fn needs_rescale(&self) -> bool {
        !(self.bit_depth == 16 && self.signed && self.endian == Endian::Little)
    }
}

fn read_raw(buf: &mut &[u8], width: usize, endian: Endian) -> u64 {
    match endian {
        Endian::Little => buf.get_uint_le(width),
        Endian::Big => buf.get_uint(width),
    }
}

fn to_i16(raw: u64, bits: u32, signed: bool) -> i16 {
    let value = if signed {
        ((raw << (64 - bits)) as i64) >> (64 - bits)
    } else {
        raw as i64 - (1i64 << (bits - 1))
    };
    if bits >= 16 {
        (value >> (bits - 16)) as i16
    } else {
        (value << (16 - bits)) as i16
    }
}

/// Converts input frames to wire frames
pub struct Preprocessor {
    format: PcmFormat,
    wire_frame: usize,
    resampler: Option<FftFixedIn<f32>>,
    /// Wire samples waiting to fill a frame
    pending: VecDeque<i16>,
}

impl Preprocessor {
    pub fn new(format: PcmFormat, frame_duration: Duration) -> Result<Self, StreamError> {
        format.validate(frame_duration)?;

        let resampler = if format.sample_rate != WIRE_SAMPLE_RATE {
            let chunk = format.frame_samples(frame_duration);
            let resampler = FftFixedIn::<f32>::new(
                format.sample_rate as usize,
                WIRE_SAMPLE_RATE as usize,
                chunk,
                1,
                1,
            )
            .map_err(|e| StreamError::Resample(e.to_string()))?;
            debug!(
                "Created resampler {}Hz -> {}Hz, {} samples per chunk",
                format.sample_rate, WIRE_SAMPLE_RATE, chunk
            );
            Some(resampler)
        } else {
            None
        };

        Ok(Self {
            format,
            wire_frame: PcmFormat::wire().frame_samples(frame_duration),
            resampler,
            pending: VecDeque::new(),
        })
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    /// Convert one input frame; returns every wire frame now complete
    pub fn process(&mut self, frame: &[u8]) -> Result<Vec<Vec<i16>>, StreamError> {
        let samples = self.rescale(frame)?;
        let samples = self.apply_gain(samples);
        let samples = self.downmix(samples);
        let samples = self.resample(samples)?;

        self.pending.extend(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.wire_frame {
            frames.push(self.pending.drain(..self.wire_frame).collect());
        }
        Ok(frames)
    }

    fn rescale(&self, frame: &[u8]) -> Result<Vec<i16>, StreamError> {
        let bits = self.format.bit_depth;
        if !matches!(bits, 8 | 16 | 24 | 32) {
            return Err(StreamError::UnsupportedBitDepth(bits));
        }

        let width = self.format.bytes_per_sample();
        let count = frame.len() / width;
        let mut buf = frame;

        if !self.format.needs_rescale() {
            return Ok((0..count).map(|_| buf.get_i16_le()).collect());
        }

        Ok((0..count)
            .map(|_| {
                let raw = read_raw(&mut buf, width, self.format.endian);
                to_i16(raw, bits as u32, self.format.signed)
            })
            .collect())
    }

    fn apply_gain(&self, mut samples: Vec<i16>) -> Vec<i16> {
        let gain = self.format.gain;
        if gain == 1.0 {
            return samples;
        }
        for sample in &mut samples {
            *sample = (*sample as f32 * gain)
                .round()
                .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
        samples
    }

    fn downmix(&self, samples: Vec<i16>) -> Vec<i16> {
        let channels = self.format.channels as usize;
        if channels == 1 {
            return samples;
        }
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    }

    fn resample(&mut self, samples: Vec<i16>) -> Result<Vec<i16>, StreamError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples);
        };

        let mut input: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();
        input.resize(resampler.input_frames_next(), 0.0);

        let output = resampler
            .process(&[input], None)
            .map_err(|e| StreamError::Resample(e.to_string()))?;

        Ok(output
            .first()
            .map(|channel| {
                channel
                    .iter()
                    .map(|&s| (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
                    .collect()
            })
            .unwrap_or_default())
    }
}
