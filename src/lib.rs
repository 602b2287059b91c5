//! # Mumble Voice
//!
//! Client core for the Mumble voice protocol over a single reliable stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          INBOUND (server -> client)                      │
//! │                                                                          │
//! │  byte stream ──► Frame Transport ──► Dispatcher ──┬──► control handlers  │
//! │                  (network::transport) (network::   │     + events         │
//! │                  [type|len|payload]    dispatcher) │                      │
//! │                                                    ▼                      │
//! │                                     Voice Packet Codec (protocol::voice) │
//! │                                                    │                      │
//! │                                                    ▼                      │
//! │                  ┌──────────────────────────────────────────────┐        │
//! │                  │        Mixing Engine (audio::mixer)           │        │
//! │                  │  Speaker 1      Speaker 2      Speaker N      │        │
//! │                  │  ┌────────┐     ┌────────┐     ┌────────┐     │        │
//! │                  │  │ Jitter │     │ Jitter │     │ Jitter │     │        │
//! │                  │  │ Buffer │     │ Buffer │     │ Buffer │     │        │
//! │                  │  └───┬────┘     └───┬────┘     └───┬────┘     │        │
//! │                  │  ┌───▼────┐     ┌───▼────┐     ┌───▼────┐     │        │
//! │                  │  │Decoder │     │Decoder │     │Decoder │     │        │
//! │                  │  └───┬────┘     └───┬────┘     └───┬────┘     │        │
//! │                  │      └──── 10 ms tick, clamped sum ───┘       │        │
//! │                  └──────────────────────┬───────────────────────┘        │
//! │                                         ▼                                 │
//! │                         Voice / VoiceFrom / VoiceStart / VoiceEnd events │
//! └──────────────────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          OUTBOUND (client -> server)                     │
//! │                                                                          │
//! │  PCM writes ──► VoiceInput (audio::pacer) ──► Preprocessor ──► Encoder   │
//! │                 10-frame queue, 10 ms tick     (audio::format)     │      │
//! │                                                                    ▼      │
//! │          Frame Transport writer ◄── Voice Packet Codec ◄── sequence ctr  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use network::{Connection, Event, EventKind};

/// Wire and cadence constants
pub mod constants {
    use std::time::Duration;

    /// Sample rate of the voice wire format
    pub const WIRE_SAMPLE_RATE: u32 = 48000;

    /// Channel count of the voice wire format (mono)
    pub const WIRE_CHANNELS: u16 = 1;

    /// Default frame duration in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: u64 = 10;

    /// Default frame duration
    pub const FRAME_DURATION: Duration = Duration::from_millis(DEFAULT_FRAME_DURATION_MS);

    /// Samples per wire frame (10 ms at 48 kHz)
    pub const FRAME_SAMPLES: usize = (WIRE_SAMPLE_RATE as u64 * DEFAULT_FRAME_DURATION_MS / 1000) as usize;

    /// Length of the frame prefix (u16 type + u32 length)
    pub const FRAME_PREFIX_LEN: usize = 6;

    /// Outbound frames a voice input may queue before writes suspend
    pub const LOCAL_BUFFER_FRAMES: usize = 10;

    /// Consecutive missed ticks after which a speaker stops talking
    pub const TALK_END_THRESHOLD: u32 = 20;

    /// Pacer stall, in frames, treated as a gap
    pub const PACER_GAP_FRAMES: u32 = 20;

    /// Default keep-alive ping interval in milliseconds
    pub const DEFAULT_PING_INTERVAL_MS: u64 = 1000;

    /// Default jitter buffer margin in frames
    pub const DEFAULT_JITTER_TARGET_FRAMES: usize = 2;

    /// Highest whisper/voice target id (5 bits)
    pub const MAX_VOICE_TARGET: u8 = 31;

    /// Voice target the server echoes back to the sender
    pub const SERVER_LOOPBACK_TARGET: u8 = 31;
}
