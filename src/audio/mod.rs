//! Audio subsystem: jitter buffering, mixing, input formats and pacing

pub mod buffer;
pub mod clock;
pub mod format;
pub mod mixer;
pub mod pacer;

pub use buffer::{JitterBuffer, JitterSettings, Pull};
pub use clock::{Clock, ManualClock, TokioClock};
pub use format::{Endian, PcmFormat};
pub use mixer::{mix_frames, MixingEngine, TalkState};
pub use pacer::{VoiceInput, VoiceSink};
