//! Jitter-buffered mixing engine
//!
//! One fixed tick per wire frame: every speaker's jitter buffer yields at
//! most one entry, talk state is updated, and decoded frames are fanned out
//! per speaker and summed into one mixed frame. Nothing is decoded unless a
//! mixed or per-speaker listener exists.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::buffer::{JitterBuffer, JitterSettings, Pull};
use super::clock::Ticker;
use crate::codec::{CodecProvider, VoiceDecoder};
use crate::constants::TALK_END_THRESHOLD;
use crate::error::CodecError;
use crate::network::events::{Event, EventHub, EventKind};
use crate::protocol::voice::{CodecFamily, VoiceEntry};

/// Sum frames sample by sample, clamping the total to the i16 range
///
/// A single frame is returned as is. Shorter frames contribute silence past
/// their end.
pub fn mix_frames(frames: &[Vec<i16>]) -> Vec<i16> {
    match frames {
        [] => Vec::new(),
        [only] => only.clone(),
        _ => {
            let len = frames.iter().map(Vec::len).max().unwrap_or(0);
            (0..len)
                .map(|i| {
                    let sum: i32 = frames
                        .iter()
                        .filter_map(|f| f.get(i))
                        .map(|&s| s as i32)
                        .sum();
                    sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16
                })
                .collect()
        }
    }
}

/// Mixing engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixerSettings {
    pub frame_duration: Duration,
    /// Consecutive missed ticks that end a talk burst
    pub talk_end_threshold: u32,
    pub jitter: JitterSettings,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            frame_duration: crate::constants::FRAME_DURATION,
            talk_end_threshold: TALK_END_THRESHOLD,
            jitter: JitterSettings::default(),
        }
    }
}

/// Observable talk state of one speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TalkState {
    pub talking: bool,
    pub missed_frame_count: u32,
}

struct Speaker {
    buffer: JitterBuffer,
    decoders: HashMap<CodecFamily, Box<dyn VoiceDecoder>>,
    talking: bool,
    missed: u32,
}

impl Speaker {
    fn new(settings: JitterSettings) -> Self {
        Self {
            buffer: JitterBuffer::new(settings),
            decoders: HashMap::new(),
            talking: false,
            missed: 0,
        }
    }

    /// Decoders are created lazily, one per codec family
    fn decode(&mut self, provider: &dyn CodecProvider, entry: &VoiceEntry) -> Result<Vec<i16>, CodecError> {
        let decoder = match self.decoders.entry(entry.codec.family()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => slot.insert(provider.decoder(entry.codec)?),
        };
        decoder.decode(&entry.payload)
    }
}

/// Owns every speaker's jitter buffer, decoders and talk state
pub struct MixingEngine {
    speakers: HashMap<u32, Speaker>,
    provider: Arc<dyn CodecProvider>,
    hub: Arc<EventHub>,
    settings: MixerSettings,
    ticker: Ticker,
}

impl MixingEngine {
    /// `start` is the clock reading the first tick is measured from
    pub fn new(
        provider: Arc<dyn CodecProvider>,
        hub: Arc<EventHub>,
        settings: MixerSettings,
        start: Duration,
    ) -> Self {
        Self {
            speakers: HashMap::new(),
            provider,
            hub,
            ticker: Ticker::new(settings.frame_duration, start),
            settings,
        }
    }

    /// Allocate a speaker slot if it does not exist yet
    pub fn add_speaker(&mut self, session: u32) {
        let jitter = self.settings.jitter;
        self.speakers.entry(session).or_insert_with(|| {
            debug!(session, "Speaker slot created");
            Speaker::new(jitter)
        });
    }

    /// Release a speaker's buffer and decoders
    pub fn remove_speaker(&mut self, session: u32) -> bool {
        let Some(speaker) = self.speakers.remove(&session) else {
            return false;
        };
        let stats = speaker.buffer.stats();
        debug!(
            session,
            received = stats.received,
            late = stats.late,
            loss_rate = stats.loss_rate(),
            "Speaker slot released"
        );
        true
    }

    pub fn talk_state(&self, session: u32) -> Option<TalkState> {
        self.speakers.get(&session).map(|s| TalkState {
            talking: s.talking,
            missed_frame_count: s.missed,
        })
    }

    pub fn speaker_count(&self) -> usize {
        self.speakers.len()
    }

    /// Queue decoded packet entries into their speakers' buffers
    pub fn insert(&mut self, entries: Vec<VoiceEntry>) {
        let jitter = self.settings.jitter;
        for entry in entries {
            let session = entry.session;
            let sequence = entry.sequence;
            let speaker = self
                .speakers
                .entry(session)
                .or_insert_with(|| Speaker::new(jitter));
            if !speaker.buffer.insert(entry) {
                trace!(session, sequence, "Dropped late or duplicate voice entry");
            }
        }
    }

    /// Run every tick that is due at `now`; returns how many ran
    pub fn run_due(&mut self, now: Duration) -> usize {
        let mut ticks = 0;
        while self.ticker.next_due(now) {
            self.tick();
            ticks += 1;
        }
        ticks
    }

    /// Time until the next tick is due
    pub fn until_next(&self, now: Duration) -> Duration {
        self.ticker.until_next(now)
    }

    /// One mixing step
    pub fn tick(&mut self) {
        let mix_observed = self.hub.has_listeners(EventKind::Voice);
        let threshold = self.settings.talk_end_threshold;
        let mut frames = Vec::new();

        let mut sessions: Vec<u32> = self.speakers.keys().copied().collect();
        sessions.sort_unstable();

        for session in sessions {
            let Some(speaker) = self.speakers.get_mut(&session) else {
                continue;
            };

            let (entry, real) = match speaker.buffer.pull() {
                Pull::Data(entry) => (Some(entry), true),
                Pull::Padding(entry) => (Some(entry), false),
                Pull::Empty => (None, false),
            };

            // A terminator-only entry carries no audio and cannot start a burst
            let audible = real && entry.as_ref().is_some_and(|e| !e.payload.is_empty());

            if real {
                speaker.missed = 0;
                if audible && !speaker.talking {
                    speaker.talking = true;
                    debug!(session, "Voice started");
                    self.hub.emit(EventKind::VoiceStart, Event::VoiceStart { session });
                }
            } else if speaker.talking {
                speaker.missed += 1;
            }

            if let Some(entry) = &entry {
                let observed = mix_observed || self.hub.has_listeners(EventKind::VoiceFrom(session));
                if observed && speaker.talking && !entry.payload.is_empty() {
                    match speaker.decode(self.provider.as_ref(), entry) {
                        Ok(pcm) => {
                            self.hub.emit(
                                EventKind::VoiceFrom(session),
                                Event::SpeakerVoice {
                                    session,
                                    pcm: pcm.clone(),
                                },
                            );
                            if mix_observed {
                                frames.push(pcm);
                            }
                        }
                        Err(e) => warn!(session, sequence = entry.sequence, "Voice decode failed: {}", e),
                    }
                }
            }

            let terminated = real && entry.as_ref().is_some_and(|e| e.terminator);
            if speaker.talking && (terminated || speaker.missed >= threshold) {
                speaker.talking = false;
                speaker.missed = 0;
                debug!(session, terminated, "Voice ended");
                self.hub.emit(EventKind::VoiceEnd, Event::VoiceEnd { session });
            }
        }

        if mix_observed && !frames.is_empty() {
            self.hub.emit(EventKind::Voice, Event::Voice { pcm: mix_frames(&frames) });
        }
    }

    /// Release every speaker
    pub fn clear(&mut self) {
        self.speakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VoiceEncoder;
    use crate::constants::FRAME_SAMPLES;
    use crate::protocol::voice::{timestamp_for, VoiceCodec};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Decodes a payload into a frame filled with its first byte
    #[derive(Default)]
    struct FillProvider {
        decoders: AtomicUsize,
    }

    struct FillDecoder;

    impl VoiceDecoder for FillDecoder {
        fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, CodecError> {
            Ok(vec![payload[0] as i16 * 100; FRAME_SAMPLES])
        }
    }

    impl CodecProvider for FillProvider {
        fn supports(&self, _codec: VoiceCodec) -> bool {
            true
        }

        fn encoder(&self, codec: VoiceCodec) -> Result<Box<dyn VoiceEncoder>, CodecError> {
            Err(CodecError::Unsupported(codec.to_string()))
        }

        fn decoder(&self, _codec: VoiceCodec) -> Result<Box<dyn VoiceDecoder>, CodecError> {
            self.decoders.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FillDecoder))
        }
    }

    fn entry(session: u32, sequence: u64, codec: VoiceCodec) -> VoiceEntry {
        VoiceEntry {
            session,
            sequence,
            timestamp: timestamp_for(sequence, Duration::from_millis(10)),
            codec,
            payload: Bytes::from(vec![1u8]),
            terminator: false,
        }
    }

    fn engine() -> (MixingEngine, Arc<FillProvider>, Arc<EventHub>) {
        let provider = Arc::new(FillProvider::default());
        let hub = Arc::new(EventHub::new());
        let engine = MixingEngine::new(provider.clone(), hub.clone(), MixerSettings::default(), Duration::ZERO);
        (engine, provider, hub)
    }

    fn count(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn test_mix_clamps_instead_of_wrapping() {
        let loud = vec![i16::MAX; 4];
        let mixed = mix_frames(&[loud.clone(), loud.clone(), loud]);
        assert_eq!(mixed, vec![i16::MAX; 4]);

        let quiet = vec![i16::MIN; 2];
        assert_eq!(mix_frames(&[quiet.clone(), quiet]), vec![i16::MIN; 2]);
    }

    #[test]
    fn test_mix_is_order_independent() {
        let a = vec![30000, -5, 7];
        let b = vec![10000, -20000, 1];
        let c = vec![i16::MIN, -20000, -8];
        let expected = mix_frames(&[a.clone(), b.clone(), c.clone()]);
        for perm in [
            [&a, &c, &b],
            [&b, &a, &c],
            [&b, &c, &a],
            [&c, &a, &b],
            [&c, &b, &a],
        ] {
            let frames: Vec<Vec<i16>> = perm.iter().map(|f| (*f).clone()).collect();
            assert_eq!(mix_frames(&frames), expected);
        }
    }

    #[test]
    fn test_single_frame_verbatim() {
        let frame = vec![1, 2, 3];
        assert_eq!(mix_frames(&[frame.clone()]), frame);
    }

    #[test]
    fn test_talk_state_debounce() {
        let (mut engine, _, hub) = engine();
        let mut starts = hub.subscribe(EventKind::VoiceStart);
        let mut ends = hub.subscribe(EventKind::VoiceEnd);

        engine.insert(vec![entry(1, 0, VoiceCodec::Opus), entry(1, 1, VoiceCodec::Opus)]);
        engine.tick();
        engine.tick();
        assert_eq!(count(&mut starts), 1);

        for _ in 0..19 {
            engine.tick();
        }
        let state = engine.talk_state(1).unwrap();
        assert!(state.talking);
        assert_eq!(state.missed_frame_count, 19);
        assert_eq!(count(&mut ends), 0);

        engine.tick();
        assert!(!engine.talk_state(1).unwrap().talking);
        for _ in 0..30 {
            engine.tick();
        }
        assert_eq!(count(&mut ends), 1);
        assert_eq!(count(&mut starts), 0);
    }

    #[test]
    fn test_terminator_ends_immediately() {
        let (mut engine, _, hub) = engine();
        let mut ends = hub.subscribe(EventKind::VoiceEnd);
        engine.insert(vec![VoiceEntry {
            terminator: true,
            ..entry(4, 0, VoiceCodec::Opus)
        }]);
        engine.tick();
        assert_eq!(count(&mut ends), 1);
        assert!(!engine.talk_state(4).unwrap().talking);
    }

    #[test]
    fn test_decoding_skipped_when_unobserved() {
        let (mut engine, provider, hub) = engine();
        engine.insert(vec![entry(1, 0, VoiceCodec::Opus), entry(1, 1, VoiceCodec::Opus)]);
        engine.tick();
        assert_eq!(provider.decoders.load(Ordering::SeqCst), 0);

        let mut speaker = hub.subscribe(EventKind::VoiceFrom(1));
        engine.tick();
        assert_eq!(provider.decoders.load(Ordering::SeqCst), 1);
        assert!(matches!(
            speaker.try_recv(),
            Ok(Event::SpeakerVoice { session: 1, .. })
        ));
    }

    #[test]
    fn test_mixed_output_sums_speakers() {
        let (mut engine, _, hub) = engine();
        let mut voice = hub.subscribe(EventKind::Voice);
        for session in [1, 2] {
            engine.insert(vec![entry(session, 0, VoiceCodec::Opus), entry(session, 1, VoiceCodec::Opus)]);
        }
        engine.tick();
        match voice.try_recv() {
            Ok(Event::Voice { pcm }) => {
                assert_eq!(pcm.len(), FRAME_SAMPLES);
                assert_eq!(pcm[0], 200);
            }
            other => panic!("expected mixed voice, got {:?}", other),
        }
        assert!(voice.try_recv().is_err());
    }

    #[test]
    fn test_decoder_per_codec_family() {
        let (mut engine, provider, hub) = engine();
        let _voice = hub.subscribe(EventKind::Voice);
        engine.insert(vec![entry(1, 0, VoiceCodec::Opus), entry(1, 1, VoiceCodec::CeltAlpha)]);
        engine.insert(vec![entry(2, 0, VoiceCodec::Opus), entry(2, 1, VoiceCodec::Opus)]);
        engine.tick();
        engine.tick();
        assert_eq!(provider.decoders.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_run_due_catches_up() {
        let (mut engine, _, _) = engine();
        assert_eq!(engine.run_due(Duration::from_millis(5)), 0);
        assert_eq!(engine.run_due(Duration::from_millis(42)), 4);
        assert_eq!(engine.until_next(Duration::from_millis(42)), Duration::from_millis(8));
    }

    #[test]
    fn test_remove_speaker() {
        let (mut engine, _, _) = engine();
        engine.add_speaker(9);
        assert_eq!(engine.speaker_count(), 1);
        assert!(engine.remove_speaker(9));
        assert!(!engine.remove_speaker(9));
        assert!(engine.talk_state(9).is_none());
    }
}
