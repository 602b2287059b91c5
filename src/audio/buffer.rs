//! Per-speaker jitter buffer
//!
//! Entries arrive in any order and leave in sequence order, one per mixing
//! tick. Playback starts once a small margin is buffered; holes and
//! underruns are covered with padding that repeats the last good payload.

use std::collections::BTreeMap;

use crate::protocol::voice::VoiceEntry;

/// Jitter buffer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterSettings {
    /// Entries buffered (or ticks waited) before playback starts
    pub target_frames: usize,
    /// Consecutive padding entries synthesized on underrun
    pub max_padding_frames: u32,
    /// A sequence jump larger than this starts a new stream
    pub max_sequence_gap: u64,
}

impl Default for JitterSettings {
    fn default() -> Self {
        Self {
            target_frames: crate::constants::DEFAULT_JITTER_TARGET_FRAMES,
            max_padding_frames: 2,
            max_sequence_gap: 100,
        }
    }
}

/// Result of one dequeue
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// The next entry in sequence
    Data(VoiceEntry),
    /// Synthesized stand-in for a late or lost entry
    Padding(VoiceEntry),
    /// Nothing to play
    Empty,
}

/// Reordering buffer keyed by sequence number
pub struct JitterBuffer {
    entries: BTreeMap<u64, VoiceEntry>,
    settings: JitterSettings,
    /// Next sequence to play, once known
    next_sequence: Option<u64>,
    /// Last payload played, repeated as padding
    last: Option<VoiceEntry>,
    playing: bool,
    /// Ticks spent prebuffering
    waited: usize,
    /// Consecutive underrun paddings
    padding_run: u32,
    received: usize,
    lost: usize,
    late: usize,
    padded: usize,
}

impl JitterBuffer {
    pub fn new(settings: JitterSettings) -> Self {
        Self {
            entries: BTreeMap::new(),
            settings,
            next_sequence: None,
            last: None,
            playing: false,
            waited: 0,
            padding_run: 0,
            received: 0,
            lost: 0,
            late: 0,
            padded: 0,
        }
    }

    /// Insert an entry; returns false when it is late or a duplicate
    pub fn insert(&mut self, entry: VoiceEntry) -> bool {
        if let Some(next) = self.next_sequence {
            if entry.sequence < next {
                if next - entry.sequence > self.settings.max_sequence_gap {
                    // Sender restarted its sequence
                    self.reset();
                } else {
                    self.late += 1;
                    return false;
                }
            } else if entry.sequence - next > self.settings.max_sequence_gap {
                self.reset();
            }
        }

        if self.entries.contains_key(&entry.sequence) {
            return false;
        }
        self.entries.insert(entry.sequence, entry);
        self.received += 1;
        true
    }

    /// Dequeue the entry due at this tick
    pub fn pull(&mut self) -> Pull {
        if !self.playing && !self.start() {
            return Pull::Empty;
        }

        let Some(next) = self.next_sequence else {
            return Pull::Empty;
        };

        if let Some(entry) = self.entries.remove(&next) {
            self.next_sequence = Some(next + 1);
            self.padding_run = 0;
            if entry.terminator {
                self.playing = false;
                self.waited = 0;
            }
            self.last = Some(entry.clone());
            return Pull::Data(entry);
        }

        if !self.entries.is_empty() {
            // Later data exists: skip the hole
            self.lost += 1;
            self.next_sequence = Some(next + 1);
            return self.padding(next);
        }

        if self.padding_run < self.settings.max_padding_frames {
            self.padding_run += 1;
            self.next_sequence = Some(next + 1);
            return self.padding(next);
        }

        self.playing = false;
        self.waited = 0;
        Pull::Empty
    }

    fn start(&mut self) -> bool {
        let Some(&first) = self.entries.keys().next() else {
            return false;
        };
        self.waited += 1;
        let ready = self.entries.len() >= self.settings.target_frames
            || self.waited >= self.settings.target_frames
            || self.entries.values().any(|e| e.terminator);
        if ready {
            self.playing = true;
            self.padding_run = 0;
            self.next_sequence = Some(first);
        }
        ready
    }

    fn padding(&mut self, sequence: u64) -> Pull {
        match &self.last {
            Some(last) => {
                self.padded += 1;
                Pull::Padding(VoiceEntry {
                    sequence,
                    terminator: false,
                    ..last.clone()
                })
            }
            None => Pull::Empty,
        }
    }

    /// Forget all buffered entries and playback position
    pub fn reset(&mut self) {
        self.entries.clear();
        self.next_sequence = None;
        self.last = None;
        self.playing = false;
        self.waited = 0;
        self.padding_run = 0;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.entries.len(),
            received: self.received,
            lost: self.lost,
            late: self.late,
            padded: self.padded,
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterBufferStats {
    pub level: usize,
    pub received: usize,
    pub lost: usize,
    pub late: usize,
    pub padded: usize,
}

impl JitterBufferStats {
    pub fn loss_rate(&self) -> f32 {
        if self.received == 0 {
            0.0
        } else {
            self.lost as f32 / (self.received + self.lost) as f32
        }
    }
}
