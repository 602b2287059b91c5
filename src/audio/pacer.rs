//! Outbound voice pacing
//!
//! A [`VoiceInput`] slices arbitrary writes into fixed input frames and
//! queues them; a pacer task running at the wire cadence sends one frame per
//! tick. When the queue is full, `write` suspends until a tick frees a slot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace, warn};

use super::clock::{Clock, Ticker};
use super::format::{PcmFormat, Preprocessor};
use crate::codec::VoiceEncoder;
use crate::constants::{FRAME_DURATION, LOCAL_BUFFER_FRAMES, PACER_GAP_FRAMES};
use crate::error::{PacketError, StreamError};
use crate::protocol::voice::{CodecFamily, VoiceCodec};

/// Where paced frames go
///
/// Implemented by the connection, which owns the shared sequence counter.
pub trait VoiceSink: Send + Sync {
    /// Send encoded sub-frames, consuming one sequence number each
    fn send_frames(
        &self,
        codec: VoiceCodec,
        target: u8,
        frames: &[Bytes],
        terminator: bool,
    ) -> Result<(), PacketError>;

    /// Advance the sequence counter over frames that were never sent
    fn skip_sequence(&self, frames: u64);

    /// Report a failure that halted one stream
    fn stream_error(&self, target: u8, error: StreamError);
}

/// Pacer tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerSettings {
    pub frame_duration: Duration,
    /// Frames queued before `write` suspends
    pub local_buffer_frames: usize,
    /// Stall length, in frames, that triggers a sequence resync
    pub gap_frames: u32,
}

impl Default for PacerSettings {
    fn default() -> Self {
        Self {
            frame_duration: FRAME_DURATION,
            local_buffer_frames: LOCAL_BUFFER_FRAMES,
            gap_frames: PACER_GAP_FRAMES,
        }
    }
}

/// Bounded frame queue; free slots are semaphore permits
pub struct FrameQueue {
    frames: Mutex<VecDeque<Bytes>>,
    slots: Semaphore,
    finishing: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            finishing: AtomicBool::new(false),
        }
    }

    /// Queue a frame, waiting for a free slot
    pub async fn push(&self, frame: Bytes) -> Result<(), StreamError> {
        let permit = self.slots.acquire().await.map_err(|_| StreamError::Closed)?;
        permit.forget();
        self.frames.lock().push_back(frame);
        Ok(())
    }

    /// Queue a frame only if a slot is free
    pub fn try_push(&self, frame: Bytes) -> Result<bool, StreamError> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.frames.lock().push_back(frame);
                Ok(true)
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => Ok(false),
            Err(tokio::sync::TryAcquireError::Closed) => Err(StreamError::Closed),
        }
    }

    /// Take the oldest frame, freeing its slot
    pub fn pop(&self) -> Option<Bytes> {
        let frame = self.frames.lock().pop_front();
        if frame.is_some() {
            self.slots.add_permits(1);
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// No more frames will be written
    pub fn finish(&self) {
        self.finishing.store(true, Ordering::SeqCst);
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::SeqCst)
    }

    /// Wake suspended writers with an error and refuse new frames
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}

/// Lifecycle of a pacer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Running,
    /// A frame failed preprocessing or encoding
    Halted,
    /// The final frame went out with the terminator
    Finished,
}

/// Clock-driven frame sender for one stream
pub struct Pacer {
    queue: Arc<FrameQueue>,
    preprocessor: Preprocessor,
    encoder: Box<dyn VoiceEncoder>,
    sink: Arc<dyn VoiceSink>,
    target: u8,
    ticker: Ticker,
    gap: Duration,
    state: PacerState,
}

impl Pacer {
    pub fn new(
        queue: Arc<FrameQueue>,
        preprocessor: Preprocessor,
        encoder: Box<dyn VoiceEncoder>,
        sink: Arc<dyn VoiceSink>,
        target: u8,
        settings: PacerSettings,
        start: Duration,
    ) -> Self {
        Self {
            queue,
            preprocessor,
            encoder,
            sink,
            target,
            ticker: Ticker::new(settings.frame_duration, start),
            gap: settings.frame_duration * settings.gap_frames,
            state: PacerState::Running,
        }
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn until_next(&self, now: Duration) -> Duration {
        self.ticker.until_next(now)
    }

    /// Run every tick due at `now`
    ///
    /// After a stall longer than the gap threshold the missed ticks are
    /// dropped and the sequence counter jumps over them instead.
    pub fn run_due(&mut self, now: Duration) -> PacerState {
        if self.state != PacerState::Running {
            return self.state;
        }

        if self.ticker.behind(now) > self.gap {
            let skipped = self.ticker.skip_to(now);
            debug!(voice_target = self.target, skipped, "Pacer stalled, resynchronizing sequence");
            self.sink.skip_sequence(skipped);
        }

        while self.state == PacerState::Running && self.ticker.next_due(now) {
            if let Err(error) = self.tick() {
                warn!(voice_target = self.target, "Voice stream halted: {}", error);
                self.state = PacerState::Halted;
                self.queue.close();
                self.sink.stream_error(self.target, error);
            }
        }
        self.state
    }

    fn tick(&mut self) -> Result<(), StreamError> {
        let finishing = self.queue.is_finishing();
        let Some(frame) = self.queue.pop() else {
            if finishing {
                self.send(Vec::new(), true)?;
                self.state = PacerState::Finished;
            }
            return Ok(());
        };
        let last = finishing && self.queue.is_empty();

        let mut encoded = Vec::new();
        for pcm in self.preprocessor.process(&frame)? {
            let payload = self
                .encoder
                .encode(&pcm)
                .map_err(|e| StreamError::Encode(e.to_string()))?;
            encoded.push(payload);
        }

        self.send(encoded, last)?;
        if last {
            self.state = PacerState::Finished;
        }
        Ok(())
    }

    fn send(&self, mut frames: Vec<Bytes>, terminator: bool) -> Result<(), StreamError> {
        let codec = self.encoder.codec();
        let terminator = terminator && codec.family() == CodecFamily::B;
        if frames.is_empty() {
            if !terminator {
                return Ok(());
            }
            frames.push(Bytes::new());
        }
        trace!(voice_target = self.target, frames = frames.len(), terminator, "Sending voice frames");
        self.sink
            .send_frames(codec, self.target, &frames, terminator)
            .map_err(|e| StreamError::Encode(e.to_string()))
    }
}

async fn drive(mut pacer: Pacer, clock: Arc<dyn Clock>) {
    loop {
        if pacer.run_due(clock.now()) != PacerState::Running {
            break;
        }
        tokio::time::sleep(pacer.until_next(clock.now())).await;
    }
    trace!(voice_target = pacer.target, state = ?pacer.state(), "Pacer stopped");
}

/// A writable outbound voice stream
///
/// Dropping the input closes it.
pub struct VoiceInput {
    target: u8,
    frame_bytes: usize,
    accumulator: Vec<u8>,
    silence: Vec<u8>,
    queue: Arc<FrameQueue>,
    task: Option<JoinHandle<()>>,
}

impl VoiceInput {
    /// Start a paced stream; must be called inside a tokio runtime
    pub fn spawn(
        format: PcmFormat,
        target: u8,
        encoder: Box<dyn VoiceEncoder>,
        sink: Arc<dyn VoiceSink>,
        clock: Arc<dyn Clock>,
        settings: PacerSettings,
    ) -> Result<Self, StreamError> {
        let preprocessor = Preprocessor::new(format, settings.frame_duration)?;
        let frame_bytes = format.frame_bytes(settings.frame_duration);
        let queue = Arc::new(FrameQueue::new(settings.local_buffer_frames));

        let pacer = Pacer::new(
            queue.clone(),
            preprocessor,
            encoder,
            sink,
            target,
            settings,
            clock.now(),
        );
        let task = tokio::spawn(drive(pacer, clock));

        debug!(voice_target = target, frame_bytes, "Voice input opened");
        Ok(Self {
            target,
            frame_bytes,
            accumulator: Vec::with_capacity(frame_bytes),
            silence: format.silence(),
            queue,
            task: Some(task),
        })
    }

    pub fn target(&self) -> u8 {
        self.target
    }

    /// Frames waiting for the pacer
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    /// Write PCM in the input format
    ///
    /// Suspends while the queue is full and resumes with the rest of `data`
    /// once the pacer frees a slot.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), StreamError> {
        if self.queue.is_closed() {
            return Err(StreamError::Closed);
        }
        while !data.is_empty() {
            let take = (self.frame_bytes - self.accumulator.len()).min(data.len());
            self.accumulator.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.accumulator.len() == self.frame_bytes {
                let frame = std::mem::replace(&mut self.accumulator, Vec::with_capacity(self.frame_bytes));
                self.queue.push(Bytes::from(frame)).await?;
            }
        }
        Ok(())
    }

    /// Flush the partial frame padded with silence, send everything queued
    /// and end the stream with a terminator
    pub async fn finish(mut self) -> Result<(), StreamError> {
        if !self.accumulator.is_empty() {
            while self.accumulator.len() < self.frame_bytes {
                let missing = self.frame_bytes - self.accumulator.len();
                let width = self.silence.len().min(missing);
                self.accumulator.extend_from_slice(&self.silence[..width]);
            }
            let frame = std::mem::take(&mut self.accumulator);
            self.queue.push(Bytes::from(frame)).await?;
        }
        self.queue.finish();

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if self.queue.is_closed() {
            return Err(StreamError::Closed);
        }
        self.queue.close();
        debug!(voice_target = self.target, "Voice input finished");
        Ok(())
    }

    /// A handle that can stop this stream without owning it
    pub fn handle(&self) -> InputHandle {
        InputHandle {
            queue: Arc::downgrade(&self.queue),
            abort: self.task.as_ref().map(|task| task.abort_handle()),
        }
    }

    /// Stop pacing immediately, discarding queued frames. Idempotent.
    pub fn close(&mut self) {
        self.queue.close();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(voice_target = self.target, "Voice input closed");
        }
    }
}

impl Drop for VoiceInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owner-side view of a [`VoiceInput`], held by the connection
pub struct InputHandle {
    queue: Weak<FrameQueue>,
    abort: Option<AbortHandle>,
}

impl InputHandle {
    /// Close the queue and stop the pacer task
    pub fn stop(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.close();
        }
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// False once the stream was closed, finished or dropped
    pub fn is_live(&self) -> bool {
        self.queue.upgrade().is_some_and(|queue| !queue.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::clock::{ManualClock, TokioClock};
    use crate::audio::format::Endian;
    use crate::error::CodecError;
    use std::sync::atomic::AtomicU64;

    const FRAME: Duration = Duration::from_millis(10);

    struct TagEncoder {
        codec: VoiceCodec,
        count: u8,
    }

    impl VoiceEncoder for TagEncoder {
        fn codec(&self) -> VoiceCodec {
            self.codec
        }

        fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
            self.count = self.count.wrapping_add(1);
            Ok(Bytes::from(vec![self.count, pcm.len() as u8]))
        }
    }

    fn encoder() -> Box<dyn VoiceEncoder> {
        Box::new(TagEncoder {
            codec: VoiceCodec::Opus,
            count: 0,
        })
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(u8, Vec<Bytes>, bool)>>,
        skipped: AtomicU64,
        errors: Mutex<Vec<StreamError>>,
    }

    impl VoiceSink for RecordingSink {
        fn send_frames(
            &self,
            _codec: VoiceCodec,
            target: u8,
            frames: &[Bytes],
            terminator: bool,
        ) -> Result<(), PacketError> {
            self.sent.lock().push((target, frames.to_vec(), terminator));
            Ok(())
        }

        fn skip_sequence(&self, frames: u64) {
            self.skipped.fetch_add(frames, Ordering::SeqCst);
        }

        fn stream_error(&self, _target: u8, error: StreamError) {
            self.errors.lock().push(error);
        }
    }

    fn frame() -> Bytes {
        Bytes::from(vec![0u8; PcmFormat::wire().frame_bytes(FRAME)])
    }

    fn pacer(format: PcmFormat, sink: Arc<RecordingSink>) -> (Pacer, Arc<FrameQueue>) {
        let queue = Arc::new(FrameQueue::new(LOCAL_BUFFER_FRAMES));
        let pacer = Pacer::new(
            queue.clone(),
            Preprocessor::new(format, FRAME).unwrap(),
            encoder(),
            sink,
            0,
            PacerSettings::default(),
            Duration::ZERO,
        );
        (pacer, queue)
    }

    #[test]
    fn test_one_frame_per_tick() {
        let sink = Arc::new(RecordingSink::default());
        let (mut pacer, queue) = pacer(PcmFormat::wire(), sink.clone());
        for _ in 0..3 {
            assert!(queue.try_push(frame()).unwrap());
        }

        let clock = ManualClock::new();
        clock.advance(Duration::from_millis(25));
        pacer.run_due(clock.now());
        assert_eq!(sink.sent.lock().len(), 2);
        assert_eq!(queue.len(), 1);

        // Empty ticks advance the clock without sending
        clock.advance(Duration::from_millis(50));
        pacer.run_due(clock.now());
        assert_eq!(sink.sent.lock().len(), 3);
        assert_eq!(sink.skipped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stall_resyncs_sequence() {
        let sink = Arc::new(RecordingSink::default());
        let (mut pacer, queue) = pacer(PcmFormat::wire(), sink.clone());
        for _ in 0..5 {
            queue.try_push(frame()).unwrap();
        }

        pacer.run_due(Duration::from_millis(505));
        assert_eq!(sink.skipped.load(Ordering::SeqCst), 50);
        // No burst of stale ticks after the jump
        assert!(sink.sent.lock().is_empty());
        pacer.run_due(Duration::from_millis(515));
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[test]
    fn test_preprocessing_error_halts_stream() {
        let sink = Arc::new(RecordingSink::default());
        let format = PcmFormat {
            bit_depth: 20,
            endian: Endian::Little,
            ..PcmFormat::wire()
        };
        let (mut pacer, queue) = pacer(format, sink.clone());
        queue.try_push(frame()).unwrap();

        assert_eq!(pacer.run_due(Duration::from_millis(30)), PacerState::Halted);
        assert_eq!(*sink.errors.lock(), vec![StreamError::UnsupportedBitDepth(20)]);
        assert!(queue.is_closed());
        assert_eq!(queue.try_push(frame()), Err(StreamError::Closed));
        assert_eq!(pacer.run_due(Duration::from_millis(60)), PacerState::Halted);
        assert_eq!(sink.errors.lock().len(), 1);
    }

    #[test]
    fn test_finish_marks_last_frame() {
        let sink = Arc::new(RecordingSink::default());
        let (mut pacer, queue) = pacer(PcmFormat::wire(), sink.clone());
        queue.try_push(frame()).unwrap();
        queue.try_push(frame()).unwrap();
        queue.finish();

        assert_eq!(pacer.run_due(Duration::from_millis(50)), PacerState::Finished);
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].2);
        assert!(sent[1].2);
    }

    #[test]
    fn test_finish_on_empty_queue_sends_bare_terminator() {
        let sink = Arc::new(RecordingSink::default());
        let (mut pacer, queue) = pacer(PcmFormat::wire(), sink.clone());
        queue.finish();
        assert_eq!(pacer.run_due(FRAME), PacerState::Finished);
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1[0].is_empty());
        assert!(sent[0].2);
    }

    #[tokio::test]
    async fn test_queue_push_suspends_when_full() {
        let queue = Arc::new(FrameQueue::new(2));
        queue.push(frame()).await.unwrap();
        queue.push(frame()).await.unwrap();

        let q = queue.clone();
        let pending = tokio::spawn(async move { q.push(frame()).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert!(queue.pop().is_some());
        pending.await.unwrap().unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_forwards_every_frame() {
        let sink = Arc::new(RecordingSink::default());
        let mut input = VoiceInput::spawn(
            PcmFormat::wire(),
            5,
            encoder(),
            sink.clone(),
            Arc::new(TokioClock::new()),
            PacerSettings::default(),
        )
        .unwrap();

        // 15 frames in odd-sized writes, more than the queue holds
        let data = vec![0u8; frame().len() * 15];
        for chunk in data.chunks(700) {
            input.write(chunk).await.unwrap();
        }
        input.finish().await.unwrap();

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 15);
        let tags: Vec<u8> = sent.iter().map(|(_, frames, _)| frames[0][0]).collect();
        assert_eq!(tags, (1..=15).collect::<Vec<u8>>());
        assert!(sent.iter().all(|(target, _, _)| *target == 5));
        assert!(sent[14].2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_suspends_until_ticks_drain_queue() {
        let sink = Arc::new(RecordingSink::default());
        let clock = ManualClock::new();
        let mut input = VoiceInput::spawn(
            PcmFormat::wire(),
            0,
            encoder(),
            sink.clone(),
            Arc::new(clock.clone()),
            PacerSettings::default(),
        )
        .unwrap();

        // Two frames more than the queue holds, with the clock stopped
        let data = vec![0u8; frame().len() * (LOCAL_BUFFER_FRAMES + 2)];
        let writer = tokio::spawn(async move {
            let result = input.write(&data).await;
            (input, result)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!writer.is_finished());
        assert!(sink.sent.lock().is_empty());

        // Two ticks free the two slots the write is waiting on
        clock.advance(Duration::from_millis(20));
        let (input, result) = writer.await.unwrap();
        result.unwrap();
        assert_eq!(sink.sent.lock().len(), 2);
        assert_eq!(input.queued_frames(), LOCAL_BUFFER_FRAMES);

        clock.advance(Duration::from_millis(150));
        input.finish().await.unwrap();
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), LOCAL_BUFFER_FRAMES + 2);
        let tags: Vec<u8> = sent.iter().map(|(_, frames, _)| frames[0][0]).collect();
        assert_eq!(tags, (1..=12).collect::<Vec<u8>>());
        assert!(sent[11].2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_pads_partial_frame() {
        let sink = Arc::new(RecordingSink::default());
        let mut input = VoiceInput::spawn(
            PcmFormat::wire(),
            0,
            encoder(),
            sink.clone(),
            Arc::new(TokioClock::new()),
            PacerSettings::default(),
        )
        .unwrap();
        input.write(&[1, 0, 2, 0]).await.unwrap();
        input.finish().await.unwrap();

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        // Encoder saw one full wire frame
        assert_eq!(sent[0].1[0][1], 480u16 as u8);
        assert!(sent[0].2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let mut input = VoiceInput::spawn(
            PcmFormat::wire(),
            0,
            encoder(),
            sink,
            Arc::new(TokioClock::new()),
            PacerSettings::default(),
        )
        .unwrap();
        input.close();
        input.close();
        assert_eq!(input.write(&[0; 4]).await, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_handle_stops_stream() {
        let sink = Arc::new(RecordingSink::default());
        let mut input = VoiceInput::spawn(
            PcmFormat::wire(),
            0,
            encoder(),
            sink,
            Arc::new(TokioClock::new()),
            PacerSettings::default(),
        )
        .unwrap();
        let handle = input.handle();
        assert!(handle.is_live());

        handle.stop();
        assert!(!handle.is_live());
        assert_eq!(input.write(&[0; 4]).await, Err(StreamError::Closed));
        drop(input);
        handle.stop();
    }
}
