//! Client connection
//!
//! Owns the transport, the dispatcher task, the mixing and ping timers and
//! the single outbound sequence counter every voice input shares.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::dispatcher::{BootstrapChecklist, Dispatcher};
use super::events::{Event, EventHub, EventKind};
use super::transport::FrameTransport;
use crate::audio::clock::{Clock, TokioClock};
use crate::audio::format::PcmFormat;
use crate::audio::mixer::{MixingEngine, TalkState};
use crate::audio::pacer::{InputHandle, VoiceInput, VoiceSink};
use crate::codec::CodecProvider;
use crate::config::ClientConfig;
use crate::constants::MAX_VOICE_TARGET;
use crate::error::{Error, PacketError, Result, StreamError, TransportError};
use crate::protocol::voice::{encode_tunnel_frame, CodecFamily, VoiceCodec};
use crate::protocol::{ControlMessage, MessageType, SchemaCodec};

/// Protocol version advertised in `Version` (1.2.4)
const PROTOCOL_VERSION: u32 = 1 << 16 | 2 << 8 | 4;

/// State shared by the connection handle and its tasks
pub(crate) struct Shared {
    pub(crate) transport: FrameTransport,
    pub(crate) schema: Arc<dyn SchemaCodec>,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) engine: Mutex<MixingEngine>,
    codecs: Arc<dyn CodecProvider>,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    sequence: AtomicU64,
    session: Mutex<Option<u32>>,
    codec: Mutex<VoiceCodec>,
    ready: watch::Sender<bool>,
    finished: watch::Sender<bool>,
    fatal: Mutex<Option<Error>>,
    disconnected: AtomicBool,
    timers: Mutex<Vec<JoinHandle<()>>>,
    inputs: Mutex<Vec<InputHandle>>,
}

impl Shared {
    pub(crate) fn frame_duration(&self) -> Duration {
        self.config.frame_duration()
    }

    pub(crate) fn set_session(&self, session: u32) {
        *self.session.lock() = Some(session);
    }

    pub(crate) fn set_codec(&self, codec: VoiceCodec) {
        *self.codec.lock() = codec;
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.send_replace(true);
        self.hub.emit(EventKind::Ready, Event::Ready);
    }

    fn send_message(&self, message_type: MessageType, body: Value) -> Result<()> {
        let payload = self.schema.encode(message_type, &body)?;
        self.transport.write_frame(message_type.id(), &payload)?;
        trace!(message_type = %message_type, bytes = payload.len(), "Sent message");

        if self.hub.has_listeners(EventKind::ProtocolOut) {
            self.hub.emit(
                EventKind::ProtocolOut,
                Event::ProtocolOut {
                    name: message_type.event_name(),
                    message: ControlMessage::new(message_type, body),
                },
            );
        }
        Ok(())
    }

    /// Stop timers and inputs, close the transport, release speakers
    fn shutdown(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disconnecting");

        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        for input in self.inputs.lock().drain(..) {
            input.stop();
        }
        self.transport.end();
        self.engine.lock().clear();

        self.hub.emit(EventKind::Disconnected, Event::Disconnected);
        self.hub.clear();
        self.finished.send_replace(true);
    }
}

impl VoiceSink for Shared {
    fn send_frames(
        &self,
        codec: VoiceCodec,
        target: u8,
        frames: &[Bytes],
        terminator: bool,
    ) -> std::result::Result<(), PacketError> {
        match codec.family() {
            CodecFamily::A => {
                let sequence = self.sequence.fetch_add(frames.len() as u64, Ordering::SeqCst);
                let frame = encode_tunnel_frame(codec, target, sequence, frames, false)?;
                self.transport.write(frame);
            }
            CodecFamily::B => {
                let last = frames.len().saturating_sub(1);
                for (i, payload) in frames.iter().enumerate() {
                    let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                    let frame = encode_tunnel_frame(
                        codec,
                        target,
                        sequence,
                        std::slice::from_ref(payload),
                        terminator && i == last,
                    )?;
                    self.transport.write(frame);
                }
            }
        }
        Ok(())
    }

    fn skip_sequence(&self, frames: u64) {
        self.sequence.fetch_add(frames, Ordering::SeqCst);
    }

    fn stream_error(&self, target: u8, error: StreamError) {
        self.hub
            .emit(EventKind::StreamError, Event::StreamError { target, error });
    }
}

/// A client connection over one reliable byte stream
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start a connection; must be called inside a tokio runtime
    ///
    /// The read loop, mixing tick and keep-alive ping start immediately.
    /// Fails if `config` does not validate.
    pub fn new<S>(
        stream: S,
        config: ClientConfig,
        schema: Arc<dyn SchemaCodec>,
        codecs: Arc<dyn CodecProvider>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_clock(stream, config, schema, codecs, Arc::new(TokioClock::new()))
    }

    /// Start a connection driven by a specific clock
    pub fn with_clock<S>(
        stream: S,
        config: ClientConfig,
        schema: Arc<dyn SchemaCodec>,
        codecs: Arc<dyn CodecProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let hub = Arc::new(EventHub::new());
        let engine = MixingEngine::new(codecs.clone(), hub.clone(), config.mixer_settings(), clock.now());
        let checklist = BootstrapChecklist::new(config.bootstrap_types());
        let (ready, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            transport: FrameTransport::new(stream),
            schema,
            hub,
            engine: Mutex::new(engine),
            codecs,
            clock,
            config,
            sequence: AtomicU64::new(0),
            session: Mutex::new(None),
            codec: Mutex::new(VoiceCodec::Opus),
            ready,
            finished,
            fatal: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            timers: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
        });

        let dispatcher = Dispatcher::new(shared.clone(), checklist);
        let task_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run().await {
                error!("Connection failed: {}", e);
                *task_shared.fatal.lock() = Some(e);
            }
            task_shared.shutdown();
        });

        let mixing = tokio::spawn(mix_loop(shared.clone()));
        let ping = tokio::spawn(ping_loop(shared.clone()));
        shared.timers.lock().extend([mixing, ping]);

        debug!("Connection started");
        Ok(Self { shared })
    }

    /// Send `Version`
    pub fn initialize(&self) -> Result<()> {
        self.send_message(
            MessageType::Version,
            json!({
                "version": PROTOCOL_VERSION,
                "release": self.shared.config.connection.release,
                "os": std::env::consts::OS,
                "os_version": std::env::consts::ARCH,
            }),
        )
    }

    /// Send `Authenticate`, advertising Opus support
    pub fn authenticate(&self, username: &str, password: Option<&str>, tokens: &[String]) -> Result<()> {
        let mut body = json!({
            "username": username,
            "tokens": tokens,
            "opus": true,
        });
        if let Some(password) = password {
            body["password"] = Value::from(password);
        }
        self.send_message(MessageType::Authenticate, body)
    }

    /// Encode and send a structured message
    pub fn send_message(&self, message_type: MessageType, body: Value) -> Result<()> {
        self.shared.send_message(message_type, body)
    }

    /// Send already encoded sub-frames on the shared sequence counter
    pub fn send_encoded(&self, codec: VoiceCodec, target: u8, frames: &[Bytes], terminator: bool) -> Result<()> {
        self.shared.send_frames(codec, target, frames, terminator)?;
        Ok(())
    }

    /// Open a paced outbound voice stream
    ///
    /// `target` 0 talks normally, 1..=30 select a whisper slot and 31 asks
    /// the server to loop the audio back.
    pub fn input_stream(&self, format: PcmFormat, target: u8) -> Result<VoiceInput> {
        if target > MAX_VOICE_TARGET {
            return Err(PacketError::InvalidTarget(target).into());
        }
        if self.is_disconnected() {
            return Err(StreamError::Closed.into());
        }

        let codec = self.codec();
        let encoder = self.shared.codecs.encoder(codec)?;
        let sink: Arc<dyn VoiceSink> = self.shared.clone();
        let input = VoiceInput::spawn(
            format,
            target,
            encoder,
            sink,
            self.shared.clock.clone(),
            self.shared.config.pacer_settings(),
        )?;

        let mut inputs = self.shared.inputs.lock();
        inputs.retain(|handle| handle.is_live());
        inputs.push(input.handle());
        Ok(input)
    }

    pub fn subscribe(&self, kind: EventKind) -> mpsc::UnboundedReceiver<Event> {
        self.shared.hub.subscribe(kind)
    }

    /// Wait for the bootstrap checklist to complete
    pub async fn ready(&self) -> Result<()> {
        let mut ready = self.shared.ready.subscribe();
        let mut finished = self.shared.finished.subscribe();
        tokio::select! {
            result = ready.wait_for(|r| *r) => {
                result.map(|_| ()).map_err(|_| Error::from(TransportError::Closed))
            }
            _ = finished.wait_for(|f| *f) => {
                if *self.shared.ready.borrow() {
                    Ok(())
                } else {
                    Err(TransportError::Closed.into())
                }
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    /// Session id assigned by `ServerSync`
    pub fn session(&self) -> Option<u32> {
        *self.shared.session.lock()
    }

    /// Codec outbound streams will be opened with
    pub fn codec(&self) -> VoiceCodec {
        *self.shared.codec.lock()
    }

    pub fn talk_state(&self, session: u32) -> Option<TalkState> {
        self.shared.engine.lock().talk_state(session)
    }

    /// Stop everything and close the transport. Idempotent.
    pub fn disconnect(&self) {
        self.shared.shutdown();
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::SeqCst)
    }

    /// Wait for the connection to end
    ///
    /// Returns the fatal error that ended it, if any.
    pub async fn closed(&self) -> Result<()> {
        let mut finished = self.shared.finished.subscribe();
        let _ = finished.wait_for(|f| *f).await;
        match self.shared.fatal.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

async fn mix_loop(shared: Arc<Shared>) {
    loop {
        let wait = {
            let now = shared.clock.now();
            let mut engine = shared.engine.lock();
            engine.run_due(now);
            engine.until_next(now)
        };
        tokio::time::sleep(wait).await;
    }
}

async fn ping_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.ping_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let timestamp = chrono::Utc::now().timestamp_millis();
        if let Err(e) = shared.send_message(MessageType::Ping, json!({ "timestamp": timestamp })) {
            error!("Ping failed: {}", e);
            break;
        }
    }
}
