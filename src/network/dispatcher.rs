//! Inbound record dispatch
//!
//! The read loop is an explicit state machine: wait for the 6-byte prefix,
//! wait for the payload, dispatch. The next prefix read is queued before the
//! payload is handled so backlogged records keep flowing.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use super::connection::Shared;
use super::events::{Event, EventKind};
use super::transport::ReadHandle;
use crate::constants::FRAME_PREFIX_LEN;
use crate::error::{Error, Result, ServerRejection};
use crate::protocol::voice::{decode_packet, VoiceCodec};
use crate::protocol::{ControlMessage, FramePrefix, MessageType};

/// Where the read loop stands
pub enum ReadState {
    WaitingForPrefix(ReadHandle),
    WaitingForPayload {
        prefix: FramePrefix,
        read: ReadHandle,
    },
    Dispatching {
        prefix: FramePrefix,
        payload: Bytes,
        next: ReadHandle,
    },
}

/// Message types that must arrive before the connection is ready
///
/// Completes at most once.
#[derive(Debug, Clone)]
pub struct BootstrapChecklist {
    pending: Vec<MessageType>,
    done: bool,
}

impl BootstrapChecklist {
    pub fn new(required: Vec<MessageType>) -> Self {
        Self {
            pending: required,
            done: false,
        }
    }

    /// Tick off `message_type`; true exactly once, when the list empties
    pub fn observe(&mut self, message_type: MessageType) -> bool {
        if self.done {
            return false;
        }
        self.pending.retain(|t| *t != message_type);
        if self.pending.is_empty() {
            self.done = true;
            return true;
        }
        trace!(pending = ?self.pending, "Bootstrap pending");
        false
    }

    pub fn pending(&self) -> &[MessageType] {
        &self.pending
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    checklist: BootstrapChecklist,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, checklist: BootstrapChecklist) -> Self {
        Self { shared, checklist }
    }

    /// Run until the transport closes or a fatal error occurs
    pub(crate) async fn run(mut self) -> Result<()> {
        let shared = self.shared.clone();
        let transport = &shared.transport;
        let mut state = ReadState::WaitingForPrefix(transport.read(FRAME_PREFIX_LEN));

        loop {
            state = match state {
                ReadState::WaitingForPrefix(read) => {
                    let Ok(bytes) = read.await else {
                        break;
                    };
                    let mut raw = [0u8; FRAME_PREFIX_LEN];
                    raw.copy_from_slice(&bytes);
                    let prefix = FramePrefix::parse(&raw);
                    ReadState::WaitingForPayload {
                        prefix,
                        read: transport.read(prefix.length as usize),
                    }
                }
                ReadState::WaitingForPayload { prefix, read } => {
                    let Ok(payload) = read.await else {
                        break;
                    };
                    ReadState::Dispatching {
                        prefix,
                        payload,
                        next: transport.read(FRAME_PREFIX_LEN),
                    }
                }
                ReadState::Dispatching { prefix, payload, next } => {
                    self.dispatch(prefix, payload)?;
                    ReadState::WaitingForPrefix(next)
                }
            };
        }

        debug!("Read loop ended");
        Ok(())
    }

    fn dispatch(&mut self, prefix: FramePrefix, payload: Bytes) -> Result<()> {
        let Some(message_type) = MessageType::from_id(prefix.type_id) else {
            trace!(type_id = prefix.type_id, length = prefix.length, "Unknown message type");
            return Ok(());
        };

        let hub = &self.shared.hub;
        hub.emit(
            EventKind::Observed,
            Event::Observed {
                message_type,
                raw: payload.clone(),
            },
        );

        if message_type == MessageType::UdpTunnel {
            self.voice(payload);
            return Ok(());
        }

        let body = match self.shared.schema.decode(message_type, &payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(message_type = %message_type, "Failed to decode message: {}", e);
                return Ok(());
            }
        };
        let message = ControlMessage::new(message_type, body);

        hub.emit(
            EventKind::ProtocolIn,
            Event::ProtocolIn {
                name: message_type.event_name(),
                message: message.clone(),
            },
        );

        self.handle(&message)?;
        hub.emit(EventKind::Message(message_type), Event::Message(message));

        if self.checklist.observe(message_type) {
            info!("Connection ready");
            self.shared.mark_ready();
        }
        Ok(())
    }

    fn handle(&self, message: &ControlMessage) -> Result<()> {
        match message.message_type {
            MessageType::Reject => self.reject(message),
            MessageType::ServerSync => {
                if let Some(session) = message.u32_field("session") {
                    debug!(session, "Server assigned local session");
                    self.shared.set_session(session);
                }
                Ok(())
            }
            MessageType::UserState => {
                if let Some(session) = message.u32_field("session") {
                    self.shared.engine.lock().add_speaker(session);
                }
                Ok(())
            }
            MessageType::UserRemove => {
                if let Some(session) = message.u32_field("session") {
                    self.shared.engine.lock().remove_speaker(session);
                }
                Ok(())
            }
            MessageType::CodecVersion => {
                let codec = if message.bool_field("opus").unwrap_or(false) {
                    VoiceCodec::Opus
                } else {
                    VoiceCodec::CeltAlpha
                };
                debug!(%codec, "Outbound codec negotiated");
                self.shared.set_codec(codec);
                Ok(())
            }
            MessageType::Ping => Ok(()),
            other => {
                trace!(message_type = %other, body = %message.body, "No handler");
                Ok(())
            }
        }
    }

    /// A rejection must be observed; with no error listener it is fatal
    fn reject(&self, message: &ControlMessage) -> Result<()> {
        let hub = &self.shared.hub;
        let rejection = ServerRejection::new(message.message_type, message.body.clone());
        let specific = EventKind::ErrorFor(message.message_type);

        if !hub.has_listeners(specific) && !hub.has_listeners(EventKind::Error) {
            error!("{} with no error listener", rejection);
            return Err(Error::UnobservedRejection(rejection));
        }

        warn!("{}", rejection);
        hub.emit(specific, Event::Error(rejection.clone()));
        hub.emit(EventKind::Error, Event::Error(rejection));
        Ok(())
    }

    fn voice(&self, payload: Bytes) {
        let packet = match decode_packet(&payload, self.shared.frame_duration()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed voice packet: {}", e);
                return;
            }
        };
        trace!(
            session = packet.session,
            codec = %packet.codec,
            frames = packet.entries.len(),
            "Voice packet"
        );

        let hub = &self.shared.hub;
        if hub.has_listeners(EventKind::VoiceFrame) {
            for entry in &packet.entries {
                hub.emit(EventKind::VoiceFrame, Event::VoiceFrame(entry.clone()));
            }
        }
        self.shared.engine.lock().insert(packet.entries);
    }
}
