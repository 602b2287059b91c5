//! Enum-keyed event registry
//!
//! Subscribers get an unbounded receiver per [`EventKind`]. Dropping the
//! receiver deregisters it; closed senders are pruned on the next emit or
//! listener check.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{ServerRejection, StreamError};
use crate::protocol::voice::VoiceEntry;
use crate::protocol::{ControlMessage, MessageType};

/// What a subscriber listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Bootstrap checklist completed
    Ready,
    /// Every structured message of one type
    Message(MessageType),
    /// Every inbound record, audio included
    Observed,
    /// Every inbound structured message, tagged with its event name
    ProtocolIn,
    /// Every outbound structured message
    ProtocolOut,
    /// Encoded sub-frames as they leave the packet decoder
    VoiceFrame,
    /// Mixed output of all speakers
    Voice,
    /// Decoded output of one speaker session
    VoiceFrom(u32),
    VoiceStart,
    VoiceEnd,
    /// Any server rejection
    Error,
    /// Rejections reported by one message type
    ErrorFor(MessageType),
    /// Failures scoped to one outbound voice stream
    StreamError,
    Disconnected,
}

/// Delivered payloads
#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Message(ControlMessage),
    Observed {
        message_type: MessageType,
        raw: Bytes,
    },
    ProtocolIn {
        name: String,
        message: ControlMessage,
    },
    ProtocolOut {
        name: String,
        message: ControlMessage,
    },
    VoiceFrame(VoiceEntry),
    /// One mixed frame of wire-format PCM
    Voice {
        pcm: Vec<i16>,
    },
    SpeakerVoice {
        session: u32,
        pcm: Vec<i16>,
    },
    VoiceStart {
        session: u32,
    },
    VoiceEnd {
        session: u32,
    },
    Error(ServerRejection),
    StreamError {
        target: u8,
        error: StreamError,
    },
    Disconnected,
}

type Subscribers = HashMap<EventKind, Vec<mpsc::UnboundedSender<Event>>>;

/// Fan-out registry shared by the connection's tasks
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Subscribers>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().entry(kind).or_default().push(tx);
        rx
    }

    /// True if at least one live receiver listens to `kind`
    pub fn has_listeners(&self, kind: EventKind) -> bool {
        let mut subscribers = self.subscribers.lock();
        match subscribers.get_mut(&kind) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                !senders.is_empty()
            }
            None => false,
        }
    }

    /// Deliver to every listener of `kind`, returning how many received it
    pub fn emit(&self, kind: EventKind, event: Event) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(&kind) else {
            return 0;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    /// Drop every subscription, ending all receivers
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_only_matching_kind() {
        let hub = EventHub::new();
        let mut start = hub.subscribe(EventKind::VoiceStart);
        let mut end = hub.subscribe(EventKind::VoiceEnd);

        assert_eq!(hub.emit(EventKind::VoiceStart, Event::VoiceStart { session: 3 }), 1);
        assert!(matches!(start.try_recv(), Ok(Event::VoiceStart { session: 3 })));
        assert!(end.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_deregisters() {
        let hub = EventHub::new();
        let rx = hub.subscribe(EventKind::VoiceFrom(7));
        assert!(hub.has_listeners(EventKind::VoiceFrom(7)));
        assert!(!hub.has_listeners(EventKind::VoiceFrom(8)));

        drop(rx);
        assert!(!hub.has_listeners(EventKind::VoiceFrom(7)));
        assert_eq!(hub.emit(EventKind::VoiceFrom(7), Event::Disconnected), 0);
    }

    #[test]
    fn test_clear_ends_receivers() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe(EventKind::Disconnected);
        hub.emit(EventKind::Disconnected, Event::Disconnected);
        hub.clear();
        assert!(matches!(rx.try_recv(), Ok(Event::Disconnected)));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
