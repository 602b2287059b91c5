//! Network subsystem: framed transport, inbound dispatch and the client connection

pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod transport;

pub use connection::Connection;
pub use dispatcher::{BootstrapChecklist, ReadState};
pub use events::{Event, EventHub, EventKind};
pub use transport::{FrameTransport, Reassembler};
