//! Frame transport over an ordered byte stream
//!
//! Reads are strictly FIFO: a `read(n)` request is queued and resolved once
//! `n` bytes have accumulated, regardless of how the stream fragmented them.
//! Writes go straight to the stream and are silently dropped once it closed.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::protocol::encode_frame;

const READ_CHUNK: usize = 8 * 1024;

/// Handle to a queued read; resolves with exactly the requested bytes
pub type ReadHandle = oneshot::Receiver<Bytes>;

struct PendingRead {
    length: usize,
    reply: oneshot::Sender<Bytes>,
}

/// Byte-accurate streaming reassembler
///
/// Fragments go in through [`receive`](Self::receive); queued reads are
/// resolved in order as soon as enough bytes are buffered. Any over-read
/// remainder stays at the front of the fragment queue.
#[derive(Default)]
pub struct Reassembler {
    buffers: VecDeque<Bytes>,
    readers: VecDeque<PendingRead>,
    length: usize,
    closed: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment from the stream
    pub fn receive(&mut self, data: Bytes) {
        if data.is_empty() || self.closed {
            return;
        }
        self.length += data.len();
        self.buffers.push_back(data);
        self.check_readers();
    }

    /// Queue a read of `length` bytes
    ///
    /// The handle errors if the stream closes before the read completes.
    pub fn read(&mut self, length: usize) -> ReadHandle {
        let (reply, handle) = oneshot::channel();
        if self.closed {
            return handle;
        }
        self.readers.push_back(PendingRead { length, reply });
        // Only the head reader can be satisfied; anyone queued behind it
        // waits for the head to complete first.
        if self.readers.len() == 1 {
            self.check_readers();
        }
        handle
    }

    fn check_readers(&mut self) {
        while let Some(head) = self.readers.front() {
            if self.length < head.length {
                break;
            }
            let Some(reader) = self.readers.pop_front() else {
                break;
            };
            let data = self.take(reader.length);
            if reader.reply.send(data).is_err() {
                trace!(length = reader.length, "Read handle dropped before completion");
            }
        }
    }

    fn take(&mut self, length: usize) -> Bytes {
        if length == 0 {
            return Bytes::new();
        }

        // Single fragment covering the whole read: slice without copying
        if let Some(front) = self.buffers.front_mut() {
            if front.len() >= length {
                let data = front.split_to(length);
                if front.is_empty() {
                    self.buffers.pop_front();
                }
                self.length -= length;
                return data;
            }
        }

        let mut out = BytesMut::with_capacity(length);
        while out.len() < length {
            let Some(mut front) = self.buffers.pop_front() else {
                break;
            };
            let needed = length - out.len();
            if front.len() > needed {
                let rest = front.split_off(needed);
                self.buffers.push_front(rest);
            }
            out.extend_from_slice(&front);
        }
        self.length -= out.len();
        out.freeze()
    }

    /// Drop every pending read and refuse new data
    pub fn close(&mut self) {
        self.closed = true;
        self.readers.clear();
        self.buffers.clear();
        self.length = 0;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes buffered but not yet read
    pub fn buffered(&self) -> usize {
        self.length
    }

    pub fn pending_reads(&self) -> usize {
        self.readers.len()
    }
}

enum Outbound {
    Data(Bytes),
    Close,
}

/// Record transport over any async byte stream
///
/// A pump task feeds inbound bytes into the [`Reassembler`]; a writer task
/// drains an outbound queue so `write` never blocks the caller.
pub struct FrameTransport {
    reassembler: Arc<Mutex<Reassembler>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<watch::Sender<bool>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl FrameTransport {
    /// Wrap a bidirectional stream; must be called inside a tokio runtime
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer)
    }

    /// Wrap separate read and write halves
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reassembler = Arc::new(Mutex::new(Reassembler::new()));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let (outbound, rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(pump(reader, reassembler.clone(), closed.clone()));
        tokio::spawn(write_loop(writer, rx, reassembler.clone(), closed.clone()));

        Self {
            reassembler,
            outbound,
            closed,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Queue a read of exactly `length` bytes
    ///
    /// The read is registered immediately, so calling this before awaiting a
    /// previous handle keeps FIFO order.
    pub fn read(&self, length: usize) -> ReadHandle {
        self.reassembler.lock().read(length)
    }

    /// Read exactly `length` bytes
    pub async fn read_exact(&self, length: usize) -> Result<Bytes, TransportError> {
        self.read(length).await.map_err(|_| TransportError::Closed)
    }

    /// Forward bytes to the stream; dropped silently once closed
    pub fn write(&self, data: Bytes) {
        if self.is_closed() {
            trace!(bytes = data.len(), "Dropping write on closed transport");
            return;
        }
        if self.outbound.send(Outbound::Data(data)).is_err() {
            trace!("Writer task gone, dropping write");
        }
    }

    /// Write one complete record: prefix and payload in a single write
    pub fn write_frame(&self, type_id: u16, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(type_id, payload)?;
        self.write(frame);
        Ok(())
    }

    /// Close the stream
    ///
    /// Writes queued before the call are flushed first. Idempotent.
    pub fn end(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!("Closing frame transport");
        let _ = self.outbound.send(Outbound::Close);
        self.reassembler.lock().close();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the stream closed, from either side
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.end();
    }
}

async fn pump<R>(mut reader: R, reassembler: Arc<Mutex<Reassembler>>, closed: Arc<watch::Sender<bool>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Stream reached end of file");
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "Received fragment");
                let chunk = buf.split().freeze();
                reassembler.lock().receive(chunk);
            }
            Err(e) => {
                warn!("Stream read failed: {}", e);
                break;
            }
        }
    }
    reassembler.lock().close();
    closed.send_replace(true);
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    reassembler: Arc<Mutex<Reassembler>>,
    closed: Arc<watch::Sender<bool>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        match message {
            Outbound::Data(data) => {
                if let Err(e) = writer.write_all(&data).await {
                    warn!("Stream write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    reassembler.lock().close();
    closed.send_replace(true);
}
