//! Stateful connection handlers.
//!
//! A [`Connection`] is the I/O-side view of one live client connection. It
//! owns a single-slot outbound buffer (the [`Transport`] handlers write to)
//! and an attach slot holding at most one [`ConnectionHandler`]. The async
//! driver in [`crate::io`] feeds transport events into [`Connection::dispatch`]
//! and flushes whatever the handler wrote.
//!
//! Only the connection's own I/O task ever touches the transport. Other tasks
//! talk to a handler through its queues and wake the I/O task with a
//! [`PollHandle`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;

/// Fixed transmission unit for all chunked output paths.
pub const XFER_CHUNK_SIZE: usize = 1024;

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport events delivered to the attached handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// Data received from the peer.
    Recv(Bytes),
    /// The transport finished sending this many bytes of previously written chunks.
    Sent(usize),
    /// A poll was requested, or the connection was just attached.
    Poll,
    /// The connection is going away.
    Close,
}

/// What the handler wants done after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep the handler attached.
    Continue,
    /// The handler's work is complete and it is detached. With `keep_alive`
    /// the connection stays open for the next request, otherwise it closes
    /// once pending output is flushed.
    Finished { keep_alive: bool },
}

/// One unit of outbound data. `fin` marks the last chunk of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    pub fin: bool,
}

/// The write side a handler sees.
pub trait Transport {
    /// Hand a chunk to the transport. Returns `false` when the transport
    /// cannot take it right now; the chunk is not consumed and the handler
    /// retries on its next send-ready event.
    fn write(&mut self, chunk: Chunk) -> bool;
}

/// Single-slot outbound buffer: one chunk in flight at a time.
#[derive(Debug, Default)]
pub struct Outbound {
    slot: Option<Chunk>,
}

impl Outbound {
    pub fn take(&mut self) -> Option<Chunk> {
        self.slot.take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

impl Transport for Outbound {
    fn write(&mut self, chunk: Chunk) -> bool {
        if self.slot.is_some() {
            return false;
        }
        self.slot = Some(chunk);
        true
    }
}

/// Stateful behavior bound to one connection.
///
/// `handle_event` runs on the connection's I/O task before any default
/// handling. A [`ConnEvent::Close`] is always the last event a handler sees;
/// it is detached right after, whatever it returns.
pub trait ConnectionHandler: Send {
    fn handle_event(&mut self, event: ConnEvent, tx: &mut dyn Transport) -> Outcome;
}

/// Wake primitive used to ask a connection's I/O task for another cycle.
///
/// Backed by [`Notify`]: a request made while the I/O task is busy is stored
/// and consumed by its next wait, so wakeups are never lost.
#[derive(Debug, Clone, Default)]
pub struct PollHandle(Arc<Notify>);

impl PollHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_poll(&self) {
        self.0.notify_one();
    }

    /// Wait for the next poll request.
    pub async fn polled(&self) {
        self.0.notified().await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {0} already has a handler attached")]
    HandlerAttached(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    /// Flush pending output, then close.
    Closing,
    Closed,
}

/// I/O-side state of one live connection.
pub struct Connection {
    id: ConnectionId,
    outbound: Outbound,
    handler: Option<Box<dyn ConnectionHandler>>,
    poll: PollHandle,
    state: ConnState,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("attached", &self.handler.is_some())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: ConnectionId::generate(),
            outbound: Outbound::default(),
            handler: None,
            poll: PollHandle::new(),
            state: ConnState::Open,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// A handle other tasks can use to request a poll of this connection.
    pub fn poll_handle(&self) -> PollHandle {
        self.poll.clone()
    }

    /// Install `handler` as this connection's sole handler.
    ///
    /// Requests an initial poll so the handler gets its first send-ready
    /// cycle without waiting for an external event.
    pub fn attach(&mut self, handler: Box<dyn ConnectionHandler>) -> Result<(), ConnectionError> {
        if self.state != ConnState::Open {
            return Err(ConnectionError::Closed(self.id));
        }
        if self.handler.is_some() {
            return Err(ConnectionError::HandlerAttached(self.id));
        }
        self.handler = Some(handler);
        self.poll.request_poll();
        tracing::trace!(conn = %self.id, "handler attached");
        Ok(())
    }

    /// Remove the attached handler without notifying it.
    pub fn detach(&mut self) -> Option<Box<dyn ConnectionHandler>> {
        let handler = self.handler.take();
        if handler.is_some() {
            tracing::trace!(conn = %self.id, "handler detached");
        }
        handler
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Deliver `event` to the attached handler.
    ///
    /// Returns `false` when no handler took the event (none attached, or the
    /// connection is already closed), leaving default handling to the caller.
    pub fn dispatch(&mut self, event: ConnEvent) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        let closing = matches!(event, ConnEvent::Close);
        let Some(handler) = self.handler.as_mut() else {
            if closing {
                self.state = ConnState::Closed;
            }
            return false;
        };

        let outcome = handler.handle_event(event, &mut self.outbound);

        if closing {
            self.detach();
            self.state = ConnState::Closed;
            return true;
        }
        if let Outcome::Finished { keep_alive } = outcome {
            self.detach();
            if !keep_alive {
                self.state = ConnState::Closing;
            }
        }
        true
    }

    /// Next chunk to put on the wire.
    pub fn take_outbound(&mut self) -> Option<Chunk> {
        self.outbound.take()
    }

    /// True once the connection should be closed after flushing.
    pub fn is_closing(&self) -> bool {
        self.state != ConnState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Close the connection: the handler (if any) receives [`ConnEvent::Close`]
    /// and is detached, and pending output is discarded.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.dispatch(ConnEvent::Close);
        self.state = ConnState::Closed;
        self.outbound.take();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
