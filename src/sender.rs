//! Chunked payload senders.
//!
//! A [`ChunkedSender`] writes an in-memory payload in [`XFER_CHUNK_SIZE`]
//! pieces, one per send-ready event, then finishes. Two flavors:
//!
//! - [`DataSender`]: a caller-owned buffer (e.g. an embedded asset) shared
//!   as [`Bytes`]; chunks are slices of it, and the caller's copy stays
//!   valid after transmission.
//! - [`StringSender`]: an owned `String`, released when the sender is
//!   dropped after the last byte went out.

use std::ops::Range;

use bytes::Bytes;

use crate::connection::{Chunk, ConnEvent, ConnectionHandler, Outcome, Transport, XFER_CHUNK_SIZE};

/// A payload a [`ChunkedSender`] can cut into chunks.
pub trait ChunkSource: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn chunk(&self, range: Range<usize>) -> Bytes;
}

impl ChunkSource for Bytes {
    fn len(&self) -> usize {
        Bytes::len(self)
    }

    fn chunk(&self, range: Range<usize>) -> Bytes {
        self.slice(range)
    }
}

impl ChunkSource for String {
    fn len(&self) -> usize {
        String::len(self)
    }

    fn chunk(&self, range: Range<usize>) -> Bytes {
        Bytes::copy_from_slice(&self.as_bytes()[range])
    }
}

pub struct ChunkedSender<B> {
    payload: B,
    sent: usize,
    keep_alive: bool,
}

/// Sender over a caller-owned buffer.
pub type DataSender = ChunkedSender<Bytes>;

/// Sender owning its string payload.
pub type StringSender = ChunkedSender<String>;

impl<B: ChunkSource> ChunkedSender<B> {
    pub fn new(payload: B, keep_alive: bool) -> Self {
        Self {
            payload,
            sent: 0,
            keep_alive,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Write the next chunk, or finish if everything has been written.
    fn send_next(&mut self, tx: &mut dyn Transport) -> Outcome {
        let len = self.payload.len();
        if self.sent >= len {
            return Outcome::Finished { keep_alive: self.keep_alive };
        }
        let end = (self.sent + XFER_CHUNK_SIZE).min(len);
        let chunk = Chunk {
            data: self.payload.chunk(self.sent..end),
            fin: end == len,
        };
        if !tx.write(chunk) {
            // Deferred: retried on the next send-ready event.
            return Outcome::Continue;
        }
        self.sent = end;
        if self.sent == len {
            Outcome::Finished { keep_alive: self.keep_alive }
        } else {
            Outcome::Continue
        }
    }
}

impl<B: ChunkSource> ConnectionHandler for ChunkedSender<B> {
    fn handle_event(&mut self, event: ConnEvent, tx: &mut dyn Transport) -> Outcome {
        match event {
            ConnEvent::Poll | ConnEvent::Sent(_) => self.send_next(tx),
            ConnEvent::Recv(_) => Outcome::Continue,
            ConnEvent::Close => {
                if self.sent < self.len() {
                    tracing::debug!(
                        sent = self.sent,
                        size = self.len(),
                        "connection closed before payload was fully sent"
                    );
                }
                Outcome::Finished { keep_alive: false }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    /// Drive a sender to completion, acknowledging every chunk.
    fn drain(conn: &mut Connection) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        conn.dispatch(ConnEvent::Poll);
        while let Some(chunk) = conn.take_outbound() {
            let n = chunk.data.len();
            chunks.push(chunk);
            conn.dispatch(ConnEvent::Sent(n));
        }
        chunks
    }

    fn payload(len: usize) -> String {
        (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect()
    }

    #[test]
    fn chunk_count_matches_ceiling_division() {
        for len in [0, 1, 1023, 1024, 1025, 4096, 5000] {
            let text = payload(len);
            let mut conn = Connection::new();
            conn.attach(Box::new(StringSender::new(text.clone(), true))).unwrap();
            let chunks = drain(&mut conn);

            assert_eq!(chunks.len(), len.div_ceil(XFER_CHUNK_SIZE), "len {len}");
            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
            assert_eq!(joined, text.as_bytes());
            assert!(!conn.has_handler());
        }
    }

    #[test]
    fn only_last_chunk_is_final() {
        let mut conn = Connection::new();
        conn.attach(Box::new(StringSender::new(payload(2500), true))).unwrap();
        let chunks = drain(&mut conn);
        let fins: Vec<bool> = chunks.iter().map(|c| c.fin).collect();
        assert_eq!(fins, vec![false, false, true]);
    }

    #[test]
    fn keep_alive_leaves_connection_open() {
        let mut conn = Connection::new();
        conn.attach(Box::new(DataSender::new(Bytes::from_static(b"hello"), true))).unwrap();
        drain(&mut conn);
        assert!(!conn.is_closing());
    }

    #[test]
    fn without_keep_alive_connection_closes() {
        let mut conn = Connection::new();
        conn.attach(Box::new(DataSender::new(Bytes::from_static(b"hello"), false))).unwrap();
        drain(&mut conn);
        assert!(conn.is_closing());
    }

    #[test]
    fn deferred_write_is_retried_without_loss() {
        let mut sender = StringSender::new(payload(2048), true);
        let mut out = crate::connection::Outbound::default();

        assert_eq!(sender.handle_event(ConnEvent::Poll, &mut out), Outcome::Continue);
        assert_eq!(sender.sent(), 1024);
        // Slot still occupied: the second chunk is deferred, offset unchanged.
        assert_eq!(sender.handle_event(ConnEvent::Poll, &mut out), Outcome::Continue);
        assert_eq!(sender.sent(), 1024);

        let first = out.take().unwrap();
        assert_eq!(
            sender.handle_event(ConnEvent::Sent(first.data.len()), &mut out),
            Outcome::Finished { keep_alive: true }
        );
        let second = out.take().unwrap();
        assert_eq!(second.data.len(), 1024);
        assert_eq!(&second.data[..], &payload(2048).as_bytes()[1024..]);
    }

    #[test]
    fn close_mid_transfer_finishes() {
        let mut sender = StringSender::new(payload(3000), true);
        let mut out = crate::connection::Outbound::default();
        sender.handle_event(ConnEvent::Poll, &mut out);
        assert_eq!(
            sender.handle_event(ConnEvent::Close, &mut out),
            Outcome::Finished { keep_alive: false }
        );
    }

    #[test]
    fn data_chunks_share_the_callers_buffer() {
        let payload = Bytes::from(payload(2500).into_bytes());
        let base = payload.as_ptr() as usize;
        let mut conn = Connection::new();
        conn.attach(Box::new(DataSender::new(payload.clone(), true))).unwrap();
        let chunks = drain(&mut conn);

        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.data.as_ptr() as usize, base + i * XFER_CHUNK_SIZE);
        }
        assert_eq!(payload.len(), 2500);
    }
}
