//! Command execution with output streamed back over an HTTP connection.
//!
//! A [`CommandStream`] runs its command on a blocking worker. The worker
//! writes into a [`StreamWriter`], which pushes output onto a bounded queue
//! and wakes the connection's I/O task. The I/O task drains the queue into
//! chunks of at most [`XFER_CHUNK_SIZE`] bytes, one chunk in flight at a
//! time.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::connection::{
    Chunk, ConnEvent, ConnectionHandler, Outcome, PollHandle, Transport, XFER_CHUNK_SIZE,
};
use crate::pty::{CommandRunner, PtyError};

/// Output size a command should aim for: a one-line answer.
pub const COMMAND_RESULT_MINIMAL: usize = 140;
/// Fits a text message.
pub const COMMAND_RESULT_SMS: usize = 160;
pub const COMMAND_RESULT_NORMAL: usize = 1024;
pub const COMMAND_RESULT_VERBOSE: usize = 65535;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("output stream closed: {0}")]
    Output(#[from] io::Error),

    #[error("command failed: {0}")]
    Failed(String),

    #[error("command worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A log line routed to a shell.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub level: tracing::Level,
    pub target: String,
    pub message: String,
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.level, self.target, self.message)
    }
}

/// Output side of a command session.
pub trait Shell: Send {
    /// Whether the shell talks to a human who can answer prompts.
    fn is_interactive(&self) -> bool;

    /// How much output the consumer wants, in bytes. Commands use it to
    /// pick between terse and detailed answers; it is not enforced.
    fn verbosity(&self) -> usize {
        COMMAND_RESULT_NORMAL
    }

    /// Completion candidates for `token`. `None` if completion is unsupported.
    fn complete(&self, _token: &str) -> Option<Vec<String>> {
        None
    }

    /// Write raw output. Fails once the consumer is gone.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Write `s` followed by a newline.
    fn puts(&mut self, s: &str) -> io::Result<()> {
        self.write_all(s.as_bytes())?;
        self.write_all(b"\n")
    }

    fn printf(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        match args.as_str() {
            Some(s) => self.write_all(s.as_bytes()),
            None => self.write_all(fmt::format(args).as_bytes()),
        }
    }

    fn log(&mut self, message: &LogMessage) -> io::Result<()> {
        self.puts(&message.to_string())
    }
}

/// Collects output in memory.
#[derive(Debug)]
pub struct BufferShell {
    output: Vec<u8>,
    verbosity: usize,
}

impl Default for BufferShell {
    fn default() -> Self {
        Self::with_verbosity(COMMAND_RESULT_NORMAL)
    }
}

impl BufferShell {
    pub fn with_verbosity(verbosity: usize) -> Self {
        Self {
            output: Vec::new(),
            verbosity,
        }
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn into_string(self) -> String {
        match String::from_utf8(self.output) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

impl Shell for BufferShell {
    fn is_interactive(&self) -> bool {
        false
    }

    fn verbosity(&self) -> usize {
        self.verbosity
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }
}

#[derive(Debug)]
enum StreamItem {
    Output(Bytes),
    End,
}

/// Worker-side writer of a [`CommandStream`].
///
/// Must only be used from a blocking thread: a full queue blocks the writer
/// until the I/O task drains it.
pub struct StreamWriter {
    tx: mpsc::Sender<StreamItem>,
    done: Arc<AtomicBool>,
    poll: PollHandle,
    verbosity: usize,
}

impl StreamWriter {
    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "command stream closed")
    }

    fn finish(self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if self.tx.blocking_send(StreamItem::End).is_ok() {
            self.poll.request_poll();
        }
    }
}

impl Shell for StreamWriter {
    fn is_interactive(&self) -> bool {
        false
    }

    fn verbosity(&self) -> usize {
        self.verbosity
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.done.load(Ordering::Acquire) {
            return Err(Self::closed());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self
            .tx
            .blocking_send(StreamItem::Output(Bytes::copy_from_slice(buf)))
            .is_err()
        {
            self.done.store(true, Ordering::Release);
            return Err(Self::closed());
        }
        self.poll.request_poll();
        Ok(buf.len())
    }
}

/// Connection handler streaming a command's output as the response body.
pub struct CommandStream {
    command: String,
    verbosity: usize,
    queue: mpsc::Receiver<StreamItem>,
    done: Arc<AtomicBool>,
    pending: BytesMut,
    ended: bool,
    sent: usize,
    ack: usize,
    keep_alive: bool,
}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("command", &self.command)
            .field("verbosity", &self.verbosity)
            .field("sent", &self.sent)
            .field("ack", &self.ack)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl CommandStream {
    /// Start `command` on a blocking worker. Must be called within a Tokio
    /// runtime. `poll` is the handle of the connection the stream will be
    /// attached to.
    pub fn spawn(
        command: impl Into<String>,
        verbosity: usize,
        runner: Arc<dyn CommandRunner>,
        poll: PollHandle,
        queue_capacity: usize,
        keep_alive: bool,
    ) -> Self {
        let command = command.into();
        let (tx, queue) = mpsc::channel(queue_capacity.max(1));
        let done = Arc::new(AtomicBool::new(false));
        let mut writer = StreamWriter {
            tx,
            done: done.clone(),
            poll,
            verbosity,
        };

        let worker_command = command.clone();
        tokio::task::spawn_blocking(move || {
            tracing::debug!(command = %worker_command, verbosity, "command started");
            if let Err(e) = runner.run(&worker_command, &mut writer) {
                tracing::warn!(command = %worker_command, error = %e, "command failed");
                let _ = writer.printf(format_args!("error: {e}\n"));
            }
            tracing::debug!(command = %worker_command, "command finished");
            writer.finish();
        });

        Self {
            command,
            verbosity,
            queue,
            done,
            pending: BytesMut::new(),
            ended: false,
            sent: 0,
            ack: 0,
            keep_alive,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn verbosity(&self) -> usize {
        self.verbosity
    }

    /// True once the stream was closed; the worker's writes fail from then on.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_interactive(&self) -> bool {
        false
    }

    /// Completion is not offered over HTTP.
    pub fn complete(&self, _token: &str) -> Option<Vec<String>> {
        None
    }

    /// Move queued output onto the transport.
    pub fn process_queue(&mut self, tx: &mut dyn Transport) -> Outcome {
        if self.ack < self.sent {
            return Outcome::Continue;
        }
        while !self.ended && self.pending.len() < XFER_CHUNK_SIZE {
            match self.queue.try_recv() {
                Ok(StreamItem::Output(data)) => self.pending.extend_from_slice(&data),
                Ok(StreamItem::End) => self.ended = true,
                Err(TryRecvError::Empty) => break,
                // Worker went away without signalling the end.
                Err(TryRecvError::Disconnected) => self.ended = true,
            }
        }

        if !self.pending.is_empty() {
            let n = self.pending.len().min(XFER_CHUNK_SIZE);
            let chunk = Chunk {
                data: Bytes::copy_from_slice(&self.pending[..n]),
                fin: false,
            };
            if tx.write(chunk) {
                self.pending.advance(n);
                self.sent += n;
            }
            return Outcome::Continue;
        }

        if self.ended {
            tracing::debug!(command = %self.command, sent = self.sent, "command output complete");
            return Outcome::Finished {
                keep_alive: self.keep_alive,
            };
        }
        Outcome::Continue
    }

    fn stop(&mut self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            tracing::debug!(command = %self.command, "command stream closed");
        }
        self.queue.close();
    }
}

impl ConnectionHandler for CommandStream {
    fn handle_event(&mut self, event: ConnEvent, tx: &mut dyn Transport) -> Outcome {
        match event {
            ConnEvent::Poll => self.process_queue(tx),
            ConnEvent::Sent(n) => {
                self.ack = (self.ack + n).min(self.sent);
                self.process_queue(tx)
            }
            ConnEvent::Recv(_) => Outcome::Continue,
            ConnEvent::Close => {
                self.stop();
                Outcome::Finished { keep_alive: false }
            }
        }
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `command` to completion and return everything it wrote.
pub async fn execute_command(
    runner: Arc<dyn CommandRunner>,
    command: &str,
    verbosity: usize,
) -> Result<String, CommandError> {
    let command = command.to_string();
    tokio::task::spawn_blocking(move || {
        let mut shell = BufferShell::with_verbosity(verbosity);
        runner.run(&command, &mut shell)?;
        Ok(shell.into_string())
    })
    .await?
}
