use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::job::TxJob;
use crate::connection::{
    Chunk, ConnEvent, ConnectionHandler, ConnectionId, Outcome, PollHandle, Transport,
    XFER_CHUNK_SIZE,
};
use crate::metrics::{MetricRegistry, Modifier};
use crate::server::ClientRegistration;

/// Tuning for one push actor.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Job queue capacity.
    pub queue_capacity: usize,
    /// How long the I/O side waits for the actor lock before skipping a cycle.
    pub lock_timeout: Duration,
    /// Overflows since the last full snapshot that trigger a resync.
    /// Zero disables escalation.
    pub resync_after: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 20,
            lock_timeout: Duration::from_millis(100),
            resync_after: 1,
        }
    }
}

/// Transmission state guarded by the actor lock.
pub struct TxState {
    queue: mpsc::Receiver<TxJob>,
    job: TxJob,
    payload: Bytes,
    sent: usize,
    ack: usize,
    /// Overflow count already covered by a full snapshot.
    overflow_resynced: usize,
    processed: usize,
    released: bool,
}

impl TxState {
    pub fn job(&self) -> &TxJob {
        &self.job
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn acked(&self) -> usize {
        self.ack
    }

    /// Jobs taken off the queue (including synthesized resyncs).
    pub fn processed(&self) -> usize {
        self.processed
    }
}

/// Held while the actor's transmission state is locked. Dropping it unlocks.
pub type ActorGuard<'a> = MutexGuard<'a, TxState>;

/// Per-connection WebSocket push actor.
///
/// Producers (ticker, event listener, config notifier) call
/// [`add_tx_job`](Self::add_tx_job), which never blocks. Everything that
/// touches the transport runs on the connection's I/O task via
/// [`process_tx_job`](Self::process_tx_job) and [`on_sent`](Self::on_sent).
/// A job's payload goes out chunk by chunk; the next chunk is written only
/// once the previous one is acknowledged, and the next job starts only once
/// the whole payload is.
pub struct PushActor {
    conn: ConnectionId,
    modifier: Modifier,
    metrics: Arc<MetricRegistry>,
    jobs: mpsc::Sender<TxJob>,
    overflow: AtomicUsize,
    pending_ack: AtomicUsize,
    busy: AtomicBool,
    closed: AtomicBool,
    poll: PollHandle,
    lock_timeout: Duration,
    resync_after: usize,
    state: Mutex<TxState>,
}

impl std::fmt::Debug for PushActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushActor")
            .field("conn", &self.conn)
            .field("modifier", &self.modifier)
            .field("overflow", &self.overflow_count())
            .finish_non_exhaustive()
    }
}

impl PushActor {
    /// Create an actor and queue an initial full snapshot.
    pub fn new(
        conn: ConnectionId,
        modifier: Modifier,
        metrics: Arc<MetricRegistry>,
        poll: PollHandle,
        config: &ActorConfig,
    ) -> Self {
        let (jobs, queue) = mpsc::channel(config.queue_capacity.max(1));
        let actor = Self {
            conn,
            modifier,
            metrics,
            jobs,
            overflow: AtomicUsize::new(0),
            pending_ack: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            poll,
            lock_timeout: config.lock_timeout,
            resync_after: config.resync_after,
            state: Mutex::new(TxState {
                queue,
                job: TxJob::None,
                payload: Bytes::new(),
                sent: 0,
                ack: 0,
                overflow_resynced: 0,
                processed: 0,
                released: false,
            }),
        };
        actor.add_tx_job(TxJob::MetricsAll, true);
        actor
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow.load(Ordering::Acquire)
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.jobs.max_capacity() - self.jobs.capacity()
    }

    /// True while a job is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Lock the transmission state, waiting at most `timeout`.
    ///
    /// `None` means the state could not be locked in time; callers skip
    /// this cycle and rely on the next trigger.
    pub fn lock(&self, timeout: Duration) -> Option<ActorGuard<'_>> {
        self.state.try_lock_for(timeout)
    }

    /// Queue a job without blocking.
    ///
    /// On a full queue the job is dropped and the overflow counter bumped;
    /// the actor then resyncs the client with a full snapshot (see
    /// [`get_next_tx_job`](Self::get_next_tx_job)). With
    /// `trigger_immediately` and no job in flight, the I/O task is woken to
    /// start transmitting.
    pub fn add_tx_job(&self, job: TxJob, trigger_immediately: bool) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.jobs.try_send(job) {
            Ok(()) => {
                if trigger_immediately && !self.busy.load(Ordering::Acquire) {
                    self.poll.request_poll();
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                let overflow = self.overflow.fetch_add(1, Ordering::AcqRel) + 1;
                if overflow == 1 {
                    tracing::warn!(conn = %self.conn, job = job.kind(), "push queue overflow");
                } else {
                    tracing::debug!(conn = %self.conn, job = job.kind(), overflow, "push queue overflow");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Move the next job into flight. Returns `false` when there is none.
    ///
    /// After an overflow the next `MetricsUpdate` is promoted to
    /// `MetricsAll`, or a `MetricsAll` is synthesized once the queue is
    /// empty. Other job kinds pass through in order.
    pub fn get_next_tx_job(&self, st: &mut TxState) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let overflow = self.overflow.load(Ordering::Acquire);
        let resync = self.resync_after > 0 && overflow - st.overflow_resynced >= self.resync_after;

        let job = match st.queue.try_recv() {
            Ok(TxJob::MetricsUpdate) if resync => TxJob::MetricsAll,
            Ok(job) => job,
            Err(_) if resync => TxJob::MetricsAll,
            Err(_) => return false,
        };
        if matches!(job, TxJob::MetricsAll) {
            if resync {
                tracing::debug!(conn = %self.conn, overflow, "resyncing client after overflow");
            }
            st.overflow_resynced = overflow;
        }
        st.job = job;
        st.payload = Bytes::new();
        st.sent = 0;
        st.ack = 0;
        st.processed += 1;
        true
    }

    /// Encode the current job and write its first chunk.
    ///
    /// Returns `false` if the job had nothing to send; it is freed at once.
    pub fn init_tx(&self, st: &mut TxState, tx: &mut dyn Transport) -> bool {
        let Some(payload) = st.job.encode(&self.metrics, self.modifier) else {
            self.free_tx_job(st);
            return false;
        };
        tracing::trace!(conn = %self.conn, job = st.job.kind(), size = payload.len(), "tx start");
        st.payload = Bytes::from(payload);
        st.sent = 0;
        st.ack = 0;
        self.send_chunk(st, tx);
        true
    }

    /// Account for `acked` bytes confirmed by the transport and advance:
    /// next chunk, or next job once the payload is fully acknowledged.
    pub fn continue_tx(&self, st: &mut TxState, tx: &mut dyn Transport, acked: usize) {
        if st.job.is_none() {
            return;
        }
        st.ack = (st.ack + acked).min(st.sent);
        if st.ack < st.sent {
            return;
        }
        if st.sent < st.payload.len() {
            self.send_chunk(st, tx);
            return;
        }
        self.free_tx_job(st);
        self.start_next(st, tx);
    }

    /// I/O-side driver: start the next job when idle, apply pending
    /// acknowledgments, or retry a deferred chunk.
    pub fn process_tx_job(&self, tx: &mut dyn Transport) {
        let Some(mut st) = self.lock(self.lock_timeout) else {
            tracing::debug!(conn = %self.conn, "push actor lock timeout, skipping cycle");
            return;
        };
        if self.is_closed() {
            self.drop_queue(&mut st);
            return;
        }
        let acked = self.pending_ack.swap(0, Ordering::AcqRel);
        if st.job.is_none() {
            self.start_next(&mut st, tx);
        } else if acked > 0 {
            self.continue_tx(&mut st, tx, acked);
        } else if st.ack == st.sent && st.sent < st.payload.len() {
            self.send_chunk(&mut st, tx);
        }
    }

    /// Transport acknowledged `n` bytes.
    ///
    /// The count is parked before locking, so an ack is never lost when the
    /// lock times out; the next cycle applies it.
    pub fn on_sent(&self, tx: &mut dyn Transport, n: usize) {
        self.pending_ack.fetch_add(n, Ordering::AcqRel);
        self.process_tx_job(tx);
    }

    /// Release the current job's payload (event name, config reference).
    pub fn free_tx_job(&self, st: &mut TxState) {
        st.job = TxJob::None;
        st.payload = Bytes::new();
        st.sent = 0;
        st.ack = 0;
    }

    /// True once [`release`](Self::release) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop everything queued and refuse further jobs.
    ///
    /// May be called from any task. If the state lock cannot be taken within
    /// the lock timeout, the queue is dropped by the connection's I/O task on
    /// its next cycle instead. Either way that task is woken so its handler
    /// can finish.
    pub fn release(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.lock(self.lock_timeout) {
            Some(mut st) => self.drop_queue(&mut st),
            None => tracing::debug!(conn = %self.conn, "push actor busy, deferring release"),
        }
        self.busy.store(false, Ordering::Release);
        self.poll.request_poll();
    }

    fn drop_queue(&self, st: &mut TxState) {
        if st.released {
            return;
        }
        st.released = true;
        st.queue.close();
        let mut dropped = 0;
        while st.queue.try_recv().is_ok() {
            dropped += 1;
        }
        self.free_tx_job(st);
        tracing::debug!(conn = %self.conn, dropped, overflow = self.overflow_count(), "push actor released");
    }

    fn start_next(&self, st: &mut TxState, tx: &mut dyn Transport) {
        while self.get_next_tx_job(st) {
            if self.init_tx(st, tx) {
                self.busy.store(true, Ordering::Release);
                return;
            }
        }
        self.busy.store(false, Ordering::Release);
        // A producer may have queued a job after we found the queue empty
        // but before `busy` was cleared, and skipped its wakeup.
        if self.queued() > 0 {
            self.poll.request_poll();
        }
    }

    fn send_chunk(&self, st: &mut TxState, tx: &mut dyn Transport) {
        let end = (st.sent + XFER_CHUNK_SIZE).min(st.payload.len());
        let chunk = Chunk {
            data: st.payload.slice(st.sent..end),
            fin: end == st.payload.len(),
        };
        if tx.write(chunk) {
            st.sent = end;
        }
    }
}

/// Connection handler driving a [`PushActor`] from its WebSocket's I/O task.
///
/// Holds the client's registration with the server; dropping the handler
/// (on close or any other path) unregisters the client and releases its
/// queue.
pub struct WebSocketHandler {
    actor: Arc<PushActor>,
    _registration: ClientRegistration,
}

impl WebSocketHandler {
    pub fn new(actor: Arc<PushActor>, registration: ClientRegistration) -> Self {
        Self {
            actor,
            _registration: registration,
        }
    }

    pub fn actor(&self) -> &Arc<PushActor> {
        &self.actor
    }
}

impl ConnectionHandler for WebSocketHandler {
    fn handle_event(&mut self, event: ConnEvent, tx: &mut dyn Transport) -> Outcome {
        match event {
            ConnEvent::Poll => self.actor.process_tx_job(tx),
            ConnEvent::Sent(n) => self.actor.on_sent(tx, n),
            ConnEvent::Recv(data) => {
                tracing::trace!(conn = %self.actor.conn, len = data.len(), "ignoring client message");
            }
            ConnEvent::Close => {
                self.actor.release();
                return Outcome::Finished { keep_alive: false };
            }
        }
        if self.actor.is_closed() {
            // Released by the server: nothing more will be pushed.
            return Outcome::Finished { keep_alive: false };
        }
        Outcome::Continue
    }
}

impl Drop for WebSocketHandler {
    fn drop(&mut self) {
        self.actor.release();
    }
}
