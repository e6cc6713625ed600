use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

/// Tracks live connections and tells them when the server is going down.
///
/// Each WebSocket driver calls [`register`](Self::register) and keeps the
/// returned guard for as long as it runs. [`shutdown`](Self::shutdown) flips
/// the watch channel; drivers react by sending a close frame and exiting.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    active: AtomicUsize,
    drained: Notify,
}

/// Keeps a connection counted as active until dropped.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                active: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let guard = ConnectionGuard {
            inner: self.inner.clone(),
        };
        (guard, self.inner.tx.subscribe())
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.tx.borrow()
    }

    pub fn shutdown(&self) {
        tracing::debug!(active = self.active_connections(), "signalling shutdown");
        self.inner.tx.send_replace(true);
    }

    /// Resolve once no registered connection remains.
    pub async fn wait_for_all_closed(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.active_connections() == 0 {
                return;
            }
            drained.await;
        }
    }
}
