use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::EventBus;
use crate::metrics::MetricRegistry;

pub const TICKER_PERIOD: Duration = Duration::from_secs(1);

/// Periods (in ticks) that get a `ticker.<n>` event.
const TICKER_EVENTS: [u64; 6] = [1, 10, 60, 300, 600, 3600];

/// Firings closer than this to the previous one are duplicates.
const MIN_TICK_SPACING: Duration = Duration::from_millis(970);

#[derive(Debug, Default)]
struct TickState {
    last_tick: Option<Instant>,
    ticks: u64,
}

/// 1 Hz system ticker: keeps the uptime and clock metrics current and
/// publishes the `ticker.*` events.
pub struct Housekeeping {
    metrics: Arc<MetricRegistry>,
    events: EventBus,
    state: Mutex<TickState>,
}

impl Housekeeping {
    pub fn new(metrics: Arc<MetricRegistry>, events: EventBus) -> Self {
        Self {
            metrics,
            events,
            state: Mutex::new(TickState::default()),
        }
    }

    /// Seconds ticked since start.
    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    /// Returns `false` for a duplicate firing.
    pub fn tick(&self, now: Instant) -> bool {
        let ticks = {
            let mut st = self.state.lock();
            if let Some(last) = st.last_tick {
                if now < last + MIN_TICK_SPACING {
                    return false;
                }
            }
            st.last_tick = Some(now);
            st.ticks += 1;
            st.ticks
        };

        self.metrics.set("m.monotonic", ticks);
        if let Ok(utc) = SystemTime::now().duration_since(UNIX_EPOCH) {
            self.metrics.set("m.time.utc", utc.as_secs());
        }
        for period in TICKER_EVENTS {
            if ticks % period == 0 {
                self.events.signal(format!("ticker.{period}"));
            }
        }
        true
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let housekeeping = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + TICKER_PERIOD, TICKER_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    now = interval.tick() => {
                        housekeeping.tick(now);
                    }
                }
            }
            tracing::debug!(ticks = housekeeping.ticks(), "housekeeping stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_update_metrics_and_signal_events() {
        let metrics = Arc::new(MetricRegistry::new());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let hk = Housekeeping::new(metrics.clone(), events);

        let start = Instant::now();
        for i in 1..=10u64 {
            assert!(hk.tick(start + TICKER_PERIOD * i as u32));
        }
        assert_eq!(metrics.get("m.monotonic"), Some(serde_json::json!(10)));
        assert!(metrics.get("m.time.utc").is_some());

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.iter().filter(|e| *e == "ticker.1").count(), 10);
        assert_eq!(seen.last().map(String::as_str), Some("ticker.10"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_firing_is_ignored() {
        let hk = Housekeeping::new(Arc::new(MetricRegistry::new()), EventBus::new());
        let t0 = Instant::now();
        assert!(hk.tick(t0));
        assert!(!hk.tick(t0 + Duration::from_millis(100)));
        assert!(hk.tick(t0 + Duration::from_millis(990)));
        assert_eq!(hk.ticks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_ticker_runs_until_cancelled() {
        let hk = Arc::new(Housekeeping::new(Arc::new(MetricRegistry::new()), EventBus::new()));
        let cancel = CancellationToken::new();
        let handle = hk.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(hk.ticks(), 3);
    }
}
