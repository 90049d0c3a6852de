//! Tick scheduling abstraction.
//!
//! The loop never sleeps itself; it awaits a [`TickSource`]. Production uses
//! [`IntervalTicker`], tests step a [`ManualTicker`] through its
//! [`TickHandle`] without real delays.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

/// Trait abstracting when the next tick happens.
///
/// The runner calls [`next_tick`](TickSource::next_tick) in a `select!` with
/// cancellation, so implementations must be cancel-safe.
#[async_trait]
pub trait TickSource: Send + 'static {
    /// Wait for the next tick. Returns `false` when no more ticks will come.
    async fn next_tick(&mut self) -> bool;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

// ============================================================================
// Interval ticker (real time)
// ============================================================================

/// Fixed real-time interval. The first tick fires one period after creation.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(tick_ms: u64) -> Self {
        let period = Duration::from_millis(tick_ms.max(1));
        let mut interval = time::interval_at(Instant::now() + period, period);
        // A slow tick delays the next one rather than bursting to catch up
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl TickSource for IntervalTicker {
    async fn next_tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }

    fn source_name(&self) -> &str {
        "interval"
    }
}

// ============================================================================
// Manual ticker (tests, deterministic stepping)
// ============================================================================

/// Ticks only when its [`TickHandle`] says so. Ends once every handle is
/// dropped.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Sender side of a [`ManualTicker`].
#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, TickHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, TickHandle { tx })
    }
}

impl TickHandle {
    /// Request `n` ticks. Returns `false` if the ticker is gone.
    pub fn step(&self, n: usize) -> bool {
        (0..n).all(|_| self.tx.send(()).is_ok())
    }
}

#[async_trait]
impl TickSource for ManualTicker {
    async fn next_tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    fn source_name(&self) -> &str {
        "manual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_ticker_counts_steps() {
        let (mut ticker, handle) = ManualTicker::new();
        assert!(handle.step(3));
        drop(handle);

        let mut ticks = 0;
        while ticker.next_tick().await {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
    }

    #[tokio::test]
    async fn test_interval_ticker_waits_one_period() {
        let start = Instant::now();
        let mut ticker = IntervalTicker::new(20);
        assert!(ticker.next_tick().await);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
