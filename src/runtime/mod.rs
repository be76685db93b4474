//! Run loops and process lifecycle
//!
//! - `DecodeLoop`: receive, decode, render until shutdown
//! - `Relay`: receive, forward, then send the sentinel
//! - `Shutdown`: cancellation token, optionally driven by SIGINT/SIGTERM

mod decode_loop;
mod relay;
mod shutdown;

use std::time::{Duration, Instant};

pub use decode_loop::DecodeLoop;
pub use relay::{Relay, SENTINEL};
pub use shutdown::{install_signal_handlers, Shutdown};

/// How long a loop blocks in a receive before re-checking shutdown
pub const RECV_TICK: Duration = Duration::from_millis(100);

/// Interval between periodic statistics lines
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Counters kept by a run loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Messages taken off the inbound bus
    pub received: u64,
    /// Messages rendered (decoder) or forwarded (relay)
    pub handled: u64,
    /// Messages that could not be decoded
    pub skipped: u64,
}

/// Emits `LoopStats` at info level every `STATS_INTERVAL`.
struct StatsReporter {
    role: &'static str,
    started: Instant,
    last_report: Instant,
}

impl StatsReporter {
    fn new(role: &'static str) -> Self {
        let now = Instant::now();
        Self {
            role,
            started: now,
            last_report: now,
        }
    }

    fn tick(&mut self, stats: &LoopStats) {
        if self.last_report.elapsed() >= STATS_INTERVAL {
            self.report(stats);
            self.last_report = Instant::now();
        }
    }

    fn report(&self, stats: &LoopStats) {
        let uptime = self.started.elapsed().as_secs_f64();
        let rate = if uptime > 0.0 {
            stats.received as f64 / uptime
        } else {
            0.0
        };
        tracing::info!(
            role = self.role,
            received = stats.received,
            handled = stats.handled,
            skipped = stats.skipped,
            per_sec = (rate * 10.0).round() / 10.0,
            uptime_secs = (uptime * 10.0).round() / 10.0,
            "loop stats"
        );
    }
}
