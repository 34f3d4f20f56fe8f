//! Prometheus metrics (lock-free atomics, zero allocation on hot path).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // --- Traffic ---
    pub relay_total: AtomicU64,
    pub relay_success: AtomicU64,
    pub relay_rejected: AtomicU64,
    pub relay_error: AtomicU64,

    // --- Latency (us, updated via CAS) ---
    pub relay_duration_us_sum: AtomicU64,
    pub relay_duration_us_max: AtomicU64,

    // --- Dispatch ---
    pub broadcast_errors: AtomicU64,
    pub nonce_resyncs: AtomicU64,

    // --- Tracker transitions ---
    pub confirmed_total: AtomicU64,
    pub failed_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub stuck_total: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            relay_total: AtomicU64::new(0),
            relay_success: AtomicU64::new(0),
            relay_rejected: AtomicU64::new(0),
            relay_error: AtomicU64::new(0),
            relay_duration_us_sum: AtomicU64::new(0),
            relay_duration_us_max: AtomicU64::new(0),
            broadcast_errors: AtomicU64::new(0),
            nonce_resyncs: AtomicU64::new(0),
            confirmed_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            stuck_total: AtomicU64::new(0),
        }
    }

    pub fn record_relay_duration(&self, start: Instant) {
        let us = start.elapsed().as_micros() as u64;
        self.relay_duration_us_sum.fetch_add(us, Ordering::Relaxed);
        // CAS loop for max tracking
        let mut cur = self.relay_duration_us_max.load(Ordering::Relaxed);
        while us > cur {
            match self.relay_duration_us_max.compare_exchange_weak(
                cur,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Render in Prometheus text exposition format.
    pub fn render(&self, pending_records: usize) -> String {
        let relay_total = self.relay_total.load(Ordering::Relaxed);
        let relay_success = self.relay_success.load(Ordering::Relaxed);
        let relay_rejected = self.relay_rejected.load(Ordering::Relaxed);
        let relay_error = self.relay_error.load(Ordering::Relaxed);
        let dur_sum = self.relay_duration_us_sum.load(Ordering::Relaxed);
        let dur_max = self.relay_duration_us_max.swap(0, Ordering::Relaxed);
        let broadcast_errors = self.broadcast_errors.load(Ordering::Relaxed);
        let nonce_resyncs = self.nonce_resyncs.load(Ordering::Relaxed);
        let confirmed = self.confirmed_total.load(Ordering::Relaxed);
        let failed = self.failed_total.load(Ordering::Relaxed);
        let dropped = self.dropped_total.load(Ordering::Relaxed);
        let stuck = self.stuck_total.load(Ordering::Relaxed);

        // Convert us to seconds for Prometheus conventions
        let dur_sum_s = dur_sum as f64 / 1_000_000.0;
        let dur_max_s = dur_max as f64 / 1_000_000.0;

        format!(
            "\
# HELP relayer_relay_total Total relay requests received.\n\
# TYPE relayer_relay_total counter\n\
relayer_relay_total {relay_total}\n\
# HELP relayer_relay_success_total Relay requests broadcast successfully.\n\
# TYPE relayer_relay_success_total counter\n\
relayer_relay_success_total {relay_success}\n\
# HELP relayer_relay_rejected_total Relay requests rejected (4xx).\n\
# TYPE relayer_relay_rejected_total counter\n\
relayer_relay_rejected_total {relay_rejected}\n\
# HELP relayer_relay_error_total Relay requests failed internally (5xx).\n\
# TYPE relayer_relay_error_total counter\n\
relayer_relay_error_total {relay_error}\n\
# HELP relayer_relay_duration_seconds_sum Total pipeline time (seconds).\n\
# TYPE relayer_relay_duration_seconds_sum counter\n\
relayer_relay_duration_seconds_sum {dur_sum_s:.6}\n\
# HELP relayer_relay_duration_seconds_max Max pipeline time since last scrape (seconds).\n\
# TYPE relayer_relay_duration_seconds_max gauge\n\
relayer_relay_duration_seconds_max {dur_max_s:.6}\n\
# HELP relayer_broadcast_errors_total Broadcast failures after persistence.\n\
# TYPE relayer_broadcast_errors_total counter\n\
relayer_broadcast_errors_total {broadcast_errors}\n\
# HELP relayer_nonce_resyncs_total Sequence cursor resyncs.\n\
# TYPE relayer_nonce_resyncs_total counter\n\
relayer_nonce_resyncs_total {nonce_resyncs}\n\
# HELP relayer_confirmed_total Submissions confirmed on chain.\n\
# TYPE relayer_confirmed_total counter\n\
relayer_confirmed_total {confirmed}\n\
# HELP relayer_failed_total Submissions reverted on chain.\n\
# TYPE relayer_failed_total counter\n\
relayer_failed_total {failed}\n\
# HELP relayer_dropped_total Submissions dropped without inclusion.\n\
# TYPE relayer_dropped_total counter\n\
relayer_dropped_total {dropped}\n\
# HELP relayer_stuck_total Submissions flagged stuck awaiting operator action.\n\
# TYPE relayer_stuck_total counter\n\
relayer_stuck_total {stuck}\n\
# HELP relayer_pending_records Pending submissions being tracked.\n\
# TYPE relayer_pending_records gauge\n\
relayer_pending_records {pending_records}\n"
        )
    }
}
