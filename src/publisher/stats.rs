use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

// ─── Configuration ───────────────────────────────────────────────

/// HdrHistogram range: 1 μs → 60 s, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 60_000_000;
const HIST_SIGFIG: u8 = 3;

// ─── Public types ────────────────────────────────────────────────

/// Percentile breakdown of payload send latency, in microseconds.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyPercentiles {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub count: u64,
}

impl LatencyPercentiles {
    /// Zeroed values if the histogram is empty.
    fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.len() == 0 {
            return Self {
                min_us: 0,
                max_us: 0,
                mean_us: 0.0,
                p50_us: 0,
                p99_us: 0,
                count: 0,
            };
        }

        Self {
            min_us: hist.min(),
            max_us: hist.max(),
            mean_us: hist.mean(),
            p50_us: hist.value_at_percentile(50.0),
            p99_us: hist.value_at_percentile(99.0),
            count: hist.len(),
        }
    }
}

/// Read-only view of the publisher's counters.
#[derive(Debug, Clone, Serialize)]
pub struct PublishSnapshot {
    pub send_latency: LatencyPercentiles,

    pub batches_queued: u64,
    pub batches_dropped: u64,
    pub metrics_sent: u64,
    pub metrics_dropped: u64,
    /// Metrics still queued or mid-send when the worker was stopped.
    pub metrics_abandoned: u64,
    pub payloads_sent: u64,
    pub payload_failures: u64,
    pub connects: u64,
    pub connect_failures: u64,

    pub metrics_per_sec: f64,
    pub elapsed_secs: f64,
}

/// Thread-safe publish statistics.
/// `Publisher::publish` records queueing, the worker records sends.
pub struct PublishStats {
    inner: Mutex<Inner>,
}

// ─── Internal state ──────────────────────────────────────────────

struct Inner {
    send_latency: Histogram<u64>,

    batches_queued: u64,
    batches_dropped: u64,
    metrics_sent: u64,
    metrics_dropped: u64,
    metrics_abandoned: u64,
    /// Handed to the worker, not yet sent or dropped.
    in_worker: u64,
    payloads_sent: u64,
    payload_failures: u64,
    connects: u64,
    connect_failures: u64,

    start_time: Instant,
}

// ─── PublishStats impl ───────────────────────────────────────────

impl PublishStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Called before the batch is offered to the queue, so the worker can
    /// never settle metrics that were not yet counted.
    pub fn batch_offered(&self, metrics: usize) {
        self.inner.lock().in_worker += metrics as u64;
    }

    pub fn batch_queued(&self) {
        self.inner.lock().batches_queued += 1;
    }

    /// An offered batch never reached the worker.
    pub fn batch_dropped(&self, metrics: usize) {
        let mut inner = self.inner.lock();
        inner.batches_dropped += 1;
        inner.metrics_dropped += metrics as u64;
        inner.settle(metrics);
    }

    pub fn payload_sent(&self, metrics: usize, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.payloads_sent += 1;
        inner.metrics_sent += metrics as u64;
        inner.settle(metrics);
        let us = (latency.as_micros() as u64).clamp(HIST_LOW, HIST_HIGH);
        let _ = inner.send_latency.record(us);
    }

    /// A payload failed; `metrics` counts everything it and the rest of
    /// its batch carried.
    pub fn payload_failed(&self, metrics: usize) {
        let mut inner = self.inner.lock();
        inner.payload_failures += 1;
        inner.metrics_dropped += metrics as u64;
        inner.settle(metrics);
    }

    pub fn connected(&self) {
        self.inner.lock().connects += 1;
    }

    pub fn connect_failed(&self, metrics: usize) {
        let mut inner = self.inner.lock();
        inner.connect_failures += 1;
        inner.metrics_dropped += metrics as u64;
        inner.settle(metrics);
    }

    /// Everything handed to the worker and not yet settled is counted as
    /// dropped. Returns how many metrics that was.
    pub fn abandon_in_worker(&self) -> u64 {
        let mut inner = self.inner.lock();
        let abandoned = std::mem::take(&mut inner.in_worker);
        inner.metrics_abandoned += abandoned;
        inner.metrics_dropped += abandoned;
        abandoned
    }

    pub fn snapshot(&self) -> PublishSnapshot {
        self.inner.lock().snapshot()
    }
}

impl Default for PublishStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Inner impl ──────────────────────────────────────────────────

impl Inner {
    fn new() -> Self {
        Self {
            send_latency: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                .expect("histogram creation"),
            batches_queued: 0,
            batches_dropped: 0,
            metrics_sent: 0,
            metrics_dropped: 0,
            metrics_abandoned: 0,
            in_worker: 0,
            payloads_sent: 0,
            payload_failures: 0,
            connects: 0,
            connect_failures: 0,
            start_time: Instant::now(),
        }
    }

    fn settle(&mut self, metrics: usize) {
        self.in_worker = self.in_worker.saturating_sub(metrics as u64);
    }

    fn snapshot(&self) -> PublishSnapshot {
        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        let metrics_per_sec = if elapsed_secs > 0.0 {
            self.metrics_sent as f64 / elapsed_secs
        } else {
            0.0
        };

        PublishSnapshot {
            send_latency: LatencyPercentiles::from_histogram(&self.send_latency),
            batches_queued: self.batches_queued,
            batches_dropped: self.batches_dropped,
            metrics_sent: self.metrics_sent,
            metrics_dropped: self.metrics_dropped,
            metrics_abandoned: self.metrics_abandoned,
            payloads_sent: self.payloads_sent,
            payload_failures: self.payload_failures,
            connects: self.connects,
            connect_failures: self.connect_failures,
            metrics_per_sec,
            elapsed_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_is_zeroed() {
        let snap = PublishStats::new().snapshot();
        assert_eq!(snap.send_latency.count, 0);
        assert_eq!(snap.metrics_sent, 0);
        assert_eq!(snap.metrics_dropped, 0);
    }

    #[test]
    fn records_sends_and_drops() {
        let stats = PublishStats::new();
        stats.batch_offered(9);
        stats.batch_queued();
        stats.batch_offered(6);
        stats.connected();
        stats.payload_sent(3, Duration::from_micros(250));
        stats.payload_sent(2, Duration::from_micros(750));
        stats.payload_failed(4);
        stats.batch_dropped(6);

        let snap = stats.snapshot();
        assert_eq!(snap.metrics_sent, 5);
        assert_eq!(snap.payloads_sent, 2);
        assert_eq!(snap.payload_failures, 1);
        assert_eq!(snap.metrics_dropped, 10);
        assert_eq!(snap.batches_dropped, 1);
        assert_eq!(snap.send_latency.count, 2);
        assert!(snap.send_latency.max_us >= 750);
        assert_eq!(snap.metrics_abandoned, 0);
    }

    #[test]
    fn abandons_only_unsettled_metrics() {
        let stats = PublishStats::new();
        stats.batch_offered(4);
        stats.batch_queued();
        stats.batch_offered(3);
        stats.batch_queued();
        stats.payload_sent(2, Duration::from_micros(100));
        stats.payload_failed(2);

        assert_eq!(stats.abandon_in_worker(), 3);
        assert_eq!(stats.abandon_in_worker(), 0);

        let snap = stats.snapshot();
        assert_eq!(snap.metrics_sent, 2);
        assert_eq!(snap.metrics_abandoned, 3);
        assert_eq!(snap.metrics_dropped, 5);
    }
}
