//! Per-counter scheduling.
//!
//! Every live counter carries its own due time (`last read + interval`).
//! A tick sleeps until the earliest due time, reads every counter that is
//! due, and hands the readings back as one batch. Failures stay local to
//! the counter that produced them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::counters::{
    is_success, CounterDefinition, CounterHandle, CounterId, CounterReading, CounterSource,
    StatusClass, StatusPolicy, STATUS_READ_ABORTED, STATUS_READ_TIMEOUT,
};
use crate::error::{CounterError, MonitorError};

// ─── Samples ─────────────────────────────────────────────────────

/// One reading of one counter, as taken.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub counter: CounterId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub status: u32,
    pub ok: bool,
}

impl RawSample {
    pub fn new(counter: CounterId, timestamp: DateTime<Utc>, value: f64, status: u32) -> Self {
        Self {
            counter,
            timestamp,
            value,
            status,
            ok: is_success(status),
        }
    }
}

/// Running totals kept by the sampler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SamplerStats {
    pub ticks: u64,
    pub samples: u64,
    pub failed_samples: u64,
    pub read_timeouts: u64,
    pub rejected_counters: usize,
    pub retired_counters: usize,
}

// ─── Sampler ─────────────────────────────────────────────────────

struct Slot {
    definition: CounterDefinition,
    handle: Option<Box<dyn CounterHandle>>,
    next_due: Instant,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.handle.is_some()
    }

    fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

pub struct Sampler {
    slots: Vec<Slot>,
    rejected: Vec<(CounterDefinition, CounterError)>,
    read_timeout: Duration,
    policy: StatusPolicy,
    stats: SamplerStats,
}

impl Sampler {
    /// Opens a handle for every definition. Definitions that fail to open
    /// are recorded and left out of the run for good.
    pub fn open(
        definitions: Vec<CounterDefinition>,
        source: &dyn CounterSource,
        read_timeout: Duration,
        policy: StatusPolicy,
    ) -> Self {
        let now = Instant::now();
        let mut slots = Vec::with_capacity(definitions.len());
        let mut rejected = Vec::new();

        for definition in definitions {
            match source.open(&definition) {
                Ok(handle) => {
                    debug!(counter = %definition.path, metric = %definition.metric_name, "counter opened");
                    slots.push(Slot {
                        next_due: now + definition.interval,
                        definition,
                        handle: Some(handle),
                    });
                }
                Err(e) => {
                    warn!(counter = %definition.path, error = %e, "counter unavailable, excluded from this run");
                    rejected.push((definition, e));
                }
            }
        }

        let stats = SamplerStats {
            rejected_counters: rejected.len(),
            ..SamplerStats::default()
        };

        Self {
            slots,
            rejected,
            read_timeout,
            policy,
            stats,
        }
    }

    pub fn live_counters(&self) -> usize {
        self.slots.iter().filter(|s| s.is_live()).count()
    }

    pub fn rejected(&self) -> &[(CounterDefinition, CounterError)] {
        &self.rejected
    }

    pub fn stats(&self) -> &SamplerStats {
        &self.stats
    }

    /// Waits for the next tick and reads every counter that is due.
    ///
    /// `Ok(None)` means cancellation was observed before any read of the
    /// tick started. A tick cut short by cancellation returns the samples
    /// already taken.
    pub async fn next_batch(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<RawSample>>, MonitorError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let Some(due) = self.slots.iter().filter(|s| s.is_live()).map(|s| s.next_due).min()
            else {
                return Err(MonitorError::CountersExhausted);
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep_until(due) => {}
            }

            self.stats.ticks += 1;
            let now = Instant::now();
            let mut batch = Vec::new();

            for idx in 0..self.slots.len() {
                if !self.slots[idx].is_live() || self.slots[idx].next_due > now {
                    continue;
                }
                if cancel.is_cancelled() {
                    break;
                }
                batch.push(self.read_slot(idx).await);
            }

            if batch.is_empty() {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                continue;
            }

            debug!(samples = batch.len(), "tick complete");
            return Ok(Some(batch));
        }
    }

    async fn read_slot(&mut self, idx: usize) -> RawSample {
        let read_timeout = self.read_timeout;
        let slot = &mut self.slots[idx];
        let started = Instant::now();
        let timestamp = Utc::now();

        let reading = match slot.handle.as_mut() {
            Some(handle) => match tokio::time::timeout(read_timeout, handle.read()).await {
                Ok(reading) => reading,
                Err(_) => {
                    self.stats.read_timeouts += 1;
                    CounterReading::failed(STATUS_READ_TIMEOUT)
                }
            },
            None => CounterReading::failed(STATUS_READ_ABORTED),
        };

        slot.next_due = started + slot.definition.interval;
        self.stats.samples += 1;

        let sample = RawSample::new(slot.definition.id, timestamp, reading.value, reading.status);

        match self.policy.classify(reading.status) {
            StatusClass::Success => {}
            StatusClass::Recoverable => {
                self.stats.failed_samples += 1;
                debug!(
                    counter = %slot.definition.path,
                    status = %format!("0x{:08X}", reading.status),
                    "counter read failed, retrying next tick"
                );
            }
            StatusClass::Unrecoverable => {
                self.stats.failed_samples += 1;
                self.stats.retired_counters += 1;
                warn!(
                    counter = %slot.definition.path,
                    status = %format!("0x{:08X}", reading.status),
                    "unrecoverable counter status, closing counter"
                );
                slot.close();
            }
        }

        sample
    }

    /// Lazy sequence of batches that ends when `cancel` fires. A run whose
    /// counters have all been retired yields one error and ends.
    pub fn samples<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
    ) -> impl Stream<Item = Result<Vec<RawSample>, MonitorError>> + 'a {
        async_stream::stream! {
            loop {
                match self.next_batch(cancel).await {
                    Ok(Some(batch)) => yield Ok(batch),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }

    /// Closes every open handle. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let open = self.live_counters();
        for slot in &mut self.slots {
            slot.close();
        }
        if open > 0 {
            info!(closed = open, "counter handles released");
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::fake::{FakeCounter, FakeCounterSource};
    use crate::counters::{CounterPath, PDH_ACCESS_DENIED, PDH_CSTATUS_NO_INSTANCE, PDH_CSTATUS_NO_OBJECT};

    fn def(id: usize, path: &str, interval_ms: u64) -> CounterDefinition {
        let path = CounterPath::parse(path).unwrap();
        CounterDefinition {
            id: CounterId(id),
            metric_name: path.metric_key(),
            path,
            interval: Duration::from_millis(interval_ms),
        }
    }

    const CPU: &str = r"\Processor(_Total)\% Processor Time";
    const MEM: &str = r"\Memory\Available Bytes";
    const DISK: &str = r"\PhysicalDisk(_Total)\Disk Reads/sec";

    #[tokio::test(start_paused = true)]
    async fn reads_are_spaced_by_interval() {
        let source = FakeCounterSource::new().with_counter(CPU, FakeCounter::constant(5.0));
        let mut sampler = Sampler::open(
            vec![def(0, CPU, 250)],
            &source,
            Duration::from_secs(1),
            StatusPolicy::default(),
        );
        let cancel = CancellationToken::new();

        for _ in 0..6 {
            let batch = sampler.next_batch(&cancel).await.unwrap().unwrap();
            assert_eq!(batch.len(), 1);
            assert!(batch[0].ok);
        }

        let reads = source.reads(CPU);
        assert_eq!(reads.len(), 6);
        for pair in reads.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_does_not_block_other_counters() {
        let source = FakeCounterSource::new()
            .with_counter(CPU, FakeCounter::constant(1.0))
            .with_counter(MEM, FakeCounter::unavailable(PDH_CSTATUS_NO_OBJECT))
            .with_counter(DISK, FakeCounter::constant(3.0));
        let mut sampler = Sampler::open(
            vec![def(0, CPU, 1000), def(1, MEM, 1000), def(2, DISK, 1000)],
            &source,
            Duration::from_secs(1),
            StatusPolicy::default(),
        );

        assert_eq!(sampler.live_counters(), 2);
        assert_eq!(sampler.rejected().len(), 1);
        assert_eq!(sampler.rejected()[0].0.id, CounterId(1));

        let cancel = CancellationToken::new();
        let batch = sampler.next_batch(&cancel).await.unwrap().unwrap();
        let ids: Vec<_> = batch.iter().map(|s| s.counter).collect();
        assert_eq!(ids, vec![CounterId(0), CounterId(2)]);
        assert_eq!(source.reads(MEM).len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_is_emitted_and_retried_next_tick() {
        let source = FakeCounterSource::new().with_counter(
            CPU,
            FakeCounter::scripted([
                CounterReading::failed(PDH_CSTATUS_NO_INSTANCE),
                CounterReading::ok(7.0),
            ]),
        );
        let mut sampler = Sampler::open(
            vec![def(0, CPU, 1000)],
            &source,
            Duration::from_secs(1),
            StatusPolicy::default(),
        );
        let cancel = CancellationToken::new();

        let first = sampler.next_batch(&cancel).await.unwrap().unwrap();
        assert!(!first[0].ok);
        assert_eq!(first[0].status, PDH_CSTATUS_NO_INSTANCE);

        let second = sampler.next_batch(&cancel).await.unwrap().unwrap();
        assert!(second[0].ok);
        assert_eq!(second[0].value, 7.0);

        let reads = source.reads(CPU);
        assert!(reads[1] - reads[0] >= Duration::from_secs(1));
        assert_eq!(sampler.stats().failed_samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_status_retires_counter() {
        let source = FakeCounterSource::new()
            .with_counter(CPU, FakeCounter::scripted([CounterReading::failed(PDH_ACCESS_DENIED)]))
            .with_counter(MEM, FakeCounter::constant(10.0));
        let mut sampler = Sampler::open(
            vec![def(0, CPU, 1000), def(1, MEM, 1000)],
            &source,
            Duration::from_secs(1),
            StatusPolicy::new([PDH_ACCESS_DENIED]),
        );
        let cancel = CancellationToken::new();

        let first = sampler.next_batch(&cancel).await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(source.close_count(CPU), 1);
        assert_eq!(sampler.live_counters(), 1);

        let second = sampler.next_batch(&cancel).await.unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].counter, CounterId(1));
        assert_eq!(source.reads(CPU).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_counters_retired_is_exhaustion() {
        let source = FakeCounterSource::new()
            .with_counter(CPU, FakeCounter::scripted([CounterReading::failed(PDH_ACCESS_DENIED)]));
        let mut sampler = Sampler::open(
            vec![def(0, CPU, 1000)],
            &source,
            Duration::from_secs(1),
            StatusPolicy::new([PDH_ACCESS_DENIED]),
        );
        let cancel = CancellationToken::new();

        assert!(sampler.next_batch(&cancel).await.unwrap().is_some());
        assert!(matches!(
            sampler.next_batch(&cancel).await,
            Err(MonitorError::CountersExhausted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_read_times_out() {
        let source = FakeCounterSource::new()
            .with_counter(CPU, FakeCounter::constant(1.0).with_delay(Duration::from_secs(30)));
        let mut sampler = Sampler::open(
            vec![def(0, CPU, 1000)],
            &source,
            Duration::from_millis(500),
            StatusPolicy::default(),
        );
        let cancel = CancellationToken::new();

        let batch = sampler.next_batch(&cancel).await.unwrap().unwrap();
        assert!(!batch[0].ok);
        assert_eq!(batch[0].status, STATUS_READ_TIMEOUT);
        assert_eq!(sampler.stats().read_timeouts, 1);
        assert_eq!(source.completed_reads(CPU), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_sequence() {
        use tokio_stream::StreamExt;

        let source = FakeCounterSource::new().with_counter(CPU, FakeCounter::constant(1.0));
        let mut sampler = Sampler::open(
            vec![def(0, CPU, 1000)],
            &source,
            Duration::from_secs(1),
            StatusPolicy::default(),
        );
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            canceller.cancel();
        });

        let batches: Vec<_> = sampler.samples(&cancel).collect().await;
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.is_ok()));

        sampler.shutdown();
        sampler.shutdown();
        assert_eq!(source.close_count(CPU), 1);
    }
}
