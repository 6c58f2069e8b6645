//! The monitoring run: sampler → encoder → publisher until cancelled.
//!
//! `MonitoringTask::start` does all fallible setup up front and only hands
//! back a [`RunHandle`] once the run is `Running`. The handle is the only
//! way to reach the run; there is no process-wide "current run".

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PublishingConfig, SamplingConfig};
use crate::counters::{self, CounterDefinition, CounterId, CounterSource};
use crate::encoder::MetricEncoder;
use crate::error::{MonitorError, PublishError};
use crate::publisher::{Connector, PublishSnapshot, Publisher};
use crate::sampler::{Sampler, SamplerStats};

// ─── Run state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Created,
    Running,
    Cancelling,
    Stopped,
}

/// What a run did, returned when it stops normally.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub transitions: Vec<RunState>,
    pub sampler: SamplerStats,
    pub publisher: PublishSnapshot,
    pub metrics_encoded: u64,
    /// Failed samples withheld by the `drop` failure policy.
    pub samples_suppressed: u64,
}

struct StateTracker {
    tx: watch::Sender<RunState>,
    history: Vec<RunState>,
}

impl StateTracker {
    fn new() -> (Self, watch::Receiver<RunState>) {
        let (tx, rx) = watch::channel(RunState::Created);
        let tracker = Self {
            tx,
            history: vec![RunState::Created],
        };
        (tracker, rx)
    }

    fn set(&mut self, state: RunState) {
        self.history.push(state);
        self.tx.send_replace(state);
        info!(?state, "monitoring run state changed");
    }
}

// ─── Task ────────────────────────────────────────────────────────

pub struct MonitoringTask {
    sampling: SamplingConfig,
    publishing: PublishingConfig,
    source: Option<Box<dyn CounterSource>>,
    connector: Option<Arc<dyn Connector>>,
}

impl MonitoringTask {
    /// Uses the platform counter source and a network connector for the
    /// configured target unless overridden.
    pub fn new(sampling: SamplingConfig, publishing: PublishingConfig) -> Self {
        Self {
            sampling,
            publishing,
            source: None,
            connector: None,
        }
    }

    pub fn with_source(mut self, source: impl CounterSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Validates configuration, checks the target, opens the counters and
    /// spawns the run. Errors here are startup errors: nothing is left
    /// running and every opened resource has been released.
    pub async fn start(self, cancel: CancellationToken) -> Result<RunHandle, MonitorError> {
        let (mut tracker, state_rx) = StateTracker::new();

        let definitions = self.sampling.definitions().map_err(|e| {
            error!(error = %e, "invalid sampling configuration");
            MonitorError::from(e)
        })?;
        self.publishing.validate().map_err(|e| {
            error!(error = %e, "invalid publishing configuration");
            MonitorError::from(e)
        })?;

        let target = self.publishing.target();
        let encoder = self.publishing.encoder();
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(target.connector()));

        match tokio::time::timeout(target.connect_timeout, connector.check()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(collector = %connector.describe(), error = %e, "publish target unreachable");
                return Err(MonitorError::TargetUnreachable(e));
            }
            Err(_) => {
                error!(collector = %connector.describe(), "publish target check timed out");
                return Err(MonitorError::TargetUnreachable(PublishError::Timeout("target check")));
            }
        }

        let source = self.source.unwrap_or_else(counters::platform_source);
        let by_id: HashMap<CounterId, CounterDefinition> =
            definitions.iter().map(|d| (d.id, d.clone())).collect();
        let configured = definitions.len();

        let sampler = Sampler::open(
            definitions,
            source.as_ref(),
            self.sampling.read_timeout(),
            self.sampling.status_policy(),
        );
        if sampler.live_counters() == 0 {
            error!(configured, "no counter could be opened");
            return Err(MonitorError::NoCountersOpened);
        }

        info!(
            counters = sampler.live_counters(),
            rejected = sampler.rejected().len(),
            collector = %connector.describe(),
            "monitoring run starting"
        );

        let publisher = Publisher::start(target, connector);
        tracker.set(RunState::Running);

        let run_cancel = cancel.child_token();
        let run = Run {
            sampler,
            publisher,
            encoder,
            definitions: by_id,
            tracker,
            metrics_encoded: 0,
            samples_suppressed: 0,
        };
        let join = tokio::spawn(run.drive(run_cancel.clone()));

        Ok(RunHandle {
            cancel: run_cancel,
            state: state_rx,
            join,
        })
    }
}

// ─── Run loop ────────────────────────────────────────────────────

struct Run {
    sampler: Sampler,
    publisher: Publisher,
    encoder: MetricEncoder,
    definitions: HashMap<CounterId, CounterDefinition>,
    tracker: StateTracker,
    metrics_encoded: u64,
    samples_suppressed: u64,
}

impl Run {
    async fn drive(mut self, cancel: CancellationToken) -> Result<RunSummary, MonitorError> {
        let outcome = self.pump(&cancel).await;

        if outcome.is_ok() {
            self.tracker.set(RunState::Cancelling);
        }

        // Release on every path: counters first, then flush and close.
        self.sampler.shutdown();
        let publisher_stats = self.publisher.shutdown().await;
        self.tracker.set(RunState::Stopped);

        match outcome {
            Ok(()) => Ok(RunSummary {
                transitions: self.tracker.history.clone(),
                sampler: self.sampler.stats().clone(),
                publisher: publisher_stats,
                metrics_encoded: self.metrics_encoded,
                samples_suppressed: self.samples_suppressed,
            }),
            Err(e) => {
                error!(error = %e, "monitoring run failed");
                Err(e)
            }
        }
    }

    /// Runs until the sampler's sequence ends (`Ok`) or something fatal
    /// happens (`Err`).
    async fn pump(&mut self, cancel: &CancellationToken) -> Result<(), MonitorError> {
        let Self {
            sampler,
            publisher,
            encoder,
            definitions,
            metrics_encoded,
            samples_suppressed,
            ..
        } = self;

        let samples = sampler.samples(cancel);
        tokio::pin!(samples);

        while let Some(batch) = samples.next().await {
            let batch = batch?;

            let mut metrics = Vec::with_capacity(batch.len());
            for sample in &batch {
                let Some(definition) = definitions.get(&sample.counter) else {
                    warn!(counter = %sample.counter, "sample for unknown counter");
                    continue;
                };
                match encoder.encode(sample, definition) {
                    Some(metric) => metrics.push(metric),
                    None => *samples_suppressed += 1,
                }
            }
            *metrics_encoded += metrics.len() as u64;
            debug!(samples = batch.len(), metrics = metrics.len(), "batch encoded");

            match publisher.publish(metrics) {
                Ok(()) => {}
                Err(PublishError::Closed) => {
                    return Err(MonitorError::Publisher(PublishError::Closed));
                }
                Err(e) => warn!(error = %e, "batch not published"),
            }
        }

        Ok(())
    }
}

// ─── Handle ──────────────────────────────────────────────────────

/// Owned by whoever started the run.
pub struct RunHandle {
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
    join: JoinHandle<Result<RunSummary, MonitorError>>,
}

impl RunHandle {
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Requests cancellation and waits for the run to release everything.
    pub async fn stop(self) -> Result<RunSummary, MonitorError> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Waits for the run to end on its own (external cancellation or a
    /// fatal error).
    pub async fn wait(self) -> Result<RunSummary, MonitorError> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => Err(MonitorError::Aborted(e.to_string())),
        }
    }
}
