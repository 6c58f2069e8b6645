//! Delivery of encoded metrics to the collector.
//!
//! `Publisher::publish` only enqueues; a worker task owns the connection
//! and does the network I/O. Batches are sent in arrival order and each
//! one is packed into as few payloads as `max_payload_bytes` allows, so
//! metrics of one counter are never reordered. Delivery is at most once:
//! a payload that fails is dropped together with the rest of its batch and
//! the connection is reopened on the next send.

pub mod recorder;
pub mod stats;
pub mod transport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::encoder::EncodedMetric;
use crate::error::PublishError;

pub use stats::{PublishSnapshot, PublishStats};
pub use transport::{Connector, NetworkConnector, Transport};

// ─── Target ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("udp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// Fits one Ethernet MTU after IP and UDP headers.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1432;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Where metrics go and the bounds on getting them there.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishTarget {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Coalesce batches arriving within this window into one flush.
    pub batch_window: Option<Duration>,
    pub max_payload_bytes: usize,
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl PublishTarget {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            batch_window: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn connector(&self) -> NetworkConnector {
        NetworkConnector::new(self.host.clone(), self.port, self.protocol)
    }
}

// ─── Publisher ───────────────────────────────────────────────────

pub struct Publisher {
    tx: mpsc::Sender<Vec<EncodedMetric>>,
    worker: JoinHandle<()>,
    stop: CancellationToken,
    stats: Arc<PublishStats>,
    shutdown_timeout: Duration,
    close_grace: Duration,
}

impl Publisher {
    /// Spawns the send worker. No connection is opened until the first
    /// payload needs one.
    pub fn start(target: PublishTarget, connector: Arc<dyn Connector>) -> Self {
        let (tx, rx) = mpsc::channel(target.queue_capacity.max(1));
        let stats = Arc::new(PublishStats::new());
        let stop = CancellationToken::new();
        let shutdown_timeout = target.shutdown_timeout;
        // room for the worker's own bounded close after it is told to stop
        let close_grace = target.send_timeout * 2;

        let worker = Worker {
            target,
            connector,
            transport: None,
            stats: stats.clone(),
            stop: stop.clone(),
        };
        let worker = tokio::spawn(worker.run(rx));

        Self {
            tx,
            worker,
            stop,
            stats,
            shutdown_timeout,
            close_grace,
        }
    }

    /// Hands a batch to the worker without waiting. A full queue drops the
    /// batch; a closed queue means the worker is gone.
    pub fn publish(&self, batch: Vec<EncodedMetric>) -> Result<(), PublishError> {
        if batch.is_empty() {
            return Ok(());
        }
        let size = batch.len();
        self.stats.batch_offered(size);
        match self.tx.try_send(batch) {
            Ok(()) => {
                self.stats.batch_queued();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.batch_dropped(size);
                Err(PublishError::QueueFull(size))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.batch_dropped(size);
                Err(PublishError::Closed)
            }
        }
    }

    pub fn stats(&self) -> PublishSnapshot {
        self.stats.snapshot()
    }

    /// Closes the queue and lets the worker flush for at most the shutdown
    /// timeout. Past that the worker is told to stop: whatever it still
    /// holds is counted as abandoned and the connection is closed. The
    /// task is only aborted if even that close overruns.
    pub async fn shutdown(self) -> PublishSnapshot {
        let Self {
            tx,
            mut worker,
            stop,
            stats,
            shutdown_timeout,
            close_grace,
        } = self;
        drop(tx);

        match tokio::time::timeout(shutdown_timeout, &mut worker).await {
            Ok(Ok(())) => debug!("publisher flushed"),
            Ok(Err(e)) => warn!(error = %e, "publisher worker ended abnormally"),
            Err(_) => {
                warn!(timeout = ?shutdown_timeout, "publisher flush timed out, abandoning queued metrics");
                stop.cancel();
                if tokio::time::timeout(close_grace, &mut worker).await.is_err() {
                    warn!("publisher worker did not stop, aborting");
                    worker.abort();
                    stats.abandon_in_worker();
                }
            }
        }

        stats.snapshot()
    }
}

// ─── Worker ──────────────────────────────────────────────────────

struct Worker {
    target: PublishTarget,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    stats: Arc<PublishStats>,
    stop: CancellationToken,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Vec<EncodedMetric>>) {
        let mut pending: Vec<EncodedMetric> = Vec::new();
        let mut flush_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(batch) => match self.target.batch_window {
                        None => self.send_batch(&batch).await,
                        Some(window) => {
                            pending.extend(batch);
                            flush_at.get_or_insert_with(|| Instant::now() + window);
                        }
                    },
                    None => break,
                },
                _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    flush_at = None;
                    let batch = std::mem::take(&mut pending);
                    self.send_batch(&batch).await;
                }
            }
        }

        if !pending.is_empty() && !self.stop.is_cancelled() {
            self.send_batch(&pending).await;
        }
        if self.stop.is_cancelled() {
            rx.close();
            let abandoned = self.stats.abandon_in_worker();
            warn!(abandoned, "publisher stopped before flushing");
        }
        self.disconnect().await;
    }

    async fn send_batch(&mut self, batch: &[EncodedMetric]) {
        if batch.is_empty() {
            return;
        }

        let payloads = pack(batch, self.target.max_payload_bytes);
        let mut remaining = batch.len();

        for (payload, count) in payloads {
            if self.transport.is_none() {
                let connect = tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return,
                    r = tokio::time::timeout(self.target.connect_timeout, self.connector.connect()) => r,
                };
                match connect {
                    Ok(Ok(transport)) => {
                        self.stats.connected();
                        info!(collector = %self.connector.describe(), "publisher connected");
                        self.transport = Some(transport);
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, dropped = remaining, "publisher connect failed, batch dropped");
                        self.stats.connect_failed(remaining);
                        return;
                    }
                    Err(_) => {
                        warn!(dropped = remaining, "publisher connect timed out, batch dropped");
                        self.stats.connect_failed(remaining);
                        return;
                    }
                }
            }

            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            let started = std::time::Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                r = tokio::time::timeout(self.target.send_timeout, transport.send(&payload)) => match r {
                    Ok(result) => result,
                    Err(_) => Err(PublishError::Timeout("send")),
                },
            };

            match result {
                Ok(()) => {
                    self.stats.payload_sent(count, started.elapsed());
                    remaining -= count;
                }
                Err(e) => {
                    warn!(error = %e, dropped = remaining, "publish failed, batch dropped");
                    self.stats.payload_failed(remaining);
                    self.disconnect().await;
                    return;
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if tokio::time::timeout(self.target.send_timeout, transport.close())
                .await
                .is_err()
            {
                debug!("transport close timed out");
            }
        }
    }
}

/// Newline-terminated lines grouped into payloads of at most `max_bytes`.
/// A single line longer than the cap travels alone.
fn pack(batch: &[EncodedMetric], max_bytes: usize) -> Vec<(Vec<u8>, usize)> {
    let mut payloads = Vec::new();
    let mut current: Vec<u8> = Vec::with_capacity(max_bytes);
    let mut count = 0;

    for metric in batch {
        let needed = metric.line.len() + 1;
        if count > 0 && current.len() + needed > max_bytes {
            payloads.push((std::mem::take(&mut current), count));
            count = 0;
        }
        current.extend_from_slice(metric.line.as_bytes());
        current.push(b'\n');
        count += 1;
    }
    if count > 0 {
        payloads.push((current, count));
    }
    payloads
}
