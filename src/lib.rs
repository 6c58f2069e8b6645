//! Samples performance counters on per-counter intervals and streams them
//! to a statsd or Graphite collector.

pub mod config;
pub mod counters;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod sampler;
pub mod task;

pub use config::{Config, PublishingConfig, SamplingConfig};
pub use counters::{CounterDefinition, CounterPath, CounterSource};
pub use encoder::{EncodedMetric, MetricEncoder, WireFormat};
pub use error::MonitorError;
pub use publisher::{Connector, PublishTarget, Publisher};
pub use sampler::{RawSample, Sampler};
pub use task::{MonitoringTask, RunHandle, RunState, RunSummary};
