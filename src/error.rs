use std::path::PathBuf;

use thiserror::Error;

// ─── Counter errors ──────────────────────────────────────────────

/// Failures while acquiring or driving a single counter handle.
/// Never fatal to the run on their own.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("invalid counter path \"{0}\"")]
    InvalidPath(String),

    #[error("counter {path} is unavailable (status 0x{status:08X})")]
    Unavailable { path: String, status: u32 },

    #[error("counter backend failure: {0}")]
    Backend(String),
}

// ─── Publish errors ──────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot resolve {target}: {reason}")]
    Unresolvable { target: String, reason: String },

    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("publish queue is full, batch of {0} metrics dropped")]
    QueueFull(usize),

    #[error("publisher worker has stopped")]
    Closed,
}

// ─── Configuration errors ────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

// ─── Task-level errors ───────────────────────────────────────────

/// Terminal outcome of a monitoring run that did not stop normally.
/// `Configuration` is reported before the run starts; everything else
/// surfaces from a run that was already underway.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("no configured counter could be opened")]
    NoCountersOpened,

    #[error("every counter has been retired after unrecoverable failures")]
    CountersExhausted,

    #[error("publish target unreachable: {0}")]
    TargetUnreachable(#[source] PublishError),

    #[error("publisher failed: {0}")]
    Publisher(#[source] PublishError),

    #[error("monitoring task aborted: {0}")]
    Aborted(String),
}

impl MonitorError {
    /// True for errors raised before the run entered `Running`.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::NoCountersOpened | Self::TargetUnreachable(_)
        )
    }
}
