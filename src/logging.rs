use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive (trace, debug, info, warn, error, or a full
    /// `EnvFilter` string). `RUST_LOG` wins when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit one JSON object per record instead of the human format.
    #[serde(default)]
    pub json_format: bool,

    /// Include the target module in each record.
    #[serde(default = "default_true")]
    pub with_target: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_format: false,
            with_target: true,
        }
    }
}

/// Installs the global subscriber. Call once, before the first record.
pub fn init_logging(config: &LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json_format {
        registry
            .with(fmt::layer().json().with_target(config.with_target))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(config.with_target))
            .init();
    }
}
