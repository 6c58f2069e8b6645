//! Run configuration: which counters to sample and where to publish them.
//!
//! Loaded from YAML. Every field except the counter list has a default;
//! `validate` turns the raw form into the types the pipeline runs on.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::counters::{CounterDefinition, CounterId, CounterPath, StatusPolicy};
use crate::encoder::{FailurePolicy, MetricEncoder, WireFormat};
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::publisher::{self, Protocol, PublishTarget};

// ─── Top level ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
}

impl Config {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Reads and parses `path`. Relative definition files are resolved
    /// against the directory holding the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(base) = path.parent() {
            for file in &mut config.sampling.definition_files {
                if file.is_relative() {
                    *file = base.join(&*file);
                }
            }
        }
        Ok(config)
    }
}

// ─── Sampling ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterEntry {
    /// `[\\machine]\Category[(Instance)]\Counter`
    pub path: String,

    /// Published metric name; derived from the path when absent.
    #[serde(default)]
    pub name: Option<String>,

    /// Overrides `default_interval_ms` for this counter.
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Statuses that retire a counter instead of being retried.
    #[serde(default)]
    pub unrecoverable_statuses: Vec<u32>,

    /// Plain-text files listing one counter path per line (`#` comments).
    #[serde(default)]
    pub definition_files: Vec<PathBuf>,

    #[serde(default)]
    pub counters: Vec<CounterEntry>,
}

fn default_interval_ms() -> u64 {
    5_000
}
fn default_read_timeout_ms() -> u64 {
    2_000
}

impl SamplingConfig {
    pub fn new(counters: Vec<CounterEntry>) -> Self {
        Self {
            default_interval_ms: default_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            unrecoverable_statuses: Vec::new(),
            definition_files: Vec::new(),
            counters,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy::new(self.unrecoverable_statuses.iter().copied())
    }

    /// Resolves inline counters and definition files into definitions,
    /// numbered in declaration order.
    pub fn definitions(&self) -> Result<Vec<CounterDefinition>, ConfigError> {
        if self.default_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sampling.default_interval_ms must be greater than 0".into(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sampling.read_timeout_ms must be greater than 0".into(),
            ));
        }

        let mut entries = self.counters.clone();
        for file in &self.definition_files {
            entries.extend(read_definition_file(file)?);
        }
        if entries.is_empty() {
            return Err(ConfigError::Invalid("no counters configured".into()));
        }

        let mut names = HashSet::new();
        let mut definitions = Vec::with_capacity(entries.len());

        for (idx, entry) in entries.into_iter().enumerate() {
            let path = CounterPath::parse(&entry.path)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;

            let interval_ms = entry.interval_ms.unwrap_or(self.default_interval_ms);
            if interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "counter {} has a zero interval",
                    entry.path
                )));
            }

            let metric_name = match entry.name {
                Some(name) if !name.trim().is_empty() => name.trim().to_string(),
                Some(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "counter {} has an empty metric name",
                        entry.path
                    )))
                }
                None => path.metric_key(),
            };
            if !names.insert(metric_name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "metric name {metric_name} is used by more than one counter"
                )));
            }

            definitions.push(CounterDefinition {
                id: CounterId(idx),
                path,
                interval: Duration::from_millis(interval_ms),
                metric_name,
            });
        }

        Ok(definitions)
    }
}

fn read_definition_file(path: &Path) -> Result<Vec<CounterEntry>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| CounterEntry {
            path: line.to_string(),
            name: None,
            interval_ms: None,
        })
        .collect())
}

// ─── Publishing ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    #[default]
    Drop,
    Sentinel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub format: WireFormat,

    /// Prepended to every metric name, joined with `.`.
    #[serde(default)]
    pub prefix: Option<String>,

    /// statsd `@rate` suffix, in (0, 1].
    #[serde(default)]
    pub sample_rate: Option<f64>,

    /// Decimal places on the wire.
    #[serde(default = "default_precision")]
    pub precision: usize,

    /// What to publish for failed reads.
    #[serde(default)]
    pub failure_policy: FailureMode,

    /// Value published for failed reads under `sentinel`.
    #[serde(default = "default_sentinel")]
    pub sentinel_value: f64,

    #[serde(default)]
    pub batch_window_ms: Option<u64>,

    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8125
}
fn default_precision() -> usize {
    3
}
fn default_sentinel() -> f64 {
    -1.0
}
fn default_max_payload_bytes() -> usize {
    publisher::DEFAULT_MAX_PAYLOAD_BYTES
}
fn default_queue_capacity() -> usize {
    publisher::DEFAULT_QUEUE_CAPACITY
}
fn default_connect_timeout_ms() -> u64 {
    publisher::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}
fn default_send_timeout_ms() -> u64 {
    publisher::DEFAULT_SEND_TIMEOUT.as_millis() as u64
}
fn default_shutdown_timeout_ms() -> u64 {
    publisher::DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol: Protocol::default(),
            format: WireFormat::default(),
            prefix: None,
            sample_rate: None,
            precision: default_precision(),
            failure_policy: FailureMode::default(),
            sentinel_value: default_sentinel(),
            batch_window_ms: None,
            max_payload_bytes: default_max_payload_bytes(),
            queue_capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl PublishingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("publishing.host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("publishing.port must not be 0".into()));
        }
        if let Some(rate) = self.sample_rate {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(ConfigError::Invalid(
                    "publishing.sample_rate must be in (0, 1]".into(),
                ));
            }
        }
        if self.precision > 12 {
            return Err(ConfigError::Invalid(
                "publishing.precision must be at most 12".into(),
            ));
        }
        if !self.sentinel_value.is_finite() {
            return Err(ConfigError::Invalid(
                "publishing.sentinel_value must be a finite number".into(),
            ));
        }
        if self.max_payload_bytes < 64 {
            return Err(ConfigError::Invalid(
                "publishing.max_payload_bytes must be at least 64".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "publishing.queue_capacity must be greater than 0".into(),
            ));
        }
        if matches!(self.batch_window_ms, Some(0)) {
            return Err(ConfigError::Invalid(
                "publishing.batch_window_ms must be greater than 0 when set".into(),
            ));
        }
        for (field, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("send_timeout_ms", self.send_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "publishing.{field} must be greater than 0"
                )));
            }
        }
        Ok(())
    }

    pub fn target(&self) -> PublishTarget {
        PublishTarget {
            host: self.host.trim().to_string(),
            port: self.port,
            protocol: self.protocol,
            batch_window: self.batch_window_ms.map(Duration::from_millis),
            max_payload_bytes: self.max_payload_bytes,
            queue_capacity: self.queue_capacity,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    pub fn encoder(&self) -> MetricEncoder {
        let failure = match self.failure_policy {
            FailureMode::Drop => FailurePolicy::Drop,
            FailureMode::Sentinel => FailurePolicy::Sentinel(self.sentinel_value),
        };
        MetricEncoder::new(self.format)
            .with_prefix(self.prefix.clone())
            .with_precision(self.precision)
            .with_sample_rate(self.sample_rate)
            .with_failure_policy(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
logging:
  level: debug
sampling:
  default_interval_ms: 10000
  unrecoverable_statuses: [3221228507]
  counters:
    - path: '\Processor(_Total)\% Processor Time'
      name: cpu.usage
      interval_ms: 1000
    - path: '\Memory\Available Bytes'
publishing:
  host: metrics.internal
  port: 8126
  protocol: tcp
  format: graphite
  prefix: servers.web01
  failure_policy: sentinel
  batch_window_ms: 250
"#;

    #[test]
    fn parses_full_document() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.logging.level, "debug");

        let defs = config.sampling.definitions().unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].metric_name, "cpu.usage");
        assert_eq!(defs[0].interval, Duration::from_secs(1));
        assert_eq!(defs[1].metric_name, "memory.available_bytes");
        assert_eq!(defs[1].interval, Duration::from_secs(10));
        assert_eq!(defs[1].id, CounterId(1));

        let publishing = &config.publishing;
        publishing.validate().unwrap();
        assert_eq!(publishing.protocol, Protocol::Tcp);
        assert_eq!(publishing.format, WireFormat::Graphite);
        assert_eq!(publishing.encoder().failure_policy(), FailurePolicy::Sentinel(-1.0));

        let target = publishing.target();
        assert_eq!(target.port, 8126);
        assert_eq!(target.batch_window, Some(Duration::from_millis(250)));
        assert_eq!(target.max_payload_bytes, 1432);
    }

    #[test]
    fn publishing_defaults_apply() {
        let config = Config::from_yaml_str(
            "sampling:\n  counters:\n    - path: '\\Memory\\Available Bytes'\n",
        )
        .unwrap();
        let p = &config.publishing;
        assert_eq!(p.host, "127.0.0.1");
        assert_eq!(p.port, 8125);
        assert_eq!(p.protocol, Protocol::Udp);
        assert_eq!(p.format, WireFormat::Statsd);
        assert_eq!(p.failure_policy, FailureMode::Drop);
        assert!(p.validate().is_ok());
        assert_eq!(config.sampling.read_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn default_publishing_matches_target_defaults() {
        let target = PublishingConfig::default().target();
        assert_eq!(target, PublishTarget::new("127.0.0.1", 8125, Protocol::Udp));
    }

    #[test]
    fn empty_counter_list_is_rejected() {
        let sampling = SamplingConfig::new(Vec::new());
        assert!(matches!(sampling.definitions(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_metric_names_are_rejected() {
        let entry = |path: &str| CounterEntry {
            path: path.into(),
            name: Some("same".into()),
            interval_ms: None,
        };
        let sampling = SamplingConfig::new(vec![
            entry(r"\Memory\Available Bytes"),
            entry(r"\Memory\Committed Bytes"),
        ]);
        let err = sampling.definitions().unwrap_err();
        assert!(err.to_string().contains("same"));
    }

    #[test]
    fn bad_paths_and_intervals_are_rejected() {
        let mut sampling = SamplingConfig::new(vec![CounterEntry {
            path: "Memory".into(),
            name: None,
            interval_ms: None,
        }]);
        assert!(sampling.definitions().is_err());

        sampling.counters[0].path = r"\Memory\Available Bytes".into();
        sampling.counters[0].interval_ms = Some(0);
        assert!(sampling.definitions().is_err());
    }

    #[test]
    fn invalid_publishing_values_are_rejected() {
        let cases: [fn(&mut PublishingConfig); 9] = [
            |p| p.host = "  ".into(),
            |p| p.port = 0,
            |p| p.sample_rate = Some(1.5),
            |p| p.sample_rate = Some(0.0),
            |p| p.max_payload_bytes = 10,
            |p| p.queue_capacity = 0,
            |p| p.send_timeout_ms = 0,
            |p| p.batch_window_ms = Some(0),
            |p| p.sentinel_value = f64::NAN,
        ];
        for mutate in cases {
            let mut p = PublishingConfig::default();
            mutate(&mut p);
            assert!(p.validate().is_err(), "accepted {p:?}");
        }
    }

    #[test]
    fn definition_files_resolve_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut defs = fs::File::create(dir.path().join("counters.txt")).unwrap();
        writeln!(defs, "# processor").unwrap();
        writeln!(defs, r"\Processor(_Total)\% Processor Time").unwrap();
        writeln!(defs).unwrap();
        writeln!(defs, r"\System\System Up Time").unwrap();

        let config_path = dir.path().join("perftap.yaml");
        fs::write(
            &config_path,
            "sampling:\n  default_interval_ms: 2000\n  definition_files: [counters.txt]\n",
        )
        .unwrap();

        let config = Config::load(&config_path).unwrap();
        let defs = config.sampling.definitions().unwrap();
        let names: Vec<_> = defs.iter().map(|d| d.metric_name.as_str()).collect();
        assert_eq!(names, vec!["processor._total.pct_processor_time", "system.system_up_time"]);
        assert!(defs.iter().all(|d| d.interval == Duration::from_secs(2)));
    }

    #[test]
    fn bundled_sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/perftap.yaml");
        let config = Config::load(&path).unwrap();
        config.publishing.validate().unwrap();

        assert_eq!(
            config.sampling.unrecoverable_statuses,
            vec![crate::counters::PDH_ACCESS_DENIED, crate::counters::PDH_CSTATUS_NO_OBJECT]
        );
        let defs = config.sampling.definitions().unwrap();
        assert_eq!(defs.len(), 5);
        assert_eq!(defs[0].metric_name, "cpu.usage");
        assert_eq!(defs[2].metric_name, "physicaldisk._total.disk_reads_per_sec");
        assert_eq!(config.publishing.target().batch_window, Some(Duration::from_millis(250)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::load(Path::new("/nonexistent/perftap.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
