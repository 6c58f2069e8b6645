//! Raw sample → wire line. Stateless; the same input always produces the
//! same bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::counters::{CounterDefinition, CounterId};
use crate::sampler::RawSample;

// ─── Policy types ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// `name:value|g[|@rate]`
    #[default]
    Statsd,
    /// `name:value|kv|@timestamp`
    Statsite,
    /// `name value timestamp`
    Graphite,
}

/// What to publish for a sample whose status is not a success.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailurePolicy {
    /// Publish nothing. The caller counts the suppression.
    Drop,
    /// Publish this value in place of the reading.
    Sentinel(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    KeyValue,
}

/// One line ready for the wire, plus the fields it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMetric {
    pub counter: CounterId,
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub timestamp: DateTime<Utc>,
    /// Wire text without the trailing newline.
    pub line: String,
}

// ─── Encoder ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MetricEncoder {
    format: WireFormat,
    prefix: Option<String>,
    precision: usize,
    sample_rate: Option<f64>,
    failure: FailurePolicy,
}

impl MetricEncoder {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            prefix: None,
            precision: 3,
            sample_rate: None,
            failure: FailurePolicy::Drop,
        }
    }

    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix
            .map(|p| p.trim_matches('.').to_string())
            .filter(|p| !p.is_empty());
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    /// Only meaningful for statsd; a rate of 1 is never written.
    pub fn with_sample_rate(mut self, rate: Option<f64>) -> Self {
        self.sample_rate = rate.filter(|r| *r < 1.0);
        self
    }

    pub fn with_failure_policy(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure
    }

    /// Returns `None` when the sample failed and the policy is `Drop`.
    pub fn encode(&self, sample: &RawSample, definition: &CounterDefinition) -> Option<EncodedMetric> {
        let value = if sample.ok && sample.value.is_finite() {
            sample.value
        } else {
            match self.failure {
                FailurePolicy::Drop => return None,
                FailurePolicy::Sentinel(v) => v,
            }
        };

        let name = self.metric_name(&definition.metric_name);
        let formatted = format_value(value, self.precision);
        let ts = sample.timestamp.timestamp();

        let (kind, line) = match self.format {
            WireFormat::Statsd => {
                let mut line = format!("{name}:{formatted}|g");
                if let Some(rate) = self.sample_rate {
                    line.push_str("|@");
                    line.push_str(&format_value(rate, 6));
                }
                (MetricKind::Gauge, line)
            }
            WireFormat::Statsite => (MetricKind::KeyValue, format!("{name}:{formatted}|kv|@{ts}")),
            WireFormat::Graphite => (MetricKind::Gauge, format!("{name} {formatted} {ts}")),
        };

        Some(EncodedMetric {
            counter: sample.counter,
            name,
            value,
            kind,
            timestamp: sample.timestamp,
            line,
        })
    }

    fn metric_name(&self, base: &str) -> String {
        let full = match &self.prefix {
            Some(prefix) => format!("{prefix}.{base}"),
            None => base.to_string(),
        };
        full.chars()
            .map(|c| if self.is_reserved(c) { '_' } else { c })
            .collect()
    }

    fn is_reserved(&self, c: char) -> bool {
        match self.format {
            WireFormat::Statsd | WireFormat::Statsite => {
                c.is_whitespace() || c == ':' || c == '|' || c == '@'
            }
            WireFormat::Graphite => c.is_whitespace(),
        }
    }
}

/// Fixed-point rendering with trailing zeros removed. Never uses an
/// exponent and never depends on locale.
pub fn format_value(value: f64, precision: usize) -> String {
    let mut text = format!("{value:.precision$}");
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text = "0".into();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{CounterPath, PDH_CSTATUS_NO_INSTANCE};
    use chrono::TimeZone;
    use std::time::Duration;

    fn definition(name: &str) -> CounterDefinition {
        CounterDefinition {
            id: CounterId(0),
            path: CounterPath::parse(r"\Processor(_Total)\% Processor Time").unwrap(),
            interval: Duration::from_secs(1),
            metric_name: name.to_string(),
        }
    }

    fn sample(value: f64, status: u32) -> RawSample {
        RawSample::new(
            CounterId(0),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            value,
            status,
        )
    }

    #[test]
    fn formats_fixed_point() {
        assert_eq!(format_value(12.5, 3), "12.5");
        assert_eq!(format_value(3.0, 3), "3");
        assert_eq!(format_value(0.000_04, 3), "0");
        assert_eq!(format_value(-0.000_04, 3), "0");
        assert_eq!(format_value(1e20, 2), "100000000000000000000");
        assert_eq!(format_value(2.0 / 3.0, 4), "0.6667");
        assert_eq!(format_value(42.0, 0), "42");
    }

    #[test]
    fn statsd_gauge_with_rate() {
        let enc = MetricEncoder::new(WireFormat::Statsd)
            .with_prefix(Some("hosts.web01.".into()))
            .with_sample_rate(Some(0.5));
        let out = enc.encode(&sample(12.25, 0), &definition("cpu.usage")).unwrap();
        assert_eq!(out.line, "hosts.web01.cpu.usage:12.25|g|@0.5");
        assert_eq!(out.kind, MetricKind::Gauge);
        assert_eq!(out.name, "hosts.web01.cpu.usage");
    }

    #[test]
    fn statsite_and_graphite_carry_timestamps() {
        let s = sample(1.0, 0);
        let kv = MetricEncoder::new(WireFormat::Statsite)
            .encode(&s, &definition("mem.free"))
            .unwrap();
        assert_eq!(kv.line, "mem.free:1|kv|@1714564800");
        assert_eq!(kv.kind, MetricKind::KeyValue);

        let graphite = MetricEncoder::new(WireFormat::Graphite)
            .encode(&s, &definition("mem.free"))
            .unwrap();
        assert_eq!(graphite.line, "mem.free 1 1714564800");
    }

    #[test]
    fn reserved_characters_are_replaced() {
        let out = MetricEncoder::new(WireFormat::Statsd)
            .encode(&sample(1.0, 0), &definition("disk c:|free @ root"))
            .unwrap();
        assert_eq!(out.line, "disk_c__free___root:1|g");
    }

    #[test]
    fn failure_policy_is_applied() {
        let failed = sample(99.0, PDH_CSTATUS_NO_INSTANCE);
        let def = definition("cpu.usage");

        let dropping = MetricEncoder::new(WireFormat::Statsd);
        assert_eq!(dropping.encode(&failed, &def), None);

        let sentinel = MetricEncoder::new(WireFormat::Statsd)
            .with_failure_policy(FailurePolicy::Sentinel(-1.0));
        assert_eq!(sentinel.encode(&failed, &def).unwrap().line, "cpu.usage:-1|g");

        let nan = sample(f64::NAN, 0);
        assert_eq!(dropping.encode(&nan, &def), None);
    }

    #[test]
    fn encoding_is_idempotent() {
        let enc = MetricEncoder::new(WireFormat::Statsite)
            .with_prefix(Some("perf".into()))
            .with_precision(6);
        let s = sample(1.0 / 3.0, 0);
        let def = definition("cpu.usage");

        let first = enc.encode(&s, &def).unwrap();
        let second = enc.encode(&s, &def).unwrap();
        assert_eq!(first.line.as_bytes(), second.line.as_bytes());
        assert_eq!(first, second);
    }
}
