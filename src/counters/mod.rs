//! Performance counter capability.
//!
//! The sampler only ever talks to [`CounterSource`] and [`CounterHandle`].
//! On Windows the source is backed by PDH; elsewhere a `sysinfo` source
//! stands in for the handful of counters that map onto portable data.

mod blocking;
pub mod fake;
#[cfg(windows)]
pub mod pdh;
#[cfg(not(windows))]
pub mod system;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::CounterError;

// ─── Status codes ────────────────────────────────────────────────

pub const PDH_CSTATUS_VALID_DATA: u32 = 0x0000_0000;
pub const PDH_CSTATUS_NEW_DATA: u32 = 0x0000_0001;
pub const PDH_CSTATUS_NO_MACHINE: u32 = 0x8000_07D0;
pub const PDH_CSTATUS_NO_INSTANCE: u32 = 0x8000_07D1;
pub const PDH_NO_DATA: u32 = 0x8000_07D5;
pub const PDH_CALC_NEGATIVE_DENOMINATOR: u32 = 0x8000_07D6;
pub const PDH_CALC_NEGATIVE_VALUE: u32 = 0x8000_07D8;
pub const PDH_CSTATUS_NO_OBJECT: u32 = 0xC000_0BB8;
pub const PDH_CSTATUS_NO_COUNTER: u32 = 0xC000_0BB9;
pub const PDH_CSTATUS_INVALID_DATA: u32 = 0xC000_0BBA;
pub const PDH_INVALID_DATA: u32 = 0xC000_0BC6;
pub const PDH_ACCESS_DENIED: u32 = 0xC000_0BDB;

/// Reported when a read does not complete within the sampler's read timeout.
/// Lives outside the PDH range so it never collides with a real status.
pub const STATUS_READ_TIMEOUT: u32 = 0xE000_0001;

/// Reported when a handle's read task died underneath it.
pub const STATUS_READ_ABORTED: u32 = 0xE000_0002;

/// PDH treats both "valid" and "new" data as a usable value.
pub fn is_success(status: u32) -> bool {
    status == PDH_CSTATUS_VALID_DATA || status == PDH_CSTATUS_NEW_DATA
}

/// How a failed read affects the counter that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Emit the failed sample, try again on the next tick.
    Recoverable,
    /// Emit the failed sample, close the handle, retire the counter.
    Unrecoverable,
}

/// Maps status codes onto [`StatusClass`]. Every non-success status is
/// recoverable unless it is listed explicitly.
#[derive(Debug, Clone, Default)]
pub struct StatusPolicy {
    unrecoverable: HashSet<u32>,
}

impl StatusPolicy {
    pub fn new(unrecoverable: impl IntoIterator<Item = u32>) -> Self {
        Self {
            unrecoverable: unrecoverable.into_iter().collect(),
        }
    }

    pub fn classify(&self, status: u32) -> StatusClass {
        if is_success(status) {
            StatusClass::Success
        } else if self.unrecoverable.contains(&status) {
            StatusClass::Unrecoverable
        } else {
            StatusClass::Recoverable
        }
    }
}

// ─── Counter paths ───────────────────────────────────────────────

/// A parsed `[\\machine]\Category[(Instance)]\Counter` path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CounterPath {
    pub machine: Option<String>,
    pub category: String,
    pub instance: Option<String>,
    pub counter: String,
}

impl CounterPath {
    pub fn parse(raw: &str) -> Result<Self, CounterError> {
        let invalid = || CounterError::InvalidPath(raw.to_string());
        let trimmed = raw.trim();

        let (machine, rest) = match trimmed.strip_prefix(r"\\") {
            Some(after) => {
                let (machine, rest) = after.split_once('\\').ok_or_else(invalid)?;
                if machine.is_empty() {
                    return Err(invalid());
                }
                (Some(machine.to_string()), rest)
            }
            None => (None, trimmed.strip_prefix('\\').ok_or_else(invalid)?),
        };

        // Instance names may contain backslashes inside the parentheses,
        // so split on the last `)\` when there is one.
        let (object, counter) = match rest.rfind(")\\") {
            Some(close) => (&rest[..=close], &rest[close + 2..]),
            None => rest.split_once('\\').ok_or_else(invalid)?,
        };

        let (category, instance) = match object.find('(') {
            Some(open) => {
                let inner = object[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(invalid)?;
                (&object[..open], Some(inner.to_string()))
            }
            None => (object, None),
        };

        if category.is_empty() || counter.is_empty() || counter.contains('\\') {
            return Err(invalid());
        }
        if matches!(instance.as_deref(), Some("")) {
            return Err(invalid());
        }

        Ok(Self {
            machine,
            category: category.to_string(),
            instance,
            counter: counter.to_string(),
        })
    }

    /// Metric key derived from the path, e.g.
    /// `\Processor(_Total)\% Processor Time` → `processor._total.pct_processor_time`.
    pub fn metric_key(&self) -> String {
        let mut segments = Vec::with_capacity(4);
        if let Some(machine) = &self.machine {
            segments.push(key_segment(machine));
        }
        segments.push(key_segment(&self.category));
        if let Some(instance) = &self.instance {
            segments.push(key_segment(instance));
        }
        segments.push(key_segment(&self.counter));
        segments.join(".")
    }
}

impl fmt::Display for CounterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(machine) = &self.machine {
            write!(f, r"\\{machine}")?;
        }
        write!(f, r"\{}", self.category)?;
        if let Some(instance) = &self.instance {
            write!(f, "({instance})")?;
        }
        write!(f, r"\{}", self.counter)
    }
}

fn key_segment(raw: &str) -> String {
    let lowered = raw
        .to_lowercase()
        .replace('%', "pct")
        .replace("/sec", "_per_sec")
        .replace('#', "num");

    let mut out = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    // keep a leading underscore that was part of the name (e.g. `_Total`)
    if raw.starts_with('_') {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    }
}

// ─── Definitions & readings ──────────────────────────────────────

/// Index of a definition within the run's counter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CounterId(pub usize);

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One counter to sample: where it lives, how often, and what it is
/// published as.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterDefinition {
    pub id: CounterId,
    pub path: CounterPath,
    pub interval: Duration,
    pub metric_name: String,
}

/// A single value/status pair as returned by a handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterReading {
    pub value: f64,
    pub status: u32,
}

impl CounterReading {
    pub fn ok(value: f64) -> Self {
        Self {
            value,
            status: PDH_CSTATUS_VALID_DATA,
        }
    }

    pub fn failed(status: u32) -> Self {
        Self { value: 0.0, status }
    }
}

// ─── Capability traits ───────────────────────────────────────────

/// Opens counter handles. One source serves a whole run.
pub trait CounterSource: Send + Sync {
    fn open(&self, definition: &CounterDefinition) -> Result<Box<dyn CounterHandle>, CounterError>;
}

/// An open counter. `read` never fails outright: missing data comes back
/// as a non-success status. `close` must be idempotent.
#[async_trait]
pub trait CounterHandle: Send {
    async fn read(&mut self) -> CounterReading;

    fn close(&mut self);
}

/// Source for the current platform.
#[cfg(windows)]
pub fn platform_source() -> Box<dyn CounterSource> {
    Box::new(pdh::PdhSource::new())
}

/// Source for the current platform.
#[cfg(not(windows))]
pub fn platform_source() -> Box<dyn CounterSource> {
    Box::new(system::SystemSource::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instance_path() {
        let path = CounterPath::parse(r"\Processor(_Total)\% Processor Time").unwrap();
        assert_eq!(path.machine, None);
        assert_eq!(path.category, "Processor");
        assert_eq!(path.instance.as_deref(), Some("_Total"));
        assert_eq!(path.counter, "% Processor Time");
        assert_eq!(path.to_string(), r"\Processor(_Total)\% Processor Time");
    }

    #[test]
    fn parses_machine_and_plain_paths() {
        let path = CounterPath::parse(r"\\web01\Memory\Available Bytes").unwrap();
        assert_eq!(path.machine.as_deref(), Some("web01"));
        assert_eq!(path.category, "Memory");
        assert_eq!(path.instance, None);
        assert_eq!(path.counter, "Available Bytes");
    }

    #[test]
    fn instance_may_contain_separators() {
        let path = CounterPath::parse(r"\LogicalDisk(C:\)\% Free Space").unwrap();
        assert_eq!(path.instance.as_deref(), Some(r"C:\"));
        assert_eq!(path.counter, "% Free Space");
    }

    #[test]
    fn rejects_malformed_paths() {
        for raw in [
            "",
            "Memory",
            r"\Memory",
            r"\Memory\",
            r"\\\Memory\Available Bytes",
            r"\Processor()\% Processor Time",
            r"\Processor(_Total\% Processor Time",
        ] {
            assert!(CounterPath::parse(raw).is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn derives_metric_keys() {
        let key = |raw: &str| CounterPath::parse(raw).unwrap().metric_key();
        assert_eq!(
            key(r"\Processor(_Total)\% Processor Time"),
            "processor._total.pct_processor_time"
        );
        assert_eq!(key(r"\Memory\Available Bytes"), "memory.available_bytes");
        assert_eq!(
            key(r"\Network Interface(eth0)\Bytes Sent/sec"),
            "network_interface.eth0.bytes_sent_per_sec"
        );
    }

    #[test]
    fn classifies_statuses() {
        let policy = StatusPolicy::new([PDH_ACCESS_DENIED]);
        assert_eq!(policy.classify(PDH_CSTATUS_VALID_DATA), StatusClass::Success);
        assert_eq!(policy.classify(PDH_CSTATUS_NEW_DATA), StatusClass::Success);
        assert_eq!(policy.classify(PDH_CSTATUS_NO_INSTANCE), StatusClass::Recoverable);
        assert_eq!(policy.classify(PDH_ACCESS_DENIED), StatusClass::Unrecoverable);

        let lenient = StatusPolicy::default();
        assert_eq!(lenient.classify(PDH_ACCESS_DENIED), StatusClass::Recoverable);
    }
}
