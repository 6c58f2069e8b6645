use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CounterDefinition, CounterHandle, CounterReading, CounterSource};
use crate::error::CounterError;

/// Scripted behaviour for one fake counter.
#[derive(Debug, Clone)]
pub struct FakeCounter {
    script: VecDeque<CounterReading>,
    fallback: CounterReading,
    delay: Option<Duration>,
    open_status: Option<u32>,
}

impl FakeCounter {
    /// Always reads `value`.
    pub fn constant(value: f64) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: CounterReading::ok(value),
            delay: None,
            open_status: None,
        }
    }

    /// Plays `readings` in order, then repeats the last one.
    pub fn scripted(readings: impl IntoIterator<Item = CounterReading>) -> Self {
        let script: VecDeque<_> = readings.into_iter().collect();
        let fallback = script.back().copied().unwrap_or(CounterReading::ok(0.0));
        Self {
            script,
            fallback,
            delay: None,
            open_status: None,
        }
    }

    /// Refuses to open with `status`.
    pub fn unavailable(status: u32) -> Self {
        Self {
            open_status: Some(status),
            ..Self::constant(0.0)
        }
    }

    /// Every read sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct FakeState {
    counters: HashMap<String, FakeCounter>,
    opens: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    read_starts: HashMap<String, Vec<Instant>>,
    read_completions: HashMap<String, usize>,
}

/// In-memory counter source for tests. Cloning shares the recorded state,
/// so a test keeps one clone and hands the other to the sampler.
#[derive(Clone, Default)]
pub struct FakeCounterSource {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCounterSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a counter under its path as written in configuration.
    pub fn with_counter(self, path: &str, counter: FakeCounter) -> Self {
        self.state.lock().counters.insert(path.to_string(), counter);
        self
    }

    pub fn open_count(&self, path: &str) -> usize {
        self.state.lock().opens.get(path).copied().unwrap_or(0)
    }

    pub fn close_count(&self, path: &str) -> usize {
        self.state.lock().closes.get(path).copied().unwrap_or(0)
    }

    /// Instants at which each read of `path` began.
    pub fn reads(&self, path: &str) -> Vec<Instant> {
        self.state
            .lock()
            .read_starts
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn completed_reads(&self, path: &str) -> usize {
        self.state
            .lock()
            .read_completions
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

impl CounterSource for FakeCounterSource {
    fn open(&self, definition: &CounterDefinition) -> Result<Box<dyn CounterHandle>, CounterError> {
        let key = definition.path.to_string();
        let mut state = self.state.lock();
        let Some(counter) = state.counters.get(&key) else {
            return Err(CounterError::Unavailable {
                path: key,
                status: super::PDH_CSTATUS_NO_OBJECT,
            });
        };
        if let Some(status) = counter.open_status {
            return Err(CounterError::Unavailable { path: key, status });
        }
        *state.opens.entry(key.clone()).or_default() += 1;

        Ok(Box::new(FakeHandle {
            key,
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct FakeHandle {
    key: String,
    state: Arc<Mutex<FakeState>>,
    closed: bool,
}

#[async_trait]
impl CounterHandle for FakeHandle {
    async fn read(&mut self) -> CounterReading {
        assert!(!self.closed, "read on closed counter {}", self.key);

        let delay = {
            let mut state = self.state.lock();
            state
                .read_starts
                .entry(self.key.clone())
                .or_default()
                .push(Instant::now());
            state.counters.get(&self.key).and_then(|c| c.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        *state.read_completions.entry(self.key.clone()).or_default() += 1;
        match state.counters.get_mut(&self.key) {
            Some(counter) => counter.script.pop_front().unwrap_or(counter.fallback),
            None => CounterReading::failed(super::PDH_CSTATUS_NO_OBJECT),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        *self.state.lock().closes.entry(self.key.clone()).or_default() += 1;
    }
}
