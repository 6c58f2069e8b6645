use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::transport::{Connector, Transport};
use crate::error::PublishError;

#[derive(Default)]
struct RecorderState {
    payloads: Vec<Vec<u8>>,
    connects: usize,
    closes: usize,
    failing_connects: usize,
    failing_sends: usize,
    send_delay: Option<Duration>,
    unreachable: bool,
}

/// Connector that keeps every payload in memory. Clones share state.
#[derive(Clone, Default)]
pub struct RecordingConnector {
    state: Arc<Mutex<RecorderState>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the startup reachability check.
    pub fn unreachable(self) -> Self {
        self.state.lock().unreachable = true;
        self
    }

    /// Every send sleeps this long first.
    pub fn with_send_delay(self, delay: Duration) -> Self {
        self.state.lock().send_delay = Some(delay);
        self
    }

    /// The next `n` sends fail with a connection reset.
    pub fn failing_sends(self, n: usize) -> Self {
        self.state.lock().failing_sends = n;
        self
    }

    /// The next `n` connects are refused.
    pub fn failing_connects(self, n: usize) -> Self {
        self.state.lock().failing_connects = n;
        self
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.state.lock().payloads.clone()
    }

    /// Every line received so far, in arrival order.
    pub fn lines(&self) -> Vec<String> {
        self.state
            .lock()
            .payloads
            .iter()
            .flat_map(|p| {
                String::from_utf8_lossy(p)
                    .lines()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    fn describe(&self) -> String {
        "recorder".into()
    }

    async fn check(&self) -> Result<(), PublishError> {
        if self.state.lock().unreachable {
            return Err(PublishError::Unresolvable {
                target: "recorder".into(),
                reason: "marked unreachable".into(),
            });
        }
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn Transport>, PublishError> {
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(PublishError::Connect {
                target: "recorder".into(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            });
        }
        state.connects += 1;
        Ok(Box::new(RecordingTransport {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct RecordingTransport {
    state: Arc<Mutex<RecorderState>>,
    closed: bool,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        let delay = self.state.lock().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(PublishError::Send(std::io::ErrorKind::ConnectionReset.into()));
        }
        state.payloads.push(payload.to_vec());
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().closes += 1;
        }
    }
}
