//! Runs a counter backend's blocking calls on the blocking pool, at most
//! one job per handle.
//!
//! A read abandoned by the sampler's timeout keeps its job running. Until
//! that job returns, further reads fail fast with `STATUS_READ_TIMEOUT`
//! instead of queueing more blocking threads behind it, and `close` never
//! waits for it: release is handed to the job when it finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{CounterReading, STATUS_READ_ABORTED, STATUS_READ_TIMEOUT};

struct Shared<T> {
    resource: Mutex<Option<T>>,
    in_flight: AtomicBool,
    closed: AtomicBool,
    release: fn(T),
}

impl<T> Shared<T> {
    fn release_now(&self) {
        if let Some(resource) = self.resource.lock().take() {
            (self.release)(resource);
        }
    }
}

pub(crate) struct BlockingCell<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> BlockingCell<T> {
    /// `release` runs exactly once, from `close` or from the last job.
    pub(crate) fn new(resource: T, release: fn(T)) -> Self {
        Self {
            shared: Arc::new(Shared {
                resource: Mutex::new(Some(resource)),
                in_flight: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                release,
            }),
        }
    }

    pub(crate) async fn run<F>(&self, job: F) -> CounterReading
    where
        F: FnOnce(&mut T) -> CounterReading + Send + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return CounterReading::failed(STATUS_READ_ABORTED);
        }
        if self.shared.in_flight.swap(true, Ordering::SeqCst) {
            debug!("previous read still running, skipping");
            return CounterReading::failed(STATUS_READ_TIMEOUT);
        }

        let guard = InFlight(self.shared.clone());
        let task = tokio::task::spawn_blocking(move || {
            let guard = guard;
            let mut slot = guard.0.resource.lock();
            let reading = match slot.as_mut() {
                Some(resource) => job(resource),
                None => CounterReading::failed(STATUS_READ_ABORTED),
            };
            drop(slot);
            reading
        });

        match task.await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "counter read task failed");
                CounterReading::failed(STATUS_READ_ABORTED)
            }
        }
    }

    /// Never blocks. With a job still running, the resource is released
    /// when that job returns.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        match self.shared.resource.try_lock() {
            Some(mut slot) => {
                if let Some(resource) = slot.take() {
                    (self.shared.release)(resource);
                }
            }
            None => debug!("read in flight, release deferred"),
        }
    }
}

/// Clears the in-flight mark when the job ends and performs a release that
/// `close` had to defer.
struct InFlight<T>(Arc<Shared<T>>);

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
        if self.0.closed.load(Ordering::SeqCst) {
            self.0.release_now();
        }
    }
}
