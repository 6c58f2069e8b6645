//! Portable stand-in for PDH, backed by `sysinfo`. Only the counters with
//! an obvious cross-platform meaning are recognised.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::System;

use super::blocking::BlockingCell;
use super::{
    CounterDefinition, CounterHandle, CounterPath, CounterReading, CounterSource,
    PDH_CSTATUS_NO_COUNTER, PDH_CSTATUS_NO_INSTANCE, PDH_CSTATUS_NO_OBJECT,
};
use crate::error::CounterError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum SystemCounter {
    CpuTotal,
    CpuIdle,
    CpuCore(usize),
    MemoryAvailable,
    MemoryCommitted,
    MemoryCommittedPct,
    UpTime,
}

impl SystemCounter {
    fn resolve(path: &CounterPath, cpu_count: usize) -> Result<Self, u32> {
        let category = path.category.to_ascii_lowercase();
        let counter = path.counter.to_ascii_lowercase();
        let instance = path.instance.as_deref().map(str::to_ascii_lowercase);

        match category.as_str() {
            "processor" | "processor information" => {
                let core = match instance.as_deref() {
                    None | Some("_total") => None,
                    Some(n) => match n.parse::<usize>() {
                        Ok(n) if n < cpu_count => Some(n),
                        _ => return Err(PDH_CSTATUS_NO_INSTANCE),
                    },
                };
                match (counter.as_str(), core) {
                    ("% processor time", None) => Ok(Self::CpuTotal),
                    ("% processor time", Some(n)) => Ok(Self::CpuCore(n)),
                    ("% idle time", None) => Ok(Self::CpuIdle),
                    _ => Err(PDH_CSTATUS_NO_COUNTER),
                }
            }
            "memory" => match counter.as_str() {
                "available bytes" => Ok(Self::MemoryAvailable),
                "committed bytes" => Ok(Self::MemoryCommitted),
                "% committed bytes in use" => Ok(Self::MemoryCommittedPct),
                _ => Err(PDH_CSTATUS_NO_COUNTER),
            },
            "system" => match counter.as_str() {
                "system up time" => Ok(Self::UpTime),
                _ => Err(PDH_CSTATUS_NO_COUNTER),
            },
            _ => Err(PDH_CSTATUS_NO_OBJECT),
        }
    }

    fn sample(self, sys: &mut System) -> f64 {
        match self {
            Self::CpuTotal => {
                sys.refresh_cpu_usage();
                sys.global_cpu_usage() as f64
            }
            Self::CpuIdle => {
                sys.refresh_cpu_usage();
                100.0 - sys.global_cpu_usage() as f64
            }
            Self::CpuCore(n) => {
                sys.refresh_cpu_usage();
                sys.cpus().get(n).map(|c| c.cpu_usage() as f64).unwrap_or(0.0)
            }
            Self::MemoryAvailable => {
                sys.refresh_memory();
                sys.available_memory() as f64
            }
            Self::MemoryCommitted => {
                sys.refresh_memory();
                (sys.used_memory() + sys.used_swap()) as f64
            }
            Self::MemoryCommittedPct => {
                sys.refresh_memory();
                let limit = sys.total_memory() + sys.total_swap();
                if limit == 0 {
                    0.0
                } else {
                    (sys.used_memory() + sys.used_swap()) as f64 * 100.0 / limit as f64
                }
            }
            Self::UpTime => System::uptime() as f64,
        }
    }
}

/// Counter source over a shared `sysinfo::System`.
pub struct SystemSource {
    system: Arc<Mutex<System>>,
}

impl SystemSource {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; take the baseline now.
        system.refresh_cpu_all();
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SystemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for SystemSource {
    fn open(&self, definition: &CounterDefinition) -> Result<Box<dyn CounterHandle>, CounterError> {
        let cpu_count = self.system.lock().cpus().len();
        let counter = SystemCounter::resolve(&definition.path, cpu_count).map_err(|status| {
            CounterError::Unavailable {
                path: definition.path.to_string(),
                status,
            }
        })?;

        Ok(Box::new(SystemHandle {
            counter,
            system: BlockingCell::new(self.system.clone(), drop),
        }))
    }
}

struct SystemHandle {
    counter: SystemCounter,
    system: BlockingCell<Arc<Mutex<System>>>,
}

#[async_trait]
impl CounterHandle for SystemHandle {
    async fn read(&mut self) -> CounterReading {
        let counter = self.counter;
        self.system
            .run(move |system| CounterReading::ok(counter.sample(&mut system.lock())))
            .await
    }

    fn close(&mut self) {
        self.system.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(raw: &str) -> Result<SystemCounter, u32> {
        SystemCounter::resolve(&CounterPath::parse(raw).unwrap(), 4)
    }

    #[test]
    fn resolves_known_counters() {
        assert_eq!(resolve(r"\Processor(_Total)\% Processor Time"), Ok(SystemCounter::CpuTotal));
        assert_eq!(resolve(r"\Processor(2)\% Processor Time"), Ok(SystemCounter::CpuCore(2)));
        assert_eq!(resolve(r"\Memory\Available Bytes"), Ok(SystemCounter::MemoryAvailable));
        assert_eq!(resolve(r"\System\System Up Time"), Ok(SystemCounter::UpTime));
    }

    #[test]
    fn unknown_counters_report_pdh_statuses() {
        assert_eq!(resolve(r"\Processor(9)\% Processor Time"), Err(PDH_CSTATUS_NO_INSTANCE));
        assert_eq!(resolve(r"\Memory\Pool Paged Bytes"), Err(PDH_CSTATUS_NO_COUNTER));
        assert_eq!(resolve(r"\SQLServer:Locks\Lock Waits/sec"), Err(PDH_CSTATUS_NO_OBJECT));
    }
}
