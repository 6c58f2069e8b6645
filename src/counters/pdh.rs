//! PDH-backed counter handles. Each handle owns one query with a single
//! counter attached; the query is collected on every read.

use async_trait::async_trait;
use windows_sys::Win32::System::Performance::{
    PdhAddEnglishCounterW, PdhCloseQuery, PdhCollectQueryData, PdhGetFormattedCounterValue,
    PdhOpenQueryW, PDH_FMT_COUNTERVALUE, PDH_FMT_DOUBLE, PDH_HCOUNTER, PDH_HQUERY,
};

use super::blocking::BlockingCell;
use super::{CounterDefinition, CounterHandle, CounterReading, CounterSource, PDH_CSTATUS_VALID_DATA};
use crate::error::CounterError;

/// Query/counter pair. Only ever touched by one blocking job at a time.
struct Query {
    query: PDH_HQUERY,
    counter: PDH_HCOUNTER,
}

// PDH handles are process-wide identifiers, usable from any thread.
unsafe impl Send for Query {}

impl Query {
    fn open(path: &str) -> Result<Self, u32> {
        let wide: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();

        // SAFETY: out-pointers are valid locals; `wide` is NUL-terminated
        // and outlives the call. Zero is the null handle.
        unsafe {
            let mut query: PDH_HQUERY = std::mem::zeroed();
            let mut counter: PDH_HCOUNTER = std::mem::zeroed();

            let status = PdhOpenQueryW(std::ptr::null(), 0, &mut query);
            if status != PDH_CSTATUS_VALID_DATA {
                return Err(status);
            }
            let status = PdhAddEnglishCounterW(query, wide.as_ptr(), 0, &mut counter);
            if status != PDH_CSTATUS_VALID_DATA {
                PdhCloseQuery(query);
                return Err(status);
            }
            // Rate counters need a first collection as their baseline.
            PdhCollectQueryData(query);

            Ok(Self { query, counter })
        }
    }

    fn read(&mut self) -> CounterReading {
        // SAFETY: handles stay valid until `close`, which consumes the query.
        unsafe {
            let status = PdhCollectQueryData(self.query);
            if status != PDH_CSTATUS_VALID_DATA {
                return CounterReading::failed(status);
            }

            let mut value: PDH_FMT_COUNTERVALUE = std::mem::zeroed();
            let status = PdhGetFormattedCounterValue(
                self.counter,
                PDH_FMT_DOUBLE,
                std::ptr::null_mut(),
                &mut value,
            );
            if status != PDH_CSTATUS_VALID_DATA {
                return CounterReading::failed(status);
            }

            CounterReading {
                value: value.Anonymous.doubleValue,
                status: value.CStatus,
            }
        }
    }

    fn close(self) {
        // SAFETY: the query was opened by `open` and is consumed here.
        unsafe {
            PdhCloseQuery(self.query);
        }
    }
}

#[derive(Default)]
pub struct PdhSource;

impl PdhSource {
    pub fn new() -> Self {
        Self
    }
}

impl CounterSource for PdhSource {
    fn open(&self, definition: &CounterDefinition) -> Result<Box<dyn CounterHandle>, CounterError> {
        let path = definition.path.to_string();
        let query = Query::open(&path)
            .map_err(|status| CounterError::Unavailable { path, status })?;

        Ok(Box::new(PdhCounter {
            query: BlockingCell::new(query, Query::close),
        }))
    }
}

struct PdhCounter {
    query: BlockingCell<Query>,
}

#[async_trait]
impl CounterHandle for PdhCounter {
    async fn read(&mut self) -> CounterReading {
        self.query.run(Query::read).await
    }

    fn close(&mut self) {
        self.query.close();
    }
}
