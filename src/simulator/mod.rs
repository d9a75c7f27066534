//! Fault-injecting call simulator
//!
//! [`Simulator::call`] stands in for a remote API call: it sleeps for a
//! random latency, draws a status code, renders a small JSON body and copies
//! it (plus a terminator) into a buffer on the simulated heap. Ownership of
//! that buffer passes to the caller, who must release it exactly once.
//!
//! The [`FaultSelector`] passed to each call additionally manufactures exactly
//! one class of defect in the process-wide [`FaultStore`]. Selectors never
//! combine; the only randomness in a call is its latency and status code.

pub mod fault;

pub use fault::{global_fault_store, FaultCounts, FaultSelector, FaultStore};

use crate::config::SimulatorSettings;
use crate::error::Result;
use crate::memory::RawBuffer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Labeled fields carried in a simulated response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub endpoint: String,
    pub size: usize,
    pub sim_delay_ms: u64,
}

impl ResponseBody {
    pub fn render(&self) -> String {
        // Plain strings and integers always serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}

/// Response to a simulated call
#[derive(Debug, Clone)]
pub struct SimulatedResponse {
    /// HTTP-style status code
    pub status: u16,

    /// Rendered body text
    pub body: String,

    /// Heap copy of the body plus terminator, owned by the caller
    pub raw: RawBuffer,

    /// Length of `raw`
    pub raw_size: usize,

    /// Defect manufactured during the call
    pub fault: FaultSelector,

    /// Simulated latency
    pub delay: Duration,
}

/// Thread-safe call simulator
#[derive(Debug)]
pub struct Simulator {
    settings: SimulatorSettings,
    rng: Mutex<StdRng>,
    store: Arc<FaultStore>,
}

impl Simulator {
    /// Simulator over the process-wide fault store
    pub fn new(settings: SimulatorSettings) -> Result<Self> {
        Self::with_store(settings, global_fault_store(), None)
    }

    /// Simulator over `store`, optionally with a fixed seed
    ///
    /// Fails with [`HarnessError::InvalidConfig`](crate::error::HarnessError)
    /// when a latency or status range is empty or a status lies outside
    /// 200..=599.
    pub fn with_store(
        settings: SimulatorSettings,
        store: Arc<FaultStore>,
        seed: Option<u64>,
    ) -> Result<Self> {
        settings.validate()?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            settings,
            rng: Mutex::new(rng),
            store,
        })
    }

    pub fn store(&self) -> &Arc<FaultStore> {
        &self.store
    }

    pub fn settings(&self) -> &SimulatorSettings {
        &self.settings
    }

    /// Simulate a call to `endpoint` carrying `payload_size` bytes
    pub fn call(&self, endpoint: &str, payload_size: usize, fault: FaultSelector) -> SimulatedResponse {
        let (delay_ms, status) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            (
                rng.gen_range(self.settings.min_latency_ms..=self.settings.max_latency_ms),
                rng.gen_range(self.settings.min_status..=self.settings.max_status),
            )
        };
        let delay = Duration::from_millis(delay_ms);
        std::thread::sleep(delay);

        let body = ResponseBody {
            endpoint: endpoint.to_string(),
            size: payload_size,
            sim_delay_ms: delay_ms,
        }
        .render();

        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.extend_from_slice(body.as_bytes());
        bytes.push(0);
        let raw_size = bytes.len();
        let handle = self.store.heap().allocate_from(bytes);
        let raw = RawBuffer::new(Arc::clone(self.store.heap()), handle, raw_size);

        self.inject(fault, payload_size, &raw);
        debug!(endpoint, status, delay_ms, %fault, "Simulated call");

        SimulatedResponse {
            status,
            body,
            raw,
            raw_size,
            fault,
            delay,
        }
    }

    fn inject(&self, fault: FaultSelector, payload_size: usize, raw: &RawBuffer) {
        match fault {
            FaultSelector::None => {}
            FaultSelector::LeakBuffer => {
                let size = if payload_size > 0 {
                    payload_size
                } else {
                    self.settings.leak_fallback_size
                };
                self.store.leak_buffer(size);
            }
            FaultSelector::DoubleRelease => {
                self.store.double_release(self.settings.double_release_size);
            }
            FaultSelector::ReferenceCycle => {
                self.store.create_cycle();
            }
            FaultSelector::DanglingReference => self.store.dangle(raw),
        }
    }
}
