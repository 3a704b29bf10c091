//! In-memory device backend for tests.
//!
//! Behaves like a tiny bus: fixed device specs, scripted IN data per
//! endpoint, captured OUT data, and injectable per-endpoint failures. State
//! is shared behind an `Arc` so a test can keep a handle while a session
//! owns the opened device.

use super::{
    BackendError, DeviceFilter, OpenError, TransferKind, TransferOutcome, TransferRequest,
};
use protocol::device::DeviceRecord;
use protocol::errno;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// GET_DESCRIPTOR request code.
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// One simulated device.
#[derive(Debug, Clone)]
pub struct MockDeviceSpec {
    pub record: DeviceRecord,
    /// Bytes served for control GET_DESCRIPTOR reads.
    pub descriptor: Vec<u8>,
    /// Endpoint address → transfer type, as a config descriptor would say.
    pub endpoint_kinds: HashMap<u8, TransferKind>,
}

impl MockDeviceSpec {
    pub fn new(record: DeviceRecord) -> Self {
        Self {
            record,
            descriptor: Vec::new(),
            endpoint_kinds: HashMap::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: Vec<u8>) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_endpoint(mut self, endpoint: u8, kind: TransferKind) -> Self {
        self.endpoint_kinds.insert(endpoint, kind);
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    open: HashSet<String>,
    /// Scripted IN payloads, keyed by (busid, endpoint address).
    in_data: HashMap<(String, u8), VecDeque<Vec<u8>>>,
    /// Captured OUT payloads in arrival order, keyed by busid.
    out_data: HashMap<String, Vec<(u8, Vec<u8>)>>,
    /// Forced failures, keyed by (busid, endpoint address).
    failures: HashMap<(String, u8), i32>,
    /// Artificial transfer latency, keyed by (busid, endpoint address).
    delays: HashMap<(String, u8), Duration>,
}

/// Simulated bus shared between a test and the sessions it drives.
#[derive(Clone)]
pub struct MockBackend {
    devices: Arc<Vec<MockDeviceSpec>>,
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new(devices: Vec<MockDeviceSpec>) -> Self {
        Self {
            devices: Arc::new(devices),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<DeviceRecord>, BackendError> {
        Ok(self
            .devices
            .iter()
            .map(|spec| spec.record.clone())
            .filter(|record| filter.matches(record))
            .collect())
    }

    pub fn open(&self, busid: &str) -> Result<MockDevice, OpenError> {
        let spec = self
            .devices
            .iter()
            .find(|spec| spec.record.busid == busid)
            .cloned()
            .ok_or_else(|| OpenError::NotFound {
                busid: busid.to_string(),
            })?;

        let mut state = self.state.lock().unwrap();
        if !state.open.insert(busid.to_string()) {
            return Err(OpenError::AlreadyExported {
                busid: busid.to_string(),
            });
        }

        Ok(MockDevice {
            spec,
            state: Arc::clone(&self.state),
        })
    }

    /// Queue bytes to be returned by the next IN transfer on `endpoint`.
    pub fn push_in_data(&self, busid: &str, endpoint: u8, data: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .in_data
            .entry((busid.to_string(), endpoint))
            .or_default()
            .push_back(data);
    }

    /// Drain everything OUT transfers wrote to the device.
    pub fn take_out_data(&self, busid: &str) -> Vec<(u8, Vec<u8>)> {
        self.state
            .lock()
            .unwrap()
            .out_data
            .remove(busid)
            .unwrap_or_default()
    }

    /// Make every transfer on `endpoint` fail with `-errno`.
    pub fn fail_endpoint(&self, busid: &str, endpoint: u8, errno: i32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((busid.to_string(), endpoint), errno);
    }

    /// Make every transfer on `endpoint` take at least `delay`.
    pub fn delay_endpoint(&self, busid: &str, endpoint: u8, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert((busid.to_string(), endpoint), delay);
    }

    pub fn is_open(&self, busid: &str) -> bool {
        self.state.lock().unwrap().open.contains(busid)
    }
}

/// One opened mock device.
#[derive(Debug)]
pub struct MockDevice {
    spec: MockDeviceSpec,
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn record(&self) -> &DeviceRecord {
        &self.spec.record
    }

    pub fn endpoint_kind(&self, endpoint: u8) -> Option<TransferKind> {
        self.spec.endpoint_kinds.get(&endpoint).copied()
    }

    pub fn execute(&mut self, request: TransferRequest, _timeout: Duration) -> TransferOutcome {
        let busid = self.spec.record.busid.clone();
        let endpoint = match &request {
            TransferRequest::Control { .. } => 0,
            TransferRequest::Bulk { endpoint, .. } => *endpoint,
            TransferRequest::Interrupt { endpoint, .. } => *endpoint,
        };

        let (failure, delay) = {
            let state = self.state.lock().unwrap();
            (
                state.failures.get(&(busid.clone(), endpoint)).copied(),
                state.delays.get(&(busid.clone(), endpoint)).copied(),
            )
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(errno) = failure {
            return TransferOutcome::error(errno);
        }

        match request {
            TransferRequest::Control {
                request_type,
                request,
                length,
                data,
                ..
            } => {
                if request_type & 0x80 != 0 {
                    let payload = if request == REQUEST_GET_DESCRIPTOR {
                        let mut bytes = self.spec.descriptor.clone();
                        bytes.truncate(length as usize);
                        bytes
                    } else {
                        Vec::new()
                    };
                    TransferOutcome::received(payload)
                } else {
                    TransferOutcome::sent(data.len() as u32)
                }
            }

            TransferRequest::Bulk {
                endpoint,
                length,
                data,
            }
            | TransferRequest::Interrupt {
                endpoint,
                length,
                data,
            } => {
                if endpoint & 0x80 != 0 {
                    let mut state = self.state.lock().unwrap();
                    let queued = state
                        .in_data
                        .get_mut(&(busid, endpoint))
                        .and_then(VecDeque::pop_front);
                    match queued {
                        Some(mut bytes) => {
                            bytes.truncate(length as usize);
                            TransferOutcome::received(bytes)
                        }
                        // Nothing scripted: the device has no data to offer.
                        None => TransferOutcome::error(errno::ETIMEDOUT),
                    }
                } else {
                    let mut state = self.state.lock().unwrap();
                    let sent = data.len() as u32;
                    state.out_data.entry(busid).or_default().push((endpoint, data));
                    TransferOutcome::sent(sent)
                }
            }
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap()
            .open
            .remove(&self.spec.record.busid);
    }
}
