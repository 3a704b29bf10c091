//! Local USB access behind closed sum types.
//!
//! The exporter core only ever sees [`Backend`] and [`OpenedDevice`]; which
//! variant is inside is decided once at startup (libusb) or in a test
//! constructor (mock). Transfer results use the signed negative-errno
//! convention that flows straight into RET_SUBMIT status fields.

pub mod libusb;
pub mod mock;

pub use libusb::LibusbBackend;
pub use mock::{MockBackend, MockDeviceSpec};

use protocol::device::DeviceRecord;
use std::time::Duration;
use thiserror::Error;

/// Device-class allow list applied at enumeration time.
///
/// A device is exportable when its device class, or the class of any of its
/// interfaces, is in the allowed set. An empty set allows everything.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    classes: Vec<u8>,
}

impl DeviceFilter {
    pub fn allow_classes(classes: Vec<u8>) -> Self {
        Self { classes }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn matches(&self, record: &DeviceRecord) -> bool {
        if self.classes.is_empty() {
            return true;
        }
        self.classes.contains(&record.device_class)
            || record
                .interfaces
                .iter()
                .any(|itf| self.classes.contains(&itf.class))
    }
}

/// Endpoint transfer type, read from the configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One transfer handed to the device backend. Endpoint addresses carry the
/// direction bit (0x80 = IN).
#[derive(Debug, Clone)]
pub enum TransferRequest {
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        data: Vec<u8>,
    },
    Bulk {
        endpoint: u8,
        length: u32,
        data: Vec<u8>,
    },
    Interrupt {
        endpoint: u8,
        length: u32,
        data: Vec<u8>,
    },
}

/// Backend completion: zero or negative-errno status, the byte count, and
/// the inbound bytes for IN transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: i32,
    pub actual_length: u32,
    pub data: Vec<u8>,
}

impl TransferOutcome {
    /// IN transfer that produced `data`.
    pub fn received(data: Vec<u8>) -> Self {
        Self {
            status: 0,
            actual_length: data.len() as u32,
            data,
        }
    }

    /// OUT transfer that accepted `length` bytes.
    pub fn sent(length: u32) -> Self {
        Self {
            status: 0,
            actual_length: length,
            data: Vec::new(),
        }
    }

    pub fn error(errno: i32) -> Self {
        Self {
            status: -errno.abs(),
            actual_length: 0,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("USB enumeration failed: {0}")]
    Enumeration(String),
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("device {busid} not found")]
    NotFound { busid: String },

    #[error("device {busid} is already exported")]
    AlreadyExported { busid: String },

    #[error("device {busid} could not be opened: {reason}")]
    Device { busid: String, reason: String },
}

/// The local USB access layer.
pub enum Backend {
    Libusb(LibusbBackend),
    Mock(MockBackend),
}

impl Backend {
    /// Snapshot the local bus, applying the class filter.
    pub fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<DeviceRecord>, BackendError> {
        match self {
            Backend::Libusb(backend) => backend.enumerate(filter),
            Backend::Mock(backend) => backend.enumerate(filter),
        }
    }

    /// Open a device for exclusive use by one session.
    pub fn open(&self, busid: &str) -> Result<OpenedDevice, OpenError> {
        match self {
            Backend::Libusb(backend) => backend.open(busid).map(OpenedDevice::Libusb),
            Backend::Mock(backend) => backend.open(busid).map(OpenedDevice::Mock),
        }
    }
}

/// An opened device, owned by exactly one exporter session.
pub enum OpenedDevice {
    Libusb(libusb::LibusbDevice),
    Mock(mock::MockDevice),
}

impl OpenedDevice {
    pub fn record(&self) -> &DeviceRecord {
        match self {
            OpenedDevice::Libusb(device) => device.record(),
            OpenedDevice::Mock(device) => device.record(),
        }
    }

    /// Transfer type of `endpoint` per the configuration descriptor, if the
    /// endpoint is known.
    pub fn endpoint_kind(&self, endpoint: u8) -> Option<TransferKind> {
        match self {
            OpenedDevice::Libusb(device) => device.endpoint_kind(endpoint),
            OpenedDevice::Mock(device) => device.endpoint_kind(endpoint),
        }
    }

    /// Execute one transfer synchronously. Never panics on device failure;
    /// errors come back as negative-errno status.
    pub fn execute(&mut self, request: TransferRequest, timeout: Duration) -> TransferOutcome {
        match self {
            OpenedDevice::Libusb(device) => device.execute(request, timeout),
            OpenedDevice::Mock(device) => device.execute(request, timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::device::{DeviceInterface, DeviceSpeed};

    fn record_with_classes(device_class: u8, interface_class: u8) -> DeviceRecord {
        DeviceRecord {
            path: "/sys/bus/usb/devices/1-1".to_string(),
            busid: "1-1".to_string(),
            busnum: 1,
            devnum: 1,
            speed: DeviceSpeed::High,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0100,
            device_class,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
            interfaces: vec![DeviceInterface {
                class: interface_class,
                subclass: 0,
                protocol: 0,
            }],
        }
    }

    #[test]
    fn test_filter_matches_device_class() {
        let filter = DeviceFilter::allow_classes(vec![0x08]);
        assert!(filter.matches(&record_with_classes(0x08, 0x00)));
        assert!(!filter.matches(&record_with_classes(0x03, 0x03)));
    }

    #[test]
    fn test_filter_matches_interface_class() {
        // Composite devices report class 0 at the device level and the real
        // class per interface.
        let filter = DeviceFilter::allow_classes(vec![0x08]);
        assert!(filter.matches(&record_with_classes(0x00, 0x08)));
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = DeviceFilter::allow_all();
        assert!(filter.matches(&record_with_classes(0x03, 0x03)));
    }

    #[test]
    fn test_outcome_constructors() {
        let outcome = TransferOutcome::received(vec![1, 2, 3]);
        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.actual_length, 3);

        let outcome = TransferOutcome::sent(512);
        assert_eq!(outcome.actual_length, 512);
        assert!(outcome.data.is_empty());

        let outcome = TransferOutcome::error(protocol::errno::ETIMEDOUT);
        assert_eq!(outcome.status, -110);
        assert_eq!(outcome.actual_length, 0);
    }
}
