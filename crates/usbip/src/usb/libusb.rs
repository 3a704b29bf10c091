//! libusb-backed device access via rusb.
//!
//! Enumeration reads cached descriptors only; opening a device detaches
//! kernel drivers and claims every interface so transfers are not raced by
//! host-side drivers, and closing restores kernel control.

use super::{
    BackendError, DeviceFilter, OpenError, TransferKind, TransferOutcome, TransferRequest,
};
use protocol::device::{DeviceInterface, DeviceRecord, DeviceSpeed};
use protocol::errno;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub struct LibusbBackend {
    context: Context,
}

impl LibusbBackend {
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    /// Snapshot the bus. Devices whose descriptors cannot be read are
    /// skipped, not fatal; the list reflects what is exportable right now.
    pub fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<DeviceRecord>, BackendError> {
        let devices = self
            .context
            .devices()
            .map_err(|e| BackendError::Enumeration(e.to_string()))?;

        let mut records = Vec::new();
        for device in devices.iter() {
            let Some(record) = record_for(&device) else {
                continue;
            };
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn open(&self, busid: &str) -> Result<LibusbDevice, OpenError> {
        let devices = self.context.devices().map_err(|e| OpenError::Device {
            busid: busid.to_string(),
            reason: e.to_string(),
        })?;

        for device in devices.iter() {
            let Some(record) = record_for(&device) else {
                continue;
            };
            if record.busid == busid {
                return LibusbDevice::open(device, record);
            }
        }

        Err(OpenError::NotFound {
            busid: busid.to_string(),
        })
    }
}

/// One opened libusb device with its claimed interfaces and the endpoint
/// map read from the active configuration.
pub struct LibusbDevice {
    record: DeviceRecord,
    handle: DeviceHandle<Context>,
    num_interfaces: u8,
    endpoint_kinds: HashMap<u8, TransferKind>,
}

impl LibusbDevice {
    fn open(device: Device<Context>, record: DeviceRecord) -> Result<Self, OpenError> {
        let busid = record.busid.clone();
        let handle = device.open().map_err(|e| match e {
            rusb::Error::Busy => OpenError::AlreadyExported {
                busid: busid.clone(),
            },
            e => OpenError::Device {
                busid: busid.clone(),
                reason: e.to_string(),
            },
        })?;

        let (num_interfaces, endpoint_kinds) = match device.active_config_descriptor() {
            Ok(config) => {
                let mut kinds = HashMap::new();
                for interface in config.interfaces() {
                    for descriptor in interface.descriptors() {
                        for endpoint in descriptor.endpoint_descriptors() {
                            kinds.insert(endpoint.address(), kind_of(endpoint.transfer_type()));
                        }
                    }
                }
                (config.num_interfaces(), kinds)
            }
            Err(e) => {
                warn!(busid = %busid, "no active config descriptor, assuming 1 interface: {e}");
                (1, HashMap::new())
            }
        };

        // Kernel drivers (usb-storage, usbhid, ...) hold the interfaces we
        // are about to relay; take them over for the session's lifetime.
        for iface in 0..num_interfaces {
            match handle.kernel_driver_active(iface) {
                Ok(true) => {
                    if let Err(e) = handle.detach_kernel_driver(iface) {
                        warn!(busid = %busid, iface, "failed to detach kernel driver: {e}");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(busid = %busid, iface, "cannot query kernel driver: {e}");
                }
            }
        }

        for iface in 0..num_interfaces {
            if let Err(e) = handle.claim_interface(iface) {
                warn!(busid = %busid, iface, "failed to claim interface: {e}");
            }
        }

        debug!(busid = %busid, num_interfaces, "device opened for export");

        Ok(Self {
            record,
            handle,
            num_interfaces,
            endpoint_kinds,
        })
    }

    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    pub fn endpoint_kind(&self, endpoint: u8) -> Option<TransferKind> {
        self.endpoint_kinds.get(&endpoint).copied()
    }

    pub fn execute(&mut self, request: TransferRequest, timeout: Duration) -> TransferOutcome {
        match request {
            TransferRequest::Control {
                request_type,
                request,
                value,
                index,
                length,
                data,
            } => {
                if request_type & 0x80 != 0 {
                    let mut buffer = vec![0u8; length as usize];
                    match self.handle.read_control(
                        request_type,
                        request,
                        value,
                        index,
                        &mut buffer,
                        timeout,
                    ) {
                        Ok(len) => {
                            buffer.truncate(len);
                            TransferOutcome::received(buffer)
                        }
                        Err(e) => TransferOutcome::error(errno_for(e)),
                    }
                } else {
                    match self
                        .handle
                        .write_control(request_type, request, value, index, &data, timeout)
                    {
                        Ok(len) => TransferOutcome::sent(len as u32),
                        Err(e) => TransferOutcome::error(errno_for(e)),
                    }
                }
            }

            TransferRequest::Bulk {
                endpoint,
                length,
                data,
            } => {
                if endpoint & 0x80 != 0 {
                    let mut buffer = vec![0u8; length as usize];
                    match self.read_bulk_clearing_stall(endpoint, &mut buffer, timeout) {
                        Ok(len) => {
                            buffer.truncate(len);
                            TransferOutcome::received(buffer)
                        }
                        Err(e) => TransferOutcome::error(errno_for(e)),
                    }
                } else {
                    match self.write_bulk_clearing_stall(endpoint, &data, timeout) {
                        Ok(len) => TransferOutcome::sent(len as u32),
                        Err(e) => TransferOutcome::error(errno_for(e)),
                    }
                }
            }

            TransferRequest::Interrupt {
                endpoint,
                length,
                data,
            } => {
                if endpoint & 0x80 != 0 {
                    let mut buffer = vec![0u8; length as usize];
                    match self.handle.read_interrupt(endpoint, &mut buffer, timeout) {
                        Ok(len) => {
                            buffer.truncate(len);
                            if len > 0 {
                                trace!(endpoint, len, "interrupt IN data");
                            }
                            TransferOutcome::received(buffer)
                        }
                        Err(e) => TransferOutcome::error(errno_for(e)),
                    }
                } else {
                    match self.handle.write_interrupt(endpoint, &data, timeout) {
                        Ok(len) => TransferOutcome::sent(len as u32),
                        Err(e) => TransferOutcome::error(errno_for(e)),
                    }
                }
            }
        }
    }

    /// Bulk IN with one stall-clear retry. Mass-storage devices stall the
    /// pipe after failed SCSI commands; clearing and retrying once keeps
    /// the session alive through them.
    fn read_bulk_clearing_stall(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        match self.handle.read_bulk(endpoint, buffer, timeout) {
            Err(rusb::Error::Pipe) => {
                warn!(endpoint, "bulk IN pipe error, clearing stall and retrying");
                self.handle.clear_halt(endpoint)?;
                self.handle.read_bulk(endpoint, buffer, timeout)
            }
            result => result,
        }
    }

    fn write_bulk_clearing_stall(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        match self.handle.write_bulk(endpoint, data, timeout) {
            Err(rusb::Error::Pipe) => {
                warn!(endpoint, "bulk OUT pipe error, clearing stall and retrying");
                self.handle.clear_halt(endpoint)?;
                self.handle.write_bulk(endpoint, data, timeout)
            }
            result => result,
        }
    }
}

impl Drop for LibusbDevice {
    fn drop(&mut self) {
        // Give the device back to the kernel so it works locally again.
        for iface in 0..self.num_interfaces {
            if let Err(e) = self.handle.release_interface(iface) {
                debug!(busid = %self.record.busid, iface, "release failed: {e}");
            }
            if let Err(e) = self.handle.attach_kernel_driver(iface) {
                // Fails when no driver was bound to begin with.
                debug!(busid = %self.record.busid, iface, "driver reattach skipped: {e}");
            }
        }
        debug!(busid = %self.record.busid, "device closed");
    }
}

fn record_for(device: &Device<Context>) -> Option<DeviceRecord> {
    let descriptor = device.device_descriptor().ok()?;
    let busid = busid_for(device);

    let (configuration_value, num_interfaces, interfaces) = match device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
    {
        Ok(config) => {
            let interfaces: Vec<DeviceInterface> = config
                .interfaces()
                .filter_map(|interface| {
                    interface.descriptors().next().map(|d| DeviceInterface {
                        class: d.class_code(),
                        subclass: d.sub_class_code(),
                        protocol: d.protocol_code(),
                    })
                })
                .collect();
            (config.number(), interfaces.len() as u8, interfaces)
        }
        Err(_) => (0, 0, Vec::new()),
    };

    Some(DeviceRecord {
        path: format!("/sys/bus/usb/devices/{busid}"),
        busid,
        busnum: u32::from(device.bus_number()),
        devnum: u32::from(device.address()),
        speed: speed_of(device.speed()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device: bcd(descriptor.device_version()),
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        configuration_value,
        num_configurations: descriptor.num_configurations(),
        num_interfaces,
        interfaces,
    })
}

/// Busid in the kernel's "bus-port[.port…]" form, falling back to the
/// device address when the port chain is unavailable.
fn busid_for(device: &Device<Context>) -> String {
    match device.port_numbers() {
        Ok(ports) if !ports.is_empty() => {
            let chain = ports
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(".");
            format!("{}-{}", device.bus_number(), chain)
        }
        _ => format!("{}-{}", device.bus_number(), device.address()),
    }
}

fn speed_of(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super | rusb::Speed::SuperPlus => DeviceSpeed::Super,
        _ => DeviceSpeed::Unknown,
    }
}

fn kind_of(transfer_type: rusb::TransferType) -> TransferKind {
    match transfer_type {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

fn bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

/// Map a rusb error onto the positive errno whose negation goes on the wire.
pub(crate) fn errno_for(error: rusb::Error) -> i32 {
    match error {
        rusb::Error::Timeout => errno::ETIMEDOUT,
        rusb::Error::Pipe => errno::EPIPE,
        rusb::Error::NoDevice => errno::ENODEV,
        rusb::Error::NotFound => errno::ENOENT,
        rusb::Error::Busy => errno::EBUSY,
        rusb::Error::Overflow => errno::EOVERFLOW,
        rusb::Error::InvalidParam => errno::EINVAL,
        rusb::Error::Access => errno::EACCES,
        rusb::Error::NotSupported => errno::ENOSYS,
        _ => errno::EIO,
    }
}
