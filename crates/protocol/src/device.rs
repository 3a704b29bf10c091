//! Device metadata bodies carried in DEVLIST and IMPORT replies.
//!
//! The fixed part of a device body is 312 bytes: a 256-byte sysfs-style path,
//! a 32-byte busid, three `u32` fields (busnum, devnum, speed), three `u16`
//! descriptor fields and six `u8` descriptor fields. In DEVLIST replies the
//! body is followed by one 4-byte entry per interface; IMPORT replies carry
//! the fixed part only.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Width of the path field.
pub const PATH_LEN: usize = 256;
/// Width of the busid field.
pub const BUSID_LEN: usize = 32;
/// Size of the fixed part of a device body.
pub const DEVICE_BODY_LEN: usize = 312;
/// Size of one interface entry in a DEVLIST body.
pub const INTERFACE_LEN: usize = 4;

/// USB device speed with its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Unknown,
    Low,
    Full,
    High,
    Wireless,
    Super,
}

impl DeviceSpeed {
    /// Wire representation (low=1, full=2, high=3, wireless=4, super=5).
    pub fn code(self) -> u32 {
        match self {
            DeviceSpeed::Unknown => 0,
            DeviceSpeed::Low => 1,
            DeviceSpeed::Full => 2,
            DeviceSpeed::High => 3,
            DeviceSpeed::Wireless => 4,
            DeviceSpeed::Super => 5,
        }
    }

    /// Decode a wire speed code; anything out of range maps to `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            3 => DeviceSpeed::High,
            4 => DeviceSpeed::Wireless,
            5 => DeviceSpeed::Super,
            _ => DeviceSpeed::Unknown,
        }
    }

    /// True for USB 3.x devices, which attach to a super-speed vhci port.
    pub fn is_super(self) -> bool {
        matches!(self, DeviceSpeed::Super)
    }
}

/// Class/subclass/protocol triple of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Stable metadata of an exportable USB device.
///
/// Produced by the device backend at enumeration time and read-only
/// afterwards. `interfaces` is populated for DEVLIST bodies and empty for
/// records decoded from an IMPORT reply, where only `num_interfaces`
/// crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
    pub interfaces: Vec<DeviceInterface>,
}

impl DeviceRecord {
    /// Device identifier used in cmd-level frames.
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | self.devnum
    }

    /// Serialize the fixed body, and the interface entries when
    /// `with_interfaces` is set (DEVLIST form).
    pub fn write_body<W: Write>(&self, w: &mut W, with_interfaces: bool) -> Result<()> {
        write_fixed_str(w, "path", &self.path, PATH_LEN)?;
        write_fixed_str(w, "busid", &self.busid, BUSID_LEN)?;
        w.write_u32::<BigEndian>(self.busnum)?;
        w.write_u32::<BigEndian>(self.devnum)?;
        w.write_u32::<BigEndian>(self.speed.code())?;
        w.write_u16::<BigEndian>(self.vendor_id)?;
        w.write_u16::<BigEndian>(self.product_id)?;
        w.write_u16::<BigEndian>(self.bcd_device)?;
        w.write_u8(self.device_class)?;
        w.write_u8(self.device_subclass)?;
        w.write_u8(self.device_protocol)?;
        w.write_u8(self.configuration_value)?;
        w.write_u8(self.num_configurations)?;
        w.write_u8(self.num_interfaces)?;

        if with_interfaces {
            if self.interfaces.len() != self.num_interfaces as usize {
                return Err(ProtocolError::InterfaceCountMismatch {
                    declared: self.num_interfaces,
                    actual: self.interfaces.len(),
                });
            }
            for itf in &self.interfaces {
                w.write_u8(itf.class)?;
                w.write_u8(itf.subclass)?;
                w.write_u8(itf.protocol)?;
                w.write_u8(0)?;
            }
        }

        Ok(())
    }

    /// Deserialize a body written by [`Self::write_body`].
    pub fn read_body<R: Read>(r: &mut R, with_interfaces: bool) -> Result<Self> {
        let path = read_fixed_str(r, PATH_LEN)?;
        let busid = read_fixed_str(r, BUSID_LEN)?;
        let busnum = r.read_u32::<BigEndian>()?;
        let devnum = r.read_u32::<BigEndian>()?;
        let speed = DeviceSpeed::from_code(r.read_u32::<BigEndian>()?);
        let vendor_id = r.read_u16::<BigEndian>()?;
        let product_id = r.read_u16::<BigEndian>()?;
        let bcd_device = r.read_u16::<BigEndian>()?;
        let device_class = r.read_u8()?;
        let device_subclass = r.read_u8()?;
        let device_protocol = r.read_u8()?;
        let configuration_value = r.read_u8()?;
        let num_configurations = r.read_u8()?;
        let num_interfaces = r.read_u8()?;

        let mut interfaces = Vec::new();
        if with_interfaces {
            interfaces.reserve(num_interfaces as usize);
            for _ in 0..num_interfaces {
                let class = r.read_u8()?;
                let subclass = r.read_u8()?;
                let protocol = r.read_u8()?;
                let _pad = r.read_u8()?;
                interfaces.push(DeviceInterface {
                    class,
                    subclass,
                    protocol,
                });
            }
        }

        Ok(Self {
            path,
            busid,
            busnum,
            devnum,
            speed,
            vendor_id,
            product_id,
            bcd_device,
            device_class,
            device_subclass,
            device_protocol,
            configuration_value,
            num_configurations,
            num_interfaces,
            interfaces,
        })
    }
}

/// Write `value` into a `len`-byte NUL-padded field.
///
/// The value must leave room for at least one trailing NUL; anything longer
/// is an error, never a silent truncation.
pub(crate) fn write_fixed_str<W: Write>(
    w: &mut W,
    field: &'static str,
    value: &str,
    len: usize,
) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() >= len {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: bytes.len(),
            max: len - 1,
        });
    }
    w.write_all(bytes)?;
    let mut remaining = len - bytes.len();
    let zeros = [0u8; 64];
    while remaining > 0 {
        let n = remaining.min(zeros.len());
        w.write_all(&zeros[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// Read a `len`-byte NUL-padded field back into a `String`.
pub(crate) fn read_fixed_str<R: Read>(r: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidString)
}
