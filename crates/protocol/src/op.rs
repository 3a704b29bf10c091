//! Op-level messages: the pre-attach negotiation phase.
//!
//! Requests and replies share an 8-byte header: `u16 version`, `u16 code`,
//! `u32 status`. Requests must carry status 0. Replies mirror the operation
//! status into both the header and the body; decoders trust the body field.

use crate::device::{read_fixed_str, write_fixed_str, DeviceRecord, BUSID_LEN};
use crate::error::{ProtocolError, Result};
use crate::USBIP_VERSION;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Upper bound on the device count a DEVLIST reply may declare.
pub const MAX_DEVICES: u32 = 256;

/// Size of the op-level header.
pub const OP_HEADER_LEN: usize = 8;
/// Size of an OP_REQ_DEVLIST frame.
pub const REQ_DEVLIST_LEN: usize = 12;
/// Size of an OP_REQ_IMPORT frame.
pub const REQ_IMPORT_LEN: usize = 44;

/// A negotiation request, as decoded by the exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    /// OP_REQ_DEVLIST: enumerate exportable devices.
    Devlist,
    /// OP_REQ_IMPORT: claim the device with this busid.
    Import { busid: String },
}

impl OpRequest {
    /// Encode into a complete frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(REQ_IMPORT_LEN);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            OpRequest::Devlist => {
                write_op_header(w, OP_REQ_DEVLIST, 0)?;
                w.write_u32::<BigEndian>(USBIP_VERSION as u32)?;
            }
            OpRequest::Import { busid } => {
                write_op_header(w, OP_REQ_IMPORT, 0)?;
                w.write_u32::<BigEndian>(USBIP_VERSION as u32)?;
                write_fixed_str(w, "busid", busid, BUSID_LEN)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let (code, status) = read_op_header(r)?;
        if status != 0 {
            return Err(ProtocolError::NonZeroStatus { status });
        }
        match code {
            OP_REQ_DEVLIST => {
                let _version_echo = r.read_u32::<BigEndian>()?;
                Ok(OpRequest::Devlist)
            }
            OP_REQ_IMPORT => {
                let _version_echo = r.read_u32::<BigEndian>()?;
                let busid = read_fixed_str(r, BUSID_LEN)?;
                Ok(OpRequest::Import { busid })
            }
            code => Err(ProtocolError::UnknownOp { code }),
        }
    }
}

/// OP_REP_DEVLIST: status plus a snapshot of exportable devices, each with
/// its interface entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevlistReply {
    pub status: u32,
    pub devices: Vec<DeviceRecord>,
}

impl DevlistReply {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self { status: 0, devices }
    }

    /// Empty reply carrying a nonzero status; used when enumeration failed.
    pub fn failed(status: u32) -> Self {
        Self {
            status,
            devices: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_op_header(w, OP_REP_DEVLIST, self.status)?;
        w.write_u32::<BigEndian>(USBIP_VERSION as u32)?;
        w.write_u32::<BigEndian>(self.status)?;
        w.write_u32::<BigEndian>(self.devices.len() as u32)?;
        for device in &self.devices {
            device.write_body(w, true)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let (code, _) = read_op_header(r)?;
        if code != OP_REP_DEVLIST {
            return Err(ProtocolError::UnexpectedReply {
                code,
                expected: OP_REP_DEVLIST,
            });
        }
        let _version_echo = r.read_u32::<BigEndian>()?;
        let status = r.read_u32::<BigEndian>()?;
        let count = r.read_u32::<BigEndian>()?;
        if count > MAX_DEVICES {
            return Err(ProtocolError::DeviceListTooLong {
                count,
                max: MAX_DEVICES,
            });
        }
        let mut devices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            devices.push(DeviceRecord::read_body(r, true)?);
        }
        Ok(Self { status, devices })
    }
}

/// OP_REP_IMPORT: status 0 with a device body, or a bare failure status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReply {
    pub status: u32,
    pub device: Option<DeviceRecord>,
}

impl ImportReply {
    pub fn ok(device: DeviceRecord) -> Self {
        Self {
            status: 0,
            device: Some(device),
        }
    }

    pub fn failed(status: u32) -> Self {
        Self {
            status,
            device: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_op_header(w, OP_REP_IMPORT, self.status)?;
        w.write_u32::<BigEndian>(USBIP_VERSION as u32)?;
        w.write_u32::<BigEndian>(self.status)?;
        if self.status == 0 {
            let device = self.device.as_ref().ok_or(ProtocolError::MissingDeviceBody)?;
            device.write_body(w, false)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let (code, _) = read_op_header(r)?;
        if code != OP_REP_IMPORT {
            return Err(ProtocolError::UnexpectedReply {
                code,
                expected: OP_REP_IMPORT,
            });
        }
        let _version_echo = r.read_u32::<BigEndian>()?;
        let status = r.read_u32::<BigEndian>()?;
        let device = if status == 0 {
            Some(DeviceRecord::read_body(r, false)?)
        } else {
            None
        };
        Ok(Self { status, device })
    }
}

/// Parse an already-read 8-byte op header. Shared by the sync and async
/// read paths.
pub(crate) fn parse_op_header(buf: &[u8; OP_HEADER_LEN]) -> Result<(u16, u32)> {
    let version = u16::from_be_bytes([buf[0], buf[1]]);
    if version != USBIP_VERSION {
        return Err(ProtocolError::VersionMismatch { version });
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let status = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((code, status))
}

fn write_op_header<W: Write>(w: &mut W, code: u16, status: u32) -> Result<()> {
    w.write_u16::<BigEndian>(USBIP_VERSION)?;
    w.write_u16::<BigEndian>(code)?;
    w.write_u32::<BigEndian>(status)?;
    Ok(())
}

fn read_op_header<R: Read>(r: &mut R) -> Result<(u16, u32)> {
    let mut buf = [0u8; OP_HEADER_LEN];
    r.read_exact(&mut buf)?;
    parse_op_header(&buf)
}
