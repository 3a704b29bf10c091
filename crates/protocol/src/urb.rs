//! Cmd-level URB traffic: CMD_SUBMIT/RET_SUBMIT and CMD_UNLINK/RET_UNLINK.
//!
//! Every frame is 48 bytes: a 20-byte identity header (`command`, `seqnum`,
//! `devid`, `direction`, `ep`, all `u32` big-endian) and a 28-byte
//! command-specific tail. A raw transfer payload follows a CMD_SUBMIT when
//! the direction is OUT, and a RET_SUBMIT when the direction is IN.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const CMD_SUBMIT: u32 = 0x0001;
pub const CMD_UNLINK: u32 = 0x0002;
pub const RET_SUBMIT: u32 = 0x0003;
pub const RET_UNLINK: u32 = 0x0004;

/// Size of every cmd-level frame before its payload.
pub const URB_FRAME_LEN: usize = 48;

/// Hard cap on a declared transfer length; guards the decoder against
/// hostile or corrupt length fields.
pub const MAX_TRANSFER_LENGTH: u32 = 16 * 1024 * 1024;

/// Transfer direction as seen from the importing host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn code(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            direction => Err(ProtocolError::InvalidDirection { direction }),
        }
    }
}

/// Identity fields shared by every cmd-level frame. A RET_SUBMIT must echo
/// the `seqnum` and `devid` of the CMD_SUBMIT it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbId {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
}

/// CMD_SUBMIT: one URB handed to the exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub id: UrbId,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    /// Control setup packet; meaningful only when `id.ep == 0`.
    pub setup: [u8; 8],
    /// Outbound bytes; `transfer_buffer_length` of them iff direction is OUT.
    pub payload: Vec<u8>,
}

impl SubmitRequest {
    /// True when the URB asks for an isochronous schedule.
    pub fn is_isochronous(&self) -> bool {
        self.number_of_packets != 0
    }
}

/// CMD_UNLINK: cancel the in-flight URB whose seqnum is `victim_seqnum`.
/// `id.seqnum` identifies the unlink operation itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkRequest {
    pub id: UrbId,
    pub victim_seqnum: u32,
}

/// A frame read by the exporter while attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbRequest {
    Submit(SubmitRequest),
    Unlink(UnlinkRequest),
}

impl UrbRequest {
    pub fn id(&self) -> UrbId {
        match self {
            UrbRequest::Submit(submit) => submit.id,
            UrbRequest::Unlink(unlink) => unlink.id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(URB_FRAME_LEN);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            UrbRequest::Submit(submit) => {
                let expected = match submit.id.direction {
                    Direction::Out => submit.transfer_buffer_length as usize,
                    Direction::In => 0,
                };
                if submit.payload.len() != expected {
                    return Err(ProtocolError::PayloadLengthMismatch {
                        declared: expected as u32,
                        actual: submit.payload.len(),
                    });
                }
                write_urb_header(w, CMD_SUBMIT, &submit.id)?;
                w.write_u32::<BigEndian>(submit.transfer_flags)?;
                w.write_u32::<BigEndian>(submit.transfer_buffer_length)?;
                w.write_u32::<BigEndian>(submit.start_frame)?;
                w.write_u32::<BigEndian>(submit.number_of_packets)?;
                w.write_u32::<BigEndian>(submit.interval)?;
                w.write_all(&submit.setup)?;
                w.write_all(&submit.payload)?;
            }
            UrbRequest::Unlink(unlink) => {
                write_urb_header(w, CMD_UNLINK, &unlink.id)?;
                w.write_u32::<BigEndian>(unlink.victim_seqnum)?;
                w.write_all(&[0u8; 24])?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let (command, id) = read_urb_header(r)?;
        match command {
            CMD_SUBMIT => {
                let transfer_flags = r.read_u32::<BigEndian>()?;
                let transfer_buffer_length = r.read_u32::<BigEndian>()?;
                // Bound the declared length for IN transfers too; the
                // exporter allocates this much for the device to fill.
                if transfer_buffer_length > MAX_TRANSFER_LENGTH {
                    return Err(ProtocolError::OversizedTransfer {
                        length: transfer_buffer_length,
                        max: MAX_TRANSFER_LENGTH,
                    });
                }
                let start_frame = r.read_u32::<BigEndian>()?;
                let number_of_packets = r.read_u32::<BigEndian>()?;
                let interval = r.read_u32::<BigEndian>()?;
                let mut setup = [0u8; 8];
                r.read_exact(&mut setup)?;

                let payload = read_payload(
                    r,
                    transfer_buffer_length,
                    id.direction == Direction::Out,
                )?;

                Ok(UrbRequest::Submit(SubmitRequest {
                    id,
                    transfer_flags,
                    transfer_buffer_length,
                    start_frame,
                    number_of_packets,
                    interval,
                    setup,
                    payload,
                }))
            }
            CMD_UNLINK => {
                let victim_seqnum = r.read_u32::<BigEndian>()?;
                let mut padding = [0u8; 24];
                r.read_exact(&mut padding)?;
                Ok(UrbRequest::Unlink(UnlinkRequest { id, victim_seqnum }))
            }
            command => Err(ProtocolError::UnknownCommand { command }),
        }
    }
}

/// RET_SUBMIT: completion of one URB. `status` is 0 or a negative errno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReply {
    pub id: UrbId,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    /// Echo of the request's setup packet, or zeroes.
    pub setup: [u8; 8],
    /// Inbound bytes; `actual_length` of them iff direction is IN.
    pub payload: Vec<u8>,
}

/// RET_UNLINK: outcome of a CMD_UNLINK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkReply {
    pub id: UrbId,
    pub status: i32,
}

/// A frame written by the exporter while attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbReply {
    Submit(SubmitReply),
    Unlink(UnlinkReply),
}

impl UrbReply {
    pub fn id(&self) -> UrbId {
        match self {
            UrbReply::Submit(submit) => submit.id,
            UrbReply::Unlink(unlink) => unlink.id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(URB_FRAME_LEN);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            UrbReply::Submit(submit) => {
                let expected = match submit.id.direction {
                    Direction::In => submit.actual_length as usize,
                    Direction::Out => 0,
                };
                if submit.payload.len() != expected {
                    return Err(ProtocolError::PayloadLengthMismatch {
                        declared: expected as u32,
                        actual: submit.payload.len(),
                    });
                }
                write_urb_header(w, RET_SUBMIT, &submit.id)?;
                w.write_i32::<BigEndian>(submit.status)?;
                w.write_u32::<BigEndian>(submit.actual_length)?;
                w.write_u32::<BigEndian>(submit.start_frame)?;
                w.write_u32::<BigEndian>(submit.number_of_packets)?;
                w.write_u32::<BigEndian>(submit.error_count)?;
                w.write_all(&submit.setup)?;
                w.write_all(&submit.payload)?;
            }
            UrbReply::Unlink(unlink) => {
                write_urb_header(w, RET_UNLINK, &unlink.id)?;
                w.write_i32::<BigEndian>(unlink.status)?;
                w.write_all(&[0u8; 24])?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let (command, id) = read_urb_header(r)?;
        match command {
            RET_SUBMIT => {
                let status = r.read_i32::<BigEndian>()?;
                let actual_length = r.read_u32::<BigEndian>()?;
                let start_frame = r.read_u32::<BigEndian>()?;
                let number_of_packets = r.read_u32::<BigEndian>()?;
                let error_count = r.read_u32::<BigEndian>()?;
                let mut setup = [0u8; 8];
                r.read_exact(&mut setup)?;

                let payload =
                    read_payload(r, actual_length, id.direction == Direction::In)?;

                Ok(UrbReply::Submit(SubmitReply {
                    id,
                    status,
                    actual_length,
                    start_frame,
                    number_of_packets,
                    error_count,
                    setup,
                    payload,
                }))
            }
            RET_UNLINK => {
                let status = r.read_i32::<BigEndian>()?;
                let mut padding = [0u8; 24];
                r.read_exact(&mut padding)?;
                Ok(UrbReply::Unlink(UnlinkReply { id, status }))
            }
            command => Err(ProtocolError::UnknownCommand { command }),
        }
    }
}

fn write_urb_header<W: Write>(w: &mut W, command: u32, id: &UrbId) -> Result<()> {
    w.write_u32::<BigEndian>(command)?;
    w.write_u32::<BigEndian>(id.seqnum)?;
    w.write_u32::<BigEndian>(id.devid)?;
    w.write_u32::<BigEndian>(id.direction.code())?;
    w.write_u32::<BigEndian>(id.ep)?;
    Ok(())
}

fn read_urb_header<R: Read>(r: &mut R) -> Result<(u32, UrbId)> {
    let command = r.read_u32::<BigEndian>()?;
    let seqnum = r.read_u32::<BigEndian>()?;
    let devid = r.read_u32::<BigEndian>()?;
    let direction = Direction::from_code(r.read_u32::<BigEndian>()?)?;
    let ep = r.read_u32::<BigEndian>()?;
    Ok((
        command,
        UrbId {
            seqnum,
            devid,
            direction,
            ep,
        },
    ))
}

fn read_payload<R: Read>(r: &mut R, length: u32, present: bool) -> Result<Vec<u8>> {
    if !present || length == 0 {
        return Ok(Vec::new());
    }
    if length > MAX_TRANSFER_LENGTH {
        return Err(ProtocolError::OversizedTransfer {
            length,
            max: MAX_TRANSFER_LENGTH,
        });
    }
    let mut payload = vec![0u8; length as usize];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn control_in_request() -> SubmitRequest {
        SubmitRequest {
            id: UrbId {
                seqnum: 7,
                devid: (1 << 16) | 2,
                direction: Direction::In,
                ep: 0,
            },
            transfer_flags: 0,
            transfer_buffer_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_submit_control_in_roundtrip() {
        let request = UrbRequest::Submit(control_in_request());
        let frame = request.encode().unwrap();
        assert_eq!(frame.len(), URB_FRAME_LEN);

        let decoded = UrbRequest::read_from(&mut Cursor::new(&frame)).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_submit_bulk_out_roundtrip() {
        let payload = vec![0xA5u8; 512];
        let request = UrbRequest::Submit(SubmitRequest {
            id: UrbId {
                seqnum: 9,
                devid: (1 << 16) | 2,
                direction: Direction::Out,
                ep: 2,
            },
            transfer_flags: 0,
            transfer_buffer_length: 512,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0u8; 8],
            payload: payload.clone(),
        });
        let frame = request.encode().unwrap();
        assert_eq!(frame.len(), URB_FRAME_LEN + 512);
        assert_eq!(&frame[URB_FRAME_LEN..], &payload[..]);

        let decoded = UrbRequest::read_from(&mut Cursor::new(&frame)).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_ret_submit_in_roundtrip() {
        let reply = UrbReply::Submit(SubmitReply {
            id: UrbId {
                seqnum: 7,
                devid: (1 << 16) | 2,
                direction: Direction::In,
                ep: 0,
            },
            status: 0,
            actual_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            payload: vec![0x12; 18],
        });
        let frame = reply.encode().unwrap();
        assert_eq!(frame.len(), URB_FRAME_LEN + 18);

        let decoded = UrbReply::read_from(&mut Cursor::new(&frame)).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_ret_submit_out_carries_no_payload() {
        let reply = UrbReply::Submit(SubmitReply {
            id: UrbId {
                seqnum: 9,
                devid: (1 << 16) | 2,
                direction: Direction::Out,
                ep: 2,
            },
            status: 0,
            actual_length: 512,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            setup: [0u8; 8],
            payload: Vec::new(),
        });
        let frame = reply.encode().unwrap();
        assert_eq!(frame.len(), URB_FRAME_LEN);
    }

    #[test]
    fn test_unlink_roundtrip() {
        let request = UrbRequest::Unlink(UnlinkRequest {
            id: UrbId {
                seqnum: 11,
                devid: (1 << 16) | 2,
                direction: Direction::Out,
                ep: 0,
            },
            victim_seqnum: 7,
        });
        let frame = request.encode().unwrap();
        assert_eq!(frame.len(), URB_FRAME_LEN);
        assert_eq!(UrbRequest::read_from(&mut Cursor::new(&frame)).unwrap(), request);

        let reply = UrbReply::Unlink(UnlinkReply {
            id: UrbId {
                seqnum: 11,
                devid: (1 << 16) | 2,
                direction: Direction::Out,
                ep: 0,
            },
            status: -(crate::errno::ECONNRESET),
        });
        let frame = reply.encode().unwrap();
        assert_eq!(frame.len(), URB_FRAME_LEN);
        assert_eq!(UrbReply::read_from(&mut Cursor::new(&frame)).unwrap(), reply);
    }

    #[test]
    fn test_out_payload_length_is_enforced() {
        let mut submit = control_in_request();
        submit.id.direction = Direction::Out;
        submit.transfer_buffer_length = 4;
        submit.payload = vec![0; 3];

        let err = UrbRequest::Submit(submit).encode().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PayloadLengthMismatch {
                declared: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_oversized_transfer_is_rejected() {
        let mut frame = UrbRequest::Submit(control_in_request()).encode().unwrap();
        // Flip direction to OUT and declare a huge payload.
        frame[12..16].copy_from_slice(&0u32.to_be_bytes());
        frame[24..28].copy_from_slice(&(MAX_TRANSFER_LENGTH + 1).to_be_bytes());

        let err = UrbRequest::read_from(&mut Cursor::new(&frame)).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizedTransfer { .. }));
    }

    #[test]
    fn test_oversized_in_length_is_rejected() {
        // No payload follows an IN submit, but the declared length still
        // sizes the exporter's buffer and must be bounded.
        let mut frame = UrbRequest::Submit(control_in_request()).encode().unwrap();
        frame[24..28].copy_from_slice(&u32::MAX.to_be_bytes());

        let err = UrbRequest::read_from(&mut Cursor::new(&frame)).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizedTransfer { .. }));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let mut frame = UrbRequest::Submit(control_in_request()).encode().unwrap();
        frame[0..4].copy_from_slice(&0x99u32.to_be_bytes());

        let err = UrbRequest::read_from(&mut Cursor::new(&frame)).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnknownCommand { command: 0x99 }
        ));
    }

    #[test]
    fn test_ret_code_on_request_side_is_rejected() {
        let reply = UrbReply::Unlink(UnlinkReply {
            id: UrbId {
                seqnum: 1,
                devid: 1,
                direction: Direction::Out,
                ep: 0,
            },
            status: 0,
        });
        let frame = reply.encode().unwrap();

        let err = UrbRequest::read_from(&mut Cursor::new(&frame)).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnknownCommand {
                command: RET_UNLINK
            }
        ));
    }

    #[test]
    fn test_truncated_frame_is_unexpected_eof() {
        let frame = UrbRequest::Submit(control_in_request()).encode().unwrap();
        let err = UrbRequest::read_from(&mut Cursor::new(&frame[..47])).unwrap_err();
        let ProtocolError::Io(io) = err else {
            panic!("expected Io error, got {:?}", err);
        };
        assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
