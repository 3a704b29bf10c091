//! Async frame I/O on top of the sync codec.
//!
//! Readers pull exactly the bytes each frame dictates off the stream, then
//! hand the assembled frame to the sync decoders, which remain the single
//! source of truth for layout and validation. Writers encode a whole frame
//! into memory first and commit it with one `write_all`, so a frame is
//! either fully on the wire or not at all.

use crate::device::{DEVICE_BODY_LEN, INTERFACE_LEN};
use crate::error::{ProtocolError, Result};
use crate::op::{
    self, DevlistReply, ImportReply, OpRequest, MAX_DEVICES, OP_HEADER_LEN, OP_REQ_DEVLIST,
    OP_REQ_IMPORT, REQ_DEVLIST_LEN, REQ_IMPORT_LEN,
};
use crate::urb::{
    UrbReply, UrbRequest, CMD_SUBMIT, MAX_TRANSFER_LENGTH, RET_SUBMIT, URB_FRAME_LEN,
};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one op-level request (exporter side, INIT phase).
pub async fn read_op_request<R>(r: &mut R) -> Result<OpRequest>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; OP_HEADER_LEN];
    r.read_exact(&mut frame).await?;

    let header: &[u8; OP_HEADER_LEN] = frame[..OP_HEADER_LEN].try_into().expect("header size");
    let (code, _status) = op::parse_op_header(header)?;
    let total = match code {
        OP_REQ_DEVLIST => REQ_DEVLIST_LEN,
        OP_REQ_IMPORT => REQ_IMPORT_LEN,
        code => return Err(ProtocolError::UnknownOp { code }),
    };

    frame.resize(total, 0);
    r.read_exact(&mut frame[OP_HEADER_LEN..]).await?;
    OpRequest::read_from(&mut Cursor::new(&frame))
}

/// Read an OP_REP_DEVLIST (importer side).
pub async fn read_devlist_reply<R>(r: &mut R) -> Result<DevlistReply>
where
    R: AsyncRead + Unpin,
{
    // Header plus version echo, status and device count.
    let mut frame = vec![0u8; 20];
    r.read_exact(&mut frame).await?;

    let header: &[u8; OP_HEADER_LEN] = frame[..OP_HEADER_LEN].try_into().expect("header size");
    let (code, _status) = op::parse_op_header(header)?;
    if code != op::OP_REP_DEVLIST {
        return Err(ProtocolError::UnexpectedReply {
            code,
            expected: op::OP_REP_DEVLIST,
        });
    }

    let count = u32::from_be_bytes(frame[16..20].try_into().expect("count field"));
    if count > MAX_DEVICES {
        return Err(ProtocolError::DeviceListTooLong {
            count,
            max: MAX_DEVICES,
        });
    }

    for _ in 0..count {
        let body_start = frame.len();
        frame.resize(body_start + DEVICE_BODY_LEN, 0);
        r.read_exact(&mut frame[body_start..]).await?;

        // bNumInterfaces is the last byte of the fixed body.
        let num_interfaces = frame[frame.len() - 1] as usize;
        let tail_start = frame.len();
        frame.resize(tail_start + num_interfaces * INTERFACE_LEN, 0);
        r.read_exact(&mut frame[tail_start..]).await?;
    }

    DevlistReply::read_from(&mut Cursor::new(&frame))
}

/// Read an OP_REP_IMPORT (importer side).
pub async fn read_import_reply<R>(r: &mut R) -> Result<ImportReply>
where
    R: AsyncRead + Unpin,
{
    // Header plus version echo and status.
    let mut frame = vec![0u8; 16];
    r.read_exact(&mut frame).await?;

    let header: &[u8; OP_HEADER_LEN] = frame[..OP_HEADER_LEN].try_into().expect("header size");
    let (code, _status) = op::parse_op_header(header)?;
    if code != op::OP_REP_IMPORT {
        return Err(ProtocolError::UnexpectedReply {
            code,
            expected: op::OP_REP_IMPORT,
        });
    }

    let status = u32::from_be_bytes(frame[12..16].try_into().expect("status field"));
    if status == 0 {
        frame.resize(16 + DEVICE_BODY_LEN, 0);
        r.read_exact(&mut frame[16..]).await?;
    }

    ImportReply::read_from(&mut Cursor::new(&frame))
}

/// Read one cmd-level request frame (exporter side, ATTACHED phase).
pub async fn read_urb_request<R>(r: &mut R) -> Result<UrbRequest>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; URB_FRAME_LEN];
    r.read_exact(&mut frame).await?;

    let command = u32::from_be_bytes(frame[0..4].try_into().expect("command field"));
    if command == CMD_SUBMIT {
        let direction = u32::from_be_bytes(frame[12..16].try_into().expect("direction field"));
        let length = u32::from_be_bytes(frame[24..28].try_into().expect("length field"));
        if direction == 0 && length > 0 {
            read_urb_payload(r, &mut frame, length).await?;
        }
    }

    UrbRequest::read_from(&mut Cursor::new(&frame))
}

/// Read one cmd-level reply frame (importer side).
pub async fn read_urb_reply<R>(r: &mut R) -> Result<UrbReply>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; URB_FRAME_LEN];
    r.read_exact(&mut frame).await?;

    let command = u32::from_be_bytes(frame[0..4].try_into().expect("command field"));
    if command == RET_SUBMIT {
        let direction = u32::from_be_bytes(frame[12..16].try_into().expect("direction field"));
        let actual_length = u32::from_be_bytes(frame[24..28].try_into().expect("length field"));
        if direction == 1 && actual_length > 0 {
            read_urb_payload(r, &mut frame, actual_length).await?;
        }
    }

    UrbReply::read_from(&mut Cursor::new(&frame))
}

async fn read_urb_payload<R>(r: &mut R, frame: &mut Vec<u8>, length: u32) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    if length > MAX_TRANSFER_LENGTH {
        return Err(ProtocolError::OversizedTransfer {
            length,
            max: MAX_TRANSFER_LENGTH,
        });
    }
    let start = frame.len();
    frame.resize(start + length as usize, 0);
    r.read_exact(&mut frame[start..]).await?;
    Ok(())
}

/// Commit one op-level request to the stream.
pub async fn write_op_request<W>(w: &mut W, request: &OpRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(w, &request.encode()?).await
}

/// Commit one OP_REP_DEVLIST to the stream.
pub async fn write_devlist_reply<W>(w: &mut W, reply: &DevlistReply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(w, &reply.encode()?).await
}

/// Commit one OP_REP_IMPORT to the stream.
pub async fn write_import_reply<W>(w: &mut W, reply: &ImportReply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(w, &reply.encode()?).await
}

/// Commit one cmd-level request to the stream.
pub async fn write_urb_request<W>(w: &mut W, request: &UrbRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(w, &request.encode()?).await
}

/// Commit one cmd-level reply to the stream.
pub async fn write_urb_reply<W>(w: &mut W, reply: &UrbReply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(w, &reply.encode()?).await
}

async fn write_frame<W>(w: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}
