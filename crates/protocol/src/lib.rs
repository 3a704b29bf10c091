//! Wire protocol for USB/IP over TCP.
//!
//! This crate is a byte-exact serializer/deserializer for the two framing
//! families the protocol multiplexes onto one socket:
//!
//! - **Op-level** frames carry the pre-attach negotiation (device list and
//!   import). An 8-byte header (`u16 version`, `u16 code`, `u32 status`) is
//!   followed by a code-specific body.
//! - **Cmd-level** frames carry URB traffic after an import succeeded. Every
//!   frame is exactly 48 bytes (`u32 command`, `u32 seqnum`, `u32 devid`,
//!   `u32 direction`, `u32 ep`, then a 28-byte command tail) plus an optional
//!   raw transfer payload whose presence is dictated by direction and the
//!   length fields.
//!
//! All multi-byte integers are big-endian. Every field is written explicitly;
//! no in-memory struct is ever reinterpreted as wire bytes. Encoders produce
//! whole frames or fail; decoders consume exactly the bytes the command and
//! length fields dictate, and a short read surfaces as
//! [`ProtocolError::Io`] with `UnexpectedEof`.
//!
//! # Example
//!
//! ```
//! use protocol::op::OpRequest;
//!
//! let frame = OpRequest::Devlist.encode().unwrap();
//! assert_eq!(frame.len(), 12);
//!
//! let decoded = OpRequest::read_from(&mut std::io::Cursor::new(&frame)).unwrap();
//! assert_eq!(decoded, OpRequest::Devlist);
//! ```

pub mod device;
pub mod errno;
pub mod error;
pub mod op;
pub mod urb;

#[cfg(feature = "async")]
pub mod net;

pub use device::{DeviceInterface, DeviceRecord, DeviceSpeed};
pub use error::{ProtocolError, Result};
pub use op::{DevlistReply, ImportReply, OpRequest};
pub use urb::{
    Direction, SubmitReply, SubmitRequest, UnlinkReply, UnlinkRequest, UrbId, UrbReply, UrbRequest,
};

/// Protocol version echoed in every op-level header.
pub const USBIP_VERSION: u16 = 0x0111;

/// Default TCP port of the USB/IP service.
pub const DEFAULT_PORT: u16 = 3240;
