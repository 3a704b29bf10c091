//! Codec error types

use thiserror::Error;

/// Errors raised while encoding or decoding USB/IP frames.
///
/// Every variant except `Io` describes a malformed or out-of-bounds frame;
/// a session that sees one of these on its socket cannot recover and must
/// close.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error while reading or writing a frame. Short reads surface as
    /// `UnexpectedEof`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Op-level header carried a version other than 0x0111.
    #[error("unsupported protocol version {version:#06x}")]
    VersionMismatch { version: u16 },

    /// Op-level code outside the DEVLIST/IMPORT request-reply set.
    #[error("unknown operation code {code:#06x}")]
    UnknownOp { code: u16 },

    /// Reply carried an op code other than the one the request calls for.
    #[error("unexpected reply code {code:#06x} (expected {expected:#06x})")]
    UnexpectedReply { code: u16, expected: u16 },

    /// Cmd-level command word outside the SUBMIT/UNLINK set, or a reply
    /// code seen where a request was required (and vice versa).
    #[error("unknown URB command {command:#010x}")]
    UnknownCommand { command: u32 },

    /// Direction field was neither 0 (OUT) nor 1 (IN).
    #[error("invalid transfer direction {direction}")]
    InvalidDirection { direction: u32 },

    /// A request frame carried a nonzero status field.
    #[error("request status must be zero, got {status}")]
    NonZeroStatus { status: u32 },

    /// String does not fit its fixed-size field with a trailing NUL.
    #[error("{field} of {len} bytes does not fit in a {max}-byte field")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Fixed-size string field held bytes that are not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidString,

    /// Declared transfer length exceeds the decoder's hard cap.
    #[error("transfer length {length} exceeds maximum {max}")]
    OversizedTransfer { length: u32, max: u32 },

    /// Device list reply declared an implausible device count.
    #[error("device list reports {count} devices (limit {max})")]
    DeviceListTooLong { count: u32, max: u32 },

    /// Device body declared one interface count but carried another.
    #[error("device declares {declared} interfaces but carries {actual}")]
    InterfaceCountMismatch { declared: u8, actual: usize },

    /// IMPORT reply with status 0 encoded without a device body.
    #[error("IMPORT reply with status 0 must carry a device body")]
    MissingDeviceBody,

    /// Payload length disagrees with the frame's length field.
    #[error("payload of {actual} bytes does not match declared length {declared}")]
    PayloadLengthMismatch { declared: u32, actual: usize },
}

/// Type alias for codec results
pub type Result<T> = std::result::Result<T, ProtocolError>;
