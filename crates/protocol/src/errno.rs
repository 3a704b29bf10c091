//! Linux errno values used in wire status fields.
//!
//! RET_SUBMIT and RET_UNLINK report failure as negative errno, matching what
//! the kernel side of the protocol expects. Only the values this
//! implementation actually emits are listed.

pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EACCES: i32 = 13;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const EPIPE: i32 = 32;
pub const ENOSYS: i32 = 38;
pub const EOVERFLOW: i32 = 75;
pub const ECONNRESET: i32 = 104;
pub const ESHUTDOWN: i32 = 108;
pub const ETIMEDOUT: i32 = 110;
