//! USB/IP peer library.
//!
//! The binary in `main.rs` is a thin shell over these modules:
//!
//! - [`usb`]: local USB access behind the `Backend`/`OpenedDevice` enums
//!   (libusb for production, an in-memory mock for tests).
//! - [`exporter`]: the device server: accept loop, per-connection session
//!   state machine, export registry and the URB transfer engine.
//! - [`importer`]: the device client: import handshake and the URB relay
//!   between the local virtual host controller and the remote exporter.
//! - [`config`]: TOML configuration with XDG lookup.

pub mod config;
pub mod exporter;
pub mod importer;
pub mod usb;
