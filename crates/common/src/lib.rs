//! Common utilities for the USB/IP peer
//!
//! Shared by the exporter and importer halves of the application: the
//! process-level error type, tracing setup, and the accept limiter that
//! shields the exporter from connection floods.

pub mod error;
pub mod limiter;
pub mod logging;

pub use error::{Error, Result};
pub use limiter::{AcceptDecision, AcceptLimiter};
pub use logging::setup_logging;
