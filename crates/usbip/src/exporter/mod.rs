//! Exporter side: share local USB devices with remote importers.

pub mod acceptor;
pub mod engine;
pub mod registry;
pub mod session;

pub use acceptor::serve;
pub use engine::TransferEngine;
pub use registry::{ExportClaim, ExportRegistry};
pub use session::{Exporter, SessionError};
