//! Importer side: attach a remote exporter's device to the local host.

pub mod session;
pub mod sink;

pub use session::{run, ImportError, ImporterOptions};
pub use sink::{
    Attachment, CompletionSink, Loopback, LoopbackDriver, Sink, SinkError, UrbSource, VhciSysfs,
};
