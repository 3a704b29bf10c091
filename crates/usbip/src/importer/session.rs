//! Importer session: import one remote device and relay URBs.
//!
//! The handshake is request-reply on one task; once attached the relay
//! splits into two tasks, one per direction, so a stalled direction never
//! blocks the other and no frame read or write is ever cancelled halfway:
//!
//! ```text
//! virtual port ──URB──▶ TCP write half      (submission task)
//! TCP read half ──completion──▶ virtual port (completion task)
//! ```

use crate::importer::sink::{Attachment, Sink, SinkError};
use protocol::net;
use protocol::op::OpRequest;
use protocol::ProtocolError;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("wire protocol error: {0}")]
    Wire(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("virtual port error: {0}")]
    Sink(#[from] SinkError),

    #[error("remote refused import with status {status}")]
    Refused { status: u32 },

    #[error("remote exports no devices")]
    NoDevices,

    #[error("relay task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct ImporterOptions {
    /// Import this busid; when absent, the first device the remote lists.
    pub busid: Option<String>,
}

/// Drive one import session to completion: negotiate, attach, relay until
/// either side goes away or shutdown is signalled.
pub async fn run<S>(
    stream: S,
    sink: &Sink,
    options: ImporterOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ImportError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let busid = match options.busid {
        Some(busid) => busid,
        None => {
            net::write_op_request(&mut writer, &OpRequest::Devlist).await?;
            let reply = net::read_devlist_reply(&mut reader).await?;
            for device in &reply.devices {
                info!(
                    busid = %device.busid,
                    class = device.device_class,
                    "exportable device {:04x}:{:04x}",
                    device.vendor_id,
                    device.product_id
                );
            }
            let first = reply.devices.first().ok_or(ImportError::NoDevices)?;
            first.busid.clone()
        }
    };

    net::write_op_request(
        &mut writer,
        &OpRequest::Import {
            busid: busid.clone(),
        },
    )
    .await?;
    let reply = net::read_import_reply(&mut reader).await?;
    if reply.status != 0 {
        warn!(busid = %busid, status = reply.status, "import refused");
        return Err(ImportError::Refused {
            status: reply.status,
        });
    }
    let device = reply
        .device
        .ok_or(ImportError::Wire(ProtocolError::MissingDeviceBody))?;

    info!(
        busid = %device.busid,
        devid = device.devid(),
        speed = device.speed.code(),
        "device imported"
    );

    let Attachment {
        port,
        mut urbs,
        mut completions,
        guard,
    } = sink.attach(&device).await?;

    // Submissions: virtual port -> exporter.
    let mut submission_shutdown = shutdown.clone();
    let mut submissions = tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = submission_shutdown.changed() => return Ok(()),
                request = urbs.next() => request,
            };
            match request {
                Ok(request) => {
                    debug!(seqnum = request.id().seqnum, "forwarding URB");
                    net::write_urb_request(&mut writer, &request).await?;
                }
                Err(SinkError::Detached) => return Ok(()),
                Err(e) => return Err(ImportError::from(e)),
            }
        }
    });

    // Completions: exporter -> virtual port.
    let mut completion_shutdown = shutdown.clone();
    let mut completions_task = tokio::spawn(async move {
        loop {
            let reply = tokio::select! {
                _ = completion_shutdown.changed() => return Ok(()),
                reply = net::read_urb_reply(&mut reader) => reply,
            };
            match reply {
                Ok(reply) => {
                    debug!(seqnum = reply.id().seqnum, "delivering completion");
                    completions.complete(&reply).await?;
                }
                // The exporter hanging up between frames ends the session.
                Err(ProtocolError::Io(io))
                    if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(e) => return Err(ImportError::from(e)),
            }
        }
    });

    // First direction to finish decides the outcome; the other is torn
    // down with it.
    let outcome = tokio::select! {
        finished = &mut submissions => finished,
        finished = &mut completions_task => finished,
    };
    submissions.abort();
    completions_task.abort();

    let result = match outcome {
        Ok(result) => result,
        Err(join_error) => Err(ImportError::TaskFailed(join_error.to_string())),
    };

    info!(port, "import session ended");
    drop(guard);
    result
}
