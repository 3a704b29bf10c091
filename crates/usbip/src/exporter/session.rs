//! Per-connection exporter session.
//!
//! A session decodes op-level requests until an IMPORT succeeds, then
//! switches the socket to cmd-level framing for the rest of its life:
//!
//! ```text
//! INIT ──devlist──▶ reply, stay INIT
//!      ──import──▶ ok: reply, ATTACHED   err: reply(status=1), close
//! ATTACHED: reader task feeds the transfer engine, writer task drains the
//!           completion channel; either side failing tears the session down.
//! ```
//!
//! The reader owns the decode loop; the writer task is the only owner of
//! the socket's write half, so completion frames are never interleaved.

use crate::exporter::engine::TransferEngine;
use crate::exporter::registry::{ExportClaim, ExportRegistry};
use crate::usb::{Backend, DeviceFilter, OpenError, OpenedDevice};
use protocol::net;
use protocol::op::{DevlistReply, ImportReply, OpRequest};
use protocol::urb::{UnlinkReply, UrbReply, UrbRequest};
use protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why a session ended, other than the peer hanging up cleanly.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("wire protocol error: {0}")]
    Wire(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Shared exporter state handed to every session.
pub struct Exporter {
    backend: Backend,
    registry: ExportRegistry,
    filter: DeviceFilter,
    transfer_timeout: Duration,
    queue_depth: usize,
}

impl Exporter {
    pub fn new(
        backend: Backend,
        filter: DeviceFilter,
        transfer_timeout: Duration,
        queue_depth: usize,
    ) -> Self {
        Self {
            backend,
            registry: ExportRegistry::new(),
            filter,
            transfer_timeout,
            queue_depth,
        }
    }

    pub fn registry(&self) -> &ExportRegistry {
        &self.registry
    }

    /// Drive one connection to completion. Returns `Ok` on a clean close
    /// (peer hangup, refused import, shutdown signal).
    pub async fn run_session<S>(
        &self,
        stream: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        loop {
            let request = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                request = net::read_op_request(&mut reader) => match request {
                    Ok(request) => request,
                    Err(e) => return close_status(e),
                },
            };

            match request {
                OpRequest::Devlist => {
                    // Fresh snapshot per request; a transient enumeration
                    // failure yields an empty errored reply, not a close.
                    let reply = match self.backend.enumerate(&self.filter) {
                        Ok(devices) => {
                            debug!(count = devices.len(), "device list requested");
                            DevlistReply::new(devices)
                        }
                        Err(e) => {
                            warn!("enumeration failed: {e}");
                            DevlistReply::failed(1)
                        }
                    };
                    net::write_devlist_reply(&mut writer, &reply).await?;
                }

                OpRequest::Import { busid } => {
                    match self.open_for_export(&busid) {
                        Ok((device, claim)) => {
                            let record = device.record().clone();
                            info!(busid = %busid, devid = record.devid(), "device exported");
                            net::write_import_reply(&mut writer, &ImportReply::ok(record))
                                .await?;
                            let result = self
                                .relay_urbs(reader, writer, device, shutdown)
                                .await;
                            drop(claim);
                            return result;
                        }
                        Err(e) => {
                            warn!(busid = %busid, "import refused: {e}");
                            net::write_import_reply(&mut writer, &ImportReply::failed(1))
                                .await?;
                            let _ = writer.shutdown().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn open_for_export(&self, busid: &str) -> Result<(OpenedDevice, ExportClaim), OpenError> {
        let claim = self
            .registry
            .claim(busid)
            .ok_or_else(|| OpenError::AlreadyExported {
                busid: busid.to_string(),
            })?;
        // The claim drops on the error path, releasing the busid.
        let device = self.backend.open(busid)?;
        Ok((device, claim))
    }

    async fn relay_urbs<R, W>(
        &self,
        mut reader: R,
        writer: W,
        device: OpenedDevice,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (completion_tx, completion_rx) = async_channel::bounded(self.queue_depth.max(1));
        let engine = TransferEngine::spawn(
            device,
            completion_tx.clone(),
            self.transfer_timeout,
            self.queue_depth,
        );

        let writer_task = tokio::spawn(write_completions(writer, completion_rx));

        let result = loop {
            let request = tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                request = net::read_urb_request(&mut reader) => request,
            };

            match request {
                Ok(UrbRequest::Submit(submit)) => {
                    if engine.submit(submit).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(UrbRequest::Unlink(unlink)) => {
                    let status = engine.unlink(unlink.victim_seqnum);
                    let reply = UrbReply::Unlink(UnlinkReply {
                        id: unlink.id,
                        status,
                    });
                    if completion_tx.send(reply).await.is_err() {
                        break Ok(());
                    }
                }
                Err(e) => break close_status(e),
            }
        };

        // Dropping the engine fails anything still queued with -ESHUTDOWN;
        // only a transfer already on the device runs to its own timeout.
        // The writer drains the completions and exits once the last sender
        // is gone.
        drop(engine);
        drop(completion_tx);
        let _ = writer_task.await;

        result
    }
}

/// The writer task: sole owner of the socket's write half. Frames leave in
/// channel order, one whole frame at a time.
async fn write_completions<W>(mut writer: W, completions: async_channel::Receiver<UrbReply>)
where
    W: AsyncWrite + Send + Unpin,
{
    while let Ok(reply) = completions.recv().await {
        if let Err(e) = net::write_urb_reply(&mut writer, &reply).await {
            debug!("completion write failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// An EOF between frames is the peer closing the connection, which is a
/// normal way for a session to end; everything else is an error.
fn close_status(error: ProtocolError) -> Result<(), SessionError> {
    match &error {
        ProtocolError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
        _ => Err(SessionError::Wire(error)),
    }
}
