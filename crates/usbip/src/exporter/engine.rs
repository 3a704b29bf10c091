//! URB transfer engine.
//!
//! Decoded CMD_SUBMITs go into a bounded work queue serviced by a dedicated
//! blocking thread that owns the opened device; completions come back on a
//! bounded channel consumed by the session's writer task. One thread per
//! exported device serializes transfers on that device, and the bounded
//! queues throttle the socket reader when the device falls behind.
//!
//! Unlink keeps a pending-seqnum map: a victim still in the queue is flagged
//! and completes with -ECONNRESET when the worker reaches it. A victim that
//! is already executing on the device completes with -ECONNRESET too; the
//! flag is settled against the pending map again after the transfer
//! returns, under the same lock `unlink` takes, so the RET_UNLINK never
//! promises a cancellation the completion fails to deliver.
//!
//! Tearing the engine down (drop, or [`TransferEngine::shutdown`]) fails
//! everything still queued with -ESHUTDOWN instead of running it, so a
//! session's drain time is bounded by the one transfer in hand, not by the
//! backlog times the per-transfer timeout.

use crate::usb::{OpenedDevice, TransferKind, TransferOutcome, TransferRequest};
use protocol::errno;
use protocol::urb::{Direction, SubmitReply, SubmitRequest, UrbReply};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace};

/// The engine's worker thread has exited and no more URBs can be queued.
#[derive(Debug, Error)]
#[error("transfer engine is shut down")]
pub struct EngineClosed;

struct WorkItem {
    submit: SubmitRequest,
    cancelled: Arc<AtomicBool>,
}

pub struct TransferEngine {
    work_tx: async_channel::Sender<WorkItem>,
    pending: Arc<Mutex<HashMap<u32, Arc<AtomicBool>>>>,
    draining: Arc<AtomicBool>,
}

impl TransferEngine {
    /// Take ownership of `device` and start its worker thread. Completions
    /// are pushed into `completions`; dropping the engine closes the work
    /// queue and fails anything still queued, so the worker finishes the
    /// transfer in hand and exits.
    pub fn spawn(
        device: OpenedDevice,
        completions: async_channel::Sender<UrbReply>,
        timeout: Duration,
        queue_depth: usize,
    ) -> Self {
        let (work_tx, work_rx) = async_channel::bounded(queue_depth.max(1));
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let draining = Arc::new(AtomicBool::new(false));

        let worker_pending = Arc::clone(&pending);
        let worker_draining = Arc::clone(&draining);
        std::thread::spawn(move || {
            worker_loop(
                device,
                work_rx,
                completions,
                worker_pending,
                worker_draining,
                timeout,
            );
        });

        Self {
            work_tx,
            pending,
            draining,
        }
    }

    /// Stop running queued work: items not yet handed to the device
    /// complete with -ESHUTDOWN as the worker drains them. A transfer
    /// already executing still runs to its own timeout. Dropping the
    /// engine does this implicitly.
    pub fn shutdown(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Queue one URB. Suspends when the device-side queue is full.
    pub async fn submit(&self, submit: SubmitRequest) -> Result<(), EngineClosed> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let seqnum = submit.id.seqnum;
        self.pending
            .lock()
            .unwrap()
            .insert(seqnum, Arc::clone(&cancelled));

        if self.work_tx.send(WorkItem { submit, cancelled }).await.is_err() {
            self.pending.lock().unwrap().remove(&seqnum);
            return Err(EngineClosed);
        }
        Ok(())
    }

    /// Cancel the URB with `victim_seqnum`. Returns the RET_UNLINK status:
    /// -ECONNRESET when the victim was still pending, queued or executing
    /// (its completion will carry the same status), 0 when it had already
    /// completed. The flag is set while the pending lock is held, so the
    /// worker's post-transfer settle cannot miss it.
    pub fn unlink(&self, victim_seqnum: u32) -> i32 {
        match self.pending.lock().unwrap().get(&victim_seqnum) {
            Some(cancelled) => {
                cancelled.store(true, Ordering::Release);
                debug!(victim_seqnum, "URB unlinked");
                -errno::ECONNRESET
            }
            None => 0,
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    mut device: OpenedDevice,
    work_rx: async_channel::Receiver<WorkItem>,
    completions: async_channel::Sender<UrbReply>,
    pending: Arc<Mutex<HashMap<u32, Arc<AtomicBool>>>>,
    draining: Arc<AtomicBool>,
    timeout: Duration,
) {
    let busid = device.record().busid.clone();
    debug!(busid = %busid, "transfer worker started");

    while let Ok(item) = work_rx.recv_blocking() {
        let seqnum = item.submit.id.seqnum;

        let outcome = if draining.load(Ordering::Acquire) {
            // Session teardown: fail queued work without touching the
            // device, so the backlog drains immediately instead of one
            // transfer timeout per item.
            TransferOutcome::error(errno::ESHUTDOWN)
        } else if item.cancelled.load(Ordering::Acquire) {
            TransferOutcome::error(errno::ECONNRESET)
        } else {
            // A panicking backend must not take the process down; it costs
            // this URB (and in practice the session), nothing else.
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                perform(&mut device, &item.submit, timeout)
            }))
            .unwrap_or_else(|_| {
                error!(busid = %busid, seqnum, "transfer panicked");
                TransferOutcome::error(errno::EIO)
            })
        };

        // Retire the seqnum under the lock unlink() takes, then settle any
        // unlink that landed while the transfer was executing: once the
        // entry is gone unlink() reports "already completed", so whichever
        // side wins the lock here stays consistent with the RET_UNLINK.
        let cancelled = {
            let mut pending = pending.lock().unwrap();
            pending.remove(&seqnum);
            item.cancelled.load(Ordering::Acquire)
        };
        let outcome = if cancelled {
            TransferOutcome::error(errno::ECONNRESET)
        } else {
            outcome
        };

        let reply = UrbReply::Submit(completion_for(&item.submit, outcome));
        if completions.send_blocking(reply).is_err() {
            break;
        }
    }

    debug!(busid = %busid, "transfer worker stopped");
}

fn perform(device: &mut OpenedDevice, submit: &SubmitRequest, timeout: Duration) -> TransferOutcome {
    match classify(device, submit) {
        Ok(request) => {
            trace!(
                seqnum = submit.id.seqnum,
                ep = submit.id.ep,
                "executing transfer"
            );
            device.execute(request, timeout)
        }
        Err(status) => TransferOutcome::error(status),
    }
}

/// Turn a decoded URB into a backend transfer, per the dispatch rules:
/// endpoint 0 is a control transfer driven by the little-endian setup
/// packet; otherwise the endpoint's descriptor type picks bulk or
/// interrupt, with the URB interval as a fallback signal; isochronous
/// URBs are not scheduled.
fn classify(device: &OpenedDevice, submit: &SubmitRequest) -> Result<TransferRequest, i32> {
    if submit.is_isochronous() {
        return Err(errno::ENOSYS);
    }

    if submit.id.ep == 0 {
        let setup = &submit.setup;
        return Ok(TransferRequest::Control {
            request_type: setup[0],
            request: setup[1],
            value: u16::from_le_bytes([setup[2], setup[3]]),
            index: u16::from_le_bytes([setup[4], setup[5]]),
            length: u16::from_le_bytes([setup[6], setup[7]]),
            data: submit.payload.clone(),
        });
    }

    let endpoint = match submit.id.direction {
        Direction::In => (submit.id.ep as u8) | 0x80,
        Direction::Out => submit.id.ep as u8,
    };

    let kind = device.endpoint_kind(endpoint).unwrap_or({
        if submit.interval > 0 {
            TransferKind::Interrupt
        } else {
            TransferKind::Bulk
        }
    });

    match kind {
        TransferKind::Bulk => Ok(TransferRequest::Bulk {
            endpoint,
            length: submit.transfer_buffer_length,
            data: submit.payload.clone(),
        }),
        TransferKind::Interrupt => Ok(TransferRequest::Interrupt {
            endpoint,
            length: submit.transfer_buffer_length,
            data: submit.payload.clone(),
        }),
        TransferKind::Isochronous => Err(errno::ENOSYS),
        // A non-zero endpoint with a control descriptor is nonsense.
        TransferKind::Control => Err(errno::EINVAL),
    }
}

fn completion_for(submit: &SubmitRequest, outcome: TransferOutcome) -> SubmitReply {
    let ok = outcome.status == 0;
    let payload = if ok && submit.id.direction == Direction::In {
        outcome.data
    } else {
        Vec::new()
    };

    SubmitReply {
        id: submit.id,
        status: outcome.status,
        actual_length: if ok { outcome.actual_length } else { 0 },
        start_frame: 0,
        number_of_packets: submit.number_of_packets,
        error_count: 0,
        setup: submit.setup,
        payload,
    }
}
