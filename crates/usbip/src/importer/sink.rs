//! Virtual host-controller sinks.
//!
//! [`Sink::Vhci`] targets the Linux vhci-hcd driver: attaching hands one
//! end of a socketpair to the kernel through sysfs, after which the kernel
//! speaks cmd-level USB/IP on it: URB submissions come off the socket and
//! completions go back down it. [`Sink::Loopback`] is the same surface over
//! in-memory channels for tests.
//!
//! vhci exposes sixteen ports: 0-7 accept USB 2.x devices, 8-15 USB 3.x.
//! Allocation merges our bitmap with the kernel's status file so multiple
//! processes sharing the controller do not hand out the same port.

use protocol::device::{DeviceRecord, DeviceSpeed};
use protocol::net;
use protocol::urb::{UrbReply, UrbRequest};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("vhci driver unavailable: {0}")]
    Unavailable(String),

    #[error("no free vhci port for this device speed")]
    NoFreePort,

    #[error("sysfs I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error on vhci socket: {0}")]
    Wire(#[from] protocol::ProtocolError),

    #[error("virtual port torn down")]
    Detached,
}

/// Where imported devices get attached.
pub enum Sink {
    Vhci(VhciSysfs),
    Loopback(Loopback),
}

impl Sink {
    /// Bind a free virtual port for `record`. After this the local kernel
    /// (or the loopback driver) sees a new USB device.
    pub async fn attach(&self, record: &DeviceRecord) -> Result<Attachment, SinkError> {
        match self {
            Sink::Vhci(vhci) => vhci.attach(record).await,
            Sink::Loopback(loopback) => loopback.attach(record),
        }
    }
}

/// A bound virtual port, split into its two traffic directions so the
/// relay can run them in separate tasks.
#[derive(Debug)]
pub struct Attachment {
    pub port: u8,
    pub urbs: UrbSource,
    pub completions: CompletionSink,
    /// Detaches the vhci port when the attachment is dropped.
    pub guard: Option<PortGuard>,
}

/// URB submissions surfacing from the virtual host controller.
#[derive(Debug)]
pub enum UrbSource {
    Vhci(OwnedReadHalf),
    Loopback(async_channel::Receiver<UrbRequest>),
}

impl UrbSource {
    /// Suspend until the controller submits the next URB. `Detached` means
    /// the port is being torn down.
    pub async fn next(&mut self) -> Result<UrbRequest, SinkError> {
        match self {
            UrbSource::Vhci(reader) => {
                let request = net::read_urb_request(reader).await?;
                Ok(request)
            }
            UrbSource::Loopback(receiver) => {
                receiver.recv().await.map_err(|_| SinkError::Detached)
            }
        }
    }
}

/// Completion path back into the virtual host controller.
#[derive(Debug)]
pub enum CompletionSink {
    Vhci(OwnedWriteHalf),
    Loopback(async_channel::Sender<UrbReply>),
}

impl CompletionSink {
    pub async fn complete(&mut self, reply: &UrbReply) -> Result<(), SinkError> {
        match self {
            CompletionSink::Vhci(writer) => {
                net::write_urb_reply(writer, reply).await?;
                Ok(())
            }
            CompletionSink::Loopback(sender) => sender
                .send(reply.clone())
                .await
                .map_err(|_| SinkError::Detached),
        }
    }
}

#[derive(Debug)]
struct VhciShared {
    path: PathBuf,
    hs_ports: Mutex<u8>,
    ss_ports: Mutex<u8>,
}

/// The Linux vhci-hcd sysfs adapter.
pub struct VhciSysfs {
    shared: Arc<VhciShared>,
}

impl VhciSysfs {
    /// Locate the vhci platform device. Fails when the module is not
    /// loaded.
    pub fn discover() -> Result<Self, SinkError> {
        for candidate in Self::candidate_paths() {
            if candidate.exists() {
                info!(path = %candidate.display(), "found vhci_hcd");
                return Self::at(candidate);
            }
        }
        Err(SinkError::Unavailable(
            "vhci_hcd not found; load it with: modprobe vhci-hcd".to_string(),
        ))
    }

    /// Use a specific vhci sysfs directory (separate from discovery so
    /// tests can point at a scratch tree).
    pub fn at(path: PathBuf) -> Result<Self, SinkError> {
        let (hs_ports, ss_ports) = read_port_status(&path).unwrap_or((0, 0));
        debug!("initial port bitmaps: hs={hs_ports:08b} ss={ss_ports:08b}");
        Ok(Self {
            shared: Arc::new(VhciShared {
                path,
                hs_ports: Mutex::new(hs_ports),
                ss_ports: Mutex::new(ss_ports),
            }),
        })
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = (0..4)
            .map(|i| PathBuf::from(format!("/sys/devices/platform/vhci_hcd.{i}")))
            .collect();
        paths.push(PathBuf::from("/sys/devices/platform/vhci_hcd"));
        paths
    }

    async fn attach(&self, record: &DeviceRecord) -> Result<Attachment, SinkError> {
        let (kernel_end, our_end) = std::os::unix::net::UnixStream::pair()?;
        our_end.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(our_end)?;

        let port = self.allocate_port(record.speed)?;

        let attach_line = format!(
            "{} {} {} {}\n",
            port,
            kernel_end.as_raw_fd(),
            record.devid(),
            record.speed.code()
        );
        if let Err(e) = self.write_sysfs("attach", &attach_line) {
            self.free_port(port);
            return Err(e.into());
        }
        // The kernel owns its end of the pair now.
        std::mem::forget(kernel_end);

        info!(port, busid = %record.busid, "attached to vhci port");

        let (read_half, write_half) = stream.into_split();
        Ok(Attachment {
            port,
            urbs: UrbSource::Vhci(read_half),
            completions: CompletionSink::Vhci(write_half),
            guard: Some(PortGuard {
                shared: Arc::clone(&self.shared),
                port,
            }),
        })
    }

    /// Pick the first free port in the range matching the device speed,
    /// merging in the kernel's own view of port usage first.
    fn allocate_port(&self, speed: DeviceSpeed) -> Result<u8, SinkError> {
        let (kernel_hs, kernel_ss) = read_port_status(&self.shared.path).unwrap_or((0, 0));

        if speed.is_super() {
            let mut bitmap = self.shared.ss_ports.lock().unwrap();
            *bitmap |= kernel_ss;
            let free = bitmap.trailing_ones() as u8;
            if free >= 8 {
                return Err(SinkError::NoFreePort);
            }
            *bitmap |= 1 << free;
            Ok(free + 8)
        } else {
            let mut bitmap = self.shared.hs_ports.lock().unwrap();
            *bitmap |= kernel_hs;
            let free = bitmap.trailing_ones() as u8;
            if free >= 8 {
                return Err(SinkError::NoFreePort);
            }
            *bitmap |= 1 << free;
            Ok(free)
        }
    }

    fn free_port(&self, port: u8) {
        free_port_bit(&self.shared, port);
    }

    fn write_sysfs(&self, file: &str, contents: &str) -> std::io::Result<()> {
        write_sysfs_file(&self.shared.path, file, contents)
    }
}

/// Releases a vhci port: sysfs detach plus bitmap clear.
#[derive(Debug)]
pub struct PortGuard {
    shared: Arc<VhciShared>,
    port: u8,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        if let Err(e) = write_sysfs_file(&self.shared.path, "detach", &format!("{}\n", self.port))
        {
            // Already-detached ports make this fail, which is fine.
            debug!(port = self.port, "vhci detach: {e}");
        }
        free_port_bit(&self.shared, self.port);
        debug!(port = self.port, "vhci port released");
    }
}

fn free_port_bit(shared: &VhciShared, port: u8) {
    if port < 8 {
        *shared.hs_ports.lock().unwrap() &= !(1 << port);
    } else if port < 16 {
        *shared.ss_ports.lock().unwrap() &= !(1 << (port - 8));
    } else {
        warn!(port, "ignoring free of invalid port");
    }
}

fn write_sysfs_file(dir: &Path, file: &str, contents: &str) -> std::io::Result<()> {
    let path = dir.join(file);
    let mut f = OpenOptions::new().write(true).open(&path)?;
    f.write_all(contents.as_bytes())?;
    f.flush()
}

/// Parse the vhci `status` file into (hs, ss) in-use bitmaps.
///
/// ```text
/// hub port sta spd dev      sockfd local_busid
/// hs  0000 004 000 00000000 000000 0-0
/// ```
///
/// Status 4 (VDEV_ST_NULL) is a free port; anything else is in use.
fn read_port_status(path: &Path) -> std::io::Result<(u8, u8)> {
    let content = std::fs::read_to_string(path.join("status"))?;

    let mut hs = 0u8;
    let mut ss = 0u8;
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let Ok(port) = fields[1].parse::<u8>() else {
            continue;
        };
        let in_use = fields[2].parse::<u16>().unwrap_or(0) != 4;
        if !in_use {
            continue;
        }
        match fields[0] {
            "hs" if port < 8 => hs |= 1 << port,
            "ss" if (8..16).contains(&port) => ss |= 1 << (port - 8),
            _ => {}
        }
    }
    Ok((hs, ss))
}

/// In-memory sink for tests: submissions are injected and completions
/// observed through a [`LoopbackDriver`].
pub struct Loopback {
    port: u8,
    endpoints: Mutex<Option<(async_channel::Receiver<UrbRequest>, async_channel::Sender<UrbReply>)>>,
}

/// Test handle playing the role of the kernel's host controller.
pub struct LoopbackDriver {
    pub urb_tx: async_channel::Sender<UrbRequest>,
    pub completion_rx: async_channel::Receiver<UrbReply>,
}

impl Loopback {
    pub fn new(port: u8) -> (Self, LoopbackDriver) {
        let (urb_tx, urb_rx) = async_channel::bounded(64);
        let (completion_tx, completion_rx) = async_channel::bounded(64);
        (
            Self {
                port,
                endpoints: Mutex::new(Some((urb_rx, completion_tx))),
            },
            LoopbackDriver {
                urb_tx,
                completion_rx,
            },
        )
    }

    fn attach(&self, record: &DeviceRecord) -> Result<Attachment, SinkError> {
        let (urb_rx, completion_tx) = self
            .endpoints
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SinkError::Unavailable("loopback port already attached".to_string()))?;

        info!(port = self.port, busid = %record.busid, "attached to loopback port");

        Ok(Attachment {
            port: self.port,
            urbs: UrbSource::Loopback(urb_rx),
            completions: CompletionSink::Loopback(completion_tx),
            guard: None,
        })
    }
}
