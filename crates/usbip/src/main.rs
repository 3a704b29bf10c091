//! usbip: export local USB devices or attach remote ones over TCP.
//!
//! One binary, two roles: `--server` runs the exporter on a TCP listener,
//! `--client` connects out, imports a device and bridges it into the local
//! vhci-hcd controller. Exit codes: 0 clean shutdown, 1 usage error,
//! 2 runtime error.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use usbip::config::Config;
use usbip::exporter::{self, Exporter};
use usbip::importer::{self, ImporterOptions, Sink};
use usbip::usb::{Backend, DeviceFilter, LibusbBackend};

#[derive(Parser, Debug)]
#[command(name = "usbip")]
#[command(version, about = "USB/IP peer: export local USB devices or attach remote ones")]
struct Args {
    /// Run the exporter (device server)
    #[arg(short = 's', long = "server", conflicts_with = "client")]
    server: bool,

    /// Run the importer (device client)
    #[arg(short = 'c', long = "client")]
    client: bool,

    /// TCP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Server address to connect to (client mode)
    #[arg(short, long)]
    ip: Option<String>,

    /// Import this busid instead of the first listed device (client mode)
    #[arg(long)]
    busid: Option<String>,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Usage problems (and --help/--version) exit 1 per our CLI
            // contract; clap already wrote the message.
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    if args.server == args.client {
        eprintln!("error: exactly one of --server or --client is required");
        std::process::exit(1);
    }

    match run(args) {
        Ok(()) => {}
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn run(args: Args) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(run_async(args))
}

async fn run_async(args: Args) -> Result<()> {
    let config = Config::load_or_default(args.config.clone())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level).context("failed to set up logging")?;

    info!("usbip v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = spawn_signal_handler()?;

    if args.server {
        run_server(args, config, shutdown).await
    } else {
        run_client(args, config, shutdown).await
    }
}

/// SIGINT and SIGTERM both flip the shutdown watch; sessions notice and
/// drain, listeners stop accepting.
fn spawn_signal_handler() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        let _ = tx.send(true);
        // Keep the sender alive so later subscribers still observe the
        // shutdown value instead of a closed channel.
        std::future::pending::<()>().await;
    });

    Ok(rx)
}

async fn run_server(args: Args, config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let backend = Backend::Libusb(LibusbBackend::new().context("failed to initialize libusb")?);
    let filter = DeviceFilter::allow_classes(config.usb.allowed_classes.clone());
    let transfer_timeout = Duration::from_millis(config.usb.transfer_timeout_ms);

    let exporter = Arc::new(Exporter::new(
        backend,
        filter,
        transfer_timeout,
        config.limits.queue_depth,
    ));
    let limiter = common::AcceptLimiter::new(
        config.limits.accepts_per_second,
        config.limits.max_sessions,
    );

    let port = args.port.unwrap_or(config.network.port);
    let listener = TcpListener::bind((config.network.listen_addr.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.network.listen_addr, port))?;

    exporter::serve(listener, exporter, limiter.clone(), shutdown).await?;

    // Give live sessions a chance to drain; in-flight transfers are bounded
    // by the per-transfer timeout.
    let deadline = tokio::time::Instant::now() + transfer_timeout + Duration::from_millis(500);
    while limiter.active_sessions() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!("exporter stopped");
    Ok(())
}

async fn run_client(args: Args, config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = args.ip.unwrap_or_else(|| config.network.connect_addr.clone());
    let port = args.port.unwrap_or(config.network.port);

    let stream = TcpStream::connect((addr.as_str(), port))
        .await
        .with_context(|| format!("failed to connect to {addr}:{port}"))?;
    stream.set_nodelay(true)?;
    info!("connected to {addr}:{port}");

    let sink = Sink::Vhci(
        importer::sink::VhciSysfs::discover().context("vhci-hcd is not available")?,
    );

    importer::run(
        stream,
        &sink,
        ImporterOptions { busid: args.busid },
        shutdown,
    )
    .await
    .context("import session failed")?;

    info!("importer stopped");
    Ok(())
}
