//! TCP accept loop for the exporter.
//!
//! Each accepted socket passes admission control and becomes its own
//! session task; one session failing never touches its siblings. A refused
//! socket is dropped without a byte written.

use crate::exporter::session::Exporter;
use common::{AcceptDecision, AcceptLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` before retrying, so a transient resource
/// failure (fd exhaustion) does not spin the loop.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(200);

pub async fn serve(
    listener: TcpListener,
    exporter: Arc<Exporter>,
    limiter: AcceptLimiter,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "exporter listening");

    let mut accept_shutdown = shutdown.clone();
    loop {
        let (stream, peer) = tokio::select! {
            _ = accept_shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
        };

        match limiter.admit() {
            AcceptDecision::Admitted(permit) => {
                let _ = stream.set_nodelay(true);
                let exporter = Arc::clone(&exporter);
                let session_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    debug!(%peer, "session started");
                    match exporter.run_session(stream, session_shutdown).await {
                        Ok(()) => debug!(%peer, "session closed"),
                        Err(e) => warn!(%peer, "session failed: {e}"),
                    }
                });
            }
            decision => {
                warn!(%peer, ?decision, "connection refused");
            }
        }
    }

    info!("exporter listener stopped");
    Ok(())
}
