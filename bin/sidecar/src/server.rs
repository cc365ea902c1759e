//! Inbound HTTP listener with graceful drain

use crate::routes::{self, AppState};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Time abandoned handlers get to answer once the drain timeout has passed
const ABANDON_GRACE: Duration = Duration::from_secs(1);

/// Accept connections until `shutdown` is cancelled, then stop accepting and
/// let open connections finish. After `drain_timeout` any request still
/// running is abandoned through `state.abandon`.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    let connections = TaskTracker::new();

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let state = state.clone();
        let shutdown = shutdown.clone();

        connections.spawn(async move {
            let service = service_fn(move |req| routes::handle_request(req, state.clone()));
            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!("Error serving connection from {}: {}", peer_addr, e);
                    }
                }
                _ = shutdown.cancelled() => {
                    // finish the request in flight, then close
                    conn.as_mut().graceful_shutdown();
                    if let Err(e) = conn.await {
                        debug!("Error draining connection from {}: {}", peer_addr, e);
                    }
                }
            }
        });
    }

    drop(listener);
    connections.close();
    info!("Listener closed, draining {} connections", connections.len());

    if tokio::time::timeout(drain_timeout, connections.wait()).await.is_err() {
        warn!(
            "Shutdown timeout of {:?} elapsed, abandoning {} connections",
            drain_timeout,
            connections.len()
        );
        state.abandon.cancel();
        let _ = tokio::time::timeout(ABANDON_GRACE, connections.wait()).await;
    }

    info!("All connections drained");
}
