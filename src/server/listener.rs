//! The accept loop: hands freshly accepted sockets to the worker pool.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::worker::{ConnectionSeed, WorkerPool};

/// Per-listener configuration.
#[derive(Clone, Default)]
pub struct ListenerConfig {
    /// TLS config; `None` for a plaintext listener.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Apply `TCP_NODELAY` to accepted sockets.
    pub tcp_nodelay: bool,
}

/// Accept connections forever, dispatching each to the pool round robin.
pub async fn run_listener(
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    config: ListenerConfig,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    info!(
        address = %local,
        tls = config.tls.is_some(),
        "listener accepting connections"
    );
    loop {
        let (stream, peer) = listener.accept().await?;
        if config.tcp_nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                warn!(peer = %peer, error = %err, "setsockopt(TCP_NODELAY) failed");
            }
        }
        let std_stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(peer = %peer, error = %err, "failed to detach accepted socket");
                continue;
            }
        };
        pool.dispatch(ConnectionSeed {
            stream: std_stream,
            tls: config.tls.clone(),
            peer: peer.to_string(),
        });
    }
}
