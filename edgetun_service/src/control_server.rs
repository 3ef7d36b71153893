//! Control channel server
//!
//! Serves get and set requests on the per-interface Unix socket. Each
//! connection is handled on its own task; a bad request costs the client an
//! errno, never the server.

use crate::config_store::ConfigStore;
use edgetun_uapi::transport::socket_path;
use edgetun_uapi::{
    AuthConfig, ControlRequest, ControlResponse, ErrorCode, IpcError, UapiConnection,
    UapiListener,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, warn, Instrument};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ControlServerError {
    #[error("Failed to listen on {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: IpcError,
    },
}

#[derive(Debug, Clone)]
pub struct ControlServerSettings {
    /// Directory holding the `<interface>.sock` control sockets
    pub runtime_dir: PathBuf,
    pub auth: AuthConfig,
}

#[derive(Debug, Default)]
pub struct ControlStats {
    connections: AtomicU64,
    rejected: AtomicU64,
    requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl ControlStats {
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Connections refused by the peer credential check.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Requests answered with a nonzero errno.
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

pub struct ControlServer;

impl ControlServer {
    /// Bind the control socket for `interface_name` and start serving.
    pub async fn start(
        settings: &ControlServerSettings,
        interface_name: &str,
        store: ConfigStore,
    ) -> Result<ControlServerHandle, ControlServerError> {
        let path = socket_path(&settings.runtime_dir, interface_name);
        let listener = UapiListener::bind_with_auth(&path, settings.auth.clone())
            .await
            .map_err(|source| ControlServerError::Bind {
                path: path.clone(),
                source,
            })?;
        info!("Control channel listening on {}", path.display());

        let cancel = CancellationToken::new();
        let stats = Arc::new(ControlStats::default());
        let task = tokio::spawn(
            accept_loop(listener, store, cancel.clone(), Arc::clone(&stats)).in_current_span(),
        );

        Ok(ControlServerHandle {
            cancel,
            task,
            socket_path: path,
            stats,
        })
    }
}

/// Running control server.
pub struct ControlServerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    socket_path: PathBuf,
    stats: Arc<ControlStats>,
}

impl ControlServerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn stats(&self) -> Arc<ControlStats> {
        Arc::clone(&self.stats)
    }

    /// Stop accepting, let in-flight requests finish for up to `grace`, then
    /// remove the socket. Returns `false` when connections were aborted.
    pub async fn stop(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => {
                info!("Control channel closed");
                true
            }
            Err(_) => {
                warn!("Control channel did not close within {:?}, aborting", grace);
                task.abort();
                let _ = task.await;
                false
            }
        }
    }
}

async fn accept_loop(
    listener: UapiListener,
    store: ConfigStore,
    cancel: CancellationToken,
    stats: Arc<ControlStats>,
) {
    let mut clients = JoinSet::new();
    let mut next_id: u64 = 0;
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(joined) = clients.join_next(), if !clients.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Control connection task panicked: {}", e);
                    }
                }
            }

            accepted = listener.accept() => match accepted {
                Ok(connection) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    next_id += 1;
                    stats.connections.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Accepted control connection {} (UID={}, GID={})",
                        next_id,
                        connection.peer_uid(),
                        connection.peer_gid()
                    );

                    let span = debug_span!("client", id = next_id);
                    clients.spawn(
                        handle_client(connection, store.clone(), cancel.clone(), Arc::clone(&stats))
                            .instrument(span),
                    );
                }
                Err(IpcError::Authentication(message)) => {
                    stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("Rejected control connection: {}", message);
                }
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            },
        }
    }

    // Connections see the same token and finish their current request
    while clients.join_next().await.is_some() {}
    drop(listener);
    debug!("Control accept loop finished");
}

async fn handle_client(
    mut connection: UapiConnection,
    store: ConfigStore,
    cancel: CancellationToken,
    stats: Arc<ControlStats>,
) {
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = connection.read_request() => read,
        };

        let response = match read {
            Ok(Some(lines)) => {
                stats.requests.fetch_add(1, Ordering::Relaxed);
                handle_request(&store, &lines)
            }
            Ok(None) => {
                debug!("Control client disconnected");
                break;
            }
            Err(IpcError::Malformed(message)) => {
                // The stream can no longer be framed; answer and hang up
                warn!("Malformed control request: {}", message);
                stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                let _ = connection
                    .send_response(&ControlResponse::error(ErrorCode::Protocol))
                    .await;
                break;
            }
            Err(e) => {
                debug!("Control connection ended: {}", e);
                break;
            }
        };

        if !response.is_success() {
            stats.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(e) = connection.send_response(&response).await {
            debug!("Failed to send control response: {}", e);
            break;
        }
    }
    let _ = connection.close().await;
}

/// Answer one request against the running configuration.
pub fn handle_request<S: AsRef<str>>(store: &ConfigStore, lines: &[S]) -> ControlResponse {
    let request = match ControlRequest::parse(lines) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected control request: {}", e);
            return ControlResponse::error(e.error_code());
        }
    };

    match request {
        ControlRequest::Get(scope) => {
            ControlResponse::with_entries(store.snapshot().get_entries(scope))
        }
        ControlRequest::Set(ops) => match store.apply(&ops) {
            Ok(applied) => {
                info!(
                    peers = applied.peers.len(),
                    generation = store.generation(),
                    "Applied set request"
                );
                ControlResponse::ok()
            }
            Err(e) => {
                warn!("Set request rejected: {}", e);
                ControlResponse::error(e.error_code())
            }
        },
    }
}
