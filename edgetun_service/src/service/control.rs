//! Service control codes, status reporting and the Unix signal adapter.

use std::fmt;
use std::io;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Request from the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    Stop,
    /// The host is shutting down
    Shutdown,
    /// Report the current status
    Interrogate,
}

/// Status as reported to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    Running,
    StopPending,
    Stopped,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::StopPending => "stop-pending",
            ServiceStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Sink for status updates.
pub trait StatusReporter: Send + Sync {
    fn report(&self, status: ServiceStatus);
}

/// Reports status as log lines.
#[derive(Debug, Default)]
pub struct LogStatusReporter;

impl StatusReporter for LogStatusReporter {
    fn report(&self, status: ServiceStatus) {
        info!(%status, "Service status");
    }
}

/// Translate process signals into control codes until `cancel` fires.
///
/// SIGINT and SIGTERM stop the service, SIGUSR1 interrogates it. On Linux
/// SIGPWR is treated as host shutdown.
pub fn spawn_signal_adapter(
    controls: mpsc::Sender<ControlCode>,
    cancel: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    #[cfg(target_os = "linux")]
    let mut sigpwr = signal(SignalKind::from_raw(libc::SIGPWR))?;

    Ok(tokio::spawn(async move {
        loop {
            #[cfg(target_os = "linux")]
            let power = sigpwr.recv();
            #[cfg(not(target_os = "linux"))]
            let power = std::future::pending::<Option<()>>();

            let code = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sigint.recv() => ControlCode::Stop,
                _ = sigterm.recv() => ControlCode::Stop,
                _ = sigusr1.recv() => ControlCode::Interrogate,
                _ = power => ControlCode::Shutdown,
            };

            debug!("Received signal for {:?}", code);
            if controls.send(code).await.is_err() {
                break;
            }
        }
    }))
}
