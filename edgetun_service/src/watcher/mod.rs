//! Interface watcher
//!
//! Listens for interface changes from a [`NotificationSource`], coalesces
//! bursts inside a debounce window and then reconciles host policy once:
//! rebind the adapter index if the OS recreated it, recompute the
//! [`DesiredPolicy`] from the running configuration and hand it to the
//! firewall. Configuration swaps made through the control channel trigger
//! the same path.

pub mod source;

pub use source::{NotificationSource, PollingSource};

use crate::config_store::ConfigStore;
use crate::device::AdapterIdentity;
use crate::firewall::{DesiredPolicy, FirewallError, FirewallInstaller};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const MAX_DEBOUNCE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceId {
    pub name: String,
    pub index: u32,
}

impl InterfaceId {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    InterfaceAdded(InterfaceId),
    InterfaceRemoved(InterfaceId),
    InterfaceChanged(InterfaceId),
}

impl WatcherEvent {
    pub fn interface(&self) -> &InterfaceId {
        match self {
            WatcherEvent::InterfaceAdded(id)
            | WatcherEvent::InterfaceRemoved(id)
            | WatcherEvent::InterfaceChanged(id) => id,
        }
    }
}

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Notification source failed: {0}")]
    Source(String),

    #[error("Reconciliation failed: {0}")]
    Reconcile(#[from] FirewallError),
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Window, measured from the first event, in which further events are
    /// folded into a single reconciliation
    pub debounce: Duration,
    /// Report failures to the service instead of logging and retrying
    pub escalate_errors: bool,
    /// Capacity of the event queue between source and watcher
    pub queue_capacity: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            escalate_errors: true,
            queue_capacity: 64,
        }
    }
}

impl From<&shared_utils::config::WatcherConfig> for WatcherSettings {
    fn from(config: &shared_utils::config::WatcherConfig) -> Self {
        Self {
            debounce: config.debounce(),
            escalate_errors: config.escalate_errors,
            queue_capacity: config.queue_capacity,
        }
    }
}

#[derive(Debug, Default)]
pub struct WatcherStats {
    reconciliations: AtomicU64,
    events: AtomicU64,
    failures: AtomicU64,
}

impl WatcherStats {
    /// Reconciliation attempts, including the one made at startup.
    pub fn reconciliations(&self) -> u64 {
        self.reconciliations.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

struct Reconciler {
    identity: Arc<AdapterIdentity>,
    store: ConfigStore,
    firewall: Arc<dyn FirewallInstaller>,
    source: Arc<dyn NotificationSource>,
    stats: Arc<WatcherStats>,
}

impl Reconciler {
    async fn reconcile(&self) -> Result<(), WatcherError> {
        self.stats.reconciliations.fetch_add(1, Ordering::Relaxed);

        let present = match self.source.lookup(self.identity.name()) {
            Some(index) => {
                if self.identity.rebind(index) {
                    info!("Adapter {} rebound to index {}", self.identity.name(), index);
                }
                true
            }
            None => {
                debug!("Adapter {} is not present", self.identity.name());
                false
            }
        };

        let policy = DesiredPolicy::compute(&self.identity, present, &self.store.snapshot());
        self.firewall.reconcile(&policy).await.map_err(|e| {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            WatcherError::from(e)
        })
    }
}

pub struct InterfaceWatcher;

impl InterfaceWatcher {
    /// Reconcile once, then keep host policy current in the background.
    ///
    /// Failures of the initial reconciliation are returned. Later failures go
    /// to `errors` when escalation is enabled.
    pub async fn start(
        identity: Arc<AdapterIdentity>,
        store: ConfigStore,
        firewall: Arc<dyn FirewallInstaller>,
        source: Arc<dyn NotificationSource>,
        settings: WatcherSettings,
        errors: mpsc::Sender<WatcherError>,
    ) -> Result<WatcherHandle, WatcherError> {
        let stats = Arc::new(WatcherStats::default());
        let reconciler = Reconciler {
            identity,
            store,
            firewall,
            source: Arc::clone(&source),
            stats: Arc::clone(&stats),
        };
        // Subscribe first so a swap racing the initial pass still triggers
        let config_rx = reconciler.store.subscribe();
        reconciler.reconcile().await?;

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(settings.queue_capacity.max(1));

        let source_task = {
            let cancel = cancel.clone();
            let errors = errors.clone();
            let escalate = settings.escalate_errors;
            tokio::spawn(
                async move {
                    if let Err(e) = source.run(event_tx, cancel).await {
                        if escalate {
                            let _ = errors.send(e).await;
                        } else {
                            error!("Interface notifications stopped: {}", e);
                        }
                    }
                }
                .in_current_span(),
            )
        };

        let task = tokio::spawn(
            watch_loop(reconciler, event_rx, config_rx, settings, errors, cancel.clone())
                .in_current_span(),
        );

        info!("Interface watcher started");
        Ok(WatcherHandle {
            cancel,
            task,
            source_task,
            stats,
        })
    }
}

async fn watch_loop(
    reconciler: Reconciler,
    mut events: mpsc::Receiver<WatcherEvent>,
    mut config_rx: watch::Receiver<u64>,
    settings: WatcherSettings,
    errors: mpsc::Sender<WatcherError>,
    cancel: CancellationToken,
) {
    let debounce = settings.debounce.min(MAX_DEBOUNCE);
    let mut events_open = true;
    let mut retry: Option<(Instant, Duration)> = None;

    loop {
        // Wait for the first trigger of the next window
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    reconciler.stats.events.fetch_add(1, Ordering::Relaxed);
                    debug!("Interface event: {:?}", event);
                }
                None => {
                    events_open = false;
                    continue;
                }
            },
            Ok(()) = config_rx.changed() => {
                debug!("Running configuration changed");
            }
            _ = sleep_until(retry.map(|(at, _)| at).unwrap_or_else(Instant::now)), if retry.is_some() => {
                debug!("Retrying reconciliation");
            }
        }

        let deadline = Instant::now() + debounce;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep_until(deadline) => break,
                event = events.recv(), if events_open => match event {
                    Some(_) => {
                        reconciler.stats.events.fetch_add(1, Ordering::Relaxed);
                    }
                    None => events_open = false,
                },
                Ok(()) = config_rx.changed() => {}
            }
        }

        match reconciler.reconcile().await {
            Ok(()) => retry = None,
            Err(e) if settings.escalate_errors => {
                error!("Interface reconciliation failed: {}", e);
                let _ = errors.send(e).await;
                break;
            }
            Err(e) => {
                let delay = retry
                    .map(|(_, delay)| delay.saturating_mul(2).min(MAX_RETRY_DELAY))
                    .unwrap_or(debounce.clamp(Duration::from_millis(100), MAX_RETRY_DELAY));
                warn!("Interface reconciliation failed, retrying in {:?}: {}", delay, e);
                retry = Some((Instant::now() + delay, delay));
            }
        }
    }
    debug!("Interface watcher loop finished");
}

/// Running watcher.
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    source_task: JoinHandle<()>,
    stats: Arc<WatcherStats>,
}

impl WatcherHandle {
    pub fn stats(&self) -> Arc<WatcherStats> {
        Arc::clone(&self.stats)
    }

    pub fn reconciliations(&self) -> u64 {
        self.stats.reconciliations()
    }

    /// Stop the watcher, waiting up to `grace` for its tasks. Returns `false`
    /// when a task had to be aborted.
    pub async fn stop(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let mut clean = true;
        for mut task in [self.task, self.source_task] {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("Watcher task did not stop within {:?}, aborting it", grace);
                task.abort();
                clean = false;
            }
        }
        info!("Interface watcher stopped");
        clean
    }
}
