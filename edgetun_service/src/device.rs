//! Tunnel device
//!
//! A [`TunnelDevice`] owns the OS adapter handle and the packet engine task
//! bound to it. The lifecycle is create, apply configuration, activate, wait,
//! close. `close` consumes the device, so a handle is released at most once.

use crate::config_store::ConfigStore;
use async_trait::async_trait;
use edgetun_uapi::model::validate_interface_name;
use edgetun_uapi::{ConfigurationError, ControlRequest, TunnelConfiguration};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn, Instrument};

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to create adapter {name}: {message}")]
    Creation { name: String, message: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Cannot {operation} a device that is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: DeviceState,
    },

    #[error("Packet engine failed: {0}")]
    Runtime(String),

    #[error("Failed to release adapter {name}: {source}")]
    Release {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Created,
    Configured,
    Active,
    Inactive,
}

/// Why the packet engine stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Stopped on request or the adapter went away cleanly
    Closed,
    /// Unrecoverable runtime failure
    Failed(String),
}

/// Name and current system index of the adapter.
///
/// The index changes when the OS recreates the adapter; the watcher records
/// the new index here without touching the handle.
#[derive(Debug)]
pub struct AdapterIdentity {
    name: String,
    index: AtomicU32,
    rebinds: AtomicU64,
}

impl AdapterIdentity {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index: AtomicU32::new(index),
            rebinds: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    /// Record `index` as the adapter's system index. Returns `false` when it
    /// was already current.
    pub fn rebind(&self, index: u32) -> bool {
        let previous = self.index.swap(index, Ordering::AcqRel);
        if previous == index {
            return false;
        }
        self.rebinds.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn rebind_count(&self) -> u64 {
        self.rebinds.load(Ordering::Acquire)
    }
}

/// Packet-level access to an adapter.
#[async_trait]
pub trait PacketIo: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// Release the OS handle.
    fn close(&self) -> io::Result<()>;
}

/// OS handle for the adapter. Not clonable; owned by one [`TunnelDevice`].
pub struct InterfaceHandle {
    identity: Arc<AdapterIdentity>,
    io: Arc<dyn PacketIo>,
}

impl InterfaceHandle {
    pub fn new(identity: AdapterIdentity, io: Arc<dyn PacketIo>) -> Self {
        Self {
            identity: Arc::new(identity),
            io,
        }
    }

    pub fn identity(&self) -> &Arc<AdapterIdentity> {
        &self.identity
    }

    fn close(self) -> io::Result<()> {
        self.io.close()
    }
}

/// Creates OS adapters.
#[async_trait]
pub trait AdapterProvider: Send + Sync {
    async fn create(&self, name: &str) -> DeviceResult<InterfaceHandle>;
}

/// The packet transform engine bound to an adapter.
///
/// `run` returns `Ok` once `cancel` fires and `Err` on an unrecoverable
/// failure. It reads the running configuration from `config` per packet.
#[async_trait]
pub trait PacketEngine: Send + Sync {
    async fn run(
        &self,
        io: Arc<dyn PacketIo>,
        config: ConfigStore,
        cancel: CancellationToken,
    ) -> DeviceResult<()>;
}

pub struct TunnelDevice {
    handle: InterfaceHandle,
    store: ConfigStore,
    engine: Arc<dyn PacketEngine>,
    state: DeviceState,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    task: Option<JoinHandle<()>>,
    termination_tx: Option<watch::Sender<Option<TerminationReason>>>,
    termination_rx: watch::Receiver<Option<TerminationReason>>,
}

impl TunnelDevice {
    /// Create the adapter named `name` and bind `engine` to it.
    pub async fn create(
        provider: &dyn AdapterProvider,
        name: &str,
        engine: Arc<dyn PacketEngine>,
    ) -> DeviceResult<Self> {
        validate_interface_name(name).map_err(|e| DeviceError::Creation {
            name: name.to_string(),
            message: e.to_string(),
        })?;

        let handle = provider.create(name).await?;
        info!(index = handle.identity().index(), "Created adapter {}", name);

        let cancel = CancellationToken::new();
        let (termination_tx, termination_rx) = watch::channel(None);

        Ok(Self {
            handle,
            store: ConfigStore::new(TunnelConfiguration::new(name)),
            engine,
            state: DeviceState::Created,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            task: None,
            termination_tx: Some(termination_tx),
            termination_rx,
        })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn identity(&self) -> Arc<AdapterIdentity> {
        Arc::clone(self.handle.identity())
    }

    /// The running configuration, shared with the control server.
    pub fn config_store(&self) -> ConfigStore {
        self.store.clone()
    }

    /// Apply configuration text in set-request form through the same path
    /// the control channel uses.
    pub fn apply_configuration(&mut self, text: &str) -> Result<(), ConfigurationError> {
        let ops = ControlRequest::parse_set_body(text)?;
        let applied = self.store.apply(&ops)?;
        debug!(peers = applied.peers.len(), "Applied configuration");

        if self.state == DeviceState::Created {
            self.state = DeviceState::Configured;
        }
        Ok(())
    }

    /// Start the packet engine.
    pub fn activate(&mut self) -> DeviceResult<()> {
        if self.state != DeviceState::Configured {
            return Err(DeviceError::InvalidState {
                operation: "activate",
                state: self.state,
            });
        }
        let Some(termination_tx) = self.termination_tx.take() else {
            return Err(DeviceError::InvalidState {
                operation: "activate",
                state: self.state,
            });
        };

        let engine = Arc::clone(&self.engine);
        let io = Arc::clone(&self.handle.io);
        let store = self.store.clone();
        let cancel = self.cancel.clone();

        let task = tokio::spawn(
            async move {
                let reason = match engine.run(io, store, cancel).await {
                    Ok(()) => TerminationReason::Closed,
                    Err(e) => TerminationReason::Failed(e.to_string()),
                };
                debug!("Packet engine finished: {:?}", reason);
                let _ = termination_tx.send(Some(reason));
            }
            .in_current_span(),
        );

        self.task = Some(task);
        self.state = DeviceState::Active;
        info!("Device activated");
        Ok(())
    }

    /// Resolve when the packet engine stops. Cancel safe; never resolves for
    /// a device that was not activated.
    pub async fn wait(&self) -> TerminationReason {
        let mut rx = self.termination_rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            // engine task dropped without reporting
            Err(_) => None,
        };
        reason.unwrap_or(TerminationReason::Closed)
    }

    /// Stop the packet engine, waiting up to `grace` before abandoning it.
    /// Returns `false` when the engine had to be abandoned.
    pub async fn deactivate(&mut self, grace: Duration) -> bool {
        if self.state != DeviceState::Active {
            return true;
        }
        self.state = DeviceState::Inactive;
        self.cancel.cancel();

        let Some(mut task) = self.task.take() else {
            return true;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => {
                info!("Device deactivated");
                true
            }
            Err(_) => {
                warn!("Packet engine did not stop within {:?}, abandoning it", grace);
                task.abort();
                false
            }
        }
    }

    /// Stop the engine if needed and release the adapter handle.
    pub async fn close(mut self, grace: Duration) -> DeviceResult<()> {
        self.deactivate(grace).await;

        let name = self.handle.identity().name().to_string();
        self.handle
            .close()
            .map_err(|source| DeviceError::Release {
                name: name.clone(),
                source,
            })?;
        info!("Closed adapter {}", name);
        Ok(())
    }
}
