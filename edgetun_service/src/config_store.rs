//! Running configuration shared by the device, control server and watcher.
//!
//! Readers load the current snapshot without locking. Writers are serialized
//! by a mutex, build the next snapshot from the current one and swap it in,
//! so a reader only ever sees a fully applied configuration.

use arc_swap::ArcSwap;
use edgetun_uapi::{ConfigurationError, SetOperation, TunnelConfiguration};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<Inner>,
}

struct Inner {
    current: ArcSwap<TunnelConfiguration>,
    writer: Mutex<()>,
    generation: watch::Sender<u64>,
}

impl ConfigStore {
    pub fn new(initial: TunnelConfiguration) -> Self {
        Self {
            inner: Arc::new(Inner {
                current: ArcSwap::from_pointee(initial),
                writer: Mutex::new(()),
                generation: watch::channel(0).0,
            }),
        }
    }

    /// Current configuration.
    pub fn snapshot(&self) -> Arc<TunnelConfiguration> {
        self.inner.current.load_full()
    }

    /// Number of snapshots swapped in since creation.
    pub fn generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    /// Receiver notified after every swap.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    /// Apply `ops` on top of the current snapshot. On error the running
    /// configuration is unchanged.
    pub fn apply(
        &self,
        ops: &[SetOperation],
    ) -> Result<Arc<TunnelConfiguration>, ConfigurationError> {
        let _guard = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let next = Arc::new(self.inner.current.load().apply(ops)?);
        self.inner.current.store(Arc::clone(&next));
        self.inner.generation.send_modify(|generation| *generation += 1);
        Ok(next)
    }
}
