#![allow(dead_code)]

//! Recording doubles for the service's collaborators.
//!
//! Every double appends to one shared event log so tests can assert the
//! exact order in which the service acquired and released things.

use async_trait::async_trait;
use edgetun_service::config_source::ConfigSource;
use edgetun_service::config_store::ConfigStore;
use edgetun_service::control_server::ControlServerSettings;
use edgetun_service::device::{
    AdapterIdentity, AdapterProvider, DeviceError, DeviceResult, InterfaceHandle, PacketEngine,
    PacketIo,
};
use edgetun_service::firewall::{DesiredPolicy, FirewallError, FirewallInstaller, FirewallResult};
use edgetun_service::privilege::{PrivilegeError, PrivilegeManager, PrivilegeResult};
use edgetun_service::service::{ServiceStatus, StatusReporter};
use edgetun_service::watcher::{NotificationSource, WatcherError, WatcherEvent, WatcherSettings};
use edgetun_service::{Collaborators, ServiceSettings};
use edgetun_uapi::model::KEY_LEN;
use edgetun_uapi::transport::socket_path;
use edgetun_uapi::{AuthConfig, ConfigurationError, Key, Peer, TunnelConfiguration, UapiClient};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub const ADAPTER_INDEX: u32 = 7;

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn record(&self, event: &str) {
        self.0.lock().unwrap().push(event.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

pub fn peer_key() -> Key {
    Key::from_bytes([2; KEY_LEN])
}

/// "ZitiTUN" with one peer routing 10.0.0.0/24.
pub fn ziti_config() -> TunnelConfiguration {
    let mut config = TunnelConfiguration::new("ZitiTUN");
    config.listen_port = 51820;
    config
        .peers
        .push(Peer::new(peer_key()).with_allowed_ip("10.0.0.0/24".parse().unwrap()));
    config
}

pub fn current_user() -> AuthConfig {
    AuthConfig::new()
        .allow_uid(nix::unistd::getuid().as_raw())
        .allow_gid(nix::unistd::getgid().as_raw())
}

pub struct MockConfigSource {
    pub log: EventLog,
    pub config: TunnelConfiguration,
    pub fail: AtomicBool,
}

impl ConfigSource for MockConfigSource {
    fn load(&self) -> Result<TunnelConfiguration, ConfigurationError> {
        self.log.record("config.load");
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConfigurationError::InvalidValue {
                key: "tunnel.name".to_string(),
                message: "rejected by test".to_string(),
            });
        }
        Ok(self.config.clone())
    }
}

pub struct MockIo {
    log: EventLog,
}

#[async_trait]
impl PacketIo for MockIo {
    async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        std::future::pending().await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        Ok(packet.len())
    }

    fn close(&self) -> io::Result<()> {
        self.log.record("device.close");
        Ok(())
    }
}

pub struct MockAdapters {
    pub log: EventLog,
    pub fail: AtomicBool,
}

#[async_trait]
impl AdapterProvider for MockAdapters {
    async fn create(&self, name: &str) -> DeviceResult<InterfaceHandle> {
        self.log.record("device.create");
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeviceError::Creation {
                name: name.to_string(),
                message: "rejected by test".to_string(),
            });
        }
        Ok(InterfaceHandle::new(
            AdapterIdentity::new(name, ADAPTER_INDEX),
            Arc::new(MockIo {
                log: self.log.clone(),
            }),
        ))
    }
}

pub struct MockEngine {
    pub log: EventLog,
    /// Notify to make the running engine fail
    pub crash: Notify,
    /// Keep running after cancellation
    pub stall: AtomicBool,
}

#[async_trait]
impl PacketEngine for MockEngine {
    async fn run(
        &self,
        _io: Arc<dyn PacketIo>,
        _config: ConfigStore,
        cancel: CancellationToken,
    ) -> DeviceResult<()> {
        self.log.record("engine.run");
        if self.stall.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                self.log.record("engine.stop");
                Ok(())
            }
            _ = self.crash.notified() => Err(DeviceError::Runtime("link lost".to_string())),
        }
    }
}

pub struct MockFirewall {
    pub log: EventLog,
    pub fail_enable: AtomicBool,
    pub fail_reconcile: AtomicBool,
    pub reconciles: AtomicUsize,
    pub last_policy: Mutex<Option<DesiredPolicy>>,
}

impl MockFirewall {
    pub fn reconciles(&self) -> usize {
        self.reconciles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FirewallInstaller for MockFirewall {
    async fn enable(&self, _identity: &AdapterIdentity) -> FirewallResult<()> {
        self.log.record("firewall.enable");
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(FirewallError::NotEnabled);
        }
        Ok(())
    }

    async fn reconcile(&self, policy: &DesiredPolicy) -> FirewallResult<()> {
        if self.fail_reconcile.load(Ordering::SeqCst) {
            return Err(FirewallError::NotEnabled);
        }
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        *self.last_policy.lock().unwrap() = Some(policy.clone());
        Ok(())
    }

    async fn disable(&self) -> FirewallResult<()> {
        self.log.record("firewall.disable");
        Ok(())
    }
}

pub struct MockPrivileges {
    pub log: EventLog,
    pub fail: AtomicBool,
}

impl PrivilegeManager for MockPrivileges {
    fn drop_privileges(&self) -> PrivilegeResult<()> {
        self.log.record("privileges.drop");
        if self.fail.load(Ordering::SeqCst) {
            return Err(PrivilegeError::StillPrivileged);
        }
        Ok(())
    }
}

pub struct MockNotifications {
    pub index: Mutex<Option<u32>>,
    feed: Mutex<Option<mpsc::Receiver<WatcherEvent>>>,
}

#[async_trait]
impl NotificationSource for MockNotifications {
    async fn run(
        &self,
        events: mpsc::Sender<WatcherEvent>,
        cancel: CancellationToken,
    ) -> Result<(), WatcherError> {
        let Some(mut feed) = self.feed.lock().unwrap().take() else {
            return Ok(());
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = feed.recv() => match event {
                    Some(event) => {
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    fn lookup(&self, _name: &str) -> Option<u32> {
        *self.index.lock().unwrap()
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    pub statuses: Mutex<Vec<ServiceStatus>>,
}

impl RecordingStatus {
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl StatusReporter for RecordingStatus {
    fn report(&self, status: ServiceStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

pub struct Harness {
    pub log: EventLog,
    pub runtime_dir: TempDir,
    pub config_source: Arc<MockConfigSource>,
    pub adapters: Arc<MockAdapters>,
    pub engine: Arc<MockEngine>,
    pub firewall: Arc<MockFirewall>,
    pub privileges: Arc<MockPrivileges>,
    pub notifications: Arc<MockNotifications>,
    pub status: Arc<RecordingStatus>,
    pub feed: mpsc::Sender<WatcherEvent>,
}

impl Harness {
    pub fn new(config: TunnelConfiguration) -> Self {
        let log = EventLog::default();
        let (feed, feed_rx) = mpsc::channel(64);

        Self {
            runtime_dir: tempfile::tempdir().unwrap(),
            config_source: Arc::new(MockConfigSource {
                log: log.clone(),
                config,
                fail: AtomicBool::new(false),
            }),
            adapters: Arc::new(MockAdapters {
                log: log.clone(),
                fail: AtomicBool::new(false),
            }),
            engine: Arc::new(MockEngine {
                log: log.clone(),
                crash: Notify::new(),
                stall: AtomicBool::new(false),
            }),
            firewall: Arc::new(MockFirewall {
                log: log.clone(),
                fail_enable: AtomicBool::new(false),
                fail_reconcile: AtomicBool::new(false),
                reconciles: AtomicUsize::new(0),
                last_policy: Mutex::new(None),
            }),
            privileges: Arc::new(MockPrivileges {
                log: log.clone(),
                fail: AtomicBool::new(false),
            }),
            notifications: Arc::new(MockNotifications {
                index: Mutex::new(Some(ADAPTER_INDEX)),
                feed: Mutex::new(Some(feed_rx)),
            }),
            status: Arc::new(RecordingStatus::default()),
            feed,
            log,
        }
    }

    pub fn settings(&self) -> ServiceSettings {
        ServiceSettings {
            grace_period: Duration::from_secs(1),
            control: ControlServerSettings {
                runtime_dir: self.runtime_dir.path().to_path_buf(),
                auth: current_user(),
            },
            watcher: WatcherSettings {
                debounce: Duration::from_millis(50),
                escalate_errors: true,
                queue_capacity: 16,
            },
            remove_firewall_on_stop: true,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            config_source: self.config_source.clone(),
            adapters: self.adapters.clone(),
            engine: self.engine.clone(),
            firewall: self.firewall.clone(),
            privileges: self.privileges.clone(),
            notifications: self.notifications.clone(),
            status: self.status.clone(),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        socket_path(self.runtime_dir.path(), &self.config_source.config.interface_name)
    }

    /// Wait until the service reports Running.
    pub async fn wait_running(&self) {
        let status = self.status.clone();
        wait_for(move || status.statuses().contains(&ServiceStatus::Running)).await;
    }

    pub async fn client(&self) -> UapiClient {
        let path = self.socket_path();
        for _ in 0..500 {
            if let Ok(client) = UapiClient::connect(&path).await {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("control socket {} never accepted", path.display());
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}
