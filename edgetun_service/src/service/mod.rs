//! Service control loop
//!
//! [`TunnelService`] sequences startup, multiplexes the running tunnel's
//! terminal events and tears everything down in reverse acquisition order.
//!
//! Startup order:
//!
//! 1. load configuration
//! 2. create the device
//! 3. enable the firewall
//! 4. drop privileges
//! 5. apply the configuration to the device
//! 6. activate the device
//! 7. start the control server
//! 8. start the interface watcher
//!
//! A failure at any step releases what the earlier steps acquired, newest
//! first, and the service ends in `Stopped`.

pub mod control;

pub use control::{ControlCode, LogStatusReporter, ServiceStatus, StatusReporter};

use crate::config_source::ConfigSource;
use crate::control_server::{ControlServer, ControlServerError, ControlServerHandle, ControlServerSettings};
use crate::device::{AdapterProvider, DeviceError, PacketEngine, TerminationReason, TunnelDevice};
use crate::firewall::{FirewallError, FirewallInstaller};
use crate::privilege::{PrivilegeError, PrivilegeManager};
use crate::watcher::{InterfaceWatcher, NotificationSource, WatcherError, WatcherHandle, WatcherSettings};
use edgetun_uapi::messages::encode_set_operations;
use edgetun_uapi::ConfigurationError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

/// Exit code after a requested stop.
pub const EXIT_OK: i32 = 0;
/// Exit code when startup did not complete.
pub const EXIT_STARTUP_FAILURE: i32 = 1;
/// Exit code when a running subsystem failed.
pub const EXIT_RUNTIME_FAILURE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ServiceState {
    pub fn status(self) -> ServiceStatus {
        match self {
            ServiceState::Starting => ServiceStatus::Starting,
            ServiceState::Running => ServiceStatus::Running,
            ServiceState::Stopping => ServiceStatus::StopPending,
            ServiceState::Stopped => ServiceStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    LoadConfiguration,
    CreateDevice,
    EnableFirewall,
    DropPrivileges,
    ApplyConfiguration,
    ActivateDevice,
    StartControlServer,
    StartWatcher,
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartupStep::LoadConfiguration => "load configuration",
            StartupStep::CreateDevice => "create device",
            StartupStep::EnableFirewall => "enable firewall",
            StartupStep::DropPrivileges => "drop privileges",
            StartupStep::ApplyConfiguration => "apply configuration",
            StartupStep::ActivateDevice => "activate device",
            StartupStep::StartControlServer => "start control server",
            StartupStep::StartWatcher => "start interface watcher",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum StartupFailure {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error(transparent)]
    ControlServer(#[from] ControlServerError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),
}

#[derive(Error, Debug)]
#[error("Failed to {step}: {source}")]
pub struct StartupError {
    pub step: StartupStep,
    #[source]
    pub source: StartupFailure,
}

fn at<E: Into<StartupFailure>>(step: StartupStep) -> impl FnOnce(E) -> StartupError {
    move |source| StartupError {
        step,
        source: source.into(),
    }
}

/// What ended the running state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// Stop or Shutdown from the service manager
    Control(ControlCode),
    /// The service manager went away
    ControlChannelClosed,
    DeviceTerminated(TerminationReason),
    WatcherFailed(String),
}

/// Something acquired during startup that teardown must release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Device,
    Firewall,
    Activation,
    ControlServer,
    Watcher,
}

#[derive(Debug)]
pub struct ServiceOutcome {
    pub result: Result<StopCause, StartupError>,
    /// Resources in the order they were released
    pub released: Vec<Resource>,
}

impl ServiceOutcome {
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Err(_) => EXIT_STARTUP_FAILURE,
            Ok(StopCause::DeviceTerminated(TerminationReason::Failed(_)))
            | Ok(StopCause::WatcherFailed(_)) => EXIT_RUNTIME_FAILURE,
            Ok(_) => EXIT_OK,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Upper bound on the wait for each subsystem during teardown
    pub grace_period: Duration,
    pub control: ControlServerSettings,
    pub watcher: WatcherSettings,
    /// Remove host firewall policy when the service stops
    pub remove_firewall_on_stop: bool,
}

/// External capabilities the service drives.
#[derive(Clone)]
pub struct Collaborators {
    pub config_source: Arc<dyn ConfigSource>,
    pub adapters: Arc<dyn AdapterProvider>,
    pub engine: Arc<dyn PacketEngine>,
    pub firewall: Arc<dyn FirewallInstaller>,
    pub privileges: Arc<dyn PrivilegeManager>,
    pub notifications: Arc<dyn NotificationSource>,
    pub status: Arc<dyn StatusReporter>,
}

#[derive(Default)]
struct Resources {
    device: Option<TunnelDevice>,
    control: Option<ControlServerHandle>,
    watcher: Option<WatcherHandle>,
    acquired: Vec<Resource>,
}

pub struct TunnelService {
    settings: ServiceSettings,
    collaborators: Collaborators,
    state: ServiceState,
}

impl TunnelService {
    pub fn new(settings: ServiceSettings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            collaborators,
            state: ServiceState::Starting,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    fn set_state(&mut self, state: ServiceState) {
        debug!("Service state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.collaborators.status.report(state.status());
    }

    /// Run the service to completion, taking control codes from `controls`.
    pub async fn run(mut self, mut controls: mpsc::Receiver<ControlCode>) -> ServiceOutcome {
        let span = info_span!("tunnel", iface = field::Empty);
        async move {
            self.set_state(ServiceState::Starting);

            let mut resources = Resources::default();
            let (watcher_errors_tx, mut watcher_errors) = mpsc::channel(4);

            let result = match self.start(&mut resources, watcher_errors_tx).await {
                Ok(()) => {
                    self.set_state(ServiceState::Running);
                    info!("Startup complete");
                    Ok(self
                        .running(&resources, &mut controls, &mut watcher_errors)
                        .await)
                }
                Err(e) => {
                    error!("Startup failed: {}", e);
                    Err(e)
                }
            };

            // A failed startup goes straight to Stopped
            if result.is_ok() {
                self.set_state(ServiceState::Stopping);
            } else {
                self.state = ServiceState::Stopping;
            }
            let released = self.teardown(resources, &mut controls).await;
            self.set_state(ServiceState::Stopped);

            ServiceOutcome { result, released }
        }
        .instrument(span)
        .await
    }

    async fn start(
        &self,
        resources: &mut Resources,
        watcher_errors: mpsc::Sender<WatcherError>,
    ) -> Result<(), StartupError> {
        let c = &self.collaborators;

        let config = c
            .config_source
            .load()
            .map_err(at(StartupStep::LoadConfiguration))?;
        let name = config.interface_name.clone();
        Span::current().record("iface", name.as_str());
        info!(peers = config.peers.len(), "Loaded configuration");

        let device = TunnelDevice::create(c.adapters.as_ref(), &name, Arc::clone(&c.engine))
            .await
            .map_err(at(StartupStep::CreateDevice))?;
        let device = resources.device.insert(device);
        resources.acquired.push(Resource::Device);
        let identity = device.identity();

        c.firewall
            .enable(&identity)
            .await
            .map_err(at(StartupStep::EnableFirewall))?;
        resources.acquired.push(Resource::Firewall);

        c.privileges
            .drop_privileges()
            .map_err(at(StartupStep::DropPrivileges))?;

        let text = encode_set_operations(&config.to_set_operations());
        device
            .apply_configuration(&text)
            .map_err(at(StartupStep::ApplyConfiguration))?;

        device
            .activate()
            .map_err(at(StartupStep::ActivateDevice))?;
        resources.acquired.push(Resource::Activation);

        let control = ControlServer::start(&self.settings.control, &name, device.config_store())
            .await
            .map_err(at(StartupStep::StartControlServer))?;
        resources.control = Some(control);
        resources.acquired.push(Resource::ControlServer);

        let watcher = InterfaceWatcher::start(
            identity,
            device.config_store(),
            Arc::clone(&c.firewall),
            Arc::clone(&c.notifications),
            self.settings.watcher.clone(),
            watcher_errors,
        )
        .await
        .map_err(at(StartupStep::StartWatcher))?;
        resources.watcher = Some(watcher);
        resources.acquired.push(Resource::Watcher);

        Ok(())
    }

    async fn running(
        &self,
        resources: &Resources,
        controls: &mut mpsc::Receiver<ControlCode>,
        watcher_errors: &mut mpsc::Receiver<WatcherError>,
    ) -> StopCause {
        let Some(device) = resources.device.as_ref() else {
            return StopCause::DeviceTerminated(TerminationReason::Closed);
        };

        loop {
            tokio::select! {
                code = controls.recv() => match code {
                    Some(ControlCode::Interrogate) => {
                        self.collaborators.status.report(self.state.status());
                    }
                    Some(code) => {
                        info!("Received {:?} request", code);
                        return StopCause::Control(code);
                    }
                    None => {
                        warn!("Service control channel closed, stopping");
                        return StopCause::ControlChannelClosed;
                    }
                },

                reason = device.wait() => {
                    match &reason {
                        TerminationReason::Closed => warn!("Device stopped unexpectedly"),
                        TerminationReason::Failed(e) => error!("Device failed: {}", e),
                    }
                    return StopCause::DeviceTerminated(reason);
                }

                Some(e) = watcher_errors.recv() => {
                    error!("Interface watcher failed: {}", e);
                    return StopCause::WatcherFailed(e.to_string());
                }
            }
        }
    }

    /// Release resources newest first. Control codes arriving meanwhile are
    /// answered or ignored; the first terminal event already decided.
    async fn teardown(
        &self,
        resources: Resources,
        controls: &mut mpsc::Receiver<ControlCode>,
    ) -> Vec<Resource> {
        let release = self.release(resources);
        tokio::pin!(release);

        loop {
            tokio::select! {
                released = &mut release => return released,
                Some(code) = controls.recv() => match code {
                    ControlCode::Interrogate => {
                        self.collaborators.status.report(ServiceStatus::StopPending);
                    }
                    code => debug!("Ignoring {:?} request during teardown", code),
                },
            }
        }
    }

    async fn release(&self, resources: Resources) -> Vec<Resource> {
        let grace = self.settings.grace_period;
        let Resources {
            mut device,
            mut control,
            mut watcher,
            mut acquired,
        } = resources;
        let mut released = Vec::with_capacity(acquired.len());

        while let Some(resource) = acquired.pop() {
            match resource {
                Resource::Watcher => {
                    if let Some(watcher) = watcher.take() {
                        if !watcher.stop(grace).await {
                            warn!("Abandoned interface watcher after {:?}", grace);
                        }
                    }
                }
                Resource::ControlServer => {
                    if let Some(control) = control.take() {
                        if !control.stop(grace).await {
                            warn!("Abandoned control connections after {:?}", grace);
                        }
                    }
                }
                Resource::Activation => {
                    if let Some(device) = device.as_mut() {
                        if !device.deactivate(grace).await {
                            warn!("Abandoned packet engine after {:?}", grace);
                        }
                    }
                }
                Resource::Firewall => {
                    if self.settings.remove_firewall_on_stop {
                        if let Err(e) = self.collaborators.firewall.disable().await {
                            error!("Failed to remove firewall policy: {}", e);
                        }
                    } else {
                        info!("Leaving firewall policy in place");
                    }
                }
                Resource::Device => {
                    if let Some(device) = device.take() {
                        if let Err(e) = device.close(grace).await {
                            error!("{}", e);
                        }
                    }
                }
            }
            released.push(resource);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let outcome = |result| ServiceOutcome {
            result,
            released: Vec::new(),
        };

        assert_eq!(outcome(Ok(StopCause::Control(ControlCode::Stop))).exit_code(), EXIT_OK);
        assert_eq!(
            outcome(Ok(StopCause::DeviceTerminated(TerminationReason::Failed(
                "boom".into()
            ))))
            .exit_code(),
            EXIT_RUNTIME_FAILURE
        );
        assert_eq!(
            outcome(Ok(StopCause::WatcherFailed("boom".into()))).exit_code(),
            EXIT_RUNTIME_FAILURE
        );
        assert_eq!(
            outcome(Err(StartupError {
                step: StartupStep::DropPrivileges,
                source: PrivilegeError::StillPrivileged.into(),
            }))
            .exit_code(),
            EXIT_STARTUP_FAILURE
        );
    }

    #[test]
    fn state_maps_to_reported_status() {
        assert_eq!(ServiceState::Stopping.status(), ServiceStatus::StopPending);
        assert_eq!(ServiceState::Stopped.status(), ServiceStatus::Stopped);
    }

    #[test]
    fn startup_error_names_the_step() {
        let err = StartupError {
            step: StartupStep::EnableFirewall,
            source: FirewallError::NotEnabled.into(),
        };
        assert_eq!(err.to_string(), "Failed to enable firewall: Firewall is not enabled");
    }
}
