//! edgetun service library
//!
//! Owns the lifecycle of one tunnel interface: the adapter and packet engine
//! ([`device`]), the running configuration ([`config_store`]), the control
//! socket ([`control_server`]), host policy upkeep ([`watcher`],
//! [`firewall`]) and the state machine tying them together ([`service`]).
//! The `edgetund` binary wires the concrete implementations.

pub mod adapter;
pub mod command;
pub mod config_source;
pub mod config_store;
pub mod control_server;
pub mod device;
pub mod engine;
pub mod firewall;
pub mod privilege;
pub mod service;
pub mod watcher;

pub use config_store::ConfigStore;
pub use device::{DeviceError, TerminationReason, TunnelDevice};
pub use service::{
    Collaborators, ControlCode, ServiceOutcome, ServiceSettings, ServiceState, StopCause,
    TunnelService,
};
