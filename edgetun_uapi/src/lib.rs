//! edgetun control channel library
//!
//! This crate defines the data model of a running tunnel, the textual
//! `key=value` control protocol spoken over the per-interface control socket,
//! and the Unix Domain Socket transport used by both the service (`edgetund`)
//! and companion processes such as `edgetunctl`.

pub mod error;
pub mod messages;
pub mod model;
pub mod transport;

/// Re-export common types for convenience
pub use error::{ConfigurationError, ProtocolError, ProtocolResult};
pub use messages::{ControlRequest, ControlResponse, ErrorCode, GetScope, PeerUpdate, SetOperation};
pub use model::{Key, Peer, PrivateKey, TunnelConfiguration};
pub use transport::{AuthConfig, IpcError, IpcResult, UapiClient, UapiConnection, UapiListener};
