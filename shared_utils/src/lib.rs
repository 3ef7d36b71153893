//! Shared utilities for edgetun components.
//!
//! This crate holds the pieces used by both the tunnel service (`edgetund`)
//! and the control CLI (`edgetunctl`): the configuration file model and the
//! logging setup.

pub mod config;
pub mod logging;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError};
pub use logging::{init_logging, LogOptions};
