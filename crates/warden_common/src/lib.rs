//! Warden Common - shared types for the warden supervisor
//!
//! Event payloads, probe and service types, and the configuration schema.
//! Nothing in here performs I/O except config file loading.

pub mod config;
pub mod events;
pub mod types;

pub use config::{ConfigError, WardenConfig};
pub use events::{topics, EventKind, WardenEvent, COMMAND_REJECTED, MAX_RETRIES_EXCEEDED};
pub use types::*;
