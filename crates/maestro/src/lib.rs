//! Core instance model for the maestro replication topology orchestrator.
//!
//! This crate holds the value types shared by every other layer: instance
//! identity, binlog coordinates, the probed instance record, and operator
//! configuration. The stateful topology machinery (store, prober, replication
//! control) lives in `maestro-topology`.

pub mod config;
pub mod error;
pub mod instance;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use error::MaestroError;
pub use instance::{Instance, Process};
pub use types::{BinlogCoordinates, BinlogType, InstanceKey};

// Re-export logging macros for consistent usage across the crates.
pub use log::{debug, error, info, trace, warn};
