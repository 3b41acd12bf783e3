//! Topology discovery and replication control for maestro.
//!
//! This crate probes a fleet of database servers over their SQL surface,
//! persists a coherent model of each server's replication state through a
//! concurrency-bounded store gateway, derives cluster membership from one-hop
//! master pointers, and exposes the replication-control primitives
//! (stop/start/change-master/detach/reattach and friends) with the ordering
//! guarantees they require.

pub mod audit;
pub mod connector;
pub mod error;
pub mod resolver;
pub mod service;
pub mod simulator;
pub mod store;

mod cluster;
mod control;
mod fleet;

pub use audit::{AuditEntry, AuditSink, LogAudit, MemoryAudit};
pub use connector::{RowMap, RowValue, TopologyConnection, TopologyConnector};
pub use error::TopologyError;
pub use resolver::HostnameResolver;
pub use service::{TopologyService, SQL_THREAD_POLL_INTERVAL, TOPOLOGY_CONCURRENCY};
pub use simulator::{SimulatedServer, SimulatedTopology};
pub use store::{
    ClusterInfo, FileInstanceBackend, InMemoryInstanceBackend, InstanceBackend, InstanceFilter,
    InstanceStore, InstanceTimestamps, ReadContext, StoreBackend, BACKEND_READ_CONCURRENCY,
    BACKEND_WRITE_CONCURRENCY,
};

// Re-export logging macros for consistent usage across the crate.
pub use log::{debug, error, info, trace, warn};
