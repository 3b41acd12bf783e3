//! Backend store: trait, backends, and the concurrency-bounded gateway.

mod backend;
mod file;
mod gateway;
mod memory;
mod r#trait;

pub use backend::StoreBackend;
pub use file::FileInstanceBackend;
pub use gateway::{InstanceStore, BACKEND_READ_CONCURRENCY, BACKEND_WRITE_CONCURRENCY};
pub use memory::InMemoryInstanceBackend;
pub use r#trait::{ClusterInfo, InstanceBackend, InstanceFilter, InstanceTimestamps, ReadContext};
