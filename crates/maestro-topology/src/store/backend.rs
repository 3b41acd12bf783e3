//! Backend store selection.

use std::path::PathBuf;
use std::sync::Arc;

use crate::store::file::FileInstanceBackend;
use crate::store::memory::InMemoryInstanceBackend;
use crate::store::r#trait::InstanceBackend;
use crate::TopologyError;

/// Backend storage configuration for instance rows.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// In-memory storage: fast but ephemeral.
    Memory,
    /// JSON-file storage under a data directory.
    File { data_dir: PathBuf },
}

impl StoreBackend {
    pub fn new_memory() -> Self {
        StoreBackend::Memory
    }

    pub fn new_file(data_dir: impl Into<PathBuf>) -> Self {
        StoreBackend::File {
            data_dir: data_dir.into(),
        }
    }

    /// Instantiate the configured backend.
    pub fn create(&self) -> Result<Arc<dyn InstanceBackend>, TopologyError> {
        match self {
            StoreBackend::Memory => Ok(Arc::new(InMemoryInstanceBackend::new())),
            StoreBackend::File { data_dir } => {
                Ok(Arc::new(FileInstanceBackend::new(data_dir)?))
            }
        }
    }
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::new_memory()
    }
}
