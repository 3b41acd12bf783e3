//! File-based backend store implementation.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::store::memory::InMemoryInstanceBackend;
use crate::store::r#trait::{
    ClusterInfo, InstanceBackend, InstanceFilter, InstanceTimestamps, ReadContext,
};
use crate::TopologyError;
use maestro::{Instance, InstanceKey, Process};

/// File-backed implementation of the [`InstanceBackend`] trait.
///
/// State is held in memory and persisted as a JSON document inside the given
/// data directory after every mutation. Suitable for single-process
/// deployments that need to survive restarts without a relational server.
#[derive(Debug)]
pub struct FileInstanceBackend {
    inner: InMemoryInstanceBackend,
    file_path: PathBuf,
}

impl FileInstanceBackend {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, TopologyError> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)
                .map_err(|e| TopologyError::from_io_error(e, "setup store directory"))?;
        }
        let file_path = data_dir.join("topology_store.json");

        let backend = Self {
            inner: InMemoryInstanceBackend::new(),
            file_path,
        };
        backend.load_existing_state()?;
        info!("Topology store file: {}", backend.file_path.display());
        Ok(backend)
    }

    fn load_existing_state(&self) -> Result<(), TopologyError> {
        if !self.file_path.exists() {
            debug!("Store file doesn't exist yet, starting with empty state");
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.file_path)
            .map_err(|e| TopologyError::from_io_error(e, "load store file"))?;
        if content.trim().is_empty() {
            return Ok(());
        }
        let snapshot = serde_json::from_str(&content)
            .map_err(|e| TopologyError::from_serialization_error(e, "parse store file"))?;
        self.inner.restore(snapshot);
        Ok(())
    }

    fn persist(&self) -> Result<(), TopologyError> {
        let snapshot = self.inner.snapshot();
        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| TopologyError::from_serialization_error(e, "encode store file"))?;
        std::fs::write(&self.file_path, content)
            .map_err(|e| TopologyError::from_io_error(e, "write store file"))
    }

    fn persist_after<T>(&self, result: Result<T, TopologyError>) -> Result<T, TopologyError> {
        let value = result?;
        self.persist()?;
        Ok(value)
    }
}

impl InstanceBackend for FileInstanceBackend {
    fn upsert_instance(
        &self,
        instance: &Instance,
        actually_found: bool,
        update_last_seen: bool,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError> {
        self.persist_after(
            self.inner
                .upsert_instance(instance, actually_found, update_last_seen, now),
        )
    }

    fn mark_attempted_check(
        &self,
        key: &InstanceKey,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError> {
        self.persist_after(self.inner.mark_attempted_check(key, now))
    }

    fn mark_last_checked(
        &self,
        key: &InstanceKey,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError> {
        self.persist_after(self.inner.mark_last_checked(key, now))
    }

    fn read_instance(
        &self,
        key: &InstanceKey,
        ctx: ReadContext,
    ) -> Result<Option<Instance>, TopologyError> {
        self.inner.read_instance(key, ctx)
    }

    fn read_timestamps(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<InstanceTimestamps>, TopologyError> {
        self.inner.read_timestamps(key)
    }

    fn filter_instances(
        &self,
        filter: &InstanceFilter,
        ctx: ReadContext,
    ) -> Result<Vec<Instance>, TopologyError> {
        self.inner.filter_instances(filter, ctx)
    }

    fn outdated_keys(&self, ctx: ReadContext) -> Result<Vec<InstanceKey>, TopologyError> {
        self.inner.outdated_keys(ctx)
    }

    fn unseen_master_keys(&self) -> Result<Vec<InstanceKey>, TopologyError> {
        self.inner.unseen_master_keys()
    }

    fn update_cluster_name(
        &self,
        key: &InstanceKey,
        cluster_name: &str,
        replication_depth: u32,
    ) -> Result<(), TopologyError> {
        self.persist_after(
            self.inner
                .update_cluster_name(key, cluster_name, replication_depth),
        )
    }

    fn forget_instance(&self, key: &InstanceKey) -> Result<bool, TopologyError> {
        self.persist_after(self.inner.forget_instance(key))
    }

    fn forget_unseen_instances(
        &self,
        now: DateTime<Utc>,
        hours: u32,
    ) -> Result<usize, TopologyError> {
        self.persist_after(self.inner.forget_unseen_instances(now, hours))
    }

    fn cluster_names(&self) -> Result<Vec<String>, TopologyError> {
        self.inner.cluster_names()
    }

    fn clusters_info(&self) -> Result<Vec<ClusterInfo>, TopologyError> {
        self.inner.clusters_info()
    }

    fn write_hostname_resolve(
        &self,
        hostname: &str,
        resolved: &str,
    ) -> Result<(), TopologyError> {
        self.persist_after(self.inner.write_hostname_resolve(hostname, resolved))
    }

    fn hostname_resolve_map(&self) -> Result<HashMap<String, String>, TopologyError> {
        self.inner.hostname_resolve_map()
    }

    fn write_long_running_processes(
        &self,
        key: &InstanceKey,
        processes: &[Process],
    ) -> Result<(), TopologyError> {
        self.persist_after(self.inner.write_long_running_processes(key, processes))
    }

    fn long_running_processes(&self, key: &InstanceKey) -> Result<Vec<Process>, TopologyError> {
        self.inner.long_running_processes(key)
    }

    fn set_snapshot_count(&self, hostname: &str, count: u32) -> Result<(), TopologyError> {
        self.persist_after(self.inner.set_snapshot_count(hostname, count))
    }

    fn snapshot_counts(
        &self,
        hostnames: &[String],
    ) -> Result<HashMap<String, u32>, TopologyError> {
        self.inner.snapshot_counts(hostnames)
    }
}
