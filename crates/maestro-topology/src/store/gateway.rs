//! Concurrency-bounded gateway in front of the backend store.
//!
//! The gateway owns the process-wide read/write bounds: at most 20 concurrent
//! reads and 20 concurrent writes are in flight against the backend at any
//! time. Permits are RAII so they are released on every exit path, including
//! panics.

use chrono::Utc;
use log::debug;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::audit::{AuditSink, LogAudit};
use crate::store::r#trait::{
    ClusterInfo, InstanceBackend, InstanceFilter, InstanceTimestamps, ReadContext,
};
use crate::TopologyError;
use maestro::{Config, Instance, InstanceKey, Process};

/// Maximum concurrent reads against the backend store.
pub const BACKEND_READ_CONCURRENCY: usize = 20;
/// Maximum concurrent writes against the backend store.
pub const BACKEND_WRITE_CONCURRENCY: usize = 20;

/// Gateway for all instance-row persistence.
pub struct InstanceStore {
    backend: Arc<dyn InstanceBackend>,
    config: Arc<Config>,
    audit: Arc<dyn AuditSink>,
    read_gate: Semaphore,
    write_gate: Semaphore,
}

impl InstanceStore {
    pub fn new(backend: Arc<dyn InstanceBackend>, config: Arc<Config>) -> Self {
        Self::with_audit(backend, config, Arc::new(LogAudit))
    }

    pub fn with_audit(
        backend: Arc<dyn InstanceBackend>,
        config: Arc<Config>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            backend,
            config,
            audit,
            read_gate: Semaphore::new(BACKEND_READ_CONCURRENCY),
            write_gate: Semaphore::new(BACKEND_WRITE_CONCURRENCY),
        }
    }

    fn read_ctx(&self) -> ReadContext {
        ReadContext {
            now: Utc::now(),
            poll_seconds: self.config.instance_poll_seconds,
        }
    }

    // The gates are created at construction and never closed.
    async fn read_permit(&self) -> SemaphorePermit<'_> {
        self.read_gate
            .acquire()
            .await
            .expect("store read gate closed")
    }

    async fn write_permit(&self) -> SemaphorePermit<'_> {
        self.write_gate
            .acquire()
            .await
            .expect("store write gate closed")
    }

    /// Run an arbitrary store write under the write gate, propagating its
    /// result. The permit is released on every exit path.
    pub async fn exec_db_write<T, F>(&self, write: F) -> Result<T, TopologyError>
    where
        F: FnOnce(&dyn InstanceBackend) -> Result<T, TopologyError>,
    {
        let _permit = self.write_permit().await;
        write(self.backend.as_ref())
    }

    /// Upsert one instance row.
    ///
    /// `actually_found` distinguishes a real probe result from a skeletal
    /// injection; `last_error` withholds the `last_seen` stamp when the probe
    /// partially failed.
    pub async fn write_instance(
        &self,
        instance: &Instance,
        actually_found: bool,
        last_error: Option<&TopologyError>,
    ) -> Result<(), TopologyError> {
        let update_last_seen = actually_found && last_error.is_none();
        if let Some(err) = last_error {
            debug!(
                "write_instance: not updating last_seen of {} due to error: {err}",
                instance.key
            );
        }
        let _permit = self.write_permit().await;
        self.backend
            .upsert_instance(instance, actually_found, update_last_seen, Utc::now())
    }

    /// Stamp `last_attempted_check` ahead of a probe.
    pub async fn mark_attempted_check(&self, key: &InstanceKey) -> Result<(), TopologyError> {
        let _permit = self.write_permit().await;
        self.backend.mark_attempted_check(key, Utc::now())
    }

    /// Stamp `last_checked` after a probe that failed before upsert.
    pub async fn mark_last_checked(&self, key: &InstanceKey) -> Result<(), TopologyError> {
        let _permit = self.write_permit().await;
        self.backend.mark_last_checked(key, Utc::now())
    }

    pub async fn read_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<Instance>, TopologyError> {
        let _permit = self.read_permit().await;
        let mut instance = self.backend.read_instance(key, self.read_ctx())?;
        if let Some(instance) = instance.as_mut() {
            self.enrich_instances(std::slice::from_mut(instance))?;
        }
        Ok(instance)
    }

    pub async fn read_timestamps(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<InstanceTimestamps>, TopologyError> {
        let _permit = self.read_permit().await;
        self.backend.read_timestamps(key)
    }

    pub async fn filter_instances(
        &self,
        filter: InstanceFilter,
    ) -> Result<Vec<Instance>, TopologyError> {
        let _permit = self.read_permit().await;
        let mut instances = self.backend.filter_instances(&filter, self.read_ctx())?;
        self.enrich_instances(&mut instances)?;
        Ok(instances)
    }

    /// All members of a cluster. Single quotes are rejected before the name
    /// reaches any condition machinery.
    pub async fn cluster_instances(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<Instance>, TopologyError> {
        if cluster_name.contains('\'') {
            return Err(TopologyError::InvalidInput {
                context: "cluster name".to_string(),
                reason: format!("invalid cluster name: {cluster_name}"),
            });
        }
        self.filter_instances(InstanceFilter::ByCluster(cluster_name.to_string()))
            .await
    }

    /// All slaves of a given master.
    pub async fn slave_instances(
        &self,
        master_key: &InstanceKey,
    ) -> Result<Vec<Instance>, TopologyError> {
        self.filter_instances(InstanceFilter::ByMaster(master_key.clone()))
            .await
    }

    /// Instances whose last probe attempt did not sight the server.
    pub async fn unseen_instances(&self) -> Result<Vec<Instance>, TopologyError> {
        self.filter_instances(InstanceFilter::Unseen).await
    }

    /// Instances that look unhealthy: unseen, stale, replication stopped, or
    /// lagging by more than ten seconds.
    pub async fn problem_instances(&self) -> Result<Vec<Instance>, TopologyError> {
        self.filter_instances(InstanceFilter::Problems).await
    }

    /// Substring search across the identity fields.
    pub async fn search_instances(&self, term: &str) -> Result<Vec<Instance>, TopologyError> {
        self.filter_instances(InstanceFilter::Search(term.to_string()))
            .await
    }

    /// Instances whose hostname matches a regex pattern.
    pub async fn find_instances(&self, pattern: &str) -> Result<Vec<Instance>, TopologyError> {
        if let Err(e) = regex::Regex::new(pattern) {
            return Err(TopologyError::InvalidInput {
                context: "hostname pattern".to_string(),
                reason: e.to_string(),
            });
        }
        self.filter_instances(InstanceFilter::HostnameMatches(pattern.to_string()))
            .await
    }

    /// Keys due for a probe, honouring the hung-instance back-off.
    pub async fn read_outdated_instance_keys(&self) -> Result<Vec<InstanceKey>, TopologyError> {
        let _permit = self.read_permit().await;
        self.backend.outdated_keys(self.read_ctx())
    }

    /// Masters that slaves replicate from but which have no checked row.
    pub async fn unseen_master_keys(&self) -> Result<Vec<InstanceKey>, TopologyError> {
        let _permit = self.read_permit().await;
        self.backend.unseen_master_keys()
    }

    /// Rewrite an instance's cluster membership.
    pub async fn update_cluster_name(&self, instance: &Instance) -> Result<(), TopologyError> {
        {
            let _permit = self.write_permit().await;
            self.backend.update_cluster_name(
                &instance.key,
                &instance.cluster_name,
                instance.replication_depth,
            )?;
        }
        self.audit.audit(
            "update-cluster-name",
            Some(&instance.key),
            &format!("set to {}", instance.cluster_name),
        );
        Ok(())
    }

    /// Remove an instance row. It may be auto-rediscovered through topology.
    pub async fn forget_instance(&self, key: &InstanceKey) -> Result<bool, TopologyError> {
        let removed = {
            let _permit = self.write_permit().await;
            self.backend.forget_instance(key)?
        };
        self.audit.audit("forget", Some(key), "");
        Ok(removed)
    }

    /// Sweep rows whose `last_seen` is older than the configured horizon.
    pub async fn forget_long_unseen_instances(&self) -> Result<usize, TopologyError> {
        let forgotten = {
            let _permit = self.write_permit().await;
            self.backend
                .forget_unseen_instances(Utc::now(), self.config.unseen_instance_forget_hours)?
        };
        self.audit.audit(
            "forget-unseen",
            None,
            &format!("Forgotten instances: {forgotten}"),
        );
        Ok(forgotten)
    }

    /// Names of all known clusters.
    pub async fn clusters(&self) -> Result<Vec<String>, TopologyError> {
        let _permit = self.read_permit().await;
        self.backend.cluster_names()
    }

    /// Aggregate info for all known clusters.
    pub async fn clusters_info(&self) -> Result<Vec<ClusterInfo>, TopologyError> {
        let _permit = self.read_permit().await;
        self.backend.clusters_info()
    }

    /// Aggregate info for one cluster.
    pub async fn cluster_info(
        &self,
        cluster_name: &str,
    ) -> Result<Option<ClusterInfo>, TopologyError> {
        Ok(self
            .clusters_info()
            .await?
            .into_iter()
            .find(|info| info.cluster_name == cluster_name))
    }

    pub async fn write_hostname_resolve(
        &self,
        hostname: &str,
        resolved: &str,
    ) -> Result<(), TopologyError> {
        let _permit = self.write_permit().await;
        self.backend.write_hostname_resolve(hostname, resolved)
    }

    pub async fn hostname_resolve_map(
        &self,
    ) -> Result<std::collections::HashMap<String, String>, TopologyError> {
        let _permit = self.read_permit().await;
        self.backend.hostname_resolve_map()
    }

    pub async fn write_long_running_processes(
        &self,
        key: &InstanceKey,
        processes: &[Process],
    ) -> Result<(), TopologyError> {
        let _permit = self.write_permit().await;
        self.backend.write_long_running_processes(key, processes)
    }

    pub async fn long_running_processes(
        &self,
        key: &InstanceKey,
    ) -> Result<Vec<Process>, TopologyError> {
        let _permit = self.read_permit().await;
        self.backend.long_running_processes(key)
    }

    /// Record an agent-reported snapshot count for a host.
    pub async fn set_snapshot_count(
        &self,
        hostname: &str,
        count: u32,
    ) -> Result<(), TopologyError> {
        let _permit = self.write_permit().await;
        self.backend.set_snapshot_count(hostname, count)
    }

    /// Fill in agent-sourced data for a batch of read results.
    fn enrich_instances(&self, instances: &mut [Instance]) -> Result<(), TopologyError> {
        if !self.config.serve_agents_http || instances.is_empty() {
            return Ok(());
        }
        let hostnames: Vec<String> = instances
            .iter()
            .map(|instance| instance.key.hostname.clone())
            .collect();
        let counts = self.backend.snapshot_counts(&hostnames)?;
        for instance in instances {
            if let Some(count) = counts.get(&instance.key.hostname) {
                instance.count_mysql_snapshots = *count;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::store::memory::InMemoryInstanceBackend;

    fn store_with_audit() -> (InstanceStore, Arc<MemoryAudit>) {
        let audit = Arc::new(MemoryAudit::new());
        let store = InstanceStore::with_audit(
            Arc::new(InMemoryInstanceBackend::new()),
            Arc::new(Config::default()),
            audit.clone(),
        );
        (store, audit)
    }

    #[tokio::test]
    async fn test_quoted_cluster_name_is_rejected() {
        let (store, _) = store_with_audit();
        let result = store.cluster_instances("it's-a-cluster").await;
        assert!(matches!(result, Err(TopologyError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_bad_hostname_pattern_is_rejected() {
        let (store, _) = store_with_audit();
        let result = store.find_instances("[unclosed").await;
        assert!(matches!(result, Err(TopologyError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_forget_is_audited() {
        let (store, audit) = store_with_audit();
        let key = InstanceKey::new("db1", 3306);
        let instance = Instance::new(key.clone());
        store.write_instance(&instance, true, None).await.unwrap();

        assert!(store.forget_instance(&key).await.unwrap());
        assert!(store.read_instance(&key).await.unwrap().is_none());
        assert_eq!(audit.actions(), vec!["forget"]);
    }

    #[tokio::test]
    async fn test_agent_enrichment_is_gated_by_config() {
        let backend = Arc::new(InMemoryInstanceBackend::new());
        let mut config = Config::default();
        config.serve_agents_http = true;
        let store = InstanceStore::new(backend, Arc::new(config));

        let instance = Instance::new(InstanceKey::new("db1", 3306));
        store.write_instance(&instance, true, None).await.unwrap();
        store.set_snapshot_count("db1", 4).await.unwrap();

        let read = store.read_instance(&instance.key).await.unwrap().unwrap();
        assert_eq!(read.count_mysql_snapshots, 4);
    }

    #[tokio::test]
    async fn test_partial_probe_withholds_last_seen() {
        let (store, _) = store_with_audit();
        let instance = Instance::new(InstanceKey::new("db1", 3306));
        let error = TopologyError::QueryFailed {
            context: "show binary logs".to_string(),
            reason: "lost connection".to_string(),
        };
        store
            .write_instance(&instance, true, Some(&error))
            .await
            .unwrap();

        let ts = store.read_timestamps(&instance.key).await.unwrap().unwrap();
        assert!(ts.last_checked.is_some());
        assert_eq!(ts.last_seen, None);
    }

    #[tokio::test]
    async fn test_exec_db_write_propagates_result() {
        let (store, _) = store_with_audit();
        let key = InstanceKey::new("db1", 3306);
        store
            .exec_db_write(|backend| {
                backend.upsert_instance(&Instance::new(key.clone()), true, true, Utc::now())
            })
            .await
            .unwrap();
        assert!(store.read_instance(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_many_concurrent_reads_complete() {
        let (store, _) = store_with_audit();
        let store = Arc::new(store);
        let instance = Instance::new(InstanceKey::new("db1", 3306));
        store.write_instance(&instance, true, None).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..(BACKEND_READ_CONCURRENCY * 3) {
            let store = store.clone();
            let key = instance.key.clone();
            tasks.spawn(async move { store.read_instance(&key).await.unwrap().is_some() });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap());
        }
    }
}
