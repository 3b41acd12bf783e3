//! Cluster membership derivation and the unseen-instance sweepers.
//!
//! The store keeps one-hop master pointers only. Cluster names propagate one
//! hop per probe round: the root of a tree names itself, its children observe
//! that on their next probe, and so on down the tree. Convergence takes at
//! most tree-depth rounds.

use log::error;

use crate::service::TopologyService;
use crate::TopologyError;
use maestro::{Instance, InstanceKey};

impl TopologyService {
    /// Resolve the cluster name and replication depth for an instance by
    /// looking at its master's row. Non-recursive: the tree is walked lazily,
    /// one hop per probe cycle, so an accidental cycle in the topology cannot
    /// wedge a traversal.
    pub async fn read_cluster_name_by_master(
        &self,
        instance_key: &InstanceKey,
        master_key: &InstanceKey,
    ) -> Result<(String, u32), TopologyError> {
        // A non-slave has no master pointer worth looking up.
        if !master_key.is_valid() {
            return Ok((instance_key.to_string(), 0));
        }
        match self.store.read_instance(master_key).await? {
            Some(master) => {
                let replication_depth = master.replication_depth + 1;
                if master.cluster_name.is_empty() {
                    Ok((master_key.to_string(), replication_depth))
                } else {
                    Ok((master.cluster_name, replication_depth))
                }
            }
            None => Ok((instance_key.to_string(), 0)),
        }
    }

    /// Recompute cluster membership for instances whose last probe attempt
    /// did not sight them. Their masters may have been probed since, so the
    /// derived cluster can have changed underneath them.
    pub async fn review_unseen_instances(&self) -> Result<usize, TopologyError> {
        let instances = self.store.unseen_instances().await?;
        let mut operations = 0;
        for mut instance in instances {
            instance.master_key.hostname = self.resolver.resolve(&instance.master_key.hostname);

            match self
                .read_cluster_name_by_master(&instance.key, &instance.master_key)
                .await
            {
                Err(e) => {
                    error!("cluster review of {} failed: {e}", instance.key);
                }
                Ok((cluster_name, replication_depth)) => {
                    if cluster_name != instance.cluster_name {
                        instance.cluster_name = cluster_name;
                        instance.replication_depth = replication_depth;
                        match self.store.update_cluster_name(&instance).await {
                            Ok(()) => operations += 1,
                            Err(e) => {
                                error!("cluster update of {} failed: {e}", instance.key)
                            }
                        }
                    }
                }
            }
        }

        self.audit.audit(
            "review-unseen-instances",
            None,
            &format!("Operations: {operations}"),
        );
        Ok(operations)
    }

    /// Masters that slaves are replicating from, yet which have no row of
    /// their own, must exist; inject them with minimal details so the next
    /// probe cycle targets them.
    pub async fn inject_unseen_masters(&self) -> Result<usize, TopologyError> {
        let unseen_master_keys = self.store.unseen_master_keys().await?;

        let mut operations = 0;
        for master_key in unseen_master_keys {
            let mut instance = Instance::new(master_key.clone());
            instance.version = "Unknown".to_string();
            instance.cluster_name = master_key.to_string();
            match self.store.write_instance(&instance, false, None).await {
                Ok(()) => operations += 1,
                Err(e) => error!("failed to inject master {master_key}: {e}"),
            }
        }

        self.audit.audit(
            "inject-unseen-masters",
            None,
            &format!("Operations: {operations}"),
        );
        Ok(operations)
    }
}
