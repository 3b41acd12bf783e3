//! Fleet-wide fan-out.
//!
//! Bulk operations dispatch one task per target and rendezvous on a barrier:
//! the call returns only when every task has finished, and a failing task
//! never aborts the fleet; its error is logged and the barrier still counts
//! it. Connection load on the fleet is capped by the topology gate, which
//! each task's probe and control statements acquire internally.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use log::{debug, error};

use crate::service::TopologyService;
use crate::TopologyError;
use maestro::InstanceKey;

impl TopologyService {
    /// Run a task under the topology gate, bounding concurrent outbound
    /// sessions against the fleet. The permit is released on every exit path.
    pub async fn execute_on_topology<F, T>(&self, task: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _permit = self.topology_permit().await;
        task.await
    }

    /// Keys due for a probe, honouring the hung-instance back-off.
    pub async fn read_outdated_instance_keys(&self) -> Result<Vec<InstanceKey>, TopologyError> {
        self.store.read_outdated_instance_keys().await
    }

    /// Concurrently re-probe all given instances, returning when every probe
    /// has completed or failed.
    pub async fn refresh_topology_instances(self: &Arc<Self>, keys: &[InstanceKey]) {
        self.fan_out(keys, "refresh", |service, key| async move {
            debug!("... reading instance: {key}");
            service.read_topology_instance(&key).await.map(|_| ())
        })
        .await;
    }

    /// Concurrently stop all given slaves nicely, each bounded by `timeout`.
    pub async fn stop_slaves_nicely(self: &Arc<Self>, keys: &[InstanceKey], timeout: Duration) {
        self.fan_out(keys, "stop-slave-nicely", move |service, key| async move {
            service.stop_slave_nicely(&key, timeout).await.map(|_| ())
        })
        .await;
    }

    /// Concurrently start replication on all given slaves.
    pub async fn start_slaves(self: &Arc<Self>, keys: &[InstanceKey]) {
        self.fan_out(keys, "start-slave", |service, key| async move {
            service.start_slave(&key).await.map(|_| ())
        })
        .await;
    }

    async fn fan_out<F, Fut>(self: &Arc<Self>, keys: &[InstanceKey], operation: &str, task: F)
    where
        F: Fn(Arc<TopologyService>, InstanceKey) -> Fut,
        Fut: std::future::Future<Output = Result<(), TopologyError>> + Send + 'static,
    {
        let mut barrier = JoinSet::new();
        for key in keys {
            let service = Arc::clone(self);
            let key = key.clone();
            let operation = operation.to_string();
            let work = task(service, key.clone());
            barrier.spawn(async move {
                if let Err(e) = work.await {
                    error!("{operation} of {key} failed: {e}");
                }
            });
        }
        // Rendezvous: wait for every task, success or failure.
        while let Some(joined) = barrier.join_next().await {
            if let Err(e) = joined {
                error!("fleet {operation} task aborted: {e}");
            }
        }
    }
}
