//! Replication control operations.
//!
//! Every operation begins and ends with a probe, so callers always receive a
//! fresh [`Instance`] and the store stays coherent with what was just done to
//! the server. Preconditions are checked against the opening probe and
//! rejected outright, never retried.

use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use log::{info, warn};

use crate::service::{TopologyService, SQL_THREAD_POLL_INTERVAL};
use crate::TopologyError;
use maestro::{BinlogCoordinates, Instance, InstanceKey};

/// Recognises the detached sentinel: `//<file>:<pos>` in the log file slot.
/// The sentinel is syntactically invalid to the server, which is the point:
/// replication cannot proceed, yet the original coordinates survive in-band.
fn detach_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"//([^/:]+):(\d+)").expect("static pattern"))
}

impl TopologyService {
    /// Stop replication.
    pub async fn stop_slave(&self, key: &InstanceKey) -> Result<Instance, TopologyError> {
        let instance = self.read_topology_instance(key).await?;
        if !instance.is_slave() {
            return Err(TopologyError::NotASlave { key: key.clone() });
        }

        self.exec_instance(key, "stop slave").await?;

        let instance = self.read_topology_instance(key).await?;
        info!(
            "Stopped slave on {key}, Self:{}, Exec:{}",
            instance.self_binlog_coordinates, instance.exec_binlog_coordinates
        );
        Ok(instance)
    }

    /// Start replication.
    pub async fn start_slave(&self, key: &InstanceKey) -> Result<Instance, TopologyError> {
        let instance = self.read_topology_instance(key).await?;
        if !instance.is_slave() {
            return Err(TopologyError::NotASlave { key: key.clone() });
        }

        self.exec_instance(key, "start slave").await?;
        info!("Started slave on {key}");
        if self.config.slave_start_post_wait_milliseconds > 0 {
            sleep(Duration::from_millis(
                self.config.slave_start_post_wait_milliseconds,
            ))
            .await;
        }

        self.read_topology_instance(key).await
    }

    /// Stop a slave so that the SQL thread and IO thread are aligned: the IO
    /// thread is stopped first, the SQL thread kept (or started) running until
    /// it has consumed all fetched relay log entries, then everything stops.
    ///
    /// A zero `timeout` means wait indefinitely. On timeout the slave is left
    /// as-is (IO stopped, SQL running) and [`TopologyError::Timeout`] is
    /// returned.
    pub async fn stop_slave_nicely(
        &self,
        key: &InstanceKey,
        timeout: Duration,
    ) -> Result<Instance, TopologyError> {
        let instance = self.read_topology_instance(key).await?;
        if !instance.is_slave() {
            return Err(TopologyError::NotASlave { key: key.clone() });
        }

        if let Err(e) = self.exec_instance(key, "stop slave io_thread").await {
            warn!("stop slave io_thread on {key}: {e}");
        }
        if let Err(e) = self.exec_instance(key, "start slave sql_thread").await {
            warn!("start slave sql_thread on {key}: {e}");
        }

        let started = Instant::now();
        loop {
            if !timeout.is_zero() && started.elapsed() >= timeout {
                return Err(TopologyError::Timeout {
                    operation: "StopSlaveNicely".to_string(),
                    key: key.clone(),
                });
            }
            let instance = self.read_topology_instance(key).await?;
            if instance.sql_thread_up_to_date() {
                break;
            }
            sleep(SQL_THREAD_POLL_INTERVAL).await;
        }

        self.exec_instance(key, "stop slave").await?;
        self.read_topology_instance(key).await
    }

    /// Start replication until the SQL thread reaches the given master
    /// coordinates exactly, then stop. Requires replication to be fully
    /// stopped beforehand. Fails with [`TopologyError::Overshoot`] if the SQL
    /// thread is ever observed past the target.
    pub async fn start_slave_until_master_coordinates(
        &self,
        key: &InstanceKey,
        master_coordinates: &BinlogCoordinates,
    ) -> Result<Instance, TopologyError> {
        let instance = self.read_topology_instance(key).await?;
        if !instance.is_slave() {
            return Err(TopologyError::NotASlave { key: key.clone() });
        }
        if instance.slave_running() {
            return Err(TopologyError::SlaveRunning { key: key.clone() });
        }

        info!("Will start slave on {key} until coordinates: {master_coordinates}");

        self.exec_instance(
            key,
            &format!(
                "start slave until master_log_file='{}', master_log_pos={}",
                master_coordinates.log_file, master_coordinates.log_pos
            ),
        )
        .await?;

        loop {
            let instance = self.read_topology_instance(key).await?;
            if instance
                .exec_binlog_coordinates
                .smaller_than(master_coordinates)?
            {
                sleep(SQL_THREAD_POLL_INTERVAL).await;
            } else if instance
                .exec_binlog_coordinates
                .equals(master_coordinates)?
            {
                break;
            } else {
                return Err(TopologyError::Overshoot {
                    key: key.clone(),
                    target: master_coordinates.clone(),
                });
            }
        }

        self.stop_slave(key).await
    }

    /// Repoint a stopped slave at a new master position.
    pub async fn change_master_to(
        &self,
        key: &InstanceKey,
        master_key: &InstanceKey,
        master_coordinates: &BinlogCoordinates,
    ) -> Result<Instance, TopologyError> {
        let instance = self.read_topology_instance(key).await?;
        if instance.slave_running() {
            return Err(TopologyError::SlaveRunning { key: key.clone() });
        }

        self.exec_instance(
            key,
            &format!(
                "change master to master_host='{}', master_port={}, \
                 master_log_file='{}', master_log_pos={}",
                master_key.hostname,
                master_key.port,
                master_coordinates.log_file,
                master_coordinates.log_pos
            ),
        )
        .await?;
        info!("Changed master on {key} to: {master_key}, {master_coordinates}");

        self.read_topology_instance(key).await
    }

    /// Break a stopped slave out of replication entirely.
    pub async fn reset_slave(&self, key: &InstanceKey) -> Result<Instance, TopologyError> {
        let instance = self.read_topology_instance(key).await?;
        if instance.slave_running() {
            return Err(TopologyError::SlaveRunning { key: key.clone() });
        }

        // RESET SLAVE leaves SHOW SLAVE STATUS reporting the stale master
        // until a restart, which would keep this instance looking like a
        // slave. Overwrite the master host with a sentinel first.
        self.exec_instance(key, "change master to master_host='_'")
            .await?;
        self.exec_instance(key, "reset slave").await?;
        info!("Reset slave {key}");

        self.read_topology_instance(key).await
    }

    /// Deliberately corrupt a stopped slave's execution coordinates, in a way
    /// the server cannot follow but [`Self::reattach_slave`] can reverse.
    pub async fn detach_slave(&self, key: &InstanceKey) -> Result<Instance, TopologyError> {
        let instance = self.read_topology_instance(key).await?;
        if instance.slave_running() {
            return Err(TopologyError::SlaveRunning { key: key.clone() });
        }

        if detach_pattern()
            .captures(&instance.exec_binlog_coordinates.log_file)
            .is_some()
        {
            return Err(TopologyError::AlreadyDetached { key: key.clone() });
        }

        let detached_coordinates = BinlogCoordinates::new(
            format!(
                "//{}:{}",
                instance.exec_binlog_coordinates.log_file,
                instance.exec_binlog_coordinates.log_pos
            ),
            instance.exec_binlog_coordinates.log_pos,
        );
        self.exec_instance(
            key,
            &format!(
                "change master to master_log_file='{}', master_log_pos={}",
                detached_coordinates.log_file, detached_coordinates.log_pos
            ),
        )
        .await?;

        info!("Detach slave {key}");

        self.read_topology_instance(key).await
    }

    /// Restore a detached slave's original coordinates from the sentinel.
    pub async fn reattach_slave(&self, key: &InstanceKey) -> Result<Instance, TopologyError> {
        let instance = self.read_topology_instance(key).await?;
        if instance.slave_running() {
            return Err(TopologyError::SlaveRunning { key: key.clone() });
        }

        let log_file = instance.exec_binlog_coordinates.log_file.clone();
        let captures = detach_pattern()
            .captures(&log_file)
            .ok_or_else(|| TopologyError::NotDetached { key: key.clone() })?;

        self.exec_instance(
            key,
            &format!(
                "change master to master_log_file='{}', master_log_pos={}",
                &captures[1], &captures[2]
            ),
        )
        .await?;

        info!("Reattach slave {key}");

        self.read_topology_instance(key).await
    }

    /// Block on the server until its SQL thread passes the given coordinates.
    pub async fn master_pos_wait(
        &self,
        key: &InstanceKey,
        coordinates: &BinlogCoordinates,
    ) -> Result<Instance, TopologyError> {
        let _instance = self.read_topology_instance(key).await?;

        self.exec_instance(
            key,
            &format!(
                "select master_pos_wait('{}', {})",
                coordinates.log_file, coordinates.log_pos
            ),
        )
        .await?;
        info!("Instance {key} has reached coordinates: {coordinates}");

        self.read_topology_instance(key).await
    }

    /// Set or clear the global read_only flag.
    pub async fn set_read_only(
        &self,
        key: &InstanceKey,
        read_only: bool,
    ) -> Result<Instance, TopologyError> {
        let _instance = self.read_topology_instance(key).await?;

        self.exec_instance(key, &format!("set global read_only = {read_only}"))
            .await?;
        let instance = self.read_topology_instance(key).await?;

        info!("instance {key} read_only: {read_only}");
        self.audit
            .audit("read-only", Some(key), &format!("set as {read_only}"));

        Ok(instance)
    }

    /// Kill a single query by processlist id.
    pub async fn kill_query(
        &self,
        key: &InstanceKey,
        process_id: i64,
    ) -> Result<Instance, TopologyError> {
        let _instance = self.read_topology_instance(key).await?;

        self.exec_instance(key, &format!("kill query {process_id}"))
            .await?;
        let instance = self.read_topology_instance(key).await?;

        info!("Killed query on {key}");
        self.audit
            .audit("kill-query", Some(key), &format!("Killed query {process_id}"));
        Ok(instance)
    }

    /// Workaround for servers whose `SHOW SLAVE HOSTS` keeps presenting long
    /// disconnected slaves: a couple of FLUSH statements nudge it, after which
    /// the instance is re-probed.
    pub async fn refresh_instance_slave_hosts(
        &self,
        key: &InstanceKey,
    ) -> Result<Instance, TopologyError> {
        let _ = self.exec_instance(key, "flush error logs").await;
        let _ = self.exec_instance(key, "flush error logs").await;

        self.read_topology_instance(key).await
    }
}
