//! The topology service: probing live servers into the store.
//!
//! [`TopologyService`] ties the collaborators together: the connector for
//! reaching live servers, the store gateway for persistence, the hostname
//! resolver, the configuration, and the audit sink. The replication-control
//! and fleet operations are further `impl` blocks in their own modules.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use log::{debug, error, warn};

use crate::audit::{AuditSink, LogAudit};
use crate::connector::TopologyConnector;
use crate::resolver::HostnameResolver;
use crate::store::InstanceStore;
use crate::TopologyError;
use maestro::{BinlogCoordinates, Config, Instance, InstanceKey, Process};

/// Cadence of the SQL-thread polling loops in the control operations.
pub const SQL_THREAD_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Maximum concurrent outbound SQL sessions against the fleet.
pub const TOPOLOGY_CONCURRENCY: usize = 100;

const PROCESSLIST_SLAVE_HOSTS_QUERY: &str = "\
select \
    substring_index(host, ':', 1) as slave_hostname \
from \
    information_schema.processlist \
where \
    command='Binlog Dump'";

const PROCESSLIST_LONG_RUNNING_QUERY: &str = "\
select \
    id, user, host, db, command, time, state, \
    left(processlist.info, 1024) as info, \
    now() - interval time second as started_at \
from \
    information_schema.processlist \
where \
    time > 60 \
    and command != 'Sleep' \
    and id != connection_id() \
    and user != 'system user' \
    and command != 'Binlog dump' \
    and user != 'event_scheduler' \
order by \
    time desc";

/// What one probe collected before the store write.
struct Collected {
    instance: Instance,
    long_running: Vec<Process>,
    deferred_error: Option<TopologyError>,
}

pub struct TopologyService {
    pub(crate) connector: Arc<dyn TopologyConnector>,
    pub(crate) store: Arc<InstanceStore>,
    pub(crate) resolver: Arc<HostnameResolver>,
    pub(crate) config: Arc<Config>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) topology_gate: Semaphore,
}

impl TopologyService {
    pub fn new(
        connector: Arc<dyn TopologyConnector>,
        store: Arc<InstanceStore>,
        resolver: Arc<HostnameResolver>,
        config: Arc<Config>,
    ) -> Self {
        Self::with_audit(connector, store, resolver, config, Arc::new(LogAudit))
    }

    pub fn with_audit(
        connector: Arc<dyn TopologyConnector>,
        store: Arc<InstanceStore>,
        resolver: Arc<HostnameResolver>,
        config: Arc<Config>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            connector,
            store,
            resolver,
            config,
            audit,
            topology_gate: Semaphore::new(TOPOLOGY_CONCURRENCY),
        }
    }

    /// The store gateway, for direct reads and sweeps.
    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    /// The hostname resolver.
    pub fn resolver(&self) -> &Arc<HostnameResolver> {
        &self.resolver
    }

    // The gate is created at construction and never closed.
    pub(crate) async fn topology_permit(&self) -> SemaphorePermit<'_> {
        self.topology_gate
            .acquire()
            .await
            .expect("topology gate closed")
    }

    /// Connect to a live server and read its configuration and replication
    /// state, writing the result into the store.
    ///
    /// The attempt is noted in the store before the connection is opened, so a
    /// hung connection leaves a visible `last_attempted_check > last_checked`
    /// trail. On any outcome the store reflects the attempt: a full row when
    /// the instance was found, `last_checked` alone when it was not. Panics
    /// are trapped and logged, not propagated.
    pub async fn read_topology_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<Instance, TopologyError> {
        match AssertUnwindSafe(self.probe_instance(key)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("unexpected panic while probing {key}: {reason}");
                Err(TopologyError::QueryFailed {
                    context: format!("probe of {key}"),
                    reason: format!("probe panicked: {reason}"),
                })
            }
        }
    }

    async fn probe_instance(&self, key: &InstanceKey) -> Result<Instance, TopologyError> {
        if let Err(e) = self.store.mark_attempted_check(key).await {
            warn!("failed to mark check attempt of {key}: {e}");
        }

        // The SQL collection runs under the topology gate; all store work
        // happens after the permit is released, so a store operation never
        // holds the topology semaphore.
        let mut learned_hostname_mapping = None;
        let outcome = {
            let _permit = self.topology_permit().await;
            self.collect_instance(key, &mut learned_hostname_mapping)
                .await
        };

        if let Some((hostname, resolved)) = learned_hostname_mapping {
            if let Err(e) = self
                .resolver
                .update_resolved_hostname(&hostname, &resolved)
                .await
            {
                warn!("failed to persist hostname mapping {hostname} -> {resolved}: {e}");
            }
        }

        match outcome {
            Ok(collected) => {
                let Collected {
                    mut instance,
                    long_running,
                    mut deferred_error,
                } = collected;
                match self
                    .read_cluster_name_by_master(&instance.key, &instance.master_key)
                    .await
                {
                    Ok((cluster_name, replication_depth)) => {
                        instance.cluster_name = cluster_name;
                        instance.replication_depth = replication_depth;
                    }
                    Err(e) => {
                        error!("cluster derivation for {} failed: {e}", instance.key);
                        deferred_error.get_or_insert(e);
                    }
                }
                if let Err(e) = self
                    .store
                    .write_instance(&instance, true, deferred_error.as_ref())
                    .await
                {
                    error!("failed to store probe result for {}: {e}", instance.key);
                }
                if let Err(e) = self
                    .store
                    .write_long_running_processes(&instance.key, &long_running)
                    .await
                {
                    error!("failed to store processlist for {}: {e}", instance.key);
                }
                match deferred_error {
                    None => Ok(instance),
                    Some(err) => {
                        error!("probe of {key} partially failed: {err}");
                        Err(err)
                    }
                }
            }
            Err(err) => {
                if let Err(e) = self.store.mark_last_checked(key).await {
                    warn!("failed to mark check of {key}: {e}");
                }
                error!("probe of {key} failed: {err}");
                Err(err)
            }
        }
    }

    /// The statement sequence of one probe. An error before the instance-found
    /// point aborts collection; afterwards the first error is retained and the
    /// remaining steps still run. A hostname mapping learned from the server's
    /// own `@@hostname` is reported through `learned_hostname_mapping` so the
    /// caller can persist it outside the topology gate.
    async fn collect_instance(
        &self,
        key: &InstanceKey,
        learned_hostname_mapping: &mut Option<(String, String)>,
    ) -> Result<Collected, TopologyError> {
        let conn = self.connector.connect(key).await?;
        let mut instance = Instance::new(key.clone());

        let row = conn
            .query_row(
                "select @@hostname, @@global.server_id, @@global.version, \
                 @@global.read_only, @@global.binlog_format, @@global.log_bin, \
                 @@global.log_slave_updates",
            )
            .await?;
        let reported_hostname = row.get_string("@@hostname");
        instance.server_id = row.get_u32("@@global.server_id");
        instance.version = row.get_string("@@global.version");
        instance.read_only = row.get_bool("@@global.read_only");
        instance.binlog_format = row.get_string("@@global.binlog_format");
        instance.log_bin_enabled = row.get_bool("@@global.log_bin");
        instance.log_slave_updates_enabled = row.get_bool("@@global.log_slave_updates");

        if !reported_hostname.is_empty() && reported_hostname != instance.key.hostname {
            // The server knows itself under a different name; remember the
            // mapping and keep the canonical name for this record.
            self.resolver
                .cache_resolved_hostname(&instance.key.hostname, &reported_hostname);
            *learned_hostname_mapping =
                Some((instance.key.hostname.clone(), reported_hostname.clone()));
            instance.key.hostname = reported_hostname;
        }

        if let Some(status) = conn.query("show slave status").await?.into_iter().next() {
            instance.slave_io_running = status.get_string("Slave_IO_Running") == "Yes";
            instance.slave_sql_running = status.get_string("Slave_SQL_Running") == "Yes";
            instance.read_binlog_coordinates = BinlogCoordinates::new(
                status.get_string("Master_Log_File"),
                status.get_i64("Read_Master_Log_Pos"),
            );
            instance.exec_binlog_coordinates = BinlogCoordinates::new(
                status.get_string("Relay_Master_Log_File"),
                status.get_i64("Exec_Master_Log_Pos"),
            );
            instance.relaylog_coordinates = BinlogCoordinates::relay(
                status.get_string("Relay_Log_File"),
                status.get_i64("Relay_Log_Pos"),
            );
            instance.last_sql_error = status.get_string("Last_SQL_Error");
            instance.last_io_error = status.get_string("Last_IO_Error");
            instance.using_oracle_gtid = status.get_i64_or("Auto_Position", 0) == 1;
            instance.using_mariadb_gtid = status.get_string_or("Using_Gtid", "No") == "Yes";

            match InstanceKey::from_strings(
                &status.get_string("Master_Host"),
                &status.get_string("Master_Port"),
            ) {
                Ok(mut master_key) => {
                    master_key.hostname = self.resolver.resolve(&master_key.hostname);
                    instance.master_key = master_key;
                }
                Err(e) => warn!("unusable master pointer on {}: {e}", instance.key),
            }
            instance.seconds_behind_master = status.get_null_i64("Seconds_Behind_Master");
            if self.config.slave_lag_query.is_empty() {
                instance.slave_lag_seconds = instance.seconds_behind_master;
            }
        }

        if instance.log_bin_enabled {
            if let Some(row) = conn.query("show master status").await?.into_iter().next() {
                instance.self_binlog_coordinates =
                    BinlogCoordinates::new(row.get_string("File"), row.get_i64("Position"));
            }
        }

        // Slave discovery: SHOW SLAVE HOSTS when configured, processlist
        // scanning otherwise or when nothing was reported.
        let mut found_by_slave_hosts = false;
        if self.config.discover_by_show_slave_hosts {
            for row in conn.query("show slave hosts").await? {
                let mut slave_key =
                    InstanceKey::from_strings(&row.get_string("Host"), &row.get_string("Port"))?;
                slave_key.hostname = self.resolver.resolve(&slave_key.hostname);
                instance.add_slave_key(slave_key);
                found_by_slave_hosts = true;
            }
        }
        if !found_by_slave_hosts {
            for row in conn.query(PROCESSLIST_SLAVE_HOSTS_QUERY).await? {
                let hostname = self.resolver.resolve(&row.get_string("slave_hostname"));
                instance.add_slave_key(InstanceKey::new(hostname, instance.key.port));
            }
        }

        if instance.log_bin_enabled {
            let mut binlogs = Vec::new();
            for row in conn.query("show binary logs").await? {
                binlogs.push(row.get_string("Log_name"));
            }
            instance.set_binary_logs(binlogs);
        }

        // The instance counts as found from here on; later errors no longer
        // invalidate what was collected.
        let mut deferred_error: Option<TopologyError> = None;
        let mut long_running = Vec::new();

        match conn.query(PROCESSLIST_LONG_RUNNING_QUERY).await {
            Ok(rows) => {
                for row in rows {
                    long_running.push(Process {
                        id: row.get_i64("id"),
                        user: row.get_string("user"),
                        host: row.get_string("host"),
                        db: row.get_string("db"),
                        command: row.get_string("command"),
                        time: row.get_i64("time"),
                        state: row.get_string("state"),
                        info: row.get_string("info"),
                        started_at: row.get_string("started_at"),
                    });
                }
            }
            Err(e) => {
                error!("processlist read on {} failed: {e}", instance.key);
                deferred_error.get_or_insert(e);
            }
        }

        if !self.config.slave_lag_query.is_empty() {
            match conn.query_row(&self.config.slave_lag_query).await {
                Ok(row) => instance.slave_lag_seconds = row.first_null_i64(),
                Err(e) => {
                    error!("slave lag query on {} failed: {e}", instance.key);
                    deferred_error.get_or_insert(e);
                }
            }
        }

        Ok(Collected {
            instance,
            long_running,
            deferred_error,
        })
    }

    /// Probe, then read the instance back from the store so the caller gets a
    /// record with freshness fields populated.
    pub async fn refresh_topology_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<Instance>, TopologyError> {
        let probed = self.read_topology_instance(key).await?;
        self.store.read_instance(&probed.key).await
    }

    /// Run a single side-effect statement against a live server, under the
    /// topology gate.
    pub(crate) async fn exec_instance(
        &self,
        key: &InstanceKey,
        statement: &str,
    ) -> Result<(), TopologyError> {
        let _permit = self.topology_permit().await;
        let conn = self.connector.connect(key).await?;
        debug!("exec on {key}: {statement}");
        conn.exec(statement).await
    }
}
