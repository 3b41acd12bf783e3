//! The probed and derived state of a single database server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{BinlogCoordinates, BinlogType, InstanceKey, MaestroError};

/// One long-running query captured from a server's processlist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: i64,
    pub user: String,
    pub host: String,
    pub db: String,
    pub command: String,
    pub time: i64,
    pub state: String,
    pub info: String,
    pub started_at: String,
}

/// The central record: everything known about one server, as collected by the
/// last probe plus what the cluster derivation computed from it.
///
/// The freshness fields (`is_up_to_date` and friends) are not probed; they are
/// derived from the store's timestamps whenever a record is read back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub key: InstanceKey,
    pub server_id: u32,
    pub version: String,
    pub read_only: bool,
    pub binlog_format: String,
    pub log_bin_enabled: bool,
    pub log_slave_updates_enabled: bool,
    pub self_binlog_coordinates: BinlogCoordinates,
    pub master_key: InstanceKey,
    pub slave_io_running: bool,
    pub slave_sql_running: bool,
    pub using_oracle_gtid: bool,
    pub using_mariadb_gtid: bool,
    pub using_pseudo_gtid: bool,
    pub read_binlog_coordinates: BinlogCoordinates,
    pub exec_binlog_coordinates: BinlogCoordinates,
    pub relaylog_coordinates: BinlogCoordinates,
    pub last_sql_error: String,
    pub last_io_error: String,
    pub seconds_behind_master: Option<i64>,
    pub slave_lag_seconds: Option<i64>,
    pub slave_hosts: BTreeSet<InstanceKey>,
    pub cluster_name: String,
    pub replication_depth: u32,
    pub binary_logs: Vec<String>,
    pub count_mysql_snapshots: u32,

    // Derived freshness, populated on store reads.
    pub is_up_to_date: bool,
    pub is_recently_checked: bool,
    pub is_last_check_valid: bool,
    pub seconds_since_last_seen: Option<i64>,
}

impl Instance {
    /// An empty record for the given key, with safe zero defaults.
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            relaylog_coordinates: BinlogCoordinates {
                kind: BinlogType::Relay,
                ..BinlogCoordinates::default()
            },
            ..Self::default()
        }
    }

    /// Record a slave of this instance. Duplicates are tolerated; ordering is
    /// irrelevant.
    pub fn add_slave_key(&mut self, key: InstanceKey) {
        self.slave_hosts.insert(key);
    }

    /// Replace the ordered binary log list.
    pub fn set_binary_logs(&mut self, logs: Vec<String>) {
        self.binary_logs = logs;
    }

    /// An instance is a slave when it has a master pointer.
    pub fn is_slave(&self) -> bool {
        !self.master_key.hostname.is_empty()
    }

    /// Both replication threads running.
    pub fn slave_running(&self) -> bool {
        self.slave_io_running && self.slave_sql_running
    }

    /// The SQL thread has applied everything the IO thread fetched.
    pub fn sql_thread_up_to_date(&self) -> bool {
        self.read_binlog_coordinates
            .equals(&self.exec_binlog_coordinates)
            .unwrap_or(false)
    }

    /// Compact encoding of the slave-host set for store persistence.
    pub fn slave_hosts_json(&self) -> String {
        serde_json::to_string(&self.slave_hosts).unwrap_or_else(|_| "[]".to_string())
    }

    /// Restore the slave-host set from its persisted encoding.
    pub fn read_slave_hosts_from_json(&mut self, json: &str) -> Result<(), MaestroError> {
        self.slave_hosts = serde_json::from_str(json)
            .map_err(|e| MaestroError::from_encoding_error(e, "slave hosts"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slave_instance() -> Instance {
        let mut instance = Instance::new(InstanceKey::new("db2", 3306));
        instance.master_key = InstanceKey::new("db1", 3306);
        instance.slave_io_running = true;
        instance.slave_sql_running = true;
        instance.read_binlog_coordinates = BinlogCoordinates::new("mysql-bin.000009", 200);
        instance.exec_binlog_coordinates = BinlogCoordinates::new("mysql-bin.000009", 100);
        instance
    }

    #[test]
    fn test_new_instance_defaults() {
        let instance = Instance::new(InstanceKey::new("db1", 3306));
        assert!(!instance.is_slave());
        assert!(!instance.slave_running());
        assert!(instance.slave_hosts.is_empty());
        assert_eq!(instance.relaylog_coordinates.kind, BinlogType::Relay);
        assert_eq!(instance.replication_depth, 0);
    }

    #[test]
    fn test_slave_predicates() {
        let mut instance = slave_instance();
        assert!(instance.is_slave());
        assert!(instance.slave_running());

        instance.slave_sql_running = false;
        assert!(!instance.slave_running());
    }

    #[test]
    fn test_sql_thread_up_to_date() {
        let mut instance = slave_instance();
        assert!(!instance.sql_thread_up_to_date());

        instance.exec_binlog_coordinates = instance.read_binlog_coordinates.clone();
        assert!(instance.sql_thread_up_to_date());
    }

    #[test]
    fn test_add_slave_key_is_duplicate_tolerant() {
        let mut instance = Instance::new(InstanceKey::new("db1", 3306));
        instance.add_slave_key(InstanceKey::new("db2", 3306));
        instance.add_slave_key(InstanceKey::new("db2", 3306));
        instance.add_slave_key(InstanceKey::new("db3", 3306));
        assert_eq!(instance.slave_hosts.len(), 2);
    }

    #[test]
    fn test_slave_hosts_encoding() {
        let mut instance = Instance::new(InstanceKey::new("db1", 3306));
        instance.add_slave_key(InstanceKey::new("db2", 3306));
        instance.add_slave_key(InstanceKey::new("db3", 3307));

        let json = instance.slave_hosts_json();
        let mut restored = Instance::new(InstanceKey::new("db1", 3306));
        restored.read_slave_hosts_from_json(&json).unwrap();
        assert_eq!(restored.slave_hosts, instance.slave_hosts);
    }

    #[test]
    fn test_slave_hosts_decoding_rejects_garbage() {
        let mut instance = Instance::new(InstanceKey::new("db1", 3306));
        let result = instance.read_slave_hosts_from_json("{not json");
        assert!(matches!(result, Err(MaestroError::Encoding { .. })));
    }
}
