//! Backend store trait definitions.
//!
//! The store is an external collaborator: any relational-ish backend that can
//! upsert keyed rows and keep second-granularity timestamps satisfies this
//! trait. Implementations are synchronous; the gateway layers the process-wide
//! concurrency bounds on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::TopologyError;
use maestro::{Instance, InstanceKey, Process};

/// Time context for reads whose results depend on "now" and the poll cadence.
#[derive(Debug, Clone, Copy)]
pub struct ReadContext {
    pub now: DateTime<Utc>,
    pub poll_seconds: u32,
}

/// The probe bookkeeping attached to each stored row.
///
/// `last_attempted_check` is written before a probe opens its connection;
/// `last_checked` when the probe returns (success or failure); `last_seen`
/// only when a probe succeeds. `last_attempted_check >= last_checked` holds at
/// all times, and equality means the last probe completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceTimestamps {
    pub last_checked: Option<DateTime<Utc>>,
    pub last_attempted_check: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl InstanceTimestamps {
    /// The last probe attempt ran to completion.
    pub fn probe_completed(&self) -> bool {
        match (self.last_attempted_check, self.last_checked) {
            (Some(attempted), Some(checked)) => attempted <= checked,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

/// Aggregate information about one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub count_instances: u32,
}

/// Canned row conditions for instance reads.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceFilter {
    /// All members of a cluster.
    ByCluster(String),
    /// All slaves of a given master.
    ByMaster(InstanceKey),
    /// Rows whose last probe attempt did not result in a sighting.
    Unseen,
    /// Unseen, stale, replication-broken, or badly lagging rows.
    Problems,
    /// Substring search across the identity fields.
    Search(String),
    /// Hostname regex match.
    HostnameMatches(String),
}

/// Storage operations for instance rows and their side tables
/// (hostname resolution, long-running processes, host agents).
pub trait InstanceBackend: Send + Sync {
    /// Insert or update an instance row.
    ///
    /// With `actually_found`, an existing row is updated in full except for
    /// `last_seen`, and `last_checked`/`last_attempted_check` are set to `now`;
    /// `update_last_seen` additionally stamps `last_seen`. Without
    /// `actually_found` the write is an insert-ignore: an existing row is left
    /// untouched, and a newly created skeletal row carries no timestamps so
    /// the next poll cycle picks it up.
    fn upsert_instance(
        &self,
        instance: &Instance,
        actually_found: bool,
        update_last_seen: bool,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError>;

    /// Stamp `last_attempted_check` only.
    fn mark_attempted_check(
        &self,
        key: &InstanceKey,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError>;

    /// Stamp `last_checked` only (used when a probe failed before the full
    /// row could be written).
    fn mark_last_checked(&self, key: &InstanceKey, now: DateTime<Utc>)
        -> Result<(), TopologyError>;

    /// Read a single row, freshness fields populated.
    fn read_instance(
        &self,
        key: &InstanceKey,
        ctx: ReadContext,
    ) -> Result<Option<Instance>, TopologyError>;

    /// Read a row's probe bookkeeping.
    fn read_timestamps(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<InstanceTimestamps>, TopologyError>;

    /// Read all rows matching a filter, ordered by key.
    fn filter_instances(
        &self,
        filter: &InstanceFilter,
        ctx: ReadContext,
    ) -> Result<Vec<Instance>, TopologyError>;

    /// Keys due for a fresh probe: checked rows older than the poll interval,
    /// never-checked rows immediately, and hung rows (attempt newer than
    /// completion) only after twenty poll intervals have passed.
    fn outdated_keys(&self, ctx: ReadContext) -> Result<Vec<InstanceKey>, TopologyError>;

    /// Master keys that slaves replicate from but which have no checked row,
    /// after applying the hostname-resolve mapping.
    fn unseen_master_keys(&self) -> Result<Vec<InstanceKey>, TopologyError>;

    /// Rewrite a row's cluster membership.
    fn update_cluster_name(
        &self,
        key: &InstanceKey,
        cluster_name: &str,
        replication_depth: u32,
    ) -> Result<(), TopologyError>;

    /// Remove a row. Returns whether it existed.
    fn forget_instance(&self, key: &InstanceKey) -> Result<bool, TopologyError>;

    /// Remove rows last seen more than `hours` ago. Returns the count removed.
    fn forget_unseen_instances(
        &self,
        now: DateTime<Utc>,
        hours: u32,
    ) -> Result<usize, TopologyError>;

    /// Distinct cluster names.
    fn cluster_names(&self) -> Result<Vec<String>, TopologyError>;

    /// Per-cluster aggregates.
    fn clusters_info(&self) -> Result<Vec<ClusterInfo>, TopologyError>;

    /// Persist one hostname canonicalisation mapping (last writer wins).
    fn write_hostname_resolve(&self, hostname: &str, resolved: &str)
        -> Result<(), TopologyError>;

    /// The full canonicalisation mapping.
    fn hostname_resolve_map(&self) -> Result<HashMap<String, String>, TopologyError>;

    /// Replace the captured long-running processes for an instance.
    fn write_long_running_processes(
        &self,
        key: &InstanceKey,
        processes: &[Process],
    ) -> Result<(), TopologyError>;

    fn long_running_processes(&self, key: &InstanceKey) -> Result<Vec<Process>, TopologyError>;

    /// Record the agent-reported snapshot count for a host.
    fn set_snapshot_count(&self, hostname: &str, count: u32) -> Result<(), TopologyError>;

    /// Snapshot counts for the given hosts; hosts with no agent row are absent.
    fn snapshot_counts(
        &self,
        hostnames: &[String],
    ) -> Result<HashMap<String, u32>, TopologyError>;
}
