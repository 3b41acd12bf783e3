//! In-memory backend store implementation.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::store::r#trait::{
    ClusterInfo, InstanceBackend, InstanceFilter, InstanceTimestamps, ReadContext,
};
use crate::TopologyError;
use maestro::{Instance, InstanceKey, Process};

/// One stored row: the instance payload plus its probe bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRow {
    pub(crate) instance: Instance,
    pub(crate) timestamps: InstanceTimestamps,
}

/// Serializable dump of the whole store state, used by the file backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreSnapshot {
    pub(crate) rows: Vec<StoredRow>,
    pub(crate) hostname_resolve: HashMap<String, String>,
    pub(crate) processes: Vec<(InstanceKey, Vec<Process>)>,
    pub(crate) agent_snapshots: HashMap<String, u32>,
}

#[derive(Debug, Default)]
struct StoreState {
    // BTreeMap keeps reads ordered by (hostname, port).
    instances: BTreeMap<InstanceKey, StoredRow>,
    hostname_resolve: HashMap<String, String>,
    processes: HashMap<InstanceKey, Vec<Process>>,
    agent_snapshots: HashMap<String, u32>,
}

/// In-memory implementation of the [`InstanceBackend`] trait.
///
/// Suitable for development, testing and single-process deployments where
/// persistence across restarts is not required.
#[derive(Debug, Default)]
pub struct InMemoryInstanceBackend {
    state: RwLock<StoreState>,
}

/// Freshness fields live on the instance record but belong to the store: they
/// are recomputed against `now` on every read and cleared before a write.
fn clear_derived_fields(instance: &mut Instance) {
    instance.is_up_to_date = false;
    instance.is_recently_checked = false;
    instance.is_last_check_valid = false;
    instance.seconds_since_last_seen = None;
    instance.count_mysql_snapshots = 0;
}

fn derive_freshness(instance: &mut Instance, timestamps: &InstanceTimestamps, ctx: ReadContext) {
    let seconds_since_checked = timestamps
        .last_checked
        .map(|checked| (ctx.now - checked).num_seconds());
    instance.is_up_to_date =
        seconds_since_checked.is_some_and(|s| s <= i64::from(ctx.poll_seconds));
    instance.is_recently_checked =
        seconds_since_checked.is_some_and(|s| s <= i64::from(ctx.poll_seconds) * 5);
    instance.is_last_check_valid = match (timestamps.last_checked, timestamps.last_seen) {
        (Some(checked), Some(seen)) => checked <= seen,
        _ => false,
    };
    instance.seconds_since_last_seen = timestamps
        .last_seen
        .map(|seen| (ctx.now - seen).num_seconds());
}

/// A row counts as unseen when its last completed check did not sight the
/// server. A row checked but never seen at all is unseen too.
fn is_unseen(timestamps: &InstanceTimestamps) -> bool {
    match (timestamps.last_checked, timestamps.last_seen) {
        (Some(checked), Some(seen)) => seen < checked,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl InMemoryInstanceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();
        StoreSnapshot {
            rows: state.instances.values().cloned().collect(),
            hostname_resolve: state.hostname_resolve.clone(),
            processes: state
                .processes
                .iter()
                .map(|(key, processes)| (key.clone(), processes.clone()))
                .collect(),
            agent_snapshots: state.agent_snapshots.clone(),
        }
    }

    pub(crate) fn restore(&self, snapshot: StoreSnapshot) {
        let mut state = self.state.write();
        state.instances = snapshot
            .rows
            .into_iter()
            .map(|row| (row.instance.key.clone(), row))
            .collect();
        state.hostname_resolve = snapshot.hostname_resolve;
        state.processes = snapshot.processes.into_iter().collect();
        state.agent_snapshots = snapshot.agent_snapshots;
    }

    fn filter_matches(
        filter: &InstanceFilter,
        row: &StoredRow,
        regex: Option<&Regex>,
        ctx: ReadContext,
    ) -> bool {
        let instance = &row.instance;
        match filter {
            InstanceFilter::ByCluster(name) => instance.cluster_name == *name,
            InstanceFilter::ByMaster(master_key) => instance.master_key == *master_key,
            InstanceFilter::Unseen => is_unseen(&row.timestamps),
            InstanceFilter::Problems => {
                let stale = row
                    .timestamps
                    .last_checked
                    .map_or(true, |checked| {
                        (ctx.now - checked).num_seconds() > i64::from(ctx.poll_seconds)
                    });
                is_unseen(&row.timestamps)
                    || stale
                    || !instance.slave_sql_running
                    || !instance.slave_io_running
                    || instance.seconds_behind_master.is_some_and(|lag| lag > 10)
            }
            InstanceFilter::Search(term) => {
                instance.key.hostname.contains(term.as_str())
                    || instance.cluster_name.contains(term.as_str())
                    || instance.server_id.to_string() == *term
                    || instance.version.contains(term.as_str())
                    || instance.key.port.to_string() == *term
                    || instance.key.to_string().contains(term.as_str())
            }
            InstanceFilter::HostnameMatches(_) => {
                regex.is_some_and(|pattern| pattern.is_match(&instance.key.hostname))
            }
        }
    }
}

impl InstanceBackend for InMemoryInstanceBackend {
    fn upsert_instance(
        &self,
        instance: &Instance,
        actually_found: bool,
        update_last_seen: bool,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError> {
        let mut payload = instance.clone();
        clear_derived_fields(&mut payload);

        let mut state = self.state.write();
        match state.instances.get_mut(&instance.key) {
            Some(row) => {
                if actually_found {
                    // Pseudo-GTID marking is maintained by a separate flow;
                    // probe updates must not clobber it.
                    payload.using_pseudo_gtid = row.instance.using_pseudo_gtid;
                    let last_seen = if update_last_seen {
                        Some(now)
                    } else {
                        row.timestamps.last_seen
                    };
                    row.instance = payload;
                    row.timestamps = InstanceTimestamps {
                        last_checked: Some(now),
                        last_attempted_check: Some(now),
                        last_seen,
                    };
                }
                // Insert-ignore: a stale row is never overwritten by a
                // skeletal one.
            }
            None => {
                let timestamps = if actually_found {
                    InstanceTimestamps {
                        last_checked: Some(now),
                        last_attempted_check: Some(now),
                        last_seen: update_last_seen.then_some(now),
                    }
                } else {
                    // Skeletal row: no timestamps, so the outdated-key scan
                    // targets it on the next cycle.
                    InstanceTimestamps::default()
                };
                state.instances.insert(
                    instance.key.clone(),
                    StoredRow {
                        instance: payload,
                        timestamps,
                    },
                );
            }
        }
        Ok(())
    }

    fn mark_attempted_check(
        &self,
        key: &InstanceKey,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError> {
        let mut state = self.state.write();
        if let Some(row) = state.instances.get_mut(key) {
            row.timestamps.last_attempted_check = Some(now);
        }
        Ok(())
    }

    fn mark_last_checked(
        &self,
        key: &InstanceKey,
        now: DateTime<Utc>,
    ) -> Result<(), TopologyError> {
        let mut state = self.state.write();
        if let Some(row) = state.instances.get_mut(key) {
            row.timestamps.last_checked = Some(now);
            // The attempt always precedes the check; keep the invariant under
            // second-granularity clocks by raising the attempt stamp with it.
            if row
                .timestamps
                .last_attempted_check
                .map_or(true, |attempted| attempted < now)
            {
                row.timestamps.last_attempted_check = Some(now);
            }
        }
        Ok(())
    }

    fn read_instance(
        &self,
        key: &InstanceKey,
        ctx: ReadContext,
    ) -> Result<Option<Instance>, TopologyError> {
        let state = self.state.read();
        Ok(state.instances.get(key).map(|row| {
            let mut instance = row.instance.clone();
            derive_freshness(&mut instance, &row.timestamps, ctx);
            instance
        }))
    }

    fn read_timestamps(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<InstanceTimestamps>, TopologyError> {
        let state = self.state.read();
        Ok(state.instances.get(key).map(|row| row.timestamps))
    }

    fn filter_instances(
        &self,
        filter: &InstanceFilter,
        ctx: ReadContext,
    ) -> Result<Vec<Instance>, TopologyError> {
        let regex = match filter {
            InstanceFilter::HostnameMatches(pattern) => {
                Some(Regex::new(pattern).map_err(|e| TopologyError::InvalidInput {
                    context: "hostname pattern".to_string(),
                    reason: e.to_string(),
                })?)
            }
            _ => None,
        };

        let state = self.state.read();
        let mut instances = Vec::new();
        for row in state.instances.values() {
            if Self::filter_matches(filter, row, regex.as_ref(), ctx) {
                let mut instance = row.instance.clone();
                derive_freshness(&mut instance, &row.timestamps, ctx);
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    fn outdated_keys(&self, ctx: ReadContext) -> Result<Vec<InstanceKey>, TopologyError> {
        let state = self.state.read();
        let mut keys = Vec::new();
        for (key, row) in &state.instances {
            let due = match row.timestamps.last_checked {
                None => true,
                Some(checked) => {
                    let elapsed = (ctx.now - checked).num_seconds();
                    let hung = row
                        .timestamps
                        .last_attempted_check
                        .is_some_and(|attempted| attempted > checked);
                    let threshold = if hung {
                        i64::from(ctx.poll_seconds) * 20
                    } else {
                        i64::from(ctx.poll_seconds)
                    };
                    elapsed > threshold
                }
            };
            if due {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }

    fn unseen_master_keys(&self) -> Result<Vec<InstanceKey>, TopologyError> {
        let state = self.state.read();
        let mut keys = BTreeSet::new();
        for row in state.instances.values() {
            let instance = &row.instance;
            let master = &instance.master_key;
            if master.hostname.is_empty()
                || master.hostname == "_"
                || master.port == 0
                || !instance.slave_io_running
            {
                continue;
            }
            let resolved = state
                .hostname_resolve
                .get(&master.hostname)
                .cloned()
                .unwrap_or_else(|| master.hostname.clone());
            let candidate = InstanceKey::new(resolved, master.port);
            let unknown = match state.instances.get(&candidate) {
                None => true,
                Some(existing) => existing.timestamps.last_checked.is_none(),
            };
            if unknown {
                keys.insert(candidate);
            }
        }
        Ok(keys.into_iter().collect())
    }

    fn update_cluster_name(
        &self,
        key: &InstanceKey,
        cluster_name: &str,
        replication_depth: u32,
    ) -> Result<(), TopologyError> {
        let mut state = self.state.write();
        if let Some(row) = state.instances.get_mut(key) {
            row.instance.cluster_name = cluster_name.to_string();
            row.instance.replication_depth = replication_depth;
        }
        Ok(())
    }

    fn forget_instance(&self, key: &InstanceKey) -> Result<bool, TopologyError> {
        let mut state = self.state.write();
        state.processes.remove(key);
        Ok(state.instances.remove(key).is_some())
    }

    fn forget_unseen_instances(
        &self,
        now: DateTime<Utc>,
        hours: u32,
    ) -> Result<usize, TopologyError> {
        let cutoff_seconds = i64::from(hours) * 3600;
        let mut state = self.state.write();
        let before = state.instances.len();
        state.instances.retain(|_, row| {
            !row.timestamps
                .last_seen
                .is_some_and(|seen| (now - seen).num_seconds() > cutoff_seconds)
        });
        Ok(before - state.instances.len())
    }

    fn cluster_names(&self) -> Result<Vec<String>, TopologyError> {
        let state = self.state.read();
        let names: BTreeSet<String> = state
            .instances
            .values()
            .map(|row| row.instance.cluster_name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn clusters_info(&self) -> Result<Vec<ClusterInfo>, TopologyError> {
        let state = self.state.read();
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for row in state.instances.values() {
            *counts.entry(row.instance.cluster_name.clone()).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(cluster_name, count_instances)| ClusterInfo {
                cluster_name,
                count_instances,
            })
            .collect())
    }

    fn write_hostname_resolve(
        &self,
        hostname: &str,
        resolved: &str,
    ) -> Result<(), TopologyError> {
        let mut state = self.state.write();
        state
            .hostname_resolve
            .insert(hostname.to_string(), resolved.to_string());
        Ok(())
    }

    fn hostname_resolve_map(&self) -> Result<HashMap<String, String>, TopologyError> {
        Ok(self.state.read().hostname_resolve.clone())
    }

    fn write_long_running_processes(
        &self,
        key: &InstanceKey,
        processes: &[Process],
    ) -> Result<(), TopologyError> {
        let mut state = self.state.write();
        state.processes.insert(key.clone(), processes.to_vec());
        Ok(())
    }

    fn long_running_processes(&self, key: &InstanceKey) -> Result<Vec<Process>, TopologyError> {
        Ok(self
            .state
            .read()
            .processes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    fn set_snapshot_count(&self, hostname: &str, count: u32) -> Result<(), TopologyError> {
        let mut state = self.state.write();
        state.agent_snapshots.insert(hostname.to_string(), count);
        Ok(())
    }

    fn snapshot_counts(
        &self,
        hostnames: &[String],
    ) -> Result<HashMap<String, u32>, TopologyError> {
        let state = self.state.read();
        Ok(hostnames
            .iter()
            .filter_map(|hostname| {
                state
                    .agent_snapshots
                    .get(hostname)
                    .map(|count| (hostname.clone(), *count))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ctx_at(now: DateTime<Utc>, poll_seconds: u32) -> ReadContext {
        ReadContext { now, poll_seconds }
    }

    fn probed_instance(hostname: &str) -> Instance {
        let mut instance = Instance::new(InstanceKey::new(hostname, 3306));
        instance.version = "5.6.17-log".to_string();
        instance.server_id = 101;
        instance.cluster_name = format!("{hostname}:3306");
        instance
    }

    #[test]
    fn test_upsert_creates_and_updates() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        let mut instance = probed_instance("db1");

        backend.upsert_instance(&instance, true, true, now).unwrap();
        let ts = backend
            .read_timestamps(&instance.key)
            .unwrap()
            .expect("row exists");
        assert_eq!(ts.last_checked, Some(now));
        assert_eq!(ts.last_attempted_check, Some(now));
        assert_eq!(ts.last_seen, Some(now));

        instance.version = "5.6.21-log".to_string();
        let later = now + Duration::seconds(30);
        backend
            .upsert_instance(&instance, true, false, later)
            .unwrap();
        let ts = backend.read_timestamps(&instance.key).unwrap().unwrap();
        assert_eq!(ts.last_checked, Some(later));
        // last_seen is never touched by the update path itself
        assert_eq!(ts.last_seen, Some(now));

        let stored = backend
            .read_instance(&instance.key, ctx_at(later, 60))
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, "5.6.21-log");
    }

    #[test]
    fn test_insert_ignore_never_overwrites() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        let instance = probed_instance("db1");
        backend.upsert_instance(&instance, true, true, now).unwrap();

        let mut skeletal = Instance::new(instance.key.clone());
        skeletal.version = "Unknown".to_string();
        backend
            .upsert_instance(&skeletal, false, false, now + Duration::seconds(5))
            .unwrap();

        let stored = backend
            .read_instance(&instance.key, ctx_at(now, 60))
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, "5.6.17-log");
        let ts = backend.read_timestamps(&instance.key).unwrap().unwrap();
        assert_eq!(ts.last_seen, Some(now));
    }

    #[test]
    fn test_skeletal_insert_has_no_timestamps() {
        let backend = InMemoryInstanceBackend::new();
        let mut skeletal = Instance::new(InstanceKey::new("dbx", 3306));
        skeletal.version = "Unknown".to_string();
        backend
            .upsert_instance(&skeletal, false, false, Utc::now())
            .unwrap();

        let ts = backend.read_timestamps(&skeletal.key).unwrap().unwrap();
        assert_eq!(ts.last_checked, None);
        assert_eq!(ts.last_attempted_check, None);
        assert_eq!(ts.last_seen, None);
    }

    #[test]
    fn test_update_preserves_pseudo_gtid_flag() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        let mut instance = probed_instance("db1");
        instance.using_pseudo_gtid = true;
        backend.upsert_instance(&instance, true, true, now).unwrap();

        let mut reprobed = probed_instance("db1");
        reprobed.using_pseudo_gtid = false;
        backend
            .upsert_instance(&reprobed, true, true, now + Duration::seconds(10))
            .unwrap();

        let stored = backend
            .read_instance(&instance.key, ctx_at(now, 60))
            .unwrap()
            .unwrap();
        assert!(stored.using_pseudo_gtid);
    }

    #[test]
    fn test_mark_last_checked_keeps_attempt_invariant() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        let instance = probed_instance("db1");
        backend.upsert_instance(&instance, true, true, now).unwrap();

        let attempt = now + Duration::seconds(10);
        backend
            .mark_attempted_check(&instance.key, attempt)
            .unwrap();
        let checked = attempt + Duration::seconds(2);
        backend.mark_last_checked(&instance.key, checked).unwrap();

        let ts = backend.read_timestamps(&instance.key).unwrap().unwrap();
        assert!(ts.last_attempted_check >= ts.last_checked);
        assert!(ts.probe_completed());
    }

    #[test]
    fn test_freshness_derivation() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        let instance = probed_instance("db1");
        backend.upsert_instance(&instance, true, true, now).unwrap();

        let fresh = backend
            .read_instance(&instance.key, ctx_at(now + Duration::seconds(5), 60))
            .unwrap()
            .unwrap();
        assert!(fresh.is_up_to_date);
        assert!(fresh.is_recently_checked);
        assert!(fresh.is_last_check_valid);
        assert_eq!(fresh.seconds_since_last_seen, Some(5));

        let stale = backend
            .read_instance(&instance.key, ctx_at(now + Duration::seconds(200), 60))
            .unwrap()
            .unwrap();
        assert!(!stale.is_up_to_date);
        assert!(stale.is_recently_checked);

        let ancient = backend
            .read_instance(&instance.key, ctx_at(now + Duration::seconds(400), 60))
            .unwrap()
            .unwrap();
        assert!(!ancient.is_recently_checked);
    }

    #[test]
    fn test_unseen_filter() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        let seen = probed_instance("db1");
        backend.upsert_instance(&seen, true, true, now).unwrap();

        let unseen = probed_instance("db2");
        backend.upsert_instance(&unseen, true, true, now).unwrap();
        backend
            .mark_last_checked(&unseen.key, now + Duration::seconds(60))
            .unwrap();

        let matched = backend
            .filter_instances(&InstanceFilter::Unseen, ctx_at(now + Duration::seconds(61), 60))
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].key, unseen.key);
    }

    #[test]
    fn test_problem_filter() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();

        let mut healthy = probed_instance("db1");
        healthy.slave_io_running = true;
        healthy.slave_sql_running = true;
        healthy.master_key = InstanceKey::new("db0", 3306);
        backend.upsert_instance(&healthy, true, true, now).unwrap();

        let mut lagging = probed_instance("db2");
        lagging.slave_io_running = true;
        lagging.slave_sql_running = true;
        lagging.seconds_behind_master = Some(300);
        backend.upsert_instance(&lagging, true, true, now).unwrap();

        let mut broken = probed_instance("db3");
        broken.slave_io_running = true;
        broken.slave_sql_running = false;
        backend.upsert_instance(&broken, true, true, now).unwrap();

        let problems = backend
            .filter_instances(&InstanceFilter::Problems, ctx_at(now + Duration::seconds(1), 60))
            .unwrap();
        let keys: Vec<_> = problems.iter().map(|i| i.key.hostname.clone()).collect();
        assert_eq!(keys, vec!["db2", "db3"]);
    }

    #[test]
    fn test_search_and_regex_filters() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        backend
            .upsert_instance(&probed_instance("alpha-db1"), true, true, now)
            .unwrap();
        backend
            .upsert_instance(&probed_instance("beta-db2"), true, true, now)
            .unwrap();

        let found = backend
            .filter_instances(
                &InstanceFilter::Search("alpha".to_string()),
                ctx_at(now, 60),
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key.hostname, "alpha-db1");

        let found = backend
            .filter_instances(
                &InstanceFilter::HostnameMatches("^beta-db[0-9]+$".to_string()),
                ctx_at(now, 60),
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key.hostname, "beta-db2");

        let result = backend.filter_instances(
            &InstanceFilter::HostnameMatches("[unclosed".to_string()),
            ctx_at(now, 60),
        );
        assert!(matches!(result, Err(TopologyError::InvalidInput { .. })));
    }

    #[test]
    fn test_outdated_keys_poll_and_hung_backoff() {
        let backend = InMemoryInstanceBackend::new();
        let poll = 10u32;
        let t = Utc::now();

        // Completed probe: outdated one poll interval after last_checked.
        let completed = probed_instance("db1");
        backend.upsert_instance(&completed, true, true, t).unwrap();

        // Hung probe: attempt newer than completion.
        let hung = probed_instance("db2");
        backend
            .upsert_instance(&hung, true, true, t - Duration::seconds(1))
            .unwrap();
        backend.mark_attempted_check(&hung.key, t).unwrap();

        let at = |seconds: i64| ctx_at(t + Duration::seconds(seconds), poll);

        let keys = backend.outdated_keys(at(5)).unwrap();
        assert!(keys.is_empty());

        let keys = backend.outdated_keys(at(11)).unwrap();
        assert_eq!(keys, vec![completed.key.clone()]);

        // At t+100s the hung instance is still within the 20x window.
        let keys = backend.outdated_keys(at(100)).unwrap();
        assert_eq!(keys, vec![completed.key.clone()]);

        // At t+210s the 20x interval since last_checked has elapsed.
        let keys = backend.outdated_keys(at(210)).unwrap();
        assert_eq!(keys, vec![completed.key.clone(), hung.key.clone()]);
    }

    #[test]
    fn test_never_checked_rows_are_immediately_outdated() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        let mut skeletal = Instance::new(InstanceKey::new("dbx", 3306));
        skeletal.version = "Unknown".to_string();
        backend
            .upsert_instance(&skeletal, false, false, now)
            .unwrap();

        let keys = backend.outdated_keys(ctx_at(now, 60)).unwrap();
        assert_eq!(keys, vec![skeletal.key]);
    }

    #[test]
    fn test_unseen_master_keys() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();

        let mut slave = probed_instance("db3");
        slave.master_key = InstanceKey::new("dbx", 3306);
        slave.slave_io_running = true;
        backend.upsert_instance(&slave, true, true, now).unwrap();

        // A slave whose IO thread is stopped does not vouch for its master.
        let mut stopped = probed_instance("db4");
        stopped.master_key = InstanceKey::new("dby", 3306);
        stopped.slave_io_running = false;
        backend.upsert_instance(&stopped, true, true, now).unwrap();

        // A reset-sentinel master pointer is not a real master.
        let mut reset = probed_instance("db5");
        reset.master_key = InstanceKey::new("_", 3306);
        reset.slave_io_running = true;
        backend.upsert_instance(&reset, true, true, now).unwrap();

        let keys = backend.unseen_master_keys().unwrap();
        assert_eq!(keys, vec![InstanceKey::new("dbx", 3306)]);
    }

    #[test]
    fn test_unseen_master_keys_honours_hostname_resolve() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();

        let master = probed_instance("db1a");
        backend.upsert_instance(&master, true, true, now).unwrap();
        backend.write_hostname_resolve("db1", "db1a").unwrap();

        let mut slave = probed_instance("db2");
        slave.master_key = InstanceKey::new("db1", 3306);
        slave.slave_io_running = true;
        backend.upsert_instance(&slave, true, true, now).unwrap();

        // db1 resolves to db1a, which is known: nothing to inject.
        assert!(backend.unseen_master_keys().unwrap().is_empty());
    }

    #[test]
    fn test_forget_unseen_instances() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();

        let old = probed_instance("db1");
        backend
            .upsert_instance(&old, true, true, now - Duration::hours(100))
            .unwrap();
        let recent = probed_instance("db2");
        backend.upsert_instance(&recent, true, true, now).unwrap();

        let removed = backend.forget_unseen_instances(now, 72).unwrap();
        assert_eq!(removed, 1);
        assert!(backend
            .read_instance(&old.key, ctx_at(now, 60))
            .unwrap()
            .is_none());
        assert!(backend
            .read_instance(&recent.key, ctx_at(now, 60))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_cluster_aggregates() {
        let backend = InMemoryInstanceBackend::new();
        let now = Utc::now();
        for (host, cluster) in [("db1", "prod"), ("db2", "prod"), ("db3", "test")] {
            let mut instance = probed_instance(host);
            instance.cluster_name = cluster.to_string();
            backend.upsert_instance(&instance, true, true, now).unwrap();
        }

        assert_eq!(backend.cluster_names().unwrap(), vec!["prod", "test"]);
        let info = backend.clusters_info().unwrap();
        assert_eq!(
            info,
            vec![
                ClusterInfo {
                    cluster_name: "prod".to_string(),
                    count_instances: 2
                },
                ClusterInfo {
                    cluster_name: "test".to_string(),
                    count_instances: 1
                },
            ]
        );
    }

    #[test]
    fn test_long_running_processes_roundtrip() {
        let backend = InMemoryInstanceBackend::new();
        let key = InstanceKey::new("db1", 3306);
        let process = Process {
            id: 1234,
            user: "app".to_string(),
            command: "Query".to_string(),
            time: 120,
            ..Process::default()
        };
        backend
            .write_long_running_processes(&key, &[process.clone()])
            .unwrap();
        assert_eq!(backend.long_running_processes(&key).unwrap(), vec![process]);
    }

    #[test]
    fn test_snapshot_counts() {
        let backend = InMemoryInstanceBackend::new();
        backend.set_snapshot_count("db1", 3).unwrap();
        backend.set_snapshot_count("db2", 1).unwrap();

        let counts = backend
            .snapshot_counts(&["db1".to_string(), "db3".to_string()])
            .unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.get("db1"), Some(&3));
    }
}
