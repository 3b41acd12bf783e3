//! Simulated topology servers.
//!
//! A [`SimulatedTopology`] is a [`TopologyConnector`] over a fleet of
//! in-process servers that answer the probe's statements and apply the side
//! effects of replication-control statements. It backs development and the
//! test suites the way an in-memory store backend does: no network, fully
//! deterministic, with a per-server statement log for asserting what was
//! issued and in which order.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use crate::connector::{RowMap, TopologyConnection, TopologyConnector};
use crate::TopologyError;
use maestro::{InstanceKey, Process};

fn change_master_full_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^change master to master_host='([^']*)', master_port=(\d+), master_log_file='([^']*)', master_log_pos=(\d+)$",
        )
        .expect("static pattern")
    })
}

fn change_master_coords_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^change master to master_log_file='([^']*)', master_log_pos=(\d+)$")
            .expect("static pattern")
    })
}

fn change_master_host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^change master to master_host='([^']*)'$").expect("static pattern"))
}

fn start_until_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^start slave until master_log_file='([^']*)', master_log_pos=(\d+)$")
            .expect("static pattern")
    })
}

fn kill_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^kill query (\d+)$").expect("static pattern"))
}

#[derive(Debug, Default)]
struct ServerState {
    reported_hostname: String,
    server_id: u32,
    version: String,
    read_only: bool,
    binlog_format: String,
    log_bin: bool,
    log_slave_updates: bool,

    master_host: String,
    master_port: u16,
    slave_io_running: bool,
    slave_sql_running: bool,
    auto_position: bool,
    using_gtid: bool,
    read_file: String,
    read_pos: i64,
    exec_file: String,
    exec_pos: i64,
    relay_file: String,
    relay_pos: i64,
    last_sql_error: String,
    last_io_error: String,
    seconds_behind_master: Option<i64>,

    self_file: String,
    self_pos: i64,
    binary_logs: Vec<String>,
    slave_hosts: Vec<(String, u16)>,
    binlog_dump_hosts: Vec<String>,
    long_running: Vec<Process>,
    lag_query: Option<(String, Option<i64>)>,

    // How far the SQL thread advances toward the IO thread (or an UNTIL
    // target) each time slave status is observed.
    sql_catchup_per_poll: i64,
    until_coordinates: Option<(String, i64)>,

    refuse_connections: bool,
    failing_statements: Vec<String>,
}

/// One simulated server and its statement log.
#[derive(Debug)]
pub struct SimulatedServer {
    state: RwLock<ServerState>,
    statements: Mutex<Vec<String>>,
}

impl SimulatedServer {
    fn new(key: &InstanceKey, server_id: u32) -> Self {
        let state = ServerState {
            reported_hostname: key.hostname.clone(),
            server_id,
            version: "5.6.17-log".to_string(),
            binlog_format: "STATEMENT".to_string(),
            log_bin: true,
            seconds_behind_master: None,
            ..ServerState::default()
        };
        Self {
            state: RwLock::new(state),
            statements: Mutex::new(Vec::new()),
        }
    }

    // --- test/dev configuration ---

    pub fn set_reported_hostname(&self, hostname: &str) {
        self.state.write().reported_hostname = hostname.to_string();
    }

    pub fn set_version(&self, version: &str) {
        self.state.write().version = version.to_string();
    }

    pub fn set_server_id(&self, server_id: u32) {
        self.state.write().server_id = server_id;
    }

    pub fn set_log_bin(&self, log_bin: bool) {
        self.state.write().log_bin = log_bin;
    }

    pub fn set_self_coordinates(&self, file: &str, pos: i64) {
        let mut state = self.state.write();
        state.self_file = file.to_string();
        state.self_pos = pos;
    }

    pub fn set_binary_logs(&self, logs: &[&str]) {
        self.state.write().binary_logs = logs.iter().map(|s| s.to_string()).collect();
    }

    /// Configure this server as a replicating slave of the given master.
    pub fn make_slave_of(&self, master_host: &str, master_port: u16) {
        let mut state = self.state.write();
        state.master_host = master_host.to_string();
        state.master_port = master_port;
        state.slave_io_running = true;
        state.slave_sql_running = true;
    }

    pub fn set_slave_threads(&self, io_running: bool, sql_running: bool) {
        let mut state = self.state.write();
        state.slave_io_running = io_running;
        state.slave_sql_running = sql_running;
    }

    pub fn set_read_coordinates(&self, file: &str, pos: i64) {
        let mut state = self.state.write();
        state.read_file = file.to_string();
        state.read_pos = pos;
    }

    pub fn set_exec_coordinates(&self, file: &str, pos: i64) {
        let mut state = self.state.write();
        state.exec_file = file.to_string();
        state.exec_pos = pos;
    }

    pub fn set_relay_coordinates(&self, file: &str, pos: i64) {
        let mut state = self.state.write();
        state.relay_file = file.to_string();
        state.relay_pos = pos;
    }

    pub fn set_seconds_behind_master(&self, seconds: Option<i64>) {
        self.state.write().seconds_behind_master = seconds;
    }

    pub fn set_last_errors(&self, io_error: &str, sql_error: &str) {
        let mut state = self.state.write();
        state.last_io_error = io_error.to_string();
        state.last_sql_error = sql_error.to_string();
    }

    pub fn set_gtid(&self, auto_position: bool, using_gtid: bool) {
        let mut state = self.state.write();
        state.auto_position = auto_position;
        state.using_gtid = using_gtid;
    }

    /// Add a row to `SHOW SLAVE HOSTS` output.
    pub fn add_slave_host(&self, hostname: &str, port: u16) {
        self.state
            .write()
            .slave_hosts
            .push((hostname.to_string(), port));
    }

    /// Add a `Binlog Dump` connection to the processlist.
    pub fn add_binlog_dump_host(&self, hostname: &str) {
        self.state
            .write()
            .binlog_dump_hosts
            .push(hostname.to_string());
    }

    pub fn add_long_running_process(&self, process: Process) {
        self.state.write().long_running.push(process);
    }

    /// Configure the operator lag query this server understands and the value
    /// it reports.
    pub fn set_lag_query(&self, query: &str, result: Option<i64>) {
        self.state.write().lag_query = Some((query.to_string(), result));
    }

    /// Advance the SQL thread by this many positions per slave-status poll.
    pub fn set_sql_catchup_per_poll(&self, step: i64) {
        self.state.write().sql_catchup_per_poll = step;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.write().refuse_connections = refuse;
    }

    /// Any statement containing this substring fails.
    pub fn fail_statements_matching(&self, pattern: &str) {
        self.state
            .write()
            .failing_statements
            .push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.write().failing_statements.clear();
    }

    // --- observation ---

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn clear_statements(&self) {
        self.statements.lock().clear();
    }

    pub fn master(&self) -> Option<InstanceKey> {
        let state = self.state.read();
        if state.master_host.is_empty() {
            None
        } else {
            Some(InstanceKey::new(state.master_host.clone(), state.master_port))
        }
    }

    pub fn slave_threads(&self) -> (bool, bool) {
        let state = self.state.read();
        (state.slave_io_running, state.slave_sql_running)
    }

    pub fn exec_coordinates(&self) -> (String, i64) {
        let state = self.state.read();
        (state.exec_file.clone(), state.exec_pos)
    }

    pub fn is_read_only(&self) -> bool {
        self.state.read().read_only
    }

    // --- statement handling ---

    fn record(&self, statement: &str) {
        self.statements.lock().push(statement.to_string());
    }

    fn check_failure(&self, statement: &str) -> Result<(), TopologyError> {
        let state = self.state.read();
        if state
            .failing_statements
            .iter()
            .any(|pattern| statement.contains(pattern.as_str()))
        {
            return Err(TopologyError::QueryFailed {
                context: statement.to_string(),
                reason: "simulated statement failure".to_string(),
            });
        }
        Ok(())
    }

    /// The SQL thread applies relay log events up to what the IO thread has
    /// fetched, never past an UNTIL target.
    fn advance_sql_thread(state: &mut ServerState) {
        if !state.slave_sql_running || state.sql_catchup_per_poll <= 0 {
            return;
        }
        let mut limit_file = state.read_file.clone();
        let mut limit_pos = state.read_pos;
        if let Some((until_file, until_pos)) = &state.until_coordinates {
            if *until_file < limit_file || (*until_file == limit_file && *until_pos < limit_pos) {
                limit_file = until_file.clone();
                limit_pos = *until_pos;
            }
        }
        if state.exec_file == limit_file {
            if state.exec_pos < limit_pos {
                state.exec_pos = (state.exec_pos + state.sql_catchup_per_poll).min(limit_pos);
            }
        } else if state.exec_file < limit_file {
            state.exec_file = limit_file;
            state.exec_pos = limit_pos;
        }
    }

    fn handle_query(&self, statement: &str) -> Result<Vec<RowMap>, TopologyError> {
        self.record(statement);
        self.check_failure(statement)?;

        if statement.starts_with("select @@hostname") {
            let state = self.state.read();
            return Ok(vec![RowMap::new()
                .with_text("@@hostname", state.reported_hostname.clone())
                .with_int("@@global.server_id", i64::from(state.server_id))
                .with_text("@@global.version", state.version.clone())
                .with_int("@@global.read_only", i64::from(state.read_only))
                .with_text("@@global.binlog_format", state.binlog_format.clone())
                .with_int("@@global.log_bin", i64::from(state.log_bin))
                .with_int("@@global.log_slave_updates", i64::from(state.log_slave_updates))]);
        }

        if statement == "show slave status" {
            let mut state = self.state.write();
            Self::advance_sql_thread(&mut state);
            if state.master_host.is_empty() {
                return Ok(vec![]);
            }
            let mut row = RowMap::new()
                .with_text("Master_Host", state.master_host.clone())
                .with_int("Master_Port", i64::from(state.master_port))
                .with_text(
                    "Slave_IO_Running",
                    if state.slave_io_running { "Yes" } else { "No" },
                )
                .with_text(
                    "Slave_SQL_Running",
                    if state.slave_sql_running { "Yes" } else { "No" },
                )
                .with_text("Master_Log_File", state.read_file.clone())
                .with_int("Read_Master_Log_Pos", state.read_pos)
                .with_text("Relay_Master_Log_File", state.exec_file.clone())
                .with_int("Exec_Master_Log_Pos", state.exec_pos)
                .with_text("Relay_Log_File", state.relay_file.clone())
                .with_int("Relay_Log_Pos", state.relay_pos)
                .with_text("Last_SQL_Error", state.last_sql_error.clone())
                .with_text("Last_IO_Error", state.last_io_error.clone())
                .with_int("Auto_Position", i64::from(state.auto_position))
                .with_text("Using_Gtid", if state.using_gtid { "Yes" } else { "No" });
            row = match state.seconds_behind_master {
                Some(seconds) => row.with_int("Seconds_Behind_Master", seconds),
                None => row.with_null("Seconds_Behind_Master"),
            };
            return Ok(vec![row]);
        }

        if statement == "show master status" {
            let state = self.state.read();
            if !state.log_bin || state.self_file.is_empty() {
                return Ok(vec![]);
            }
            return Ok(vec![RowMap::new()
                .with_text("File", state.self_file.clone())
                .with_int("Position", state.self_pos)]);
        }

        if statement == "show slave hosts" {
            let state = self.state.read();
            return Ok(state
                .slave_hosts
                .iter()
                .map(|(host, port)| {
                    RowMap::new()
                        .with_text("Host", host.clone())
                        .with_int("Port", i64::from(*port))
                })
                .collect());
        }

        if statement == "show binary logs" {
            let state = self.state.read();
            return Ok(state
                .binary_logs
                .iter()
                .map(|log| RowMap::new().with_text("Log_name", log.clone()))
                .collect());
        }

        if statement.contains("command='Binlog Dump'") {
            let state = self.state.read();
            return Ok(state
                .binlog_dump_hosts
                .iter()
                .map(|host| RowMap::new().with_text("slave_hostname", host.clone()))
                .collect());
        }

        if statement.contains("time > 60") {
            let state = self.state.read();
            return Ok(state
                .long_running
                .iter()
                .map(|process| {
                    RowMap::new()
                        .with_int("id", process.id)
                        .with_text("user", process.user.clone())
                        .with_text("host", process.host.clone())
                        .with_text("db", process.db.clone())
                        .with_text("command", process.command.clone())
                        .with_int("time", process.time)
                        .with_text("state", process.state.clone())
                        .with_text("info", process.info.clone())
                        .with_text("started_at", process.started_at.clone())
                })
                .collect());
        }

        {
            let state = self.state.read();
            if let Some((lag_query, result)) = &state.lag_query {
                if statement == lag_query {
                    let row = match result {
                        Some(lag) => RowMap::new().with_int("slave_lag", *lag),
                        None => RowMap::new().with_null("slave_lag"),
                    };
                    return Ok(vec![row]);
                }
            }
        }

        Err(TopologyError::QueryFailed {
            context: statement.to_string(),
            reason: "unrecognized statement".to_string(),
        })
    }

    fn handle_exec(&self, statement: &str) -> Result<(), TopologyError> {
        self.record(statement);
        self.check_failure(statement)?;

        let mut state = self.state.write();
        match statement {
            "stop slave" => {
                state.slave_io_running = false;
                state.slave_sql_running = false;
                state.until_coordinates = None;
                return Ok(());
            }
            "start slave" => {
                state.slave_io_running = true;
                state.slave_sql_running = true;
                state.until_coordinates = None;
                return Ok(());
            }
            "stop slave io_thread" => {
                state.slave_io_running = false;
                return Ok(());
            }
            "start slave sql_thread" => {
                state.slave_sql_running = true;
                return Ok(());
            }
            "reset slave" => {
                state.master_host = String::new();
                state.master_port = 0;
                state.slave_io_running = false;
                state.slave_sql_running = false;
                state.read_file = String::new();
                state.read_pos = 0;
                state.exec_file = String::new();
                state.exec_pos = 0;
                state.relay_file = String::new();
                state.relay_pos = 0;
                state.last_io_error = String::new();
                state.last_sql_error = String::new();
                return Ok(());
            }
            "flush error logs" => return Ok(()),
            _ => {}
        }

        if let Some(captures) = change_master_full_re().captures(statement) {
            state.master_host = captures[1].to_string();
            state.master_port = captures[2].parse().unwrap_or(0);
            state.read_file = captures[3].to_string();
            state.read_pos = captures[4].parse().unwrap_or(0);
            state.exec_file = state.read_file.clone();
            state.exec_pos = state.read_pos;
            return Ok(());
        }
        if let Some(captures) = change_master_coords_re().captures(statement) {
            state.read_file = captures[1].to_string();
            state.read_pos = captures[2].parse().unwrap_or(0);
            state.exec_file = state.read_file.clone();
            state.exec_pos = state.read_pos;
            return Ok(());
        }
        if let Some(captures) = change_master_host_re().captures(statement) {
            state.master_host = captures[1].to_string();
            return Ok(());
        }
        if let Some(captures) = start_until_re().captures(statement) {
            state.until_coordinates =
                Some((captures[1].to_string(), captures[2].parse().unwrap_or(0)));
            state.slave_io_running = true;
            state.slave_sql_running = true;
            return Ok(());
        }
        if let Some(captures) = kill_query_re().captures(statement) {
            let id: i64 = captures[1].parse().unwrap_or(0);
            state.long_running.retain(|process| process.id != id);
            return Ok(());
        }
        if statement == "set global read_only = true" {
            state.read_only = true;
            return Ok(());
        }
        if statement == "set global read_only = false" {
            state.read_only = false;
            return Ok(());
        }
        if statement.starts_with("select master_pos_wait(") {
            return Ok(());
        }

        Err(TopologyError::QueryFailed {
            context: statement.to_string(),
            reason: "unrecognized statement".to_string(),
        })
    }
}

/// A fleet of simulated servers, addressable by instance key.
#[derive(Default)]
pub struct SimulatedTopology {
    servers: RwLock<HashMap<InstanceKey, Arc<SimulatedServer>>>,
    next_server_id: AtomicU32,
}

impl SimulatedTopology {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            next_server_id: AtomicU32::new(101),
        }
    }

    /// Register a server reachable under the given key.
    pub fn add_server(&self, key: InstanceKey) -> Arc<SimulatedServer> {
        let server_id = self.next_server_id.fetch_add(1, Ordering::Relaxed);
        let server = Arc::new(SimulatedServer::new(&key, server_id));
        self.servers.write().insert(key, server.clone());
        server
    }

    pub fn server(&self, key: &InstanceKey) -> Option<Arc<SimulatedServer>> {
        self.servers.read().get(key).cloned()
    }

    /// Make an existing server reachable under an additional key (an alias
    /// name pointing at the same box).
    pub fn alias(&self, key: InstanceKey, server: Arc<SimulatedServer>) {
        self.servers.write().insert(key, server);
    }
}

struct SimulatedConnection {
    server: Arc<SimulatedServer>,
}

#[async_trait]
impl TopologyConnection for SimulatedConnection {
    async fn query(&self, statement: &str) -> Result<Vec<RowMap>, TopologyError> {
        self.server.handle_query(statement)
    }

    async fn exec(&self, statement: &str) -> Result<(), TopologyError> {
        self.server.handle_exec(statement)
    }
}

#[async_trait]
impl TopologyConnector for SimulatedTopology {
    async fn connect(
        &self,
        key: &InstanceKey,
    ) -> Result<Box<dyn TopologyConnection>, TopologyError> {
        let server = self
            .server(key)
            .ok_or_else(|| TopologyError::ConnectionFailed {
                key: key.clone(),
                reason: "no route to host".to_string(),
            })?;
        if server.state.read().refuse_connections {
            return Err(TopologyError::ConnectionFailed {
                key: key.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(SimulatedConnection { server }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> (SimulatedTopology, Arc<SimulatedServer>, InstanceKey) {
        let topology = SimulatedTopology::new();
        let key = InstanceKey::new("db1", 3306);
        let server = topology.add_server(key.clone());
        (topology, server, key)
    }

    #[tokio::test]
    async fn test_identity_query() {
        let (topology, server, key) = server();
        server.set_version("5.6.21-log");

        let conn = topology.connect(&key).await.unwrap();
        let row = conn
            .query_row("select @@hostname, @@global.server_id, @@global.version, @@global.read_only, @@global.binlog_format, @@global.log_bin, @@global.log_slave_updates")
            .await
            .unwrap();
        assert_eq!(row.get_string("@@hostname"), "db1");
        assert_eq!(row.get_string("@@global.version"), "5.6.21-log");
        assert!(row.get_bool("@@global.log_bin"));
    }

    #[tokio::test]
    async fn test_slave_status_empty_for_master() {
        let (topology, _, key) = server();
        let conn = topology.connect(&key).await.unwrap();
        let rows = conn.query("show slave status").await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_control_statement_side_effects() {
        let (topology, server, key) = server();
        server.make_slave_of("db0", 3306);

        let conn = topology.connect(&key).await.unwrap();
        conn.exec("stop slave io_thread").await.unwrap();
        assert_eq!(server.slave_threads(), (false, true));

        conn.exec("stop slave").await.unwrap();
        assert_eq!(server.slave_threads(), (false, false));

        conn.exec("change master to master_log_file='//bin.000007:4096', master_log_pos=4096")
            .await
            .unwrap();
        assert_eq!(
            server.exec_coordinates(),
            ("//bin.000007:4096".to_string(), 4096)
        );

        conn.exec("set global read_only = true").await.unwrap();
        assert!(server.is_read_only());

        assert_eq!(server.statements().len(), 4);
    }

    #[tokio::test]
    async fn test_sql_thread_catchup_clamps_at_read_coordinates() {
        let (topology, server, key) = server();
        server.make_slave_of("db0", 3306);
        server.set_read_coordinates("bin.9", 200);
        server.set_exec_coordinates("bin.9", 100);
        server.set_sql_catchup_per_poll(60);

        let conn = topology.connect(&key).await.unwrap();
        for expected in [160, 200, 200] {
            let rows = conn.query("show slave status").await.unwrap();
            assert_eq!(rows[0].get_i64("Exec_Master_Log_Pos"), expected);
        }
    }

    #[tokio::test]
    async fn test_until_target_caps_catchup() {
        let (topology, server, key) = server();
        server.make_slave_of("db0", 3306);
        server.set_slave_threads(false, false);
        server.set_read_coordinates("bin.9", 500);
        server.set_exec_coordinates("bin.9", 100);
        server.set_sql_catchup_per_poll(1000);

        let conn = topology.connect(&key).await.unwrap();
        conn.exec("start slave until master_log_file='bin.9', master_log_pos=300")
            .await
            .unwrap();
        let rows = conn.query("show slave status").await.unwrap();
        assert_eq!(rows[0].get_i64("Exec_Master_Log_Pos"), 300);
    }

    #[tokio::test]
    async fn test_unreachable_and_refused_connections() {
        let (topology, server, key) = server();

        let missing = InstanceKey::new("nope", 3306);
        assert!(matches!(
            topology.connect(&missing).await.err(),
            Some(TopologyError::ConnectionFailed { .. })
        ));

        server.refuse_connections(true);
        assert!(matches!(
            topology.connect(&key).await.err(),
            Some(TopologyError::ConnectionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_statement_failure_injection() {
        let (topology, server, key) = server();
        server.fail_statements_matching("show binary logs");

        let conn = topology.connect(&key).await.unwrap();
        assert!(conn.query("show binary logs").await.is_err());
        assert!(conn.query("show slave status").await.is_ok());
    }
}
