//! Audit trail sink.
//!
//! Control operations that change visible state report what they did through
//! [`AuditSink`]. The trail itself (table, file, syslog) belongs to a higher
//! layer; this crate only needs somewhere to send the entries.

use parking_lot::RwLock;

use log::info;
use maestro::InstanceKey;

/// Receives one entry per state-changing operation.
pub trait AuditSink: Send + Sync {
    fn audit(&self, action: &str, key: Option<&InstanceKey>, details: &str);
}

/// Default sink: writes audit entries to the log.
#[derive(Debug, Default)]
pub struct LogAudit;

impl AuditSink for LogAudit {
    fn audit(&self, action: &str, key: Option<&InstanceKey>, details: &str) {
        match key {
            Some(key) => info!("audit {action} on {key}: {details}"),
            None => info!("audit {action}: {details}"),
        }
    }
}

/// A recorded audit entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub action: String,
    pub key: Option<InstanceKey>,
    pub details: String,
}

/// Collecting sink, for inspection in tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.action.clone())
            .collect()
    }
}

impl AuditSink for MemoryAudit {
    fn audit(&self, action: &str, key: Option<&InstanceKey>, details: &str) {
        self.entries.write().push(AuditEntry {
            action: action.to_string(),
            key: key.cloned(),
            details: details.to_string(),
        });
    }
}
