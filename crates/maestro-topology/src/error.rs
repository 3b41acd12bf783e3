//! Error types for topology discovery and replication control.

use std::fmt;

use maestro::{BinlogCoordinates, InstanceKey, MaestroError};

/// Main error type for topology operations.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyError {
    /// Could not open a connection to a live server or the store backend.
    ConnectionFailed {
        key: InstanceKey,
        reason: String,
    },
    /// A statement failed mid-probe or mid-operation.
    QueryFailed {
        context: String,
        reason: String,
    },
    /// The operation requires the instance to be a slave.
    NotASlave {
        key: InstanceKey,
    },
    /// The operation requires replication to be stopped.
    SlaveRunning {
        key: InstanceKey,
    },
    /// Detach requested on an already-detached slave.
    AlreadyDetached {
        key: InstanceKey,
    },
    /// Reattach requested on a slave that is not detached.
    NotDetached {
        key: InstanceKey,
    },
    /// An operation with an explicit deadline ran out of time.
    Timeout {
        operation: String,
        key: InstanceKey,
    },
    /// The SQL thread was observed past the requested target coordinates.
    Overshoot {
        key: InstanceKey,
        target: BinlogCoordinates,
    },
    /// Malformed caller input: unparseable key, quoted identifiers, bad regex.
    InvalidInput {
        context: String,
        reason: String,
    },
    /// Backend store I/O or serialisation failure.
    Store {
        context: String,
        reason: String,
    },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::ConnectionFailed { key, reason } => {
                write!(f, "Cannot connect to {key}: {reason}")
            }
            TopologyError::QueryFailed { context, reason } => {
                write!(f, "Query failed in {context}: {reason}")
            }
            TopologyError::NotASlave { key } => {
                write!(f, "Instance is not a slave: {key}")
            }
            TopologyError::SlaveRunning { key } => {
                write!(f, "Slave is running on {key}")
            }
            TopologyError::AlreadyDetached { key } => {
                write!(f, "Slave is already detached: {key}")
            }
            TopologyError::NotDetached { key } => {
                write!(f, "Slave is not detached: {key}")
            }
            TopologyError::Timeout { operation, key } => {
                write!(f, "{operation} timeout on {key}")
            }
            TopologyError::Overshoot { key, target } => {
                write!(f, "SQL thread on {key} is past requested coordinates {target}")
            }
            TopologyError::InvalidInput { context, reason } => {
                write!(f, "Invalid input in {context}: {reason}")
            }
            TopologyError::Store { context, reason } => {
                write!(f, "Store error in {context}: {reason}")
            }
        }
    }
}

impl std::error::Error for TopologyError {}

impl TopologyError {
    /// True when the operation was rejected because its stated precondition
    /// does not hold. These are returned directly and never retried.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(
            self,
            TopologyError::NotASlave { .. }
                | TopologyError::SlaveRunning { .. }
                | TopologyError::AlreadyDetached { .. }
                | TopologyError::NotDetached { .. }
        )
    }

    /// True for failures caused by the caller rather than the environment.
    pub fn is_client_error(&self) -> bool {
        self.is_precondition_failure()
            || matches!(
                self,
                TopologyError::InvalidInput { .. } | TopologyError::Overshoot { .. }
            )
    }

    pub fn from_io_error(e: std::io::Error, context: &str) -> Self {
        TopologyError::Store {
            context: context.to_string(),
            reason: e.to_string(),
        }
    }

    pub fn from_serialization_error(e: impl fmt::Display, context: &str) -> Self {
        TopologyError::Store {
            context: context.to_string(),
            reason: e.to_string(),
        }
    }
}

impl From<MaestroError> for TopologyError {
    fn from(e: MaestroError) -> Self {
        if e.is_invalid_input() {
            TopologyError::InvalidInput {
                context: "instance model".to_string(),
                reason: e.to_string(),
            }
        } else {
            TopologyError::Store {
                context: "instance model".to_string(),
                reason: e.to_string(),
            }
        }
    }
}
