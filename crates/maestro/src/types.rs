//! Identity and binlog coordinate types for topology instances.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::MaestroError;

/// Identifies a single database server by hostname and port.
///
/// Keys stored anywhere in the model carry the canonical hostname as reported
/// by the server itself (or its resolver mapping), never the name a caller
/// happened to contact it under.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InstanceKey {
    pub hostname: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Parse a key from separately reported host and port strings, as they
    /// appear in `SHOW SLAVE STATUS` and `SHOW SLAVE HOSTS` output.
    pub fn from_strings(hostname: &str, port: &str) -> Result<Self, MaestroError> {
        let parsed: u16 = port.trim().parse().map_err(|_| MaestroError::InvalidPort {
            hostname: hostname.to_string(),
            port: port.to_string(),
        })?;
        if parsed == 0 {
            return Err(MaestroError::InvalidPort {
                hostname: hostname.to_string(),
                port: port.to_string(),
            });
        }
        Ok(Self::new(hostname, parsed))
    }

    /// A key is valid when it actually points somewhere.
    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.port > 0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Which replication log a coordinate points into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinlogType {
    #[default]
    Binary,
    Relay,
}

/// A position within a replication log stream.
///
/// Coordinates order first by log file name (log files are named with a
/// monotonically increasing numeric suffix), then by position. Coordinates of
/// differing [`BinlogType`] are incomparable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: i64,
    pub kind: BinlogType,
}

impl BinlogCoordinates {
    pub fn new(log_file: impl Into<String>, log_pos: i64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            kind: BinlogType::Binary,
        }
    }

    pub fn relay(log_file: impl Into<String>, log_pos: i64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            kind: BinlogType::Relay,
        }
    }

    fn ensure_comparable(&self, other: &BinlogCoordinates) -> Result<(), MaestroError> {
        if self.kind != other.kind {
            return Err(MaestroError::IncomparableCoordinates {
                left: self.to_string(),
                right: other.to_string(),
            });
        }
        Ok(())
    }

    pub fn equals(&self, other: &BinlogCoordinates) -> Result<bool, MaestroError> {
        self.ensure_comparable(other)?;
        Ok(self.log_file == other.log_file && self.log_pos == other.log_pos)
    }

    /// Strict ordering: lexicographic on file name, then numeric on position.
    pub fn smaller_than(&self, other: &BinlogCoordinates) -> Result<bool, MaestroError> {
        self.ensure_comparable(other)?;
        if self.log_file < other.log_file {
            return Ok(true);
        }
        Ok(self.log_file == other.log_file && self.log_pos < other.log_pos)
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}
