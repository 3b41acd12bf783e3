//! Error types for the core instance model.

use std::fmt;

/// Main error type for instance-model operations.
#[derive(Debug, Clone, PartialEq)]
pub enum MaestroError {
    /// A reported port could not be parsed into a positive integer.
    InvalidPort {
        hostname: String,
        port: String,
    },
    /// Two binlog coordinates of differing log types were compared.
    IncomparableCoordinates {
        left: String,
        right: String,
    },
    /// A serialised value could not be encoded or decoded.
    Encoding {
        context: String,
        reason: String,
    },
    /// Configuration file I/O error.
    ConfigIo {
        path: String,
        reason: String,
    },
    /// Configuration file could not be parsed.
    ConfigParse {
        path: String,
        reason: String,
    },
}

impl fmt::Display for MaestroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaestroError::InvalidPort { hostname, port } => {
                write!(f, "Invalid port '{port}' for host '{hostname}'")
            }
            MaestroError::IncomparableCoordinates { left, right } => {
                write!(f, "Cannot compare coordinates of differing types: {left} vs {right}")
            }
            MaestroError::Encoding { context, reason } => {
                write!(f, "Encoding error in {context}: {reason}")
            }
            MaestroError::ConfigIo { path, reason } => {
                write!(f, "Config I/O error for '{path}': {reason}")
            }
            MaestroError::ConfigParse { path, reason } => {
                write!(f, "Config parse error for '{path}': {reason}")
            }
        }
    }
}

impl std::error::Error for MaestroError {}

impl MaestroError {
    /// True for errors caused by malformed caller input rather than the
    /// environment.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            MaestroError::InvalidPort { .. } | MaestroError::IncomparableCoordinates { .. }
        )
    }

    pub fn from_io_error(e: std::io::Error, path: &str) -> Self {
        MaestroError::ConfigIo {
            path: path.to_string(),
            reason: e.to_string(),
        }
    }

    pub fn from_encoding_error(e: impl fmt::Display, context: &str) -> Self {
        MaestroError::Encoding {
            context: context.to_string(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MaestroError::InvalidPort {
            hostname: "db1".to_string(),
            port: "x".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid port 'x' for host 'db1'");
    }

    #[test]
    fn test_error_classification() {
        let error = MaestroError::InvalidPort {
            hostname: "db1".to_string(),
            port: "-1".to_string(),
        };
        assert!(error.is_invalid_input());

        let error = MaestroError::ConfigIo {
            path: "/etc/maestro.json".to_string(),
            reason: "missing".to_string(),
        };
        assert!(!error.is_invalid_input());
    }
}
