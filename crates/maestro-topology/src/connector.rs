//! The live-server surface.
//!
//! The prober and the replication-control operations talk to topology servers
//! through these traits. Any transport (a MySQL driver, a proxy, the in-tree
//! simulator) implements them; the SQL text itself is owned by the callers,
//! which issue the statements verbatim.

use async_trait::async_trait;

use crate::TopologyError;
use maestro::InstanceKey;

/// A single cell of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Int(i64),
    Text(String),
}

/// One result row: ordered column name/value pairs.
///
/// Accessors are forgiving the way probing wants them to be: a missing column
/// or a type mismatch yields the zero value, and nullable integers surface as
/// `Option`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowMap {
    columns: Vec<(String, RowValue)>,
}

impl RowMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.columns
            .push((name.to_string(), RowValue::Text(value.into())));
        self
    }

    pub fn with_int(mut self, name: &str, value: i64) -> Self {
        self.columns.push((name.to_string(), RowValue::Int(value)));
        self
    }

    pub fn with_null(mut self, name: &str) -> Self {
        self.columns.push((name.to_string(), RowValue::Null));
        self
    }

    fn value(&self, name: &str) -> Option<&RowValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn get_string(&self, name: &str) -> String {
        match self.value(name) {
            Some(RowValue::Text(s)) => s.clone(),
            Some(RowValue::Int(i)) => i.to_string(),
            _ => String::new(),
        }
    }

    pub fn get_string_or(&self, name: &str, default: &str) -> String {
        match self.value(name) {
            Some(RowValue::Text(s)) => s.clone(),
            Some(RowValue::Int(i)) => i.to_string(),
            _ => default.to_string(),
        }
    }

    pub fn get_i64(&self, name: &str) -> i64 {
        match self.value(name) {
            Some(RowValue::Int(i)) => *i,
            Some(RowValue::Text(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn get_i64_or(&self, name: &str, default: i64) -> i64 {
        match self.value(name) {
            Some(RowValue::Int(i)) => *i,
            Some(RowValue::Text(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_u32(&self, name: &str) -> u32 {
        u32::try_from(self.get_i64(name)).unwrap_or(0)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        match self.value(name) {
            Some(RowValue::Int(i)) => *i != 0,
            Some(RowValue::Text(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn get_null_i64(&self, name: &str) -> Option<i64> {
        match self.value(name) {
            Some(RowValue::Int(i)) => Some(*i),
            Some(RowValue::Text(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// The first column's value, for single-value statements whose column name
    /// is not under our control (the operator-supplied lag query).
    pub fn first_null_i64(&self) -> Option<i64> {
        match self.columns.first() {
            Some((_, RowValue::Int(i))) => Some(*i),
            Some((_, RowValue::Text(s))) => s.parse().ok(),
            _ => None,
        }
    }
}

/// An open session against one topology server.
#[async_trait]
pub trait TopologyConnection: Send + Sync {
    /// Run a result-producing statement.
    async fn query(&self, statement: &str) -> Result<Vec<RowMap>, TopologyError>;

    /// Run a statement for its side effect.
    async fn exec(&self, statement: &str) -> Result<(), TopologyError>;

    /// Run a statement expected to produce at least one row.
    async fn query_row(&self, statement: &str) -> Result<RowMap, TopologyError> {
        self.query(statement)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TopologyError::QueryFailed {
                context: statement.to_string(),
                reason: "statement returned no rows".to_string(),
            })
    }
}

/// Opens sessions against topology servers by instance key.
#[async_trait]
pub trait TopologyConnector: Send + Sync {
    async fn connect(
        &self,
        key: &InstanceKey,
    ) -> Result<Box<dyn TopologyConnection>, TopologyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_map_accessors() {
        let row = RowMap::new()
            .with_text("Slave_IO_Running", "Yes")
            .with_int("Read_Master_Log_Pos", 4096)
            .with_null("Seconds_Behind_Master")
            .with_int("Auto_Position", 1);

        assert_eq!(row.get_string("Slave_IO_Running"), "Yes");
        assert_eq!(row.get_i64("Read_Master_Log_Pos"), 4096);
        assert_eq!(row.get_null_i64("Seconds_Behind_Master"), None);
        assert!(row.get_bool("Auto_Position"));
    }

    #[test]
    fn test_row_map_missing_columns_yield_zero_values() {
        let row = RowMap::new();
        assert_eq!(row.get_string("nope"), "");
        assert_eq!(row.get_string_or("Using_Gtid", "No"), "No");
        assert_eq!(row.get_i64("nope"), 0);
        assert_eq!(row.get_i64_or("Auto_Position", 7), 7);
        assert!(!row.get_bool("nope"));
        assert_eq!(row.get_null_i64("nope"), None);
    }

    #[test]
    fn test_first_column_accessor() {
        let row = RowMap::new().with_int("whatever_alias", 12);
        assert_eq!(row.first_null_i64(), Some(12));

        let row = RowMap::new().with_null("lag");
        assert_eq!(row.first_null_i64(), None);

        assert_eq!(RowMap::new().first_null_i64(), None);
    }

    #[test]
    fn test_numeric_text_coercion() {
        let row = RowMap::new().with_text("server_id", "101");
        assert_eq!(row.get_u32("server_id"), 101);
        assert_eq!(row.get_i64("server_id"), 101);
    }
}
