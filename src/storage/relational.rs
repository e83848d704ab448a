//! Relational data source seam
//!
//! Mappings with a `_db` setting read and write rows through a [`DbSource`].
//! The crate ships no driver; applications register their own
//! implementation under the name the mappings refer to.

use crate::core::{Result, Timestamp};
use crate::mapping::column::DbColumn;
use crate::mapping::joins::{JoinRenderer, LegacyOuterJoins, StandardJoins};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL dialect of a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// ANSI joins, LIMIT/OFFSET, `nextval('seq')`
    #[default]
    Standard,
    /// `(+)` outer joins, ROWNUM pagination, `seq.nextval FROM DUAL`
    Oracle,
}

static STANDARD_JOINS: StandardJoins = StandardJoins;
static LEGACY_JOINS: LegacyOuterJoins = LegacyOuterJoins;

impl Dialect {
    /// Parse a dialect name as used in configuration and on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "standard" | "ansi" | "mysql" | "postgresql" | "postgres" | "h2" => {
                Some(Dialect::Standard)
            }
            "oracle" => Some(Dialect::Oracle),
            _ => None,
        }
    }

    /// Join rendering strategy
    pub fn join_renderer(self) -> &'static dyn JoinRenderer {
        match self {
            Dialect::Standard => &STANDARD_JOINS,
            Dialect::Oracle => &LEGACY_JOINS,
        }
    }

    /// Restrict `sql` to `limit` rows starting at `offset`
    pub fn paginate(self, sql: &str, offset: usize, limit: Option<usize>) -> String {
        match self {
            Dialect::Standard => {
                let mut out = sql.to_string();
                if let Some(limit) = limit {
                    out.push_str(&format!(" LIMIT {}", limit));
                }
                if offset > 0 {
                    out.push_str(&format!(" OFFSET {}", offset));
                }
                out
            }
            Dialect::Oracle => {
                if offset == 0 && limit.is_none() {
                    return sql.to_string();
                }
                let upper = limit.map(|l| format!(" WHERE ROWNUM <= {}", offset + l));
                format!(
                    "SELECT * FROM (SELECT _HLM_q.*, ROWNUM _HLM_rnum FROM ({}) _HLM_q{}) WHERE _HLM_rnum > {}",
                    sql,
                    upper.unwrap_or_default(),
                    offset
                )
            }
        }
    }

    /// Statement fetching the next value of a sequence
    pub fn sequence_next(self, sequence: &str) -> String {
        match self {
            Dialect::Standard => format!("SELECT nextval('{}')", sequence),
            Dialect::Oracle => format!("SELECT {}.nextval FROM DUAL", sequence),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Standard => f.write_str("standard"),
            Dialect::Oracle => f.write_str("oracle"),
        }
    }
}

/// Value bound to a statement parameter or read from a row
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(Timestamp),
}

impl SqlValue {
    /// Textual form, None for NULL
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Integer(i) => Some(i.to_string()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Boolean(b) => Some(if *b { "1" } else { "0" }.to_string()),
            SqlValue::Timestamp(ts) => Some(ts.timestamp_millis().to_string()),
        }
    }

    /// Integral value if the value is numeric
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Float(f) => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// One result row. Columns of joined tables are labelled `<alias>.<COLUMN>`,
/// columns of the main table carry their plain name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style column append
    pub fn with(mut self, label: impl Into<String>, value: SqlValue) -> Self {
        self.columns.push((label.into(), value));
        self
    }

    /// Append a column
    pub fn push(&mut self, label: impl Into<String>, value: SqlValue) {
        self.columns.push((label.into(), value));
    }

    /// Value of a column, matched ignoring case
    pub fn get(&self, label: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(l, _)| l.eq_ignore_ascii_case(label))
            .map(|(_, v)| v)
    }

    /// Value of column `column` of the table joined as `alias`
    pub fn get_joined(&self, alias: &str, column: &str) -> Option<&SqlValue> {
        self.get(&format!("{}.{}", alias, column))
    }

    /// Value at position `index`
    pub fn value_at(&self, index: usize) -> Option<&SqlValue> {
        self.columns.get(index).map(|(_, v)| v)
    }

    /// Iterate over (label, value) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(l, v)| (l.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Relational database reachable under a name
pub trait DbSource: Send + Sync {
    /// Name mappings use in their `_db` setting
    fn name(&self) -> &str;

    /// Dialect used to render statements for this source
    fn dialect(&self) -> Dialect {
        Dialect::Standard
    }

    /// Run a query
    fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Run a statement with positional `?` parameters, returning the
    /// number of affected rows
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Column metadata of `table`
    fn columns(&self, table: &str) -> Result<Vec<DbColumn>>;

    fn begin(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn DbSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DbSource({}, {})", self.name(), self.dialect())
    }
}
