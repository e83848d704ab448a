//! Object-relational type mappings
//!
//! Everything that describes *where* an object lives: keys, per-prototype
//! mappings, property relations, column metadata and the SQL rendered from
//! them.

pub mod column;
pub mod db_mapping;
pub mod joins;
pub mod key;
pub mod properties;
pub mod query;
pub mod registry;
pub mod relation;
pub mod sql;

pub use column::{ColumnRole, DbColumn, SqlType};
pub use db_mapping::{DbMapping, SelectStatement, HOP_OBJECT};
pub use joins::{JoinClause, JoinRenderer, LegacyOuterJoins, StandardJoins};
pub use key::{DbKey, Interner, Key, MultiKey, StorageName, SyntheticKey};
pub use properties::{FileSource, PropertySource, StaticSource, TypeProperties};
pub use query::SubnodeQuery;
pub use registry::MappingRegistry;
pub use relation::{Constraint, GroupBy, Relation, RelationKind};
pub use sql::{check_number, escape_string};
