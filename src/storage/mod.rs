//! Storage and persistence layer
//!
//! Two backends sit below the node manager: relational data sources reached
//! through the [`DbSource`] seam, and the embedded XML database that keeps
//! one file per node.

pub mod fs;
pub mod relational;
pub mod xml;

// Re-export main storage types
pub use fs::{FileOps, OsFileOps};
pub use relational::{DbSource, Dialect, Row, SqlValue};
pub use xml::{CommitOutcome, NodeLink, NodeRecord, RecordValue, Transaction, XmlDatabase, XmlIdGenerator};
