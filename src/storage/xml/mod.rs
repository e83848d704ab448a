//! Embedded XML database
//!
//! Stores every node as one XML file below a database home directory and
//! commits changes by renaming complete temp files into place.

pub mod database;
pub mod idgen;
pub mod reader;
pub mod record;
pub mod transaction;
pub mod writer;

pub use database::{XmlDatabase, IDGEN_FILE, ROOT_ID, STYLESHEET_FILE, USER_ROOT_ID};
pub use idgen::XmlIdGenerator;
pub use reader::read_node;
pub use record::{NodeLink, NodeRecord, RecordValue};
pub use transaction::{replace_file, CommitOutcome, FailedWrite, Transaction};
pub use writer::{write_node, HOP_NAMESPACE};
