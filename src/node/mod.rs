//! Nodes, node handles and child lists

pub mod handle;
#[allow(clippy::module_inception)]
pub mod node;
pub mod property;
pub mod subnodes;

pub use handle::{NodeHandle, NodeResolver};
pub use node::{Node, NodeRef, NodeState, SharedNode};
pub use property::{Property, Value, ValueType};
pub use subnodes::{Loader, Segment, SegmentedSubnodeList, SubnodeSource, DEFAULT_SEGMENT_LENGTH};
