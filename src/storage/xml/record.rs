//! Plain node data as stored in one XML file

use crate::core::Timestamp;
use crate::node::Value;

/// Reference to another stored node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub id: String,
    pub prototype: Option<String>,
}

impl NodeLink {
    pub fn new(id: impl Into<String>, prototype: Option<&str>) -> Self {
        Self {
            id: id.into(),
            prototype: prototype.map(str::to_string),
        }
    }
}

/// Stored property value
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    /// Any value except a node reference
    Scalar(Value),
    Reference(NodeLink),
}

/// Contents of one `<id>.xml` file
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    pub name: Option<String>,
    pub prototype: Option<String>,
    pub created: Timestamp,
    pub last_modified: Timestamp,
    /// Properties in file order, names with their original spelling
    pub properties: Vec<(String, RecordValue)>,
    pub children: Vec<NodeLink>,
    pub parent: Option<NodeLink>,
}

impl NodeRecord {
    /// Empty record stamped with the current time
    pub fn new(id: impl Into<String>, prototype: Option<&str>) -> Self {
        let ts = crate::core::types::now();
        Self {
            id: id.into(),
            name: None,
            prototype: prototype.map(str::to_string),
            created: ts,
            last_modified: ts,
            properties: Vec::new(),
            children: Vec::new(),
            parent: None,
        }
    }

    /// Property by name, ignoring case
    pub fn property(&self, name: &str) -> Option<&RecordValue> {
        self.properties
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}
