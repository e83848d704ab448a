//! Persistent objects
//!
//! A [`Node`] is one stored object. Nodes live in a [`SharedNode`] cell;
//! the cell also carries the node's key once it has been made persistent.
//! The key is set exactly once and never removed again, which is what
//! lets outstanding [`NodeHandle`]s switch from the cell to the key.

use crate::core::types::now;
use crate::core::Timestamp;
use crate::mapping::{DbMapping, Key};
use crate::node::handle::NodeHandle;
use crate::node::property::{Property, Value};
use crate::node::subnodes::SegmentedSubnodeList;
use once_cell::sync::OnceCell;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static TRANSIENT_IDS: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Created in memory, never stored
    Transient,
    /// Exists only as child of another node (group or mount point)
    Virtual,
    /// Made persistent, not yet written
    New,
    /// Matches the stored version
    Clean,
    /// Changed since it was loaded
    Modified,
    /// Marked for removal
    Deleted,
    /// Stale, must be reloaded
    Invalid,
}

impl NodeState {
    /// Whether the node has pending changes for the next commit
    pub fn is_dirty(self) -> bool {
        matches!(self, NodeState::New | NodeState::Modified | NodeState::Deleted)
    }
}

/// One stored object
pub struct Node {
    id: String,
    name: Option<String>,
    prototype: Option<String>,
    created: Timestamp,
    last_modified: Timestamp,
    state: NodeState,
    // lowercase name -> property
    properties: BTreeMap<String, Property>,
    subnodes: Arc<SegmentedSubnodeList>,
    parent: Option<NodeHandle>,
    mapping: Option<Arc<DbMapping>>,
}

impl Node {
    /// Create a transient node with a process-unique temporary id
    pub fn transient(name: Option<&str>, prototype: Option<&str>) -> Self {
        let n = TRANSIENT_IDS.fetch_add(1, Ordering::Relaxed) + 1;
        let mut node = Self::with_id(format!("t{}", n), prototype);
        node.name = name.map(str::to_string);
        node.state = NodeState::Transient;
        node
    }

    /// Create a node with a known id, as done when loading it
    pub fn with_id(id: impl Into<String>, prototype: Option<&str>) -> Self {
        let ts = now();
        Self {
            id: id.into(),
            name: None,
            prototype: prototype.map(str::to_string),
            created: ts,
            last_modified: ts,
            state: NodeState::Clean,
            properties: BTreeMap::new(),
            subnodes: Arc::new(SegmentedSubnodeList::simple()),
            parent: None,
            mapping: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the id, used when a transient node is made persistent
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Name, falling back to the id
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Explicitly set name
    pub fn raw_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<&str>) {
        self.name = name.map(str::to_string);
        self.touch();
    }

    pub fn prototype(&self) -> Option<&str> {
        self.prototype.as_deref()
    }

    pub fn set_prototype(&mut self, prototype: Option<&str>) {
        self.prototype = prototype.map(str::to_string);
        self.touch();
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    /// Restore stored timestamps
    pub fn set_timestamps(&mut self, created: Timestamp, last_modified: Timestamp) {
        self.created = created;
        self.last_modified = last_modified;
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    /// Mapping the node is stored through
    pub fn mapping(&self) -> Option<&Arc<DbMapping>> {
        self.mapping.as_ref()
    }

    pub fn set_mapping(&mut self, mapping: Option<Arc<DbMapping>>) {
        self.mapping = mapping;
    }

    pub fn parent(&self) -> Option<&NodeHandle> {
        self.parent.as_ref()
    }

    pub fn set_parent(&mut self, parent: Option<NodeHandle>) {
        self.parent = parent;
    }

    /// Child list. Don't call list operations while holding this node's
    /// write lock: loading a segment reads the node.
    pub fn subnodes(&self) -> Arc<SegmentedSubnodeList> {
        self.subnodes.clone()
    }

    pub fn set_subnodes(&mut self, list: SegmentedSubnodeList) {
        self.subnodes = Arc::new(list);
    }

    /// Mark the node changed
    pub fn touch(&mut self) {
        self.last_modified = now();
        if self.state == NodeState::Clean {
            self.state = NodeState::Modified;
        }
    }

    /// Property by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.get(&name.to_lowercase())
    }

    /// Value of a property
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.get(name).map(Property::value)
    }

    /// Text rendering of a property value
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.value(name).map(Value::to_string)
    }

    pub fn get_integer(&self, name: &str) -> Option<i64> {
        self.value(name).and_then(Value::as_integer)
    }

    /// Set a property and mark the node changed
    pub fn set(&mut self, name: &str, value: Value) {
        self.put(name, value);
        self.touch();
    }

    /// Set a property without touching state or timestamps, as done
    /// while loading
    pub fn put(&mut self, name: &str, value: Value) {
        match self.properties.get_mut(&name.to_lowercase()) {
            Some(prop) => prop.set_value(value),
            None => {
                self.properties
                    .insert(name.to_lowercase(), Property::new(name, value));
            }
        }
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) {
        self.set(name, Value::String(value.into()));
    }

    pub fn set_integer(&mut self, name: &str, value: i64) {
        self.set(name, Value::Integer(value));
    }

    pub fn set_float(&mut self, name: &str, value: f64) {
        self.set(name, Value::Float(value));
    }

    pub fn set_boolean(&mut self, name: &str, value: bool) {
        self.set(name, Value::Boolean(value));
    }

    pub fn set_date(&mut self, name: &str, value: Timestamp) {
        self.set(name, Value::Date(value));
    }

    pub fn set_node(&mut self, name: &str, value: NodeHandle) {
        self.set(name, Value::Node(value));
    }

    /// Remove a property, returning it
    pub fn unset(&mut self, name: &str) -> Option<Property> {
        let removed = self.properties.remove(&name.to_lowercase());
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// All properties in name order
    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("prototype", &self.prototype)
            .field("state", &self.state)
            .field("properties", &self.properties.len())
            .finish()
    }
}

/// Shared cell holding a node plus its key once persistent
pub struct SharedNode {
    node: RwLock<Node>,
    key: OnceCell<Key>,
}

/// Shared reference to a node cell
pub type NodeRef = Arc<SharedNode>;

impl SharedNode {
    /// Cell for a node without key
    pub fn new(node: Node) -> NodeRef {
        Arc::new(Self {
            node: RwLock::new(node),
            key: OnceCell::new(),
        })
    }

    /// Cell for a node loaded under `key`
    pub fn persistent(node: Node, key: Key) -> NodeRef {
        Arc::new(Self {
            node: RwLock::new(node),
            key: OnceCell::with_value(key),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.node.read()
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, Node>> {
        self.node.try_read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.node.write()
    }

    /// Key, once persistent
    pub fn key(&self) -> Option<&Key> {
        self.key.get()
    }

    pub fn is_persistent(&self) -> bool {
        self.key.get().is_some()
    }

    /// Assign the key. Only the first call has an effect; returns whether
    /// this call made the node persistent.
    pub fn become_persistent(&self, key: Key) -> bool {
        self.key.set(key).is_ok()
    }

    /// Handle for this node
    pub fn handle(self: &Arc<Self>) -> NodeHandle {
        NodeHandle::for_node(self)
    }

    /// Id of the node
    pub fn id(&self) -> String {
        self.node.read().id().to_string()
    }
}

impl fmt::Debug for SharedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedNode")
            .field("key", &self.key.get())
            .field("node", &*self.node.read())
            .finish()
    }
}
