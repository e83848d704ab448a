//! Cache-safe node references
//!
//! A [`NodeHandle`] points at a node either directly (transient nodes) or
//! through its [`Key`] (persistent nodes), never both. Once the node cell
//! receives its key the handle drops the direct reference the next time it
//! is used, so a persistent handle never pins an evicted node in memory.

use crate::core::Result;
use crate::mapping::Key;
use crate::node::node::NodeRef;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Lookup of persistent nodes by key
pub trait NodeResolver {
    /// Node stored under `key`, None if there is none
    fn resolve(&self, key: &Key) -> Result<Option<NodeRef>>;
}

#[derive(Clone)]
enum HandleState {
    Transient(NodeRef),
    Persistent(Key),
}

/// Reference to a node that survives cache eviction
pub struct NodeHandle {
    state: RwLock<HandleState>,
}

impl NodeHandle {
    /// Handle for a node cell; persistent if the cell already has a key
    pub fn for_node(node: &NodeRef) -> Self {
        let state = match node.key() {
            Some(key) => HandleState::Persistent(key.clone()),
            None => HandleState::Transient(node.clone()),
        };
        Self {
            state: RwLock::new(state),
        }
    }

    /// Handle for the node stored under `key`
    pub fn persistent(key: Key) -> Self {
        Self {
            state: RwLock::new(HandleState::Persistent(key)),
        }
    }

    /// Current representation, switching to the key if the node became
    /// persistent in the meantime
    fn snapshot(&self) -> HandleState {
        {
            let state = self.state.read();
            match &*state {
                HandleState::Transient(node) if node.is_persistent() => {}
                other => return other.clone(),
            }
        }
        self.become_persistent();
        self.state.read().clone()
    }

    /// Drop the direct reference if the node has a key. Idempotent; a
    /// persistent handle never turns transient again. Returns whether the
    /// handle is persistent afterwards.
    pub fn become_persistent(&self) -> bool {
        let mut state = self.state.write();
        let key = match &*state {
            HandleState::Persistent(_) => return true,
            HandleState::Transient(node) => node.key().cloned(),
        };
        match key {
            Some(key) => {
                *state = HandleState::Persistent(key);
                true
            }
            None => false,
        }
    }

    /// Whether the handle holds the node directly, so no fetch is needed
    pub fn has_node(&self) -> bool {
        matches!(self.snapshot(), HandleState::Transient(_))
    }

    pub fn is_persistent(&self) -> bool {
        !self.has_node()
    }

    /// Key of a persistent node
    pub fn key(&self) -> Option<Key> {
        match self.snapshot() {
            HandleState::Persistent(key) => Some(key),
            HandleState::Transient(_) => None,
        }
    }

    /// Id of the referenced node
    pub fn id(&self) -> String {
        match self.snapshot() {
            HandleState::Persistent(key) => key.id(),
            HandleState::Transient(node) => node.id(),
        }
    }

    /// The node, fetched through `resolver` if only the key is held
    pub fn get_node(&self, resolver: &dyn NodeResolver) -> Result<Option<NodeRef>> {
        match self.snapshot() {
            HandleState::Transient(node) => Ok(Some(node)),
            HandleState::Persistent(key) => resolver.resolve(&key),
        }
    }

    /// Whether this handle refers to `node`
    pub fn refers_to(&self, node: &NodeRef) -> bool {
        match self.snapshot() {
            HandleState::Transient(own) => Arc::ptr_eq(&own, node),
            HandleState::Persistent(key) => node.key() == Some(&key),
        }
    }
}

impl Clone for NodeHandle {
    fn clone(&self) -> Self {
        Self {
            state: RwLock::new(self.snapshot()),
        }
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match (self.snapshot(), other.snapshot()) {
            (HandleState::Transient(a), HandleState::Transient(b)) => Arc::ptr_eq(&a, &b),
            (HandleState::Persistent(a), HandleState::Persistent(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&NodeRef> for NodeHandle {
    fn from(node: &NodeRef) -> Self {
        NodeHandle::for_node(node)
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.snapshot() {
            HandleState::Transient(node) => write!(f, "NodeHandle(transient {})", node.id()),
            HandleState::Persistent(key) => write!(f, "NodeHandle({})", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Interner;
    use crate::node::node::{Node, SharedNode};
    use std::collections::HashMap;

    struct MapResolver(HashMap<Key, NodeRef>);

    impl NodeResolver for MapResolver {
        fn resolve(&self, key: &Key) -> Result<Option<NodeRef>> {
            Ok(self.0.get(key).cloned())
        }
    }

    #[test]
    fn test_transient_handle_equality_is_identity() {
        let a = SharedNode::new(Node::transient(None, None));
        let b = SharedNode::new(Node::transient(None, None));
        assert_eq!(a.handle(), a.handle());
        assert_ne!(a.handle(), b.handle());
        assert!(a.handle().has_node());
    }

    #[test]
    fn test_promotion_is_observed_by_outstanding_handles() {
        let interner = Interner::new();
        let cell = SharedNode::new(Node::transient(None, None));
        let handle = cell.handle();
        let copy = handle.clone();
        assert!(handle.has_node());
        assert!(!handle.become_persistent());

        let key = Key::db(interner.intern("HopObject"), "12");
        cell.become_persistent(key.clone());

        assert!(!copy.has_node());
        assert_eq!(copy.key(), Some(key.clone()));
        assert!(handle.become_persistent());
        assert!(handle.become_persistent());
        assert_eq!(handle, NodeHandle::persistent(key));
        assert_eq!(handle, copy);
    }

    #[test]
    fn test_mixed_flavors_are_not_equal() {
        let interner = Interner::new();
        let key = Key::db(interner.intern("HopObject"), "3");
        let transient = SharedNode::new(Node::transient(None, None));
        assert_ne!(transient.handle(), NodeHandle::persistent(key));
    }

    #[test]
    fn test_get_node_through_resolver() {
        let interner = Interner::new();
        let key = Key::db(interner.intern("HopObject"), "43");
        let cell = SharedNode::persistent(Node::with_id("43", None), key.clone());
        let resolver = MapResolver([(key.clone(), cell.clone())].into_iter().collect());

        let handle = NodeHandle::persistent(key);
        assert!(!handle.has_node());
        let node = handle.get_node(&resolver).unwrap().unwrap();
        assert!(Arc::ptr_eq(&node, &cell));
        assert_eq!(handle.id(), "43");
        assert!(handle.refers_to(&cell));

        let missing = NodeHandle::persistent(Key::db(interner.intern("HopObject"), "44"));
        assert!(missing.get_node(&resolver).unwrap().is_none());
    }
}
