//! Error-translating facade over the node manager
//!
//! Every call runs inside a transaction: the caller's when one is bound to
//! the thread, otherwise an implicit one that is committed on success and
//! aborted on failure. Not-found results become `None` or empty values;
//! other failures are logged and wrapped into a persistence error naming
//! the operation.

use crate::core::{Error, Result};
use crate::manager::NodeManager;
use crate::mapping::{DbMapping, Key, Relation};
use crate::node::NodeRef;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Transaction started for a single call
struct ImplicitTransaction<'a> {
    nmgr: &'a NodeManager,
    active: bool,
}

impl<'a> ImplicitTransaction<'a> {
    /// Start a transaction unless the thread already has one
    fn begin(nmgr: &'a NodeManager) -> Result<Self> {
        let active = !nmgr.has_transaction();
        if active {
            nmgr.begin()?;
        }
        Ok(Self { nmgr, active })
    }

    fn commit(mut self) -> Result<()> {
        if self.active {
            self.active = false;
            self.nmgr.commit()?;
        }
        Ok(())
    }

    fn abort(mut self) {
        self.abort_active();
    }

    fn abort_active(&mut self) {
        if self.active {
            self.active = false;
            if let Err(e) = self.nmgr.abort() {
                warn!(error = %e, "Could not abort implicit transaction");
            }
        }
    }
}

impl Drop for ImplicitTransaction<'_> {
    fn drop(&mut self) {
        self.abort_active();
    }
}

/// Node manager API for application code
#[derive(Debug, Clone)]
pub struct WrappedNodeManager {
    nmgr: Arc<NodeManager>,
}

impl WrappedNodeManager {
    pub fn new(nmgr: Arc<NodeManager>) -> Self {
        Self { nmgr }
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.nmgr
    }

    /// Run `f` inside a transaction, mapping not-found to `None`
    fn run<T>(&self, operation: &str, f: impl FnOnce(&NodeManager) -> Result<T>) -> Result<Option<T>> {
        let tx = ImplicitTransaction::begin(&self.nmgr).map_err(|e| Error::persistence(operation, e))?;
        match f(&self.nmgr) {
            Ok(value) => {
                tx.commit().map_err(|e| {
                    error!(operation, error = %e, "Commit of implicit transaction failed");
                    Error::persistence(operation, e)
                })?;
                Ok(Some(value))
            }
            Err(e) if e.is_not_found() => {
                tx.abort();
                debug!(operation, error = %e, "Nothing found");
                Ok(None)
            }
            Err(e) => {
                tx.abort();
                error!(operation, error = %e, "Node manager operation failed");
                Err(Error::persistence(operation, e))
            }
        }
    }

    /// Run `f` in an explicit transaction. Calls made inside join it
    /// instead of starting their own.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.nmgr.begin().map_err(|e| Error::persistence("transaction", e))?;
        match f(self) {
            Ok(value) => {
                self.nmgr.commit().map_err(|e| Error::persistence("transaction", e))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = self.nmgr.abort() {
                    warn!(error = %abort, "Could not abort transaction");
                }
                Err(e)
            }
        }
    }

    pub fn get_node(&self, key: &Key) -> Result<Option<NodeRef>> {
        self.run("getNode", |nmgr| nmgr.get_node(key))
    }

    pub fn get_node_by_id(&self, id: &str, mapping: &DbMapping) -> Result<Option<NodeRef>> {
        self.run("getNode", |nmgr| nmgr.get_node_by_id(id, mapping))
    }

    pub fn get_root_node(&self) -> Result<Option<NodeRef>> {
        self.run("getRootNode", NodeManager::get_root_node)
    }

    pub fn get_child_by_name(&self, home: &NodeRef, name: &str) -> Result<Option<NodeRef>> {
        self.run("getNode", |nmgr| nmgr.get_child_by_name(home, name))
    }

    pub fn get_parent(&self, node: &NodeRef) -> Result<Option<NodeRef>> {
        Ok(self.run("getParent", |nmgr| nmgr.get_parent(node))?.flatten())
    }

    pub fn get_nodes(&self, home: &NodeRef, rel: &Relation) -> Result<Vec<NodeRef>> {
        Ok(self.run("getNodes", |nmgr| nmgr.get_nodes(home, rel))?.unwrap_or_default())
    }

    pub fn get_node_ids(&self, home: &NodeRef, rel: &Relation) -> Result<Vec<String>> {
        Ok(self.run("getNodeIDs", |nmgr| nmgr.get_node_ids(home, rel))?.unwrap_or_default())
    }

    pub fn count_nodes(&self, home: &NodeRef, rel: &Relation) -> Result<usize> {
        Ok(self.run("countNodes", |nmgr| nmgr.count_nodes(home, rel))?.unwrap_or(0))
    }

    /// Make `node` persistent
    pub fn insert_node(&self, node: &NodeRef) -> Result<Key> {
        self.run("insertNode", |nmgr| nmgr.insert_node(node))?
            .ok_or_else(|| Error::internal("Insert returned no key"))
    }

    /// Append `child` to `home`, making it persistent when `home` is
    pub fn add_subnode(&self, home: &NodeRef, child: &NodeRef) -> Result<()> {
        self.run("addNode", |nmgr| nmgr.add_subnode(home, child)).map(|_| ())
    }

    /// Record a change of `node`
    pub fn mark_modified(&self, node: &NodeRef) -> Result<()> {
        self.run("updateNode", |nmgr| nmgr.mark_modified(node)).map(|_| ())
    }

    /// Delete `node`; deleting a missing node succeeds
    pub fn delete_node(&self, node: &NodeRef) -> Result<()> {
        self.run("deleteNode", |nmgr| nmgr.delete_node(node)).map(|_| ())
    }

    /// New id for objects of `mapping`, or an embedded id
    pub fn generate_id(&self, mapping: Option<&DbMapping>) -> Result<String> {
        let registry = self.nmgr.registry().clone();
        self.run("generateID", |nmgr| match mapping {
            Some(mapping) => nmgr.new_id(mapping),
            None => nmgr.new_id(&registry.mapping_for(None)),
        })?
        .ok_or_else(|| Error::internal("No id generated"))
    }

    pub fn register_node(&self, node: &NodeRef) -> Result<()> {
        self.nmgr.register_node(node)
    }

    pub fn evict_node(&self, node: &NodeRef) {
        self.nmgr.evict_node(node)
    }

    pub fn evict_key(&self, key: &Key) -> Option<NodeRef> {
        self.nmgr.evict_key(key)
    }
}
