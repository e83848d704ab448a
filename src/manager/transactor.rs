//! Per-thread transactions
//!
//! A [`Transactor`] is bound to the calling thread for one store. It
//! collects the nodes changed while it is active and writes them to their
//! backends on commit: one database transaction per relational source plus
//! one XML transaction for embedded nodes.

use crate::core::{Error, Result};
use crate::manager::NodeManager;
use crate::mapping::DbMapping;
use crate::node::{NodeRef, NodeState};
use crate::storage::{CommitOutcome, DbSource, Transaction};
use crate::system::Timer;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

thread_local! {
    static BOUND: RefCell<HashMap<u64, Transactor>> = RefCell::new(HashMap::new());
}

/// Changes of one thread against one store
pub struct Transactor {
    store_id: u64,
    dirty: Vec<NodeRef>,
    seen: HashSet<usize>,
    started: Instant,
}

impl Transactor {
    pub(crate) fn new(store_id: u64) -> Self {
        Self {
            store_id,
            dirty: Vec::new(),
            seen: HashSet::new(),
            started: Instant::now(),
        }
    }

    /// Bind to the current thread. Fails if a transaction for the same
    /// store is already bound.
    pub(crate) fn bind(self) -> Result<()> {
        BOUND.with(|bound| {
            let mut bound = bound.borrow_mut();
            if bound.contains_key(&self.store_id) {
                return Err(Error::transaction("Transaction already active on this thread"));
            }
            debug!(store = self.store_id, "Transaction started");
            bound.insert(self.store_id, self);
            Ok(())
        })
    }

    /// Remove the transaction of `store_id` from the current thread
    pub(crate) fn unbind(store_id: u64) -> Option<Transactor> {
        BOUND.with(|bound| bound.borrow_mut().remove(&store_id))
    }

    /// Whether the current thread has a transaction for `store_id`
    pub fn is_bound(store_id: u64) -> bool {
        BOUND.with(|bound| bound.borrow().contains_key(&store_id))
    }

    /// Run `f` on the bound transaction of `store_id`, if any
    pub(crate) fn with_bound<R>(store_id: u64, f: impl FnOnce(&mut Transactor) -> R) -> Option<R> {
        BOUND.with(|bound| bound.borrow_mut().get_mut(&store_id).map(f))
    }

    /// Record a changed node. Each node is recorded once.
    pub fn visit_dirty(&mut self, node: &NodeRef) {
        if self.seen.insert(Arc::as_ptr(node) as usize) {
            self.dirty.push(node.clone());
        }
    }

    pub fn dirty_nodes(&self) -> &[NodeRef] {
        &self.dirty
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Write all recorded changes.
    ///
    /// Relational sources are committed first. If staging or a source
    /// commit fails, every source is rolled back, the temp files are
    /// discarded and the changed nodes are evicted. Failures of single
    /// XML renames don't fail the commit; they show up in the outcome and
    /// the affected nodes are evicted so the next access reloads them.
    pub fn commit(mut self, nmgr: &NodeManager) -> Result<CommitOutcome> {
        let timer = Timer::start(&nmgr.metrics().transactions.commit_duration);
        let nodes = std::mem::take(&mut self.dirty);
        let mut plan = CommitPlan::new(nmgr);

        if let Err(e) = plan.stage(&nodes) {
            error!(error = %e, nodes = nodes.len(), "Transaction failed, rolling back");
            plan.rollback();
            discard(nmgr, &nodes);
            nmgr.metrics().transactions.aborted.inc();
            return Err(e);
        }
        if let Err(e) = plan.commit_sources() {
            error!(error = %e, "Database commit failed, rolling back");
            plan.rollback();
            discard(nmgr, &nodes);
            nmgr.metrics().transactions.aborted.inc();
            return Err(e);
        }

        let CommitPlan {
            xml, embedded, touched, ..
        } = plan;
        let outcome = match xml {
            Some(tx) => nmgr.database().commit_transaction(tx),
            None => nmgr.database().commit_transaction(nmgr.database().begin_transaction()),
        };

        let failed: HashSet<&PathBuf> = outcome
            .failed_writes
            .iter()
            .map(|f| &f.target)
            .chain(outcome.failed_deletes.iter())
            .collect();
        let failed_nodes: HashSet<usize> = embedded
            .iter()
            .filter(|(_, path)| failed.contains(path))
            .map(|(node, _)| Arc::as_ptr(node) as usize)
            .collect();

        for node in &nodes {
            let state = node.read().state();
            if failed_nodes.contains(&(Arc::as_ptr(node) as usize)) {
                nmgr.evict_node(node);
                node.write().set_state(NodeState::Invalid);
                continue;
            }
            match state {
                NodeState::Deleted => {
                    nmgr.evict_node(node);
                    node.write().set_state(NodeState::Invalid);
                    nmgr.metrics().nodes.deleted.inc();
                }
                NodeState::New | NodeState::Modified => {
                    node.write().set_state(NodeState::Clean);
                    nmgr.metrics().nodes.written.inc();
                }
                _ => {}
            }
        }
        for mapping in touched {
            mapping.set_last_data_change();
        }

        if !outcome.is_clean() {
            warn!(
                failed_writes = outcome.failed_writes.len(),
                failed_deletes = outcome.failed_deletes.len(),
                idgen = outcome.idgen_error.as_deref().unwrap_or("ok"),
                "Transaction committed with failures"
            );
        }
        nmgr.metrics().transactions.committed.inc();
        timer.finish();
        info!(
            nodes = nodes.len(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Transaction committed"
        );
        Ok(outcome)
    }

    /// Drop all recorded changes. The changed nodes are evicted and marked
    /// invalid so the next access sees the stored state.
    pub fn abort(mut self, nmgr: &NodeManager) {
        let nodes = std::mem::take(&mut self.dirty);
        discard(nmgr, &nodes);
        nmgr.metrics().transactions.aborted.inc();
        info!(nodes = nodes.len(), "Transaction aborted");
    }
}

impl std::fmt::Debug for Transactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactor")
            .field("store_id", &self.store_id)
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

fn discard(nmgr: &NodeManager, nodes: &[NodeRef]) {
    for node in nodes {
        nmgr.evict_node(node);
        node.write().set_state(NodeState::Invalid);
    }
}

/// Writes of one commit, grouped by backend
struct CommitPlan<'a> {
    nmgr: &'a NodeManager,
    sources: Vec<Arc<dyn DbSource>>,
    xml: Option<Transaction>,
    embedded: Vec<(NodeRef, PathBuf)>,
    touched: Vec<Arc<DbMapping>>,
}

impl<'a> CommitPlan<'a> {
    fn new(nmgr: &'a NodeManager) -> Self {
        Self {
            nmgr,
            sources: Vec::new(),
            xml: None,
            embedded: Vec::new(),
            touched: Vec::new(),
        }
    }

    fn stage(&mut self, nodes: &[NodeRef]) -> Result<()> {
        for node in nodes {
            let state = node.read().state();
            if !state.is_dirty() {
                continue;
            }
            let mapping = self.nmgr.mapping_of(node);
            if mapping.is_relational() {
                let source = self.source(&mapping)?;
                self.nmgr.write_row(node, state, &mapping, source.as_ref())?;
                if !self.touched.iter().any(|m| Arc::ptr_eq(m, &mapping)) {
                    self.touched.push(mapping);
                }
            } else {
                self.stage_embedded(node, state)?;
            }
        }
        Ok(())
    }

    fn source(&mut self, mapping: &DbMapping) -> Result<Arc<dyn DbSource>> {
        let source = self.nmgr.registry().source_for(mapping)?;
        if !self.sources.iter().any(|s| s.name() == source.name()) {
            source.begin()?;
            self.sources.push(source.clone());
        }
        Ok(source)
    }

    fn stage_embedded(&mut self, node: &NodeRef, state: NodeState) -> Result<()> {
        let db = self.nmgr.database();
        let id = node.id();
        let path = db.node_path(&id)?;
        let tx = self.xml.get_or_insert_with(|| db.begin_transaction());
        match state {
            NodeState::Deleted => db.delete_node(tx, &id)?,
            NodeState::New => {
                let record = self.nmgr.node_record(node);
                db.insert_node(tx, &record)?;
            }
            _ => {
                let record = self.nmgr.node_record(node);
                db.update_node(tx, &record)?;
            }
        }
        self.embedded.push((node.clone(), path));
        Ok(())
    }

    fn commit_sources(&mut self) -> Result<()> {
        while !self.sources.is_empty() {
            let source = self.sources.remove(0);
            if let Err(e) = source.commit() {
                // already committed sources can't be undone
                error!(source = source.name(), error = %e, "Commit of data source failed");
                if let Err(e) = source.rollback() {
                    warn!(source = source.name(), error = %e, "Rollback failed");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn rollback(&mut self) {
        for source in self.sources.drain(..) {
            if let Err(e) = source.rollback() {
                warn!(source = source.name(), error = %e, "Rollback failed");
            }
        }
        if let Some(tx) = self.xml.take() {
            self.nmgr.database().abort_transaction(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, SharedNode};

    #[test]
    fn test_bind_is_per_store_and_thread() {
        assert!(!Transactor::is_bound(9001));
        Transactor::new(9001).bind().unwrap();
        assert!(Transactor::is_bound(9001));
        assert!(!Transactor::is_bound(9002));
        assert!(Transactor::new(9001).bind().is_err());

        let other = std::thread::spawn(|| Transactor::is_bound(9001)).join().unwrap();
        assert!(!other);

        assert!(Transactor::unbind(9001).is_some());
        assert!(!Transactor::is_bound(9001));
    }

    #[test]
    fn test_dirty_nodes_recorded_once() {
        let node = SharedNode::new(Node::transient(None, None));
        let mut tx = Transactor::new(9003);
        tx.visit_dirty(&node);
        tx.visit_dirty(&node);
        tx.visit_dirty(&SharedNode::new(Node::transient(None, None)));
        assert_eq!(tx.dirty_count(), 2);
    }
}
