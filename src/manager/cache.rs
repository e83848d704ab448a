//! Two-generation node cache
//!
//! New entries go into the young generation. When it reaches half the
//! capacity it becomes the old generation and the previous old generation
//! is dropped. A hit in the old generation moves the entry back into the
//! young one, so nodes in use survive rotation.

use crate::mapping::Key;
use crate::node::NodeRef;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;
use tracing::trace;

#[derive(Default)]
struct Generations {
    young: HashMap<Key, NodeRef>,
    old: HashMap<Key, NodeRef>,
}

impl Generations {
    fn rotate_if_full(&mut self, threshold: usize) {
        if self.young.len() >= threshold {
            self.old = mem::take(&mut self.young);
            trace!(kept = self.old.len(), "Rotated node cache");
        }
    }
}

/// Node cache keyed by [`Key`]
pub struct NodeCache {
    generations: Mutex<Generations>,
    capacity: usize,
}

impl NodeCache {
    /// Cache holding roughly `capacity` nodes across both generations
    pub fn new(capacity: usize) -> Self {
        Self {
            generations: Mutex::new(Generations::default()),
            capacity: capacity.max(2),
        }
    }

    fn threshold(&self) -> usize {
        self.capacity / 2
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached node, promoting it out of the old generation
    pub fn get(&self, key: &Key) -> Option<NodeRef> {
        let mut gens = self.generations.lock();
        if let Some(node) = gens.young.get(key) {
            return Some(node.clone());
        }
        let node = gens.old.remove(key)?;
        gens.young.insert(key.clone(), node.clone());
        gens.rotate_if_full(self.threshold());
        Some(node)
    }

    /// Store `node`, returning the node previously cached under `key`
    pub fn put(&self, key: Key, node: NodeRef) -> Option<NodeRef> {
        let mut gens = self.generations.lock();
        let previous = gens.old.remove(&key);
        let previous = gens.young.insert(key, node).or(previous);
        gens.rotate_if_full(self.threshold());
        previous
    }

    /// Cached node under `key`, or `node` after storing it
    pub fn get_or_insert(&self, key: Key, node: NodeRef) -> NodeRef {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        let mut gens = self.generations.lock();
        if let Some(existing) = gens.young.get(&key) {
            return existing.clone();
        }
        gens.young.insert(key, node.clone());
        gens.rotate_if_full(self.threshold());
        node
    }

    pub fn remove(&self, key: &Key) -> Option<NodeRef> {
        let mut gens = self.generations.lock();
        let young = gens.young.remove(key);
        let old = gens.old.remove(key);
        young.or(old)
    }

    pub fn contains(&self, key: &Key) -> bool {
        let gens = self.generations.lock();
        gens.young.contains_key(key) || gens.old.contains_key(key)
    }

    /// Number of cached nodes in both generations
    pub fn len(&self) -> usize {
        let gens = self.generations.lock();
        gens.young.len() + gens.old.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut gens = self.generations.lock();
        gens.young.clear();
        gens.old.clear();
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
