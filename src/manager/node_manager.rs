//! Node manager
//!
//! Loads nodes from the relational and embedded backends, keeps them in
//! the [`NodeCache`] and routes changes into the thread's [`Transactor`].
//! Lookups that find nothing fail with a not-found error; the
//! [`WrappedNodeManager`](super::WrappedNodeManager) turns those into
//! `None`.

use crate::core::{Error, MappingError, Result};
use crate::manager::{NodeCache, Transactor};
use crate::mapping::sql::literal;
use crate::mapping::{ColumnRole, DbColumn, DbMapping, Key, MappingRegistry, Relation, RelationKind, SqlType, SubnodeQuery, SyntheticKey};
use crate::node::{Loader, Node, NodeHandle, NodeRef, NodeResolver, NodeState, SegmentedSubnodeList, SharedNode, SubnodeSource, Value};
use crate::storage::{CommitOutcome, DbSource, NodeLink, NodeRecord, RecordValue, Row, SqlValue, XmlDatabase};
use crate::system::StoreMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

static STORE_IDS: AtomicU64 = AtomicU64::new(1);

/// Loads, caches and stores nodes of one store
pub struct NodeManager {
    id: u64,
    registry: Arc<MappingRegistry>,
    db: XmlDatabase,
    cache: NodeCache,
    metrics: Arc<StoreMetrics>,
    segment_length: usize,
}

impl NodeManager {
    pub fn new(
        registry: Arc<MappingRegistry>,
        db: XmlDatabase,
        cache_capacity: usize,
        segment_length: usize,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            id: STORE_IDS.fetch_add(1, Ordering::Relaxed),
            registry,
            db,
            cache: NodeCache::new(cache_capacity),
            metrics,
            segment_length: segment_length.max(1),
        }
    }

    /// Process-unique id of this manager, used to bind transactions
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    pub fn database(&self) -> &XmlDatabase {
        &self.db
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    // ---- transactions ----

    /// Start a transaction on the current thread
    pub fn begin(&self) -> Result<()> {
        Transactor::new(self.id).bind()
    }

    pub fn has_transaction(&self) -> bool {
        Transactor::is_bound(self.id)
    }

    /// Commit the current thread's transaction
    pub fn commit(&self) -> Result<CommitOutcome> {
        let tx = Transactor::unbind(self.id)
            .ok_or_else(|| Error::transaction("No transaction active on this thread"))?;
        tx.commit(self)
    }

    /// Abort the current thread's transaction
    pub fn abort(&self) -> Result<()> {
        let tx = Transactor::unbind(self.id)
            .ok_or_else(|| Error::transaction("No transaction active on this thread"))?;
        tx.abort(self);
        Ok(())
    }

    fn visit_dirty(&self, node: &NodeRef) -> Result<()> {
        Transactor::with_bound(self.id, |tx| tx.visit_dirty(node))
            .ok_or_else(|| Error::transaction("Changing a persistent node needs a transaction"))
    }

    // ---- cache ----

    /// Put a persistent node into the cache
    pub fn register_node(&self, node: &NodeRef) -> Result<()> {
        let key = node
            .key()
            .ok_or_else(|| Error::invalid_input("Only persistent nodes can be cached"))?;
        self.cache.put(key.clone(), node.clone());
        Ok(())
    }

    /// Drop a node from the cache
    pub fn evict_node(&self, node: &NodeRef) {
        if let Some(key) = node.key() {
            self.cache.remove(key);
        }
        node.read().subnodes().invalidate();
    }

    /// Drop whatever is cached under `key`
    pub fn evict_key(&self, key: &Key) -> Option<NodeRef> {
        let node = self.cache.remove(key)?;
        node.read().subnodes().invalidate();
        Some(node)
    }

    /// Empty the cache
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    // ---- lookups ----

    /// Node stored under `key`
    pub fn get_node(&self, key: &Key) -> Result<NodeRef> {
        self.fetch(key)?.ok_or_else(|| Error::not_found(format!("node {}", key)))
    }

    /// Node `id` of type `mapping`
    pub fn get_node_by_id(&self, id: &str, mapping: &DbMapping) -> Result<NodeRef> {
        self.get_node(&self.registry.key_for(mapping, id))
    }

    /// The root node, id 0
    pub fn get_root_node(&self) -> Result<NodeRef> {
        let mapping = self.registry.mapping_for(Some("Root"));
        self.get_node(&self.registry.key_for(&mapping, crate::storage::xml::ROOT_ID))
    }

    fn fetch(&self, key: &Key) -> Result<Option<NodeRef>> {
        if let Some(node) = self.cache.get(key) {
            match node.read().state() {
                NodeState::Deleted => return Ok(None),
                NodeState::Invalid => {}
                _ => {
                    self.metrics.cache.hits.inc();
                    return Ok(Some(node.clone()));
                }
            }
            self.cache.remove(key);
        }
        self.metrics.cache.misses.inc();

        match self.load(key)? {
            Some(node) => Ok(Some(self.cache.get_or_insert(key.clone(), node))),
            None => Ok(None),
        }
    }

    fn load(&self, key: &Key) -> Result<Option<NodeRef>> {
        match key {
            Key::Db(k) => {
                let mapping = self
                    .registry
                    .get(k.storage_name().as_str())
                    .unwrap_or_else(|| self.registry.mapping_for(None));
                if mapping.is_relational() {
                    let condition = self.id_condition(&mapping, k.id(), true)?;
                    self.load_row(&mapping, &[condition])
                } else {
                    self.load_embedded(key, k.id())
                }
            }
            Key::Multi(k) => {
                let mapping = self.registry.require(k.storage_name().as_str())?;
                let source = self.registry.source_for(&mapping)?;
                let table = table_of(&mapping)?;
                let conditions = k
                    .parts()
                    .iter()
                    .map(|(column, value)| {
                        let quoted = mapping.needs_quotes(column, source.as_ref())?;
                        Ok(format!("{}.{} = {}", table, column, literal(value, quoted)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.load_row(&mapping, &conditions)
            }
            Key::Synthetic(k) => self.load_virtual(k),
        }
    }

    /// `[T.]ID = <id>` for `mapping`
    fn id_condition(&self, mapping: &DbMapping, id: &str, qualified: bool) -> Result<String> {
        let source = self.registry.source_for(mapping)?;
        let column = mapping.id_column();
        let quoted = mapping.needs_quotes(&column, source.as_ref())?;
        let column = if qualified {
            format!("{}.{}", table_of(mapping)?, column)
        } else {
            column
        };
        Ok(format!("{} = {}", column, literal(id, quoted)?))
    }

    fn load_row(&self, mapping: &Arc<DbMapping>, conditions: &[String]) -> Result<Option<NodeRef>> {
        let source = self.registry.source_for(mapping)?;
        let select = mapping.select(source.dialect(), None)?;
        let rows = source.query(&select.with_conditions(conditions))?;
        match rows.first() {
            Some(row) => self.node_from_row(mapping, row).map(Some),
            None => Ok(None),
        }
    }

    fn load_embedded(&self, key: &Key, id: &str) -> Result<Option<NodeRef>> {
        match self.db.get_node(id)? {
            Some(record) => Ok(Some(self.node_from_record(record, key.clone()))),
            None => Ok(None),
        }
    }

    /// Group node or mount point below the node of the key's parent
    fn load_virtual(&self, key: &SyntheticKey) -> Result<Option<NodeRef>> {
        let Some(parent) = self.fetch(key.parent())? else {
            return Ok(None);
        };
        let mapping = self.mapping_of(&parent);

        if let Some(rel) = mapping.property_relation(key.name()).filter(|r| r.mountpoint) {
            let target = rel.target.as_deref().map(|t| self.registry.mapping_for(Some(t)));
            let mut node = Node::with_id(key.name(), rel.target.as_deref());
            node.set_name(Some(key.name()));
            node.set_parent(Some(parent.handle()));
            if let Some(list) = target.as_ref().and_then(|t| self.subnode_list(t)) {
                node.set_subnodes(list);
            }
            node.set_mapping(target);
            node.set_state(NodeState::Virtual);
            return Ok(Some(SharedNode::persistent(node, Key::Synthetic(key.clone()))));
        }

        if let Some(rel) = mapping.subnode_relation().filter(|r| r.kind == RelationKind::GroupBy) {
            let prototype = rel.group.as_ref().and_then(|g| g.prototype.clone());
            let mut node = Node::with_id(key.name(), prototype.as_deref());
            node.set_name(Some(key.name()));
            node.set_parent(Some(parent.handle()));
            node.set_subnodes(SegmentedSubnodeList::relational(rel.for_group(key.name()), self.segment_length));
            node.set_mapping(prototype.as_deref().and_then(|p| self.registry.get(p)));
            node.set_state(NodeState::Virtual);
            return Ok(Some(SharedNode::persistent(node, Key::Synthetic(key.clone()))));
        }

        Ok(None)
    }

    /// Mapping of `node`, falling back to its prototype's
    pub fn mapping_of(&self, node: &NodeRef) -> Arc<DbMapping> {
        let n = node.read();
        n.mapping()
            .cloned()
            .unwrap_or_else(|| self.registry.mapping_for(n.prototype()))
    }

    /// Relational child list for nodes of `mapping`, if its children are
    /// stored rows
    fn subnode_list(&self, mapping: &DbMapping) -> Option<SegmentedSubnodeList> {
        let rel = mapping.subnode_relation()?;
        if rel.mountpoint || !self.is_relational_collection(&rel) {
            return None;
        }
        Some(SegmentedSubnodeList::relational(rel, self.segment_length))
    }

    fn is_relational_collection(&self, rel: &Relation) -> bool {
        rel.kind.is_collection()
            && !rel.mountpoint
            && rel
                .target
                .as_deref()
                .and_then(|t| self.registry.get(t))
                .map_or(false, |m| m.is_relational())
    }

    fn target_mapping(&self, rel: &Relation) -> Result<Arc<DbMapping>> {
        let target = rel.target.as_deref().ok_or_else(|| {
            Error::invalid_input(format!("Relation {} has no target prototype", rel.prop_name))
        })?;
        self.registry.require(target)
    }

    // ---- rows and records ----

    /// Build a node from a result row of `mapping`'s select
    fn node_from_row(&self, mapping: &Arc<DbMapping>, row: &Row) -> Result<NodeRef> {
        let prototype = self.registry.prototype_for_row(mapping, row);
        let actual = self.registry.get(&prototype).unwrap_or_else(|| mapping.clone());
        let id_column = actual.id_column();
        let id = row.get(&id_column).and_then(SqlValue::as_text).ok_or_else(|| {
            Error::internal(format!("Row of {} has no value in id column {}", actual.type_name(), id_column))
        })?;
        let key = self.registry.key_for(&actual, &id);

        let mut node = Node::with_id(id, Some(&prototype));
        if let Some(column) = actual.name_column() {
            let name = row.get(&column).and_then(SqlValue::as_text);
            node.set_name(name.as_deref());
        }

        for (label, value) in row.iter() {
            if label.contains('.') || value.is_null() {
                continue;
            }
            let Some(rel) = actual.column_relation(label) else {
                continue;
            };
            match rel.kind {
                RelationKind::Primitive => {
                    if let Some(value) = sql_to_value(value) {
                        node.put(&rel.prop_name, value);
                    }
                }
                RelationKind::Reference => {
                    let target = rel.target.as_deref().and_then(|t| self.registry.get(t));
                    if let (Some(target), Some(id)) = (target, value.as_text()) {
                        let handle = NodeHandle::persistent(self.registry.key_for(&target, &id));
                        node.put(&rel.prop_name, Value::Node(handle));
                    }
                }
                _ => {}
            }
        }

        for (alias, rel, target) in actual.joined_references() {
            let prefix = format!("{}.", alias);
            let mut joined = Row::new();
            for (label, value) in row.iter() {
                let matches = label
                    .get(..prefix.len())
                    .map_or(false, |p| p.eq_ignore_ascii_case(&prefix));
                if matches {
                    joined.push(&label[prefix.len()..], value.clone());
                }
            }
            if joined.get(&target.id_column()).map_or(true, SqlValue::is_null) {
                continue;
            }
            let child = self.node_from_row(&target, &joined)?;
            let child = match child.key() {
                Some(key) => self.cache.get_or_insert(key.clone(), child.clone()),
                None => child,
            };
            node.put(&rel.prop_name, Value::Node(child.handle()));
        }

        if let Some(list) = self.subnode_list(&actual) {
            node.set_subnodes(list);
        }
        node.set_mapping(Some(actual));
        node.set_state(NodeState::Clean);
        self.metrics.nodes.loaded.inc();
        trace!(key = %key, "Loaded node from row");
        Ok(SharedNode::persistent(node, key))
    }

    fn node_from_record(&self, record: NodeRecord, key: Key) -> NodeRef {
        let mapping = self.registry.mapping_for(record.prototype.as_deref());
        let mut node = Node::with_id(record.id, record.prototype.as_deref());
        node.set_name(record.name.as_deref());
        for (name, value) in record.properties {
            let value = match value {
                RecordValue::Scalar(v) => v,
                RecordValue::Reference(link) => Value::Node(self.link_handle(&link)),
            };
            node.put(&name, value);
        }
        node.set_parent(record.parent.as_ref().map(|l| self.link_handle(l)));
        let list = self.subnode_list(&mapping).unwrap_or_else(|| {
            SegmentedSubnodeList::from_handles(record.children.iter().map(|l| self.link_handle(l)).collect())
        });
        node.set_subnodes(list);
        node.set_mapping(Some(mapping));
        node.set_timestamps(record.created, record.last_modified);
        node.set_state(NodeState::Clean);
        self.metrics.nodes.loaded.inc();
        trace!(key = %key, "Loaded node from XML");
        SharedNode::persistent(node, key)
    }

    fn link_handle(&self, link: &NodeLink) -> NodeHandle {
        let mapping = self.registry.mapping_for(link.prototype.as_deref());
        NodeHandle::persistent(self.registry.key_for(&mapping, &link.id))
    }

    fn link_for(&self, handle: &NodeHandle) -> NodeLink {
        let node = match handle.key() {
            Some(key) => self.cache.get(&key),
            None => handle.get_node(self).ok().flatten(),
        };
        let prototype = node
            .as_ref()
            .and_then(|n| n.try_read().and_then(|g| g.prototype().map(str::to_string)));
        NodeLink::new(handle.id(), prototype.as_deref())
    }

    /// XML record of an embedded node
    pub(crate) fn node_record(&self, node: &NodeRef) -> NodeRecord {
        let n = node.read();
        let mut record = NodeRecord::new(n.id(), n.prototype());
        record.name = n.raw_name().map(str::to_string);
        record.created = n.created();
        record.last_modified = n.last_modified();
        record.properties = n
            .properties()
            .map(|p| {
                let value = match p.value() {
                    Value::Node(h) => RecordValue::Reference(self.link_for(h)),
                    other => RecordValue::Scalar(other.clone()),
                };
                (p.name().to_string(), value)
            })
            .collect();
        record.children = n.subnodes().loaded_handles().iter().map(|h| self.link_for(h)).collect();
        record.parent = n.parent().map(|h| self.link_for(h));
        record
    }

    /// Insert, update or delete the row of a relational node
    pub(crate) fn write_row(
        &self,
        node: &NodeRef,
        state: NodeState,
        mapping: &Arc<DbMapping>,
        source: &dyn DbSource,
    ) -> Result<()> {
        let n = node.read();
        match state {
            NodeState::New => {
                let sql = mapping.insert(source)?;
                let params = mapping
                    .mapped_columns(source)?
                    .iter()
                    .map(|c| self.column_value(mapping, c, &n))
                    .collect::<Vec<_>>();
                source.execute(&sql, &params)?;
            }
            NodeState::Modified => {
                let columns: Vec<DbColumn> = mapping
                    .mapped_columns(source)?
                    .into_iter()
                    .filter(|c| !c.is_id())
                    .collect();
                if columns.is_empty() {
                    return Ok(());
                }
                let assignments: Vec<String> = columns.iter().map(|c| format!("{} = ?", c.name())).collect();
                let params: Vec<SqlValue> = columns.iter().map(|c| self.column_value(mapping, c, &n)).collect();
                let sql = format!(
                    "{}{} WHERE {}",
                    mapping.update_prefix()?,
                    assignments.join(", "),
                    self.id_condition(mapping, n.id(), false)?
                );
                if source.execute(&sql, &params)? == 0 {
                    warn!(node = n.id(), prototype = mapping.type_name(), "Update matched no row");
                }
            }
            NodeState::Deleted => {
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    table_of(mapping)?,
                    self.id_condition(mapping, n.id(), false)?
                );
                source.execute(&sql, &[])?;
            }
            _ => {}
        }
        Ok(())
    }

    fn column_value(&self, mapping: &DbMapping, column: &DbColumn, node: &Node) -> SqlValue {
        match column.role() {
            ColumnRole::Id => match column.sql_type() {
                SqlType::Integer => node
                    .id()
                    .parse()
                    .map(SqlValue::Integer)
                    .unwrap_or_else(|_| SqlValue::Text(node.id().to_string())),
                _ => SqlValue::Text(node.id().to_string()),
            },
            ColumnRole::Name => node
                .raw_name()
                .map_or(SqlValue::Null, |name| SqlValue::Text(name.to_string())),
            ColumnRole::Prototype => {
                let prototype = node.prototype().unwrap_or(mapping.type_name());
                let ext = self
                    .registry
                    .get(prototype)
                    .and_then(|m| m.extension_id())
                    .unwrap_or_else(|| prototype.to_string());
                SqlValue::Text(ext)
            }
            ColumnRole::Property(prop) => node.value(prop).map_or(SqlValue::Null, value_to_sql),
            ColumnRole::Unmapped => SqlValue::Null,
        }
    }

    // ---- collections ----

    /// Values of the home side of each constraint of `rel`. Virtual
    /// homes take them from the real node above.
    fn local_values(&self, home: &NodeRef, rel: &Relation) -> Result<Vec<Option<String>>> {
        let home = self.constraint_home(home)?;
        let mapping = self.mapping_of(&home);
        let n = home.read();
        Ok(rel
            .constraints
            .iter()
            .map(|c| {
                if c.local_is_id() {
                    Some(n.id().to_string())
                } else {
                    mapping
                        .column_name_to_property(&c.local)
                        .and_then(|prop| n.value(&prop).map(Value::to_string))
                }
            })
            .collect())
    }

    fn constraint_home(&self, home: &NodeRef) -> Result<NodeRef> {
        let mut current = home.clone();
        loop {
            let parent = {
                let n = current.read();
                if n.state() == NodeState::Virtual {
                    n.parent().cloned()
                } else {
                    None
                }
            };
            match parent {
                Some(handle) => match handle.get_node(self)? {
                    Some(node) => current = node,
                    None => return Ok(current),
                },
                None => return Ok(current),
            }
        }
    }

    /// Children of `home` along `rel`
    pub fn get_nodes(&self, home: &NodeRef, rel: &Relation) -> Result<Vec<NodeRef>> {
        if self.is_relational_collection(rel) && rel.kind != RelationKind::GroupBy {
            let target = self.target_mapping(rel)?;
            let source = self.registry.source_for(&target)?;
            let local = self.local_values(home, rel)?;
            let query = SubnodeQuery::new(rel, &target, source.as_ref(), local)
                .with_extensions(self.registry.extension_filter(&target));
            let rows = source.query(&query.rows_sql()?)?;
            return rows
                .iter()
                .map(|row| {
                    let node = self.node_from_row(&target, row)?;
                    Ok(match node.key() {
                        Some(key) => self.cache.get_or_insert(key.clone(), node.clone()),
                        None => node,
                    })
                })
                .collect();
        }

        let handles = if self.is_relational_collection(rel) {
            self.subnode_handles(home, rel)?
        } else {
            let list = home.read().subnodes();
            list.to_array(None)?
        };
        let mut nodes = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(node) = handle.get_node(self)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Ids of the children of `home` along `rel`
    pub fn get_node_ids(&self, home: &NodeRef, rel: &Relation) -> Result<Vec<String>> {
        let handles = if self.is_relational_collection(rel) {
            self.subnode_handles(home, rel)?
        } else {
            let list = home.read().subnodes();
            list.to_array(None)?
        };
        Ok(handles.iter().map(NodeHandle::id).collect())
    }

    /// Number of children of `home` along `rel`
    pub fn count_nodes(&self, home: &NodeRef, rel: &Relation) -> Result<usize> {
        if self.is_relational_collection(rel) {
            self.count_subnodes(home, rel)
        } else {
            let list = home.read().subnodes();
            list.size(None)
        }
    }

    /// Child of `home` called `name`
    pub fn get_child_by_name(&self, home: &NodeRef, name: &str) -> Result<NodeRef> {
        let mapping = self.mapping_of(home);
        let rel = mapping.subnode_relation();

        match rel {
            Some(rel) if rel.kind == RelationKind::GroupBy => {
                let key = home
                    .key()
                    .cloned()
                    .ok_or_else(|| Error::invalid_input("Groups need a persistent home node"))?;
                self.get_node(&Key::Synthetic(SyntheticKey::new(key, name)))
            }
            Some(rel) if self.is_relational_collection(&rel) => {
                let target = self.target_mapping(&rel)?;
                let source = self.registry.source_for(&target)?;
                let local = self.local_values(home, &rel)?;
                let query = SubnodeQuery::new(&rel, &target, source.as_ref(), local)
                    .with_extensions(self.registry.extension_filter(&target));
                let Some(sql) = query.by_name_sql(name)? else {
                    // without access name children are addressed by id
                    return self.get_node_by_id(name, &target);
                };
                let rows = source.query(&sql)?;
                let row = rows
                    .first()
                    .ok_or_else(|| Error::not_found(format!("child {} of {}", name, home.id())))?;
                let node = self.node_from_row(&target, row)?;
                Ok(match node.key() {
                    Some(key) => self.cache.get_or_insert(key.clone(), node.clone()),
                    None => node,
                })
            }
            _ => {
                let list = home.read().subnodes();
                for handle in list.to_array(None)? {
                    if let Some(child) = handle.get_node(self)? {
                        if child.read().name() == name {
                            return Ok(child);
                        }
                    }
                }
                Err(Error::not_found(format!("child {} of {}", name, home.id())))
            }
        }
    }

    /// Child at `index` of `home`'s own child list
    pub fn subnode(&self, home: &NodeRef, index: usize) -> Result<Option<NodeRef>> {
        let list = home.read().subnodes();
        let before = list.inconsistent_loads();
        let handle = list.get(index, Some(Loader::new(home, self)))?;
        self.metrics
            .nodes
            .inconsistent_segments
            .inc_by(list.inconsistent_loads().saturating_sub(before));
        match handle {
            Some(handle) => handle.get_node(self),
            None => Ok(None),
        }
    }

    /// Size of `home`'s own child list
    pub fn subnode_count(&self, home: &NodeRef) -> Result<usize> {
        let list = home.read().subnodes();
        list.size(Some(Loader::new(home, self)))
    }

    /// Parent of `node`: the stored parent link, else the first
    /// resolvable `_parent` path of its mapping
    pub fn get_parent(&self, node: &NodeRef) -> Result<Option<NodeRef>> {
        let handle = node.read().parent().cloned();
        if let Some(handle) = handle {
            return handle.get_node(self);
        }

        for path in self.mapping_of(node).parent_info() {
            let mut parts = path.split('.').map(str::trim);
            let Some(first) = parts.next() else { continue };
            if first.eq_ignore_ascii_case("root") {
                return self.get_root_node().map(Some);
            }
            let reference = node.read().value(first).and_then(Value::as_node).cloned();
            let Some(parent) = reference.map(|h| h.get_node(self)).transpose()?.flatten() else {
                continue;
            };
            match (parts.next(), parent.key()) {
                (Some(mount), Some(key)) => {
                    let key = Key::Synthetic(SyntheticKey::new(key.clone(), mount));
                    if let Some(mounted) = self.fetch(&key)? {
                        return Ok(Some(mounted));
                    }
                }
                _ => return Ok(Some(parent)),
            }
        }
        Ok(None)
    }

    // ---- changes ----

    /// Next id for a node of `mapping`
    pub fn new_id(&self, mapping: &DbMapping) -> Result<String> {
        if mapping.is_relational() {
            let source = self.registry.source_for(mapping)?;
            mapping.next_id(source.as_ref())
        } else {
            Ok(self.db.new_id())
        }
    }

    /// Make a transient node persistent within the current transaction,
    /// together with its transient children
    pub fn insert_node(&self, node: &NodeRef) -> Result<Key> {
        if !self.has_transaction() {
            return Err(Error::transaction("Inserting a node needs a transaction"));
        }
        if node.is_persistent() {
            return Err(Error::already_exists(format!("node {}", node.id())));
        }

        let mapping = self.mapping_of(node);
        let id = self.new_id(&mapping)?;
        let key = self.registry.key_for(&mapping, &id);

        let children: Vec<NodeRef> = {
            let list = node.read().subnodes();
            list.loaded_handles()
                .iter()
                .filter(|h| h.has_node())
                .filter_map(|h| h.get_node(self).ok().flatten())
                .collect()
        };
        {
            let mut n = node.write();
            n.set_id(id);
            n.set_mapping(Some(mapping.clone()));
            n.set_state(NodeState::New);
            if let Some(list) = self.subnode_list(&mapping) {
                n.set_subnodes(list);
            }
        }
        if !node.become_persistent(key.clone()) {
            return Err(Error::already_exists(format!("node {}", key)));
        }
        self.cache.put(key.clone(), node.clone());
        self.visit_dirty(node)?;
        debug!(key = %key, "Inserted node");

        for child in children {
            if child.is_persistent() {
                continue;
            }
            {
                let mut c = child.write();
                if c.parent().is_none() {
                    c.set_parent(Some(node.handle()));
                }
            }
            self.insert_node(&child)?;
        }
        Ok(key)
    }

    /// Record a change of a persistent node. Transient nodes are ignored.
    pub fn mark_modified(&self, node: &NodeRef) -> Result<()> {
        if !node.is_persistent() {
            return Ok(());
        }
        {
            let mut n = node.write();
            match n.state() {
                NodeState::Clean | NodeState::Invalid => n.set_state(NodeState::Modified),
                NodeState::Virtual => return Ok(()),
                _ => {}
            }
        }
        self.visit_dirty(node)
    }

    /// Delete a persistent node within the current transaction, removing
    /// it from its parent's child list
    pub fn delete_node(&self, node: &NodeRef) -> Result<()> {
        if !node.is_persistent() {
            return Ok(());
        }
        if !self.has_transaction() {
            return Err(Error::transaction("Deleting a node needs a transaction"));
        }
        let parent = node.read().parent().cloned();
        if let Some(parent) = parent.map(|h| h.get_node(self)).transpose()?.flatten() {
            self.remove_subnode(&parent, node)?;
        }
        node.write().set_state(NodeState::Deleted);
        self.visit_dirty(node)?;
        debug!(node = %node.id(), "Deleted node");
        Ok(())
    }

    /// Append `child` to `home`'s child list. For relational collections
    /// the child's foreign key properties are set from the constraints.
    pub fn add_subnode(&self, home: &NodeRef, child: &NodeRef) -> Result<()> {
        let list = home.read().subnodes();

        if let Some(rel) = list.relation() {
            let local = self.local_values(home, rel)?;
            let owner = self.constraint_home(home)?;
            let child_mapping = self.mapping_of(child);
            let mut c = child.write();
            for (constraint, value) in rel.constraints.iter().zip(local) {
                if constraint.foreign_is_id() {
                    continue;
                }
                let Some(foreign) = child_mapping.column_relation(&constraint.foreign) else {
                    continue;
                };
                if foreign.kind == RelationKind::Reference && constraint.local_is_id() {
                    c.set_node(&foreign.prop_name, owner.handle());
                } else if let Some(value) = value {
                    c.set_string(&foreign.prop_name, value);
                }
            }
            if let Some((column, value)) = &rel.group_value {
                if let Some(prop) = child_mapping.column_name_to_property(column) {
                    c.set_string(&prop, value.clone());
                }
            }
        }

        {
            let mut c = child.write();
            if c.parent().is_none() {
                c.set_parent(Some(home.handle()));
            }
        }

        if home.is_persistent() && !child.is_persistent() {
            self.insert_node(child)?;
        } else {
            self.mark_modified(child)?;
        }
        list.add(child.handle(), Some(Loader::new(home, self)))?;
        if !list.is_relational() {
            self.mark_modified(home)?;
        }
        Ok(())
    }

    /// Remove `child` from `home`'s child list
    pub fn remove_subnode(&self, home: &NodeRef, child: &NodeRef) -> Result<bool> {
        let list = home.read().subnodes();
        let removed = list.remove_handle(&child.handle(), Some(Loader::new(home, self)))?;
        if removed && !list.is_relational() {
            self.mark_modified(home)?;
        }
        Ok(removed)
    }
}

impl NodeResolver for NodeManager {
    fn resolve(&self, key: &Key) -> Result<Option<NodeRef>> {
        self.fetch(key)
    }
}

impl SubnodeSource for NodeManager {
    fn count_subnodes(&self, home: &NodeRef, rel: &Relation) -> Result<usize> {
        let target = self.target_mapping(rel)?;
        let source = self.registry.source_for(&target)?;
        let local = self.local_values(home, rel)?;
        let query = SubnodeQuery::new(rel, &target, source.as_ref(), local)
            .with_extensions(self.registry.extension_filter(&target));
        let rows = source.query(&query.count_sql()?)?;
        let count = rows
            .first()
            .and_then(|row| row.value_at(0))
            .and_then(SqlValue::as_integer)
            .unwrap_or(0);
        Ok(count.max(0) as usize)
    }

    fn subnode_handles(&self, home: &NodeRef, rel: &Relation) -> Result<Vec<NodeHandle>> {
        let target = self.target_mapping(rel)?;
        let source = self.registry.source_for(&target)?;
        let local = self.local_values(home, rel)?;
        let query = SubnodeQuery::new(rel, &target, source.as_ref(), local)
            .with_extensions(self.registry.extension_filter(&target));
        let rows = source.query(&query.ids_sql()?)?;
        let values = rows.iter().filter_map(|row| row.value_at(0).and_then(SqlValue::as_text));

        if rel.kind == RelationKind::GroupBy {
            let home_key = home
                .key()
                .cloned()
                .ok_or_else(|| Error::invalid_input("Groups need a persistent home node"))?;
            return Ok(values
                .map(|group| NodeHandle::persistent(Key::Synthetic(SyntheticKey::new(home_key.clone(), group))))
                .collect());
        }
        Ok(values
            .map(|id| NodeHandle::persistent(self.registry.key_for(&target, &id)))
            .collect())
    }

    fn last_data_change(&self, rel: &Relation) -> u64 {
        rel.target
            .as_deref()
            .and_then(|t| self.registry.get(t))
            .map_or(0, |m| m.last_data_change())
    }
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("id", &self.id)
            .field("home", &self.db.home())
            .field("cache", &self.cache)
            .finish()
    }
}

fn table_of(mapping: &DbMapping) -> Result<String> {
    mapping
        .table_name()
        .ok_or_else(|| MappingError::MissingTable(mapping.type_name().to_string()).into())
}

fn sql_to_value(value: &SqlValue) -> Option<Value> {
    match value {
        SqlValue::Null => None,
        SqlValue::Text(s) => Some(Value::String(s.clone())),
        SqlValue::Integer(i) => Some(Value::Integer(*i)),
        SqlValue::Float(f) => Some(Value::Float(*f)),
        SqlValue::Boolean(b) => Some(Value::Boolean(*b)),
        SqlValue::Timestamp(ts) => Some(Value::Date(*ts)),
    }
}

fn value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Float(*f),
        Value::Boolean(b) => SqlValue::Boolean(*b),
        Value::Date(ts) => SqlValue::Timestamp(*ts),
        Value::Node(h) => SqlValue::Text(h.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::StaticSource;
    use crate::storage::OsFileOps;

    fn manager(dir: &std::path::Path) -> NodeManager {
        let registry = Arc::new(MappingRegistry::new("ID"));
        registry.register("HopObject", Box::new(StaticSource::default()));
        registry.register("Root", Box::new(StaticSource::default()));
        registry.update_all().unwrap();
        let db = XmlDatabase::init_with(dir, 1, Arc::new(OsFileOps)).unwrap();
        NodeManager::new(registry, db, 100, 10, Arc::new(StoreMetrics::new().unwrap()))
    }

    #[test]
    fn test_root_is_loaded_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let nmgr = manager(dir.path());

        let root = nmgr.get_root_node().unwrap();
        assert_eq!(root.read().name(), "root");
        assert_eq!(root.read().state(), NodeState::Clean);
        let again = nmgr.get_root_node().unwrap();
        assert!(Arc::ptr_eq(&root, &again));
        assert_eq!(nmgr.metrics().cache.hits.get(), 1);
    }

    #[test]
    fn test_missing_node_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let nmgr = manager(dir.path());
        let err = nmgr.get_node(&nmgr.registry().embedded_key("777")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_changes_need_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let nmgr = manager(dir.path());
        let node = SharedNode::new(Node::transient(Some("n"), None));
        assert!(nmgr.insert_node(&node).is_err());

        let root = nmgr.get_root_node().unwrap();
        assert!(nmgr.mark_modified(&root).is_err());
    }

    #[test]
    fn test_insert_with_children_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let nmgr = manager(dir.path());
        let root = nmgr.get_root_node().unwrap();

        nmgr.begin().unwrap();
        let story = SharedNode::new(Node::transient(Some("story"), None));
        let comment = SharedNode::new(Node::transient(Some("comment"), None));
        nmgr.add_subnode(&story, &comment).unwrap();
        story.write().set_string("title", "Hello");
        nmgr.add_subnode(&root, &story).unwrap();
        let outcome = nmgr.commit().unwrap();

        assert!(outcome.is_clean());
        assert!(story.is_persistent() && comment.is_persistent());
        assert_eq!(story.read().state(), NodeState::Clean);
        assert_eq!(outcome.written.len(), 3);

        nmgr.clear_cache();
        let root = nmgr.get_root_node().unwrap();
        let loaded = nmgr.get_child_by_name(&root, "story").unwrap();
        assert_eq!(loaded.read().get_string("title").as_deref(), Some("Hello"));
        assert_eq!(nmgr.subnode_count(&loaded).unwrap(), 1);
        let parent = nmgr.get_parent(&loaded).unwrap().unwrap();
        assert_eq!(parent.id(), "0");
    }

    #[test]
    fn test_abort_invalidates_changes() {
        let dir = tempfile::tempdir().unwrap();
        let nmgr = manager(dir.path());
        let root = nmgr.get_root_node().unwrap();

        nmgr.begin().unwrap();
        root.write().set_string("title", "changed");
        nmgr.mark_modified(&root).unwrap();
        nmgr.abort().unwrap();

        assert_eq!(root.read().state(), NodeState::Invalid);
        let reloaded = nmgr.get_root_node().unwrap();
        assert!(!Arc::ptr_eq(&root, &reloaded));
        assert!(reloaded.read().get_string("title").is_none());
    }

    #[test]
    fn test_delete_removes_file_and_link() {
        let dir = tempfile::tempdir().unwrap();
        let nmgr = manager(dir.path());
        let root = nmgr.get_root_node().unwrap();

        nmgr.begin().unwrap();
        let child = SharedNode::new(Node::transient(Some("gone"), None));
        nmgr.add_subnode(&root, &child).unwrap();
        nmgr.commit().unwrap();
        let id = child.id();
        assert!(nmgr.database().exists(&id));

        nmgr.begin().unwrap();
        nmgr.delete_node(&child).unwrap();
        nmgr.commit().unwrap();

        assert!(!nmgr.database().exists(&id));
        assert_eq!(nmgr.subnode_count(&root).unwrap(), 0);
        assert!(nmgr.get_node(&nmgr.registry().embedded_key(&id)).unwrap_err().is_not_found());
    }
}
