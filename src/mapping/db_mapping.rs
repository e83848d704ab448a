//! Per-prototype schema descriptor
//!
//! A [`DbMapping`] binds one prototype to its storage: table, data source,
//! id/name/prototype columns and the relations of its properties. Mappings
//! form a single-parent inheritance tree through `_extends`; a mapping that
//! declares neither table nor data source of its own shares the storage of
//! its parent.
//!
//! Mutable state lives behind locks so that a mapping can be re-read while
//! other threads use it. [`DbMapping::update`] is serialized per mapping.

use crate::core::{Error, MappingError, Result};
use crate::mapping::column::{ColumnRole, DbColumn};
use crate::mapping::joins::JoinClause;
use crate::mapping::properties::PropertySource;
use crate::mapping::registry::MappingRegistry;
use crate::mapping::relation::{Relation, RelationKind};
use crate::storage::relational::{DbSource, Dialect, SqlValue};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Name of the root of the prototype tree and storage name of all
/// embedded nodes
pub const HOP_OBJECT: &str = "HopObject";

/// Select part of a statement plus conditions the join syntax requires in
/// the WHERE part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectStatement {
    /// `SELECT ... FROM ...` including joins
    pub sql: String,
    /// Conditions to AND into the WHERE part
    pub conditions: Vec<String>,
}

impl SelectStatement {
    /// Complete statement with `extra` conditions added
    pub fn with_conditions(&self, extra: &[String]) -> String {
        let all: Vec<&str> = self
            .conditions
            .iter()
            .chain(extra.iter())
            .map(String::as_str)
            .collect();
        if all.is_empty() {
            self.sql.clone()
        } else {
            format!("{} WHERE {}", self.sql, all.join(" AND "))
        }
    }
}

#[derive(Default)]
struct MappingState {
    table_name: Option<String>,
    db_source_name: Option<String>,
    id_column: Option<String>,
    name_column: Option<String>,
    prototype_column: Option<String>,
    extends: Option<String>,
    parent: Option<Arc<DbMapping>>,
    extension_id: Option<String>,
    parent_info: Vec<String>,
    id_sequence: Option<String>,
    subnode_relation: Option<Relation>,
    // keyed by lowercase property name
    prop2db: HashMap<String, Relation>,
    // uppercase column name -> lowercase property name
    db2prop: HashMap<String, String>,
    property_order: Vec<String>,
    joins: Vec<(Relation, Arc<DbMapping>)>,
}

#[derive(Default)]
struct SqlCache {
    select: HashMap<Dialect, SelectStatement>,
    insert: Option<String>,
    update: Option<String>,
}

/// Schema descriptor of one prototype
pub struct DbMapping {
    type_name: String,
    source: Box<dyn PropertySource>,
    default_id_column: String,
    update_lock: Mutex<()>,
    last_type_change: RwLock<Option<u64>>,
    state: RwLock<MappingState>,
    last_data_change: AtomicU64,
    last_id: Mutex<i64>,
    dependents: Mutex<Vec<Weak<DbMapping>>>,
    extensions: RwLock<BTreeMap<String, String>>,
    columns: RwLock<Option<Arc<Vec<DbColumn>>>>,
    sql: Mutex<SqlCache>,
}

impl fmt::Debug for DbMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbMapping")
            .field("type_name", &self.type_name)
            .field("table", &self.table_name())
            .field("db", &self.db_source_name())
            .finish()
    }
}

impl DbMapping {
    /// Create a mapping that hasn't read its source yet
    pub fn new(
        type_name: impl Into<String>,
        source: Box<dyn PropertySource>,
        default_id_column: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            source,
            default_id_column: default_id_column.into(),
            update_lock: Mutex::new(()),
            last_type_change: RwLock::new(None),
            state: RwLock::new(MappingState::default()),
            last_data_change: AtomicU64::new(0),
            last_id: Mutex::new(0),
            dependents: Mutex::new(Vec::new()),
            extensions: RwLock::new(BTreeMap::new()),
            columns: RwLock::new(None),
            sql: Mutex::new(SqlCache::default()),
        }
    }

    /// Prototype name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Whether the property source changed since the last update
    pub fn needs_update(&self) -> bool {
        *self.last_type_change.read() != Some(self.source.last_modified())
    }

    /// Stamp of the property source at the last update
    pub fn last_type_change(&self) -> Option<u64> {
        *self.last_type_change.read()
    }

    /// Re-read the property source if it changed. Returns whether the
    /// mapping was rebuilt. Parents are brought up to date first.
    pub fn update(self: &Arc<Self>, registry: &MappingRegistry) -> Result<bool> {
        self.update_with_chain(registry, &mut Vec::new())
    }

    fn update_with_chain(
        self: &Arc<Self>,
        registry: &MappingRegistry,
        chain: &mut Vec<String>,
    ) -> Result<bool> {
        if chain.iter().any(|name| name == &self.type_name) {
            error!(prototype = %self.type_name, chain = ?chain, "Cyclic prototype inheritance");
            return Err(MappingError::CyclicInheritance(self.type_name.clone()).into());
        }

        let _guard = self.update_lock.lock();
        let stamp = self.source.last_modified();
        if *self.last_type_change.read() == Some(stamp) {
            return Ok(false);
        }

        let props = self.source.load()?;

        let extends = match props.get("_extends") {
            Some(name) => Some(name.to_string()),
            None if self.type_name.eq_ignore_ascii_case(HOP_OBJECT) => None,
            None => Some(HOP_OBJECT.to_string()),
        };

        chain.push(self.type_name.clone());
        let parent = match &extends {
            Some(name) => match registry.get(name) {
                Some(parent) => {
                    parent.update_with_chain(registry, chain)?;
                    Some(parent)
                }
                None => {
                    warn!(prototype = %self.type_name, parent = %name, "Parent prototype not found");
                    None
                }
            },
            None => None,
        };
        chain.pop();

        let mut table_name = props.get("_table").map(str::to_string);
        let mut db_source_name = props.get("_db").map(str::to_string);

        // storage shared with the parent is recorded as "not declared"
        if let Some(parent) = &parent {
            if table_name.is_some() && table_name == parent.table_name() {
                table_name = None;
            }
            if db_source_name.is_some() && db_source_name == parent.db_source_name() {
                db_source_name = None;
            }
        }

        let mut state = MappingState {
            table_name,
            db_source_name,
            id_column: props.get("_id").map(str::to_string),
            name_column: props.get("_name").map(str::to_string),
            prototype_column: props.get("_prototype").map(str::to_string),
            extends,
            parent: parent.clone(),
            extension_id: props.get("_extensionId").map(str::to_string),
            parent_info: props
                .get("_parent")
                .map(|p| {
                    p.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            id_sequence: props.get("_idgen").map(str::to_string),
            ..MappingState::default()
        };

        if let Some(value) = props.get("_children") {
            let rel = Relation::parse(&self.type_name, "_children", value, &props)
                .map_err(|e| self.log_config_error(e))?;
            if !rel.kind.is_collection() {
                let err = MappingError::InvalidRelation {
                    prototype: self.type_name.clone(),
                    property: "_children".to_string(),
                    reason: "subnodes must be a collection".to_string(),
                };
                return Err(self.log_config_error(err.into()));
            }
            state.subnode_relation = Some(rel);
        }

        for (key, value) in props.iter() {
            if key.starts_with('_') || key.contains('.') {
                continue;
            }
            let rel = Relation::parse(&self.type_name, key, value, &props)
                .map_err(|e| self.log_config_error(e))?;
            state.property_order.push(key.to_lowercase());
            self.add_relation(&mut state, rel);
        }

        for name in &state.property_order {
            let Some(rel) = state.prop2db.get(name) else { continue };
            if rel.kind != RelationKind::Reference || !rel.aggressive {
                continue;
            }
            let target = rel.target.as_deref().and_then(|t| registry.get(t));
            match target {
                Some(target) => {
                    target.add_dependent(Arc::downgrade(self));
                    state.joins.push((rel.clone(), target));
                }
                None => warn!(
                    prototype = %self.type_name,
                    property = %rel.prop_name,
                    "Aggressively loaded reference to unknown prototype"
                ),
            }
        }

        let extension_id = state.extension_id.clone();
        *self.state.write() = state;
        *self.columns.write() = None;
        *self.sql.lock() = SqlCache::default();

        if self.db_source_name().is_some() && self.table_name().is_none() {
            let err = MappingError::MissingTable(self.type_name.clone());
            return Err(self.log_config_error(err.into()));
        }
        *self.last_type_change.write() = Some(stamp);

        if let (Some(ext), true) = (extension_id, parent.is_some()) {
            let owner = self.storage_owner();
            if !Arc::ptr_eq(&owner, self) {
                owner.register_extension(&ext, &self.type_name);
            }
        }

        info!(
            prototype = %self.type_name,
            table = ?self.table_name(),
            db = ?self.db_source_name(),
            inherits_storage = self.inherits_storage(),
            "Updated type mapping"
        );
        Ok(true)
    }

    fn log_config_error(&self, err: Error) -> Error {
        error!(prototype = %self.type_name, error = %err, "Invalid type mapping");
        err
    }

    /// Record `rel`, applying the column ownership rule: a primitive keeps a
    /// column against a reference no matter which came first, and the
    /// reference is demoted to a complex reference.
    fn add_relation(&self, state: &mut MappingState, mut rel: Relation) {
        let prop = rel.prop_name.to_lowercase();

        if rel.claims_column() {
            let column = rel.column_name.as_deref().unwrap_or_default().to_uppercase();
            if let Some(old_prop) = state.db2prop.insert(column.clone(), prop.clone()) {
                let old_kind = state.prop2db.get(&old_prop).map(|r| r.kind);
                match (rel.kind, old_kind) {
                    (RelationKind::Primitive, Some(RelationKind::Primitive)) => {
                        warn!(
                            prototype = %self.type_name,
                            column = %column,
                            previous = %old_prop,
                            property = %prop,
                            "Duplicate mapping for column, later declaration wins"
                        );
                    }
                    (RelationKind::Reference, Some(RelationKind::Primitive)) => {
                        state.db2prop.insert(column, old_prop);
                        rel.kind = RelationKind::ComplexReference;
                    }
                    (RelationKind::Primitive, Some(RelationKind::Reference)) => {
                        if let Some(old) = state.prop2db.get_mut(&old_prop) {
                            old.kind = RelationKind::ComplexReference;
                        }
                    }
                    _ => debug!(
                        prototype = %self.type_name,
                        column = %column,
                        property = %prop,
                        "Column mapped twice"
                    ),
                }
            }
        }

        state.prop2db.insert(prop, rel);
    }

    fn parent(&self) -> Option<Arc<DbMapping>> {
        self.state.read().parent.clone()
    }

    /// Parent mapping in the inheritance tree
    pub fn parent_mapping(&self) -> Option<Arc<DbMapping>> {
        self.parent()
    }

    /// Declared or default parent prototype name
    pub fn extends(&self) -> Option<String> {
        self.state.read().extends.clone()
    }

    /// Whether this prototype is `name` or inherits from it
    pub fn is_instance_of(&self, name: &str) -> bool {
        if self.type_name == name {
            return true;
        }
        self.parent().map_or(false, |p| p.is_instance_of(name))
    }

    /// Table name, falling back to the parent's
    pub fn table_name(&self) -> Option<String> {
        let (own, parent) = {
            let s = self.state.read();
            (s.table_name.clone(), s.parent.clone())
        };
        own.or_else(|| parent.and_then(|p| p.table_name()))
    }

    /// Data source name, falling back to the parent's
    pub fn db_source_name(&self) -> Option<String> {
        let (own, parent) = {
            let s = self.state.read();
            (s.db_source_name.clone(), s.parent.clone())
        };
        own.or_else(|| parent.and_then(|p| p.db_source_name()))
    }

    /// Whether this mapping or an ancestor declares a data source
    pub fn is_relational(&self) -> bool {
        self.db_source_name().is_some()
    }

    /// Whether storage is shared with the parent mapping
    pub fn inherits_storage(&self) -> bool {
        let s = self.state.read();
        s.parent.is_some() && s.table_name.is_none() && s.db_source_name.is_none()
    }

    fn storage_parent(&self) -> Option<Arc<DbMapping>> {
        if self.inherits_storage() {
            self.parent()
        } else {
            None
        }
    }

    /// Mapping that owns the storage this one uses
    pub fn storage_owner(self: &Arc<Self>) -> Arc<DbMapping> {
        match self.storage_parent() {
            Some(parent) => parent.storage_owner(),
            None => self.clone(),
        }
    }

    /// Storage name used in keys. Embedded objects all share [`HOP_OBJECT`].
    pub fn storage_type_name(&self) -> String {
        if let Some(parent) = self.storage_parent() {
            return parent.storage_type_name();
        }
        if self.is_relational() {
            self.type_name.clone()
        } else {
            HOP_OBJECT.to_string()
        }
    }

    /// Primary key column
    pub fn id_column(&self) -> String {
        let (own, parent) = {
            let s = self.state.read();
            (s.id_column.clone(), s.parent.clone())
        };
        own.or_else(|| parent.map(|p| p.id_column()))
            .unwrap_or_else(|| self.default_id_column.clone())
    }

    /// Name column, if any
    pub fn name_column(&self) -> Option<String> {
        let (own, parent) = {
            let s = self.state.read();
            (s.name_column.clone(), s.parent.clone())
        };
        own.or_else(|| parent.and_then(|p| p.name_column()))
    }

    /// Prototype discriminator column, if any
    pub fn prototype_column(&self) -> Option<String> {
        let (own, parent) = {
            let s = self.state.read();
            (s.prototype_column.clone(), s.parent.clone())
        };
        own.or_else(|| parent.and_then(|p| p.prototype_column()))
    }

    /// Own extension id
    pub fn extension_id(&self) -> Option<String> {
        self.state.read().extension_id.clone()
    }

    /// Property paths leading to the parent object
    pub fn parent_info(&self) -> Vec<String> {
        let (own, parent) = {
            let s = self.state.read();
            (s.parent_info.clone(), s.parent.clone())
        };
        if own.is_empty() {
            parent.map(|p| p.parent_info()).unwrap_or_default()
        } else {
            own
        }
    }

    /// Sequence used for id generation
    pub fn id_sequence(&self) -> Option<String> {
        let own = self.state.read().id_sequence.clone();
        own.or_else(|| self.storage_parent().and_then(|p| p.id_sequence()))
    }

    /// Relation describing the subnodes, falling back to the parent's
    pub fn subnode_relation(&self) -> Option<Relation> {
        let (own, parent) = {
            let s = self.state.read();
            (s.subnode_relation.clone(), s.parent.clone())
        };
        own.or_else(|| parent.and_then(|p| p.subnode_relation()))
    }

    /// Relation of property `prop`, walking up the inheritance chain
    pub fn property_relation(&self, prop: &str) -> Option<Relation> {
        let (own, parent) = {
            let s = self.state.read();
            (s.prop2db.get(&prop.to_lowercase()).cloned(), s.parent.clone())
        };
        own.or_else(|| parent.and_then(|p| p.property_relation(prop)))
    }

    /// Relation owning `column`, walking up the inheritance chain
    pub fn column_relation(&self, column: &str) -> Option<Relation> {
        let (own, parent) = {
            let s = self.state.read();
            let own = s
                .db2prop
                .get(&column.to_uppercase())
                .and_then(|prop| s.prop2db.get(prop))
                .cloned();
            (own, s.parent.clone())
        };
        own.or_else(|| parent.and_then(|p| p.column_relation(column)))
    }

    /// Property stored in `column`
    pub fn column_name_to_property(&self, column: &str) -> Option<String> {
        self.column_relation(column).map(|rel| rel.prop_name)
    }

    /// Column storing property `prop`. A property mapped to something other
    /// than a column yields None without consulting the parent.
    pub fn property_to_column_name(&self, prop: &str) -> Option<String> {
        self.property_relation(prop).and_then(|rel| rel.column_name)
    }

    /// Names of all mapped properties, inherited ones first
    pub fn property_names(&self) -> Vec<String> {
        let (own, parent) = {
            let s = self.state.read();
            let own: Vec<String> = s
                .property_order
                .iter()
                .filter_map(|p| s.prop2db.get(p).map(|r| r.prop_name.clone()))
                .collect();
            (own, s.parent.clone())
        };
        let mut names = parent.map(|p| p.property_names()).unwrap_or_default();
        for name in own {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                names.push(name);
            }
        }
        names
    }

    fn add_dependent(&self, dependent: Weak<DbMapping>) {
        let mut deps = self.dependents.lock();
        deps.retain(|d| d.strong_count() > 0);
        if !deps.iter().any(|d| d.ptr_eq(&dependent)) {
            deps.push(dependent);
        }
    }

    /// Data change counter of the storage family
    pub fn last_data_change(&self) -> u64 {
        match self.storage_parent() {
            Some(parent) => parent.last_data_change(),
            None => self.last_data_change.load(Ordering::SeqCst),
        }
    }

    /// Record a write to this mapping's storage and tell mappings that join
    /// on it
    pub fn set_last_data_change(&self) {
        self.bump_data_change();
        let deps: Vec<Arc<DbMapping>> = self
            .dependents
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for dep in deps {
            dep.set_indirect_data_change();
        }
    }

    /// Record a change of data this mapping reads through a join
    pub fn set_indirect_data_change(&self) {
        self.bump_data_change();
    }

    fn bump_data_change(&self) {
        match self.storage_parent() {
            Some(parent) => parent.bump_data_change(),
            None => {
                self.last_data_change.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Register `type_name` under extension id `ext_id` with the storage
    /// owner
    pub fn register_extension(self: &Arc<Self>, ext_id: &str, type_name: &str) {
        let owner = self.storage_owner();
        debug!(owner = %owner.type_name, ext_id, type_name, "Registered extension");
        owner
            .extensions
            .write()
            .insert(ext_id.to_string(), type_name.to_string());
    }

    /// Extension ids stored in this mapping's table
    pub fn extensions(self: &Arc<Self>) -> Vec<String> {
        let owner = self.storage_owner();
        let mut ids: Vec<String> = owner.extensions.read().keys().cloned().collect();
        if let Some(own) = owner.extension_id() {
            if !ids.contains(&own) {
                ids.push(own);
            }
        }
        ids
    }

    /// Prototype registered for extension id `ext_id`
    pub fn prototype_name(self: &Arc<Self>, ext_id: &str) -> Option<String> {
        let owner = self.storage_owner();
        if owner.extension_id().as_deref() == Some(ext_id) {
            return Some(owner.type_name.clone());
        }
        let found = owner.extensions.read().get(ext_id).cloned();
        found
    }

    /// Column metadata of the table, fetched once per type change
    pub fn columns(&self, source: &dyn DbSource) -> Result<Arc<Vec<DbColumn>>> {
        if let Some(cols) = self.columns.read().clone() {
            return Ok(cols);
        }

        let table = self.require_table()?;
        let id = self.id_column();
        let name = self.name_column();
        let proto = self.prototype_column();

        let cols: Vec<DbColumn> = source
            .columns(&table)?
            .into_iter()
            .map(|col| {
                let role = if col.name().eq_ignore_ascii_case(&id) {
                    ColumnRole::Id
                } else if name.as_deref().map_or(false, |n| col.name().eq_ignore_ascii_case(n)) {
                    ColumnRole::Name
                } else if proto.as_deref().map_or(false, |p| col.name().eq_ignore_ascii_case(p)) {
                    ColumnRole::Prototype
                } else {
                    match self.column_relation(col.name()) {
                        Some(rel) if rel.claims_column() => ColumnRole::Property(rel.prop_name),
                        _ => ColumnRole::Unmapped,
                    }
                };
                col.with_role(role)
            })
            .collect();

        debug!(prototype = %self.type_name, table = %table, columns = cols.len(), "Read column metadata");
        let cols = Arc::new(cols);
        *self.columns.write() = Some(cols.clone());
        Ok(cols)
    }

    /// Metadata of one column
    pub fn column(&self, name: &str, source: &dyn DbSource) -> Result<Option<DbColumn>> {
        Ok(self
            .columns(source)?
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .cloned())
    }

    /// Columns written by inserts and updates, in table order
    pub fn mapped_columns(&self, source: &dyn DbSource) -> Result<Vec<DbColumn>> {
        Ok(self
            .columns(source)?
            .iter()
            .filter(|c| c.is_mapped())
            .cloned()
            .collect())
    }

    /// Whether literals for `column` must be quoted
    pub fn needs_quotes(&self, column: &str, source: &dyn DbSource) -> Result<bool> {
        match self.column(column, source)? {
            Some(col) => Ok(col.needs_quotes()),
            None => Err(Error::invalid_input(format!(
                "Column {} not found in {}",
                column,
                self.table_name().unwrap_or_default()
            ))),
        }
    }

    fn require_table(&self) -> Result<String> {
        self.table_name()
            .ok_or_else(|| MappingError::MissingTable(self.type_name.clone()).into())
    }

    fn join_clauses(&self, table: &str) -> Vec<JoinClause> {
        let (own, parent) = {
            let s = self.state.read();
            (s.joins.clone(), s.parent.clone())
        };
        let mut joins = Vec::new();
        if self.inherits_storage() {
            if let Some(parent) = parent {
                joins = parent.join_clauses(table);
            }
        }

        for (rel, target) in own {
            let Some(other_table) = target.table_name() else {
                warn!(prototype = %self.type_name, property = %rel.prop_name, "Join target has no table");
                continue;
            };
            let alias = JoinClause::alias_for(&rel.prop_name);
            let pairs = rel
                .constraints
                .iter()
                .map(|c| {
                    let local = if c.local_is_id() { self.id_column() } else { c.local.clone() };
                    let foreign = if c.foreign_is_id() { target.id_column() } else { c.foreign.clone() };
                    (format!("{}.{}", table, local), format!("{}.{}", alias, foreign))
                })
                .collect();
            joins.push(JoinClause {
                table: other_table,
                alias,
                pairs,
            });
        }
        joins
    }

    /// Aliases and target mappings of aggressively joined references
    pub fn joined_references(&self) -> Vec<(String, Relation, Arc<DbMapping>)> {
        let (own, parent) = {
            let s = self.state.read();
            (s.joins.clone(), s.parent.clone())
        };
        let mut refs = match (self.inherits_storage(), parent) {
            (true, Some(parent)) => parent.joined_references(),
            _ => Vec::new(),
        };
        refs.extend(
            own.into_iter()
                .map(|(rel, target)| (JoinClause::alias_for(&rel.prop_name), rel, target)),
        );
        refs
    }

    /// Select statement for rows of this mapping, including aggressive
    /// joins rendered for `dialect`. Statements without relation specific
    /// parts are cached.
    pub fn select(&self, dialect: Dialect, rel: Option<&Relation>) -> Result<SelectStatement> {
        let cacheable = rel.map_or(true, |r| r.query_hints.is_none() && r.additional_tables.is_none());
        if cacheable {
            if let Some(cached) = self.sql.lock().select.get(&dialect) {
                return Ok(cached.clone());
            }
        }

        let table = self.require_table()?;
        let joins = self.join_clauses(&table);

        let mut sql = String::from("SELECT ");
        if let Some(hints) = rel.and_then(|r| r.query_hints.as_deref()) {
            sql.push_str(hints);
            sql.push(' ');
        }
        sql.push_str(&format!("{}.*", table));
        for join in &joins {
            sql.push_str(&format!(", {}.*", join.alias));
        }
        sql.push_str(" FROM ");
        sql.push_str(&table);

        let renderer = dialect.join_renderer();
        let mut conditions = Vec::new();
        for join in &joins {
            renderer.render_from(&mut sql, join);
            renderer.render_conditions(join, &mut conditions);
        }

        if let Some(tables) = rel.and_then(|r| r.additional_tables.as_deref()) {
            sql.push_str(", ");
            sql.push_str(tables);
        }

        let statement = SelectStatement { sql, conditions };
        if cacheable {
            self.sql.lock().select.insert(dialect, statement.clone());
        }
        Ok(statement)
    }

    /// `INSERT INTO table (...) VALUES (?, ...)` over the mapped columns
    pub fn insert(&self, source: &dyn DbSource) -> Result<String> {
        if let Some(cached) = self.sql.lock().insert.clone() {
            return Ok(cached);
        }
        let table = self.require_table()?;
        let columns = self.mapped_columns(source)?;
        let names: Vec<&str> = columns.iter().map(DbColumn::name).collect();
        let params = vec!["?"; names.len()];
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            names.join(", "),
            params.join(", ")
        );
        self.sql.lock().insert = Some(sql.clone());
        Ok(sql)
    }

    /// `UPDATE table SET ` prefix of update statements
    pub fn update_prefix(&self) -> Result<String> {
        if let Some(cached) = self.sql.lock().update.clone() {
            return Ok(cached);
        }
        let sql = format!("UPDATE {} SET ", self.require_table()?);
        self.sql.lock().update = Some(sql.clone());
        Ok(sql)
    }

    /// Generate a new primary key from the id sequence, or as one above
    /// the largest stored id
    pub fn next_id(&self, source: &dyn DbSource) -> Result<String> {
        if let Some(owner) = self.storage_parent() {
            return owner.next_id(source);
        }

        if let Some(seq) = self.id_sequence() {
            let rows = source.query(&source.dialect().sequence_next(&seq))?;
            return rows
                .first()
                .and_then(|row| row.value_at(0))
                .and_then(SqlValue::as_text)
                .ok_or_else(|| Error::internal(format!("Sequence {} returned no value", seq)));
        }

        let table = self.require_table()?;
        let id = self.id_column();
        let rows = source.query(&format!("SELECT MAX({}.{}) FROM {}", table, id, table))?;
        let stored = rows
            .first()
            .and_then(|row| row.value_at(0))
            .and_then(SqlValue::as_integer)
            .unwrap_or(0);

        let mut last = self.last_id.lock();
        *last = (*last + 1).max(stored + 1);
        Ok(last.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::properties::StaticSource;
    use crate::mapping::registry::MappingRegistry;

    fn registry(defs: &[(&str, &[(&str, &str)])]) -> MappingRegistry {
        let registry = MappingRegistry::new("ID");
        for (name, pairs) in defs {
            registry.register(name, Box::new(StaticSource::from_pairs(pairs.iter().copied())));
        }
        registry.update_all().unwrap();
        registry
    }

    #[test]
    fn test_inheritance_resolution() {
        let reg = registry(&[
            ("C", &[("_db", "main"), ("_table", "THING"), ("created", "CREATED")]),
            ("B", &[("_extends", "C"), ("title", "TITLE")]),
            ("A", &[("_extends", "B"), ("body", "BODY")]),
        ]);
        let a = reg.get("A").unwrap();

        assert_eq!(a.property_to_column_name("body").as_deref(), Some("BODY"));
        assert_eq!(a.property_to_column_name("title").as_deref(), Some("TITLE"));
        assert_eq!(a.property_to_column_name("CREATED").as_deref(), Some("CREATED"));
        assert_eq!(a.column_name_to_property("created").as_deref(), Some("created"));
        assert_eq!(a.property_to_column_name("missing"), None);
        assert_eq!(a.column_name_to_property("MISSING"), None);
        assert!(a.is_instance_of("C"));
        assert_eq!(a.property_names(), vec!["created", "title", "body"]);
    }

    #[test]
    fn test_storage_sharing_detection() {
        let reg = registry(&[
            ("Parent", &[("_db", "main"), ("_table", "NODES")]),
            ("Child", &[("_extends", "Parent"), ("_db", "main"), ("_table", "NODES")]),
            ("Other", &[("_extends", "Parent"), ("_table", "OTHER")]),
        ]);
        let parent = reg.get("Parent").unwrap();
        let child = reg.get("Child").unwrap();
        let other = reg.get("Other").unwrap();

        assert!(child.inherits_storage());
        assert_eq!(child.table_name(), parent.table_name());
        assert_eq!(child.db_source_name(), parent.db_source_name());
        assert_eq!(child.storage_type_name(), "Parent");

        assert!(!other.inherits_storage());
        assert_eq!(other.table_name().as_deref(), Some("OTHER"));
        assert_eq!(other.db_source_name().as_deref(), Some("main"));
        assert_eq!(other.storage_type_name(), "Other");
    }

    #[test]
    fn test_embedded_storage_name() {
        let reg = registry(&[("Page", &[("title", "TITLE")])]);
        let page = reg.get("Page").unwrap();
        assert!(!page.is_relational());
        assert!(page.inherits_storage());
        assert_eq!(page.storage_type_name(), HOP_OBJECT);
    }

    #[test]
    fn test_primitive_wins_over_reference_declared_later() {
        let reg = registry(&[(
            "Story",
            &[
                ("_db", "main"),
                ("_table", "STORY"),
                ("authorId", "AUTHOR_ID"),
                ("author", "object(User)"),
                ("author.local", "AUTHOR_ID"),
                ("author.foreign", "ID"),
            ],
        )]);
        let story = reg.get("Story").unwrap();
        assert_eq!(story.column_name_to_property("AUTHOR_ID").as_deref(), Some("authorId"));
        assert_eq!(
            story.property_relation("author").unwrap().kind,
            RelationKind::ComplexReference
        );
    }

    #[test]
    fn test_primitive_wins_over_reference_declared_earlier() {
        let reg = registry(&[(
            "Story",
            &[
                ("_db", "main"),
                ("_table", "STORY"),
                ("author", "object(User)"),
                ("author.local", "AUTHOR_ID"),
                ("author.foreign", "ID"),
                ("authorId", "AUTHOR_ID"),
            ],
        )]);
        let story = reg.get("Story").unwrap();
        assert_eq!(story.column_name_to_property("AUTHOR_ID").as_deref(), Some("authorId"));
        assert_eq!(
            story.property_relation("author").unwrap().kind,
            RelationKind::ComplexReference
        );
        assert_eq!(
            story.property_relation("authorId").unwrap().kind,
            RelationKind::Primitive
        );
    }

    #[test]
    fn test_duplicate_primitive_later_wins() {
        let reg = registry(&[(
            "Story",
            &[("_db", "main"), ("_table", "STORY"), ("title", "TITLE"), ("headline", "TITLE")],
        )]);
        let story = reg.get("Story").unwrap();
        assert_eq!(story.column_name_to_property("TITLE").as_deref(), Some("headline"));
    }

    #[test]
    fn test_update_only_when_source_changes() {
        let registry = MappingRegistry::new("ID");
        let source = Arc::new(StaticSource::from_pairs([("_db", "main"), ("_table", "A")]));
        registry.register("A", Box::new(SharedSource(source.clone())));
        let mapping = registry.get("A").unwrap();

        assert!(mapping.needs_update());
        assert!(mapping.update(&registry).unwrap());
        assert!(!mapping.needs_update());
        assert!(!mapping.update(&registry).unwrap());
        let first = mapping.select(Dialect::Standard, None).unwrap();

        source.set("_table", "B");
        assert!(mapping.needs_update());
        assert!(mapping.update(&registry).unwrap());
        let second = mapping.select(Dialect::Standard, None).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.sql, "SELECT B.* FROM B");
    }

    #[derive(Debug)]
    struct SharedSource(Arc<StaticSource>);

    impl PropertySource for SharedSource {
        fn last_modified(&self) -> u64 {
            self.0.last_modified()
        }

        fn load(&self) -> Result<crate::mapping::properties::TypeProperties> {
            self.0.load()
        }
    }

    fn join_registry() -> MappingRegistry {
        registry(&[
            ("User", &[("_db", "main"), ("_table", "USERS"), ("_id", "USER_ID")]),
            (
                "Story",
                &[
                    ("_db", "main"),
                    ("_table", "STORY"),
                    ("author", "object(User)"),
                    ("author.local", "AUTHOR_ID"),
                    ("author.foreign", "$id"),
                    ("author.loadmode", "aggressive"),
                ],
            ),
        ])
    }

    #[test]
    fn test_select_with_standard_join() {
        let reg = join_registry();
        let story = reg.get("Story").unwrap();
        let select = story.select(Dialect::Standard, None).unwrap();
        assert_eq!(
            select.sql,
            "SELECT STORY.*, _HLM_author.* FROM STORY LEFT OUTER JOIN USERS _HLM_author \
             ON STORY.AUTHOR_ID = _HLM_author.USER_ID"
        );
        assert!(select.conditions.is_empty());
    }

    #[test]
    fn test_select_with_legacy_join() {
        let reg = join_registry();
        let story = reg.get("Story").unwrap();
        let select = story.select(Dialect::Oracle, None).unwrap();
        assert_eq!(select.sql, "SELECT STORY.*, _HLM_author.* FROM STORY, USERS _HLM_author");
        assert_eq!(
            select.with_conditions(&["STORY.ID = 3".to_string()]),
            "SELECT STORY.*, _HLM_author.* FROM STORY, USERS _HLM_author \
             WHERE STORY.AUTHOR_ID = _HLM_author.USER_ID(+) AND STORY.ID = 3"
        );
    }

    #[test]
    fn test_data_change_propagates_to_dependents() {
        let reg = join_registry();
        let user = reg.get("User").unwrap();
        let story = reg.get("Story").unwrap();

        let before = story.last_data_change();
        user.set_last_data_change();
        assert_eq!(story.last_data_change(), before + 1);
        assert_eq!(user.last_data_change(), 1);
    }

    #[test]
    fn test_extensions_resolve_through_storage_owner() {
        let reg = registry(&[
            ("Item", &[("_db", "main"), ("_table", "ITEM"), ("_prototype", "TYPE"), ("_extensionId", "item")]),
            ("Book", &[("_extends", "Item"), ("_extensionId", "book")]),
            ("Ebook", &[("_extends", "Book"), ("_extensionId", "ebook")]),
        ]);
        let ebook = reg.get("Ebook").unwrap();
        let item = reg.get("Item").unwrap();

        assert_eq!(ebook.prototype_name("book").as_deref(), Some("Book"));
        assert_eq!(item.prototype_name("ebook").as_deref(), Some("Ebook"));
        assert_eq!(item.prototype_name("item").as_deref(), Some("Item"));
        assert_eq!(item.prototype_name("dvd"), None);

        let mut ids = ebook.extensions();
        ids.sort();
        assert_eq!(ids, vec!["book", "ebook", "item"]);
        assert_eq!(ebook.prototype_column().as_deref(), Some("TYPE"));
    }

    #[test]
    fn test_cyclic_inheritance_is_rejected() {
        let registry = MappingRegistry::new("ID");
        registry.register("A", Box::new(StaticSource::from_pairs([("_extends", "B")])));
        registry.register("B", Box::new(StaticSource::from_pairs([("_extends", "A")])));
        let err = registry.get("A").unwrap().update(&registry).unwrap_err();
        assert!(matches!(err, Error::Mapping(MappingError::CyclicInheritance(_))));
    }

    #[test]
    fn test_missing_table_is_config_error() {
        let registry = MappingRegistry::new("ID");
        registry.register("A", Box::new(StaticSource::from_pairs([("_db", "main")])));
        let err = registry.get("A").unwrap().update(&registry).unwrap_err();
        assert!(err.is_config_error());
    }
}
