//! Registry of type mappings and data sources
//!
//! One registry exists per store. It owns the storage name interner, so
//! keys built from different mappings of one storage family share the
//! same interned name.

use crate::core::config::MappingConfig;
use crate::core::{MappingError, Result};
use crate::mapping::db_mapping::{DbMapping, HOP_OBJECT};
use crate::mapping::key::{Interner, Key, StorageName};
use crate::mapping::properties::{FileSource, PropertySource, StaticSource};
use crate::storage::relational::{DbSource, Row, SqlValue};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

/// File name of a prototype's type definition
pub const TYPE_PROPERTIES: &str = "type.properties";

/// All mappings and data sources of one application
pub struct MappingRegistry {
    mappings: RwLock<BTreeMap<String, Arc<DbMapping>>>,
    sources: DashMap<String, Arc<dyn DbSource>>,
    interner: Interner,
    default_id_column: String,
}

impl MappingRegistry {
    /// Create a registry holding only the built-in root prototype
    pub fn new(default_id_column: impl Into<String>) -> Self {
        let registry = Self {
            mappings: RwLock::new(BTreeMap::new()),
            sources: DashMap::new(),
            interner: Interner::new(),
            default_id_column: default_id_column.into(),
        };
        registry.register(HOP_OBJECT, Box::new(StaticSource::default()));
        registry
    }

    /// Create a registry and load the configured application directory
    pub fn from_config(config: &MappingConfig) -> Result<Self> {
        let registry = Self::new(config.default_id_column.clone());
        if let Some(dir) = &config.app_dir {
            registry.load_app_dir(dir)?;
        }
        registry.update_all()?;
        Ok(registry)
    }

    /// Register (or replace) the mapping of `type_name`
    pub fn register(&self, type_name: &str, source: Box<dyn PropertySource>) -> Arc<DbMapping> {
        let mapping = Arc::new(DbMapping::new(type_name, source, self.default_id_column.clone()));
        self.mappings
            .write()
            .insert(type_name.to_string(), mapping.clone());
        debug!(prototype = type_name, "Registered type mapping");
        mapping
    }

    /// Register a mapping for every sub-directory of `dir`, reading its
    /// `type.properties`. Returns the number of prototypes found.
    pub fn load_app_dir(&self, dir: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            error!(dir = %dir.display(), error = %e, "Can't read application directory");
            crate::core::Error::config(format!(
                "Can't read application directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut count = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            self.register(&name, Box::new(FileSource::new(entry.path().join(TYPE_PROPERTIES))));
            count += 1;
        }

        info!(dir = %dir.display(), prototypes = count, "Loaded application directory");
        Ok(count)
    }

    /// Mapping of `type_name`
    pub fn get(&self, type_name: &str) -> Option<Arc<DbMapping>> {
        self.mappings.read().get(type_name).cloned()
    }

    /// Mapping of `type_name`, falling back to the root prototype
    pub fn mapping_for(&self, type_name: Option<&str>) -> Arc<DbMapping> {
        type_name
            .and_then(|name| self.get(name))
            .or_else(|| self.get(HOP_OBJECT))
            .unwrap_or_else(|| self.register(HOP_OBJECT, Box::new(StaticSource::default())))
    }

    /// Mapping of `type_name` or an error naming it
    pub fn require(&self, type_name: &str) -> Result<Arc<DbMapping>> {
        self.get(type_name)
            .ok_or_else(|| MappingError::UnknownPrototype(type_name.to_string()).into())
    }

    /// Registered prototype names
    pub fn names(&self) -> Vec<String> {
        self.mappings.read().keys().cloned().collect()
    }

    /// Update every mapping whose source changed. All mappings are tried;
    /// the first failure is returned.
    pub fn update_all(&self) -> Result<()> {
        let mappings: Vec<Arc<DbMapping>> = self.mappings.read().values().cloned().collect();
        let mut first_err = None;
        for mapping in mappings {
            if let Err(e) = mapping.update(self) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Make sure `mapping` reflects its current source
    pub fn refresh(&self, mapping: &Arc<DbMapping>) -> Result<()> {
        if mapping.needs_update() {
            mapping.update(self)?;
        }
        Ok(())
    }

    /// Register a relational data source under its name
    pub fn register_source(&self, source: Arc<dyn DbSource>) {
        info!(source = source.name(), dialect = %source.dialect(), "Registered data source");
        self.sources.insert(source.name().to_string(), source);
    }

    /// Data source registered as `name`
    pub fn source(&self, name: &str) -> Option<Arc<dyn DbSource>> {
        self.sources.get(name).map(|s| s.value().clone())
    }

    /// Data source `mapping` stores its rows in
    pub fn source_for(&self, mapping: &DbMapping) -> Result<Arc<dyn DbSource>> {
        let name = mapping
            .db_source_name()
            .ok_or_else(|| MappingError::NotRelational(mapping.type_name().to_string()))?;
        self.source(&name).ok_or_else(|| {
            let err = MappingError::UnknownDataSource {
                prototype: mapping.type_name().to_string(),
                source_name: name.clone(),
            };
            error!(error = %err, "Data source missing");
            err.into()
        })
    }

    /// Storage name interner
    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Interned storage name of `mapping`
    pub fn storage_name(&self, mapping: &DbMapping) -> StorageName {
        self.interner.intern(&mapping.storage_type_name())
    }

    /// Key of object `id` stored through `mapping`
    pub fn key_for(&self, mapping: &DbMapping, id: &str) -> Key {
        Key::db(self.storage_name(mapping), id)
    }

    /// Key of an embedded object
    pub fn embedded_key(&self, id: &str) -> Key {
        Key::db(self.interner.intern(HOP_OBJECT), id)
    }

    /// Extension ids a query for `mapping` has to be restricted to: the
    /// ids of the mapping itself and of every prototype extending it. None
    /// when no restriction applies.
    pub fn extension_filter(&self, mapping: &Arc<DbMapping>) -> Option<Vec<String>> {
        if !mapping.inherits_storage() || mapping.prototype_column().is_none() {
            return None;
        }
        let mut ids: Vec<String> = mapping
            .extensions()
            .into_iter()
            .filter(|ext| {
                mapping
                    .prototype_name(ext)
                    .and_then(|name| self.get(&name))
                    .map_or(false, |m| m.is_instance_of(mapping.type_name()))
            })
            .collect();
        ids.sort();
        Some(ids)
    }

    /// Prototype of the object stored in `row`, read from the prototype
    /// column of `mapping`
    pub fn prototype_for_row(&self, mapping: &Arc<DbMapping>, row: &Row) -> String {
        let value = mapping
            .prototype_column()
            .and_then(|col| row.get(&col).and_then(SqlValue::as_text));
        match value {
            Some(value) => mapping
                .prototype_name(&value)
                .or_else(|| self.get(&value).map(|m| m.type_name().to_string()))
                .unwrap_or_else(|| mapping.type_name().to_string()),
            None => mapping.type_name().to_string(),
        }
    }
}

impl std::fmt::Debug for MappingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingRegistry")
            .field("mappings", &self.names())
            .field("sources", &self.sources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_root() {
        let registry = MappingRegistry::new("ID");
        assert!(registry.get(HOP_OBJECT).is_some());
        assert_eq!(registry.mapping_for(Some("Nope")).type_name(), HOP_OBJECT);
        assert!(registry.require("Nope").is_err());
    }

    #[test]
    fn test_load_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Story")).unwrap();
        std::fs::write(
            dir.path().join("Story").join(TYPE_PROPERTIES),
            "_db = blog\n_table = STORY\ntitle = TITLE\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("Page")).unwrap();
        std::fs::write(dir.path().join("README"), "not a prototype").unwrap();

        let registry = MappingRegistry::new("ID");
        assert_eq!(registry.load_app_dir(dir.path()).unwrap(), 2);
        registry.update_all().unwrap();

        let story = registry.get("Story").unwrap();
        assert_eq!(story.table_name().as_deref(), Some("STORY"));
        assert!(!registry.get("Page").unwrap().is_relational());
    }

    #[test]
    fn test_keys_share_interned_storage_name() {
        let registry = MappingRegistry::new("ID");
        registry.register("Parent", Box::new(StaticSource::from_pairs([("_db", "m"), ("_table", "T")])));
        registry.register("Child", Box::new(StaticSource::from_pairs([("_extends", "Parent")])));
        registry.update_all().unwrap();

        let a = registry.key_for(&registry.get("Parent").unwrap(), "5");
        let b = registry.key_for(&registry.get("Child").unwrap(), "5");
        assert_eq!(a, b);
        assert!(a.storage_name().same_instance(b.storage_name()));
    }

    #[test]
    fn test_source_for_unknown_source() {
        let registry = MappingRegistry::new("ID");
        registry.register("Story", Box::new(StaticSource::from_pairs([("_db", "blog"), ("_table", "S")])));
        registry.update_all().unwrap();
        let err = registry.source_for(&registry.get("Story").unwrap()).unwrap_err();
        assert!(err.is_config_error());
        assert!(registry.source_for(&registry.get(HOP_OBJECT).unwrap()).is_err());
    }

    #[test]
    fn test_row_prototype_and_extension_filter() {
        let registry = MappingRegistry::new("ID");
        registry.register(
            "Item",
            Box::new(StaticSource::from_pairs([("_db", "m"), ("_table", "ITEM"), ("_prototype", "KIND")])),
        );
        registry.register("Book", Box::new(StaticSource::from_pairs([("_extends", "Item"), ("_extensionId", "b")])));
        registry.register("Ebook", Box::new(StaticSource::from_pairs([("_extends", "Book"), ("_extensionId", "e")])));
        registry.register("Dvd", Box::new(StaticSource::from_pairs([("_extends", "Item"), ("_extensionId", "d")])));
        registry.update_all().unwrap();

        let item = registry.get("Item").unwrap();
        let book = registry.get("Book").unwrap();
        let row = Row::new().with("ID", SqlValue::Integer(1)).with("KIND", SqlValue::Text("e".into()));
        assert_eq!(registry.prototype_for_row(&item, &row), "Ebook");

        let plain = Row::new().with("KIND", SqlValue::Text("Book".into()));
        assert_eq!(registry.prototype_for_row(&item, &plain), "Book");

        assert_eq!(registry.extension_filter(&item), None);
        assert_eq!(
            registry.extension_filter(&book),
            Some(vec!["b".to_string(), "e".to_string()])
        );
    }
}
