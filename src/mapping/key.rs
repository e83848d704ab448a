//! Identity of stored objects
//!
//! A [`Key`] addresses the storage location of a node: the storage name of
//! its (storage-owning) prototype plus either the primary key value or a map
//! of identifying columns. Storage names are interned so that comparisons
//! normally reduce to a pointer check.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Interned storage (table/prototype) name
#[derive(Clone)]
pub struct StorageName(Arc<str>);

impl StorageName {
    /// The name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether both names are the same interned instance
    pub fn same_instance(&self, other: &StorageName) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for StorageName {
    fn eq(&self, other: &Self) -> bool {
        // identity first; names that bypassed the interner fall back to content
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for StorageName {}

impl Hash for StorageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for StorageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for StorageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// String interner handing out shared [`StorageName`] instances
#[derive(Debug, Default)]
pub struct Interner {
    names: DashMap<String, Arc<str>>,
}

impl Interner {
    /// Create an empty interner
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical instance for `name`
    pub fn intern(&self, name: &str) -> StorageName {
        if let Some(existing) = self.names.get(name) {
            return StorageName(existing.value().clone());
        }
        let entry = self
            .names
            .entry(name.to_string())
            .or_insert_with(|| Arc::from(name));
        StorageName(entry.value().clone())
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no name has been interned yet
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Key made of storage name and primary key value
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DbKey {
    storage: StorageName,
    id: String,
}

impl DbKey {
    /// Create a key for `id` in `storage`
    pub fn new(storage: StorageName, id: impl Into<String>) -> Self {
        Self {
            storage,
            id: id.into(),
        }
    }

    /// Storage name
    pub fn storage_name(&self) -> &StorageName {
        &self.storage
    }

    /// Primary key value
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Key made of storage name and a set of identifying column values
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MultiKey {
    storage: StorageName,
    parts: BTreeMap<String, String>,
}

impl MultiKey {
    /// Create a key from column/value pairs
    pub fn new(storage: StorageName, parts: BTreeMap<String, String>) -> Self {
        Self { storage, parts }
    }

    /// Storage name
    pub fn storage_name(&self) -> &StorageName {
        &self.storage
    }

    /// Identifying column values
    pub fn parts(&self) -> &BTreeMap<String, String> {
        &self.parts
    }

    /// Value of one identifying column
    pub fn part(&self, column: &str) -> Option<&str> {
        self.parts.get(column).map(String::as_str)
    }
}

/// Key of a virtual node that only exists below its parent
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SyntheticKey {
    parent: Box<Key>,
    name: String,
}

impl SyntheticKey {
    /// Create a key for child `name` of `parent`
    pub fn new(parent: Key, name: impl Into<String>) -> Self {
        Self {
            parent: Box::new(parent),
            name: name.into(),
        }
    }

    /// Key of the parent node
    pub fn parent(&self) -> &Key {
        &self.parent
    }

    /// Name of the virtual node
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Storage location of a persistent node
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Addressed by primary key
    Db(DbKey),
    /// Addressed by a combination of columns
    Multi(MultiKey),
    /// Virtual child of another node
    Synthetic(SyntheticKey),
}

impl Key {
    /// Shortcut for a primary key based key
    pub fn db(storage: StorageName, id: impl Into<String>) -> Self {
        Key::Db(DbKey::new(storage, id))
    }

    /// Storage name, for synthetic keys the one of the parent
    pub fn storage_name(&self) -> &StorageName {
        match self {
            Key::Db(k) => k.storage_name(),
            Key::Multi(k) => k.storage_name(),
            Key::Synthetic(k) => k.parent().storage_name(),
        }
    }

    /// Identifier string of the addressed object
    pub fn id(&self) -> String {
        match self {
            Key::Db(k) => k.id().to_string(),
            Key::Multi(k) => render_parts(k.parts()),
            Key::Synthetic(k) => k.name().to_string(),
        }
    }

    /// Whether the key addresses a virtual node
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Key::Synthetic(_))
    }
}

fn render_parts(parts: &BTreeMap<String, String>) -> String {
    let inner: Vec<String> = parts.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{{{}}}", inner.join(", "))
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Db(k) => write!(f, "{}[{}]", k.storage, k.id),
            Key::Multi(k) => write!(f, "{}{}", k.storage, render_parts(&k.parts)),
            Key::Synthetic(k) => write!(f, "{}/{}", k.parent, k.name),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(key: &Key) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_interner_returns_same_instance() {
        let interner = Interner::new();
        let a = interner.intern("Story");
        let b = interner.intern("Story");
        assert!(a.same_instance(&b));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_multi_key_depends_on_all_parts() {
        let interner = Interner::new();
        let storage = interner.intern("Membership");
        let mut parts = BTreeMap::new();
        parts.insert("USER_ID".to_string(), "3".to_string());
        parts.insert("GROUP_ID".to_string(), "9".to_string());
        let a = Key::Multi(MultiKey::new(storage.clone(), parts.clone()));

        parts.insert("GROUP_ID".to_string(), "10".to_string());
        let b = Key::Multi(MultiKey::new(storage, parts));
        assert_ne!(a, b);
    }

    #[test]
    fn test_synthetic_key_display() {
        let interner = Interner::new();
        let parent = Key::db(interner.intern("Site"), "7");
        let key = Key::Synthetic(SyntheticKey::new(parent.clone(), "2004"));
        assert_eq!(key.to_string(), "Site[7]/2004");
        assert_eq!(key.storage_name(), parent.storage_name());
        assert!(key.is_synthetic());
    }

    proptest! {
        #[test]
        fn prop_db_key_equality(storage in "[A-Za-z]{1,12}", id in "[0-9]{1,8}") {
            let interner = Interner::new();
            let a = Key::db(interner.intern(&storage), id.clone());
            let b = Key::db(interner.intern(&storage), id.clone());
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(hash_of(&a), hash_of(&b));

            let other_id = Key::db(interner.intern(&storage), format!("{}0", id));
            prop_assert_ne!(&a, &other_id);

            let other_storage = Key::db(interner.intern(&format!("{}X", storage)), id);
            prop_assert_ne!(&a, &other_storage);
        }
    }
}
