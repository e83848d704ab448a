//! Type property sources
//!
//! A mapping is described by a `type.properties` file in the prototype's
//! directory. The source reports a modification stamp so that mappings only
//! re-read it after it changed.

use crate::core::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

/// Parsed key/value pairs of a type definition. Lookups ignore case,
/// iteration yields the original spelling in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeProperties {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl TypeProperties {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key.to_lowercase()) {
            // redefinition keeps the first position
            Some(&pos) => self.entries[pos] = (key, value),
            None => {
                self.index.insert(key.to_lowercase(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Value of `key`, ignoring case
    pub fn get(&self, key: &str) -> Option<&str> {
        self.index
            .get(&key.to_lowercase())
            .map(|&pos| self.entries[pos].1.as_str())
            .filter(|value| !value.is_empty())
    }

    /// Value of `key` interpreted as a flag
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some(v) if v.eq_ignore_ascii_case("true"))
    }

    /// Iterate over (key, value) pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse text in java properties syntax
    pub fn parse(text: &str) -> Self {
        let mut props = TypeProperties::new();
        let mut pending = String::new();

        for raw in text.lines() {
            let line = raw.trim_start();
            if pending.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
                continue;
            }

            // an odd number of trailing backslashes continues the line
            let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
            if trailing % 2 == 1 {
                pending.push_str(&line[..line.len() - 1]);
                continue;
            }
            pending.push_str(line);

            let entry = std::mem::take(&mut pending);
            if let Some((key, value)) = split_entry(&entry) {
                props.insert(key, value);
            }
        }

        if !pending.is_empty() {
            if let Some((key, value)) = split_entry(&pending) {
                props.insert(key, value);
            }
        }

        props
    }
}

fn split_entry(line: &str) -> Option<(String, String)> {
    let pos = line.find(|c: char| c == '=' || c == ':')?;
    let key = line[..pos].trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), line[pos + 1..].trim().to_string()))
}

/// Provider of a prototype's type definition
pub trait PropertySource: Send + Sync + std::fmt::Debug {
    /// Stamp that changes whenever the definition changes
    fn last_modified(&self) -> u64;

    /// Read the current definition
    fn load(&self) -> Result<TypeProperties>;
}

/// `type.properties` file on disk; the stamp is the file's mtime in millis
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Source backed by `path`. A missing file reads as an empty definition.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PropertySource for FileSource {
    fn last_modified(&self) -> u64 {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            // never report 0 for an existing file, 0 means "never read"
            .map(|d| (d.as_millis() as u64).max(1))
            .unwrap_or(0)
    }

    fn load(&self) -> Result<TypeProperties> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(TypeProperties::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TypeProperties::new()),
            Err(e) => Err(Error::config(format!(
                "Can't read type definition {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// In-memory definition for mappings registered in code
#[derive(Debug, Default)]
pub struct StaticSource {
    props: RwLock<TypeProperties>,
    stamp: AtomicU64,
}

impl StaticSource {
    /// Source holding `props`
    pub fn new(props: TypeProperties) -> Self {
        Self {
            props: RwLock::new(props),
            stamp: AtomicU64::new(1),
        }
    }

    /// Build a source from (key, value) pairs
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut props = TypeProperties::new();
        for (k, v) in pairs {
            props.insert(k, v);
        }
        Self::new(props)
    }

    /// Change one entry and bump the stamp
    pub fn set(&self, key: &str, value: &str) {
        self.props.write().insert(key, value);
        self.stamp.fetch_add(1, Ordering::SeqCst);
    }
}

impl PropertySource for StaticSource {
    fn last_modified(&self) -> u64 {
        self.stamp.load(Ordering::SeqCst)
    }

    fn load(&self) -> Result<TypeProperties> {
        Ok(self.props.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties() {
        let props = TypeProperties::parse(
            "# story mapping\n\
             _db = blog\n\
             _table=STORY\n\
             ! another comment\n\
             title : TITLE\n\
             _children = collection(Comment)\n\
             _children.filter = IS_ONLINE = 1 \\\n\
                 AND IS_SPAM = 0\n",
        );

        assert_eq!(props.get("_db"), Some("blog"));
        assert_eq!(props.get("_TABLE"), Some("STORY"));
        assert_eq!(props.get("title"), Some("TITLE"));
        assert_eq!(
            props.get("_children.filter"),
            Some("IS_ONLINE = 1 AND IS_SPAM = 0")
        );
        assert_eq!(props.len(), 5);
    }

    #[test]
    fn test_declaration_order() {
        let props = TypeProperties::parse("zeta = Z\nalpha = A\nmid = M\nalpha = A2\n");
        let keys: Vec<&str> = props.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(props.get("ALPHA"), Some("A2"));
    }

    #[test]
    fn test_empty_value_reads_as_missing() {
        let props = TypeProperties::parse("_name =\n");
        assert_eq!(props.get("_name"), None);
    }

    #[test]
    fn test_static_source_stamp() {
        let source = StaticSource::from_pairs([("_table", "A")]);
        let before = source.last_modified();
        source.set("_table", "B");
        assert!(source.last_modified() > before);
        assert_eq!(source.load().unwrap().get("_table"), Some("B"));
    }

    #[test]
    fn test_file_source_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSource::new(dir.path().join("type.properties"));
        assert_eq!(source.last_modified(), 0);
        assert!(source.load().unwrap().is_empty());

        std::fs::write(source.path(), "_table = NEWS\n").unwrap();
        assert!(source.last_modified() > 0);
        assert_eq!(source.load().unwrap().get("_table"), Some("NEWS"));
    }
}
