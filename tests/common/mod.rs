//! Shared fixtures for the integration tests

#![allow(dead_code)]

use hopstore::core::Result;
use hopstore::mapping::{DbColumn, SqlType, StaticSource};
use hopstore::storage::{DbSource, FileOps, OsFileOps, Row, SqlValue};
use hopstore::{Config, MappingRegistry, Store};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Store config rooted at `home`
pub fn config(home: &Path) -> Config {
    let mut config = Config::default();
    config.storage.db_home = home.to_path_buf();
    config.cache.capacity = 1000;
    config
}

/// Registry with only the embedded root types
pub fn embedded_registry() -> MappingRegistry {
    let registry = MappingRegistry::new("ID");
    registry.register("HopObject", Box::new(StaticSource::default()));
    registry.register("Root", Box::new(StaticSource::default()));
    registry
}

/// Registry with `Site` and `Story` stored in the `blog` source
pub fn blog_registry() -> MappingRegistry {
    blog_registry_with(&[])
}

/// Blog registry with extra settings for the `Site` type
pub fn blog_registry_with(site_extra: &[(&'static str, &'static str)]) -> MappingRegistry {
    let registry = embedded_registry();
    registry.register(
        "Story",
        Box::new(StaticSource::from_pairs([
            ("_db", "blog"),
            ("_table", "STORY"),
            ("title", "TITLE"),
            ("site", "object(Site)"),
            ("site.local", "SITE_ID"),
            ("site.foreign", "ID"),
        ])),
    );
    let mut site = vec![
        ("_db", "blog"),
        ("_table", "SITE"),
        ("_name", "NAME"),
        ("_children", "collection(Story)"),
        ("_children.foreign", "SITE_ID"),
    ];
    site.extend_from_slice(site_extra);
    registry.register("Site", Box::new(StaticSource::from_pairs(site)));
    registry
}

/// Blog database with one site (id 7) owning `stories` stories with ids
/// 1..=stories. Every statement is recorded.
#[derive(Debug)]
pub struct BlogDb {
    stories: usize,
    pub queries: Mutex<Vec<String>>,
    pub executed: Mutex<Vec<(String, Vec<SqlValue>)>>,
}

impl BlogDb {
    pub fn new(stories: usize) -> Self {
        Self {
            stories,
            queries: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Recorded queries containing `needle`
    pub fn queries_with(&self, needle: &str) -> Vec<String> {
        self.queries.lock().iter().filter(|q| q.contains(needle)).cloned().collect()
    }

    fn story(&self, id: usize) -> Row {
        Row::new()
            .with("ID", SqlValue::Integer(id as i64))
            .with("SITE_ID", SqlValue::Integer(7))
            .with("TITLE", SqlValue::Text(format!("Story {}", id)))
    }
}

fn number_after(sql: &str, marker: &str) -> Option<usize> {
    let start = sql.find(marker)? + marker.len();
    sql[start..]
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|n| n.parse().ok())
}

impl DbSource for BlogDb {
    fn name(&self) -> &str {
        "blog"
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.queries.lock().push(sql.to_string());

        if sql.starts_with("SELECT COUNT(*) FROM STORY") {
            return Ok(vec![Row::new().with("COUNT", SqlValue::Integer(self.stories as i64))]);
        }
        if sql.starts_with("SELECT STORY.ID FROM STORY") {
            let offset = number_after(sql, "OFFSET ").unwrap_or(0);
            let limit = number_after(sql, "LIMIT ").unwrap_or(self.stories);
            return Ok((offset + 1..=self.stories)
                .take(limit)
                .map(|id| Row::new().with("ID", SqlValue::Integer(id as i64)))
                .collect());
        }
        if sql.starts_with("SELECT STORY.*") {
            if let Some(id) = number_after(sql, "STORY.ID = ") {
                return Ok(if (1..=self.stories).contains(&id) {
                    vec![self.story(id)]
                } else {
                    Vec::new()
                });
            }
            if sql.contains("STORY.TITLE = ") {
                return Ok(Vec::new());
            }
            return Ok((1..=self.stories).map(|id| self.story(id)).collect());
        }
        if sql.starts_with("SELECT SITE.*") {
            return Ok(match number_after(sql, "SITE.ID = ") {
                Some(7) => vec![Row::new()
                    .with("ID", SqlValue::Integer(7))
                    .with("NAME", SqlValue::Text("blog".into()))],
                _ => Vec::new(),
            });
        }
        if sql.starts_with("SELECT MAX(STORY.ID)") {
            return Ok(vec![Row::new().with("MAX", SqlValue::Integer(self.stories as i64))]);
        }
        Ok(Vec::new())
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.executed.lock().push((sql.to_string(), params.to_vec()));
        Ok(1)
    }

    fn columns(&self, table: &str) -> Result<Vec<DbColumn>> {
        Ok(match table {
            "SITE" => vec![DbColumn::new("ID", SqlType::Integer), DbColumn::new("NAME", SqlType::Text)],
            _ => vec![
                DbColumn::new("ID", SqlType::Integer),
                DbColumn::new("SITE_ID", SqlType::Integer),
                DbColumn::new("TITLE", SqlType::Text),
            ],
        })
    }
}

/// Store over `registry` with the given file operations
pub fn open_store(home: &Path, registry: MappingRegistry, ops: Arc<dyn FileOps>) -> Store {
    Store::open_with(config(home), registry, ops).unwrap()
}

/// File operations failing every rename of a temp file onto a file with
/// the given name
#[derive(Debug, Default)]
pub struct FaultyFileOps {
    inner: OsFileOps,
    fail_target: Mutex<Option<String>>,
}

impl FaultyFileOps {
    pub fn fail_renames_to(&self, file_name: impl Into<String>) {
        *self.fail_target.lock() = Some(file_name.into());
    }

    pub fn heal(&self) {
        *self.fail_target.lock() = None;
    }
}

impl FileOps for FaultyFileOps {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn is_writable(&self, dir: &Path) -> bool {
        self.inner.is_writable(dir)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.inner.read_to_string(path)
    }

    fn write_temp(&self, dir: &Path, prefix: &str, contents: &[u8]) -> io::Result<PathBuf> {
        self.inner.write_temp(dir, prefix, contents)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.inner.write(path, contents)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let name = to.file_name().and_then(|n| n.to_str());
        let from_temp = from.extension().map_or(false, |e| e == "tmp");
        if from_temp && name.is_some() && name == self.fail_target.lock().as_deref() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected rename failure"));
        }
        self.inner.rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }
}

/// Temp files left in `dir`
pub fn temp_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |e| e == "tmp"))
        .collect()
}
