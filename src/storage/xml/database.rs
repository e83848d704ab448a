//! One-file-per-node database
//!
//! Layout of the database home:
//!
//! * `<id>.xml`: one node per file
//! * `idgen.xml`: the id counter
//! * `helma.xsl`: stylesheet referenced by every node file
//!
//! Node files are only ever replaced by renaming a complete temp file over
//! them, inside a [`Transaction`].

use crate::core::config::StorageConfig;
use crate::core::{Error, Result, StorageError};
use crate::storage::fs::{FileOps, OsFileOps};
use crate::storage::xml::idgen::XmlIdGenerator;
use crate::storage::xml::reader::read_node;
use crate::storage::xml::record::NodeRecord;
use crate::storage::xml::transaction::{CommitOutcome, Transaction};
use crate::storage::xml::writer::write_node;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

pub const IDGEN_FILE: &str = "idgen.xml";
pub const STYLESHEET_FILE: &str = "helma.xsl";
/// Id of the root node
pub const ROOT_ID: &str = "0";
/// Id of the user root node
pub const USER_ROOT_ID: &str = "1";

const STYLESHEET: &str = include_str!("../../../resources/helma.xsl");

/// Embedded XML node database
#[derive(Debug)]
pub struct XmlDatabase {
    home: PathBuf,
    ops: Arc<dyn FileOps>,
    idgen: XmlIdGenerator,
}

impl XmlDatabase {
    /// Open the database configured in `config`, creating it if needed
    pub fn init(config: &StorageConfig) -> Result<Self> {
        Self::init_with(&config.db_home, config.id_base, Arc::new(OsFileOps))
    }

    /// Open or create the database at `home`.
    ///
    /// Creates the directory and stylesheet when missing, loads or creates
    /// the id generator (never below `id_base`, and never below 1) and
    /// makes sure the root and user root nodes exist.
    pub fn init_with(home: impl AsRef<Path>, id_base: u64, ops: Arc<dyn FileOps>) -> Result<Self> {
        let home = home.as_ref().to_path_buf();

        if !ops.exists(&home) {
            if let Err(e) = ops.create_dir_all(&home) {
                error!(home = %home.display(), error = %e, "Can't create database directory");
                return Err(StorageError::CreateHome(home).into());
            }
        }
        if !ops.is_writable(&home) {
            error!(home = %home.display(), "No write permission for database directory");
            return Err(StorageError::Unwritable(home).into());
        }

        let stylesheet = home.join(STYLESHEET_FILE);
        if !ops.exists(&stylesheet) {
            ops.write(&stylesheet, STYLESHEET.as_bytes())?;
        }

        let base = id_base.max(1);
        let idgen_path = home.join(IDGEN_FILE);
        let idgen = if ops.exists(&idgen_path) {
            let idgen = XmlIdGenerator::load(ops.as_ref(), &idgen_path).map_err(|e| {
                StorageError::Corruption {
                    path: idgen_path.clone(),
                    reason: e.to_string(),
                }
            })?;
            idgen.ensure_at_least(base);
            idgen
        } else {
            XmlIdGenerator::new(base)
        };

        let db = Self { home, ops, idgen };
        db.ensure_root_nodes()?;
        db.flush()?;

        info!(home = %db.home.display(), next_id = db.idgen.value() + 1, "XML database ready");
        Ok(db)
    }

    fn ensure_root_nodes(&self) -> Result<()> {
        let missing_root = !self.exists(ROOT_ID);
        let missing_users = !self.exists(USER_ROOT_ID);
        if !missing_root && !missing_users {
            return Ok(());
        }

        let mut tx = self.begin_transaction();
        if missing_root {
            let mut root = NodeRecord::new(ROOT_ID, Some("Root"));
            root.name = Some("root".to_string());
            self.insert_node(&mut tx, &root)?;
        }
        if missing_users {
            let mut users = NodeRecord::new(USER_ROOT_ID, None);
            users.name = Some("users".to_string());
            self.insert_node(&mut tx, &users)?;
        }
        let outcome = self.commit_transaction(tx);
        if !outcome.failed_writes.is_empty() {
            return Err(StorageError::Transaction("Could not create root nodes".to_string()).into());
        }
        info!(root = missing_root, users = missing_users, "Created root nodes");
        Ok(())
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn file_ops(&self) -> &Arc<dyn FileOps> {
        &self.ops
    }

    pub fn id_generator(&self) -> &XmlIdGenerator {
        &self.idgen
    }

    /// Path of the file holding node `id`
    pub fn node_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(Error::invalid_input(format!("Invalid node id {:?}", id)));
        }
        Ok(self.home.join(format!("{}.xml", id)))
    }

    /// Whether a file for node `id` exists
    pub fn exists(&self, id: &str) -> bool {
        self.node_path(id)
            .map(|path| self.ops.exists(&path))
            .unwrap_or(false)
    }

    /// Next node id
    pub fn new_id(&self) -> String {
        self.idgen.new_id()
    }

    pub fn begin_transaction(&self) -> Transaction {
        Transaction::new(self.ops.clone())
    }

    /// Commit `tx`, then save the id generator if it changed
    pub fn commit_transaction(&self, tx: Transaction) -> CommitOutcome {
        let mut outcome = tx.commit();
        if let Err(e) = self.flush() {
            error!(error = %e, "Could not save id generator");
            outcome.idgen_error = Some(e.to_string());
        }
        outcome
    }

    /// Discard `tx`. Returns the number of temp files removed.
    pub fn abort_transaction(&self, tx: Transaction) -> usize {
        tx.abort()
    }

    /// Save the id generator if dirty
    pub fn flush(&self) -> Result<bool> {
        self.idgen.save(self.ops.as_ref(), &self.home.join(IDGEN_FILE))
    }

    /// Read node `id`; None if there is no such file
    pub fn get_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        let path = self.node_path(id)?;
        if !self.ops.exists(&path) {
            return Ok(None);
        }
        let text = self.ops.read_to_string(&path)?;
        let record = read_node(&text).map_err(|e| StorageError::Corruption {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(record))
    }

    /// The root node
    pub fn get_root(&self) -> Result<Option<NodeRecord>> {
        self.get_node(ROOT_ID)
    }

    /// Write a new node. Fails if its file already exists or is already
    /// written in `tx`.
    pub fn insert_node(&self, tx: &mut Transaction, record: &NodeRecord) -> Result<()> {
        let path = self.node_path(&record.id)?;
        let taken = tx.writes_to(&path) || (self.ops.exists(&path) && !tx.deletes(&path));
        if taken {
            return Err(Error::already_exists(format!("node file {}", path.display())));
        }
        self.stage(tx, path, record)
    }

    /// Write a changed node
    pub fn update_node(&self, tx: &mut Transaction, record: &NodeRecord) -> Result<()> {
        let path = self.node_path(&record.id)?;
        self.stage(tx, path, record)
    }

    /// Delete node `id` on commit
    pub fn delete_node(&self, tx: &mut Transaction, id: &str) -> Result<()> {
        let path = self.node_path(id)?;
        tx.add_delete(path);
        Ok(())
    }

    fn stage(&self, tx: &mut Transaction, path: PathBuf, record: &NodeRecord) -> Result<()> {
        let bytes = write_node(record)?;
        let prefix = format!("{}.xml.", record.id);
        let temp = self.ops.write_temp(&self.home, &prefix, &bytes)?;
        tx.add_write(path, temp);
        Ok(())
    }
}
