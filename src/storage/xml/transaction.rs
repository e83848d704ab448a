//! Write-then-rename transactions of the XML database
//!
//! A [`Transaction`] collects complete temp files together with the node
//! files they replace, plus node files to delete. Nothing under a node's
//! real name is touched before [`Transaction::commit`].

use crate::storage::fs::FileOps;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Replace `target` with `temp`.
///
/// Tries a plain rename first. If that fails while `target` exists, the
/// existing file is moved to `<target>.bak`, the temp renamed into place
/// and the backup removed afterwards. When the second rename fails too the
/// backup is moved back, so `target` keeps its old content and `temp` is
/// left on disk.
pub fn replace_file(ops: &dyn FileOps, temp: &Path, target: &Path) -> io::Result<()> {
    let first = match ops.rename(temp, target) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if !ops.exists(target) {
        return Err(first);
    }

    let backup = backup_path(target);
    ops.rename(target, &backup)?;
    match ops.rename(temp, target) {
        Ok(()) => {
            if let Err(e) = ops.remove_file(&backup) {
                warn!(backup = %backup.display(), error = %e, "Could not remove backup file");
            }
            Ok(())
        }
        Err(e) => {
            if let Err(restore) = ops.rename(&backup, target) {
                error!(
                    file = %target.display(),
                    backup = %backup.display(),
                    error = %restore,
                    "Could not restore backup, original content is in the backup file"
                );
            }
            Err(e)
        }
    }
}

fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// A write that could not be completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedWrite {
    /// File that should have been replaced, unchanged
    pub target: PathBuf,
    /// Complete new content, kept for manual recovery
    pub temp: PathBuf,
    pub error: String,
}

/// Result of committing a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub written: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub failed_writes: Vec<FailedWrite>,
    pub failed_deletes: Vec<PathBuf>,
    /// Set when the id generator could not be saved after the commit
    pub idgen_error: Option<String>,
}

impl CommitOutcome {
    /// Whether every write and delete went through
    pub fn is_clean(&self) -> bool {
        self.failed_writes.is_empty() && self.failed_deletes.is_empty() && self.idgen_error.is_none()
    }
}

#[derive(Debug)]
struct PendingWrite {
    target: PathBuf,
    temp: PathBuf,
}

/// Batch of node file writes and deletes
#[derive(Debug)]
pub struct Transaction {
    ops: Arc<dyn FileOps>,
    writes: Vec<PendingWrite>,
    deletes: Vec<PathBuf>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(ops: Arc<dyn FileOps>) -> Self {
        Self {
            ops,
            writes: Vec::new(),
            deletes: Vec::new(),
            finished: false,
        }
    }

    /// Queue `temp` to replace `target`. A previously queued temp file for
    /// the same target is discarded.
    pub fn add_write(&mut self, target: PathBuf, temp: PathBuf) {
        if let Some(pos) = self.writes.iter().position(|w| w.target == target) {
            let old = self.writes.remove(pos);
            self.discard(&old.temp);
        }
        self.deletes.retain(|d| *d != target);
        self.writes.push(PendingWrite { target, temp });
    }

    /// Queue `target` for deletion, dropping any pending write to it
    pub fn add_delete(&mut self, target: PathBuf) {
        if let Some(pos) = self.writes.iter().position(|w| w.target == target) {
            let old = self.writes.remove(pos);
            self.discard(&old.temp);
        }
        if !self.deletes.contains(&target) {
            self.deletes.push(target);
        }
    }

    /// Whether `target` has a pending write
    pub fn writes_to(&self, target: &Path) -> bool {
        self.writes.iter().any(|w| w.target == target)
    }

    /// Whether `target` is queued for deletion
    pub fn deletes(&self, target: &Path) -> bool {
        self.deletes.iter().any(|d| d == target)
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    /// Move every temp file into place, then delete queued files.
    ///
    /// Failures are logged and reported in the outcome; a failed write
    /// leaves the original file and the temp file on disk.
    pub fn commit(mut self) -> CommitOutcome {
        self.finished = true;
        let mut outcome = CommitOutcome::default();

        for write in std::mem::take(&mut self.writes) {
            match replace_file(self.ops.as_ref(), &write.temp, &write.target) {
                Ok(()) => outcome.written.push(write.target),
                Err(e) => {
                    error!(
                        file = %write.target.display(),
                        temp = %write.temp.display(),
                        error = %e,
                        "Can't rename {} to {}, recover the new content manually from the temp file",
                        write.temp.display(),
                        write.target.display()
                    );
                    outcome.failed_writes.push(FailedWrite {
                        target: write.target,
                        temp: write.temp,
                        error: e.to_string(),
                    });
                }
            }
        }

        for target in std::mem::take(&mut self.deletes) {
            match self.ops.remove_file(&target) {
                Ok(()) => outcome.deleted.push(target),
                Err(e) if e.kind() == io::ErrorKind::NotFound => outcome.deleted.push(target),
                Err(e) => {
                    error!(file = %target.display(), error = %e, "Can't delete node file");
                    outcome.failed_deletes.push(target);
                }
            }
        }

        debug!(
            written = outcome.written.len(),
            deleted = outcome.deleted.len(),
            failed = outcome.failed_writes.len() + outcome.failed_deletes.len(),
            "Committed XML transaction"
        );
        outcome
    }

    /// Discard all temp files. Returns how many were removed.
    pub fn abort(mut self) -> usize {
        self.abort_pending()
    }

    fn abort_pending(&mut self) -> usize {
        self.finished = true;
        self.deletes.clear();
        let writes = std::mem::take(&mut self.writes);
        let mut removed = 0;
        for write in writes {
            if self.discard(&write.temp) {
                removed += 1;
            }
        }
        removed
    }

    fn discard(&self, temp: &Path) -> bool {
        match self.ops.remove_file(temp) {
            Ok(()) => true,
            Err(e) => {
                warn!(temp = %temp.display(), error = %e, "Could not remove temp file");
                false
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.writes.is_empty() {
            warn!(writes = self.writes.len(), "XML transaction dropped without commit, aborting");
            self.abort_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fs::OsFileOps;
    use std::fs;

    fn temp_with(ops: &Arc<dyn FileOps>, dir: &Path, contents: &str) -> PathBuf {
        ops.write_temp(dir, "node.", contents.as_bytes()).unwrap()
    }

    #[test]
    fn test_commit_replaces_targets() {
        let dir = tempfile::tempdir().unwrap();
        let ops: Arc<dyn FileOps> = Arc::new(OsFileOps);
        let target = dir.path().join("5.xml");
        fs::write(&target, "old").unwrap();

        let mut tx = Transaction::new(ops.clone());
        let temp = temp_with(&ops, dir.path(), "new");
        tx.add_write(target.clone(), temp.clone());
        let outcome = tx.commit();

        assert!(outcome.is_clean());
        assert_eq!(outcome.written, vec![target.clone()]);
        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
        assert!(!temp.exists());
    }

    #[test]
    fn test_abort_removes_temps_only() {
        let dir = tempfile::tempdir().unwrap();
        let ops: Arc<dyn FileOps> = Arc::new(OsFileOps);
        let target = dir.path().join("5.xml");
        fs::write(&target, "old").unwrap();

        let mut tx = Transaction::new(ops.clone());
        let temp = temp_with(&ops, dir.path(), "new");
        tx.add_write(target.clone(), temp.clone());
        tx.add_delete(dir.path().join("6.xml"));
        assert_eq!(tx.abort(), 1);

        assert!(!temp.exists());
        assert_eq!(fs::read_to_string(&target).unwrap(), "old");
    }

    #[test]
    fn test_rewrite_discards_older_temp() {
        let dir = tempfile::tempdir().unwrap();
        let ops: Arc<dyn FileOps> = Arc::new(OsFileOps);
        let target = dir.path().join("7.xml");

        let mut tx = Transaction::new(ops.clone());
        let first = temp_with(&ops, dir.path(), "one");
        let second = temp_with(&ops, dir.path(), "two");
        tx.add_write(target.clone(), first.clone());
        tx.add_write(target.clone(), second);
        assert!(!first.exists());
        assert_eq!(tx.write_count(), 1);

        tx.commit();
        assert_eq!(fs::read_to_string(&target).unwrap(), "two");
    }

    #[test]
    fn test_delete_cancels_write() {
        let dir = tempfile::tempdir().unwrap();
        let ops: Arc<dyn FileOps> = Arc::new(OsFileOps);
        let target = dir.path().join("8.xml");
        fs::write(&target, "old").unwrap();

        let mut tx = Transaction::new(ops.clone());
        let temp = temp_with(&ops, dir.path(), "new");
        tx.add_write(target.clone(), temp.clone());
        tx.add_delete(target.clone());
        assert!(!tx.writes_to(&target));
        assert!(tx.deletes(&target));

        let outcome = tx.commit();
        assert_eq!(outcome.deleted, vec![target.clone()]);
        assert!(!target.exists());
        assert!(!temp.exists());
    }

    #[test]
    fn test_dropped_transaction_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let ops: Arc<dyn FileOps> = Arc::new(OsFileOps);
        let temp = temp_with(&ops, dir.path(), "new");
        {
            let mut tx = Transaction::new(ops.clone());
            tx.add_write(dir.path().join("9.xml"), temp.clone());
        }
        assert!(!temp.exists());
        assert!(!dir.path().join("9.xml").exists());
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/db/42.xml")),
            PathBuf::from("/db/42.xml.bak")
        );
    }
}
