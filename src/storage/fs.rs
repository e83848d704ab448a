//! File system access for the embedded database
//!
//! Every file operation of the XML database goes through [`FileOps`] so a
//! test can make a single rename or delete fail and observe what the
//! commit protocol leaves behind.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File operations used by the XML database
pub trait FileOps: Send + Sync + fmt::Debug {
    fn exists(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Whether files can be created in `dir`
    fn is_writable(&self, dir: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Write `contents` to a new, uniquely named temp file in `dir` and
    /// return its path. The file is complete and synced when this returns.
    fn write_temp(&self, dir: &Path, prefix: &str, contents: &[u8]) -> io::Result<PathBuf>;

    /// Write `contents` to `path` directly, replacing it
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// [`FileOps`] backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileOps;

impl FileOps for OsFileOps {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn is_writable(&self, dir: &Path) -> bool {
        fs::metadata(dir)
            .map(|meta| meta.is_dir() && !meta.permissions().readonly())
            .unwrap_or(false)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write_temp(&self, dir: &Path, prefix: &str, contents: &[u8]) -> io::Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempfile_in(dir)?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        Ok(file.into_temp_path().keep()?)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}
