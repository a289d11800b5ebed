//! Filesystem abstraction.
//!
//! The storage core never calls `std::fs` directly: every read/write goes
//! through the [`FileSystem`] trait so that (a) tests can run against an
//! in-memory filesystem instead of touching disk, and (b) an embedding
//! application can supply its own implementation (e.g. one that shells out
//! to a platform file-picker API) without the core caring.

mod memory;
mod native;

pub use memory::InMemoryFileSystem;
pub use native::RealFileSystem;

use std::io::Result;
use std::path::{Path, PathBuf};

/// Metadata about a file, as needed by the pack/snapshot/GC freshness
/// checks. `mtime` must be treated as a hint (for UI display), never as a
/// correctness signal; the timestamps embedded in update/pack/snapshot
/// filenames are authoritative.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// File size in bytes.
    pub size: u64,
    /// Last-modified time, Unix milliseconds.
    pub mtime_ms: i64,
}

/// Abstraction over filesystem operations used by the storage core.
///
/// `Send + Sync` so a single `CoreContext` can be shared across worker
/// threads.
pub trait FileSystem: Send + Sync {
    /// Read an entire file as bytes.
    fn read_binary(&self, path: &Path) -> Result<Vec<u8>>;

    /// Overwrite (or create) a file with the given bytes.
    fn write_binary(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Append one line (the caller's payload plus a trailing `\n`) to a
    /// file, creating it if necessary. Used for activity/deletion logs,
    /// which are append-only.
    fn append_line(&self, path: &Path, line: &str) -> Result<()>;

    /// Delete a file. Not an error if the file does not exist.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Recursively delete a directory tree. Not an error if it does not
    /// exist.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Rename/move a path. Implementations should make this atomic when
    /// the underlying filesystem supports it (same SD root); the core
    /// never relies on atomic rename *across* SD roots.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Recursively copy a directory tree from `from` to `to`, preserving
    /// filenames. Used by the cross-SD move state machine's `copying`
    /// step.
    fn copy_dir_all(&self, from: &Path, to: &Path) -> Result<()>;

    /// Does `path` exist (file or directory)?
    fn exists(&self, path: &Path) -> bool;

    /// Is `path` an existing directory?
    fn is_dir(&self, path: &Path) -> bool;

    /// Create a directory and any missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// List the immediate entries of a directory (file and directory
    /// names only, not full recursion). Returns an empty list if `dir`
    /// does not exist.
    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Stat a file for size/mtime.
    fn stat(&self, path: &Path) -> Result<Stat>;

    /// Read a file as a UTF-8 string (convenience over [`Self::read_binary`]
    /// for small text files like `SD_ID` and append-only logs).
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read_binary(path)?;
        String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// List immediate entries of a directory whose file name matches
    /// `predicate`. Convenience wrapper used by filename-grammar scanners.
    fn list_dir_filtered(
        &self,
        dir: &Path,
        predicate: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<PathBuf>> {
        Ok(self
            .list_dir(dir)?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(&predicate)
            })
            .collect())
    }
}

impl<T: FileSystem + ?Sized> FileSystem for &T {
    fn read_binary(&self, path: &Path) -> Result<Vec<u8>> {
        (**self).read_binary(path)
    }

    fn write_binary(&self, path: &Path, content: &[u8]) -> Result<()> {
        (**self).write_binary(path, content)
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        (**self).append_line(path, line)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        (**self).remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        (**self).remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        (**self).rename(from, to)
    }

    fn copy_dir_all(&self, from: &Path, to: &Path) -> Result<()> {
        (**self).copy_dir_all(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        (**self).is_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        (**self).create_dir_all(path)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        (**self).list_dir(dir)
    }

    fn stat(&self, path: &Path) -> Result<Stat> {
        (**self).stat(path)
    }
}
