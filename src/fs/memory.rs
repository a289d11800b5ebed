//! In-memory filesystem, for tests that exercise the storage core's
//! sequencing and flag-byte logic without touching disk.

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{FileSystem, Stat};

#[derive(Default)]
struct Inner {
    files: HashMap<PathBuf, Vec<u8>>,
    /// Explicit directory markers, so `list_dir`/`is_dir` work for
    /// directories that exist but are empty.
    dirs: std::collections::HashSet<PathBuf>,
    next_mtime_ms: i64,
}

/// A filesystem held entirely in memory, guarded by a mutex so it can be
/// shared across threads the same way a real SD is shared across
/// instances.
pub struct InMemoryFileSystem {
    inner: Mutex<Inner>,
}

impl InMemoryFileSystem {
    /// Create an empty in-memory filesystem.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn mark_dirs(dirs: &mut std::collections::HashSet<PathBuf>, path: &Path) {
        let mut cur = path.to_path_buf();
        while let Some(parent) = cur.parent() {
            if !dirs.insert(parent.to_path_buf()) {
                break;
            }
            cur = parent.to_path_buf();
        }
    }
}

impl Default for InMemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for InMemoryFileSystem {
    fn read_binary(&self, path: &Path) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{path:?} not found")))
    }

    fn write_binary(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::mark_dirs(&mut inner.dirs, path);
        inner.files.insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::mark_dirs(&mut inner.dirs, path);
        let entry = inner.files.entry(path.to_path_buf()).or_default();
        entry.extend_from_slice(line.as_bytes());
        entry.push(b'\n');
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.files.remove(path);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.files.retain(|p, _| !p.starts_with(path));
        inner.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        // Move any files or directory markers nested under `from`.
        let file_keys: Vec<PathBuf> = inner
            .files
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for key in file_keys {
            if let Ok(rel) = key.strip_prefix(from) {
                let new_key = to.join(rel);
                if let Some(v) = inner.files.remove(&key) {
                    inner.files.insert(new_key, v);
                }
            }
        }
        let dir_keys: Vec<PathBuf> = inner
            .dirs
            .iter()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for key in dir_keys {
            if let Ok(rel) = key.strip_prefix(from) {
                inner.dirs.remove(&key);
                inner.dirs.insert(to.join(rel));
            }
        }
        Self::mark_dirs(&mut inner.dirs, to);
        Ok(())
    }

    fn copy_dir_all(&self, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let file_keys: Vec<PathBuf> = inner
            .files
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for key in file_keys {
            if let Ok(rel) = key.strip_prefix(from) {
                let new_key = to.join(rel);
                let content = inner.files.get(&key).cloned().unwrap();
                Self::mark_dirs(&mut inner.dirs, &new_key);
                inner.files.insert(new_key, content);
            }
        }
        inner.dirs.insert(to.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.files.contains_key(path) || inner.dirs.contains(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.dirs.contains(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.dirs.insert(path.to_path_buf());
        Self::mark_dirs(&mut inner.dirs, path);
        Ok(())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let inner = self.inner.lock().unwrap();
        let mut children = std::collections::BTreeSet::new();
        for path in inner.files.keys().chain(inner.dirs.iter()) {
            if let Ok(rel) = path.strip_prefix(dir)
                && let Some(first) = rel.components().next()
            {
                children.insert(dir.join(first.as_os_str()));
            }
        }
        Ok(children.into_iter().collect())
    }

    fn stat(&self, path: &Path) -> Result<Stat> {
        let mut inner = self.inner.lock().unwrap();
        let size = inner
            .files
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("{path:?} not found")))?;
        // Synthetic, strictly-increasing mtimes so tests exercising
        // freshness windows get deterministic ordering without real time.
        inner.next_mtime_ms += 1;
        Ok(Stat {
            size,
            mtime_ms: inner.next_mtime_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let fs = InMemoryFileSystem::new();
        let p = PathBuf::from("/sd/a.txt");
        fs.write_binary(&p, b"hi").unwrap();
        assert_eq!(fs.read_binary(&p).unwrap(), b"hi");
    }

    #[test]
    fn list_dir_returns_immediate_children_only() {
        let fs = InMemoryFileSystem::new();
        fs.write_binary(&PathBuf::from("/sd/notes/n1/updates/a.yjson"), b"x")
            .unwrap();
        fs.write_binary(&PathBuf::from("/sd/notes/n2/updates/b.yjson"), b"x")
            .unwrap();
        let children = fs.list_dir(&PathBuf::from("/sd/notes")).unwrap();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn rename_moves_whole_subtree() {
        let fs = InMemoryFileSystem::new();
        fs.write_binary(&PathBuf::from("/sd/.moving-n1/updates/a.yjson"), b"x")
            .unwrap();
        fs.rename(
            &PathBuf::from("/sd/.moving-n1"),
            &PathBuf::from("/sd/notes/n1"),
        )
        .unwrap();
        assert!(fs.exists(&PathBuf::from("/sd/notes/n1/updates/a.yjson")));
        assert!(!fs.exists(&PathBuf::from("/sd/.moving-n1/updates/a.yjson")));
    }

    #[test]
    fn remove_file_of_missing_file_is_not_an_error() {
        let fs = InMemoryFileSystem::new();
        fs.remove_file(&PathBuf::from("/sd/nope")).unwrap();
    }
}
