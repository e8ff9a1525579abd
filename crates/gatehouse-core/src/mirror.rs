//! File-system mirror port.
//!
//! The mirror is a derived, browsable copy of the store of record. Every write
//! goes through [`Mirror`] so tests can substitute a failing implementation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::layout::{Layout, parse_run_dir_name, run_dir_name};

/// File operations the engine performs on a pipeline root.
///
/// Removals are idempotent: removing a missing path succeeds.
pub trait Mirror: Send + Sync {
    fn layout(&self) -> &Layout;

    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Write a file, creating parent directories. Overwrites.
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Copy one file, creating parent directories. Returns bytes copied.
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64>;

    /// Recursively copy a directory. Returns total bytes copied.
    fn copy_tree(&self, from: &Path, to: &Path) -> io::Result<u64>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_tree(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// Total size of regular files under `path`; 0 if it does not exist.
    fn tree_size(&self, path: &Path) -> u64;

    /// Immediate children of a directory, sorted. Empty if it does not exist.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Point `runs/latest` at a run version, or remove it for `None`.
    fn point_latest(&self, run_version: Option<i64>) -> io::Result<()>;

    /// Version `runs/latest` currently points at.
    fn read_latest(&self) -> Option<i64>;

    /// Create the directory skeleton of the pipeline root.
    fn initialize(&self) -> io::Result<()> {
        for dir in self.layout().skeleton() {
            self.create_dir(&dir)?;
        }
        Ok(())
    }
}

/// Write `value` as pretty-printed JSON.
pub fn write_json<T: Serialize + ?Sized>(
    mirror: &dyn Mirror,
    path: &Path,
    value: &T,
) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    mirror.write_file(path, &bytes)
}

/// [`Mirror`] backed by the local file system.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    layout: Layout,
}

impl LocalMirror {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

impl Mirror for LocalMirror {
    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Readers never see a half-written file.
        let staging = temp_sibling(path);
        fs::write(&staging, contents)?;
        if let Err(e) = fs::rename(&staging, path) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        tracing::debug!(path = %path.display(), bytes = contents.len(), "wrote mirror file");
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<u64> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let mut total = 0;
        fs::create_dir_all(to)?;
        for entry in WalkDir::new(from).follow_links(false) {
            let entry = entry.map_err(io::Error::other)?;
            let rel = entry
                .path()
                .strip_prefix(from)
                .map_err(io::Error::other)?;
            let target = to.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target)?;
            } else if file_type.is_file() {
                total += fs::copy(entry.path(), &target)?;
            }
        }
        tracing::debug!(from = %from.display(), to = %to.display(), bytes = total, "copied tree");
        Ok(total)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn remove_tree(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn tree_size(&self, path: &Path) -> u64 {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn point_latest(&self, run_version: Option<i64>) -> io::Result<()> {
        let link = self.layout.latest_link();
        if let Ok(meta) = fs::symlink_metadata(&link) {
            if meta.is_dir() {
                fs::remove_dir_all(&link)?;
            } else {
                fs::remove_file(&link)?;
            }
        }
        let Some(version) = run_version else {
            return Ok(());
        };
        fs::create_dir_all(self.layout.runs_dir())?;

        #[cfg(unix)]
        std::os::unix::fs::symlink(run_dir_name(version), &link)?;

        // Without symlinks the link degrades to a marker file naming the version.
        #[cfg(not(unix))]
        fs::write(&link, run_dir_name(version))?;

        tracing::debug!(version, "repointed runs/latest");
        Ok(())
    }

    fn read_latest(&self) -> Option<i64> {
        let link = self.layout.latest_link();
        let meta = fs::symlink_metadata(&link).ok()?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&link).ok()?;
            let name = target.file_name()?.to_str()?;
            parse_run_dir_name(name)
        } else if meta.is_file() {
            let contents = fs::read_to_string(&link).ok()?;
            parse_run_dir_name(contents.trim())
        } else {
            None
        }
    }
}

/// `.{name}.tmp` next to `path`.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}
