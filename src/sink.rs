//! Scoped output sinks.
//!
//! All filesystem effects of a build are confined to one output root. The
//! root is held as a [`ScopedRoot`]: an open directory handle through which
//! every directory, file and removal is resolved. Callers never join strings
//! onto the root and hand the result to `std::fs`.
//!
//! ## Containment
//!
//! A relative output path is accepted only if every component is a plain
//! name (`.` is ignored). Absolute paths, drive prefixes and `..` segments
//! are rejected with [`SinkError::Escape`] rather than clamped.
//!
//! Resolution below the root goes through [`cap_std::fs::Dir`], which walks
//! one component at a time relative to an open handle and refuses any step
//! that would leave it. Containment therefore holds even if a directory is
//! swapped for a symlink while a write is in flight. Symlinks that already
//! sit inside the root are additionally reported as [`SinkError::Escape`]
//! instead of being written through.
//!
//! ## Directory creation
//!
//! Parent directories are created root-to-leaf, each relative to the handle
//! of the one before. A directory that appears concurrently (another worker
//! writing a sibling) counts as success.

use crate::types::File;
use cap_std::ambient_authority;
use cap_std::fs::{Dir, OpenOptions};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("path escapes the output root: {0:?}")]
    Escape(String),
    #[error("failed to open output root {}: {source}", .path.display())]
    Root { path: PathBuf, source: io::Error },
    #[error("output written before reset")]
    NotReset,
    #[error("failed to inspect {}: {source}", .path.display())]
    Stat { path: PathBuf, source: io::Error },
    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to remove {}: {source}", .path.display())]
    Remove { path: PathBuf, source: io::Error },
    #[error("failed to create file {}: {source}", .path.display())]
    CreateFile { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {source}{}", .path.display(), close_suffix(.close))]
    Write {
        path: PathBuf,
        source: io::Error,
        /// Error from closing the handle after the failed write, if any.
        close: Option<io::Error>,
    },
    #[error("failed to close {}: {source}", .path.display())]
    Close { path: PathBuf, source: io::Error },
    #[error("write of {0:?} cancelled")]
    Cancelled(String),
}

fn close_suffix(close: &Option<io::Error>) -> String {
    close
        .as_ref()
        .map(|err| format!(" (closing also failed: {err})"))
        .unwrap_or_default()
}

/// Destination for the files a pipeline run produces.
///
/// `reset` is called exactly once per run, before the first `write`.
/// `write` may be called concurrently from several workers.
pub trait OutputSink: Send + Sync {
    fn reset(&self) -> Result<(), SinkError>;
    fn write(&self, cancel: &CancellationToken, file: &File) -> Result<(), SinkError>;
}

/// Validate a relative output path and return its components.
///
/// `.` segments are dropped; anything that could leave the root is rejected.
pub fn normalize_relative(path: &str) -> Result<Vec<String>, SinkError> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(name) => match name.to_str() {
                Some(name) => parts.push(name.to_string()),
                None => return Err(SinkError::Escape(path.to_string())),
            },
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SinkError::Escape(path.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(SinkError::Escape(path.to_string()));
    }
    Ok(parts)
}

// ============================================================================
// ScopedRoot
// ============================================================================

/// Capability handle for one directory subtree.
#[derive(Debug)]
pub struct ScopedRoot {
    /// Canonical location of the root, for messages only.
    path: PathBuf,
    dir: Dir,
}

impl ScopedRoot {
    /// Open `path` as a root, creating it and any missing ancestors first.
    pub fn open_or_create(path: &Path) -> Result<Self, SinkError> {
        let root_error = |source: io::Error| SinkError::Root {
            path: path.to_path_buf(),
            source,
        };
        if !path.exists() {
            info!(path = %path.display(), "creating output directory");
            fs::create_dir_all(path).map_err(root_error)?;
        }
        let dir = Dir::open_ambient_dir(path, ambient_authority()).map_err(root_error)?;
        let canonical = path.canonicalize().map_err(root_error)?;
        Ok(Self {
            path: canonical,
            dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn full_path(&self, parts: &[String]) -> PathBuf {
        let mut path = self.path.clone();
        path.extend(parts);
        path
    }

    /// Open the directory at `parts` below the root, creating missing
    /// components on the way.
    pub fn create_dirs(&self, parts: &[String]) -> Result<Dir, SinkError> {
        let mut current = self.dir.try_clone().map_err(|source| SinkError::Root {
            path: self.path.clone(),
            source,
        })?;

        for (depth, name) in parts.iter().enumerate() {
            let here = &parts[..=depth];
            match current.create_dir(name) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if is_symlink(&current, name) {
                        return Err(SinkError::Escape(display_parts(here)));
                    }
                }
                Err(source) => {
                    return Err(SinkError::CreateDir {
                        path: self.full_path(here),
                        source,
                    });
                }
            }

            // The entry may have changed since the check above; `open_dir`
            // still never resolves outside `current`.
            current = match current.open_dir(name) {
                Ok(dir) => dir,
                Err(_) if is_symlink(&current, name) => {
                    return Err(SinkError::Escape(display_parts(here)));
                }
                Err(source) => {
                    return Err(SinkError::CreateDir {
                        path: self.full_path(here),
                        source,
                    });
                }
            };
        }
        Ok(current)
    }

    /// Create or truncate the file at `parts` and write `contents`, creating
    /// parent directories as needed.
    ///
    /// The handle is always flushed and closed; a close failure after a
    /// failed write is reported together with the write error.
    pub fn write_file(&self, parts: &[String], contents: &[u8]) -> Result<(), SinkError> {
        let (name, parents) = parts
            .split_last()
            .ok_or_else(|| SinkError::Escape(String::new()))?;
        let parent = self.create_dirs(parents)?;
        let path = self.full_path(parts);

        if is_symlink(&parent, name) {
            return Err(SinkError::Escape(display_parts(parts)));
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let mut handle = match parent.open_with(name, &options) {
            Ok(handle) => handle,
            Err(_) if is_symlink(&parent, name) => {
                return Err(SinkError::Escape(display_parts(parts)));
            }
            Err(source) => return Err(SinkError::CreateFile { path, source }),
        };

        let written = handle.write_all(contents);
        let closed = handle.sync_all();
        drop(handle);

        match (written, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(source)) => Err(SinkError::Close { path, source }),
            (Err(source), closed) => Err(SinkError::Write {
                path,
                source,
                close: closed.err(),
            }),
        }
    }

    /// Remove everything below the root, keeping the root itself.
    /// Symlinks are removed, never followed.
    pub fn clear(&self) -> Result<(), SinkError> {
        let entries = self.dir.entries().map_err(|source| SinkError::Stat {
            path: self.path.clone(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| SinkError::Stat {
                path: self.path.clone(),
                source,
            })?;
            let name = entry.file_name();
            let path = self.path.join(&name);
            let file_type = entry.file_type().map_err(|source| SinkError::Stat {
                path: path.clone(),
                source,
            })?;

            let removed = if file_type.is_dir() {
                self.dir.remove_dir_all(&name)
            } else {
                self.dir.remove_file(&name)
            };
            removed.map_err(|source| SinkError::Remove { path, source })?;
        }
        Ok(())
    }
}

fn is_symlink(dir: &Dir, name: &str) -> bool {
    dir.symlink_metadata(name)
        .is_ok_and(|meta| meta.file_type().is_symlink())
}

fn display_parts(parts: &[String]) -> String {
    parts.join("/")
}

// ============================================================================
// DirectorySink
// ============================================================================

/// Writes output files below a directory on disk.
pub struct DirectorySink {
    path: PathBuf,
    clean_first: bool,
    root: Mutex<Option<Arc<ScopedRoot>>>,
}

impl DirectorySink {
    /// A sink rooted at `path`. With `clean_first`, every reset empties it.
    pub fn new(path: impl Into<PathBuf>, clean_first: bool) -> Self {
        Self {
            path: path.into(),
            clean_first,
            root: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn root(&self) -> Result<Arc<ScopedRoot>, SinkError> {
        self.root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(SinkError::NotReset)
    }
}

impl OutputSink for DirectorySink {
    /// Reopens the root on every call, so a root that was deleted and
    /// recreated between runs is picked up again.
    fn reset(&self) -> Result<(), SinkError> {
        let mut slot = self
            .root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;

        let root = ScopedRoot::open_or_create(&self.path)?;
        if self.clean_first {
            info!(path = %root.path().display(), "removing contents of output directory");
            root.clear()?;
        }
        *slot = Some(Arc::new(root));
        Ok(())
    }

    fn write(&self, cancel: &CancellationToken, file: &File) -> Result<(), SinkError> {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled(file.path.clone()));
        }

        let root = self.root()?;
        let parts = normalize_relative(&file.path)?;

        info!(path = %file.path, size = file.contents.len(), "writing file");
        root.write_file(&parts, &file.contents)
    }
}

// ============================================================================
// MemorySink
// ============================================================================

/// Keeps output files in memory, keyed by normalized path.
///
/// Used by `check` runs and tests. Path validation matches [`DirectorySink`].
#[derive(Default)]
pub struct MemorySink {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every file written since the last reset.
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files().into_keys().collect()
    }
}

impl OutputSink for MemorySink {
    fn reset(&self) -> Result<(), SinkError> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }

    fn write(&self, cancel: &CancellationToken, file: &File) -> Result<(), SinkError> {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled(file.path.clone()));
        }
        let key = normalize_relative(&file.path)?.join("/");
        debug!(path = %key, size = file.contents.len(), "storing file in memory");
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, file.contents.clone());
        Ok(())
    }
}
