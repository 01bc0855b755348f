//! Key-addressed directory store.
//!
//! Layout: `{root}/{key}/{name}`. Keys and names are untrusted and must each be a
//! single normal path segment. Names starting with `.` are reserved for the scratch
//! directories used by [`BlobStore::publish_entry`] and [`BlobStore::remove_entry`],
//! and are never listed.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::error::{BlockError, BlockResult};

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// Validate that `raw` is usable as one path segment under a store root.
///
/// Rejects empty values, separators, NUL, absolute paths, `.`/`..` and any
/// leading dot.
pub fn sanitize_segment<'a>(field: &'static str, raw: &'a str) -> BlockResult<&'a str> {
    let invalid = || BlockError::InvalidKey {
        field,
        value: raw.to_string(),
    };

    if raw.is_empty() || raw.starts_with('.') || raw.contains(['/', '\\', '\0']) {
        return Err(invalid());
    }

    let mut components = Path::new(raw).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(raw),
        _ => Err(invalid()),
    }
}

/// A directory of named entries, each entry a flat directory of files.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute-or-relative path of an entry, after key sanitation.
    pub fn entry_path(&self, key: &str) -> BlockResult<PathBuf> {
        Ok(self.root.join(sanitize_segment("block id", key)?))
    }

    fn file_path(&self, key: &str, name: &str) -> BlockResult<PathBuf> {
        Ok(self
            .entry_path(key)?
            .join(sanitize_segment("file name", name)?))
    }

    /// Create the root directory if it does not exist yet.
    pub fn ensure_collection(&self) -> BlockResult<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| BlockError::io("create collection", &self.root, e))
    }

    /// Sorted entry keys. A missing root is an empty collection.
    pub fn list_entries(&self) -> BlockResult<Vec<String>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BlockError::io("list", &self.root, e)),
        };

        let mut keys = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| BlockError::io("list", &self.root, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry
                .file_type()
                .map_err(|e| BlockError::io("inspect", entry.path(), e))?;
            if file_type.is_dir() {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn contains(&self, key: &str) -> BlockResult<bool> {
        Ok(self.entry_path(key)?.is_dir())
    }

    /// Sorted file names inside an entry, or `NotFound` if the entry is absent.
    pub fn list_files(&self, key: &str) -> BlockResult<Vec<String>> {
        let dir = self.entry_path(key)?;
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BlockError::NotFound(format!("block {}", key)))
            }
            Err(e) => return Err(BlockError::io("list files of", &dir, e)),
        };

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| BlockError::io("list files of", &dir, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| BlockError::io("inspect", entry.path(), e))?
                .is_file();
            if let (true, Ok(name)) = (is_file, entry.file_name().into_string()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Write (or overwrite) one file, creating the entry directory if needed.
    pub fn write_file(&self, key: &str, name: &str, bytes: &[u8]) -> BlockResult<()> {
        let path = self.file_path(key, name)?;
        let dir = self.entry_path(key)?;
        fs::create_dir_all(&dir).map_err(|e| BlockError::io("create", &dir, e))?;
        fs::write(&path, bytes).map_err(|e| BlockError::io("write", &path, e))
    }

    pub fn read_file(&self, key: &str, name: &str) -> BlockResult<Vec<u8>> {
        let path = self.file_path(key, name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.contains(key)? {
                    Err(BlockError::NotFound(format!("file {} in block {}", name, key)))
                } else {
                    Err(BlockError::NotFound(format!("block {}", key)))
                }
            }
            Err(e) => Err(BlockError::io("read", &path, e)),
        }
    }

    /// Replace an entry with exactly `files`, making it visible in one rename.
    ///
    /// The files are written into a scratch directory under the same root first, so
    /// listings never show a half-written entry. An existing entry is moved aside
    /// only once the new one is fully written, then deleted after the new one is in
    /// place. Between those two renames the key is briefly absent: lock-free readers
    /// may see `NotFound` during a replacement, never a partial entry.
    pub fn publish_entry(&self, key: &str, files: &[(String, Vec<u8>)]) -> BlockResult<()> {
        let target = self.entry_path(key)?;
        for (name, _) in files {
            sanitize_segment("file name", name)?;
        }
        self.ensure_collection()?;

        let staging = self.scratch_path(STAGING_PREFIX);
        fs::create_dir(&staging).map_err(|e| BlockError::io("create", &staging, e))?;

        let written = files.iter().try_for_each(|(name, bytes)| {
            let path = staging.join(name);
            fs::write(&path, bytes).map_err(|e| BlockError::io("write", &path, e))
        });
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let trash = self.scratch_path(TRASH_PREFIX);
        let replaced = match fs::rename(&target, &trash) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(BlockError::io("replace", &target, e));
            }
        };

        if let Err(e) = fs::rename(&staging, &target) {
            if replaced {
                let _ = fs::rename(&trash, &target);
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(BlockError::io("publish", &target, e));
        }

        if replaced {
            fs::remove_dir_all(&trash).map_err(|e| BlockError::io("remove", &trash, e))?;
        }
        Ok(())
    }

    /// Scratch directory names carry no key, so they fit whenever the key does.
    fn scratch_path(&self, prefix: &str) -> PathBuf {
        self.root.join(format!("{}{}", prefix, Uuid::new_v4()))
    }

    /// Delete an entry and everything under it.
    ///
    /// The entry is renamed out of the listing first, then its tree is deleted.
    /// Returns `NotFound` if there was nothing to delete.
    pub fn remove_entry(&self, key: &str) -> BlockResult<()> {
        let target = self.entry_path(key)?;
        let trash = self.scratch_path(TRASH_PREFIX);

        match fs::rename(&target, &trash) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BlockError::NotFound(format!("block {}", key)))
            }
            Err(e) => return Err(BlockError::io("remove", &target, e)),
        }

        fs::remove_dir_all(&trash).map_err(|e| BlockError::io("remove", &trash, e))
    }

    /// Delete scratch directories left behind by an interrupted publish or remove.
    pub fn sweep_scratch(&self) -> BlockResult<usize> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BlockError::io("list", &self.root, e)),
        };

        let mut swept = 0;
        for entry in read_dir {
            let entry = entry.map_err(|e| BlockError::io("list", &self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                let path = entry.path();
                fs::remove_dir_all(&path).map_err(|e| BlockError::io("sweep", &path, e))?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}
