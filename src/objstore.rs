//! Object storage boundary for the archiver and snapshotter.
//!
//! Keys are `/`-separated paths. The filesystem backend writes through a
//! temp file and rename, so a key is either absent or complete - the
//! manifest-written-last contract rides on that.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::error::Transience;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ObjectStoreError {
    pub fn transience(&self) -> Transience {
        match self {
            ObjectStoreError::InvalidKey { .. } => Transience::Permanent,
            ObjectStoreError::Io { .. } => Transience::Retryable,
        }
    }
}

pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;
    /// Keys under `prefix`, sorted ascending.
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
    fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.is_empty() {
            return Err(ObjectStoreError::InvalidKey {
                key: key.to_string(),
                reason: "empty".to_string(),
            });
        }
        let mut path = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(ObjectStoreError::InvalidKey {
                    key: key.to_string(),
                    reason: format!("segment {part:?} not allowed"),
                });
            }
            path.push(part);
        }
        Ok(path)
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ObjectStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let tmp = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("obj")
        ));
        fs::write(&tmp, bytes).map_err(|source| ObjectStoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| ObjectStoreError::Io { path, source })?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ObjectStoreError::Io { path, source }),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let root = self.root.clone();
        let start = if prefix.is_empty() {
            root.clone()
        } else {
            self.resolve(prefix)?
        };
        if !start.exists() {
            return Ok(keys);
        }
        collect_keys(&root, &start, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ObjectStoreError::Io { path, source }),
        }
    }
}

fn collect_keys(
    root: &Path,
    dir: &Path,
    keys: &mut Vec<String>,
) -> Result<(), ObjectStoreError> {
    let entries = fs::read_dir(dir).map_err(|source| ObjectStoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ObjectStoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            if path.extension().and_then(|e| e.to_str()).map(|e| e.ends_with("tmp")) == Some(true) {
                continue;
            }
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }
    Ok(())
}
