//! Key-value storage capability for identity records and device tokens.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use crate::{Error, Result};

/// Scoped string storage. Implementations must be safe to share across tasks.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>>;
    fn set(&self, scope: &str, key: &str, value: &str) -> Result<()>;
    fn remove(&self, scope: &str, key: &str) -> Result<()>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&(scope.to_string(), key.to_string())).cloned())
    }

    fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((scope.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn remove(&self, scope: &str, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(scope.to_string(), key.to_string()));
        Ok(())
    }
}

// ── File-backed ──────────────────────────────────────────────────────────────

type FileContents = BTreeMap<String, BTreeMap<String, String>>;

/// JSON file store (`{ scope: { key: value } }`), rewritten atomically on each change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn storage_error(&self, source: std::io::Error) -> Error {
        Error::Storage {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> Result<FileContents> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(FileContents::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| Error::CorruptStore {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileContents::new()),
            Err(e) => Err(self.storage_error(e)),
        }
    }

    fn write(&self, contents: &FileContents) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.storage_error(e))?;
        }
        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(contents)?;
        open_private(&tmp)
            .and_then(|mut file| {
                file.write_all(&json)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| self.storage_error(e))
    }

    fn update(&self, f: impl FnOnce(&mut FileContents)) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut contents = self.read()?;
        f(&mut contents);
        self.write(&contents)
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}

impl KeyValueStore for FileStore {
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .read()?
            .get(scope)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        self.update(|contents| {
            contents
                .entry(scope.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, scope: &str, key: &str) -> Result<()> {
        self.update(|contents| {
            if let Some(entries) = contents.get_mut(scope) {
                entries.remove(key);
                if entries.is_empty() {
                    contents.remove(scope);
                }
            }
        })
    }
}
