//! Key-value media the persistence adapter writes to.
//!
//! Both media can be given a byte quota; a `put` that would exceed it fails with
//! [`KvError::CapacityExceeded`], which is what triggers the reduced-payload fallback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Minimal byte-oriented storage: put, get, remove.
pub trait KeyValueStore {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KvError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    fn remove(&mut self, key: &str) -> Result<(), KvError>;
}

/// Keys are non-empty and made of ASCII letters, digits, `_` and `-`, so they map
/// onto file names unchanged.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Checks that storing `incoming` bytes, on top of `others` bytes already held
/// under other keys, fits in `quota`.
fn check_quota(quota: Option<u64>, others: u64, incoming: usize) -> Result<(), KvError> {
    let Some(quota) = quota else {
        return Ok(());
    };
    let needed = others + incoming as u64;
    if needed > quota {
        return Err(KvError::CapacityExceeded { needed, quota });
    }
    Ok(())
}

/// In-process medium. Useful for tests and for hosts that persist elsewhere.
#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    entries: HashMap<String, Vec<u8>>,
    quota: Option<u64>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total bytes held across all keys.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            entries: HashMap::new(),
            quota: Some(quota),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl KeyValueStore for MemoryKv {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let others: u64 = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, v)| v.len() as u64)
            .sum();
        check_quota(self.quota, others, value.len())?;
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Stores each key as `<dir>/<key>.json`. Writes go through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
    quota: Option<u64>,
}

impl FileKv {
    /// Opens (and creates if needed) the directory backing this medium.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KvError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| KvError::Io(dir.clone(), e))?;
        Ok(Self { dir, quota: None })
    }

    /// Limits the total bytes of all `.json` files in the directory.
    pub fn with_quota(mut self, quota: Option<u64>) -> Self {
        self.quota = quota;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        if !is_valid_key(key) {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    fn bytes_used_except(&self, except: &Path) -> Result<u64, KvError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| KvError::Io(self.dir.clone(), e))?;
        let mut total = 0;
        for entry in entries {
            let entry = entry.map_err(|e| KvError::Io(self.dir.clone(), e))?;
            let path = entry.path();
            if path == except || path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            total += entry
                .metadata()
                .map_err(|e| KvError::Io(path.clone(), e))?
                .len();
        }
        Ok(total)
    }
}

impl KeyValueStore for FileKv {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        if self.quota.is_some() {
            let others = self.bytes_used_except(&path)?;
            check_quota(self.quota, others, value.len())?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value).map_err(|e| KvError::Io(tmp.clone(), e))?;
        std::fs::rename(&tmp, &path).map_err(|e| KvError::Io(path.clone(), e))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KvError::Io(path, e)),
        }
    }

    fn remove(&mut self, key: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KvError::Io(path, e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage quota exceeded: need {needed} bytes, quota is {quota}")]
    CapacityExceeded { needed: u64, quota: u64 },
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
    #[error("storage I/O error at {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
