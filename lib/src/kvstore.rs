//! A namespaced, synchronously durable mapping of string keys to typed
//! scalars (C1).
//!
//! Writes commit before returning; reads return the last committed value.
//! Unknown keys return the caller-supplied fallback and write failures are
//! logged and ignored, so the rest of the core can treat this store as
//! infallible -- the same "small durable JSON blob behind a lock" shape as
//! `bootupd`'s own statefile, but flattened to a key/value map since this
//! store has no ostree sysroot to anchor a directory-scoped write lock to.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A typed scalar stored in the key-value map.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// A boolean value.
    Bool(bool),
    /// A signed integer value.
    Int(i64),
    /// A UTF-8 string value.
    Str(String),
}

impl Scalar {
    /// Narrow to a bool, if this scalar is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Narrow to an int, if this scalar is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Narrow to a str, if this scalar is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Process-local configuration map, durable across restarts.
#[derive(Debug)]
pub struct KvStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, Scalar>>,
}

impl KvStore {
    /// Open (or lazily create on first write) the store backed by `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = load_map(&path).unwrap_or_default();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    /// Read a bool, or `fallback` if the key is absent or of the wrong type.
    pub fn get_bool(&self, key: &str, fallback: bool) -> bool {
        self.get(key).and_then(|s| s.as_bool()).unwrap_or(fallback)
    }

    /// Read an int, or `fallback` if the key is absent or of the wrong type.
    pub fn get_int(&self, key: &str, fallback: i64) -> i64 {
        self.get(key).and_then(|s| s.as_int()).unwrap_or(fallback)
    }

    /// Read a string, or `fallback` if the key is absent or of the wrong type.
    pub fn get_string(&self, key: &str, fallback: &str) -> String {
        self.get(key)
            .and_then(|s| s.as_str().map(str::to_owned))
            .unwrap_or_else(|| fallback.to_owned())
    }

    fn get(&self, key: &str) -> Option<Scalar> {
        self.map.lock().unwrap().get(key).cloned()
    }

    /// Write a value, committing to disk before returning. Failures are
    /// logged and otherwise ignored.
    pub fn set(&self, key: &str, value: Scalar) {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_owned(), value);
        if let Err(e) = persist_map(&self.path, &map) {
            tracing::warn!("failed to persist kvstore {}: {e:#}", self.path.display());
        }
    }

    /// Convenience setter for bools.
    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, Scalar::Bool(value));
    }

    /// Convenience setter for ints.
    pub fn set_int(&self, key: &str, value: i64) {
        self.set(key, Scalar::Int(value));
    }

    /// Convenience setter for strings.
    pub fn set_string(&self, key: &str, value: impl Into<String>) {
        self.set(key, Scalar::Str(value.into()));
    }
}

fn load_map(path: &Path) -> Option<BTreeMap<String, Scalar>> {
    let data = fs::read(path).ok()?;
    let value: Value = serde_json::from_slice(&data).ok()?;
    serde_json::from_value(value).ok()
}

/// Write `map` to `path` atomically: a temp file in the same directory is
/// written and fsynced, then renamed over the destination.
fn persist_map(path: &Path, map: &BTreeMap<String, Scalar>) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, map)?;
    use std::io::Write;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_returns_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kv.json"));
        assert_eq!(store.get_string("nope", "fallback"), "fallback");
        assert_eq!(store.get_int("nope", 42), 42);
        assert!(!store.get_bool("nope", false));
    }

    #[test]
    fn writes_are_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        {
            let store = KvStore::open(&path);
            store.set_string("name", "work");
            store.set_int("port", 9876);
            store.set_bool("verbose", true);
        }
        let reopened = KvStore::open(&path);
        assert_eq!(reopened.get_string("name", ""), "work");
        assert_eq!(reopened.get_int("port", 0), 9876);
        assert!(reopened.get_bool("verbose", false));
    }

    #[test]
    fn corrupt_file_behaves_like_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        fs::write(&path, b"not json").unwrap();
        let store = KvStore::open(&path);
        assert_eq!(store.get_string("name", "default"), "default");
    }
}
