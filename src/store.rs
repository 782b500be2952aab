//! On-disk cache store for trimmed metadata documents.
//!
//! One flat file per package under the cache directory: `<encoded>.json`.
//! Scoped names (`@scope/name`) are percent-encoded so the `/` never
//! creates a nested directory.  A raw staging area under `raw/` briefly
//! holds compressed upstream bodies while a trim is in flight.
//!
//! All writes go to a `.tmp` sibling and are renamed into place, so a
//! concurrent reader sees either the prior committed bytes or the new
//! bytes, never a torn file.  Writes to the same key are serialized
//! through a per-key lock; the last writer wins.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Owner of the cache directory.  All filesystem mutation of cached
/// entries goes through this type.
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
    raw_dir: PathBuf,
    write_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    /// Open (and create if missing) the cache directory and its raw
    /// staging subdirectory.
    pub fn open<P: AsRef<Path>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        let raw_dir = cache_dir.join("raw");
        std::fs::create_dir_all(&raw_dir)
            .with_context(|| format!("failed to create cache dir: {}", raw_dir.display()))?;
        Ok(Self {
            cache_dir,
            raw_dir,
            write_locks: Arc::new(DashMap::new()),
        })
    }

    /// Read the cached document for `name`.  A missing file is a normal
    /// miss; any other I/O error propagates.
    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Write the cached document for `name`, replacing any prior entry.
    pub async fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.entry_path(name)?;
        let _held = self.lock_key(name).lock_owned().await;
        write_atomic(&path, bytes).await
    }

    /// Remove the cached document for `name`.  Absent file is not an
    /// error.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name)?;
        let _held = self.lock_key(name).lock_owned().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    /// Return the on-disk length of the entry without reading it, or
    /// `None` when not cached.
    pub async fn size(&self, name: &str) -> Result<Option<u64>> {
        let path = self.entry_path(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to stat {}", path.display())),
        }
    }

    /// Whether `name` is currently cached.
    pub async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.size(name).await?.is_some())
    }

    /// Stage the compressed upstream body for `name` while a trim is in
    /// flight.  An existing staged file (e.g. left behind by a crash
    /// mid-trim) is overwritten.
    pub async fn raw_put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.raw_path(name)?;
        let _held = self.lock_key(&format!("raw/{name}")).lock_owned().await;
        write_atomic(&path, bytes).await
    }

    /// Read the staged body for `name`, if any.
    pub async fn raw_read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.raw_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Remove the staged body for `name`.  Absent file is not an error.
    pub async fn raw_delete(&self, name: &str) -> Result<()> {
        let path = self.raw_path(name)?;
        let _held = self.lock_key(&format!("raw/{name}")).lock_owned().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    /// Path of the cache file for `name`.
    fn entry_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.cache_dir.join(format!("{}.json", encode_name(name))))
    }

    /// Path of the raw staging file for `name`.
    fn raw_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.raw_dir.join(format!("{}.json", encode_name(name))))
    }

    fn lock_key(&self, key: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Whether `name` is acceptable as a cache key.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('\0') && !name.split('/').any(|segment| segment == "..")
}

fn validate_name(name: &str) -> Result<()> {
    if !is_valid_name(name) {
        bail!("invalid package name: {name:?}");
    }
    Ok(())
}

/// Encode a package name into a single flat file-name component.
///
/// Every byte outside `[A-Za-z0-9._-]` is percent-encoded with lowercase
/// hex, so `@scope/name` becomes `%40scope%2fname`.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02x}"));
            }
        }
    }
    out
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent dir for {}", path.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn encode_bare_name() {
        assert_eq!(encode_name("express"), "express");
        assert_eq!(encode_name("lodash.merge"), "lodash.merge");
        assert_eq!(encode_name("string_decoder"), "string_decoder");
    }

    #[test]
    fn encode_scoped_name() {
        assert_eq!(encode_name("@types/node"), "%40types%2fnode");
        assert_eq!(encode_name("@babel/core"), "%40babel%2fcore");
    }

    #[test]
    fn encode_percent_is_escaped() {
        // A literal '%' in a name must not collide with an encoded one.
        assert_eq!(encode_name("a%2fb"), "a%252fb");
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("express"));
        assert!(is_valid_name("@types/node"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("../etc/passwd"));
        assert!(!is_valid_name("a/../b"));
        assert!(!is_valid_name("a\0b"));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        assert_eq!(store.get("express").await.unwrap(), None);
        assert_eq!(store.size("express").await.unwrap(), None);
        assert!(!store.contains("express").await.unwrap());
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        store.put("express", b"{\"name\":\"express\"}").await.unwrap();
        assert_eq!(
            store.get("express").await.unwrap().unwrap(),
            b"{\"name\":\"express\"}"
        );
        assert_eq!(store.size("express").await.unwrap(), Some(18));
        assert!(dir.path().join("express.json").is_file());
    }

    #[tokio::test]
    async fn scoped_name_is_one_flat_file() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        store.put("@types/node", b"{}").await.unwrap();
        assert!(dir.path().join("%40types%2fnode.json").is_file());
        assert!(!dir.path().join("@types").exists());
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        store.put("pkg", b"first").await.unwrap();
        store.put("pkg", b"second").await.unwrap();
        assert_eq!(store.get("pkg").await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        store.put("pkg", b"bytes").await.unwrap();
        store.delete("pkg").await.unwrap();
        assert_eq!(store.get("pkg").await.unwrap(), None);
        // Deleting again is a no-op.
        store.delete("pkg").await.unwrap();
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        assert!(store.put("../escape", b"x").await.is_err());
        assert!(store.get("..").await.is_err());
        assert!(store.delete("a/../b").await.is_err());
    }

    #[tokio::test]
    async fn raw_staging_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        store.raw_put("express", b"compressed").await.unwrap();
        assert!(dir.path().join("raw/express.json").is_file());
        assert_eq!(
            store.raw_read("express").await.unwrap().unwrap(),
            b"compressed"
        );

        // Overwriting a leftover staged file is allowed.
        store.raw_put("express", b"newer").await.unwrap();
        assert_eq!(store.raw_read("express").await.unwrap().unwrap(), b"newer");

        store.raw_delete("express").await.unwrap();
        assert_eq!(store.raw_read("express").await.unwrap(), None);
        store.raw_delete("express").await.unwrap();
    }

    #[tokio::test]
    async fn no_tmp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        store.put("pkg", b"bytes").await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
