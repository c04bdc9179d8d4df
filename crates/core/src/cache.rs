//! Persistent scan cache
//!
//! Maps root-relative paths to the stat fingerprint and digest recorded by
//! the last successful scan, so unchanged files are not re-read. Persisted
//! with rkyv and rewritten atomically (temp file + rename) after each scan.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

/// Stat fingerprint and digest for one file.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct CacheEntry {
    /// Permission mode at scan time
    pub mode: u32,
    /// Modification time (nanoseconds since UNIX epoch)
    pub mtime_nanos: i64,
    /// File size in bytes
    pub size: u64,
    /// Whether the executable bit was set
    pub executable: bool,
    /// Content digest (width fixed by the session algorithm)
    pub digest: Vec<u8>,
}

/// The scan cache for one endpoint side.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default)]
#[rkyv(derive(Debug))]
pub struct Cache {
    /// Root-relative path -> entry
    pub entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("cache encoding failed: {0}")]
    Encode(String),
    #[error("cache decoding failed: {0}")]
    Decode(String),
    #[error("cache contains an empty path key")]
    EmptyKey,
    #[error("digest of {actual} bytes for {path:?} (expected {expected})")]
    DigestWidth {
        path: String,
        actual: usize,
        expected: usize,
    },
}

impl Cache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a cache from disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or decoded. Absence is
    /// an error here; callers that tolerate it use [`Cache::load_or_empty`].
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let bytes = fs::read(path)?;
        let archived = rkyv::access::<ArchivedCache, RkyvError>(&bytes)
            .map_err(|e| CacheError::Decode(e.to_string()))?;
        rkyv::deserialize::<Self, RkyvError>(archived)
            .map_err(|e| CacheError::Decode(e.to_string()))
    }

    /// Load a cache, replacing absence, decode failure, or validation
    /// failure with an empty cache.
    #[must_use]
    pub fn load_or_empty(path: &Path, digest_length: usize) -> Self {
        match Self::load(path) {
            Ok(cache) if cache.ensure_valid(digest_length).is_ok() => cache,
            _ => Self::new(),
        }
    }

    /// Validate the cache: no empty keys, every digest at the expected
    /// width.
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn ensure_valid(&self, digest_length: usize) -> Result<(), CacheError> {
        for (path, entry) in &self.entries {
            if path.is_empty() {
                return Err(CacheError::EmptyKey);
            }
            if entry.digest.len() != digest_length {
                return Err(CacheError::DigestWidth {
                    path: path.clone(),
                    actual: entry.digest.len(),
                    expected: digest_length,
                });
            }
        }
        Ok(())
    }

    /// Persist the cache atomically: write a sibling temp file, fsync,
    /// rename into place.
    ///
    /// # Errors
    /// Returns an error if encoding or any filesystem step fails.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let bytes = rkyv::to_bytes::<RkyvError>(self)
            .map_err(|e| CacheError::Encode(e.to_string()))?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(digest: Vec<u8>) -> CacheEntry {
        CacheEntry {
            mode: 0o644,
            mtime_nanos: 1_700_000_000_000_000_000,
            size: 42,
            executable: false,
            digest,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");

        let mut cache = Cache::new();
        cache.entries.insert("a/b.txt".to_owned(), entry(vec![1u8; 20]));
        cache.save(&path).unwrap();

        let loaded = Cache::load(&path).unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries["a/b.txt"], cache.entries["a/b.txt"]);
    }

    #[test]
    fn save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");

        let mut cache = Cache::new();
        cache.entries.insert("stale".to_owned(), entry(vec![1u8; 20]));
        cache.save(&path).unwrap();

        let mut cache = Cache::new();
        cache.entries.insert("fresh".to_owned(), entry(vec![2u8; 20]));
        cache.save(&path).unwrap();

        let loaded = Cache::load(&path).unwrap();
        assert!(loaded.entries.contains_key("fresh"));
        assert!(!loaded.entries.contains_key("stale"));
    }

    #[test]
    fn load_or_empty_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::load_or_empty(&dir.path().join("missing"), 20);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn load_or_empty_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        fs::write(&path, b"not an archive").unwrap();
        let cache = Cache::load_or_empty(&path, 20);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn load_or_empty_discards_wrong_digest_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");

        let mut cache = Cache::new();
        cache.entries.insert("f".to_owned(), entry(vec![1u8; 32]));
        cache.save(&path).unwrap();

        assert!(Cache::load_or_empty(&path, 32).entries.contains_key("f"));
        assert!(Cache::load_or_empty(&path, 20).entries.is_empty());
    }

    #[test]
    fn validation_rejects_empty_key() {
        let mut cache = Cache::new();
        cache.entries.insert(String::new(), entry(vec![1u8; 20]));
        assert!(matches!(cache.ensure_valid(20), Err(CacheError::EmptyKey)));
    }
}
