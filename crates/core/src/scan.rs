//! Incremental filesystem scanner
//!
//! Walks a synchronization root in deterministic order, honors ignore
//! patterns with directory short-circuiting, reuses digests from the
//! previous scan's cache where the stat fingerprint still matches, and
//! produces an immutable snapshot plus a fresh cache.
//!
//! Scan errors are presumed to be concurrent modification of the tree and
//! are reported as transient; the caller retries.

use std::collections::BTreeMap;
use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Component, Path};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use unicode_normalization::{is_nfc, UnicodeNormalization};

use crate::cache::{Cache, CacheEntry};
use crate::digest::{Algorithm, Digest};
use crate::ignore::{IgnoreCache, IgnoreCacheKey, IgnoreMatcher};
use crate::model::{join, Entry};

/// Cached digests are only reused for files whose modification time is at
/// least this far in the past, so that a write landing within the
/// filesystem's timestamp granularity can't alias a cached entry.
pub const TIMESTAMP_GRANULARITY: Duration = Duration::from_secs(1);

/// Symlink handling for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymlinkMode {
    /// Elide symlinks from snapshots
    Ignore,
    /// Record symlinks whose targets are relative and stay inside the root
    Portable,
    /// Record symlink targets verbatim
    PosixRaw,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("i/o error at {path:?}: {source}")]
    Io { path: String, source: io::Error },
    #[error("non-unicode name in directory {parent:?}")]
    NonUnicodeName { parent: String },
}

/// Everything a scan produces.
pub struct ScanOutcome {
    pub snapshot: Entry,
    pub cache: Cache,
    pub ignore_cache: IgnoreCache,
    pub preserves_executability: bool,
    pub recompose_unicode: bool,
}

/// Scan `root`, reusing `previous` cache entries and `previous_ignores`
/// decisions where possible.
///
/// # Errors
/// Any failure is transient: the walk raced a concurrent modification and
/// the caller should retry.
pub fn scan(
    root: &Path,
    algorithm: Algorithm,
    previous: &Cache,
    matcher: &IgnoreMatcher,
    previous_ignores: &IgnoreCache,
    symlink_mode: SymlinkMode,
) -> Result<ScanOutcome, ScanError> {
    let mut scanner = Scanner {
        root,
        algorithm,
        previous,
        matcher,
        previous_ignores,
        symlink_mode,
        started_nanos: system_time_nanos(SystemTime::now()),
        cache: Cache::new(),
        ignore_cache: IgnoreCache::new(),
        recompose_unicode: false,
    };
    let snapshot = scanner.directory("")?;
    Ok(ScanOutcome {
        snapshot,
        cache: scanner.cache,
        ignore_cache: scanner.ignore_cache,
        preserves_executability: probe_executability_preservation(root),
        recompose_unicode: scanner.recompose_unicode,
    })
}

struct Scanner<'a> {
    root: &'a Path,
    algorithm: Algorithm,
    previous: &'a Cache,
    matcher: &'a IgnoreMatcher,
    previous_ignores: &'a IgnoreCache,
    symlink_mode: SymlinkMode,
    started_nanos: i64,
    cache: Cache,
    ignore_cache: IgnoreCache,
    recompose_unicode: bool,
}

impl Scanner<'_> {
    fn directory(&mut self, rel: &str) -> Result<Entry, ScanError> {
        let full = self.root.join(rel);
        let mut names = Vec::new();
        for dirent in fs::read_dir(&full).map_err(|e| io_at(rel, e))? {
            let dirent = dirent.map_err(|e| io_at(rel, e))?;
            let name = dirent
                .file_name()
                .into_string()
                .map_err(|_| ScanError::NonUnicodeName {
                    parent: rel.to_owned(),
                })?;
            names.push(name);
        }
        names.sort();
        self.note_decomposed_names(&names);

        let mut children = BTreeMap::new();
        for name in names {
            let child_rel = join(rel, &name);
            let child_full = self.root.join(&child_rel);
            let metadata =
                fs::symlink_metadata(&child_full).map_err(|e| io_at(&child_rel, e))?;
            let file_type = metadata.file_type();

            if file_type.is_symlink() {
                if self.ignored(&child_rel, false) {
                    continue;
                }
                if let Some(entry) = self.symlink(&child_rel, &child_full)? {
                    children.insert(name, entry);
                }
            } else if file_type.is_dir() {
                if self.ignored(&child_rel, true) {
                    continue;
                }
                let entry = self.directory(&child_rel)?;
                children.insert(name, entry);
            } else if file_type.is_file() {
                if self.ignored(&child_rel, false) {
                    continue;
                }
                let entry = self.file(&child_rel, &child_full, &metadata)?;
                children.insert(name, entry);
            }
            // Sockets, pipes, and devices are not synchronizable; skip.
        }
        Ok(Entry::Directory { children })
    }

    fn file(&mut self, rel: &str, full: &Path, metadata: &Metadata) -> Result<Entry, ScanError> {
        let size = metadata.len();
        let mtime_nanos = metadata_mtime_nanos(metadata).map_err(|e| io_at(rel, e))?;
        let executable = is_executable(metadata);

        let digest = match self.reusable_digest(rel, size, mtime_nanos) {
            Some(digest) => digest,
            None => {
                let mut file = File::open(full).map_err(|e| io_at(rel, e))?;
                self.algorithm
                    .digest_reader(&mut file)
                    .map_err(|e| io_at(rel, e))?
            }
        };

        self.cache.entries.insert(
            rel.to_owned(),
            CacheEntry {
                mode: permission_mode(metadata),
                mtime_nanos,
                size,
                executable,
                digest: digest.as_bytes().to_vec(),
            },
        );
        Ok(Entry::File { digest, executable })
    }

    fn reusable_digest(&self, rel: &str, size: u64, mtime_nanos: i64) -> Option<Digest> {
        let entry = self.previous.entries.get(rel)?;
        if cache_entry_reusable(
            entry,
            size,
            mtime_nanos,
            self.started_nanos,
            self.algorithm.digest_length(),
        ) {
            Some(Digest::from_vec(entry.digest.clone()))
        } else {
            None
        }
    }

    fn symlink(&mut self, rel: &str, full: &Path) -> Result<Option<Entry>, ScanError> {
        if self.symlink_mode == SymlinkMode::Ignore {
            return Ok(None);
        }
        let target = fs::read_link(full).map_err(|e| io_at(rel, e))?;
        match self.symlink_mode {
            SymlinkMode::Ignore => unreachable!(),
            SymlinkMode::PosixRaw => {
                Ok(target
                    .to_str()
                    .map(|target| Entry::Symlink {
                        target: target.to_owned(),
                    }))
            }
            SymlinkMode::Portable => Ok(portable_symlink_target(rel, &target)
                .map(|target| Entry::Symlink { target })),
        }
    }

    fn ignored(&mut self, rel: &str, directory: bool) -> bool {
        let key = IgnoreCacheKey {
            path: rel.to_owned(),
            directory,
        };
        if let Some(&cached) = self.previous_ignores.get(&key) {
            self.ignore_cache.insert(key, cached);
            return cached;
        }
        let decision = self.matcher.ignored(rel, directory);
        self.ignore_cache.insert(key, decision);
        decision
    }

    /// `names` must be sorted. Flags the scan for Unicode recomposition
    /// when a decomposed name coexists with its NFC form.
    fn note_decomposed_names(&mut self, names: &[String]) {
        if self.recompose_unicode {
            return;
        }
        for name in names {
            if !is_nfc(name) {
                let recomposed: String = name.nfc().collect();
                if recomposed != *name && names.binary_search(&recomposed).is_ok() {
                    self.recompose_unicode = true;
                    return;
                }
            }
        }
    }
}

/// Whether a cached entry can stand in for hashing a file with the given
/// stat fingerprint, observed by a scan that started at `started_nanos`.
fn cache_entry_reusable(
    entry: &CacheEntry,
    size: u64,
    mtime_nanos: i64,
    started_nanos: i64,
    digest_length: usize,
) -> bool {
    entry.size == size
        && entry.mtime_nanos == mtime_nanos
        && entry.digest.len() == digest_length
        && started_nanos.saturating_sub(mtime_nanos) >= TIMESTAMP_GRANULARITY.as_nanos() as i64
}

/// Validate a symlink target under portable mode: relative, no absolute
/// components, never escaping the root. Returns the target string if
/// acceptable.
fn portable_symlink_target(rel: &str, target: &Path) -> Option<String> {
    if target.is_absolute() {
        return None;
    }
    // Depth of the link's parent directory below the root.
    let mut depth = rel.matches('/').count() as isize;
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    target.to_str().map(str::to_owned)
}

/// Probe whether the filesystem holding `directory` preserves the
/// executable bit, by creating a temp file with it set and reading it
/// back.
#[must_use]
pub fn probe_executability_preservation(directory: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let Ok(file) = tempfile::Builder::new()
            .prefix(".tandem-probe-")
            .tempfile_in(directory)
        else {
            return false;
        };
        if file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o700))
            .is_err()
        {
            return false;
        }
        file.as_file()
            .metadata()
            .map(|m| m.permissions().mode() & 0o100 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = directory;
        false
    }
}

/// Modification time as nanoseconds since the UNIX epoch.
pub(crate) fn metadata_mtime_nanos(metadata: &Metadata) -> io::Result<i64> {
    Ok(system_time_nanos(metadata.modified()?))
}

#[allow(clippy::cast_possible_truncation)]
fn system_time_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

fn is_executable(metadata: &Metadata) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        false
    }
}

fn permission_mode(metadata: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

fn io_at(path: &str, source: io::Error) -> ScanError {
    ScanError::Io {
        path: path.to_owned(),
        source,
    }
}
