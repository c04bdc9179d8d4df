//! Filesystem transition applier
//!
//! Applies a batch of changes to the root, using the scan cache as the
//! expectation of current on-disk state and the stager as the source of
//! new file content. Each change is verified against its expected old
//! state before mutation and its written content is re-hashed afterwards;
//! failures become per-change problems and never abort the batch.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cache::Cache;
use crate::digest::{Algorithm, Digest};
use crate::model::{join, Change, Entry, Problem};
use crate::scan::metadata_mtime_nanos;
use crate::stage::{StageError, Stager};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("unexpected modification")]
    UnexpectedModification,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("written content hashed to {actual}, expected {expected}")]
    DigestMismatch { expected: Digest, actual: Digest },
    #[error("symlinks are not supported on this platform")]
    SymlinksUnsupported,
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Apply `changes` beneath `root`.
///
/// Removals run first, children before parents; creations and
/// modifications follow, parents before children. Sibling order is
/// lexicographic in both phases. Returns the successfully applied changes
/// and a problem for each failed one.
#[must_use]
pub fn transition(
    root: &Path,
    changes: &[Change],
    cache: &Cache,
    algorithm: Algorithm,
    stager: &Stager,
) -> (Vec<Change>, Vec<Problem>) {
    let applier = Applier {
        root,
        cache,
        algorithm,
        stager,
    };

    let mut removals: Vec<&Change> = changes.iter().filter(|c| c.new.is_none()).collect();
    removals.sort_by(|x, y| y.path.cmp(&x.path));
    let mut updates: Vec<&Change> = changes.iter().filter(|c| c.new.is_some()).collect();
    updates.sort_by(|x, y| x.path.cmp(&y.path));

    let mut applied = Vec::new();
    let mut problems = Vec::new();
    for change in removals.into_iter().chain(updates) {
        match applier.apply(change) {
            Ok(()) => applied.push(change.clone()),
            Err(e) => problems.push(Problem::new(&change.path, e.to_string())),
        }
    }
    (applied, problems)
}

struct Applier<'a> {
    root: &'a Path,
    cache: &'a Cache,
    algorithm: Algorithm,
    stager: &'a Stager,
}

impl Applier<'_> {
    fn full_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn apply(&self, change: &Change) -> Result<(), TransitionError> {
        match (&change.old, &change.new) {
            (None, None) => Ok(()),
            (Some(old), None) => self.remove(&change.path, old),
            (None, Some(new)) => {
                self.verify_expected(&change.path, None)?;
                self.create(&change.path, new)
            }
            (Some(old), Some(new)) => self.replace(&change.path, old, new),
        }
    }

    /// Confirm the on-disk state at `rel` matches `expected` (`None`
    /// meaning absent). Files are compared by digest, trusting the cache
    /// where the stat fingerprint still matches.
    fn verify_expected(
        &self,
        rel: &str,
        expected: Option<&Entry>,
    ) -> Result<(), TransitionError> {
        let full = self.full_path(rel);
        let metadata = match fs::symlink_metadata(&full) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return if expected.is_none() {
                    Ok(())
                } else {
                    Err(TransitionError::UnexpectedModification)
                };
            }
            Err(e) => return Err(e.into()),
        };

        let Some(expected) = expected else {
            return Err(TransitionError::UnexpectedModification);
        };

        match expected {
            Entry::File { digest, .. } => {
                if !metadata.is_file() {
                    return Err(TransitionError::UnexpectedModification);
                }
                if self.file_digest(rel, &full, &metadata)? != *digest {
                    return Err(TransitionError::UnexpectedModification);
                }
            }
            Entry::Symlink { target } => {
                if !metadata.file_type().is_symlink() {
                    return Err(TransitionError::UnexpectedModification);
                }
                let actual = fs::read_link(&full)?;
                if actual.to_str() != Some(target.as_str()) {
                    return Err(TransitionError::UnexpectedModification);
                }
            }
            Entry::Directory { .. } => {
                if !metadata.is_dir() {
                    return Err(TransitionError::UnexpectedModification);
                }
            }
        }
        Ok(())
    }

    fn file_digest(
        &self,
        rel: &str,
        full: &Path,
        metadata: &fs::Metadata,
    ) -> Result<Digest, TransitionError> {
        if let Some(entry) = self.cache.entries.get(rel) {
            if entry.size == metadata.len()
                && metadata_mtime_nanos(metadata).is_ok_and(|m| m == entry.mtime_nanos)
                && entry.digest.len() == self.algorithm.digest_length()
            {
                return Ok(Digest::from_vec(entry.digest.clone()));
            }
        }
        let mut file = File::open(full)?;
        Ok(self.algorithm.digest_reader(&mut file)?)
    }

    fn remove(&self, rel: &str, expected: &Entry) -> Result<(), TransitionError> {
        self.verify_expected(rel, Some(expected))?;
        match expected {
            Entry::File { .. } | Entry::Symlink { .. } => {
                fs::remove_file(self.full_path(rel))?;
            }
            Entry::Directory { children } => {
                for (name, child) in children.iter().rev() {
                    self.remove(&join(rel, name), child)?;
                }
                let full = self.full_path(rel);
                if fs::read_dir(&full)?.next().is_some() {
                    return Err(TransitionError::DirectoryNotEmpty);
                }
                fs::remove_dir(full)?;
            }
        }
        Ok(())
    }

    fn create(&self, rel: &str, entry: &Entry) -> Result<(), TransitionError> {
        match entry {
            Entry::Directory { children } => {
                fs::create_dir(self.full_path(rel))?;
                for (name, child) in children {
                    self.create(&join(rel, name), child)?;
                }
            }
            Entry::File { digest, executable } => {
                self.write_file(rel, digest, *executable)?;
            }
            Entry::Symlink { target } => {
                self.create_symlink(rel, target)?;
            }
        }
        Ok(())
    }

    fn replace(&self, rel: &str, old: &Entry, new: &Entry) -> Result<(), TransitionError> {
        match (old, new) {
            (Entry::File { .. }, Entry::File { digest, executable }) => {
                self.verify_expected(rel, Some(old))?;
                self.write_file(rel, digest, *executable)
            }
            (Entry::Directory { .. }, Entry::Directory { .. }) => {
                // Child-level differences arrive as their own changes; the
                // directory itself carries no replaceable content.
                self.verify_expected(rel, Some(old))
            }
            _ => {
                self.remove(rel, old)?;
                self.create(rel, new)
            }
        }
    }

    /// Pull content for `digest` from the stager and install it at `rel`
    /// via a sibling temp file and rename. The content is re-hashed as it
    /// is written and verified before the rename.
    fn write_file(
        &self,
        rel: &str,
        digest: &Digest,
        executable: bool,
    ) -> Result<(), TransitionError> {
        let full = self.full_path(rel);
        let parent = full
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;

        let mut source = self.stager.provide(rel, digest)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        let mut hasher = self.algorithm.hasher();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = source.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            temp.write_all(&buffer[..read])?;
        }

        let actual = hasher.finalize();
        if actual != *digest {
            return Err(TransitionError::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if executable { 0o755 } else { 0o644 };
            temp.as_file()
                .set_permissions(fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = executable;

        temp.as_file().sync_all()?;
        temp.persist(full).map_err(|e| TransitionError::Io(e.error))?;
        Ok(())
    }

    #[cfg(unix)]
    fn create_symlink(&self, rel: &str, target: &str) -> Result<(), TransitionError> {
        std::os::unix::fs::symlink(target, self.full_path(rel))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn create_symlink(&self, _rel: &str, _target: &str) -> Result<(), TransitionError> {
        Err(TransitionError::SymlinksUnsupported)
    }
}
