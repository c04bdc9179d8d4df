//! Content-addressed staging store
//!
//! Holds file payloads received from the remote side until the next
//! transition consumes them. Contents are keyed by digest and sharded by
//! the first digest byte; installs are atomic (temp file + fsync +
//! rename), which makes interrupted stagings recoverable and repeated
//! stores of the same digest no-ops.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::digest::{Algorithm, Digest};

/// A file the controller wants staged: its eventual path and the digest
/// its content must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingSlot {
    pub path: String,
    pub digest: Digest,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{path:?} is not staged")]
    NotStaged { path: String },
    #[error("staged content for {path:?} hashed to {actual}, expected {expected}")]
    DigestMismatch {
        path: String,
        expected: Digest,
        actual: Digest,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// The staging store for one endpoint side.
pub struct Stager {
    root: PathBuf,
    algorithm: Algorithm,
}

impl Stager {
    /// Open (and create if necessary) the store rooted at `root`.
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: PathBuf, algorithm: Algorithm) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, algorithm })
    }

    fn slot_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    /// Whether content with this digest is already staged.
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.slot_path(digest).exists()
    }

    /// The subset of `slots` whose content is not yet staged.
    #[must_use]
    pub fn missing(&self, slots: &[StagingSlot]) -> Vec<StagingSlot> {
        slots
            .iter()
            .filter(|slot| !self.contains(&slot.digest))
            .cloned()
            .collect()
    }

    /// Install a byte stream under its digest.
    ///
    /// The content is hashed while it is written; a mismatch against the
    /// claimed digest discards the temp file. Storing an already-present
    /// digest is a no-op. Concurrent stores of the same digest race on the
    /// final rename; whichever loses simply re-installs identical bytes.
    ///
    /// # Errors
    /// Returns an error on digest mismatch or filesystem failure.
    pub fn store<R: Read>(&self, slot: &StagingSlot, source: &mut R) -> Result<(), StageError> {
        if self.contains(&slot.digest) {
            return Ok(());
        }

        let hex = slot.digest.to_hex();
        fs::create_dir_all(self.root.join(&hex[..2]))?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
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
        if actual != slot.digest {
            return Err(StageError::DigestMismatch {
                path: slot.path.clone(),
                expected: slot.digest.clone(),
                actual,
            });
        }

        temp.as_file().sync_all()?;
        temp.persist(self.slot_path(&slot.digest))
            .map_err(|e| StageError::Io(e.error))?;
        Ok(())
    }

    /// Open staged content for reading.
    ///
    /// # Errors
    /// Returns [`StageError::NotStaged`] if the digest has no content.
    pub fn provide(&self, path: &str, digest: &Digest) -> Result<File, StageError> {
        match File::open(self.slot_path(digest)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StageError::NotStaged {
                path: path.to_owned(),
            }),
            Err(e) => Err(StageError::Io(e)),
        }
    }

    /// Remove all staged content. Idempotent; absence is not an error.
    ///
    /// # Errors
    /// Returns an error if removal or re-creation fails.
    pub fn wipe(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&self.root)
    }
}
