//! Session versions and the behavior they select

use serde::{Deserialize, Serialize};

use crate::digest::Algorithm;
use crate::scan::SymlinkMode;

/// A session version, negotiated at initialization.
///
/// The version selects the content hash and the default modes for
/// behavior the session parameters leave unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Version {
    /// SHA-1 digests, portable symlinks
    V1,
    /// SHA-256 digests, portable symlinks
    V2,
}

impl Version {
    /// Decode a wire version number. Unknown numbers are unsupported.
    #[must_use]
    pub fn from_wire(version: u32) -> Option<Self> {
        match version {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    /// The content hash algorithm for this version.
    #[must_use]
    pub fn algorithm(self) -> Algorithm {
        match self {
            Self::V1 => Algorithm::Sha1,
            Self::V2 => Algorithm::Sha256,
        }
    }

    /// The symlink handling mode used when the session doesn't override it.
    #[must_use]
    pub fn default_symlink_mode(self) -> SymlinkMode {
        SymlinkMode::Portable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        assert_eq!(Version::from_wire(1), Some(Version::V1));
        assert_eq!(Version::from_wire(2), Some(Version::V2));
        assert_eq!(Version::from_wire(0), None);
        assert_eq!(Version::from_wire(3), None);
    }

    #[test]
    fn digest_widths() {
        assert_eq!(Version::V1.algorithm().digest_length(), 20);
        assert_eq!(Version::V2.algorithm().digest_length(), 32);
    }
}
