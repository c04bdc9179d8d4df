//! Snapshot tree model: entries, changes, and problems

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;

/// A node in a snapshot tree.
///
/// Snapshots are immutable once produced; ordered children give the tree a
/// deterministic serialized form, which snapshot deltas depend on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    File {
        digest: Digest,
        executable: bool,
    },
    Symlink {
        target: String,
    },
    Directory {
        children: BTreeMap<String, Entry>,
    },
}

/// Structural violations detected by [`Entry::ensure_valid`].
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("empty name in directory {parent:?}")]
    EmptyName { parent: String },
    #[error("name {name:?} in directory {parent:?} contains a path separator")]
    SeparatorInName { parent: String, name: String },
    #[error("digest of {actual} bytes at {path:?} (expected {expected})")]
    DigestWidth {
        path: String,
        actual: usize,
        expected: usize,
    },
    #[error("empty symlink target at {path:?}")]
    EmptySymlinkTarget { path: String },
}

impl Entry {
    /// An empty directory, the snapshot of an empty root.
    #[must_use]
    pub fn empty_directory() -> Self {
        Self::Directory {
            children: BTreeMap::new(),
        }
    }

    /// Validate the structural invariants of a snapshot tree: child names
    /// are non-empty and separator-free, digests have the expected width,
    /// symlink targets are non-empty.
    ///
    /// # Errors
    /// Returns the first violation found in a deterministic order.
    pub fn ensure_valid(&self, digest_length: usize) -> Result<(), EntryError> {
        self.ensure_valid_at("", digest_length)
    }

    fn ensure_valid_at(&self, path: &str, digest_length: usize) -> Result<(), EntryError> {
        match self {
            Self::File { digest, .. } => {
                if digest.len() != digest_length {
                    return Err(EntryError::DigestWidth {
                        path: path.to_owned(),
                        actual: digest.len(),
                        expected: digest_length,
                    });
                }
            }
            Self::Symlink { target } => {
                if target.is_empty() {
                    return Err(EntryError::EmptySymlinkTarget {
                        path: path.to_owned(),
                    });
                }
            }
            Self::Directory { children } => {
                for (name, child) in children {
                    if name.is_empty() {
                        return Err(EntryError::EmptyName {
                            parent: path.to_owned(),
                        });
                    }
                    if name.contains('/') || name.contains('\\') {
                        return Err(EntryError::SeparatorInName {
                            parent: path.to_owned(),
                            name: name.clone(),
                        });
                    }
                    child.ensure_valid_at(&join(path, name), digest_length)?;
                }
            }
        }
        Ok(())
    }

    /// Collect every file beneath this entry as `(path, digest, executable)`,
    /// with `path` rooted at `prefix`.
    pub fn collect_files(&self, prefix: &str, out: &mut Vec<(String, Digest, bool)>) {
        match self {
            Self::File { digest, executable } => {
                out.push((prefix.to_owned(), digest.clone(), *executable));
            }
            Self::Symlink { .. } => {}
            Self::Directory { children } => {
                for (name, child) in children {
                    child.collect_files(&join(prefix, name), out);
                }
            }
        }
    }

    /// Number of entries in the tree, this one included.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::File { .. } | Self::Symlink { .. } => 1,
            Self::Directory { children } => {
                1 + children.values().map(Entry::count).sum::<usize>()
            }
        }
    }
}

/// Join a relative path and a child name with `/`.
#[must_use]
pub fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_owned()
    } else {
        format!("{path}/{name}")
    }
}

/// A single difference between two snapshots.
///
/// `old` is the expected current state at `path` and `new` the desired
/// state; `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub old: Option<Entry>,
    pub new: Option<Entry>,
}

/// A per-entry, non-fatal failure report from a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub path: String,
    pub reason: String,
}

impl Problem {
    #[must_use]
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;

    fn file(content: &[u8]) -> Entry {
        Entry::File {
            digest: Algorithm::Sha1.digest(content),
            executable: false,
        }
    }

    fn directory(children: Vec<(&str, Entry)>) -> Entry {
        Entry::Directory {
            children: children
                .into_iter()
                .map(|(name, entry)| (name.to_owned(), entry))
                .collect(),
        }
    }

    #[test]
    fn valid_tree() {
        let tree = directory(vec![
            ("hello.txt", file(b"hi\n")),
            ("sub", directory(vec![("nested", file(b"nested"))])),
            (
                "link",
                Entry::Symlink {
                    target: "hello.txt".to_owned(),
                },
            ),
        ]);
        tree.ensure_valid(20).unwrap();
    }

    #[test]
    fn separator_in_name_rejected() {
        let tree = directory(vec![("a/b", file(b"x"))]);
        assert!(matches!(
            tree.ensure_valid(20),
            Err(EntryError::SeparatorInName { .. })
        ));
    }

    #[test]
    fn empty_name_rejected() {
        let tree = directory(vec![("", file(b"x"))]);
        assert!(matches!(
            tree.ensure_valid(20),
            Err(EntryError::EmptyName { .. })
        ));
    }

    #[test]
    fn digest_width_enforced() {
        let tree = directory(vec![("f", file(b"x"))]);
        assert!(tree.ensure_valid(20).is_ok());
        assert!(matches!(
            tree.ensure_valid(32),
            Err(EntryError::DigestWidth { .. })
        ));
    }

    #[test]
    fn collect_files_walks_nested() {
        let tree = directory(vec![
            ("b.txt", file(b"b")),
            ("a", directory(vec![("c.txt", file(b"c"))])),
        ]);
        let mut files = Vec::new();
        tree.collect_files("", &mut files);
        let paths: Vec<_> = files.iter().map(|(p, _, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["a/c.txt", "b.txt"]);
    }

    #[test]
    fn serialized_form_is_deterministic() {
        let tree = directory(vec![("b", file(b"b")), ("a", file(b"a"))]);
        let first = serde_json::to_vec(&tree).unwrap();
        let second = serde_json::to_vec(&tree).unwrap();
        assert_eq!(first, second);
        // BTreeMap ordering puts "a" before "b" regardless of insertion.
        let text = String::from_utf8(first).unwrap();
        assert!(text.find("\"a\"").unwrap() < text.find("\"b\"").unwrap());
    }

    #[test]
    fn count_includes_directories() {
        let tree = directory(vec![("a", directory(vec![("b", file(b"x"))]))]);
        assert_eq!(tree.count(), 3);
    }
}
