//! Ignore pattern matching via the `ignore` crate
//!
//! Patterns use gitignore syntax: shell globs, `!` negation, trailing `/`
//! for directory-only matches, `**` for any-segment matches. The last
//! matching pattern wins.

use std::collections::HashMap;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use thiserror::Error;

/// Memoized ignore decisions from the last scan, keyed by path and kind.
///
/// Only valid for the pattern list that produced it; callers must discard
/// it when the session's ignore patterns change.
pub type IgnoreCache = HashMap<IgnoreCacheKey, bool>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IgnoreCacheKey {
    pub path: String,
    pub directory: bool,
}

#[derive(Debug, Error)]
pub enum IgnoreError {
    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] ignore::Error),
}

/// Compiled ignore patterns for a session.
pub struct IgnoreMatcher {
    matcher: Gitignore,
}

impl IgnoreMatcher {
    /// Compile a pattern list.
    ///
    /// # Errors
    /// Returns an error if any pattern fails to parse.
    pub fn new(patterns: &[String]) -> Result<Self, IgnoreError> {
        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            builder.add_line(None, pattern)?;
        }
        Ok(Self {
            matcher: builder.build()?,
        })
    }

    /// Whether a root-relative path is ignored.
    #[must_use]
    pub fn ignored(&self, path: &str, directory: bool) -> bool {
        self.matcher.matched(path, directory).is_ignore()
    }
}
