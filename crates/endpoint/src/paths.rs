//! State directory layout and root normalization

use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;

/// Environment override for the state directory.
pub const STATE_DIR_ENV: &str = "TANDEM_STATE_DIR";

fn side_name(alpha: bool) -> &'static str {
    if alpha {
        "alpha"
    } else {
        "beta"
    }
}

/// The endpoint's state directory: `$TANDEM_STATE_DIR` if set, otherwise
/// `~/.tandem`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(".tandem"))
        .ok_or_else(|| eyre!("unable to determine home directory"))
}

/// Path of the persistent scan cache for (session, side). Creates the
/// caches directory.
pub fn cache_path(state_dir: &Path, session: &str, alpha: bool) -> Result<PathBuf> {
    let caches = state_dir.join("caches");
    fs::create_dir_all(&caches).wrap_err("unable to create cache directory")?;
    Ok(caches.join(format!("{session}-{}", side_name(alpha))))
}

/// Root of the staging store for (session, side).
#[must_use]
pub fn staging_root(state_dir: &Path, session: &str, alpha: bool) -> PathBuf {
    state_dir
        .join("staging")
        .join(format!("{session}-{}", side_name(alpha)))
}

/// Expand a leading tilde against the user's home directory and resolve
/// the result to a canonical path.
pub fn normalize_root(raw: &str) -> Result<PathBuf> {
    let expanded = if raw == "~" {
        dirs::home_dir().ok_or_else(|| eyre!("unable to determine home directory"))?
    } else if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .ok_or_else(|| eyre!("unable to determine home directory"))?
            .join(rest)
    } else {
        PathBuf::from(raw)
    };
    fs::canonicalize(&expanded)
        .wrap_err_with(|| format!("unable to resolve root path {raw:?}"))
}
