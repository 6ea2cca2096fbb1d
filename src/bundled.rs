//! Bundled runtime assets.
//!
//! The canonical schema document and the Python guest harness are embedded
//! directly into the binary, so a plain `fosrun run script.fos` works
//! without any installation step. Assets that must exist on disk (the
//! harness is handed to `python3` by path) are unpacked once per crate
//! version into a stamped cache directory; a later run that finds the
//! stamp skips the unpack entirely.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use include_dir::{Dir, include_dir};

/// Embedded assets directory.
static ASSETS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/assets");

/// One unpack attempt per process; the error is kept as text so the
/// result can be handed out repeatedly.
static UNPACKED: OnceLock<Result<PathBuf, String>> = OnceLock::new();

/// Marker file written after a complete unpack.
const STAMP_FILE: &str = ".complete";

/// Result type for bundled asset operations.
pub type BundledResult<T> = Result<T, BundledError>;

/// Errors that can occur while unpacking bundled assets.
#[derive(Debug, thiserror::Error)]
pub enum BundledError {
    /// The asset cache could not be created or written.
    #[error("Failed to unpack bundled assets: {0}")]
    Unpack(String),

    /// Requested asset is not bundled.
    #[error("Asset not bundled: {0}")]
    AssetNotFound(String),
}

/// Returns the embedded default schema document.
pub fn default_schema() -> &'static str {
    ASSETS_DIR
        .get_file("schema.json")
        .and_then(|f| f.contents_utf8())
        .expect("schema.json is embedded at build time")
}

/// Picks the cache base directory.
///
/// `FOSRUN_CACHE_DIR` overrides everything. Otherwise `$XDG_CACHE_HOME`
/// wins when set, then the platform's conventional per-user cache
/// location, and finally the system temp directory.
fn cache_root() -> PathBuf {
    if let Some(dir) = env::var_os("FOSRUN_CACHE_DIR") {
        return PathBuf::from(dir);
    }

    let home_var = if cfg!(windows) { "LOCALAPPDATA" } else { "HOME" };
    let base = env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            let home = PathBuf::from(env::var_os(home_var)?);
            Some(if cfg!(target_os = "macos") {
                home.join("Library").join("Caches")
            } else if cfg!(windows) {
                home
            } else {
                home.join(".cache")
            })
        })
        .unwrap_or_else(env::temp_dir);

    base.join("fosrun")
}

/// Writes every embedded asset below `dir`, then the stamp.
fn unpack_into(dir: &Path) -> std::io::Result<()> {
    for file in ASSETS_DIR.files() {
        let target = dir.join(file.path());
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, file.contents())?;
    }
    fs::write(dir.join(STAMP_FILE), env!("CARGO_PKG_VERSION"))
}

/// Unpacks the assets once and returns the cache directory.
///
/// The directory is keyed by crate version, so an upgrade never reuses
/// stale assets and an unchanged install never rewrites them.
fn ensure_assets_unpacked() -> BundledResult<PathBuf> {
    let result = UNPACKED.get_or_init(|| {
        let dir = cache_root().join(format!("assets-{}", env!("CARGO_PKG_VERSION")));
        if dir.join(STAMP_FILE).exists() {
            return Ok(dir);
        }
        fs::create_dir_all(&dir)
            .and_then(|()| unpack_into(&dir))
            .map_err(|e| format!("{}: {e}", dir.display()))?;
        Ok(dir)
    });

    match result {
        Ok(dir) => Ok(dir.clone()),
        Err(message) => Err(BundledError::Unpack(message.clone())),
    }
}

/// Returns the on-disk path of a bundled asset, unpacking on first use.
pub fn asset_path(name: &str) -> BundledResult<PathBuf> {
    if ASSETS_DIR.get_file(name).is_none() {
        return Err(BundledError::AssetNotFound(name.to_string()));
    }
    Ok(ensure_assets_unpacked()?.join(name))
}

/// Returns the unpacked path of the Python guest harness.
pub fn python_harness_path() -> BundledResult<PathBuf> {
    asset_path("fos_py_harness.py")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_is_embedded() {
        let schema = default_schema();
        assert!(schema.contains("\"apis\""));
        assert!(schema.contains("\"keywords\""));
        assert!(schema.contains("\"tokens\""));
    }

    #[test]
    fn test_asset_unpacking() -> Result<(), Box<dyn std::error::Error>> {
        let path = python_harness_path()?;
        assert!(path.exists());
        let content = fs::read_to_string(&path)?;
        assert!(content.contains("__FOS_RESULT__"));

        // The stamp marks the unpack as complete.
        let stamp = path.parent().unwrap().join(STAMP_FILE);
        assert!(stamp.exists());
        Ok(())
    }

    #[test]
    fn test_cache_dir_is_version_keyed() -> Result<(), Box<dyn std::error::Error>> {
        let path = asset_path("schema.json")?;
        let dir_name = path.parent().unwrap().file_name().unwrap().to_string_lossy();
        assert_eq!(dir_name, format!("assets-{}", env!("CARGO_PKG_VERSION")));
        Ok(())
    }

    #[test]
    fn test_unknown_asset_rejected() {
        let result = asset_path("nonexistent.bin");
        assert!(matches!(result, Err(BundledError::AssetNotFound(_))));
    }
}
