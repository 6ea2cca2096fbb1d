//! Plugin API discovery.
//!
//! Phase-2 initialization scans the configured plugin directory for guest
//! scripts; every eligible file registers one API named after its stem.
//! An optional `<name>.json` sidecar supplies the API's schema; without
//! one the API parses in open-options mode. Built-in names always win;
//! the collision is logged during the merge.
//!
//! The walk is bounded by depth and by a deadline so a pathological
//! plugin tree cannot hang the process. Scan results are memoized in
//! [`DiscoveryCache`] and only refreshed on request.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::PluginsConfig;
use crate::schema::{ApiSchema, parse_sidecar_api};

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors raised while scanning for plugins.
///
/// Discovery failures never abort the process: the runtime logs them and
/// proceeds with built-ins only.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("plugin directory {path} is not readable: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One plugin API found on disk.
#[derive(Debug, Clone)]
pub struct DiscoveredApi {
    pub name: String,
    pub path: PathBuf,
    pub lang: String,
    pub schema: ApiSchema,
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Discovered APIs, sorted by name for deterministic merges.
    pub apis: Vec<DiscoveredApi>,
    /// Whether the deadline cut the walk short.
    pub truncated: bool,
}

/// Maps a plugin file extension to its guest language.
fn lang_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "py" => Some("python"),
        "sh" => Some("bash"),
        "js" => Some("javascript"),
        "rb" => Some("ruby"),
        _ => None,
    }
}

/// Walks the plugin directory once, bounded by depth and deadline.
pub fn scan(config: &PluginsConfig) -> DiscoveryResult<DiscoveryReport> {
    let mut report = DiscoveryReport::default();
    if !config.dir.exists() {
        debug!("plugin directory {} does not exist", config.dir.display());
        return Ok(report);
    }

    let deadline = Instant::now() + Duration::from_millis(config.scan_timeout_ms);

    for entry in WalkDir::new(&config.dir)
        .max_depth(config.max_depth)
        .sort_by_file_name()
    {
        if Instant::now() >= deadline {
            warn!(
                "plugin scan of {} hit its {}ms deadline; results are partial",
                config.dir.display(),
                config.scan_timeout_ms
            );
            report.truncated = true;
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable plugin entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('_') {
            continue;
        }
        let Some(lang) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(lang_for_extension)
        else {
            continue;
        };

        if report.apis.iter().any(|api| api.name == stem) {
            warn!(
                "duplicate plugin API '{}' at {}; keeping the first one found",
                stem,
                path.display()
            );
            continue;
        }

        let schema = load_plugin_schema(stem, path, lang);
        report.apis.push(DiscoveredApi {
            name: stem.to_string(),
            path: path.to_path_buf(),
            lang: lang.to_string(),
            schema,
        });
    }

    report.apis.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(
        "discovered {} plugin APIs under {}",
        report.apis.len(),
        config.dir.display()
    );
    Ok(report)
}

/// Loads the sidecar schema when present, else the open-options default.
fn load_plugin_schema(name: &str, path: &Path, lang: &str) -> ApiSchema {
    let sidecar = path.with_extension("json");
    if sidecar.exists() {
        match std::fs::read_to_string(&sidecar) {
            Ok(text) => match parse_sidecar_api(name, &text, path.to_path_buf(), lang) {
                Ok(schema) => return schema,
                Err(e) => warn!(
                    "ignoring invalid sidecar schema {}: {e}",
                    sidecar.display()
                ),
            },
            Err(e) => warn!("failed to read sidecar {}: {e}", sidecar.display()),
        }
    }
    ApiSchema::open_default(name, path.to_path_buf(), lang)
}

/// Memoized discovery result. Lives inside the runtime, guarded by the
/// phase-2 mutex.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    cached: Option<DiscoveryReport>,
    scans: usize,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the memoized report, scanning on first use.
    pub fn get_or_scan(&mut self, config: &PluginsConfig) -> DiscoveryResult<&DiscoveryReport> {
        if self.cached.is_none() {
            let report = scan(config)?;
            self.scans += 1;
            self.cached = Some(report);
        }
        Ok(self.cached.as_ref().expect("populated above"))
    }

    /// Drops the memoized result; the next lookup rescans.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Number of actual directory scans performed.
    pub fn scan_count(&self) -> usize {
        self.scans
    }
}
