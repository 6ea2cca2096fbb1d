//! Process-wide runtime: schema snapshot, registry, two-phase init.
//!
//! Phase 1 happens at construction: the schema document is loaded (the
//! bundled default or the configured override), the lexer patterns are
//! generated, and the built-in registry is installed. Phase 2 runs before
//! the first compilation: plugin discovery merges user APIs into a new
//! snapshot and regenerates the line pattern. The refresh is exactly-once
//! across concurrent compilations (double-checked flag + mutex) and
//! idempotent; discovery failures log a warning and leave the phase-1
//! snapshot in place. After phase 2 the snapshot is immutable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::warn;

use crate::api::ApiRegistry;
use crate::bundled;
use crate::config::Config;
use crate::discovery::DiscoveryCache;
use crate::lexer::DeprecatedTable;
use crate::schema::patterns::Patterns;
use crate::schema::{Schema, SchemaError, SchemaResult};

/// One immutable schema/registry snapshot.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub schema: Schema,
    pub patterns: Arc<Patterns>,
    pub registry: ApiRegistry,
}

struct Phase2 {
    done: bool,
    cache: DiscoveryCache,
}

/// Owns the schema/registry lifecycle for the process.
pub struct Runtime {
    config: Config,
    deprecated: DeprecatedTable,
    state: RwLock<Arc<Compiled>>,
    phase2: Mutex<Phase2>,
    /// Fast path for the double-checked phase-2 guard.
    initialized: AtomicBool,
}

impl Runtime {
    /// Phase-1 initialization. Fails hard on a missing or malformed
    /// schema, or on a schema API with no registered handler.
    pub fn new(config: Config) -> SchemaResult<Self> {
        let schema = match &config.runner.schema {
            Some(path) => Schema::from_file(path)?,
            None => Schema::from_json_str(bundled::default_schema())?,
        };
        let patterns = Arc::new(Patterns::build(&schema)?);
        let registry = ApiRegistry::builtin();

        for name in schema.api_names() {
            if !registry.contains(name) {
                return Err(SchemaError::MissingKey {
                    key: format!("handler for built-in API '{name}'"),
                });
            }
        }

        let mut deprecated = DeprecatedTable::new();
        for entry in &config.deprecated {
            deprecated
                .add_rule(&entry.prefix, &entry.pattern, &entry.replacement)
                .map_err(|e| SchemaError::InvalidKey {
                    key: format!("deprecated entry '{}'", entry.prefix),
                    reason: e.to_string(),
                })?;
        }

        Ok(Self {
            config,
            deprecated,
            state: RwLock::new(Arc::new(Compiled {
                schema,
                patterns,
                registry,
            })),
            phase2: Mutex::new(Phase2 {
                done: false,
                cache: DiscoveryCache::new(),
            }),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn deprecated(&self) -> &DeprecatedTable {
        &self.deprecated
    }

    /// The current snapshot without triggering phase 2.
    pub fn snapshot(&self) -> Arc<Compiled> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Runs phase 2 if it has not happened yet and returns the merged
    /// snapshot. Safe and cheap to call from every compilation.
    pub fn ensure_ready(&self) -> Arc<Compiled> {
        if self.initialized.load(Ordering::Acquire) {
            return self.snapshot();
        }

        let mut guard = self.phase2.lock().unwrap_or_else(|e| e.into_inner());
        if guard.done {
            return self.snapshot();
        }

        if self.config.plugins.force_refresh {
            guard.cache.invalidate();
        }

        match guard.cache.get_or_scan(&self.config.plugins) {
            Ok(report) => {
                let discovered = report.apis.clone();
                let base = self.snapshot();
                let schemas = discovered.iter().map(|a| a.schema.clone()).collect();
                let (schema, collisions) = base.schema.merge_discovered(schemas);
                for name in &collisions {
                    warn!("plugin API '{name}' collides with a built-in; built-in wins");
                }

                let mut registry = base.registry.clone();
                let fresh: Vec<_> = discovered
                    .into_iter()
                    .filter(|a| !collisions.contains(&a.name))
                    .collect();
                registry.merge_discovered(&fresh);

                match Patterns::build(&schema) {
                    Ok(patterns) => {
                        *self.state.write().unwrap_or_else(|e| e.into_inner()) =
                            Arc::new(Compiled {
                                schema,
                                patterns: Arc::new(patterns),
                                registry,
                            });
                    }
                    Err(e) => {
                        warn!("failed to rebuild patterns after discovery: {e}; proceeding with built-ins only");
                    }
                }
            }
            Err(e) => {
                warn!("plugin discovery failed: {e}; proceeding with built-ins only");
            }
        }

        guard.done = true;
        self.initialized.store(true, Ordering::Release);
        self.snapshot()
    }

    /// Drops the memoized discovery result and reruns phase 2.
    pub fn force_refresh(&self) -> Arc<Compiled> {
        {
            let mut guard = self.phase2.lock().unwrap_or_else(|e| e.into_inner());
            guard.cache.invalidate();
            guard.done = false;
            self.initialized.store(false, Ordering::Release);
        }
        self.ensure_ready()
    }

    /// Number of plugin directory scans performed so far.
    pub fn discovery_scans(&self) -> usize {
        self.phase2
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cache
            .scan_count()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn runtime_with_plugins(dir: &Path) -> Arc<Runtime> {
        let mut config = Config::default();
        config.plugins.dir = dir.to_path_buf();
        Arc::new(Runtime::new(config).unwrap())
    }

    #[test]
    fn test_phase1_has_builtins_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("extract_hostname.py"), "pass\n").unwrap();

        let runtime = runtime_with_plugins(dir.path());
        let snapshot = runtime.snapshot();
        assert!(snapshot.schema.api("expect").is_some());
        assert!(snapshot.schema.api("extract_hostname").is_none());
        assert_eq!(runtime.discovery_scans(), 0);
    }

    #[test]
    fn test_phase2_merges_plugins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("extract_hostname.py"), "pass\n").unwrap();

        let runtime = runtime_with_plugins(dir.path());
        let snapshot = runtime.ensure_ready();
        assert!(snapshot.schema.api("extract_hostname").is_some());
        assert!(snapshot.registry.contains("extract_hostname"));
        assert_eq!(runtime.discovery_scans(), 1);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.py"), "pass\n").unwrap();

        let runtime = runtime_with_plugins(dir.path());
        let first = runtime.ensure_ready();
        let second = runtime.ensure_ready();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runtime.discovery_scans(), 1);
    }

    #[test]
    fn test_concurrent_first_compilations_discover_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("probe.py"), "pass\n").unwrap();
        let runtime = runtime_with_plugins(dir.path());

        let snapshots: Vec<Arc<Compiled>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let runtime = runtime.clone();
                    scope.spawn(move || runtime.ensure_ready())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(runtime.discovery_scans(), 1);
        for snapshot in &snapshots {
            assert!(Arc::ptr_eq(snapshot, &snapshots[0]));
            assert!(snapshot.schema.api("probe").is_some());
        }
    }

    #[test]
    fn test_builtin_wins_collision() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("expect.py"), "pass\n").unwrap();

        let runtime = runtime_with_plugins(dir.path());
        let snapshot = runtime.ensure_ready();
        assert_eq!(
            snapshot.schema.api("expect").unwrap().origin,
            crate::schema::ApiOrigin::Builtin
        );
    }

    #[test]
    fn test_force_refresh_rescans() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.py"), "pass\n").unwrap();

        let runtime = runtime_with_plugins(dir.path());
        runtime.ensure_ready();
        assert_eq!(runtime.discovery_scans(), 1);

        std::fs::write(dir.path().join("two.py"), "pass\n").unwrap();
        let snapshot = runtime.force_refresh();
        assert_eq!(runtime.discovery_scans(), 2);
        assert!(snapshot.schema.api("two").is_some());
    }

    #[test]
    fn test_missing_discovery_dir_falls_back_to_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime_with_plugins(&dir.path().join("absent"));
        let snapshot = runtime.ensure_ready();
        assert!(snapshot.schema.api("expect").is_some());
    }

    #[test]
    fn test_schema_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("schema.json");
        std::fs::write(&schema_path, bundled::default_schema()).unwrap();

        let mut config = Config::default();
        config.runner.schema = Some(schema_path);
        let runtime = Runtime::new(config).unwrap();
        assert!(runtime.snapshot().schema.api("expect").is_some());
    }

    #[test]
    fn test_schema_api_without_handler_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("schema.json");
        // Valid schema, but declares an API no built-in handler serves.
        let doc = bundled::default_schema().replacen(
            "\"expect\"",
            "\"expect_v2\"",
            1,
        );
        std::fs::write(&schema_path, doc).unwrap();

        let mut config = Config::default();
        config.runner.schema = Some(schema_path);
        let err = Runtime::new(config).unwrap_err();
        assert!(err.to_string().contains("expect_v2"), "{err}");
    }
}
