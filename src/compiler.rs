//! Compilation facade: source text to [`CompiledScript`].
//!
//! Wraps the lexer and parser behind one entry point, triggers phase-2
//! initialization before the first compilation, and memoizes compiled
//! files by content hash so repeated includes of the same script reuse
//! one IR.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ir::CompiledScript;
use crate::lexer::{LexError, Lexer};
use crate::parser::{ParseError, parse};
use crate::runtime::{Compiled, Runtime};

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Errors raised while compiling a script. Fatal for that script only.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Failed to read script {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{file}: {source}")]
    Lex {
        file: String,
        #[source]
        source: LexError,
    },

    #[error("{file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: ParseError,
    },
}

struct CacheEntry {
    content_hash: String,
    script: Arc<CompiledScript>,
}

/// Compiles scripts against one runtime, caching by path + content hash.
pub struct Compiler {
    runtime: Arc<Runtime>,
    cache: HashMap<PathBuf, CacheEntry>,
}

impl Compiler {
    /// Creates a compiler bound to a runtime.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use fosrun::compiler::Compiler;
    /// use fosrun::config::Config;
    /// use fosrun::runtime::Runtime;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let runtime = Arc::new(Runtime::new(Config::default())?);
    /// let compiler = Compiler::new(runtime);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            cache: HashMap::new(),
        }
    }

    /// Compiles a script file, reusing the cached IR when the file has
    /// not changed since the last compilation.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use std::sync::Arc;
    ///
    /// use fosrun::compiler::Compiler;
    /// use fosrun::config::Config;
    /// use fosrun::runtime::Runtime;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let runtime = Arc::new(Runtime::new(Config::default())?);
    /// let mut compiler = Compiler::new(runtime);
    ///
    /// let script = compiler.compile_file(Path::new("cases/login.fos"))?;
    /// println!(
    ///     "{}: {} ops across {} devices",
    ///     script.file,
    ///     script.ops.len(),
    ///     script.devices.len()
    /// );
    /// # Ok(())
    /// # }
    /// ```
    pub fn compile_file(&mut self, path: &Path) -> CompileResult<Arc<CompiledScript>> {
        let bytes = std::fs::read(path).map_err(|e| CompileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let content_hash = hex_digest(&bytes);

        if let Some(entry) = self.cache.get(path)
            && entry.content_hash == content_hash
        {
            debug!("compile cache hit for {}", path.display());
            return Ok(entry.script.clone());
        }

        let source = String::from_utf8_lossy(&bytes);
        let name = path.display().to_string();
        let script = Arc::new(self.compile_source(&source, &name)?);
        self.cache.insert(
            path.to_path_buf(),
            CacheEntry {
                content_hash,
                script: script.clone(),
            },
        );
        Ok(script)
    }

    /// Compiles script text directly (tests, stdin, embedding).
    pub fn compile_str(&mut self, source: &str, name: &str) -> CompileResult<Arc<CompiledScript>> {
        Ok(Arc::new(self.compile_source(source, name)?))
    }

    fn compile_source(&self, source: &str, name: &str) -> CompileResult<CompiledScript> {
        // First compilation triggers plugin discovery.
        let shared: Arc<Compiled> = self.runtime.ensure_ready();

        let lexer = Lexer::new(shared.patterns.clone(), self.runtime.deprecated().clone());
        let (tokens, _source_lines) = lexer.lex(source, name).map_err(|e| CompileError::Lex {
            file: name.to_string(),
            source: e,
        })?;

        parse(&shared.schema, tokens, name).map_err(|e| CompileError::Parse {
            file: name.to_string(),
            source: e,
        })
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
