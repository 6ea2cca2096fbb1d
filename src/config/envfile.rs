//! Script-facing environment file.
//!
//! INI-style: `[SECTION]` headers with `KEY: VALUE` or `KEY = VALUE` pairs.
//! Scripts and include paths reference entries as `DEVICE:VARIABLE`, looked
//! up with three case tiers (exact, lower, upper) on both section and key.
//! Unresolved references keep their literal text and log a warning.
//!
//! Keys appearing before the first header belong to the `GLOBAL` section,
//! whose entries seed the executor's variable store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

/// Result type for environment-file operations.
pub type EnvFileResult<T> = Result<T, EnvFileError>;

/// Errors raised while reading the environment file.
#[derive(Debug, thiserror::Error)]
pub enum EnvFileError {
    #[error("Failed to read environment file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("environment file line {line}: {message}")]
    Syntax { line: usize, message: String },
}

/// Section name used for keys that appear before any `[SECTION]` header
/// and for the variables that seed the run.
pub const GLOBAL_SECTION: &str = "GLOBAL";

/// A parsed environment file.
#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    sections: HashMap<String, HashMap<String, String>>,
    /// Section names in file order, for stable env injection.
    order: Vec<String>,
}

impl EnvFile {
    /// Parses environment-file text.
    ///
    /// # Example
    ///
    /// ```
    /// use fosrun::config::envfile::EnvFile;
    ///
    /// let env = EnvFile::parse("[FGT1]\nip: 192.168.1.99\n")?;
    /// // Lookup is case-tiered: exact, then lower, then upper.
    /// assert_eq!(env.get("FGT1", "IP"), Some("192.168.1.99"));
    /// # Ok::<(), fosrun::config::envfile::EnvFileError>(())
    /// ```
    pub fn parse(text: &str) -> EnvFileResult<Self> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut order = Vec::new();
        let mut current = GLOBAL_SECTION.to_string();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                current = name.trim().to_string();
                if !order.contains(&current) {
                    order.push(current.clone());
                }
                sections.entry(current.clone()).or_default();
                continue;
            }

            // First separator wins between ':' and '='.
            let colon = line.find(':');
            let equals = line.find('=');
            let sep = match (colon, equals) {
                (Some(c), Some(e)) => Some(c.min(e)),
                (Some(c), None) => Some(c),
                (None, Some(e)) => Some(e),
                (None, None) => None,
            };
            let Some(sep) = sep else {
                return Err(EnvFileError::Syntax {
                    line: idx + 1,
                    message: format!("expected 'KEY: VALUE' or 'KEY = VALUE', got '{line}'"),
                });
            };

            let key = line[..sep].trim();
            let value = line[sep + 1..].trim();
            if key.is_empty() {
                return Err(EnvFileError::Syntax {
                    line: idx + 1,
                    message: "empty key".to_string(),
                });
            }

            if !order.contains(&current) {
                order.push(current.clone());
            }
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }

        Ok(Self { sections, order })
    }

    /// Loads and parses an environment file from disk.
    pub fn load(path: &Path) -> EnvFileResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EnvFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&text)
    }

    fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections
            .get(name)
            .or_else(|| self.sections.get(&name.to_lowercase()))
            .or_else(|| self.sections.get(&name.to_uppercase()))
    }

    /// Three-tier case-insensitive lookup: exact, lower, upper.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let map = self.section(section)?;
        map.get(key)
            .or_else(|| map.get(&key.to_lowercase()))
            .or_else(|| map.get(&key.to_uppercase()))
            .map(String::as_str)
    }

    /// Entries of the `GLOBAL` section, which seed the variable store.
    pub fn global_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sections
            .get(GLOBAL_SECTION)
            .into_iter()
            .flat_map(|map| map.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// All `(section, key, value)` triples in file order, for Bash env
    /// injection as `SECTION__KEY`.
    pub fn entries(&self) -> Vec<(&str, &str, &str)> {
        let mut out = Vec::new();
        for name in &self.order {
            if let Some(map) = self.sections.get(name) {
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                for key in keys {
                    out.push((name.as_str(), key.as_str(), map[key].as_str()));
                }
            }
        }
        out
    }

    /// Section names present in the file.
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Replaces `SECTION:KEY` references in `text` with their config
    /// values. Unresolved references are preserved literally with a
    /// warning.
    pub fn resolve_refs(&self, text: &str) -> String {
        static REF_PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = REF_PATTERN.get_or_init(|| {
            Regex::new(r"\b([A-Z][A-Z0-9_]*):([A-Za-z][A-Za-z0-9_]*)\b")
                .expect("reference pattern is valid")
        });

        pattern
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let section = &caps[1];
                let key = &caps[2];
                match self.get(section, key) {
                    Some(value) => value.to_string(),
                    None => {
                        warn!("unresolved config reference '{}:{}'", section, key);
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    /// Serializes config sections for guest-code context hand-off.
    pub fn to_json(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        for name in &self.order {
            if let Some(map) = self.sections.get(name) {
                let mut section = serde_json::Map::new();
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                for key in keys {
                    section.insert(key.clone(), serde_json::Value::String(map[key].clone()));
                }
                root.insert(name.clone(), serde_json::Value::Object(section));
            }
        }
        serde_json::Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
VERSION: 7.4.1
[FGT1]
ip: 192.168.1.99
admin = admin
# comment line
; also a comment
[PC_1]
iface = eth0
";

    #[test]
    fn test_parse_colon_and_equals() {
        let env = EnvFile::parse(SAMPLE).unwrap();
        assert_eq!(env.get("FGT1", "ip"), Some("192.168.1.99"));
        assert_eq!(env.get("FGT1", "admin"), Some("admin"));
        assert_eq!(env.get("PC_1", "iface"), Some("eth0"));
    }

    #[test]
    fn test_top_level_keys_are_global() {
        let env = EnvFile::parse(SAMPLE).unwrap();
        assert_eq!(env.get(GLOBAL_SECTION, "VERSION"), Some("7.4.1"));
        let globals: Vec<_> = env.global_vars().collect();
        assert_eq!(globals, vec![("VERSION", "7.4.1")]);
    }

    #[test]
    fn test_three_tier_lookup() {
        let env = EnvFile::parse("[FGT1]\nIP: 10.0.0.1\nname: fw\n").unwrap();
        // exact
        assert_eq!(env.get("FGT1", "IP"), Some("10.0.0.1"));
        // lower tier
        assert_eq!(env.get("FGT1", "NAME"), Some("fw"));
        // upper tier
        assert_eq!(env.get("FGT1", "ip"), Some("10.0.0.1"));
        // section case tiers
        assert_eq!(env.get("fgt1", "IP"), Some("10.0.0.1"));
    }

    #[test]
    fn test_resolve_refs() {
        let env = EnvFile::parse(SAMPLE).unwrap();
        assert_eq!(
            env.resolve_refs("ping FGT1:ip from PC_1:iface"),
            "ping 192.168.1.99 from eth0"
        );
    }

    #[test]
    fn test_unresolved_ref_keeps_literal() {
        let env = EnvFile::parse(SAMPLE).unwrap();
        assert_eq!(env.resolve_refs("see FGT9:ip"), "see FGT9:ip");
    }

    #[test]
    fn test_value_with_separator_chars() {
        let env = EnvFile::parse("[S]\nurl: http://host:8080/x\n").unwrap();
        assert_eq!(env.get("S", "url"), Some("http://host:8080/x"));
    }

    #[test]
    fn test_syntax_error_names_line() {
        let err = EnvFile::parse("[S]\njust words\n").unwrap_err();
        match err {
            EnvFileError::Syntax { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_entries_for_env_injection() {
        let env = EnvFile::parse(SAMPLE).unwrap();
        let entries = env.entries();
        assert!(entries.contains(&("FGT1", "ip", "192.168.1.99")));
        assert!(entries.contains(&("GLOBAL", "VERSION", "7.4.1")));
    }
}
