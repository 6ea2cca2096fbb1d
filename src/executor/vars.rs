//! Run-scoped variable store and interpolation.
//!
//! Variables live in one flat map for the whole run; includes inherit the
//! caller's store. Interpolation replaces `$NAME` and `{$NAME}` in a
//! single pass (no recursive expansion); unresolved references become
//! empty strings with a warning.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    map: HashMap<String, String>,
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\$([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*|\?)")
            .expect("reference pattern is valid")
    })
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Reads a variable, warning and yielding `""` when undefined.
    pub fn get_or_warn(&self, name: &str) -> String {
        match self.map.get(name) {
            Some(value) => value.clone(),
            None => {
                warn!("variable '{name}' is not defined; substituting empty string");
                String::new()
            }
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.map.insert(name.into(), value.into());
    }

    pub fn unset(&mut self, name: &str) {
        self.map.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Snapshot for guest-code contexts.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.map.clone()
    }

    /// Single-pass `$NAME` / `{$NAME}` substitution.
    ///
    /// # Example
    ///
    /// ```
    /// use fosrun::executor::vars::VariableStore;
    ///
    /// let mut vars = VariableStore::new();
    /// vars.set("ip", "192.168.1.1");
    ///
    /// assert_eq!(vars.expand("ping $ip"), "ping 192.168.1.1");
    /// assert_eq!(vars.expand("route via {$ip}"), "route via 192.168.1.1");
    /// ```
    pub fn expand(&self, text: &str) -> String {
        if !text.contains('$') {
            return text.to_string();
        }
        reference_pattern()
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                self.get_or_warn(name)
            })
            .into_owned()
    }

    /// Resolves a single reference-or-literal: `$NAME` forms read the
    /// store, anything else passes through unchanged.
    pub fn resolve_value(&self, text: &str) -> String {
        let whole = reference_pattern()
            .find(text)
            .is_some_and(|m| m.start() == 0 && m.end() == text.len());
        if whole { self.expand(text) } else { text.to_string() }
    }
}
