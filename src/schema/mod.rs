//! Schema document model and loading.
//!
//! The schema is a single JSON document with three top-level maps: `apis`,
//! `keywords`, and `tokens`. It is the canonical source of truth for the
//! compiler: API signatures, keyword grammar, and the regex fragments the
//! lexer patterns are generated from. Nothing about API or control-flow
//! syntax is hardcoded outside this document except the op mnemonics the
//! parser emits.
//!
//! Loading is strict: a missing or malformed key fails with a
//! [`SchemaError`] naming the key. Discovered plugin APIs are merged into a
//! copy of the schema during phase-2 initialization (see [`crate::runtime`]);
//! the merge never mutates an existing schema value.

pub mod patterns;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;

/// Result type for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while loading or validating the schema document.
///
/// All variants name the offending key so a broken schema is diagnosable
/// without reading the loader source. Schema errors are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The document is not valid JSON.
    #[error("Failed to parse schema JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A required key is absent.
    #[error("Schema key '{key}' is missing")]
    MissingKey { key: String },

    /// A key is present but its value has the wrong shape.
    #[error("Schema key '{key}' is invalid: {reason}")]
    InvalidKey { key: String, reason: String },

    /// A token regex fragment failed to compile.
    #[error("Token fragment '{kind}' is not a valid regex: {source}")]
    BadFragment {
        kind: String,
        #[source]
        source: Box<regex::Error>,
    },

    /// I/O failure reading a schema file from disk.
    #[error("Failed to read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn missing(key: &str) -> SchemaError {
    SchemaError::MissingKey { key: key.to_string() }
}

fn invalid(key: impl Into<String>, reason: impl Into<String>) -> SchemaError {
    SchemaError::InvalidKey {
        key: key.into(),
        reason: reason.into(),
    }
}

/// How an API's payload tokens are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// `-flag value` pairs, pre-ordered to the declared parameter order.
    Options,
    /// A fixed sequence of positional parameters.
    Positional,
}

/// Declared value type of an API parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Str,
    Int,
    Identifier,
    Variable,
}

impl ParamType {
    fn from_str(key: &str, s: &str) -> SchemaResult<Self> {
        match s {
            "string" => Ok(ParamType::Str),
            "int" => Ok(ParamType::Int),
            "identifier" => Ok(ParamType::Identifier),
            "variable" => Ok(ParamType::Variable),
            other => Err(invalid(key, format!("unknown parameter type '{other}'"))),
        }
    }
}

/// One `-flag` parameter of an options-mode API.
#[derive(Debug, Clone)]
pub struct OptionParam {
    /// The flag as written in scripts, including the leading dash.
    pub flag: String,
    /// The name used for typed access on the emitted op.
    pub alias: String,
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<String>,
    /// Whether the value may be supplied as a leading bare token
    /// (`check_var name -value V` shorthand).
    pub bare: bool,
}

/// One positional parameter of a positional-mode API or `parse` keyword.
#[derive(Debug, Clone)]
pub struct PositionalParam {
    pub name: String,
    /// Token kinds accepted for this position (lexer kind names).
    pub kinds: Vec<String>,
    pub required: bool,
    pub default: Option<String>,
}

/// Where an API definition came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOrigin {
    /// Declared in the schema document and backed by a built-in handler.
    Builtin,
    /// Discovered in the plugin directory; `path` is the guest script.
    Plugin { path: std::path::PathBuf, lang: String },
}

/// Full signature of one API.
#[derive(Debug, Clone)]
pub struct ApiSchema {
    pub name: String,
    pub category: String,
    pub parse_mode: ParseMode,
    /// Declared flags, in document order. Empty for positional APIs.
    pub options: Vec<OptionParam>,
    /// Declared positional parameters. Empty for options APIs.
    pub positional: Vec<PositionalParam>,
    /// Accept flags not declared in `options` (discovered plugin default).
    pub open_options: bool,
    pub origin: ApiOrigin,
}

impl ApiSchema {
    /// Returns the default signature for a discovered plugin that ships no
    /// sidecar schema: options mode, no declared flags, open flag set.
    pub fn open_default(name: &str, path: std::path::PathBuf, lang: &str) -> Self {
        Self {
            name: name.to_string(),
            category: "plugin".to_string(),
            parse_mode: ParseMode::Options,
            options: Vec::new(),
            positional: Vec::new(),
            open_options: true,
            origin: ApiOrigin::Plugin { path, lang: lang.to_string() },
        }
    }

    /// Looks up a declared flag by its script spelling (`-e`).
    pub fn option_by_flag(&self, flag: &str) -> Option<&OptionParam> {
        self.options.iter().find(|p| p.flag == flag)
    }

    /// Looks up a declared flag by alias (`pattern`).
    pub fn option_by_alias(&self, alias: &str) -> Option<(usize, &OptionParam)> {
        self.options
            .iter()
            .enumerate()
            .find(|(_, p)| p.alias == alias)
    }

    /// The single flag allowed to take a leading bare value, if any.
    pub fn bare_option(&self) -> Option<&OptionParam> {
        self.options.iter().find(|p| p.bare)
    }
}

/// One phase of a control-block keyword's flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowPhase {
    /// Consume expression tokens until end of line.
    Expression,
    /// Recursively parse instructions until a follow keyword appears.
    Script,
    /// Expect one of these keywords next.
    Follow(Vec<String>),
}

/// Grammar role of a keyword.
#[derive(Debug, Clone)]
pub enum KeywordKind {
    /// Multi-line construct described by an ordered flow.
    ControlBlock { flow: Vec<FlowPhase> },
    /// Single-line statement parsed like a positional API.
    Parse { rules: Vec<PositionalParam> },
}

/// Schema entry for one keyword.
#[derive(Debug, Clone)]
pub struct KeywordSchema {
    pub name: String,
    pub kind: KeywordKind,
}

/// The regex fragments for each token kind, straight from the document.
#[derive(Debug, Clone)]
pub struct TokenSet {
    fragments: HashMap<String, String>,
}

/// Token kinds every schema must define a fragment for.
const REQUIRED_FRAGMENTS: &[&str] = &[
    "variable",
    "symbol",
    "number",
    "operator",
    "string",
    "identifier",
    "section",
];

impl TokenSet {
    /// Returns the fragment for a token kind. Presence of the required
    /// kinds is validated at load time.
    pub fn fragment(&self, kind: &str) -> &str {
        self.fragments
            .get(kind)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// The loaded schema: API signatures, keyword grammar, token fragments.
#[derive(Debug, Clone)]
pub struct Schema {
    apis: HashMap<String, Arc<ApiSchema>>,
    keywords: HashMap<String, Arc<KeywordSchema>>,
    tokens: TokenSet,
}

impl Schema {
    /// Parses and validates a schema document.
    ///
    /// # Example
    ///
    /// ```
    /// use fosrun::bundled;
    /// use fosrun::schema::Schema;
    ///
    /// let schema = Schema::from_json_str(bundled::default_schema())?;
    /// assert!(schema.api("expect").is_some());
    /// assert!(schema.keyword("if").is_some());
    /// # Ok::<(), fosrun::schema::SchemaError>(())
    /// ```
    pub fn from_json_str(text: &str) -> SchemaResult<Self> {
        let doc: Json = serde_json::from_str(text)?;
        let root = doc
            .as_object()
            .ok_or_else(|| invalid("<root>", "expected a JSON object"))?;

        let mut apis = HashMap::new();
        let apis_obj = root
            .get("apis")
            .ok_or_else(|| missing("apis"))?
            .as_object()
            .ok_or_else(|| invalid("apis", "expected an object"))?;
        for (name, value) in apis_obj {
            let api = parse_api(name, value)?;
            apis.insert(name.clone(), Arc::new(api));
        }

        let mut keywords = HashMap::new();
        let kw_obj = root
            .get("keywords")
            .ok_or_else(|| missing("keywords"))?
            .as_object()
            .ok_or_else(|| invalid("keywords", "expected an object"))?;
        for (name, value) in kw_obj {
            let kw = parse_keyword(name, value)?;
            keywords.insert(name.clone(), Arc::new(kw));
        }

        let tokens_obj = root
            .get("tokens")
            .ok_or_else(|| missing("tokens"))?
            .as_object()
            .ok_or_else(|| invalid("tokens", "expected an object"))?;
        let mut fragments = HashMap::new();
        for (kind, value) in tokens_obj {
            let frag = value
                .as_str()
                .ok_or_else(|| invalid(format!("tokens.{kind}"), "expected a string"))?;
            regex::Regex::new(frag).map_err(|e| SchemaError::BadFragment {
                kind: kind.clone(),
                source: Box::new(e),
            })?;
            fragments.insert(kind.clone(), frag.to_string());
        }
        for required in REQUIRED_FRAGMENTS {
            if !fragments.contains_key(*required) {
                return Err(missing(&format!("tokens.{required}")));
            }
        }

        Ok(Self {
            apis,
            keywords,
            tokens: TokenSet { fragments },
        })
    }

    /// Loads a schema document from disk.
    pub fn from_file(path: &std::path::Path) -> SchemaResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SchemaError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json_str(&text)
    }

    pub fn api(&self, name: &str) -> Option<&Arc<ApiSchema>> {
        self.apis.get(name)
    }

    pub fn keyword(&self, name: &str) -> Option<&Arc<KeywordSchema>> {
        self.keywords.get(name)
    }

    pub fn api_names(&self) -> impl Iterator<Item = &str> {
        self.apis.keys().map(String::as_str)
    }

    pub fn keyword_names(&self) -> impl Iterator<Item = &str> {
        self.keywords.keys().map(String::as_str)
    }

    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    /// Merges discovered plugin APIs into a copy of this schema.
    ///
    /// Built-ins win on a name collision; the losing plugin is reported in
    /// the returned list so the caller can log it.
    pub fn merge_discovered(&self, discovered: Vec<ApiSchema>) -> (Schema, Vec<String>) {
        let mut merged = self.clone();
        let mut collisions = Vec::new();
        for api in discovered {
            if merged.apis.contains_key(&api.name) || merged.keywords.contains_key(&api.name) {
                collisions.push(api.name);
                continue;
            }
            merged.apis.insert(api.name.clone(), Arc::new(api));
        }
        (merged, collisions)
    }
}

/// Parses a plugin sidecar document (`<name>.json`) into an API schema.
/// The sidecar uses the same shape as an `apis` entry in the main schema.
pub fn parse_sidecar_api(
    name: &str,
    text: &str,
    path: std::path::PathBuf,
    lang: &str,
) -> SchemaResult<ApiSchema> {
    let doc: Json = serde_json::from_str(text)?;
    let mut api = parse_api(name, &doc)?;
    api.origin = ApiOrigin::Plugin {
        path,
        lang: lang.to_string(),
    };
    Ok(api)
}

fn parse_api(name: &str, value: &Json) -> SchemaResult<ApiSchema> {
    let key = format!("apis.{name}");
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(&key, "expected an object"))?;

    let category = obj
        .get("category")
        .and_then(Json::as_str)
        .unwrap_or("general")
        .to_string();

    let mode_str = obj
        .get("parse_mode")
        .ok_or_else(|| missing(&format!("{key}.parse_mode")))?
        .as_str()
        .ok_or_else(|| invalid(format!("{key}.parse_mode"), "expected a string"))?;
    let parse_mode = match mode_str {
        "options" => ParseMode::Options,
        "positional" => ParseMode::Positional,
        other => {
            return Err(invalid(
                format!("{key}.parse_mode"),
                format!("unknown mode '{other}'"),
            ));
        }
    };

    let params = obj
        .get("parameters")
        .ok_or_else(|| missing(&format!("{key}.parameters")))?;

    let mut options = Vec::new();
    let mut positional = Vec::new();
    match parse_mode {
        ParseMode::Options => {
            let map = params
                .as_object()
                .ok_or_else(|| invalid(format!("{key}.parameters"), "expected an object"))?;
            for (flag, meta) in map {
                options.push(parse_option_param(&key, flag, meta)?);
            }
        }
        ParseMode::Positional => {
            let list = params
                .as_array()
                .ok_or_else(|| invalid(format!("{key}.parameters"), "expected an array"))?;
            for (idx, meta) in list.iter().enumerate() {
                positional.push(parse_positional_param(&format!("{key}.parameters[{idx}]"), meta)?);
            }
        }
    }

    Ok(ApiSchema {
        name: name.to_string(),
        category,
        parse_mode,
        options,
        positional,
        open_options: false,
        origin: ApiOrigin::Builtin,
    })
}

fn parse_option_param(api_key: &str, flag: &str, meta: &Json) -> SchemaResult<OptionParam> {
    let key = format!("{api_key}.parameters.{flag}");
    if !flag.starts_with('-') {
        return Err(invalid(&key, "option flags must start with '-'"));
    }
    let obj = meta
        .as_object()
        .ok_or_else(|| invalid(&key, "expected an object"))?;
    let alias = obj
        .get("alias")
        .and_then(Json::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| flag.trim_start_matches('-').to_string());
    let ty = match obj.get("type").and_then(Json::as_str) {
        Some(s) => ParamType::from_str(&format!("{key}.type"), s)?,
        None => ParamType::Str,
    };
    Ok(OptionParam {
        flag: flag.to_string(),
        alias,
        ty,
        required: obj.get("required").and_then(Json::as_bool).unwrap_or(false),
        default: obj
            .get("default")
            .and_then(Json::as_str)
            .map(str::to_string),
        bare: obj.get("bare").and_then(Json::as_bool).unwrap_or(false),
    })
}

fn parse_positional_param(key: &str, meta: &Json) -> SchemaResult<PositionalParam> {
    let obj = meta
        .as_object()
        .ok_or_else(|| invalid(key, "expected an object"))?;
    let name = obj
        .get("name")
        .and_then(Json::as_str)
        .ok_or_else(|| missing(&format!("{key}.name")))?
        .to_string();
    let kinds = match obj.get("kinds") {
        Some(Json::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(format!("{key}.kinds"), "expected strings"))
            })
            .collect::<SchemaResult<Vec<_>>>()?,
        None => vec!["identifier".to_string()],
        Some(_) => return Err(invalid(format!("{key}.kinds"), "expected an array")),
    };
    Ok(PositionalParam {
        name,
        kinds,
        required: obj.get("required").and_then(Json::as_bool).unwrap_or(true),
        default: obj
            .get("default")
            .and_then(Json::as_str)
            .map(str::to_string),
    })
}

fn parse_keyword(name: &str, value: &Json) -> SchemaResult<KeywordSchema> {
    let key = format!("keywords.{name}");
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(&key, "expected an object"))?;
    let ty = obj
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| missing(&format!("{key}.type")))?;

    let kind = match ty {
        "control_block" => {
            let flow_val = obj
                .get("flow")
                .ok_or_else(|| missing(&format!("{key}.flow")))?
                .as_array()
                .ok_or_else(|| invalid(format!("{key}.flow"), "expected an array"))?;
            let mut flow = Vec::new();
            for phase in flow_val {
                match phase {
                    Json::String(s) if s == "expression" => flow.push(FlowPhase::Expression),
                    Json::String(s) if s == "script" => flow.push(FlowPhase::Script),
                    Json::String(s) => {
                        return Err(invalid(
                            format!("{key}.flow"),
                            format!("unknown phase '{s}'"),
                        ));
                    }
                    Json::Array(items) => {
                        let followers = items
                            .iter()
                            .map(|v| {
                                v.as_str().map(str::to_string).ok_or_else(|| {
                                    invalid(format!("{key}.flow"), "expected keyword names")
                                })
                            })
                            .collect::<SchemaResult<Vec<_>>>()?;
                        flow.push(FlowPhase::Follow(followers));
                    }
                    _ => {
                        return Err(invalid(
                            format!("{key}.flow"),
                            "expected phase strings or keyword lists",
                        ));
                    }
                }
            }
            KeywordKind::ControlBlock { flow }
        }
        "parse" => {
            let rules_val = obj
                .get("rules")
                .ok_or_else(|| missing(&format!("{key}.rules")))?
                .as_array()
                .ok_or_else(|| invalid(format!("{key}.rules"), "expected an array"))?;
            let rules = rules_val
                .iter()
                .enumerate()
                .map(|(idx, meta)| parse_positional_param(&format!("{key}.rules[{idx}]"), meta))
                .collect::<SchemaResult<Vec<_>>>()?;
            KeywordKind::Parse { rules }
        }
        other => {
            return Err(invalid(
                format!("{key}.type"),
                format!("unknown keyword type '{other}'"),
            ));
        }
    };

    Ok(KeywordSchema {
        name: name.to_string(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundled;

    #[test]
    fn test_default_schema_loads() {
        let schema = Schema::from_json_str(bundled::default_schema()).unwrap();
        assert!(schema.api("expect").is_some());
        assert!(schema.api("exec_code").is_some());
        assert!(schema.keyword("if").is_some());
        assert!(schema.keyword("setvar").is_some());
    }

    #[test]
    fn test_expect_option_order_follows_document() {
        let schema = Schema::from_json_str(bundled::default_schema()).unwrap();
        let expect = schema.api("expect").unwrap();
        let flags: Vec<_> = expect.options.iter().map(|p| p.flag.as_str()).collect();
        assert_eq!(flags, vec!["-e", "-for", "-t", "-fail"]);
    }

    #[test]
    fn test_missing_top_level_key() {
        let err = Schema::from_json_str(r#"{"apis": {}, "keywords": {}}"#).unwrap_err();
        assert!(err.to_string().contains("'tokens'"), "{err}");
    }

    #[test]
    fn test_invalid_parse_mode_names_key() {
        let doc = r#"{
            "apis": {"broken": {"parse_mode": "magic", "parameters": {}}},
            "keywords": {},
            "tokens": {}
        }"#;
        let err = Schema::from_json_str(doc).unwrap_err();
        assert!(err.to_string().contains("apis.broken.parse_mode"), "{err}");
    }

    #[test]
    fn test_bad_token_fragment_is_rejected() {
        let doc = r#"{
            "apis": {},
            "keywords": {},
            "tokens": {"variable": "(unclosed"}
        }"#;
        let err = Schema::from_json_str(doc).unwrap_err();
        assert!(matches!(err, SchemaError::BadFragment { .. }));
    }

    #[test]
    fn test_merge_prefers_builtin_on_collision() {
        let schema = Schema::from_json_str(bundled::default_schema()).unwrap();
        let clash = ApiSchema::open_default("expect", "plugins/expect.py".into(), "python");
        let fresh = ApiSchema::open_default("extract_hostname", "plugins/x.py".into(), "python");
        let (merged, collisions) = schema.merge_discovered(vec![clash, fresh]);

        assert_eq!(collisions, vec!["expect".to_string()]);
        assert_eq!(merged.api("expect").unwrap().origin, ApiOrigin::Builtin);
        assert!(merged.api("extract_hostname").unwrap().open_options);
    }

    #[test]
    fn test_bare_option_lookup() {
        let schema = Schema::from_json_str(bundled::default_schema()).unwrap();
        let check_var = schema.api("check_var").unwrap();
        assert_eq!(check_var.bare_option().unwrap().flag, "-name");
        assert!(schema.api("expect").unwrap().bare_option().is_none());
    }
}
