//! Script tokenization.
//!
//! The lexer turns raw script text into a typed token stream, one line at a
//! time, preserving 1-based line numbers for diagnostics. Each line is
//! classified by the schema-generated `LinePattern`; api/statement payloads
//! are then tokenized with `TokenPattern`. Any other non-blank line is a
//! raw device command.
//!
//! A deprecated-command table (optional, from runner config) rewrites old
//! CLI spellings before classification. The check early-exits on a cheap
//! prefix scan so the common case never touches a regex.

use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::schema::patterns::{LineClass, Patterns};

/// Result type for lexer operations.
pub type LexResult<T> = Result<T, LexError>;

/// A script line that could not be tokenized.
///
/// Fatal for the current script; other scripts are unaffected.
#[derive(Debug, thiserror::Error)]
#[error("lex error at line {line}: {message}")]
pub struct LexError {
    pub line: u32,
    pub message: String,
}

/// Kind of a lexed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Section,
    Api,
    Keyword,
    Identifier,
    String,
    Number,
    Variable,
    Symbol,
    Operator,
    Comment,
    Include,
    Command,
}

impl TokenKind {
    /// Lexer kind name as used by schema `kinds` lists.
    pub fn name(&self) -> &'static str {
        match self {
            TokenKind::Section => "section",
            TokenKind::Api => "api",
            TokenKind::Keyword => "keyword",
            TokenKind::Identifier => "identifier",
            TokenKind::String => "string",
            TokenKind::Number => "number",
            TokenKind::Variable => "variable",
            TokenKind::Symbol => "symbol",
            TokenKind::Operator => "operator",
            TokenKind::Comment => "comment",
            TokenKind::Include => "include",
            TokenKind::Command => "command",
        }
    }
}

/// One token. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
        }
    }
}

/// One deprecated-command rewrite rule.
#[derive(Debug, Clone)]
pub struct DeprecatedRule {
    prefix: String,
    pattern: Regex,
    replacement: String,
}

/// Precompiled substitution table for deprecated CLI commands.
///
/// Empty by default; populated from `[[deprecated]]` runner-config entries.
///
/// # Example
///
/// ```
/// use fosrun::lexer::DeprecatedTable;
///
/// let mut table = DeprecatedTable::new();
/// table.add_rule("diag sys", "^diag sys", "diagnose sys")?;
///
/// assert_eq!(
///     table.rewrite("diag sys session list").as_deref(),
///     Some("diagnose sys session list")
/// );
/// assert!(table.rewrite("get system status").is_none());
/// # Ok::<(), regex::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct DeprecatedTable {
    rules: Vec<DeprecatedRule>,
}

impl DeprecatedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule. `prefix` is the cheap pre-filter; `pattern` the actual
    /// substitution regex.
    pub fn add_rule(
        &mut self,
        prefix: &str,
        pattern: &str,
        replacement: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(DeprecatedRule {
            prefix: prefix.to_string(),
            pattern: Regex::new(pattern)?,
            replacement: replacement.to_string(),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrites a deprecated command line, or returns `None` unchanged.
    ///
    /// The prefix scan runs first so lines without any deprecated spelling
    /// skip regex matching entirely.
    pub fn rewrite(&self, line: &str) -> Option<String> {
        let trimmed = line.trim_start();
        let rule = self
            .rules
            .iter()
            .find(|r| trimmed.starts_with(r.prefix.as_str()))?;
        if !rule.pattern.is_match(trimmed) {
            return None;
        }
        Some(rule.pattern.replace(trimmed, rule.replacement.as_str()).into_owned())
    }
}

/// The lexer for one schema snapshot.
pub struct Lexer {
    patterns: Arc<Patterns>,
    deprecated: DeprecatedTable,
}

impl Lexer {
    pub fn new(patterns: Arc<Patterns>, deprecated: DeprecatedTable) -> Self {
        Self {
            patterns,
            deprecated,
        }
    }

    /// Tokenizes `source`, returning the token stream and the original
    /// source lines (for diagnostics).
    pub fn lex(&self, source: &str, file_name: &str) -> LexResult<(Vec<Token>, Vec<String>)> {
        let mut tokens = Vec::new();
        let mut source_lines = Vec::new();

        for (idx, raw_line) in source.lines().enumerate() {
            let line_no = (idx + 1) as u32;
            source_lines.push(raw_line.to_string());

            let line = if self.deprecated.is_empty() {
                raw_line.to_string()
            } else {
                match self.deprecated.rewrite(raw_line) {
                    Some(rewritten) => {
                        warn!(
                            file = file_name,
                            line = line_no,
                            "rewrote deprecated command '{}' -> '{}'",
                            raw_line.trim(),
                            rewritten
                        );
                        rewritten
                    }
                    None => raw_line.to_string(),
                }
            };

            match self.patterns.classify(&line) {
                LineClass::Blank => {}
                LineClass::CommentedSection(text) | LineClass::CommentedLine(text) => {
                    tokens.push(Token::new(TokenKind::Comment, text, line_no));
                }
                LineClass::Section(name) => {
                    tokens.push(Token::new(TokenKind::Section, name, line_no));
                }
                LineClass::Include(path) => {
                    tokens.push(Token::new(TokenKind::Include, path, line_no));
                }
                LineClass::Comment(text) => {
                    tokens.push(Token::new(TokenKind::Comment, text, line_no));
                }
                LineClass::Statement { keyword, rest } => {
                    tokens.push(Token::new(TokenKind::Keyword, keyword, line_no));
                    self.lex_payload(&rest, line_no, &mut tokens)?;
                }
                LineClass::Api { name, rest, known: _ } => {
                    // Unknown API names still lex; the parser rejects them
                    // with the name and line number.
                    tokens.push(Token::new(TokenKind::Api, name, line_no));
                    self.lex_payload(&rest, line_no, &mut tokens)?;
                }
                LineClass::Command(text) => {
                    tokens.push(Token::new(TokenKind::Command, text, line_no));
                }
            }
        }

        Ok((tokens, source_lines))
    }

    fn lex_payload(&self, payload: &str, line: u32, out: &mut Vec<Token>) -> LexResult<()> {
        let raw = self.patterns.tokenize(payload).map_err(|offset| LexError {
            line,
            message: format!(
                "unmatched token payload at column {}: '{}'",
                offset + 1,
                &payload[offset..]
            ),
        })?;

        for token in raw {
            let (kind, text) = match token.group {
                "variable" => (TokenKind::Variable, normalize_variable(&token.text)),
                "symbol" => (TokenKind::Symbol, token.text),
                "number" => (TokenKind::Number, token.text),
                "operator" => (TokenKind::Operator, token.text),
                "string" => (TokenKind::String, unquote(&token.text)),
                _ => (TokenKind::Identifier, token.text),
            };
            out.push(Token::new(kind, text, line));
        }
        Ok(())
    }
}

/// Strips the variable sigils: `$NAME` and `{$NAME}` both yield `NAME`.
fn normalize_variable(text: &str) -> String {
    let inner = text
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(text);
    inner.trim_start_matches('$').to_string()
}

/// Removes surrounding quotes and resolves simple escapes.
fn unquote(text: &str) -> String {
    let body = if text.len() >= 2 {
        &text[1..text.len() - 1]
    } else {
        text
    };
    let mut result = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some(other) => result.push(other),
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}
