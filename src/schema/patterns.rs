//! Combined lexer patterns generated from the schema.
//!
//! Line classification is the hot path of compilation, so it is a single
//! combined regex (`LinePattern`) whose first matching named group decides
//! the line's kind. The API alternation is sorted by decreasing name length
//! so longer API names win over shorter prefixes; name boundaries are
//! enforced structurally (the payload must be empty or start with
//! whitespace) because the `regex` crate has no lookaround.
//!
//! Patterns are regenerated whenever the schema changes (phase-2 merge).

use regex::Regex;

use super::{Schema, SchemaError, SchemaResult};

/// Named groups of the token pattern, in match-priority order.
pub const TOKEN_GROUPS: &[&str] = &[
    "variable",
    "symbol",
    "number",
    "operator",
    "string",
    "identifier",
];

/// High-level classification of one script line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    Blank,
    CommentedSection(String),
    CommentedLine(String),
    Section(String),
    Include(String),
    Comment(String),
    Statement { keyword: String, rest: String },
    Api { name: String, rest: String, known: bool },
    Command(String),
}

/// One raw token produced from an api/statement payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToken {
    /// Name of the token-pattern group that matched.
    pub group: &'static str,
    pub text: String,
}

/// The compiled line and token patterns for one schema snapshot.
#[derive(Debug, Clone)]
pub struct Patterns {
    line: Regex,
    token: Regex,
}

impl Patterns {
    /// Compiles both patterns from the schema's token fragments and the
    /// current API/keyword name sets.
    pub fn build(schema: &Schema) -> SchemaResult<Self> {
        let line = build_line_pattern(schema)?;
        let token = build_token_pattern(schema)?;
        Ok(Self { line, token })
    }

    /// Classifies a single source line.
    pub fn classify(&self, line: &str) -> LineClass {
        if line.trim().is_empty() {
            return LineClass::Blank;
        }
        let caps = match self.line.captures(line) {
            Some(caps) => caps,
            // The command fallback matches any non-blank line.
            None => return LineClass::Command(line.trim().to_string()),
        };

        if let Some(m) = caps.name("commented_section") {
            return LineClass::CommentedSection(m.as_str().trim().to_string());
        }
        if let Some(m) = caps.name("commented_line") {
            return LineClass::CommentedLine(m.as_str().trim().to_string());
        }
        if let Some(m) = caps.name("section") {
            return LineClass::Section(m.as_str().to_string());
        }
        if let Some(m) = caps.name("include") {
            let raw = m.as_str();
            let path = raw
                .strip_prefix('<')
                .and_then(|s| s.strip_suffix('>'))
                .unwrap_or(raw);
            return LineClass::Include(path.trim().to_string());
        }
        if let Some(m) = caps.name("comment") {
            return LineClass::Comment(m.as_str().trim().to_string());
        }
        if let Some(m) = caps.name("statement") {
            let rest = caps.name("stmt_rest").map(|r| r.as_str()).unwrap_or("");
            return LineClass::Statement {
                keyword: m.as_str().to_string(),
                rest: rest.trim().to_string(),
            };
        }
        if let Some(m) = caps.name("api") {
            let rest = caps.name("api_rest").map(|r| r.as_str()).unwrap_or("");
            return LineClass::Api {
                name: m.as_str().to_string(),
                rest: rest.trim().to_string(),
                known: true,
            };
        }
        if let Some(m) = caps.name("api_unknown") {
            let rest = caps.name("unknown_rest").map(|r| r.as_str()).unwrap_or("");
            return LineClass::Api {
                name: m.as_str().to_string(),
                rest: rest.trim().to_string(),
                known: false,
            };
        }
        if let Some(m) = caps.name("command") {
            return LineClass::Command(m.as_str().trim().to_string());
        }
        LineClass::Command(line.trim().to_string())
    }

    /// Tokenizes an api/statement payload.
    ///
    /// Returns the byte offset of the first character that belongs to no
    /// token when the payload cannot be fully consumed.
    pub fn tokenize(&self, payload: &str) -> Result<Vec<RawToken>, usize> {
        let mut tokens = Vec::new();
        let mut consumed = 0usize;

        for caps in self.token.captures_iter(payload) {
            let whole = caps.get(0).expect("match group 0 always present");
            // Anything between tokens must be whitespace.
            let gap = &payload[consumed..whole.start()];
            if let Some(junk) = gap.find(|c: char| !c.is_whitespace()) {
                return Err(consumed + junk);
            }
            consumed = whole.end();

            for group in TOKEN_GROUPS {
                if let Some(m) = caps.name(group) {
                    tokens.push(RawToken {
                        group,
                        text: m.as_str().to_string(),
                    });
                    break;
                }
            }
        }

        let tail = &payload[consumed..];
        if let Some(junk) = tail.find(|c: char| !c.is_whitespace()) {
            return Err(consumed + junk);
        }
        Ok(tokens)
    }
}

/// Joins escaped names into an alternation, longest first so that no name
/// is shadowed by one of its prefixes.
fn name_alternation<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let mut names: Vec<&str> = names.collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    names.dedup();
    if names.is_empty() {
        // Never matches; keeps the combined pattern well-formed.
        return r"[^\s\S]".to_string();
    }
    names
        .iter()
        .map(|n| regex::escape(n))
        .collect::<Vec<_>>()
        .join("|")
}

fn build_line_pattern(schema: &Schema) -> SchemaResult<Regex> {
    let section = schema.tokens().fragment("section");
    let keywords = name_alternation(schema.keyword_names());
    let apis = name_alternation(schema.api_names());

    // The payload between a name and the closing `>` is lazy and the line
    // is end-anchored, so the match closes on the line's final `>`. This
    // keeps `>` usable inside expressions and quoted strings, and it
    // enforces name boundaries: the payload must be absent or start with
    // whitespace.
    let rest = r"(?:\s+(.*?))?";
    let pattern = format!(
        r"^\s*(?:(?P<commented_section>#\[(?:{section})\].*)|(?P<commented_line>#.*)|\[(?P<section>{section})\]\s*|include\s+(?P<include><[^>]+>|\S+)\s*|Comment:\s*(?P<comment>.*)|<\s*(?P<statement>{keywords}){rest_stmt}\s*>\s*|<\s*(?P<api>{apis}){rest_api}\s*>\s*|<\s*(?P<api_unknown>[A-Za-z_][A-Za-z0-9_]*){rest_unknown}\s*>\s*|(?P<command>\S.*))$",
        rest_stmt = rest.replacen("(.*?)", "(?P<stmt_rest>.*?)", 1),
        rest_api = rest.replacen("(.*?)", "(?P<api_rest>.*?)", 1),
        rest_unknown = rest.replacen("(.*?)", "(?P<unknown_rest>.*?)", 1),
    );

    Regex::new(&pattern).map_err(|e| SchemaError::InvalidKey {
        key: "tokens".to_string(),
        reason: format!("combined line pattern failed to compile: {e}"),
    })
}

fn build_token_pattern(schema: &Schema) -> SchemaResult<Regex> {
    let alternatives = TOKEN_GROUPS
        .iter()
        .map(|group| format!("(?P<{group}>{})", schema.tokens().fragment(group)))
        .collect::<Vec<_>>()
        .join("|");

    Regex::new(&alternatives).map_err(|e| SchemaError::InvalidKey {
        key: "tokens".to_string(),
        reason: format!("combined token pattern failed to compile: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundled;

    fn patterns() -> Patterns {
        let schema = Schema::from_json_str(bundled::default_schema()).unwrap();
        Patterns::build(&schema).unwrap()
    }

    #[test]
    fn test_classify_section() {
        let p = patterns();
        assert_eq!(
            p.classify("[FGT1]"),
            LineClass::Section("FGT1".to_string())
        );
        assert_eq!(
            p.classify("  [TEST_PC_2]  "),
            LineClass::Section("TEST_PC_2".to_string())
        );
    }

    #[test]
    fn test_classify_comments() {
        let p = patterns();
        assert!(matches!(p.classify("#[FGT1]"), LineClass::CommentedSection(_)));
        assert!(matches!(p.classify("# plain note"), LineClass::CommentedLine(_)));
        assert_eq!(
            p.classify("Comment: check the session table"),
            LineClass::Comment("check the session table".to_string())
        );
    }

    #[test]
    fn test_classify_include() {
        let p = patterns();
        assert_eq!(
            p.classify("include common/setup.fos"),
            LineClass::Include("common/setup.fos".to_string())
        );
        assert_eq!(
            p.classify("include <GLOBAL:VERSION/setup.fos>"),
            LineClass::Include("GLOBAL:VERSION/setup.fos".to_string())
        );
    }

    #[test]
    fn test_classify_api_and_statement() {
        let p = patterns();
        match p.classify(r#"<expect -e "login:" -for QA001 -t 10>"#) {
            LineClass::Api { name, rest, known } => {
                assert_eq!(name, "expect");
                assert!(known);
                assert!(rest.starts_with("-e"));
            }
            other => panic!("unexpected class: {other:?}"),
        }
        match p.classify(r#"<setvar ip "192.168.1.1">"#) {
            LineClass::Statement { keyword, rest } => {
                assert_eq!(keyword, "setvar");
                assert!(rest.contains("ip"));
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_api_is_flagged_not_command() {
        let p = patterns();
        match p.classify("<extract_hostname -var h>") {
            LineClass::Api { name, known, .. } => {
                assert_eq!(name, "extract_hostname");
                assert!(!known);
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn test_api_name_is_not_a_prefix_match() {
        // "expecting" must not be cut down to the "expect" API.
        let p = patterns();
        match p.classify("<expecting -x 1>") {
            LineClass::Api { name, known, .. } => {
                assert_eq!(name, "expecting");
                assert!(!known);
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn test_greater_than_inside_statement_expression() {
        let p = patterns();
        match p.classify("<if $x > 3>") {
            LineClass::Statement { keyword, rest } => {
                assert_eq!(keyword, "if");
                assert_eq!(rest, "$x > 3");
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn test_raw_command_fallback() {
        let p = patterns();
        assert_eq!(
            p.classify("get system status"),
            LineClass::Command("get system status".to_string())
        );
    }

    #[test]
    fn test_quoted_angle_bracket_stays_in_payload() {
        let p = patterns();
        match p.classify(r#"<expect -e "prompt> " -for QA002>"#) {
            LineClass::Api { name, rest, .. } => {
                assert_eq!(name, "expect");
                assert!(rest.contains("prompt> "));
            }
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[test]
    fn test_tokenize_payload() {
        let p = patterns();
        let tokens = p.tokenize(r#"-e "login:" -for QA001 -t 10"#).unwrap();
        let groups: Vec<_> = tokens.iter().map(|t| t.group).collect();
        assert_eq!(
            groups,
            vec!["symbol", "string", "symbol", "identifier", "symbol", "number"]
        );
    }

    #[test]
    fn test_tokenize_variable_forms() {
        let p = patterns();
        let tokens = p.tokenize("$ip {$gateway} $?").unwrap();
        assert!(tokens.iter().all(|t| t.group == "variable"));
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn test_tokenize_rejects_junk() {
        let p = patterns();
        let err = p.tokenize("ip @@ 1").unwrap_err();
        assert_eq!(err, 3);
    }

    #[test]
    fn test_tokenize_operators() {
        let p = patterns();
        let tokens = p.tokenize("$x == 10").unwrap();
        let groups: Vec<_> = tokens.iter().map(|t| t.group).collect();
        assert_eq!(groups, vec!["variable", "operator", "number"]);
    }
}
