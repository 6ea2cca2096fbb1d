//! Token stream validation and IR emission.
//!
//! The parser walks the lexer's token stream, validates it against the
//! schema-derived grammar, and emits a linear [`OpList`] with all
//! control-flow jump targets resolved to instruction indices. Syntax is
//! entirely schema-driven: API signatures choose positional or options
//! parsing, keyword `flow` lists drive control blocks. The only hardcoded
//! names are the op mnemonics the parser emits.

use std::collections::HashSet;
use std::sync::Arc;

use crate::ir::{CompiledScript, Op, OpList, Value, opnames};
use crate::lexer::{Token, TokenKind};
use crate::schema::{ApiSchema, FlowPhase, KeywordKind, ParamType, PositionalParam, Schema};

/// Result type for parser operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// A script that failed validation. Fatal for the current script.
#[derive(Debug)]
pub struct ParseError {
    pub line: u32,
    pub message: String,
    pub expected: Option<String>,
    pub got: Option<String>,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parse error at line {}: {}", self.line, self.message)?;
        if let Some(expected) = &self.expected {
            write!(f, " (expected {expected}")?;
            if let Some(got) = &self.got {
                write!(f, ", got {got}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
            expected: None,
            got: None,
        }
    }

    fn expecting(
        line: u32,
        message: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self {
            line,
            message: message.into(),
            expected: Some(expected.into()),
            got: Some(got.into()),
        }
    }
}

/// Parses a lexed token stream into a [`CompiledScript`].
pub fn parse(schema: &Schema, tokens: Vec<Token>, file: &str) -> ParseResult<CompiledScript> {
    let mut parser = Parser::new(schema, tokens);
    parser.run()?;
    Ok(CompiledScript {
        file: file.to_string(),
        ops: parser.ops,
        devices: parser.devices,
        includes: parser.includes,
    })
}

struct Parser<'s> {
    schema: &'s Schema,
    tokens: Vec<Token>,
    i: usize,
    ops: OpList,
    devices: Vec<String>,
    includes: Vec<String>,
    /// Keywords that only ever appear as followers of an open block
    /// (`elseif`, `fi`, `until`, ...); seeing one elsewhere is an error.
    follower_set: HashSet<String>,
}

impl<'s> Parser<'s> {
    fn new(schema: &'s Schema, tokens: Vec<Token>) -> Self {
        let mut follower_set = HashSet::new();
        for name in schema.keyword_names() {
            if let Some(kw) = schema.keyword(name)
                && let KeywordKind::ControlBlock { flow } = &kw.kind
            {
                for phase in flow {
                    if let FlowPhase::Follow(list) = phase {
                        follower_set.extend(list.iter().cloned());
                    }
                }
            }
        }
        Self {
            schema,
            tokens,
            i: 0,
            ops: Vec::new(),
            devices: Vec::new(),
            includes: Vec::new(),
            follower_set,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.i)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.i).cloned();
        if tok.is_some() {
            self.i += 1;
        }
        tok
    }

    fn emit(&mut self, op: Op) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    /// Fills in a previously emitted jump placeholder.
    fn patch_target(&mut self, op_idx: usize, target: usize) {
        let op = &mut self.ops[op_idx];
        let slot = if op.name == opnames::IF_NOT_GOTO {
            op.params.len() - 1
        } else {
            0
        };
        op.params[slot] = Value::Int(target as i64);
    }

    fn run(&mut self) -> ParseResult<()> {
        while self.peek().is_some() {
            self.parse_instruction()?;
        }
        Ok(())
    }

    /// Parses exactly one instruction (which may span many lines for
    /// control blocks).
    fn parse_instruction(&mut self) -> ParseResult<()> {
        let tok = self.advance().expect("caller checked peek");
        match tok.kind {
            TokenKind::Section => {
                if !self.devices.contains(&tok.text) {
                    self.devices.push(tok.text.clone());
                }
                self.emit(Op::new(
                    tok.line,
                    opnames::SWITCH_DEVICE,
                    vec![Value::Str(tok.text)],
                ));
                Ok(())
            }
            TokenKind::Command => {
                self.emit(Op::new(tok.line, opnames::COMMAND, vec![Value::Str(tok.text)]));
                Ok(())
            }
            TokenKind::Comment => {
                self.emit(Op::new(tok.line, opnames::COMMENT, vec![Value::Str(tok.text)]));
                Ok(())
            }
            TokenKind::Include => {
                if !self.includes.contains(&tok.text) {
                    self.includes.push(tok.text.clone());
                }
                self.emit(Op::new(tok.line, opnames::INCLUDE, vec![Value::Str(tok.text)]));
                Ok(())
            }
            TokenKind::Api => self.parse_api(tok),
            TokenKind::Keyword => self.parse_keyword(tok),
            other => Err(ParseError::expecting(
                tok.line,
                "unexpected token at instruction position",
                "section, command, comment, include, api or keyword",
                format!("{} '{}'", other.name(), tok.text),
            )),
        }
    }

    fn parse_api(&mut self, tok: Token) -> ParseResult<()> {
        let api = self
            .schema
            .api(&tok.text)
            .ok_or_else(|| ParseError::new(tok.line, format!("unknown API '{}'", tok.text)))?
            .clone();

        match api.parse_mode {
            crate::schema::ParseMode::Options => self.parse_options(&tok, api),
            crate::schema::ParseMode::Positional => {
                let rules = api.positional.clone();
                let params = self.parse_positional(&tok, &rules)?;
                self.emit(Op::new(tok.line, tok.text.clone(), params).with_api(api));
                Ok(())
            }
        }
    }

    fn parse_keyword(&mut self, tok: Token) -> ParseResult<()> {
        let kw = self
            .schema
            .keyword(&tok.text)
            .ok_or_else(|| ParseError::new(tok.line, format!("unknown keyword '{}'", tok.text)))?
            .clone();

        match &kw.kind {
            KeywordKind::Parse { rules } => {
                let params = self.parse_positional(&tok, rules)?;
                self.emit(Op::new(tok.line, tok.text.clone(), params));
                Ok(())
            }
            KeywordKind::ControlBlock { .. } => {
                if self.follower_set.contains(&tok.text) {
                    return Err(ParseError::new(
                        tok.line,
                        format!("unmatched control-flow keyword '{}'", tok.text),
                    ));
                }
                self.parse_control_block(tok)
            }
        }
    }

    /// Consumes a fixed parameter sequence on the keyword's source line.
    fn parse_positional(
        &mut self,
        head: &Token,
        rules: &[PositionalParam],
    ) -> ParseResult<Vec<Value>> {
        let mut values = Vec::with_capacity(rules.len());
        for rule in rules {
            let available = self
                .peek()
                .is_some_and(|t| t.line == head.line && is_value_kind(t.kind));
            if !available {
                if rule.required && rule.default.is_none() {
                    let got = match self.peek() {
                        Some(t) if t.line != head.line => {
                            "end of line (positional arguments may not cross lines)".to_string()
                        }
                        Some(t) => format!("{} '{}'", t.kind.name(), t.text),
                        None => "end of script".to_string(),
                    };
                    return Err(ParseError::expecting(
                        head.line,
                        format!("missing parameter '{}' for '{}'", rule.name, head.text),
                        rule.kinds.join("|"),
                        got,
                    ));
                }
                values.push(default_value(rule.default.as_deref()));
                continue;
            }

            let tok = self.advance().expect("peeked above");
            if !rule.kinds.iter().any(|k| k == tok.kind.name()) {
                return Err(ParseError::expecting(
                    tok.line,
                    format!("invalid parameter '{}' for '{}'", rule.name, head.text),
                    rule.kinds.join("|"),
                    format!("{} '{}'", tok.kind.name(), tok.text),
                ));
            }
            values.push(token_value(&tok));
        }
        Ok(values)
    }

    /// Consumes `-flag value` pairs on the API's source line, in schema
    /// order, with last-write-wins on repeats.
    fn parse_options(&mut self, head: &Token, api: Arc<ApiSchema>) -> ParseResult<()> {
        if api.open_options {
            return self.parse_open_options(head, api);
        }

        let mut values: Vec<Value> = api
            .options
            .iter()
            .map(|p| match (&p.default, p.ty) {
                (Some(d), ParamType::Int) => d
                    .parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or_else(|_| Value::Str(d.clone())),
                (Some(d), _) => Value::Str(d.clone()),
                (None, _) => Value::Null,
            })
            .collect();
        let mut seen_any = false;

        while let Some(tok) = self.peek().cloned() {
            if tok.line != head.line {
                break;
            }
            if !tok.text.starts_with('-') {
                // A single leading bare value may bind to the flag marked
                // `bare` in the schema (`check_var name -value V`).
                if !seen_any
                    && let Some(bare) = api.bare_option()
                {
                    let idx = api
                        .option_by_alias(&bare.alias)
                        .map(|(i, _)| i)
                        .expect("bare option is declared");
                    let value_tok = self.advance().expect("peeked above");
                    values[idx] = typed_value(&value_tok, bare.ty, head, &bare.flag)?;
                    seen_any = true;
                    continue;
                }
                return Err(ParseError::expecting(
                    tok.line,
                    format!("unexpected token in '{}' options", head.text),
                    "a -flag",
                    format!("{} '{}'", tok.kind.name(), tok.text),
                ));
            }

            let flag_tok = self.advance().expect("peeked above");
            seen_any = true;
            let param = api.option_by_flag(&flag_tok.text).ok_or_else(|| {
                ParseError::new(
                    flag_tok.line,
                    format!("unknown flag '{}' for API '{}'", flag_tok.text, head.text),
                )
            })?;
            let idx = api
                .option_by_alias(&param.alias)
                .map(|(i, _)| i)
                .expect("flag resolved above");
            let (ty, flag) = (param.ty, param.flag.clone());

            let value_tok = self.next_value_on_line(head, &flag)?;
            values[idx] = typed_value(&value_tok, ty, head, &flag)?;
        }

        for (idx, param) in api.options.iter().enumerate() {
            if param.required && values[idx].is_null() {
                return Err(ParseError::new(
                    head.line,
                    format!(
                        "missing required flag '{}' for API '{}'",
                        param.flag, head.text
                    ),
                ));
            }
        }

        self.emit(Op::new(head.line, head.text.clone(), values).with_api(api));
        Ok(())
    }

    /// Options parsing for discovered plugin APIs with no declared flags:
    /// every `-flag value` pair is accepted and stored in appearance order.
    fn parse_open_options(&mut self, head: &Token, api: Arc<ApiSchema>) -> ParseResult<()> {
        let mut values = Vec::new();
        while let Some(tok) = self.peek().cloned() {
            if tok.line != head.line {
                break;
            }
            if !tok.text.starts_with('-') {
                return Err(ParseError::expecting(
                    tok.line,
                    format!("unexpected token in '{}' options", head.text),
                    "a -flag",
                    format!("{} '{}'", tok.kind.name(), tok.text),
                ));
            }
            let flag_tok = self.advance().expect("peeked above");
            let value_tok = self.next_value_on_line(head, &flag_tok.text)?;
            values.push(Value::Str(flag_tok.text));
            values.push(token_value(&value_tok));
        }
        self.emit(Op::new(head.line, head.text.clone(), values).with_api(api));
        Ok(())
    }

    fn next_value_on_line(&mut self, head: &Token, flag: &str) -> ParseResult<Token> {
        let usable = self
            .peek()
            .is_some_and(|t| t.line == head.line && is_value_kind(t.kind));
        if usable {
            return Ok(self.advance().expect("checked above"));
        }
        let got = match self.peek() {
            Some(t) if t.line == head.line => format!("{} '{}'", t.kind.name(), t.text),
            _ => "end of line".to_string(),
        };
        Err(ParseError::expecting(
            head.line,
            format!("flag '{}' of '{}' requires a value", flag, head.text),
            "string, number, identifier or variable",
            got,
        ))
    }

    /// Collects expression tokens up to the end of the keyword's line.
    fn collect_expression(&mut self, line: u32, keyword: &str) -> ParseResult<Vec<Value>> {
        let mut expr = Vec::new();
        while self
            .peek()
            .is_some_and(|tok| tok.line == line && is_expr_kind(tok.kind))
        {
            let tok = self.advance().expect("checked above");
            expr.push(expr_value(&tok));
        }
        if expr.is_empty() {
            return Err(ParseError::expecting(
                line,
                format!("'{keyword}' requires a condition expression"),
                "an expression",
                "end of line",
            ));
        }
        Ok(expr)
    }

    /// Parses a whole control construct, walking the schema's `flow` lists
    /// from the opening keyword through its followers, and resolving all
    /// jump targets on the way.
    fn parse_control_block(&mut self, open: Token) -> ParseResult<()> {
        // Index of the conditional jump still waiting for its false-target.
        let mut pending_cond: Option<usize> = None;
        // Unconditional end-of-block jumps waiting for the close index.
        let mut pending_end: Vec<usize> = Vec::new();
        // Back-jump anchor for loop/while constructs.
        let mut block_begin: Option<usize> = None;
        let mut current = open;

        loop {
            let kw = self
                .schema
                .keyword(&current.text)
                .ok_or_else(|| {
                    ParseError::new(current.line, format!("unknown keyword '{}'", current.text))
                })?
                .clone();
            let flow = match &kw.kind {
                KeywordKind::ControlBlock { flow } => flow.clone(),
                KeywordKind::Parse { .. } => {
                    return Err(ParseError::new(
                        current.line,
                        format!("keyword '{}' cannot follow a control block", current.text),
                    ));
                }
            };

            let mut phases = flow.iter().peekable();
            let expr = if matches!(phases.peek(), Some(FlowPhase::Expression)) {
                phases.next();
                Some(self.collect_expression(current.line, &current.text)?)
            } else {
                None
            };

            let require_expr = |expr: Option<Vec<Value>>, line: u32, name: &str| {
                expr.ok_or_else(|| {
                    ParseError::new(
                        line,
                        format!("keyword '{name}' declares no expression phase in the schema"),
                    )
                })
            };

            match current.text.as_str() {
                "if" => {
                    let mut params = require_expr(expr, current.line, &current.text)?;
                    params.push(Value::Null);
                    let idx = self.emit(Op::new(current.line, opnames::IF_NOT_GOTO, params));
                    pending_cond = Some(idx);
                }
                "while" => {
                    let mut params = require_expr(expr, current.line, &current.text)?;
                    params.push(Value::Null);
                    let idx = self.emit(Op::new(current.line, opnames::IF_NOT_GOTO, params));
                    pending_cond = Some(idx);
                    block_begin = Some(idx);
                }
                "elseif" => {
                    let jump = self.emit(Op::new(current.line, opnames::ELSEIF, vec![Value::Null]));
                    pending_end.push(jump);
                    let after = self.ops.len();
                    if let Some(cond) = pending_cond.take() {
                        self.patch_target(cond, after);
                    }
                    let mut params = require_expr(expr, current.line, &current.text)?;
                    params.push(Value::Null);
                    let idx = self.emit(Op::new(current.line, opnames::IF_NOT_GOTO, params));
                    pending_cond = Some(idx);
                }
                "else" => {
                    let jump = self.emit(Op::new(current.line, opnames::ELSE, vec![Value::Null]));
                    pending_end.push(jump);
                    let after = self.ops.len();
                    if let Some(cond) = pending_cond.take() {
                        self.patch_target(cond, after);
                    }
                }
                "fi" => {
                    let endif = self.emit(Op::new(current.line, opnames::ENDIF, Vec::new()));
                    if let Some(cond) = pending_cond.take() {
                        self.patch_target(cond, endif);
                    }
                    for jump in pending_end.drain(..) {
                        self.patch_target(jump, endif);
                    }
                }
                "endwhile" => {
                    let begin = block_begin.ok_or_else(|| {
                        ParseError::new(current.line, "'endwhile' outside a while block")
                    })?;
                    self.emit(Op::new(
                        current.line,
                        opnames::ELSE,
                        vec![Value::Int(begin as i64)],
                    ));
                    let endif = self.emit(Op::new(current.line, opnames::ENDIF, Vec::new()));
                    if let Some(cond) = pending_cond.take() {
                        self.patch_target(cond, endif);
                    }
                }
                "loop" => {
                    let idx = self.emit(Op::new(current.line, opnames::LOOP, Vec::new()));
                    block_begin = Some(idx);
                }
                "until" => {
                    let begin = block_begin.ok_or_else(|| {
                        ParseError::new(current.line, "'until' outside a loop block")
                    })?;
                    let mut params = vec![Value::Int(begin as i64)];
                    params.extend(require_expr(expr, current.line, &current.text)?);
                    self.emit(Op::new(current.line, opnames::UNTIL, params));
                }
                other => {
                    return Err(ParseError::new(
                        current.line,
                        format!("control keyword '{other}' has no emission rule"),
                    ));
                }
            }

            let mut next_follower = None;
            while let Some(phase) = phases.next() {
                match phase {
                    FlowPhase::Script => {
                        let followers = match phases.peek() {
                            Some(FlowPhase::Follow(list)) => list.clone(),
                            _ => {
                                return Err(ParseError::new(
                                    current.line,
                                    format!(
                                        "keyword '{}' declares a script phase without followers",
                                        current.text
                                    ),
                                ));
                            }
                        };
                        next_follower = Some(self.parse_block_until(&followers, &current)?);
                    }
                    FlowPhase::Follow(_) => {}
                    FlowPhase::Expression => {
                        return Err(ParseError::new(
                            current.line,
                            format!(
                                "keyword '{}' declares an expression after its script phase",
                                current.text
                            ),
                        ));
                    }
                }
            }

            match next_follower {
                Some(tok) => current = tok,
                None => return Ok(()),
            }
        }
    }

    /// Parses nested instructions until one of `followers` appears, then
    /// consumes and returns that keyword token.
    fn parse_block_until(&mut self, followers: &[String], open: &Token) -> ParseResult<Token> {
        loop {
            if self.peek().is_none() {
                return Err(ParseError::expecting(
                    open.line,
                    format!("unterminated '{}' block", open.text),
                    followers.join("|"),
                    "end of script",
                ));
            }
            let at_follower = self.peek().is_some_and(|tok| {
                tok.kind == TokenKind::Keyword && followers.iter().any(|f| f == &tok.text)
            });
            if at_follower {
                return Ok(self.advance().expect("checked above"));
            }
            self.parse_instruction()?;
        }
    }
}

fn is_value_kind(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Identifier
            | TokenKind::String
            | TokenKind::Number
            | TokenKind::Variable
            | TokenKind::Operator
    )
}

fn is_expr_kind(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Identifier
            | TokenKind::String
            | TokenKind::Number
            | TokenKind::Variable
            | TokenKind::Operator
            | TokenKind::Symbol
    )
}

/// Converts a payload token to its param value.
///
/// Variable references keep their `$` sigil so runtime expansion can see
/// them; numbers become integers; everything else is literal text.
fn token_value(tok: &Token) -> Value {
    match tok.kind {
        TokenKind::Number => tok
            .text
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Str(tok.text.clone())),
        TokenKind::Variable => Value::Str(format!("${}", tok.text)),
        _ => Value::Str(tok.text.clone()),
    }
}

fn expr_value(tok: &Token) -> Value {
    token_value(tok)
}

fn default_value(default: Option<&str>) -> Value {
    match default {
        Some(d) => d
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Str(d.to_string())),
        None => Value::Null,
    }
}

/// Converts an option value token per its declared type. Variables defer
/// coercion to runtime (after expansion).
fn typed_value(tok: &Token, ty: ParamType, head: &Token, flag: &str) -> ParseResult<Value> {
    if tok.kind == TokenKind::Variable {
        return Ok(Value::Str(format!("${}", tok.text)));
    }
    match ty {
        ParamType::Int => tok.text.parse::<i64>().map(Value::Int).map_err(|_| {
            ParseError::expecting(
                tok.line,
                format!("flag '{}' of '{}' expects an integer", flag, head.text),
                "an integer",
                format!("'{}'", tok.text),
            )
        }),
        _ => Ok(Value::Str(tok.text.clone())),
    }
}
