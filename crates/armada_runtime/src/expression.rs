//! Restricted expression evaluator.
//!
//! Expressions drive target queries, skip queries, pre- and post-processing
//! statements, credential templates and `{{ ... }}` command templates. The
//! language is deliberately small: literals, variables from an explicit
//! [`Scope`], attribute and index access, arithmetic, comparisons, boolean
//! logic, and calls to the functions in [`Function`]. Nothing outside the
//! scope and the function table is reachable.
//!
//! # Example
//!
//! ```
//! use armada_runtime::expression::{Evaluator, Scope};
//! use serde_json::json;
//!
//! let evaluator = Evaluator::default();
//! let mut scope = Scope::new().with("device", json!({"name": "edge-1", "vendor": "Acme"}));
//!
//! let value = evaluator.evaluate("lower(device.vendor) == 'acme'", &scope).unwrap();
//! assert_eq!(value, json!(true));
//!
//! evaluator.execute("retries = 3; label = device.name + '-backup'", &mut scope).unwrap();
//! assert_eq!(scope.get("label"), Some(&json!("edge-1-backup")));
//!
//! let rendered = evaluator.render("ping {{ device.name }}", &scope).unwrap();
//! assert_eq!(rendered, "ping edge-1");
//! ```

use core::panic::AssertUnwindSafe;

use indexmap::IndexMap;
use logos::Logos;
use serde_json::{Map, Number, Value};

use crate::error::ExpressionError;
use crate::pipeline::panic_message;

// ─────────────────────────────────────────────────────────────────────────────
// Scope
// ─────────────────────────────────────────────────────────────────────────────

/// Read access to results already produced in the current lineage.
pub trait ResultLookup: Send + Sync {
    /// Returns the result of `service` for `device`, or the device-less
    /// result when `device` is `None`.
    fn result(&self, service: &str, device: Option<&str>) -> Option<Value>;
}

/// The variables and lookups an expression may reach.
#[derive(Default)]
pub struct Scope<'a> {
    variables: IndexMap<String, Value>,
    results: Option<&'a dyn ResultLookup>,
}

impl core::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scope")
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("results", &self.results.is_some())
            .finish()
    }
}

impl<'a> Scope<'a> {
    /// Creates an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable and returns self for chaining.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Enables `get_result` through `lookup`.
    #[must_use]
    pub fn with_results(mut self, lookup: &'a dyn ResultLookup) -> Self {
        self.results = Some(lookup);
        self
    }

    /// Sets a variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Returns a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Removes and returns a variable.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.variables.shift_remove(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Function table
// ─────────────────────────────────────────────────────────────────────────────

/// The functions an expression may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// `len(x)`: length of a string, list or object.
    Len,
    /// `str(x)`: string form of a value.
    Str,
    /// `int(x)`: integer from a number, boolean or numeric string.
    Int,
    /// `lower(s)`.
    Lower,
    /// `upper(s)`.
    Upper,
    /// `contains(container, item)`: same as `item in container`.
    Contains,
    /// `startswith(s, prefix)`.
    StartsWith,
    /// `endswith(s, suffix)`.
    EndsWith,
    /// `strip(s)`: trims surrounding whitespace.
    Strip,
    /// `split(s[, separator])`: splits on the separator, or on whitespace.
    Split,
    /// `keys(object)`.
    Keys,
    /// `get_result(service[, device])`: a result from the current lineage.
    GetResult,
}

impl Function {
    /// Every function, in table order.
    pub const ALL: [Function; 12] = [
        Function::Len,
        Function::Str,
        Function::Int,
        Function::Lower,
        Function::Upper,
        Function::Contains,
        Function::StartsWith,
        Function::EndsWith,
        Function::Strip,
        Function::Split,
        Function::Keys,
        Function::GetResult,
    ];

    /// Returns the name expressions use to call the function.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Function::Len => "len",
            Function::Str => "str",
            Function::Int => "int",
            Function::Lower => "lower",
            Function::Upper => "upper",
            Function::Contains => "contains",
            Function::StartsWith => "startswith",
            Function::EndsWith => "endswith",
            Function::Strip => "strip",
            Function::Split => "split",
            Function::Keys => "keys",
            Function::GetResult => "get_result",
        }
    }

    /// Looks a function up by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|function| function.name() == name)
    }

    fn call(self, args: Vec<Value>, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        let name = self.name();
        let arity = |expected: &'static str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(ExpressionError::Arity {
                    function: name,
                    expected,
                    got: args.len(),
                })
            }
        };
        match self {
            Function::Len => {
                arity("1", args.len() == 1)?;
                let len = match &args[0] {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    other => return Err(type_error(name, other)),
                };
                Ok(Value::from(len))
            }
            Function::Str => {
                arity("1", args.len() == 1)?;
                Ok(Value::String(stringify(&args[0])))
            }
            Function::Int => {
                arity("1", args.len() == 1)?;
                to_int(&args[0]).map(Value::from)
            }
            Function::Lower | Function::Upper | Function::Strip => {
                arity("1", args.len() == 1)?;
                let s = as_str(name, &args[0])?;
                Ok(Value::String(match self {
                    Function::Lower => s.to_lowercase(),
                    Function::Upper => s.to_uppercase(),
                    _ => s.trim().to_owned(),
                }))
            }
            Function::Contains => {
                arity("2", args.len() == 2)?;
                contains(&args[0], &args[1]).map(Value::Bool)
            }
            Function::StartsWith | Function::EndsWith => {
                arity("2", args.len() == 2)?;
                let s = as_str(name, &args[0])?;
                let affix = as_str(name, &args[1])?;
                Ok(Value::Bool(if self == Function::StartsWith {
                    s.starts_with(affix)
                } else {
                    s.ends_with(affix)
                }))
            }
            Function::Split => {
                arity("1 or 2", matches!(args.len(), 1 | 2))?;
                let s = as_str(name, &args[0])?;
                let parts: Vec<Value> = match args.get(1) {
                    Some(separator) => {
                        let separator = as_str(name, separator)?;
                        if separator.is_empty() {
                            return Err(ExpressionError::Type("split() separator is empty".into()));
                        }
                        s.split(separator).map(Value::from).collect()
                    }
                    None => s.split_whitespace().map(Value::from).collect(),
                };
                Ok(Value::Array(parts))
            }
            Function::Keys => {
                arity("1", args.len() == 1)?;
                match &args[0] {
                    Value::Object(map) => Ok(Value::Array(
                        map.keys().cloned().map(Value::String).collect(),
                    )),
                    other => Err(type_error(name, other)),
                }
            }
            Function::GetResult => {
                arity("1 or 2", matches!(args.len(), 1 | 2))?;
                let lookup = scope
                    .results
                    .ok_or_else(|| ExpressionError::FunctionNotFound(name.into()))?;
                let service = as_str(name, &args[0])?;
                let device = match args.get(1) {
                    None | Some(Value::Null) => None,
                    Some(device) => Some(as_str(name, device)?),
                };
                Ok(lookup.result(service, device).unwrap_or(Value::Null))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the truthiness of a value: `null`, `false`, `0`, `""`, `[]` and
/// `{}` are false.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Returns the text form of a value: strings verbatim, everything else as
/// JSON.
#[must_use]
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn type_error(context: &str, value: &Value) -> ExpressionError {
    ExpressionError::Type(format!("{context}: unsupported {}", type_name(value)))
}

fn as_str<'v>(context: &str, value: &'v Value) -> Result<&'v str, ExpressionError> {
    value.as_str().ok_or_else(|| type_error(context, value))
}

fn to_int(value: &Value) -> Result<i64, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(|| ExpressionError::Type(format!("int: {n} out of range"))),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .or_else(|_| trimmed.parse::<f64>().map(|f| f.trunc() as i64))
                .map_err(|_| ExpressionError::Type(format!("int: invalid literal '{s}'")))
        }
        other => Err(type_error("int", other)),
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Self> {
        let Value::Number(n) = value else {
            return None;
        };
        n.as_i64().map(Num::Int).or_else(|| n.as_f64().map(Num::Float))
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn float(value: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type("result is not a finite number".into()))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (Num::of(left), Num::of(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, ExpressionError> {
    match container {
        Value::String(haystack) => Ok(haystack.contains(as_str("in", item)?)),
        Value::Array(items) => Ok(items.iter().any(|candidate| values_equal(candidate, item))),
        Value::Object(map) => Ok(map.contains_key(as_str("in", item)?)),
        other => Err(type_error("in", other)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokens
// ─────────────────────────────────────────────────────────────────────────────

// Alias keeps logos from rewriting `'static` to the source lifetime.
type OpSymbol = &'static str;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\f]+")]
#[logos(skip r"#[^\n]*")]
enum Token {
    #[regex(r"[0-9][0-9_]*", |lex| lex.slice().replace('_', "").parse::<i64>().ok())]
    Int(i64),

    #[regex(r"[0-9][0-9_]*\.[0-9][0-9_]*", |lex| lex.slice().replace('_', "").parse::<f64>().ok())]
    #[regex(r"\.[0-9][0-9_]*", |lex| lex.slice().replace('_', "").parse::<f64>().ok())]
    Float(f64),

    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| unescape(lex.slice()))]
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_owned())]
    Ident(String),

    #[token("==", |_| "==")]
    #[token("!=", |_| "!=")]
    #[token("<=", |_| "<=")]
    #[token(">=", |_| ">=")]
    #[token("<", |_| "<")]
    #[token(">", |_| ">")]
    #[token("+", |_| "+")]
    #[token("-", |_| "-")]
    #[token("*", |_| "*")]
    #[token("/", |_| "/")]
    #[token("%", |_| "%")]
    #[token("=", |_| "=")]
    Op(OpSymbol),

    #[token("(", |_| '(')]
    #[token("[", |_| '[')]
    #[token("{", |_| '{')]
    Open(char),

    #[token(")", |_| ')')]
    #[token("]", |_| ']')]
    #[token("}", |_| '}')]
    Close(char),

    #[token(",")]
    Comma,

    #[token(":")]
    Colon,

    #[token(".")]
    Dot,

    #[token(";")]
    Separator,

    // Becomes a separator outside brackets; dropped inside them.
    #[token("\n")]
    Newline,

    Eof,
}

/// Strips the quotes of a string literal and resolves its escapes.
fn unescape(literal: &str) -> String {
    let inner = &literal[1..literal.len() - 1];
    let mut text = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            text.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => text.push('\n'),
            Some('t') => text.push('\t'),
            Some('r') => text.push('\r'),
            Some(other) => text.push(other),
            None => {}
        }
    }
    text
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;

    for (token, span) in Token::lexer(source).spanned() {
        let token = token.map_err(|()| lex_error(source, span.start, span.end))?;
        match token {
            Token::Open(_) => depth += 1,
            Token::Close(_) => depth = depth.saturating_sub(1),
            Token::Newline if depth > 0 => continue,
            Token::Newline => {
                tokens.push((span.start, Token::Separator));
                continue;
            }
            _ => {}
        }
        tokens.push((span.start, token));
    }
    tokens.push((source.len(), Token::Eof));
    Ok(tokens)
}

fn lex_error(source: &str, start: usize, end: usize) -> ExpressionError {
    let slice = source.get(start..end).unwrap_or_default();
    let message = match slice.chars().next() {
        Some('\'' | '"') => "unterminated string".to_owned(),
        Some(c) if c.is_ascii_digit() || c == '.' => format!("invalid number '{slice}'"),
        Some(c) => format!("unexpected character '{c}'"),
        None => "unexpected end of input".to_owned(),
    };
    ExpressionError::Syntax {
        position: start,
        message,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Syntax tree
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Variable(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Attribute(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Statement {
    Assign(String, Expr),
    Expr(Expr),
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    depth: usize,
    depth_limit: usize,
}

impl Parser {
    fn new(source: &str, depth_limit: usize) -> Result<Self, ExpressionError> {
        Ok(Self {
            tokens: tokenize(source)?,
            cursor: 0,
            depth: 0,
            depth_limit,
        })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.cursor.min(self.tokens.len() - 1)].1
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.cursor + offset).min(self.tokens.len() - 1)].1
    }

    fn position(&self) -> usize {
        self.tokens[self.cursor.min(self.tokens.len() - 1)].0
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            position: self.position(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ExpressionError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(ident) if ident == keyword)
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > self.depth_limit {
            return Err(ExpressionError::TooDeep(self.depth_limit));
        }
        Ok(())
    }

    fn statements(&mut self) -> Result<Vec<Statement>, ExpressionError> {
        let mut statements = Vec::new();
        loop {
            while *self.peek() == Token::Separator {
                self.advance();
            }
            if *self.peek() == Token::Eof {
                return Ok(statements);
            }
            statements.push(self.statement()?);
            match self.peek() {
                Token::Separator | Token::Eof => {}
                _ => return Err(self.error("expected end of statement")),
            }
        }
    }

    fn statement(&mut self) -> Result<Statement, ExpressionError> {
        let target = match (self.peek(), self.peek_at(1)) {
            (Token::Ident(name), Token::Op("=")) => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = target {
            if Function::from_name(&name).is_some() || is_reserved(&name) {
                return Err(ExpressionError::ReadOnly(name));
            }
            self.advance();
            self.advance();
            return Ok(Statement::Assign(name, self.expression()?));
        }
        Ok(Statement::Expr(self.expression()?))
    }

    fn single(&mut self) -> Result<Expr, ExpressionError> {
        while *self.peek() == Token::Separator {
            self.advance();
        }
        let expr = self.expression()?;
        while *self.peek() == Token::Separator {
            self.advance();
        }
        if *self.peek() != Token::Eof {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    fn expression(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let expr = self.or();
        self.depth -= 1;
        expr
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.is_keyword("or") {
            self.advance();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.not()?;
        while self.is_keyword("and") {
            self.advance();
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ExpressionError> {
        if self.is_keyword("not") {
            self.advance();
            self.enter()?;
            let inner = self.not();
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Token::Op("==") => BinaryOp::Eq,
            Token::Op("!=") => BinaryOp::Ne,
            Token::Op("<") => BinaryOp::Lt,
            Token::Op("<=") => BinaryOp::Le,
            Token::Op(">") => BinaryOp::Gt,
            Token::Op(">=") => BinaryOp::Ge,
            Token::Ident(ident) if ident == "in" => BinaryOp::In,
            Token::Ident(ident)
                if ident == "not" && matches!(self.peek_at(1), Token::Ident(next) if next == "in") =>
            {
                self.advance();
                BinaryOp::NotIn
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Op("+") => BinaryOp::Add,
                Token::Op("-") => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Op("*") => BinaryOp::Mul,
                Token::Op("/") => BinaryOp::Div,
                Token::Op("%") => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if *self.peek() == Token::Op("-") {
            self.advance();
            self.enter()?;
            let inner = self.unary();
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let Token::Ident(name) = self.advance() else {
                        return Err(self.error("expected attribute name"));
                    };
                    expr = Expr::Attribute(Box::new(expr), name);
                }
                Token::Open('[') => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Token::Close(']'), "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Token::Open('(') => return Err(self.error("only named functions can be called")),
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(Value::from(i))),
            Token::Float(f) => Ok(Expr::Literal(float(f)?)),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(ident) => {
                let literal = match ident.as_str() {
                    "true" | "True" => Some(Value::Bool(true)),
                    "false" | "False" => Some(Value::Bool(false)),
                    "null" | "None" => Some(Value::Null),
                    _ => None,
                };
                if let Some(literal) = literal {
                    return Ok(Expr::Literal(literal));
                }
                if *self.peek() != Token::Open('(') {
                    return Ok(Expr::Variable(ident));
                }
                let Some(function) = Function::from_name(&ident) else {
                    return Err(ExpressionError::FunctionNotFound(ident));
                };
                self.advance();
                let args = self.sequence(')')?;
                Ok(Expr::Call(function, args))
            }
            Token::Open('(') => {
                let expr = self.expression()?;
                self.expect(&Token::Close(')'), "')'")?;
                Ok(expr)
            }
            Token::Open('[') => Ok(Expr::List(self.sequence(']')?)),
            Token::Open('{') => {
                let mut entries = Vec::new();
                if *self.peek() != Token::Close('}') {
                    loop {
                        let key = self.expression()?;
                        self.expect(&Token::Colon, "':'")?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if *self.peek() == Token::Comma {
                            self.advance();
                            if *self.peek() == Token::Close('}') {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::Close('}'), "'}'")?;
                Ok(Expr::Dict(entries))
            }
            Token::Eof => Err(self.error("unexpected end of input")),
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    /// Parses a comma-separated list up to and including `close`.
    fn sequence(&mut self, close: char) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        if *self.peek() != Token::Close(close) {
            loop {
                items.push(self.expression()?);
                if *self.peek() == Token::Comma {
                    self.advance();
                    if *self.peek() == Token::Close(close) {
                        break;
                    }
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::Close(close), &format!("'{close}'"))?;
        Ok(items)
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        "true" | "True" | "false" | "False" | "null" | "None" | "and" | "or" | "not" | "in"
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluator
// ─────────────────────────────────────────────────────────────────────────────

/// Parses and evaluates expressions against a [`Scope`].
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    depth_limit: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Evaluator {
    /// Creates an evaluator rejecting expressions nested deeper than
    /// `depth_limit`.
    #[must_use]
    pub fn new(depth_limit: usize) -> Self {
        Self {
            depth_limit: depth_limit.max(1),
        }
    }

    /// Evaluates a single expression.
    ///
    /// # Errors
    ///
    /// Returns an [`ExpressionError`] on syntax errors, unknown names, type
    /// mismatches or excessive nesting.
    pub fn evaluate(&self, source: &str, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        let expr = Parser::new(source, self.depth_limit)?.single()?;
        guarded(|| eval(&expr, scope))
    }

    /// Executes `;`- or newline-separated statements. Assignments
    /// (`name = expr`) update the scope. Returns the value of the last bare
    /// expression, if any.
    ///
    /// Statements run in order; an error stops execution and leaves earlier
    /// assignments in place.
    ///
    /// # Errors
    ///
    /// See [`Evaluator::evaluate`].
    pub fn execute(&self, source: &str, scope: &mut Scope<'_>) -> Result<Option<Value>, ExpressionError> {
        let statements = Parser::new(source, self.depth_limit)?.statements()?;
        let mut last = None;
        for statement in statements {
            match statement {
                Statement::Assign(name, expr) => {
                    let value = guarded(|| eval(&expr, scope))?;
                    scope.set(name, value);
                }
                Statement::Expr(expr) => last = Some(guarded(|| eval(&expr, scope))?),
            }
        }
        Ok(last)
    }

    /// Replaces every `{{ expr }}` block in `template` with the text form of
    /// its value.
    ///
    /// # Errors
    ///
    /// Fails on an unterminated block or any evaluation error.
    pub fn render(&self, template: &str, scope: &Scope<'_>) -> Result<String, ExpressionError> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;
        let mut offset = 0;
        while let Some(open) = rest.find("{{") {
            output.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                return Err(ExpressionError::Syntax {
                    position: offset + open,
                    message: "unterminated '{{' block".into(),
                });
            };
            let value = self.evaluate(&after[..close], scope)?;
            output.push_str(&stringify(&value));
            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        output.push_str(rest);
        Ok(output)
    }
}

/// Runs one evaluation, turning a panic into [`ExpressionError::Panicked`].
fn guarded(
    evaluate: impl FnOnce() -> Result<Value, ExpressionError>,
) -> Result<Value, ExpressionError> {
    std::panic::catch_unwind(AssertUnwindSafe(evaluate))
        .unwrap_or_else(|panic| Err(ExpressionError::Panicked(panic_message(panic.as_ref()))))
}

fn eval(expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Variable(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::VariableNotFound(name.clone())),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Dict(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                let key = match eval(key, scope)? {
                    Value::String(s) => s,
                    other => stringify(&other),
                };
                map.insert(key, eval(value, scope)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Attribute(target, name) => match eval(target, scope)? {
            Value::Object(mut map) => map
                .remove(name)
                .ok_or_else(|| ExpressionError::KeyNotFound(name.clone())),
            other => Err(type_error(&format!("attribute '{name}'"), &other)),
        },
        Expr::Index(target, index) => {
            let target = eval(target, scope)?;
            let index = eval(index, scope)?;
            subscript(target, &index)
        }
        Expr::Call(function, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            function.call(args, scope)
        }
        Expr::Neg(inner) => match Num::of(&eval(inner, scope)?) {
            Some(Num::Int(i)) => i
                .checked_neg()
                .map(Value::from)
                .ok_or_else(|| ExpressionError::Type("integer overflow".into())),
            Some(Num::Float(f)) => float(-f),
            None => Err(ExpressionError::Type("unary '-' expects a number".into())),
        },
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope)?))),
        Expr::And(left, right) => {
            let left = eval(left, scope)?;
            if truthy(&left) { eval(right, scope) } else { Ok(left) }
        }
        Expr::Or(left, right) => {
            let left = eval(left, scope)?;
            if truthy(&left) { Ok(left) } else { eval(right, scope) }
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            binary(*op, &left, &right)
        }
    }
}

fn subscript(target: Value, index: &Value) -> Result<Value, ExpressionError> {
    let position = |len: usize| -> Result<usize, ExpressionError> {
        let i = to_int(index)?;
        let len = i64::try_from(len).map_err(|_| ExpressionError::IndexOutOfRange(i))?;
        let resolved = if i < 0 { len + i } else { i };
        if (0..len).contains(&resolved) {
            usize::try_from(resolved).map_err(|_| ExpressionError::IndexOutOfRange(i))
        } else {
            Err(ExpressionError::IndexOutOfRange(i))
        }
    };
    match target {
        Value::Array(mut items) if index.is_number() => {
            let i = position(items.len())?;
            Ok(items.swap_remove(i))
        }
        Value::String(s) if index.is_number() => {
            let chars: Vec<char> = s.chars().collect();
            let i = position(chars.len())?;
            Ok(Value::String(chars[i].to_string()))
        }
        Value::Object(mut map) => {
            let key = as_str("index", index)?;
            map.remove(key)
                .ok_or_else(|| ExpressionError::KeyNotFound(key.to_owned()))
        }
        other => Err(type_error("index", &other)),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::In => contains(right, left).map(Value::Bool),
        BinaryOp::NotIn => contains(right, left).map(|found| Value::Bool(!found)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (Num::of(left), Num::of(right), left, right) {
                (Some(a), Some(b), _, _) => a.as_f64().partial_cmp(&b.as_f64()),
                (_, _, Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| {
                ExpressionError::Type(format!(
                    "cannot compare {} with {}",
                    type_name(left),
                    type_name(right)
                ))
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), Value::String(b)) => {
                bounded(a.len().saturating_add(b.len()))?;
                Ok(Value::String(format!("{a}{b}")))
            }
            (Value::Array(a), Value::Array(b)) => {
                bounded(a.len().saturating_add(b.len()))?;
                Ok(Value::Array(a.iter().chain(b).cloned().collect()))
            }
            _ => arithmetic(op, left, right),
        },
        BinaryOp::Mul => match (left, right) {
            (Value::String(s), count) | (count, Value::String(s)) if Num::of(count).is_some() => {
                let times = usize::try_from(to_int(count)?).unwrap_or(0);
                bounded(s.len().saturating_mul(times))?;
                Ok(Value::String(s.repeat(times)))
            }
            _ => arithmetic(op, left, right),
        },
        BinaryOp::Sub | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, left, right),
    }
}

/// Largest string (in bytes) or list an expression may build.
pub const MAX_VALUE_LEN: usize = 1 << 20;

fn bounded(len: usize) -> Result<(), ExpressionError> {
    if len > MAX_VALUE_LEN {
        return Err(ExpressionError::TooLarge(MAX_VALUE_LEN));
    }
    Ok(())
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (Some(a), Some(b)) = (Num::of(left), Num::of(right)) else {
        return Err(ExpressionError::Type(format!(
            "unsupported operands {} and {}",
            type_name(left),
            type_name(right)
        )));
    };
    let overflow = || ExpressionError::Type("integer overflow".into());
    match (op, a, b) {
        (BinaryOp::Div, _, _) => {
            if b.as_f64() == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            float(a.as_f64() / b.as_f64())
        }
        (BinaryOp::Rem, Num::Int(_), Num::Int(0)) => Err(ExpressionError::DivisionByZero),
        (BinaryOp::Rem, Num::Int(x), Num::Int(y)) => {
            x.checked_rem_euclid(y).map(Value::from).ok_or_else(overflow)
        }
        (BinaryOp::Rem, _, _) => {
            if b.as_f64() == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            float(a.as_f64().rem_euclid(b.as_f64()))
        }
        (BinaryOp::Add, Num::Int(x), Num::Int(y)) => x.checked_add(y).map(Value::from).ok_or_else(overflow),
        (BinaryOp::Sub, Num::Int(x), Num::Int(y)) => x.checked_sub(y).map(Value::from).ok_or_else(overflow),
        (BinaryOp::Mul, Num::Int(x), Num::Int(y)) => x.checked_mul(y).map(Value::from).ok_or_else(overflow),
        (BinaryOp::Add, _, _) => float(a.as_f64() + b.as_f64()),
        (BinaryOp::Sub, _, _) => float(a.as_f64() - b.as_f64()),
        (BinaryOp::Mul, _, _) => float(a.as_f64() * b.as_f64()),
        _ => Err(ExpressionError::Type("unsupported arithmetic".into())),
    }
}
