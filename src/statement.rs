//! Statements understood by the in-memory backend.
//!
//! The grammar covers projections of literals and parameters, optionally over
//! an `UNWIND` source.
//!
//! ```text
//! RETURN 1 AS one, 'two', $three
//! UNWIND range(1, 10) AS n RETURN n, $factor
//! UNWIND $items AS item RETURN item
//! UNWIND [1, 'a', null] AS x RETURN x AS value
//! ```
use std::{fmt, iter};

use thiserror::Error;

use crate::packstream::{Value, ValueMap};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatementError {
    #[error("empty statement")]
    EmptyStatement,

    #[error("statement not supported: {0}")]
    Unsupported(String),

    #[error("invalid syntax, {reason}")]
    Syntax { reason: String },

    #[error("variable `{0}` not defined")]
    UnknownVariable(String),

    #[error("expected parameter(s): {0}")]
    MissingParameter(String),

    #[error("parameter `{0}` must be a list")]
    NotAList(String),

    #[error("step argument to range() cannot be zero")]
    ZeroStep,
}

fn syntax(reason: impl Into<String>) -> StatementError {
    StatementError::Syntax {
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Integer(i64),
    Float(f64),
    Text(String),
    Parameter(String),
    Comma,
    Open,
    Close,
    OpenList,
    CloseList,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "{w}"),
            Token::Integer(i) => write!(f, "{i}"),
            Token::Float(v) => write!(f, "{v}"),
            Token::Text(s) => write!(f, "'{s}'"),
            Token::Parameter(p) => write!(f, "${p}"),
            Token::Comma => write!(f, ","),
            Token::Open => write!(f, "("),
            Token::Close => write!(f, ")"),
            Token::OpenList => write!(f, "["),
            Token::CloseList => write!(f, "]"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, StatementError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            ',' | '(' | ')' | '[' | ']' => {
                chars.next();
                tokens.push(match c {
                    ',' => Token::Comma,
                    '(' => Token::Open,
                    ')' => Token::Close,
                    '[' => Token::OpenList,
                    _ => Token::CloseList,
                });
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == c => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => text.push(escaped),
                            None => return Err(syntax("unterminated string literal")),
                        },
                        Some(ch) => text.push(ch),
                        None => return Err(syntax("unterminated string literal")),
                    }
                }
                tokens.push(Token::Text(text));
            }
            '$' => {
                chars.next();
                let name = take_word(&mut chars);
                if name.is_empty() {
                    return Err(syntax("parameter name expected after '$'"));
                }
                tokens.push(Token::Parameter(name));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut number = String::new();
                number.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = if number.contains('.') {
                    number.parse().map(Token::Float).ok()
                } else {
                    number.parse().map(Token::Integer).ok()
                };
                tokens.push(token.ok_or_else(|| syntax(format!("invalid number '{number}'")))?);
            }
            c if c.is_alphabetic() || c == '_' => tokens.push(Token::Word(take_word(&mut chars))),
            other => return Err(syntax(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn take_word(chars: &mut iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Parameter(String),
    Variable(String),
}

impl Expr {
    fn evaluate(&self, variable: &Value, parameters: &ValueMap) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Parameter(name) => parameters.get(name).cloned().unwrap_or(Value::Null),
            Expr::Variable(_) => variable.clone(),
        }
    }
}

fn parameter_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Parameter(name) => Some(name),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Range { start: i64, end: i64, step: i64 },
    List(Vec<Expr>),
    Parameter(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Return(Vec<Projection>),
    Unwind {
        source: Source,
        variable: String,
        projections: Vec<Projection>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), StatementError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax(format!("expected '{expected}', found '{token}'"))),
            None => Err(syntax(format!("expected '{expected}'"))),
        }
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), StatementError> {
        match self.next() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword) => Ok(()),
            Some(token) => Err(syntax(format!("expected {keyword}, found '{token}'"))),
            None => Err(syntax(format!("expected {keyword}"))),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn identifier(&mut self) -> Result<String, StatementError> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w),
            Some(token) => Err(syntax(format!("expected a name, found '{token}'"))),
            None => Err(syntax("expected a name")),
        }
    }

    fn integer(&mut self) -> Result<i64, StatementError> {
        match self.next() {
            Some(Token::Integer(i)) => Ok(i),
            Some(token) => Err(syntax(format!("expected an integer, found '{token}'"))),
            None => Err(syntax("expected an integer")),
        }
    }

    /// Parses one expression, returning it with its source text.
    fn expr(&mut self) -> Result<(Expr, String), StatementError> {
        let token = self.next().ok_or_else(|| syntax("expected an expression"))?;
        let text = token.to_string();
        let expr = match token {
            Token::Integer(i) => Expr::Literal(Value::Integer(i)),
            Token::Float(f) => Expr::Literal(Value::Float(f)),
            Token::Text(s) => Expr::Literal(Value::String(s)),
            Token::Parameter(p) => Expr::Parameter(p),
            Token::Word(w) => match w.to_ascii_lowercase().as_str() {
                "true" => Expr::Literal(Value::Boolean(true)),
                "false" => Expr::Literal(Value::Boolean(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Variable(w),
            },
            other => return Err(syntax(format!("unexpected '{other}'"))),
        };
        Ok((expr, text))
    }

    fn projections(&mut self, variable: Option<&str>) -> Result<Vec<Projection>, StatementError> {
        let mut projections = Vec::new();
        loop {
            let (expr, text) = self.expr()?;
            if let Expr::Variable(name) = &expr {
                if variable != Some(name.as_str()) {
                    return Err(StatementError::UnknownVariable(name.clone()));
                }
            }
            let name = if self.peek_keyword("as") {
                self.next();
                self.identifier()?
            } else {
                text
            };
            projections.push(Projection { name, expr });

            match self.next() {
                Some(Token::Comma) => continue,
                Some(token) => return Err(syntax(format!("unexpected '{token}'"))),
                None => return Ok(projections),
            }
        }
    }

    fn source(&mut self) -> Result<Source, StatementError> {
        match self.next() {
            Some(Token::Parameter(p)) => Ok(Source::Parameter(p)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("range") => {
                self.expect(Token::Open)?;
                let start = self.integer()?;
                self.expect(Token::Comma)?;
                let end = self.integer()?;
                let step = match self.next() {
                    Some(Token::Comma) => {
                        let step = self.integer()?;
                        self.expect(Token::Close)?;
                        step
                    }
                    Some(Token::Close) => 1,
                    _ => return Err(syntax("expected ')' after range arguments")),
                };
                if step == 0 {
                    return Err(StatementError::ZeroStep);
                }
                Ok(Source::Range { start, end, step })
            }
            Some(Token::OpenList) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::CloseList) {
                    self.next();
                    return Ok(Source::List(items));
                }
                loop {
                    let (expr, _) = self.expr()?;
                    if let Expr::Variable(name) = expr {
                        return Err(StatementError::UnknownVariable(name));
                    }
                    items.push(expr);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::CloseList) => return Ok(Source::List(items)),
                        _ => return Err(syntax("expected ',' or ']' in list")),
                    }
                }
            }
            Some(token) => Err(syntax(format!("cannot UNWIND '{token}'"))),
            None => Err(syntax("expected an UNWIND source")),
        }
    }
}

impl TryFrom<&str> for Statement {
    type Error = StatementError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let tokens = tokenize(value)?;
        let mut parser = Parser { tokens, pos: 0 };

        match parser.peek() {
            None => Err(StatementError::EmptyStatement),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("return") => {
                parser.next();
                Ok(Statement::Return(parser.projections(None)?))
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("unwind") => {
                parser.next();
                let source = parser.source()?;
                parser.keyword("as")?;
                let variable = parser.identifier()?;
                parser.keyword("return")?;
                let projections = parser.projections(Some(variable.as_str()))?;
                Ok(Statement::Unwind {
                    source,
                    variable,
                    projections,
                })
            }
            Some(_) => Err(StatementError::Unsupported(value.trim().to_string())),
        }
    }
}

/// Lazily produced result rows.
pub struct Rows {
    items: Box<dyn Iterator<Item = Value> + Send>,
    projections: Vec<Projection>,
    parameters: ValueMap,
}

impl Iterator for Rows {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.items.next()?;
        Some(
            self.projections
                .iter()
                .map(|p| p.expr.evaluate(&item, &self.parameters))
                .collect(),
        )
    }
}

impl Statement {
    pub fn fields(&self) -> Vec<String> {
        self.projections().iter().map(|p| p.name.clone()).collect()
    }

    fn projections(&self) -> &[Projection] {
        match self {
            Statement::Return(projections) | Statement::Unwind { projections, .. } => projections,
        }
    }

    fn check_parameters(&self, parameters: &ValueMap) -> Result<(), StatementError> {
        let mut referenced: Vec<&str> = Vec::new();
        if let Statement::Unwind { source, .. } = self {
            match source {
                Source::Parameter(name) => referenced.push(name),
                Source::List(items) => referenced.extend(items.iter().filter_map(parameter_name)),
                Source::Range { .. } => {}
            }
        }
        referenced.extend(self.projections().iter().filter_map(|p| parameter_name(&p.expr)));

        let mut missing: Vec<&str> = Vec::new();
        for name in referenced {
            if !parameters.contains_key(name) && !missing.contains(&name) {
                missing.push(name);
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StatementError::MissingParameter(missing.join(", ")))
        }
    }

    /// Binds `parameters` and returns the rows the statement produces.
    pub fn rows(&self, parameters: ValueMap) -> Result<Rows, StatementError> {
        self.check_parameters(&parameters)?;

        let items: Box<dyn Iterator<Item = Value> + Send> = match self {
            Statement::Return(_) => Box::new(iter::once(Value::Null)),
            Statement::Unwind { source, .. } => match source {
                Source::Range { start, end, step } => {
                    let (end, step) = (*end, *step);
                    Box::new(
                        iter::successors(Some(*start), move |x| x.checked_add(step))
                            .take_while(move |x| if step > 0 { *x <= end } else { *x >= end })
                            .map(Value::Integer),
                    )
                }
                Source::List(items) => {
                    let values: Vec<Value> = items
                        .iter()
                        .map(|e| e.evaluate(&Value::Null, &parameters))
                        .collect();
                    Box::new(values.into_iter())
                }
                Source::Parameter(name) => match parameters.get(name) {
                    Some(Value::List(values)) => Box::new(values.clone().into_iter()),
                    Some(Value::Null) => Box::new(iter::empty()),
                    _ => return Err(StatementError::NotAList(name.clone())),
                },
            },
        };

        Ok(Rows {
            items,
            projections: self.projections().to_vec(),
            parameters,
        })
    }
}
