//! Subscription rule filters and actions.
//!
//! Two filter kinds gate topic fan-out:
//! - **Correlation filters** match on exact equality of populated system
//!   fields and application properties. Absent fields are wildcards, so an
//!   empty correlation filter accepts everything.
//! - **SQL filters** are boolean expressions over message fields
//!   (`sys.MessageId = '123456' AND userProp1 = 'value1'`). The expression
//!   is parsed once at rule creation into an expression tree; evaluation
//!   walks the tree and never re-parses. Malformed expressions are rejected
//!   at creation with `InvalidFilterSyntax`.
//!
//! A rule may carry a **SQL action** (`SET sys.To = 'audit'`) that mutates
//! the subscription's copy of a matched message. The original message is
//! never mutated.

use std::fmt;

use tracing::trace;

use crate::error::{BrokerError, Result};
use crate::message::{Message, PropertyValue};

/// Exact-match filter over system fields and application properties.
///
/// Every populated field must equal the corresponding message field
/// exactly. Application-property values are compared by their string
/// rendering.
#[derive(Debug, Clone, Default)]
pub struct CorrelationFilter {
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    pub session_id: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub content_type: Option<String>,
    pub properties: Vec<(String, PropertyValue)>,
}

impl CorrelationFilter {
    pub fn matches(&self, message: &Message) -> bool {
        let system_checks = [
            (&self.correlation_id, &message.correlation_id),
            (&self.message_id, &message.message_id),
            (&self.to, &message.to),
            (&self.reply_to, &message.reply_to),
            (&self.subject, &message.subject),
            (&self.session_id, &message.session_id),
            (&self.reply_to_session_id, &message.reply_to_session_id),
            (&self.content_type, &message.content_type),
        ];

        for (expected, actual) in system_checks {
            if let Some(expected) = expected {
                if actual.as_deref() != Some(expected.as_str()) {
                    return false;
                }
            }
        }

        for (key, expected) in &self.properties {
            match message.property(key) {
                Some(actual) if actual.as_text() == expected.as_text() => {}
                _ => return false,
            }
        }

        true
    }
}

/// A compiled subscription filter.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Accepts every message (the implicit `$Default` rule).
    True,
    Correlation(CorrelationFilter),
    Sql(SqlFilter),
}

impl Filter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Filter::True => true,
            Filter::Correlation(f) => f.matches(message),
            Filter::Sql(f) => f.matches(message),
        }
    }
}

// ---------------------------------------------------------------------------
// SQL filter expressions
// ---------------------------------------------------------------------------

/// A boolean SQL-like filter, parsed once at rule creation.
#[derive(Debug, Clone)]
pub struct SqlFilter {
    expression: String,
    tree: Expr,
}

impl SqlFilter {
    /// Parses a filter expression. Fails with `InvalidFilterSyntax` on
    /// malformed input; a successfully created filter never fails later.
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser::new(tokens);
        let tree = parser.parse_expr()?;
        parser.expect_end()?;
        Ok(Self {
            expression: expression.to_string(),
            tree,
        })
    }

    /// The original expression text.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, message: &Message) -> bool {
        let matched = eval(&self.tree, message);
        trace!(expression = %self.expression, matched, "evaluated sql filter");
        matched
    }
}

/// `SET`-style rule action, applied to a matched message copy.
#[derive(Debug, Clone)]
pub struct SqlAction {
    expression: String,
    assignments: Vec<(Target, PropertyValue)>,
}

impl SqlAction {
    /// Parses `SET <field> = <literal> [, <field> = <literal> ...]`.
    /// Unknown or read-only `sys.` fields are rejected here, not at
    /// dispatch time.
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser::new(tokens);
        let assignments = parser.parse_set_clauses()?;
        parser.expect_end()?;
        Ok(Self {
            expression: expression.to_string(),
            assignments,
        })
    }

    /// The original action text.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Applies the SET clauses to the message envelope.
    pub fn apply(&self, message: &mut Message) {
        for (target, value) in &self.assignments {
            match target {
                Target::System(name) => {
                    message.set_system_field(name, value.as_text());
                }
                Target::Property(key) => {
                    message.set_property(key.clone(), value.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Target {
    /// `sys.`-prefixed field, stored without the prefix.
    System(String),
    Property(String),
}

#[derive(Debug, Clone)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Eq(Operand, Operand),
    Ne(Operand, Operand),
}

#[derive(Debug, Clone)]
enum Operand {
    Literal(PropertyValue),
    Property(String),
    /// `sys.`-prefixed reference, stored without the prefix.
    System(String),
}

fn resolve(operand: &Operand, message: &Message) -> Option<PropertyValue> {
    match operand {
        Operand::Literal(v) => Some(v.clone()),
        Operand::Property(key) => message.property(key).cloned(),
        Operand::System(name) => message.system_field(name).map(PropertyValue::String),
    }
}

/// Equality over resolved values: numeric comparison when both sides are
/// numbers, same-type equality otherwise. Mixed types compare unequal.
fn values_equal(a: &PropertyValue, b: &PropertyValue) -> bool {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x == y;
    }
    match (a, b) {
        (PropertyValue::String(x), PropertyValue::String(y)) => x == y,
        (PropertyValue::Bool(x), PropertyValue::Bool(y)) => x == y,
        _ => false,
    }
}

/// A comparison with an unresolved side is false, never an error.
fn eval(expr: &Expr, message: &Message) -> bool {
    match expr {
        Expr::And(l, r) => eval(l, message) && eval(r, message),
        Expr::Or(l, r) => eval(l, message) || eval(r, message),
        Expr::Not(inner) => !eval(inner, message),
        Expr::Eq(a, b) => match (resolve(a, message), resolve(b, message)) {
            (Some(x), Some(y)) => values_equal(&x, &y),
            _ => false,
        },
        Expr::Ne(a, b) => match (resolve(a, message), resolve(b, message)) {
            (Some(x), Some(y)) => !values_equal(&x, &y),
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(PropertyValue),
    Eq,
    Ne,
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    True,
    False,
    Set,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Number(v) => write!(f, "{v}"),
            Token::Eq => f.write_str("="),
            Token::Ne => f.write_str("<>"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::And => f.write_str("AND"),
            Token::Or => f.write_str("OR"),
            Token::Not => f.write_str("NOT"),
            Token::True => f.write_str("TRUE"),
            Token::False => f.write_str("FALSE"),
            Token::Set => f.write_str("SET"),
        }
    }
}

fn syntax_error(detail: impl Into<String>) -> BrokerError {
    BrokerError::InvalidFilterSyntax(detail.into())
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'>') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(syntax_error("expected '>' after '<'"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(syntax_error("expected '=' after '!'"));
                }
            }
            '\'' => {
                // Single-quoted string; '' escapes a literal quote.
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&c) => {
                            value.push(c);
                            i += 1;
                        }
                        None => return Err(syntax_error("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|&c| c.is_ascii_digit() || c == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.contains('.') {
                    text.parse::<f64>()
                        .map(PropertyValue::Float)
                        .map_err(|_| syntax_error(format!("invalid number '{text}'")))?
                } else {
                    text.parse::<i64>()
                        .map(PropertyValue::Int)
                        .map_err(|_| syntax_error(format!("invalid number '{text}'")))?
                };
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|&c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    "SET" => Token::Set,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(syntax_error(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Recursive-descent parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax_error(format!(
                "expected '{expected}', found '{token}'"
            ))),
            None => Err(syntax_error(format!(
                "expected '{expected}', found end of input"
            ))),
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(syntax_error(format!("unexpected trailing '{token}'"))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::LParen) {
            self.advance();
            let inner = self.parse_expr()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        match self.advance() {
            Some(Token::Eq) => {
                let right = self.parse_operand()?;
                Ok(Expr::Eq(left, right))
            }
            Some(Token::Ne) => {
                let right = self.parse_operand()?;
                Ok(Expr::Ne(left, right))
            }
            Some(token) => Err(syntax_error(format!(
                "expected comparison operator, found '{token}'"
            ))),
            None => Err(syntax_error("expected comparison operator, found end of input")),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Operand::Literal(PropertyValue::String(s))),
            Some(Token::Number(v)) => Ok(Operand::Literal(v)),
            Some(Token::True) => Ok(Operand::Literal(PropertyValue::Bool(true))),
            Some(Token::False) => Ok(Operand::Literal(PropertyValue::Bool(false))),
            Some(Token::Ident(name)) => Ok(reference(&name)),
            Some(token) => Err(syntax_error(format!(
                "expected operand, found '{token}'"
            ))),
            None => Err(syntax_error("expected operand, found end of input")),
        }
    }

    fn parse_literal(&mut self) -> Result<PropertyValue> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(PropertyValue::String(s)),
            Some(Token::Number(v)) => Ok(v),
            Some(Token::True) => Ok(PropertyValue::Bool(true)),
            Some(Token::False) => Ok(PropertyValue::Bool(false)),
            Some(token) => Err(syntax_error(format!(
                "expected literal, found '{token}'"
            ))),
            None => Err(syntax_error("expected literal, found end of input")),
        }
    }

    fn parse_set_clauses(&mut self) -> Result<Vec<(Target, PropertyValue)>> {
        self.expect(Token::Set)?;
        let mut assignments = Vec::new();
        loop {
            let target = match self.advance() {
                Some(Token::Ident(name)) => match reference(&name) {
                    Operand::System(field) => {
                        if !Message::is_settable_system_field(&field) {
                            return Err(syntax_error(format!(
                                "system field 'sys.{field}' cannot be set"
                            )));
                        }
                        Target::System(field)
                    }
                    Operand::Property(key) => Target::Property(key),
                    Operand::Literal(_) => unreachable!("reference never yields a literal"),
                },
                Some(token) => {
                    return Err(syntax_error(format!(
                        "expected assignment target, found '{token}'"
                    )))
                }
                None => return Err(syntax_error("expected assignment target after SET")),
            };
            self.expect(Token::Eq)?;
            let value = self.parse_literal()?;
            assignments.push((target, value));

            if self.peek() == Some(&Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(assignments)
    }
}

/// Classifies an identifier as a `sys.` reference or an application
/// property reference.
fn reference(name: &str) -> Operand {
    if name.len() > 4 && name[..4].eq_ignore_ascii_case("sys.") {
        Operand::System(name[4..].to_string())
    } else {
        Operand::Property(name.to_string())
    }
}
