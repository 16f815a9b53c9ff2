//! Router condition predicates.
//!
//! A minimal, sandboxed expression language for routing decisions,
//! compiled once at graph-compile time and evaluated against immutable
//! state snapshots. Supported:
//!
//! - boolean operators `and`, `or`, `not`
//! - comparisons `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - membership `in`, `not in`
//! - state access: bare properties (`plan_confirmed`), dotted paths
//!   (`state.user.name`), indexing (`state.items[0]`, `state["odd key"]`),
//!   and `state.get("key", <fallback>)`
//! - JSON literals: strings, numbers, `true`, `false`, `null`, lists
//! - the token `default`, which always matches; used as the final route
//!
//! There are no other function calls, no writes, and no side effects, so
//! conditions are pure: the same state always routes the same way.
//!
//! Missing paths evaluate to `null`. Truthiness follows JSON emptiness:
//! `null`, `false`, `0`, `""`, `[]`, and `{}` are falsy, everything else
//! is truthy.
//!
//! ```rust
//! use orchid_core::condition::Predicate;
//! use serde_json::json;
//!
//! let cond = Predicate::parse("plan_confirmed == true and len_ok in [true]").unwrap();
//! assert!(cond.matches(&json!({"plan_confirmed": true, "len_ok": true})));
//! assert!(!cond.matches(&json!({})));
//! ```

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Parse failure for a condition expression.
#[derive(Debug, Error)]
#[error("invalid condition '{expression}': {detail}")]
pub struct ConditionParseError {
    pub expression: String,
    pub detail: String,
}

/// A compiled routing condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// The `default` token: matches every state.
    Default,
    /// A boolean expression over the state.
    Expr(Expr),
}

impl Predicate {
    /// Parse an expression. The bare token `default` yields
    /// [`Predicate::Default`].
    pub fn parse(source: &str) -> Result<Self, ConditionParseError> {
        let tokens = tokenize(source).map_err(|detail| ConditionParseError {
            expression: source.to_string(),
            detail,
        })?;
        if tokens.len() == 1 && tokens[0] == Token::Ident("default".into()) {
            return Ok(Predicate::Default);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr().map_err(|detail| ConditionParseError {
            expression: source.to_string(),
            detail,
        })?;
        if parser.pos != parser.tokens.len() {
            return Err(ConditionParseError {
                expression: source.to_string(),
                detail: format!("unexpected trailing token {:?}", parser.tokens[parser.pos]),
            });
        }
        Ok(Predicate::Expr(expr))
    }

    /// Evaluate against a state snapshot. Pure; never fails.
    pub fn matches(&self, state: &Value) -> bool {
        match self {
            Predicate::Default => true,
            Predicate::Expr(expr) => truthy(&expr.eval(state)),
        }
    }

    /// Whether this is the always-match fallback.
    pub fn is_default(&self) -> bool {
        matches!(self, Predicate::Default)
    }

    /// Top-level state properties this condition reads. Used by the
    /// compiler to reject routers inside a parallel region that depend on
    /// properties written by sibling branches.
    pub fn references(&self) -> HashSet<String> {
        let mut refs = HashSet::new();
        if let Predicate::Expr(expr) = self {
            expr.collect_references(&mut refs);
        }
        refs
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Default => write!(f, "default"),
            Predicate::Expr(_) => write!(f, "<condition>"),
        }
    }
}

/// Comparison and membership operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

/// One step of a state path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

/// Expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `state.a.b[0]` or a bare property name.
    Path(Vec<PathSeg>),
    /// `state.get("key", fallback)`; fallback defaults to `null`.
    GetOr(String, Value),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

impl Expr {
    fn eval(&self, state: &Value) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Path(path) => resolve_path(state, path).cloned().unwrap_or(Value::Null),
            Expr::GetOr(key, fallback) => match state.get(key) {
                Some(Value::Null) | None => fallback.clone(),
                Some(found) => found.clone(),
            },
            Expr::Not(inner) => Value::Bool(!truthy(&inner.eval(state))),
            Expr::And(lhs, rhs) => {
                let left = lhs.eval(state);
                if truthy(&left) {
                    rhs.eval(state)
                } else {
                    left
                }
            }
            Expr::Or(lhs, rhs) => {
                let left = lhs.eval(state);
                if truthy(&left) {
                    left
                } else {
                    rhs.eval(state)
                }
            }
            Expr::Compare(lhs, op, rhs) => {
                Value::Bool(compare(&lhs.eval(state), *op, &rhs.eval(state)))
            }
        }
    }

    fn collect_references(&self, refs: &mut HashSet<String>) {
        match self {
            Expr::Path(path) => {
                if let Some(PathSeg::Key(first)) = path.first() {
                    refs.insert(first.clone());
                }
            }
            Expr::GetOr(key, _) => {
                refs.insert(key.clone());
            }
            Expr::Not(inner) => inner.collect_references(refs),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(a, _, b) => {
                a.collect_references(refs);
                b.collect_references(refs);
            }
            Expr::Literal(_) => {}
        }
    }
}

fn resolve_path<'a>(state: &'a Value, path: &[PathSeg]) -> Option<&'a Value> {
    let mut current = state;
    for seg in path {
        current = match seg {
            PathSeg::Key(key) => current.get(key)?,
            PathSeg::Index(idx) => current.get(idx)?,
        };
    }
    Some(current)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq => lhs == rhs,
        CmpOp::Ne => lhs != rhs,
        CmpOp::In => contains(rhs, lhs),
        CmpOp::NotIn => !contains(rhs, lhs),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => match ordering(lhs, rhs) {
            Some(ord) => match op {
                CmpOp::Lt => ord.is_lt(),
                CmpOp::Le => ord.is_le(),
                CmpOp::Gt => ord.is_gt(),
                CmpOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            },
            // Incomparable types never satisfy an ordering.
            None => false,
        },
    }
}

fn ordering(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(container: &Value, needle: &Value) -> bool {
    match container {
        Value::Array(items) => items.contains(needle),
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        Value::Object(map) => needle.as_str().map(|n| map.contains_key(n)).unwrap_or(false),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                } else if c == '<' {
                    tokens.push(Token::Op("<"));
                    i += 1;
                } else if c == '>' {
                    tokens.push(Token::Op(">"));
                    i += 1;
                } else {
                    return Err(format!("unexpected character '{c}'"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".into()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(format!("unexpected character '{c}'")),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser (precedence: or < and < not < comparison < primary)
// ---------------------------------------------------------------------------

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
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            other => Err(format!("expected {token:?}, found {other:?}")),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and_expr()?;
        while self.eat_ident("or") {
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.not_expr()?;
        while self.eat_ident("and") {
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, String> {
        if self.eat_ident("not") {
            // `not in` handled in comparison(); here `not` is prefix.
            Ok(Expr::Not(Box::new(self.not_expr()?)))
        } else {
            self.comparison()
        }
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.primary()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => {
                let op = match *op {
                    "==" => CmpOp::Eq,
                    "!=" => CmpOp::Ne,
                    "<" => CmpOp::Lt,
                    "<=" => CmpOp::Le,
                    ">" => CmpOp::Gt,
                    ">=" => CmpOp::Ge,
                    other => return Err(format!("unknown operator '{other}'")),
                };
                self.pos += 1;
                Some(op)
            }
            Some(Token::Ident(w)) if w == "in" => {
                self.pos += 1;
                Some(CmpOp::In)
            }
            Some(Token::Ident(w)) if w == "not" => {
                // Lookahead for `not in`.
                if matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(w2)) if w2 == "in") {
                    self.pos += 2;
                    Some(CmpOp::NotIn)
                } else {
                    None
                }
            }
            _ => None,
        };
        match op {
            Some(op) => {
                let rhs = self.primary()?;
                Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)))
            }
            None => Ok(lhs),
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Token::RBracket)) {
                    loop {
                        items.push(self.literal()?);
                        if !matches!(self.peek(), Some(Token::Comma)) {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::Literal(Value::Array(items)))
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "default" => Err("'default' may only appear alone".into()),
                "state" => self.state_path(),
                _ => self.bare_path(word),
            },
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    /// A literal only (list elements, get() fallback).
    fn literal(&mut self) -> Result<Value, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(number(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Ident(w)) if w == "true" => Ok(Value::Bool(true)),
            Some(Token::Ident(w)) if w == "false" => Ok(Value::Bool(false)),
            Some(Token::Ident(w)) if w == "null" => Ok(Value::Null),
            other => Err(format!("expected literal, found {other:?}")),
        }
    }

    /// Path rooted at `state`: `.key`, `["key"]`, `[0]`, or `.get(...)`.
    fn state_path(&mut self) -> Result<Expr, String> {
        let mut path = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) if key == "get" && path.is_empty() => {
                            return self.get_call();
                        }
                        Some(Token::Ident(key)) => path.push(PathSeg::Key(key)),
                        other => return Err(format!("expected property name, found {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Str(key)) => path.push(PathSeg::Key(key)),
                        Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            path.push(PathSeg::Index(n as usize))
                        }
                        other => return Err(format!("expected index or key, found {other:?}")),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        if path.is_empty() {
            return Err("'state' must be followed by a property access".into());
        }
        Ok(Expr::Path(path))
    }

    /// `state.get("key"[, fallback])`.
    fn get_call(&mut self) -> Result<Expr, String> {
        self.expect(Token::LParen)?;
        let key = match self.next() {
            Some(Token::Str(key)) => key,
            other => return Err(format!("state.get expects a string key, found {other:?}")),
        };
        let fallback = if matches!(self.peek(), Some(Token::Comma)) {
            self.pos += 1;
            self.literal()?
        } else {
            Value::Null
        };
        self.expect(Token::RParen)?;
        Ok(Expr::GetOr(key, fallback))
    }

    /// A bare identifier is a state property; dots and brackets extend it.
    fn bare_path(&mut self, first: String) -> Result<Expr, String> {
        let mut path = vec![PathSeg::Key(first)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) => path.push(PathSeg::Key(key)),
                        other => return Err(format!("expected property name, found {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Str(key)) => path.push(PathSeg::Key(key)),
                        Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            path.push(PathSeg::Index(n as usize))
                        }
                        other => return Err(format!("expected index or key, found {other:?}")),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path(path))
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_always_matches() {
        let cond = Predicate::parse("default").unwrap();
        assert!(cond.is_default());
        assert!(cond.matches(&json!({})));
        assert!(cond.matches(&json!({"anything": [1, 2, 3]})));
    }

    #[test]
    fn equality_on_bare_property() {
        let cond = Predicate::parse("plan_confirmed == true").unwrap();
        assert!(cond.matches(&json!({"plan_confirmed": true})));
        assert!(!cond.matches(&json!({"plan_confirmed": false})));
        assert!(!cond.matches(&json!({})));
    }

    #[test]
    fn get_with_fallback() {
        let cond = Predicate::parse("state.get(\"plan_confirmed\", false) == false").unwrap();
        assert!(cond.matches(&json!({})));
        assert!(!cond.matches(&json!({"plan_confirmed": true})));
    }

    #[test]
    fn dotted_and_indexed_paths() {
        let cond = Predicate::parse("state.user.roles[0] == 'admin'").unwrap();
        assert!(cond.matches(&json!({"user": {"roles": ["admin"]}})));
        assert!(!cond.matches(&json!({"user": {"roles": ["guest"]}})));
    }

    #[test]
    fn numeric_ordering() {
        let cond = Predicate::parse("score >= 0.5").unwrap();
        assert!(cond.matches(&json!({"score": 0.7})));
        assert!(!cond.matches(&json!({"score": 0.2})));
        // Incomparable types never satisfy an ordering.
        assert!(!cond.matches(&json!({"score": "high"})));
    }

    #[test]
    fn membership() {
        let cond = Predicate::parse("status in ['ready', 'done']").unwrap();
        assert!(cond.matches(&json!({"status": "done"})));
        assert!(!cond.matches(&json!({"status": "pending"})));

        let cond = Predicate::parse("status not in ['failed']").unwrap();
        assert!(cond.matches(&json!({"status": "done"})));
    }

    #[test]
    fn boolean_combinators_and_truthiness() {
        let cond = Predicate::parse("not errors and count > 0").unwrap();
        assert!(cond.matches(&json!({"errors": [], "count": 2})));
        assert!(!cond.matches(&json!({"errors": ["x"], "count": 2})));
        assert!(!cond.matches(&json!({"errors": [], "count": 0})));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(Predicate::parse("plan_confirmed ==").is_err());
        assert!(Predicate::parse("state.").is_err());
        assert!(Predicate::parse("a ===== b").is_err());
        assert!(Predicate::parse("default == true").is_err());
        assert!(Predicate::parse("'unterminated").is_err());
    }

    #[test]
    fn references_capture_top_level_reads() {
        let cond =
            Predicate::parse("state.user.name == 'x' or state.get(\"flag\", false) and depth > 1")
                .unwrap();
        let refs = cond.references();
        assert!(refs.contains("user"));
        assert!(refs.contains("flag"));
        assert!(refs.contains("depth"));
        assert_eq!(refs.len(), 3);
    }

    #[test]
    fn exactly_one_route_fires_with_default() {
        // Router completeness: with a default route present, any state
        // matches at least one predicate, and evaluation order picks one.
        let routes = vec![
            Predicate::parse("plan_confirmed == true").unwrap(),
            Predicate::parse("default").unwrap(),
        ];
        for state in [json!({}), json!({"plan_confirmed": true}), json!({"x": 1})] {
            let fired = routes.iter().filter(|r| r.matches(&state)).count();
            assert!(fired >= 1);
            let first = routes.iter().position(|r| r.matches(&state)).unwrap();
            assert!(first < routes.len());
        }
    }
}
