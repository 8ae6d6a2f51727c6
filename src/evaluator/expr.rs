//! Closed guard-expression grammar: lexer, parser, and interpreter.
//!
//! The grammar admits literals (integer, float, quoted string, boolean,
//! null), identifiers with member/index access, comparisons, `and`/`or`/
//! `not`, unary minus, and parentheses. Everything else is rejected with
//! `UNSAFE_EXPRESSION` — at validation time and again at runtime.

use serde_json::Value;

use crate::dsl::schema::CompareOp;
use crate::reference::ResolveError;

use super::coercion;
use super::EvalError;

/// Resolver for `${...}` placeholders and bare identifiers, both addressed by
/// their dotted path text.
pub type PathResolver<'a> = dyn Fn(&str) -> Result<Value, ResolveError> + 'a;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Value(Value),
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Cmp(CompareOp),
    And,
    Or,
    Not,
    Minus,
}

fn lex(expr: &str, resolver: &PathResolver<'_>) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '$' if chars.get(i + 1) == Some(&'{') => {
                let close = chars[i + 2..]
                    .iter()
                    .position(|&c| c == '}')
                    .ok_or_else(|| EvalError::Unsafe("unterminated placeholder".into()))?;
                let inner: String = chars[i + 2..i + 2 + close].iter().collect();
                let value = resolver(inner.trim()).map_err(EvalError::Resolve)?;
                tokens.push(Token::Value(value));
                i += close + 3;
            }
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CompareOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CompareOp::Ne));
                i += 2;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CompareOp::Lte));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CompareOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CompareOp::Gte));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CompareOp::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(EvalError::Unsafe("unterminated string".into())),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| EvalError::Unsafe("dangling escape".into()))?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Value(Value::String(s)));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.contains('.') {
                    text.parse::<f64>()
                        .ok()
                        .map(|f| serde_json::json!(f))
                        .ok_or_else(|| EvalError::Unsafe(format!("bad number '{text}'")))?
                } else {
                    text.parse::<i64>()
                        .ok()
                        .map(|n| serde_json::json!(n))
                        .ok_or_else(|| EvalError::Unsafe(format!("bad number '{text}'")))?
                };
                tokens.push(Token::Value(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Value(Value::Bool(true)),
                    "false" => Token::Value(Value::Bool(false)),
                    "null" => Token::Value(Value::Null),
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(EvalError::Unsafe(format!(
                    "token '{other}' is outside the guard grammar"
                )))
            }
        }
    }
    Ok(tokens)
}

/// Parsed guard expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Identifier chain resolved against the scope (`a.b`, `a[0].c`).
    Path(Vec<String>),
    /// Member/index access into an already-resolved value.
    Member(Box<Expr>, Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// Chained comparison, evaluated pairwise like `a < b < c`.
    Compare(Box<Expr>, Vec<(CompareOp, Expr)>),
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
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<(), EvalError> {
        match self.next() {
            Some(ref tok) if tok == expected => Ok(()),
            other => Err(EvalError::Unsafe(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let first = self.parse_unary()?;
        let mut rest = Vec::new();
        while let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.next();
            let operand = self.parse_unary()?;
            rest.push((op, operand));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            let operand = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let base = self.parse_primary()?;
        let mut path = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(name)) => path.push(name),
                        Some(Token::Value(Value::Number(n))) => path.push(n.to_string()),
                        other => {
                            return Err(EvalError::Unsafe(format!(
                                "expected member name, found {other:?}"
                            )))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    match self.next() {
                        Some(Token::Value(Value::Number(n))) if n.is_u64() => {
                            path.push(n.to_string());
                        }
                        other => {
                            return Err(EvalError::Unsafe(format!(
                                "expected integer index, found {other:?}"
                            )))
                        }
                    }
                    self.expect(&Token::RBracket)?;
                }
                _ => break,
            }
        }
        if path.is_empty() {
            return Ok(base);
        }
        match base {
            Expr::Path(mut segments) => {
                segments.extend(path);
                Ok(Expr::Path(segments))
            }
            other => Ok(Expr::Member(Box::new(other), path)),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Value(value)) => Ok(Expr::Literal(value)),
            Some(Token::Ident(name)) => Ok(Expr::Path(vec![name])),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(EvalError::Unsafe(format!(
                "unexpected token {other:?} in guard"
            ))),
        }
    }
}

/// Parse an expression, resolving placeholders through `resolver`.
pub fn parse_expr(expr: &str, resolver: &PathResolver<'_>) -> Result<Expr, EvalError> {
    let tokens = lex(expr, resolver)?;
    if tokens.is_empty() {
        return Err(EvalError::Unsafe("empty guard expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::Unsafe("trailing tokens after expression".into()));
    }
    Ok(expr)
}

/// Syntax-only check used by the validator: placeholders are replaced by
/// null, identifiers stay unresolved.
pub fn check_syntax(expr: &str) -> Result<(), EvalError> {
    parse_expr(expr, &|_| Ok(Value::Null)).map(|_| ())
}

/// Evaluate a parsed expression against `resolver`.
pub fn evaluate(expr: &Expr, resolver: &PathResolver<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => resolver(&segments.join(".")).map_err(EvalError::Resolve),
        Expr::Member(base, path) => {
            let base = evaluate(base, resolver)?;
            let mut current = base;
            for seg in path {
                current = match current {
                    Value::Object(map) => map.get(seg).cloned().unwrap_or(Value::Null),
                    Value::Array(arr) => seg
                        .parse::<usize>()
                        .ok()
                        .and_then(|idx| arr.get(idx).cloned())
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            }
            Ok(current)
        }
        Expr::Not(operand) => {
            let value = evaluate(operand, resolver)?;
            Ok(Value::Bool(!coercion::is_truthy(&value)))
        }
        Expr::Neg(operand) => {
            let value = evaluate(operand, resolver)?;
            match value {
                Value::Number(n) if n.is_i64() => Ok(serde_json::json!(-n.as_i64().unwrap())),
                Value::Number(n) => Ok(serde_json::json!(-n.as_f64().unwrap_or(0.0))),
                other => Err(EvalError::Type(format!("cannot negate {other}"))),
            }
        }
        Expr::And(left, right) => {
            let lhs = evaluate(left, resolver)?;
            if !coercion::is_truthy(&lhs) {
                return Ok(Value::Bool(false));
            }
            let rhs = evaluate(right, resolver)?;
            Ok(Value::Bool(coercion::is_truthy(&rhs)))
        }
        Expr::Or(left, right) => {
            let lhs = evaluate(left, resolver)?;
            if coercion::is_truthy(&lhs) {
                return Ok(Value::Bool(true));
            }
            let rhs = evaluate(right, resolver)?;
            Ok(Value::Bool(coercion::is_truthy(&rhs)))
        }
        Expr::Compare(first, rest) => {
            let mut left = evaluate(first, resolver)?;
            for (op, operand) in rest {
                let right = evaluate(operand, resolver)?;
                if !coercion::compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
    }
}
