//! Routing expression language
//!
//! Compiles and evaluates the small boolean/string expression language used by
//! `expr`-type route conditions, e.g.:
//!
//! ```text
//! headers['user-agent'] contains 'iPhone' ? 'target-1' : 'target-2'
//! randomCookie('bucket', 1, 100) <= 70
//! query['version'] == '2' && path startsWith '/api'
//! headers['x-country'] in ['US', 'CA']
//! ```
//!
//! The environment exposes request-derived maps (`headers`, `query`,
//! `cookies`), plain string variables (`method`, `path`, `host`, `ip`,
//! `referer`, `protocol`, `url`), and the randomization builtins. Missing map
//! keys evaluate to the empty string.
//!
//! The deterministic builtins (`randomUser`, `randomCookie`, `randomParam`)
//! are pure functions of their inputs: the seed is the 31-base polynomial
//! hash of the seeding string and the draw is the first output of an
//! xorshift64* generator. Identical inputs produce identical buckets on every
//! replica and across restarts; changing either algorithm breaks live A/B
//! bucket assignments.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use thiserror::Error;

/// Expression compile/evaluation failure.
///
/// Never fatal to a request: the selector logs it and falls through to the
/// next rule or the default target.
#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("eval error: {0}")]
    Eval(String),
}

/// Request-derived environment expressions evaluate against
#[derive(Debug, Clone, Default)]
pub struct RequestEnv {
    /// Header map, keys lowercased, first value wins
    pub headers: HashMap<String, String>,
    /// Query map, first value wins
    pub query: HashMap<String, String>,
    /// Cookie map
    pub cookies: HashMap<String, String>,
    pub method: String,
    pub path: String,
    pub host: String,
    /// Client IP after X-Forwarded-For / X-Real-IP / peer-address resolution
    pub ip: String,
    pub referer: String,
    pub protocol: String,
    pub url: String,
}

impl RequestEnv {
    fn map(&self, name: &str) -> Option<&HashMap<String, String>> {
        match name {
            "headers" => Some(&self.headers),
            "query" => Some(&self.query),
            "cookies" => Some(&self.cookies),
            _ => None,
        }
    }

    fn var(&self, name: &str) -> Option<&str> {
        match name {
            "method" => Some(&self.method),
            "path" => Some(&self.path),
            "host" => Some(&self.host),
            "ip" => Some(&self.ip),
            "referer" => Some(&self.referer),
            "protocol" => Some(&self.protocol),
            "url" => Some(&self.url),
            _ => None,
        }
    }
}

/// 31-base polynomial hash over the code points of `s`, wrapping at 64 bits.
///
/// Part of the bucket-assignment contract together with [`seeded_range`].
pub fn polynomial_hash(s: &str) -> i64 {
    let mut h: i64 = 0;
    for c in s.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i64);
    }
    h
}

/// Deterministic draw from the inclusive range `[lo, hi]`.
///
/// Takes the first output of an xorshift64* generator seeded with `seed`
/// (a zero seed is remapped to a fixed odd constant, xorshift has no zero
/// state). Inverted bounds are swapped.
pub fn seeded_range(seed: i64, lo: i64, hi: i64) -> i64 {
    let (lo, hi) = if lo > hi { (hi, lo) } else { (lo, hi) };

    let mut x = seed as u64;
    if x == 0 {
        x = 0x9E37_79B9_7F4A_7C15;
    }
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let draw = x.wrapping_mul(0x2545_F491_4F6C_DD1D);

    let span = (hi as i128 - lo as i128 + 1) as u128;
    (lo as i128 + (draw as u128 % span) as i128) as i64
}

fn thread_range(lo: i64, hi: i64) -> i64 {
    let (lo, hi) = if lo > hi { (hi, lo) } else { (lo, hi) };
    rand::thread_rng().gen_range(lo..=hi)
}

/// Runtime value of an evaluated expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::List(_) => "list",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
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
    And,
    Or,
    Contains,
    StartsWith,
    EndsWith,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Str(String),
    Int(i64),
    Bool(bool),
    Ident(String),
    List(Vec<Node>),
    Index(Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
    Not(Box<Node>),
    Neg(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
}

/// A compiled expression
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    root: Node,
}

/// Compile an expression source into a [`Program`]
pub fn compile(source: &str) -> Result<Program, ExprError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let root = parser.ternary()?;
    parser.expect_end()?;
    Ok(Program { root })
}

impl Program {
    /// Evaluate against a request environment
    pub fn eval(&self, env: &RequestEnv) -> Result<Value, ExprError> {
        eval_node(&self.root, env)
    }
}

/// Compile and evaluate, requiring a boolean result
pub fn eval_bool(source: &str, env: &RequestEnv) -> Result<bool, ExprError> {
    match compile(source)?.eval(env)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Eval(format!(
            "expression did not return a boolean, got {}",
            other.type_name()
        ))),
    }
}

/// Compile and evaluate, requiring a string result
pub fn eval_string(source: &str, env: &RequestEnv) -> Result<String, ExprError> {
    match compile(source)?.eval(env)? {
        Value::Str(s) => Ok(s),
        other => Err(ExprError::Eval(format!(
            "expression did not return a string, got {}",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Question,
    Colon,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

fn lex(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
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
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExprError::Parse(format!(
                        "unexpected '=' at offset {i}, did you mean '=='?"
                    )));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(ExprError::Parse(format!("unexpected '&' at offset {i}")));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(ExprError::Parse(format!("unexpected '|' at offset {i}")));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExprError::Parse("unterminated string literal".to_string()))
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or_else(|| {
                                ExprError::Parse("unterminated escape sequence".to_string())
                            })?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<i64>()
                    .map_err(|_| ExprError::Parse(format!("integer literal out of range: {text}")))?;
                tokens.push(Token::Int(value));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(text));
            }
            _ => {
                return Err(ExprError::Parse(format!(
                    "unexpected character '{c}' at offset {i}"
                )))
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser (precedence climbing)
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(ExprError::Parse(format!(
                "expected {token:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn expect_end(&mut self) -> Result<(), ExprError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ExprError::Parse(format!(
                "unexpected trailing token {token:?}"
            ))),
        }
    }

    fn ternary(&mut self) -> Result<Node, ExprError> {
        let cond = self.or()?;
        if self.eat(&Token::Question) {
            let then = self.ternary()?;
            self.expect(Token::Colon)?;
            let otherwise = self.ternary()?;
            Ok(Node::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ))
        } else {
            Ok(cond)
        }
    }

    fn or(&mut self) -> Result<Node, ExprError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Node::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Node, ExprError> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = Node::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Node, ExprError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let right = self.comparison()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Node, ExprError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::Ident(word)) => match word.as_str() {
                    "contains" => BinOp::Contains,
                    "startsWith" => BinOp::StartsWith,
                    "endsWith" => BinOp::EndsWith,
                    "in" => BinOp::In,
                    _ => break,
                },
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Node, ExprError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Node, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        if self.eat(&Token::Bang) {
            Ok(Node::Not(Box::new(self.unary()?)))
        } else if self.eat(&Token::Minus) {
            Ok(Node::Neg(Box::new(self.unary()?)))
        } else {
            self.postfix()
        }
    }

    fn postfix(&mut self) -> Result<Node, ExprError> {
        let mut node = self.primary()?;
        while self.eat(&Token::LBracket) {
            let index = self.ternary()?;
            self.expect(Token::RBracket)?;
            node = Node::Index(Box::new(node), Box::new(index));
        }
        Ok(node)
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        match self.bump() {
            Some(Token::Int(value)) => Ok(Node::Int(value)),
            Some(Token::Str(value)) => Ok(Node::Str(value)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Node::Bool(true)),
                "false" => Ok(Node::Bool(false)),
                _ => {
                    if self.eat(&Token::LParen) {
                        let mut args = Vec::new();
                        if !self.eat(&Token::RParen) {
                            loop {
                                args.push(self.ternary()?);
                                if self.eat(&Token::RParen) {
                                    break;
                                }
                                self.expect(Token::Comma)?;
                            }
                        }
                        Ok(Node::Call(name, args))
                    } else {
                        Ok(Node::Ident(name))
                    }
                }
            },
            Some(Token::LParen) => {
                let node = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(node)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Node::List(items))
            }
            other => Err(ExprError::Parse(format!(
                "unexpected token {other:?} where an expression was expected"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn eval_node(node: &Node, env: &RequestEnv) -> Result<Value, ExprError> {
    match node {
        Node::Str(s) => Ok(Value::Str(s.clone())),
        Node::Int(i) => Ok(Value::Int(*i)),
        Node::Bool(b) => Ok(Value::Bool(*b)),
        Node::List(items) => {
            let values = items
                .iter()
                .map(|item| eval_node(item, env))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::List(values))
        }
        Node::Ident(name) => {
            if let Some(value) = env.var(name) {
                Ok(Value::Str(value.to_string()))
            } else if env.map(name).is_some() {
                Err(ExprError::Eval(format!(
                    "map '{name}' must be indexed with a key"
                )))
            } else {
                Err(ExprError::Eval(format!("unknown identifier '{name}'")))
            }
        }
        Node::Index(base, index) => {
            // Map indexing resolves against the environment without
            // materializing the map as a value
            if let Node::Ident(name) = base.as_ref() {
                if let Some(map) = env.map(name) {
                    let key = match eval_node(index, env)? {
                        Value::Str(key) => key,
                        other => {
                            return Err(ExprError::Eval(format!(
                                "map key must be a string, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    // Missing keys read as the empty string
                    return Ok(Value::Str(map.get(&key).cloned().unwrap_or_default()));
                }
            }

            match (eval_node(base, env)?, eval_node(index, env)?) {
                (Value::List(items), Value::Int(i)) => {
                    let idx = usize::try_from(i)
                        .map_err(|_| ExprError::Eval(format!("negative list index {i}")))?;
                    items.into_iter().nth(idx).ok_or_else(|| {
                        ExprError::Eval(format!("list index {idx} out of bounds"))
                    })
                }
                (base, index) => Err(ExprError::Eval(format!(
                    "cannot index {} with {}",
                    base.type_name(),
                    index.type_name()
                ))),
            }
        }
        Node::Call(name, args) => eval_call(name, args, env),
        Node::Not(inner) => match eval_node(inner, env)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::Eval(format!(
                "'!' needs a boolean, got {}",
                other.type_name()
            ))),
        },
        Node::Neg(inner) => match eval_node(inner, env)? {
            Value::Int(i) => Ok(Value::Int(-i)),
            other => Err(ExprError::Eval(format!(
                "'-' needs an int, got {}",
                other.type_name()
            ))),
        },
        Node::Binary(op, left, right) => eval_binary(*op, left, right, env),
        Node::Ternary(cond, then, otherwise) => match eval_node(cond, env)? {
            Value::Bool(true) => eval_node(then, env),
            Value::Bool(false) => eval_node(otherwise, env),
            other => Err(ExprError::Eval(format!(
                "ternary condition must be a boolean, got {}",
                other.type_name()
            ))),
        },
    }
}

fn eval_binary(op: BinOp, left: &Node, right: &Node, env: &RequestEnv) -> Result<Value, ExprError> {
    // Short-circuiting logical operators evaluate the right side lazily
    if matches!(op, BinOp::And | BinOp::Or) {
        let lhs = match eval_node(left, env)? {
            Value::Bool(b) => b,
            other => {
                return Err(ExprError::Eval(format!(
                    "logical operator needs booleans, got {}",
                    other.type_name()
                )))
            }
        };
        if op == BinOp::And && !lhs {
            return Ok(Value::Bool(false));
        }
        if op == BinOp::Or && lhs {
            return Ok(Value::Bool(true));
        }
        return match eval_node(right, env)? {
            Value::Bool(b) => Ok(Value::Bool(b)),
            other => Err(ExprError::Eval(format!(
                "logical operator needs booleans, got {}",
                other.type_name()
            ))),
        };
    }

    let lhs = eval_node(left, env)?;
    let rhs = eval_node(right, env)?;

    match op {
        BinOp::Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (a, b) => Err(type_mismatch("+", &a, &b)),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                BinOp::Sub => Ok(Value::Int(a.wrapping_sub(b))),
                BinOp::Mul => Ok(Value::Int(a.wrapping_mul(b))),
                BinOp::Div => {
                    if b == 0 {
                        Err(ExprError::Eval("division by zero".to_string()))
                    } else {
                        Ok(Value::Int(a.wrapping_div(b)))
                    }
                }
                BinOp::Rem => {
                    if b == 0 {
                        Err(ExprError::Eval("division by zero".to_string()))
                    } else {
                        Ok(Value::Int(a.wrapping_rem(b)))
                    }
                }
                _ => unreachable!(),
            },
            (a, b) => Err(type_mismatch("arithmetic", &a, &b)),
        },
        BinOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                (a, b) => return Err(type_mismatch("comparison", a, b)),
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }))
        }
        BinOp::Contains | BinOp::StartsWith | BinOp::EndsWith => match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(match op {
                BinOp::Contains => a.contains(&b),
                BinOp::StartsWith => a.starts_with(&b),
                BinOp::EndsWith => a.ends_with(&b),
                _ => unreachable!(),
            })),
            (a, b) => Err(type_mismatch("string operator", &a, &b)),
        },
        BinOp::In => match rhs {
            Value::List(items) => Ok(Value::Bool(items.iter().any(|item| values_equal(item, &lhs)))),
            other => Err(ExprError::Eval(format!(
                "'in' needs a list on the right, got {}",
                other.type_name()
            ))),
        },
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        // Values of different types never compare equal
        _ => false,
    }
}

fn type_mismatch(op: &str, a: &Value, b: &Value) -> ExprError {
    ExprError::Eval(format!(
        "{op} not defined for {} and {}",
        a.type_name(),
        b.type_name()
    ))
}

fn eval_call(name: &str, args: &[Node], env: &RequestEnv) -> Result<Value, ExprError> {
    match name {
        "random" => {
            let (lo, hi) = two_ints(name, args, env)?;
            Ok(Value::Int(thread_range(lo, hi)))
        }
        "randomUser" => {
            let (lo, hi) = two_ints(name, args, env)?;
            Ok(Value::Int(seeded_range(polynomial_hash(&env.ip), lo, hi)))
        }
        "randomCookie" => {
            let (seed_arg, lo, hi) = str_and_two_ints(name, args, env)?;
            let seed = match env.cookies.get(&seed_arg) {
                Some(value) if !value.is_empty() => polynomial_hash(value),
                _ => polynomial_hash(&env.ip),
            };
            Ok(Value::Int(seeded_range(seed, lo, hi)))
        }
        "randomParam" => {
            let (value, lo, hi) = str_and_two_ints(name, args, env)?;
            let seed = if value.is_empty() {
                polynomial_hash(&env.ip)
            } else {
                polynomial_hash(&value)
            };
            Ok(Value::Int(seeded_range(seed, lo, hi)))
        }
        "len" => {
            if args.len() != 1 {
                return Err(ExprError::Eval(format!(
                    "len expects 1 argument, got {}",
                    args.len()
                )));
            }
            match eval_node(&args[0], env)? {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                other => Err(ExprError::Eval(format!(
                    "len not defined for {}",
                    other.type_name()
                ))),
            }
        }
        _ => Err(ExprError::Eval(format!("unknown function '{name}'"))),
    }
}

fn two_ints(name: &str, args: &[Node], env: &RequestEnv) -> Result<(i64, i64), ExprError> {
    if args.len() != 2 {
        return Err(ExprError::Eval(format!(
            "{name} expects 2 arguments, got {}",
            args.len()
        )));
    }
    Ok((int_arg(name, &args[0], env)?, int_arg(name, &args[1], env)?))
}

fn str_and_two_ints(
    name: &str,
    args: &[Node],
    env: &RequestEnv,
) -> Result<(String, i64, i64), ExprError> {
    if args.len() != 3 {
        return Err(ExprError::Eval(format!(
            "{name} expects 3 arguments, got {}",
            args.len()
        )));
    }
    let first = match eval_node(&args[0], env)? {
        Value::Str(s) => s,
        other => {
            return Err(ExprError::Eval(format!(
                "{name} expects a string first argument, got {}",
                other.type_name()
            )))
        }
    };
    Ok((
        first,
        int_arg(name, &args[1], env)?,
        int_arg(name, &args[2], env)?,
    ))
}

fn int_arg(name: &str, node: &Node, env: &RequestEnv) -> Result<i64, ExprError> {
    match eval_node(node, env)? {
        Value::Int(i) => Ok(i),
        other => Err(ExprError::Eval(format!(
            "{name} expects int bounds, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> RequestEnv {
        let mut env = RequestEnv {
            method: "GET".to_string(),
            path: "/landing".to_string(),
            host: "ab.example.com".to_string(),
            ip: "203.0.113.7".to_string(),
            referer: "https://search.example/".to_string(),
            protocol: "HTTP/1.1".to_string(),
            url: "http://ab.example.com/landing?version=2".to_string(),
            ..RequestEnv::default()
        };
        env.headers
            .insert("user-agent".to_string(), "Mozilla/5.0 (iPhone)".to_string());
        env.headers
            .insert("x-country".to_string(), "CA".to_string());
        env.query.insert("version".to_string(), "2".to_string());
        env.cookies
            .insert("bucket".to_string(), "u123".to_string());
        env
    }

    #[test]
    fn polynomial_hash_matches_reference_values() {
        // h = h*31 + code point, h0 = 0
        assert_eq!(polynomial_hash(""), 0);
        assert_eq!(polynomial_hash("a"), 97);
        assert_eq!(polynomial_hash("ab"), 97 * 31 + 98);
        assert_eq!(polynomial_hash("u123"), ((117 * 31 + 49) * 31 + 50) * 31 + 51);
    }

    #[test]
    fn seeded_range_is_pure_and_in_bounds() {
        let seed = polynomial_hash("u123");
        let first = seeded_range(seed, 1, 100);
        for _ in 0..50 {
            assert_eq!(seeded_range(seed, 1, 100), first);
        }
        assert!((1..=100).contains(&first));

        // Inverted bounds behave like the ordered pair
        assert_eq!(seeded_range(seed, 100, 1), first);
        // Degenerate range collapses to the single value
        assert_eq!(seeded_range(seed, 7, 7), 7);
    }

    #[test]
    fn seeded_range_tolerates_zero_seed() {
        let v = seeded_range(0, 1, 100);
        assert!((1..=100).contains(&v));
        assert_eq!(seeded_range(0, 1, 100), v);
    }

    #[test]
    fn map_indexing_and_missing_keys() {
        let env = env();
        assert_eq!(
            compile("headers['x-country']").unwrap().eval(&env).unwrap(),
            Value::Str("CA".to_string())
        );
        assert_eq!(
            compile("query['absent']").unwrap().eval(&env).unwrap(),
            Value::Str(String::new())
        );
    }

    #[test]
    fn string_operators() {
        let env = env();
        assert!(eval_bool("headers['user-agent'] contains 'iPhone'", &env).unwrap());
        assert!(eval_bool("path startsWith '/land'", &env).unwrap());
        assert!(eval_bool("host endsWith 'example.com'", &env).unwrap());
        assert!(!eval_bool("path startsWith '/api'", &env).unwrap());
    }

    #[test]
    fn in_operator_over_list_literal() {
        let env = env();
        assert!(eval_bool("headers['x-country'] in ['US', 'CA']", &env).unwrap());
        assert!(!eval_bool("headers['x-country'] in ['DE', 'FR']", &env).unwrap());
    }

    #[test]
    fn arithmetic_and_precedence() {
        let env = env();
        assert_eq!(
            compile("1 + 2 * 3").unwrap().eval(&env).unwrap(),
            Value::Int(7)
        );
        assert_eq!(
            compile("(1 + 2) * 3").unwrap().eval(&env).unwrap(),
            Value::Int(9)
        );
        assert!(eval_bool("len(ip) % 2 == 0 || len(ip) % 2 == 1", &env).unwrap());
    }

    #[test]
    fn ternary_returns_string_target() {
        let env = env();
        let result = eval_string(
            "headers['user-agent'] contains 'iPhone' ? 'mobile-target' : 'desktop-target'",
            &env,
        )
        .unwrap();
        assert_eq!(result, "mobile-target");
    }

    #[test]
    fn nested_ternary_is_right_associative() {
        let env = env();
        let result = eval_string(
            "query['version'] == '1' ? 'old' : query['version'] == '2' ? 'new' : 'other'",
            &env,
        )
        .unwrap();
        assert_eq!(result, "new");
    }

    #[test]
    fn random_cookie_is_deterministic_per_cookie_value() {
        let env = env();
        let first = compile("randomCookie('bucket', 1, 100)")
            .unwrap()
            .eval(&env)
            .unwrap();
        for _ in 0..100 {
            let again = compile("randomCookie('bucket', 1, 100)")
                .unwrap()
                .eval(&env)
                .unwrap();
            assert_eq!(again, first);
        }

        // Same seed computed directly
        assert_eq!(
            first,
            Value::Int(seeded_range(polynomial_hash("u123"), 1, 100))
        );
    }

    #[test]
    fn random_cookie_falls_back_to_user_seed() {
        let mut env = env();
        env.cookies.clear();

        let via_cookie = compile("randomCookie('bucket', 1, 100)")
            .unwrap()
            .eval(&env)
            .unwrap();
        let via_user = compile("randomUser(1, 100)").unwrap().eval(&env).unwrap();
        assert_eq!(via_cookie, via_user);
    }

    #[test]
    fn random_param_seeds_from_value() {
        let env = env();
        let a = eval_bool("randomParam(query['version'], 1, 100) <= 100", &env).unwrap();
        assert!(a);

        let direct = compile("randomParam('fixed', 10, 20)")
            .unwrap()
            .eval(&env)
            .unwrap();
        assert_eq!(
            direct,
            Value::Int(seeded_range(polynomial_hash("fixed"), 10, 20))
        );
    }

    #[test]
    fn random_stays_in_inclusive_range_even_inverted() {
        let env = env();
        for _ in 0..200 {
            let Value::Int(v) = compile("random(10, 1)").unwrap().eval(&env).unwrap() else {
                panic!("random must return an int");
            };
            assert!((1..=10).contains(&v));
        }
    }

    #[test]
    fn type_errors_are_reported_not_panicked() {
        let env = env();
        assert!(eval_bool("'a' && true", &env).is_err());
        assert!(eval_bool("path", &env).is_err());
        assert!(compile("headers['a'").is_err());
        assert!(compile("1 +").is_err());
        assert!(eval_string("nosuchfn(1)", &env).is_err());
        assert!(eval_string("1 / 0", &env).is_err());
    }

    #[test]
    fn cross_type_equality_is_false_not_an_error() {
        let env = env();
        assert!(!eval_bool("query['version'] == 2", &env).unwrap());
        assert!(eval_bool("query['version'] != 2", &env).unwrap());
    }

    #[test]
    fn bare_map_identifier_is_rejected() {
        let env = env();
        assert!(compile("headers").unwrap().eval(&env).is_err());
    }
}
