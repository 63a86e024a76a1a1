//! A pragmatic subset of CEL for constraint expressions.
//!
//! Supported: identifier paths (`this.code`, bare field names), string and
//! numeric literals, booleans, `null`, list literals, logical `&&`/`||`/`!`,
//! comparison operators, and `in` membership. Expressions parse once at IR
//! build time. Undefined identifiers are evaluation errors, which callers
//! count as violations rather than engine failures.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum CelExpr {
    Literal(Value),
    /// Dotted identifier path, e.g. `this.code`.
    Ident(Vec<String>),
    Not(Box<CelExpr>),
    Binary {
        op: BinOp,
        lhs: Box<CelExpr>,
        rhs: Box<CelExpr>,
    },
    List(Vec<CelExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

/// Evaluation scope: `this` plus the enclosing message for bare names.
pub struct CelEnv<'a> {
    pub this: &'a Value,
    pub message: &'a Value,
}

impl CelExpr {
    pub fn parse(src: &str) -> Result<CelExpr, String> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("unexpected trailing input at token {}", parser.pos));
        }
        Ok(expr)
    }

    pub fn eval(&self, env: &CelEnv<'_>) -> Result<Value, String> {
        match self {
            CelExpr::Literal(v) => Ok(v.clone()),
            CelExpr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.eval(env)?);
                }
                Ok(Value::Array(out))
            }
            CelExpr::Ident(path) => resolve_ident(path, env),
            CelExpr::Not(inner) => match inner.eval(env)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(format!("'!' applied to non-boolean {other}")),
            },
            CelExpr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, env),
        }
    }

    /// Evaluate to a boolean outcome; non-boolean results are errors.
    pub fn eval_bool(&self, env: &CelEnv<'_>) -> Result<bool, String> {
        match self.eval(env)? {
            Value::Bool(b) => Ok(b),
            other => Err(format!("expression evaluated to non-boolean {other}")),
        }
    }
}

fn resolve_ident(path: &[String], env: &CelEnv<'_>) -> Result<Value, String> {
    let (mut current, rest) = match path.first().map(String::as_str) {
        Some("this") => (env.this, &path[1..]),
        Some(first) => {
            let root = env
                .message
                .get(first)
                .ok_or_else(|| format!("undefined identifier '{first}'"))?;
            (root, &path[1..])
        }
        None => return Err("empty identifier".to_string()),
    };
    for segment in rest {
        current = current
            .get(segment)
            .ok_or_else(|| format!("undefined field '{segment}'"))?;
    }
    Ok(current.clone())
}

fn eval_binary(
    op: BinOp,
    lhs: &CelExpr,
    rhs: &CelExpr,
    env: &CelEnv<'_>,
) -> Result<Value, String> {
    // Logical operators short-circuit.
    match op {
        BinOp::Or => {
            return match lhs.eval(env)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => match rhs.eval(env)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(format!("'||' applied to non-boolean {other}")),
                },
                other => Err(format!("'||' applied to non-boolean {other}")),
            };
        }
        BinOp::And => {
            return match lhs.eval(env)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => match rhs.eval(env)? {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    other => Err(format!("'&&' applied to non-boolean {other}")),
                },
                other => Err(format!("'&&' applied to non-boolean {other}")),
            };
        }
        _ => {}
    }

    let left = lhs.eval(env)?;
    let right = rhs.eval(env)?;
    let result = match op {
        BinOp::Eq => values_equal(&left, &right),
        BinOp::Ne => !values_equal(&left, &right),
        BinOp::Lt | BinOp::Lte | BinOp::Gt | BinOp::Gte => {
            let ordering = compare(&left, &right)?;
            match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Lte => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Gte => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
        BinOp::In => match &right {
            Value::Array(items) => items.iter().any(|item| values_equal(&left, item)),
            Value::Object(map) => match &left {
                Value::String(key) => map.contains_key(key),
                _ => false,
            },
            other => return Err(format!("'in' applied to non-collection {other}")),
        },
        BinOp::Or | BinOp::And => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, String> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| "incomparable numbers".to_string());
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(format!("cannot order {a} against {b}"))
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

// -- Tokenizer ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    In,
    OrOr,
    AndAnd,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
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
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err("single '=' is not an operator".to_string());
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Lte);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Gte);
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
                    return Err("single '&' is not an operator".to_string());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err("single '|' is not an operator".to_string());
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
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-'
                    && chars
                        .get(i + 1)
                        .is_some_and(|next| next.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_alphanumeric() || *ch == '_')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

// -- Parser -------------------------------------------------------------------

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

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            other => Err(format!("expected {token:?}, found {other:?}")),
        }
    }

    fn parse_or(&mut self) -> Result<CelExpr, String> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = CelExpr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<CelExpr, String> {
        let mut lhs = self.parse_comparison()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let rhs = self.parse_comparison()?;
            lhs = CelExpr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<CelExpr, String> {
        let lhs = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::NotEq) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Lte) => BinOp::Lte,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Gte) => BinOp::Gte,
            Some(Token::In) => BinOp::In,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.parse_unary()?;
        Ok(CelExpr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_unary(&mut self) -> Result<CelExpr, String> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(CelExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<CelExpr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(CelExpr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(CelExpr::Literal(Value::String(s))),
            Some(Token::True) => Ok(CelExpr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(CelExpr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(CelExpr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.next();
                    return Ok(CelExpr::List(items));
                }
                loop {
                    items.push(self.parse_or()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => return Err(format!("expected ',' or ']', found {other:?}")),
                    }
                }
                Ok(CelExpr::List(items))
            }
            Some(Token::Ident(first)) => {
                let mut path = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        other => {
                            return Err(format!("expected identifier after '.', found {other:?}"))
                        }
                    }
                }
                Ok(CelExpr::Ident(path))
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}
