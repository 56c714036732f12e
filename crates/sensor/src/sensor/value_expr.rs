//! Expressions over named payload values, used by `exprs` filters:
//! `kind == "deploy" && (replicas * 2 > limit || name =~ "^canary-")`.
//!
//! Numbers compare as `f64`. `=~` and `!~` take a regex on the right-hand side.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use regex::Regex;
use serde_json::Value as Json;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    /// Arrays and objects; only `==` and `!=` apply.
    Json(Json),
}

impl From<&Json> for Val {
    fn from(value: &Json) -> Self {
        match value {
            Json::Null => Val::Null,
            Json::Bool(b) => Val::Bool(*b),
            Json::Number(n) => n.as_f64().map(Val::Num).unwrap_or(Val::Null),
            Json::String(s) => Val::Str(s.clone()),
            other => Val::Json(other.clone()),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => write!(f, "null"),
            Val::Bool(b) => write!(f, "{}", b),
            Val::Num(n) => write!(f, "{}", n),
            Val::Str(s) => write!(f, "{:?}", s),
            Val::Json(j) => write!(f, "{}", j),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Match => "=~",
            BinOp::NotMatch => "!~",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    Lit(Val),
    Field(String),
    Not(Box<ValueExpr>),
    Neg(Box<ValueExpr>),
    Binary(BinOp, Box<ValueExpr>, Box<ValueExpr>),
}

impl ValueExpr {
    pub fn parse(input: &str) -> Result<ValueExpr> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(Error::Validation(format!(
                "unexpected {} in expression '{}'",
                token, input
            )));
        }
        Ok(expr)
    }

    /// Field names the expression reads.
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut BTreeSet<String>) {
        match self {
            ValueExpr::Lit(_) => {}
            ValueExpr::Field(name) => {
                out.insert(name.clone());
            }
            ValueExpr::Not(inner) | ValueExpr::Neg(inner) => inner.collect(out),
            ValueExpr::Binary(_, l, r) => {
                l.collect(out);
                r.collect(out);
            }
        }
    }

    /// Evaluate to a boolean. Any other result type is an error.
    pub fn eval_bool(&self, bindings: &HashMap<String, Val>) -> Result<bool> {
        match self.eval(bindings)? {
            Val::Bool(b) => Ok(b),
            other => Err(Error::Filter(format!(
                "expression '{}' evaluated to {}, not a boolean",
                self, other
            ))),
        }
    }

    pub fn eval(&self, bindings: &HashMap<String, Val>) -> Result<Val> {
        match self {
            ValueExpr::Lit(v) => Ok(v.clone()),
            ValueExpr::Field(name) => bindings
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Filter(format!("field '{}' is not bound", name))),
            ValueExpr::Not(inner) => match inner.eval(bindings)? {
                Val::Bool(b) => Ok(Val::Bool(!b)),
                other => Err(type_error("!", &other)),
            },
            ValueExpr::Neg(inner) => match inner.eval(bindings)? {
                Val::Num(n) => Ok(Val::Num(-n)),
                other => Err(type_error("-", &other)),
            },
            ValueExpr::Binary(BinOp::And, l, r) => {
                if !self.operand_bool(BinOp::And, l, bindings)? {
                    return Ok(Val::Bool(false));
                }
                Ok(Val::Bool(self.operand_bool(BinOp::And, r, bindings)?))
            }
            ValueExpr::Binary(BinOp::Or, l, r) => {
                if self.operand_bool(BinOp::Or, l, bindings)? {
                    return Ok(Val::Bool(true));
                }
                Ok(Val::Bool(self.operand_bool(BinOp::Or, r, bindings)?))
            }
            ValueExpr::Binary(op, l, r) => binary(*op, l.eval(bindings)?, r.eval(bindings)?),
        }
    }

    fn operand_bool(
        &self,
        op: BinOp,
        operand: &ValueExpr,
        bindings: &HashMap<String, Val>,
    ) -> Result<bool> {
        match operand.eval(bindings)? {
            Val::Bool(b) => Ok(b),
            other => Err(type_error(op.symbol(), &other)),
        }
    }
}

fn type_error(op: &str, value: &Val) -> Error {
    Error::Filter(format!("operator '{}' cannot be applied to {}", op, value))
}

fn binary(op: BinOp, left: Val, right: Val) -> Result<Val> {
    match op {
        BinOp::Eq => Ok(Val::Bool(left == right)),
        BinOp::Ne => Ok(Val::Bool(left != right)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&left, &right) {
                (Val::Num(a), Val::Num(b)) => a.partial_cmp(b),
                (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(Error::Filter(format!(
                    "cannot compare {} {} {}",
                    left,
                    op.symbol(),
                    right
                )));
            };
            Ok(Val::Bool(match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinOp::Match | BinOp::NotMatch => {
            let (Val::Str(text), Val::Str(pattern)) = (&left, &right) else {
                return Err(Error::Filter(format!(
                    "'{}' needs strings, got {} and {}",
                    op.symbol(),
                    left,
                    right
                )));
            };
            let re = Regex::new(pattern)
                .map_err(|e| Error::Filter(format!("invalid regex '{}': {}", pattern, e)))?;
            Ok(Val::Bool(re.is_match(text) == (op == BinOp::Match)))
        }
        BinOp::Add => match (left, right) {
            (Val::Num(a), Val::Num(b)) => Ok(Val::Num(a + b)),
            (Val::Str(a), Val::Str(b)) => Ok(Val::Str(a + &b)),
            (l, r) => Err(Error::Filter(format!("cannot add {} and {}", l, r))),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let (Val::Num(a), Val::Num(b)) = (&left, &right) else {
                return Err(Error::Filter(format!(
                    "'{}' needs numbers, got {} and {}",
                    op.symbol(),
                    left,
                    right
                )));
            };
            match op {
                BinOp::Sub => Ok(Val::Num(a - b)),
                BinOp::Mul => Ok(Val::Num(a * b)),
                _ if *b == 0.0 => Err(Error::Filter("division by zero".to_string())),
                _ => Ok(Val::Num(a / b)),
            }
        }
        BinOp::And | BinOp::Or => Err(Error::Internal(format!(
            "'{}' evaluated without short-circuit",
            op.symbol()
        ))),
    }
}

impl fmt::Display for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExpr::Lit(v) => write!(f, "{}", v),
            ValueExpr::Field(name) => write!(f, "{}", name),
            ValueExpr::Not(inner) => write!(f, "!{}", inner),
            ValueExpr::Neg(inner) => write!(f, "-{}", inner),
            ValueExpr::Binary(op, l, r) => write!(f, "({} {} {})", l, op.symbol(), r),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(f64),
    Str(String),
    Op(BinOp),
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::Num(n) => write!(f, "number {}", n),
            Token::Str(s) => write!(f, "string {:?}", s),
            Token::Op(op) => write!(f, "'{}'", op.symbol()),
            Token::Not => write!(f, "'!'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let invalid = |msg: String| Error::Validation(format!("{} in expression '{}'", msg, input));
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '&' | '|' => {
                if next != Some(c) {
                    return Err(invalid(format!("expected '{}{}'", c, c)));
                }
                tokens.push(Token::Op(if c == '&' { BinOp::And } else { BinOp::Or }));
                i += 2;
            }
            '=' => {
                let op = match next {
                    Some('=') => BinOp::Eq,
                    Some('~') => BinOp::Match,
                    _ => return Err(invalid("expected '==' or '=~'".to_string())),
                };
                tokens.push(Token::Op(op));
                i += 2;
            }
            '!' => match next {
                Some('=') => {
                    tokens.push(Token::Op(BinOp::Ne));
                    i += 2;
                }
                Some('~') => {
                    tokens.push(Token::Op(BinOp::NotMatch));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Not);
                    i += 1;
                }
            },
            '<' | '>' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('<', false) => BinOp::Lt,
                    ('<', true) => BinOp::Le,
                    (_, false) => BinOp::Gt,
                    (_, true) => BinOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if or_equal { 2 } else { 1 };
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(match c {
                    '+' => BinOp::Add,
                    '-' => BinOp::Sub,
                    '*' => BinOp::Mul,
                    _ => BinOp::Div,
                }));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string".to_string())),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&other) => s.push(other),
                                None => return Err(invalid("unterminated string".to_string())),
                            }
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
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{}'", other))),
        }
    }

    if tokens.is_empty() {
        return Err(Error::Validation("empty expression".to_string()));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<BinOp> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    /// Left-associative chain of `ops` over `next`.
    fn chain(
        &mut self,
        ops: &[BinOp],
        next: fn(&mut Parser) -> Result<ValueExpr>,
    ) -> Result<ValueExpr> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_op().filter(|op| ops.contains(op)) {
            self.pos += 1;
            let right = next(self)?;
            left = ValueExpr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<ValueExpr> {
        self.chain(&[BinOp::Or], Parser::parse_and)
    }

    fn parse_and(&mut self) -> Result<ValueExpr> {
        self.chain(&[BinOp::And], Parser::parse_comparison)
    }

    // Comparisons do not chain: `a < b < c` is rejected.
    fn parse_comparison(&mut self) -> Result<ValueExpr> {
        let left = self.parse_sum()?;
        let comparisons = [
            BinOp::Eq,
            BinOp::Ne,
            BinOp::Lt,
            BinOp::Le,
            BinOp::Gt,
            BinOp::Ge,
            BinOp::Match,
            BinOp::NotMatch,
        ];
        match self.peek_op().filter(|op| comparisons.contains(op)) {
            Some(op) => {
                self.pos += 1;
                let right = self.parse_sum()?;
                Ok(ValueExpr::Binary(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_sum(&mut self) -> Result<ValueExpr> {
        self.chain(&[BinOp::Add, BinOp::Sub], Parser::parse_product)
    }

    fn parse_product(&mut self) -> Result<ValueExpr> {
        self.chain(&[BinOp::Mul, BinOp::Div], Parser::parse_unary)
    }

    fn parse_unary(&mut self) -> Result<ValueExpr> {
        match self.tokens.get(self.pos) {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(ValueExpr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Op(BinOp::Sub)) => {
                self.pos += 1;
                Ok(ValueExpr::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<ValueExpr> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match token {
            Some(Token::Num(n)) => Ok(ValueExpr::Lit(Val::Num(n))),
            Some(Token::Str(s)) => Ok(ValueExpr::Lit(Val::Str(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => ValueExpr::Lit(Val::Bool(true)),
                "false" => ValueExpr::Lit(Val::Bool(false)),
                "null" => ValueExpr::Lit(Val::Null),
                _ => ValueExpr::Field(name),
            }),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(Error::Validation("unbalanced parentheses".to_string())),
                }
            }
            Some(other) => Err(Error::Validation(format!("unexpected {}", other))),
            None => Err(Error::Validation("unexpected end of expression".to_string())),
        }
    }
}
