//! Boolean expressions over dependency and group names: `a && (b || c-d)`.
//!
//! Parsed once into an [`Expr`], then evaluated against a lookup of resolved names.

use std::collections::BTreeSet;
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Var(String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// Identifier form used inside expressions: hyphens become underscores.
pub fn normalize(name: &str) -> String {
    name.replace('-', "_")
}

pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::Validation(format!(
                "unexpected {} in expression '{}'",
                parser.tokens[parser.pos], input
            )));
        }
        Ok(expr)
    }

    /// AND of all names, in order.
    pub fn all_of<I, S>(names: I) -> Option<Expr>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|n| Expr::Var(normalize(n.as_ref())))
            .reduce(|acc, next| Expr::And(Box::new(acc), Box::new(next)))
    }

    pub fn eval<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        match self {
            Expr::Var(name) => lookup(name),
            Expr::And(l, r) => l.eval(lookup) && r.eval(lookup),
            Expr::Or(l, r) => l.eval(lookup) || r.eval(lookup),
        }
    }

    /// Normalized identifiers referenced by the expression.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect(out);
                r.collect(out);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(name) => write!(f, "{}", name),
            Expr::And(l, r) => write!(f, "({} && {})", l, r),
            Expr::Or(l, r) => write!(f, "({} || {})", l, r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    And,
    Or,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::And => write!(f, "'&&'"),
            Token::Or => write!(f, "'||'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(Error::Validation(format!(
                        "expected '{}{}' in expression '{}'",
                        c, c, input
                    )));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(normalize(&ident)));
            }
            other => {
                return Err(Error::Validation(format!(
                    "unexpected character '{}' in expression '{}'",
                    other, input
                )))
            }
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
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_atom()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_atom()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match token {
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn eval(expr: &str, resolved: &[&str]) -> bool {
        let set: HashSet<String> = resolved.iter().map(|s| normalize(s)).collect();
        Expr::parse(expr).unwrap().eval(&|name: &str| set.contains(name))
    }

    #[test]
    fn test_precedence_and_binds_tighter() {
        assert!(eval("a || b && c", &["a"]));
        assert!(!eval("(a || b) && c", &["a"]));
        assert!(eval("(a || b) && c", &["b", "c"]));
    }

    #[test]
    fn test_hyphenated_names() {
        let expr = Expr::parse("dep-a && dep_b").unwrap();
        assert_eq!(
            expr.identifiers().into_iter().collect::<Vec<_>>(),
            vec!["dep_a", "dep_b"]
        );
        assert!(eval("dep-a && dep_b", &["dep-a", "dep-b"]));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "a &&", "(a || b", "a & b", "a || || b", "a b", "a != b", ")"] {
            assert!(Expr::parse(bad).is_err(), "expected error for '{}'", bad);
        }
    }

    #[test]
    fn test_and_only_expression_is_monotonic() {
        let names = ["a", "b", "c", "d"];
        let expr = Expr::all_of(["a", "b"]).unwrap();
        let mut resolved: HashSet<String> = HashSet::new();
        let mut was_true = false;
        for name in names {
            resolved.insert(name.to_string());
            let now = expr.eval(&|n: &str| resolved.contains(n));
            assert!(!was_true || now);
            was_true = now;
        }
        assert!(was_true);
    }

    #[test]
    fn test_display_round_trips() {
        let expr = Expr::parse("a && (b || c)").unwrap();
        assert_eq!(Expr::parse(&expr.to_string()).unwrap(), expr);
    }
}
