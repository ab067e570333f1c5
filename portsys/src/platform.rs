/*!
Boolean expressions over triplet variables.

Dependency edges and `supports` clauses carry expressions such as
`windows & !static` or `linux | (osx & arm64)`. Identifiers are looked up in
the dep-info variable map for the spec being evaluated; an identifier that is
absent, empty, or `"0"` is false.
*/

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("unexpected character '{found}' at offset {offset} in '{expression}'"))]
    UnexpectedCharacter {
        expression: String,
        found: char,
        offset: usize,
    },

    #[snafu(display("expected {expected} at offset {offset} in '{expression}'"))]
    UnexpectedToken {
        expression: String,
        expected: &'static str,
        offset: usize,
    },

    #[snafu(display("trailing input at offset {offset} in '{expression}'"))]
    TrailingInput { expression: String, offset: usize },
}

type Result<T> = std::result::Result<T, Error>;

/// A parsed platform expression. Keeps the original text for display and
/// diagnostics.
#[derive(Debug, Clone)]
pub(crate) struct PlatformExpression {
    original: String,
    expr: Expr,
}

#[derive(Debug, Clone)]
enum Expr {
    Ident(String),
    Literal(bool),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl PlatformExpression {
    /// Evaluate with short-circuiting. Unknown identifiers are false.
    pub(crate) fn evaluate(&self, vars: &BTreeMap<String, String>) -> bool {
        eval(&self.expr, vars)
    }
}

fn eval(expr: &Expr, vars: &BTreeMap<String, String>) -> bool {
    match expr {
        Expr::Ident(name) => vars
            .get(name)
            .map(|value| !value.is_empty() && value != "0")
            .unwrap_or(false),
        Expr::Literal(value) => *value,
        Expr::Not(inner) => !eval(inner, vars),
        Expr::And(parts) => parts.iter().all(|part| eval(part, vars)),
        Expr::Or(parts) => parts.iter().any(|part| eval(part, vars)),
    }
}

impl Display for PlatformExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl PartialEq for PlatformExpression {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl FromStr for PlatformExpression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let mut parser = Parser {
            expression: s,
            tokens,
            position: 0,
        };
        let expr = parser.or_expression()?;
        match parser.peek() {
            None => Ok(PlatformExpression {
                original: s.to_string(),
                expr,
            }),
            Some(token) => TrailingInputSnafu {
                expression: s,
                offset: token.offset,
            }
            .fail(),
        }
    }
}

impl Serialize for PlatformExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for PlatformExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Not,
    And,
    Or,
    OpenParen,
    CloseParen,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        let kind = match c {
            ' ' | '\t' => {
                chars.next();
                continue;
            }
            '!' => TokenKind::Not,
            '&' => TokenKind::And,
            '|' => TokenKind::Or,
            '(' => TokenKind::OpenParen,
            ')' => TokenKind::CloseParen,
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(ident),
                    offset,
                });
                continue;
            }
            found => {
                return UnexpectedCharacterSnafu {
                    expression: input,
                    found,
                    offset,
                }
                .fail()
            }
        };
        chars.next();
        tokens.push(Token { kind, offset });
    }
    Ok(tokens)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    position: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn or_expression(&mut self) -> Result<Expr> {
        let first = self.and_expression()?;
        if self.peek().map(|t| &t.kind) != Some(&TokenKind::Or) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.eat(&TokenKind::Or) {
            parts.push(self.and_expression()?);
        }
        Ok(Expr::Or(parts))
    }

    fn and_expression(&mut self) -> Result<Expr> {
        let first = self.unary_expression()?;
        if self.peek().map(|t| &t.kind) != Some(&TokenKind::And) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.eat(&TokenKind::And) {
            parts.push(self.unary_expression()?);
        }
        Ok(Expr::And(parts))
    }

    fn unary_expression(&mut self) -> Result<Expr> {
        if self.eat(&TokenKind::Not) {
            return Ok(Expr::Not(Box::new(self.unary_expression()?)));
        }
        self.primary_expression()
    }

    fn primary_expression(&mut self) -> Result<Expr> {
        let offset = self.peek().map(|t| t.offset).unwrap_or(self.expression.len());
        if self.eat(&TokenKind::OpenParen) {
            let inner = self.or_expression()?;
            if !self.eat(&TokenKind::CloseParen) {
                return UnexpectedTokenSnafu {
                    expression: self.expression,
                    expected: "')'",
                    offset,
                }
                .fail();
            }
            return Ok(inner);
        }

        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Ident(name)) => {
                self.position += 1;
                Ok(match name.as_str() {
                    "true" => Expr::Literal(true),
                    "false" => Expr::Literal(false),
                    _ => Expr::Ident(name),
                })
            }
            _ => UnexpectedTokenSnafu {
                expression: self.expression,
                expected: "an identifier, literal, or '('",
                offset,
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn eval(expression: &str, pairs: &[(&str, &str)]) -> bool {
        expression
            .parse::<PlatformExpression>()
            .unwrap()
            .evaluate(&vars(pairs))
    }

    #[test]
    fn identifiers_and_literals() {
        assert!(eval("linux", &[("linux", "1")]));
        assert!(!eval("linux", &[]));
        assert!(!eval("linux", &[("linux", "0")]));
        assert!(!eval("linux", &[("linux", "")]));
        assert!(eval("true", &[]));
        assert!(!eval("false", &[]));
    }

    #[test]
    fn operators_and_precedence() {
        let windows_static = &[("windows", "1"), ("static", "1")][..];
        assert!(!eval("windows & !static", windows_static));
        assert!(eval("windows & static", windows_static));
        // `&` binds tighter than `|`.
        assert!(eval("linux | windows & static", windows_static));
        assert!(!eval("(linux | windows) & !static", windows_static));
        assert!(eval("!(linux | osx)", windows_static));
    }

    #[test]
    fn parse_errors() {
        assert!("windows &".parse::<PlatformExpression>().is_err());
        assert!("(windows".parse::<PlatformExpression>().is_err());
        assert!("windows linux".parse::<PlatformExpression>().is_err());
        assert!("a ^ b".parse::<PlatformExpression>().is_err());
    }

    #[test]
    fn display_round_trips_original_text() {
        let text = "windows & !(arm | uwp)";
        let expression: PlatformExpression = text.parse().unwrap();
        assert_eq!(expression.to_string(), text);
    }
}
