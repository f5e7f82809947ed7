//! When-clause expressions.
//!
//! A small boolean language used to hint UI visibility:
//!
//! ```text
//! E := O
//! O := A ("||" A)*
//! A := U ("&&" U)*
//! U := ("!" U) | P
//! P := ident | "(" O ")"
//! ```
//!
//! Identifiers match `[A-Za-z0-9_.-]+`; `true` and `false` are reserved;
//! anything else resolves through the context and defaults to false. Syntax
//! errors evaluate to false — a broken clause hides a control, it never
//! takes the host down. This is a visibility hint, not a security boundary.

use std::collections::HashMap;

/// Evaluation context: a flat string→bool map.
///
/// Core-contributed keys are `editor.hasSelection`, `editor.isCurrentEmpty`,
/// `editor.element.<elementType>` and `plugin.enabled`.
#[derive(Debug, Clone, Default)]
pub struct WhenContext {
    flags: HashMap<String, bool>,
}

impl WhenContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.flags.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> bool {
        *self.flags.get(key).unwrap_or(&false)
    }
}

/// Evaluate a when-clause against a context. Never fails: unparseable input
/// yields `false`.
pub fn evaluate(expr: &str, ctx: &WhenContext) -> bool {
    let tokens = match tokenize(expr) {
        Some(t) => t,
        None => return false,
    };
    let mut parser = Parser { tokens, pos: 0 };
    match parser.parse_or(ctx) {
        Some(value) if parser.at_end() => value,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
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
            '!' => {
                chars.next();
                tokens.push(Token::Bang);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return None;
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return None;
                }
                tokens.push(Token::OrOr);
            }
            c if is_ident_char(c) => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if is_ident_char(c) {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            _ => return None,
        }
    }

    Some(tokens)
}

// ---------------------------------------------------------------------------
// Parser / evaluator
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
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

    fn parse_or(&mut self, ctx: &WhenContext) -> Option<bool> {
        let mut value = self.parse_and(ctx)?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let rhs = self.parse_and(ctx)?;
            value = value || rhs;
        }
        Some(value)
    }

    fn parse_and(&mut self, ctx: &WhenContext) -> Option<bool> {
        let mut value = self.parse_unary(ctx)?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let rhs = self.parse_unary(ctx)?;
            value = value && rhs;
        }
        Some(value)
    }

    fn parse_unary(&mut self, ctx: &WhenContext) -> Option<bool> {
        if self.peek() == Some(&Token::Bang) {
            self.advance();
            return Some(!self.parse_unary(ctx)?);
        }
        self.parse_primary(ctx)
    }

    fn parse_primary(&mut self, ctx: &WhenContext) -> Option<bool> {
        match self.advance()? {
            Token::Ident(ident) => match ident.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                other => Some(ctx.get(other)),
            },
            Token::LParen => {
                let value = self.parse_or(ctx)?;
                if self.advance()? == Token::RParen {
                    Some(value)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
