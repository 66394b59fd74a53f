//! Recursive-descent parser.
//!
//! Precedence, lowest first: ternary (right-assoc) -> `or` -> `and` -> `not`
//! -> reference. The only lookahead is one token, so parsing is linear in the
//! token count.

use super::ast::{Accessor, Expr};
use super::lexer::{Token, TokenKind, tokenize};
use super::ParseError;

const ROOTS: &str = "inputs, steps, item or index";

/// Parse a bare expression (the text between `${{` and `}}`).
pub fn parse_expression(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };

    if parser.peek().kind == TokenKind::Eof {
        return Err(ParseError::new("empty expression", 0, source));
    }

    let expr = parser.parse_ternary()?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::Eof {
        return Err(parser.error_at(trailing, format!("unexpected token '{}'", trailing.kind)));
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        // The token list always ends with Eof and `advance` never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> ParseError {
        ParseError::new(message, token.offset, self.source)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let then = self.parse_or()?;
        if self.peek().kind != TokenKind::If {
            return Ok(then);
        }
        self.advance();

        let condition = self.parse_or()?;
        let next = self.peek().clone();
        if next.kind != TokenKind::Else {
            return Err(self.error_at(&next, format!("expected 'else', found '{}'", next.kind)));
        }
        self.advance();

        let otherwise = self.parse_ternary()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut operands = vec![self.parse_and()?];
        while self.peek().kind == TokenKind::Or {
            self.advance();
            operands.push(self.parse_and()?);
        }
        Ok(collapse(operands, Expr::Or))
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut operands = vec![self.parse_not()?];
        while self.peek().kind == TokenKind::And {
            self.advance();
            operands.push(self.parse_not()?);
        }
        Ok(collapse(operands, Expr::And))
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.peek().kind != TokenKind::Not {
            return self.parse_reference();
        }
        self.advance();

        let next = self.peek().clone();
        if next.kind == TokenKind::Not {
            return Err(self.error_at(&next, "double negation is not allowed"));
        }
        Ok(Expr::Not(Box::new(self.parse_reference()?)))
    }

    fn parse_reference(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        let root = match &token.kind {
            TokenKind::Ident(name) => name.clone(),
            TokenKind::Eof => {
                return Err(self.error_at(&token, "expected a reference, found end of expression"));
            }
            other => {
                return Err(self.error_at(&token, format!("expected a reference, found '{other}'")));
            }
        };

        match root.as_str() {
            "inputs" => {
                let name_token = self.peek().clone();
                let name = match self.parse_segment()? {
                    Some(Accessor::Key(name)) => name,
                    Some(Accessor::Index(_)) => {
                        return Err(self.error_at(&name_token, "input name must be a key, not an index"));
                    }
                    None => {
                        return Err(self.error_at(&name_token, "expected an input name after 'inputs'"));
                    }
                };
                let path = self.parse_accessors()?;
                Ok(Expr::Input { name, path })
            }
            "steps" => {
                let name_token = self.peek().clone();
                let step = match self.parse_segment()? {
                    Some(Accessor::Key(step)) => step,
                    Some(Accessor::Index(_)) => {
                        return Err(self.error_at(&name_token, "step name must be a key, not an index"));
                    }
                    None => {
                        return Err(self.error_at(&name_token, "expected a step name after 'steps'"));
                    }
                };

                let output_token = self.peek().clone();
                match self.parse_segment()? {
                    Some(Accessor::Key(segment)) if segment == "output" => {}
                    Some(other) => {
                        return Err(self.error_at(
                            &output_token,
                            format!(
                                "step reference must continue with '.output', found '{}'",
                                other.to_string().trim_start_matches('.')
                            ),
                        ));
                    }
                    None => {
                        return Err(self.error_at(
                            &output_token,
                            format!("step reference must continue with '.output' after 'steps.{step}'"),
                        ));
                    }
                }

                let path = self.parse_accessors()?;
                Ok(Expr::Step { step, path })
            }
            "item" => Ok(Expr::Item(self.parse_accessors()?)),
            "index" => {
                let next = self.peek().clone();
                if matches!(next.kind, TokenKind::Dot | TokenKind::LBracket) {
                    return Err(self.error_at(&next, "'index' does not accept accessors"));
                }
                Ok(Expr::Index)
            }
            other => Err(self.error_at(
                &token,
                format!("unknown reference root '{other}' (expected {ROOTS})"),
            )),
        }
    }

    fn parse_accessors(&mut self) -> Result<Vec<Accessor>, ParseError> {
        let mut path = Vec::new();
        while let Some(accessor) = self.parse_segment()? {
            path.push(accessor);
        }
        Ok(path)
    }

    /// Parse one `.name`, `[int]` or `['key']` accessor, or return `None` if
    /// the next token does not start one.
    fn parse_segment(&mut self) -> Result<Option<Accessor>, ParseError> {
        match self.peek().kind {
            TokenKind::Dot => {
                self.advance();
                let name = self.advance();
                match name.kind.as_name() {
                    Some(field) => Ok(Some(Accessor::Key(field.to_string()))),
                    None if name.kind == TokenKind::Eof => {
                        Err(self.error_at(&name, "trailing '.' must be followed by a field name"))
                    }
                    None => Err(self.error_at(
                        &name,
                        format!("expected a field name after '.', found '{}'", name.kind),
                    )),
                }
            }
            TokenKind::LBracket => {
                self.advance();
                let inner = self.advance();
                let accessor = match inner.kind {
                    TokenKind::Int(i) => Accessor::Index(i),
                    TokenKind::Str(ref key) => Accessor::Key(key.clone()),
                    ref other => {
                        return Err(self.error_at(
                            &inner,
                            format!("expected an integer or quoted key inside '[]', found '{other}'"),
                        ));
                    }
                };
                let close = self.advance();
                if close.kind != TokenKind::RBracket {
                    return Err(self.error_at(&close, format!("expected ']', found '{}'", close.kind)));
                }
                Ok(Some(accessor))
            }
            _ => Ok(None),
        }
    }
}

fn collapse(mut operands: Vec<Expr>, build: fn(Vec<Expr>) -> Expr) -> Expr {
    if operands.len() == 1 {
        operands.remove(0)
    } else {
        build(operands)
    }
}
