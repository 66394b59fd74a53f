//! Tokenizer for the expression grammar.
//!
//! Offsets are character offsets into the expression source, which is what
//! the caret rendering in [`ParseError`] lines up with.

use std::fmt;

use super::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident(String),
    Int(i64),
    Str(String),
    And,
    Or,
    Not,
    If,
    Else,
    Dot,
    LBracket,
    RBracket,
    Eof,
}

impl TokenKind {
    /// Identifier text for tokens usable as a field name after `.`.
    ///
    /// Keywords are accepted there so `inputs.if` stays addressable.
    pub(crate) fn as_name(&self) -> Option<&str> {
        match self {
            TokenKind::Ident(s) => Some(s),
            TokenKind::And => Some("and"),
            TokenKind::Or => Some("or"),
            TokenKind::Not => Some("not"),
            TokenKind::If => Some("if"),
            TokenKind::Else => Some("else"),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "{s}"),
            TokenKind::Int(i) => write!(f, "{i}"),
            TokenKind::Str(s) => write!(f, "'{s}'"),
            TokenKind::And => f.write_str("and"),
            TokenKind::Or => f.write_str("or"),
            TokenKind::Not => f.write_str("not"),
            TokenKind::If => f.write_str("if"),
            TokenKind::Else => f.write_str("else"),
            TokenKind::Dot => f.write_str("."),
            TokenKind::LBracket => f.write_str("["),
            TokenKind::RBracket => f.write_str("]"),
            TokenKind::Eof => f.write_str("end of expression"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Split `source` into tokens, always ending with `Eof`.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        let kind = match c {
            '.' => {
                pos += 1;
                TokenKind::Dot
            }
            '[' => {
                pos += 1;
                TokenKind::LBracket
            }
            ']' => {
                pos += 1;
                TokenKind::RBracket
            }
            '\'' | '"' => {
                let (text, next) = lex_string(source, &chars, pos)?;
                pos = next;
                TokenKind::Str(text)
            }
            '-' | '0'..='9' => {
                let (value, next) = lex_int(source, &chars, pos)?;
                pos = next;
                TokenKind::Int(value)
            }
            c if is_ident_start(c) => {
                while pos < chars.len() && is_ident_continue(chars[pos]) {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                match word.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "if" => TokenKind::If,
                    "else" => TokenKind::Else,
                    _ => TokenKind::Ident(word),
                }
            }
            other => {
                return Err(ParseError::new(
                    format!("unsupported character '{other}'"),
                    start,
                    source,
                ));
            }
        };

        tokens.push(Token { kind, offset: start });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: chars.len(),
    });
    Ok(tokens)
}

fn lex_string(source: &str, chars: &[char], start: usize) -> Result<(String, usize), ParseError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut pos = start + 1;

    while pos < chars.len() {
        match chars[pos] {
            '\\' if pos + 1 < chars.len() => {
                text.push(chars[pos + 1]);
                pos += 2;
            }
            c if c == quote => return Ok((text, pos + 1)),
            c => {
                text.push(c);
                pos += 1;
            }
        }
    }

    Err(ParseError::new("unterminated string literal", start, source))
}

fn lex_int(source: &str, chars: &[char], start: usize) -> Result<(i64, usize), ParseError> {
    let mut pos = start;
    if chars[pos] == '-' {
        pos += 1;
    }
    let digits_start = pos;
    while pos < chars.len() && chars[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == digits_start {
        return Err(ParseError::new("unsupported character '-'", start, source));
    }
    if pos < chars.len() && is_ident_start(chars[pos]) {
        return Err(ParseError::new(
            format!("unexpected character '{}' after number", chars[pos]),
            pos,
            source,
        ));
    }

    let literal: String = chars[start..pos].iter().collect();
    let value = literal
        .parse::<i64>()
        .map_err(|_| ParseError::new(format!("integer '{literal}' is out of range"), start, source))?;
    Ok((value, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenize_reference_with_accessors() {
        assert_eq!(
            kinds("steps.build.output['files'][-1]"),
            vec![
                TokenKind::Ident("steps".to_string()),
                TokenKind::Dot,
                TokenKind::Ident("build".to_string()),
                TokenKind::Dot,
                TokenKind::Ident("output".to_string()),
                TokenKind::LBracket,
                TokenKind::Str("files".to_string()),
                TokenKind::RBracket,
                TokenKind::LBracket,
                TokenKind::Int(-1),
                TokenKind::RBracket,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_keywords_and_offsets() {
        let tokens = tokenize("not inputs.a or item").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Not);
        assert_eq!(tokens[0].offset, 0);
        assert_eq!(tokens[4].kind, TokenKind::Or);
        assert_eq!(tokens[4].offset, 13);
        assert_eq!(tokens.last().unwrap().offset, 20);
    }

    #[test]
    fn test_tokenize_hyphenated_identifier() {
        assert_eq!(
            kinds("steps.gather-news"),
            vec![
                TokenKind::Ident("steps".to_string()),
                TokenKind::Dot,
                TokenKind::Ident("gather-news".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_double_quoted_string_with_escape() {
        assert_eq!(
            kinds(r#"["a \"b\""]"#),
            vec![
                TokenKind::LBracket,
                TokenKind::Str("a \"b\"".to_string()),
                TokenKind::RBracket,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_rejects_unsupported_character() {
        let err = tokenize("inputs.a == 1").unwrap_err();
        assert_eq!(err.offset, 9);
        assert!(err.message.contains("unsupported character '='"), "got: {err}");
    }

    #[test]
    fn test_tokenize_rejects_unterminated_string() {
        let err = tokenize("item['oops").unwrap_err();
        assert_eq!(err.offset, 5);
        assert!(err.message.contains("unterminated"), "got: {err}");
    }

    #[test]
    fn test_tokenize_rejects_lone_minus() {
        let err = tokenize("item[-]").unwrap_err();
        assert_eq!(err.offset, 5);
    }
}
