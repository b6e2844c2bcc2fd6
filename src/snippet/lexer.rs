use crate::errors::ExecutionError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Let,
    If,
    Else,
    While,
    Return,
    True,
    False,
    Null,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Dot,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset into the original section content
    pub offset: usize,
}

/// Splits snippet source into tokens. `base` is added to every offset so
/// expressions lifted out of markup tags still point into the section.
pub fn tokenize(source: &str, base: usize) -> Result<Vec<Token>, ExecutionError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c == '/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        let start = i;

        if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let text = &source[start..i];
            let value = text.parse::<f64>().map_err(|_| ExecutionError::Syntax {
                offset: base + start,
                message: format!("invalid number literal '{}'", text),
            })?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                offset: base + start,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            let word = &source[start..i];
            let kind = match word {
                "let" | "const" | "var" => TokenKind::Let,
                "if" => TokenKind::If,
                "else" => TokenKind::Else,
                "while" => TokenKind::While,
                "return" => TokenKind::Return,
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                "null" | "undefined" => TokenKind::Null,
                _ => TokenKind::Ident(word.to_string()),
            };
            tokens.push(Token {
                kind,
                offset: base + start,
            });
            continue;
        }

        if c == '"' || c == '\'' {
            let (value, next) = read_string(source, i, c, base)?;
            tokens.push(Token {
                kind: TokenKind::Str(value),
                offset: base + start,
            });
            i = next;
            continue;
        }

        let two = source.get(i..i + 2).unwrap_or("");
        let three = source.get(i..i + 3).unwrap_or("");
        let (kind, width) = match (three, two, c) {
            ("===", _, _) => (TokenKind::EqEq, 3),
            ("!==", _, _) => (TokenKind::NotEq, 3),
            (_, "==", _) => (TokenKind::EqEq, 2),
            (_, "!=", _) => (TokenKind::NotEq, 2),
            (_, "<=", _) => (TokenKind::Le, 2),
            (_, ">=", _) => (TokenKind::Ge, 2),
            (_, "&&", _) => (TokenKind::AndAnd, 2),
            (_, "||", _) => (TokenKind::OrOr, 2),
            (_, _, '(') => (TokenKind::LParen, 1),
            (_, _, ')') => (TokenKind::RParen, 1),
            (_, _, '{') => (TokenKind::LBrace, 1),
            (_, _, '}') => (TokenKind::RBrace, 1),
            (_, _, '[') => (TokenKind::LBracket, 1),
            (_, _, ']') => (TokenKind::RBracket, 1),
            (_, _, ',') => (TokenKind::Comma, 1),
            (_, _, ';') => (TokenKind::Semi, 1),
            (_, _, '.') => (TokenKind::Dot, 1),
            (_, _, '?') => (TokenKind::Question, 1),
            (_, _, ':') => (TokenKind::Colon, 1),
            (_, _, '+') => (TokenKind::Plus, 1),
            (_, _, '-') => (TokenKind::Minus, 1),
            (_, _, '*') => (TokenKind::Star, 1),
            (_, _, '/') => (TokenKind::Slash, 1),
            (_, _, '%') => (TokenKind::Percent, 1),
            (_, _, '!') => (TokenKind::Bang, 1),
            (_, _, '=') => (TokenKind::Assign, 1),
            (_, _, '<') => (TokenKind::Lt, 1),
            (_, _, '>') => (TokenKind::Gt, 1),
            _ => {
                let ch = source[i..].chars().next().unwrap_or(c);
                return Err(ExecutionError::Syntax {
                    offset: base + i,
                    message: format!("unexpected character '{}'", ch),
                });
            }
        };
        tokens.push(Token {
            kind,
            offset: base + start,
        });
        i += width;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: base + source.len(),
    });
    Ok(tokens)
}

fn read_string(
    source: &str,
    open: usize,
    quote: char,
    base: usize,
) -> Result<(String, usize), ExecutionError> {
    let mut value = String::new();
    let mut chars = source[open + 1..].char_indices();

    while let Some((idx, ch)) = chars.next() {
        if ch == quote {
            return Ok((value, open + 1 + idx + ch.len_utf8()));
        }
        if ch == '\\' {
            match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, other)) => value.push(other),
                None => break,
            }
            continue;
        }
        value.push(ch);
    }

    Err(ExecutionError::Syntax {
        offset: base + open,
        message: "unterminated string literal".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source, 0)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn tokenizes_statement() {
        assert_eq!(
            kinds("let total = price * 2;"),
            vec![
                TokenKind::Let,
                TokenKind::Ident("total".to_string()),
                TokenKind::Assign,
                TokenKind::Ident("price".to_string()),
                TokenKind::Star,
                TokenKind::Number(2.0),
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn strict_equality_is_plain_equality() {
        assert_eq!(
            kinds("a === 'x'"),
            vec![
                TokenKind::Ident("a".to_string()),
                TokenKind::EqEq,
                TokenKind::Str("x".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_line_comments() {
        assert_eq!(kinds("// note\nx"), vec![TokenKind::Ident("x".to_string()), TokenKind::Eof]);
    }

    #[test]
    fn offsets_include_base() {
        let tokens = tokenize("name", 10).unwrap();
        assert_eq!(tokens[0].offset, 10);
    }

    #[test]
    fn unterminated_string_is_syntax_error() {
        assert!(matches!(
            tokenize("\"open", 0),
            Err(ExecutionError::Syntax { offset: 0, .. })
        ));
    }

    #[test]
    fn escapes_in_strings() {
        assert_eq!(
            kinds(r#""a\"b\n""#),
            vec![TokenKind::Str("a\"b\n".to_string()), TokenKind::Eof]
        );
    }
}
