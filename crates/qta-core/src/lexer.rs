//! Tokenizer for the stanza-structured `.qta` source format (spec §2/§4.2,
//! component 4: parser front end). Produces a flat token stream with
//! line/column positions; the parser decides which identifiers are keywords.

use rust_decimal::Decimal;

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    String(String),
    Number(Decimal),
    // symbols
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    EqEq,
    Ne,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src: src.as_bytes(), pos: 0, line: 1, column: 1 }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, Vec<ParseError>> {
        let mut tokens = Vec::new();
        let mut errors = Vec::new();

        loop {
            self.skip_whitespace_and_comments();
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek() else {
                tokens.push(Token { kind: TokenKind::Eof, line, column });
                break;
            };

            let kind = if c == b'"' {
                match self.read_string() {
                    Ok(s) => TokenKind::String(s),
                    Err(msg) => {
                        errors.push(ParseError::new(line, column, msg));
                        continue;
                    }
                }
            } else if c.is_ascii_digit() {
                match self.read_number() {
                    Ok(n) => TokenKind::Number(n),
                    Err(msg) => {
                        errors.push(ParseError::new(line, column, msg));
                        continue;
                    }
                }
            } else if is_ident_start(c) {
                TokenKind::Ident(self.read_ident())
            } else {
                match self.read_symbol() {
                    Ok(kind) => kind,
                    Err(msg) => {
                        errors.push(ParseError::new(line, column, msg));
                        self.advance();
                        continue;
                    }
                }
            };

            tokens.push(Token { kind, line, column });
        }

        if errors.is_empty() {
            Ok(tokens)
        } else {
            Err(errors)
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn read_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                self.advance();
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn read_string(&mut self) -> Result<String, String> {
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.advance() {
                Some(b'"') => return Ok(out),
                Some(c) => out.push(c as char),
                None => return Err("unterminated string literal".to_string()),
            }
        }
    }

    fn read_number(&mut self) -> Result<Decimal, String> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        text.parse::<Decimal>().map_err(|e| format!("invalid number literal '{text}': {e}"))
    }

    fn read_symbol(&mut self) -> Result<TokenKind, String> {
        let c = self.advance().expect("caller checked peek");
        Ok(match c {
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'^' => TokenKind::Caret,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b',' => TokenKind::Comma,
            b'%' => TokenKind::Ident("%".to_string()),
            b'<' => {
                if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            b'=' => {
                if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            b'!' => {
                if self.peek() == Some(b'=') {
                    self.advance();
                    TokenKind::Ne
                } else {
                    return Err("expected '!=' after '!'".to_string());
                }
            }
            other => return Err(format!("unexpected character '{}'", other as char)),
        })
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_identifiers_strings_and_numbers() {
        let got = kinds(r#"start policy "Kigali HFC phasedown" set sales to 50 %"#);
        assert_eq!(
            got,
            vec![
                TokenKind::Ident("start".into()),
                TokenKind::Ident("policy".into()),
                TokenKind::String("Kigali HFC phasedown".into()),
                TokenKind::Ident("set".into()),
                TokenKind::Ident("sales".into()),
                TokenKind::Ident("to".into()),
                TokenKind::Number(Decimal::new(50, 0)),
                TokenKind::Ident("%".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_comments() {
        let got = kinds("set sales to 5 # trailing comment\nenable manufacture");
        assert!(got.contains(&TokenKind::Ident("enable".into())));
        assert!(!got.iter().any(|k| matches!(k, TokenKind::Ident(s) if s.contains("trailing"))));
    }

    #[test]
    fn tracks_line_and_column() {
        let tokens = Lexer::new("a\nb").tokenize().unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[1].column, 1);
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = Lexer::new(r#"set sales to "never closes"#).tokenize().unwrap_err();
        assert!(!err.is_empty());
    }
}
