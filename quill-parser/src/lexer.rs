// quill-parser - Lexer for Quill
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Lexer (tokeniser) for Quill source code.
//!
//! Converts a source string into a stream of tokens. The lexer keeps one
//! token of lookahead (`peek`) in addition to the current token, which is
//! all the recursive-descent parser needs.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

/// What kind of token was scanned.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Nil,
    True,
    False,
    Number(f64),
    Str(String),
    Ident(String),

    // Keywords
    Let,
    Fn,
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    Return,
    Yield,

    // Operators
    Plus,     // +
    Minus,    // -
    Star,     // *
    Slash,    // /
    Percent,  // %
    Caret,    // ^
    EqEq,     // ==
    BangEq,   // !=
    Lt,       // <
    LtEq,     // <=
    Gt,       // >
    GtEq,     // >=
    AmpAmp,   // &&
    PipePipe, // ||
    Bang,     // !
    Eq,       // =
    PlusEq,   // +=
    MinusEq,  // -=
    StarEq,   // *=
    SlashEq,  // /=

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,

    // Special
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Nil => write!(f, "nil"),
            TokenKind::True => write!(f, "true"),
            TokenKind::False => write!(f, "false"),
            TokenKind::Number(n) => write!(f, "{}", n),
            TokenKind::Str(s) => write!(f, "\"{}\"", s),
            TokenKind::Ident(s) => write!(f, "{}", s),
            TokenKind::Let => write!(f, "let"),
            TokenKind::Fn => write!(f, "fn"),
            TokenKind::If => write!(f, "if"),
            TokenKind::Else => write!(f, "else"),
            TokenKind::While => write!(f, "while"),
            TokenKind::For => write!(f, "for"),
            TokenKind::Break => write!(f, "break"),
            TokenKind::Continue => write!(f, "continue"),
            TokenKind::Return => write!(f, "return"),
            TokenKind::Yield => write!(f, "yield"),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::Caret => write!(f, "^"),
            TokenKind::EqEq => write!(f, "=="),
            TokenKind::BangEq => write!(f, "!="),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::LtEq => write!(f, "<="),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::GtEq => write!(f, ">="),
            TokenKind::AmpAmp => write!(f, "&&"),
            TokenKind::PipePipe => write!(f, "||"),
            TokenKind::Bang => write!(f, "!"),
            TokenKind::Eq => write!(f, "="),
            TokenKind::PlusEq => write!(f, "+="),
            TokenKind::MinusEq => write!(f, "-="),
            TokenKind::StarEq => write!(f, "*="),
            TokenKind::SlashEq => write!(f, "/="),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::LBrace => write!(f, "{{"),
            TokenKind::RBrace => write!(f, "}}"),
            TokenKind::LBracket => write!(f, "["),
            TokenKind::RBracket => write!(f, "]"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

/// A token with its source position (1-indexed line and column).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

/// Lexer error with position information.
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lex error at {}:{}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for LexError {}

/// The lexer converts source code into tokens.
pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: u32,
    column: u32,
    peeked: Option<Token>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source code.
    pub fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            peeked: None,
        }
    }

    /// Get the next token, consuming it.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        if let Some(tok) = self.peeked.take() {
            return Ok(tok);
        }
        self.scan_token()
    }

    /// Look at the next token without consuming it.
    pub fn peek_token(&mut self) -> Result<&Token, LexError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.scan_token()?);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek_char() {
                Some(' ') | Some('\r') | Some('\t') | Some('\n') => {
                    self.advance();
                }
                Some('/') => {
                    // Look ahead without committing to consuming the slash.
                    let mut clone = self.chars.clone();
                    clone.next();
                    match clone.peek() {
                        Some('/') => {
                            while let Some(c) = self.peek_char() {
                                if c == '\n' {
                                    break;
                                }
                                self.advance();
                            }
                        }
                        Some('*') => {
                            let (line, column) = (self.line, self.column);
                            self.advance(); // /
                            self.advance(); // *
                            let mut closed = false;
                            while let Some(c) = self.advance() {
                                if c == '*' && self.peek_char() == Some('/') {
                                    self.advance();
                                    closed = true;
                                    break;
                                }
                            }
                            if !closed {
                                return Err(LexError {
                                    message: "Unterminated block comment".into(),
                                    line,
                                    column,
                                });
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace_and_comments()?;

        let line = self.line;
        let column = self.column;
        let make = |kind| Token { kind, line, column };

        let c = match self.advance() {
            Some(c) => c,
            None => return Ok(make(TokenKind::Eof)),
        };

        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '^' => TokenKind::Caret,
            '%' => TokenKind::Percent,

            '+' => {
                if self.match_char('=') {
                    TokenKind::PlusEq
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.match_char('=') {
                    TokenKind::MinusEq
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.match_char('=') {
                    TokenKind::StarEq
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if self.match_char('=') {
                    TokenKind::SlashEq
                } else {
                    TokenKind::Slash
                }
            }

            '!' => {
                if self.match_char('=') {
                    TokenKind::BangEq
                } else {
                    TokenKind::Bang
                }
            }
            '=' => {
                if self.match_char('=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            '<' => {
                if self.match_char('=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.match_char('=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }

            '&' => {
                if self.match_char('&') {
                    TokenKind::AmpAmp
                } else {
                    return Err(LexError {
                        message: "Unexpected character '&'".into(),
                        line,
                        column,
                    });
                }
            }
            '|' => {
                if self.match_char('|') {
                    TokenKind::PipePipe
                } else {
                    return Err(LexError {
                        message: "Unexpected character '|'".into(),
                        line,
                        column,
                    });
                }
            }

            '"' => return self.scan_string(line, column),
            '0'..='9' => return self.scan_number(c, line, column),
            c if c.is_ascii_alphabetic() || c == '_' => {
                return Ok(self.scan_identifier(c, line, column));
            }

            other => {
                return Err(LexError {
                    message: format!("Unexpected character '{}'", other),
                    line,
                    column,
                });
            }
        };

        Ok(make(kind))
    }

    fn scan_string(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        let mut text = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(LexError {
                        message: "Unterminated string".into(),
                        line,
                        column,
                    });
                }
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some(other) => text.push(other),
                    None => {
                        return Err(LexError {
                            message: "Unterminated string".into(),
                            line,
                            column,
                        });
                    }
                },
                Some(c) => text.push(c),
            }
        }
        Ok(Token {
            kind: TokenKind::Str(text),
            line,
            column,
        })
    }

    fn scan_number(&mut self, first: char, line: u32, column: u32) -> Result<Token, LexError> {
        let mut text = String::new();
        text.push(first);

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        // Decimal part: only if the dot is followed by a digit, so that
        // `1.foo` still lexes as number, dot, identifier.
        if self.peek_char() == Some('.') {
            let mut clone = self.chars.clone();
            clone.next();
            if clone.peek().is_some_and(|c| c.is_ascii_digit()) {
                text.push('.');
                self.advance();
                while let Some(c) = self.peek_char() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        // Exponent part.
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            let mut clone = self.chars.clone();
            clone.next();
            let next = clone.peek().copied();
            let has_digits = match next {
                Some('+') | Some('-') => {
                    clone.next();
                    clone.peek().is_some_and(|c| c.is_ascii_digit())
                }
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if has_digits {
                text.push(self.advance().unwrap()); // e / E
                if matches!(self.peek_char(), Some('+') | Some('-')) {
                    text.push(self.advance().unwrap());
                }
                while let Some(c) = self.peek_char() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        let value: f64 = text.parse().map_err(|_| LexError {
            message: format!("Invalid number literal '{}'", text),
            line,
            column,
        })?;

        Ok(Token {
            kind: TokenKind::Number(value),
            line,
            column,
        })
    }

    fn scan_identifier(&mut self, first: char, line: u32, column: u32) -> Token {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = match text.as_str() {
            "nil" => TokenKind::Nil,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "let" => TokenKind::Let,
            "fn" => TokenKind::Fn,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "return" => TokenKind::Return,
            "yield" => TokenKind::Yield,
            _ => TokenKind::Ident(text),
        };

        Token { kind, line, column }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().expect("lex error");
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_numbers() {
        assert_eq!(
            kinds("1 2.5 1e3 2.5e-2"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Number(2.5),
                TokenKind::Number(1e3),
                TokenKind::Number(2.5e-2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn number_dot_ident() {
        // `1.x` must not swallow the dot.
        assert_eq!(
            kinds("1.x"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Dot,
                TokenKind::Ident("x".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_strings_with_escapes() {
        assert_eq!(
            kinds(r#""a\nb""#),
            vec![TokenKind::Str("a\nb".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn unterminated_string_reports_position() {
        let mut lexer = Lexer::new("  \"oops");
        let err = lexer.next_token().unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 3);
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("let letx fn yield"),
            vec![
                TokenKind::Let,
                TokenKind::Ident("letx".into()),
                TokenKind::Fn,
                TokenKind::Yield,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn compound_operators() {
        assert_eq!(
            kinds("+= -= *= /= == != <= >= && ||"),
            vec![
                TokenKind::PlusEq,
                TokenKind::MinusEq,
                TokenKind::StarEq,
                TokenKind::SlashEq,
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_whitespace() {
        assert_eq!(
            kinds("1 // line\n/* block\nstill */ 2"),
            vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Eof]
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lexer = Lexer::new("a b");
        assert_eq!(
            lexer.peek_token().unwrap().kind,
            TokenKind::Ident("a".into())
        );
        assert_eq!(
            lexer.next_token().unwrap().kind,
            TokenKind::Ident("a".into())
        );
        assert_eq!(
            lexer.next_token().unwrap().kind,
            TokenKind::Ident("b".into())
        );
    }
}
