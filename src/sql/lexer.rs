//! # SQL Lexer
//!
//! Zero-copy tokenizer for the SQL dialect. Identifier and number tokens
//! borrow directly from the input; string literals are unescaped into owned
//! buffers only when an escape actually occurs. Keywords resolve through a
//! compile-time perfect hash map, so lookup is O(1) with no collisions.
//!
//! ## Token Categories
//!
//! - **Keywords**: reserved words of the dialect (`SELECT`, `WHERE`, ...)
//! - **Identifiers**: bare (`books`) or double-quoted (`"order"`)
//! - **Literals**: strings (`'it''s'`), integers, floats
//! - **Punctuation**: `( ) , * + . ;` and comparison operators
//!
//! Every token carries the line and column it started at; parse errors
//! point there.

use std::borrow::Cow;

use phf::phf_map;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Select,
    Update,
    Delete,
    Truncate,
    Explain,
    From,
    Where,
    Set,
    And,
    Or,
    Not,
    In,
    Range,
    Allset,
    Like,
    Is,
    Null,
    Empty,
    Order,
    By,
    Asc,
    Desc,
    Limit,
    Offset,
    Join,
    Inner,
    Left,
    On,
    Merge,
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Facet,
    Distinct,
    True,
    False,
    Dwithin,
    Point,
    Field,
}

pub static KEYWORDS: phf::Map<&'static str, Keyword> = phf_map! {
    "SELECT" => Keyword::Select,
    "UPDATE" => Keyword::Update,
    "DELETE" => Keyword::Delete,
    "TRUNCATE" => Keyword::Truncate,
    "EXPLAIN" => Keyword::Explain,
    "FROM" => Keyword::From,
    "WHERE" => Keyword::Where,
    "SET" => Keyword::Set,
    "AND" => Keyword::And,
    "OR" => Keyword::Or,
    "NOT" => Keyword::Not,
    "IN" => Keyword::In,
    "RANGE" => Keyword::Range,
    "ALLSET" => Keyword::Allset,
    "LIKE" => Keyword::Like,
    "IS" => Keyword::Is,
    "NULL" => Keyword::Null,
    "EMPTY" => Keyword::Empty,
    "ORDER" => Keyword::Order,
    "BY" => Keyword::By,
    "ASC" => Keyword::Asc,
    "DESC" => Keyword::Desc,
    "LIMIT" => Keyword::Limit,
    "OFFSET" => Keyword::Offset,
    "JOIN" => Keyword::Join,
    "INNER" => Keyword::Inner,
    "LEFT" => Keyword::Left,
    "ON" => Keyword::On,
    "MERGE" => Keyword::Merge,
    "COUNT" => Keyword::Count,
    "SUM" => Keyword::Sum,
    "AVG" => Keyword::Avg,
    "MIN" => Keyword::Min,
    "MAX" => Keyword::Max,
    "FACET" => Keyword::Facet,
    "DISTINCT" => Keyword::Distinct,
    "TRUE" => Keyword::True,
    "FALSE" => Keyword::False,
    "DWITHIN" => Keyword::Dwithin,
    "POINT" => Keyword::Point,
    "FIELD" => Keyword::Field,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    Keyword(Keyword),
    Ident(&'a str),
    Str(Cow<'a, str>),
    Int(i64),
    Float(f64),
    Punct(&'a str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub line: u32,
    pub col: u32,
    /// Byte offset of the token start in the input.
    pub offset: usize,
}

impl Token<'_> {
    pub fn is_keyword(&self, kw: Keyword) -> bool {
        self.kind == TokenKind::Keyword(kw)
    }

    pub fn is_punct(&self, p: &str) -> bool {
        matches!(&self.kind, TokenKind::Punct(s) if *s == p)
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Keyword(k) => format!("keyword {k:?}"),
            TokenKind::Ident(s) => format!("identifier '{s}'"),
            TokenKind::Str(s) => format!("string '{s}'"),
            TokenKind::Int(v) => format!("number {v}"),
            TokenKind::Float(v) => format!("number {v}"),
            TokenKind::Punct(p) => format!("'{p}'"),
            TokenKind::Eof => "end of query".to_string(),
        }
    }
}

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn error_at(&self, token: &Token<'_>, msg: impl AsRef<str>) -> Error {
        Error::parse(format!(
            "{} at line {}, column {}",
            msg.as_ref(),
            token.line,
            token.col
        ))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.input[self.pos..].chars().next()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    /// Tokenize the whole input up front; the parser and the suggester both
    /// want lookahead over a finished token list.
    pub fn tokenize(mut self) -> Result<Vec<Token<'a>>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if eof {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token<'a>> {
        self.skip_whitespace();
        let (line, col, offset) = (self.line, self.col, self.pos);
        let token = |kind| Token {
            kind,
            line,
            col,
            offset,
        };

        let Some(c) = self.peek() else {
            return Ok(token(TokenKind::Eof));
        };

        if c.is_ascii_digit() || (c == '-' && self.second_is_digit()) {
            return Ok(token(self.lex_number()?));
        }
        if c == '\'' {
            return Ok(token(self.lex_string(line, col)?));
        }
        if c == '"' {
            return Ok(token(self.lex_quoted_ident(line, col)?));
        }
        if c.is_alphanumeric() || c == '_' || c == '@' || c == '#' {
            return Ok(token(self.lex_word()));
        }

        // Punctuation, longest operators first.
        for op in ["<=", ">=", "<>", "!=", "=="] {
            if self.input[self.pos..].starts_with(op) {
                self.bump();
                self.bump();
                return Ok(token(TokenKind::Punct(op)));
            }
        }
        let start = self.pos;
        self.bump();
        Ok(token(TokenKind::Punct(&self.input[start..self.pos])))
    }

    fn second_is_digit(&self) -> bool {
        let mut it = self.input[self.pos..].chars();
        it.next();
        it.next().is_some_and(|c| c.is_ascii_digit())
    }

    fn lex_word(&mut self) -> TokenKind<'a> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '+' | '@' | '#' | '*'))
        {
            self.bump();
        }
        let word = &self.input[start..self.pos];
        if let Some(&kw) = KEYWORDS.get(word.to_ascii_uppercase().as_str()) {
            return TokenKind::Keyword(kw);
        }
        TokenKind::Ident(word)
    }

    fn lex_number(&mut self) -> Result<TokenKind<'a>> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {
                    self.bump();
                }
                '.' | 'e' | 'E' => {
                    is_float = true;
                    self.bump();
                    if matches!(self.peek(), Some('+') | Some('-')) {
                        self.bump();
                    }
                }
                _ => break,
            }
        }
        let text = &self.input[start..self.pos];
        if is_float {
            text.parse()
                .map(TokenKind::Float)
                .map_err(|_| Error::parse(format!("invalid number '{text}'")))
        } else {
            text.parse()
                .map(TokenKind::Int)
                .map_err(|_| Error::parse(format!("invalid number '{text}'")))
        }
    }

    fn lex_string(&mut self, line: u32, col: u32) -> Result<TokenKind<'a>> {
        self.bump();
        let start = self.pos;
        let mut owned: Option<String> = None;
        let mut seg_start = start;
        loop {
            match self.peek() {
                None => {
                    return Err(Error::parse(format!(
                        "unterminated string literal at line {line}, column {col}"
                    )))
                }
                Some('\'') => {
                    let end = self.pos;
                    self.bump();
                    // '' escapes a single quote.
                    if self.peek() == Some('\'') {
                        let text = owned.get_or_insert_with(String::new);
                        text.push_str(&self.input[seg_start..end]);
                        text.push('\'');
                        self.bump();
                        seg_start = self.pos;
                    } else {
                        return Ok(match owned {
                            Some(mut s) => {
                                s.push_str(&self.input[seg_start..end]);
                                TokenKind::Str(Cow::Owned(s))
                            }
                            None => TokenKind::Str(Cow::Borrowed(&self.input[start..end])),
                        });
                    }
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    fn lex_quoted_ident(&mut self, line: u32, col: u32) -> Result<TokenKind<'a>> {
        self.bump();
        let start = self.pos;
        loop {
            match self.peek() {
                None => {
                    return Err(Error::parse(format!(
                        "unterminated quoted identifier at line {line}, column {col}"
                    )))
                }
                Some('"') => {
                    let end = self.pos;
                    self.bump();
                    return Ok(TokenKind::Ident(&self.input[start..end]));
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind<'_>> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let toks = kinds("select FROM WhErE");
        assert_eq!(toks[0], TokenKind::Keyword(Keyword::Select));
        assert_eq!(toks[1], TokenKind::Keyword(Keyword::From));
        assert_eq!(toks[2], TokenKind::Keyword(Keyword::Where));
    }

    #[test]
    fn numbers_and_strings() {
        let toks = kinds("42 -7 3.25 'it''s'");
        assert_eq!(toks[0], TokenKind::Int(42));
        assert_eq!(toks[1], TokenKind::Int(-7));
        assert_eq!(toks[2], TokenKind::Float(3.25));
        assert_eq!(toks[3], TokenKind::Str(Cow::Owned("it's".to_string())));
    }

    #[test]
    fn multi_char_operators() {
        let toks = kinds("a >= 1 AND b <> 2");
        assert!(matches!(toks[1], TokenKind::Punct(">=")));
        assert!(matches!(toks[4], TokenKind::Punct("<>")));
    }

    #[test]
    fn positions_track_lines() {
        let toks = Lexer::new("SELECT *\nFROM books").tokenize().unwrap();
        let from = toks.iter().find(|t| t.is_keyword(Keyword::From)).unwrap();
        assert_eq!(from.line, 2);
        assert_eq!(from.col, 1);
    }

    #[test]
    fn unterminated_string_is_parse_error() {
        assert!(Lexer::new("'abc").tokenize().is_err());
    }
}
