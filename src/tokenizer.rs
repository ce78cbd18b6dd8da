//! Lexical analysis: turns the raw input string into a lazy stream of tokens.
//!
//! The lexer knows nothing about grammar beyond recognising punctuators,
//! keywords and literals. Multi-character punctuators are matched before
//! single-character ones to avoid ambiguity. Comments never reach the parser;
//! `##` doc comments are kept on the side as metadata.

use log::trace;

use crate::error::{CompileError, CompileResult, Position};
use crate::ty::MAX_NUMBER;

/// Kinds of tokens recognised by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
  Ident,
  Num,
  Str,
  Bool,
  Punctuator,
  Keyword,
  Eof,
}

/// Decoded payload of a literal token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValue {
  None,
  Number(i64),
  Str(String),
  Bool(bool),
}

/// Thin wrapper for lexical information needed by later stages.
#[derive(Debug, Clone)]
pub struct Token {
  pub kind: TokenKind,
  pub value: TokenValue,
  pub position: Position,
  pub len: usize,
}

impl Token {
  pub fn new(kind: TokenKind, position: Position, len: usize, value: TokenValue) -> Self {
    Self {
      kind,
      value,
      position,
      len,
    }
  }

  pub fn loc(&self) -> usize {
    self.position.offset
  }
}

/// Text of a `##` comment, with the line it appeared on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocComment {
  pub line: usize,
  pub text: String,
}

pub const KEYWORDS: [&str; 6] = ["fn", "for", "in", "return", "extern", "asm"];

const PUNCTUATORS: [u8; 15] = [
  b'{', b'}', b'[', b']', b'(', b')', b',', b':', b';', b'=', b'+', b'-', b'*', b'<', b'>',
];

/// Streaming lexer. Yields tokens up to and including `Eof`, or stops after the
/// first error; it cannot be restarted.
pub struct Lexer<'a> {
  source: &'a str,
  pos: usize,
  line: usize,
  line_start: usize,
  finished: bool,
  doc_comments: Vec<DocComment>,
}

impl<'a> Lexer<'a> {
  pub fn new(source: &'a str) -> Self {
    Self {
      source,
      pos: 0,
      line: 1,
      line_start: 0,
      finished: false,
      doc_comments: Vec::new(),
    }
  }

  /// Doc comments seen so far, in source order.
  pub fn doc_comments(&self) -> &[DocComment] {
    &self.doc_comments
  }

  fn position_at(&self, offset: usize) -> Position {
    let column = self.source[self.line_start..offset].chars().count() + 1;
    Position::new(offset, self.line, column)
  }

  fn error_at(&self, offset: usize, message: impl Into<String>) -> CompileError {
    CompileError::lex(self.position_at(offset), message)
  }

  /// Skip whitespace and comments, keeping line bookkeeping up to date.
  fn skip_trivia(&mut self) {
    let bytes = self.source.as_bytes();
    while self.pos < bytes.len() {
      match bytes[self.pos] {
        b'\n' => {
          self.pos += 1;
          self.line += 1;
          self.line_start = self.pos;
        }
        c if c.is_ascii_whitespace() => self.pos += 1,
        b'#' => {
          let end = self.source[self.pos..]
            .find('\n')
            .map_or(self.source.len(), |idx| self.pos + idx);
          let comment = &self.source[self.pos..end];
          if let Some(text) = comment.strip_prefix("##") {
            self.doc_comments.push(DocComment {
              line: self.line,
              text: text.trim().to_string(),
            });
          }
          self.pos = end;
        }
        _ => break,
      }
    }
  }

  fn scan(&mut self) -> CompileResult<Token> {
    self.skip_trivia();

    let bytes = self.source.as_bytes();
    let start = self.pos;
    if start >= bytes.len() {
      return Ok(Token::new(
        TokenKind::Eof,
        self.position_at(start),
        0,
        TokenValue::None,
      ));
    }

    let c = bytes[start];
    if c.is_ascii_digit() {
      return self.scan_number(start);
    }
    if c.is_ascii_alphabetic() || c == b'_' {
      return Ok(self.scan_word(start));
    }
    if c == b'\'' || c == b'"' {
      return self.scan_string(start, c);
    }

    if self.source[start..].starts_with("==") {
      self.pos += 2;
      return Ok(Token::new(
        TokenKind::Punctuator,
        self.position_at(start),
        2,
        TokenValue::None,
      ));
    }

    if PUNCTUATORS.contains(&c) {
      self.pos += 1;
      return Ok(Token::new(
        TokenKind::Punctuator,
        self.position_at(start),
        1,
        TokenValue::None,
      ));
    }

    let invalid_char = self.source[start..].chars().next().unwrap_or('\0');
    Err(self.error_at(start, format!("illegal character '{invalid_char}'")))
  }

  fn scan_number(&mut self, start: usize) -> CompileResult<Token> {
    let bytes = self.source.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
      i += 1;
    }
    let text = &self.source[start..i];
    let value = text
      .parse::<i64>()
      .ok()
      .filter(|value| *value <= MAX_NUMBER)
      .ok_or_else(|| self.error_at(start, format!("number literal {text} is out of range")))?;
    self.pos = i;
    Ok(Token::new(
      TokenKind::Num,
      self.position_at(start),
      i - start,
      TokenValue::Number(value),
    ))
  }

  fn scan_word(&mut self, start: usize) -> Token {
    let bytes = self.source.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
      i += 1;
    }
    self.pos = i;
    let word = &self.source[start..i];
    let (kind, value) = match word {
      "True" => (TokenKind::Bool, TokenValue::Bool(true)),
      "False" => (TokenKind::Bool, TokenValue::Bool(false)),
      _ if KEYWORDS.contains(&word) => (TokenKind::Keyword, TokenValue::None),
      _ => (TokenKind::Ident, TokenValue::None),
    };
    Token::new(kind, self.position_at(start), i - start, value)
  }

  fn scan_string(&mut self, start: usize, quote: u8) -> CompileResult<Token> {
    let bytes = self.source.as_bytes();
    let mut text = String::new();
    let mut i = start + 1;
    loop {
      let Some(&b) = bytes.get(i) else {
        return Err(self.error_at(start, "unterminated string literal"));
      };
      match b {
        b'\n' => return Err(self.error_at(start, "unterminated string literal")),
        b'\\' => {
          let escaped = match bytes.get(i + 1) {
            Some(b'n') => '\n',
            Some(b't') => '\t',
            Some(b'\\') => '\\',
            Some(b'\'') => '\'',
            Some(b'"') => '"',
            None | Some(b'\n') => {
              return Err(self.error_at(start, "unterminated string literal"));
            }
            Some(_) => {
              let got = self.source[i + 1..].chars().next().unwrap_or('\0');
              return Err(self.error_at(i, format!("unknown escape sequence '\\{got}'")));
            }
          };
          text.push(escaped);
          i += 2;
        }
        _ if b == quote => break,
        _ => {
          let ch = self.source[i..].chars().next().unwrap_or('\0');
          text.push(ch);
          i += ch.len_utf8();
        }
      }
    }
    self.pos = i + 1;
    Ok(Token::new(
      TokenKind::Str,
      self.position_at(start),
      self.pos - start,
      TokenValue::Str(text),
    ))
  }
}

impl Iterator for Lexer<'_> {
  type Item = CompileResult<Token>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    let result = self.scan();
    match &result {
      Ok(token) if token.kind != TokenKind::Eof => {
        trace!("token {:?} {:?}", token.kind, token_text(token, self.source));
      }
      _ => self.finished = true,
    }
    Some(result)
  }
}

impl std::iter::FusedIterator for Lexer<'_> {}

/// Lex the input into a flat vector of tokens terminated by an `Eof` marker.
pub fn tokenize(input: &str) -> CompileResult<Vec<Token>> {
  Lexer::new(input).collect()
}

/// Return the slice from the source that produced this token.
pub fn token_text<'a>(token: &Token, source: &'a str) -> &'a str {
  let end = token.loc() + token.len;
  &source[token.loc()..end]
}

/// Human-friendly description used in diagnostics.
pub fn describe_token(token: Option<&Token>, source: &str) -> String {
  match token {
    Some(t) => match t.kind {
      TokenKind::Eof => "EOF".to_string(),
      _ => token_text(t, source).to_string(),
    },
    None => "EOF".to_string(),
  }
}
