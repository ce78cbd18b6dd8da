//! Shared error utilities used across the compilation pipeline.
//!
//! Every phase reports through [`CompileError`], so the driver can print one
//! diagnostic naming the phase, the line and the column. [`CompileError::render`]
//! adds the offending source line with a caret under the failing character.

use std::fmt;
use std::path::PathBuf;

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

/// A point in the source text. Lines and columns are 1-based; columns count
/// characters, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
  pub offset: usize,
  pub line: usize,
  pub column: usize,
}

impl Position {
  pub fn new(offset: usize, line: usize, column: usize) -> Self {
    Self {
      offset,
      line,
      column,
    }
  }

  /// Recompute line and column for a byte offset into `source`.
  pub fn locate(source: &str, offset: usize) -> Self {
    let mut safe = offset.min(source.len());
    while !source.is_char_boundary(safe) {
      safe -= 1;
    }
    let before = &source[..safe];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    let column = before[line_start..].chars().count() + 1;
    Self::new(safe, line, column)
  }
}

impl Default for Position {
  fn default() -> Self {
    Self::new(0, 1, 1)
  }
}

impl fmt::Display for Position {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.line, self.column)
  }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CompileError {
  #[snafu(display("lex error at {position}: {message}"))]
  Lex { position: Position, message: String },

  #[snafu(display("parse error at {position}: {message}"))]
  Parse { position: Position, message: String },

  #[snafu(display("resolve error at {position}: {message}"))]
  Resolve { position: Position, message: String },

  #[snafu(display("codegen error at {position}: {message}"))]
  Codegen { position: Position, message: String },

  #[snafu(display("failed to read {}: {source}", path.display()))]
  ReadSource {
    path: PathBuf,
    source: std::io::Error,
  },

  #[snafu(display("failed to write assembly: {source}"))]
  WriteOutput { source: std::io::Error },
}

impl CompileError {
  pub fn lex(position: Position, message: impl Into<String>) -> Self {
    Self::Lex {
      position,
      message: message.into(),
    }
  }

  pub fn parse(position: Position, message: impl Into<String>) -> Self {
    Self::Parse {
      position,
      message: message.into(),
    }
  }

  pub fn resolve(position: Position, message: impl Into<String>) -> Self {
    Self::Resolve {
      position,
      message: message.into(),
    }
  }

  pub fn codegen(position: Position, message: impl Into<String>) -> Self {
    Self::Codegen {
      position,
      message: message.into(),
    }
  }

  /// Name of the pipeline phase that failed.
  pub fn phase(&self) -> &'static str {
    match self {
      Self::Lex { .. } => "lex",
      Self::Parse { .. } => "parse",
      Self::Resolve { .. } => "resolve",
      Self::Codegen { .. } => "codegen",
      Self::ReadSource { .. } | Self::WriteOutput { .. } => "io",
    }
  }

  pub fn position(&self) -> Option<Position> {
    match self {
      Self::Lex { position, .. }
      | Self::Parse { position, .. }
      | Self::Resolve { position, .. }
      | Self::Codegen { position, .. } => Some(*position),
      Self::ReadSource { .. } | Self::WriteOutput { .. } => None,
    }
  }

  /// The message, then the offending source line with a caret under the
  /// failing column.
  pub fn render(&self, source: &str) -> String {
    let Some(position) = self.position() else {
      return self.to_string();
    };
    let line_text = source
      .lines()
      .nth(position.line.saturating_sub(1))
      .unwrap_or("");
    let marker = format!("{}^", " ".repeat(position.column.saturating_sub(1)));
    format!("{self}\n{line_text}\n{marker}")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn locate_counts_lines_and_characters() {
    let source = "a = 1;\nbé = 'x';";
    let position = Position::locate(source, source.find('=').unwrap());
    assert_eq!((position.line, position.column), (1, 3));

    let second = source.rfind('=').unwrap();
    let position = Position::locate(source, second);
    assert_eq!((position.line, position.column), (2, 4));
  }

  #[test]
  fn render_points_at_the_column() {
    let source = "x = 1;\ny = $;";
    let err = CompileError::lex(Position::locate(source, 11), "illegal character '$'");
    assert_eq!(
      err.render(source),
      "lex error at 2:5: illegal character '$'\ny = $;\n    ^"
    );
    assert_eq!(err.phase(), "lex");
  }
}
