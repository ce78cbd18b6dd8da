//! Recursive-descent parser producing the statement/expression AST.
//!
//! One source file is one [`Block`]. Expressions follow a small precedence
//! ladder (comparison, sum, product, unary, postfix, primary); statements are
//! always terminated by `;`, including `for` loops. Function literals are
//! plain expressions whose bodies are parsed eagerly; names inside them are
//! left unresolved until the resolver runs.

use log::debug;

use crate::error::{CompileError, CompileResult, Position};
use crate::resolver::{BindingId, FrameLayout, Resolved};
use crate::tokenizer::{Token, TokenKind, TokenValue, describe_token, token_text};

/// Binary operators recognised by the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Eq,
  Lt,
  Gt,
}

/// Identity of a function literal, first-occurrence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub usize);

/// Identity of a dictionary literal, first-occurrence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DictId(pub usize);

/// Identity of a string literal occurrence, first-occurrence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiteralId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
  Number(i64),
  Str { value: String, id: Option<LiteralId> },
  Bool(bool),
}

/// A name reference. `binding` and `resolved` are filled in exactly once by
/// the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
  pub name: String,
  pub position: Position,
  pub binding: Option<BindingId>,
  pub resolved: Option<Resolved>,
}

impl Ident {
  pub fn new(name: impl Into<String>, position: Position) -> Self {
    Self {
      name: name.into(),
      position,
      binding: None,
      resolved: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
  pub name: String,
  pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionLiteral {
  pub params: Vec<Param>,
  pub body: Block,
  pub position: Position,
  pub id: Option<FunctionId>,
  pub layout: Option<FrameLayout>,
}

/// Expression tree produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Literal {
    value: Literal,
    position: Position,
  },
  Ident(Ident),
  Dict {
    entries: Vec<(Expr, Expr)>,
    position: Position,
    id: Option<DictId>,
  },
  Index {
    target: Box<Expr>,
    key: Box<Expr>,
    position: Position,
  },
  Call {
    callee: Box<Expr>,
    args: Vec<Expr>,
    position: Position,
  },
  Function(Box<FunctionLiteral>),
  Binary {
    op: BinaryOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
    position: Position,
  },
  Extern {
    name: String,
    arity: usize,
    position: Position,
  },
  InlineAsm {
    text: String,
    position: Position,
  },
}

impl Expr {
  pub fn position(&self) -> Position {
    match self {
      Expr::Ident(ident) => ident.position,
      Expr::Function(function) => function.position,
      Expr::Literal { position, .. }
      | Expr::Dict { position, .. }
      | Expr::Index { position, .. }
      | Expr::Call { position, .. }
      | Expr::Binary { position, .. }
      | Expr::Extern { position, .. }
      | Expr::InlineAsm { position, .. } => *position,
    }
  }

  fn string(value: impl Into<String>, position: Position) -> Self {
    Expr::Literal {
      value: Literal::Str {
        value: value.into(),
        id: None,
      },
      position,
    }
  }
}

/// Left-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
  Name(Ident),
  Index { target: Box<Expr>, key: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
  Expr(Expr),
  Assign {
    target: Target,
    value: Expr,
    position: Position,
  },
  Return {
    value: Option<Expr>,
    position: Position,
  },
  ForIn {
    binding: Ident,
    iterable: Expr,
    body: Block,
    position: Position,
  },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
  pub stmts: Vec<Stmt>,
  pub position: Position,
}

/// Parse a whole file into its top-level block.
pub fn parse(tokens: Vec<Token>, source: &str) -> CompileResult<Block> {
  let mut stream = TokenStream::new(tokens, source);
  let position = stream.position();

  let mut stmts = Vec::new();
  while !stream.is_eof() {
    stmts.push(parse_stmt(&mut stream)?);
  }

  debug!("parsed {} top-level statements", stmts.len());
  Ok(Block { stmts, position })
}

fn parse_block(stream: &mut TokenStream) -> CompileResult<Block> {
  let position = stream.position();
  stream.skip("{")?;
  let mut stmts = Vec::new();
  while !stream.at("}") {
    if stream.is_eof() {
      return Err(stream.expected("\"}\""));
    }
    stmts.push(parse_stmt(stream)?);
  }
  stream.skip("}")?;
  Ok(Block { stmts, position })
}

fn parse_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  let position = stream.position();

  let stmt = if stream.equal_keyword("return") {
    let value = if stream.at(";") {
      None
    } else {
      Some(parse_expr(stream)?)
    };
    Stmt::Return { value, position }
  } else if stream.equal_keyword("for") {
    let binding = stream.get_ident()?;
    stream.skip_keyword("in")?;
    let iterable = parse_expr(stream)?;
    let body = parse_block(stream)?;
    Stmt::ForIn {
      binding,
      iterable,
      body,
      position,
    }
  } else {
    let expr = parse_expr(stream)?;
    if stream.equal("=") {
      let target = match expr {
        Expr::Ident(ident) => Target::Name(ident),
        Expr::Index { target, key, .. } => Target::Index { target, key },
        other => {
          return Err(CompileError::parse(
            other.position(),
            "left side of '=' must be a name or an index expression",
          ));
        }
      };
      let value = parse_expr(stream)?;
      Stmt::Assign {
        target,
        value,
        position,
      }
    } else {
      Stmt::Expr(expr)
    }
  };

  stream.skip(";")?;
  Ok(stmt)
}

fn parse_expr(stream: &mut TokenStream) -> CompileResult<Expr> {
  parse_comparison(stream)
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
  let position = lhs.position();
  Expr::Binary {
    op,
    lhs: Box::new(lhs),
    rhs: Box::new(rhs),
    position,
  }
}

fn parse_comparison(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_sum(stream)?;

  loop {
    let op = match stream.peek_punctuator() {
      Some("==") => BinaryOp::Eq,
      Some("<") => BinaryOp::Lt,
      Some(">") => BinaryOp::Gt,
      _ => break,
    };
    stream.advance();
    let rhs = parse_sum(stream)?;
    node = binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_sum(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_product(stream)?;

  loop {
    let op = match stream.peek_punctuator() {
      Some("+") => BinaryOp::Add,
      Some("-") => BinaryOp::Sub,
      _ => break,
    };
    stream.advance();
    let rhs = parse_product(stream)?;
    node = binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_product(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_unary(stream)?;

  while stream.equal("*") {
    let rhs = parse_unary(stream)?;
    node = binary(BinaryOp::Mul, node, rhs);
  }

  Ok(node)
}

fn parse_unary(stream: &mut TokenStream) -> CompileResult<Expr> {
  let position = stream.position();
  if stream.equal("-") {
    let operand = parse_unary(stream)?;
    let zero = Expr::Literal {
      value: Literal::Number(0),
      position,
    };
    return Ok(binary(BinaryOp::Sub, zero, operand));
  }

  parse_postfix(stream)
}

fn parse_postfix(stream: &mut TokenStream) -> CompileResult<Expr> {
  let mut node = parse_primary(stream)?;

  loop {
    let position = stream.position();
    if stream.equal("[") {
      let key = parse_expr(stream)?;
      stream.skip("]")?;
      node = Expr::Index {
        target: Box::new(node),
        key: Box::new(key),
        position,
      };
    } else if stream.equal("(") {
      let args = parse_args(stream)?;
      node = Expr::Call {
        callee: Box::new(node),
        args,
        position,
      };
    } else {
      return Ok(node);
    }
  }
}

/// Parse a comma separated argument list; the opening `(` is already consumed.
fn parse_args(stream: &mut TokenStream) -> CompileResult<Vec<Expr>> {
  let mut args = Vec::new();
  if stream.equal(")") {
    return Ok(args);
  }
  loop {
    args.push(parse_expr(stream)?);
    if stream.equal(")") {
      return Ok(args);
    }
    stream.skip(",")?;
  }
}

fn parse_primary(stream: &mut TokenStream) -> CompileResult<Expr> {
  let position = stream.position();

  if stream.equal("(") {
    let node = parse_expr(stream)?;
    stream.skip(")")?;
    return Ok(node);
  }
  if stream.at("{") {
    return parse_dict(stream);
  }
  if stream.equal_keyword("fn") {
    return parse_function(stream, position);
  }
  if stream.equal_keyword("extern") {
    stream.skip("(")?;
    let (name, _) = stream.get_string()?;
    stream.skip(",")?;
    let (arity, arity_pos) = stream.get_number()?;
    stream.skip(")")?;
    let arity = usize::try_from(arity)
      .map_err(|_| CompileError::parse(arity_pos, "extern arity is out of range"))?;
    return Ok(Expr::Extern {
      name,
      arity,
      position,
    });
  }
  if stream.equal_keyword("asm") {
    stream.skip("(")?;
    let (text, _) = stream.get_string()?;
    stream.skip(")")?;
    return Ok(Expr::InlineAsm { text, position });
  }

  if stream.peek_kind() == Some(TokenKind::Ident) {
    return Ok(Expr::Ident(stream.get_ident()?));
  }
  let value = match stream.peek().map(|token| &token.value) {
    Some(TokenValue::Number(n)) => Literal::Number(*n),
    Some(TokenValue::Str(s)) => Literal::Str {
      value: s.clone(),
      id: None,
    },
    Some(TokenValue::Bool(b)) => Literal::Bool(*b),
    _ => return Err(stream.expected("an expression")),
  };
  stream.advance();
  Ok(Expr::Literal { value, position })
}

fn parse_dict(stream: &mut TokenStream) -> CompileResult<Expr> {
  let position = stream.position();
  stream.skip("{")?;

  let mut entries = Vec::new();
  while !stream.equal("}") {
    let key = if stream.peek_kind() == Some(TokenKind::Ident) && stream.peek_is_at(1, ":") {
      let ident = stream.get_ident()?;
      Expr::string(ident.name, ident.position)
    } else {
      parse_expr(stream)?
    };
    stream.skip(":")?;
    let value = parse_expr(stream)?;
    entries.push((key, value));

    if !stream.equal(",") {
      stream.skip("}")?;
      break;
    }
  }

  Ok(Expr::Dict {
    entries,
    position,
    id: None,
  })
}

fn parse_function(stream: &mut TokenStream, position: Position) -> CompileResult<Expr> {
  stream.skip("(")?;
  let mut params = Vec::new();
  if !stream.equal(")") {
    loop {
      let ident = stream.get_ident()?;
      params.push(Param {
        name: ident.name,
        position: ident.position,
      });
      if stream.equal(")") {
        break;
      }
      stream.skip(",")?;
    }
  }
  let body = parse_block(stream)?;

  Ok(Expr::Function(Box::new(FunctionLiteral {
    params,
    body,
    position,
    id: None,
    layout: None,
  })))
}

/// Lightweight cursor over the token vector.
struct TokenStream<'a> {
  tokens: Vec<Token>,
  source: &'a str,
  pos: usize,
}

impl<'a> TokenStream<'a> {
  /// Take ownership of the token stream; the parser will advance `pos` as it consumes input.
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn peek_kind(&self) -> Option<TokenKind> {
    self.peek().map(|token| token.kind)
  }

  fn peek_punctuator(&self) -> Option<&'a str> {
    let source = self.source;
    self
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token_text(token, source))
  }

  fn peek_is_at(&self, ahead: usize, op: &str) -> bool {
    self.tokens.get(self.pos + ahead).is_some_and(|token| {
      token.kind == TokenKind::Punctuator && token_text(token, self.source) == op
    })
  }

  fn advance(&mut self) {
    if self.pos < self.tokens.len() {
      self.pos += 1;
    }
  }

  fn position(&self) -> Position {
    self
      .peek()
      .map(|token| token.position)
      .unwrap_or_else(|| Position::locate(self.source, self.source.len()))
  }

  /// Whether the current token is the given punctuator, without consuming it.
  fn at(&self, op: &str) -> bool {
    self.peek_is_at(0, op)
  }

  /// Consume the current token if it matches the provided punctuator.
  fn equal(&mut self, op: &str) -> bool {
    if self.at(op) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn equal_keyword(&mut self, keyword: &str) -> bool {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Keyword
      && token_text(token, self.source) == keyword
    {
      self.pos += 1;
      return true;
    }
    false
  }

  fn expected(&self, what: &str) -> CompileError {
    let got = describe_token(self.peek(), self.source);
    CompileError::parse(self.position(), format!("expected {what}, but got \"{got}\""))
  }

  fn skip(&mut self, s: &str) -> CompileResult<()> {
    if self.equal(s) {
      Ok(())
    } else {
      Err(self.expected(&format!("\"{s}\"")))
    }
  }

  fn skip_keyword(&mut self, keyword: &str) -> CompileResult<()> {
    if self.equal_keyword(keyword) {
      Ok(())
    } else {
      Err(self.expected(&format!("\"{keyword}\"")))
    }
  }

  /// Parse the current token as an integer literal returning its value and location.
  fn get_number(&mut self) -> CompileResult<(i64, Position)> {
    if let Some(token) = self.peek()
      && let TokenValue::Number(value) = token.value
    {
      let position = token.position;
      self.pos += 1;
      return Ok((value, position));
    }
    Err(self.expected("a number"))
  }

  fn get_string(&mut self) -> CompileResult<(String, Position)> {
    if let Some(token) = self.peek()
      && let TokenValue::Str(value) = &token.value
    {
      let result = (value.clone(), token.position);
      self.pos += 1;
      return Ok(result);
    }
    Err(self.expected("a string"))
  }

  /// Parse the current token as an identifier.
  fn get_ident(&mut self) -> CompileResult<Ident> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Ident
    {
      let ident = Ident::new(token_text(token, self.source), token.position);
      self.pos += 1;
      return Ok(ident);
    }
    Err(self.expected("an identifier"))
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
  }
}
