//! Stack-machine IR and the lowering from the resolved AST.
//!
//! Every instruction has a fixed effect on the evaluation stack, so the depth
//! at each program point is known statically. [`verify`] replays those
//! effects before any text is emitted.

use log::{debug, trace};

use crate::error::{CompileError, CompileResult, Position};
use crate::parser::{BinaryOp, Block, DictId, Expr, FunctionLiteral, Ident, Literal, Stmt, Target};
use crate::resolver::{BindingPath, FrameLayout, Resolution};
use crate::tables::{ExternTable, StringTable};

/// How a `for` loop walks its iterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterKind {
  /// Literal dictionary: follow the entry chain inline.
  Dict,
  /// Literal string: one-character strings, byte by byte.
  Str,
  /// Decided at run time from the object tag.
  Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
  Dynamic,
  /// The callee is statically known to be this external symbol.
  External { name: String, arity: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
  PushNumber(i64),
  PushString(String),
  PushBool(bool),
  PushFunction(String),
  MakeDict {
    pairs: usize,
    id: Option<DictId>,
  },
  IndexGet,
  IndexSet,
  Call {
    argc: usize,
    target: CallTarget,
    position: Position,
  },
  Return,
  /// Push the function object of an external's trampoline.
  DeclareExternal {
    name: String,
    arity: usize,
  },
  RawAsm(String),
  LoadBinding(BindingPath),
  StoreBinding(BindingPath),
  Binary(BinaryOp),
  Pop,
  /// Replace the iterable on top with `[iterable, cursor]`.
  IterBegin(IterKind),
  LoopHead(usize),
  /// Push the next element, or leave the loop when exhausted.
  IterNext {
    kind: IterKind,
    exit: usize,
  },
  Jump(usize),
  /// Exit label of a loop; drops the iterator state.
  IterEnd(usize),
}

impl Instr {
  /// Words consumed from the top of the stack.
  pub fn pops(&self) -> usize {
    match self {
      Instr::PushNumber(_)
      | Instr::PushString(_)
      | Instr::PushBool(_)
      | Instr::PushFunction(_)
      | Instr::DeclareExternal { .. }
      | Instr::RawAsm(_)
      | Instr::LoadBinding(_)
      | Instr::LoopHead(_)
      | Instr::IterNext { .. }
      | Instr::Jump(_) => 0,
      Instr::Return | Instr::StoreBinding(_) | Instr::Pop | Instr::IterBegin(_) => 1,
      Instr::IndexGet | Instr::Binary(_) | Instr::IterEnd(_) => 2,
      Instr::IndexSet => 3,
      Instr::MakeDict { pairs, .. } => 2 * pairs,
      Instr::Call { argc, .. } => argc + 1,
    }
  }

  /// Words left on the stack afterwards.
  pub fn pushes(&self) -> usize {
    match self {
      Instr::Return
      | Instr::StoreBinding(_)
      | Instr::Pop
      | Instr::IndexSet
      | Instr::LoopHead(_)
      | Instr::Jump(_)
      | Instr::IterEnd(_) => 0,
      Instr::IterBegin(_) => 2,
      _ => 1,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionKind {
  /// The module body.
  Entry,
  Literal,
  /// Trampoline for a native symbol; the body is empty.
  External { symbol: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
  pub label: String,
  pub params: Vec<String>,
  pub body: Vec<Instr>,
  pub kind: FunctionKind,
  pub layout: FrameLayout,
  pub position: Position,
}

impl Function {
  pub fn is_external(&self) -> bool {
    matches!(self.kind, FunctionKind::External { .. })
  }

  /// Static object holding this function's code address.
  pub fn object_label(&self) -> String {
    object_label(&self.label)
  }
}

/// A lowered compilation unit.
#[derive(Debug)]
pub struct Program {
  /// Entry first, then function literals by id, then trampolines.
  pub functions: Vec<Function>,
  pub strings: StringTable,
  pub externs: ExternTable,
  pub globals: Vec<String>,
  pub cells: usize,
}

pub const ENTRY_LABEL: &str = "main";

pub fn function_label(id: usize) -> String {
  format!("uro_fn_{id}")
}

/// Static object holding the code address `code`.
pub fn object_label(code: &str) -> String {
  format!("{code}_obj")
}

#[derive(Default)]
struct Builder {
  strings: StringTable,
  externs: ExternTable,
  literals: Vec<(usize, Function)>,
}

struct FunctionBuilder {
  code: Vec<Instr>,
  loops: usize,
}

impl FunctionBuilder {
  fn new() -> Self {
    Self {
      code: Vec::new(),
      loops: 0,
    }
  }

  fn push(&mut self, instr: Instr) {
    self.code.push(instr);
  }

  /// Close the body with the implicit `return False`.
  fn finish(mut self) -> Vec<Instr> {
    self.code.push(Instr::PushBool(false));
    self.code.push(Instr::Return);
    self.code
  }
}

/// Lower a resolved program. The tree is consumed.
pub fn build(program: Block, resolution: &Resolution) -> CompileResult<Program> {
  let mut builder = Builder::default();
  let position = program.position;

  let mut entry = FunctionBuilder::new();
  builder.lower_block(&mut entry, program)?;
  let mut functions = Vec::with_capacity(1 + resolution.functions + builder.externs.len());
  functions.push(Function {
    label: ENTRY_LABEL.to_string(),
    params: Vec::new(),
    body: entry.finish(),
    kind: FunctionKind::Entry,
    layout: FrameLayout::default(),
    position,
  });

  let mut literals = std::mem::take(&mut builder.literals);
  literals.sort_by_key(|(id, _)| *id);
  functions.extend(literals.into_iter().map(|(_, function)| function));

  functions.extend(builder.externs.iter().map(|symbol| Function {
    label: symbol.trampoline(),
    params: (0..symbol.arity).map(|i| format!("arg{i}")).collect(),
    body: Vec::new(),
    kind: FunctionKind::External {
      symbol: symbol.name.clone(),
    },
    layout: FrameLayout::default(),
    position: symbol.position,
  }));

  for function in &functions {
    trace!(
      "ir {}: {} params, {} instructions",
      function.label,
      function.params.len(),
      function.body.len()
    );
  }
  debug!(
    "built {} functions, {} strings, {} externals",
    functions.len(),
    builder.strings.len(),
    builder.externs.len()
  );

  Ok(Program {
    functions,
    strings: builder.strings,
    externs: builder.externs,
    globals: resolution.globals.clone(),
    cells: resolution.cells,
  })
}

fn path_of(ident: &Ident) -> CompileResult<BindingPath> {
  ident
    .resolved
    .as_ref()
    .map(|resolved| resolved.path.clone())
    .ok_or_else(|| {
      CompileError::codegen(
        ident.position,
        format!("`{}` reached lowering unresolved", ident.name),
      )
    })
}

impl Builder {
  fn lower_block(&mut self, f: &mut FunctionBuilder, block: Block) -> CompileResult<()> {
    for stmt in block.stmts {
      self.lower_stmt(f, stmt)?;
    }
    Ok(())
  }

  fn lower_stmt(&mut self, f: &mut FunctionBuilder, stmt: Stmt) -> CompileResult<()> {
    match stmt {
      Stmt::Expr(expr) => {
        self.lower_expr(f, expr)?;
        f.push(Instr::Pop);
      }
      Stmt::Assign {
        target: Target::Name(ident),
        value,
        ..
      } => {
        self.lower_expr(f, value)?;
        f.push(Instr::StoreBinding(path_of(&ident)?));
      }
      Stmt::Assign {
        target: Target::Index { target, key },
        value,
        ..
      } => {
        self.lower_expr(f, *target)?;
        self.lower_expr(f, *key)?;
        self.lower_expr(f, value)?;
        f.push(Instr::IndexSet);
      }
      Stmt::Return { value, .. } => {
        match value {
          Some(value) => self.lower_expr(f, value)?,
          None => f.push(Instr::PushBool(false)),
        }
        f.push(Instr::Return);
      }
      Stmt::ForIn {
        binding,
        iterable,
        body,
        ..
      } => {
        let kind = match &iterable {
          Expr::Dict { .. } => IterKind::Dict,
          Expr::Literal {
            value: Literal::Str { .. },
            ..
          } => IterKind::Str,
          _ => IterKind::Dynamic,
        };
        let n = f.loops;
        f.loops += 1;

        self.lower_expr(f, iterable)?;
        f.push(Instr::IterBegin(kind));
        f.push(Instr::LoopHead(n));
        f.push(Instr::IterNext { kind, exit: n });
        f.push(Instr::StoreBinding(path_of(&binding)?));
        self.lower_block(f, body)?;
        f.push(Instr::Jump(n));
        f.push(Instr::IterEnd(n));
      }
    }
    Ok(())
  }

  fn lower_expr(&mut self, f: &mut FunctionBuilder, expr: Expr) -> CompileResult<()> {
    match expr {
      Expr::Literal { value, .. } => match value {
        Literal::Number(n) => f.push(Instr::PushNumber(n)),
        Literal::Bool(b) => f.push(Instr::PushBool(b)),
        Literal::Str { value, .. } => {
          let label = self.strings.intern(&value);
          f.push(Instr::PushString(label));
        }
      },
      Expr::Ident(ident) => f.push(Instr::LoadBinding(path_of(&ident)?)),
      Expr::Dict { entries, id, .. } => {
        let pairs = entries.len();
        for (key, value) in entries {
          self.lower_expr(f, key)?;
          self.lower_expr(f, value)?;
        }
        f.push(Instr::MakeDict { pairs, id });
      }
      Expr::Index { target, key, .. } => {
        self.lower_expr(f, *target)?;
        self.lower_expr(f, *key)?;
        f.push(Instr::IndexGet);
      }
      Expr::Call {
        callee,
        args,
        position,
      } => {
        let target = match &*callee {
          Expr::Ident(ident) => match ident.resolved.as_ref().and_then(|r| r.external.as_ref()) {
            Some(external) => CallTarget::External {
              name: external.name.clone(),
              arity: external.arity,
            },
            None => CallTarget::Dynamic,
          },
          Expr::Extern { name, arity, .. } => CallTarget::External {
            name: name.clone(),
            arity: *arity,
          },
          _ => CallTarget::Dynamic,
        };
        let argc = args.len();
        self.lower_expr(f, *callee)?;
        for arg in args {
          self.lower_expr(f, arg)?;
        }
        f.push(Instr::Call {
          argc,
          target,
          position,
        });
      }
      Expr::Function(function) => {
        let label = self.lower_function(*function)?;
        f.push(Instr::PushFunction(label));
      }
      Expr::Binary { op, lhs, rhs, .. } => {
        self.lower_expr(f, *lhs)?;
        self.lower_expr(f, *rhs)?;
        f.push(Instr::Binary(op));
      }
      Expr::Extern {
        name,
        arity,
        position,
      } => {
        self.externs.declare(&name, arity, position)?;
        f.push(Instr::DeclareExternal { name, arity });
      }
      Expr::InlineAsm { text, .. } => f.push(Instr::RawAsm(text)),
    }
    Ok(())
  }

  fn lower_function(&mut self, function: FunctionLiteral) -> CompileResult<String> {
    let Some(id) = function.id else {
      return Err(CompileError::codegen(
        function.position,
        "function literal reached lowering without an id",
      ));
    };
    let label = function_label(id.0);

    let mut body = FunctionBuilder::new();
    self.lower_block(&mut body, function.body)?;
    self.literals.push((
      id.0,
      Function {
        label: label.clone(),
        params: function.params.into_iter().map(|param| param.name).collect(),
        body: body.finish(),
        kind: FunctionKind::Literal,
        layout: function.layout.unwrap_or_default(),
        position: function.position,
      },
    ));
    Ok(label)
  }
}

/// Replay the stack effects of `function`, rejecting anything whose depth is
/// not statically balanced.
pub fn verify(function: &Function) -> CompileResult<()> {
  let imbalance = |message: String| {
    CompileError::codegen(
      function.position,
      format!("stack imbalance in {}: {message}", function.label),
    )
  };

  let mut depth = 0usize;
  let mut heads: Vec<Option<usize>> = Vec::new();
  for (pc, instr) in function.body.iter().enumerate() {
    match instr {
      Instr::LoopHead(n) => {
        if heads.len() <= *n {
          heads.resize(n + 1, None);
        }
        heads[*n] = Some(depth);
        continue;
      }
      Instr::Jump(n) | Instr::IterEnd(n) => {
        let head = heads
          .get(*n)
          .copied()
          .flatten()
          .ok_or_else(|| imbalance(format!("loop {n} has no head at {pc}")))?;
        if let Instr::Jump(_) = instr
          && depth != head
        {
          return Err(imbalance(format!(
            "loop {n} body leaves {depth} words, expected {head}"
          )));
        }
        // The exit label is reached from IterNext at the head depth.
        depth = head;
      }
      Instr::Return if depth == 0 => {
        return Err(imbalance(format!("return without a value at {pc}")));
      }
      _ => {}
    }

    let pops = instr.pops();
    if depth < pops {
      return Err(imbalance(format!(
        "{instr:?} at {pc} needs {pops} words, only {depth} available"
      )));
    }
    depth = depth - pops + instr.pushes();
  }

  if depth != 0 {
    return Err(imbalance(format!("{depth} words left at the end")));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser::parse;
  use crate::resolver::resolve;
  use crate::tokenizer::tokenize;

  fn lower(source: &str) -> Program {
    let mut block = parse(tokenize(source).unwrap(), source).unwrap();
    let resolution = resolve(&mut block).unwrap();
    build(block, &resolution).unwrap()
  }

  #[test]
  fn module_body_is_the_entry_function() {
    let program = lower("x = 1;");
    let entry = &program.functions[0];
    assert_eq!(entry.label, "main");
    assert_eq!(entry.kind, FunctionKind::Entry);
    assert_eq!(
      entry.body,
      [
        Instr::PushNumber(1),
        Instr::StoreBinding(BindingPath::Global("x".into())),
        Instr::PushBool(false),
        Instr::Return,
      ]
    );
  }

  #[test]
  fn calls_push_callee_before_arguments() {
    let program = lower("f = fn(a, b) { return a; }; f(1, 2);");
    let body = &program.functions[0].body;
    let call = body
      .iter()
      .position(|instr| matches!(instr, Instr::Call { .. }))
      .unwrap();
    assert_eq!(
      body[call - 3..call],
      [
        Instr::LoadBinding(BindingPath::Global("f".into())),
        Instr::PushNumber(1),
        Instr::PushNumber(2),
      ]
    );
    assert_eq!(body[call + 1], Instr::Pop);
  }

  #[test]
  fn dispatch_is_dict_index_call() {
    let program = lower("f = fn() { return 1; }; g = fn() { return 2; }; {True: f, False: g}[1 == 1]();");
    let body = &program.functions[0].body;
    assert!(body.contains(&Instr::MakeDict {
      pairs: 2,
      id: Some(DictId(0))
    }));
    assert!(body.contains(&Instr::IndexGet));
    assert!(body.iter().any(|i| matches!(i, Instr::Call { argc: 0, .. })));
  }

  #[test]
  fn loops_pick_a_specialised_iterator() {
    let program = lower("for k in {a: 1} { x = k; }; for c in 'ab' { y = c; }; for v in x { z = v; };");
    let kinds: Vec<_> = program.functions[0]
      .body
      .iter()
      .filter_map(|instr| match instr {
        Instr::IterBegin(kind) => Some(*kind),
        _ => None,
      })
      .collect();
    assert_eq!(kinds, [IterKind::Dict, IterKind::Str, IterKind::Dynamic]);
    verify(&program.functions[0]).unwrap();
  }

  #[test]
  fn functions_are_ordered_by_first_occurrence() {
    let program = lower("a = fn() { b = fn() { return 1; }; return b; }; c = fn() { return 2; };");
    let labels: Vec<_> = program.functions.iter().map(|f| f.label.as_str()).collect();
    assert_eq!(labels, ["main", "uro_fn_0", "uro_fn_1", "uro_fn_2"]);
    for function in &program.functions {
      verify(function).unwrap();
    }
  }

  #[test]
  fn externs_become_trampoline_functions() {
    let program = lower("puts = extern('puts', 1); puts('hi'); puts('hi');");
    let last = program.functions.last().unwrap();
    assert_eq!(last.label, "uro_extern_puts");
    assert!(last.is_external());
    assert_eq!(last.params.len(), 1);
    assert_eq!(program.strings.len(), 1);
    let call = program.functions[0]
      .body
      .iter()
      .find(|instr| matches!(instr, Instr::Call { .. }))
      .unwrap();
    assert!(matches!(
      call,
      Instr::Call {
        target: CallTarget::External { arity: 1, .. },
        ..
      }
    ));
  }

  #[test]
  fn verify_rejects_underflow_and_leftovers() {
    let mut function = lower("x = 1;").functions.remove(0);
    function.body.insert(0, Instr::Pop);
    assert!(verify(&function).is_err());

    let mut function = lower("x = 1;").functions.remove(0);
    function.body.insert(0, Instr::PushNumber(3));
    let err = verify(&function).unwrap_err();
    assert!(err.to_string().contains("1 words left at the end"));
  }

  #[test]
  fn verify_rejects_unbalanced_loop_body() {
    let mut function = lower("for k in {a: 1} { x = k; };").functions.remove(0);
    let jump = function
      .body
      .iter()
      .position(|instr| matches!(instr, Instr::Jump(_)))
      .unwrap();
    function.body.insert(jump, Instr::PushNumber(1));
    let err = verify(&function).unwrap_err();
    assert!(err.to_string().contains("loop 0 body leaves"));
  }

  #[test]
  fn return_inside_a_loop_is_balanced() {
    let program = lower("f = fn(d) { for k in d { return k; }; };");
    verify(&program.functions[1]).unwrap();
  }
}
