//! Name resolution: classify every identifier as Local, Captured or Global.
//!
//! Each scope (the module, or one function literal) owns every name assigned
//! anywhere in its own body. Straight-line code must assign a name before it
//! reads it, but function bodies are resolved only once their enclosing scope
//! has been walked completely, so a body may refer to names (itself included)
//! that the enclosing scope assigns later.
//!
//! There are no runtime closures. A function-level binding that some inner
//! function reads is moved into a static capture cell, and every reference to
//! it, in the defining function too, goes through that cell.

use std::collections::HashMap;

use log::debug;

use crate::error::{CompileError, CompileResult};
use crate::parser::{
  Block, DictId, Expr, FunctionId, FunctionLiteral, Ident, Literal, LiteralId, Stmt, Target,
};

/// Index into the binding table, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingClass {
  Local,
  Captured,
  Global,
}

/// Where a binding lives at run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingPath {
  /// Argument `index` of a function called with `arity` arguments.
  Param { index: usize, arity: usize },
  /// Frame slot below the saved frame pointer.
  Slot(usize),
  /// Static capture cell.
  Cell(usize),
  /// Module-scope symbol.
  Global(String),
}

impl BindingPath {
  pub fn class(&self) -> BindingClass {
    match self {
      BindingPath::Param { .. } | BindingPath::Slot(_) => BindingClass::Local,
      BindingPath::Cell(_) => BindingClass::Captured,
      BindingPath::Global(_) => BindingClass::Global,
    }
  }
}

/// An external symbol a binding is statically known to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRef {
  pub name: String,
  pub arity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
  pub class: BindingClass,
  pub path: BindingPath,
  pub external: Option<ExternalRef>,
}

/// Frame shape of one function literal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
  /// Local slots reserved below the frame pointer.
  pub slots: usize,
  /// Parameters copied into capture cells by the prologue, as `(param, cell)`.
  pub param_cells: Vec<(usize, usize)>,
  /// Every capture cell this function defines, in binding order.
  pub owned_cells: Vec<usize>,
}

/// Summary of a resolved compilation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
  /// Module-scope symbols in first-assignment order.
  pub globals: Vec<String>,
  pub cells: usize,
  pub functions: usize,
}

struct Binding {
  name: String,
  owner: Option<FunctionId>,
  param: Option<(usize, usize)>,
  defined: bool,
  captured: bool,
  assignments: usize,
  external: Option<ExternalRef>,
}

struct Scope {
  function: Option<FunctionId>,
  names: HashMap<String, BindingId>,
}

struct Finalized {
  paths: Vec<BindingPath>,
  layouts: Vec<FrameLayout>,
}

#[derive(Default)]
struct Resolver {
  bindings: Vec<Binding>,
  scopes: Vec<Scope>,
  functions: usize,
  dicts: usize,
  strings: usize,
}

/// Resolve every identifier in `program`, stamping binding classes, literal
/// identities and frame layouts onto the tree.
pub fn resolve(program: &mut Block) -> CompileResult<Resolution> {
  let mut resolver = Resolver::default();
  resolver.scopes.push(Scope {
    function: None,
    names: HashMap::new(),
  });
  resolver.predeclare(program);

  let mut pending = Vec::new();
  resolver.walk_block(program, &mut pending)?;
  for function in pending {
    resolver.resolve_function(function)?;
  }

  let finalized = resolver.finalize();
  resolver.stamp_block(program, &finalized);

  let resolution = Resolution {
    globals: resolver
      .bindings
      .iter()
      .filter(|binding| binding.owner.is_none())
      .map(|binding| binding.name.clone())
      .collect(),
    cells: finalized
      .paths
      .iter()
      .filter(|path| matches!(path, BindingPath::Cell(_)))
      .count(),
    functions: resolver.functions,
  };
  debug!(
    "resolved {} bindings: {} globals, {} capture cells, {} functions",
    resolver.bindings.len(),
    resolution.globals.len(),
    resolution.cells,
    resolution.functions
  );
  Ok(resolution)
}

impl Resolver {
  fn current(&self) -> &Scope {
    &self.scopes[self.scopes.len() - 1]
  }

  fn declare(&mut self, name: &str, param: Option<(usize, usize)>) -> BindingId {
    let id = BindingId(self.bindings.len());
    let owner = self.current().function;
    self.bindings.push(Binding {
      name: name.to_string(),
      owner,
      param,
      defined: param.is_some(),
      captured: false,
      assignments: 0,
      external: None,
    });
    let depth = self.scopes.len() - 1;
    self.scopes[depth].names.insert(name.to_string(), id);
    id
  }

  /// Declare every name the scope's own statements assign, in order of first
  /// appearance. Nested function literals are separate scopes and skipped.
  fn predeclare(&mut self, block: &Block) {
    for stmt in &block.stmts {
      match stmt {
        Stmt::Assign {
          target: Target::Name(ident),
          ..
        } => self.predeclare_name(&ident.name),
        Stmt::ForIn { binding, body, .. } => {
          self.predeclare_name(&binding.name);
          self.predeclare(body);
        }
        Stmt::Assign { .. } | Stmt::Expr(_) | Stmt::Return { .. } => {}
      }
    }
  }

  fn predeclare_name(&mut self, name: &str) {
    if !self.current().names.contains_key(name) {
      self.declare(name, None);
    }
  }

  fn resolve_function(&mut self, function: &mut FunctionLiteral) -> CompileResult<()> {
    self.scopes.push(Scope {
      function: function.id,
      names: HashMap::new(),
    });

    let arity = function.params.len();
    for (index, param) in function.params.iter().enumerate() {
      if self.current().names.contains_key(&param.name) {
        return Err(CompileError::resolve(
          param.position,
          format!("duplicate parameter `{}`", param.name),
        ));
      }
      self.declare(&param.name, Some((index, arity)));
    }
    self.predeclare(&function.body);

    let mut pending = Vec::new();
    self.walk_block(&mut function.body, &mut pending)?;
    for nested in pending {
      self.resolve_function(nested)?;
    }

    self.scopes.pop();
    Ok(())
  }

  fn walk_block<'a>(
    &mut self,
    block: &'a mut Block,
    pending: &mut Vec<&'a mut FunctionLiteral>,
  ) -> CompileResult<()> {
    for stmt in block.stmts.iter_mut() {
      self.walk_stmt(stmt, pending)?;
    }
    Ok(())
  }

  fn walk_stmt<'a>(
    &mut self,
    stmt: &'a mut Stmt,
    pending: &mut Vec<&'a mut FunctionLiteral>,
  ) -> CompileResult<()> {
    match stmt {
      Stmt::Expr(expr) => self.walk_expr(expr, pending),
      Stmt::Assign {
        target: Target::Name(ident),
        value,
        ..
      } => {
        let external = match &*value {
          Expr::Extern { name, arity, .. } => Some(ExternalRef {
            name: name.clone(),
            arity: *arity,
          }),
          _ => None,
        };
        self.walk_expr(value, pending)?;
        self.assign(ident, external);
        Ok(())
      }
      Stmt::Assign {
        target: Target::Index { target, key },
        value,
        ..
      } => {
        self.walk_expr(target, pending)?;
        self.walk_expr(key, pending)?;
        self.walk_expr(value, pending)
      }
      Stmt::Return { value, position } => {
        if self.current().function.is_none() {
          return Err(CompileError::resolve(
            *position,
            "`return` outside of a function",
          ));
        }
        match value {
          Some(value) => self.walk_expr(value, pending),
          None => Ok(()),
        }
      }
      Stmt::ForIn {
        binding,
        iterable,
        body,
        ..
      } => {
        self.walk_expr(iterable, pending)?;
        self.assign(binding, None);
        self.walk_block(body, pending)
      }
    }
  }

  fn walk_expr<'a>(
    &mut self,
    expr: &'a mut Expr,
    pending: &mut Vec<&'a mut FunctionLiteral>,
  ) -> CompileResult<()> {
    match expr {
      Expr::Literal {
        value: Literal::Str { id, .. },
        ..
      } => {
        *id = Some(LiteralId(self.strings));
        self.strings += 1;
      }
      Expr::Literal { .. } | Expr::Extern { .. } | Expr::InlineAsm { .. } => {}
      Expr::Ident(ident) => self.reference(ident)?,
      Expr::Dict { entries, id, .. } => {
        *id = Some(DictId(self.dicts));
        self.dicts += 1;
        for (key, value) in entries.iter_mut() {
          self.walk_expr(key, pending)?;
          self.walk_expr(value, pending)?;
        }
      }
      Expr::Index { target, key, .. } => {
        self.walk_expr(target, pending)?;
        self.walk_expr(key, pending)?;
      }
      Expr::Call { callee, args, .. } => {
        self.walk_expr(callee, pending)?;
        for arg in args.iter_mut() {
          self.walk_expr(arg, pending)?;
        }
      }
      Expr::Binary { lhs, rhs, .. } => {
        self.walk_expr(lhs, pending)?;
        self.walk_expr(rhs, pending)?;
      }
      Expr::Function(function) => {
        function.id = Some(FunctionId(self.functions));
        self.functions += 1;
        pending.push(&mut **function);
      }
    }
    Ok(())
  }

  /// Record a store to a name of the current scope.
  fn assign(&mut self, ident: &mut Ident, external: Option<ExternalRef>) {
    let id = match self.current().names.get(&ident.name) {
      Some(&id) => id,
      None => self.declare(&ident.name, None),
    };
    let binding = &mut self.bindings[id.0];
    binding.defined = true;
    binding.assignments += 1;
    binding.external = external;
    ident.binding = Some(id);
  }

  /// Look a read reference up through the enclosing scopes.
  fn reference(&mut self, ident: &mut Ident) -> CompileResult<()> {
    let depth = self.scopes.len() - 1;
    let found = self
      .scopes
      .iter()
      .enumerate()
      .rev()
      .find_map(|(level, scope)| scope.names.get(&ident.name).map(|&id| (level, id)));

    let Some((level, id)) = found else {
      return Err(CompileError::resolve(
        ident.position,
        format!("unbound identifier `{}`", ident.name),
      ));
    };

    let binding = &mut self.bindings[id.0];
    if level == depth && !binding.defined {
      return Err(CompileError::resolve(
        ident.position,
        format!("`{}` is used before it is assigned", ident.name),
      ));
    }
    if level != depth && binding.owner.is_some() {
      binding.captured = true;
    }
    ident.binding = Some(id);
    Ok(())
  }

  fn finalize(&self) -> Finalized {
    let mut layouts = vec![FrameLayout::default(); self.functions];
    let mut cells = 0;
    let paths = self
      .bindings
      .iter()
      .map(|binding| match (binding.owner, binding.param) {
        (None, _) => BindingPath::Global(binding.name.clone()),
        (Some(owner), param) if binding.captured => {
          let cell = cells;
          cells += 1;
          layouts[owner.0].owned_cells.push(cell);
          if let Some((index, _)) = param {
            layouts[owner.0].param_cells.push((index, cell));
          }
          BindingPath::Cell(cell)
        }
        (Some(_), Some((index, arity))) => BindingPath::Param { index, arity },
        (Some(owner), None) => {
          let slot = layouts[owner.0].slots;
          layouts[owner.0].slots += 1;
          BindingPath::Slot(slot)
        }
      })
      .collect();
    Finalized { paths, layouts }
  }

  fn resolved(&self, id: BindingId, finalized: &Finalized) -> Resolved {
    let binding = &self.bindings[id.0];
    let path = finalized.paths[id.0].clone();
    let external = binding
      .external
      .clone()
      .filter(|_| binding.assignments == 1 && binding.param.is_none());
    Resolved {
      class: path.class(),
      path,
      external,
    }
  }

  fn stamp_ident(&self, ident: &mut Ident, finalized: &Finalized) {
    if let Some(id) = ident.binding {
      ident.resolved = Some(self.resolved(id, finalized));
    }
  }

  fn stamp_block(&self, block: &mut Block, finalized: &Finalized) {
    for stmt in block.stmts.iter_mut() {
      match stmt {
        Stmt::Expr(expr) => self.stamp_expr(expr, finalized),
        Stmt::Assign { target, value, .. } => {
          match target {
            Target::Name(ident) => self.stamp_ident(ident, finalized),
            Target::Index { target, key } => {
              self.stamp_expr(target, finalized);
              self.stamp_expr(key, finalized);
            }
          }
          self.stamp_expr(value, finalized);
        }
        Stmt::Return { value, .. } => {
          if let Some(value) = value {
            self.stamp_expr(value, finalized);
          }
        }
        Stmt::ForIn {
          binding,
          iterable,
          body,
          ..
        } => {
          self.stamp_ident(binding, finalized);
          self.stamp_expr(iterable, finalized);
          self.stamp_block(body, finalized);
        }
      }
    }
  }

  fn stamp_expr(&self, expr: &mut Expr, finalized: &Finalized) {
    match expr {
      Expr::Literal { .. } | Expr::Extern { .. } | Expr::InlineAsm { .. } => {}
      Expr::Ident(ident) => self.stamp_ident(ident, finalized),
      Expr::Dict { entries, .. } => {
        for (key, value) in entries.iter_mut() {
          self.stamp_expr(key, finalized);
          self.stamp_expr(value, finalized);
        }
      }
      Expr::Index { target, key, .. } => {
        self.stamp_expr(target, finalized);
        self.stamp_expr(key, finalized);
      }
      Expr::Call { callee, args, .. } => {
        self.stamp_expr(callee, finalized);
        for arg in args.iter_mut() {
          self.stamp_expr(arg, finalized);
        }
      }
      Expr::Binary { lhs, rhs, .. } => {
        self.stamp_expr(lhs, finalized);
        self.stamp_expr(rhs, finalized);
      }
      Expr::Function(function) => {
        if let Some(id) = function.id {
          function.layout = finalized.layouts.get(id.0).cloned();
        }
        self.stamp_block(&mut function.body, finalized);
      }
    }
  }
}
