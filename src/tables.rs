//! Per-compilation tables filled during IR build and flushed by the emitter.
//!
//! Both tables are insertion-ordered so labels depend only on the order in
//! which literals and declarations are first met.

use indexmap::IndexMap;

use crate::error::{CompileError, CompileResult, Position};

/// Native argument registers, in order.
pub const NATIVE_ARGS: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

/// Interned string literals, one data entry per distinct content.
#[derive(Debug, Default)]
pub struct StringTable {
  entries: IndexMap<String, String>,
}

impl StringTable {
  /// Return the label for `value`, allocating one on first sight.
  pub fn intern(&mut self, value: &str) -> String {
    if let Some(label) = self.entries.get(value) {
      return label.clone();
    }
    let label = format!("uro_str_{}", self.entries.len());
    self.entries.insert(value.to_string(), label.clone());
    label
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// `(label, content)` pairs in first-occurrence order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self
      .entries
      .iter()
      .map(|(content, label)| (label.as_str(), content.as_str()))
  }
}

/// A native symbol reachable through a generated trampoline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSymbol {
  pub name: String,
  pub arity: usize,
  pub position: Position,
}

impl ExternalSymbol {
  pub fn trampoline(&self) -> String {
    trampoline_label(&self.name)
  }
}

/// Label of the trampoline that calls the native symbol `name`.
pub fn trampoline_label(name: &str) -> String {
  format!("uro_extern_{name}")
}

#[derive(Debug, Default)]
pub struct ExternTable {
  symbols: IndexMap<String, ExternalSymbol>,
}

impl ExternTable {
  /// Record a declaration. Redeclaring a symbol is fine as long as the arity
  /// agrees.
  pub fn declare(
    &mut self,
    name: &str,
    arity: usize,
    position: Position,
  ) -> CompileResult<&ExternalSymbol> {
    let valid = name
      .chars()
      .next()
      .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
      && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
      return Err(CompileError::codegen(
        position,
        format!("`{name}` is not a valid external symbol name"),
      ));
    }
    if arity > NATIVE_ARGS.len() {
      return Err(CompileError::codegen(
        position,
        format!(
          "external `{name}` declares {arity} parameters, at most {} are supported",
          NATIVE_ARGS.len()
        ),
      ));
    }
    if let Some(existing) = self.symbols.get(name)
      && existing.arity != arity
    {
      return Err(CompileError::codegen(
        position,
        format!(
          "external `{name}` redeclared with arity {arity}, previously {}",
          existing.arity
        ),
      ));
    }

    let symbol = self
      .symbols
      .entry(name.to_string())
      .or_insert_with(|| ExternalSymbol {
        name: name.to_string(),
        arity,
        position,
      });
    Ok(symbol)
  }

  pub fn get(&self, name: &str) -> Option<&ExternalSymbol> {
    self.symbols.get(name)
  }

  pub fn len(&self) -> usize {
    self.symbols.len()
  }

  pub fn is_empty(&self) -> bool {
    self.symbols.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &ExternalSymbol> {
    self.symbols.values()
  }
}
