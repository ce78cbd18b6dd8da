//! Compile options.

use std::str::FromStr;

use snafu::Snafu;

/// Object-file flavour the assembly text is written for. Both are x86-64;
/// they differ in symbol naming and section directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
  Elf,
  MachO,
}

impl Target {
  pub fn host() -> Self {
    if cfg!(target_os = "macos") {
      Target::MachO
    } else {
      Target::Elf
    }
  }

  /// Spell a C-visible symbol the way the platform linker expects.
  pub fn symbol(self, name: &str) -> String {
    match self {
      Target::Elf => name.to_string(),
      Target::MachO => format!("_{name}"),
    }
  }

  pub fn rodata_section(self) -> &'static str {
    match self {
      Target::Elf => ".section .rodata",
      Target::MachO => ".section __TEXT,__const",
    }
  }
}

impl Default for Target {
  fn default() -> Self {
    Target::host()
  }
}

#[derive(Debug, Snafu)]
#[snafu(display("unknown target `{name}`, expected `elf` or `macho`"))]
pub struct ParseTargetError {
  name: String,
}

impl FromStr for Target {
  type Err = ParseTargetError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "elf" | "linux" => Ok(Target::Elf),
      "macho" | "mach-o" | "macos" => Ok(Target::MachO),
      _ => ParseTargetSnafu { name: s }.fail(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
  pub target: Target,
}

impl Options {
  pub fn for_target(target: Target) -> Self {
    Self { target }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_target_names() {
    assert_eq!("elf".parse::<Target>().unwrap(), Target::Elf);
    assert_eq!("Mach-O".parse::<Target>().unwrap(), Target::MachO);
    let err = "wasm".parse::<Target>().unwrap_err();
    assert_eq!(err.to_string(), "unknown target `wasm`, expected `elf` or `macho`");
  }

  #[test]
  fn macho_symbols_get_an_underscore() {
    assert_eq!(Target::MachO.symbol("main"), "_main");
    assert_eq!(Target::Elf.symbol("main"), "main");
  }
}
