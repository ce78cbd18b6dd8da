//! Crate root: wires together the compilation pipeline.
//!
//! - `tokenizer` performs lexical analysis and produces a flat token stream.
//! - `parser` owns all syntactic knowledge and returns the statement tree.
//! - `resolver` classifies every name as local, captured or global.
//! - `ir` lowers the resolved tree into per-function stack-machine code.
//! - `codegen` turns that code into x86-64 AT&T assembly, appending the
//!   `runtime` support routines.
//! - `error` centralises reporting utilities shared by the other modules.

pub mod codegen;
pub mod config;
pub mod error;
pub mod ir;
pub mod parser;
pub mod resolver;
pub mod runtime;
pub mod tables;
pub mod tokenizer;
pub mod ty;

pub use config::{Options, Target};
pub use error::{CompileError, CompileResult, Position};

/// Compile a source string into AT&T assembly for `options.target`.
pub fn compile(source: &str, options: &Options) -> CompileResult<String> {
  let tokens = tokenizer::tokenize(source)?;
  let mut program = parser::parse(tokens, source)?;
  let resolution = resolver::resolve(&mut program)?;
  let ir = ir::build(program, &resolution)?;
  codegen::generate(&ir, options)
}

/// Compile a source string for the host's object format.
pub fn generate_assembly(source: &str) -> CompileResult<String> {
  compile(source, &Options::default())
}
