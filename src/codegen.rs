//! Code generation: lower the IR into AT&T x86-64 assembly.
//!
//! The evaluation stack is the machine stack: every IR push is a `push`, and
//! binary operations pop their operands into `%rdi`/`%rax`. Frames follow the
//! usual `%rbp` chain, so arguments sit above the saved frame pointer and
//! local slots below it. Local slots start out as `False`.
//!
//! A function that owns capture cells saves their previous values below its
//! slots on entry. While an outer activation of the same function is still
//! running, every return puts those values back, so a recursive call cannot
//! clobber what the caller's nested functions read.
//!
//! Nothing is written until every function has passed [`ir::verify`] and
//! every external call site matches its declared arity.

use log::{debug, trace};

use crate::config::{Options, Target};
use crate::error::{CompileError, CompileResult};
use crate::ir::{
  self, CallTarget, ENTRY_LABEL, Function, FunctionKind, Instr, IterKind, Program, object_label,
};
use crate::parser::BinaryOp;
use crate::resolver::BindingPath;
use crate::runtime;
use crate::tables::{NATIVE_ARGS, trampoline_label};
use crate::ty::{DICT_HEAD, ENTRY_KEY, ENTRY_NEXT, FALSE_WORD, ObjectTag, WORD, bool_word, fits_imm32, number_word};

/// Emit assembly for a whole program.
pub fn generate(program: &Program, options: &Options) -> CompileResult<String> {
  check(program)?;
  let target = options.target;

  let mut asm = String::new();
  emit_header(program, target, &mut asm);
  for function in &program.functions {
    trace!("emitting {}", function.label);
    match &function.kind {
      FunctionKind::External { symbol } => emit_trampoline(function, symbol, target, &mut asm),
      FunctionKind::Entry | FunctionKind::Literal => emit_function(function, target, &mut asm),
    }
  }
  runtime::emit(&mut asm, target);
  emit_rodata(program, target, &mut asm);
  emit_data(program, &mut asm);
  if target == Target::Elf {
    asm.push_str("\n    .section .note.GNU-stack,\"\",@progbits\n");
  }

  debug!(
    "emitted {} bytes of assembly for {} functions",
    asm.len(),
    program.functions.len()
  );
  Ok(asm)
}

/// Static checks that must hold before any text is produced.
fn check(program: &Program) -> CompileResult<()> {
  for function in &program.functions {
    ir::verify(function)?;
    for instr in &function.body {
      match instr {
        Instr::Call {
          argc,
          target: CallTarget::External { name, arity },
          position,
        } => {
          let declared = program.externs.get(name).map_or(*arity, |symbol| symbol.arity);
          if *argc != declared {
            return Err(CompileError::codegen(
              *position,
              format!("external `{name}` takes {declared} argument(s), but {argc} were passed"),
            ));
          }
        }
        Instr::DeclareExternal { name, arity } => {
          // Every declaration must have a trampoline of the same shape.
          let symbol = program.externs.get(name);
          if symbol.is_none_or(|symbol| symbol.arity != *arity) {
            return Err(CompileError::codegen(
              symbol.map_or(function.position, |symbol| symbol.position),
              format!("external `{name}` has no trampoline taking {arity} argument(s)"),
            ));
          }
        }
        _ => {}
      }
    }
  }
  Ok(())
}

fn emit_header(program: &Program, target: Target, asm: &mut String) {
  asm.push_str("# generated by uro0\n");
  asm.push_str(&format!("    .globl {}\n", target.symbol(ENTRY_LABEL)));
  for symbol in runtime::LIBC_SYMBOLS {
    asm.push_str(&format!("    .extern {}\n", target.symbol(symbol)));
  }
  for symbol in program.externs.iter() {
    asm.push_str(&format!("    .extern {}\n", target.symbol(&symbol.name)));
  }
  asm.push_str("    .text\n");
}

fn code_label(function: &Function, target: Target) -> String {
  match function.kind {
    FunctionKind::Entry => target.symbol(ENTRY_LABEL),
    _ => function.label.clone(),
  }
}

fn emit_function(function: &Function, target: Target, asm: &mut String) {
  let entry = function.kind == FunctionKind::Entry;
  let arity = function.params.len();

  asm.push_str(&format!("\n{}:\n", code_label(function, target)));
  asm.push_str("    push %rbp\n");
  asm.push_str("    mov %rsp, %rbp\n");
  for _ in 0..function.layout.slots {
    asm.push_str(&format!("    pushq ${FALSE_WORD}\n"));
  }
  let owned = &function.layout.owned_cells;
  if !owned.is_empty() {
    asm.push_str(&format!("    incq {}(%rip)\n", active_label(function)));
    for &cell in owned {
      asm.push_str(&format!("    pushq {}\n", operand(&BindingPath::Cell(cell))));
    }
    for &cell in owned {
      let dest = operand(&BindingPath::Cell(cell));
      match function.layout.param_cells.iter().find(|(_, c)| *c == cell) {
        Some(&(param, _)) => {
          let path = BindingPath::Param { index: param, arity };
          asm.push_str(&format!("    mov {}, %rax\n", operand(&path)));
          asm.push_str(&format!("    mov %rax, {dest}\n"));
        }
        None => asm.push_str(&format!("    movq ${FALSE_WORD}, {dest}\n")),
      }
    }
  }

  for instr in &function.body {
    emit_instr(instr, function, entry, asm);
  }
}

fn emit_instr(instr: &Instr, function: &Function, entry: bool, asm: &mut String) {
  let label = &function.label;
  match instr {
    Instr::PushNumber(value) => push_word(number_word(*value), asm),
    Instr::PushBool(value) => push_word(bool_word(*value), asm),
    Instr::PushString(string) => {
      asm.push_str(&format!("    lea {string}(%rip), %rax\n"));
      asm.push_str("    push %rax\n");
    }
    Instr::PushFunction(callee) => {
      asm.push_str(&format!("    lea {}(%rip), %rax\n", object_label(callee)));
      asm.push_str("    push %rax\n");
    }
    Instr::DeclareExternal { name, .. } => {
      let object = object_label(&trampoline_label(name));
      asm.push_str(&format!("    lea {object}(%rip), %rax\n"));
      asm.push_str("    push %rax\n");
    }
    Instr::MakeDict { pairs, id } => {
      if let Some(id) = id {
        asm.push_str(&format!("    # dict {}\n", id.0));
      }
      asm.push_str("    call uro_dict_new\n");
      asm.push_str("    push %rax\n");
      // Stack: dict, then the pairs with the last one on top.
      for pair in 0..*pairs {
        let key = WORD as usize * (2 * (pairs - pair));
        let value = key - WORD as usize;
        asm.push_str("    mov (%rsp), %rdi\n");
        asm.push_str(&format!("    mov {key}(%rsp), %rsi\n"));
        asm.push_str(&format!("    mov {value}(%rsp), %rdx\n"));
        asm.push_str("    call uro_dict_set\n");
      }
      asm.push_str("    pop %rax\n");
      if *pairs > 0 {
        asm.push_str(&format!("    add ${}, %rsp\n", 2 * WORD as usize * pairs));
      }
      asm.push_str("    push %rax\n");
    }
    Instr::IndexGet => {
      asm.push_str("    pop %rsi\n");
      asm.push_str("    pop %rdi\n");
      asm.push_str("    call uro_dict_get\n");
      asm.push_str("    push %rax\n");
    }
    Instr::IndexSet => {
      asm.push_str("    pop %rdx\n");
      asm.push_str("    pop %rsi\n");
      asm.push_str("    pop %rdi\n");
      asm.push_str("    call uro_dict_set\n");
    }
    Instr::Call { argc, target, .. } => {
      match target {
        CallTarget::External { name, .. } => {
          asm.push_str(&format!("    call {}\n", trampoline_label(name)));
        }
        CallTarget::Dynamic => {
          asm.push_str(&format!("    mov {}(%rsp), %rdi\n", WORD as usize * argc));
          asm.push_str("    call uro_callable\n");
          asm.push_str("    call *%rax\n");
        }
      }
      asm.push_str(&format!("    add ${}, %rsp\n", WORD as usize * (argc + 1)));
      asm.push_str("    push %rax\n");
    }
    Instr::Return => {
      asm.push_str("    pop %rax\n");
      if entry {
        asm.push_str("    xor %eax, %eax\n");
      }
      emit_cell_restore(function, asm);
      asm.push_str("    mov %rbp, %rsp\n");
      asm.push_str("    pop %rbp\n");
      asm.push_str("    ret\n");
    }
    Instr::RawAsm(text) => {
      asm.push_str("    # asm\n");
      asm.push_str(text);
      if !text.ends_with('\n') {
        asm.push('\n');
      }
      asm.push_str("    push %rax\n");
    }
    Instr::LoadBinding(path) => {
      asm.push_str(&format!("    pushq {}\n", operand(path)));
    }
    Instr::StoreBinding(path) => {
      asm.push_str("    pop %rax\n");
      asm.push_str(&format!("    mov %rax, {}\n", operand(path)));
    }
    Instr::Binary(op) => emit_binary(*op, asm),
    Instr::Pop => asm.push_str("    add $8, %rsp\n"),
    Instr::IterBegin(kind) => match kind {
      IterKind::Dict => {
        asm.push_str("    mov (%rsp), %rax\n");
        asm.push_str(&format!("    pushq {DICT_HEAD}(%rax)\n"));
      }
      IterKind::Str => asm.push_str("    pushq $0\n"),
      IterKind::Dynamic => {
        asm.push_str("    mov (%rsp), %rdi\n");
        asm.push_str("    call uro_iter_begin\n");
        asm.push_str("    push %rax\n");
      }
    },
    Instr::LoopHead(n) => asm.push_str(&format!("{label}_loop{n}:\n")),
    Instr::IterNext { kind, exit } => match kind {
      IterKind::Dict => {
        asm.push_str("    mov (%rsp), %rax\n");
        asm.push_str("    test %rax, %rax\n");
        asm.push_str(&format!("    jz {label}_done{exit}\n"));
        asm.push_str(&format!("    mov {ENTRY_NEXT}(%rax), %rdi\n"));
        asm.push_str("    mov %rdi, (%rsp)\n");
        asm.push_str(&format!("    pushq {ENTRY_KEY}(%rax)\n"));
      }
      IterKind::Str | IterKind::Dynamic => {
        let routine = match kind {
          IterKind::Str => "uro_str_next",
          _ => "uro_iter_next",
        };
        asm.push_str("    mov %rsp, %rdi\n");
        asm.push_str(&format!("    call {routine}\n"));
        asm.push_str("    test %rax, %rax\n");
        asm.push_str(&format!("    jz {label}_done{exit}\n"));
        asm.push_str("    push %rax\n");
      }
    },
    Instr::Jump(n) => asm.push_str(&format!("    jmp {label}_loop{n}\n")),
    Instr::IterEnd(n) => {
      asm.push_str(&format!("{label}_done{n}:\n"));
      asm.push_str("    add $16, %rsp\n");
    }
  }
}

/// Count of live activations of a function that owns capture cells.
fn active_label(function: &Function) -> String {
  format!("{}_active", function.label)
}

/// Put back the cell values saved on entry, unless this is the outermost
/// activation. `%rax` holds the return value and is left alone.
fn emit_cell_restore(function: &Function, asm: &mut String) {
  let owned = &function.layout.owned_cells;
  if owned.is_empty() {
    return;
  }
  asm.push_str(&format!("    decq {}(%rip)\n", active_label(function)));
  for (i, &cell) in owned.iter().enumerate() {
    let saved = WORD as usize * (function.layout.slots + i + 1);
    let cell = operand(&BindingPath::Cell(cell));
    asm.push_str(&format!("    mov {cell}, %rcx\n"));
    asm.push_str(&format!("    cmovnz -{saved}(%rbp), %rcx\n"));
    asm.push_str(&format!("    mov %rcx, {cell}\n"));
  }
}

fn push_word(word: i64, asm: &mut String) {
  if fits_imm32(word) {
    asm.push_str(&format!("    push ${word}\n"));
  } else {
    asm.push_str(&format!("    movabs ${word}, %rax\n"));
    asm.push_str("    push %rax\n");
  }
}

/// Tagged-number arithmetic and branch-free comparisons. Operands arrive as
/// `%rax` (left) and `%rdi` (right). Everything but `==` needs two numbers;
/// the tag check lives in the runtime so the function body stays branch-free.
fn emit_binary(op: BinaryOp, asm: &mut String) {
  asm.push_str("    pop %rdi\n");
  asm.push_str("    pop %rax\n");
  if op != BinaryOp::Eq {
    asm.push_str("    call uro_check_numbers\n");
  }
  match op {
    BinaryOp::Add => {
      asm.push_str("    add %rdi, %rax\n");
      asm.push_str("    sub $1, %rax\n");
    }
    BinaryOp::Sub => {
      asm.push_str("    sub %rdi, %rax\n");
      asm.push_str("    add $1, %rax\n");
    }
    BinaryOp::Mul => {
      asm.push_str("    sar $1, %rax\n");
      asm.push_str("    sub $1, %rdi\n");
      asm.push_str("    imul %rdi, %rax\n");
      asm.push_str("    add $1, %rax\n");
    }
    BinaryOp::Eq => {
      asm.push_str("    mov %rdi, %rsi\n");
      asm.push_str("    mov %rax, %rdi\n");
      asm.push_str("    call uro_equals\n");
      to_bool(asm);
    }
    BinaryOp::Lt => {
      asm.push_str("    cmp %rdi, %rax\n");
      asm.push_str("    setl %al\n");
      asm.push_str("    movzbl %al, %eax\n");
      to_bool(asm);
    }
    BinaryOp::Gt => {
      asm.push_str("    cmp %rdi, %rax\n");
      asm.push_str("    setg %al\n");
      asm.push_str("    movzbl %al, %eax\n");
      to_bool(asm);
    }
  }
  asm.push_str("    push %rax\n");
}

/// 0/1 in `%rax` to False/True.
fn to_bool(asm: &mut String) {
  asm.push_str("    shl $2, %rax\n");
  asm.push_str("    or $2, %rax\n");
}

fn operand(path: &BindingPath) -> String {
  match path {
    BindingPath::Param { index, arity } => {
      format!("{}(%rbp)", 2 * WORD as usize + WORD as usize * (arity - 1 - index))
    }
    BindingPath::Slot(slot) => format!("-{}(%rbp)", WORD as usize * (slot + 1)),
    BindingPath::Cell(cell) => format!("uro_cell_{cell}(%rip)"),
    BindingPath::Global(name) => format!("uro_global_{name}(%rip)"),
  }
}

/// Stub from the stack convention to the native one: convert each argument,
/// load the argument registers, align, call, tag the result as a number.
fn emit_trampoline(function: &Function, symbol: &str, target: Target, asm: &mut String) {
  let arity = function.params.len();

  asm.push_str(&format!("\n{}:\n", function.label));
  asm.push_str("    push %rbp\n");
  asm.push_str("    mov %rsp, %rbp\n");
  for index in 0..arity {
    let path = BindingPath::Param { index, arity };
    asm.push_str(&format!("    mov {}, %rdi\n", operand(&path)));
    asm.push_str("    call uro_to_native\n");
    asm.push_str("    push %rax\n");
  }
  for register in NATIVE_ARGS[..arity].iter().rev() {
    asm.push_str(&format!("    pop {register}\n"));
  }
  asm.push_str("    and $-16, %rsp\n");
  asm.push_str("    xor %eax, %eax\n");
  asm.push_str(&format!("    call {}\n", target.symbol(symbol)));
  asm.push_str("    shl $1, %rax\n");
  asm.push_str("    or $1, %rax\n");
  asm.push_str("    mov %rbp, %rsp\n");
  asm.push_str("    pop %rbp\n");
  asm.push_str("    ret\n");
}

fn emit_rodata(program: &Program, target: Target, asm: &mut String) {
  asm.push_str(&format!("\n    {}\n", target.rodata_section()));
  for (label, content) in program.strings.iter() {
    emit_string_object(label, content, asm);
  }
  for (label, content) in runtime::messages() {
    emit_string_object(&label, content, asm);
  }
}

fn emit_string_object(label: &str, content: &str, asm: &mut String) {
  asm.push_str("    .balign 8\n");
  asm.push_str(&format!("{label}:\n"));
  asm.push_str(&format!(
    "    .quad {}, {}\n",
    ObjectTag::Str.word(),
    content.len()
  ));
  asm.push_str(&format!("    .asciz \"{}\"\n", escape(content)));
}

fn emit_data(program: &Program, asm: &mut String) {
  asm.push_str("\n    .data\n");
  asm.push_str("    .balign 8\n");
  for function in &program.functions {
    if function.kind == FunctionKind::Entry {
      continue;
    }
    asm.push_str(&format!("{}:\n", function.object_label()));
    asm.push_str(&format!(
      "    .quad {}, {}\n",
      ObjectTag::Function.word(),
      function.label
    ));
  }
  for name in &program.globals {
    asm.push_str(&format!("uro_global_{name}:\n    .quad {FALSE_WORD}\n"));
  }
  for cell in 0..program.cells {
    asm.push_str(&format!("uro_cell_{cell}:\n    .quad {FALSE_WORD}\n"));
  }
  for function in &program.functions {
    if !function.layout.owned_cells.is_empty() {
      asm.push_str(&format!("{}:\n    .quad 0\n", active_label(function)));
    }
  }
}

/// Escape bytes for a quoted assembler string.
fn escape(content: &str) -> String {
  let mut out = String::with_capacity(content.len());
  for byte in content.bytes() {
    match byte {
      b'"' => out.push_str("\\\""),
      b'\\' => out.push_str("\\\\"),
      b'\n' => out.push_str("\\n"),
      b'\t' => out.push_str("\\t"),
      0x20..=0x7e => out.push(byte as char),
      _ => out.push_str(&format!("\\{byte:03o}")),
    }
  }
  out
}
