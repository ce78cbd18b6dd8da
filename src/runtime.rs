//! Fixed support routines appended to every compiled program.
//!
//! Routines take native register arguments (`%rdi`, `%rsi`, `%rdx`) and
//! return in `%rax`. Only `uro_alloc` and `uro_fail` reach libc, and each
//! aligns the stack itself, so generated code may call any routine at an
//! arbitrary evaluation-stack depth.

use crate::config::Target;
use crate::ty::{
  DICT_COUNT, DICT_HEAD, DICT_SIZE, DICT_TAIL, ENTRY_KEY, ENTRY_NEXT, ENTRY_SIZE, ENTRY_VALUE,
  FUNCTION_CODE, Failure, ObjectTag, STR_BYTES, STR_LEN,
};

/// libc symbols the runtime depends on.
pub const LIBC_SYMBOLS: [&str; 3] = ["malloc", "write", "exit"];

pub fn message_label(failure: Failure) -> String {
  failure.label().replace("uro_fail_", "uro_msg_")
}

/// Failure messages as `(label, text)`, stored like string literals.
pub fn messages() -> impl Iterator<Item = (String, &'static str)> {
  Failure::ALL
    .into_iter()
    .map(|failure| (message_label(failure), failure.message()))
}

/// Append the runtime routines to `asm`.
pub fn emit(asm: &mut String, target: Target) {
  let malloc = target.symbol("malloc");
  let write = target.symbol("write");
  let exit = target.symbol("exit");
  let str_tag = ObjectTag::Str.word();
  let dict_tag = ObjectTag::Dict.word();
  let fn_tag = ObjectTag::Function.word();
  let key_fail = Failure::KeyError.label();
  let index_fail = Failure::NotIndexable.label();
  let call_fail = Failure::NotCallable.label();
  let iter_fail = Failure::NotIterable.label();
  let oom_fail = Failure::OutOfMemory.label();
  let number_fail = Failure::NotANumber.label();
  let one_char = STR_BYTES + 8;

  asm.push_str("\n# runtime\n");

  // %rdi = size in bytes.
  asm.push_str(&format!(
    r"uro_alloc:
    push %rbp
    mov %rsp, %rbp
    and $-16, %rsp
    call {malloc}
    mov %rbp, %rsp
    pop %rbp
    test %rax, %rax
    jz {oom_fail}
    ret
"
  ));

  asm.push_str(&format!(
    r"uro_dict_new:
    mov ${DICT_SIZE}, %edi
    call uro_alloc
    movq ${dict_tag}, (%rax)
    movq $0, {DICT_HEAD}(%rax)
    movq $0, {DICT_TAIL}(%rax)
    movq $0, {DICT_COUNT}(%rax)
    ret
"
  ));

  // Identical words, or two strings with equal bytes. Result 0 or 1.
  asm.push_str(&format!(
    r"uro_equals:
    cmp %rsi, %rdi
    je uro_equals_true
    mov %rdi, %rax
    or %rsi, %rax
    test $7, %al
    jnz uro_equals_false
    cmpq ${str_tag}, (%rdi)
    jne uro_equals_false
    cmpq ${str_tag}, (%rsi)
    jne uro_equals_false
    mov {STR_LEN}(%rdi), %rcx
    cmp {STR_LEN}(%rsi), %rcx
    jne uro_equals_false
    lea {STR_BYTES}(%rdi), %rdi
    lea {STR_BYTES}(%rsi), %rsi
    repe cmpsb
    jne uro_equals_false
uro_equals_true:
    mov $1, %eax
    ret
uro_equals_false:
    xor %eax, %eax
    ret
"
  ));

  // %rdi = dict, %rsi = key. Entry pointer or 0.
  asm.push_str(&format!(
    r"uro_dict_find:
    push %r12
    push %r13
    mov %rsi, %r12
    mov {DICT_HEAD}(%rdi), %r13
uro_dict_find_loop:
    test %r13, %r13
    jz uro_dict_find_done
    mov {ENTRY_KEY}(%r13), %rdi
    mov %r12, %rsi
    call uro_equals
    test %rax, %rax
    jnz uro_dict_find_done
    mov {ENTRY_NEXT}(%r13), %r13
    jmp uro_dict_find_loop
uro_dict_find_done:
    mov %r13, %rax
    pop %r13
    pop %r12
    ret
"
  ));

  let check_dict = format!(
    r"    test $7, %dil
    jnz {index_fail}
    cmpq ${dict_tag}, (%rdi)
    jne {index_fail}
"
  );

  asm.push_str("uro_dict_get:\n");
  asm.push_str(&check_dict);
  asm.push_str(&format!(
    r"    call uro_dict_find
    test %rax, %rax
    jz {key_fail}
    mov {ENTRY_VALUE}(%rax), %rax
    ret
"
  ));

  // %rdi = dict, %rsi = key, %rdx = value. Overwrites in place or appends at
  // the tail, so iteration sees keys in first-insertion order.
  asm.push_str("uro_dict_set:\n");
  asm.push_str(&check_dict);
  asm.push_str(&format!(
    r"    push %r12
    push %r13
    push %r14
    mov %rdi, %r12
    mov %rsi, %r13
    mov %rdx, %r14
    call uro_dict_find
    test %rax, %rax
    jz uro_dict_set_append
    mov %r14, {ENTRY_VALUE}(%rax)
    jmp uro_dict_set_done
uro_dict_set_append:
    mov ${ENTRY_SIZE}, %edi
    call uro_alloc
    mov %r13, {ENTRY_KEY}(%rax)
    mov %r14, {ENTRY_VALUE}(%rax)
    movq $0, {ENTRY_NEXT}(%rax)
    mov {DICT_TAIL}(%r12), %rcx
    test %rcx, %rcx
    jz uro_dict_set_first
    mov %rax, {ENTRY_NEXT}(%rcx)
    jmp uro_dict_set_link
uro_dict_set_first:
    mov %rax, {DICT_HEAD}(%r12)
uro_dict_set_link:
    mov %rax, {DICT_TAIL}(%r12)
    incq {DICT_COUNT}(%r12)
uro_dict_set_done:
    pop %r14
    pop %r13
    pop %r12
    ret
"
  ));

  // %rdi = callee value. Code address.
  asm.push_str(&format!(
    r"uro_callable:
    test $7, %dil
    jnz {call_fail}
    cmpq ${fn_tag}, (%rdi)
    jne {call_fail}
    mov {FUNCTION_CODE}(%rdi), %rax
    ret
"
  ));

  // %rdi = iterable. Initial cursor: first entry, or byte index 0.
  asm.push_str(&format!(
    r"uro_iter_begin:
    test $7, %dil
    jnz {iter_fail}
    cmpq ${dict_tag}, (%rdi)
    je uro_iter_begin_dict
    cmpq ${str_tag}, (%rdi)
    jne {iter_fail}
    xor %eax, %eax
    ret
uro_iter_begin_dict:
    mov {DICT_HEAD}(%rdi), %rax
    ret
"
  ));

  // %rdi = iterator state: (%rdi) cursor, 8(%rdi) iterable. Next element,
  // or 0 when exhausted. The cursor is advanced in place.
  asm.push_str(&format!(
    r"uro_iter_next:
    mov 8(%rdi), %rax
    cmpq ${dict_tag}, (%rax)
    jne uro_str_next
    mov (%rdi), %rax
    test %rax, %rax
    jz uro_iter_next_done
    mov {ENTRY_NEXT}(%rax), %rcx
    mov %rcx, (%rdi)
    mov {ENTRY_KEY}(%rax), %rax
uro_iter_next_done:
    ret
"
  ));

  asm.push_str(&format!(
    r"uro_str_next:
    push %r12
    mov %rdi, %r12
    mov 8(%r12), %rax
    mov (%r12), %rcx
    cmp {STR_LEN}(%rax), %rcx
    jae uro_str_next_end
    mov ${one_char}, %edi
    call uro_alloc
    mov 8(%r12), %rdx
    mov (%r12), %rcx
    movzbl {STR_BYTES}(%rdx,%rcx), %esi
    movq ${str_tag}, (%rax)
    movq $1, {STR_LEN}(%rax)
    mov %rsi, {STR_BYTES}(%rax)
    incq (%r12)
    pop %r12
    ret
uro_str_next_end:
    xor %eax, %eax
    pop %r12
    ret
"
  ));

  // %rdi = value. Native word for a C argument.
  asm.push_str(&format!(
    r"uro_to_native:
    mov %rdi, %rax
    test $1, %dil
    jnz uro_to_native_number
    test $7, %dil
    jnz uro_to_native_bool
    cmpq ${str_tag}, (%rdi)
    jne uro_to_native_done
    lea {STR_BYTES}(%rdi), %rax
uro_to_native_done:
    ret
uro_to_native_number:
    sar $1, %rax
    ret
uro_to_native_bool:
    shr $2, %rax
    ret
"
  ));

  // %rax, %rdi = arithmetic operands. Both are preserved.
  asm.push_str(&format!(
    r"uro_check_numbers:
    test $1, %al
    jz {number_fail}
    test $1, %dil
    jz {number_fail}
    ret
"
  ));

  for failure in Failure::ALL {
    asm.push_str(&format!(
      "{}:\n    mov ${}, %edi\n    lea {}(%rip), %rsi\n    jmp uro_fail\n",
      failure.label(),
      failure.exit_code(),
      message_label(failure)
    ));
  }

  // %rdi = exit status, %rsi = message string object. Never returns.
  asm.push_str(&format!(
    r"uro_fail:
    and $-16, %rsp
    mov %rdi, %rbx
    mov {STR_LEN}(%rsi), %rdx
    lea {STR_BYTES}(%rsi), %rsi
    mov $2, %edi
    call {write}
    mov %rbx, %rdi
    call {exit}
"
  ));
}

#[cfg(test)]
mod tests {
  use super::*;

  fn runtime(target: Target) -> String {
    let mut asm = String::new();
    emit(&mut asm, target);
    asm
  }

  #[test]
  fn defines_every_routine_once() {
    let asm = runtime(Target::Elf);
    for routine in [
      "uro_alloc",
      "uro_dict_new",
      "uro_dict_get",
      "uro_dict_set",
      "uro_equals",
      "uro_callable",
      "uro_iter_begin",
      "uro_iter_next",
      "uro_to_native",
      "uro_check_numbers",
      "uro_fail",
    ] {
      let label = format!("\n{routine}:\n");
      assert_eq!(asm.matches(&label).count(), 1, "{routine}");
    }
    for failure in Failure::ALL {
      assert!(asm.contains(&format!("{}:\n", failure.label())));
    }
  }

  #[test]
  fn libc_calls_follow_the_target_prefix() {
    let elf = runtime(Target::Elf);
    assert!(elf.contains("call malloc\n"));
    let macho = runtime(Target::MachO);
    assert!(macho.contains("call _malloc\n"));
    assert!(macho.contains("call _exit\n"));
    assert!(!macho.contains("call malloc\n"));
  }

  #[test]
  fn number_check_leaves_operands_alone() {
    let asm = runtime(Target::Elf);
    let start = asm.find("uro_check_numbers:\n").unwrap();
    let routine = &asm[start..start + asm[start..].find("ret\n").unwrap()];
    assert!(routine.contains("    test $1, %al\n    jz uro_fail_number\n"));
    assert!(routine.contains("    test $1, %dil\n    jz uro_fail_number\n"));
    assert!(!routine.contains("mov "));
  }

  #[test]
  fn failures_exit_with_their_status() {
    let asm = runtime(Target::Elf);
    assert!(asm.contains("uro_fail_key:\n    mov $3, %edi\n"));
    assert!(asm.contains("uro_fail_oom:\n    mov $7, %edi\n"));
    assert!(asm.contains("uro_fail_number:\n    mov $8, %edi\n"));
    let labels: Vec<_> = messages().map(|(label, _)| label).collect();
    assert_eq!(labels[0], "uro_msg_key");
  }
}
