use uro0::ir::{self, CallTarget, Instr, Program};
use uro0::{CompileError, Options, Target, compile, parser, resolver, tokenizer};

const PERSON: &str = r#"
## Classes are dictionaries of functions.
Person = {
  _init: fn(self, name) {
    self['name'] = name;
  },
  greet: fn(self) {
    return self['name'];
  },
};

copy = fn(source) {
  target = {};
  for key in source {
    target[key] = source[key];
  };
  return target;
};

new = fn(class, name) {
  instance = copy(class);
  instance['_init'](instance, name);
  return instance;
};

bob = new(Person, 'bob');
"#;

const DISPATCH: &str = r#"
f = fn() { return 'f'; };
g = fn() { return 'g'; };
pick = fn() { return {True: f, False: g}[(1 + 1 == 2)](); };
result = pick();
"#;

fn elf(source: &str) -> String {
  compile(source, &Options::for_target(Target::Elf)).unwrap()
}

fn lower(source: &str) -> Program {
  let tokens = tokenizer::tokenize(source).unwrap();
  let mut block = parser::parse(tokens, source).unwrap();
  let resolution = resolver::resolve(&mut block).unwrap();
  ir::build(block, &resolution).unwrap()
}

fn function<'a>(program: &'a Program, label: &str) -> &'a ir::Function {
  program
    .functions
    .iter()
    .find(|function| function.label == label)
    .unwrap()
}

/// Text of one function, from its label up to the next blank line.
fn function_text<'a>(asm: &'a str, label: &str) -> &'a str {
  let start = asm.find(&format!("\n{label}:\n")).unwrap() + 1;
  let rest = &asm[start..];
  let end = rest.find("\n\n").unwrap_or(rest.len());
  &rest[..end]
}

#[test]
fn every_function_is_stack_balanced() {
  for source in [PERSON, DISPATCH, "for c in 'abc' { for k in {a: c} { x = k; }; };"] {
    let program = lower(source);
    for function in &program.functions {
      ir::verify(function).unwrap_or_else(|err| panic!("{}: {err}", function.label));
    }
  }
}

#[test]
fn new_runs_init_once_and_sets_the_name() {
  let program = lower(PERSON);

  // Function ids follow first occurrence: _init, greet, copy, new.
  let init = function(&program, "uro_fn_0");
  assert_eq!(init.params, ["self", "name"]);
  assert!(init.body.contains(&Instr::IndexSet));

  let new = function(&program, "uro_fn_3");
  let calls: Vec<_> = new
    .body
    .iter()
    .filter_map(|instr| match instr {
      Instr::Call { argc, .. } => Some(*argc),
      _ => None,
    })
    .collect();
  // copy(class), then instance['_init'](instance, name).
  assert_eq!(calls, [1, 2]);

  let copy = function(&program, "uro_fn_2");
  assert!(copy.body.contains(&Instr::IterBegin(ir::IterKind::Dynamic)));

  let asm = elf(PERSON);
  assert!(asm.contains("uro_global_bob:\n"));
  assert!(asm.contains(".asciz \"_init\""));
}

#[test]
fn dispatch_has_no_conditional_jump() {
  let asm = elf(DISPATCH);
  let pick = function_text(&asm, "uro_fn_2");
  assert!(pick.contains("call uro_dict_get"));
  assert!(pick.contains("call uro_equals"));
  for line in pick.lines() {
    assert!(!line.trim_start().starts_with('j'), "branch in dispatch: {line}");
  }

  let program = lower(DISPATCH);
  let body = &function(&program, "uro_fn_2").body;
  let dict = body
    .iter()
    .position(|instr| matches!(instr, Instr::MakeDict { pairs: 2, .. }))
    .unwrap();
  assert_eq!(body[0], Instr::PushBool(true));
  assert_eq!(
    body[1],
    Instr::LoadBinding(resolver::BindingPath::Global("f".to_string()))
  );
  assert!(matches!(body[dict + 1..].first(), Some(Instr::PushNumber(1))));
}

#[test]
fn literal_dict_loop_walks_keys_in_written_order() {
  let source = "for key in {a: 1, b: 2, c: 3} { seen = key; };";
  let asm = elf(source);
  let a = asm.find(".asciz \"a\"").unwrap();
  let b = asm.find(".asciz \"b\"").unwrap();
  let c = asm.find(".asciz \"c\"").unwrap();
  assert!(a < b && b < c);

  let main = function_text(&asm, "main");
  assert!(main.contains("main_loop0:"));
  assert!(main.contains("jz main_done0"));
  assert_eq!(asm, elf(source));
}

#[test]
fn identical_strings_share_one_entry() {
  let asm = elf("a = 'hello'; b = 'hello'; c = fn() { return 'hello'; };");
  assert_eq!(asm.matches(".asciz \"hello\"").count(), 1);
  assert_eq!(asm.matches("lea uro_str_0(%rip), %rax").count(), 3);
}

#[test]
fn extern_arity_mismatch_produces_no_output() {
  let result = compile(
    "puts = extern('puts', 1); puts('a', 'b');",
    &Options::for_target(Target::Elf),
  );
  let err = result.unwrap_err();
  assert!(matches!(err, CompileError::Codegen { .. }));
  assert_eq!(err.position().unwrap().column, 31);
}

#[test]
fn extern_call_sites_are_typed() {
  let program = lower("puts = extern('puts', 1); say = fn(s) { puts(s); }; say('hi');");
  let say = function(&program, "uro_fn_0");
  assert!(say.body.iter().any(|instr| matches!(
    instr,
    Instr::Call {
      argc: 1,
      target: CallTarget::External { .. },
      ..
    }
  )));
}

#[test]
fn each_phase_reports_its_own_error() {
  let options = Options::for_target(Target::Elf);
  let cases = [
    ("x = $;", "lex"),
    ("x = ;", "parse"),
    ("x = y;", "resolve"),
    ("f = extern('f', 7);", "codegen"),
  ];
  for (source, phase) in cases {
    let err = compile(source, &options).unwrap_err();
    assert_eq!(err.phase(), phase, "{source}");
    assert!(err.render(source).starts_with(&format!("{phase} error at 1:")));
  }
}

#[test]
fn elf_output_declares_libc_and_stack_note() {
  let asm = elf("x = 1;");
  for symbol in ["malloc", "write", "exit"] {
    assert!(asm.contains(&format!("    .extern {symbol}\n")));
  }
  assert!(asm.ends_with(".section .note.GNU-stack,\"\",@progbits\n"));
}

/// Assemble `source` with the system C compiler and run it, returning
/// `(stdout, stderr, status)`. `None` when no `cc` is installed.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run(name: &str, source: &str) -> Option<(String, String, Option<i32>)> {
  use std::io::Write;
  use std::process::{Command, Stdio};

  let have_cc = Command::new("cc")
    .arg("--version")
    .output()
    .is_ok_and(|output| output.status.success());
  if !have_cc {
    eprintln!("skipping {name}: no cc on this host");
    return None;
  }

  let asm = elf(source);
  let dir = std::env::temp_dir().join(format!("uro0-{name}-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let binary = dir.join("program");
  let mut cc = Command::new("cc")
    .args(["-x", "assembler", "-", "-o"])
    .arg(&binary)
    .stdin(Stdio::piped())
    .spawn()
    .unwrap();
  cc.stdin.take().unwrap().write_all(asm.as_bytes()).unwrap();
  assert!(cc.wait().unwrap().success(), "cc rejected the output of {name}");

  let output = Command::new(&binary).output().unwrap();
  std::fs::remove_dir_all(&dir).unwrap();
  Some((
    String::from_utf8_lossy(&output.stdout).into_owned(),
    String::from_utf8_lossy(&output.stderr).into_owned(),
    output.status.code(),
  ))
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn compiled_program_runs() {
  let source = format!(
    "{PERSON}\nputs = extern('puts', 1);\nputs(bob['name']);\n\
     for key in {{a: 1, b: 2}} {{ puts(key); }};\n\
     {{True: fn() {{ puts('yes'); }}, False: fn() {{ puts('no'); }}}}[1 < 2]();\n\
     puts({{}}['missing']);\n"
  );
  let Some((stdout, stderr, status)) = run("person", &source) else {
    return;
  };
  assert_eq!(stdout, "bob\na\nb\nyes\n");
  assert!(stderr.starts_with("KeyError"));
  assert_eq!(status, Some(3));
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn init_runs_exactly_once_per_instance() {
  let source = r#"
puts = extern('puts', 1);
counter = {n: 0};
Person = {
  _init: fn(self, name) {
    self['name'] = name;
    counter['n'] = counter['n'] + 1;
  },
};
copy = fn(source) {
  target = {};
  for key in source { target[key] = source[key]; };
  return target;
};
new = fn(class, name) {
  instance = copy(class);
  instance['_init'](instance, name);
  return instance;
};
bob = new(Person, 'Bob');
puts(bob['name']);
puts({True: 'once', False: 'not once'}[counter['n'] == 1]);
puts({True: 'eq', False: 'ne'}['Bob' == bob['name']]);
"#;
  let Some((stdout, _, status)) = run("init_once", source) else {
    return;
  };
  assert_eq!(stdout, "Bob\nonce\neq\n");
  assert_eq!(status, Some(0));
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn local_assigned_only_in_an_empty_loop_reads_false() {
  let source = r#"
puts = extern('puts', 1);
junk = fn(a, b, c) { x = a; y = b; z = c; return z; };
f = fn(d) { for k in d { last = k; }; return last; };
junk(1, 2, 3);
r = f({});
puts({True: 'False', False: 'not False'}[r == False]);
r['x'];
"#;
  let Some((stdout, stderr, status)) = run("empty_loop", source) else {
    return;
  };
  assert_eq!(stdout, "False\n");
  assert!(stderr.starts_with("TypeError: value is not a dictionary"));
  assert_eq!(status, Some(4));
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn recursion_keeps_the_callers_captured_parameter() {
  let source = r#"
puts = extern('puts', 1);
fact = fn(n) {
  return {True: fn() { return 1; }, False: fn() { return fact(n - 1) * n; }}[n < 2]();
};
puts({True: 'six', False: 'wrong'}[fact(3) == 6]);
make = fn(v) { return fn() { return v; }; };
get = make('kept');
puts(get());
"#;
  let Some((stdout, _, status)) = run("recursion", source) else {
    return;
  };
  assert_eq!(stdout, "six\nkept\n");
  assert_eq!(status, Some(0));
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[test]
fn arithmetic_on_a_string_fails_with_a_type_error() {
  let source = "puts = extern('puts', 1);\nputs('before');\nx = 'a' + 1;\nputs('after');\n";
  let Some((stdout, stderr, status)) = run("arith", source) else {
    return;
  };
  assert_eq!(stdout, "before\n");
  assert!(stderr.starts_with("TypeError: arithmetic operand is not a number"));
  assert_eq!(status, Some(8));
}
