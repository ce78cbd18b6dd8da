use proptest::prelude::*;
use uro0::tokenizer::{Lexer, TokenKind, token_text, tokenize};
use uro0::{Options, Target, compile};

const MAX_INPUT_BYTES: usize = 256;

const FIXED_LEXEMES: [&str; 24] = [
  "{", "}", "[", "]", "(", ")", ",", ":", ";", "=", "==", "+", "-", "*", "<", ">", "fn", "for",
  "in", "return", "extern", "asm", "True", "False",
];

fn lexeme() -> impl Strategy<Value = String> {
  prop_oneof![
    "[A-Za-z_][A-Za-z0-9_]{0,8}",
    (0i64..1_000_000_000).prop_map(|n| n.to_string()),
    "'[a-z ]{0,6}'",
    "\"[a-z]{0,6}\"",
    prop::sample::select(FIXED_LEXEMES.to_vec()).prop_map(str::to_string),
  ]
}

fn lexemes(source: &str) -> Vec<String> {
  tokenize(source)
    .unwrap()
    .iter()
    .filter(|token| token.kind != TokenKind::Eof)
    .map(|token| token_text(token, source).to_string())
    .collect()
}

proptest! {
  #[test]
  fn joined_lexemes_retokenize_identically(words in prop::collection::vec(lexeme(), 0..40)) {
    let source = words.join(" ");
    let first = lexemes(&source);
    prop_assert_eq!(&first, &words);
    let again = first.join(" ");
    prop_assert_eq!(lexemes(&again), first);
  }

  #[test]
  fn lexer_terminates_on_arbitrary_input(
    bytes in prop::collection::vec(any::<u8>(), 0..=MAX_INPUT_BYTES)
  ) {
    let input = String::from_utf8_lossy(&bytes).into_owned();
    let mut lexer = Lexer::new(&input);
    let produced = lexer.by_ref().take(input.len() + 2).count();
    prop_assert!(produced <= input.len() + 1);
    prop_assert!(lexer.next().is_none());
  }

  #[test]
  fn compiling_twice_gives_identical_text(
    name in "v_[a-z]{1,6}",
    keys in prop::collection::vec("k_[a-z]{1,5}", 1..6),
    n in 0i64..1000,
  ) {
    let entries: Vec<String> = keys.iter().map(|key| format!("{key}: {n}")).collect();
    let source = format!(
      "{name} = {{{}}};\nf = fn(d) {{ for k in d {{ last = k; }}; return d[last]; }};\nf({name});\n",
      entries.join(", ")
    );
    let options = Options::for_target(Target::Elf);
    let first = compile(&source, &options).unwrap();
    prop_assert_eq!(first, compile(&source, &options).unwrap());
  }
}
