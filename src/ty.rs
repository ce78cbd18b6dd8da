//! Runtime value representation.
//!
//! Every value is exactly one machine word. Numbers and booleans are tagged
//! immediates; everything else is a pointer to an 8-aligned object whose first
//! word is an [`ObjectTag`].
//!
//! ```text
//! number      (n << 1) | 1
//! False       0b0010
//! True        0b0110
//! string      -> [tag=2][length][bytes ... NUL]
//! dictionary  -> [tag=3][head entry][tail entry][count]
//! entry       -> [key][value][next entry]
//! function    -> [tag=4][code address]
//! ```

/// Bytes in a machine word.
pub const WORD: i64 = 8;

/// Largest literal that survives the one-bit number tag.
pub const MAX_NUMBER: i64 = i64::MAX >> 1;

pub const FALSE_WORD: i64 = 0b0010;
pub const TRUE_WORD: i64 = 0b0110;

pub const STR_LEN: i64 = 8;
pub const STR_BYTES: i64 = 16;

pub const DICT_HEAD: i64 = 8;
pub const DICT_TAIL: i64 = 16;
pub const DICT_COUNT: i64 = 24;
pub const DICT_SIZE: i64 = 32;

pub const ENTRY_KEY: i64 = 0;
pub const ENTRY_VALUE: i64 = 8;
pub const ENTRY_NEXT: i64 = 16;
pub const ENTRY_SIZE: i64 = 24;

pub const FUNCTION_CODE: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectTag {
  Str = 2,
  Dict = 3,
  Function = 4,
}

impl ObjectTag {
  pub fn word(self) -> i64 {
    self as i64
  }
}

pub fn number_word(value: i64) -> i64 {
  (value << 1) | 1
}

pub fn bool_word(value: bool) -> i64 {
  if value { TRUE_WORD } else { FALSE_WORD }
}

/// Whether a word can be pushed as a sign-extended 32-bit immediate.
pub fn fits_imm32(word: i64) -> bool {
  i32::try_from(word).is_ok()
}

/// Ways a generated program can fail at run time, with the exit status each
/// one terminates the process with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
  KeyError,
  NotIndexable,
  NotCallable,
  NotIterable,
  OutOfMemory,
  NotANumber,
}

impl Failure {
  pub const ALL: [Failure; 6] = [
    Failure::KeyError,
    Failure::NotIndexable,
    Failure::NotCallable,
    Failure::NotIterable,
    Failure::OutOfMemory,
    Failure::NotANumber,
  ];

  pub fn exit_code(self) -> i64 {
    match self {
      Failure::KeyError => 3,
      Failure::NotIndexable => 4,
      Failure::NotCallable => 5,
      Failure::NotIterable => 6,
      Failure::OutOfMemory => 7,
      Failure::NotANumber => 8,
    }
  }

  pub fn message(self) -> &'static str {
    match self {
      Failure::KeyError => "KeyError: key not found in dictionary\n",
      Failure::NotIndexable => "TypeError: value is not a dictionary\n",
      Failure::NotCallable => "TypeError: value is not callable\n",
      Failure::NotIterable => "TypeError: value is not iterable\n",
      Failure::OutOfMemory => "MemoryError: out of memory\n",
      Failure::NotANumber => "TypeError: arithmetic operand is not a number\n",
    }
  }

  /// Label of the runtime stub that reports this failure.
  pub fn label(self) -> &'static str {
    match self {
      Failure::KeyError => "uro_fail_key",
      Failure::NotIndexable => "uro_fail_index",
      Failure::NotCallable => "uro_fail_call",
      Failure::NotIterable => "uro_fail_iter",
      Failure::OutOfMemory => "uro_fail_oom",
      Failure::NotANumber => "uro_fail_number",
    }
  }
}
