use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use log::{LevelFilter, debug};
use snafu::ResultExt;

use uro0::Target;
use uro0::config::Options;
use uro0::error::{CompileResult, ReadSourceSnafu, WriteOutputSnafu};

struct Args {
  path: PathBuf,
  options: Options,
  debug: bool,
}

fn usage(program: &str) -> String {
  format!("usage: {program} [--target elf|macho] [--debug] <path>")
}

fn parse_args(args: &[String]) -> Result<Args, String> {
  let mut path = None;
  let mut options = Options::default();
  let mut debug = false;

  let mut iter = args.iter();
  while let Some(arg) = iter.next() {
    match arg.as_str() {
      "--debug" => debug = true,
      "--target" => {
        let value = iter.next().ok_or("--target needs a value")?;
        options.target = value.parse::<Target>().map_err(|err| err.to_string())?;
      }
      flag if flag.starts_with("--") => return Err(format!("unknown option `{flag}`")),
      file => {
        if path.replace(PathBuf::from(file)).is_some() {
          return Err("expected exactly one source path".to_string());
        }
      }
    }
  }

  let path = path.ok_or("missing source path")?;
  Ok(Args {
    path,
    options,
    debug,
  })
}

fn write_output(asm: &str) -> CompileResult<()> {
  let stdout = io::stdout();
  let mut handle = stdout.lock();
  handle.write_all(asm.as_bytes()).context(WriteOutputSnafu)?;
  handle.flush().context(WriteOutputSnafu)
}

fn main() {
  let argv: Vec<String> = env::args().collect();
  let program = argv.first().map(String::as_str).unwrap_or("uro0");
  let args = match parse_args(argv.get(1..).unwrap_or_default()) {
    Ok(args) => args,
    Err(message) => {
      eprintln!("{program}: {message}");
      eprintln!("{}", usage(program));
      process::exit(2);
    }
  };

  let level = if args.debug {
    LevelFilter::Debug
  } else {
    LevelFilter::Warn
  };
  env_logger::Builder::new()
    .filter_level(level)
    .parse_default_env()
    .init();

  let source = match fs::read_to_string(&args.path).context(ReadSourceSnafu {
    path: args.path.clone(),
  }) {
    Ok(source) => source,
    Err(err) => {
      eprintln!("{err}");
      process::exit(1);
    }
  };
  debug!("compiling {} for {:?}", args.path.display(), args.options.target);

  if let Err(err) = uro0::compile(&source, &args.options).and_then(|asm| write_output(&asm)) {
    eprintln!("{}", err.render(&source));
    process::exit(1);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
  }

  #[test]
  fn parses_target_and_debug() {
    let args = parse_args(&strings(&["--target", "macho", "--debug", "main.uro"])).unwrap();
    assert_eq!(args.options.target, Target::MachO);
    assert!(args.debug);
    assert_eq!(args.path, PathBuf::from("main.uro"));
  }

  #[test]
  fn rejects_bad_usage() {
    assert!(parse_args(&[]).is_err());
    assert!(parse_args(&strings(&["a.uro", "b.uro"])).is_err());
    assert!(parse_args(&strings(&["--target"])).is_err());
    assert!(parse_args(&strings(&["--target", "wasm", "a.uro"])).is_err());
    assert!(parse_args(&strings(&["--fast", "a.uro"])).is_err());
  }
}
