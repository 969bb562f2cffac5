//! Command-line front end: run scripts with stdin-backed `input()`, check
//! syntax, or compile to a bytecode file.

use std::{
    env, fs,
    io::{self, BufRead as _},
    path::{Path, PathBuf},
    process::ExitCode,
};

use pyrite::{Program, RunProgress, Runner, StdPrint, analyze};

const USAGE: &str = "usage: pyrite <run|check|compile> <script> [output]";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["run", path] | [path] => run(Path::new(path)),
        ["check", path] => check(Path::new(path)),
        ["compile", path] => compile(Path::new(path), None),
        ["compile", path, output] => compile(Path::new(path), Some(PathBuf::from(output))),
        _ => {
            eprintln!("{USAGE}");
            ExitCode::from(2)
        }
    }
}

/// Runs a script file, or a compiled program produced by `compile`.
fn run(path: &Path) -> ExitCode {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let runner = if let Ok(program) = Program::from_bytes(&bytes) {
        Runner::from_program(program)
    } else {
        let Ok(source) = String::from_utf8(bytes) else {
            eprintln!("{}: not UTF-8 source or compiled bytecode", path.display());
            return ExitCode::FAILURE;
        };
        match Runner::new(&source) {
            Ok(runner) => runner,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
    };

    let mut print = StdPrint;
    let mut progress = match runner.start(&mut print) {
        Ok(progress) => progress,
        Err(e) => {
            StdPrint::flush();
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    loop {
        match progress {
            RunProgress::Complete => {
                StdPrint::flush();
                return ExitCode::SUCCESS;
            }
            RunProgress::InputRequest(snapshot) => {
                // show any pending prompt before blocking on stdin
                StdPrint::flush();
                let mut line = String::new();
                if let Err(e) = io::stdin().lock().read_line(&mut line) {
                    eprintln!("stdin: {e}");
                    return ExitCode::FAILURE;
                }
                let input = trim_newline(&line);
                progress = match snapshot.run(input, &mut print) {
                    Ok(progress) => progress,
                    Err(e) => {
                        StdPrint::flush();
                        eprintln!("{e}");
                        return ExitCode::FAILURE;
                    }
                };
            }
        }
    }
}

/// Reports syntax diagnostics without running anything.
fn check(path: &Path) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let diagnostics = analyze(&source);
    if diagnostics.is_empty() {
        return ExitCode::SUCCESS;
    }
    for diagnostic in &diagnostics {
        eprintln!("{}: {}: {}", path.display(), diagnostic.range, diagnostic.message);
    }
    ExitCode::FAILURE
}

/// Compiles a script to a bytecode file (default: the script path with a
/// `pyrc` extension).
fn compile(path: &Path, output: Option<PathBuf>) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let runner = match Runner::new(&source) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let bytes = match runner.program().to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("encoding failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    let output = output.unwrap_or_else(|| path.with_extension("pyrc"));
    if let Err(e) = fs::write(&output, bytes) {
        eprintln!("{}: {e}", output.display());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn trim_newline(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}
