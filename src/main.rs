// File: src/main.rs
//
// Entry point: a thin CLI wrapper over the library's `Vm::interpret`.
// No args launches the REPL; one positional argument runs a script
// file; anything else is a usage error.

use clap::Parser;
use colored::Colorize;
use quill::repl::Repl;
use quill::vm::Vm;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "quill",
    about = "quill: a tree-less bytecode interpreter",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to a script file. Omit to launch the REPL.
    script: Option<PathBuf>,

    /// Dump each compiled chunk's disassembly to stderr before running it.
    #[arg(long)]
    disassemble: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(64);
        }
    };
    if cli.disassemble {
        std::env::set_var("QUILL_TRACE", "1");
    }

    match cli.script {
        None => {
            let mut repl = match Repl::new() {
                Ok(repl) => repl,
                Err(e) => {
                    eprintln!("{} failed to start REPL: {e}", "error:".red().bold());
                    return ExitCode::from(74);
                }
            };
            ExitCode::from(repl.run() as u8)
        }
        Some(path) => {
            let source = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    eprintln!("{} could not read '{}': {e}", "error:".red().bold(), path.display());
                    return ExitCode::from(74);
                }
            };
            let mut vm = Vm::new();
            let result = vm.interpret(&source);
            ExitCode::from(result.exit_code() as u8)
        }
    }
}
