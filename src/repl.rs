// File: src/repl.rs
//
// Interactive REPL. Reads one line at a time, capped at 1024 bytes,
// and feeds each line to the *same* `Vm` for the whole
// session — that's what makes `var`/`fun`/`class` declared on one line
// visible on the next. A single line's compile or runtime error is
// reported and the session continues; only EOF or `.exit` ends it.

use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const MAX_LINE_BYTES: usize = 1024;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    /// Runs until EOF or `.exit`. Always returns 0 — a single line's
    /// error never aborts the session, so there's nothing else to
    /// propagate as an exit code.
    pub fn run(&mut self) -> i32 {
        loop {
            match self.editor.readline("quill> ") {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    match line.trim() {
                        ".exit" => return 0,
                        ".clear" => {
                            self.vm = Vm::new();
                            println!("{}", "environment reset".dimmed());
                        }
                        _ => self.eval_line(&line),
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => return 0,
                Err(e) => {
                    eprintln!("{} {e}", "error:".red().bold());
                    return 0;
                }
            }
        }
    }

    fn eval_line(&mut self, line: &str) {
        let mut bytes = line.as_bytes();
        if bytes.len() > MAX_LINE_BYTES {
            eprintln!("{} line truncated to {MAX_LINE_BYTES} bytes", "warning:".yellow().bold());
            bytes = &bytes[..MAX_LINE_BYTES];
        }
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        self.vm.interpret(bytes);
    }
}
