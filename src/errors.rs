// File: src/errors.rs
//
// Structured error types for the compiler and VM. The `Display` impls
// render a fixed plain-text wire format, with no color codes — `colored`
// is reserved for the shell's own terminal output in main.rs/repl.rs.

use std::fmt;

/// One reported syntax or semantic problem. `compile` continues parsing
/// after each one (via `synchronize`) so several can be reported per run;
/// `compile` fails overall if at least one was produced.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: usize,
    /// `None` for an EOF error ("at end") or for scanner `Error` tokens,
    /// whose location carries no lexeme to echo.
    pub at: Option<String>,
    pub at_end: bool,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        if self.at_end {
            write!(f, " at end")?;
        } else if let Some(lexeme) = &self.at {
            write!(f, " at '{lexeme}'")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// A runtime fault. Carries enough to reproduce the frame-by-frame call
/// stack at the moment it fired.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    /// One "[line N] in <fn>" entry per live call frame, top (innermost)
    /// first, already formatted by the VM at the moment the error fired.
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, line) in self.trace.iter().enumerate() {
            if i + 1 == self.trace.len() {
                write!(f, "{line}")?;
            } else {
                writeln!(f, "{line}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    /// Mirrors the sysexits.h convention: 0 success, 65 data/compile
    /// error, 70 internal/runtime error.
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError => 65,
            InterpretResult::RuntimeError => 70,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_at_lexeme() {
        let e = CompileError {
            line: 3,
            at: Some("+".to_string()),
            at_end: false,
            message: "Expect expression.".to_string(),
        };
        assert_eq!(e.to_string(), "[line 3] Error at '+': Expect expression.");
    }

    #[test]
    fn formats_at_end() {
        let e = CompileError { line: 9, at: None, at_end: true, message: "Expect ';'.".to_string() };
        assert_eq!(e.to_string(), "[line 9] Error at end: Expect ';'.");
    }

    #[test]
    fn runtime_error_includes_frame_trace() {
        let e = RuntimeError {
            message: "Undefined variable 'x'.".to_string(),
            trace: vec!["[line 1] in script".to_string()],
        };
        assert_eq!(e.to_string(), "Undefined variable 'x'.\n[line 1] in script");
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(InterpretResult::Ok.exit_code(), 0);
        assert_eq!(InterpretResult::CompileError.exit_code(), 65);
        assert_eq!(InterpretResult::RuntimeError.exit_code(), 70);
    }
}
