//! Diagnostics.
//!
//! Errors, warnings and internal compiler errors carry a source
//! location and are rendered through the terminal callback table: a
//! one-line header, the offending source line and a caret/underline
//! indicator.  When the error-on-warning flag is set, warnings are
//! counted as errors.

use std::io::Write;

use burin_vm::TermRef;

use crate::ast::Loc;

/// What a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The program is invalid.
    Error,
    /// A lint-grade observation.
    Warning,
    /// The compiler broke one of its own invariants.
    Internal,
}

/// Sink for diagnostics of one compilation.
pub struct Diagnostics {
    term: TermRef,
    /// Name of the compiled source, `<stdin>` for buffers.
    pub file: String,
    /// The source text, used to quote offending lines.
    pub source: String,
    /// Do not render anything, just count.
    pub quiet: bool,
    /// Count warnings as errors.
    pub error_on_warning: bool,
    errors: u32,
    warnings: u32,
}

impl Diagnostics {
    /// A sink for the given source buffer.
    pub fn new(term: TermRef, file: &str, source: &str) -> Diagnostics {
        Diagnostics {
            term,
            file: file.to_owned(),
            source: source.to_owned(),
            quiet: false,
            error_on_warning: false,
            errors: 0,
            warnings: 0,
        }
    }

    /// Number of errors reported so far.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Number of warnings reported so far.
    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    /// Report an error.
    pub fn error(&mut self, loc: Loc, msg: &str) {
        self.errors += 1;
        self.emit(Severity::Error, loc, msg);
    }

    /// Report a warning, promoting it when error-on-warning is set.
    pub fn warning(&mut self, loc: Loc, msg: &str) {
        if self.error_on_warning {
            self.error(loc, msg);
            return;
        }
        self.warnings += 1;
        self.emit(Severity::Warning, loc, msg);
    }

    /// Report an internal compiler error and dump the given state to a
    /// temporary file.
    pub fn internal(&mut self, loc: Loc, msg: &str, dump: &str) {
        self.errors += 1;
        self.emit(Severity::Internal, loc, msg);
        let path = std::env::temp_dir().join("burin-ice.dump");
        if let Ok(mut file) = std::fs::File::create(&path) {
            let _ = file.write_all(dump.as_bytes());
            if !self.quiet {
                self.term
                    .borrow_mut()
                    .puts(&format!("compiler state dumped to {}\n", path.display()));
            }
        }
    }

    fn emit(&mut self, severity: Severity, loc: Loc, msg: &str) {
        if self.quiet {
            return;
        }
        let mut term = self.term.borrow_mut();
        let (class, label) = match severity {
            Severity::Error => ("error", "error"),
            Severity::Warning => ("warning", "warning"),
            Severity::Internal => ("error", "internal compiler error"),
        };

        term.class_begin("error-filename");
        term.puts(&self.file);
        term.class_end("error-filename");
        term.class_begin("error-location");
        term.puts(&format!(":{}:{}:", loc.first_line, loc.first_column));
        term.class_end("error-location");
        term.puts(" ");
        term.class_begin(class);
        term.puts(label);
        term.class_end(class);
        term.puts(&format!(": {msg}\n"));

        // Quote the offending line with a caret/underline indicator.
        if loc.first_line > 0 {
            if let Some(line) = self.source.lines().nth(loc.first_line as usize - 1) {
                term.puts(line);
                term.puts("\n");
                let start = loc.first_column.max(1) as usize - 1;
                let end = if loc.last_line == loc.first_line && loc.last_column > loc.first_column {
                    loc.last_column as usize - 1
                } else {
                    start + 1
                };
                let mut indicator = String::with_capacity(end);
                for _ in 0..start {
                    indicator.push(' ');
                }
                indicator.push('^');
                for _ in start + 1..end {
                    indicator.push('~');
                }
                term.puts(&indicator);
                term.puts("\n");
            }
        }
        term.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burin_vm::CollectTerminal;

    #[test]
    fn error_quotes_line_and_caret() {
        let term = CollectTerminal::shared();
        let mut diags = Diagnostics::new(term.clone(), "<stdin>", "1 + bogus\n");
        diags.error(
            Loc {
                first_line: 1,
                first_column: 5,
                last_line: 1,
                last_column: 10,
            },
            "undefined identifier",
        );
        assert_eq!(diags.errors(), 1);
        let out = term.borrow().out.clone();
        assert!(out.contains("<stdin>:1:5: error: undefined identifier"));
        assert!(out.contains("1 + bogus"));
        assert!(out.contains("    ^~~~~"));
    }

    #[test]
    fn error_on_warning_promotes() {
        let term = CollectTerminal::shared();
        let mut diags = Diagnostics::new(term, "<stdin>", "");
        diags.error_on_warning = true;
        diags.warning(Loc::default(), "unreachable alternative");
        assert_eq!(diags.errors(), 1);
        assert_eq!(diags.warnings(), 0);
    }

    #[test]
    fn quiet_counts_without_output() {
        let term = CollectTerminal::shared();
        let mut diags = Diagnostics::new(term.clone(), "<stdin>", "x\n");
        diags.quiet = true;
        diags.error(Loc::default(), "nope");
        assert_eq!(diags.errors(), 1);
        assert!(term.borrow().out.is_empty());
    }
}
