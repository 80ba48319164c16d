//! The terminal callback table.
//!
//! Every piece of textual output the machine or the compiler produces —
//! printed values, diagnostics, disassembly listings — goes through
//! this table.  The embedding application decides what the styling
//! classes and hyperlinks mean; the library never writes to stdout
//! behind the table's back.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Output callbacks provided by the embedder.
pub trait Terminal {
    /// Flush buffered output.
    fn flush(&mut self);

    /// Write a string verbatim.
    fn puts(&mut self, s: &str);

    /// Start a new line indented `lvl * step` characters.
    fn indent(&mut self, lvl: u32, step: u32) {
        self.puts("\n");
        for _ in 0..lvl * step {
            self.puts(" ");
        }
    }

    /// Start a styling class.
    fn class_begin(&mut self, _name: &str) {}

    /// End the innermost styling class.
    fn class_end(&mut self, _name: &str) {}

    /// Start a hyperlink with the given target and optional id.
    fn hyperlink_begin(&mut self, _url: &str, _id: Option<&str>) {}

    /// End the innermost hyperlink.
    fn hyperlink_end(&mut self) {}
}

/// Shared handle to a terminal.
pub type TermRef = Rc<RefCell<dyn Terminal>>;

/// Terminal writing plainly to standard output, ignoring classes and
/// hyperlinks.
#[derive(Debug, Default)]
pub struct StdTerminal;

impl Terminal for StdTerminal {
    fn flush(&mut self) {
        let _ = std::io::stdout().flush();
    }

    fn puts(&mut self, s: &str) {
        print!("{s}");
    }
}

/// Terminal collecting output into a string.  Classes are recorded as
/// `<name>`/`</name>` markers so tests can assert on styling.
#[derive(Debug, Default)]
pub struct CollectTerminal {
    /// Everything written so far.
    pub out: String,
    /// Record class markers in `out` when set.
    pub record_classes: bool,
}

impl CollectTerminal {
    /// A shared handle to a fresh collecting terminal.
    pub fn shared() -> Rc<RefCell<CollectTerminal>> {
        Rc::new(RefCell::new(CollectTerminal::default()))
    }
}

impl Terminal for CollectTerminal {
    fn flush(&mut self) {}

    fn puts(&mut self, s: &str) {
        self.out.push_str(s);
    }

    fn class_begin(&mut self, name: &str) {
        if self.record_classes {
            self.out.push_str(&format!("<{name}>"));
        }
    }

    fn class_end(&mut self, name: &str) {
        if self.record_classes {
            self.out.push_str(&format!("</{name}>"));
        }
    }
}

/// A shared handle to a standard-output terminal.
pub fn std_terminal() -> TermRef {
    Rc::new(RefCell::new(StdTerminal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_terminal_records() {
        let term = CollectTerminal::shared();
        {
            let mut t = term.borrow_mut();
            t.record_classes = true;
            t.class_begin("integer");
            t.puts("42");
            t.class_end("integer");
            t.indent(1, 2);
        }
        assert_eq!(term.borrow().out, "<integer>42</integer>\n  ");
    }
}
