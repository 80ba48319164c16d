//! Machine error types.
//!
//! Runtime exceptions (division by zero, out of bounds, …) are not
//! errors at this level: they are `Exception` values raised inside the
//! machine and possibly handled by the running program.  [`VmError`]
//! covers conditions that prevent a run from proceeding at all.

use thiserror::Error;

pub use crate::program::AsmError;

/// Errors surfaced by the machine itself.
#[derive(Debug, Error)]
pub enum VmError {
    /// The program was never finalized with `make_executable`.
    #[error("program is not executable")]
    NotExecutable,
    /// The instruction stream is malformed: an operand slot does not
    /// hold what the opcode requires.  Indicates a code-generator bug.
    #[error("malformed instruction: {0}")]
    Malformed(String),
    /// An assembler error bubbled up while building a helper program.
    #[error(transparent)]
    Asm(#[from] AsmError),
}

/// Exit status of one program run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The run completed and every raised exception was handled.
    Ok,
    /// The run was abandoned by an unhandled exception.
    Error,
}
