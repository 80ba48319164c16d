//! Bytecode programs and the program builder.
//!
//! A program is a linear container of instructions.  Building one
//! follows the assembler discipline of the machine: the static
//! parameters of an instruction are appended first, then the
//! instruction itself; appending an instruction whose parameters do not
//! match its signature is an error.  Boxed values embedded as literals
//! are pinned in the heap for the lifetime of the program so the
//! collector treats them as roots.

use smallvec::SmallVec;
use std::str::FromStr;

use burin_asm::{Label, Opcode, OperandKind, RegisterId, Word};
use thiserror::Error;

use crate::heap::Heap;
use crate::terminal::TermRef;
use crate::value::{BoxId, Value};

/// Errors produced while assembling or finalizing a program.
#[derive(Debug, Error)]
pub enum AsmError {
    /// The mnemonic does not name an opcode.
    #[error("unknown instruction `{0}`")]
    UnknownOpcode(String),
    /// The parameters appended so far do not satisfy the instruction's
    /// signature, or a `push` was appended directly.
    #[error("invalid instruction `{0}`")]
    InvalidInstruction(String),
    /// The label was not allocated by this program's builder.
    #[error("invalid label {0}")]
    InvalidLabel(Label),
    /// A branch target was never appended to the instruction stream.
    #[error("unbound label {0}")]
    UnboundLabel(Label),
}

/// A static instruction parameter.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    /// A literal runtime value.
    Val(Value),
    /// An unsigned machine word.
    Uns(Word),
    /// A register identifier.
    Reg(RegisterId),
    /// A branch target.
    Lbl(Label),
}

impl Operand {
    fn kind(&self) -> OperandKind {
        match self {
            Operand::Val(_) => OperandKind::Val,
            Operand::Uns(_) => OperandKind::Uns,
            Operand::Reg(_) => OperandKind::Reg,
            Operand::Lbl(_) => OperandKind::Lbl,
        }
    }
}

/// One assembled instruction.
#[derive(Debug, Clone)]
pub struct Instr {
    /// The opcode.
    pub op: Opcode,
    /// Static parameters, in append order.
    pub operands: SmallVec<[Operand; 2]>,
}

/// An assembled program.
#[derive(Debug)]
pub struct Program {
    code: Vec<Instr>,
    labels: Vec<Option<usize>>,
    pinned: Vec<BoxId>,
    executable: bool,
}

impl Program {
    /// The instruction stream.
    pub fn code(&self) -> &[Instr] {
        &self.code
    }

    /// The instruction index a label is bound to.
    pub fn label_target(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Boxed literals embedded in the program.  The heap keeps these
    /// pinned until [`Program::destroy`].
    pub fn pinned(&self) -> &[BoxId] {
        &self.pinned
    }

    /// Whether [`Program::make_executable`] has completed.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Finalize the program: verify that every branch target is bound.
    /// Idempotent; a second call is a no-op.
    pub fn make_executable(&mut self) -> Result<(), AsmError> {
        if self.executable {
            return Ok(());
        }
        for instr in &self.code {
            for operand in &instr.operands {
                if let Operand::Lbl(label) = operand {
                    if self.label_target(*label).is_none() {
                        return Err(AsmError::UnboundLabel(*label));
                    }
                }
            }
        }
        self.executable = true;
        Ok(())
    }

    /// Release the program's pinned literals.
    pub fn destroy(self, heap: &mut Heap) {
        for id in &self.pinned {
            heap.unpin(*id);
        }
    }

    /// Print a listing of the program through the terminal callbacks.
    pub fn disassemble(&self, heap: &Heap, term: &TermRef) {
        let mut term = term.borrow_mut();
        for (ix, instr) in self.code.iter().enumerate() {
            for (l, target) in self.labels.iter().enumerate() {
                if *target == Some(ix) {
                    term.puts(&format!("{}:\n", Label(l as u32)));
                }
            }
            term.puts(&format!("        {}", instr.op.name()));
            for operand in &instr.operands {
                match operand {
                    Operand::Val(val) => term.puts(&format!(" {}", fmt_val(heap, *val))),
                    Operand::Uns(n) => term.puts(&format!(" {n}")),
                    Operand::Reg(r) => term.puts(&format!(" %r{r}")),
                    Operand::Lbl(l) => term.puts(&format!(" {l}")),
                }
            }
            term.puts("\n");
        }
        term.flush();
    }
}

/// Shallow value rendition used by disassembly listings.
fn fmt_val(heap: &Heap, val: Value) -> String {
    use crate::value::Boxed;
    match val {
        Value::Null => "null".into(),
        Value::Int { v, .. } => format!("{v}"),
        Value::Uint { v, .. } => format!("{v}U"),
        Value::Box(id) => match heap.get(id) {
            Boxed::Long { v, .. } => format!("{v}L"),
            Boxed::Ulong { v, .. } => format!("{v}UL"),
            Boxed::Str(s) => format!("{s:?}"),
            Boxed::Arr(_) => "#<array>".into(),
            Boxed::Sct(_) => "#<struct>".into(),
            Boxed::Off(_) => "#<offset>".into(),
            Boxed::Typ(_) => "#<type>".into(),
            Boxed::Cls(_) => "#<closure>".into(),
        },
    }
}

/// Incremental program assembler.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    code: Vec<Instr>,
    labels: Vec<Option<usize>>,
    pending: SmallVec<[Operand; 2]>,
    pinned: Vec<BoxId>,
}

impl ProgramBuilder {
    /// Create an empty builder.
    pub fn new() -> ProgramBuilder {
        ProgramBuilder::default()
    }

    /// Allocate a fresh, unbound label.
    pub fn fresh_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind a label to the next appended instruction.
    pub fn append_label(&mut self, label: Label) -> Result<(), AsmError> {
        match self.labels.get_mut(label.0 as usize) {
            Some(slot) => {
                *slot = Some(self.code.len());
                Ok(())
            }
            None => Err(AsmError::InvalidLabel(label)),
        }
    }

    /// Append a value parameter.  A boxed value is additionally pinned
    /// in the heap so the collector sees it as a root for the program's
    /// lifetime.
    pub fn append_val_parameter(&mut self, heap: &mut Heap, val: Value) {
        if let Some(id) = val.box_id() {
            heap.pin(id);
            self.pinned.push(id);
        }
        self.pending.push(Operand::Val(val));
    }

    /// Append an unsigned word parameter.
    pub fn append_unsigned_parameter(&mut self, n: Word) {
        self.pending.push(Operand::Uns(n));
    }

    /// Append a register parameter.
    pub fn append_register_parameter(&mut self, reg: RegisterId) {
        self.pending.push(Operand::Reg(reg));
    }

    /// Append a label parameter.
    pub fn append_label_parameter(&mut self, label: Label) -> Result<(), AsmError> {
        if label.0 as usize >= self.labels.len() {
            return Err(AsmError::InvalidLabel(label));
        }
        self.pending.push(Operand::Lbl(label));
        Ok(())
    }

    /// Append a named instruction, consuming the pending parameters.
    ///
    /// `push` cannot be appended this way; use
    /// [`ProgramBuilder::append_push`], which hides the wide-literal
    /// split on 32-bit hosts.
    pub fn append_instruction(&mut self, name: &str) -> Result<(), AsmError> {
        let op =
            Opcode::from_str(name).map_err(|_| AsmError::UnknownOpcode(name.to_owned()))?;
        if op == Opcode::Push {
            return Err(AsmError::InvalidInstruction(name.to_owned()));
        }
        self.append(op)
    }

    /// Append an instruction by opcode, consuming the pending
    /// parameters.
    pub fn append(&mut self, op: Opcode) -> Result<(), AsmError> {
        let signature = op.operands();
        if self.pending.len() != signature.len()
            || !self
                .pending
                .iter()
                .zip(signature)
                .all(|(operand, kind)| operand.kind() == *kind)
        {
            return Err(AsmError::InvalidInstruction(op.name().to_owned()));
        }
        self.code.push(Instr {
            op,
            operands: std::mem::take(&mut self.pending),
        });
        Ok(())
    }

    /// Append a `push` of the given literal.
    ///
    /// On 64-bit hosts this is a single `push` instruction.  On 32-bit
    /// hosts the raw 64-bit word is transparently split into a
    /// `pushhi`/`pushlo` pair (or a single `push32` when the high half
    /// is zero).
    pub fn append_push(&mut self, heap: &mut Heap, val: Value) {
        if let Some(id) = val.box_id() {
            heap.pin(id);
            self.pinned.push(id);
        }
        if cfg!(target_pointer_width = "32") {
            let raw = val.to_raw();
            if raw & !0xffff_ffffu64 != 0 {
                self.pending.push(Operand::Uns(raw >> 32));
                self.append(Opcode::PushHi).expect("pushhi signature");
                self.pending.push(Operand::Uns(raw & 0xffff_ffff));
                self.append(Opcode::PushLo).expect("pushlo signature");
            } else {
                self.pending.push(Operand::Uns(raw));
                self.append(Opcode::Push32).expect("push32 signature");
            }
        } else {
            self.pending.push(Operand::Val(val));
            self.append(Opcode::Push).expect("push signature");
        }
    }

    /// Finish assembling.  The program still needs
    /// [`Program::make_executable`] before it can run.
    pub fn finish(self) -> Program {
        Program {
            code: self.code,
            labels: self.labels,
            pinned: self.pinned,
            executable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_int;

    #[test]
    fn operands_before_instruction() {
        let mut heap = Heap::new();
        let mut builder = ProgramBuilder::new();
        builder.append_push(&mut heap, make_int(1, 32));
        // A pushvar without its lexical-address parameters is invalid.
        assert!(matches!(
            builder.append_instruction("pushvar"),
            Err(AsmError::InvalidInstruction(_))
        ));
        builder.append_unsigned_parameter(0);
        builder.append_unsigned_parameter(3);
        builder.append_instruction("pushvar").unwrap();
        // A register parameter does not satisfy an unsigned slot.
        builder.append_register_parameter(1);
        assert!(matches!(
            builder.append_instruction("pushf"),
            Err(AsmError::InvalidInstruction(_))
        ));
    }

    #[test]
    fn unknown_mnemonics_and_direct_push() {
        let mut builder = ProgramBuilder::new();
        assert!(matches!(
            builder.append_instruction("frobnicate"),
            Err(AsmError::UnknownOpcode(_))
        ));
        assert!(matches!(
            builder.append_instruction("push"),
            Err(AsmError::InvalidInstruction(_))
        ));
    }

    #[test]
    fn make_executable_is_idempotent() {
        let mut builder = ProgramBuilder::new();
        let label = builder.fresh_label();
        builder.append_label_parameter(label).unwrap();
        builder.append_instruction("ba").unwrap();
        builder.append_label(label).unwrap();
        builder.append_instruction("halt").unwrap();
        let mut program = builder.finish();
        program.make_executable().unwrap();
        assert!(program.is_executable());
        program.make_executable().unwrap();
        assert_eq!(program.label_target(label), Some(1));
    }

    #[test]
    fn unbound_labels_are_rejected() {
        let mut builder = ProgramBuilder::new();
        let label = builder.fresh_label();
        builder.append_label_parameter(label).unwrap();
        builder.append_instruction("ba").unwrap();
        let mut program = builder.finish();
        assert!(matches!(
            program.make_executable(),
            Err(AsmError::UnboundLabel(_))
        ));
    }

    #[test]
    fn literals_are_pinned_until_destroy() {
        let mut heap = Heap::new();
        let mut builder = ProgramBuilder::new();
        let lit = heap.make_string("literal");
        builder.append_push(&mut heap, lit);
        builder.append_instruction("halt").unwrap();
        let program = builder.finish();
        heap.collect([]);
        assert_eq!(heap.str(lit), Some("literal"));
        program.destroy(&mut heap);
        heap.collect([]);
        assert_eq!(heap.live(), 0);
    }
}
