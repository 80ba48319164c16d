//! The machine proper: run state, instruction dispatch and exception
//! unwinding.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burin_asm::{ExceptionCode, Opcode, Word};
use tracing::trace;

use crate::env::Env;
use crate::error::{ExitCode, VmError};
use crate::heap::Heap;
use crate::ios::{Endian, IosRegistry, Nenc};
use crate::program::{Instr, Operand, Program};
use crate::terminal::{std_terminal, TermRef};
use crate::value::{Boxed, Value};

/// Output mode for composite values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OMode {
    /// Single-line output.
    #[default]
    Flat,
    /// One field per line, indented.
    Tree,
}

/// Output and I/O settings of a machine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Numeration base for integers: 2, 8, 10 or 16.
    pub obase: u32,
    /// Maximum print depth for composites, 0 for unlimited.
    pub odepth: u32,
    /// Indentation step in tree mode.
    pub oindent: u32,
    /// Maximum printed array elements, 0 for unlimited.
    pub oacutoff: u32,
    /// Print mapping information of mapped values.
    pub omaps: bool,
    /// Flat or tree output.
    pub omode: OMode,
    /// Byte order for I/O.
    pub endian: Endian,
    /// Negative encoding for I/O.
    pub nenc: Nenc,
    /// Use `_print` methods when printing structs.
    pub pretty_print: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            obase: 10,
            odepth: 0,
            oindent: 2,
            oacutoff: 0,
            omaps: false,
            omode: OMode::Flat,
            endian: Endian::default(),
            nenc: Nenc::default(),
            pretty_print: false,
        }
    }
}

/// A pushed exception handler.
struct Handler {
    program: Rc<Program>,
    pc: usize,
    frames_depth: usize,
    stack_depth: usize,
    env: Env,
}

/// A pending return address.
struct ReturnFrame {
    program: Rc<Program>,
    pc: usize,
    env: Env,
}

/// Per-run interpreter state.  The operand stack, the return stack and
/// the handler stack are GC roots while the run is in progress.
pub(crate) struct RunState {
    pub(crate) stack: Vec<Value>,
    frames: Vec<ReturnFrame>,
    handlers: Vec<Handler>,
    pending_hi: Option<u64>,
}

/// The virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) env: Env,
    pub(crate) ios: IosRegistry,
    pub(crate) term: TermRef,
    pub(crate) settings: Settings,
    interrupt: Arc<AtomicBool>,
}

impl Vm {
    /// Create a machine with an empty top-level frame and the given
    /// terminal.
    pub fn new(term: TermRef) -> Vm {
        Vm {
            heap: Heap::new(),
            env: Env::new(0),
            ios: IosRegistry::default(),
            term,
            settings: Settings::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a machine writing to standard output.
    pub fn with_std_terminal() -> Vm {
        Vm::new(std_terminal())
    }

    /// The boxed-value heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable access to the heap.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The run-time environment.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// The I/O space registry.
    pub fn ios(&self) -> &IosRegistry {
        &self.ios
    }

    /// Mutable access to the I/O space registry.
    pub fn ios_mut(&mut self) -> &mut IosRegistry {
        &mut self.ios
    }

    /// The terminal handle.
    pub fn term(&self) -> TermRef {
        self.term.clone()
    }

    /// The machine settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mutable access to the machine settings.  `obase` is validated by
    /// [`Vm::set_obase`]; the rest can be set freely.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Set the numeration base.  Values other than 2, 8, 10 and 16 are
    /// rejected.
    pub fn set_obase(&mut self, obase: u32) -> bool {
        if matches!(obase, 2 | 8 | 10 | 16) {
            self.settings.obase = obase;
            true
        } else {
            false
        }
    }

    /// A handle the embedder's signal handler can set to interrupt the
    /// run at the next safe point.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Collect garbage between runs.  The run-time environment is the
    /// only root; pinned program literals survive implicitly.
    pub fn collect_now(&mut self) {
        let mut roots: Vec<Value> = Vec::new();
        self.env.for_each_value(|v| roots.push(v));
        self.heap.collect(roots);
    }

    /// Run an executable program.  Returns the exit code and the value
    /// left at the top of the stack (null when the stack is empty).
    pub fn run(&mut self, program: &Rc<Program>) -> Result<(ExitCode, Value), VmError> {
        if !program.is_executable() {
            return Err(VmError::NotExecutable);
        }
        let mut st = RunState {
            stack: Vec::new(),
            frames: Vec::new(),
            handlers: Vec::new(),
            pending_hi: None,
        };
        // The environment depth at entry; an unhandled exception must
        // not leave stray frames behind.
        let base_env = self.env.clone();

        let mut program = program.clone();
        let mut pc = 0usize;

        loop {
            if pc >= program.code().len() {
                // Fell off the end of a routine body without `ret`.
                match self.unwind(&mut st, ExceptionCode::NoReturn, &mut program, &mut pc) {
                    Some(()) => continue,
                    None => {
                        self.env = base_env;
                        return Ok((ExitCode::Error, Value::Null));
                    }
                }
            }
            let instr = program.code()[pc].clone();
            trace!(pc, op = %instr.op, "exec");
            pc += 1;

            if instr.op.is_branch() {
                if self.interrupt.swap(false, Ordering::Relaxed) {
                    match self.unwind(&mut st, ExceptionCode::Signal, &mut program, &mut pc) {
                        Some(()) => continue,
                        None => {
                            self.env = base_env;
                            return Ok((ExitCode::Error, Value::Null));
                        }
                    }
                }
                if self.heap.wants_collection() {
                    self.collect_garbage(&st, &program);
                }
            }

            match self.step(&mut st, &instr, &mut program, &mut pc)? {
                Step::Next => {}
                Step::Halt => {
                    let val = st.stack.pop().unwrap_or(Value::Null);
                    return Ok((ExitCode::Ok, val));
                }
                Step::Raise(exn) => {
                    match self.dispatch_exception(&mut st, exn, &mut program, &mut pc) {
                        Some(()) => {}
                        None => {
                            self.env = base_env;
                            let code = self.exception_code(exn);
                            if code == Some(ExceptionCode::Exit) {
                                let status = self
                                    .heap
                                    .ref_struct(exn, "exit_status")
                                    .and_then(|v| self.heap.as_i64(v))
                                    .unwrap_or(0);
                                let exit = if status == 0 { ExitCode::Ok } else { ExitCode::Error };
                                return Ok((exit, Value::Null));
                            }
                            self.report_unhandled(exn);
                            return Ok((ExitCode::Error, Value::Null));
                        }
                    }
                }
            }
        }
    }

    /// Raise `code` as an exception value, transferring to a handler if
    /// one is active.  Returns `None` when unhandled.
    fn unwind(
        &mut self,
        st: &mut RunState,
        code: ExceptionCode,
        program: &mut Rc<Program>,
        pc: &mut usize,
    ) -> Option<()> {
        let exn = self.heap.make_exception(code, code.msg(), code.exit_status());
        self.dispatch_exception(st, exn, program, pc)
    }

    fn dispatch_exception(
        &mut self,
        st: &mut RunState,
        exn: Value,
        program: &mut Rc<Program>,
        pc: &mut usize,
    ) -> Option<()> {
        let handler = st.handlers.pop()?;
        st.frames.truncate(handler.frames_depth);
        st.stack.truncate(handler.stack_depth);
        self.env = handler.env;
        *program = handler.program;
        *pc = handler.pc;
        st.stack.push(exn);
        Some(())
    }

    fn exception_code(&self, exn: Value) -> Option<ExceptionCode> {
        let code = self.heap.ref_struct(exn, "code")?;
        let code = self.heap.as_i64(code)?;
        Some(ExceptionCode::from(code as u8))
    }

    fn report_unhandled(&mut self, exn: Value) {
        let msg = self
            .heap
            .ref_struct(exn, "msg")
            .and_then(|v| self.heap.str(v))
            .unwrap_or("")
            .to_owned();
        let term = self.term.clone();
        let mut term = term.borrow_mut();
        term.class_begin("error");
        term.puts(&format!("unhandled {msg} exception\n"));
        term.class_end("error");
        term.flush();
    }

    fn collect_garbage(&mut self, st: &RunState, program: &Rc<Program>) {
        let mut roots: Vec<Value> = Vec::new();
        roots.extend(st.stack.iter().copied());
        self.env.for_each_value(|v| roots.push(v));
        for frame in &st.frames {
            frame.env.for_each_value(|v| roots.push(v));
            roots.extend(frame.program.pinned().iter().map(|id| Value::Box(*id)));
        }
        for handler in &st.handlers {
            handler.env.for_each_value(|v| roots.push(v));
            roots.extend(handler.program.pinned().iter().map(|id| Value::Box(*id)));
        }
        roots.extend(program.pinned().iter().map(|id| Value::Box(*id)));
        self.heap.collect(roots);
    }

    fn pop(&self, st: &mut RunState) -> Result<Value, VmError> {
        st.stack
            .pop()
            .ok_or_else(|| VmError::Malformed("operand stack underflow".into()))
    }

    fn step(
        &mut self,
        st: &mut RunState,
        instr: &Instr,
        program: &mut Rc<Program>,
        pc: &mut usize,
    ) -> Result<Step, VmError> {
        use Opcode::*;

        macro_rules! raise {
            ($code:expr) => {{
                let code: ExceptionCode = $code;
                let exn = self.heap.make_exception(code, code.msg(), code.exit_status());
                return Ok(Step::Raise(exn));
            }};
        }
        macro_rules! try_exn {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(code) => raise!(code),
                }
            };
        }

        match instr.op {
            Push => {
                let val = self.val_operand(instr, 0)?;
                st.stack.push(val);
            }
            PushHi => {
                st.pending_hi = Some(self.uns_operand(instr, 0)? << 32);
            }
            PushLo => {
                let hi = st.pending_hi.take().ok_or_else(|| {
                    VmError::Malformed("pushlo without a preceding pushhi".into())
                })?;
                let raw = hi | (self.uns_operand(instr, 0)? & 0xffff_ffff);
                st.stack.push(Value::from_raw(raw));
            }
            Push32 => {
                let raw = self.uns_operand(instr, 0)? & 0xffff_ffff;
                st.stack.push(Value::from_raw(raw));
            }
            Drop => {
                self.pop(st)?;
            }
            Dup => {
                let a = self.pop(st)?;
                st.stack.push(a);
                st.stack.push(a);
            }
            Swap => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                st.stack.push(b);
                st.stack.push(a);
            }
            Rot => {
                let c = self.pop(st)?;
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                st.stack.push(b);
                st.stack.push(c);
                st.stack.push(a);
            }
            Nip => {
                let b = self.pop(st)?;
                let _a = self.pop(st)?;
                st.stack.push(b);
            }

            Pushf => {
                let hint = self.uns_operand(instr, 0)? as usize;
                self.env = self.env.push_frame(hint);
            }
            Popf => {
                self.env = self.env.pop_frame();
            }
            Popvar => {
                let val = self.pop(st)?;
                self.env.register(val);
            }
            Pushvar => {
                let back = self.uns_operand(instr, 0)? as usize;
                let over = self.uns_operand(instr, 1)? as usize;
                st.stack.push(self.env.lookup(back, over));
            }
            Setvar => {
                let back = self.uns_operand(instr, 0)? as usize;
                let over = self.uns_operand(instr, 1)? as usize;
                let val = self.pop(st)?;
                self.env.set_var(back, over, val);
            }

            Ba => {
                *pc = self.label_operand(instr, 0, program)?;
            }
            Bz | Bnz => {
                let cond = self.pop(st)?;
                let taken = match self.heap.as_i64(cond) {
                    Some(v) => (v == 0) == (instr.op == Bz),
                    None => raise!(ExceptionCode::Inval),
                };
                if taken {
                    *pc = self.label_operand(instr, 0, program)?;
                }
            }
            Call => {
                let cls = self.pop(st)?;
                let callee = match cls.box_id().map(|id| self.heap.get(id)) {
                    Some(Boxed::Cls(c)) => Some((c.program.clone(), c.env.clone())),
                    _ => None,
                };
                let Some((callee, Some(callee_env))) = callee else {
                    raise!(ExceptionCode::Inval);
                };
                st.frames.push(ReturnFrame {
                    program: program.clone(),
                    pc: *pc,
                    env: std::mem::replace(&mut self.env, callee_env),
                });
                *program = callee;
                *pc = 0;
            }
            Ret => match st.frames.pop() {
                Some(frame) => {
                    self.env = frame.env;
                    *program = frame.program;
                    *pc = frame.pc;
                }
                None => return Ok(Step::Halt),
            },
            Halt => return Ok(Step::Halt),
            Pec => {
                let cls = self.pop(st)?;
                let is_closure =
                    matches!(cls.box_id().map(|id| self.heap.get(id)), Some(Boxed::Cls(_)));
                if !is_closure {
                    raise!(ExceptionCode::Inval);
                }
                let env = self.env.clone();
                if let Some(Boxed::Cls(c)) = cls.box_id().map(|id| self.heap.get_mut(id)) {
                    c.env = Some(env);
                }
                st.stack.push(cls);
            }

            Pushe => {
                let target = self.label_operand(instr, 0, program)?;
                st.handlers.push(Handler {
                    program: program.clone(),
                    pc: target,
                    frames_depth: st.frames.len(),
                    stack_depth: st.stack.len(),
                    env: self.env.clone(),
                });
            }
            Pope => {
                st.handlers.pop().ok_or_else(|| {
                    VmError::Malformed("pope without a pushed handler".into())
                })?;
            }
            Raise => {
                let exn = self.pop(st)?;
                return Ok(Step::Raise(exn));
            }

            Add | Sub | Mul | Div | Cdiv | Mod | Pow | BAnd | BOr | BXor | Bsl | Bsr | And
            | Or => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                let res = try_exn!(self.arith(instr.op, a, b));
                st.stack.push(res);
            }
            Eq | Ne | Lt | Le | Gt | Ge => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                let res = try_exn!(self.compare(instr.op, a, b));
                st.stack.push(res);
            }
            Neg | Not | BNot => {
                let a = self.pop(st)?;
                let res = try_exn!(self.unary(instr.op, a));
                st.stack.push(res);
            }
            BConc => {
                let typ = self.pop(st)?;
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                let res = try_exn!(self.bit_concat(a, b, typ));
                st.stack.push(res);
            }
            Cast => {
                let typ = self.pop(st)?;
                let val = self.pop(st)?;
                let res = try_exn!(self.cast(val, typ));
                st.stack.push(res);
            }

            Mko => {
                let unit = self.pop(st)?;
                let mag = self.pop(st)?;
                let off = self.heap.make_offset(mag, unit);
                if off.is_null() {
                    raise!(ExceptionCode::Inval);
                }
                st.stack.push(off);
            }
            Ogetm => {
                let off = self.pop(st)?;
                let mag = match off.box_id().map(|id| self.heap.get(id)) {
                    Some(Boxed::Off(o)) => Some(o.magnitude),
                    _ => None,
                };
                match mag {
                    Some(mag) => st.stack.push(mag),
                    None => raise!(ExceptionCode::Inval),
                }
            }
            Ogetu => {
                let off = self.pop(st)?;
                let unit = match off.box_id().map(|id| self.heap.get(id)) {
                    Some(Boxed::Off(o)) => Some(o.unit),
                    _ => None,
                };
                match unit {
                    Some(unit) => st.stack.push(unit),
                    None => raise!(ExceptionCode::Inval),
                }
            }

            Mka => {
                let nelem = self.uns_operand(instr, 0)?;
                let res = try_exn!(self.make_array_value(st, nelem));
                st.stack.push(res);
            }
            Mksct => {
                let nfields = self.uns_operand(instr, 0)?;
                let nmethods = self.uns_operand(instr, 1)?;
                let res = try_exn!(self.make_struct_value(st, nfields, nmethods));
                st.stack.push(res);
            }
            Aref => {
                let idx = self.pop(st)?;
                let agg = self.pop(st)?;
                let res = try_exn!(self.aggregate_ref(agg, idx));
                st.stack.push(res);
            }
            Aset => {
                let val = self.pop(st)?;
                let idx = self.pop(st)?;
                let arr = self.pop(st)?;
                try_exn!(self.array_set(arr, idx, val));
                st.stack.push(arr);
            }
            Atrim => {
                let hi = self.pop(st)?;
                let lo = self.pop(st)?;
                let agg = self.pop(st)?;
                let res = try_exn!(self.aggregate_trim(agg, lo, hi));
                st.stack.push(res);
            }
            Ain => {
                let arr = self.pop(st)?;
                let elem = self.pop(st)?;
                let res = try_exn!(self.array_in(elem, arr));
                st.stack.push(res);
            }
            Ains => {
                let val = self.pop(st)?;
                let arr = self.pop(st)?;
                try_exn!(self.array_append(arr, val));
                st.stack.push(arr);
            }
            Asplice => {
                let src = self.pop(st)?;
                let hi = self.pop(st)?;
                let lo = self.pop(st)?;
                let arr = self.pop(st)?;
                try_exn!(self.array_splice(arr, lo, hi, src));
                st.stack.push(arr);
            }
            Sref => {
                let name = self.pop(st)?;
                let sct = self.pop(st)?;
                let name = self
                    .heap
                    .str(name)
                    .ok_or_else(|| VmError::Malformed("sref needs a string name".into()))?
                    .to_owned();
                match self.heap.ref_struct(sct, &name) {
                    Some(val) => st.stack.push(val),
                    None => raise!(ExceptionCode::Elem),
                }
            }
            Sset => {
                let val = self.pop(st)?;
                let name = self.pop(st)?;
                let sct = self.pop(st)?;
                let name = self
                    .heap
                    .str(name)
                    .ok_or_else(|| VmError::Malformed("sset needs a string name".into()))?
                    .to_owned();
                if !self.heap.set_struct(sct, &name, val) {
                    raise!(ExceptionCode::Elem);
                }
                st.stack.push(sct);
            }

            Mktyi => {
                let signed = self.pop(st)?;
                let size = self.pop(st)?;
                let signed = self.heap.as_i64(signed).unwrap_or(0) != 0;
                let size = self.heap.as_u64(size).unwrap_or(32);
                let t = self.heap.make_integral_type(size, signed);
                st.stack.push(t);
            }
            Mktys => {
                let t = self.heap.make_string_type();
                st.stack.push(t);
            }
            MktyAny => {
                let t = self.heap.make_any_type();
                st.stack.push(t);
            }
            Mktya => {
                let bound = self.pop(st)?;
                let etype = self.pop(st)?;
                let t = self.heap.make_array_type(etype, bound);
                st.stack.push(t);
            }
            Mktyo => {
                let unit = self.pop(st)?;
                let base = self.pop(st)?;
                let unit = self.heap.as_u64(unit).unwrap_or(1);
                let t = self.heap.make_offset_type(base, unit);
                st.stack.push(t);
            }
            MktySct => {
                let nfields = self.uns_operand(instr, 0)?;
                let name = self.pop(st)?;
                let mut fnames = Vec::with_capacity(nfields as usize);
                let mut ftypes = Vec::with_capacity(nfields as usize);
                for _ in 0..nfields {
                    let ftype = self.pop(st)?;
                    let fname = self.pop(st)?;
                    fnames.push(fname);
                    ftypes.push(ftype);
                }
                fnames.reverse();
                ftypes.reverse();
                let t = self.heap.make_struct_type(name, fnames, ftypes);
                st.stack.push(t);
            }
            MktyC => {
                let nargs = self.uns_operand(instr, 0)?;
                let rtype = self.pop(st)?;
                let mut atypes = Vec::with_capacity(nargs as usize);
                for _ in 0..nargs {
                    atypes.push(self.pop(st)?);
                }
                atypes.reverse();
                let t = self.heap.make_closure_type(rtype, atypes);
                st.stack.push(t);
            }

            Map => {
                let off = self.pop(st)?;
                let ios = self.pop(st)?;
                let typ = self.pop(st)?;
                let res = try_exn!(self.map_value(typ, ios, off));
                st.stack.push(res);
            }
            Mseto => {
                let off = self.pop(st)?;
                let val = self.pop(st)?;
                try_exn!(self.set_mapping(val, |arr| &mut arr.boffset, |sct| &mut sct.boffset, off));
                st.stack.push(val);
            }
            MsetIos => {
                let ios = self.pop(st)?;
                let val = self.pop(st)?;
                // A null space stands for the current one.
                let ios = match ios {
                    Value::Null => match self.ios.cur() {
                        Some(cur) => crate::value::make_int(cur, 32),
                        None => raise!(ExceptionCode::NoIos),
                    },
                    other => other,
                };
                try_exn!(self.set_mapping(val, |arr| &mut arr.ios, |sct| &mut sct.ios, ios));
                st.stack.push(val);
            }
            Msetm => {
                let cls = self.pop(st)?;
                let val = self.pop(st)?;
                try_exn!(self.set_mapping(val, |arr| &mut arr.mapper, |sct| &mut sct.mapper, cls));
                st.stack.push(val);
            }
            Msetw => {
                let cls = self.pop(st)?;
                let val = self.pop(st)?;
                try_exn!(self.set_mapping(val, |arr| &mut arr.writer, |sct| &mut sct.writer, cls));
                st.stack.push(val);
            }

            Siz => {
                let val = self.pop(st)?;
                let bits = self.heap.size_of(val);
                let mag = self.heap.make_ulong(bits, 64);
                let unit = self.heap.make_ulong(1, 64);
                let off = self.heap.make_offset(mag, unit);
                st.stack.push(off);
            }
            Typof => {
                let val = self.pop(st)?;
                let t = self.heap.type_of(val);
                st.stack.push(t);
            }
            Sel => {
                let val = self.pop(st)?;
                let n = self.heap.elems_of(val);
                st.stack.push(n);
            }

            Print => {
                let val = self.pop(st)?;
                self.print_val(val);
            }
            Nop => {}
        }
        Ok(Step::Next)
    }

    fn val_operand(&self, instr: &Instr, ix: usize) -> Result<Value, VmError> {
        match instr.operands.get(ix) {
            Some(Operand::Val(val)) => Ok(*val),
            _ => Err(VmError::Malformed(format!("{} needs a value operand", instr.op))),
        }
    }

    fn uns_operand(&self, instr: &Instr, ix: usize) -> Result<Word, VmError> {
        match instr.operands.get(ix) {
            Some(Operand::Uns(n)) => Ok(*n),
            _ => Err(VmError::Malformed(format!(
                "{} needs an unsigned operand",
                instr.op
            ))),
        }
    }

    fn label_operand(
        &self,
        instr: &Instr,
        ix: usize,
        program: &Rc<Program>,
    ) -> Result<usize, VmError> {
        match instr.operands.get(ix) {
            Some(Operand::Lbl(label)) => program
                .label_target(*label)
                .ok_or_else(|| VmError::Malformed(format!("unbound {label}"))),
            _ => Err(VmError::Malformed(format!("{} needs a label operand", instr.op))),
        }
    }
}

/// Outcome of one dispatched instruction.
enum Step {
    Next,
    Halt,
    Raise(Value),
}
