//! Value printing.
//!
//! Output honors the machine settings: numeration base, flat or tree
//! mode, indentation step, depth limit, array cutoff and map-offset
//! display.  Every fragment is wrapped in the styling class the
//! embedder expects (`integer`, `string`, `array`, `struct`, …).  When
//! pretty-printing is enabled, structs with a `_print` method are
//! rendered by calling the method instead.

use std::rc::Rc;

use burin_asm::Opcode;

use crate::error::{ExitCode, VmError};
use crate::program::ProgramBuilder;
use crate::units;
use crate::value::{mask64, Boxed, TypeVal, Value};
use crate::vm::{OMode, Settings, Vm};

impl Vm {
    fn tputs(&self, s: &str) {
        self.term.borrow_mut().puts(s);
    }

    fn tclass(&self, name: &str) {
        self.term.borrow_mut().class_begin(name);
    }

    fn tend(&self, name: &str) {
        self.term.borrow_mut().class_end(name);
    }

    /// Print a value using the machine settings.
    pub fn print_val(&mut self, val: Value) {
        let settings = self.settings.clone();
        self.print_val_1(val, 0, &settings);
        self.term.borrow_mut().flush();
    }

    /// Print a value with explicit settings, leaving the machine
    /// configuration untouched.
    pub fn print_val_with(&mut self, val: Value, settings: &Settings) {
        self.print_val_1(val, 0, settings);
        self.term.borrow_mut().flush();
    }

    fn print_integer(&self, bits: u64, w: u8, signed: bool, s: &Settings) {
        self.tclass("integer");
        let masked = bits & mask64(w);
        let body = match s.obase {
            2 => {
                let mut out = String::with_capacity(w as usize + 2);
                out.push_str("0b");
                for bit in (0..w).rev() {
                    out.push(if masked >> bit & 1 == 1 { '1' } else { '0' });
                }
                out
            }
            8 => format!("0o{masked:o}"),
            16 => format!("0x{masked:x}"),
            _ => {
                if signed {
                    format!("{}", crate::value::sign_extend_64(masked, w))
                } else {
                    format!("{masked}")
                }
            }
        };
        // Width and signedness markers, matching the literal syntax;
        // unusual widths get an explicit cast prefix instead.
        let suffix = match (w, signed) {
            (32, true) => Some(""),
            (64, true) => Some("L"),
            (16, true) => Some("H"),
            (8, true) => Some("B"),
            (4, true) => Some("N"),
            (32, false) => Some("U"),
            (64, false) => Some("UL"),
            (16, false) => Some("UH"),
            (8, false) => Some("UB"),
            (4, false) => Some("UN"),
            _ => None,
        };
        match suffix {
            Some(suffix) => {
                self.tputs(&body);
                self.tputs(suffix);
            }
            None => {
                let kind = if signed { "int" } else { "uint" };
                self.tputs(&format!("({kind}<{w}>) "));
                self.tputs(&body);
            }
        }
        self.tend("integer");
    }

    fn print_string(&self, s: &str) {
        self.tclass("string");
        let mut out = String::with_capacity(s.len() + 2);
        out.push('"');
        for c in s.chars() {
            match c {
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                c => out.push(c),
            }
        }
        out.push('"');
        self.tputs(&out);
        self.tend("string");
    }

    fn print_unit(&self, unit: u64) {
        match units::suffix_of(unit) {
            Some(suffix) => self.tputs(suffix),
            None => self.tputs(&format!("{unit}")),
        }
    }

    fn print_val_1(&mut self, val: Value, ndepth: u32, s: &Settings) {
        match val {
            Value::Null => self.tputs("null"),
            Value::Int { v, w } => self.print_integer(v as u32 as u64, w, true, s),
            Value::Uint { v, w } => self.print_integer(v as u64, w, false, s),
            Value::Box(id) => match self.heap.get(id).clone() {
                Boxed::Long { v, w } => self.print_integer(v as u64, w, true, s),
                Boxed::Ulong { v, w } => self.print_integer(v, w, false, s),
                Boxed::Str(body) => self.print_string(&body),
                Boxed::Off(off) => {
                    self.tclass("offset");
                    self.print_val_1(off.magnitude, ndepth, s);
                    self.tputs("#");
                    let unit = self.heap.as_u64(off.unit).unwrap_or(1);
                    self.print_unit(unit);
                    self.tend("offset");
                }
                Boxed::Arr(arr) => {
                    self.tclass("array");
                    self.tputs("[");
                    for (ix, elem) in arr.elems.iter().enumerate() {
                        if ix != 0 {
                            self.tputs(",");
                        }
                        if s.oacutoff != 0 && s.oacutoff as usize <= ix {
                            self.tclass("ellipsis");
                            self.tputs("...");
                            self.tend("ellipsis");
                            break;
                        }
                        self.print_val_1(elem.value, ndepth, s);
                    }
                    self.tputs("]");
                    if s.omaps && !arr.boffset.is_null() {
                        self.tputs(" @ ");
                        self.tclass("offset");
                        self.print_val_1(arr.boffset, ndepth, s);
                        self.tputs("#b");
                        self.tend("offset");
                    }
                    self.tend("array");
                }
                Boxed::Sct(sct) => {
                    if s.pretty_print && self.call_pretty_printer(val) {
                        return;
                    }
                    self.tclass("struct");
                    let type_name = self
                        .heap
                        .type_name(sct.stype)
                        .map(str::to_owned);
                    match type_name {
                        Some(name) => {
                            self.tclass("struct-type-name");
                            self.tputs(&name);
                            self.tend("struct-type-name");
                        }
                        None => self.tputs("struct"),
                    }
                    if ndepth >= s.odepth && s.odepth != 0 {
                        self.tputs(" {...}");
                        self.tend("struct");
                        return;
                    }
                    self.tputs(" {");
                    let mut printed = 0usize;
                    for field in &sct.fields {
                        if field.absent {
                            continue;
                        }
                        if printed != 0 {
                            self.tputs(",");
                        }
                        printed += 1;
                        if s.omode == OMode::Tree {
                            self.term.borrow_mut().indent(ndepth + 1, s.oindent);
                        }
                        if let Some(name) = self.heap.str(field.name).map(str::to_owned) {
                            self.tclass("struct-field-name");
                            self.tputs(&name);
                            self.tend("struct-field-name");
                            self.tputs("=");
                        }
                        self.print_val_1(field.value, ndepth + 1, s);
                    }
                    if s.omode == OMode::Tree {
                        self.term.borrow_mut().indent(ndepth, s.oindent);
                    }
                    self.tputs("}");
                    if s.omaps && !sct.boffset.is_null() {
                        self.tputs(" @ ");
                        self.tclass("offset");
                        self.print_val_1(sct.boffset, ndepth, s);
                        self.tputs("#b");
                        self.tend("offset");
                    }
                    self.tend("struct");
                }
                Boxed::Typ(typ) => {
                    self.tclass("type");
                    self.print_type(&typ, ndepth, s);
                    self.tend("type");
                }
                Boxed::Cls(_) => {
                    self.tclass("special");
                    self.tputs("#<closure>");
                    self.tend("special");
                }
            },
        }
    }

    fn print_type(&mut self, typ: &TypeVal, ndepth: u32, s: &Settings) {
        match typ {
            TypeVal::Integral { size, signed } => {
                if !signed {
                    self.tputs("u");
                }
                self.tputs(&format!("int<{size}>"));
            }
            TypeVal::String => self.tputs("string"),
            TypeVal::Any => {
                self.tclass("any");
                self.tputs("any");
                self.tend("any");
            }
            TypeVal::Array { etype, bound } => {
                self.print_val_1(*etype, ndepth, s);
                self.tputs("[");
                if !bound.is_null() {
                    self.print_val_1(*bound, ndepth, s);
                }
                self.tputs("]");
            }
            TypeVal::Offset { base, unit } => {
                self.tputs("offset<");
                self.print_val_1(*base, ndepth, s);
                self.tputs(",");
                self.print_unit(*unit);
                self.tputs(">");
            }
            TypeVal::Struct { name, fnames, ftypes } => {
                match self.heap.str(*name).map(str::to_owned) {
                    Some(name) => self.tputs(&name),
                    None => {
                        self.tputs("struct {");
                        for (ix, (fname, ftype)) in fnames.iter().zip(ftypes).enumerate() {
                            if ix != 0 {
                                self.tputs(" ");
                            }
                            self.print_val_1(*ftype, ndepth, s);
                            if let Some(fname) = self.heap.str(*fname).map(str::to_owned) {
                                self.tputs(&format!(" {fname}"));
                            }
                            self.tputs(";");
                        }
                        self.tputs("}");
                    }
                }
            }
            TypeVal::Closure { rtype, atypes } => {
                self.tputs("(");
                for (ix, atype) in atypes.iter().enumerate() {
                    if ix != 0 {
                        self.tputs(",");
                    }
                    self.print_val_1(*atype, ndepth, s);
                }
                self.tputs(")");
                self.print_val_1(*rtype, ndepth, s);
            }
        }
    }

    /// Run the `_print` method of a struct value, if it has one.
    /// Returns false when there is no such method.
    fn call_pretty_printer(&mut self, val: Value) -> bool {
        let Some(cls) = self.heap.ref_struct(val, "_print") else {
            return false;
        };
        // Re-entering print from a broken _print must not wedge the
        // machine; fall back to plain output on any failure.
        matches!(self.call_closure(cls, &[val]), Ok((ExitCode::Ok, _)))
    }

    /// Build and run a transient program that calls a closure with the
    /// given arguments.
    pub fn call_closure(&mut self, cls: Value, args: &[Value]) -> Result<(ExitCode, Value), VmError> {
        let mut builder = ProgramBuilder::new();
        for arg in args {
            builder.append_push(&mut self.heap, *arg);
        }
        builder.append_push(&mut self.heap, cls);
        builder.append(Opcode::Call)?;
        builder.append(Opcode::Halt)?;
        let mut program = builder.finish();
        program.make_executable()?;
        let program = Rc::new(program);
        let res = self.run(&program);
        Rc::try_unwrap(program)
            .expect("transient call program is uniquely owned")
            .destroy(&mut self.heap);
        res
    }
}
