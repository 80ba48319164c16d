//! The code generator.
//!
//! A single forward walk over the typed, transformed AST, emitting
//! instructions into program builders.  A stack of assemblers supports
//! nested programs (function bodies); a small set of flags records the
//! lowering context.  Lexical frames are mirrored exactly: every
//! compound statement pushes a run-time frame, and every declaration
//! pops its value into the next slot, so the `(back, over)` addresses
//! computed at parse time stay valid.

use std::rc::Rc;

use burin_asm::{ExceptionCode, Label, Opcode};
use burin_vm::{Program, ProgramBuilder, Value, Vm};
use tracing::debug;

use crate::ast::{Ast, BinOp, DeclKind, LoopKind, NodeId, NodeKind, UnOp};
use crate::diag::Diagnostics;

/// What kind of input is being lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// A whole program; statement values are discarded.
    Program,
    /// A single statement; the value of a top-level expression
    /// statement is left for the caller.
    Statement,
    /// A single expression; its value is the program result.
    Expression,
}

/// The code generator state.
pub struct Gen<'a> {
    ast: &'a Ast,
    vm: &'a mut Vm,
    diags: &'a mut Diagnostics,
    asm: Vec<ProgramBuilder>,
    /// Break targets of the enclosing loops.
    breaks: Vec<Label>,
    /// Generating a struct type as a runtime value; dynamic bounds are
    /// omitted in this context.
    in_type_value: bool,
    errors: u32,
}

/// Hidden variable layout used by the inline mapper code, relative to
/// the number of named slots in the mapping frame.
struct MapSlots {
    ios: u64,
    bits: u64,
    scratch: u64,
    base: u64,
}

impl<'a> Gen<'a> {
    /// Lower `root` into an executable program.
    pub fn program(
        ast: &'a Ast,
        root: NodeId,
        vm: &'a mut Vm,
        diags: &'a mut Diagnostics,
        mode: CompileMode,
    ) -> Result<Program, ()> {
        let mut gen = Gen {
            ast,
            vm,
            diags,
            asm: vec![ProgramBuilder::new()],
            breaks: Vec::new(),
            in_type_value: false,
            errors: 0,
        };
        match mode {
            CompileMode::Expression => gen.expr(root)?,
            CompileMode::Statement => {
                if let NodeKind::ExpStmt { exp } = ast.kind(root) {
                    gen.expr(*exp)?;
                } else {
                    gen.stmt(root)?;
                }
            }
            CompileMode::Program => {
                let NodeKind::Program { elems } = ast.kind(root) else {
                    return Err(());
                };
                for elem in ast.chain(*elems) {
                    gen.stmt(elem)?;
                }
            }
        }
        gen.op(Opcode::Halt);
        if gen.errors > 0 {
            return Err(());
        }
        let mut program = gen.asm.pop().expect("assembler stack").finish();
        if let Err(e) = program.make_executable() {
            gen.diags.error(ast.loc(root), &format!("{e}"));
            return Err(());
        }
        debug!(instructions = program.code().len(), "generated program");
        Ok(program)
    }

    fn b(&mut self) -> &mut ProgramBuilder {
        self.asm.last_mut().expect("assembler stack")
    }

    fn op(&mut self, op: Opcode) {
        self.b().append(op).expect("operand discipline");
    }

    fn push_val(&mut self, val: Value) {
        let b = self.asm.last_mut().expect("assembler stack");
        b.append_push(self.vm.heap_mut(), val);
    }

    fn push_uns(&mut self, n: u64) {
        self.b().append_unsigned_parameter(n);
    }

    fn push_label_param(&mut self, label: Label) {
        self.b()
            .append_label_parameter(label)
            .expect("label from this builder");
    }

    fn fresh_label(&mut self) -> Label {
        self.b().fresh_label()
    }

    fn bind(&mut self, label: Label) {
        self.b().append_label(label).expect("label from this builder");
    }

    fn error(&mut self, node: NodeId, msg: &str) -> Result<(), ()> {
        self.diags.error(self.ast.loc(node), msg);
        self.errors += 1;
        Err(())
    }

    fn ice(&mut self, node: NodeId, msg: &str) -> Result<(), ()> {
        self.diags.internal(
            self.ast.loc(node),
            msg,
            &format!("{:#?}", self.ast.node(node)),
        );
        self.errors += 1;
        Err(())
    }

    fn push_int_lit(&mut self, value: u64, size: u16, signed: bool) {
        let val = self
            .vm
            .heap_mut()
            .make_integral(value, size.min(64) as u8, signed);
        self.push_val(val);
    }

    fn push_ulong(&mut self, value: u64) {
        let val = self.vm.heap_mut().make_ulong(value, 64);
        self.push_val(val);
    }

    fn push_str_lit(&mut self, s: &str) {
        let val = self.vm.heap_mut().make_string(s);
        self.push_val(val);
    }

    /// Raise a fixed exception code at run time.
    fn raise_code(&mut self, code: ExceptionCode) {
        let exn = {
            let heap = self.vm.heap_mut();
            heap.make_exception(code, code.msg(), code.exit_status())
        };
        self.push_val(exn);
        self.op(Opcode::Raise);
    }

    // ---- statements ----

    fn stmt(&mut self, node: NodeId) -> Result<(), ()> {
        use NodeKind::*;
        match self.ast.kind(node).clone() {
            Decl { kind, initial, .. } => match kind {
                DeclKind::Var => {
                    self.expr(initial)?;
                    self.op(Opcode::Popvar);
                    Ok(())
                }
                DeclKind::Func => {
                    self.closure(initial)?;
                    self.op(Opcode::Popvar);
                    Ok(())
                }
                // Types and units are compile-time entities.
                DeclKind::Type | DeclKind::Unit => Ok(()),
            },
            ExpStmt { exp } => {
                self.expr(exp)?;
                self.op(Opcode::Drop);
                Ok(())
            }
            CompStmt { stmts, numvars } => {
                self.push_uns(numvars as u64);
                self.op(Opcode::Pushf);
                for stmt in self.ast.chain_vec(stmts) {
                    self.stmt(stmt)?;
                }
                self.op(Opcode::Popf);
                Ok(())
            }
            Assign { lvalue, exp } => self.assign(node, lvalue, exp),
            If { cond, then_s, else_s } => {
                self.expr(cond)?;
                let lelse = self.fresh_label();
                let lend = self.fresh_label();
                self.push_label_param(lelse);
                self.op(Opcode::Bz);
                self.stmt(then_s)?;
                self.push_label_param(lend);
                self.op(Opcode::Ba);
                self.bind(lelse);
                if let Some(else_s) = else_s {
                    self.stmt(else_s)?;
                }
                self.bind(lend);
                Ok(())
            }
            Loop { kind, head, var, body } => self.lower_loop(kind, head, var, body),
            Return { exp, .. } => {
                match exp {
                    Some(exp) => self.expr(exp)?,
                    None => self.push_val(Value::Null),
                }
                self.op(Opcode::Ret);
                Ok(())
            }
            Break { nframes, .. } => {
                for _ in 0..nframes {
                    self.op(Opcode::Popf);
                }
                let Some(target) = self.breaks.last().copied() else {
                    return self.ice(node, "break without a lowered loop");
                };
                self.push_label_param(target);
                self.op(Opcode::Ba);
                Ok(())
            }
            Print { exp } => {
                self.expr(exp)?;
                self.op(Opcode::Print);
                Ok(())
            }
            Program { .. } => self.ice(node, "nested program node"),
            _ => {
                // An expression in statement position.
                self.expr(node)?;
                self.op(Opcode::Drop);
                Ok(())
            }
        }
    }

    fn assign(&mut self, node: NodeId, lvalue: NodeId, exp: NodeId) -> Result<(), ()> {
        use NodeKind::*;
        match self.ast.kind(lvalue).clone() {
            Var { back, over, .. } => {
                self.expr(exp)?;
                self.push_uns(back as u64);
                self.push_uns(over as u64);
                self.op(Opcode::Setvar);
                Ok(())
            }
            Indexer { agg, index } => {
                self.expr(agg)?;
                self.expr(index)?;
                self.expr(exp)?;
                self.op(Opcode::Aset);
                self.op(Opcode::Drop);
                Ok(())
            }
            StructRef { sct, field } => {
                self.expr(sct)?;
                let name = self.ast.ident_name(field).to_owned();
                self.push_str_lit(&name);
                self.expr(exp)?;
                self.op(Opcode::Sset);
                self.op(Opcode::Drop);
                Ok(())
            }
            Trimmer { agg, lo, hi } => {
                self.expr(agg)?;
                self.expr(lo)?;
                self.expr(hi)?;
                self.expr(exp)?;
                self.op(Opcode::Asplice);
                self.op(Opcode::Drop);
                Ok(())
            }
            _ => self.ice(node, "invalid l-value reached the code generator"),
        }
    }

    fn lower_loop(
        &mut self,
        kind: LoopKind,
        head: NodeId,
        var: Option<NodeId>,
        body: NodeId,
    ) -> Result<(), ()> {
        match kind {
            LoopKind::While => {
                let lbegin = self.fresh_label();
                let lend = self.fresh_label();
                self.bind(lbegin);
                self.expr(head)?;
                self.push_label_param(lend);
                self.op(Opcode::Bz);
                self.breaks.push(lend);
                let body_res = self.stmt(body);
                self.breaks.pop();
                body_res?;
                self.push_label_param(lbegin);
                self.op(Opcode::Ba);
                self.bind(lend);
                Ok(())
            }
            LoopKind::Times => {
                // The remaining count lives on the stack.
                self.expr(head)?;
                let lbegin = self.fresh_label();
                let lend = self.fresh_label();
                self.bind(lbegin);
                self.op(Opcode::Dup);
                self.push_label_param(lend);
                self.op(Opcode::Bz);
                self.breaks.push(lend);
                let body_res = self.stmt(body);
                self.breaks.pop();
                body_res?;
                self.push_int_lit(1, 32, true);
                self.op(Opcode::Sub);
                self.push_label_param(lbegin);
                self.op(Opcode::Ba);
                self.bind(lend);
                self.op(Opcode::Drop);
                Ok(())
            }
            LoopKind::In => {
                // Frame slots: 0 = the iteration variable, 1 = the
                // container, 2 = the index.
                let _ = var;
                self.push_uns(3);
                self.op(Opcode::Pushf);
                self.push_val(Value::Null);
                self.op(Opcode::Popvar);
                self.expr(head)?;
                self.op(Opcode::Popvar);
                self.push_ulong(0);
                self.op(Opcode::Popvar);

                let lbegin = self.fresh_label();
                let lend = self.fresh_label();
                self.bind(lbegin);
                self.pushvar(0, 2);
                self.pushvar(0, 1);
                self.op(Opcode::Sel);
                self.op(Opcode::Lt);
                self.push_label_param(lend);
                self.op(Opcode::Bz);

                self.pushvar(0, 1);
                self.pushvar(0, 2);
                self.op(Opcode::Aref);
                self.setvar(0, 0);

                self.breaks.push(lend);
                let body_res = self.stmt(body);
                self.breaks.pop();
                body_res?;

                self.pushvar(0, 2);
                self.push_ulong(1);
                self.op(Opcode::Add);
                self.setvar(0, 2);
                self.push_label_param(lbegin);
                self.op(Opcode::Ba);
                self.bind(lend);
                self.op(Opcode::Popf);
                Ok(())
            }
        }
    }

    fn pushvar(&mut self, back: u64, over: u64) {
        self.push_uns(back);
        self.push_uns(over);
        self.op(Opcode::Pushvar);
    }

    fn setvar(&mut self, back: u64, over: u64) {
        self.push_uns(back);
        self.push_uns(over);
        self.op(Opcode::Setvar);
    }

    // ---- expressions ----

    fn expr(&mut self, node: NodeId) -> Result<(), ()> {
        use NodeKind::*;
        match self.ast.kind(node).clone() {
            Integer { value } => {
                let Some((size, signed)) =
                    self.ast.type_of(node).and_then(|t| self.ast.int_type(t))
                else {
                    return self.ice(node, "untyped integer literal");
                };
                self.push_int_lit(value, size, signed);
                Ok(())
            }
            Str { value } => {
                self.push_str_lit(&value);
                Ok(())
            }
            Null => {
                self.push_val(Value::Null);
                Ok(())
            }
            Offset { magnitude, unit } => {
                self.expr(magnitude)?;
                let Some(unit) = self.ast.integer_value(unit) else {
                    return self.ice(node, "unresolved offset unit");
                };
                self.push_ulong(unit);
                self.op(Opcode::Mko);
                Ok(())
            }
            Var { back, over, .. } => {
                self.pushvar(back as u64, over as u64);
                Ok(())
            }
            Binop { op, lhs, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                match op {
                    BinOp::BConc => {
                        let Some(t) = self.ast.type_of(node) else {
                            return self.ice(node, "untyped bit-concatenation");
                        };
                        self.type_value(t)?;
                        self.op(Opcode::BConc);
                    }
                    BinOp::In => self.op(Opcode::Ain),
                    other => self.op(binop_opcode(other)),
                }
                Ok(())
            }
            Unop { op, operand } => {
                self.expr(operand)?;
                match op {
                    UnOp::Pos => {}
                    UnOp::Neg => self.op(Opcode::Neg),
                    UnOp::Not => self.op(Opcode::Not),
                    UnOp::BNot => self.op(Opcode::BNot),
                }
                Ok(())
            }
            Cast { target, expr } => {
                self.expr(expr)?;
                self.type_value(target)?;
                self.op(Opcode::Cast);
                Ok(())
            }
            Cond { cond, then_e, else_e } => {
                self.expr(cond)?;
                let lelse = self.fresh_label();
                let lend = self.fresh_label();
                self.push_label_param(lelse);
                self.op(Opcode::Bz);
                self.expr(then_e)?;
                self.push_label_param(lend);
                self.op(Opcode::Ba);
                self.bind(lelse);
                self.expr(else_e)?;
                self.bind(lend);
                Ok(())
            }
            Indexer { agg, index } => {
                self.expr(agg)?;
                self.expr(index)?;
                self.op(Opcode::Aref);
                Ok(())
            }
            Trimmer { agg, lo, hi } => {
                self.expr(agg)?;
                self.expr(lo)?;
                self.expr(hi)?;
                self.op(Opcode::Atrim);
                Ok(())
            }
            StructRef { sct, field } => {
                self.expr(sct)?;
                let name = self.ast.ident_name(field).to_owned();
                self.push_str_lit(&name);
                self.op(Opcode::Sref);
                Ok(())
            }
            ArrayLit { elems, nelems } => {
                for elem in self.ast.chain_vec(elems) {
                    let NodeKind::ArrayInit { value, .. } = self.ast.kind(elem) else {
                        return self.ice(elem, "array literal element shape");
                    };
                    self.expr(*value)?;
                }
                let Some(t) = self.ast.type_of(node) else {
                    return self.ice(node, "untyped array literal");
                };
                self.type_value(t)?;
                self.push_uns(nelems as u64);
                self.op(Opcode::Mka);
                Ok(())
            }
            StructLit { stype, fields } => self.struct_lit(node, stype, fields),
            Funcall { callee, args, .. } => self.funcall(callee, args),
            Map { map_type, ios, offset } => self.map_expr(node, map_type, ios, offset),
            Func { .. } => self.closure(node),
            _ => self.ice(node, "unexpected node in expression position"),
        }
    }

    /// Lower a function literal into a nested program and emit the
    /// closure push plus the environment capture.
    fn closure(&mut self, node: NodeId) -> Result<(), ()> {
        let NodeKind::Func { args, nargs, body, rtype, .. } = self.ast.kind(node).clone() else {
            return self.ice(node, "expected a function literal");
        };
        let _ = args;
        self.asm.push(ProgramBuilder::new());

        // Prologue: one frame for the formals and the body; the caller
        // pushed the actuals in reverse, so they pop in order.
        self.push_uns(nargs as u64 + 4);
        self.op(Opcode::Pushf);
        for _ in 0..nargs {
            self.op(Opcode::Popvar);
        }
        let body_res = self.stmt(body);
        // Epilogue for void functions falling off the end.
        if rtype.is_none() {
            self.push_val(Value::Null);
            self.op(Opcode::Ret);
        }
        let builder = self.asm.pop().expect("nested assembler");
        body_res?;

        let mut program = builder.finish();
        if let Err(e) = program.make_executable() {
            return self.ice(node, &format!("{e}"));
        }
        let cls = self.vm.heap_mut().make_closure(Rc::new(program));
        self.push_val(cls);
        self.op(Opcode::Pec);
        Ok(())
    }

    fn funcall(&mut self, callee: NodeId, args: Option<NodeId>) -> Result<(), ()> {
        // Actuals go on the stack in reverse so the callee's prologue
        // pops them in declaration order.
        let actuals = self.ast.chain_vec(args);
        for actual in actuals.iter().rev() {
            let NodeKind::FuncallArg { value: Some(value), .. } = self.ast.kind(*actual) else {
                return self.ice(*actual, "unlowered actual argument");
            };
            self.expr(*value)?;
        }

        // Method calls push the receiver as the implicit first actual
        // and fetch the closure from the struct itself.
        if let NodeKind::StructRef { sct, field } = self.ast.kind(callee).clone() {
            let is_method = self
                .ast
                .type_of(callee)
                .map(|t| match self.ast.kind(t) {
                    NodeKind::TypeFun { args, .. } => self
                        .ast
                        .chain(*args)
                        .next()
                        .map(|f| match self.ast.kind(f) {
                            NodeKind::FuncArg { name, .. } => {
                                self.ast.ident_name(*name) == "self"
                            }
                            _ => false,
                        })
                        .unwrap_or(false),
                    _ => false,
                })
                .unwrap_or(false);
            if is_method {
                self.expr(sct)?;
                self.op(Opcode::Dup);
                let name = self.ast.ident_name(field).to_owned();
                self.push_str_lit(&name);
                self.op(Opcode::Sref);
                self.op(Opcode::Call);
                return Ok(());
            }
        }

        self.expr(callee)?;
        self.op(Opcode::Call);
        Ok(())
    }

    /// Lower a struct constructor.  The construction runs inside a
    /// frame mirroring the struct type's lexical frame, so field
    /// initializers, bounds and methods resolve their references.
    fn struct_lit(
        &mut self,
        node: NodeId,
        stype: NodeId,
        fields: Option<NodeId>,
    ) -> Result<(), ()> {
        let NodeKind::TypeStruct { elems, union, .. } = self.ast.kind(stype).clone() else {
            return self.ice(node, "struct constructor without a struct type");
        };
        if union {
            return self.error(node, "union values cannot be constructed");
        }

        let type_elems = self.ast.chain_vec(elems);
        let lit_fields = self.ast.chain_vec(fields);

        let nslots = type_elems.len() as u64;
        self.push_uns(nslots);
        self.op(Opcode::Pushf);

        // Walk the type elements in declaration order; trans4 aligned
        // the literal's field chain with it.
        let mut field_ix = 0usize;
        let mut over: u64 = 0;
        // (name, over) pairs for the final mksct.
        let mut made_fields: Vec<(Option<String>, u64)> = Vec::new();
        let mut made_methods: Vec<(String, u64)> = Vec::new();

        for elem in &type_elems {
            match self.ast.kind(*elem).clone() {
                NodeKind::StructTypeField { name, ftype, .. } => {
                    let Some(lit) = lit_fields.get(field_ix).copied() else {
                        return self.ice(node, "constructor fields out of step");
                    };
                    field_ix += 1;
                    let NodeKind::StructLitField { value, .. } = self.ast.kind(lit).clone()
                    else {
                        return self.ice(lit, "constructor field shape");
                    };
                    self.expr(value)?;
                    // A dynamic field type (an array bound referring to
                    // earlier fields) re-checks the value.
                    if self.dynamic_field_type(ftype) {
                        self.type_value(ftype)?;
                        self.op(Opcode::Cast);
                    }
                    self.op(Opcode::Popvar);
                    let fname = name.map(|n| self.ast.ident_name(n).to_owned());
                    made_fields.push((fname, over));
                    over += 1;
                }
                NodeKind::Decl { kind: DeclKind::Func, name, initial, .. } => {
                    self.closure(initial)?;
                    self.op(Opcode::Popvar);
                    let mname = self.ast.ident_name(name).to_owned();
                    made_methods.push((mname, over));
                    over += 1;
                }
                NodeKind::Decl { kind: DeclKind::Var, initial, .. } => {
                    self.expr(initial)?;
                    self.op(Opcode::Popvar);
                    over += 1;
                }
                NodeKind::Decl { .. } => {}
                _ => {}
            }
        }

        // Assemble the struct value: name/value pairs for the fields,
        // then the methods, then the type.
        for (fname, fover) in &made_fields {
            match fname {
                Some(fname) => self.push_str_lit(fname),
                None => self.push_val(Value::Null),
            }
            self.pushvar(0, *fover);
        }
        for (mname, mover) in &made_methods {
            self.push_str_lit(mname);
            self.pushvar(0, *mover);
        }
        self.type_value(stype)?;
        self.push_uns(made_fields.len() as u64);
        self.push_uns(made_methods.len() as u64);
        self.op(Opcode::Mksct);
        self.op(Opcode::Popf);

        Ok(())
    }

    /// Whether a field type needs a run-time cast at construction: an
    /// array type with a non-literal bound.
    fn dynamic_field_type(&self, ftype: NodeId) -> bool {
        match self.ast.kind(ftype) {
            NodeKind::TypeArray { bound: Some(bound), .. } => {
                !matches!(self.ast.kind(*bound), NodeKind::Integer { .. })
            }
            _ => false,
        }
    }

    // ---- types as runtime values ----

    /// Emit code building the runtime type value for a type node.
    fn type_value(&mut self, typ: NodeId) -> Result<(), ()> {
        use NodeKind::*;
        match self.ast.kind(typ).clone() {
            TypeInt { size, signed } => {
                self.push_ulong(size as u64);
                self.push_int_lit(signed as u64, 32, true);
                self.op(Opcode::Mktyi);
                Ok(())
            }
            TypeStr => {
                self.op(Opcode::Mktys);
                Ok(())
            }
            TypeAny | TypeVoid => {
                self.op(Opcode::MktyAny);
                Ok(())
            }
            TypeArray { etype, bound } => {
                self.type_value(etype)?;
                match bound {
                    Some(bound)
                        if !self.in_type_value
                            || matches!(self.ast.kind(bound), Integer { .. }) =>
                    {
                        self.expr(bound)?;
                    }
                    _ => self.push_val(Value::Null),
                }
                self.op(Opcode::Mktya);
                Ok(())
            }
            TypeOffset { base, unit } => {
                self.type_value(base)?;
                let Some(unit) = self.ast.integer_value(unit) else {
                    return self.ice(typ, "unresolved unit in offset type");
                };
                self.push_ulong(unit);
                self.op(Opcode::Mktyo);
                Ok(())
            }
            TypeStruct { elems, name, .. } => {
                let was = self.in_type_value;
                self.in_type_value = true;
                let mut nfields = 0u64;
                for elem in self.ast.chain_vec(elems) {
                    if let StructTypeField { name, ftype, .. } = self.ast.kind(elem).clone() {
                        match name {
                            Some(n) => {
                                let n = self.ast.ident_name(n).to_owned();
                                self.push_str_lit(&n);
                            }
                            None => self.push_val(Value::Null),
                        }
                        self.type_value(ftype)?;
                        nfields += 1;
                    }
                }
                match name {
                    Some(name) => self.push_str_lit(&name),
                    None => self.push_val(Value::Null),
                }
                self.push_uns(nfields);
                self.op(Opcode::MktySct);
                self.in_type_value = was;
                Ok(())
            }
            TypeFun { args, nargs, rtype } => {
                for arg in self.ast.chain_vec(args) {
                    if let FuncArg { atype, .. } = self.ast.kind(arg) {
                        self.type_value(*atype)?;
                    }
                }
                self.type_value(rtype)?;
                self.push_uns(nargs as u64);
                self.op(Opcode::MktyC);
                Ok(())
            }
            _ => self.ice(typ, "expected a type node"),
        }
    }

    // ---- mapping ----

    fn map_expr(
        &mut self,
        node: NodeId,
        map_type: NodeId,
        ios: Option<NodeId>,
        offset: NodeId,
    ) -> Result<(), ()> {
        use NodeKind::*;
        match self.ast.kind(map_type).clone() {
            TypeInt { .. } | TypeOffset { .. } => {
                self.type_value(map_type)?;
                match ios {
                    Some(ios) => self.expr(ios)?,
                    None => self.push_val(Value::Null),
                }
                self.expr(offset)?;
                self.op(Opcode::Map);
                Ok(())
            }
            TypeStruct { union, .. } => {
                if union {
                    return self.error(node, "union types cannot be mapped");
                }
                self.map_struct(node, map_type, ios, offset)
            }
            TypeArray { .. } => self.map_array(node, map_type, ios, offset),
            _ => self.error(node, "this type cannot be mapped"),
        }
    }

    /// Emit the ios and base-offset setup shared by the aggregate
    /// mapping lowerings.  Leaves a fresh frame with `named` placeholder
    /// slots followed by the hidden ios/bits/scratch/base slots.
    fn map_prologue(
        &mut self,
        named: u64,
        ios: Option<NodeId>,
        offset: NodeId,
    ) -> Result<MapSlots, ()> {
        let slots = MapSlots {
            ios: named,
            bits: named + 1,
            scratch: named + 2,
            base: named + 3,
        };
        self.push_uns(named + 4);
        self.op(Opcode::Pushf);
        for _ in 0..named {
            self.push_val(Value::Null);
            self.op(Opcode::Popvar);
        }
        match ios {
            Some(ios) => self.expr(ios)?,
            None => self.push_val(Value::Null),
        }
        self.op(Opcode::Popvar);
        // The offset operand was promoted to bits; its magnitude is
        // the bit offset.
        self.expr(offset)?;
        self.op(Opcode::Ogetm);
        self.op(Opcode::Popvar);
        self.push_val(Value::Null);
        self.op(Opcode::Popvar);
        self.pushvar(0, slots.bits);
        self.op(Opcode::Popvar);
        Ok(slots)
    }

    /// Map one scalar of the given type at the current bit cursor and
    /// advance the cursor.  Leaves the value on the stack.
    fn map_scalar_here(&mut self, ftype: NodeId, slots: &MapSlots) -> Result<(), ()> {
        self.type_value(ftype)?;
        self.pushvar(0, slots.ios);
        self.pushvar(0, slots.bits);
        self.push_ulong(1);
        self.op(Opcode::Mko);
        self.op(Opcode::Map);
        // Advance the cursor by the mapped size.
        self.op(Opcode::Dup);
        self.op(Opcode::Siz);
        self.op(Opcode::Ogetm);
        self.pushvar(0, slots.bits);
        self.op(Opcode::Add);
        self.setvar(0, slots.bits);
        Ok(())
    }

    fn map_struct(
        &mut self,
        node: NodeId,
        map_type: NodeId,
        ios: Option<NodeId>,
        offset: NodeId,
    ) -> Result<(), ()> {
        let NodeKind::TypeStruct { elems, .. } = self.ast.kind(map_type).clone() else {
            return self.ice(node, "expected a struct type");
        };
        let type_elems = self.ast.chain_vec(elems);
        let slots = self.map_prologue(type_elems.len() as u64, ios, offset)?;

        let mut over: u64 = 0;
        let mut made_fields: Vec<(Option<String>, u64)> = Vec::new();
        let mut made_methods: Vec<(String, u64)> = Vec::new();

        for elem in &type_elems {
            match self.ast.kind(*elem).clone() {
                NodeKind::StructTypeField {
                    name, ftype, constraint, optcond, label, ..
                } => {
                    if optcond.is_some() {
                        return self.error(
                            *elem,
                            "optional fields are not supported when mapping",
                        );
                    }
                    // An explicit label moves the cursor before the
                    // field maps.
                    if let Some(label) = label {
                        self.pushvar(0, slots.base);
                        self.expr(label)?;
                        self.op(Opcode::Dup);
                        self.op(Opcode::Ogetu);
                        self.op(Opcode::Swap);
                        self.op(Opcode::Ogetm);
                        self.op(Opcode::Mul);
                        self.op(Opcode::Add);
                        self.setvar(0, slots.bits);
                    }
                    self.map_field_value(ftype, &slots)?;
                    self.setvar(0, over);
                    // Constraints see the field and everything before
                    // it.
                    if let Some(constraint) = constraint {
                        let lok = self.fresh_label();
                        self.expr(constraint)?;
                        self.push_label_param(lok);
                        self.op(Opcode::Bnz);
                        self.raise_code(ExceptionCode::Constraint);
                        self.bind(lok);
                    }
                    let fname = name.map(|n| self.ast.ident_name(n).to_owned());
                    made_fields.push((fname, over));
                    over += 1;
                }
                NodeKind::Decl { kind: DeclKind::Func, name, initial, .. } => {
                    // The placeholder slots already exist; bind the
                    // method into its declaration-order slot.
                    self.closure(initial)?;
                    self.setvar(0, over);
                    let mname = self.ast.ident_name(name).to_owned();
                    made_methods.push((mname, over));
                    over += 1;
                }
                NodeKind::Decl { kind: DeclKind::Var, initial, .. } => {
                    self.expr(initial)?;
                    self.setvar(0, over);
                    over += 1;
                }
                _ => {}
            }
        }

        for (fname, fover) in &made_fields {
            match fname {
                Some(fname) => self.push_str_lit(fname),
                None => self.push_val(Value::Null),
            }
            self.pushvar(0, *fover);
        }
        for (mname, mover) in &made_methods {
            self.push_str_lit(mname);
            self.pushvar(0, *mover);
        }
        self.type_value(map_type)?;
        self.push_uns(made_fields.len() as u64);
        self.push_uns(made_methods.len() as u64);
        self.op(Opcode::Mksct);

        // Record the mapping metadata on the fresh value.
        self.pushvar(0, slots.base);
        self.push_ulong(1);
        self.op(Opcode::Mko);
        self.op(Opcode::Mseto);
        self.pushvar(0, slots.ios);
        self.op(Opcode::MsetIos);

        self.op(Opcode::Popf);
        Ok(())
    }

    /// Map a field value of the given type at the cursor, leaving it on
    /// the stack.
    fn map_field_value(&mut self, ftype: NodeId, slots: &MapSlots) -> Result<(), ()> {
        use NodeKind::*;
        match self.ast.kind(ftype).clone() {
            TypeInt { .. } | TypeOffset { .. } => self.map_scalar_here(ftype, slots),
            TypeArray { etype, bound } => {
                let Some(bound) = bound else {
                    return self.error(ftype, "cannot map arrays without a bound");
                };
                if self.ast.int_type(etype).is_none() {
                    return self.error(ftype, "only integral element types can be mapped");
                }
                // scratch = element count.
                self.expr(bound)?;
                self.setvar(0, slots.scratch);
                // Empty array of the field type, elements appended as
                // they map.
                self.type_value(etype)?;
                self.push_val(Value::Null);
                self.op(Opcode::Mktya);
                self.push_uns(0);
                self.op(Opcode::Mka);
                let lbegin = self.fresh_label();
                let lend = self.fresh_label();
                self.bind(lbegin);
                self.pushvar(0, slots.scratch);
                self.push_label_param(lend);
                self.op(Opcode::Bz);
                self.map_scalar_here(etype, slots)?;
                self.op(Opcode::Ains);
                self.pushvar(0, slots.scratch);
                self.push_int_lit(1, 32, true);
                self.op(Opcode::Sub);
                self.setvar(0, slots.scratch);
                self.push_label_param(lbegin);
                self.op(Opcode::Ba);
                self.bind(lend);
                Ok(())
            }
            _ => self.error(ftype, "this field type cannot be mapped"),
        }
    }

    fn map_array(
        &mut self,
        node: NodeId,
        map_type: NodeId,
        ios: Option<NodeId>,
        offset: NodeId,
    ) -> Result<(), ()> {
        let NodeKind::TypeArray { .. } = self.ast.kind(map_type) else {
            return self.ice(node, "expected an array type");
        };
        let slots = self.map_prologue(0, ios, offset)?;
        self.map_field_value(map_type, &slots)?;
        // Record the mapping metadata.
        self.pushvar(0, slots.base);
        self.push_ulong(1);
        self.op(Opcode::Mko);
        self.op(Opcode::Mseto);
        self.pushvar(0, slots.ios);
        self.op(Opcode::MsetIos);
        self.op(Opcode::Popf);
        Ok(())
    }
}

fn binop_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::CeilDiv => Opcode::Cdiv,
        BinOp::Mod => Opcode::Mod,
        BinOp::Pow => Opcode::Pow,
        BinOp::Sl => Opcode::Bsl,
        BinOp::Sr => Opcode::Bsr,
        BinOp::IOr => Opcode::BOr,
        BinOp::Xor => Opcode::BXor,
        BinOp::BAnd => Opcode::BAnd,
        BinOp::Or => Opcode::Or,
        BinOp::And => Opcode::And,
        BinOp::Eq => Opcode::Eq,
        BinOp::Ne => Opcode::Ne,
        BinOp::Lt => Opcode::Lt,
        BinOp::Gt => Opcode::Gt,
        BinOp::Le => Opcode::Le,
        BinOp::Ge => Opcode::Ge,
        BinOp::BConc | BinOp::In => unreachable!("lowered separately"),
    }
}
