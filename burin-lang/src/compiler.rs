//! The incremental compiler facade.
//!
//! Owns the long-lived compile-time environment, the AST arena the
//! registered declarations live in, and the virtual machine programs
//! execute on.  Every input is atomic: the top-level environment is
//! snapshotted before parsing and the snapshot replaces the live
//! environment only when the whole pipeline (and the run, for
//! executing entry points) succeeds.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info_span};

use burin_vm::{
    Endian, ExitCode, FileIos, IoSpace, IosFlags, MemIos, Nenc, OMode, Program, ProgramBuilder,
    TermRef, Value, Vm,
};

use crate::anal::Anal;
use crate::ast::{Ast, DeclKind, NodeId, NodeKind};
use crate::diag::Diagnostics;
use crate::env::{LexEnv, Namespace};
use crate::fold::Fold;
use crate::gen::{CompileMode, Gen};
use crate::parse::{self, ParseKind};
use crate::pass::{run_pass, PassCtx, Phase};
use crate::promo::Promo;
use crate::trans::Trans;
use crate::typify::{Typify1, Typify2};

/// Facade errors.  Compile errors carry no payload: the diagnostics
/// already went to the terminal.
#[derive(Debug, Error)]
pub enum Error {
    /// The runtime or standard library failed to compile.
    #[error("compiler failed to bootstrap itself")]
    Bootstrap,
    /// The input is invalid; diagnostics were emitted.
    #[error("compile error")]
    Compile,
    /// The program ran but finished with an error exit code.
    #[error("run-time error")]
    Runtime,
    /// A file could not be read.
    #[error("cannot read `{0}`")]
    Io(PathBuf),
    /// The named module is not in the load path.
    #[error("cannot find module `{0}`")]
    NoModule(String),
}

/// Resolver for identifiers unknown to the lexical environment; maps a
/// spelling to a replacement spelling.
pub type AlienTokenHandler = Box<dyn FnMut(&str) -> Option<String>>;

/// The incremental compiler.
pub struct Compiler {
    vm: Vm,
    env: LexEnv,
    ast: Ast,
    rt_path: PathBuf,
    bootstrapped: bool,
    error_on_warning: bool,
    quiet: bool,
    modules: Vec<String>,
    lexical_cuckolding: bool,
    alien_fn: Option<AlienTokenHandler>,
}

/// Outcome of compiling one buffer.
pub struct Compiled {
    /// Byte offset just past the consumed input.
    pub end: usize,
    /// The value of a top-level expression, when the input produced
    /// one.
    pub value: Option<Value>,
}

impl Compiler {
    /// Create a compiler, bootstrapping it from `<rt_path>/burin-rt.b`
    /// and loading `<rt_path>/std.b`.  All output goes through the
    /// given terminal callbacks.
    pub fn new(rt_path: &Path, term: TermRef) -> Result<Compiler, Error> {
        let mut compiler = Compiler {
            vm: Vm::new(term),
            env: LexEnv::new(),
            ast: Ast::new(),
            rt_path: rt_path.to_owned(),
            bootstrapped: false,
            error_on_warning: false,
            quiet: false,
            modules: Vec::new(),
            lexical_cuckolding: false,
            alien_fn: None,
        };

        let rt = rt_path.join("burin-rt.b");
        if compiler.compile_file(&rt).is_err() {
            let term = compiler.vm.term();
            let mut term = term.borrow_mut();
            term.class_begin("error");
            term.puts("internal error: ");
            term.class_end("error");
            term.puts("compiler failed to bootstrap itself\n");
            return Err(Error::Bootstrap);
        }
        compiler.bootstrapped = true;

        let std = rt_path.join("std.b");
        compiler.compile_file(&std).map_err(|_| Error::Bootstrap)?;

        Ok(compiler)
    }

    /// The virtual machine.
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Mutable access to the virtual machine.
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Whether the bootstrap completed.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Count warnings as errors.
    pub fn set_error_on_warning(&mut self, flag: bool) {
        self.error_on_warning = flag;
    }

    /// Suppress diagnostics output.
    pub fn set_quiet(&mut self, flag: bool) {
        self.quiet = flag;
    }

    /// Route unknown identifiers to the alien-token handler.
    pub fn set_lexical_cuckolding(&mut self, flag: bool) {
        self.lexical_cuckolding = flag;
    }

    /// Install the alien-token handler.
    pub fn set_alien_token_fn(&mut self, handler: Option<AlienTokenHandler>) {
        self.alien_fn = handler;
    }

    // ---- the pipeline ----

    /// Run the multi-pass pipeline on a parsed input and lower it.
    fn rest_of_compilation(
        &mut self,
        root: NodeId,
        env: &mut LexEnv,
        diags: &mut Diagnostics,
        mode: CompileMode,
    ) -> Result<Program, Error> {
        let span = info_span!("pipeline");
        let _guard = span.enter();

        // Front end.
        let mut trans1 = Trans::trans1();
        let mut anal1 = Anal::anal1();
        let mut typify1 = Typify1::new();
        let mut promo = Promo::new();
        let mut trans2 = Trans::trans2();
        let mut fold = Fold::new();
        let mut trans3 = Trans::trans3();
        let mut typify2 = Typify2::new();
        let mut anal2 = Anal::anal2();
        {
            let mut ctx = PassCtx {
                ast: &mut self.ast,
                env,
                diags,
            };
            let mut phases: Vec<&mut dyn Phase> = vec![
                &mut trans1,
                &mut anal1,
                &mut typify1,
                &mut promo,
                &mut trans2,
                &mut fold,
                &mut trans3,
                &mut typify2,
                &mut anal2,
            ];
            run_pass(&mut ctx, root, &mut phases, true).map_err(|()| Error::Compile)?;
            let errors: u32 = phases.iter().map(|p| p.errors()).sum();
            if errors > 0 || ctx.diags.errors() > 0 {
                return Err(Error::Compile);
            }
        }

        // Middle end.
        let mut fold2 = Fold::new();
        let mut trans4 = Trans::trans4();
        let mut analf = Anal::analf();
        {
            let mut ctx = PassCtx {
                ast: &mut self.ast,
                env,
                diags,
            };
            let mut phases: Vec<&mut dyn Phase> =
                vec![&mut fold2, &mut trans4, &mut analf];
            run_pass(&mut ctx, root, &mut phases, true).map_err(|()| Error::Compile)?;
            let errors: u32 = phases.iter().map(|p| p.errors()).sum();
            if errors > 0 || ctx.diags.errors() > 0 {
                return Err(Error::Compile);
            }
        }

        // Back end.
        let program = Gen::program(&self.ast, root, &mut self.vm, diags, mode)
            .map_err(|()| Error::Compile)?;
        if diags.errors() > 0 {
            return Err(Error::Compile);
        }
        Ok(program)
    }

    fn diags_for(&self, file: &str, source: &str) -> Diagnostics {
        let mut diags = Diagnostics::new(self.vm.term(), file, source);
        diags.quiet = self.quiet;
        diags.error_on_warning = self.error_on_warning;
        diags
    }

    fn compile_and_run(
        &mut self,
        source: &str,
        file: &str,
        kind: ParseKind,
        mode: CompileMode,
    ) -> Result<Compiled, Error> {
        let mut env = self.env.dup_toplevel();
        let mut diags = self.diags_for(file, source);

        let parsed = {
            let alien = if self.lexical_cuckolding {
                self.alien_fn.as_deref_mut()
            } else {
                None
            };
            parse::parse(kind, source, &mut self.ast, &mut env, &mut diags, alien)
                .map_err(|()| Error::Compile)?
        };

        // The run-time top frame must stay in step with the compile
        // environment's variable counter; a failed run rolls both back.
        let pre_vars = self.vm.env().num_vars();
        let program = match self.rest_of_compilation(parsed.root, &mut env, &mut diags, mode) {
            Ok(program) => program,
            Err(e) => {
                self.vm.env().truncate(pre_vars);
                return Err(e);
            }
        };
        let program = Rc::new(program);
        let run = self.vm.run(&program);
        if let Ok(program) = Rc::try_unwrap(program) {
            program.destroy(self.vm.heap_mut());
        }
        let (exit, value) = match run {
            Ok(res) => res,
            Err(_) => {
                self.vm.env().truncate(pre_vars);
                return Err(Error::Runtime);
            }
        };
        if exit != ExitCode::Ok {
            self.vm.env().truncate(pre_vars);
            return Err(Error::Runtime);
        }

        // Success: the snapshot becomes the live environment.
        self.env = env;
        debug!(end = parsed.end, "input compiled and executed");
        let value = match mode {
            CompileMode::Program => None,
            _ => Some(value),
        };
        Ok(Compiled {
            end: parsed.end,
            value,
        })
    }

    /// Compile and execute a sequence of declarations and statements.
    /// The result value, if any, is discarded.
    pub fn compile_buffer(&mut self, source: &str) -> Result<Compiled, Error> {
        let mut compiled =
            self.compile_and_run(source, "<stdin>", ParseKind::Program, CompileMode::Program)?;
        compiled.value = None;
        Ok(compiled)
    }

    /// Compile and execute a single statement.  The value of an
    /// expression statement is returned.
    pub fn compile_statement(&mut self, source: &str) -> Result<Compiled, Error> {
        self.compile_and_run(source, "<stdin>", ParseKind::Statement, CompileMode::Statement)
    }

    /// Compile and execute a single expression, returning its value.
    pub fn compile_expression(&mut self, source: &str) -> Result<Compiled, Error> {
        self.compile_and_run(
            source,
            "<stdin>",
            ParseKind::Expression,
            CompileMode::Expression,
        )
    }

    /// Compile an expression into a ready-to-run program without
    /// executing it.  Ownership of the program transfers to the caller.
    pub fn expression_program(&mut self, source: &str) -> Result<Program, Error> {
        let mut env = self.env.dup_toplevel();
        let mut diags = self.diags_for("<stdin>", source);
        let parsed = parse::parse(
            ParseKind::Expression,
            source,
            &mut self.ast,
            &mut env,
            &mut diags,
            None,
        )
        .map_err(|()| Error::Compile)?;
        let program =
            self.rest_of_compilation(parsed.root, &mut env, &mut diags, CompileMode::Expression)?;
        self.env = env;
        Ok(program)
    }

    /// Compile and execute a whole file.  Returns the exit status of
    /// the run.
    pub fn compile_file(&mut self, path: &Path) -> Result<ExitCode, Error> {
        let source =
            std::fs::read_to_string(path).map_err(|_| Error::Io(path.to_owned()))?;
        let file = path.to_string_lossy().into_owned();

        let mut env = self.env.dup_toplevel();
        let mut diags = self.diags_for(&file, &source);
        let pre_vars = self.vm.env().num_vars();
        let parsed = parse::parse_file(&source, &file, &mut self.ast, &mut env, &mut diags)
            .map_err(|()| Error::Compile)?;
        let program = match self.rest_of_compilation(parsed.root, &mut env, &mut diags, CompileMode::Program)
        {
            Ok(program) => program,
            Err(e) => {
                self.vm.env().truncate(pre_vars);
                return Err(e);
            }
        };
        let program = Rc::new(program);
        let run = self.vm.run(&program);
        if let Ok(program) = Rc::try_unwrap(program) {
            program.destroy(self.vm.heap_mut());
        }
        match run {
            Ok((ExitCode::Ok, _)) => {
                self.env = env;
                Ok(ExitCode::Ok)
            }
            Ok((ExitCode::Error, _)) | Err(_) => {
                self.vm.env().truncate(pre_vars);
                Err(Error::Runtime)
            }
        }
    }

    /// Build a program that calls a closure with the given arguments.
    /// The callee's prologue pops the arguments in declaration order.
    pub fn compile_call(&mut self, cls: Value, args: &[Value]) -> Result<Program, Error> {
        let mut builder = ProgramBuilder::new();
        for arg in args.iter().rev() {
            builder.append_push(self.vm.heap_mut(), *arg);
        }
        builder.append_push(self.vm.heap_mut(), cls);
        builder
            .append_instruction("call")
            .map_err(|_| Error::Compile)?;
        builder
            .append_instruction("halt")
            .map_err(|_| Error::Compile)?;
        let mut program = builder.finish();
        program.make_executable().map_err(|_| Error::Compile)?;
        Ok(program)
    }

    // ---- modules ----

    /// The colon-separated load path, from the `load_path` runtime
    /// variable, with `%DATADIR%` expanded to the runtime directory.
    fn load_path(&self) -> Option<String> {
        let (_, back, over) = self
            .env
            .lookup(&self.ast, Namespace::Main, "load_path")?;
        let val = self.vm.env().lookup(back as usize, over as usize);
        let path = self.vm.heap().str(val)?;
        Some(path.replace("%DATADIR%", &self.rt_path.to_string_lossy()))
    }

    /// Resolve a module name against the load path.
    pub fn resolve_module(&self, module: &str) -> Option<PathBuf> {
        let load_path = self.load_path()?;
        for dir in load_path.split(':').filter(|d| !d.is_empty()) {
            let candidate = Path::new(dir).join(format!("{module}.b"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Load a module by name, skipping it when already loaded.
    pub fn load(&mut self, module: &str) -> Result<(), Error> {
        let path = self
            .resolve_module(module)
            .ok_or_else(|| Error::NoModule(module.to_owned()))?;
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| module.to_owned());
        if self.modules.iter().any(|m| *m == basename) {
            return Ok(());
        }
        self.compile_file(&path)?;
        self.modules.push(basename);
        Ok(())
    }

    // ---- declarations ----

    /// Declare a global variable bound to a value.  Fails when the name
    /// is taken or the value's type has no source-level counterpart.
    pub fn defvar(&mut self, name: &str, val: Value) -> bool {
        let Some(typ) = self.type_node_for(val) else {
            return false;
        };
        let loc = Default::default();
        let name_node = self
            .ast
            .add(NodeKind::Identifier { name: name.to_owned() }, loc);
        let initial = self.ast.add(NodeKind::Integer { value: 0 }, loc);
        self.ast.set_type(initial, typ);
        let decl = self.ast.add(
            NodeKind::Decl {
                kind: DeclKind::Var,
                name: name_node,
                initial,
                order: 0,
                source: Some("<libburin>".to_owned()),
            },
            loc,
        );
        if !self
            .env
            .register(&mut self.ast, Namespace::Main, name, decl)
        {
            return false;
        }
        // The run-time slot mirrors the compile-time registration.
        self.vm.env().register(val);
        true
    }

    /// A type node describing a runtime value, for injected globals.
    fn type_node_for(&mut self, val: Value) -> Option<NodeId> {
        use burin_vm::Boxed;
        let loc = Default::default();
        match val {
            Value::Null => None,
            Value::Int { w, .. } => Some(self.ast.add(
                NodeKind::TypeInt { size: w as u16, signed: true },
                loc,
            )),
            Value::Uint { w, .. } => Some(self.ast.add(
                NodeKind::TypeInt { size: w as u16, signed: false },
                loc,
            )),
            Value::Box(id) => {
                enum Shape {
                    Int(u16, bool),
                    Str,
                    Off(u16, bool, u64),
                }
                let shape = match self.vm.heap().get(id) {
                    Boxed::Long { w, .. } => Shape::Int(*w as u16, true),
                    Boxed::Ulong { w, .. } => Shape::Int(*w as u16, false),
                    Boxed::Str(_) => Shape::Str,
                    Boxed::Off(off) => {
                        let (_, mw, signed) = self.vm.heap().as_integral(off.magnitude)?;
                        let unit = self.vm.heap().as_u64(off.unit)?;
                        Shape::Off(mw as u16, signed, unit)
                    }
                    _ => return None,
                };
                match shape {
                    Shape::Int(size, signed) => {
                        Some(self.ast.add(NodeKind::TypeInt { size, signed }, loc))
                    }
                    Shape::Str => Some(self.ast.add(NodeKind::TypeStr, loc)),
                    Shape::Off(size, signed, unit) => {
                        let base = self.ast.add(NodeKind::TypeInt { size, signed }, loc);
                        let unit_node = self.ast.add(NodeKind::Integer { value: unit }, loc);
                        let u64t = self
                            .ast
                            .add(NodeKind::TypeInt { size: 64, signed: false }, loc);
                        self.ast.set_type(unit_node, u64t);
                        Some(
                            self.ast
                                .add(NodeKind::TypeOffset { base, unit: unit_node }, loc),
                        )
                    }
                }
            }
        }
    }

    /// Whether a top-level declaration of the given kind exists.
    pub fn decl_p(&self, name: &str, kind: DeclKind) -> bool {
        let ns = if kind == DeclKind::Unit {
            Namespace::Units
        } else {
            Namespace::Main
        };
        match self.env.lookup(&self.ast, ns, name) {
            Some((decl, _, _)) => {
                matches!(self.ast.kind(decl), NodeKind::Decl { kind: k, .. } if *k == kind)
            }
            None => false,
        }
    }

    /// The runtime value of a variable or function declaration.
    pub fn decl_val(&self, name: &str) -> Option<Value> {
        let (decl, back, over) = self.env.lookup(&self.ast, Namespace::Main, name)?;
        match self.ast.kind(decl) {
            NodeKind::Decl { kind: DeclKind::Var | DeclKind::Func, .. } => {
                Some(self.vm.env().lookup(back as usize, over as usize))
            }
            _ => None,
        }
    }

    /// Visit every top-level declaration of a kind; `None` visits all.
    pub fn decl_map<F: FnMut(&str, NodeId)>(&self, kind: Option<DeclKind>, f: F) {
        self.env.map_decls(&self.ast, kind, f);
    }

    /// Names of top-level declarations starting with `prefix`, sorted.
    pub fn completion(&self, prefix: &str) -> Vec<String> {
        self.env.matching_decls(prefix)
    }

    /// Disassemble the program of a function declaration.
    pub fn disassemble_function(&mut self, name: &str) -> bool {
        let Some(cls) = self.decl_val(name) else {
            return false;
        };
        use burin_vm::Boxed;
        let Some(Boxed::Cls(cls)) = cls.box_id().map(|id| self.vm.heap().get(id)) else {
            return false;
        };
        let program = cls.program.clone();
        program.disassemble(self.vm.heap(), &self.vm.term());
        true
    }

    /// Compile an expression and print its disassembly.
    pub fn disassemble_expression(&mut self, source: &str) -> Result<(), Error> {
        let program = self.expression_program(source)?;
        program.disassemble(self.vm.heap(), &self.vm.term());
        program.destroy(self.vm.heap_mut());
        Ok(())
    }

    // ---- I/O spaces ----

    /// Open a file as an I/O space, making it current.
    pub fn ios_open_file(&mut self, path: &Path, flags: IosFlags) -> Result<i32, Error> {
        let space = FileIos::open(path, flags).map_err(|_| Error::Io(path.to_owned()))?;
        Ok(self.vm.ios_mut().open(Box::new(space)))
    }

    /// Open an in-memory I/O space, making it current.
    pub fn ios_open_mem(&mut self, handler: &str, bytes: Vec<u8>) -> i32 {
        self.vm.ios_mut().open(Box::new(MemIos::new(handler, bytes)))
    }

    /// Close an I/O space.
    pub fn ios_close(&mut self, id: i32) -> bool {
        self.vm.ios_mut().close(id)
    }

    /// The current I/O space id.
    pub fn ios_cur(&self) -> Option<i32> {
        self.vm.ios().cur()
    }

    /// Make an I/O space current.
    pub fn ios_set_cur(&mut self, id: i32) -> bool {
        self.vm.ios_mut().set_cur(id)
    }

    /// Find an I/O space by handler string.
    pub fn ios_search(&self, handler: &str) -> Option<i32> {
        self.vm.ios().search(handler)
    }

    /// The handler string of an I/O space.
    pub fn ios_handler(&self, id: i32) -> Option<String> {
        self.vm.ios().get(id).map(|s| s.handler().to_owned())
    }

    /// The size of an I/O space, in bytes.
    pub fn ios_size(&self, id: i32) -> Option<u64> {
        self.vm.ios().get(id).map(|s| s.size())
    }

    /// The open flags of an I/O space.
    pub fn ios_flags(&self, id: i32) -> Option<IosFlags> {
        self.vm.ios().get(id).map(|s| s.flags())
    }

    /// Visit every open I/O space id.
    pub fn ios_map<F: FnMut(i32)>(&self, f: F) {
        self.vm.ios().for_each_id(f);
    }

    // ---- output controls ----

    /// Set the numeration base; rejects values other than 2, 8, 10, 16.
    pub fn set_obase(&mut self, obase: u32) -> bool {
        self.vm.set_obase(obase)
    }

    /// Set the maximum print depth.
    pub fn set_odepth(&mut self, odepth: u32) {
        self.vm.settings_mut().odepth = odepth;
    }

    /// Set the indentation step.
    pub fn set_oindent(&mut self, oindent: u32) {
        self.vm.settings_mut().oindent = oindent;
    }

    /// Set the array print cutoff.
    pub fn set_oacutoff(&mut self, cutoff: u32) {
        self.vm.settings_mut().oacutoff = cutoff;
    }

    /// Show mapping information when printing.
    pub fn set_omaps(&mut self, omaps: bool) {
        self.vm.settings_mut().omaps = omaps;
    }

    /// Set flat or tree output.
    pub fn set_omode(&mut self, omode: OMode) {
        self.vm.settings_mut().omode = omode;
    }

    /// Set the I/O byte order.
    pub fn set_endian(&mut self, endian: Endian) {
        self.vm.settings_mut().endian = endian;
    }

    /// Set the negative encoding.
    pub fn set_nenc(&mut self, nenc: Nenc) {
        self.vm.settings_mut().nenc = nenc;
    }

    /// Use `_print` methods when printing structs.
    pub fn set_pretty_print(&mut self, flag: bool) {
        self.vm.settings_mut().pretty_print = flag;
    }
}
