//! The recursive-descent parser.
//!
//! Produces AST nodes in the arena and performs name resolution as it
//! goes: declarations are registered into the lexical environment and
//! identifier uses become `Var` nodes carrying their `(back, over)`
//! lexical address.  Compound statements, function bodies, loop bodies
//! with an iteration variable and struct type bodies each open a frame,
//! mirroring the frames the generated code pushes at run time.

use burin_vm::{units, Endian};

use crate::ast::{
    Ast, BinOp, DeclKind, Loc, LoopKind, NodeId, NodeKind, UnOp,
};
use crate::diag::Diagnostics;
use crate::env::{LexEnv, Namespace};
use crate::lex::{tokenize, Tok, Token};

/// What one parser invocation consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseKind {
    /// A sequence of declarations and statements up to end of input.
    Program,
    /// A single statement.
    Statement,
    /// A single expression.
    Expression,
}

/// Hook resolving identifiers unknown to the lexical environment when
/// lexical cuckolding is enabled.  Returns a replacement spelling.
pub type AlienTokenFn = dyn FnMut(&str) -> Option<String>;

/// Outcome of a successful parse.
pub struct Parsed {
    /// Root node: a `Program` for program parses, otherwise the
    /// statement or expression node.
    pub root: NodeId,
    /// Byte offset just past the consumed input.
    pub end: usize,
}

/// Parse a buffer.  Errors are reported through the diagnostics sink;
/// the environment may be left with new registrations, which is why the
/// caller works on a snapshot.
pub fn parse(
    kind: ParseKind,
    source: &str,
    ast: &mut Ast,
    env: &mut LexEnv,
    diags: &mut Diagnostics,
    alien: Option<&mut AlienTokenFn>,
) -> Result<Parsed, ()> {
    let tokens = match tokenize(source) {
        Ok(tokens) => tokens,
        Err(e) => {
            diags.error(e.loc, &e.msg);
            return Err(());
        }
    };
    let mut parser = Parser {
        tokens,
        pos: 0,
        ast,
        env,
        diags,
        alien,
        func_stack: Vec::new(),
        loop_stack: Vec::new(),
        source_tag: None,
    };
    let root = match kind {
        ParseKind::Program => parser.parse_program()?,
        ParseKind::Statement => parser.parse_stmt_or_decl()?,
        ParseKind::Expression => parser.parse_expr()?,
    };
    let end = parser.consumed_end();
    Ok(Parsed { root, end })
}

/// Parse the contents of a source file as a program, tagging the
/// declarations with the file name.
pub fn parse_file(
    source: &str,
    file: &str,
    ast: &mut Ast,
    env: &mut LexEnv,
    diags: &mut Diagnostics,
) -> Result<Parsed, ()> {
    let tokens = match tokenize(source) {
        Ok(tokens) => tokens,
        Err(e) => {
            diags.error(e.loc, &e.msg);
            return Err(());
        }
    };
    let mut parser = Parser {
        tokens,
        pos: 0,
        ast,
        env,
        diags,
        alien: None,
        func_stack: Vec::new(),
        loop_stack: Vec::new(),
        source_tag: Some(file.to_owned()),
    };
    let root = parser.parse_program()?;
    let end = parser.consumed_end();
    Ok(Parsed { root, end })
}

struct FuncCtx {
    node: NodeId,
    entry_depth: u32,
}

struct LoopCtx {
    node: NodeId,
    entry_depth: u32,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ast: &'a mut Ast,
    env: &'a mut LexEnv,
    diags: &'a mut Diagnostics,
    alien: Option<&'a mut AlienTokenFn>,
    func_stack: Vec<FuncCtx>,
    loop_stack: Vec<LoopCtx>,
    source_tag: Option<String>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek2(&self) -> &Tok {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].tok
    }

    fn loc(&self) -> Loc {
        self.tokens[self.pos.min(self.tokens.len() - 1)].loc
    }

    fn prev_loc(&self) -> Loc {
        self.tokens[self.pos.saturating_sub(1)].loc
    }

    fn consumed_end(&self) -> usize {
        self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)].end
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].tok.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ()> {
        if self.eat(tok) {
            Ok(())
        } else {
            self.err_here(&format!("expected {what}"))
        }
    }

    fn err_here<T>(&mut self, msg: &str) -> Result<T, ()> {
        self.diags.error(self.loc(), msg);
        Err(())
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Ident(name) if name == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, Loc), ()> {
        let loc = self.loc();
        match self.bump() {
            Tok::Ident(name) => Ok((name, loc)),
            _ => {
                self.diags.error(loc, &format!("expected {what}"));
                Err(())
            }
        }
    }

    fn make_ident(&mut self, name: &str, loc: Loc) -> NodeId {
        self.ast
            .add(NodeKind::Identifier { name: name.to_owned() }, loc)
    }

    // ---- programs, declarations and statements ----

    fn parse_program(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let mut head: Option<NodeId> = None;
        let mut tail: Option<NodeId> = None;
        while !self.at(&Tok::Eof) {
            let elem = self.parse_stmt_or_decl()?;
            match tail {
                None => head = Some(elem),
                Some(prev) => self.ast.set_next(prev, Some(elem)),
            }
            tail = Some(elem);
        }
        Ok(self
            .ast
            .add(NodeKind::Program { elems: head }, loc.to(self.prev_loc())))
    }

    fn parse_stmt_or_decl(&mut self) -> Result<NodeId, ()> {
        if self.at_kw("var") || self.at_kw("fun") || self.at_kw("type") || self.at_kw("unit") {
            self.parse_decl()
        } else {
            self.parse_stmt()
        }
    }

    fn parse_decl(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let kind = match self.bump() {
            Tok::Ident(kw) => match kw.as_str() {
                "var" => DeclKind::Var,
                "fun" => DeclKind::Func,
                "type" => DeclKind::Type,
                "unit" => DeclKind::Unit,
                _ => unreachable!("caller checked the keyword"),
            },
            _ => unreachable!("caller checked the keyword"),
        };
        let (name, name_loc) = self.expect_ident("a declaration name")?;
        self.expect(&Tok::Assign, "`=`")?;

        let name_node = self.make_ident(&name, name_loc);
        let decl = self.ast.add(
            NodeKind::Decl {
                kind,
                name: name_node,
                // Placeholder until the initial is parsed; functions
                // need the declaration registered first so they can
                // recurse.
                initial: name_node,
                order: 0,
                source: self.source_tag.clone(),
            },
            loc,
        );

        let ns = if kind == DeclKind::Unit {
            Namespace::Units
        } else {
            Namespace::Main
        };

        // Functions can call themselves; register before the body.
        if kind == DeclKind::Func && !self.env.register(self.ast, ns, &name, decl) {
            self.diags
                .error(name_loc, &format!("`{name}` is already declared"));
            return Err(());
        }

        let initial = match kind {
            DeclKind::Var => {
                let e = self.parse_expr()?;
                self.expect(&Tok::Semi, "`;`")?;
                e
            }
            DeclKind::Func => {
                let f = self.parse_func(false)?;
                self.eat(&Tok::Semi);
                f
            }
            DeclKind::Type => {
                let t = self.parse_type(Some(&name))?;
                self.expect(&Tok::Semi, "`;`")?;
                t
            }
            DeclKind::Unit => {
                let e = self.parse_expr()?;
                self.expect(&Tok::Semi, "`;`")?;
                e
            }
        };
        if let NodeKind::Decl { initial: slot, .. } = &mut self.ast.node_mut(decl).kind {
            *slot = initial;
        }
        self.ast.node_mut(decl).loc = loc.to(self.prev_loc());

        if kind != DeclKind::Func && !self.env.register(self.ast, ns, &name, decl) {
            self.diags
                .error(name_loc, &format!("`{name}` is already declared"));
            return Err(());
        }
        Ok(decl)
    }

    /// Parse `(formals) rtype? { body }`.  The formals and the body
    /// share one frame, matching the single `pushf` the generated
    /// prologue executes.
    fn parse_func(&mut self, method: bool) -> Result<NodeId, ()> {
        let loc = self.loc();
        self.expect(&Tok::LParen, "`(`")?;

        self.env.push_frame();
        // The body slot is patched after it parses.
        let body_placeholder = self.ast.add(NodeKind::Null, loc);
        let func = self.ast.add(
            NodeKind::Func {
                rtype: None,
                args: None,
                nargs: 0,
                body: body_placeholder,
                method,
            },
            loc,
        );
        self.func_stack.push(FuncCtx {
            node: func,
            entry_depth: self.env.depth(),
        });

        let result = self.parse_func_tail(func, method);
        self.func_stack.pop();
        self.env.pop_frame();
        result
    }

    fn parse_func_tail(&mut self, func: NodeId, method: bool) -> Result<NodeId, ()> {
        let mut args_head: Option<NodeId> = None;
        let mut args_tail: Option<NodeId> = None;
        let mut nargs: u32 = 0;

        // Methods receive the struct value as an implicit first formal.
        if method {
            let loc = self.loc();
            let name = self.make_ident("self", loc);
            let atype = self.ast.add(NodeKind::TypeAny, loc);
            let arg = self.ast.add(
                NodeKind::FuncArg {
                    name,
                    atype,
                    initial: None,
                    vararg: false,
                },
                loc,
            );
            self.register_formal(arg, "self", loc)?;
            args_head = Some(arg);
            args_tail = Some(arg);
            nargs = 1;
        }

        if !self.at(&Tok::RParen) {
            loop {
                let arg = self.parse_formal()?;
                match args_tail {
                    None => args_head = Some(arg),
                    Some(prev) => self.ast.set_next(prev, Some(arg)),
                }
                args_tail = Some(arg);
                nargs += 1;
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(&Tok::RParen, "`)`")?;

        let rtype = if self.at(&Tok::LBrace) {
            None
        } else {
            Some(self.parse_type(None)?)
        };

        let body = self.parse_comp_stmt()?;

        if let NodeKind::Func {
            rtype: rslot,
            args,
            nargs: nslot,
            body: bslot,
            ..
        } = &mut self.ast.node_mut(func).kind
        {
            *rslot = rtype;
            *args = args_head;
            *nslot = nargs;
            *bslot = body;
        }
        self.ast.node_mut(func).loc = self.ast.loc(func).to(self.prev_loc());
        Ok(func)
    }

    fn register_formal(&mut self, arg: NodeId, name: &str, loc: Loc) -> Result<(), ()> {
        // Formals live in the function frame as ordinary variables.
        let name_node = self.make_ident(name, loc);
        let decl = self.ast.add(
            NodeKind::Decl {
                kind: DeclKind::Var,
                name: name_node,
                initial: arg,
                order: 0,
                source: self.source_tag.clone(),
            },
            loc,
        );
        if !self.env.register(self.ast, Namespace::Main, name, decl) {
            self.diags
                .error(loc, &format!("duplicate argument `{name}`"));
            return Err(());
        }
        Ok(())
    }

    fn parse_formal(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let atype = self.parse_type(None)?;
        let vararg = self.eat(&Tok::Ellipsis);
        let (name, name_loc) = self.expect_ident("an argument name")?;
        let initial = if self.eat(&Tok::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let name_node = self.make_ident(&name, name_loc);
        let arg = self.ast.add(
            NodeKind::FuncArg {
                name: name_node,
                atype,
                initial,
                vararg,
            },
            loc.to(self.prev_loc()),
        );
        self.register_formal(arg, &name, name_loc)?;
        Ok(arg)
    }

    fn parse_stmt(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        if self.at(&Tok::LBrace) {
            return self.parse_comp_stmt();
        }
        if self.eat_kw("if") {
            self.expect(&Tok::LParen, "`(`")?;
            let cond = self.parse_expr()?;
            self.expect(&Tok::RParen, "`)`")?;
            let then_s = self.parse_stmt()?;
            let else_s = if self.eat_kw("else") {
                Some(self.parse_stmt()?)
            } else {
                None
            };
            return Ok(self.ast.add(
                NodeKind::If { cond, then_s, else_s },
                loc.to(self.prev_loc()),
            ));
        }
        if self.at_kw("while") || self.at_kw("for") {
            return self.parse_loop();
        }
        if self.eat_kw("return") {
            let exp = if self.at(&Tok::Semi) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(&Tok::Semi, "`;`")?;
            let (function, nframes) = match self.func_stack.last() {
                Some(ctx) => (Some(ctx.node), self.env.depth() - ctx.entry_depth),
                None => (None, 0),
            };
            return Ok(self.ast.add(
                NodeKind::Return { exp, function, nframes },
                loc.to(self.prev_loc()),
            ));
        }
        if self.eat_kw("break") {
            self.expect(&Tok::Semi, "`;`")?;
            let (entity, nframes) = match self.loop_stack.last() {
                Some(ctx) => (Some(ctx.node), self.env.depth() - ctx.entry_depth),
                None => (None, 0),
            };
            return Ok(self.ast.add(
                NodeKind::Break { entity, nframes },
                loc.to(self.prev_loc()),
            ));
        }
        if self.eat_kw("print") {
            let exp = self.parse_expr()?;
            self.expect(&Tok::Semi, "`;`")?;
            return Ok(self
                .ast
                .add(NodeKind::Print { exp }, loc.to(self.prev_loc())));
        }

        // Assignment or expression statement.
        let exp = self.parse_expr()?;
        if self.eat(&Tok::Assign) {
            let rhs = self.parse_expr()?;
            self.expect(&Tok::Semi, "`;`")?;
            return Ok(self.ast.add(
                NodeKind::Assign { lvalue: exp, exp: rhs },
                loc.to(self.prev_loc()),
            ));
        }
        self.expect(&Tok::Semi, "`;`")?;
        Ok(self
            .ast
            .add(NodeKind::ExpStmt { exp }, loc.to(self.prev_loc())))
    }

    fn parse_comp_stmt(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        self.expect(&Tok::LBrace, "`{`")?;
        self.env.push_frame();

        let mut head: Option<NodeId> = None;
        let mut tail: Option<NodeId> = None;
        let mut ok = true;
        while !self.at(&Tok::RBrace) && !self.at(&Tok::Eof) {
            match self.parse_stmt_or_decl() {
                Ok(elem) => {
                    match tail {
                        None => head = Some(elem),
                        Some(prev) => self.ast.set_next(prev, Some(elem)),
                    }
                    tail = Some(elem);
                }
                Err(()) => {
                    ok = false;
                    break;
                }
            }
        }
        let numvars = self.env.num_vars();
        self.env.pop_frame();
        if !ok {
            return Err(());
        }
        self.expect(&Tok::RBrace, "`}`")?;
        Ok(self.ast.add(
            NodeKind::CompStmt { stmts: head, numvars },
            loc.to(self.prev_loc()),
        ))
    }

    fn parse_loop(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let while_p = self.eat_kw("while");
        if !while_p {
            self.eat_kw("for");
        }
        self.expect(&Tok::LParen, "`(`")?;

        if while_p {
            let cond = self.parse_expr()?;
            self.expect(&Tok::RParen, "`)`")?;
            return self.finish_loop(loc, LoopKind::While, cond, None, 0);
        }

        if self.at_kw("var") {
            // for (var v in container) body
            self.bump();
            let (name, name_loc) = self.expect_ident("an iteration variable")?;
            if !self.eat_kw("in") {
                return self.err_here("expected `in`");
            }
            let container = self.parse_expr()?;
            self.expect(&Tok::RParen, "`)`")?;

            // The iteration variable lives in a dedicated frame.
            self.env.push_frame();
            let name_node = self.make_ident(&name, name_loc);
            let dummy = self.ast.add(NodeKind::Null, name_loc);
            let decl = self.ast.add(
                NodeKind::Decl {
                    kind: DeclKind::Var,
                    name: name_node,
                    initial: dummy,
                    order: 0,
                    source: self.source_tag.clone(),
                },
                name_loc,
            );
            self.env.register(self.ast, Namespace::Main, &name, decl);
            let result = self.finish_loop(loc, LoopKind::In, container, Some(decl), 1);
            self.env.pop_frame();
            return result;
        }

        // for (count) body
        let count = self.parse_expr()?;
        self.expect(&Tok::RParen, "`)`")?;
        self.finish_loop(loc, LoopKind::Times, count, None, 0)
    }

    fn finish_loop(
        &mut self,
        loc: Loc,
        kind: LoopKind,
        head: NodeId,
        var: Option<NodeId>,
        extra_frames: u32,
    ) -> Result<NodeId, ()> {
        let node = self.ast.add(
            NodeKind::Loop {
                kind,
                head,
                var,
                body: head,
            },
            loc,
        );
        let entry_depth = self.env.depth();
        self.loop_stack.push(LoopCtx { node, entry_depth });
        let body = self.parse_stmt();
        self.loop_stack.pop();
        let body = body?;
        debug_assert_eq!(entry_depth, self.env.depth());
        if let NodeKind::Loop { body: slot, .. } = &mut self.ast.node_mut(node).kind {
            *slot = body;
        }
        self.ast.node_mut(node).loc = loc.to(self.prev_loc());
        Ok(node)
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> Result<NodeId, ()> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let cond = self.parse_binary(0)?;
        if self.eat(&Tok::Question) {
            let then_e = self.parse_expr()?;
            self.expect(&Tok::Colon, "`:`")?;
            let else_e = self.parse_expr()?;
            return Ok(self.ast.add(
                NodeKind::Cond { cond, then_e, else_e },
                loc.to(self.prev_loc()),
            ));
        }
        Ok(cond)
    }

    /// Binary operators by precedence level, loosest first.
    fn binop_at(&self, level: usize) -> Option<BinOp> {
        let tok = self.peek();
        let op = match level {
            0 => match tok {
                Tok::PipePipe => BinOp::Or,
                _ => return None,
            },
            1 => match tok {
                Tok::AmpAmp => BinOp::And,
                _ => return None,
            },
            2 => match tok {
                Tok::Pipe => BinOp::IOr,
                _ => return None,
            },
            3 => match tok {
                Tok::Caret => BinOp::Xor,
                _ => return None,
            },
            4 => match tok {
                Tok::Amp => BinOp::BAnd,
                _ => return None,
            },
            5 => match tok {
                Tok::EqEq => BinOp::Eq,
                Tok::BangEq => BinOp::Ne,
                _ => return None,
            },
            6 => match tok {
                Tok::Lt => BinOp::Lt,
                Tok::Gt => BinOp::Gt,
                Tok::Le => BinOp::Le,
                Tok::Ge => BinOp::Ge,
                Tok::Ident(kw) if kw == "in" => BinOp::In,
                _ => return None,
            },
            7 => match tok {
                Tok::ColonColonColon => BinOp::BConc,
                _ => return None,
            },
            8 => match tok {
                Tok::Shl => BinOp::Sl,
                Tok::Shr => BinOp::Sr,
                _ => return None,
            },
            9 => match tok {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return None,
            },
            10 => match tok {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::SlashCaret => BinOp::CeilDiv,
                Tok::Percent => BinOp::Mod,
                _ => return None,
            },
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, level: usize) -> Result<NodeId, ()> {
        const LEVELS: usize = 11;
        if level >= LEVELS {
            return self.parse_pow();
        }
        let loc = self.loc();
        let mut lhs = self.parse_binary(level + 1)?;
        while let Some(op) = self.binop_at(level) {
            self.bump();
            let rhs = self.parse_binary(level + 1)?;
            lhs = self.ast.add(
                NodeKind::Binop { op, lhs, rhs },
                loc.to(self.prev_loc()),
            );
        }
        Ok(lhs)
    }

    fn parse_pow(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let lhs = self.parse_unary()?;
        if self.eat(&Tok::StarStar) {
            // Right-associative.
            let rhs = self.parse_pow()?;
            return Ok(self.ast.add(
                NodeKind::Binop { op: BinOp::Pow, lhs, rhs },
                loc.to(self.prev_loc()),
            ));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let op = match self.peek() {
            Tok::Plus => Some(UnOp::Pos),
            Tok::Minus => Some(UnOp::Neg),
            Tok::Bang => Some(UnOp::Not),
            Tok::Tilde => Some(UnOp::BNot),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(self.ast.add(
                NodeKind::Unop { op, operand },
                loc.to(self.prev_loc()),
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let mut expr = self.parse_primary()?;
        loop {
            if self.at(&Tok::LBrack) {
                self.bump();
                let first = self.parse_expr()?;
                if self.eat(&Tok::Colon) {
                    let hi = self.parse_expr()?;
                    self.expect(&Tok::RBrack, "`]`")?;
                    expr = self.ast.add(
                        NodeKind::Trimmer { agg: expr, lo: first, hi },
                        loc.to(self.prev_loc()),
                    );
                } else {
                    self.expect(&Tok::RBrack, "`]`")?;
                    expr = self.ast.add(
                        NodeKind::Indexer { agg: expr, index: first },
                        loc.to(self.prev_loc()),
                    );
                }
            } else if self.at(&Tok::Dot) {
                self.bump();
                let (name, name_loc) = self.expect_ident("a field name")?;
                let field = self.make_ident(&name, name_loc);
                expr = self.ast.add(
                    NodeKind::StructRef { sct: expr, field },
                    loc.to(self.prev_loc()),
                );
            } else if self.at(&Tok::LParen) {
                self.bump();
                let mut head: Option<NodeId> = None;
                let mut tail: Option<NodeId> = None;
                if !self.at(&Tok::RParen) {
                    loop {
                        let arg = self.parse_funcall_arg()?;
                        match tail {
                            None => head = Some(arg),
                            Some(prev) => self.ast.set_next(prev, Some(arg)),
                        }
                        tail = Some(arg);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RParen, "`)`")?;
                let nargs = self.ast.chain(head).count() as u32;
                expr = self.ast.add(
                    NodeKind::Funcall { callee: expr, args: head, nargs },
                    loc.to(self.prev_loc()),
                );
            } else if self.at(&Tok::Hash) {
                self.bump();
                let unit = self.parse_offset_unit()?;
                expr = self.ast.add(
                    NodeKind::Offset { magnitude: expr, unit },
                    loc.to(self.prev_loc()),
                );
            } else if self.at_kw("as") {
                self.bump();
                let target = self.parse_type(None)?;
                expr = self.ast.add(
                    NodeKind::Cast { target, expr },
                    loc.to(self.prev_loc()),
                );
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_funcall_arg(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        // Named style: `name = expr`.
        if let (Tok::Ident(name), Tok::Assign) = (self.peek().clone(), self.peek2().clone()) {
            if !self.is_keyword(&name) {
                self.bump();
                self.bump();
                let name_node = self.make_ident(&name, loc);
                let value = self.parse_expr()?;
                return Ok(self.ast.add(
                    NodeKind::FuncallArg {
                        name: Some(name_node),
                        value: Some(value),
                    },
                    loc.to(self.prev_loc()),
                ));
            }
        }
        let value = self.parse_expr()?;
        Ok(self.ast.add(
            NodeKind::FuncallArg { name: None, value: Some(value) },
            loc.to(self.prev_loc()),
        ))
    }

    /// `#` was consumed; parse the unit: a standard suffix, a declared
    /// unit name, an integer number of bits, or a parenthesized
    /// constant expression.
    fn parse_offset_unit(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.bump();
                Ok(self.make_ident(&name, loc))
            }
            Tok::Int { value, .. } => {
                self.bump();
                Ok(self.ast.add(NodeKind::Integer { value }, loc))
            }
            Tok::LParen => {
                self.bump();
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen, "`)`")?;
                Ok(e)
            }
            _ => self.err_here("expected an offset unit"),
        }
    }

    fn is_keyword(&self, name: &str) -> bool {
        matches!(
            name,
            "var" | "fun" | "type" | "unit" | "if" | "else" | "while" | "for" | "in" | "return"
                | "break" | "print" | "null" | "as" | "struct" | "union" | "pinned" | "method"
                | "int" | "uint" | "string" | "any" | "offset" | "little" | "big"
        )
    }

    fn parse_primary(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();

        // A type in expression position: the map operator or a struct
        // constructor.
        if self.type_starts_here() {
            if let Some(expr) = self.try_parse_type_expr()? {
                return Ok(expr);
            }
        }

        match self.peek().clone() {
            Tok::Int { value, width, unsigned } => {
                self.bump();
                let node = self.ast.add(NodeKind::Integer { value }, loc);
                if let Some(width) = width {
                    let typ = self.ast.add(
                        NodeKind::TypeInt {
                            size: width as u16,
                            signed: !unsigned,
                        },
                        loc,
                    );
                    self.ast.set_type(node, typ);
                } else if unsigned {
                    let typ = self
                        .ast
                        .add(NodeKind::TypeInt { size: 32, signed: false }, loc);
                    self.ast.set_type(node, typ);
                }
                Ok(node)
            }
            Tok::Str(value) => {
                self.bump();
                Ok(self.ast.add(NodeKind::Str { value }, loc))
            }
            Tok::LParen => {
                self.bump();
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen, "`)`")?;
                Ok(e)
            }
            Tok::LBrack => self.parse_array_lit(),
            Tok::Ident(name) => {
                if name == "null" {
                    self.bump();
                    return Ok(self.ast.add(NodeKind::Null, loc));
                }
                if name == "fun" {
                    self.bump();
                    return self.parse_func(false);
                }
                if self.is_keyword(&name) {
                    return self.err_here(&format!("unexpected `{name}`"));
                }
                self.bump();
                self.parse_var_ref(&name, loc)
            }
            _ => self.err_here("expected an expression"),
        }
    }

    fn parse_var_ref(&mut self, name: &str, loc: Loc) -> Result<NodeId, ()> {
        let mut name = name.to_owned();
        let mut hit = self.env.lookup(self.ast, Namespace::Main, &name);
        if hit.is_none() {
            // Route unknown identifiers to the alien-token resolver
            // when lexical cuckolding is on.
            if let Some(alien) = self.alien.as_mut() {
                if let Some(replacement) = alien(&name) {
                    name = replacement;
                    hit = self.env.lookup(self.ast, Namespace::Main, &name);
                }
            }
        }
        let Some((decl, back, over)) = hit else {
            self.diags
                .error(loc, &format!("undefined identifier `{name}`"));
            return Err(());
        };

        match self.ast.kind(decl) {
            NodeKind::Decl { kind: DeclKind::Type, .. } => {
                self.diags
                    .error(loc, &format!("`{name}` is a type, not a value"));
                Err(())
            }
            _ => Ok(self.ast.add(
                NodeKind::Var {
                    name,
                    back,
                    over,
                    decl,
                },
                loc,
            )),
        }
    }

    fn parse_array_lit(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        self.expect(&Tok::LBrack, "`[`")?;
        let mut head: Option<NodeId> = None;
        let mut tail: Option<NodeId> = None;
        let mut nelems: u32 = 0;
        if !self.at(&Tok::RBrack) {
            loop {
                let eloc = self.loc();
                // Explicitly indexed element: `.[index] = value`.
                let index = if self.at(&Tok::Dot) && *self.peek2() == Tok::LBrack {
                    self.bump();
                    self.bump();
                    let ix = self.parse_expr()?;
                    self.expect(&Tok::RBrack, "`]`")?;
                    self.expect(&Tok::Assign, "`=`")?;
                    Some(ix)
                } else {
                    None
                };
                let value = self.parse_expr()?;
                let elem = self.ast.add(
                    NodeKind::ArrayInit { index, value },
                    eloc.to(self.prev_loc()),
                );
                match tail {
                    None => head = Some(elem),
                    Some(prev) => self.ast.set_next(prev, Some(elem)),
                }
                tail = Some(elem);
                nelems += 1;
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(&Tok::RBrack, "`]`")?;
        Ok(self.ast.add(
            NodeKind::ArrayLit { elems: head, nelems },
            loc.to(self.prev_loc()),
        ))
    }

    // ---- types ----

    fn type_starts_here(&self) -> bool {
        match self.peek() {
            Tok::Ident(name) => match name.as_str() {
                "int" | "uint" | "string" | "any" | "offset" | "struct" | "union" => true,
                name if self.is_keyword(name) => false,
                name => {
                    // A declared type name followed by `@` or `{`.
                    matches!(
                        self.env.lookup(self.ast, Namespace::Main, name),
                        Some((decl, _, _))
                            if matches!(
                                self.ast.kind(decl),
                                NodeKind::Decl { kind: DeclKind::Type, .. }
                            )
                    ) && matches!(self.peek2(), Tok::At | Tok::LBrace)
                }
            },
            _ => false,
        }
    }

    /// Try a type in expression position.  Returns a `Map` node for
    /// `type @ …`, a `StructLit` for `Type { … }`, and `None` when the
    /// tokens turn out to be an ordinary expression after all.
    fn try_parse_type_expr(&mut self) -> Result<Option<NodeId>, ()> {
        let loc = self.loc();
        let save = self.pos;
        let typ = match self.parse_type(None) {
            Ok(typ) => typ,
            Err(()) => {
                // `int`/`uint` etc. never start an ordinary expression,
                // so this really is a malformed type.
                return Err(());
            }
        };

        if self.eat(&Tok::At) {
            // `type @ offset` or `type @ ios : offset`.
            let first = self.parse_binary(7)?;
            let (ios, offset) = if self.eat(&Tok::Colon) {
                let off = self.parse_binary(7)?;
                (Some(first), off)
            } else {
                (None, first)
            };
            return Ok(Some(self.ast.add(
                NodeKind::Map { map_type: typ, ios, offset },
                loc.to(self.prev_loc()),
            )));
        }

        if self.at(&Tok::LBrace) {
            if let NodeKind::TypeStruct { .. } = self.ast.kind(typ) {
                self.bump();
                let mut head: Option<NodeId> = None;
                let mut tail: Option<NodeId> = None;
                if !self.at(&Tok::RBrace) {
                    loop {
                        let floc = self.loc();
                        let name = if let (Tok::Ident(n), Tok::Assign) =
                            (self.peek().clone(), self.peek2().clone())
                        {
                            self.bump();
                            self.bump();
                            Some(self.make_ident(&n, floc))
                        } else {
                            None
                        };
                        let value = self.parse_expr()?;
                        let field = self.ast.add(
                            NodeKind::StructLitField { name, value },
                            floc.to(self.prev_loc()),
                        );
                        match tail {
                            None => head = Some(field),
                            Some(prev) => self.ast.set_next(prev, Some(field)),
                        }
                        tail = Some(field);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBrace, "`}`")?;
                return Ok(Some(self.ast.add(
                    NodeKind::StructLit { stype: typ, fields: head },
                    loc.to(self.prev_loc()),
                )));
            }
        }

        // Not a type expression after all; rewind.  Nodes parsed in
        // the attempt stay in the arena as garbage, which is harmless.
        self.pos = save;
        Ok(None)
    }

    fn parse_type(&mut self, decl_name: Option<&str>) -> Result<NodeId, ()> {
        let loc = self.loc();
        let mut typ = self.parse_basic_type(decl_name)?;
        // Array type suffixes.
        while self.at(&Tok::LBrack) {
            self.bump();
            let bound = if self.at(&Tok::RBrack) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(&Tok::RBrack, "`]`")?;
            typ = self.ast.add(
                NodeKind::TypeArray { etype: typ, bound },
                loc.to(self.prev_loc()),
            );
        }
        Ok(typ)
    }

    fn parse_basic_type(&mut self, decl_name: Option<&str>) -> Result<NodeId, ()> {
        let loc = self.loc();
        match self.peek().clone() {
            Tok::Ident(name) => match name.as_str() {
                "int" | "uint" => {
                    self.bump();
                    let signed = name == "int";
                    self.expect(&Tok::Lt, "`<`")?;
                    let size = match self.bump() {
                        Tok::Int { value, .. } if (1..=64).contains(&value) => value as u16,
                        _ => return self.err_here("expected an integral size 1..64"),
                    };
                    self.expect(&Tok::Gt, "`>`")?;
                    Ok(self
                        .ast
                        .add(NodeKind::TypeInt { size, signed }, loc.to(self.prev_loc())))
                }
                "string" => {
                    self.bump();
                    Ok(self.ast.add(NodeKind::TypeStr, loc))
                }
                "any" => {
                    self.bump();
                    Ok(self.ast.add(NodeKind::TypeAny, loc))
                }
                "offset" => {
                    self.bump();
                    self.expect(&Tok::Lt, "`<`")?;
                    let base = self.parse_type(None)?;
                    self.expect(&Tok::Comma, "`,`")?;
                    let unit = self.parse_offset_unit()?;
                    self.expect(&Tok::Gt, "`>`")?;
                    Ok(self.ast.add(
                        NodeKind::TypeOffset { base, unit },
                        loc.to(self.prev_loc()),
                    ))
                }
                "struct" | "union" => self.parse_struct_type(name == "union", decl_name),
                name if self.is_keyword(name) => self.err_here("expected a type"),
                _ => {
                    self.bump();
                    match self.env.lookup(self.ast, Namespace::Main, &name) {
                        Some((decl, _, _)) => match self.ast.kind(decl) {
                            NodeKind::Decl {
                                kind: DeclKind::Type,
                                initial,
                                ..
                            } => Ok(*initial),
                            _ => {
                                self.diags
                                    .error(loc, &format!("`{name}` does not name a type"));
                                Err(())
                            }
                        },
                        None => {
                            self.diags
                                .error(loc, &format!("undefined type `{name}`"));
                            Err(())
                        }
                    }
                }
            },
            _ => self.err_here("expected a type"),
        }
    }

    fn parse_struct_type(&mut self, union: bool, decl_name: Option<&str>) -> Result<NodeId, ()> {
        let loc = self.loc();
        self.bump();

        let pinned = self.eat_kw("pinned");
        // Integral struct: `struct int<N> { … }`.
        let itype = if !self.at(&Tok::LBrace) && (self.at_kw("int") || self.at_kw("uint")) {
            Some(self.parse_basic_type(None)?)
        } else {
            None
        };
        self.expect(&Tok::LBrace, "`{`")?;

        // The struct body opens a frame: fields are registered as
        // variables so later fields, bounds and constraints can refer
        // to them.
        self.env.push_frame();
        let result = self.parse_struct_elems(union);
        self.env.pop_frame();
        let (elems, nfields) = result?;
        self.expect(&Tok::RBrace, "`}`")?;

        Ok(self.ast.add(
            NodeKind::TypeStruct {
                elems,
                nfields,
                union,
                pinned,
                itype,
                name: decl_name.map(str::to_owned),
            },
            loc.to(self.prev_loc()),
        ))
    }

    fn parse_struct_elems(&mut self, _union: bool) -> Result<(Option<NodeId>, u32), ()> {
        let mut head: Option<NodeId> = None;
        let mut tail: Option<NodeId> = None;
        let mut nfields: u32 = 0;
        while !self.at(&Tok::RBrace) && !self.at(&Tok::Eof) {
            let elem = if self.at_kw("method") {
                self.parse_method()?
            } else if self.at_kw("var") || self.at_kw("fun") || self.at_kw("type")
                || self.at_kw("unit")
            {
                self.parse_decl()?
            } else {
                nfields += 1;
                self.parse_struct_field()?
            };
            match tail {
                None => head = Some(elem),
                Some(prev) => self.ast.set_next(prev, Some(elem)),
            }
            tail = Some(elem);
        }
        Ok((head, nfields))
    }

    fn parse_method(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        self.bump();
        let (name, name_loc) = self.expect_ident("a method name")?;
        self.expect(&Tok::Assign, "`=`")?;
        let name_node = self.make_ident(&name, name_loc);
        let decl = self.ast.add(
            NodeKind::Decl {
                kind: DeclKind::Func,
                name: name_node,
                initial: name_node,
                order: 0,
                source: self.source_tag.clone(),
            },
            loc,
        );
        if !self.env.register(self.ast, Namespace::Main, &name, decl) {
            self.diags
                .error(name_loc, &format!("`{name}` is already declared"));
            return Err(());
        }
        let func = self.parse_func(true)?;
        self.eat(&Tok::Semi);
        if let NodeKind::Decl { initial, .. } = &mut self.ast.node_mut(decl).kind {
            *initial = func;
        }
        self.ast.node_mut(decl).loc = loc.to(self.prev_loc());
        Ok(decl)
    }

    fn parse_struct_field(&mut self) -> Result<NodeId, ()> {
        let loc = self.loc();
        let endian = if self.eat_kw("little") {
            Some(Endian::Lsb)
        } else if self.eat_kw("big") {
            Some(Endian::Msb)
        } else {
            None
        };
        let ftype = self.parse_type(None)?;
        let name = match self.peek().clone() {
            Tok::Ident(n) if !self.is_keyword(&n) => {
                let nloc = self.loc();
                self.bump();
                Some((n, nloc))
            }
            _ => None,
        };

        // The field node exists before its initializer and constraint
        // parse: both may refer to the field, and later fields resolve
        // against the declaration registered here.
        let name_node = name
            .as_ref()
            .map(|(n, nloc)| self.make_ident(n, *nloc));
        let field = self.ast.add(
            NodeKind::StructTypeField {
                name: name_node,
                ftype,
                endian,
                constraint: None,
                optcond: None,
                initial: None,
                label: None,
            },
            loc,
        );
        if let Some((fname, floc)) = &name {
            let decl_name = self.make_ident(fname, *floc);
            let decl = self.ast.add(
                NodeKind::Decl {
                    kind: DeclKind::Var,
                    name: decl_name,
                    initial: field,
                    order: 0,
                    source: self.source_tag.clone(),
                },
                *floc,
            );
            if !self.env.register(self.ast, Namespace::Main, fname, decl) {
                self.diags
                    .error(*floc, &format!("duplicated field name `{fname}`"));
                return Err(());
            }
        }

        let initial = if self.eat(&Tok::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let constraint = if self.eat(&Tok::Colon) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let optcond = if self.eat_kw("if") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let label = if self.eat(&Tok::At) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(&Tok::Semi, "`;`")?;

        if let NodeKind::StructTypeField {
            constraint: cslot,
            optcond: oslot,
            initial: islot,
            label: lslot,
            ..
        } = &mut self.ast.node_mut(field).kind
        {
            *cslot = constraint;
            *oslot = optcond;
            *islot = initial;
            *lslot = label;
        }
        self.ast.node_mut(field).loc = loc.to(self.prev_loc());
        Ok(field)
    }

}

/// Resolve a unit identifier: standard suffixes first, then declared
/// unit aliases.
pub fn resolve_unit_name(
    ast: &Ast,
    env: &LexEnv,
    name: &str,
) -> Option<UnitResolution> {
    if let Some(bits) = units::by_suffix(name) {
        return Some(UnitResolution::Bits(bits));
    }
    match env.lookup(ast, Namespace::Units, name) {
        Some((decl, _, _)) => match ast.kind(decl) {
            NodeKind::Decl { initial, .. } => Some(UnitResolution::Decl(*initial)),
            _ => None,
        },
        None => None,
    }
}

/// How a unit name resolved.
pub enum UnitResolution {
    /// A standard suffix with a fixed bit value.
    Bits(u64),
    /// A declared unit alias; the node is the alias's initializer.
    Decl(NodeId),
}
