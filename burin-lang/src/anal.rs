//! The analysis phases.
//!
//! Context-sensitive semantic checks that never rewrite the tree:
//! `anal1` runs right after the first transform, `anal2` after constant
//! folding, and `analf` immediately before code generation, where it
//! guarantees every shape the generator relies on.  Each phase keeps an
//! error counter and a small context stack tracking whether the walk is
//! inside a struct type or a method.

use smallvec::SmallVec;

use crate::ast::{Completeness, DeclKind, NodeId, NodeKind};
use crate::pass::{Flow, PassCtx, Phase};

/// Analysis contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    StructType,
    Method,
    PlainFunc,
}

/// Payload shared by the three analysis phases.
#[derive(Default)]
pub struct Anal {
    which: u8,
    errors: u32,
    context: SmallVec<[Context; 8]>,
    /// The expression directly under the innermost expression
    /// statement, for the void-call position check.
    expstmt_exp: Option<NodeId>,
}

impl Anal {
    /// The first analysis, after `trans1`.
    pub fn anal1() -> Anal {
        Anal { which: 1, ..Default::default() }
    }

    /// The second analysis, after folding.
    pub fn anal2() -> Anal {
        Anal { which: 2, ..Default::default() }
    }

    /// The final analysis, right before code generation.
    pub fn analf() -> Anal {
        Anal { which: 3, ..Default::default() }
    }

    fn error(&mut self, ctx: &mut PassCtx, node: NodeId, msg: &str) -> Flow {
        ctx.diags.error(ctx.ast.loc(node), msg);
        self.errors += 1;
        Flow::Error
    }
}

impl Phase for Anal {
    fn name(&self) -> &'static str {
        match self.which {
            1 => "anal1",
            2 => "anal2",
            _ => "analf",
        }
    }

    fn errors(&self) -> u32 {
        self.errors
    }

    fn pre(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node) {
            NodeKind::TypeStruct { .. } => self.context.push(Context::StructType),
            NodeKind::Func { method, .. } => self.context.push(if *method {
                Context::Method
            } else {
                Context::PlainFunc
            }),
            NodeKind::ExpStmt { exp } => self.expstmt_exp = Some(*exp),
            _ => {}
        }
        Flow::Continue
    }

    fn post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node) {
            NodeKind::TypeStruct { .. } | NodeKind::Func { .. } => {
                self.context.pop();
            }
            _ => {}
        }
        match self.which {
            1 => self.anal1_post(ctx, node),
            2 => self.anal2_post(ctx, node),
            _ => self.analf_post(ctx, node),
        }
    }
}

impl Anal {
    fn anal1_post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node).clone() {
            // Names in a struct constructor must be unique.
            NodeKind::StructLit { fields, .. } => {
                let names: Vec<String> = ctx
                    .ast
                    .chain(fields)
                    .filter_map(|f| match ctx.ast.kind(f) {
                        NodeKind::StructLitField { name: Some(n), .. } => {
                            Some(ctx.ast.ident_name(*n).to_owned())
                        }
                        _ => None,
                    })
                    .collect();
                for (ix, name) in names.iter().enumerate() {
                    if names[..ix].contains(name) {
                        return self.error(
                            ctx,
                            node,
                            &format!("duplicated struct element `{name}`"),
                        );
                    }
                }
                Flow::Continue
            }

            NodeKind::TypeStruct { elems, union, pinned, itype, .. } => {
                // Duplicated element names, covering fields and nested
                // declarations.
                let elems = ctx.ast.chain_vec(elems);
                let mut names: Vec<String> = Vec::new();
                for elem in &elems {
                    let name = match ctx.ast.kind(*elem) {
                        NodeKind::StructTypeField { name: Some(n), .. } => {
                            Some(ctx.ast.ident_name(*n).to_owned())
                        }
                        NodeKind::Decl { name, .. } => {
                            Some(ctx.ast.ident_name(*name).to_owned())
                        }
                        _ => None,
                    };
                    if let Some(name) = name {
                        if names.contains(&name) {
                            return self.error(
                                ctx,
                                node,
                                "duplicated element name in struct type spec",
                            );
                        }
                        names.push(name);
                    }
                }

                // In unions, only methods may follow an alternative.
                if union {
                    let mut found_field = false;
                    for elem in &elems {
                        match ctx.ast.kind(*elem) {
                            NodeKind::StructTypeField { .. } => found_field = true,
                            NodeKind::Decl { kind: DeclKind::Func, initial, .. } => {
                                let is_method = matches!(
                                    ctx.ast.kind(*initial),
                                    NodeKind::Func { method: true, .. }
                                );
                                if found_field && !is_method {
                                    return self.error(
                                        ctx,
                                        *elem,
                                        "declarations are not supported after union fields",
                                    );
                                }
                            }
                            NodeKind::Decl { .. } if found_field => {
                                return self.error(
                                    ctx,
                                    *elem,
                                    "declarations are not supported after union fields",
                                );
                            }
                            _ => {}
                        }
                    }
                }

                if itype.is_some() && pinned {
                    return self.error(ctx, node, "integral structs cannot be pinned");
                }
                Flow::Continue
            }

            // Actual arguments are either all named or all positional,
            // without duplicate names.
            NodeKind::Funcall { args, .. } => {
                let mut named = 0usize;
                let mut total = 0usize;
                let mut names: Vec<String> = Vec::new();
                for arg in ctx.ast.chain_vec(args) {
                    total += 1;
                    if let NodeKind::FuncallArg { name: Some(n), .. } = ctx.ast.kind(arg) {
                        named += 1;
                        let name = ctx.ast.ident_name(*n).to_owned();
                        if names.contains(&name) {
                            return self.error(
                                ctx,
                                arg,
                                &format!("duplicated actual argument `{name}`"),
                            );
                        }
                        names.push(name);
                    }
                }
                if named != 0 && named != total {
                    return self.error(
                        ctx,
                        node,
                        "mixed named and positional actual arguments",
                    );
                }
                Flow::Continue
            }

            // At most one vararg formal, in last position; optional
            // formals follow the required ones.
            NodeKind::Func { args, .. } | NodeKind::TypeFun { args, .. } => {
                let formals = ctx.ast.chain_vec(args);
                let mut seen_optional = false;
                for (ix, formal) in formals.iter().enumerate() {
                    let NodeKind::FuncArg { initial, vararg, .. } = ctx.ast.kind(*formal) else {
                        continue;
                    };
                    if *vararg && ix != formals.len() - 1 {
                        return self.error(
                            ctx,
                            *formal,
                            "the vararg argument must be the last",
                        );
                    }
                    if initial.is_some() {
                        seen_optional = true;
                    } else if seen_optional && !*vararg {
                        return self.error(
                            ctx,
                            *formal,
                            "required arguments cannot follow optional arguments",
                        );
                    }
                }
                Flow::Continue
            }

            NodeKind::Break { entity, .. } => {
                if entity.is_none() {
                    return self.error(ctx, node, "break statement without loop");
                }
                Flow::Continue
            }

            NodeKind::Return { function, .. } => {
                if function.is_none() {
                    return self.error(ctx, node, "return statement outside a function");
                }
                Flow::Continue
            }

            // Literal offset units must be positive; symbolic units are
            // checked when they resolve.
            NodeKind::Offset { unit, .. } => {
                if let NodeKind::Integer { value: 0 } = ctx.ast.kind(unit) {
                    return self.error(ctx, node, "offset unit must be bigger than zero");
                }
                Flow::Continue
            }

            // Struct fields are only reachable from inside the struct
            // type itself or from its methods.
            NodeKind::Var { decl, name, .. } => {
                let is_field = matches!(
                    ctx.ast.kind(decl),
                    NodeKind::Decl { initial, .. }
                        if matches!(ctx.ast.kind(*initial), NodeKind::StructTypeField { .. })
                );
                if is_field && self.context.last() == Some(&Context::PlainFunc) {
                    return self.error(
                        ctx,
                        node,
                        &format!("`{name}` is a struct field; only methods can refer to it"),
                    );
                }
                Flow::Continue
            }

            _ => Flow::Continue,
        }
    }

    fn anal2_post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node).clone() {
            // Expression-like nodes must have a known-complete type.
            NodeKind::Binop { .. }
            | NodeKind::Unop { .. }
            | NodeKind::Cast { .. }
            | NodeKind::Cond { .. }
            | NodeKind::Indexer { .. }
            | NodeKind::Trimmer { .. }
            | NodeKind::StructRef { .. }
            | NodeKind::ArrayLit { .. }
            | NodeKind::StructLit { .. }
            | NodeKind::Map { .. }
            | NodeKind::Var { .. } => {
                match ctx.ast.type_of(node) {
                    None => self.error(ctx, node, "expression has no type"),
                    Some(t) => {
                        if ctx.ast.completeness(t) == Completeness::Unknown {
                            self.error(ctx, node, "expression type has unknown completeness")
                        } else {
                            Flow::Continue
                        }
                    }
                }
            }

            NodeKind::Offset { magnitude, .. } => {
                let ok = ctx
                    .ast
                    .type_of(magnitude)
                    .map(|t| ctx.ast.int_type(t).is_some())
                    .unwrap_or(false);
                if !ok {
                    return self.error(ctx, node, "offset magnitudes must be integral");
                }
                Flow::Continue
            }

            // Calls to void functions only make sense as expression
            // statements.
            NodeKind::Funcall { callee, .. } => {
                let void = ctx
                    .ast
                    .type_of(callee)
                    .and_then(|t| match ctx.ast.kind(t) {
                        NodeKind::TypeFun { rtype, .. } => Some(*rtype),
                        _ => None,
                    })
                    .map(|r| matches!(ctx.ast.kind(r), NodeKind::TypeVoid))
                    .unwrap_or(false);
                if void && self.expstmt_exp != Some(node) {
                    return self.error(
                        ctx,
                        node,
                        "call to a void function in an expression",
                    );
                }
                Flow::Continue
            }

            NodeKind::TypeStruct { elems, union, .. } => {
                // Endianness qualifiers only make sense on integral
                // fields; optional fields cannot appear in unions, and
                // alternatives after an unconditional one are
                // unreachable.
                let mut unconditional_seen = false;
                for elem in ctx.ast.chain_vec(elems) {
                    let NodeKind::StructTypeField { ftype, endian, constraint, optcond, .. } =
                        ctx.ast.kind(elem).clone()
                    else {
                        continue;
                    };
                    if endian.is_some() && ctx.ast.int_type(ftype).is_none() {
                        return self.error(
                            ctx,
                            elem,
                            "endianness is only supported in integral fields",
                        );
                    }
                    if union {
                        if optcond.is_some() {
                            return self.error(
                                ctx,
                                elem,
                                "optional fields are not allowed in unions",
                            );
                        }
                        if unconditional_seen {
                            ctx.diags
                                .warning(ctx.ast.loc(elem), "unreachable alternative in union");
                            if ctx.diags.error_on_warning {
                                self.errors += 1;
                                return Flow::Error;
                            }
                        }
                        if constraint.is_none() {
                            unconditional_seen = true;
                        }
                    }
                }
                Flow::Continue
            }

            // Array initializer indices fold to constants or are
            // invalid.
            NodeKind::ArrayInit { index: Some(index), .. } => {
                if !matches!(ctx.ast.kind(index), NodeKind::Integer { .. }) {
                    return self.error(
                        ctx,
                        index,
                        "array initializer indices must be constant",
                    );
                }
                Flow::Continue
            }

            // Unit declarations initialize with an integer constant.
            NodeKind::Decl { kind: DeclKind::Unit, initial, .. } => {
                if !matches!(ctx.ast.kind(initial), NodeKind::Integer { .. }) {
                    return self.error(
                        ctx,
                        initial,
                        "unit declarations must initialize with an integer constant",
                    );
                }
                Flow::Continue
            }

            _ => Flow::Continue,
        }
    }

    fn analf_post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node).clone() {
            // The code generator requires every array initializer to
            // carry an index.
            NodeKind::ArrayInit { index: None, .. } => {
                self.error(ctx, node, "array initializer without an index")
            }
            // Assignable forms only.
            NodeKind::Assign { lvalue, .. } => match ctx.ast.kind(lvalue) {
                NodeKind::Var { .. }
                | NodeKind::StructRef { .. }
                | NodeKind::Indexer { .. }
                | NodeKind::Trimmer { .. } => Flow::Continue,
                _ => self.error(ctx, lvalue, "invalid l-value in assignment"),
            },
            _ => Flow::Continue,
        }
    }
}
