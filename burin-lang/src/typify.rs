//! The typing phases.
//!
//! `typify1` synthesizes types bottom-up: by the time its post handler
//! runs on a node, every child expression already carries a type, so
//! the node's own type follows from the operator tables.  `typify2`
//! runs after folding and checks global consistency: every expression
//! carries a type, return statements agree with their function, and
//! functions return what they promise.

use crate::ast::{Ast, BinOp, Loc, NodeId, NodeKind, UnOp};
use crate::pass::{children, Flow, PassCtx, Phase};

/// Shared typing payload.
#[derive(Default)]
pub struct Typify1 {
    errors: u32,
}

impl Typify1 {
    /// Fresh payload.
    pub fn new() -> Typify1 {
        Typify1::default()
    }
}

/// The greater of two integral types: maximum width, signed when
/// either side is signed.
pub(crate) fn greater_int_type(ast: &mut Ast, a: NodeId, b: NodeId, loc: Loc) -> Option<NodeId> {
    let (s1, g1) = ast.int_type(a)?;
    let (s2, g2) = ast.int_type(b)?;
    let size = s1.max(s2);
    let signed = g1 || g2;
    if (s1, g1) == (size, signed) {
        Some(a)
    } else if (s2, g2) == (size, signed) {
        Some(b)
    } else {
        Some(ast.add(NodeKind::TypeInt { size, signed }, loc))
    }
}

/// A `uint<64>` type node.
pub(crate) fn uint64(ast: &mut Ast, loc: Loc) -> NodeId {
    ast.add(NodeKind::TypeInt { size: 64, signed: false }, loc)
}

/// An `int<32>` type node, the boolean carrier.
pub(crate) fn int32(ast: &mut Ast, loc: Loc) -> NodeId {
    ast.add(NodeKind::TypeInt { size: 32, signed: true }, loc)
}

/// The representative integral type of an integral-struct type node.
pub(crate) fn struct_itype(ast: &Ast, typ: NodeId) -> Option<NodeId> {
    match ast.kind(typ) {
        NodeKind::TypeStruct { itype, .. } => *itype,
        _ => None,
    }
}

/// Look a field up in a struct type; returns the field's type.
pub(crate) fn struct_field_type(ast: &Ast, typ: NodeId, field: &str) -> Option<NodeId> {
    let NodeKind::TypeStruct { elems, .. } = ast.kind(typ) else {
        return None;
    };
    for elem in ast.chain(*elems) {
        match ast.kind(elem) {
            NodeKind::StructTypeField { name: Some(name), ftype, .. } => {
                if ast.ident_name(*name) == field {
                    return Some(*ftype);
                }
            }
            NodeKind::Decl { kind: crate::ast::DeclKind::Func, name, initial, .. } => {
                if ast.ident_name(*name) == field {
                    return func_type(ast, *initial);
                }
            }
            _ => {}
        }
    }
    None
}

/// The function type of a `Func` node, built fresh from its signature.
pub(crate) fn func_type(ast: &Ast, func: NodeId) -> Option<NodeId> {
    match ast.kind(func) {
        NodeKind::Func { .. } => ast.type_of(func),
        _ => None,
    }
}

/// The declared type of the entity a `Var` node refers to.
pub(crate) fn var_type(ast: &mut Ast, decl: NodeId) -> Option<NodeId> {
    let NodeKind::Decl { initial, .. } = ast.kind(decl) else {
        return None;
    };
    let initial = *initial;
    match ast.kind(initial).clone() {
        NodeKind::FuncArg { atype, .. } => Some(atype),
        NodeKind::StructTypeField { ftype, .. } => Some(ftype),
        // Recursive calls can reference a function whose body is still
        // being typed; its type follows from the signature alone.
        NodeKind::Func { rtype, args, nargs, .. } => match ast.type_of(initial) {
            Some(t) => Some(t),
            None => {
                let loc = ast.loc(initial);
                let rtype = rtype.unwrap_or_else(|| ast.add(NodeKind::TypeVoid, loc));
                Some(ast.add(NodeKind::TypeFun { args, nargs, rtype }, loc))
            }
        },
        NodeKind::Null => ast.type_of(decl),
        _ => ast.type_of(initial).or_else(|| ast.type_of(decl)),
    }
}

/// Infer the type of an expression whose children are already typed.
/// Returns `None` when the node is not an expression or its type
/// cannot be derived (the caller reports).
fn infer(ast: &mut Ast, node: NodeId) -> Option<NodeId> {
    use NodeKind::*;
    let loc = ast.loc(node);
    match ast.kind(node).clone() {
        Integer { .. } => ast.type_of(node),
        Str { .. } => Some(ast.add(TypeStr, loc)),
        Null => Some(ast.add(TypeAny, loc)),
        Offset { magnitude, unit } => {
            let base = ast.type_of(magnitude)?;
            ast.int_type(base)?;
            Some(ast.add(TypeOffset { base, unit }, loc))
        }
        Var { decl, .. } => var_type(ast, decl),
        Unop { op, operand } => {
            let t = ast.type_of(operand)?;
            match op {
                UnOp::Not => Some(int32(ast, loc)),
                _ => Some(t),
            }
        }
        Binop { op, lhs, rhs } => infer_binop(ast, op, lhs, rhs, loc),
        Cast { target, .. } => Some(target),
        Cond { then_e, else_e, .. } => {
            let t1 = ast.type_of(then_e)?;
            let t2 = ast.type_of(else_e)?;
            if ast.type_equal(t1, t2) {
                Some(t1)
            } else if ast.int_type(t1).is_some() && ast.int_type(t2).is_some() {
                greater_int_type(ast, t1, t2, loc)
            } else {
                None
            }
        }
        Indexer { agg, .. } => {
            let t = ast.type_of(agg)?;
            let elem = match ast.kind(t) {
                TypeArray { etype, .. } => Some(*etype),
                TypeStr => None,
                _ => return None,
            };
            match elem {
                Some(etype) => Some(etype),
                None => Some(ast.add(TypeInt { size: 8, signed: false }, loc)),
            }
        }
        Trimmer { agg, .. } => {
            let t = ast.type_of(agg)?;
            let elem = match ast.kind(t) {
                TypeArray { etype, .. } => Some(*etype),
                TypeStr => None,
                _ => return None,
            };
            match elem {
                Some(etype) => Some(ast.add(TypeArray { etype, bound: None }, loc)),
                None => Some(t),
            }
        }
        StructRef { sct, field } => {
            let t = ast.type_of(sct)?;
            let name = ast.ident_name(field).to_owned();
            struct_field_type(ast, t, &name)
        }
        StructLit { stype, .. } => Some(stype),
        ArrayLit { elems, nelems } => {
            let first = ast.chain(elems).next()?;
            let value = match ast.kind(first) {
                ArrayInit { value, .. } => *value,
                _ => return None,
            };
            let etype = ast.type_of(value)?;
            let bound = ast.add(Integer { value: nelems as u64 }, loc);
            let b64 = uint64(ast, loc);
            ast.set_type(bound, b64);
            Some(ast.add(TypeArray { etype, bound: Some(bound) }, loc))
        }
        Funcall { callee, .. } => {
            let t = ast.type_of(callee)?;
            match ast.kind(t) {
                TypeFun { rtype, .. } => Some(*rtype),
                _ => None,
            }
        }
        Map { map_type, .. } => Some(map_type),
        Func { rtype, args, nargs, .. } => {
            let rtype = rtype.unwrap_or_else(|| ast.add(TypeVoid, loc));
            Some(ast.add(TypeFun { args, nargs, rtype }, loc))
        }
        FuncArg { atype, .. } => Some(atype),
        _ => None,
    }
}

/// Coarse shape of an operand type, extracted up front so the rules
/// below can allocate result types freely.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Shape {
    Int,
    Off(NodeId),
    Str,
    Arr,
    Other,
}

fn shape_of(ast: &Ast, t: NodeId) -> Shape {
    match ast.kind(t) {
        NodeKind::TypeInt { .. } => Shape::Int,
        NodeKind::TypeOffset { base, .. } => Shape::Off(*base),
        NodeKind::TypeStr => Shape::Str,
        NodeKind::TypeArray { .. } => Shape::Arr,
        _ => Shape::Other,
    }
}

fn infer_binop(ast: &mut Ast, op: BinOp, lhs: NodeId, rhs: NodeId, loc: Loc) -> Option<NodeId> {
    use NodeKind::*;
    let mut t1 = ast.type_of(lhs)?;
    let mut t2 = ast.type_of(rhs)?;
    // Integral structs join integer arithmetic through their
    // representative type.
    if let Some(it) = struct_itype(ast, t1) {
        t1 = it;
    }
    if let Some(it) = struct_itype(ast, t2) {
        t2 = it;
    }
    let s1 = shape_of(ast, t1);
    let s2 = shape_of(ast, t2);

    if op.is_relational() {
        return Some(int32(ast, loc));
    }
    match op {
        BinOp::And | BinOp::Or => Some(int32(ast, loc)),
        BinOp::Sl | BinOp::Sr | BinOp::Pow => Some(t1),
        BinOp::BConc => {
            let (s1, g1) = ast.int_type(t1)?;
            let (s2, _) = ast.int_type(t2)?;
            let size = s1 + s2;
            if size > 64 {
                return None;
            }
            Some(ast.add(TypeInt { size, signed: g1 }, loc))
        }
        BinOp::Div | BinOp::CeilDiv => match (s1, s2) {
            (Shape::Off(b1), Shape::Off(b2)) => greater_int_type(ast, b1, b2, loc),
            (Shape::Int, Shape::Int) => greater_int_type(ast, t1, t2, loc),
            _ => None,
        },
        BinOp::Mul => match (s1, s2) {
            (Shape::Off(_), Shape::Int) => Some(t1),
            (Shape::Int, Shape::Off(_)) => Some(t2),
            (Shape::Str, Shape::Int) => Some(t1),
            (Shape::Int, Shape::Str) => Some(t2),
            (Shape::Int, Shape::Int) => greater_int_type(ast, t1, t2, loc),
            _ => None,
        },
        BinOp::Add | BinOp::Sub | BinOp::Mod | BinOp::IOr | BinOp::Xor | BinOp::BAnd => {
            match (s1, s2) {
                // The result keeps the left operand's unit.
                (Shape::Off(_), Shape::Off(_)) => Some(t1),
                (Shape::Str, Shape::Str) if op == BinOp::Add => Some(t1),
                (Shape::Arr, Shape::Arr) if op == BinOp::Add => Some(t1),
                (Shape::Int, Shape::Int) => greater_int_type(ast, t1, t2, loc),
                _ => None,
            }
        }
        _ => None,
    }
}

impl Phase for Typify1 {
    fn name(&self) -> &'static str {
        "typify1"
    }

    fn errors(&self) -> u32 {
        self.errors
    }

    fn pre(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        // The iteration variable of a `for in` loop takes the element
        // type of its container, which must be typed before the body.
        if let NodeKind::Loop { kind: crate::ast::LoopKind::In, head, var: Some(var), .. } =
            ctx.ast.kind(node).clone()
        {
            if ctx.ast.type_of(var).is_none() {
                type_subtree(ctx.ast, head);
                let container_t = ctx.ast.type_of(head);
                let elem_t = container_t.and_then(|t| match ctx.ast.kind(t) {
                    NodeKind::TypeArray { etype, .. } => Some(*etype),
                    _ => None,
                });
                match elem_t {
                    Some(elem_t) => ctx.ast.set_type(var, elem_t),
                    None => {
                        ctx.diags.error(
                            ctx.ast.loc(head),
                            "the loop container is not an array",
                        );
                        self.errors += 1;
                        return Flow::Error;
                    }
                }
            }
        }
        Flow::Continue
    }

    fn post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node) {
            // Statements and structural nodes carry no type.
            NodeKind::Assign { .. }
            | NodeKind::ExpStmt { .. }
            | NodeKind::CompStmt { .. }
            | NodeKind::If { .. }
            | NodeKind::Loop { .. }
            | NodeKind::Return { .. }
            | NodeKind::Break { .. }
            | NodeKind::Print { .. }
            | NodeKind::Program { .. }
            | NodeKind::Identifier { .. }
            | NodeKind::StructLitField { .. }
            | NodeKind::ArrayInit { .. }
            | NodeKind::FuncallArg { .. }
            | NodeKind::StructTypeField { .. } => return Flow::Continue,
            NodeKind::Decl { .. } => {
                self.type_decl(ctx, node);
                return Flow::Continue;
            }
            kind if ctx.ast.is_type(node) => {
                let _ = kind;
                return Flow::Continue;
            }
            _ => {}
        }
        if ctx.ast.type_of(node).is_some() {
            return Flow::Continue;
        }
        match infer(ctx.ast, node) {
            Some(typ) => {
                ctx.ast.set_type(node, typ);
                Flow::Continue
            }
            None => {
                ctx.diags.error(
                    ctx.ast.loc(node),
                    "invalid operands in expression",
                );
                self.errors += 1;
                Flow::Error
            }
        }
    }
}

impl Typify1 {
    fn type_decl(&mut self, ctx: &mut PassCtx, node: NodeId) {
        let NodeKind::Decl { kind, initial, .. } = ctx.ast.kind(node).clone() else {
            return;
        };
        use crate::ast::DeclKind;
        let typ = match kind {
            DeclKind::Var | DeclKind::Func => ctx.ast.type_of(initial),
            DeclKind::Type => Some(initial),
            DeclKind::Unit => ctx.ast.type_of(initial),
        };
        if let Some(typ) = typ {
            ctx.ast.set_type(node, typ);
        }
    }
}

/// Eagerly type a whole subtree, bottom-up.  Used where a type is
/// needed before the driver reaches the nodes in order; the later
/// regular visit finds the types already set.
pub(crate) fn type_subtree(ast: &mut Ast, node: NodeId) {
    for child in children(ast, node, true) {
        type_subtree(ast, child);
    }
    if ast.type_of(node).is_none() {
        if let Some(typ) = infer(ast, node) {
            ast.set_type(node, typ);
        }
    }
}

/// Post-folding consistency sweep.
#[derive(Default)]
pub struct Typify2 {
    errors: u32,
}

impl Typify2 {
    /// Fresh payload.
    pub fn new() -> Typify2 {
        Typify2::default()
    }
}

impl Phase for Typify2 {
    fn name(&self) -> &'static str {
        "typify2"
    }

    fn errors(&self) -> u32 {
        self.errors
    }

    fn post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        use NodeKind::*;
        match ctx.ast.kind(node).clone() {
            // Every expression node must carry a type by now.
            Integer { .. } | Str { .. } | Offset { .. } | Binop { .. } | Unop { .. }
            | Cast { .. } | Cond { .. } | Indexer { .. } | Trimmer { .. } | StructRef { .. }
            | ArrayLit { .. } | StructLit { .. } | Funcall { .. } | Map { .. } | Var { .. }
            | Func { .. } => {
                if ctx.ast.type_of(node).is_none() {
                    ctx.diags
                        .error(ctx.ast.loc(node), "expression has no type");
                    self.errors += 1;
                    return Flow::Error;
                }
            }
            Return { exp, function, .. } => {
                let Some(function) = function else {
                    return Flow::Continue;
                };
                let rtype = match ctx.ast.kind(function) {
                    Func { rtype, .. } => *rtype,
                    _ => None,
                };
                match (rtype, exp) {
                    (None, Some(exp)) => {
                        ctx.diags.error(
                            ctx.ast.loc(exp),
                            "returning a value in a void function",
                        );
                        self.errors += 1;
                        return Flow::Error;
                    }
                    (Some(_), None) => {
                        ctx.diags.error(
                            ctx.ast.loc(node),
                            "the function expects a return value",
                        );
                        self.errors += 1;
                        return Flow::Error;
                    }
                    (Some(rtype), Some(exp)) => {
                        let Some(et) = ctx.ast.type_of(exp) else {
                            return Flow::Continue;
                        };
                        if !ctx.ast.type_equal(et, rtype)
                            && !ctx.ast.int_promotable(et, rtype)
                            && !matches!(ctx.ast.kind(rtype), TypeAny)
                        {
                            ctx.diags.error(
                                ctx.ast.loc(exp),
                                "returned value is incompatible with the function's return type",
                            );
                            self.errors += 1;
                            return Flow::Error;
                        }
                    }
                    (None, None) => {}
                }
            }
            Func { rtype: Some(_), body, .. } => {
                if !stmt_returns(ctx.ast, body) {
                    ctx.diags.error(
                        ctx.ast.loc(node),
                        "the function expects a return value",
                    );
                    self.errors += 1;
                    return Flow::Error;
                }
            }
            Assign { lvalue, exp } => {
                if let (Some(lt), Some(rt)) = (ctx.ast.type_of(lvalue), ctx.ast.type_of(exp)) {
                    if !ctx.ast.type_equal(lt, rt)
                        && !ctx.ast.int_promotable(rt, lt)
                        && !matches!(ctx.ast.kind(lt), TypeAny)
                    {
                        ctx.diags.error(
                            ctx.ast.loc(exp),
                            "assigned value is incompatible with the variable's type",
                        );
                        self.errors += 1;
                        return Flow::Error;
                    }
                }
            }
            _ => {}
        }
        Flow::Continue
    }
}

/// Whether a statement subtree always reaches a `return`.  A
/// conservative check: a return at the tail, or an if/else whose both
/// branches return.
fn stmt_returns(ast: &Ast, stmt: NodeId) -> bool {
    match ast.kind(stmt) {
        NodeKind::Return { .. } => true,
        NodeKind::CompStmt { stmts, .. } => {
            ast.chain(*stmts).any(|s| stmt_returns(ast, s))
        }
        NodeKind::If { then_s, else_s: Some(else_s), .. } => {
            stmt_returns(ast, *then_s) && stmt_returns(ast, *else_s)
        }
        _ => false,
    }
}
