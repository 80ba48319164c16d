//! The promotion phase.
//!
//! For every operator family the phase makes the operand types match
//! the result-type contract by wrapping operands in cast nodes, then
//! signals a restart so the earlier phases re-see the rewritten tree.
//! Integral structs participate in integer contexts through a cast to
//! their representative integral type.

use crate::ast::{Ast, BinOp, DeclKind, Loc, NodeId, NodeKind};
use crate::pass::{Flow, PassCtx, Phase};
use crate::typify::{greater_int_type, struct_itype, uint64};

/// Promotion payload.
#[derive(Default)]
pub struct Promo {
    errors: u32,
}

impl Promo {
    /// Fresh payload.
    pub fn new() -> Promo {
        Promo::default()
    }
}

/// Wrap `child` in a cast to `target`, returning the cast node.
fn cast_to(ast: &mut Ast, child: NodeId, target: NodeId) -> NodeId {
    let loc = ast.loc(child);
    let cast = ast.add(NodeKind::Cast { target, expr: child }, loc);
    ast.set_type(cast, target);
    cast
}

/// Promote an operand to `target` when its type differs.  Returns the
/// new child (a cast node) when a rewrite happened.
fn promote(ast: &mut Ast, child: NodeId, target: NodeId) -> Option<NodeId> {
    let ct = ast.type_of(child)?;
    if ast.type_equal(ct, target) {
        return None;
    }
    // Casting is only a promotion when the shapes allow it; leave
    // everything else alone for the typing sweep to reject.
    let promotable = ast.int_promotable(ct, target)
        || match (struct_itype(ast, ct), ast.int_type(target)) {
            (Some(_), Some(_)) => true,
            _ => false,
        }
        || matches!(
            (ast.kind(ct), ast.kind(target)),
            (NodeKind::TypeOffset { .. }, NodeKind::TypeOffset { .. })
        );
    if !promotable {
        return None;
    }
    Some(cast_to(ast, child, target))
}

/// Conversion in constructor context: like [`promote`], but integral
/// widths may also narrow, matching the semantics of an explicit cast
/// on the field value.
fn convert(ast: &mut Ast, child: NodeId, target: NodeId) -> Option<NodeId> {
    let ct = ast.type_of(child)?;
    if ast.type_equal(ct, target) {
        return None;
    }
    if ast.int_type(ct).is_some() && ast.int_type(target).is_some() {
        return Some(cast_to(ast, child, target));
    }
    promote(ast, child, target)
}

/// Promote the elements of an array literal to a declared element
/// type.  Returns true when a rewrite happened; the literal's own type
/// is invalidated so the typing phase recomputes it.
fn promote_array_elems(ast: &mut Ast, lit: NodeId, etype: NodeId) -> bool {
    let NodeKind::ArrayLit { elems, .. } = ast.kind(lit).clone() else {
        return false;
    };
    let mut rewrote = false;
    for elem in ast.chain_vec(elems) {
        let NodeKind::ArrayInit { value, .. } = ast.kind(elem).clone() else {
            continue;
        };
        if let Some(cast) = convert(ast, value, etype) {
            if let NodeKind::ArrayInit { value: slot, .. } = &mut ast.node_mut(elem).kind {
                *slot = cast;
            }
            rewrote = true;
        }
    }
    if rewrote {
        ast.node_mut(lit).type_slot = None;
    }
    rewrote
}

/// A `uint<32>` type node for shift and exponent counts.
fn uint32(ast: &mut Ast, loc: Loc) -> NodeId {
    ast.add(NodeKind::TypeInt { size: 32, signed: false }, loc)
}

/// The canonical `offset<uint<64>, 1>` bit-offset type.
fn bit_offset_type(ast: &mut Ast, loc: Loc) -> NodeId {
    let base = uint64(ast, loc);
    let unit = ast.add(NodeKind::Integer { value: 1 }, loc);
    let u64t = uint64(ast, loc);
    ast.set_type(unit, u64t);
    ast.add(NodeKind::TypeOffset { base, unit }, loc)
}

/// Offsets normalized for comparison or division: bits at the widest
/// base type of the two offset operands.
fn widest_bits_offset_type(ast: &mut Ast, t1: NodeId, t2: NodeId, loc: Loc) -> Option<NodeId> {
    let (b1, b2) = match (ast.kind(t1), ast.kind(t2)) {
        (NodeKind::TypeOffset { base: b1, .. }, NodeKind::TypeOffset { base: b2, .. }) => {
            (*b1, *b2)
        }
        _ => return None,
    };
    let base = greater_int_type(ast, b1, b2, loc)?;
    let unit = ast.add(NodeKind::Integer { value: 1 }, loc);
    let u64t = uint64(ast, loc);
    ast.set_type(unit, u64t);
    Some(ast.add(NodeKind::TypeOffset { base, unit }, loc))
}

impl Phase for Promo {
    fn name(&self) -> &'static str {
        "promo"
    }

    fn errors(&self) -> u32 {
        self.errors
    }

    fn post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        use NodeKind::*;
        let ast = &mut *ctx.ast;
        let loc = ast.loc(node);

        match ast.kind(node).clone() {
            Binop { op, lhs, rhs } => {
                let Some(result) = ast.type_of(node) else {
                    return Flow::Continue;
                };
                let (Some(t1), Some(t2)) = (ast.type_of(lhs), ast.type_of(rhs)) else {
                    return Flow::Continue;
                };

                let mut new_lhs = None;
                let mut new_rhs = None;

                match op {
                    BinOp::Sl | BinOp::Sr | BinOp::Pow => {
                        // The first operand follows the result type; the
                        // count is always a uint<32>.
                        new_lhs = promote(ast, lhs, result);
                        let count_t = uint32(ast, loc);
                        new_rhs = promote(ast, rhs, count_t);
                    }
                    BinOp::Mul => match (ast.kind(t1).clone(), ast.kind(t2).clone()) {
                        (TypeOffset { base, .. }, _) if ast.int_type(t2).is_some() => {
                            new_rhs = promote(ast, rhs, base);
                        }
                        (_, TypeOffset { base, .. }) if ast.int_type(t1).is_some() => {
                            new_lhs = promote(ast, lhs, base);
                        }
                        (TypeStr, _) => {
                            let t = uint64(ast, loc);
                            new_rhs = promote(ast, rhs, t);
                        }
                        (_, TypeStr) => {
                            let t = uint64(ast, loc);
                            new_lhs = promote(ast, lhs, t);
                        }
                        _ => {
                            new_lhs = promote(ast, lhs, result);
                            new_rhs = promote(ast, rhs, result);
                        }
                    },
                    BinOp::Div | BinOp::CeilDiv => {
                        if matches!(ast.kind(t1), TypeOffset { .. })
                            && matches!(ast.kind(t2), TypeOffset { .. })
                        {
                            if let Some(bits) = widest_bits_offset_type(ast, t1, t2, loc) {
                                new_lhs = promote(ast, lhs, bits);
                                new_rhs = promote(ast, rhs, bits);
                            }
                        } else {
                            new_lhs = promote(ast, lhs, result);
                            new_rhs = promote(ast, rhs, result);
                        }
                    }
                    BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                        if matches!(ast.kind(t1), TypeOffset { .. })
                            && matches!(ast.kind(t2), TypeOffset { .. })
                        {
                            if let Some(bits) = widest_bits_offset_type(ast, t1, t2, loc) {
                                new_lhs = promote(ast, lhs, bits);
                                new_rhs = promote(ast, rhs, bits);
                            }
                        } else if ast.int_type(t1).is_some() || ast.int_type(t2).is_some()
                            || struct_itype(ast, t1).is_some()
                            || struct_itype(ast, t2).is_some()
                        {
                            let i1 = struct_itype(ast, t1).unwrap_or(t1);
                            let i2 = struct_itype(ast, t2).unwrap_or(t2);
                            if let Some(common) = greater_int_type(ast, i1, i2, loc) {
                                new_lhs = promote(ast, lhs, common);
                                new_rhs = promote(ast, rhs, common);
                            }
                        }
                    }
                    BinOp::In => {
                        // The left operand promotes to the element type.
                        if let TypeArray { etype, .. } = ast.kind(t2).clone() {
                            new_lhs = promote(ast, lhs, etype);
                        }
                    }
                    BinOp::BConc => {
                        // Integral structs concatenate through their
                        // representative type.
                        if let Some(it) = struct_itype(ast, t1) {
                            new_lhs = Some(cast_to(ast, lhs, it));
                        }
                        if let Some(it) = struct_itype(ast, t2) {
                            new_rhs = Some(cast_to(ast, rhs, it));
                        }
                    }
                    _ => {
                        // Add, sub, mod, bitwise, logical: both operands
                        // follow the result type.
                        new_lhs = promote(ast, lhs, result);
                        new_rhs = promote(ast, rhs, result);
                    }
                }

                if new_lhs.is_none() && new_rhs.is_none() {
                    return Flow::Continue;
                }
                if let Binop { lhs: l, rhs: r, .. } = &mut ast.node_mut(node).kind {
                    if let Some(nl) = new_lhs {
                        *l = nl;
                    }
                    if let Some(nr) = new_rhs {
                        *r = nr;
                    }
                }
                Flow::Restart
            }

            Unop { operand, .. } => {
                let Some(result) = ast.type_of(node) else {
                    return Flow::Continue;
                };
                if ast.int_type(result).is_none() {
                    return Flow::Continue;
                }
                match promote(ast, operand, result) {
                    Some(cast) => {
                        if let Unop { operand: slot, .. } = &mut ast.node_mut(node).kind {
                            *slot = cast;
                        }
                        Flow::Restart
                    }
                    None => Flow::Continue,
                }
            }

            Indexer { index, .. } => {
                let t = uint64(ast, loc);
                match promote(ast, index, t) {
                    Some(cast) => {
                        if let Indexer { index: slot, .. } = &mut ast.node_mut(node).kind {
                            *slot = cast;
                        }
                        Flow::Restart
                    }
                    None => Flow::Continue,
                }
            }

            Trimmer { lo, hi, .. } => {
                let t = uint64(ast, loc);
                let new_lo = promote(ast, lo, t);
                let t = uint64(ast, loc);
                let new_hi = promote(ast, hi, t);
                if new_lo.is_none() && new_hi.is_none() {
                    return Flow::Continue;
                }
                if let Trimmer { lo: l, hi: h, .. } = &mut ast.node_mut(node).kind {
                    if let Some(nl) = new_lo {
                        *l = nl;
                    }
                    if let Some(nh) = new_hi {
                        *h = nh;
                    }
                }
                Flow::Restart
            }

            Map { ios, offset, .. } => {
                let bits = bit_offset_type(ast, loc);
                let new_off = promote(ast, offset, bits);
                let new_ios = ios.and_then(|ios| {
                    let t = ast.add(NodeKind::TypeInt { size: 32, signed: true }, loc);
                    promote(ast, ios, t)
                });
                if new_off.is_none() && new_ios.is_none() {
                    return Flow::Continue;
                }
                if let Map { ios: islot, offset: oslot, .. } = &mut ast.node_mut(node).kind {
                    if let Some(no) = new_off {
                        *oslot = no;
                    }
                    if let Some(ni) = new_ios {
                        *islot = Some(ni);
                    }
                }
                Flow::Restart
            }

            TypeArray { bound: Some(bound), .. } => {
                let Some(bt) = ast.type_of(bound) else {
                    return Flow::Continue;
                };
                let target = if ast.int_type(bt).is_some() {
                    uint64(ast, loc)
                } else if matches!(ast.kind(bt), TypeOffset { .. }) {
                    bit_offset_type(ast, loc)
                } else {
                    return Flow::Continue;
                };
                match promote(ast, bound, target) {
                    Some(cast) => {
                        if let TypeArray { bound: slot, .. } = &mut ast.node_mut(node).kind {
                            *slot = Some(cast);
                        }
                        Flow::Restart
                    }
                    None => Flow::Continue,
                }
            }

            Assign { lvalue, exp } => {
                let (Some(lt), Some(_)) = (ast.type_of(lvalue), ast.type_of(exp)) else {
                    return Flow::Continue;
                };
                match promote(ast, exp, lt) {
                    Some(cast) => {
                        if let Assign { exp: slot, .. } = &mut ast.node_mut(node).kind {
                            *slot = cast;
                        }
                        Flow::Restart
                    }
                    None => Flow::Continue,
                }
            }

            Return { exp: Some(exp), function: Some(function), .. } => {
                let rtype = match ast.kind(function) {
                    Func { rtype, .. } => *rtype,
                    _ => None,
                };
                let Some(rtype) = rtype else {
                    return Flow::Continue;
                };
                match promote(ast, exp, rtype) {
                    Some(cast) => {
                        if let Return { exp: slot, .. } = &mut ast.node_mut(node).kind {
                            *slot = Some(cast);
                        }
                        Flow::Restart
                    }
                    None => Flow::Continue,
                }
            }

            Cond { then_e, else_e, .. } => {
                let Some(result) = ast.type_of(node) else {
                    return Flow::Continue;
                };
                let new_then = promote(ast, then_e, result);
                let new_else = promote(ast, else_e, result);
                if new_then.is_none() && new_else.is_none() {
                    return Flow::Continue;
                }
                if let Cond { then_e: t, else_e: e, .. } = &mut ast.node_mut(node).kind {
                    if let Some(nt) = new_then {
                        *t = nt;
                    }
                    if let Some(ne) = new_else {
                        *e = ne;
                    }
                }
                Flow::Restart
            }

            Funcall { callee, args, .. } => {
                // Actual arguments promote to the declared formal types.
                let Some(ct) = ast.type_of(callee) else {
                    return Flow::Continue;
                };
                let formals: Vec<NodeId> = match ast.kind(ct) {
                    TypeFun { args: formals, .. } => ast.chain_vec(*formals),
                    _ => return Flow::Continue,
                };
                // Method types carry the implicit self formal, which
                // call sites never spell.
                let implicit = formals
                    .first()
                    .map(|f| match ast.kind(*f) {
                        FuncArg { name, .. } => ast.ident_name(*name) == "self",
                        _ => false,
                    })
                    .unwrap_or(false);
                let formals = &formals[if implicit { 1 } else { 0 }..];
                let actuals = ast.chain_vec(args);
                let mut rewrote = false;
                for (actual, formal) in actuals.iter().zip(formals) {
                    let (value, vararg, atype) = {
                        let FuncallArg { value: Some(value), .. } = ast.kind(*actual) else {
                            continue;
                        };
                        let value = *value;
                        match ast.kind(*formal) {
                            FuncArg { atype, vararg, .. } => (value, *vararg, *atype),
                            _ => continue,
                        }
                    };
                    if vararg {
                        break;
                    }
                    if let Some(cast) = promote(ast, value, atype) {
                        if let FuncallArg { value: slot, .. } = &mut ast.node_mut(*actual).kind {
                            *slot = Some(cast);
                        }
                        rewrote = true;
                    }
                }
                if rewrote {
                    Flow::Restart
                } else {
                    Flow::Continue
                }
            }

            StructLit { stype, fields } => {
                // Field values promote to the declared field types; an
                // array literal promotes element by element against the
                // declared element type.
                let mut rewrote = false;
                for field in ast.chain_vec(fields) {
                    let (name, value) = match ast.kind(field) {
                        StructLitField { name: Some(name), value } => (*name, *value),
                        _ => continue,
                    };
                    let fname = ast.ident_name(name).to_owned();
                    let Some(ftype) = crate::typify::struct_field_type(ast, stype, &fname) else {
                        continue;
                    };
                    if let TypeArray { etype, .. } = ast.kind(ftype).clone() {
                        if promote_array_elems(ast, value, etype) {
                            rewrote = true;
                        }
                        continue;
                    }
                    if let Some(cast) = convert(ast, value, ftype) {
                        if let StructLitField { value: slot, .. } = &mut ast.node_mut(field).kind {
                            *slot = cast;
                        }
                        rewrote = true;
                    }
                }
                if rewrote {
                    Flow::Restart
                } else {
                    Flow::Continue
                }
            }

            Decl { kind: DeclKind::Var, initial, .. } => {
                // A variable with a suffix-typed initializer keeps that
                // type; nothing to promote.
                let _ = initial;
                Flow::Continue
            }

            _ => Flow::Continue,
        }
    }
}
