//! The constant folding phase.
//!
//! Operator nodes whose operands are literals collapse into a single
//! literal node.  Folding runs after typing and promotion, so operand
//! types and signs are already unified; arithmetic wraps modulo the
//! width of the result type.  Division by a literal zero and oversized
//! literal shift counts are compile-time errors here.

use crate::ast::{Ast, BinOp, NodeId, NodeKind, UnOp};
use crate::pass::{Flow, PassCtx, Phase};

/// Folding payload.
#[derive(Default)]
pub struct Fold {
    errors: u32,
}

impl Fold {
    /// Fresh payload.
    pub fn new() -> Fold {
        Fold::default()
    }
}

fn mask(size: u16) -> u64 {
    if size >= 64 {
        u64::MAX
    } else {
        (1u64 << size) - 1
    }
}

fn sext(bits: u64, size: u16) -> i64 {
    if size >= 64 {
        bits as i64
    } else {
        let shift = 64 - size as u32;
        ((bits << shift) as i64) >> shift
    }
}

/// An integer literal unpacked with its type.
#[derive(Clone, Copy)]
struct IntLit {
    bits: u64,
    size: u16,
    signed: bool,
}

impl IntLit {
    fn signed_reading(&self) -> i64 {
        if self.signed {
            sext(self.bits, self.size)
        } else {
            self.bits as i64
        }
    }
}

fn int_lit(ast: &Ast, node: NodeId) -> Option<IntLit> {
    let NodeKind::Integer { value } = ast.kind(node) else {
        return None;
    };
    let (size, signed) = ast.int_type(ast.type_of(node)?)?;
    Some(IntLit {
        bits: *value & mask(size),
        size,
        signed,
    })
}

fn str_lit(ast: &Ast, node: NodeId) -> Option<&str> {
    match ast.kind(node) {
        NodeKind::Str { value } => Some(value),
        _ => None,
    }
}

/// An offset literal: integer magnitude and integer unit.
#[derive(Clone, Copy)]
struct OffLit {
    mag: IntLit,
    unit: u64,
}

impl OffLit {
    fn bits(&self) -> i128 {
        self.mag.signed_reading() as i128 * self.unit as i128
    }
}

fn off_lit(ast: &Ast, node: NodeId) -> Option<OffLit> {
    let NodeKind::Offset { magnitude, unit } = ast.kind(node) else {
        return None;
    };
    let mag = int_lit(ast, *magnitude)?;
    let unit = match ast.kind(*unit) {
        NodeKind::Integer { value } => *value,
        _ => return None,
    };
    Some(OffLit { mag, unit })
}

impl Fold {
    fn replace_int(&self, ctx: &mut PassCtx, node: NodeId, bits: u64, typ: NodeId) {
        let Some((size, _)) = ctx.ast.int_type(typ) else {
            return;
        };
        ctx.ast.replace(node, NodeKind::Integer { value: bits & mask(size) });
        ctx.ast.set_type(node, typ);
    }

    fn replace_bool(&self, ctx: &mut PassCtx, node: NodeId, val: bool, typ: NodeId) {
        self.replace_int(ctx, node, val as u64, typ);
    }

    fn replace_str(&self, ctx: &mut PassCtx, node: NodeId, s: String) {
        let loc = ctx.ast.loc(node);
        let typ = ctx.ast.add(NodeKind::TypeStr, loc);
        ctx.ast.replace(node, NodeKind::Str { value: s });
        ctx.ast.set_type(node, typ);
    }

    /// Replace the node with an offset literal of the given bit value,
    /// renormalized to `unit` by integer division (truncating; the
    /// defined semantics for non-exact unit changes).
    fn replace_off(
        &self,
        ctx: &mut PassCtx,
        node: NodeId,
        bits: i128,
        unit: u64,
        mag_type: NodeId,
        off_type: NodeId,
    ) {
        let loc = ctx.ast.loc(node);
        let Some((size, _)) = ctx.ast.int_type(mag_type) else {
            return;
        };
        let mag_val = (bits / unit.max(1) as i128) as u64 & mask(size);
        let mag = ctx.ast.add(NodeKind::Integer { value: mag_val }, loc);
        ctx.ast.set_type(mag, mag_type);
        let unit_node = ctx.ast.add(NodeKind::Integer { value: unit }, loc);
        let u64t = ctx.ast.add(NodeKind::TypeInt { size: 64, signed: false }, loc);
        ctx.ast.set_type(unit_node, u64t);
        ctx.ast
            .replace(node, NodeKind::Offset { magnitude: mag, unit: unit_node });
        ctx.ast.set_type(node, off_type);
    }

    fn fold_int_binop(
        &mut self,
        ctx: &mut PassCtx,
        node: NodeId,
        op: BinOp,
        a: IntLit,
        b: IntLit,
    ) -> Flow {
        let typ = ctx.ast.type_of(node).expect("typed by now");
        let (sa, sb) = (a.signed_reading(), b.signed_reading());
        let (ua, ub) = (a.bits, b.bits);
        let signed = a.signed;

        if matches!(op, BinOp::Div | BinOp::CeilDiv | BinOp::Mod) && ub == 0 {
            ctx.diags.error(ctx.ast.loc(node), "division by zero");
            self.errors += 1;
            return Flow::Error;
        }
        if matches!(op, BinOp::Sl) && ub >= a.size as u64 {
            ctx.diags
                .error(ctx.ast.loc(node), "count in left bit shift too big");
            self.errors += 1;
            return Flow::Error;
        }

        if op.is_relational() && op != BinOp::In {
            let res = match op {
                BinOp::Eq => a.bits == b.bits && a.size == b.size,
                BinOp::Ne => a.bits != b.bits || a.size != b.size,
                BinOp::Lt => {
                    if signed {
                        sa < sb
                    } else {
                        ua < ub
                    }
                }
                BinOp::Gt => {
                    if signed {
                        sa > sb
                    } else {
                        ua > ub
                    }
                }
                BinOp::Le => {
                    if signed {
                        sa <= sb
                    } else {
                        ua <= ub
                    }
                }
                BinOp::Ge => {
                    if signed {
                        sa >= sb
                    } else {
                        ua >= ub
                    }
                }
                _ => unreachable!(),
            };
            self.replace_bool(ctx, node, res, typ);
            return Flow::Continue;
        }

        let bits: u64 = match op {
            BinOp::Add => {
                if signed {
                    sa.wrapping_add(sb) as u64
                } else {
                    ua.wrapping_add(ub)
                }
            }
            BinOp::Sub => {
                if signed {
                    sa.wrapping_sub(sb) as u64
                } else {
                    ua.wrapping_sub(ub)
                }
            }
            BinOp::Mul => {
                if signed {
                    sa.wrapping_mul(sb) as u64
                } else {
                    ua.wrapping_mul(ub)
                }
            }
            BinOp::Div => {
                if signed {
                    sa.wrapping_div(sb) as u64
                } else {
                    ua / ub
                }
            }
            BinOp::CeilDiv => {
                if signed {
                    sa.wrapping_sub(1).wrapping_add(sb).wrapping_div(sb) as u64
                } else {
                    ua.wrapping_sub(1).wrapping_add(ub) / ub
                }
            }
            BinOp::Mod => {
                if signed {
                    sa.wrapping_rem(sb) as u64
                } else {
                    ua % ub
                }
            }
            BinOp::Pow => wrapping_pow(if signed { sa as u64 } else { ua }, ub as u32),
            BinOp::IOr => ua | ub,
            BinOp::Xor => ua ^ ub,
            BinOp::BAnd => ua & ub,
            BinOp::Sl => ua << ub,
            BinOp::Sr => {
                if ub >= a.size as u64 {
                    if signed && sa < 0 {
                        u64::MAX
                    } else {
                        0
                    }
                } else if signed {
                    (sa >> ub) as u64
                } else {
                    ua >> ub
                }
            }
            BinOp::And => ((sa != 0) && (sb != 0)) as u64,
            BinOp::Or => ((sa != 0) || (sb != 0)) as u64,
            BinOp::BConc => (ua << b.size) | ub,
            _ => return Flow::Continue,
        };
        self.replace_int(ctx, node, bits, typ);
        Flow::Continue
    }

    fn fold_off_binop(
        &mut self,
        ctx: &mut PassCtx,
        node: NodeId,
        op: BinOp,
        a: OffLit,
        b: OffLit,
        mag_type: NodeId,
    ) -> Flow {
        let typ = ctx.ast.type_of(node).expect("typed by now");
        let (ba, bb) = (a.bits(), b.bits());

        if matches!(op, BinOp::Div | BinOp::CeilDiv | BinOp::Mod) && bb == 0 {
            ctx.diags.error(ctx.ast.loc(node), "division by zero");
            self.errors += 1;
            return Flow::Error;
        }

        if op.is_relational() && op != BinOp::In {
            let res = match op {
                BinOp::Eq => ba == bb,
                BinOp::Ne => ba != bb,
                BinOp::Lt => ba < bb,
                BinOp::Gt => ba > bb,
                BinOp::Le => ba <= bb,
                BinOp::Ge => ba >= bb,
                _ => unreachable!(),
            };
            self.replace_bool(ctx, node, res, typ);
            return Flow::Continue;
        }

        match op {
            BinOp::Div => {
                self.replace_int(ctx, node, (ba / bb) as u64, typ);
            }
            BinOp::CeilDiv => {
                self.replace_int(ctx, node, ((ba - 1 + bb) / bb) as u64, typ);
            }
            BinOp::Add => self.replace_off(ctx, node, ba + bb, a.unit, mag_type, typ),
            BinOp::Sub => self.replace_off(ctx, node, ba - bb, a.unit, mag_type, typ),
            BinOp::Mod => self.replace_off(ctx, node, ba % bb, a.unit, mag_type, typ),
            BinOp::IOr => self.replace_off(ctx, node, ba | bb, a.unit, mag_type, typ),
            BinOp::Xor => self.replace_off(ctx, node, ba ^ bb, a.unit, mag_type, typ),
            BinOp::BAnd => self.replace_off(ctx, node, ba & bb, a.unit, mag_type, typ),
            _ => {}
        }
        Flow::Continue
    }
}

fn wrapping_pow(base: u64, mut exp: u32) -> u64 {
    let mut result: u64 = 1;
    let mut base = base;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}

impl Phase for Fold {
    fn name(&self) -> &'static str {
        "fold"
    }

    fn errors(&self) -> u32 {
        self.errors
    }

    fn pre(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        // A conditional with a literal condition collapses to the
        // chosen branch before the other branch is folded, so dead
        // branches cannot raise folding errors.
        if let NodeKind::Cond { cond, then_e, else_e } = ctx.ast.kind(node).clone() {
            if let NodeKind::Integer { value } = ctx.ast.kind(cond) {
                let branch = if *value != 0 { then_e } else { else_e };
                let kind = ctx.ast.kind(branch).clone();
                let typ = ctx.ast.type_of(branch);
                ctx.ast.replace(node, kind);
                if let Some(typ) = typ {
                    ctx.ast.set_type(node, typ);
                }
                return Flow::Restart;
            }
        }
        Flow::Continue
    }

    fn post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        use NodeKind::*;
        match ctx.ast.kind(node).clone() {
            Binop { op, lhs, rhs } => {
                if let (Some(a), Some(b)) = (int_lit(ctx.ast, lhs), int_lit(ctx.ast, rhs)) {
                    return self.fold_int_binop(ctx, node, op, a, b);
                }
                if let (Some(a), Some(b)) = (off_lit(ctx.ast, lhs), off_lit(ctx.ast, rhs)) {
                    let mag_type = match ctx.ast.kind(lhs) {
                        Offset { magnitude, .. } => ctx.ast.type_of(*magnitude),
                        _ => None,
                    };
                    let Some(mag_type) = mag_type else {
                        return Flow::Continue;
                    };
                    return self.fold_off_binop(ctx, node, op, a, b, mag_type);
                }
                // Offset scaled by an integer literal.
                if op == BinOp::Mul {
                    let scaled = match (off_lit(ctx.ast, lhs), int_lit(ctx.ast, rhs)) {
                        (Some(o), Some(i)) => Some((lhs, o, i)),
                        _ => match (int_lit(ctx.ast, lhs), off_lit(ctx.ast, rhs)) {
                            (Some(i), Some(o)) => Some((rhs, o, i)),
                            _ => None,
                        },
                    };
                    if let Some((off_node, o, i)) = scaled {
                        let mag_type = match ctx.ast.kind(off_node) {
                            Offset { magnitude, .. } => ctx.ast.type_of(*magnitude),
                            _ => None,
                        };
                        let typ = ctx.ast.type_of(node);
                        if let (Some(mag_type), Some(typ)) = (mag_type, typ) {
                            let bits = o.bits() * i.signed_reading() as i128;
                            self.replace_off(ctx, node, bits, o.unit, mag_type, typ);
                        }
                        return Flow::Continue;
                    }
                }
                // String folding.
                if let (Some(a), Some(b)) =
                    (str_lit(ctx.ast, lhs).map(str::to_owned), str_lit(ctx.ast, rhs).map(str::to_owned))
                {
                    let typ = ctx.ast.type_of(node);
                    match op {
                        BinOp::Add => self.replace_str(ctx, node, format!("{a}{b}")),
                        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                            let res = match op {
                                BinOp::Eq => a == b,
                                BinOp::Ne => a != b,
                                BinOp::Lt => a < b,
                                BinOp::Gt => a > b,
                                BinOp::Le => a <= b,
                                BinOp::Ge => a >= b,
                                _ => unreachable!(),
                            };
                            if let Some(typ) = typ {
                                self.replace_bool(ctx, node, res, typ);
                            }
                        }
                        _ => {}
                    }
                    return Flow::Continue;
                }
                if op == BinOp::Mul {
                    let repeated = match (str_lit(ctx.ast, lhs).map(str::to_owned), int_lit(ctx.ast, rhs)) {
                        (Some(s), Some(n)) => Some((s, n)),
                        _ => match (int_lit(ctx.ast, lhs), str_lit(ctx.ast, rhs).map(str::to_owned)) {
                            (Some(n), Some(s)) => Some((s, n)),
                            _ => None,
                        },
                    };
                    if let Some((s, n)) = repeated {
                        self.replace_str(ctx, node, s.repeat(n.bits as usize));
                    }
                }
                Flow::Continue
            }

            Unop { op, operand } => {
                if let Some(a) = int_lit(ctx.ast, operand) {
                    let Some(typ) = ctx.ast.type_of(node) else {
                        return Flow::Continue;
                    };
                    let bits = match op {
                        UnOp::Pos => a.bits,
                        UnOp::Neg => a.signed_reading().wrapping_neg() as u64,
                        UnOp::Not => (a.signed_reading() == 0) as u64,
                        UnOp::BNot => !a.bits,
                    };
                    self.replace_int(ctx, node, bits, typ);
                }
                Flow::Continue
            }

            Cast { target, expr } => {
                // Narrowing integral casts apply the width mask; the
                // masking in replace_int does it.
                if let Some(a) = int_lit(ctx.ast, expr) {
                    if ctx.ast.int_type(target).is_some() {
                        self.replace_int(ctx, node, a.signed_reading() as u64, target);
                    }
                    return Flow::Continue;
                }
                if let Some(o) = off_lit(ctx.ast, expr) {
                    if let TypeOffset { base, unit } = ctx.ast.kind(target).clone() {
                        let unit = match ctx.ast.kind(unit) {
                            Integer { value } => *value,
                            _ => return Flow::Continue,
                        };
                        if unit == 0 {
                            ctx.diags
                                .error(ctx.ast.loc(node), "invalid offset unit");
                            self.errors += 1;
                            return Flow::Error;
                        }
                        self.replace_off(ctx, node, o.bits(), unit, base, target);
                    }
                    return Flow::Continue;
                }
                if str_lit(ctx.ast, expr).is_some() && matches!(ctx.ast.kind(target), TypeStr) {
                    let kind = ctx.ast.kind(expr).clone();
                    ctx.ast.replace(node, kind);
                    ctx.ast.set_type(node, target);
                }
                Flow::Continue
            }

            Indexer { agg, index } => {
                let Some(ix) = int_lit(ctx.ast, index) else {
                    return Flow::Continue;
                };
                let ix = ix.bits;
                if let Some(s) = str_lit(ctx.ast, agg).map(str::to_owned) {
                    match s.as_bytes().get(ix as usize) {
                        Some(byte) => {
                            let loc = ctx.ast.loc(node);
                            let typ = ctx
                                .ast
                                .add(TypeInt { size: 8, signed: false }, loc);
                            self.replace_int(ctx, node, *byte as u64, typ);
                        }
                        None => {
                            ctx.diags
                                .error(ctx.ast.loc(node), "index is out of bounds of string");
                            self.errors += 1;
                            return Flow::Error;
                        }
                    }
                    return Flow::Continue;
                }
                if let ArrayLit { elems, nelems } = ctx.ast.kind(agg).clone() {
                    if ix >= nelems as u64 {
                        ctx.diags
                            .error(ctx.ast.loc(node), "index is out of bounds of array");
                        self.errors += 1;
                        return Flow::Error;
                    }
                    // Only literal elements substitute; mapped or
                    // computed elements stay for the code generator.
                    let elem = ctx.ast.chain(elems).nth(ix as usize);
                    if let Some(elem) = elem {
                        if let ArrayInit { value, .. } = ctx.ast.kind(elem).clone() {
                            let foldable = matches!(
                                ctx.ast.kind(value),
                                Integer { .. } | Str { .. } | Offset { .. }
                            );
                            if foldable {
                                let kind = ctx.ast.kind(value).clone();
                                let typ = ctx.ast.type_of(value);
                                ctx.ast.replace(node, kind);
                                if let Some(typ) = typ {
                                    ctx.ast.set_type(node, typ);
                                }
                            }
                        }
                    }
                }
                Flow::Continue
            }

            _ => Flow::Continue,
        }
    }
}
