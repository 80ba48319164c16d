//! The transformation phases.
//!
//! Four ordered rewrites interleave with the analysis, typing and
//! folding phases:
//!
//! - `trans1`, right after parsing: normalize integer literal types
//!   and fill array-initializer indices.
//! - `trans2`, after typing and promotion: resolve symbolic offset
//!   units and canonicalize function calls (named arguments to
//!   positional, defaults filled, varargs collected).
//! - `trans3`, after folding: collapse trivial subtrees folding
//!   exposed.
//! - `trans4`, right before the final analysis: lower struct
//!   constructors into the complete, declaration-ordered shape the code
//!   generator expects.

use crate::ast::{NodeId, NodeKind, UnOp};
use crate::parse::{resolve_unit_name, UnitResolution};
use crate::pass::{Flow, PassCtx, Phase};
use crate::typify::uint64;

/// Payload shared by the four transform phases.
#[derive(Default)]
pub struct Trans {
    which: u8,
    errors: u32,
}

impl Trans {
    /// The first transform.
    pub fn trans1() -> Trans {
        Trans { which: 1, errors: 0 }
    }

    /// The second transform.
    pub fn trans2() -> Trans {
        Trans { which: 2, errors: 0 }
    }

    /// The third transform.
    pub fn trans3() -> Trans {
        Trans { which: 3, errors: 0 }
    }

    /// The fourth transform.
    pub fn trans4() -> Trans {
        Trans { which: 4, errors: 0 }
    }
}

impl Phase for Trans {
    fn name(&self) -> &'static str {
        match self.which {
            1 => "trans1",
            2 => "trans2",
            3 => "trans3",
            _ => "trans4",
        }
    }

    fn errors(&self) -> u32 {
        self.errors
    }

    fn post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match self.which {
            1 => self.trans1_post(ctx, node),
            2 => self.trans2_post(ctx, node),
            3 => self.trans3_post(ctx, node),
            _ => self.trans4_post(ctx, node),
        }
    }
}

impl Trans {
    fn trans1_post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node).clone() {
            // Bare integer literals default to int<32>, or int<64> when
            // the value does not fit.
            NodeKind::Integer { value } => {
                if ctx.ast.type_of(node).is_none() {
                    let loc = ctx.ast.loc(node);
                    let size = if value <= i32::MAX as u64 { 32 } else { 64 };
                    let typ = ctx.ast.add(NodeKind::TypeInt { size, signed: true }, loc);
                    ctx.ast.set_type(node, typ);
                }
                Flow::Continue
            }
            // Every array initializer gets an index, a running counter
            // resuming after explicit constant indices.
            NodeKind::ArrayLit { elems, .. } => {
                let mut running: u64 = 0;
                let mut rewrote = false;
                for elem in ctx.ast.chain_vec(elems) {
                    match ctx.ast.kind(elem).clone() {
                        NodeKind::ArrayInit { index: Some(index), .. } => {
                            if let NodeKind::Integer { value } = ctx.ast.kind(index) {
                                running = value + 1;
                            }
                        }
                        NodeKind::ArrayInit { index: None, .. } => {
                            let loc = ctx.ast.loc(elem);
                            let ix = ctx.ast.add(NodeKind::Integer { value: running }, loc);
                            let t = uint64(ctx.ast, loc);
                            ctx.ast.set_type(ix, t);
                            if let NodeKind::ArrayInit { index, .. } =
                                &mut ctx.ast.node_mut(elem).kind
                            {
                                *index = Some(ix);
                            }
                            running += 1;
                            rewrote = true;
                        }
                        _ => {}
                    }
                }
                if rewrote {
                    Flow::Restart
                } else {
                    Flow::Continue
                }
            }
            _ => Flow::Continue,
        }
    }

    fn resolve_unit(&mut self, ctx: &mut PassCtx, unit: NodeId) -> Option<NodeId> {
        let name = match ctx.ast.kind(unit) {
            NodeKind::Identifier { name } => name.clone(),
            _ => return None,
        };
        let loc = ctx.ast.loc(unit);
        let bits = match resolve_unit_name(ctx.ast, ctx.env, &name) {
            Some(UnitResolution::Bits(bits)) => bits,
            Some(UnitResolution::Decl(initial)) => match ctx.ast.kind(initial) {
                NodeKind::Integer { value } => *value,
                _ => {
                    ctx.diags.error(
                        loc,
                        &format!("unit `{name}` does not resolve to a constant"),
                    );
                    self.errors += 1;
                    return None;
                }
            },
            None => {
                ctx.diags.error(loc, &format!("invalid unit `{name}`"));
                self.errors += 1;
                return None;
            }
        };
        if bits == 0 {
            ctx.diags.error(loc, "offset unit must be bigger than zero");
            self.errors += 1;
            return None;
        }
        let node = ctx.ast.add(NodeKind::Integer { value: bits }, loc);
        let t = uint64(ctx.ast, loc);
        ctx.ast.set_type(node, t);
        Some(node)
    }

    fn trans2_post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node).clone() {
            NodeKind::Offset { unit, .. } => {
                if matches!(ctx.ast.kind(unit), NodeKind::Identifier { .. }) {
                    let Some(resolved) = self.resolve_unit(ctx, unit) else {
                        return Flow::Error;
                    };
                    if let NodeKind::Offset { unit: slot, .. } = &mut ctx.ast.node_mut(node).kind {
                        *slot = resolved;
                    }
                    // The node's type has to be recomputed with the
                    // finalized unit.
                    ctx.ast.node_mut(node).type_slot = None;
                    return Flow::Restart;
                }
                Flow::Continue
            }
            NodeKind::TypeOffset { unit, .. } => {
                if matches!(ctx.ast.kind(unit), NodeKind::Identifier { .. }) {
                    let Some(resolved) = self.resolve_unit(ctx, unit) else {
                        return Flow::Error;
                    };
                    if let NodeKind::TypeOffset { unit: slot, .. } =
                        &mut ctx.ast.node_mut(node).kind
                    {
                        *slot = resolved;
                    }
                    return Flow::Restart;
                }
                Flow::Continue
            }
            NodeKind::Funcall { callee, args, .. } => self.canon_funcall(ctx, node, callee, args),
            _ => Flow::Continue,
        }
    }

    /// Rewrite a call into plain positional form: named actuals are
    /// matched to formals, omitted optionals take their defaults, and
    /// actuals beyond a trailing vararg formal collect into an array
    /// literal.
    fn canon_funcall(
        &mut self,
        ctx: &mut PassCtx,
        node: NodeId,
        callee: NodeId,
        args: Option<NodeId>,
    ) -> Flow {
        let Some(ct) = ctx.ast.type_of(callee) else {
            return Flow::Continue;
        };
        let formals: Vec<NodeId> = match ctx.ast.kind(ct) {
            NodeKind::TypeFun { args: formals, .. } => ctx.ast.chain_vec(*formals),
            _ => return Flow::Continue,
        };
        let actuals = ctx.ast.chain_vec(args);
        let loc = ctx.ast.loc(node);

        let named = actuals.iter().any(|a| {
            matches!(ctx.ast.kind(*a), NodeKind::FuncallArg { name: Some(_), .. })
        });

        // Method formals start with the implicit self argument, which
        // call sites never spell; it is filled by the struct-reference
        // lowering.
        let implicit = formals
            .first()
            .map(|f| match ctx.ast.kind(*f) {
                NodeKind::FuncArg { name, .. } => ctx.ast.ident_name(*name) == "self",
                _ => false,
            })
            .unwrap_or(false);
        let formals_spelled = &formals[if implicit { 1 } else { 0 }..];

        let mut values: Vec<NodeId> = Vec::with_capacity(formals_spelled.len());
        let mut consumed = 0usize;
        let mut rewrote = false;

        for (fx, formal) in formals_spelled.iter().enumerate() {
            let (fname, initial, vararg) = match ctx.ast.kind(*formal) {
                NodeKind::FuncArg { name, initial, vararg, .. } => {
                    (ctx.ast.ident_name(*name).to_owned(), *initial, *vararg)
                }
                _ => return Flow::Continue,
            };

            if vararg {
                // Collect the remaining actuals into an array literal.
                let rest: Vec<NodeId> = actuals[consumed.min(actuals.len())..]
                    .iter()
                    .filter_map(|a| match ctx.ast.kind(*a) {
                        NodeKind::FuncallArg { value: Some(value), .. } => Some(*value),
                        _ => None,
                    })
                    .collect();
                consumed = actuals.len();
                if rest.len() == 1
                    && matches!(ctx.ast.kind(rest[0]), NodeKind::ArrayLit { .. })
                {
                    values.push(rest[0]);
                    continue;
                }
                rewrote = true;
                let mut head: Option<NodeId> = None;
                let mut tail: Option<NodeId> = None;
                for value in &rest {
                    let init = ctx.ast.add(
                        NodeKind::ArrayInit { index: None, value: *value },
                        ctx.ast.loc(*value),
                    );
                    match tail {
                        None => head = Some(init),
                        Some(prev) => ctx.ast.set_next(prev, Some(init)),
                    }
                    tail = Some(init);
                }
                let lit = ctx.ast.add(
                    NodeKind::ArrayLit { elems: head, nelems: rest.len() as u32 },
                    loc,
                );
                values.push(lit);
                continue;
            }

            let actual = if named {
                actuals.iter().find_map(|a| match ctx.ast.kind(*a) {
                    NodeKind::FuncallArg { name: Some(name), value: Some(value) } => {
                        if ctx.ast.ident_name(*name) == fname {
                            Some(*value)
                        } else {
                            None
                        }
                    }
                    _ => None,
                })
            } else {
                let a = actuals.get(fx).and_then(|a| match ctx.ast.kind(*a) {
                    NodeKind::FuncallArg { value: Some(value), .. } => Some(*value),
                    _ => None,
                });
                if a.is_some() {
                    consumed = fx + 1;
                }
                a
            };

            match (actual, initial) {
                (Some(value), _) => values.push(value),
                (None, Some(initial)) => {
                    rewrote = true;
                    let copy = ctx.ast.deep_copy(initial);
                    values.push(copy);
                }
                (None, None) => {
                    ctx.diags.error(
                        loc,
                        &format!("missing actual argument for `{fname}`"),
                    );
                    self.errors += 1;
                    return Flow::Error;
                }
            }
        }

        if !named && consumed < actuals.len() {
            ctx.diags.error(loc, "too many actual arguments");
            self.errors += 1;
            return Flow::Error;
        }
        if named {
            rewrote = true;
        }

        if !rewrote && values.len() == actuals.len() {
            // Already canonical.
            if let NodeKind::Funcall { nargs, .. } = &mut ctx.ast.node_mut(node).kind {
                *nargs = values.len() as u32;
            }
            return Flow::Continue;
        }

        // Rebuild the argument chain in formal order.
        let mut head: Option<NodeId> = None;
        let mut tail: Option<NodeId> = None;
        for value in &values {
            let arg = ctx.ast.add(
                NodeKind::FuncallArg { name: None, value: Some(*value) },
                ctx.ast.loc(*value),
            );
            match tail {
                None => head = Some(arg),
                Some(prev) => ctx.ast.set_next(prev, Some(arg)),
            }
            tail = Some(arg);
        }
        let nargs = values.len() as u32;
        if let NodeKind::Funcall { args: aslot, nargs: nslot, .. } =
            &mut ctx.ast.node_mut(node).kind
        {
            *aslot = head;
            *nslot = nargs;
        }
        Flow::Restart
    }

    fn trans3_post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        match ctx.ast.kind(node).clone() {
            // Unary plus is the identity.
            NodeKind::Unop { op: UnOp::Pos, operand } => {
                let kind = ctx.ast.kind(operand).clone();
                let typ = ctx.ast.type_of(operand);
                ctx.ast.replace(node, kind);
                if let Some(typ) = typ {
                    ctx.ast.set_type(node, typ);
                }
                Flow::Restart
            }
            // Casts to the operand's own type collapse.
            NodeKind::Cast { target, expr } => {
                let Some(et) = ctx.ast.type_of(expr) else {
                    return Flow::Continue;
                };
                if ctx.ast.type_equal(et, target)
                    && !matches!(ctx.ast.kind(target), NodeKind::TypeArray { .. })
                {
                    let kind = ctx.ast.kind(expr).clone();
                    ctx.ast.replace(node, kind);
                    ctx.ast.set_type(node, et);
                    return Flow::Restart;
                }
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn trans4_post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
        let NodeKind::StructLit { stype, fields } = ctx.ast.kind(node).clone() else {
            return Flow::Continue;
        };
        let NodeKind::TypeStruct { elems, nfields, .. } = ctx.ast.kind(stype).clone() else {
            return Flow::Continue;
        };

        // Collect the declared fields in order.
        let declared: Vec<(Option<String>, NodeId, Option<NodeId>)> = ctx
            .ast
            .chain_vec(elems)
            .into_iter()
            .filter_map(|elem| match ctx.ast.kind(elem) {
                NodeKind::StructTypeField { name, initial, .. } => Some((
                    name.map(|n| ctx.ast.ident_name(n).to_owned()),
                    elem,
                    *initial,
                )),
                _ => None,
            })
            .collect();

        let provided = ctx.ast.chain_vec(fields);

        // Already lowered when the chain matches the declared order
        // one to one.
        if provided.len() == declared.len()
            && provided.iter().zip(&declared).all(|(p, (dname, _, _))| {
                match ctx.ast.kind(*p) {
                    NodeKind::StructLitField { name: Some(n), .. } => {
                        Some(ctx.ast.ident_name(*n).to_owned()) == *dname
                    }
                    NodeKind::StructLitField { name: None, .. } => dname.is_none(),
                    _ => false,
                }
            })
        {
            return Flow::Continue;
        }

        let loc = ctx.ast.loc(node);
        let mut new_fields: Vec<NodeId> = Vec::with_capacity(nfields as usize);
        let mut used = vec![false; provided.len()];

        for (dx, (dname, _felem, initial)) in declared.iter().enumerate() {
            // A named match first, then positional.
            let mut value = None;
            if let Some(dname) = dname {
                for (px, p) in provided.iter().enumerate() {
                    if used[px] {
                        continue;
                    }
                    if let NodeKind::StructLitField { name: Some(n), value: v } = ctx.ast.kind(*p) {
                        if ctx.ast.ident_name(*n) == dname {
                            value = Some(*v);
                            used[px] = true;
                            break;
                        }
                    }
                }
            }
            if value.is_none() {
                if let Some(p) = provided.get(dx) {
                    if !used[dx] {
                        if let NodeKind::StructLitField { name: None, value: v } =
                            ctx.ast.kind(*p)
                        {
                            value = Some(*v);
                            used[dx] = true;
                        }
                    }
                }
            }
            let value = match (value, initial) {
                (Some(v), _) => v,
                (None, Some(initial)) => ctx.ast.deep_copy(*initial),
                (None, None) => {
                    ctx.diags.error(
                        loc,
                        &format!(
                            "missing value for field `{}`",
                            dname.as_deref().unwrap_or("<anonymous>")
                        ),
                    );
                    self.errors += 1;
                    return Flow::Error;
                }
            };
            let name_node = dname
                .as_ref()
                .map(|n| ctx.ast.add(NodeKind::Identifier { name: n.clone() }, loc));
            let field = ctx.ast.add(
                NodeKind::StructLitField { name: name_node, value },
                ctx.ast.loc(value),
            );
            new_fields.push(field);
        }

        if used.iter().any(|u| !u) {
            ctx.diags
                .error(loc, "unknown element in struct constructor");
            self.errors += 1;
            return Flow::Error;
        }

        let mut head: Option<NodeId> = None;
        let mut tail: Option<NodeId> = None;
        for field in &new_fields {
            match tail {
                None => head = Some(*field),
                Some(prev) => ctx.ast.set_next(prev, Some(*field)),
            }
            tail = Some(*field);
        }
        if let NodeKind::StructLit { fields: slot, .. } = &mut ctx.ast.node_mut(node).kind {
            *slot = head;
        }
        Flow::Restart
    }
}
