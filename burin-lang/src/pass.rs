//! The pass driver.
//!
//! A *phase* is a bundle of pre/post handlers dispatched on node kind;
//! a *pass* is one depth-first walk of the AST invoking an ordered list
//! of phases.  For every node the driver calls each phase's pre
//! handler, recurses into the children, then calls each phase's post
//! handler.  Handlers steer the walk through their return value:
//!
//! - [`Flow::Continue`] — proceed normally.
//! - [`Flow::Restart`] — re-run the phase list on the (possibly
//!   rewritten) current node from its start.  Transformation and
//!   promotion handlers use this after rewriting a subtree.
//! - [`Flow::Break`] — skip the rest of the current subtree for this
//!   phase only.
//! - [`Flow::Done`] — skip this phase's remaining handlers for this
//!   node.
//! - [`Flow::Error`] — the handler counted an error; abandon the
//!   current node and continue with its siblings.
//!
//! Type nodes are traversed only when the pass requests it, and each is
//! marked compiled after its first full visit so later passes (and
//! later occurrences of a shared type) skip the subtree.

use smallvec::SmallVec;
use tracing::trace;

use crate::ast::{Ast, NodeId, NodeKind};
use crate::diag::Diagnostics;
use crate::env::LexEnv;

/// Handler verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Proceed to the next handler or child.
    Continue,
    /// Re-run the phase list on the current node.
    Restart,
    /// Skip the remainder of the subtree for this phase.
    Break,
    /// Skip the remaining handlers of this phase for this node.
    Done,
    /// Abandon the current node, continue with siblings.
    Error,
}

/// Shared state handlers operate on.
pub struct PassCtx<'a> {
    /// The tree being walked.
    pub ast: &'a mut Ast,
    /// The compile-time environment of the input.
    pub env: &'a mut LexEnv,
    /// Diagnostics sink.
    pub diags: &'a mut Diagnostics,
}

/// One compiler phase.
pub trait Phase {
    /// Phase name for traces.
    fn name(&self) -> &'static str;

    /// Errors accumulated in the phase payload.
    fn errors(&self) -> u32;

    /// Called before a node's children are visited.
    fn pre(&mut self, _ctx: &mut PassCtx, _node: NodeId) -> Flow {
        Flow::Continue
    }

    /// Called after a node's children were visited.
    fn post(&mut self, _ctx: &mut PassCtx, _node: NodeId) -> Flow {
        Flow::Continue
    }
}

/// Restart guard: a node re-visited more often than this indicates a
/// transformation that never converges.
const MAX_RESTARTS: u32 = 64;

/// Run one pass over the subtree at `root`.  Returns `Err` when the
/// walk had to stop (a diverging restart); ordinary compile errors are
/// reported through the phase error counters instead.
pub fn run_pass(
    ctx: &mut PassCtx,
    root: NodeId,
    phases: &mut [&mut dyn Phase],
    traverse_types: bool,
) -> Result<(), ()> {
    let active: Vec<bool> = vec![true; phases.len()];
    visit(ctx, root, phases, &active, traverse_types)
}

fn visit(
    ctx: &mut PassCtx,
    node: NodeId,
    phases: &mut [&mut dyn Phase],
    active: &[bool],
    traverse_types: bool,
) -> Result<(), ()> {
    let is_type = ctx.ast.is_type(node);
    if is_type && ctx.ast.node(node).compiled {
        return Ok(());
    }

    let mut restarts = 0u32;
    'restart: loop {
        if restarts >= MAX_RESTARTS {
            ctx.diags.internal(
                ctx.ast.loc(node),
                "transformation does not converge",
                &format!("{:#?}", ctx.ast.node(node)),
            );
            return Err(());
        }
        restarts += 1;

        let mut broken = vec![false; phases.len()];
        let mut done = vec![false; phases.len()];

        for (ix, phase) in phases.iter_mut().enumerate() {
            if !active[ix] {
                continue;
            }
            match phase.pre(ctx, node) {
                Flow::Continue => {}
                Flow::Restart => {
                    trace!(phase = phase.name(), ?node, "restart");
                    continue 'restart;
                }
                Flow::Break => broken[ix] = true,
                Flow::Done => done[ix] = true,
                Flow::Error => return Ok(()),
            }
        }

        let child_active: Vec<bool> = active
            .iter()
            .zip(&broken)
            .map(|(a, b)| *a && !*b)
            .collect();
        if child_active.iter().any(|a| *a) {
            for child in children(ctx.ast, node, traverse_types) {
                visit(ctx, child, phases, &child_active, traverse_types)?;
            }
        }

        for (ix, phase) in phases.iter_mut().enumerate() {
            if !active[ix] || broken[ix] || done[ix] {
                continue;
            }
            match phase.post(ctx, node) {
                Flow::Continue | Flow::Break | Flow::Done => {}
                Flow::Restart => {
                    trace!(phase = phase.name(), ?node, "restart from post");
                    continue 'restart;
                }
                Flow::Error => return Ok(()),
            }
        }

        if is_type && traverse_types {
            ctx.ast.node_mut(node).compiled = true;
        }
        return Ok(());
    }
}

/// The child edges of a node, chains flattened.  Type-node children are
/// included only when the pass traverses types.
pub fn children(ast: &Ast, node: NodeId, traverse_types: bool) -> SmallVec<[NodeId; 8]> {
    use NodeKind::*;
    let mut out: SmallVec<[NodeId; 8]> = SmallVec::new();
    {
        macro_rules! push {
            ($id:expr) => {
                out.push($id)
            };
        }
        macro_rules! push_opt {
            ($id:expr) => {
                if let Some(id) = $id {
                    out.push(*id);
                }
            };
        }
        match ast.kind(node) {
            Identifier { .. } | Integer { .. } | Str { .. } | Null | Var { .. } | TypeInt { .. }
            | TypeStr | TypeAny | TypeVoid => {}
            Offset { magnitude, unit } => {
                push!(*magnitude);
                push!(*unit);
            }
            Binop { lhs, rhs, .. } => {
                push!(*lhs);
                push!(*rhs);
            }
            Unop { operand, .. } => push!(*operand),
            Cast { target, expr } => {
                push!(*target);
                push!(*expr);
            }
            Cond { cond, then_e, else_e } => {
                push!(*cond);
                push!(*then_e);
                push!(*else_e);
            }
            Indexer { agg, index } => {
                push!(*agg);
                push!(*index);
            }
            Trimmer { agg, lo, hi } => {
                push!(*agg);
                push!(*lo);
                push!(*hi);
            }
            StructRef { sct, field } => {
                push!(*sct);
                push!(*field);
            }
            ArrayLit { elems, .. } => out.extend(ast.chain(*elems)),
            ArrayInit { index, value } => {
                push_opt!(index);
                push!(*value);
            }
            StructLit { stype, fields } => {
                push!(*stype);
                out.extend(ast.chain(*fields));
            }
            StructLitField { name, value } => {
                push_opt!(name);
                push!(*value);
            }
            Funcall { callee, args, .. } => {
                push!(*callee);
                out.extend(ast.chain(*args));
            }
            FuncallArg { name, value } => {
                push_opt!(name);
                push_opt!(value);
            }
            Map { map_type, ios, offset } => {
                push!(*map_type);
                push_opt!(ios);
                push!(*offset);
            }
            Func { rtype, args, body, .. } => {
                push_opt!(rtype);
                out.extend(ast.chain(*args));
                push!(*body);
            }
            FuncArg { name, atype, initial, .. } => {
                push!(*name);
                push!(*atype);
                push_opt!(initial);
            }
            Assign { lvalue, exp } => {
                push!(*lvalue);
                push!(*exp);
            }
            ExpStmt { exp } | Print { exp } => push!(*exp),
            CompStmt { stmts, .. } => out.extend(ast.chain(*stmts)),
            If { cond, then_s, else_s } => {
                push!(*cond);
                push!(*then_s);
                push_opt!(else_s);
            }
            Loop { head, var, body, .. } => {
                push!(*head);
                push_opt!(var);
                push!(*body);
            }
            Return { exp, .. } => push_opt!(exp),
            Break { .. } => {}
            Decl { name, initial, .. } => {
                push!(*name);
                push!(*initial);
            }
            TypeArray { etype, bound } => {
                push!(*etype);
                push_opt!(bound);
            }
            TypeStruct { elems, itype, .. } => {
                push_opt!(itype);
                out.extend(ast.chain(*elems));
            }
            StructTypeField {
                name,
                ftype,
                constraint,
                optcond,
                initial,
                label,
                ..
            } => {
                push_opt!(name);
                push!(*ftype);
                push_opt!(initial);
                push_opt!(constraint);
                push_opt!(optcond);
                push_opt!(label);
            }
            TypeFun { args, rtype, .. } => {
                out.extend(ast.chain(*args));
                push!(*rtype);
            }
            TypeOffset { base, unit } => {
                push!(*base);
                push!(*unit);
            }
            Program { elems } => out.extend(ast.chain(*elems)),
        }
    }
    if !traverse_types {
        out.retain(|id| !ast.is_type(*id));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Loc};
    use burin_vm::CollectTerminal;

    struct Counter {
        pres: u32,
        posts: u32,
        restarted: bool,
    }

    impl Phase for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }
        fn errors(&self) -> u32 {
            0
        }
        fn pre(&mut self, _ctx: &mut PassCtx, _node: NodeId) -> Flow {
            self.pres += 1;
            Flow::Continue
        }
        fn post(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
            self.posts += 1;
            // Rewrite the first binop seen into an integer, once.
            if !self.restarted {
                if let NodeKind::Binop { .. } = ctx.ast.kind(node) {
                    self.restarted = true;
                    ctx.ast.replace(node, NodeKind::Integer { value: 7 });
                    return Flow::Restart;
                }
            }
            Flow::Continue
        }
    }

    #[test]
    fn restart_re_walks_the_rewritten_node() {
        let mut ast = Ast::new();
        let lhs = ast.add(NodeKind::Integer { value: 1 }, Loc::default());
        let rhs = ast.add(NodeKind::Integer { value: 2 }, Loc::default());
        let add = ast.add(NodeKind::Binop { op: BinOp::Add, lhs, rhs }, Loc::default());
        let mut env = LexEnv::new();
        let mut diags = Diagnostics::new(CollectTerminal::shared(), "<test>", "");
        let mut ctx = PassCtx {
            ast: &mut ast,
            env: &mut env,
            diags: &mut diags,
        };
        let mut counter = Counter {
            pres: 0,
            posts: 0,
            restarted: false,
        };
        let mut phases: Vec<&mut dyn Phase> = vec![&mut counter];
        run_pass(&mut ctx, add, &mut phases, true).unwrap();
        assert!(counter.restarted);
        assert!(matches!(ast.kind(add), NodeKind::Integer { value: 7 }));
        // The node was visited twice: once as a binop (with children),
        // once as the rewritten literal.
        assert_eq!(counter.pres, 4);
    }

    struct Breaker {
        visited_child: bool,
    }

    impl Phase for Breaker {
        fn name(&self) -> &'static str {
            "breaker"
        }
        fn errors(&self) -> u32 {
            0
        }
        fn pre(&mut self, ctx: &mut PassCtx, node: NodeId) -> Flow {
            match ctx.ast.kind(node) {
                NodeKind::Binop { .. } => Flow::Break,
                NodeKind::Integer { .. } => {
                    self.visited_child = true;
                    Flow::Continue
                }
                _ => Flow::Continue,
            }
        }
    }

    #[test]
    fn break_skips_the_subtree() {
        let mut ast = Ast::new();
        let lhs = ast.add(NodeKind::Integer { value: 1 }, Loc::default());
        let rhs = ast.add(NodeKind::Integer { value: 2 }, Loc::default());
        let add = ast.add(NodeKind::Binop { op: BinOp::Add, lhs, rhs }, Loc::default());
        let mut env = LexEnv::new();
        let mut diags = Diagnostics::new(CollectTerminal::shared(), "<test>", "");
        let mut ctx = PassCtx {
            ast: &mut ast,
            env: &mut env,
            diags: &mut diags,
        };
        let mut breaker = Breaker {
            visited_child: false,
        };
        let mut phases: Vec<&mut dyn Phase> = vec![&mut breaker];
        run_pass(&mut ctx, add, &mut phases, true).unwrap();
        assert!(!breaker.visited_child);
    }

    #[test]
    fn type_nodes_are_marked_compiled() {
        let mut ast = Ast::new();
        let t = ast.add(NodeKind::TypeInt { size: 8, signed: true }, Loc::default());
        let mut env = LexEnv::new();
        let mut diags = Diagnostics::new(CollectTerminal::shared(), "<test>", "");
        let mut counter = Counter {
            pres: 0,
            posts: 0,
            restarted: true,
        };
        {
            let mut ctx = PassCtx {
                ast: &mut ast,
                env: &mut env,
                diags: &mut diags,
            };
            let mut phases: Vec<&mut dyn Phase> = vec![&mut counter];
            run_pass(&mut ctx, t, &mut phases, true).unwrap();
        }
        assert!(ast.node(t).compiled);
        {
            let mut ctx = PassCtx {
                ast: &mut ast,
                env: &mut env,
                diags: &mut diags,
            };
            let mut phases: Vec<&mut dyn Phase> = vec![&mut counter];
            run_pass(&mut ctx, t, &mut phases, true).unwrap();
        }
        // The second pass skipped the compiled type.
        assert_eq!(counter.pres, 1);
    }
}
