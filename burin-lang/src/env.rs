//! Compile-time lexical environments.
//!
//! An environment is a stack of frames.  Each frame keeps two hashed
//! name maps: the main namespace, shared by variables, functions and
//! types, and a separate namespace for offset-unit aliases.  A
//! registered declaration receives a dense `over` index from the
//! counter of its kind; lookup walks the frames innermost-first and
//! reports the `(back, over)` lexical address.
//!
//! The top-level frame can be duplicated cheaply; the incremental
//! compiler snapshots it before every input so a failed compilation
//! leaves the live environment untouched.

use hashbrown::HashMap;
use itertools::Itertools;

use crate::ast::{Ast, DeclKind, NodeId, NodeKind};

/// The two namespaces of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Variables, functions and types.
    Main,
    /// Offset-unit aliases.
    Units,
}

#[derive(Debug, Clone, Default)]
struct Frame {
    main: HashMap<String, NodeId>,
    units: HashMap<String, NodeId>,
    num_types: u32,
    num_vars: u32,
    num_units: u32,
}

impl Frame {
    fn table(&self, ns: Namespace) -> &HashMap<String, NodeId> {
        match ns {
            Namespace::Main => &self.main,
            Namespace::Units => &self.units,
        }
    }
}

/// A compile-time environment.
#[derive(Debug, Clone)]
pub struct LexEnv {
    /// Frames, innermost last.
    frames: Vec<Frame>,
}

impl Default for LexEnv {
    fn default() -> Self {
        LexEnv::new()
    }
}

impl LexEnv {
    /// An environment with a single top-level frame.
    pub fn new() -> LexEnv {
        LexEnv {
            frames: vec![Frame::default()],
        }
    }

    /// Open a new innermost frame.
    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Close the innermost frame.
    ///
    /// # Panics
    /// Panics when only the top-level frame remains.
    pub fn pop_frame(&mut self) {
        assert!(self.frames.len() > 1, "popped the top-level frame");
        self.frames.pop();
    }

    /// Whether only the top-level frame is open.
    pub fn is_toplevel(&self) -> bool {
        self.frames.len() == 1
    }

    /// Number of open frames.
    pub fn depth(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Number of variable/function slots registered in the innermost
    /// frame so far.
    pub fn num_vars(&self) -> u32 {
        self.frames.last().expect("no frames").num_vars
    }

    /// Register a declaration under `name` in the innermost frame,
    /// assigning its `order`.  Returns false when the name is already
    /// taken in the namespace.
    pub fn register(&mut self, ast: &mut Ast, ns: Namespace, name: &str, decl: NodeId) -> bool {
        let frame = self.frames.last_mut().expect("no frames");
        let table = match ns {
            Namespace::Main => &mut frame.main,
            Namespace::Units => &mut frame.units,
        };
        if table.contains_key(name) {
            return false;
        }
        table.insert(name.to_owned(), decl);

        let kind = match ast.kind(decl) {
            NodeKind::Decl { kind, .. } => *kind,
            _ => panic!("registered a non-declaration node"),
        };
        let order = match kind {
            DeclKind::Type => {
                frame.num_types += 1;
                frame.num_types - 1
            }
            DeclKind::Var | DeclKind::Func => {
                frame.num_vars += 1;
                frame.num_vars - 1
            }
            DeclKind::Unit => {
                frame.num_units += 1;
                frame.num_units - 1
            }
        };
        if let NodeKind::Decl { order: slot, .. } = &mut ast.node_mut(decl).kind {
            *slot = order;
        }
        true
    }

    /// Look `name` up, innermost frame first.  On a hit, returns the
    /// declaration and its `(back, over)` lexical address.
    pub fn lookup(&self, ast: &Ast, ns: Namespace, name: &str) -> Option<(NodeId, u32, u32)> {
        for (back, frame) in self.frames.iter().rev().enumerate() {
            if let Some(decl) = frame.table(ns).get(name) {
                let over = match ast.kind(*decl) {
                    NodeKind::Decl { order, .. } => *order,
                    _ => 0,
                };
                return Some((*decl, back as u32, over));
            }
        }
        None
    }

    /// Duplicate the environment.  Only valid at top level; the copy is
    /// the snapshot the incremental compiler swaps in on success.
    pub fn dup_toplevel(&self) -> LexEnv {
        assert!(self.is_toplevel(), "snapshot of a nested environment");
        self.clone()
    }

    /// Visit every top-level declaration of the given kind (or all of
    /// them when `what` is `None`), in unspecified order.
    pub fn map_decls<F: FnMut(&str, NodeId)>(
        &self,
        ast: &Ast,
        what: Option<DeclKind>,
        mut f: F,
    ) {
        let top = self.frames.first().expect("no frames");
        for (name, decl) in &top.main {
            let kind = match ast.kind(*decl) {
                NodeKind::Decl { kind, .. } => *kind,
                _ => continue,
            };
            if what.map_or(true, |w| w == kind) {
                f(name, *decl);
            }
        }
        if what.map_or(true, |w| w == DeclKind::Unit) {
            for (name, decl) in &top.units {
                f(name, *decl);
            }
        }
    }

    /// Names of top-level declarations starting with `prefix`, sorted.
    /// Drives interactive completion.
    pub fn matching_decls(&self, prefix: &str) -> Vec<String> {
        let top = self.frames.first().expect("no frames");
        top.main
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .sorted()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Loc;

    fn decl(ast: &mut Ast, kind: DeclKind, name: &str) -> NodeId {
        let name = ast.add(
            NodeKind::Identifier { name: name.to_owned() },
            Loc::default(),
        );
        let initial = ast.add(NodeKind::Integer { value: 0 }, Loc::default());
        ast.add(
            NodeKind::Decl {
                kind,
                name,
                initial,
                order: 0,
                source: None,
            },
            Loc::default(),
        )
    }

    #[test]
    fn register_assigns_dense_orders_per_kind() {
        let mut ast = Ast::new();
        let mut env = LexEnv::new();
        let v0 = decl(&mut ast, DeclKind::Var, "a");
        let t0 = decl(&mut ast, DeclKind::Type, "T");
        let v1 = decl(&mut ast, DeclKind::Func, "f");
        assert!(env.register(&mut ast, Namespace::Main, "a", v0));
        assert!(env.register(&mut ast, Namespace::Main, "T", t0));
        assert!(env.register(&mut ast, Namespace::Main, "f", v1));

        // Variables and functions share one counter; types have their
        // own.
        assert_eq!(env.lookup(&ast, Namespace::Main, "a"), Some((v0, 0, 0)));
        assert_eq!(env.lookup(&ast, Namespace::Main, "T"), Some((t0, 0, 0)));
        assert_eq!(env.lookup(&ast, Namespace::Main, "f"), Some((v1, 0, 1)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut ast = Ast::new();
        let mut env = LexEnv::new();
        let d = decl(&mut ast, DeclKind::Var, "x");
        assert!(env.register(&mut ast, Namespace::Main, "x", d));
        let d2 = decl(&mut ast, DeclKind::Var, "x");
        assert!(!env.register(&mut ast, Namespace::Main, "x", d2));
    }

    #[test]
    fn lookup_reports_back_across_frames() {
        let mut ast = Ast::new();
        let mut env = LexEnv::new();
        let outer = decl(&mut ast, DeclKind::Var, "x");
        env.register(&mut ast, Namespace::Main, "x", outer);
        env.push_frame();
        let inner = decl(&mut ast, DeclKind::Var, "y");
        env.register(&mut ast, Namespace::Main, "y", inner);
        assert_eq!(env.lookup(&ast, Namespace::Main, "x"), Some((outer, 1, 0)));
        assert_eq!(env.lookup(&ast, Namespace::Main, "y"), Some((inner, 0, 0)));
        env.pop_frame();
        assert!(env.lookup(&ast, Namespace::Main, "y").is_none());
    }

    #[test]
    fn unit_namespace_is_independent() {
        let mut ast = Ast::new();
        let mut env = LexEnv::new();
        let v = decl(&mut ast, DeclKind::Var, "KB");
        let u = decl(&mut ast, DeclKind::Unit, "KB");
        assert!(env.register(&mut ast, Namespace::Main, "KB", v));
        assert!(env.register(&mut ast, Namespace::Units, "KB", u));
        assert_eq!(env.lookup(&ast, Namespace::Units, "KB"), Some((u, 0, 0)));
    }

    #[test]
    fn snapshot_rollback_drops_new_decls() {
        let mut ast = Ast::new();
        let mut env = LexEnv::new();
        let d = decl(&mut ast, DeclKind::Var, "kept");
        env.register(&mut ast, Namespace::Main, "kept", d);
        let snapshot = env.dup_toplevel();
        let d2 = decl(&mut ast, DeclKind::Var, "rolled_back");
        env.register(&mut ast, Namespace::Main, "rolled_back", d2);
        // Failure path: discard the mutated environment, keep the
        // snapshot.
        let env = snapshot;
        assert!(env.lookup(&ast, Namespace::Main, "kept").is_some());
        assert!(env.lookup(&ast, Namespace::Main, "rolled_back").is_none());
    }
}
