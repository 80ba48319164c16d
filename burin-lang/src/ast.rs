//! The abstract syntax tree.
//!
//! Nodes live in an arena owned by [`Ast`] and are addressed by
//! [`NodeId`].  Every node carries a uniform header — kind, source
//! location, type slot, `next` sibling link — plus kind-specific
//! payload.  Sibling chains (`next`) build argument lists, field lists
//! and statement sequences; iteration helpers walk them without
//! borrowing trouble.

use burin_vm::Endian;

/// Index of a node in the AST arena.  `NodeId(0)` is never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize - 1
    }
}

/// A source location: first/last line and column, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loc {
    /// Line of the first character.
    pub first_line: u32,
    /// Column of the first character.
    pub first_column: u32,
    /// Line of the last character.
    pub last_line: u32,
    /// Column of the last character.
    pub last_column: u32,
}

impl Loc {
    /// Span covering both locations.
    pub fn to(self, other: Loc) -> Loc {
        Loc {
            first_line: self.first_line,
            first_column: self.first_column,
            last_line: other.last_line,
            last_column: other.last_column,
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    CeilDiv,
    Mod,
    Pow,
    Sl,
    Sr,
    IOr,
    Xor,
    BAnd,
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    BConc,
    In,
}

impl BinOp {
    /// Whether the operator yields a boolean (`int<32>`) result.
    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::In
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnOp {
    Pos,
    Neg,
    Not,
    BNot,
}

/// Declaration kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeclKind {
    /// A variable.
    Var,
    /// A function.
    Func,
    /// A type.
    Type,
    /// An offset-unit alias.
    Unit,
}

/// The three loop flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// `while (cond) body`
    While,
    /// `for (count) body`
    Times,
    /// `for (var v in container) body`
    In,
}

/// Completeness of a type: whether its size is known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// Size computable at compile time.
    Complete,
    /// Size only known at run time (strings, unbounded arrays).
    Incomplete,
    /// Not yet determined; forbidden after the typing phases.
    Unknown,
}

/// Node payloads.  Chained lists are linked through the node header's
/// `next` field; the chain head is stored here.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// An identifier terminal.
    Identifier {
        /// The spelling.
        name: String,
    },
    /// An integer literal.  Width and signedness live in the type slot.
    Integer {
        /// The raw 64-bit payload.
        value: u64,
    },
    /// A string literal.
    Str {
        /// The unescaped payload.
        value: String,
    },
    /// An offset expression or literal: `magnitude # unit`.
    Offset {
        /// Magnitude expression.
        magnitude: NodeId,
        /// Unit: an `Integer` node (bits) after the transforms; may be
        /// an `Identifier` (declared unit) or a `TypeInt` before.
        unit: NodeId,
    },
    /// The null literal.
    Null,

    /// A binary operation.
    Binop {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: NodeId,
        /// Right operand.
        rhs: NodeId,
    },
    /// A unary operation.
    Unop {
        /// Operator.
        op: UnOp,
        /// Operand.
        operand: NodeId,
    },
    /// `expr as type`.
    Cast {
        /// Target type node.
        target: NodeId,
        /// Source expression.
        expr: NodeId,
    },
    /// `cond ? then : otherwise`.
    Cond {
        /// Condition.
        cond: NodeId,
        /// Value when non-zero.
        then_e: NodeId,
        /// Value when zero.
        else_e: NodeId,
    },
    /// `agg[index]`.
    Indexer {
        /// Array or string.
        agg: NodeId,
        /// Index expression.
        index: NodeId,
    },
    /// `agg[lo:hi]`.
    Trimmer {
        /// Array or string.
        agg: NodeId,
        /// Low bound.
        lo: NodeId,
        /// High bound (exclusive).
        hi: NodeId,
    },
    /// `sct.field`.
    StructRef {
        /// Struct expression.
        sct: NodeId,
        /// Field identifier.
        field: NodeId,
    },
    /// An array literal `[1, 2, 3]` or `[.[2] = 1]`.
    ArrayLit {
        /// Chain of `ArrayInit` elements.
        elems: Option<NodeId>,
        /// Number of elements in the chain.
        nelems: u32,
    },
    /// One element of an array literal.
    ArrayInit {
        /// Index expression; filled with a running counter when the
        /// source omits it.
        index: Option<NodeId>,
        /// Element value.
        value: NodeId,
    },
    /// A struct constructor `Type { a = 1, b = 2 }`.
    StructLit {
        /// The struct type (resolved from the constructor name).
        stype: NodeId,
        /// Chain of `StructLitField`.
        fields: Option<NodeId>,
    },
    /// One element of a struct constructor.
    StructLitField {
        /// Field name identifier; none for positional elements.
        name: Option<NodeId>,
        /// Field value.
        value: NodeId,
    },
    /// A function call.
    Funcall {
        /// Callee expression.
        callee: NodeId,
        /// Chain of `FuncallArg`.
        args: Option<NodeId>,
        /// Number of actual arguments after transformation.
        nargs: u32,
    },
    /// One actual argument.
    FuncallArg {
        /// Argument name for named style; none for positional.
        name: Option<NodeId>,
        /// Argument value; none for omitted-by-name holes.
        value: Option<NodeId>,
    },
    /// The map operator `type @ offset` or `type @ ios : offset`.
    Map {
        /// Type to map.
        map_type: NodeId,
        /// I/O space expression, defaulting to the current space.
        ios: Option<NodeId>,
        /// Offset expression.
        offset: NodeId,
    },
    /// A resolved variable reference.
    Var {
        /// The spelling.
        name: String,
        /// Frames to traverse.
        back: u32,
        /// Index within the frame.
        over: u32,
        /// The declaration this reference resolved to.
        decl: NodeId,
    },
    /// A function literal.
    Func {
        /// Return type node; none for void functions.
        rtype: Option<NodeId>,
        /// Chain of `FuncArg` formals.
        args: Option<NodeId>,
        /// Number of formals.
        nargs: u32,
        /// Body compound statement.
        body: NodeId,
        /// Whether this is a struct method.
        method: bool,
    },
    /// One formal argument.
    FuncArg {
        /// Name identifier.
        name: NodeId,
        /// Declared type.
        atype: NodeId,
        /// Default initializer for optional formals.
        initial: Option<NodeId>,
        /// Whether this formal absorbs the remaining actuals.
        vararg: bool,
    },

    /// An assignment statement.
    Assign {
        /// L-value form.
        lvalue: NodeId,
        /// Assigned expression.
        exp: NodeId,
    },
    /// An expression statement.
    ExpStmt {
        /// The expression.
        exp: NodeId,
    },
    /// A compound statement; opens a lexical frame.
    CompStmt {
        /// Chain of statements and declarations.
        stmts: Option<NodeId>,
        /// Number of variable declarations, the frame hint.
        numvars: u32,
    },
    /// An if (else) statement.
    If {
        /// Condition.
        cond: NodeId,
        /// Then branch.
        then_s: NodeId,
        /// Else branch.
        else_s: Option<NodeId>,
    },
    /// The loop statement.
    Loop {
        /// Flavor.
        kind: LoopKind,
        /// Condition (`While`) or count (`Times`) or container (`In`).
        head: NodeId,
        /// Iteration variable declaration for `In`.
        var: Option<NodeId>,
        /// Body.
        body: NodeId,
    },
    /// A return statement.
    Return {
        /// Returned expression, when present.
        exp: Option<NodeId>,
        /// Enclosing function, filled during parsing.
        function: Option<NodeId>,
        /// Lexical frames opened between the function body and this
        /// statement.
        nframes: u32,
    },
    /// A break statement.
    Break {
        /// Enclosing loop, filled during parsing.
        entity: Option<NodeId>,
        /// Lexical frames opened between the loop body and this
        /// statement.
        nframes: u32,
    },
    /// A print statement.
    Print {
        /// Printed expression.
        exp: NodeId,
    },

    /// A declaration.
    Decl {
        /// Kind.
        kind: DeclKind,
        /// Name identifier.
        name: NodeId,
        /// Initial value: expression, function literal, type node or
        /// unit expression depending on the kind.
        initial: NodeId,
        /// Dense index within the owning frame's namespace kind.
        order: u32,
        /// Tag of the source file the declaration came from.
        source: Option<String>,
    },

    /// An integral type.
    TypeInt {
        /// Size in bits.
        size: u16,
        /// Signedness.
        signed: bool,
    },
    /// The string type.
    TypeStr,
    /// The `any` type.
    TypeAny,
    /// The void pseudo-type for functions without a return value.
    TypeVoid,
    /// An array type.
    TypeArray {
        /// Element type.
        etype: NodeId,
        /// Bound expression: an element count or a byte-size offset.
        bound: Option<NodeId>,
    },
    /// A struct type.
    TypeStruct {
        /// Chain of `StructTypeField` and nested `Decl` nodes.
        elems: Option<NodeId>,
        /// Number of fields in the chain.
        nfields: u32,
        /// Whether the type is a union.
        union: bool,
        /// Whether fields are pinned at offset zero.
        pinned: bool,
        /// Representative integral type of an integral struct.
        itype: Option<NodeId>,
        /// Name, filled when declared via `type Name = struct …`.
        name: Option<String>,
    },
    /// One field of a struct type.
    StructTypeField {
        /// Field name identifier; none for anonymous fields.
        name: Option<NodeId>,
        /// Field type.
        ftype: NodeId,
        /// Endianness qualifier, only on integral fields.
        endian: Option<Endian>,
        /// Constraint expression checked when mapping.
        constraint: Option<NodeId>,
        /// Presence condition of optional fields.
        optcond: Option<NodeId>,
        /// Default initializer.
        initial: Option<NodeId>,
        /// Label expression, when the field is placed explicitly.
        label: Option<NodeId>,
    },
    /// A function type.
    TypeFun {
        /// Chain of `FuncArg` formal specifications.
        args: Option<NodeId>,
        /// Number of formals.
        nargs: u32,
        /// Return type, `TypeVoid` for none.
        rtype: NodeId,
    },
    /// An offset type.
    TypeOffset {
        /// Base integral type.
        base: NodeId,
        /// Unit: an `Integer` node in bits after the transforms.
        unit: NodeId,
    },

    /// The program root: a chain of declarations and statements.
    Program {
        /// Chain head.
        elems: Option<NodeId>,
    },
}

/// One AST node: the uniform header plus the payload.
#[derive(Debug, Clone)]
pub struct Node {
    /// Payload.
    pub kind: NodeKind,
    /// Source span.
    pub loc: Loc,
    /// Type annotation, filled by the typing phase.  Refers to a type
    /// node in the same arena.
    pub type_slot: Option<NodeId>,
    /// Next sibling in a chain.
    pub next: Option<NodeId>,
    /// Set once a type node has been fully processed by a pass, so
    /// later passes skip the subtree.
    pub compiled: bool,
}

/// The AST arena.
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    /// An empty arena.
    pub fn new() -> Ast {
        Ast::default()
    }

    /// Allocate a node.
    pub fn add(&mut self, kind: NodeKind, loc: Loc) -> NodeId {
        self.nodes.push(Node {
            kind,
            loc,
            type_slot: None,
            next: None,
            compiled: false,
        });
        NodeId(self.nodes.len() as u32)
    }

    /// Access a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Mutable access to a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// The payload of a node.
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    /// The location of a node.
    pub fn loc(&self, id: NodeId) -> Loc {
        self.node(id).loc
    }

    /// The type annotation of a node.
    pub fn type_of(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).type_slot
    }

    /// Set the type annotation of a node.
    pub fn set_type(&mut self, id: NodeId, typ: NodeId) {
        self.node_mut(id).type_slot = Some(typ);
    }

    /// Link `next` after `prev` in a sibling chain.
    pub fn set_next(&mut self, prev: NodeId, next: Option<NodeId>) {
        self.node_mut(prev).next = next;
    }

    /// The sibling following a node.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).next
    }

    /// Iterate a sibling chain starting at `head`.
    pub fn chain(&self, head: Option<NodeId>) -> ChainIter<'_> {
        ChainIter { ast: self, cur: head }
    }

    /// Collect a sibling chain into a vector, for walks that mutate the
    /// arena while iterating.
    pub fn chain_vec(&self, head: Option<NodeId>) -> Vec<NodeId> {
        self.chain(head).collect()
    }

    /// The number of nodes allocated.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no nodes were allocated.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The spelling of an `Identifier` node.
    pub fn ident_name(&self, id: NodeId) -> &str {
        match self.kind(id) {
            NodeKind::Identifier { name } => name,
            _ => panic!("expected an identifier node"),
        }
    }

    /// The value of an `Integer` node, when it is one.
    pub fn integer_value(&self, id: NodeId) -> Option<u64> {
        match self.kind(id) {
            NodeKind::Integer { value } => Some(*value),
            _ => None,
        }
    }

    /// Replace the payload of a node in place, keeping its identity.
    /// Used by the transform phases; the caller signals a restart so
    /// earlier phases re-see the rewritten node.
    pub fn replace(&mut self, id: NodeId, kind: NodeKind) {
        let node = self.node_mut(id);
        node.kind = kind;
        node.type_slot = None;
    }

    /// Width and signedness of an integral type node.
    pub fn int_type(&self, typ: NodeId) -> Option<(u16, bool)> {
        match self.kind(typ) {
            NodeKind::TypeInt { size, signed } => Some((*size, *signed)),
            _ => None,
        }
    }

    /// Whether a node is a type node.
    pub fn is_type(&self, id: NodeId) -> bool {
        matches!(
            self.kind(id),
            NodeKind::TypeInt { .. }
                | NodeKind::TypeStr
                | NodeKind::TypeAny
                | NodeKind::TypeVoid
                | NodeKind::TypeArray { .. }
                | NodeKind::TypeStruct { .. }
                | NodeKind::TypeFun { .. }
                | NodeKind::TypeOffset { .. }
        )
    }

    /// Structural type equality.  Array bounds do not participate;
    /// struct types compare nominally by name when both are named.
    pub fn type_equal(&self, a: NodeId, b: NodeId) -> bool {
        use NodeKind::*;
        match (self.kind(a), self.kind(b)) {
            (TypeInt { size: s1, signed: g1 }, TypeInt { size: s2, signed: g2 }) => {
                s1 == s2 && g1 == g2
            }
            (TypeStr, TypeStr) | (TypeAny, TypeAny) | (TypeVoid, TypeVoid) => true,
            (TypeArray { etype: e1, .. }, TypeArray { etype: e2, .. }) => self.type_equal(*e1, *e2),
            (TypeOffset { base: b1, unit: u1 }, TypeOffset { base: b2, unit: u2 }) => {
                self.type_equal(*b1, *b2)
                    && match (self.integer_value(*u1), self.integer_value(*u2)) {
                        (Some(x), Some(y)) => x == y,
                        _ => false,
                    }
            }
            (TypeStruct { name: n1, .. }, TypeStruct { name: n2, .. }) => match (n1, n2) {
                (Some(n1), Some(n2)) => n1 == n2,
                _ => a == b,
            },
            (
                TypeFun { args: a1, rtype: r1, nargs: n1 },
                TypeFun { args: a2, rtype: r2, nargs: n2 },
            ) => {
                n1 == n2
                    && self.type_equal(*r1, *r2)
                    && self
                        .chain(*a1)
                        .zip(self.chain(*a2))
                        .all(|(x, y)| match (self.kind(x), self.kind(y)) {
                            (
                                FuncArg { atype: t1, .. },
                                FuncArg { atype: t2, .. },
                            ) => self.type_equal(*t1, *t2),
                            _ => false,
                        })
            }
            _ => false,
        }
    }

    /// Whether an integral type is promotable to another: the target
    /// must be at least as wide, and a signedness change is only
    /// allowed from unsigned to signed.
    pub fn int_promotable(&self, from: NodeId, to: NodeId) -> bool {
        match (self.int_type(from), self.int_type(to)) {
            (Some((s1, g1)), Some((s2, g2))) => s2 >= s1 && (g1 == g2 || (!g1 && g2)),
            _ => false,
        }
    }

    /// Completeness of a type node.
    pub fn completeness(&self, typ: NodeId) -> Completeness {
        use NodeKind::*;
        match self.kind(typ) {
            TypeInt { .. } | TypeOffset { .. } | TypeVoid => Completeness::Complete,
            TypeStr | TypeAny | TypeFun { .. } => Completeness::Incomplete,
            TypeArray { etype, bound } => {
                if bound.is_none() {
                    return Completeness::Incomplete;
                }
                self.completeness(*etype)
            }
            TypeStruct { elems, .. } => {
                let mut res = Completeness::Complete;
                for elem in self.chain(*elems) {
                    if let StructTypeField { ftype, optcond, label, .. } = self.kind(elem) {
                        if optcond.is_some() || label.is_some() {
                            res = Completeness::Incomplete;
                            break;
                        }
                        match self.completeness(*ftype) {
                            Completeness::Complete => {}
                            other => {
                                res = other;
                                break;
                            }
                        }
                    }
                }
                res
            }
            _ => Completeness::Unknown,
        }
    }

    /// Deep-copy the subtree rooted at a node, chains included.  The
    /// copy has fresh identities and cleared annotations.
    pub fn deep_copy(&mut self, id: NodeId) -> NodeId {
        let node = self.node(id).clone();
        let mut kind = node.kind;
        self.copy_children(&mut kind);
        let new_id = self.add(kind, node.loc);
        self.node_mut(new_id).type_slot = node.type_slot;
        new_id
    }

    fn copy_chain(&mut self, head: Option<NodeId>) -> Option<NodeId> {
        let items = self.chain_vec(head);
        let mut new_head = None;
        let mut prev: Option<NodeId> = None;
        for item in items {
            let copied = self.deep_copy(item);
            match prev {
                None => new_head = Some(copied),
                Some(p) => self.set_next(p, Some(copied)),
            }
            prev = Some(copied);
        }
        new_head
    }

    fn copy_children(&mut self, kind: &mut NodeKind) {
        use NodeKind::*;
        macro_rules! cp {
            ($($field:expr),*) => { $( *$field = self.deep_copy(*$field); )* };
        }
        macro_rules! cp_opt {
            ($($field:expr),*) => {
                $( if let Some(child) = $field { *child = self.deep_copy(*child); } )*
            };
        }
        macro_rules! cp_chain {
            ($($field:expr),*) => { $( *$field = self.copy_chain(*$field); )* };
        }
        match kind {
            Identifier { .. } | Integer { .. } | Str { .. } | Null | TypeInt { .. } | TypeStr
            | TypeAny | TypeVoid | Var { .. } => {}
            Offset { magnitude, unit } => { cp!(magnitude, unit); }
            Binop { lhs, rhs, .. } => { cp!(lhs, rhs); }
            Unop { operand, .. } => { cp!(operand); }
            Cast { target, expr } => { cp!(target, expr); }
            Cond { cond, then_e, else_e } => { cp!(cond, then_e, else_e); }
            Indexer { agg, index } => { cp!(agg, index); }
            Trimmer { agg, lo, hi } => { cp!(agg, lo, hi); }
            StructRef { sct, field } => { cp!(sct, field); }
            ArrayLit { elems, .. } => { cp_chain!(elems); }
            ArrayInit { index, value } => {
                cp_opt!(index);
                cp!(value);
            }
            StructLit { stype, fields } => {
                cp!(stype);
                cp_chain!(fields);
            }
            StructLitField { name, value } => {
                cp_opt!(name);
                cp!(value);
            }
            Funcall { callee, args, .. } => {
                cp!(callee);
                cp_chain!(args);
            }
            FuncallArg { name, value } => { cp_opt!(name, value); }
            Map { map_type, ios, offset } => {
                cp!(map_type, offset);
                cp_opt!(ios);
            }
            Func { rtype, args, body, .. } => {
                cp_opt!(rtype);
                cp_chain!(args);
                cp!(body);
            }
            FuncArg { name, atype, initial, .. } => {
                cp!(name, atype);
                cp_opt!(initial);
            }
            Assign { lvalue, exp } => { cp!(lvalue, exp); }
            ExpStmt { exp } | Print { exp } => { cp!(exp); }
            CompStmt { stmts, .. } => { cp_chain!(stmts); }
            If { cond, then_s, else_s } => {
                cp!(cond, then_s);
                cp_opt!(else_s);
            }
            Loop { head, var, body, .. } => {
                cp!(head, body);
                cp_opt!(var);
            }
            Return { exp, .. } => { cp_opt!(exp); }
            Break { .. } => {}
            Decl { name, initial, .. } => { cp!(name, initial); }
            TypeArray { etype, bound } => {
                cp!(etype);
                cp_opt!(bound);
            }
            TypeStruct { elems, itype, .. } => {
                cp_chain!(elems);
                cp_opt!(itype);
            }
            StructTypeField { name, ftype, constraint, optcond, initial, label, .. } => {
                cp_opt!(name, constraint, optcond, initial, label);
                cp!(ftype);
            }
            TypeFun { args, rtype, .. } => {
                cp_chain!(args);
                cp!(rtype);
            }
            TypeOffset { base, unit } => { cp!(base, unit); }
            Program { elems } => { cp_chain!(elems); }
        }
    }
}

/// Iterator over a sibling chain.
pub struct ChainIter<'a> {
    ast: &'a Ast,
    cur: Option<NodeId>,
}

impl Iterator for ChainIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.cur?;
        self.cur = self.ast.next(cur);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_lit(ast: &mut Ast, v: u64) -> NodeId {
        ast.add(NodeKind::Integer { value: v }, Loc::default())
    }

    #[test]
    fn chains_link_and_iterate() {
        let mut ast = Ast::new();
        let a = int_lit(&mut ast, 1);
        let b = int_lit(&mut ast, 2);
        let c = int_lit(&mut ast, 3);
        ast.set_next(a, Some(b));
        ast.set_next(b, Some(c));
        let values: Vec<u64> = ast
            .chain(Some(a))
            .map(|n| ast.integer_value(n).unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn array_bounds_do_not_affect_type_equality() {
        let mut ast = Ast::new();
        let e = ast.add(NodeKind::TypeInt { size: 8, signed: false }, Loc::default());
        let bound = int_lit(&mut ast, 3);
        let t1 = ast.add(
            NodeKind::TypeArray { etype: e, bound: Some(bound) },
            Loc::default(),
        );
        let t2 = ast.add(NodeKind::TypeArray { etype: e, bound: None }, Loc::default());
        assert!(ast.type_equal(t1, t2));
    }

    #[test]
    fn promotability_is_widening_and_sign_safe() {
        let mut ast = Ast::new();
        let i16 = ast.add(NodeKind::TypeInt { size: 16, signed: true }, Loc::default());
        let i32t = ast.add(NodeKind::TypeInt { size: 32, signed: true }, Loc::default());
        let u16 = ast.add(NodeKind::TypeInt { size: 16, signed: false }, Loc::default());
        assert!(ast.int_promotable(i16, i32t));
        assert!(!ast.int_promotable(i32t, i16));
        assert!(ast.int_promotable(u16, i32t));
        assert!(!ast.int_promotable(i16, u16));
    }

    #[test]
    fn deep_copy_is_fresh() {
        let mut ast = Ast::new();
        let lhs = int_lit(&mut ast, 1);
        let rhs = int_lit(&mut ast, 2);
        let add = ast.add(NodeKind::Binop { op: BinOp::Add, lhs, rhs }, Loc::default());
        let copy = ast.deep_copy(add);
        assert_ne!(add, copy);
        let NodeKind::Binop { lhs: l2, rhs: r2, .. } = *ast.kind(copy) else {
            panic!("expected binop copy");
        };
        assert_ne!(l2, lhs);
        assert_eq!(ast.integer_value(l2), Some(1));
        assert_eq!(ast.integer_value(r2), Some(2));
    }

    #[test]
    fn struct_completeness() {
        let mut ast = Ast::new();
        let u8t = ast.add(NodeKind::TypeInt { size: 8, signed: false }, Loc::default());
        let f = ast.add(
            NodeKind::StructTypeField {
                name: None,
                ftype: u8t,
                endian: None,
                constraint: None,
                optcond: None,
                initial: None,
                label: None,
            },
            Loc::default(),
        );
        let sct = ast.add(
            NodeKind::TypeStruct {
                elems: Some(f),
                nfields: 1,
                union: false,
                pinned: false,
                itype: None,
                name: None,
            },
            Loc::default(),
        );
        assert_eq!(ast.completeness(sct), Completeness::Complete);
        let strt = ast.add(NodeKind::TypeStr, Loc::default());
        assert_eq!(ast.completeness(strt), Completeness::Incomplete);
    }
}
