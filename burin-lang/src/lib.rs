//! The incremental compiler for the Burin binary-data language.
//!
//! The language describes and manipulates binary data: integral types
//! with exact bit-widths, byte- and bit-granular offsets with units,
//! struct types whose fields map against I/O spaces, and arrays with
//! optional bounds.  This crate parses source text into an AST arena,
//! runs the ordered multi-pass pipeline (transform, analyze, type,
//! promote, fold, final-analyze), and lowers the result to bytecode for
//! the [`burin_vm`] machine.
//!
//! The main entry point is [`Compiler`], the incremental facade: each
//! input compiles and executes atomically against a long-lived
//! top-level environment.

pub mod ast;
mod anal;
mod compiler;
mod diag;
pub mod env;
mod fold;
mod gen;
mod lex;
mod parse;
pub mod pass;
mod promo;
mod trans;
mod typify;

pub use ast::{Ast, BinOp, Completeness, DeclKind, Loc, NodeId, NodeKind, UnOp};
pub use compiler::{AlienTokenHandler, Compiled, Compiler, Error};
pub use diag::{Diagnostics, Severity};
pub use env::{LexEnv, Namespace};
pub use gen::{CompileMode, Gen};
pub use parse::{parse, parse_file, ParseKind};
pub use pass::{Flow, PassCtx, Phase};
