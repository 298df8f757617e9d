//! Duality is a solver for relational post-fixedpoint problems (RPFPs):
//! predicate graphs connected by Horn-clause-like transformers. Given a
//! (possibly cyclic) graph, it either annotates every node with an
//! inductive invariant implying its safety bound, or refutes it with a
//! finite counterexample derivation tree.
//!
//! The search is an unbounded-unwinding, lazy-abstraction-with-
//! interpolants procedure: covering, conjecture-based forced covering,
//! stratified inlining, underapproximation-guided candidate selection,
//! depth-first backtracking search with interpolation, and bounded
//! recursion. See the [`solver`] module.
//!
//! The logical backend (satisfiability, interpolation, model
//! extraction) is consumed through the [`backend`] traits; the crate
//! ships [`backend::Boxes`], a self-contained decision procedure for
//! the interval fragment.
//!
//! [`solver`]: solver/index.html (solver module)
//! [`backend`]: backend/index.html (backend module)
//! [`backend::Boxes`]: backend/struct.Boxes.html (Boxes struct)

#![allow(non_upper_case_globals)]

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate lazy_static;

pub mod errors;
#[macro_use]
pub mod common;
pub mod term;

pub mod rpfp;

pub mod backend;
pub mod solver;

pub use crate::backend::{Backend, Boxes, Check, Session};
pub use crate::common::SolveConf;
pub use crate::rpfp::{App, Branch, Fml, Rpfp, Transformer};
pub use crate::solver::reporter::{NullReporter, Reporter, StreamReporter};
pub use crate::solver::{Candidate, Counterexample, Duality};
