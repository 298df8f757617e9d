//! Logical backend interface.
//!
//! The solver consumes satisfiability checking, interpolation of
//! unsatisfiable derivation trees, and underapproximate model extraction
//! through the [`Backend`] and [`Session`] traits. A [`Session`] is a
//! scoped assertion stack: every `push` must be matched by a `pop` on all
//! exit paths, and the solver checks at its API boundaries that the scope
//! level is back to what it was on entry.
//!
//! The crate ships one implementation, [`boxes`], a deterministic
//! decision procedure for the box (interval) fragment. A backend is free
//! to answer [`Check::Unknown`]; the solver treats unknown as sat
//! (conservative) and reports it.
//!
//! [`Backend`]: trait.Backend.html (Backend trait)
//! [`Session`]: trait.Session.html (Session trait)
//! [`boxes`]: boxes/index.html (boxes module)
//! [`Check::Unknown`]: enum.Check.html#variant.Unknown (Unknown variant)

use crate::common::*;
use crate::rpfp::{Rpfp, Transformer};
use crate::term::{Term, Typ};

pub mod boxes;

pub use self::boxes::Boxes;

/// Result of a satisfiability check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    /// Satisfiable, a model is available.
    Sat,
    /// Unsatisfiable.
    Unsat,
    /// The backend could not decide.
    Unknown,
}

/// A logical backend: a factory of solver sessions plus the session-free
/// services.
pub trait Backend {
    /// Type of the sessions.
    type Session: Session;

    /// Creates a fresh session.
    fn session(&self) -> Res<Self::Session>;

    /// Entailment between two transformers over the same signature.
    ///
    /// `Ok(true)` means `lhs ⊆ rhs` is proved; an unknown from the
    /// underlying check yields `Ok(false)` (not proved).
    fn subset_eq(&self, lhs: &Transformer, rhs: &Transformer, sig: &VarMap<Typ>) -> Res<bool>;

    /// Cumulative decision count over all sessions. Used by effort-based
    /// heuristics.
    fn cumulative_decisions(&self) -> usize;
}

/// A scoped assertion stack over some RPFP graph.
///
/// Assertions snapshot the formulas they mention at assertion time; the
/// graph is passed back in for the operations that need to read or write
/// current node state (underapproximations, interpolants, model points).
pub trait Session {
    /// Pushes an assertion frame.
    fn push(&mut self) -> Res<()>;
    /// Pops `n` assertion frames.
    fn pop(&mut self, n: usize) -> Res<()>;
    /// Current scope level (number of live pushes).
    fn scope_level(&self) -> usize;

    /// Asserts the negation of a node's bound.
    fn assert_node(&mut self, rpfp: &Rpfp, node: NodIdx) -> Res<()>;

    /// Asserts an edge constraint.
    ///
    /// For a rule edge, `with_children` additionally asserts each child's
    /// current annotation as a leaf cut. A lower-bound edge asserts its
    /// parent's annotation.
    fn assert_edge(&mut self, rpfp: &Rpfp, edge: EdgIdx, with_children: bool) -> Res<()>;

    /// Asserts an extra constraint at a node's scope. Markers are global
    /// to the session.
    fn assert_constraint(&mut self, rpfp: &Rpfp, node: NodIdx, term: &Term) -> Res<()>;

    /// Satisfiability of the assertions reachable from `root`.
    ///
    /// When `under_leaves` is given, those nodes are additionally
    /// restricted to their *underapproximations*, read at check time.
    fn check(&mut self, rpfp: &Rpfp, root: NodIdx, under_leaves: Option<&[NodIdx]>) -> Res<Check>;

    /// Check and, on unsat, write one interpolant per reachable node into
    /// the nodes' annotations. The root's interpolant is additionally
    /// strengthened with its bound.
    fn solve(&mut self, rpfp: &mut Rpfp, root: NodIdx) -> Res<Check>;

    /// Interpolant for a single node of a refuted tree, written to the
    /// node's annotation.
    fn solve_single_node(&mut self, rpfp: &mut Rpfp, root: NodIdx, node: NodIdx) -> Res<()>;

    /// Weakens a node's annotation literal by literal, as long as the
    /// tree stays refuted with the node's subtree summarized by the
    /// weakened annotation.
    fn generalize(&mut self, rpfp: &mut Rpfp, root: NodIdx, node: NodIdx) -> Res<()>;

    /// Recomputes a node's interpolant from a fresh proof. Used when the
    /// first interpolant is deemed too complicated.
    fn interpolate_by_cases(&mut self, rpfp: &mut Rpfp, root: NodIdx, node: NodIdx) -> Res<()>;

    /// Computes which asserted edges are needed for the current
    /// refutation of `root`. Must be called before popping the frames
    /// involved.
    fn compute_proof_core(&mut self, rpfp: &Rpfp, root: NodIdx) -> Res<()>;

    /// True if the edge was needed in the last computed proof core.
    /// Conservatively true if no core was computed.
    fn edge_used_in_proof(&self, edge: EdgIdx) -> bool;

    /// Pins the current model values (and branch choice) of an edge's
    /// parent and active children in the current frame.
    fn fix_current_state(&mut self, rpfp: &Rpfp, edge: EdgIdx) -> Res<()>;

    /// Re-asserts a child's (updated) annotation below an edge.
    fn constrain_parent(&mut self, rpfp: &Rpfp, edge: EdgIdx, child: NodIdx) -> Res<()>;

    /// From the current model, records each used node's model point and
    /// grows its underapproximation.
    fn compute_underapprox(&mut self, rpfp: &mut Rpfp, root: NodIdx) -> Res<()>;

    /// True if the node is unused (empty) in the current model.
    fn empty(&self, rpfp: &Rpfp, node: NodIdx) -> bool;

    /// Evaluates a term (markers allowed) in the current model at a
    /// node's scope. `None` if the term does not evaluate.
    fn eval_bool(&self, rpfp: &Rpfp, node: NodIdx, term: &Term) -> Res<Option<bool>>;
}
