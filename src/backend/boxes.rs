//! Reference backend: interval boxes with boolean splitting.
//!
//! A deterministic decision procedure for the *box fragment*: per-variable
//! integer intervals and booleans, constraint propagation over affine
//! atoms, and depth-first splitting over disjunctions, rule branches,
//! boolean variables and markers.
//!
//! Soundness is one-sided in each direction:
//!
//! - unsat answers come from box emptiness, which overapproximates, so
//!   they are genuine;
//! - sat answers are only produced from concretely verified models;
//! - everything else is [`Check::Unknown`], which the solver treats as
//!   sat.
//!
//! Interpolants are conjunctions of interval literals, the bottom-up box
//! at each tree node, then generalized literal by literal. The proof core
//! is computed by re-checking with single expansions summarized by their
//! parent's current annotation.
//!
//! [`Check::Unknown`]: ../enum.Check.html#variant.Unknown
//! (Unknown variant)

use std::cell::Cell;
use std::rc::Rc;

use num::{Integer, Signed, Zero};

use crate::backend::{Backend, Check, Session};
use crate::common::*;
use crate::rpfp::{Rpfp, Trans, Transformer};
use crate::term::{self, Op, RTerm, Term, Typ, Val};

/// Propagation step budget for one check.
const STEP_BUDGET: usize = 200_000;
/// Fixpoint rounds over the recorded affine constraints.
const PROP_ROUNDS: usize = 30;

/// Shared counters.
struct Counters {
    /// Number of satisfiability checks.
    checks: Cell<usize>,
    /// Number of search decisions (splits).
    decisions: Cell<usize>,
}

/// The box backend.
pub struct Boxes {
    counters: Rc<Counters>,
}
impl Boxes {
    /// Constructor.
    pub fn new() -> Self {
        Boxes {
            counters: Rc::new(Counters {
                checks: Cell::new(0),
                decisions: Cell::new(0),
            }),
        }
    }

    /// Number of satisfiability checks performed so far.
    pub fn check_count(&self) -> usize {
        self.counters.checks.get()
    }
}
impl Default for Boxes {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for Boxes {
    type Session = BoxSession;

    fn session(&self) -> Res<BoxSession> {
        Ok(BoxSession {
            frames: vec![Vec::new()],
            counters: self.counters.clone(),
            model: None,
            core: None,
        })
    }

    fn subset_eq(&self, lhs: &Transformer, rhs: &Transformer, sig: &VarMap<Typ>) -> Res<bool> {
        let query = term::and(vec![lhs.term().clone(), term::not(rhs.term().clone())]);
        if query.is_false() {
            return Ok(true);
        }
        let mut prob = Problem::new(NodIdx::zero());
        prob.info(NodIdx::zero(), sig).cuts.push(query);
        self.counters.checks.set(self.counters.checks.get() + 1);
        match run_search(&prob, &self.counters)? {
            Outcome::Unsat => Ok(true),
            _ => Ok(false),
        }
    }

    fn cumulative_decisions(&self) -> usize {
        self.counters.decisions.get()
    }
}

/// An interval over the integers. `None` bounds are infinite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ival {
    /// Lower bound.
    lo: Option<Int>,
    /// Upper bound.
    hi: Option<Int>,
}
impl Ival {
    /// The full interval.
    fn full() -> Self {
        Ival { lo: None, hi: None }
    }
    /// Singleton interval.
    fn singleton(i: Int) -> Self {
        Ival {
            lo: Some(i.clone()),
            hi: Some(i),
        }
    }
    /// True if the interval is empty.
    fn is_empty(&self) -> bool {
        match (&self.lo, &self.hi) {
            (Some(lo), Some(hi)) => lo > hi,
            _ => false,
        }
    }
    /// True if the interval is a singleton.
    fn is_singleton(&self) -> bool {
        match (&self.lo, &self.hi) {
            (Some(lo), Some(hi)) => lo == hi,
            _ => false,
        }
    }
    /// True if the interval contains a value.
    fn contains(&self, val: &Int) -> bool {
        if let Some(lo) = &self.lo {
            if val < lo {
                return false;
            }
        }
        if let Some(hi) = &self.hi {
            if val > hi {
                return false;
            }
        }
        true
    }
    /// Raises the lower bound. True if the interval changed.
    fn raise_lo(&mut self, val: Int) -> bool {
        match &self.lo {
            Some(lo) if *lo >= val => false,
            _ => {
                self.lo = Some(val);
                true
            }
        }
    }
    /// Lowers the upper bound. True if the interval changed.
    fn lower_hi(&mut self, val: Int) -> bool {
        match &self.hi {
            Some(hi) if *hi <= val => false,
            _ => {
                self.hi = Some(val);
                true
            }
        }
    }
    /// Hull (union) with another interval.
    fn hull(&mut self, other: &Ival) {
        self.lo = match (&self.lo, &other.lo) {
            (Some(l), Some(r)) => Some(std::cmp::min(l, r).clone()),
            _ => None,
        };
        self.hi = match (&self.hi, &other.hi) {
            (Some(l), Some(r)) => Some(std::cmp::max(l, r).clone()),
            _ => None,
        };
    }
}

/// A variable domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dom {
    /// Integer interval.
    Int(Ival),
    /// Boolean, `None` when undecided.
    Bool(Option<bool>),
}
impl Dom {
    /// Full domain of a type.
    fn full(typ: Typ) -> Self {
        match typ {
            Typ::Int => Dom::Int(Ival::full()),
            Typ::Bool => Dom::Bool(None),
        }
    }
    /// True if the domain is empty.
    fn is_empty(&self) -> bool {
        match *self {
            Dom::Int(ref iv) => iv.is_empty(),
            Dom::Bool(_) => false,
        }
    }
    /// Hull (union) with another domain.
    fn hull(&mut self, other: &Dom) {
        match (self, other) {
            (Dom::Int(lft), Dom::Int(rgt)) => lft.hull(rgt),
            (Dom::Bool(lft), Dom::Bool(rgt)) => {
                if *lft != *rgt {
                    *lft = None
                }
            }
            _ => (),
        }
    }
}

/// A variable key in the global search space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum VKey {
    /// Parameter of a node.
    N(NodIdx, VarIdx),
    /// Local variable of an edge's rule.
    E(EdgIdx, VarIdx),
    /// A marker.
    M(i64),
}

/// Variable scope of a term: node parameters, or an edge's rule
/// variables (whose prefix aliases the parent's parameters).
#[derive(Clone, Copy, Debug)]
struct Scope {
    /// The node whose parameters the first variables denote.
    node: NodIdx,
    /// Edge providing the local variables, with the parameter count.
    edge: Option<(EdgIdx, usize)>,
}
impl Scope {
    /// Node scope.
    fn node(node: NodIdx) -> Self {
        Scope { node, edge: None }
    }
    /// Edge scope.
    fn edge(node: NodIdx, edge: EdgIdx, psig: usize) -> Self {
        Scope {
            node,
            edge: Some((edge, psig)),
        }
    }
    /// Key of a variable in this scope.
    fn key(&self, var: VarIdx) -> VKey {
        match self.edge {
            Some((edge, psig)) if var.get() >= psig => VKey::E(edge, var),
            _ => VKey::N(self.node, var),
        }
    }
}

/// A snapshot of a rule branch, child positions resolved to nodes.
#[derive(Clone, Debug)]
struct BranchSnap {
    /// Guard.
    grd: Term,
    /// Applications: child node, child signature, argument terms.
    apps: Vec<(NodIdx, VarMap<Typ>, VarMap<Term>)>,
}

/// An assertion. Formulas are snapshots taken at assertion time.
#[derive(Clone, Debug)]
enum Assertion {
    /// Negated bound of a node (the bound is stored positively).
    NegBound {
        node: NodIdx,
        sig: VarMap<Typ>,
        bound: Term,
    },
    /// A constraint over a node's parameters.
    Cut {
        node: NodIdx,
        sig: VarMap<Typ>,
        term: Term,
    },
    /// An edge constraint.
    Edge {
        edge: EdgIdx,
        parent: NodIdx,
        psig: VarMap<Typ>,
        vars: VarMap<Typ>,
        branches: Vec<BranchSnap>,
    },
    /// Model values pinned on a node, with an optional branch choice.
    Pin {
        node: NodIdx,
        vals: VarMap<Val>,
        branch: Option<usize>,
    },
}

/// Per-node problem information.
#[derive(Clone, Debug, Default)]
struct NodeInfo {
    /// Signature.
    sig: VarMap<Typ>,
    /// Constraints over the parameters.
    cuts: Vec<Term>,
    /// Bounds asserted negatively (stored positively).
    negs: Vec<Term>,
    /// Pinned values.
    pins: Vec<(VarMap<Val>, Option<usize>)>,
    /// Expansion edge, if any.
    edge: Option<EdgIdx>,
}
impl NodeInfo {
    fn new(sig: &VarMap<Typ>) -> Self {
        NodeInfo {
            sig: sig.clone(),
            cuts: Vec::new(),
            negs: Vec::new(),
            pins: Vec::new(),
            edge: None,
        }
    }
}

/// Per-edge problem information.
#[derive(Clone, Debug)]
struct EdgeInfo {
    /// Parent node.
    parent: NodIdx,
    /// Parameter count of the parent.
    psig: usize,
    /// Typed rule variables.
    vars: VarMap<Typ>,
    /// Branches.
    branches: Vec<BranchSnap>,
}

/// A constraint problem extracted from the live assertions.
#[derive(Clone, Debug)]
struct Problem {
    nodes: NodHMap<NodeInfo>,
    edges: EdgHMap<EdgeInfo>,
    root: NodIdx,
}
impl Problem {
    fn new(root: NodIdx) -> Self {
        Problem {
            nodes: NodHMap::new(),
            edges: EdgHMap::new(),
            root,
        }
    }

    /// Node info, created on first access.
    fn info(&mut self, node: NodIdx, sig: &VarMap<Typ>) -> &mut NodeInfo {
        self.nodes.entry(node).or_insert_with(|| NodeInfo::new(sig))
    }

    /// Type of a key.
    fn typ(&self, key: VKey) -> Typ {
        match key {
            VKey::N(node, var) => self
                .nodes
                .get(&node)
                .map(|info| info.sig[var])
                .unwrap_or(Typ::Int),
            VKey::E(edge, var) => self
                .edges
                .get(&edge)
                .map(|info| info.vars[var])
                .unwrap_or(Typ::Int),
            VKey::M(_) => Typ::Bool,
        }
    }
}

/// A model produced by a successful check.
#[derive(Clone, Debug)]
pub(crate) struct Model {
    /// Values of the active nodes.
    vals: NodHMap<VarMap<Val>>,
    /// Values of edge-local variables.
    evals: HashMap<(EdgIdx, VarIdx), Val>,
    /// Marker assignment.
    marks: HashMap<i64, bool>,
    /// Chosen branch per expanded active node.
    branches: NodHMap<usize>,
}

/// Outcome of a search.
enum Outcome {
    Sat(Model),
    Unsat,
    Unknown,
}

/// Session over the box backend.
pub struct BoxSession {
    /// Assertion frames. The first frame is the base level.
    frames: Vec<Vec<Assertion>>,
    /// Shared counters.
    counters: Rc<Counters>,
    /// Model of the last sat check.
    model: Option<Model>,
    /// Edges used in the last computed proof core.
    core: Option<EdgSet>,
}
impl BoxSession {
    /// Current frame.
    fn frame(&mut self) -> &mut Vec<Assertion> {
        self.frames.last_mut().expect("session has no base frame")
    }

    /// Builds the constraint problem from the live assertions.
    ///
    /// `replace` summarizes a node: its expansion is dropped and its cuts
    /// are replaced by the given formula. `extra` conjoins additional
    /// cuts.
    fn problem(
        &self,
        root: NodIdx,
        replace: &NodHMap<Term>,
        extra: &NodHMap<Term>,
    ) -> Res<Problem> {
        let mut prob = Problem::new(root);
        for frame in &self.frames {
            for assertion in frame {
                match *assertion {
                    Assertion::NegBound {
                        node,
                        ref sig,
                        ref bound,
                    } => prob.info(node, sig).negs.push(bound.clone()),
                    Assertion::Cut {
                        node,
                        ref sig,
                        ref term,
                    } => prob.info(node, sig).cuts.push(term.clone()),
                    Assertion::Edge {
                        edge,
                        parent,
                        ref psig,
                        ref vars,
                        ref branches,
                    } => {
                        prob.info(parent, psig).edge = Some(edge);
                        for branch in branches {
                            for &(child, ref sig, _) in &branch.apps {
                                prob.info(child, sig);
                            }
                        }
                        prob.edges.insert(
                            edge,
                            EdgeInfo {
                                parent,
                                psig: psig.len(),
                                vars: vars.clone(),
                                branches: branches.clone(),
                            },
                        );
                    }
                    Assertion::Pin {
                        node,
                        ref vals,
                        branch,
                    } => {
                        if let Some(info) = prob.nodes.get_mut(&node) {
                            info.pins.push((vals.clone(), branch))
                        }
                    }
                }
            }
        }
        for (node, summary) in replace {
            if let Some(info) = prob.nodes.get_mut(node) {
                info.edge = None;
                info.cuts = vec![summary.clone()];
                info.pins.clear()
            }
        }
        for (node, cut) in extra {
            if let Some(info) = prob.nodes.get_mut(node) {
                info.cuts.push(cut.clone())
            }
        }
        Ok(prob)
    }

    /// Runs the search on the current assertions.
    fn run(&self, root: NodIdx, replace: &NodHMap<Term>, extra: &NodHMap<Term>) -> Res<Outcome> {
        let prob = self.problem(root, replace, extra)?;
        run_search(&prob, &self.counters)
    }

    /// Interpolant of a node from the bottom-up boxes, strengthened with
    /// the bound at the root.
    fn interpolant(&self, rpfp: &mut Rpfp, root: NodIdx, node: NodIdx) -> Res<()> {
        let prob = self.problem(root, &NodHMap::new(), &NodHMap::new())?;
        let boxes = tree_boxes(&prob)?;
        write_interpolant(&prob, &boxes, rpfp, root, node)
    }
}

/// Writes one node's interpolant into its annotation.
fn write_interpolant(
    prob: &Problem,
    boxes: &NodHMap<BoxD>,
    rpfp: &mut Rpfp,
    root: NodIdx,
    node: NodIdx,
) -> Res<()> {
    let info = match prob.nodes.get(&node) {
        Some(info) => info,
        None => bail!(crate::errors::internal(
            "interpolation requested for an unasserted node"
        )),
    };
    let bx = boxes.get(&node).cloned().unwrap_or(None);
    let mut res = box_to_term(&bx, &info.sig);
    if node == root {
        for bound in &info.negs {
            res = term::and(vec![res, bound.clone()])
        }
    }
    rpfp.node_mut(node).annotation = Transformer::new(res);
    Ok(())
}

impl Session for BoxSession {
    fn push(&mut self) -> Res<()> {
        self.frames.push(Vec::new());
        Ok(())
    }

    fn pop(&mut self, n: usize) -> Res<()> {
        if n >= self.frames.len() {
            bail!(crate::errors::internal("popping more frames than pushed"))
        }
        for _ in 0..n {
            self.frames.pop();
        }
        Ok(())
    }

    fn scope_level(&self) -> usize {
        self.frames.len() - 1
    }

    fn assert_node(&mut self, rpfp: &Rpfp, node: NodIdx) -> Res<()> {
        let n = rpfp.node(node);
        let assertion = Assertion::NegBound {
            node,
            sig: n.sig.clone(),
            bound: n.bound.term().clone(),
        };
        self.frame().push(assertion);
        Ok(())
    }

    fn assert_edge(&mut self, rpfp: &Rpfp, edge: EdgIdx, with_children: bool) -> Res<()> {
        let e = rpfp.edge(edge);
        match e.trans {
            Trans::LowerBound => {
                let parent = rpfp.node(e.parent);
                let assertion = Assertion::Cut {
                    node: e.parent,
                    sig: parent.sig.clone(),
                    term: parent.annotation.term().clone(),
                };
                self.frame().push(assertion)
            }
            Trans::Rule(ref fml) => {
                let parent = rpfp.node(e.parent);
                let mut branches = Vec::with_capacity(fml.branches.len());
                for branch in &fml.branches {
                    let mut apps = Vec::with_capacity(branch.apps.len());
                    for app in &branch.apps {
                        let child = e.children[app.child];
                        apps.push((child, rpfp.node(child).sig.clone(), app.args.clone()))
                    }
                    branches.push(BranchSnap {
                        grd: branch.grd.clone(),
                        apps,
                    })
                }
                let assertion = Assertion::Edge {
                    edge,
                    parent: e.parent,
                    psig: parent.sig.clone(),
                    vars: fml.vars.clone(),
                    branches,
                };
                self.frame().push(assertion);
                if with_children {
                    let mut cuts = Vec::with_capacity(e.children.len());
                    for child in &e.children {
                        let c = rpfp.node(*child);
                        cuts.push(Assertion::Cut {
                            node: *child,
                            sig: c.sig.clone(),
                            term: c.annotation.term().clone(),
                        })
                    }
                    for cut in cuts {
                        self.frame().push(cut)
                    }
                }
            }
        }
        Ok(())
    }

    fn assert_constraint(&mut self, rpfp: &Rpfp, node: NodIdx, term: &Term) -> Res<()> {
        let sig = rpfp.node(node).sig.clone();
        let assertion = Assertion::Cut {
            node,
            sig,
            term: term.clone(),
        };
        self.frame().push(assertion);
        Ok(())
    }

    fn check(&mut self, rpfp: &Rpfp, root: NodIdx, under_leaves: Option<&[NodIdx]>) -> Res<Check> {
        self.counters.checks.set(self.counters.checks.get() + 1);
        let mut extra = NodHMap::new();
        if let Some(leaves) = under_leaves {
            for leaf in leaves {
                let under = rpfp.node(*leaf).underapprox.term().clone();
                let entry = extra.entry(*leaf).or_insert_with(term::tru);
                *entry = term::and(vec![entry.clone(), under])
            }
        }
        match self.run(root, &NodHMap::new(), &extra)? {
            Outcome::Sat(model) => {
                self.model = Some(model);
                Ok(Check::Sat)
            }
            Outcome::Unsat => Ok(Check::Unsat),
            Outcome::Unknown => Ok(Check::Unknown),
        }
    }

    fn solve(&mut self, rpfp: &mut Rpfp, root: NodIdx) -> Res<Check> {
        let res = self.check(rpfp, root, None)?;
        if res == Check::Unsat {
            let prob = self.problem(root, &NodHMap::new(), &NodHMap::new())?;
            let boxes = tree_boxes(&prob)?;
            let nodes: Vec<NodIdx> = prob.nodes.keys().cloned().collect();
            for node in nodes {
                write_interpolant(&prob, &boxes, rpfp, root, node)?
            }
        }
        Ok(res)
    }

    fn solve_single_node(&mut self, rpfp: &mut Rpfp, root: NodIdx, node: NodIdx) -> Res<()> {
        self.interpolant(rpfp, root, node)
    }

    fn generalize(&mut self, rpfp: &mut Rpfp, root: NodIdx, node: NodIdx) -> Res<()> {
        let ann = rpfp.node(node).annotation.term().clone();
        if ann.is_true() {
            return Ok(());
        }
        let mut keep: Vec<Term> = match ann.conj_inspect() {
            Some(args) => args.clone(),
            None => vec![ann],
        };
        let mut cursor = 0;
        while cursor < keep.len() {
            let mut candidate = keep.clone();
            candidate.remove(cursor);
            let mut replace = NodHMap::new();
            replace.insert(node, term::and(candidate.clone()));
            match self.run(root, &replace, &NodHMap::new())? {
                Outcome::Unsat => keep = candidate,
                _ => cursor += 1,
            }
        }
        rpfp.node_mut(node).annotation = Transformer::new(term::and(keep));
        Ok(())
    }

    fn interpolate_by_cases(&mut self, rpfp: &mut Rpfp, root: NodIdx, node: NodIdx) -> Res<()> {
        // a fresh bottom-up pass is the case analysis for boxes
        self.interpolant(rpfp, root, node)
    }

    fn compute_proof_core(&mut self, rpfp: &Rpfp, root: NodIdx) -> Res<()> {
        let mut pairs = Vec::new();
        for frame in &self.frames {
            for assertion in frame {
                if let Assertion::Edge { edge, parent, .. } = *assertion {
                    pairs.push((edge, parent))
                }
            }
        }
        let mut core = EdgSet::new();
        for (edge, parent) in pairs {
            let summary = rpfp.node(parent).annotation.term().clone();
            let mut replace = NodHMap::new();
            replace.insert(parent, summary);
            match self.run(root, &replace, &NodHMap::new())? {
                Outcome::Unsat => (),
                _ => {
                    core.insert(edge);
                }
            }
        }
        self.core = Some(core);
        Ok(())
    }

    fn edge_used_in_proof(&self, edge: EdgIdx) -> bool {
        match self.core {
            Some(ref core) => core.contains(&edge),
            None => true,
        }
    }

    fn fix_current_state(&mut self, rpfp: &Rpfp, edge: EdgIdx) -> Res<()> {
        let model = match self.model {
            Some(ref model) => model.clone(),
            None => bail!(crate::errors::internal("no model available to fix")),
        };
        let e = rpfp.edge(edge);
        let mut nodes = vec![e.parent];
        nodes.extend(e.children.iter().cloned());
        let mut pins = Vec::new();
        for node in nodes {
            if let Some(vals) = model.vals.get(&node) {
                pins.push(Assertion::Pin {
                    node,
                    vals: vals.clone(),
                    branch: model.branches.get(&node).cloned(),
                })
            }
        }
        self.frame().extend(pins);
        Ok(())
    }

    fn constrain_parent(&mut self, rpfp: &Rpfp, _edge: EdgIdx, child: NodIdx) -> Res<()> {
        let c = rpfp.node(child);
        let assertion = Assertion::Cut {
            node: child,
            sig: c.sig.clone(),
            term: c.annotation.term().clone(),
        };
        self.frame().push(assertion);
        Ok(())
    }

    fn compute_underapprox(&mut self, rpfp: &mut Rpfp, _root: NodIdx) -> Res<()> {
        let model = match self.model {
            Some(ref model) => model.clone(),
            None => bail!(crate::errors::internal(
                "no model available for underapproximation"
            )),
        };
        for (node, vals) in &model.vals {
            let point = Transformer::point(vals);
            let n = rpfp.node_mut(*node);
            n.vals = Some(vals.clone());
            n.underapprox.union_with(&point)
        }
        Ok(())
    }

    fn empty(&self, _rpfp: &Rpfp, node: NodIdx) -> bool {
        match self.model {
            Some(ref model) => !model.vals.contains_key(&node),
            None => true,
        }
    }

    fn eval_bool(&self, _rpfp: &Rpfp, node: NodIdx, term: &Term) -> Res<Option<bool>> {
        let model = match self.model {
            Some(ref model) => model,
            None => return Ok(None),
        };
        let vals = model
            .vals
            .get(&node)
            .cloned()
            .unwrap_or_else(VarMap::new);
        match term.eval_with(&vals, &model.marks) {
            Ok(Val::B(b)) => Ok(Some(b)),
            _ => Ok(None),
        }
    }
}

/// Requests processed by the propagation loop.
#[derive(Clone, Debug)]
enum Req {
    /// Require a term to hold (or not) in a scope.
    Term { term: Term, pol: bool, scope: Scope },
    /// Bind a child parameter to an argument term of an application.
    ArgEq {
        child: NodIdx,
        var: VarIdx,
        term: Term,
        scope: Scope,
    },
    /// Activate a node.
    Activate(NodIdx),
}

/// A pending choice point.
#[derive(Clone, Debug)]
struct Split {
    /// Node whose rule branch is being chosen, if any.
    node: Option<NodIdx>,
    /// Alternatives: optional branch index, requests to enqueue.
    alts: Vec<(Option<usize>, Vec<Req>)>,
}

/// An affine constraint `Σ cᵢ·vᵢ + k ≥ 0`.
type Aff = (Vec<(Int, VKey)>, Int);

/// Search state, cloned at each split.
#[derive(Clone)]
struct State {
    doms: HashMap<VKey, Dom>,
    active: NodSet,
    branches: NodHMap<usize>,
    forced: NodHMap<usize>,
    queue: VecDeque<Req>,
    splits: VecDeque<Split>,
    lin: Vec<Aff>,
}
impl State {
    fn new() -> Self {
        State {
            doms: HashMap::new(),
            active: NodSet::new(),
            branches: NodHMap::new(),
            forced: NodHMap::new(),
            queue: VecDeque::new(),
            splits: VecDeque::new(),
            lin: Vec::new(),
        }
    }

    /// Current domain of a key.
    fn dom(&self, prob: &Problem, key: VKey) -> Dom {
        self.doms
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Dom::full(prob.typ(key)))
    }

    /// Sets a boolean key. True on conflict.
    fn set_bool(&mut self, prob: &Problem, key: VKey, val: bool) -> bool {
        match self.dom(prob, key) {
            Dom::Bool(Some(cur)) => cur != val,
            Dom::Bool(None) => {
                self.doms.insert(key, Dom::Bool(Some(val)));
                false
            }
            Dom::Int(_) => true,
        }
    }

    /// Intersects an integer key with a singleton. True on conflict.
    fn set_int(&mut self, prob: &Problem, key: VKey, val: &Int) -> bool {
        match self.dom(prob, key) {
            Dom::Int(iv) => {
                if iv.contains(val) {
                    self.doms.insert(key, Dom::Int(Ival::singleton(val.clone())));
                    false
                } else {
                    true
                }
            }
            Dom::Bool(_) => true,
        }
    }
}

/// Result of an affine refinement.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Refined {
    Empty,
    Changed,
    Same,
}

/// Entry point of the search.
fn run_search(prob: &Problem, counters: &Rc<Counters>) -> Res<Outcome> {
    let mut state = State::new();
    state.queue.push_back(Req::Activate(prob.root));
    let budget = Cell::new(STEP_BUDGET);
    search(prob, state, &budget, counters)
}

/// Depth-first search with propagation.
fn search(prob: &Problem, mut state: State, budget: &Cell<usize>, counters: &Rc<Counters>) -> Res<Outcome> {
    if propagate(prob, &mut state, budget)? {
        return Ok(Outcome::Unsat);
    }
    if budget.get() == 0 {
        return Ok(Outcome::Unknown);
    }
    if let Some(split) = state.splits.pop_front() {
        let Split { node, alts } = split;
        let mut saw_unknown = false;
        for (branch, reqs) in alts {
            counters.decisions.set(counters.decisions.get() + 1);
            let mut sub = state.clone();
            if let (Some(node), Some(branch)) = (node, branch) {
                sub.branches.insert(node, branch);
            }
            sub.queue.extend(reqs);
            match search(prob, sub, budget, counters)? {
                Outcome::Sat(model) => return Ok(Outcome::Sat(model)),
                Outcome::Unknown => saw_unknown = true,
                Outcome::Unsat => (),
            }
        }
        if saw_unknown {
            Ok(Outcome::Unknown)
        } else {
            Ok(Outcome::Unsat)
        }
    } else {
        label(prob, state, budget)
    }
}

/// Drains the request queue and runs the affine constraints to fixpoint.
/// True on conflict.
fn propagate(prob: &Problem, state: &mut State, budget: &Cell<usize>) -> Res<bool> {
    while let Some(req) = state.queue.pop_front() {
        if budget.get() == 0 {
            return Ok(false);
        }
        budget.set(budget.get() - 1);
        let conflict = match req {
            Req::Activate(node) => activate(prob, state, node)?,
            Req::Term { term, pol, scope } => require(prob, state, &term, pol, scope)?,
            Req::ArgEq {
                child,
                var,
                term,
                scope,
            } => arg_eq(prob, state, child, var, &term, scope)?,
        };
        if conflict {
            return Ok(true);
        }
    }
    for _ in 0..PROP_ROUNDS {
        if budget.get() == 0 {
            return Ok(false);
        }
        budget.set(budget.get() - 1);
        let mut changed = false;
        let lin = state.lin.clone();
        for (terms, konst) in &lin {
            let mut doms = GlobalDoms {
                state: &mut *state,
                prob,
            };
            match refine_ge0(&mut doms, terms, konst) {
                Refined::Empty => return Ok(true),
                Refined::Changed => changed = true,
                Refined::Same => (),
            }
        }
        if !changed {
            break;
        }
        if !state.queue.is_empty() {
            // refinement can not enqueue, but guard anyway
            return propagate(prob, state, budget);
        }
    }
    Ok(false)
}

/// Activates a node: enqueues its constraints and its branch choice.
/// True on conflict.
fn activate(prob: &Problem, state: &mut State, node: NodIdx) -> Res<bool> {
    if !state.active.insert(node) {
        return Ok(false);
    }
    let info = match prob.nodes.get(&node) {
        Some(info) => info,
        None => return Ok(false),
    };
    for (vals, branch) in &info.pins {
        for (var, val) in vals.index_iter() {
            let key = VKey::N(node, var);
            let conflict = match *val {
                Val::I(ref i) => state.set_int(prob, key, i),
                Val::B(b) => state.set_bool(prob, key, b),
            };
            if conflict {
                return Ok(true);
            }
        }
        if let Some(branch) = branch {
            state.forced.insert(node, *branch);
        }
    }
    let scope = Scope::node(node);
    for cut in &info.cuts {
        state.queue.push_back(Req::Term {
            term: cut.clone(),
            pol: true,
            scope,
        })
    }
    for bound in &info.negs {
        state.queue.push_back(Req::Term {
            term: bound.clone(),
            pol: false,
            scope,
        })
    }
    if let Some(edge) = info.edge {
        let einfo = &prob.edges[&edge];
        let scope = Scope::edge(node, edge, einfo.psig);
        let forced = state.forced.get(&node).cloned();
        let mut alts = Vec::with_capacity(einfo.branches.len());
        for (index, branch) in einfo.branches.iter().enumerate() {
            if let Some(forced) = forced {
                if forced != index {
                    continue;
                }
            }
            let mut reqs = vec![Req::Term {
                term: branch.grd.clone(),
                pol: true,
                scope,
            }];
            for &(child, _, ref args) in &branch.apps {
                reqs.push(Req::Activate(child));
                for (var, arg) in args.index_iter() {
                    reqs.push(Req::ArgEq {
                        child,
                        var,
                        term: arg.clone(),
                        scope,
                    })
                }
            }
            alts.push((Some(index), reqs))
        }
        if alts.len() == 1 {
            let (index, reqs) = alts.pop().expect("non-empty");
            state
                .branches
                .insert(node, index.expect("branch alternatives are indexed"));
            state.queue.extend(reqs)
        } else {
            state.splits.push_back(Split {
                node: Some(node),
                alts,
            })
        }
    }
    Ok(false)
}

/// Requires a term to hold (`pol`) or not (`!pol`). True on conflict.
fn require(prob: &Problem, state: &mut State, term: &Term, pol: bool, scope: Scope) -> Res<bool> {
    match *term.get() {
        RTerm::Bool(b) => Ok(b != pol),
        RTerm::Int(_) => Ok(true),
        RTerm::Var(v) => Ok(state.set_bool(prob, scope.key(v), pol)),
        RTerm::Mark(m) => Ok(state.set_bool(prob, VKey::M(m), pol)),
        RTerm::App { op, ref args } => match (op, pol) {
            (Op::Not, _) => require(prob, state, &args[0], !pol, scope),
            (Op::And, true) | (Op::Or, false) => {
                for arg in args {
                    state.queue.push_back(Req::Term {
                        term: arg.clone(),
                        pol,
                        scope,
                    })
                }
                Ok(false)
            }
            (Op::And, false) | (Op::Or, true) => {
                let alts = args
                    .iter()
                    .map(|arg| {
                        (
                            None,
                            vec![Req::Term {
                                term: arg.clone(),
                                pol,
                                scope,
                            }],
                        )
                    })
                    .collect();
                state.splits.push_back(Split { node: None, alts });
                Ok(false)
            }
            (Op::Ge, _) | (Op::Gt, _) | (Op::Le, _) | (Op::Lt, _) => {
                if args.len() != 2 {
                    return Ok(true);
                }
                let (lhs, rhs) = (&args[0], &args[1]);
                let expr = match aff_diff(prob, lhs, rhs, scope) {
                    Some(expr) => expr,
                    None => return Ok(false),
                };
                // normalize to `e ≥ 0` under the polarity
                let (mut terms, mut konst) = expr;
                let ge = match (op, pol) {
                    (Op::Ge, true) | (Op::Lt, false) => true,
                    (Op::Gt, true) | (Op::Le, false) => {
                        konst -= Int::from(1);
                        true
                    }
                    (Op::Le, true) | (Op::Gt, false) => false,
                    _ => {
                        // `Lt` positive, `Ge` negative: `-e - 1 ≥ 0`
                        konst += Int::from(1);
                        false
                    }
                };
                if !ge {
                    for &mut (ref mut coef, _) in &mut terms {
                        *coef = -std::mem::replace(coef, Int::zero())
                    }
                    konst = -konst
                }
                Ok(add_aff(prob, state, terms, konst))
            }
            (Op::Eql, true) => {
                if args.len() != 2 {
                    return Ok(true);
                }
                if let Some((terms, konst)) = aff_diff(prob, &args[0], &args[1], scope) {
                    let neg: Vec<(Int, VKey)> = terms
                        .iter()
                        .map(|&(ref coef, key)| (-coef.clone(), key))
                        .collect();
                    let nkonst = -konst.clone();
                    if add_aff(prob, state, terms, konst) {
                        return Ok(true);
                    }
                    Ok(add_aff(prob, state, neg, nkonst))
                } else if is_bool_term(prob, &args[0], scope) {
                    let (lhs, rhs) = (args[0].clone(), args[1].clone());
                    let alts = vec![
                        (None, eq_case(&lhs, &rhs, true, scope)),
                        (None, eq_case(&lhs, &rhs, false, scope)),
                    ];
                    state.splits.push_back(Split { node: None, alts });
                    Ok(false)
                } else {
                    Ok(false)
                }
            }
            (Op::Impl, true) => {
                if args.len() != 2 {
                    return Ok(true);
                }
                // false antecedent, or true consequent
                let alts = vec![
                    (
                        None,
                        vec![Req::Term {
                            term: args[0].clone(),
                            pol: false,
                            scope,
                        }],
                    ),
                    (
                        None,
                        vec![Req::Term {
                            term: args[1].clone(),
                            pol: true,
                            scope,
                        }],
                    ),
                ];
                state.splits.push_back(Split { node: None, alts });
                Ok(false)
            }
            (Op::Impl, false) => {
                if args.len() != 2 {
                    return Ok(true);
                }
                // true antecedent and false consequent
                state.queue.push_back(Req::Term {
                    term: args[0].clone(),
                    pol: true,
                    scope,
                });
                state.queue.push_back(Req::Term {
                    term: args[1].clone(),
                    pol: false,
                    scope,
                });
                Ok(false)
            }
            (Op::Eql, false) => {
                if args.len() == 2 && is_bool_term(prob, &args[0], scope) {
                    // one true, one false
                    let (lhs, rhs) = (args[0].clone(), args[1].clone());
                    let alts = vec![
                        (
                            None,
                            vec![
                                Req::Term {
                                    term: lhs.clone(),
                                    pol: true,
                                    scope,
                                },
                                Req::Term {
                                    term: rhs.clone(),
                                    pol: false,
                                    scope,
                                },
                            ],
                        ),
                        (
                            None,
                            vec![
                                Req::Term {
                                    term: lhs,
                                    pol: false,
                                    scope,
                                },
                                Req::Term {
                                    term: rhs,
                                    pol: true,
                                    scope,
                                },
                            ],
                        ),
                    ];
                    state.splits.push_back(Split { node: None, alts });
                }
                // integer disequalities are left to model verification
                Ok(false)
            }
            (Op::Add, _) | (Op::Sub, _) | (Op::Mul, _) => Ok(true),
        },
    }
}

/// Both-polarity requests for a boolean equality case.
fn eq_case(lhs: &Term, rhs: &Term, pol: bool, scope: Scope) -> Vec<Req> {
    vec![
        Req::Term {
            term: lhs.clone(),
            pol,
            scope,
        },
        Req::Term {
            term: rhs.clone(),
            pol,
            scope,
        },
    ]
}

/// Records and propagates an affine constraint. True on conflict.
fn add_aff(prob: &Problem, state: &mut State, terms: Vec<(Int, VKey)>, konst: Int) -> bool {
    let res = {
        let mut doms = GlobalDoms {
                state: &mut *state,
                prob,
            };
        refine_ge0(&mut doms, &terms, &konst)
    };
    state.lin.push((terms, konst));
    res == Refined::Empty
}

/// Binds a child parameter to an argument term. True on conflict.
fn arg_eq(
    prob: &Problem,
    state: &mut State,
    child: NodIdx,
    var: VarIdx,
    term: &Term,
    scope: Scope,
) -> Res<bool> {
    let key = VKey::N(child, var);
    match prob.typ(key) {
        Typ::Bool => match *term.get() {
            RTerm::Bool(b) => Ok(state.set_bool(prob, key, b)),
            // boolean links are left to model verification
            _ => Ok(false),
        },
        Typ::Int => {
            let (mut terms, konst) = match linearize(term, &|v| {
                let key = scope.key(v);
                if prob.typ(key) == Typ::Int {
                    Some(key)
                } else {
                    None
                }
            }) {
                Some(expr) => expr,
                None => return Ok(false),
            };
            terms.push((-Int::from(1), key));
            let terms = merge_aff(terms);
            let neg: Vec<(Int, VKey)> = terms
                .iter()
                .map(|&(ref coef, key)| (-coef.clone(), key))
                .collect();
            let nkonst = -konst.clone();
            if add_aff(prob, state, terms, konst) {
                return Ok(true);
            }
            Ok(add_aff(prob, state, neg, nkonst))
        }
    }
}

/// Affine form of `lhs - rhs`, merged.
fn aff_diff(prob: &Problem, lhs: &Term, rhs: &Term, scope: Scope) -> Option<Aff> {
    let key_of = |v: VarIdx| {
        let key = scope.key(v);
        if prob.typ(key) == Typ::Int {
            Some(key)
        } else {
            None
        }
    };
    let (mut terms, mut konst) = linearize(lhs, &key_of)?;
    let (rterms, rkonst) = linearize(rhs, &key_of)?;
    for (coef, key) in rterms {
        terms.push((-coef, key))
    }
    konst -= rkonst;
    Some((merge_aff(terms), konst))
}

/// Linearizes a term into an affine expression over `K`-keys. `None` if
/// the term is not affine or mentions a non-integer variable.
fn linearize<K: Copy, F: Fn(VarIdx) -> Option<K>>(term: &Term, key_of: &F) -> Option<(Vec<(Int, K)>, Int)> {
    match *term.get() {
        RTerm::Int(ref i) => Some((Vec::new(), i.clone())),
        RTerm::Var(v) => key_of(v).map(|key| (vec![(Int::from(1), key)], Int::zero())),
        RTerm::Bool(_) | RTerm::Mark(_) => None,
        RTerm::App { op, ref args } => match op {
            Op::Add => {
                let mut terms = Vec::new();
                let mut konst = Int::zero();
                for arg in args {
                    let (ts, k) = linearize(arg, key_of)?;
                    terms.extend(ts);
                    konst += k
                }
                Some((terms, konst))
            }
            Op::Sub => {
                let mut iter = args.iter();
                let (mut terms, mut konst) = linearize(iter.next()?, key_of)?;
                let mut any = false;
                for arg in iter {
                    any = true;
                    let (ts, k) = linearize(arg, key_of)?;
                    for (coef, key) in ts {
                        terms.push((-coef, key))
                    }
                    konst -= k
                }
                if !any {
                    for &mut (ref mut coef, _) in &mut terms {
                        *coef = -std::mem::replace(coef, Int::zero())
                    }
                    konst = -konst
                }
                Some((terms, konst))
            }
            Op::Mul => {
                let mut factor = Int::from(1);
                let mut var_part: Option<(Vec<(Int, K)>, Int)> = None;
                for arg in args {
                    let (ts, k) = linearize(arg, key_of)?;
                    if ts.is_empty() {
                        factor *= k
                    } else if var_part.is_none() {
                        var_part = Some((ts, k))
                    } else {
                        return None;
                    }
                }
                match var_part {
                    None => Some((Vec::new(), factor)),
                    Some((ts, k)) => Some((
                        ts.into_iter().map(|(coef, key)| (coef * &factor, key)).collect(),
                        k * factor,
                    )),
                }
            }
            _ => None,
        },
    }
}

/// Merges duplicate keys of an affine expression.
fn merge_aff<K: Copy + Eq + std::hash::Hash>(terms: Vec<(Int, K)>) -> Vec<(Int, K)> {
    let mut map: HashMap<K, Int> = HashMap::new();
    let mut order: Vec<K> = Vec::new();
    for (coef, key) in terms {
        if !map.contains_key(&key) {
            order.push(key)
        }
        *map.entry(key).or_insert_with(Int::zero) += coef
    }
    order
        .into_iter()
        .filter_map(|key| {
            let coef = map.remove(&key).expect("key inserted above");
            if coef.is_zero() {
                None
            } else {
                Some((coef, key))
            }
        })
        .collect()
}

/// Domain stores the affine refinement is generic over.
trait Doms<K> {
    fn dom_of(&self, key: K) -> Dom;
    fn set(&mut self, key: K, dom: Dom);
}

/// Global store of the search.
struct GlobalDoms<'a> {
    state: &'a mut State,
    prob: &'a Problem,
}
impl<'a> Doms<VKey> for GlobalDoms<'a> {
    fn dom_of(&self, key: VKey) -> Dom {
        self.state.dom(self.prob, key)
    }
    fn set(&mut self, key: VKey, dom: Dom) {
        self.state.doms.insert(key, dom);
    }
}

/// Local store over a rule's variables.
struct LocalDoms<'a> {
    doms: &'a mut VarMap<Dom>,
}
impl<'a> Doms<VarIdx> for LocalDoms<'a> {
    fn dom_of(&self, key: VarIdx) -> Dom {
        self.doms[key].clone()
    }
    fn set(&mut self, key: VarIdx, dom: Dom) {
        self.doms[key] = dom
    }
}

/// Refines variable domains with `Σ cᵢ·vᵢ + k ≥ 0`.
fn refine_ge0<K: Copy, D: Doms<K>>(doms: &mut D, terms: &[(Int, K)], konst: &Int) -> Refined {
    // max of `c·v` over the domain, `None` if unbounded
    let maxes: Vec<Option<Int>> = terms
        .iter()
        .map(|&(ref coef, key)| match doms.dom_of(key) {
            Dom::Int(iv) => {
                if coef.is_positive() {
                    iv.hi.map(|hi| coef * hi)
                } else {
                    iv.lo.map(|lo| coef * lo)
                }
            }
            Dom::Bool(_) => None,
        })
        .collect();
    let unbounded = maxes.iter().filter(|max| max.is_none()).count();
    let bounded_sum = maxes.iter().flatten().fold(konst.clone(), |acc, max| acc + max);
    if unbounded == 0 && bounded_sum.is_negative() {
        return Refined::Empty;
    }
    let mut changed = false;
    for (index, &(ref coef, key)) in terms.iter().enumerate() {
        // upper bound of the other terms plus the constant
        let rest = match maxes[index] {
            Some(ref max) => {
                if unbounded > 0 {
                    continue;
                }
                &bounded_sum - max
            }
            None => {
                if unbounded > 1 {
                    continue;
                }
                bounded_sum.clone()
            }
        };
        // `coef·v ≥ -rest`
        let mut dom = match doms.dom_of(key) {
            Dom::Int(iv) => iv,
            Dom::Bool(_) => continue,
        };
        let target = -rest;
        let refined = if coef.is_positive() {
            dom.raise_lo(target.div_ceil(coef))
        } else {
            dom.lower_hi(target.div_floor(coef))
        };
        if refined {
            changed = true;
            let empty = dom.is_empty();
            doms.set(key, Dom::Int(dom));
            if empty {
                return Refined::Empty;
            }
        }
    }
    if changed {
        Refined::Changed
    } else {
        Refined::Same
    }
}

/// True if a term is boolean-sorted in a scope.
fn is_bool_term(prob: &Problem, term: &Term, scope: Scope) -> bool {
    match *term.get() {
        RTerm::Bool(_) | RTerm::Mark(_) => true,
        RTerm::Int(_) => false,
        RTerm::Var(v) => prob.typ(scope.key(v)) == Typ::Bool,
        RTerm::App { op, .. } => match op {
            Op::Add | Op::Sub | Op::Mul => false,
            _ => true,
        },
    }
}

/// A value from a labeled domain.
fn dom_val(dom: &Dom) -> Val {
    match *dom {
        Dom::Int(ref iv) => {
            let zero = Int::zero();
            if iv.contains(&zero) {
                Val::I(zero)
            } else if let Some(ref lo) = iv.lo {
                Val::I(lo.clone())
            } else if let Some(ref hi) = iv.hi {
                Val::I(hi.clone())
            } else {
                Val::I(zero)
            }
        }
        Dom::Bool(b) => Val::B(b.unwrap_or(false)),
    }
}

/// Assigns concrete values to the remaining variables and verifies the
/// model. Anything that does not check out concretely yields `Unknown`.
fn label(prob: &Problem, state: State, budget: &Cell<usize>) -> Res<Outcome> {
    let mut doms = state.doms.clone();
    let mut keys: Vec<VKey> = Vec::new();
    for node in &state.active {
        if let Some(info) = prob.nodes.get(node) {
            for var in info.sig.indices() {
                keys.push(VKey::N(*node, var))
            }
            if let Some(edge) = info.edge {
                let einfo = &prob.edges[&edge];
                for var in einfo.psig..einfo.vars.len() {
                    keys.push(VKey::E(edge, VarIdx::new(var)))
                }
            }
        }
    }
    for key in doms.keys() {
        if let VKey::M(_) = *key {
            keys.push(*key)
        }
    }
    keys.sort();
    keys.dedup();
    for key in keys {
        if budget.get() == 0 {
            return Ok(Outcome::Unknown);
        }
        budget.set(budget.get() - 1);
        let dom = doms
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Dom::full(prob.typ(key)));
        match dom {
            Dom::Bool(Some(_)) => (),
            Dom::Bool(None) => {
                doms.insert(key, Dom::Bool(Some(false)));
            }
            Dom::Int(ref iv) if iv.is_singleton() => (),
            Dom::Int(iv) => {
                let mut candidates = Vec::with_capacity(3);
                let zero = Int::zero();
                if iv.contains(&zero) {
                    candidates.push(zero)
                }
                if let Some(ref lo) = iv.lo {
                    candidates.push(lo.clone())
                }
                if let Some(ref hi) = iv.hi {
                    candidates.push(hi.clone())
                }
                candidates.dedup();
                let mut assigned = false;
                for candidate in candidates {
                    let saved = doms.clone();
                    doms.insert(key, Dom::Int(Ival::singleton(candidate)));
                    if relabel(prob, &mut doms, &state.lin) {
                        assigned = true;
                        break;
                    }
                    doms = saved
                }
                if !assigned {
                    return Ok(Outcome::Unknown);
                }
            }
        }
    }
    verify(prob, &state, &doms)
}

/// Fixpoint over the recorded affine constraints after a labeling step.
/// False on conflict.
fn relabel(prob: &Problem, doms: &mut HashMap<VKey, Dom>, lin: &[Aff]) -> bool {
    struct MapDoms<'a> {
        doms: &'a mut HashMap<VKey, Dom>,
        prob: &'a Problem,
    }
    impl<'a> Doms<VKey> for MapDoms<'a> {
        fn dom_of(&self, key: VKey) -> Dom {
            self.doms
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Dom::full(self.prob.typ(key)))
        }
        fn set(&mut self, key: VKey, dom: Dom) {
            self.doms.insert(key, dom);
        }
    }
    for _ in 0..PROP_ROUNDS {
        let mut changed = false;
        for (terms, konst) in lin {
            let mut store = MapDoms {
                doms: &mut *doms,
                prob,
            };
            match refine_ge0(&mut store, terms, konst) {
                Refined::Empty => return false,
                Refined::Changed => changed = true,
                Refined::Same => (),
            }
        }
        if !changed {
            break;
        }
    }
    true
}

/// Concrete verification of a labeled state. Builds the model.
fn verify(prob: &Problem, state: &State, doms: &HashMap<VKey, Dom>) -> Res<Outcome> {
    let dom_at = |key: VKey| {
        doms.get(&key)
            .cloned()
            .unwrap_or_else(|| Dom::full(prob.typ(key)))
    };
    let mut marks = HashMap::new();
    for (key, dom) in doms {
        if let VKey::M(mark) = *key {
            if let Dom::Bool(Some(b)) = *dom {
                marks.insert(mark, b);
            }
        }
    }
    let mut vals: NodHMap<VarMap<Val>> = NodHMap::new();
    for node in &state.active {
        if let Some(info) = prob.nodes.get(node) {
            let mut point = VarMap::with_capacity(info.sig.len());
            for var in info.sig.indices() {
                point.push(dom_val(&dom_at(VKey::N(*node, var))));
            }
            vals.insert(*node, point);
        }
    }
    let mut evals = HashMap::new();
    for node in &state.active {
        let info = match prob.nodes.get(node) {
            Some(info) => info,
            None => continue,
        };
        let point = &vals[node];
        for (pins, _) in &info.pins {
            if pins.len() != point.len() {
                return Ok(Outcome::Unknown);
            }
            for (var, val) in pins.index_iter() {
                if point[var] != *val {
                    return Ok(Outcome::Unknown);
                }
            }
        }
        for cut in &info.cuts {
            match cut.eval_with(point, &marks) {
                Ok(Val::B(true)) => (),
                _ => return Ok(Outcome::Unknown),
            }
        }
        for bound in &info.negs {
            match bound.eval_with(point, &marks) {
                Ok(Val::B(false)) => (),
                _ => return Ok(Outcome::Unknown),
            }
        }
        if let Some(edge) = info.edge {
            let einfo = &prob.edges[&edge];
            let branch = match state.branches.get(node) {
                Some(branch) => *branch,
                None => return Ok(Outcome::Unknown),
            };
            if branch >= einfo.branches.len() {
                return Ok(Outcome::Unknown);
            }
            let mut scope_vals = VarMap::with_capacity(einfo.vars.len());
            for var in einfo.vars.indices() {
                if var.get() < einfo.psig {
                    scope_vals.push(point[var].clone());
                } else {
                    let val = dom_val(&dom_at(VKey::E(edge, var)));
                    evals.insert((edge, var), val.clone());
                    scope_vals.push(val);
                }
            }
            let snap = &einfo.branches[branch];
            match snap.grd.eval_with(&scope_vals, &marks) {
                Ok(Val::B(true)) => (),
                _ => return Ok(Outcome::Unknown),
            }
            for &(child, _, ref args) in &snap.apps {
                let cpoint = match vals.get(&child) {
                    Some(cpoint) => cpoint,
                    None => return Ok(Outcome::Unknown),
                };
                for (var, arg) in args.index_iter() {
                    match arg.eval_with(&scope_vals, &marks) {
                        Ok(val) if val == cpoint[var] => (),
                        _ => return Ok(Outcome::Unknown),
                    }
                }
            }
        }
    }
    let mut branches = NodHMap::new();
    for (node, branch) in &state.branches {
        if state.active.contains(node) {
            branches.insert(*node, *branch);
        }
    }
    Ok(Outcome::Sat(Model {
        vals,
        evals,
        marks,
        branches,
    }))
}

/// A box over a node's parameters, `None` when empty.
type BoxD = Option<VarMap<Dom>>;

/// Bottom-up boxes of a refuted derivation problem: at each node, an
/// overapproximation of the values derivable from its subtree.
fn tree_boxes(prob: &Problem) -> Res<NodHMap<BoxD>> {
    let mut memo = NodHMap::new();
    node_box(prob, prob.root, &mut memo, 0)?;
    Ok(memo)
}

/// The box of one node, recursively.
fn node_box(prob: &Problem, node: NodIdx, memo: &mut NodHMap<BoxD>, depth: usize) -> Res<BoxD> {
    if let Some(bx) = memo.get(&node) {
        return Ok(bx.clone());
    }
    if depth > 10_000 {
        bail!(crate::errors::internal("derivation graph too deep"))
    }
    let info = match prob.nodes.get(&node) {
        Some(info) => info,
        None => {
            memo.insert(node, Some(VarMap::new()));
            return Ok(Some(VarMap::new()));
        }
    };
    let mut bx: BoxD = if let Some(edge) = info.edge {
        let einfo = &prob.edges[&edge];
        let mut acc: BoxD = None;
        for branch in &einfo.branches {
            if let Some(branch_bx) = branch_box(prob, einfo, branch, memo, depth)? {
                match acc {
                    None => acc = Some(branch_bx),
                    Some(ref mut hull) => {
                        for (var, dom) in branch_bx.index_iter() {
                            hull[var].hull(dom)
                        }
                    }
                }
            }
        }
        acc
    } else {
        Some(info.sig.iter().map(|typ| Dom::full(*typ)).collect())
    };
    let mut empty = false;
    if let Some(ref mut doms) = bx {
        for cut in &info.cuts {
            let mut nonempty = true;
            for _ in 0..3 {
                nonempty = hull_refine(doms, &info.sig, cut, true)?;
                if !nonempty {
                    break;
                }
            }
            if !nonempty {
                empty = true;
                break;
            }
        }
    }
    if empty {
        bx = None
    }
    memo.insert(node, bx.clone());
    Ok(bx)
}

/// Overapproximate image of one branch, projected on the parent's
/// parameters. `None` when the branch is infeasible.
fn branch_box(
    prob: &Problem,
    einfo: &EdgeInfo,
    branch: &BranchSnap,
    memo: &mut NodHMap<BoxD>,
    depth: usize,
) -> Res<BoxD> {
    let mut doms: VarMap<Dom> = einfo.vars.iter().map(|typ| Dom::full(*typ)).collect();
    for _ in 0..3 {
        if !hull_refine(&mut doms, &einfo.vars, &branch.grd, true)? {
            return Ok(None);
        }
    }
    for &(child, _, ref args) in &branch.apps {
        let child_bx = match node_box(prob, child, memo, depth + 1)? {
            Some(bx) => bx,
            None => return Ok(None),
        };
        for (var, arg) in args.index_iter() {
            if var.get() >= child_bx.len() {
                continue;
            }
            if let Dom::Int(ref iv) = child_bx[var] {
                // `lo ≤ arg` and `arg ≤ hi`
                let key_of = |v: VarIdx| {
                    if v.get() < einfo.vars.len() && einfo.vars[v] == Typ::Int {
                        Some(v)
                    } else {
                        None
                    }
                };
                if let Some((terms, konst)) = linearize(arg, &key_of) {
                    if let Some(ref lo) = iv.lo {
                        let mut store = LocalDoms { doms: &mut doms };
                        if refine_ge0(&mut store, &terms, &(&konst - lo)) == Refined::Empty {
                            return Ok(None);
                        }
                    }
                    if let Some(ref hi) = iv.hi {
                        let neg: Vec<(Int, VarIdx)> = terms
                            .iter()
                            .map(|&(ref coef, key)| (-coef.clone(), key))
                            .collect();
                        let mut store = LocalDoms { doms: &mut doms };
                        if refine_ge0(&mut store, &neg, &(hi - &konst)) == Refined::Empty {
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }
    for _ in 0..3 {
        if !hull_refine(&mut doms, &einfo.vars, &branch.grd, true)? {
            return Ok(None);
        }
    }
    let mut projected = VarMap::with_capacity(einfo.psig);
    for var in 0..einfo.psig {
        projected.push(doms[VarIdx::new(var)].clone());
    }
    Ok(Some(projected))
}

/// Overapproximate refinement of a local box with a formula. Returns
/// false when the box becomes empty. Disjunctions hull their feasible
/// cases; whatever cannot be refined is skipped (sound, the box only
/// grows coarser).
fn hull_refine(doms: &mut VarMap<Dom>, typs: &VarMap<Typ>, term: &Term, pol: bool) -> Res<bool> {
    match *term.get() {
        RTerm::Bool(b) => Ok(b == pol),
        RTerm::Int(_) => Ok(true),
        RTerm::Mark(_) => Ok(true),
        RTerm::Var(v) => {
            if v.get() < typs.len() && typs[v] == Typ::Bool {
                match doms[v] {
                    Dom::Bool(Some(cur)) if cur != pol => Ok(false),
                    Dom::Bool(_) => {
                        doms[v] = Dom::Bool(Some(pol));
                        Ok(true)
                    }
                    Dom::Int(_) => Ok(true),
                }
            } else {
                Ok(true)
            }
        }
        RTerm::App { op, ref args } => match (op, pol) {
            (Op::Not, _) => hull_refine(doms, typs, &args[0], !pol),
            (Op::And, true) | (Op::Or, false) => {
                for arg in args {
                    if !hull_refine(doms, typs, arg, pol)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Op::And, false) | (Op::Or, true) => {
                let mut acc: Option<VarMap<Dom>> = None;
                for arg in args {
                    let mut case = doms.clone();
                    if hull_refine(&mut case, typs, arg, pol)? {
                        match acc {
                            None => acc = Some(case),
                            Some(ref mut hull) => {
                                for (var, dom) in case.index_iter() {
                                    hull[var].hull(dom)
                                }
                            }
                        }
                    }
                }
                match acc {
                    None => Ok(false),
                    Some(hull) => {
                        *doms = hull;
                        Ok(true)
                    }
                }
            }
            (Op::Impl, true) => {
                if args.len() != 2 {
                    return Ok(true);
                }
                // hull of the false-antecedent and true-consequent cases
                let mut acc: Option<VarMap<Dom>> = None;
                for (arg, case_pol) in &[(&args[0], false), (&args[1], true)] {
                    let mut case = doms.clone();
                    if hull_refine(&mut case, typs, arg, *case_pol)? {
                        match acc {
                            None => acc = Some(case),
                            Some(ref mut hull) => {
                                for (var, dom) in case.index_iter() {
                                    hull[var].hull(dom)
                                }
                            }
                        }
                    }
                }
                match acc {
                    None => Ok(false),
                    Some(hull) => {
                        *doms = hull;
                        Ok(true)
                    }
                }
            }
            (Op::Impl, false) => {
                if args.len() != 2 {
                    return Ok(true);
                }
                Ok(hull_refine(doms, typs, &args[0], true)?
                    && hull_refine(doms, typs, &args[1], false)?)
            }
            (Op::Ge, _) | (Op::Gt, _) | (Op::Le, _) | (Op::Lt, _) | (Op::Eql, _) => {
                if args.len() != 2 {
                    return Ok(true);
                }
                let key_of = |v: VarIdx| {
                    if v.get() < typs.len() && typs[v] == Typ::Int {
                        Some(v)
                    } else {
                        None
                    }
                };
                let (mut terms, mut konst) = match linearize(&args[0], &key_of).and_then(
                    |(mut terms, mut konst)| {
                        let (rterms, rkonst) = linearize(&args[1], &key_of)?;
                        for (coef, key) in rterms {
                            terms.push((-coef, key))
                        }
                        konst -= rkonst;
                        Some((merge_aff(terms), konst))
                    },
                ) {
                    Some(expr) => expr,
                    None => return Ok(true),
                };
                let both = op == Op::Eql && pol;
                if op == Op::Eql && !pol {
                    // overapproximate: disequalities do not refine boxes
                    return Ok(true);
                }
                let ge = match (op, pol) {
                    (Op::Ge, true) | (Op::Lt, false) | (Op::Eql, true) => true,
                    (Op::Gt, true) | (Op::Le, false) => {
                        konst -= Int::from(1);
                        true
                    }
                    (Op::Le, true) | (Op::Gt, false) => false,
                    _ => {
                        konst += Int::from(1);
                        false
                    }
                };
                if !ge {
                    for &mut (ref mut coef, _) in &mut terms {
                        *coef = -std::mem::replace(coef, Int::zero())
                    }
                    konst = -konst
                }
                {
                    let mut store = LocalDoms { doms: &mut *doms };
                    if refine_ge0(&mut store, &terms, &konst) == Refined::Empty {
                        return Ok(false);
                    }
                }
                if both {
                    let neg: Vec<(Int, VarIdx)> = terms
                        .iter()
                        .map(|&(ref coef, key)| (-coef.clone(), key))
                        .collect();
                    let nkonst = -konst;
                    let mut store = LocalDoms { doms: &mut *doms };
                    if refine_ge0(&mut store, &neg, &nkonst) == Refined::Empty {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Op::Add, _) | (Op::Sub, _) | (Op::Mul, _) => Ok(true),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rpfp::{App, Branch, Fml};

    fn int_sig() -> VarMap<Typ> {
        vec![Typ::Int].into()
    }

    fn trans(term: Term) -> Transformer {
        Transformer::new(term)
    }

    #[test]
    fn subset() {
        let be = Boxes::new();
        let sig = int_sig();
        let x_ge_1 = trans(term::ge(term::var(0), term::int(1)));
        let x_ge_0 = trans(term::ge(term::var(0), term::int(0)));
        assert!(be.subset_eq(&x_ge_1, &x_ge_0, &sig).unwrap());
        assert!(!be.subset_eq(&x_ge_0, &x_ge_1, &sig).unwrap());
        assert!(be.subset_eq(&Transformer::empty(), &x_ge_1, &sig).unwrap());
        assert!(!be
            .subset_eq(&Transformer::full(), &x_ge_0, &sig)
            .unwrap());
    }

    #[test]
    fn scope_discipline() {
        let be = Boxes::new();
        let mut sess = be.session().unwrap();
        assert_eq!(sess.scope_level(), 0);
        sess.push().unwrap();
        sess.push().unwrap();
        assert_eq!(sess.scope_level(), 2);
        sess.pop(2).unwrap();
        assert_eq!(sess.scope_level(), 0);
        assert!(sess.pop(1).is_err());
    }

    /// `¬(x ≥ 0)` against a rule deriving `x ≥ 0` is unsat, and the
    /// interpolant implies the bound.
    #[test]
    fn solve_interpolates() {
        let be = Boxes::new();
        let mut rpfp = Rpfp::new();
        let bound = trans(term::ge(term::var(0), term::int(0)));
        let p = rpfp.add_node("P", int_sig(), bound.clone());
        let fml = Fml::new(
            int_sig(),
            vec![Branch::new(term::ge(term::var(0), term::int(0)), vec![])],
        );
        let edge = rpfp.create_edge(p, fml, vec![], None);
        let mut sess = be.session().unwrap();
        sess.push().unwrap();
        sess.assert_node(&rpfp, p).unwrap();
        sess.assert_edge(&rpfp, edge, true).unwrap();
        assert_eq!(sess.solve(&mut rpfp, p).unwrap(), Check::Unsat);
        let annotation = rpfp.node(p).annotation.clone();
        assert!(be.subset_eq(&annotation, &bound, &int_sig()).unwrap());
        sess.pop(1).unwrap();
    }

    /// Disjunctive guards split; the model lands on a feasible case.
    #[test]
    fn disjunction_splits() {
        let be = Boxes::new();
        let mut rpfp = Rpfp::new();
        // bound is `x < 0`, so its negation allows the guard cases
        let bound = trans(term::lt(term::var(0), term::int(0)));
        let p = rpfp.add_node("P", int_sig(), bound);
        let grd = term::or(vec![
            term::eq(term::var(0), term::int(5)),
            term::eq(term::var(0), term::int(7)),
        ]);
        let fml = Fml::new(int_sig(), vec![Branch::new(grd, vec![])]);
        let edge = rpfp.create_edge(p, fml, vec![], None);
        let mut sess = be.session().unwrap();
        sess.push().unwrap();
        sess.assert_node(&rpfp, p).unwrap();
        sess.assert_edge(&rpfp, edge, true).unwrap();
        assert_eq!(sess.check(&rpfp, p, None).unwrap(), Check::Sat);
        assert!(!sess.empty(&rpfp, p));
        sess.compute_underapprox(&mut rpfp, p).unwrap();
        let vals = rpfp.node(p).vals.clone().expect("model point");
        let x = vals[VarIdx::new(0)].to_int().unwrap();
        assert!(x == Int::from(5) || x == Int::from(7));
        sess.pop(1).unwrap();
        assert!(be.cumulative_decisions() > 0);
    }

    /// Child applications link parent and child values.
    #[test]
    fn child_link() {
        let be = Boxes::new();
        let mut rpfp = Rpfp::new();
        let bound = trans(term::le(term::var(0), term::int(3)));
        let p = rpfp.add_node("P", int_sig(), bound);
        let q = rpfp.add_node("Q", int_sig(), Transformer::full());
        rpfp.node_mut(q).annotation =
            trans(term::le(term::var(0), term::int(1)));
        // P(x) :- Q(c), x = c + 1
        let vars: VarMap<Typ> = vec![Typ::Int, Typ::Int].into();
        let args: VarMap<Term> = vec![term::var(1)].into();
        let grd = term::eq(
            term::var(0),
            term::add(vec![term::var(1), term::int(1)]),
        );
        let fml = Fml::new(vars, vec![Branch::new(grd, vec![App::new(0, args)])]);
        let edge = rpfp.create_edge(p, fml, vec![q], None);
        let mut sess = be.session().unwrap();
        sess.push().unwrap();
        // negated bound: x > 3; image of Q is at most 2, so unsat
        sess.assert_node(&rpfp, p).unwrap();
        sess.assert_edge(&rpfp, edge, true).unwrap();
        assert_eq!(sess.check(&rpfp, p, None).unwrap(), Check::Unsat);
        sess.pop(1).unwrap();
    }
}

/// Conjunction of interval literals describing a box.
fn box_to_term(bx: &BoxD, sig: &VarMap<Typ>) -> Term {
    let doms = match *bx {
        None => return term::fls(),
        Some(ref doms) => doms,
    };
    let mut conj = Vec::new();
    for (var, dom) in doms.index_iter() {
        if var.get() >= sig.len() {
            break;
        }
        match *dom {
            Dom::Int(ref iv) => {
                if let Some(ref lo) = iv.lo {
                    conj.push(term::ge(term::var(var), term::int(lo.clone())))
                }
                if let Some(ref hi) = iv.hi {
                    conj.push(term::le(term::var(var), term::int(hi.clone())))
                }
            }
            Dom::Bool(Some(true)) => conj.push(term::var(var)),
            Dom::Bool(Some(false)) => conj.push(term::not(term::var(var))),
            Dom::Bool(None) => (),
        }
    }
    term::and(conj)
}
