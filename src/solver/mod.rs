//! The solver: unbounded unwinding with interpolants and covering.
//!
//! [`Duality`] takes an input RPFP graph and either annotates it with an
//! inductive solution satisfying every node's bound, or refutes it with
//! a finite counterexample derivation tree.
//!
//! The search maintains a growing *unwinding* of the input graph. Each
//! unwinding instance carries an annotation (overapproximation), an
//! underapproximation and a bound. The outer loop pulls extension
//! candidates (an input edge plus child instances), tests them for
//! feasibility, extends the unwinding and proves the new instance's
//! bound by building a derivation tree. Proofs produce interpolants
//! that shrink annotations; failures produce counterexamples.
//! [`Covering`](covering/struct.Covering.html) keeps the set of
//! instances worth expanding small, and conjecture-based forced
//! covering accelerates convergence on loops.
//!
//! ```rust,ignore
//! let mut solver = Duality::new(rpfp, Boxes::new());
//! solver.set_option("stratified_inlining", "1");
//! if solver.solve()? {
//!     // input annotations now form an inductive solution
//! } else {
//!     let cex = solver.counterexample().expect("refuted");
//! }
//! ```
//!
//! [`Duality`]: struct.Duality.html (Duality struct)

use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::{Backend, Check, Session};
use crate::common::*;
use crate::rpfp::{Rpfp, Transformer};
use crate::term;

/// Covering context over the solver's state.
macro_rules! cover_cx {
    ($slf:expr) => {
        crate::solver::covering::CoverCx {
            rpfp: &$slf.unwinding,
            reporter: &mut *$slf.reporter,
            insts: &$slf.insts_of_node,
            all: &$slf.all_of_node,
            under_map: &$slf.underapprox_map,
            under: $slf.conf.use_underapprox,
            be: &$slf.backend,
        }
    };
}

pub mod covering;
pub mod derivation;
pub mod heuristic;
pub mod reporter;

use self::covering::Covering;
use self::derivation::{DerivationTree, DerivationTreeSlow};
use self::heuristic::Heuristic;
use self::reporter::{NullReporter, Reporter, StreamReporter};

/// A candidate for extending the unwinding: an input edge and the
/// unwinding instances to use as its children.
#[derive(Clone, Debug)]
pub struct Candidate {
    /// The input edge to instantiate.
    pub edge: EdgIdx,
    /// Ordered child instances.
    pub children: Vec<NodIdx>,
}

/// A counterexample: a derivation tree whose nodes carry model points.
#[derive(Clone, Debug)]
pub struct Counterexample {
    /// The tree. Node `map`s point into the unwinding that produced it.
    pub tree: Rpfp,
    /// Root of the tree.
    pub root: NodIdx,
}

/// The main solver.
pub struct Duality<B: Backend> {
    /// The input RPFP. Read-only during a solve, annotated with the
    /// solution on success.
    input: Rpfp,
    /// The logical backend.
    backend: B,
    /// Options.
    conf: SolveConf,
    /// Event sink.
    reporter: Box<dyn Reporter>,
    /// True if the user installed their own reporter.
    custom_reporter: bool,
    /// Expansion heuristic.
    heuristic: Heuristic,
    /// The unwinding.
    unwinding: Rpfp,
    /// Outer backend session, used for feasibility and induction
    /// checkers. Frames are pushed and popped around every query.
    session: Option<B::Session>,
    /// Unexpanded instances, by number (older first).
    unexpanded: BTreeMap<i64, NodIdx>,
    /// Extension candidates. FIFO, except depth-first expansions which
    /// push to the front.
    candidates: VecDeque<Candidate>,
    /// Candidates postponed by depth-first expansion.
    postponed: VecDeque<Candidate>,
    /// Frontier nodes to try to expand.
    to_expand: VecDeque<NodIdx>,
    /// Input edges indexed by each distinct child node.
    edges_by_child: NodHMap<Vec<EdgIdx>>,
    /// Expanded instances per input node.
    insts_of_node: NodHMap<Vec<NodIdx>>,
    /// All instances per input node.
    all_of_node: NodHMap<Vec<NodIdx>>,
    /// The proposed inductive subset.
    indset: Covering,
    /// Current counterexample, either learned or produced.
    cex: Option<Counterexample>,
    /// Input nodes whose instances' annotations changed since the last
    /// induction-failure sweep.
    updated_nodes: NodSet,
    /// Underapproximation nodes, mapped to the nodes they approximate.
    underapprox_map: NodHMap<NodIdx>,
    /// Placeholder leaves created by stratified inlining.
    overapproxes: NodSet,
    /// Input node to its initial unwinding leaf.
    leaf_map: NodHMap<NodIdx>,
    /// Input node to its stratified leaf.
    stratified_leaf_map: NodHMap<NodIdx>,
    /// Next (negative) stratified-leaf number.
    stratified_leaf_count: i64,
    /// Topological rank of the input nodes over the spanning outgoing
    /// edges.
    topo: NodHMap<usize>,
    /// Back-edge traversal counters per instance.
    back_edges: NodHMap<NodHMap<usize>>,
    /// Initial unwinding leaves, in creation order.
    leaves: Vec<NodIdx>,
    /// Decisions spent by the last upper-bound proof.
    last_decisions: usize,
    /// Best-effort cancellation flag.
    cancelled: AtomicBool,
    /// Profiler.
    _profiler: Profiler,
}

impl<B: Backend> Duality<B> {
    /// Constructor.
    pub fn new(rpfp: Rpfp, backend: B) -> Self {
        Duality {
            input: rpfp,
            backend,
            conf: SolveConf::new(),
            reporter: Box::new(NullReporter),
            custom_reporter: false,
            heuristic: Heuristic::new(),
            unwinding: Rpfp::new(),
            session: None,
            unexpanded: BTreeMap::new(),
            candidates: VecDeque::new(),
            postponed: VecDeque::new(),
            to_expand: VecDeque::new(),
            edges_by_child: NodHMap::new(),
            insts_of_node: NodHMap::new(),
            all_of_node: NodHMap::new(),
            indset: Covering::new(),
            cex: None,
            updated_nodes: NodSet::new(),
            underapprox_map: NodHMap::new(),
            overapproxes: NodSet::new(),
            leaf_map: NodHMap::new(),
            stratified_leaf_map: NodHMap::new(),
            stratified_leaf_count: -1,
            topo: NodHMap::new(),
            back_edges: NodHMap::new(),
            leaves: Vec::new(),
            last_decisions: 0,
            cancelled: AtomicBool::new(false),
            _profiler: Profiler::new(),
        }
    }

    /// Sets an option. False if the option is unknown or the value does
    /// not parse.
    pub fn set_option(&mut self, opt: &str, val: &str) -> bool {
        self.conf.set(opt, val)
    }

    /// Installs a custom event sink.
    pub fn set_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporter = reporter;
        self.custom_reporter = true
    }

    /// Seeds the replay heuristic of the next solve with a previous
    /// counterexample.
    pub fn learn_from(&mut self, cex: Counterexample) {
        self.cex = Some(cex)
    }

    /// The counterexample of the last refutation, if any. Ownership
    /// transfers to the caller; an unretrieved counterexample is dropped
    /// by the next solve.
    pub fn counterexample(&mut self) -> Option<Counterexample> {
        self.cex.take()
    }

    /// Requests cancellation (best-effort): the main loop bails out with
    /// [`ErrorKind::Cancelled`](../errors/enum.ErrorKind.html) at its
    /// next iteration.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst)
    }

    /// The input RPFP. After a successful solve, its annotations form
    /// the solution.
    pub fn rpfp(&self) -> &Rpfp {
        &self.input
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Solves the problem. True means the input is annotated with an
    /// inductive solution; false means a counterexample is available.
    pub fn solve(&mut self) -> Res<bool> {
        self.reset();
        if self.conf.report && !self.custom_reporter {
            self.reporter = Box::new(StreamReporter::new())
        }
        self.heuristic = match self.cex.take() {
            // the heuristic now owns the counterexample
            Some(old) => Heuristic::replay(old, self.conf.replay_marker.clone()),
            None if self.conf.localize_conjectures => Heuristic::local(),
            None => Heuristic::new(),
        };
        self.session = Some(self.backend.session()?);
        self.create_edges_by_child();
        self.create_leaves()?;
        if !self.conf.stratified_inlining {
            if self.conf.feasible_edges {
                self.nullary_candidates()
            } else {
                self.instantiate_all_edges()?
            }
        }
        profile! { self tick "solve main" }
        let res = self.solve_main();
        profile! { self mark "solve main" }
        let res = res?;
        if let Some(session) = &self.session {
            if session.scope_level() != 0 {
                bail!(crate::errors::internal(
                    "outer session scope out of balance"
                ))
            }
        }
        if conf.stats {
            self._profiler.print()
        }
        Ok(res)
    }

    /// Clears all per-solve state. The input, options and a learned
    /// counterexample survive.
    fn reset(&mut self) {
        self.unwinding = Rpfp::new();
        self.session = None;
        self.unexpanded.clear();
        self.candidates.clear();
        self.postponed.clear();
        self.to_expand.clear();
        self.edges_by_child.clear();
        self.insts_of_node.clear();
        self.all_of_node.clear();
        self.indset = Covering::new();
        self.updated_nodes.clear();
        self.underapprox_map.clear();
        self.overapproxes.clear();
        self.leaf_map.clear();
        self.stratified_leaf_map.clear();
        self.stratified_leaf_count = -1;
        self.topo.clear();
        self.back_edges.clear();
        self.leaves.clear();
        self.last_decisions = 0;
        self.cancelled.store(false, Ordering::SeqCst);
        self._profiler = Profiler::new()
    }

    /// Reports a backend `unknown`, which is conservatively treated as
    /// sat.
    pub(crate) fn note_unknown(&mut self) {
        self.reporter.message("backend-unknown")
    }

    /// The main loop: produce candidates, keep the feasible ones, extend
    /// the unwinding until either no candidate remains (solved) or an
    /// extension is refuted (counterexample).
    fn solve_main(&mut self) -> Res<bool> {
        if self.conf.stratified_inlining && !self.do_stratified_inlining()? {
            return Ok(false);
        }
        self.do_topo_sort();
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                bail!(ErrorKind::Cancelled)
            }
            profile! { self tick "produce candidates" }
            let produced = self.produce_candidates_for_extension();
            profile! { self mark "produce candidates" }
            produced?;
            let cand = match self.candidates.pop_front() {
                Some(cand) => cand,
                None => {
                    self.gen_solution_from_indset()?;
                    return Ok(true);
                }
            };
            if self.candidate_feasible(&cand)? && !self.extend(cand)? {
                return Ok(false);
            }
        }
    }

    // |===| Initialization.

    /// Indexes the input edges by each distinct child node.
    fn create_edges_by_child(&mut self) {
        self.edges_by_child.clear();
        for (edge, e) in self.input.edges() {
            let mut done = NodSet::new();
            for child in &e.children {
                if done.insert(*child) {
                    self.edges_by_child.entry(*child).or_default().push(edge)
                }
            }
        }
    }

    /// Creates one unwinding leaf per input node. The leaves
    /// under-approximate each relation with false (or over-approximate
    /// with true under stratified inlining).
    fn create_leaves(&mut self) -> Res<()> {
        self.unexpanded.clear();
        self.leaves.clear();
        for input in self.input.node_indices() {
            let node = self.create_node_instance(input, None);
            if self.conf.stratified_inlining {
                self.make_overapprox(node);
                self.leaf_map.insert(input, node);
            } else {
                self.make_leaf(node, false)?
            }
            self.leaves.push(node)
        }
        Ok(())
    }

    /// Seeds the candidate queue with the nullary input edges.
    fn nullary_candidates(&mut self) {
        for (edge, e) in self.input.edges() {
            if e.children.is_empty() && !e.is_lower_bound() {
                self.candidates.push_back(Candidate {
                    edge,
                    children: Vec::new(),
                })
            }
        }
    }

    /// Instantiates every input edge once against the initial leaves.
    /// Used when infeasible edges are kept.
    fn instantiate_all_edges(&mut self) -> Res<()> {
        let mut leaf_map = NodHMap::new();
        for leaf in self.leaves.clone() {
            if let Some(map) = self.unwinding.node(leaf).map {
                leaf_map.insert(map, leaf);
                self.insts_of_node.entry(map).or_default().push(leaf);
            }
        }
        self.unexpanded.clear();
        for edge in self.input.edge_indices() {
            let mut children = Vec::new();
            for child in &self.input.edge(edge).children {
                match leaf_map.get(child) {
                    Some(leaf) => children.push(*leaf),
                    None => bail!(crate::errors::internal("input child without a leaf")),
                }
            }
            let _ = self.extend(Candidate { edge, children })?;
        }
        for (_, node) in self.unexpanded.clone() {
            let mut cx = cover_cx!(self);
            self.indset.add(&mut cx, node)
        }
        for leaf in self.leaves.clone() {
            if let Some(map) = self.unwinding.node(leaf).map {
                if let Some(insts) = self.insts_of_node.get_mut(&map) {
                    if !insts.is_empty() {
                        insts.remove(0);
                    }
                }
            }
        }
        Ok(())
    }

    // |===| Unwinding operations.

    /// Creates an instance of an input node. The annotation starts full
    /// and the instance is unexpanded.
    fn create_node_instance(&mut self, input: NodIdx, number: Option<i64>) -> NodIdx {
        let src = self.input.node(input).clone();
        let inst = self.unwinding.clone_node(&src, input);
        self.unwinding.node_mut(inst).annotation.set_full();
        if let Some(number) = number {
            if number < 0 {
                self.unwinding.set_number(inst, number)
            }
        }
        self.unexpanded
            .insert(self.unwinding.node(inst).number, inst);
        self.all_of_node.entry(input).or_default().push(inst);
        inst
    }

    /// Creates an instance of an input edge with the given parent and
    /// children.
    fn create_edge_instance(
        &mut self,
        edge: EdgIdx,
        parent: NodIdx,
        children: Vec<NodIdx>,
    ) -> Res<EdgIdx> {
        let fml = match self.input.edge(edge).fml() {
            Some(fml) => fml.clone(),
            None => bail!(crate::errors::internal("instantiating a lower-bound edge")),
        };
        Ok(self.unwinding.create_edge(parent, fml, children, Some(edge)))
    }

    /// Makes an instance a leaf: empty annotation, lower-bound edge.
    fn make_leaf(&mut self, node: NodIdx, do_not_expand: bool) -> Res<()> {
        self.unwinding.node_mut(node).annotation.set_empty();
        let _edge = self.unwinding.create_lower_bound_edge(node);
        if self.conf.stratified_inlining {
            // allow this node to cover others
            self.unwinding.node_mut(node).annotation.set_full()
        } else if let Some(map) = self.unwinding.node(node).map {
            self.updated_nodes.insert(map);
        }
        self.reporter.extend(&self.unwinding, node);
        if !do_not_expand {
            self.try_expand_node(node)?
        }
        Ok(())
    }

    /// Makes an instance a placeholder leaf for stratified inlining:
    /// full annotation, lower-bound edge.
    fn make_overapprox(&mut self, node: NodIdx) {
        self.unwinding.node_mut(node).annotation.set_full();
        let _edge = self.unwinding.create_lower_bound_edge(node);
        self.overapproxes.insert(node);
    }

    // |===| Candidate generation.

    /// True if stratified inlining already produced this extension.
    fn produced_by_si(&self, edge: EdgIdx, children: &[NodIdx]) -> bool {
        let parent = self.input.edge(edge).parent;
        let other = match self.leaf_map.get(&parent) {
            Some(other) => *other,
            None => return false,
        };
        let out = match self.unwinding.node(other).outgoing {
            Some(out) => out,
            None => return false,
        };
        if self.unwinding.edge(out).map != Some(edge) {
            return false;
        }
        self.unwinding.edge(out).children == children
    }

    /// Queues a candidate, unless stratified inlining already produced
    /// it.
    fn add_candidate(&mut self, edge: EdgIdx, children: Vec<NodIdx>) {
        if self.conf.stratified_inlining && self.produced_by_si(edge, &children) {
            return;
        }
        self.candidates.push_back(Candidate { edge, children })
    }

    /// Cross product of the candidate sets of each argument position.
    fn gen_candidates(&mut self, edge: EdgIdx, vec: Vec<Vec<NodIdx>>) {
        let mut children = vec![NodIdx::zero(); vec.len()];
        self.gen_candidates_rec(0, edge, &vec, &mut children)
    }
    fn gen_candidates_rec(
        &mut self,
        pos: usize,
        edge: EdgIdx,
        vec: &[Vec<NodIdx>],
        children: &mut Vec<NodIdx>,
    ) {
        if pos == vec.len() {
            let children = children.clone();
            self.add_candidate(edge, children)
        } else {
            for inst in &vec[pos] {
                children[pos] = *inst;
                let mut children = children.clone();
                self.gen_candidates_rec(pos + 1, edge, vec, &mut children)
            }
        }
    }

    /// Expands a node, producing extension candidates.
    fn expand_node(&mut self, node: NodIdx) -> Res<()> {
        if self.conf.eager_expand {
            self.expand_node_eager(node)
        } else {
            self.expand_node_induction(node)
        }
    }

    /// Eager expansion: enumerate the cross product of candidate sibling
    /// instances for every input edge using this node.
    ///
    /// A node may be used at several argument positions of an edge;
    /// duplicates are avoided by fixing the node at one position at a
    /// time and only re-using it at *earlier* positions.
    fn expand_node_eager(&mut self, node: NodIdx) -> Res<()> {
        let map = match self.unwinding.node(node).map {
            Some(map) => map,
            None => bail!(crate::errors::internal("instance without an input map")),
        };
        for edge in self.edges_by_child.get(&map).cloned().unwrap_or_default() {
            let echildren = self.input.edge(edge).children.clone();
            for npos in 0..echildren.len() {
                if echildren[npos] != map {
                    continue;
                }
                let mut vec: Vec<Vec<NodIdx>> = vec![Vec::new(); echildren.len()];
                vec[npos].push(node);
                for (j, child) in echildren.iter().enumerate() {
                    if j != npos {
                        for inst in self.insts_of_node.get(child).cloned().unwrap_or_default() {
                            if self.indset.candidate(&self.unwinding, inst) {
                                vec[j].push(inst)
                            }
                        }
                    }
                    if j < npos && *child == map {
                        vec[j].push(node)
                    }
                }
                self.gen_candidates(edge, vec)
            }
        }
        self.unexpanded.remove(&self.unwinding.node(node).number);
        self.insts_of_node.entry(map).or_default().push(node);
        Ok(())
    }

    /// Induction-failure expansion: for every input edge using this
    /// node, build a small checker constrained so that the current
    /// solution is not inductive along the edge *using the new
    /// instance*, and extract a candidate from the countermodel.
    fn expand_node_induction(&mut self, node: NodIdx) -> Res<()> {
        let map = match self.unwinding.node(node).map {
            Some(map) => map,
            None => bail!(crate::errors::internal("instance without an input map")),
        };
        self.unexpanded.remove(&self.unwinding.node(node).number);
        self.insts_of_node.entry(map).or_default().push(node);
        profile! { self tick "gen cand ind fail using" }
        let number = self.unwinding.node(node).number;
        for edge in self.edges_by_child.get(&map).cloned().unwrap_or_default() {
            let mut sess = self.take_session()?;
            let res = self.induction_expand_one(&mut sess, edge, number);
            self.session = Some(sess);
            res?
        }
        profile! { self mark "gen cand ind fail using" }
        Ok(())
    }

    /// One induction-failure query for one edge, in a fresh frame.
    fn induction_expand_one(
        &mut self,
        sess: &mut B::Session,
        edge: EdgIdx,
        number: i64,
    ) -> Res<()> {
        sess.push()?;
        let res: Res<()> = (|| {
            let mut checker = Rpfp::new();
            let root = match self.checker_for_edge(sess, &mut checker, edge, true, true)? {
                Some(root) => root,
                None => return Ok(()),
            };
            // the countermodel must actually use the new instance
            sess.assert_constraint(&checker, root, &term::mark(number))?;
            if sess.check(&checker, root, None)? != Check::Unsat {
                let candidate = self.extract_candidate_from_cex(sess, &checker, edge, root)?;
                self.reporter.induction_failure(
                    &self.input,
                    edge,
                    &self.unwinding,
                    &candidate.children,
                );
                self.candidates.push_back(candidate)
            }
            Ok(())
        })();
        let popped = sess.pop(1);
        res.and(popped)
    }

    /// Clones the incoming edges of `other` with `other` replaced by
    /// `node`, pushing the candidates to the *front* of the queue
    /// (depth-first).
    fn expand_node_from_other(&mut self, node: NodIdx, other: NodIdx) {
        for edge in self.unwinding.node(other).incoming.clone() {
            let e = self.unwinding.edge(edge);
            let input_edge = match e.map {
                Some(input_edge) => input_edge,
                None => continue,
            };
            let mut children = e.children.clone();
            for child in &mut children {
                if *child == other {
                    *child = node
                }
            }
            self.candidates.push_front(Candidate {
                edge: input_edge,
                children,
            })
        }
    }

    /// Expands a node based on some uncovered node it dominates. The
    /// candidates go to the front of the queue, so these expansions are
    /// done depth-first.
    fn expand_node_from_cover_fail(&mut self, node: NodIdx) -> Res<bool> {
        match self.unwinding.node(node).outgoing {
            Some(out) if !self.unwinding.edge(out).children.is_empty() => (),
            _ => return Ok(false),
        }
        let other = {
            let cx = cover_cx!(self);
            match self.indset.get_similar_node(&cx, node) {
                Some(other) => other,
                None => return Ok(false),
            }
        };
        if self.conf.use_underapprox {
            let under = self.create_underapprox_node(node)?;
            self.underapprox_map.insert(under, node);
            {
                let mut cx = cover_cx!(self);
                let _ = self.indset.cover_by_node(&mut cx, node, under)?;
            }
            self.expand_node_from_other(under, other);
            self.expand_node(under)?
        } else {
            self.expand_node_from_other(node, other);
            self.unexpanded.remove(&self.unwinding.node(node).number);
            if let Some(map) = self.unwinding.node(node).map {
                self.insts_of_node.entry(map).or_default().push(node)
            }
        }
        Ok(true)
    }

    /// Creates an underapproximation node standing for `node` at the
    /// expansion frontier: a fresh leaf instance with a full annotation,
    /// inheriting the back-edge counters.
    fn create_underapprox_node(&mut self, node: NodIdx) -> Res<NodIdx> {
        let map = match self.unwinding.node(node).map {
            Some(map) => map,
            None => bail!(crate::errors::internal("instance without an input map")),
        };
        let under = self.create_node_instance(map, None);
        let _edge = self.unwinding.create_lower_bound_edge(under);
        // full annotation, so it can cover others
        self.unwinding.node_mut(under).annotation.set_full();
        if let Some(backs) = self.back_edges.get(&node).cloned() {
            self.back_edges.insert(under, backs);
        }
        self.reporter.extend(&self.unwinding, under);
        Ok(under)
    }

    /// Tries to expand a frontier node: close it, force-cover it by
    /// conjecture, expand from a cover failure, or expand it plainly.
    fn try_expand_node(&mut self, node: NodIdx) -> Res<()> {
        {
            let mut cx = cover_cx!(self);
            if self.indset.close(&mut cx, node)? {
                return Ok(());
            }
        }
        if !self.conf.no_conj && self.conjecture(node)? {
            if self.conf.use_underapprox && self.indset.contains(&self.unwinding, node) {
                // keeps the loop finite when the node is covered by
                // multiple others; goes away once covering by a set is
                // the only mode
                self.unexpanded.remove(&self.unwinding.node(node).number);
                if let Some(map) = self.unwinding.node(node).map {
                    self.insts_of_node.entry(map).or_default().push(node)
                }
            }
            return Ok(());
        }
        if self.conf.use_underapprox && !self.indset.contains(&self.unwinding, node) {
            // could be covered by an underapproximation node
            return Ok(());
        }
        {
            let mut cx = cover_cx!(self);
            self.indset.add(&mut cx, node);
        }
        if !self.conf.use_underapprox && self.expand_node_from_cover_fail(node)? {
            return Ok(());
        }
        self.expand_node(node)
    }

    // |===| Solution extraction and marker encodings.

    /// Union of the annotations of a node's inductive instances.
    fn gen_node_solution_from_indset(&self, input: NodIdx) -> Res<Transformer> {
        let mut annot = Transformer::empty();
        for inst in self.insts_of_node.get(&input).cloned().unwrap_or_default() {
            if self.indset.contains(&self.unwinding, inst) {
                annot.union_with(&self.unwinding.node(inst).annotation)
            }
        }
        annot.simplify();
        Ok(annot)
    }

    /// Writes the proposed solution into the input annotations.
    fn gen_solution_from_indset(&mut self) -> Res<()> {
        for input in self.input.node_indices() {
            let annot = self.gen_node_solution_from_indset(input)?;
            self.input.node_mut(input).annotation = annot
        }
        Ok(())
    }

    /// Marker encoding of a node's solution: the conjunction over
    /// inductive instances of `marker ⇒ annotation`, plus the
    /// disjunction of the markers. Instances past the recursion bound
    /// have their marker forced to false.
    ///
    /// Also returns whether any instance contributed.
    fn gen_node_solution_with_markers(
        &self,
        input: NodIdx,
        expanded_only: bool,
    ) -> Res<(bool, Transformer)> {
        let insts = if expanded_only {
            self.insts_of_node.get(&input).cloned().unwrap_or_default()
        } else {
            self.all_of_node.get(&input).cloned().unwrap_or_default()
        };
        let mut annot = Transformer::full();
        let mut markers = term::fls();
        let mut any = false;
        for inst in insts {
            if !self.indset.contains(&self.unwinding, inst) {
                continue;
            }
            let marker = term::mark(self.unwinding.node(inst).number);
            if self.node_past_recursion_bound(inst) {
                annot.intersect_term(term::not(marker));
                continue;
            }
            annot.intersect_term(term::implies(
                marker.clone(),
                self.unwinding.node(inst).annotation.term().clone(),
            ));
            markers = term::or(vec![markers, marker]);
            any = true
        }
        annot.intersect_term(markers);
        annot.simplify();
        Ok((any, annot))
    }

    /// Builds a checker for one input edge in the given (empty) graph:
    /// a cloned parent bounded by the current solution, and cloned
    /// children carrying the marker encodings of their solutions.
    ///
    /// Yields the root, or `None` when `skip_trivial` and the query can
    /// not falsify anything.
    fn checker_for_edge(
        &mut self,
        sess: &mut B::Session,
        checker: &mut Rpfp,
        edge: EdgIdx,
        expanded_only: bool,
        skip_trivial: bool,
    ) -> Res<Option<NodIdx>> {
        let parent = self.input.edge(edge).parent;
        let root = {
            let src = self.input.node(parent).clone();
            checker.clone_node(&src, parent)
        };
        checker.node_mut(root).bound = self.gen_node_solution_from_indset(parent)?;
        if skip_trivial && checker.node(root).bound.is_full() {
            return Ok(None);
        }
        sess.assert_node(checker, root)?;
        let echildren = self.input.edge(edge).children.clone();
        let mut children = Vec::with_capacity(echildren.len());
        for oc in echildren {
            let nc = {
                let src = self.input.node(oc).clone();
                checker.clone_node(&src, oc)
            };
            let (any, annot) = self.gen_node_solution_with_markers(oc, expanded_only)?;
            if skip_trivial && !any {
                return Ok(None);
            }
            checker.node_mut(nc).annotation = annot;
            let lb = checker.create_lower_bound_edge(nc);
            sess.assert_edge(checker, lb, false)?;
            children.push(nc)
        }
        let fml = match self.input.edge(edge).fml() {
            Some(fml) => fml.clone(),
            None => bail!(crate::errors::internal("checker over a lower-bound edge")),
        };
        let e = checker.create_edge(root, fml, children, Some(edge));
        sess.assert_edge(checker, e, false)?;
        Ok(Some(root))
    }

    /// Extracts an extension candidate from a checker countermodel: for
    /// each child position, the first inductive instance whose marker is
    /// true (or any, if the child is unused).
    fn extract_candidate_from_cex(
        &mut self,
        sess: &mut B::Session,
        checker: &Rpfp,
        edge: EdgIdx,
        root: NodIdx,
    ) -> Res<Candidate> {
        let checker_children = checker.out_children(root);
        let echildren = self.input.edge(edge).children.clone();
        let mut children = Vec::with_capacity(echildren.len());
        for (pos, oc) in echildren.into_iter().enumerate() {
            let checker_child = checker_children[pos];
            let empty = sess.empty(checker, checker_child);
            let mut found = None;
            for inst in self.insts_of_node.get(&oc).cloned().unwrap_or_default() {
                if !self.indset.contains(&self.unwinding, inst) {
                    continue;
                }
                let marker = term::mark(self.unwinding.node(inst).number);
                if empty || sess.eval_bool(checker, checker_child, &marker)? == Some(true) {
                    found = Some(inst);
                    break;
                }
            }
            match found {
                Some(inst) => children.push(inst),
                None => bail!(crate::errors::internal(
                    "no candidate from induction failure"
                )),
            }
        }
        Ok(Candidate { edge, children })
    }

    /// Candidates from the induction failures of the current solution.
    /// Incremental (only edges whose parent was updated), then full
    /// scan if nothing came out.
    fn gen_candidates_from_induction_failure(&mut self, full_scan: bool) -> Res<()> {
        profile! { self tick "gen cand ind fail" }
        for edge in self.input.edge_indices() {
            let parent = self.input.edge(edge).parent;
            if !full_scan && !self.updated_nodes.contains(&parent) {
                continue;
            }
            let mut sess = self.take_session()?;
            let res = self.induction_failure_one(&mut sess, edge);
            self.session = Some(sess);
            res?
        }
        self.updated_nodes.clear();
        profile! { self mark "gen cand ind fail" }
        if !full_scan && self.candidates.is_empty() {
            self.reporter
                .message("No candidates from updates. Trying full scan.");
            self.gen_candidates_from_induction_failure(true)?
        }
        Ok(())
    }

    /// One induction-failure query, in a fresh frame.
    fn induction_failure_one(&mut self, sess: &mut B::Session, edge: EdgIdx) -> Res<()> {
        sess.push()?;
        let res: Res<()> = (|| {
            let mut checker = Rpfp::new();
            let root = match self.checker_for_edge(sess, &mut checker, edge, true, false)? {
                Some(root) => root,
                None => return Ok(()),
            };
            if sess.check(&checker, root, None)? != Check::Unsat {
                let candidate = self.extract_candidate_from_cex(sess, &checker, edge, root)?;
                self.reporter.induction_failure(
                    &self.input,
                    edge,
                    &self.unwinding,
                    &candidate.children,
                );
                self.candidates.push_back(candidate)
            }
            Ok(())
        })();
        let popped = sess.pop(1);
        res.and(popped)
    }

    /// Frontier nodes worth expanding.
    fn find_nodes_to_expand(&mut self) {
        for (_, node) in self.unexpanded.clone() {
            if self.indset.candidate(&self.unwinding, node) {
                self.to_expand.push_back(node)
            }
        }
    }

    /// Expands frontier nodes until some candidate shows up.
    fn produce_some_candidates(&mut self) -> Res<()> {
        while self.candidates.is_empty() {
            let node = match self.to_expand.pop_front() {
                Some(node) => node,
                None => break,
            };
            self.try_expand_node(node)?
        }
        Ok(())
    }

    /// Produces extension candidates: first from the frontier, then from
    /// induction failures (one at a time, depth-first).
    fn produce_candidates_for_extension(&mut self) -> Res<()> {
        if self.candidates.is_empty() {
            self.produce_some_candidates()?
        }
        while self.candidates.is_empty() {
            self.find_nodes_to_expand();
            if self.to_expand.is_empty() {
                break;
            }
            self.produce_some_candidates()?
        }
        if self.candidates.is_empty() {
            if self.postponed.is_empty() {
                self.gen_candidates_from_induction_failure(false)?;
                std::mem::swap(&mut self.postponed, &mut self.candidates)
            }
            if let Some(cand) = self.postponed.pop_front() {
                self.candidates.push_back(cand)
            }
        }
        Ok(())
    }

    // |===| Feasibility and bounded recursion.

    /// True if some back-edge counter of the instance exceeds the
    /// recursion bound.
    fn node_past_recursion_bound(&self, node: NodIdx) -> bool {
        let bound = match self.conf.recursion_bound {
            Some(bound) => bound,
            None => return false,
        };
        match self.back_edges.get(&node) {
            Some(backs) => backs.values().any(|count| *count > bound),
            None => false,
        }
    }

    /// Propagates the back-edge counters to a freshly extended instance:
    /// pointwise max over the children, incremented on back edges.
    fn update_back_edges(&mut self, node: NodIdx) {
        if self.conf.recursion_bound.is_none() {
            return;
        }
        let children = self.unwinding.out_children(node);
        let pmap = self.unwinding.node(node).map;
        let mut counters: NodHMap<usize> = NodHMap::new();
        for child in children {
            let cmap = self.unwinding.node(child).map;
            let is_back = match (cmap, pmap) {
                (Some(cmap), Some(pmap)) => {
                    self.topo.get(&cmap).cloned().unwrap_or(0)
                        >= self.topo.get(&pmap).cloned().unwrap_or(0)
                }
                _ => false,
            };
            let mut chv = self.back_edges.get(&child).cloned().unwrap_or_default();
            if is_back {
                if let Some(cmap) = cmap {
                    *chv.entry(cmap).or_insert(0) += 1
                }
            }
            for (back, count) in chv {
                let entry = counters.entry(back).or_insert(0);
                *entry = std::cmp::max(*entry, count)
            }
        }
        self.back_edges.insert(node, counters);
    }

    /// Tests whether a candidate can produce anything outside the
    /// current solution. Candidates past the recursion bound or refuted
    /// by the checker are rejected.
    fn candidate_feasible(&mut self, cand: &Candidate) -> Res<bool> {
        if !self.conf.feasible_edges {
            return Ok(true);
        }
        profile! { self tick "candidate feasible" }
        for child in &cand.children {
            if self.node_past_recursion_bound(*child) {
                self.reporter
                    .reject(&self.input, cand.edge, &self.unwinding, &cand.children);
                profile! { self mark "candidate feasible" }
                return Ok(false);
            }
        }
        let mut sess = self.take_session()?;
        let res = self.feasible_inner(&mut sess, cand);
        self.session = Some(sess);
        profile! { self mark "candidate feasible" }
        let res = res?;
        if !res {
            self.reporter
                .reject(&self.input, cand.edge, &self.unwinding, &cand.children)
        }
        Ok(res)
    }

    /// The feasibility query proper, in a fresh frame.
    fn feasible_inner(&mut self, sess: &mut B::Session, cand: &Candidate) -> Res<bool> {
        sess.push()?;
        let res: Res<bool> = (|| {
            let mut checker = Rpfp::new();
            let parent = self.input.edge(cand.edge).parent;
            let root = {
                let src = self.input.node(parent).clone();
                checker.clone_node(&src, parent)
            };
            checker.node_mut(root).bound = self.gen_node_solution_from_indset(parent)?;
            sess.assert_node(&checker, root)?;
            let mut children = Vec::with_capacity(cand.children.len());
            for child in &cand.children {
                let src = self.unwinding.node(*child).clone();
                children.push(checker.clone_node(&src, *child))
            }
            let fml = match self.input.edge(cand.edge).fml() {
                Some(fml) => fml.clone(),
                None => bail!(crate::errors::internal("feasibility of a lower-bound edge")),
            };
            let e = checker.create_edge(root, fml, children, Some(cand.edge));
            sess.assert_edge(&checker, e, true)?;
            Ok(sess.check(&checker, root, None)? != Check::Unsat)
        })();
        let popped = sess.pop(1);
        match popped {
            Ok(()) => res,
            Err(e) => res.and(Err(e)),
        }
    }

    /// Takes the outer session out for a bracketed query.
    fn take_session(&mut self) -> Res<B::Session> {
        self.session
            .take()
            .ok_or_else(|| crate::errors::internal("no outer session"))
    }

    // |===| Stratified inlining.

    /// Topological order over the spanning outgoing edges, tolerating
    /// back edges: nodes are numbered before visiting their children
    /// (to break cycles) and renumbered after.
    fn do_topo_sort(&mut self) {
        self.topo.clear();
        let mut counter = 0;
        for node in self.input.node_indices() {
            self.topo_rec(node, &mut counter)
        }
    }
    fn topo_rec(&mut self, node: NodIdx, counter: &mut usize) {
        if self.topo.contains_key(&node) {
            return;
        }
        self.topo.insert(node, *counter);
        *counter += 1;
        if let Some(out) = self.input.node(node).outgoing {
            for child in self.input.edge(out).children.clone() {
                self.topo_rec(child, counter)
            }
        }
        self.topo.insert(node, *counter);
        *counter += 1;
    }

    /// Builds the unwinding bottom-up, trying to satisfy each leaf's
    /// bound before the general unwinding starts. A refutation here is
    /// final.
    fn do_stratified_inlining(&mut self) -> Res<bool> {
        profile! { self tick "stratified inlining" }
        self.do_topo_sort();
        let mut refuted = false;
        for leaf in self.leaves.clone() {
            if !self.satisfy_upper_bound(leaf)? {
                refuted = true;
                break;
            }
        }
        if !refuted {
            // don't leave any dangling nodes
            for leaf in self.leaves.clone() {
                if self.unwinding.node(leaf).outgoing.is_none() {
                    self.make_leaf(leaf, true)?
                }
            }
        }
        profile! { self mark "stratified inlining" }
        Ok(!refuted)
    }

    /// Lazily materializes a node's outgoing edge during stratified
    /// inlining. A one-shot transition: placeholder leaves become real
    /// expansions, with fresh (negative-numbered, dominated) stratified
    /// leaves for the children of larger rank.
    pub(crate) fn get_node_outgoing(&mut self, node: NodIdx) -> Res<EdgIdx> {
        if !self.overapproxes.remove(&node) {
            // already expanded
            return self
                .unwinding
                .node(node)
                .outgoing
                .ok_or_else(|| crate::errors::internal("instance without an outgoing edge"));
        }
        let map = match self.unwinding.node(node).map {
            Some(map) => map,
            None => bail!(crate::errors::internal("instance without an input map")),
        };
        let input_edge = match self.input.node(map).outgoing {
            Some(edge) => edge,
            None => bail!(crate::errors::internal(
                "stratified expansion of an input leaf"
            )),
        };
        let echildren = self.input.edge(input_edge).children.clone();
        let rank = self.topo.get(&map).cloned().unwrap_or(0);

        // make sure we don't create a covered node in this process
        for child in &echildren {
            if self.topo.get(child).cloned().unwrap_or(0) < rank {
                if let Some(leaf) = self.leaf_map.get(child) {
                    if !self.indset.contains(&self.unwinding, *leaf) {
                        return self.unwinding.node(node).outgoing.ok_or_else(|| {
                            crate::errors::internal("instance without an outgoing edge")
                        });
                    }
                }
            }
        }

        let mut children = Vec::with_capacity(echildren.len());
        for child in echildren {
            if self.topo.get(&child).cloned().unwrap_or(0) < rank {
                let leaf = match self.leaf_map.get(&child) {
                    Some(leaf) => *leaf,
                    None => bail!(crate::errors::internal("input child without a leaf")),
                };
                children.push(leaf);
                let number = self.unwinding.node(leaf).number;
                if self.unexpanded.remove(&number).is_some() {
                    self.insts_of_node.entry(child).or_default().push(leaf)
                }
            } else {
                let strat = match self.stratified_leaf_map.get(&child) {
                    Some(strat) => *strat,
                    None => {
                        let number = self.stratified_leaf_count;
                        self.stratified_leaf_count -= 1;
                        let fresh = self.create_node_instance(child, Some(number));
                        self.make_leaf(fresh, false)?;
                        self.unwinding.node_mut(fresh).annotation.set_empty();
                        self.stratified_leaf_map.insert(child, fresh);
                        self.indset.set_dominated(fresh);
                        fresh
                    }
                };
                children.push(strat)
            }
        }
        // the placeholder lower-bound edge gives way to the real edge
        if let Some(old) = self.unwinding.node(node).outgoing {
            if self.unwinding.edge(old).is_lower_bound() {
                self.unwinding.remove_edge(old)
            }
        }
        let edge = self.create_edge_instance(input_edge, node, children)?;
        self.reporter.extend(&self.unwinding, node);
        Ok(edge)
    }

    // |===| Upper-bound proofs.

    /// Updates an unwinding node with a tree node's annotation if it
    /// does not subsume it already.
    pub(crate) fn update_node_to_node(
        &mut self,
        unode: NodIdx,
        tree: &Rpfp,
        tnode: NodIdx,
    ) -> Res<bool> {
        let t_annot = tree.node(tnode).annotation.clone();
        let subset = {
            let un = self.unwinding.node(unode);
            self.backend.subset_eq(&un.annotation, &t_annot, &un.sig)?
        };
        if subset {
            return Ok(false);
        }
        self.reporter.update(&self.unwinding, unode, &t_annot);
        {
            let mut cx = cover_cx!(self);
            self.indset.update(&mut cx, unode);
        }
        if let Some(input) = self.unwinding.node(unode).map {
            self.updated_nodes.insert(input);
        }
        self.unwinding
            .node_mut(unode)
            .annotation
            .intersect_with(&t_annot);
        Ok(true)
    }

    /// Propagates a refuted tree's interpolants back into the unwinding.
    fn update_with_interpolant(&mut self, unode: NodIdx, tree: &Rpfp, tnode: NodIdx) -> Res<()> {
        for tchild in tree.out_children(tnode) {
            if let Some(uchild) = tree.node(tchild).map {
                self.update_with_interpolant(uchild, tree, tchild)?
            }
        }
        let _ = self.update_node_to_node(unode, tree, tnode)?;
        if let Some(input) = self.unwinding.node(unode).map {
            self.heuristic.update(input)
        }
        Ok(())
    }

    /// Propagates a counterexample tree's underapproximations back into
    /// the unwinding.
    fn update_with_counterexample(&mut self, unode: NodIdx, tree: &Rpfp, tnode: NodIdx) -> Res<()> {
        for tchild in tree.out_children(tnode) {
            if let Some(uchild) = tree.node(tchild).map {
                self.update_with_counterexample(uchild, tree, tchild)?
            }
        }
        let t_under = tree.node(tnode).underapprox.clone();
        let subset = {
            let un = self.unwinding.node(unode);
            self.backend.subset_eq(&t_under, &un.underapprox, &un.sig)?
        };
        if !subset {
            self.reporter
                .update_underapprox(&self.unwinding, unode, &t_under);
            self.unwinding
                .node_mut(unode)
                .underapprox
                .union_with(&t_under);
            if let Some(input) = self.unwinding.node(unode).map {
                self.heuristic.update(input)
            }
        }
        Ok(())
    }

    /// Tries to update the unwinding to satisfy the upper bound of a
    /// node. True means proved; false means a counterexample is stored.
    fn satisfy_upper_bound(&mut self, node: NodIdx) -> Res<bool> {
        if self.unwinding.node(node).bound.is_full() {
            return Ok(true);
        }
        self.reporter.bound(&self.unwinding, node);
        let start = self.backend.cumulative_decisions();
        let use_underapprox = self.conf.use_underapprox;
        let dt = DerivationTreeSlow::new(self)?;
        let (sat, tree, top) = dt.derive(node, use_underapprox)?;
        self.last_decisions = self.backend.cumulative_decisions() - start;
        if sat {
            if use_underapprox {
                self.update_with_counterexample(node, &tree, top)?
            }
            self.cex = Some(Counterexample { tree, root: top });
            Ok(false)
        } else {
            self.update_with_interpolant(node, &tree, top)?;
            Ok(true)
        }
    }

    /// Tries to prove a conjectured bound for a node. The bound is
    /// tightened for the attempt and restored on failure; a
    /// counterexample from a failed attempt is returned for reuse.
    pub(crate) fn prove_conjecture(
        &mut self,
        node: NodIdx,
        bound: &Transformer,
        other: Option<NodIdx>,
    ) -> Res<(bool, Option<Counterexample>)> {
        self.reporter.conjecture(&self.unwinding, node, bound);
        profile! { self tick "prove conjecture" }
        let save = self.unwinding.node(node).bound.clone();
        self.unwinding.node_mut(node).bound.intersect_with(bound);
        if self.conf.localize_conjectures {
            self.heuristic.set_old_node(other)
        }
        let proved = self.satisfy_upper_bound(node);
        if self.conf.localize_conjectures {
            self.heuristic.set_old_node(None)
        }
        let proved = match proved {
            Ok(proved) => proved,
            Err(e) => {
                self.unwinding.node_mut(node).bound = save;
                profile! { self mark "prove conjecture" }
                return Err(e);
            }
        };
        if proved {
            profile! { self mark "prove conjecture" }
            return Ok((true, None));
        }
        if self.conf.use_underapprox && self.last_decisions > 500 {
            let _ = self.expand_node_from_cover_fail(node)?;
        }
        let cex = self.cex.take();
        self.unwinding.node_mut(node).bound = save;
        profile! { self mark "prove conjecture" }
        Ok((false, cex))
    }

    // |===| Extension.

    /// Extends the unwinding with a candidate, keeping it solved. False
    /// means the new instance's bound is refuted and the counterexample
    /// is final.
    fn extend(&mut self, cand: Candidate) -> Res<bool> {
        profile! { self tick "extend" }
        let parent = self.create_node_instance(self.input.edge(cand.edge).parent, None);
        self.create_edge_instance(cand.edge, parent, cand.children.clone())?;
        self.update_back_edges(parent);
        self.reporter.extend(&self.unwinding, parent);
        let res = self.satisfy_upper_bound(parent)?;
        if res {
            {
                let mut cx = cover_cx!(self);
                let _ = self.indset.close_descendants(&mut cx, parent)?;
            }
            self.try_expand_node(parent)?
        } else if self.conf.use_underapprox {
            self.expand_underapprox_nodes()?;
            self.build_full_cex(parent)?
        }
        profile! { self mark "extend" }
        Ok(res)
    }

    /// Rebuilds the counterexample as a complete tree, using the
    /// underapproximations as constraints.
    fn build_full_cex(&mut self, node: NodIdx) -> Res<()> {
        let use_underapprox = self.conf.use_underapprox;
        let dt = DerivationTree::new(self, None)?;
        let (sat, tree, top) = dt.derive(node, use_underapprox, true)?;
        if !sat {
            bail!(crate::errors::internal(
                "failed to rebuild a full counterexample"
            ))
        }
        self.cex = Some(Counterexample { tree, root: top });
        Ok(())
    }

    /// Expands the underapproximation nodes of the current
    /// counterexample into real subtrees.
    fn expand_underapprox_nodes(&mut self) -> Res<()> {
        let cex = match self.cex.take() {
            Some(cex) => cex,
            None => return Ok(()),
        };
        let root = cex.root;
        let tree = self.expand_underapprox_rec(cex.tree, root)?;
        self.cex = Some(Counterexample { tree, root });
        Ok(())
    }
    fn expand_underapprox_rec(&mut self, mut tree: Rpfp, node: NodIdx) -> Res<Rpfp> {
        let unode = tree.node(node).map;
        if let Some(unode) = unode {
            if let Some(orig) = self.underapprox_map.get(&unode).cloned() {
                // derive the underapproximated point for real
                let mut bound = match tree.node(node).vals {
                    Some(ref vals) => Transformer::point(vals),
                    None => Transformer::full(),
                };
                bound.complement();
                let save = self.unwinding.node(orig).bound.clone();
                self.unwinding.node_mut(orig).bound = bound;
                let use_underapprox = self.conf.use_underapprox;
                let dt = DerivationTree::new(self, Some(tree))?;
                let derived = dt.derive(orig, use_underapprox, true);
                self.unwinding.node_mut(orig).bound = save;
                let (sat, new_tree, top) = derived?;
                if !sat {
                    self.update_with_interpolant(orig, &new_tree, top)?;
                    bail!(crate::errors::internal("bogus underapprox"))
                }
                return self.expand_underapprox_rec(new_tree, top);
            }
        }
        for child in tree.out_children(node) {
            tree = self.expand_underapprox_rec(tree, child)?
        }
        Ok(tree)
    }
}
