//! The RPFP graph container.
//!
//! An [`Rpfp`] is an arena of relation nodes connected by rule edges. The
//! same type serves several roles during a solve: the read-only input
//! problem, the growing unwinding, the derivation trees, and the small
//! checker graphs built for feasibility and induction-failure queries.
//! Nodes of a derived graph point back into the graph they were cloned
//! from through their `map` field.
//!
//! A node carries three [`Transformer`]s:
//!
//! - `annotation`, the current overapproximation of the relation,
//! - `bound`, the upper-bound (safety) constraint the annotation must
//!   eventually imply,
//! - `underapprox`, a set of definitely-reachable facts.
//!
//! All three are formulas over the node's signature variables.
//!
//! An edge is either a rule ([`Trans::Rule`]) or a *lower-bound* edge
//! ([`Trans::LowerBound`]) marking its parent as a leaf justified by its
//! own annotation.
//!
//! [`Rpfp`]: struct.Rpfp.html (Rpfp struct)
//! [`Transformer`]: struct.Transformer.html (Transformer struct)
//! [`Trans::Rule`]: enum.Trans.html#variant.Rule (Rule variant)
//! [`Trans::LowerBound`]: enum.Trans.html#variant.LowerBound
//! (LowerBound variant)

use crate::common::*;
use crate::term::{self, Term, Typ, Val};

/// An overapproximation, underapproximation or bound: a formula over a
/// node's signature variables.
#[derive(Clone, Debug)]
pub struct Transformer {
    term: Term,
}
impl Transformer {
    /// Constructor.
    pub fn new(term: Term) -> Self {
        Transformer { term }
    }
    /// The full transformer (`true`).
    pub fn full() -> Self {
        Transformer { term: term::tru() }
    }
    /// The empty transformer (`false`).
    pub fn empty() -> Self {
        Transformer { term: term::fls() }
    }
    /// A singleton transformer, the conjunction of equalities pinning the
    /// given values.
    pub fn point(vals: &VarMap<Val>) -> Self {
        let mut conj = Vec::with_capacity(vals.len());
        for (var, val) in vals.index_iter() {
            match *val {
                Val::I(ref i) => conj.push(term::eq(term::var(var), term::int(i.clone()))),
                Val::B(true) => conj.push(term::var(var)),
                Val::B(false) => conj.push(term::not(term::var(var))),
            }
        }
        Transformer {
            term: term::and(conj),
        }
    }

    /// The underlying formula.
    pub fn term(&self) -> &Term {
        &self.term
    }

    /// Makes the transformer empty.
    pub fn set_empty(&mut self) {
        self.term = term::fls()
    }
    /// Makes the transformer full.
    pub fn set_full(&mut self) {
        self.term = term::tru()
    }
    /// True if the transformer is syntactically empty.
    pub fn is_empty(&self) -> bool {
        self.term.is_false()
    }
    /// True if the transformer is syntactically full.
    pub fn is_full(&self) -> bool {
        self.term.is_true()
    }

    /// Unions another transformer into this one.
    pub fn union_with(&mut self, other: &Transformer) {
        self.term = term::or(vec![self.term.clone(), other.term.clone()])
    }
    /// Intersects another transformer into this one.
    pub fn intersect_with(&mut self, other: &Transformer) {
        self.term = term::and(vec![self.term.clone(), other.term.clone()])
    }
    /// Intersects a raw formula into this one.
    pub fn intersect_term(&mut self, term: Term) {
        self.term = term::and(vec![self.term.clone(), term])
    }
    /// Complements the transformer.
    pub fn complement(&mut self) {
        self.term = term::not(self.term.clone())
    }
    /// Simplification pass. Terms are normalized at creation, so this is
    /// a re-normalization entry point kept for symmetry.
    pub fn simplify(&mut self) {
        self.term = term::and(vec![self.term.clone()])
    }
}
impl fmt::Display for Transformer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.term.get())
    }
}

/// A child application in a rule body: the child's parameters are bound
/// to the given argument terms over the rule's variables.
#[derive(Clone, Debug)]
pub struct App {
    /// Position of the child in the edge's children.
    pub child: usize,
    /// Argument terms, one per child signature variable.
    pub args: VarMap<Term>,
}
impl App {
    /// Constructor.
    pub fn new(child: usize, args: VarMap<Term>) -> Self {
        App { child, args }
    }
}

/// One disjunct of a rule body: a guard plus child applications.
#[derive(Clone, Debug)]
pub struct Branch {
    /// Guard over the rule's variables.
    pub grd: Term,
    /// Child applications. A child that appears in no application of the
    /// chosen branch is unused (empty) in a model.
    pub apps: Vec<App>,
}
impl Branch {
    /// Constructor.
    pub fn new(grd: Term, apps: Vec<App>) -> Self {
        Branch { grd, apps }
    }
}

/// A rule body in disjunctive normal form.
///
/// The first `parent.sig.len()` variables are the parent's parameters;
/// the rest are local to the rule.
#[derive(Clone, Debug)]
pub struct Fml {
    /// Typed variables of the rule.
    pub vars: VarMap<Typ>,
    /// The disjuncts.
    pub branches: Vec<Branch>,
}
impl Fml {
    /// Constructor.
    pub fn new(vars: VarMap<Typ>, branches: Vec<Branch>) -> Self {
        Fml { vars, branches }
    }
}

/// Edge transformer: a rule, or a lower-bound marker.
#[derive(Clone, Debug)]
pub enum Trans {
    /// A rule body.
    Rule(Fml),
    /// Lower-bound edge: the parent is a leaf justified by its own
    /// annotation.
    LowerBound,
}

/// A node: an instance of a relation.
#[derive(Clone, Debug)]
pub struct Node {
    /// Relation name. Replay matching drops a configurable suffix from
    /// it, so instances cloned across runs can be identified.
    pub name: String,
    /// Signature.
    pub sig: VarMap<Typ>,
    /// Current overapproximation.
    pub annotation: Transformer,
    /// Upper-bound goal.
    pub bound: Transformer,
    /// Current underapproximation.
    pub underapprox: Transformer,
    /// Unique number, strictly monotone in creation order. Stratified
    /// leaves get negative numbers, smaller than any normal instance.
    pub number: i64,
    /// Node this one was cloned from, in the parent graph.
    pub map: Option<NodIdx>,
    /// Outgoing edge. At most one.
    pub outgoing: Option<EdgIdx>,
    /// Incoming edges.
    pub incoming: Vec<EdgIdx>,
    /// Model point, set on counterexample trees. `None` means the node is
    /// unused (empty) in the counterexample.
    pub vals: Option<VarMap<Val>>,
    /// Tombstone flag.
    pub dead: bool,
}

/// An edge: an instance of a rule.
#[derive(Clone, Debug)]
pub struct Edge {
    /// Parent node.
    pub parent: NodIdx,
    /// Ordered children.
    pub children: Vec<NodIdx>,
    /// The transformer.
    pub trans: Trans,
    /// Edge this one was cloned from, in the parent graph. `None` for
    /// lower-bound edges.
    pub map: Option<EdgIdx>,
    /// Tombstone flag.
    pub dead: bool,
}
impl Edge {
    /// True if the edge is a lower-bound edge.
    pub fn is_lower_bound(&self) -> bool {
        match self.trans {
            Trans::LowerBound => true,
            Trans::Rule(_) => false,
        }
    }
    /// The rule body, if any.
    pub fn fml(&self) -> Option<&Fml> {
        match self.trans {
            Trans::Rule(ref fml) => Some(fml),
            Trans::LowerBound => None,
        }
    }
}

/// An RPFP graph.
#[derive(Clone, Debug, Default)]
pub struct Rpfp {
    /// Nodes.
    nodes: NodMap<Node>,
    /// Edges.
    edges: EdgMap<Edge>,
    /// Number of the last node created.
    counter: i64,
}
impl Rpfp {
    /// Empty graph.
    pub fn new() -> Self {
        Rpfp {
            nodes: NodMap::new(),
            edges: EdgMap::new(),
            counter: 0,
        }
    }

    /// Adds a fresh node. The annotation starts full, the
    /// underapproximation empty.
    pub fn add_node<S: Into<String>>(
        &mut self,
        name: S,
        sig: VarMap<Typ>,
        bound: Transformer,
    ) -> NodIdx {
        self.counter += 1;
        self.nodes.push(Node {
            name: name.into(),
            sig,
            annotation: Transformer::full(),
            bound,
            underapprox: Transformer::empty(),
            number: self.counter,
            map: None,
            outgoing: None,
            incoming: Vec::new(),
            vals: None,
            dead: false,
        })
    }

    /// Clones a node of another graph into this one. The clone gets a
    /// fresh number and no edges; annotations, bound and
    /// underapproximation are copied.
    pub fn clone_node(&mut self, src: &Node, src_idx: NodIdx) -> NodIdx {
        self.counter += 1;
        self.nodes.push(Node {
            name: src.name.clone(),
            sig: src.sig.clone(),
            annotation: src.annotation.clone(),
            bound: src.bound.clone(),
            underapprox: src.underapprox.clone(),
            number: self.counter,
            map: Some(src_idx),
            outgoing: None,
            incoming: Vec::new(),
            vals: None,
            dead: false,
        })
    }

    /// Creates a rule edge. The parent must not have an outgoing edge.
    pub fn create_edge(
        &mut self,
        parent: NodIdx,
        fml: Fml,
        children: Vec<NodIdx>,
        map: Option<EdgIdx>,
    ) -> EdgIdx {
        debug_assert!(self.nodes[parent].outgoing.is_none());
        let edge = self.edges.push(Edge {
            parent,
            children: children.clone(),
            trans: Trans::Rule(fml),
            map,
            dead: false,
        });
        self.nodes[parent].outgoing = Some(edge);
        for child in children {
            self.nodes[child].incoming.push(edge)
        }
        edge
    }

    /// Creates a lower-bound edge marking `node` as a leaf.
    pub fn create_lower_bound_edge(&mut self, node: NodIdx) -> EdgIdx {
        debug_assert!(self.nodes[node].outgoing.is_none());
        let edge = self.edges.push(Edge {
            parent: node,
            children: Vec::new(),
            trans: Trans::LowerBound,
            map: None,
            dead: false,
        });
        self.nodes[node].outgoing = Some(edge);
        edge
    }

    /// Removes an edge, detaching it from its parent and children.
    pub fn remove_edge(&mut self, edge: EdgIdx) {
        let (parent, children) = {
            let e = &self.edges[edge];
            (e.parent, e.children.clone())
        };
        if self.nodes[parent].outgoing == Some(edge) {
            self.nodes[parent].outgoing = None
        }
        for child in children {
            self.nodes[child].incoming.retain(|e| *e != edge)
        }
        self.edges[edge].dead = true
    }

    /// Removes a (detached) node.
    pub fn remove_node(&mut self, node: NodIdx) {
        debug_assert!(self.nodes[node].outgoing.is_none());
        debug_assert!(self.nodes[node].incoming.is_empty());
        self.nodes[node].dead = true
    }

    /// Overrides a node's number. Used for stratified leaves, which get
    /// negative numbers.
    pub fn set_number(&mut self, node: NodIdx, number: i64) {
        self.nodes[node].number = number
    }

    /// A node.
    #[inline]
    pub fn node(&self, node: NodIdx) -> &Node {
        &self.nodes[node]
    }
    /// A node, mutable.
    #[inline]
    pub fn node_mut(&mut self, node: NodIdx) -> &mut Node {
        &mut self.nodes[node]
    }
    /// An edge.
    #[inline]
    pub fn edge(&self, edge: EdgIdx) -> &Edge {
        &self.edges[edge]
    }
    /// An edge, mutable.
    #[inline]
    pub fn edge_mut(&mut self, edge: EdgIdx) -> &mut Edge {
        &mut self.edges[edge]
    }

    /// Iterator over the live nodes.
    pub fn nodes(&self) -> impl Iterator<Item = (NodIdx, &Node)> {
        self.nodes.index_iter().filter(|(_, node)| !node.dead)
    }
    /// Indices of the live nodes.
    pub fn node_indices(&self) -> Vec<NodIdx> {
        self.nodes().map(|(idx, _)| idx).collect()
    }
    /// Iterator over the live edges.
    pub fn edges(&self) -> impl Iterator<Item = (EdgIdx, &Edge)> {
        self.edges.index_iter().filter(|(_, edge)| !edge.dead)
    }
    /// Indices of the live edges.
    pub fn edge_indices(&self) -> Vec<EdgIdx> {
        self.edges().map(|(idx, _)| idx).collect()
    }

    /// Number of node slots (dead included).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Children of a node's outgoing edge, empty for leaves.
    pub fn out_children(&self, node: NodIdx) -> Vec<NodIdx> {
        match self.nodes[node].outgoing {
            Some(edge) => self.edges[edge].children.clone(),
            None => Vec::new(),
        }
    }
}
