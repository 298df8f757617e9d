//! Covering: the proposed inductive subset of the unwinding.
//!
//! Maintains the subsumption relation between instances of the same
//! input node, plus a *dominance* relation used to avoid redundant
//! expansion work.
//!
//! Covering is only ever from an older (lower-numbered) instance to a
//! newer one; together with the monotone instance numbering this keeps
//! the cover relation acyclic. A cover is only valid while the covering
//! node is itself uncovered, transitively through its sub-unwinding;
//! covers provided by a node are removed whenever its annotation
//! shrinks.

use crate::backend::Backend;
use crate::common::*;
use crate::rpfp::{Rpfp, Transformer};
use crate::solver::reporter::Reporter;
use crate::solver::{Counterexample, Duality};

/// Covering context: the solver state the cover bookkeeping reads.
pub struct CoverCx<'a, B> {
    /// The unwinding.
    pub rpfp: &'a Rpfp,
    /// Event sink.
    pub reporter: &'a mut dyn Reporter,
    /// Expanded instances per input node.
    pub insts: &'a NodHMap<Vec<NodIdx>>,
    /// All instances per input node.
    pub all: &'a NodHMap<Vec<NodIdx>>,
    /// Underapproximation nodes, mapped to the nodes they approximate.
    pub under_map: &'a NodHMap<NodIdx>,
    /// Whether underapproximation nodes are enabled.
    pub under: bool,
    /// The backend, for entailment checks.
    pub be: &'a B,
}

/// Cover state of one instance.
#[derive(Clone, Debug, Default)]
struct CoverInfo {
    /// The instance covering this one, if any. (Multi-witness covers
    /// point the instance at itself.)
    covered_by: Option<NodIdx>,
    /// Instances this one covers.
    covers: Vec<NodIdx>,
    /// Dominated instances are not used as candidate children.
    dominated: bool,
    /// Instances this one dominates.
    dominates: NodSet,
}

/// The covering relation over the unwinding.
pub struct Covering {
    /// Per-instance cover state.
    cm: NodHMap<CoverInfo>,
    /// True once some annotation update happened.
    some_updates: bool,
}

impl Covering {
    /// Constructor.
    pub fn new() -> Self {
        Covering {
            cm: NodHMap::new(),
            some_updates: false,
        }
    }

    /// The node covering `node`, if any.
    fn covered_by(&self, node: NodIdx) -> Option<NodIdx> {
        self.cm.get(&node).and_then(|info| info.covered_by)
    }

    /// True if the node or some node of its sub-unwinding is covered.
    fn is_covered(&self, rpfp: &Rpfp, node: NodIdx) -> bool {
        let mut memo = NodSet::new();
        self.is_covered_rec(rpfp, &mut memo, node)
    }
    fn is_covered_rec(&self, rpfp: &Rpfp, memo: &mut NodSet, node: NodIdx) -> bool {
        if !memo.insert(node) {
            return false;
        }
        if self.covered_by(node).is_some() {
            return true;
        }
        for child in rpfp.out_children(node) {
            if self.is_covered_rec(rpfp, memo, child) {
                return true;
            }
        }
        false
    }

    /// Cover order: only an older instance can cover a newer one. With
    /// underapproximation nodes, an underapproximation node can
    /// additionally cover the node it approximates, and can not be
    /// covered itself.
    fn cover_order<B>(&self, cx: &CoverCx<B>, covering: NodIdx, covered: NodIdx) -> bool {
        if cx.under {
            if cx.under_map.contains_key(&covered) {
                return false;
            }
            if let Some(approximated) = cx.under_map.get(&covering) {
                return cx.rpfp.node(covering).number < cx.rpfp.node(covered).number
                    || *approximated == covered;
            }
        }
        cx.rpfp.node(covering).number < cx.rpfp.node(covered).number
    }

    /// True if `covering` may cover `covered`: correct order, subsumed
    /// annotation, and `covering` itself uncovered.
    pub fn check_cover<B: Backend>(
        &self,
        cx: &CoverCx<B>,
        covered: NodIdx,
        covering: NodIdx,
    ) -> Res<bool> {
        if !self.cover_order(cx, covering, covered) {
            return Ok(false);
        }
        let covered_node = cx.rpfp.node(covered);
        let covering_node = cx.rpfp.node(covering);
        if !cx.be.subset_eq(
            &covered_node.annotation,
            &covering_node.annotation,
            &covered_node.sig,
        )? {
            return Ok(false);
        }
        Ok(!self.is_covered(cx.rpfp, covering))
    }

    /// Covers `covered` by `covering` if the cover is valid.
    pub fn cover_by_node<B: Backend>(
        &mut self,
        cx: &mut CoverCx<B>,
        covered: NodIdx,
        covering: NodIdx,
    ) -> Res<bool> {
        if !self.check_cover(cx, covered, covering)? {
            return Ok(false);
        }
        self.cm.entry(covered).or_default().covered_by = Some(covering);
        self.cm.entry(covering).or_default().covers.push(covered);
        cx.reporter.add_cover(cx.rpfp, covered, &[covering]);
        self.remove_ascendant_coverings(cx, covered);
        Ok(true)
    }

    /// Covers `covered` by the union of its uncovered older siblings, if
    /// that union subsumes its annotation. Used when underapproximation
    /// nodes are enabled.
    pub fn cover_by_all<B: Backend>(&mut self, cx: &mut CoverCx<B>, covered: NodIdx) -> Res<bool> {
        let covered_node = cx.rpfp.node(covered);
        let map = match covered_node.map {
            Some(map) => map,
            None => return Ok(false),
        };
        let mut all = Transformer::empty();
        let mut others = Vec::new();
        for covering in cx.insts.get(&map).cloned().unwrap_or_default() {
            if self.cover_order(cx, covering, covered) && !self.is_covered(cx.rpfp, covering) {
                all.union_with(&cx.rpfp.node(covering).annotation);
                others.push(covering)
            }
        }
        if others.is_empty()
            || !cx
                .be
                .subset_eq(&covered_node.annotation, &all, &covered_node.sig)?
        {
            return Ok(false);
        }
        // anything non-null will do as a witness
        self.cm.entry(covered).or_default().covered_by = Some(covered);
        cx.reporter.add_cover(cx.rpfp, covered, &others);
        self.remove_ascendant_coverings(cx, covered);
        Ok(true)
    }

    /// Tries to cover a node by one of its siblings.
    pub fn close<B: Backend>(&mut self, cx: &mut CoverCx<B>, node: NodIdx) -> Res<bool> {
        if self.covered_by(node).is_some() {
            return Ok(true);
        }
        if cx.under {
            return self.cover_by_all(cx, node);
        }
        let map = match cx.rpfp.node(node).map {
            Some(map) => map,
            None => return Ok(false),
        };
        for covering in cx.insts.get(&map).cloned().unwrap_or_default() {
            if self.cover_by_node(cx, node, covering)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Post-order attempt to close every descendant; true at the first
    /// success.
    pub fn close_descendants<B: Backend>(
        &mut self,
        cx: &mut CoverCx<B>,
        node: NodIdx,
    ) -> Res<bool> {
        let mut memo = NodSet::new();
        self.close_descendants_rec(cx, &mut memo, node)
    }
    fn close_descendants_rec<B: Backend>(
        &mut self,
        cx: &mut CoverCx<B>,
        memo: &mut NodSet,
        node: NodIdx,
    ) -> Res<bool> {
        if memo.contains(&node) {
            return Ok(false);
        }
        for child in cx.rpfp.out_children(node) {
            if self.close_descendants_rec(cx, memo, child)? {
                return Ok(true);
            }
        }
        if self.close(cx, node)? {
            return Ok(true);
        }
        memo.insert(node);
        Ok(false)
    }

    /// True if the node is in the proposed inductive subset: not
    /// (transitively) covered.
    pub fn contains(&self, rpfp: &Rpfp, node: NodIdx) -> bool {
        !self.is_covered(rpfp, node)
    }

    /// True if the node may be used as a candidate child: uncovered and
    /// not dominated.
    pub fn candidate(&self, rpfp: &Rpfp, node: NodIdx) -> bool {
        !self.is_covered(rpfp, node)
            && !self.cm.get(&node).map(|info| info.dominated).unwrap_or(false)
    }

    /// Marks a node dominated.
    pub fn set_dominated(&mut self, node: NodIdx) {
        self.cm.entry(node).or_default().dominated = true
    }

    /// True if `covering` could be worth conjecturing as a cover for
    /// `covered`: correct order, uncovered, and a non-trivial
    /// annotation.
    pub fn could_cover<B: Backend>(
        &self,
        cx: &CoverCx<B>,
        covered: NodIdx,
        covering: NodIdx,
    ) -> Res<bool> {
        if !self.cover_order(cx, covering, covered) || self.is_covered(cx.rpfp, covering) {
            return Ok(false);
        }
        let covering_node = cx.rpfp.node(covering);
        let useful = !cx.be.subset_eq(
            &covering_node.annotation,
            &Transformer::empty(),
            &covering_node.sig,
        )?;
        Ok(useful)
    }

    /// An uncovered older sibling this node dominates, if any. Nothing
    /// before the first annotation update.
    pub fn get_similar_node<B>(&self, cx: &CoverCx<B>, node: NodIdx) -> Option<NodIdx> {
        if !self.some_updates {
            return None;
        }
        let map = cx.rpfp.node(node).map?;
        let insts = cx.insts.get(&map)?;
        for other in insts.iter().rev() {
            if self
                .cm
                .get(&node)
                .map(|info| info.dominates.contains(other))
                .unwrap_or(false)
                && self.cover_order(cx, *other, node)
                && !self.is_covered(cx.rpfp, *other)
            {
                return Some(*other);
            }
        }
        None
    }

    /// Structural dominance: same outgoing input edge (or a trivial
    /// leaf), and each child position equal, trivial, or recursively
    /// dominated.
    pub fn dominates(&self, rpfp: &Rpfp, node: NodIdx, other: NodIdx) -> bool {
        if node == other {
            return false;
        }
        let (node_out, other_out) = match (rpfp.node(node).outgoing, rpfp.node(other).outgoing) {
            (Some(node_out), Some(other_out)) => (node_out, other_out),
            _ => return false,
        };
        if rpfp.edge(other_out).map.is_none() {
            return true;
        }
        if rpfp.edge(node_out).map != rpfp.edge(other_out).map {
            return false;
        }
        let node_chs = &rpfp.edge(node_out).children;
        let other_chs = &rpfp.edge(other_out).children;
        debug_assert_eq!(node_chs.len(), other_chs.len());
        for (nc, oc) in node_chs.iter().zip(other_chs.iter()) {
            let trivial = rpfp
                .node(*oc)
                .outgoing
                .map(|out| rpfp.edge(out).map.is_none())
                .unwrap_or(false);
            let recorded = self
                .cm
                .get(nc)
                .map(|info| info.dominates.contains(oc))
                .unwrap_or(false);
            if !(nc == oc || trivial || recorded) {
                return false;
            }
        }
        true
    }

    /// Admits a node to the inductive candidate set: records and reports
    /// every sibling it dominates.
    pub fn add<B>(&mut self, cx: &mut CoverCx<B>, node: NodIdx) {
        let map = match cx.rpfp.node(node).map {
            Some(map) => map,
            None => return,
        };
        for other in cx.insts.get(&map).cloned().unwrap_or_default() {
            if self.dominates(cx.rpfp, node, other) {
                self.cm.entry(node).or_default().dominates.insert(other);
                self.cm.entry(other).or_default().dominated = true;
                cx.reporter.dominates(cx.rpfp, node, other)
            }
        }
    }

    /// Called when a node's annotation shrinks: the covers it provides
    /// may no longer hold.
    pub fn update<B>(&mut self, cx: &mut CoverCx<B>, node: NodIdx) {
        self.remove_coverings_by(cx, node);
        self.some_updates = true
    }

    /// Removes every cover provided by a node.
    fn remove_coverings_by<B>(&mut self, cx: &mut CoverCx<B>, node: NodIdx) {
        if cx.under {
            // multi-witness covers have no witness list; purge every
            // newer covered sibling
            let map = match cx.rpfp.node(node).map {
                Some(map) => map,
                None => return,
            };
            for other in cx.all.get(&map).cloned().unwrap_or_default() {
                if self.covered_by(other).is_some() && self.cover_order(cx, node, other) {
                    self.cm.entry(other).or_default().covered_by = None;
                    cx.reporter.remove_cover(cx.rpfp, other, node)
                }
            }
        } else {
            let covers = std::mem::take(&mut self.cm.entry(node).or_default().covers);
            for other in covers {
                self.cm.entry(other).or_default().covered_by = None;
                cx.reporter.remove_cover(cx.rpfp, other, node)
            }
        }
    }

    /// Walks up the unwinding from a freshly covered node, removing the
    /// covers provided by each ascendant: their sub-unwinding now has a
    /// covered node, which disqualifies them as covering witnesses.
    fn remove_ascendant_coverings<B>(&mut self, cx: &mut CoverCx<B>, node: NodIdx) {
        let mut memo = NodSet::new();
        self.remove_ascendant_coverings_rec(cx, &mut memo, node)
    }
    fn remove_ascendant_coverings_rec<B>(
        &mut self,
        cx: &mut CoverCx<B>,
        memo: &mut NodSet,
        node: NodIdx,
    ) {
        if !memo.insert(node) {
            return;
        }
        self.remove_coverings_by(cx, node);
        for edge in cx.rpfp.node(node).incoming.clone() {
            let parent = cx.rpfp.edge(edge).parent;
            self.remove_ascendant_coverings_rec(cx, memo, parent)
        }
    }
}

impl Default for Covering {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Duality<B> {
    /// Forced covering: conjecture that the annotation of an older
    /// sibling holds of this node, and prove it. Siblings are tried in
    /// decreasing-number order, on the principle that later annotations
    /// are likely weaker. A counterexample from a failed attempt is
    /// reused to skip siblings whose annotation it falsifies.
    pub(crate) fn conjecture(&mut self, node: NodIdx) -> Res<bool> {
        let map = match self.unwinding.node(node).map {
            Some(map) => map,
            None => return Ok(false),
        };
        let insts = self.insts_of_node.get(&map).cloned().unwrap_or_default();
        let mut cex: Option<Counterexample> = None;
        for other in insts.iter().rev() {
            let could = {
                let cx = cover_cx!(self);
                self.indset.could_cover(&cx, node, *other)?
            };
            if !could {
                continue;
            }
            self.reporter.forcing(&self.unwinding, node, *other);
            if let Some(ref old) = cex {
                if !contains_cex(&self.unwinding, *other, old) {
                    continue;
                }
            }
            cex = None;
            let annotation = self.unwinding.node(*other).annotation.clone();
            let (proved, new_cex) = self.prove_conjecture(node, &annotation, Some(*other))?;
            if proved {
                let mut cx = cover_cx!(self);
                if self.indset.close_descendants(&mut cx, node)? {
                    return Ok(true);
                }
            } else {
                cex = new_cex
            }
        }
        Ok(false)
    }
}

/// True if a node's annotation holds of the counterexample's root
/// values.
fn contains_cex(unwinding: &Rpfp, node: NodIdx, cex: &Counterexample) -> bool {
    let vals = match cex.tree.node(cex.root).vals {
        Some(ref vals) => vals,
        None => return false,
    };
    unwinding
        .node(node)
        .annotation
        .term()
        .bool_eval(vals)
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::Boxes;
    use crate::rpfp::Rpfp;
    use crate::solver::reporter::NullReporter;
    use crate::term;

    fn sig() -> VarMap<crate::term::Typ> {
        vec![crate::term::Typ::Int].into()
    }

    /// Newer instances never cover older ones, whatever the
    /// annotations.
    #[test]
    fn cover_order_is_by_number() {
        let be = Boxes::new();
        let mut input = Rpfp::new();
        let p = input.add_node("P", sig(), Transformer::full());
        let mut unw = Rpfp::new();
        let old = {
            let src = input.node(p).clone();
            unw.clone_node(&src, p)
        };
        let new = {
            let src = input.node(p).clone();
            unw.clone_node(&src, p)
        };
        unw.node_mut(old).annotation = Transformer::new(term::ge(term::var(0), term::int(0)));
        unw.node_mut(new).annotation = Transformer::new(term::ge(term::var(0), term::int(1)));
        let insts: NodHMap<Vec<NodIdx>> = vec![(p, vec![old, new])].into_iter().collect();
        let all = insts.clone();
        let under_map = NodHMap::new();
        let mut reporter = NullReporter;
        let mut covering = Covering::new();
        let mut cx = CoverCx {
            rpfp: &unw,
            reporter: &mut reporter,
            insts: &insts,
            all: &all,
            under_map: &under_map,
            under: false,
            be: &be,
        };
        // old annotation covers new (new ⊆ old), not the converse
        assert!(covering.check_cover(&cx, new, old).unwrap());
        assert!(!covering.check_cover(&cx, old, new).unwrap());
        assert!(covering.cover_by_node(&mut cx, new, old).unwrap());
        assert!(!covering.contains(&unw, new));
        assert!(covering.contains(&unw, old));
        // an update on the covering node removes the cover
        covering.update(&mut cx, old);
        assert!(covering.contains(&unw, new));
    }
}
