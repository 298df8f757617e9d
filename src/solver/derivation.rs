//! Derivation trees.
//!
//! A derivation tree is a finite unfolding of the unwinding rooted at a
//! clone of some unwinding node, whose bound is asserted *negatively* in
//! a fresh backend session. Either the backend proves the tree
//! unsatisfiable, yielding one interpolant per node which flows back
//! into the unwinding as new annotations, or the tree concretizes into a
//! counterexample.
//!
//! Two variants:
//!
//! - [`DerivationTree`], the eager variant: grows the tree breadth-wise
//!   and solves incrementally. Supports three modes: *normal* (ignore
//!   underapproximations), *underapprox* (use them as upper cutoffs, the
//!   tree may stay partial) and *constrained* (use them while still
//!   building the full tree).
//! - [`DerivationTreeSlow`], the backtracking variant: expands one node
//!   at a time, pinning the current model before each expansion, and
//!   unwinds its stack through the proof core on refutation. This is
//!   the default for upper-bound proofs.
//!
//! [`DerivationTree`]: struct.DerivationTree.html (DerivationTree)
//! [`DerivationTreeSlow`]: struct.DerivationTreeSlow.html
//! (DerivationTreeSlow)

use crate::backend::{Backend, Check, Session};
use crate::common::*;
use crate::rpfp::{Rpfp, Trans};
use crate::solver::Duality;

/// Eager derivation tree.
pub struct DerivationTree<'a, B: Backend> {
    /// The solver.
    pub(crate) dual: &'a mut Duality<B>,
    /// The tree under construction.
    pub(crate) tree: Rpfp,
    /// Backend session owned by this tree.
    pub(crate) sess: B::Session,
    /// Root of the tree. Valid once `derive` ran.
    pub(crate) top: NodIdx,
    /// Current leaves, in creation order.
    leaves: Vec<NodIdx>,
    /// Assert edges without leaf cuts.
    full_expand: bool,
    /// Underapproximation mode.
    underapprox: bool,
    /// Constrained mode.
    constrained: bool,
    /// Treat fresh leaves as empty for the shallow first check.
    false_approx: bool,
    /// True while the session holds a model.
    have_model: bool,
    /// Leaves kept underapproximated by a previous expansion choice.
    old_choices: BTreeSet<NodIdx>,
}

impl<'a, B: Backend> DerivationTree<'a, B> {
    /// Constructor. `tree` extends an existing tree when given.
    pub fn new(dual: &'a mut Duality<B>, tree: Option<Rpfp>) -> Res<Self> {
        let sess = dual.backend.session()?;
        let full_expand = dual.conf.full_expand;
        Ok(DerivationTree {
            dual,
            tree: tree.unwrap_or_default(),
            sess,
            top: NodIdx::zero(),
            leaves: Vec::new(),
            full_expand,
            underapprox: false,
            constrained: false,
            false_approx: true,
            have_model: false,
            old_choices: BTreeSet::new(),
        })
    }

    /// Builds the tree. True means a counterexample was found; false
    /// means the bound is proved for this unwinding and interpolants
    /// were written into the tree.
    pub fn derive(mut self, root: NodIdx, underapprox: bool, constrained: bool) -> Res<(bool, Rpfp, NodIdx)> {
        self.underapprox = underapprox;
        self.constrained = constrained;
        self.false_approx = true;
        self.sess.push()?;
        let top = self.create_approximated_instance(root);
        self.top = top;
        // assert the negation of the top-level bound
        self.sess.assert_node(&self.tree, top)?;
        let res = self.build();
        self.dual.heuristic.done();
        match res {
            Ok(sat) => {
                self.sess.pop(1)?;
                Ok((sat, self.tree, top))
            }
            Err(e) => {
                let _ = self.sess.pop(1);
                Err(e)
            }
        }
    }

    /// Clones an unwinding node into the tree, keeping its annotation.
    pub(crate) fn create_approximated_instance(&mut self, from: NodIdx) -> NodIdx {
        let src = self.dual.unwinding.node(from).clone();
        let to = self.tree.clone_node(&src, from);
        self.leaves.push(to);
        to
    }

    /// Satisfiability using only the current leaves'
    /// underapproximations.
    fn check_with_underapprox(&mut self) -> Res<bool> {
        {
            let prof = &self.dual._profiler;
            profile! { |prof| tick "check with underapprox" }
        }
        let leaves = self.leaves.clone();
        let res = self.sess.check(&self.tree, self.top, Some(&leaves))?;
        {
            let prof = &self.dual._profiler;
            profile! { |prof| mark "check with underapprox" }
        }
        self.have_model = res == Check::Sat;
        if res == Check::Unknown {
            self.dual.note_unknown();
        }
        Ok(res != Check::Unsat)
    }

    /// Main loop of the eager variant.
    fn build(&mut self) -> Res<bool> {
        // high-priority expansions first (replay)
        while self.expand_some_nodes(true, usize::max_value())?.0 {}
        loop {
            let mut skip_solve = false;
            if (self.underapprox || self.false_approx)
                && self.tree.node(self.top).outgoing.is_some()
                && self.check_with_underapprox()?
            {
                if self.constrained {
                    // in constrained mode, keep expanding
                    skip_solve = true
                } else {
                    break;
                }
            }
            if !skip_solve {
                let res = self.sess.solve(&mut self.tree, self.top)?;
                self.have_model = res == Check::Sat;
                match res {
                    Check::Unsat => return Ok(false),
                    Check::Unknown => self.dual.note_unknown(),
                    Check::Sat => (),
                }
            }
            if self.expand_some_nodes(false, usize::max_value())?.0 {
                continue;
            }
            break;
        }
        if self.have_model {
            self.sess.compute_underapprox(&mut self.tree, self.top)?
        }
        Ok(true)
    }

    /// Expands one leaf, materializing its unwinding outgoing edge.
    fn expand_node(&mut self, node: NodIdx) -> Res<()> {
        let map = match self.tree.node(node).map {
            Some(map) => map,
            None => bail!(crate::errors::internal("tree node without an unwinding map")),
        };
        let edge = self.dual.get_node_outgoing(map)?;
        let (trans, unw_children, edge_map, map_number) = {
            let unw = &self.dual.unwinding;
            let e = unw.edge(edge);
            (
                e.trans.clone(),
                e.children.clone(),
                e.map,
                unw.node(map).number,
            )
        };
        match trans {
            Trans::LowerBound => {
                let ne = self.tree.create_lower_bound_edge(node);
                self.sess.assert_edge(&self.tree, ne, false)?;
                self.dual.reporter.expand(&self.tree, ne, map_number)
            }
            Trans::Rule(fml) => {
                let mut children = Vec::with_capacity(unw_children.len());
                for child in unw_children {
                    children.push(self.create_approximated_instance(child))
                }
                let ne = self.tree.create_edge(node, fml, children, edge_map);
                let with_children = !self.full_expand;
                self.sess.assert_edge(&self.tree, ne, with_children)?;
                self.dual.reporter.expand(&self.tree, ne, map_number)
            }
        }
        Ok(())
    }

    /// Expands up to `max` of the chosen leaves. Returns whether any
    /// choice existed, and the nodes actually expanded.
    pub(crate) fn expand_some_nodes(
        &mut self,
        high_priority: bool,
        max: usize,
    ) -> Res<(bool, Vec<NodIdx>)> {
        let mut choices = BTreeSet::new();
        self.expansion_choices(&mut choices, high_priority, max != usize::max_value())?;
        let former_leaves = std::mem::take(&mut self.leaves);
        let mut expanded = Vec::new();
        for leaf in former_leaves {
            if choices.contains(&leaf) && expanded.len() < max {
                self.expand_node(leaf)?;
                expanded.push(leaf)
            } else {
                self.leaves.push(leaf)
            }
        }
        Ok((!choices.is_empty(), expanded))
    }

    /// Chooses leaves to expand.
    fn expansion_choices(
        &mut self,
        best: &mut BTreeSet<NodIdx>,
        high_priority: bool,
        best_only: bool,
    ) -> Res<()> {
        if !self.underapprox || self.constrained || high_priority {
            return self.expansion_choices_full(best, high_priority, best_only);
        }
        // underapproximation refinement: partition the model-used leaves
        // into must-expand and may-underapproximate by bisection
        let mut unused = Vec::new();
        let mut used = Vec::new();
        let mut choices = BTreeSet::new();
        for leaf in self.leaves.clone() {
            if self.sess.empty(&self.tree, leaf) {
                unused.push(leaf)
            } else {
                let under_empty = self
                    .tree
                    .node(leaf)
                    .map
                    .map(|map| self.dual.unwinding.node(map).underapprox.is_empty())
                    .unwrap_or(true);
                if self.old_choices.contains(&leaf) || under_empty {
                    choices.insert(leaf);
                } else {
                    used.push(leaf)
                }
            }
        }
        if self.sess.check(&self.tree, self.top, Some(&unused))? == Check::Unsat {
            bail!(crate::errors::internal("error in expansion choices"))
        }
        let len = used.len();
        self.expansion_choices_rec(&mut unused, &used, &mut choices, 0, len)?;
        self.old_choices = choices.clone();
        let dual = &mut *self.dual;
        dual.heuristic
            .choose_expand(&self.tree, &dual.unwinding, &choices, best, high_priority, best_only)
    }

    /// Bisection step: if the tree stays satisfiable without a chunk of
    /// used leaves, they may keep their underapproximations; otherwise
    /// split the chunk.
    fn expansion_choices_rec(
        &mut self,
        unused: &mut Vec<NodIdx>,
        used: &[NodIdx],
        choices: &mut BTreeSet<NodIdx>,
        from: usize,
        to: usize,
    ) -> Res<()> {
        if from == to {
            return Ok(());
        }
        let orig = unused.len();
        unused.extend(used[from..to].iter().cloned());
        let blocked = self.tree.node(self.top).outgoing.is_none()
            || self.sess.check(&self.tree, self.top, Some(unused))? == Check::Unsat;
        if blocked {
            unused.truncate(orig);
            if to - from == 1 {
                choices.insert(used[from]);
            } else {
                let mid = from + (to - from) / 2;
                self.expansion_choices_rec(unused, used, choices, from, mid)?;
                self.expansion_choices_rec(unused, used, choices, mid, to)?
            }
        } else {
            log! { @debug
                "using underapproximations of {} leaves", to - from
            }
        }
        Ok(())
    }

    /// Leaves used in the current counter-model (all of them in
    /// high-priority mode), filtered by the heuristic.
    fn expansion_choices_full(
        &mut self,
        best: &mut BTreeSet<NodIdx>,
        high_priority: bool,
        best_only: bool,
    ) -> Res<()> {
        let mut choices = BTreeSet::new();
        for leaf in &self.leaves {
            if high_priority || !self.sess.empty(&self.tree, *leaf) {
                choices.insert(*leaf);
            }
        }
        let dual = &mut *self.dual;
        dual.heuristic
            .choose_expand(&self.tree, &dual.unwinding, &choices, best, high_priority, best_only)
    }

    /// Deletes an expansion: removes the edge and its children, and
    /// makes the parent a leaf again.
    fn remove_expansion(&mut self, node: NodIdx) {
        if let Some(edge) = self.tree.node(node).outgoing {
            let children = self.tree.edge(edge).children.clone();
            self.tree.remove_edge(edge);
            for child in children {
                self.tree.remove_node(child)
            }
        }
        self.leaves.push(node)
    }
}

/// One frame of the backtracking stack.
struct StackEntry {
    /// Backend scope level of this frame.
    level: usize,
    /// Nodes expanded at this frame.
    expansions: Vec<NodIdx>,
}

/// Backtracking derivation tree.
pub struct DerivationTreeSlow<'a, B: Backend> {
    /// Shared tree machinery.
    core: DerivationTree<'a, B>,
    /// Backtracking stack.
    stack: Vec<StackEntry>,
    /// Maps unwinding nodes to their instances in the tree.
    node_map: NodHMap<Vec<NodIdx>>,
    /// Tree nodes whose annotation was updated, pending re-assertion.
    updated: Vec<NodIdx>,
}

impl<'a, B: Backend> DerivationTreeSlow<'a, B> {
    /// Constructor.
    pub fn new(dual: &'a mut Duality<B>) -> Res<Self> {
        Ok(DerivationTreeSlow {
            core: DerivationTree::new(dual, None)?,
            stack: Vec::new(),
            node_map: NodHMap::new(),
            updated: Vec::new(),
        })
    }

    /// Builds the tree, backtracking-style. Same contract as the eager
    /// [`derive`](struct.DerivationTree.html#method.derive).
    pub fn derive(mut self, root: NodIdx, underapprox: bool) -> Res<(bool, Rpfp, NodIdx)> {
        self.core.underapprox = underapprox;
        self.core.constrained = false;
        self.core.sess.push()?;
        let top = self.core.create_approximated_instance(root);
        self.core.top = top;
        self.core.sess.assert_node(&self.core.tree, top)?;
        self.stack.push(StackEntry {
            level: self.core.sess.scope_level(),
            expansions: Vec::new(),
        });
        let res = self.build();
        self.core.dual.heuristic.done();
        match res {
            Ok(sat) => {
                self.core.sess.pop(1)?;
                Ok((sat, self.core.tree, top))
            }
            Err(e) => {
                let _ = self.core.sess.pop(1);
                Err(e)
            }
        }
    }

    /// Main loop of the backtracking variant.
    fn build(&mut self) -> Res<bool> {
        let top = self.core.top;
        loop {
            let level = self.core.sess.scope_level();
            let expected = self.stack.last().map(|entry| entry.level);
            if expected != Some(level) {
                bail!(crate::errors::internal("stacks out of sync"))
            }

            let res = self.core.sess.check(&self.core.tree, top, None)?;
            self.core.have_model = res == Check::Sat;
            if res == Check::Unknown {
                self.core.dual.note_unknown()
            }

            if res == Check::Unsat {
                let expansions = self
                    .stack
                    .last()
                    .map(|entry| entry.expansions.clone())
                    .unwrap_or_default();
                let mut update_count = 0;
                let single = expansions.len() == 1;
                for node in &expansions {
                    self.core
                        .sess
                        .solve_single_node(&mut self.core.tree, top, *node)?;
                    if single && self.node_too_complicated(*node) {
                        self.simplify_node(*node)?
                    }
                    self.core.sess.generalize(&mut self.core.tree, top, *node)?;
                    if self.record_update(*node)? {
                        update_count += 1
                    }
                }
                if update_count == 0 {
                    self.core.dual.reporter.message("backtracked without learning")
                }
                // need the proof core before popping the solver
                self.core.sess.compute_proof_core(&self.core.tree, top)?;
                loop {
                    if self.stack.len() == 1 {
                        break;
                    }
                    let expansions = self
                        .stack
                        .last()
                        .map(|entry| entry.expansions.clone())
                        .unwrap_or_default();
                    let prev_level_used = self.stack.len() >= 2
                        && self.level_used_in_proof(self.stack.len() - 2);
                    self.core.sess.pop(1)?;
                    let mut leaves_to_remove = NodSet::new();
                    for node in &expansions {
                        for child in self.core.tree.out_children(*node) {
                            leaves_to_remove.insert(child);
                            self.unmap_node(child)?;
                            if self.updated.contains(&child) {
                                bail!(crate::errors::internal(
                                    "removing a node pending re-assertion"
                                ))
                            }
                        }
                        self.core.remove_expansion(*node)
                    }
                    self.core.leaves.retain(|leaf| !leaves_to_remove.contains(leaf));
                    self.stack.pop();
                    if prev_level_used || self.stack.len() == 1 {
                        break;
                    }
                    // this level is about to be deleted, drop its
                    // children from the update list and make its
                    // expansions less likely in the future
                    self.remove_update_nodes_at_current_level();
                    let unused = self
                        .stack
                        .last()
                        .map(|entry| entry.expansions.clone())
                        .unwrap_or_default();
                    for node in unused {
                        if let Some(input) = self.input_of(node) {
                            self.core.dual.heuristic.update(input)
                        }
                    }
                }
                self.handle_updated_nodes()?;
                if self.stack.len() == 1 {
                    return Ok(false);
                }
            } else {
                self.core.sess.push()?;
                let expansions = self
                    .stack
                    .last()
                    .map(|entry| entry.expansions.clone())
                    .unwrap_or_default();
                for node in &expansions {
                    // an unknown check leaves no model to pin
                    if !self.core.have_model {
                        break;
                    }
                    if let Some(out) = self.core.tree.node(*node).outgoing {
                        self.core.sess.fix_current_state(&self.core.tree, out)?
                    }
                }
                self.stack.push(StackEntry {
                    level: self.core.sess.scope_level(),
                    expansions: Vec::new(),
                });
                let (_, expanded) = self.core.expand_some_nodes(false, 1)?;
                if !expanded.is_empty() {
                    for node in expanded {
                        self.note_expansion(node)
                    }
                    continue;
                }
                // no expansion left: the counter-model is a real
                // counterexample
                if self.core.have_model {
                    self.core
                        .sess
                        .compute_underapprox(&mut self.core.tree, top)?
                }
                while self.stack.len() > 1 {
                    self.core.sess.pop(1)?;
                    self.stack.pop();
                }
                return Ok(true);
            }
        }
    }

    /// Records an expansion on the current frame.
    fn note_expansion(&mut self, node: NodIdx) {
        if let Some(entry) = self.stack.last_mut() {
            entry.expansions.push(node)
        }
        for child in self.core.tree.out_children(node) {
            if let Some(map) = self.core.tree.node(child).map {
                self.node_map.entry(map).or_default().push(child)
            }
        }
    }

    /// Input node of a tree node, through the unwinding.
    fn input_of(&self, node: NodIdx) -> Option<NodIdx> {
        self.core
            .tree
            .node(node)
            .map
            .and_then(|unw| self.core.dual.unwinding.node(unw).map)
    }

    /// The interpolant is too complicated to be worth keeping as is.
    fn node_too_complicated(&self, node: NodIdx) -> bool {
        self.core
            .tree
            .node(node)
            .annotation
            .term()
            .count_operators()
            > 5
    }

    /// Recomputes the interpolant from a fresh proof.
    fn simplify_node(&mut self, node: NodIdx) -> Res<()> {
        let top = self.core.top;
        self.core
            .sess
            .interpolate_by_cases(&mut self.core.tree, top, node)
    }

    /// True if some expansion of the given stack level is used in the
    /// proof core.
    fn level_used_in_proof(&self, level: usize) -> bool {
        for node in &self.stack[level].expansions {
            if let Some(out) = self.core.tree.node(*node).outgoing {
                if self.core.sess.edge_used_in_proof(out) {
                    return true;
                }
            }
        }
        false
    }

    /// Pushes a tree node's new annotation back to the unwinding and
    /// schedules its siblings in the tree for re-assertion.
    fn record_update(&mut self, node: NodIdx) -> Res<bool> {
        let unw = match self.core.tree.node(node).map {
            Some(unw) => unw,
            None => bail!(crate::errors::internal("tree node without an unwinding map")),
        };
        let updated = {
            let core = &mut self.core;
            core.dual.update_node_to_node(unw, &core.tree, node)?
        };
        if updated {
            let to_update = self.node_map.get(&unw).cloned().unwrap_or_default();
            for other in to_update {
                // no node on the update list may be created at the
                // current stack level
                let keep = other == node || {
                    let has_incoming = !self.core.tree.node(node).incoming.is_empty();
                    let other_parent = self
                        .core
                        .tree
                        .node(other)
                        .incoming
                        .first()
                        .map(|edge| self.core.tree.edge(*edge).parent);
                    !(has_incoming
                        && other_parent
                            .map(|parent| self.at_current_stack_level(parent))
                            .unwrap_or(false))
                };
                if keep {
                    self.updated.push(other);
                    if other != node {
                        let annotation = self.core.tree.node(node).annotation.clone();
                        self.core.tree.node_mut(other).annotation = annotation
                    }
                }
            }
        }
        Ok(updated)
    }

    /// Copies refreshed unwinding annotations into the scheduled tree
    /// nodes and re-asserts them below their parent edge.
    fn handle_updated_nodes(&mut self) -> Res<()> {
        let updated = std::mem::take(&mut self.updated);
        let mut kept = Vec::new();
        for node in updated {
            if let Some(unw) = self.core.tree.node(node).map {
                let annotation = self.core.dual.unwinding.node(unw).annotation.clone();
                self.core.tree.node_mut(node).annotation = annotation
            }
            let incoming = self.core.tree.node(node).incoming.first().cloned();
            if let Some(edge) = incoming {
                self.core
                    .sess
                    .constrain_parent(&self.core.tree, edge, node)?;
                let parent = self.core.tree.edge(edge).parent;
                if !self.at_current_stack_level(parent) {
                    kept.push(node)
                }
            }
        }
        self.updated = kept;
        Ok(())
    }

    /// Drops from the update list the nodes whose parent was expanded at
    /// the current stack level.
    fn remove_update_nodes_at_current_level(&mut self) {
        let mut kept = Vec::new();
        for node in std::mem::take(&mut self.updated) {
            let parent = self
                .core
                .tree
                .node(node)
                .incoming
                .first()
                .map(|edge| self.core.tree.edge(*edge).parent);
            match parent {
                Some(parent) if self.at_current_stack_level(parent) => (),
                _ => kept.push(node),
            }
        }
        self.updated = kept
    }

    /// True if the node was expanded at the current stack level.
    fn at_current_stack_level(&self, node: NodIdx) -> bool {
        self.stack
            .last()
            .map(|entry| entry.expansions.contains(&node))
            .unwrap_or(false)
    }

    /// Forgets a deleted tree node.
    fn unmap_node(&mut self, node: NodIdx) -> Res<()> {
        if let Some(unw) = self.core.tree.node(node).map {
            if let Some(vec) = self.node_map.get_mut(&unw) {
                if let Some(pos) = vec.iter().position(|n| *n == node) {
                    vec.swap_remove(pos);
                    return Ok(());
                }
            }
        }
        bail!(crate::errors::internal("can't unmap node"))
    }
}
