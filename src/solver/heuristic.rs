//! Expansion heuristics.
//!
//! A heuristic selects which frontier nodes of a derivation tree to
//! expand next. The default variant scores nodes by how many annotation
//! updates their input node has accumulated and keeps the lower half.
//! The *replay* variant is seeded with a previous counterexample and
//! follows it; the *local* variant is pinned to a subtree of the
//! unwinding during localized conjecture proofs.
//!
//! Updates are counted per **input** node; choices are derivation-tree
//! nodes, resolved through the unwinding.

use crate::common::*;
use crate::rpfp::Rpfp;
use crate::solver::Counterexample;

/// Per-input-node update counters.
type Scores = NodHMap<usize>;

/// Expansion heuristic.
pub enum Heuristic {
    /// Fewest-updates-first selection.
    Default {
        /// Update counters.
        scores: Scores,
    },
    /// Replays a previous counterexample.
    Replay {
        /// Update counters.
        scores: Scores,
        /// The counterexample to replay. Dropped after one derivation.
        old_cex: Option<Counterexample>,
        /// Maps derivation-tree nodes to counterexample nodes.
        cex_map: NodHMap<Option<NodIdx>>,
        /// Suffix marker dropped when matching relation names.
        marker: String,
    },
    /// Restricted to a subtree of the unwinding.
    Local {
        /// Update counters.
        scores: Scores,
        /// Root of the old subtree, in the unwinding.
        old_node: Option<NodIdx>,
        /// Maps derivation-tree nodes to unwinding nodes of the old
        /// subtree.
        cex_map: NodHMap<Option<NodIdx>>,
    },
}

impl Heuristic {
    /// Default heuristic.
    pub fn new() -> Self {
        Heuristic::Default {
            scores: Scores::new(),
        }
    }
    /// Replay heuristic.
    pub fn replay(old_cex: Counterexample, marker: String) -> Self {
        Heuristic::Replay {
            scores: Scores::new(),
            old_cex: Some(old_cex),
            cex_map: NodHMap::new(),
            marker,
        }
    }
    /// Local heuristic.
    pub fn local() -> Self {
        Heuristic::Local {
            scores: Scores::new(),
            old_node: None,
            cex_map: NodHMap::new(),
        }
    }

    /// Update counters.
    fn scores(&mut self) -> &mut Scores {
        match *self {
            Heuristic::Default { ref mut scores }
            | Heuristic::Replay { ref mut scores, .. }
            | Heuristic::Local { ref mut scores, .. } => scores,
        }
    }

    /// Called when an input node's annotation changes.
    pub fn update(&mut self, input: NodIdx) {
        *self.scores().entry(input).or_insert(0) += 1
    }

    /// Sets the old subtree root of the local variant; does nothing on
    /// the other variants.
    pub fn set_old_node(&mut self, node: Option<NodIdx>) {
        if let Heuristic::Local {
            ref mut old_node,
            ref mut cex_map,
            ..
        } = *self
        {
            *old_node = node;
            cex_map.clear()
        }
    }

    /// Called when a derivation tree is done.
    pub fn done(&mut self) {
        if let Heuristic::Replay {
            ref mut old_cex,
            ref mut cex_map,
            ..
        } = *self
        {
            cex_map.clear();
            // only replay once
            *old_cex = None
        }
    }

    /// Chooses a subset of the choices to expand.
    ///
    /// `choices` are derivation-tree nodes. When `choices` is non-empty
    /// and `high_priority` is true, `best` may still come back empty for
    /// the default variant (high-priority expansion is a replay/local
    /// device).
    pub fn choose_expand(
        &mut self,
        tree: &Rpfp,
        unwinding: &Rpfp,
        choices: &BTreeSet<NodIdx>,
        best: &mut BTreeSet<NodIdx>,
        high_priority: bool,
        best_only: bool,
    ) -> Res<()> {
        match *self {
            Heuristic::Default { ref scores } => {
                score_choose(scores, tree, unwinding, choices, best, high_priority, best_only);
                Ok(())
            }
            Heuristic::Replay {
                ref scores,
                ref old_cex,
                ref mut cex_map,
                ref marker,
            } => {
                let old_cex = match old_cex {
                    Some(cex) if high_priority => cex,
                    _ => {
                        score_choose(scores, tree, unwinding, choices, best, false, best_only);
                        return Ok(());
                    }
                };
                let mut matched = BTreeSet::new();
                let mut matched_full = BTreeSet::new();
                for node in choices {
                    if cex_map.is_empty() {
                        // match the root nodes
                        cex_map.insert(*node, Some(old_cex.root));
                    }
                    if !cex_map.contains_key(node) {
                        // match an unmatched node through its parent
                        let parent = match tree.node(*node).incoming.first() {
                            Some(edge) => tree.edge(*edge).parent,
                            None => bail!(crate::errors::internal(
                                "catastrophe in replay: unmatched root"
                            )),
                        };
                        let old_parent = match cex_map.get(&parent) {
                            Some(old_parent) => *old_parent,
                            None => bail!(crate::errors::internal(
                                "catastrophe in replay: parent not matched"
                            )),
                        };
                        let siblings = tree.out_children(parent);
                        let old_siblings = match old_parent {
                            Some(old_parent) => old_cex.tree.out_children(old_parent),
                            None => Vec::new(),
                        };
                        let mut old_iter = old_siblings.iter().peekable();
                        for sibling in siblings {
                            let name = base_name(&tree.node(sibling).name, marker);
                            let matched_old = match old_iter.peek() {
                                Some(old) if base_name(&old_cex.tree.node(**old).name, marker) == name => {
                                    let old = **old;
                                    old_iter.next();
                                    Some(old)
                                }
                                _ => {
                                    warn!("replay: unmatched child `{}`", tree.node(sibling).name);
                                    None
                                }
                            };
                            cex_map.insert(sibling, matched_old);
                        }
                    }
                    match cex_map.get(node).cloned().unwrap_or(None) {
                        None => (),
                        Some(old) => {
                            matched.insert(*node);
                            if old_cex.tree.node(old).vals.is_some() {
                                matched_full.insert(*node);
                            }
                        }
                    }
                }
                let pool = if !matched_full.is_empty() {
                    &matched_full
                } else if !matched.is_empty() {
                    &matched
                } else {
                    choices
                };
                score_choose(scores, tree, unwinding, pool, best, false, best_only);
                Ok(())
            }
            Heuristic::Local {
                ref scores,
                ref old_node,
                ref mut cex_map,
            } => {
                let old_node = match old_node {
                    Some(old_node) => *old_node,
                    None => {
                        score_choose(scores, tree, unwinding, choices, best, high_priority, best_only);
                        return Ok(());
                    }
                };
                let mut matched = BTreeSet::new();
                for node in choices {
                    if cex_map.is_empty() {
                        cex_map.insert(*node, Some(old_node));
                    }
                    if !cex_map.contains_key(node) {
                        let parent = match tree.node(*node).incoming.first() {
                            Some(edge) => tree.edge(*edge).parent,
                            None => bail!(crate::errors::internal(
                                "catastrophe in replay: unmatched root"
                            )),
                        };
                        let old_parent = match cex_map.get(&parent) {
                            Some(old_parent) => *old_parent,
                            None => bail!(crate::errors::internal(
                                "catastrophe in replay: parent not matched"
                            )),
                        };
                        let siblings = tree.out_children(parent);
                        let old_siblings = match old_parent {
                            Some(old_parent) => unwinding.out_children(old_parent),
                            None => Vec::new(),
                        };
                        if siblings.len() == old_siblings.len() {
                            for (sibling, old) in siblings.iter().zip(old_siblings.iter()) {
                                cex_map.insert(*sibling, Some(*old));
                            }
                        } else {
                            log! { @debug "derivation tree does not match old subtree" }
                            for sibling in siblings {
                                cex_map.insert(sibling, None);
                            }
                        }
                    }
                    if let Some(Some(old)) = cex_map.get(node) {
                        // matched iff the choice is an instance of the
                        // structurally-corresponding old node
                        if tree.node(*node).map == Some(*old) {
                            matched.insert(*node);
                        }
                    }
                }
                let pool = if matched.is_empty() { choices } else { &matched };
                score_choose(scores, tree, unwinding, pool, best, false, best_only);
                Ok(())
            }
        }
    }
}

impl Default for Heuristic {
    fn default() -> Self {
        Self::new()
    }
}

/// Drops the suffix introduced at the marker, if any. The marker must
/// not start the name.
pub fn base_name<'a>(name: &'a str, marker: &str) -> &'a str {
    if marker.is_empty() {
        return name;
    }
    match name.find(marker) {
        Some(pos) if pos >= 1 => &name[..pos],
        _ => name,
    }
}

/// Default selection policy: score is the number of updates of the
/// choice's input node; keep the choices at most halfway between the
/// best and the worst score (just the best ones when `best_only`).
fn score_choose(
    scores: &Scores,
    tree: &Rpfp,
    unwinding: &Rpfp,
    choices: &BTreeSet<NodIdx>,
    best: &mut BTreeSet<NodIdx>,
    high_priority: bool,
    best_only: bool,
) {
    if high_priority || choices.is_empty() {
        return;
    }
    let score_of = |node: &NodIdx| {
        tree.node(*node)
            .map
            .and_then(|unw| unwinding.node(unw).map)
            .and_then(|input| scores.get(&input).cloned())
            .unwrap_or(0)
    };
    let mut lo = usize::max_value();
    let mut hi = 0;
    for node in choices {
        let score = score_of(node);
        lo = std::cmp::min(lo, score);
        hi = std::cmp::max(hi, score);
    }
    let cutoff = if best_only { lo } else { lo + (hi - lo) / 2 };
    for node in choices {
        if score_of(node) <= cutoff {
            best.insert(*node);
        }
    }
}

#[cfg(test)]
mod test {
    use super::base_name;

    #[test]
    fn base_names() {
        assert_eq!(base_name("P@@2", "@@"), "P");
        assert_eq!(base_name("P", "@@"), "P");
        assert_eq!(base_name("@@P", "@@"), "@@P");
        assert_eq!(base_name("Q@@", "@@"), "Q");
        assert_eq!(base_name("Q@@1@@2", "@@"), "Q");
    }
}
