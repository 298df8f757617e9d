//! Diagnostic event sink.
//!
//! The solver reports everything it does through a [`Reporter`]: node
//! creation, annotation updates, bound checks, covering, conjectures,
//! induction failures, rejections... Methods are side-effect-only and
//! must tolerate repeated calls with the same node; callers never depend
//! on a return value, and reporter operations never fail.
//!
//! The default sink is [`NullReporter`]. [`StreamReporter`] prints a
//! numbered event stream, one `[<seq>] <kind> <payload>` line per event.
//!
//! [`Reporter`]: trait.Reporter.html (Reporter trait)
//! [`NullReporter`]: struct.NullReporter.html (NullReporter struct)
//! [`StreamReporter`]: struct.StreamReporter.html (StreamReporter struct)

use crate::common::*;
use crate::rpfp::{Rpfp, Transformer};

/// Sink for diagnostic events.
pub trait Reporter {
    /// A node was added to the unwinding (or a tree).
    fn extend(&mut self, _rpfp: &Rpfp, _node: NodIdx) {}
    /// A node's annotation shrank.
    fn update(&mut self, _rpfp: &Rpfp, _node: NodIdx, _update: &Transformer) {}
    /// A node's upper bound is about to be checked.
    fn bound(&mut self, _rpfp: &Rpfp, _node: NodIdx) {}
    /// A derivation-tree node was expanded. `map_number` is the number
    /// of the unwinding instance the expanded node maps to.
    fn expand(&mut self, _tree: &Rpfp, _edge: EdgIdx, _map_number: i64) {}
    /// A node was covered by one or more others.
    fn add_cover(&mut self, _rpfp: &Rpfp, _covered: NodIdx, _covering: &[NodIdx]) {}
    /// A cover was removed.
    fn remove_cover(&mut self, _rpfp: &Rpfp, _covered: NodIdx, _covering: NodIdx) {}
    /// A conjecture is about to be proved.
    fn conjecture(&mut self, _rpfp: &Rpfp, _node: NodIdx, _bound: &Transformer) {}
    /// A forced covering is attempted.
    fn forcing(&mut self, _rpfp: &Rpfp, _covered: NodIdx, _covering: NodIdx) {}
    /// A node dominates another one.
    fn dominates(&mut self, _rpfp: &Rpfp, _node: NodIdx, _other: NodIdx) {}
    /// The proposed solution is not inductive along an edge.
    fn induction_failure(
        &mut self,
        _input: &Rpfp,
        _edge: EdgIdx,
        _unwinding: &Rpfp,
        _children: &[NodIdx],
    ) {
    }
    /// A node's underapproximation grew.
    fn update_underapprox(&mut self, _rpfp: &Rpfp, _node: NodIdx, _update: &Transformer) {}
    /// An extension candidate was rejected.
    fn reject(&mut self, _input: &Rpfp, _edge: EdgIdx, _unwinding: &Rpfp, _children: &[NodIdx]) {}
    /// Free-form message.
    fn message(&mut self, _msg: &str) {}
}

/// Reporter that discards all events.
pub struct NullReporter;
impl Reporter for NullReporter {}

/// Reporter printing a numbered event stream on stdout.
pub struct StreamReporter {
    /// Event counter.
    event: usize,
}
impl StreamReporter {
    /// Constructor.
    pub fn new() -> Self {
        StreamReporter { event: 0 }
    }
    /// Prints the event prefix, yields the event number.
    fn ev(&mut self) -> usize {
        let event = self.event;
        self.event += 1;
        print!("[{}] ", event);
        event
    }
}
impl Default for StreamReporter {
    fn default() -> Self {
        Self::new()
    }
}
impl Reporter for StreamReporter {
    fn extend(&mut self, rpfp: &Rpfp, node: NodIdx) {
        self.ev();
        let n = rpfp.node(node);
        print!("node {}: {}", n.number, n.name);
        if let Some(out) = n.outgoing {
            for child in &rpfp.edge(out).children {
                print!(" {}", rpfp.node(*child).number)
            }
        }
        println!()
    }
    fn update(&mut self, rpfp: &Rpfp, node: NodIdx, update: &Transformer) {
        self.ev();
        let n = rpfp.node(node);
        println!("update {} {}: {}", n.number, n.name, update)
    }
    fn bound(&mut self, rpfp: &Rpfp, node: NodIdx) {
        self.ev();
        println!("check {}", rpfp.node(node).number)
    }
    fn expand(&mut self, tree: &Rpfp, edge: EdgIdx, map_number: i64) {
        self.ev();
        let parent = tree.edge(edge).parent;
        println!("expand {} {}", map_number, tree.node(parent).name)
    }
    fn add_cover(&mut self, rpfp: &Rpfp, covered: NodIdx, covering: &[NodIdx]) {
        self.ev();
        let n = rpfp.node(covered);
        print!("cover {}: {} by", n.name, n.number);
        for node in covering {
            print!(" {}", rpfp.node(*node).number)
        }
        println!()
    }
    fn remove_cover(&mut self, rpfp: &Rpfp, covered: NodIdx, covering: NodIdx) {
        self.ev();
        let n = rpfp.node(covered);
        println!(
            "uncover {}: {} by {}",
            n.name,
            n.number,
            rpfp.node(covering).number
        )
    }
    fn conjecture(&mut self, rpfp: &Rpfp, node: NodIdx, bound: &Transformer) {
        self.ev();
        let n = rpfp.node(node);
        println!("conjecture {} {}: {}", n.number, n.name, bound)
    }
    fn forcing(&mut self, rpfp: &Rpfp, covered: NodIdx, covering: NodIdx) {
        self.ev();
        let n = rpfp.node(covered);
        println!(
            "forcing {}: {} by {}",
            n.name,
            n.number,
            rpfp.node(covering).number
        )
    }
    fn dominates(&mut self, rpfp: &Rpfp, node: NodIdx, other: NodIdx) {
        self.ev();
        let n = rpfp.node(node);
        println!(
            "dominates {}: {} > {}",
            n.name,
            n.number,
            rpfp.node(other).number
        )
    }
    fn induction_failure(
        &mut self,
        input: &Rpfp,
        edge: EdgIdx,
        unwinding: &Rpfp,
        children: &[NodIdx],
    ) {
        self.ev();
        let parent = input.edge(edge).parent;
        print!("induction failure: {}, children =", input.node(parent).name);
        for child in children {
            print!(" {}", unwinding.node(*child).number)
        }
        println!()
    }
    fn update_underapprox(&mut self, rpfp: &Rpfp, node: NodIdx, update: &Transformer) {
        self.ev();
        let n = rpfp.node(node);
        println!("underapprox {} {}: {}", n.number, n.name, update)
    }
    fn reject(&mut self, input: &Rpfp, edge: EdgIdx, unwinding: &Rpfp, children: &[NodIdx]) {
        self.ev();
        let parent = input.edge(edge).parent;
        let p = input.node(parent);
        print!("reject {} {}:", p.number, p.name);
        for child in children {
            print!(" {}", unwinding.node(*child).number)
        }
        println!()
    }
    fn message(&mut self, msg: &str) {
        self.ev();
        println!("msg {}", msg)
    }
}
