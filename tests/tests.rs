//! End-to-end scenarios, built programmatically against the box backend.
#![allow(non_upper_case_globals)]

extern crate duality;

use std::cell::RefCell;
use std::rc::Rc;

use duality::common::{NodIdx, VarMap};
use duality::rpfp::{App, Branch, Fml, Rpfp, Transformer};
use duality::solver::reporter::Reporter;
use duality::term::{self, Term, Typ};
use duality::{Backend, Boxes, Counterexample, Duality};

macro_rules! run {
    ($e:expr) => {
        match $e {
            Ok(res) => res,
            Err(e) => {
                println!("Error:");
                let mut pref = "> ";
                for e in e.iter() {
                    for line in format!("{}", e).lines() {
                        println!("{}{}", pref, line);
                        pref = "  "
                    }
                }
                panic!("failure")
            }
        }
    };
}

/// Events recorded by the test reporter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ev {
    Extend,
    Update,
    Check,
    Expand,
    Cover,
    Uncover,
    Forcing,
    Conjecture,
    Dominates,
    InductionFailure,
    Underapprox,
    Reject,
    Msg,
}

/// Recording reporter; clones share the same event list.
#[derive(Clone, Default)]
struct Recorder {
    events: Rc<RefCell<Vec<Ev>>>,
}
impl Recorder {
    fn events(&self) -> Vec<Ev> {
        self.events.borrow().clone()
    }
    fn count(&self, ev: Ev) -> usize {
        self.events.borrow().iter().filter(|e| **e == ev).count()
    }
    fn push(&self, ev: Ev) {
        self.events.borrow_mut().push(ev)
    }
}
impl Reporter for Recorder {
    fn extend(&mut self, _: &Rpfp, _: NodIdx) {
        self.push(Ev::Extend)
    }
    fn update(&mut self, _: &Rpfp, _: NodIdx, _: &Transformer) {
        self.push(Ev::Update)
    }
    fn bound(&mut self, _: &Rpfp, _: NodIdx) {
        self.push(Ev::Check)
    }
    fn expand(&mut self, _: &Rpfp, _: duality::common::EdgIdx, _: i64) {
        self.push(Ev::Expand)
    }
    fn add_cover(&mut self, _: &Rpfp, _: NodIdx, _: &[NodIdx]) {
        self.push(Ev::Cover)
    }
    fn remove_cover(&mut self, _: &Rpfp, _: NodIdx, _: NodIdx) {
        self.push(Ev::Uncover)
    }
    fn conjecture(&mut self, _: &Rpfp, _: NodIdx, _: &Transformer) {
        self.push(Ev::Conjecture)
    }
    fn forcing(&mut self, _: &Rpfp, _: NodIdx, _: NodIdx) {
        self.push(Ev::Forcing)
    }
    fn dominates(&mut self, _: &Rpfp, _: NodIdx, _: NodIdx) {
        self.push(Ev::Dominates)
    }
    fn induction_failure(&mut self, _: &Rpfp, _: duality::common::EdgIdx, _: &Rpfp, _: &[NodIdx]) {
        self.push(Ev::InductionFailure)
    }
    fn update_underapprox(&mut self, _: &Rpfp, _: NodIdx, _: &Transformer) {
        self.push(Ev::Underapprox)
    }
    fn reject(&mut self, _: &Rpfp, _: duality::common::EdgIdx, _: &Rpfp, _: &[NodIdx]) {
        self.push(Ev::Reject)
    }
    fn message(&mut self, _: &str) {
        self.push(Ev::Msg)
    }
}

fn int_sig() -> VarMap<Typ> {
    vec![Typ::Int].into()
}

/// `P(x) :- x ≥ 0`, with the given bound on `P`.
fn flat_p(name: &str, bound: Term) -> Rpfp {
    let mut rpfp = Rpfp::new();
    let p = rpfp.add_node(name, int_sig(), Transformer::new(bound));
    let fml = Fml::new(
        int_sig(),
        vec![Branch::new(term::ge(term::var(0), term::int(0)), vec![])],
    );
    rpfp.create_edge(p, fml, vec![], None);
    rpfp
}

/// `P(0). P(x+1) :- P(x) [, x ≤ guard]`, with the given bound on `P`.
fn linear_p(bound: Term, guard: Option<i64>) -> Rpfp {
    let mut rpfp = Rpfp::new();
    let p = rpfp.add_node("P", int_sig(), Transformer::new(bound));
    let vars: VarMap<Typ> = vec![Typ::Int, Typ::Int].into();
    let mut step = term::eq(
        term::var(0),
        term::add(vec![term::var(1), term::int(1)]),
    );
    if let Some(guard) = guard {
        step = term::and(vec![step, term::le(term::var(1), term::int(guard))])
    }
    let args: VarMap<Term> = vec![term::var(1)].into();
    let fml = Fml::new(
        vars,
        vec![
            Branch::new(term::eq(term::var(0), term::int(0)), vec![]),
            Branch::new(step, vec![App::new(0, args)]),
        ],
    );
    rpfp.create_edge(p, fml, vec![p], None);
    rpfp
}

/// A bound-free helper `Q(0). Q(x+1) :- Q(x), x ≤ 2` observed by two
/// safety relations `S1(x) :- Q(x)` (bound `x ≥ 0`) and `S2(x) :- Q(x)`
/// (bound `x ≤ 9`).
fn observed_counter() -> Rpfp {
    let mut rpfp = Rpfp::new();
    let q = rpfp.add_node("Q", int_sig(), Transformer::full());
    let s1 = rpfp.add_node(
        "S1",
        int_sig(),
        Transformer::new(term::ge(term::var(0), term::int(0))),
    );
    let s2 = rpfp.add_node(
        "S2",
        int_sig(),
        Transformer::new(term::le(term::var(0), term::int(9))),
    );
    let vars: VarMap<Typ> = vec![Typ::Int, Typ::Int].into();
    let q_step = term::and(vec![
        term::eq(
            term::var(0),
            term::add(vec![term::var(1), term::int(1)]),
        ),
        term::le(term::var(1), term::int(2)),
    ]);
    let q_args: VarMap<Term> = vec![term::var(1)].into();
    let q_fml = Fml::new(
        vars.clone(),
        vec![
            Branch::new(term::eq(term::var(0), term::int(0)), vec![]),
            Branch::new(q_step, vec![App::new(0, q_args)]),
        ],
    );
    rpfp.create_edge(q, q_fml, vec![q], None);
    for s in &[s1, s2] {
        let s_args: VarMap<Term> = vec![term::var(1)].into();
        let s_fml = Fml::new(
            vars.clone(),
            vec![Branch::new(
                term::eq(term::var(0), term::var(1)),
                vec![App::new(0, s_args)],
            )],
        );
        rpfp.create_edge(*s, s_fml, vec![q], None);
    }
    rpfp
}

/// Longest root-to-leaf edge count of a counterexample tree.
fn cex_depth(cex: &Counterexample) -> usize {
    fn depth(tree: &Rpfp, node: NodIdx) -> usize {
        tree.out_children(node)
            .into_iter()
            .map(|child| 1 + depth(tree, child))
            .max()
            .unwrap_or(0)
    }
    depth(&cex.tree, cex.root)
}

/// The annotation of the first input node named `name`.
fn annotation_of(rpfp: &Rpfp, name: &str) -> Transformer {
    for (_, node) in rpfp.nodes() {
        if node.name == name {
            return node.annotation.clone();
        }
    }
    panic!("no node named `{}`", name)
}

/// Scenario 1: trivially safe leaf.
#[test]
fn trivially_safe_leaf() {
    let bound = term::ge(term::var(0), term::int(0));
    let mut solver = Duality::new(flat_p("P", bound.clone()), Boxes::new());
    assert!(run!(solver.solve()));
    let annotation = annotation_of(solver.rpfp(), "P");
    // annotation within the bound, and covering `x ≥ 0`
    let bound = Transformer::new(bound);
    assert!(run!(solver.backend().subset_eq(&annotation, &bound, &int_sig())));
    assert!(run!(solver.backend().subset_eq(&bound, &annotation, &int_sig())));
}

/// Scenario 2: trivially unsafe.
#[test]
fn trivially_unsafe() {
    let bound = term::lt(term::var(0), term::int(0));
    let mut solver = Duality::new(flat_p("P", bound), Boxes::new());
    assert!(!run!(solver.solve()));
    let cex = solver.counterexample().expect("refutation counterexample");
    assert_eq!(cex.tree.node(cex.root).name, "P");
    assert!(cex.tree.node(cex.root).vals.is_some());
    let out = cex.tree.node(cex.root).outgoing.expect("expanded root");
    assert!(cex.tree.edge(out).children.is_empty());
    // the counterexample was taken
    assert!(solver.counterexample().is_none());
}

/// Scenario 3: linear recursion, safe. Stratified inlining and eager
/// expansion must agree.
#[test]
fn linear_recursion_safe() {
    let bound = term::ge(term::var(0), term::int(0));
    for (opt, val) in &[
        ("", ""),
        ("stratified_inlining", "1"),
        ("eager_expand", "1"),
        ("use_underapprox", "0"),
        ("feasible_edges", "0"),
    ] {
        let mut solver = Duality::new(linear_p(bound.clone(), None), Boxes::new());
        if !opt.is_empty() {
            assert!(solver.set_option(opt, val));
        }
        assert!(run!(solver.solve()), "with option {}={}", opt, val);
        let annotation = annotation_of(solver.rpfp(), "P");
        let bound = Transformer::new(bound.clone());
        assert!(
            run!(solver.backend().subset_eq(&annotation, &bound, &int_sig())),
            "annotation implies the bound with option {}={}",
            opt,
            val
        );
    }
}

/// Scenario 4: linear recursion, bounded-unsafe. The counterexample is a
/// chain of depth at least 6 and at most 11.
#[test]
fn linear_recursion_bounded_unsafe() {
    let bound = term::le(term::var(0), term::int(5));
    for under in &["1", "0"] {
        let mut solver = Duality::new(linear_p(bound.clone(), None), Boxes::new());
        assert!(solver.set_option("recursion_bound", "10"));
        assert!(solver.set_option("use_underapprox", under));
        assert!(!run!(solver.solve()), "with use_underapprox={}", under);
        let cex = solver.counterexample().expect("refutation counterexample");
        let depth = cex_depth(&cex);
        assert!(
            depth >= 6 && depth <= 11,
            "counterexample depth {} with use_underapprox={}",
            depth,
            under
        );
    }
}

/// Scenario 5: forced covering. The bound-free helper accumulates
/// annotation through its observers; new helper instances trigger
/// conjectures, and instances end up covered by older ones.
#[test]
fn forced_covering() {
    let recorder = Recorder::default();
    let mut solver = Duality::new(observed_counter(), Boxes::new());
    assert!(solver.set_option("use_underapprox", "0"));
    solver.set_reporter(Box::new(recorder.clone()));
    assert!(run!(solver.solve()));
    assert!(recorder.count(Ev::Forcing) >= 1, "some forced covering");
    assert!(recorder.count(Ev::Conjecture) >= 1, "some conjecture");
    assert!(recorder.count(Ev::Cover) >= 1, "some cover");
    let events = recorder.events();
    let first_forcing = events.iter().position(|e| *e == Ev::Forcing).unwrap();
    assert!(
        events[first_forcing..].iter().any(|e| *e == Ev::Cover),
        "a cover follows the first forcing"
    );

    // conjectures off: still solved, no conjecture events
    let recorder = Recorder::default();
    let mut solver = Duality::new(observed_counter(), Boxes::new());
    assert!(solver.set_option("use_underapprox", "0"));
    assert!(solver.set_option("no_conj", "1"));
    solver.set_reporter(Box::new(recorder.clone()));
    assert!(run!(solver.solve()));
    assert_eq!(recorder.count(Ev::Conjecture), 0);
    assert_eq!(recorder.count(Ev::Forcing), 0);
}

/// Scenario 6: replaying a previous counterexample on a structurally
/// identical graph reaches the same verdict with no more expansions and
/// no more backend checks.
#[test]
fn replay_speedup() {
    let bound = term::lt(term::var(0), term::int(0));
    let recorder1 = Recorder::default();
    let mut solver1 = Duality::new(flat_p("P@@1", bound.clone()), Boxes::new());
    solver1.set_reporter(Box::new(recorder1.clone()));
    assert!(!run!(solver1.solve()));
    let checks1 = solver1.backend().check_count();
    let cex = solver1.counterexample().expect("counterexample");

    let recorder2 = Recorder::default();
    let mut solver2 = Duality::new(flat_p("P@@2", bound), Boxes::new());
    solver2.set_reporter(Box::new(recorder2.clone()));
    solver2.learn_from(cex);
    assert!(!run!(solver2.solve()));
    let checks2 = solver2.backend().check_count();

    assert!(recorder2.count(Ev::Expand) <= recorder1.count(Ev::Expand));
    assert!(checks2 <= checks1);
}

/// Underapproximations off must produce logically equivalent verdicts.
#[test]
fn underapprox_toggle_equivalence() {
    let safe = term::ge(term::var(0), term::int(0));
    let unsafe_bound = term::le(term::var(0), term::int(5));
    for under in &["1", "0"] {
        let mut solver = Duality::new(linear_p(safe.clone(), None), Boxes::new());
        assert!(solver.set_option("use_underapprox", under));
        assert!(run!(solver.solve()));

        let mut solver = Duality::new(linear_p(unsafe_bound.clone(), Some(7)), Boxes::new());
        assert!(solver.set_option("use_underapprox", under));
        assert!(!run!(solver.solve()));
    }
}

/// A guarded loop staying under its bound is solved, and the solution is
/// inductive: re-solving the annotated problem changes nothing.
#[test]
fn guarded_loop_safe() {
    let bound = term::le(term::var(0), term::int(5));
    let mut solver = Duality::new(linear_p(bound.clone(), Some(4)), Boxes::new());
    assert!(run!(solver.solve()));
    let annotation = annotation_of(solver.rpfp(), "P");
    let bound = Transformer::new(bound);
    assert!(run!(solver.backend().subset_eq(&annotation, &bound, &int_sig())));
}

/// Full expansion on a non-recursive graph.
#[test]
fn full_expand_flat() {
    let bound = term::ge(term::var(0), term::int(0));
    let mut solver = Duality::new(flat_p("P", bound), Boxes::new());
    assert!(solver.set_option("full_expand", "1"));
    assert!(run!(solver.solve()));
}

/// Unknown options are rejected, without touching the solver.
#[test]
fn options() {
    let bound = term::ge(term::var(0), term::int(0));
    let mut solver = Duality::new(flat_p("P", bound), Boxes::new());
    assert!(!solver.set_option("does_not_exist", "1"));
    assert!(!solver.set_option("no_conj", "maybe"));
    assert!(solver.set_option("no_conj", "1"));
    assert!(solver.set_option("recursion_bound", "-1"));
    assert!(run!(solver.solve()));
}

/// Solving twice from scratch is deterministic.
#[test]
fn resolve_deterministic() {
    let bound = term::ge(term::var(0), term::int(0));
    let mut solver = Duality::new(linear_p(bound, None), Boxes::new());
    assert!(run!(solver.solve()));
    let first = format!("{}", annotation_of(solver.rpfp(), "P"));
    assert!(run!(solver.solve()));
    let second = format!("{}", annotation_of(solver.rpfp(), "P"));
    assert_eq!(first, second);
}
