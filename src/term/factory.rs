//! Term creation functions.

use hashconsing::{HConsign, HashConsign};
use std::sync::RwLock;

use crate::common::*;
use crate::term::{Op, RTerm, Term};

/// Type of the term factory.
type Factory = RwLock<HConsign<RTerm>>;

lazy_static! {
    /// Term factory.
    static ref factory: Factory = RwLock::new(
        HConsign::with_capacity(1_024)
    );
}

/// Creates a term from a real term.
#[inline]
pub fn term(t: RTerm) -> Term {
    factory.mk(t)
}

/// Creates a variable.
#[inline]
pub fn var<V: Into<VarIdx>>(v: V) -> Term {
    factory.mk(RTerm::Var(v.into()))
}

/// Creates an integer constant.
#[inline]
pub fn int<I: Into<Int>>(i: I) -> Term {
    factory.mk(RTerm::Int(i.into()))
}

/// Creates a boolean constant.
#[inline]
pub fn bool(b: bool) -> Term {
    factory.mk(RTerm::Bool(b))
}
/// Creates the constant `true`.
#[inline]
pub fn tru() -> Term {
    bool(true)
}
/// Creates the constant `false`.
#[inline]
pub fn fls() -> Term {
    bool(false)
}

/// Creates an instance marker.
#[inline]
pub fn mark(number: i64) -> Term {
    factory.mk(RTerm::Mark(number))
}

/// Creates an operator application, with light normalization.
pub fn app(op: Op, args: Vec<Term>) -> Term {
    match op {
        Op::And => and(args),
        Op::Or => or(args),
        Op::Not => {
            debug_assert_eq!(args.len(), 1);
            not(args.into_iter().next().expect("unary operator"))
        }
        Op::Impl => {
            debug_assert_eq!(args.len(), 2);
            let mut args = args.into_iter();
            let lhs = args.next().expect("binary operator");
            let rhs = args.next().expect("binary operator");
            implies(lhs, rhs)
        }
        _ => simplify_app(op, args),
    }
}

/// Creates a conjunction. Flattens nested conjunctions, drops `true` and
/// duplicates.
pub fn and(args: Vec<Term>) -> Term {
    let mut flat = Vec::with_capacity(args.len());
    for arg in args {
        if let Some(kids) = arg.conj_inspect() {
            for kid in kids {
                if !flat.contains(kid) {
                    flat.push(kid.clone())
                }
            }
        } else if arg.is_false() {
            return fls();
        } else if !arg.is_true() && !flat.contains(&arg) {
            flat.push(arg)
        }
    }
    match flat.len() {
        0 => tru(),
        1 => flat.into_iter().next().expect("non-empty"),
        _ => factory.mk(RTerm::App {
            op: Op::And,
            args: flat,
        }),
    }
}

/// Creates a disjunction. Flattens nested disjunctions, drops `false` and
/// duplicates.
pub fn or(args: Vec<Term>) -> Term {
    let mut flat = Vec::with_capacity(args.len());
    for arg in args {
        if let Some(kids) = arg.disj_inspect() {
            for kid in kids {
                if !flat.contains(kid) {
                    flat.push(kid.clone())
                }
            }
        } else if arg.is_true() {
            return tru();
        } else if !arg.is_false() && !flat.contains(&arg) {
            flat.push(arg)
        }
    }
    match flat.len() {
        0 => fls(),
        1 => flat.into_iter().next().expect("non-empty"),
        _ => factory.mk(RTerm::App {
            op: Op::Or,
            args: flat,
        }),
    }
}

/// Creates a negation. Simplifies double negations and constants.
pub fn not(arg: Term) -> Term {
    match *arg.get() {
        RTerm::Bool(b) => bool(!b),
        RTerm::App {
            op: Op::Not,
            ref args,
        } => args[0].clone(),
        _ => factory.mk(RTerm::App {
            op: Op::Not,
            args: vec![arg],
        }),
    }
}

/// Creates an implication. Simplifies trivial antecedents and
/// consequents.
pub fn implies(lhs: Term, rhs: Term) -> Term {
    if lhs.is_false() || rhs.is_true() || lhs == rhs {
        return tru();
    }
    if lhs.is_true() {
        return rhs;
    }
    if rhs.is_false() {
        return not(lhs);
    }
    factory.mk(RTerm::App {
        op: Op::Impl,
        args: vec![lhs, rhs],
    })
}

/// Creates an equality.
pub fn eq(lhs: Term, rhs: Term) -> Term {
    simplify_app(Op::Eql, vec![lhs, rhs])
}
/// Creates a greater-than-or-equal-to.
pub fn ge(lhs: Term, rhs: Term) -> Term {
    simplify_app(Op::Ge, vec![lhs, rhs])
}
/// Creates a greater-than.
pub fn gt(lhs: Term, rhs: Term) -> Term {
    simplify_app(Op::Gt, vec![lhs, rhs])
}
/// Creates a less-than-or-equal-to.
pub fn le(lhs: Term, rhs: Term) -> Term {
    simplify_app(Op::Le, vec![lhs, rhs])
}
/// Creates a less-than.
pub fn lt(lhs: Term, rhs: Term) -> Term {
    simplify_app(Op::Lt, vec![lhs, rhs])
}

/// Creates an addition.
pub fn add(args: Vec<Term>) -> Term {
    simplify_app(Op::Add, args)
}
/// Creates a subtraction.
pub fn sub(args: Vec<Term>) -> Term {
    simplify_app(Op::Sub, args)
}
/// Creates a multiplication.
pub fn mul(args: Vec<Term>) -> Term {
    simplify_app(Op::Mul, args)
}

/// Constant folding for non-boolean-connective applications.
fn simplify_app(op: Op, args: Vec<Term>) -> Term {
    let all_const = args.iter().all(|arg| match *arg.get() {
        RTerm::Int(_) | RTerm::Bool(_) => true,
        _ => false,
    });
    if all_const && !args.is_empty() {
        let vals: Res<Vec<_>> = args.iter().map(|arg| arg.eval(&VarMap::new())).collect();
        if let Ok(vals) = vals {
            if let Ok(val) = op.eval(vals) {
                return match val {
                    crate::term::Val::I(i) => int(i),
                    crate::term::Val::B(b) => bool(b),
                };
            }
        }
    }
    match op {
        Op::Eql | Op::Ge | Op::Le if args.len() == 2 && args[0] == args[1] => return tru(),
        Op::Gt | Op::Lt if args.len() == 2 && args[0] == args[1] => return fls(),
        _ => (),
    }
    factory.mk(RTerm::App { op, args })
}

#[cfg(test)]
mod test {
    use crate::term;
    use crate::term::{Op, RTerm};

    #[test]
    fn normalization() {
        assert_eq!(term::and(vec![term::tru(), term::tru()]), term::tru());
        assert_eq!(
            term::and(vec![term::tru(), term::fls(), term::var(0)]),
            term::fls()
        );
        assert_eq!(term::or(vec![term::fls()]), term::fls());
        assert_eq!(term::not(term::not(term::var(2))), term::var(2));
        assert_eq!(term::ge(term::int(7), term::int(3)), term::tru());
        assert_eq!(term::lt(term::int(7), term::int(3)), term::fls());
        assert_eq!(term::eq(term::var(1), term::var(1)), term::tru());
    }

    #[test]
    fn implications() {
        assert_eq!(term::implies(term::fls(), term::var(0)), term::tru());
        assert_eq!(term::implies(term::var(0), term::tru()), term::tru());
        assert_eq!(term::implies(term::var(0), term::var(0)), term::tru());
        assert_eq!(term::implies(term::tru(), term::var(0)), term::var(0));
        assert_eq!(
            term::implies(term::var(0), term::fls()),
            term::not(term::var(0))
        );
        let imp = term::implies(term::var(0), term::var(1));
        match *imp.get() {
            RTerm::App { op: Op::Impl, ref args } => assert_eq!(args.len(), 2),
            _ => panic!("expected an implication, got {}", imp.get()),
        }
        assert_eq!(term::app(Op::Impl, vec![term::var(0), term::var(1)]), imp);
    }

    #[test]
    fn flattening() {
        let conj = term::and(vec![
            term::ge(term::var(0), term::int(0)),
            term::and(vec![
                term::le(term::var(0), term::int(5)),
                term::ge(term::var(1), term::int(1)),
            ]),
        ]);
        match *conj.get() {
            RTerm::App { op: Op::And, ref args } => assert_eq!(args.len(), 3),
            _ => panic!("expected a conjunction, got {}", conj.get()),
        }
    }

    #[test]
    fn eval() {
        use crate::common::VarMap;
        use crate::term::Val;
        let model: VarMap<Val> = vec![Val::I(7.into()), Val::I(3.into())].into();
        let t = term::eq(
            term::var(0),
            term::add(vec![term::var(1), term::int(4)]),
        );
        assert_eq!(t.eval(&model).unwrap(), Val::B(true));
        let t = term::lt(term::var(0), term::var(1));
        assert_eq!(t.eval(&model).unwrap(), Val::B(false));
        let model: VarMap<Val> = vec![Val::B(true), Val::B(false)].into();
        let t = term::implies(term::var(0), term::var(1));
        assert_eq!(t.eval(&model).unwrap(), Val::B(false));
        let t = term::implies(term::var(1), term::var(0));
        assert_eq!(t.eval(&model).unwrap(), Val::B(true));
    }
}
