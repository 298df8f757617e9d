//! Hashconsed terms.
//!
//! The factory is a `lazy_static` for easy creation. The `R`eal term
//! structure is [`RTerm`](enum.RTerm.html) which is hashconsed into
//! [`Term`](type.Term.html). The factory
//! ([`HConsign`](https://crates.io/crates/hashconsing)) is not directly
//! accessible. Terms are created *via* the functions in this module, such
//! as [var](fn.var.html), [int](fn.int.html), [app](fn.app.html), *etc.*
//!
//! Terms are lightly normalized at creation: conjunctions and disjunctions
//! are flattened, double negations disappear, comparisons between
//! constants are evaluated.
//!
//! A variable is a `usize` wrapped in a zero-cost
//! [`VarIdx`](../common/struct.VarIdx.html) for safety. It has no
//! semantics by itself; variables are given meaning by the signature
//! (`sig`) of the node or the variable context of the rule they appear
//! in.
//!
//! [`Mark`](enum.RTerm.html#variant.Mark) is a free boolean atom tagging
//! an unwinding instance; it is written `m_<number>`, so that markers are
//! stable across recomputations and a proof core can be mapped back to
//! instances. Markers only appear in formulas fed to the backend, never
//! in unwinding annotations.

use hashconsing::HConsed;

use crate::common::*;

mod factory;
mod val;

pub use self::factory::*;
pub use self::val::Val;

/// Types.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Typ {
    /// Integers.
    Int,
    /// Booleans.
    Bool,
}
impl Typ {
    /// Default value of a type.
    pub fn default_val(&self) -> Val {
        match *self {
            Typ::Int => Val::I(num::zero()),
            Typ::Bool => Val::B(false),
        }
    }
}
impl fmt::Display for Typ {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Typ::Int => fmt.write_str("Int"),
            Typ::Bool => fmt.write_str("Bool"),
        }
    }
}

/// Operators.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Op {
    /// Addition.
    Add,
    /// Subtraction (unary negation when applied to one argument).
    Sub,
    /// Multiplication.
    Mul,
    /// Greater than or equal to.
    Ge,
    /// Greater than.
    Gt,
    /// Less than or equal to.
    Le,
    /// Less than.
    Lt,
    /// Equality.
    Eql,
    /// Negation.
    Not,
    /// Conjunction.
    And,
    /// Disjunction.
    Or,
    /// Implication.
    Impl,
}
impl Op {
    /// String representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Ge => ">=",
            Op::Gt => ">",
            Op::Le => "<=",
            Op::Lt => "<",
            Op::Eql => "=",
            Op::Not => "not",
            Op::And => "and",
            Op::Or => "or",
            Op::Impl => "=>",
        }
    }

    /// Operator evaluation.
    pub fn eval(self, args: Vec<Val>) -> Res<Val> {
        use num::Zero;
        match self {
            Op::Add => {
                let mut sum = Int::zero();
                for arg in args {
                    sum += arg.to_int()?
                }
                Ok(Val::I(sum))
            }
            Op::Sub => {
                let mut args = args.into_iter();
                let fst = args
                    .next()
                    .ok_or_else(|| crate::errors::internal("empty application of `-`"))?
                    .to_int()?;
                let mut res = fst;
                let mut any = false;
                for arg in args {
                    any = true;
                    res -= arg.to_int()?
                }
                if any {
                    Ok(Val::I(res))
                } else {
                    Ok(Val::I(-res))
                }
            }
            Op::Mul => {
                let mut prd = Int::from(1);
                for arg in args {
                    prd *= arg.to_int()?
                }
                Ok(Val::I(prd))
            }
            Op::Ge | Op::Gt | Op::Le | Op::Lt => {
                if args.len() != 2 {
                    bail!(crate::errors::internal("comparison is binary"))
                }
                let mut args = args.into_iter();
                let lft = args.next().unwrap().to_int()?;
                let rgt = args.next().unwrap().to_int()?;
                let res = match self {
                    Op::Ge => lft >= rgt,
                    Op::Gt => lft > rgt,
                    Op::Le => lft <= rgt,
                    _ => lft < rgt,
                };
                Ok(Val::B(res))
            }
            Op::Eql => {
                if args.len() != 2 {
                    bail!(crate::errors::internal("equality is binary"))
                }
                let mut args = args.into_iter();
                let res = match (args.next().unwrap(), args.next().unwrap()) {
                    (Val::I(lft), Val::I(rgt)) => lft == rgt,
                    (Val::B(lft), Val::B(rgt)) => lft == rgt,
                    _ => bail!(crate::errors::internal("ill-typed equality")),
                };
                Ok(Val::B(res))
            }
            Op::Not => {
                if args.len() != 1 {
                    bail!(crate::errors::internal("negation is unary"))
                }
                Ok(Val::B(!args.into_iter().next().unwrap().to_bool()?))
            }
            Op::And => {
                for arg in args {
                    if !arg.to_bool()? {
                        return Ok(Val::B(false));
                    }
                }
                Ok(Val::B(true))
            }
            Op::Or => {
                for arg in args {
                    if arg.to_bool()? {
                        return Ok(Val::B(true));
                    }
                }
                Ok(Val::B(false))
            }
            Op::Impl => {
                if args.len() != 2 {
                    bail!(crate::errors::internal("implication is binary"))
                }
                let mut args = args.into_iter();
                let lhs = args.next().unwrap().to_bool()?;
                let rhs = args.next().unwrap().to_bool()?;
                Ok(Val::B(!lhs || rhs))
            }
        }
    }
}
impl fmt::Display for Op {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// A hashconsed term.
pub type Term = HConsed<RTerm>;

/// A real term.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum RTerm {
    /// A variable.
    Var(VarIdx),
    /// An integer.
    Int(Int),
    /// A boolean.
    Bool(bool),
    /// An instance marker, a free boolean atom named after an instance
    /// number.
    Mark(i64),
    /// An operator application.
    App {
        /// The operator.
        op: Op,
        /// The arguments.
        args: Vec<Term>,
    },
}
impl RTerm {
    /// The operator and the kids of a term.
    pub fn app_inspect(&self) -> Option<(Op, &Vec<Term>)> {
        match *self {
            RTerm::App { op, ref args } => Some((op, args)),
            _ => None,
        }
    }
    /// The kids of conjunctions.
    pub fn conj_inspect(&self) -> Option<&Vec<Term>> {
        match *self {
            RTerm::App {
                op: Op::And,
                ref args,
            } => Some(args),
            _ => None,
        }
    }
    /// The kids of disjunctions.
    pub fn disj_inspect(&self) -> Option<&Vec<Term>> {
        match *self {
            RTerm::App {
                op: Op::Or,
                ref args,
            } => Some(args),
            _ => None,
        }
    }

    /// True if the term is the constant `true`.
    pub fn is_true(&self) -> bool {
        *self == RTerm::Bool(true)
    }
    /// True if the term is the constant `false`.
    pub fn is_false(&self) -> bool {
        *self == RTerm::Bool(false)
    }

    /// Term evaluation. Markers evaluate to `false`.
    pub fn eval(&self, model: &VarMap<Val>) -> Res<Val> {
        self.eval_with(model, &HashMap::new())
    }

    /// Term evaluation with a marker assignment. Markers absent from the
    /// assignment evaluate to `false`.
    pub fn eval_with(&self, model: &VarMap<Val>, marks: &HashMap<i64, bool>) -> Res<Val> {
        match *self {
            RTerm::Var(v) => {
                if v.get() < model.len() {
                    Ok(model[v].clone())
                } else {
                    bail!(crate::errors::internal(format!(
                        "model too short for variable {}",
                        v.default_str()
                    )))
                }
            }
            RTerm::Int(ref i) => Ok(Val::I(i.clone())),
            RTerm::Bool(b) => Ok(Val::B(b)),
            RTerm::Mark(m) => Ok(Val::B(marks.get(&m).cloned().unwrap_or(false))),
            RTerm::App { op, ref args } => {
                let mut vals = Vec::with_capacity(args.len());
                for arg in args {
                    vals.push(arg.eval_with(model, marks)?)
                }
                op.eval(vals)
            }
        }
    }

    /// Term evaluation to a boolean.
    pub fn bool_eval(&self, model: &VarMap<Val>) -> Res<bool> {
        self.eval(model)?.to_bool()
    }

    /// Number of operator applications in the term.
    pub fn count_operators(&self) -> usize {
        let mut count = 0;
        let mut to_do = vec![self];
        while let Some(term) = to_do.pop() {
            if let RTerm::App { ref args, .. } = *term {
                count += 1;
                for arg in args {
                    to_do.push(arg.get())
                }
            }
        }
        count
    }

    /// Variables appearing in the term.
    pub fn vars(&self) -> VarSet {
        let mut set = VarSet::new();
        let mut to_do = vec![self];
        while let Some(term) = to_do.pop() {
            match *term {
                RTerm::Var(v) => {
                    set.insert(v);
                }
                RTerm::App { ref args, .. } => {
                    for arg in args {
                        to_do.push(arg.get())
                    }
                }
                _ => (),
            }
        }
        set
    }

    /// True if the term mentions a marker.
    pub fn has_marks(&self) -> bool {
        let mut to_do = vec![self];
        while let Some(term) = to_do.pop() {
            match *term {
                RTerm::Mark(_) => return true,
                RTerm::App { ref args, .. } => {
                    for arg in args {
                        to_do.push(arg.get())
                    }
                }
                _ => (),
            }
        }
        false
    }
}

/// Substitutes variables in a term. Variables outside of the map are left
/// untouched.
pub fn subst(term: &Term, map: &VarMap<Term>) -> Term {
    match *term.get() {
        RTerm::Var(v) => {
            if v.get() < map.len() {
                map[v].clone()
            } else {
                term.clone()
            }
        }
        RTerm::App { op, ref args } => {
            let args = args.iter().map(|arg| subst(arg, map)).collect();
            app(op, args)
        }
        _ => term.clone(),
    }
}

impl fmt::Display for RTerm {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use num::Signed;
        match *self {
            RTerm::Var(v) => write!(fmt, "v_{}", v),
            RTerm::Int(ref i) => {
                if i.is_negative() {
                    write!(fmt, "(- {})", -i)
                } else {
                    write!(fmt, "{}", i)
                }
            }
            RTerm::Bool(b) => write!(fmt, "{}", b),
            RTerm::Mark(m) => {
                if m < 0 {
                    write!(fmt, "m_n{}", -m)
                } else {
                    write!(fmt, "m_{}", m)
                }
            }
            RTerm::App { op, ref args } => {
                write!(fmt, "({}", op)?;
                for arg in args {
                    write!(fmt, " {}", arg.get())?
                }
                write!(fmt, ")")
            }
        }
    }
}
