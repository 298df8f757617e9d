//! Values.

use crate::common::*;

/// A value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Val {
    /// An integer.
    I(Int),
    /// A boolean.
    B(bool),
}
impl Val {
    /// Extracts an integer value.
    pub fn to_int(&self) -> Res<Int> {
        match *self {
            Val::I(ref i) => Ok(i.clone()),
            Val::B(_) => bail!(crate::errors::internal("expected integer value, got bool")),
        }
    }
    /// Extracts a boolean value.
    pub fn to_bool(&self) -> Res<bool> {
        match *self {
            Val::B(b) => Ok(b),
            Val::I(_) => bail!(crate::errors::internal("expected boolean value, got int")),
        }
    }
}
impl From<bool> for Val {
    fn from(b: bool) -> Val {
        Val::B(b)
    }
}
impl From<Int> for Val {
    fn from(i: Int) -> Val {
        Val::I(i)
    }
}
impl fmt::Display for Val {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Val::I(ref i) => write!(fmt, "{}", i),
            Val::B(b) => write!(fmt, "{}", b),
        }
    }
}
