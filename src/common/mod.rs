//! Base types and functions.

pub use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
pub use std::fmt;

pub use crate::errors::*;

#[macro_use]
pub mod macros;
pub mod config;
pub mod profiling;
pub mod wrappers;

pub use self::config::{conf, Config, SolveConf};
pub use self::profiling::Profiler;
pub use self::wrappers::*;

/// Integers.
pub type Int = num::BigInt;
