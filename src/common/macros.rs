//! Macros.

/// Wraps a `usize` in a zero-cost index type, with optional typed
/// collections.
///
/// The clauses, in order:
///
/// - `set: <Ident>`: alias for a hash set of indices;
/// - `hash map: <Ident>`: alias for a hash map from indices to something;
/// - `map: <Ident>`: total map (a `Vec` indexed by the wrapper).
macro_rules! wrap_usize {
    (
        $(#[$meta:meta])* $name:ident
        $($tail:tt)*
    ) => (
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord
        )]
        pub struct $name {
            val: usize,
        }
        impl $name {
            /// Wraps a `usize`.
            #[inline]
            pub fn new(val: usize) -> Self {
                $name { val }
            }
            /// Zero.
            #[inline]
            pub fn zero() -> Self {
                $name { val: 0 }
            }
            /// Underlying `usize`.
            #[inline]
            pub fn get(self) -> usize {
                self.val
            }
        }
        impl From<usize> for $name {
            fn from(val: usize) -> Self {
                $name { val }
            }
        }
        impl From<$name> for usize {
            fn from(idx: $name) -> usize {
                idx.val
            }
        }
        impl std::ops::Deref for $name {
            type Target = usize;
            fn deref(&self) -> &usize {
                &self.val
            }
        }
        impl std::fmt::Display for $name {
            fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(fmt, "{}", self.val)
            }
        }
        wrap_usize! { @tail $name $($tail)* }
    );

    (@tail $name:ident) => ();

    (@tail $name:ident
        $(#[$meta:meta])* set: $set:ident
        $($tail:tt)*
    ) => (
        $(#[$meta])*
        pub type $set = std::collections::HashSet<$name>;
        wrap_usize! { @tail $name $($tail)* }
    );

    (@tail $name:ident
        $(#[$meta:meta])* hash map: $hmap:ident
        $($tail:tt)*
    ) => (
        $(#[$meta])*
        pub type $hmap<T> = std::collections::HashMap<$name, T>;
        wrap_usize! { @tail $name $($tail)* }
    );

    (@tail $name:ident
        $(#[$meta:meta])* map: $map:ident
        $($tail:tt)*
    ) => (
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $map<T> {
            vec: Vec<T>,
        }
        impl<T> $map<T> {
            /// Empty map.
            #[inline]
            pub fn new() -> Self {
                $map { vec: Vec::new() }
            }
            /// Empty map with some capacity.
            #[inline]
            pub fn with_capacity(capa: usize) -> Self {
                $map {
                    vec: Vec::with_capacity(capa),
                }
            }
            /// Number of elements.
            #[inline]
            pub fn len(&self) -> usize {
                self.vec.len()
            }
            /// True if the map is empty.
            #[inline]
            pub fn is_empty(&self) -> bool {
                self.vec.is_empty()
            }
            /// Index of the next element pushed.
            #[inline]
            pub fn next_index(&self) -> $name {
                $name::new(self.vec.len())
            }
            /// Pushes an element, yields its index.
            #[inline]
            pub fn push(&mut self, elem: T) -> $name {
                let idx = self.next_index();
                self.vec.push(elem);
                idx
            }
            /// Iterator over the elements.
            #[inline]
            pub fn iter(&self) -> std::slice::Iter<T> {
                self.vec.iter()
            }
            /// Mutable iterator over the elements.
            #[inline]
            pub fn iter_mut(&mut self) -> std::slice::IterMut<T> {
                self.vec.iter_mut()
            }
            /// Iterator over indices and elements.
            #[inline]
            pub fn index_iter(&self) -> impl Iterator<Item = ($name, &T)> {
                self.vec
                    .iter()
                    .enumerate()
                    .map(|(idx, elem)| ($name::new(idx), elem))
            }
            /// Iterator over the indices.
            #[inline]
            pub fn indices(&self) -> impl Iterator<Item = $name> {
                (0..self.vec.len()).map($name::new)
            }
        }
        impl<T> Default for $map<T> {
            fn default() -> Self {
                Self::new()
            }
        }
        impl<T> std::ops::Index<$name> for $map<T> {
            type Output = T;
            fn index(&self, idx: $name) -> &T {
                &self.vec[idx.get()]
            }
        }
        impl<T> std::ops::IndexMut<$name> for $map<T> {
            fn index_mut(&mut self, idx: $name) -> &mut T {
                &mut self.vec[idx.get()]
            }
        }
        impl<T> std::iter::FromIterator<T> for $map<T> {
            fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
                $map {
                    vec: iter.into_iter().collect(),
                }
            }
        }
        impl<T> From<Vec<T>> for $map<T> {
            fn from(vec: Vec<T>) -> Self {
                $map { vec }
            }
        }
        impl<'a, T> IntoIterator for &'a $map<T> {
            type Item = &'a T;
            type IntoIter = std::slice::Iter<'a, T>;
            fn into_iter(self) -> Self::IntoIter {
                self.vec.iter()
            }
        }
        impl<T> IntoIterator for $map<T> {
            type Item = T;
            type IntoIter = std::vec::IntoIter<T>;
            fn into_iter(self) -> Self::IntoIter {
                self.vec.into_iter()
            }
        }
        wrap_usize! { @tail $name $($tail)* }
    );
}

/// Logs at some verbosity level. Inactive in `bench` mode.
///
/// - `log! { @verb "..." , args }` is active at verbosity 1 or more;
/// - `log! { @debug "..." , args }` is active at verbosity 3 or more.
#[cfg(not(feature = "bench"))]
macro_rules! log {
    (@verb $($args:tt)*) => (
        log! { @level 1, $($args)* }
    );
    (@debug $($args:tt)*) => (
        log! { @level 3, $($args)* }
    );
    (@level $lvl:expr, $($args:tt)*) => (
        if $crate::common::conf.verb >= $lvl {
            println!("; {}", format!($($args)*))
        }
    );
}
#[cfg(feature = "bench")]
macro_rules! log {
    ($($tt:tt)*) => {
        ()
    };
}

/// Prints a warning. Inactive in `bench` mode.
#[cfg(not(feature = "bench"))]
macro_rules! warn {
    ($($args:tt)*) => {
        println!(
            "; {} {}",
            $crate::common::conf.sad("warning:"),
            format!($($args)*)
        )
    };
}
#[cfg(feature = "bench")]
macro_rules! warn {
    ($($tt:tt)*) => {
        ()
    };
}

/// Profiling macro.
///
/// If passed `self`, assumes `self` has a `_profiler` field.
#[cfg(not(feature = "bench"))]
macro_rules! profile {
    ( | $prof:ident | $stat:expr => add $e:expr ) => {
        $prof.stat_do($stat, |val| val + $e)
    };
    ( | $prof:ident | $meth:ident $( $scope:expr ),+ $(,)* ) => {
        $prof.$meth(vec![$($scope),+])
    };
    ( $slf:ident $stat:expr => add $e:expr ) => {{
        let prof = &$slf._profiler;
        profile! { |prof| $stat => add $e }
    }};
    ( $slf:ident $meth:ident $( $scope:expr ),+ $(,)* ) => {{
        let prof = &$slf._profiler;
        profile! { |prof| $meth $($scope),+ }
    }};
}
#[cfg(feature = "bench")]
macro_rules! profile {
    ( $($tt:tt)* ) => {
        ()
    };
}
