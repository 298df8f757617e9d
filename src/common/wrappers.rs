//! Zero-cost wrappers for safe indexing.

use std::io::Write;

wrap_usize! {
    #[doc = "Node indices."]
    NodIdx
    #[doc = "Set of nodes."]
    set: NodSet
    #[doc = "Hash map from nodes to something."]
    hash map: NodHMap
    #[doc = "Total map from nodes to something."]
    map: NodMap
}

wrap_usize! {
    #[doc = "Edge indices."]
    EdgIdx
    #[doc = "Set of edges."]
    set: EdgSet
    #[doc = "Hash map from edges to something."]
    hash map: EdgHMap
    #[doc = "Total map from edges to something."]
    map: EdgMap
}

wrap_usize! {
    #[doc = "Variable indices."]
    VarIdx
    #[doc = "Set of variables."]
    set: VarSet
    #[doc = "Hash map from variables to something."]
    hash map: VarHMap
    #[doc = "Total map from variables to something."]
    map: VarMap
}

impl VarIdx {
    /// Default way to write variables: `v_<idx>`.
    pub fn default_write<W>(&self, w: &mut W) -> std::io::Result<()>
    where
        W: Write,
    {
        write!(w, "v_{}", self)
    }
    /// Default string representation of a variable.
    pub fn default_str(&self) -> String {
        format!("v_{}", self)
    }
}

impl<T: std::fmt::Display> std::fmt::Display for VarMap<T> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut sep = "";
        for elem in self {
            write!(fmt, "{}{}", sep, elem)?;
            sep = " "
        }
        Ok(())
    }
}
