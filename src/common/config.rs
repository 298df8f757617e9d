//! Global and per-solver configuration.
//!
//! The global [`conf`] carries output-related things: verbosity, styles,
//! statistics. Everything that influences the search itself lives in
//! [`SolveConf`], one per solver, mutable through
//! [`set`](struct.SolveConf.html#method.set) (the `SetOption` entry point).
//!
//! [`conf`]: struct.Config.html (Config struct)
//! [`SolveConf`]: struct.SolveConf.html (SolveConf struct)

use ansi_term::{Colour, Style};

/// Output styles.
pub struct Styles {
    /// Emphasis style.
    emph: Style,
    /// Happy style.
    hap: Style,
    /// Sad style.
    sad: Style,
    /// Bad style.
    bad: Style,
}
impl Styles {
    /// Creates the styles, colored or not.
    pub fn new(colored: bool) -> Self {
        if colored {
            Styles {
                emph: Style::new().bold(),
                hap: Colour::Green.normal().bold(),
                sad: Colour::Yellow.normal().bold(),
                bad: Colour::Red.normal().bold(),
            }
        } else {
            Styles {
                emph: Style::new(),
                hap: Style::new(),
                sad: Style::new(),
                bad: Style::new(),
            }
        }
    }
}

/// Global configuration.
pub struct Config {
    /// Verbosity. `0` is quiet, `1` is verbose, `3` and up is debug.
    pub verb: usize,
    /// Print statistics at the end of a solve.
    pub stats: bool,
    /// Styles.
    styles: Styles,
}
impl Config {
    /// Constructor. Styled output iff stdout is a tty.
    pub fn new() -> Self {
        let colored = atty::is(atty::Stream::Stdout);
        Config {
            verb: 0,
            stats: false,
            styles: Styles::new(colored),
        }
    }

    /// String emphasis.
    pub fn emph<S: AsRef<str>>(&self, s: S) -> String {
        format!("{}", self.styles.emph.paint(s.as_ref()))
    }
    /// Happy string.
    pub fn good<S: AsRef<str>>(&self, s: S) -> String {
        format!("{}", self.styles.hap.paint(s.as_ref()))
    }
    /// Sad string.
    pub fn sad<S: AsRef<str>>(&self, s: S) -> String {
        format!("{}", self.styles.sad.paint(s.as_ref()))
    }
    /// Bad string.
    pub fn bad<S: AsRef<str>>(&self, s: S) -> String {
        format!("{}", self.styles.bad.paint(s.as_ref()))
    }
}
impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// Global configuration.
    pub static ref conf: Config = Config::new();
}

/// Per-solver options.
///
/// Field names follow the option names recognized by
/// [`set`](#method.set).
#[derive(Clone, Debug)]
pub struct SolveConf {
    /// Do not use partial expansion of derivation trees.
    pub full_expand: bool,
    /// Do not use conjectures (no forced covering).
    pub no_conj: bool,
    /// Use only feasible edges in the unwinding.
    pub feasible_edges: bool,
    /// Use underapproximations.
    pub use_underapprox: bool,
    /// Report events on stdout.
    pub report: bool,
    /// Perform stratified inlining as a preprocessing step.
    pub stratified_inlining: bool,
    /// Recursion bound for bounded verification. `None` means unbounded.
    pub recursion_bound: Option<usize>,
    /// Use eager (Cartesian) node expansion instead of induction-failure
    /// guided expansion.
    pub eager_expand: bool,
    /// Restrict conjecture proofs to the relevant subtree (local
    /// heuristic).
    pub localize_conjectures: bool,
    /// Marker starting the suffix dropped when matching relation names
    /// during replay.
    pub replay_marker: String,
}
impl SolveConf {
    /// Constructor, default values.
    pub fn new() -> Self {
        SolveConf {
            full_expand: false,
            no_conj: false,
            feasible_edges: true,
            use_underapprox: true,
            report: false,
            stratified_inlining: false,
            recursion_bound: None,
            eager_expand: false,
            localize_conjectures: false,
            replay_marker: "@@".into(),
        }
    }

    /// Sets an option from its name and a string value.
    ///
    /// Returns `false` if the name is not recognized or the value does not
    /// parse. Booleans are `"0"` or `"1"`, the recursion bound is an
    /// integer (negative deactivates it).
    pub fn set(&mut self, opt: &str, val: &str) -> bool {
        macro_rules! bool_opt {
            ($field:ident) => {
                match val {
                    "0" => {
                        self.$field = false;
                        true
                    }
                    "1" => {
                        self.$field = true;
                        true
                    }
                    _ => false,
                }
            };
        }
        match opt {
            "full_expand" => bool_opt!(full_expand),
            "no_conj" => bool_opt!(no_conj),
            "feasible_edges" => bool_opt!(feasible_edges),
            "use_underapprox" => bool_opt!(use_underapprox),
            "report" => bool_opt!(report),
            "stratified_inlining" => bool_opt!(stratified_inlining),
            "eager_expand" => bool_opt!(eager_expand),
            "localize_conjectures" => bool_opt!(localize_conjectures),
            "recursion_bound" => {
                if let Ok(bound) = val.parse::<i64>() {
                    self.recursion_bound = if bound < 0 {
                        None
                    } else {
                        Some(bound as usize)
                    };
                    true
                } else {
                    false
                }
            }
            "replay_marker" => {
                self.replay_marker = val.into();
                true
            }
            _ => false,
        }
    }
}
impl Default for SolveConf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::SolveConf;

    #[test]
    fn set_options() {
        let mut conf = SolveConf::new();
        assert!(conf.feasible_edges);
        assert!(conf.set("feasible_edges", "0"));
        assert!(!conf.feasible_edges);
        assert!(conf.set("recursion_bound", "7"));
        assert_eq!(conf.recursion_bound, Some(7));
        assert!(conf.set("recursion_bound", "-1"));
        assert_eq!(conf.recursion_bound, None);
        assert!(!conf.set("recursion_bound", "seven"));
        assert!(!conf.set("full_expand", "maybe"));
        assert!(!conf.set("unknown_option", "1"));
    }
}
