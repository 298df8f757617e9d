//! Profiling stuff.
//!
//! In `bench` mode, `Profiler` is a unit structure and the `profile!`
//! macro does nothing, so all profiling is completely removed.

#[allow(unused_imports)]
use std::time::{Duration, Instant};

/// Extends duration with a pretty printing.
pub trait DurationExt {
    /// Nice string representation.
    fn to_str(&self) -> String;
}
impl DurationExt for Duration {
    fn to_str(&self) -> String {
        format!("{}.{:0>9}", self.as_secs(), self.subsec_nanos())
    }
}

/// Profiling structure, only in `not(bench)`.
///
/// Maintains named timers and statistics using maps indexed by scope
/// names. Internally, the maps are wrapped in `RefCell`s so that mutation
/// does not require `&mut self`.
#[cfg(not(feature = "bench"))]
pub struct Profiler {
    /// Scope-indexed durations.
    map: std::cell::RefCell<
        std::collections::HashMap<Vec<&'static str>, (Option<Instant>, Duration)>,
    >,
    /// Starting tick, for total time.
    start: Instant,
    /// Other statistics.
    stats: std::cell::RefCell<std::collections::HashMap<String, usize>>,
}
#[cfg(feature = "bench")]
pub struct Profiler;

impl Profiler {
    /// Constructor.
    #[cfg(not(feature = "bench"))]
    pub fn new() -> Self {
        use std::cell::RefCell;
        Profiler {
            map: RefCell::new(std::collections::HashMap::new()),
            start: Instant::now(),
            stats: RefCell::new(std::collections::HashMap::new()),
        }
    }
    #[cfg(feature = "bench")]
    pub fn new() -> Self {
        Profiler
    }

    /// Acts on a statistic.
    #[cfg(not(feature = "bench"))]
    pub fn stat_do<F, S>(&self, stat: S, f: F)
    where
        F: Fn(usize) -> usize,
        S: Into<String>,
    {
        let stat = stat.into();
        let mut map = self.stats.borrow_mut();
        let val = map.get(&stat).cloned().unwrap_or(0);
        let _ = map.insert(stat, f(val));
    }

    /// Value of a statistic, zero if unknown.
    #[cfg(not(feature = "bench"))]
    pub fn stat_get<S: AsRef<str>>(&self, stat: S) -> usize {
        self.stats.borrow().get(stat.as_ref()).cloned().unwrap_or(0)
    }

    /// Ticks.
    #[cfg(not(feature = "bench"))]
    pub fn tick(&self, scope: Vec<&'static str>) {
        debug_assert!(!scope.is_empty());
        let mut map = self.map.borrow_mut();
        let time = map
            .entry(scope)
            .or_insert_with(|| (None, Duration::from_secs(0)));
        time.0 = Some(Instant::now())
    }

    /// Registers the time since the last tick.
    ///
    /// Does nothing if there was no tick since the last time registration.
    #[cfg(not(feature = "bench"))]
    pub fn mark(&self, scope: Vec<&'static str>) {
        debug_assert!(!scope.is_empty());
        let mut map = self.map.borrow_mut();
        if let Some(&mut (ref mut tick, ref mut sum)) = map.get_mut(&scope) {
            let mut instant = None;
            std::mem::swap(&mut instant, tick);
            if let Some(instant) = instant {
                *sum += Instant::now().duration_since(instant);
                *tick = None
            }
        }
    }

    /// Prints the timers and statistics.
    #[cfg(not(feature = "bench"))]
    pub fn print(&self) {
        use crate::common::conf;
        let total = Instant::now().duration_since(self.start);
        println!("; total {}s", total.to_str());
        let map = self.map.borrow();
        let mut scopes: Vec<_> = map.iter().collect();
        scopes.sort_by(|lft, rgt| rgt.1 .1.cmp(&lft.1 .1));
        for (scope, &(ref tick, ref time)) in scopes {
            if tick.is_some() {
                warn!("scope `{}` is still live", scope.join("/"))
            }
            println!(";   {}s {}", time.to_str(), conf.emph(scope.join("/")))
        }
        let stats = self.stats.borrow();
        let mut stats: Vec<_> = stats.iter().collect();
        stats.sort();
        for (stat, count) in stats {
            println!(";   {}: {}", conf.emph(stat), count)
        }
    }

    #[cfg(feature = "bench")]
    #[inline]
    pub fn stat_do<F, S>(&self, _: S, _: F) {}
    #[cfg(feature = "bench")]
    #[inline]
    pub fn stat_get<S>(&self, _: S) -> usize {
        0
    }
    #[cfg(feature = "bench")]
    #[inline]
    pub fn tick(&self, _: Vec<&'static str>) {}
    #[cfg(feature = "bench")]
    #[inline]
    pub fn mark(&self, _: Vec<&'static str>) {}
    #[cfg(feature = "bench")]
    #[inline]
    pub fn print(&self) {}
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}
