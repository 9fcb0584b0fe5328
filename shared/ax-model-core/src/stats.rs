//! Per-component named statistic counters.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A set of named u64 counters owned by one component.
///
/// Counters are created on first use; `dump` renders them sorted by name so
/// runs are comparable.
#[derive(Default)]
pub struct Statistics {
    owner: &'static str,
    counters: BTreeMap<&'static str, u64>,
}

impl Statistics {
    pub fn new(owner: &'static str) -> Statistics {
        Statistics {
            owner,
            counters: BTreeMap::new(),
        }
    }

    /// Increments a counter by one.
    pub fn inc(&mut self, name: &'static str) {
        *self.counters.entry(name).or_insert(0) += 1;
    }

    /// Adds `n` to a counter.
    pub fn add(&mut self, name: &'static str, n: u64) {
        *self.counters.entry(name).or_insert(0) += n;
    }

    /// Current value of a counter (zero when never touched).
    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Renders all counters as `owner.name = value` lines.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.counters {
            let _ = writeln!(out, "{}.{} = {}", self.owner, name, value);
        }
        out
    }
}
