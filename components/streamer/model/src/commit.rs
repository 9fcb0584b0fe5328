//! The streamer commit stage.
//!
//! Consumes shaded vertices in stream order, assembles them into
//! primitives for the downstream assembly stage, and retires output-memory
//! lines back to the cache. Deallocation is speculative: the line is
//! announced first and confirmed one cycle later, unless the stream
//! re-referenced it in between, in which case the confirmation is withheld
//! and the cache re-validates the line.

use std::collections::HashMap;

use ax_model_core::{ClockedUnit, Signal, Statistics};
use log::debug;

use crate::cache::DeallocNotice;

/// One vertex use entering the commit stage: the output-memory line the
/// shaded vertex lives in.
pub type LineUse = u32;

/// Three shaded vertices forming a primitive, named by their lines.
pub type CommittedPrimitive = [u32; 3];

/// The commit clocked unit.
pub struct StreamerCommit {
    /// Uses collected towards the next primitive.
    pending: Vec<u32>,
    /// Outstanding uses per line; a line retires at zero.
    references: HashMap<u32, u32>,
    /// Lines announced for deallocation, awaiting confirmation.
    announced: Vec<(u32, u64)>,

    pub use_in: Signal<LineUse>,
    pub primitive_out: Signal<CommittedPrimitive>,
    pub dealloc_out: Signal<DeallocNotice>,

    stats: Statistics,
}

impl StreamerCommit {
    pub fn new(vertices_cycle: u32) -> StreamerCommit {
        StreamerCommit {
            pending: Vec::new(),
            references: HashMap::new(),
            announced: Vec::new(),
            use_in: Signal::new("CommitUse", vertices_cycle.max(1), 1),
            primitive_out: Signal::new("CommitPrimitive", 1, 1),
            dealloc_out: Signal::new("CommitDealloc", 2 * vertices_cycle.max(1), 1),
            stats: Statistics::new("StreamerCommit"),
        }
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// True when no primitive is half-assembled and no line awaits its
    /// confirmation.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.announced.is_empty()
    }
}

impl ClockedUnit for StreamerCommit {
    fn clock(&mut self, cycle: u64) {
        // Confirm lines announced last cycle that were not re-referenced.
        let mut keep = Vec::new();
        for (line, announced_at) in self.announced.drain(..) {
            if announced_at >= cycle {
                keep.push((line, announced_at));
                continue;
            }
            if self.references.get(&line).copied().unwrap_or(0) > 0 {
                // Re-referenced while speculative: the cache re-validates
                // the line on its own; no confirmation goes out.
                self.stats.inc("cancelled_deallocs");
            } else if self.dealloc_out.can_write(cycle) {
                self.dealloc_out.write(cycle, DeallocNotice::Confirm(line));
                self.stats.inc("confirmed_deallocs");
            } else {
                keep.push((line, announced_at));
            }
        }
        self.announced = keep;

        // Collect vertex uses into primitives.
        while let Some(line) = self.use_in.read(cycle) {
            *self.references.entry(line).or_insert(0) += 1;
            self.pending.push(line);
            self.stats.inc("uses");

            if self.pending.len() == 3 {
                let primitive: CommittedPrimitive =
                    [self.pending[0], self.pending[1], self.pending[2]];
                self.pending.clear();
                if self.primitive_out.can_write(cycle) {
                    self.primitive_out.write(cycle, primitive);
                }
                self.stats.inc("primitives");

                // Retire the three uses; lines reaching zero are announced
                // for deallocation.
                for line in primitive {
                    let count = self.references.get_mut(&line).unwrap();
                    *count -= 1;
                    if *count == 0 {
                        self.references.remove(&line);
                        if self.dealloc_out.can_write(cycle) {
                            debug!("StreamerCommit: cycle {cycle}: dealloc line {line}");
                            self.dealloc_out.write(cycle, DeallocNotice::Dealloc(line));
                            self.announced.push((line, cycle));
                        }
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "StreamerCommit"
    }

    fn state_line(&self) -> String {
        format!(
            "StreamerCommit: {} pending uses, {} announced",
            self.pending.len(),
            self.announced.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_uses_make_a_primitive() {
        let mut commit = StreamerCommit::new(4);
        for line in [0u32, 1, 2] {
            commit.use_in.write(0, line);
        }
        commit.clock(1);
        assert_eq!(commit.primitive_out.read(2), Some([0, 1, 2]));
    }

    #[test]
    fn retired_lines_are_announced_then_confirmed() {
        let mut commit = StreamerCommit::new(4);
        for line in [0u32, 1, 2] {
            commit.use_in.write(0, line);
        }
        commit.clock(1);

        let mut deallocs = 0;
        let mut confirms = 0;
        commit.clock(2);
        for cycle in 2..5 {
            while let Some(notice) = commit.dealloc_out.read(cycle) {
                match notice {
                    DeallocNotice::Dealloc(_) => deallocs += 1,
                    DeallocNotice::Confirm(_) => confirms += 1,
                }
            }
            commit.clock(cycle + 1);
        }
        assert_eq!(deallocs, 3);
        assert_eq!(confirms, 3);
    }

    #[test]
    fn reuse_within_the_window_withholds_confirmation() {
        let mut commit = StreamerCommit::new(8);
        // Line 7 closes a primitive and is immediately re-referenced.
        for line in [5u32, 6, 7] {
            commit.use_in.write(0, line);
        }
        commit.use_in.write(0, 7);
        commit.clock(1);
        commit.clock(2);
        commit.clock(3);

        let mut confirmed_7 = false;
        for cycle in 1..6 {
            while let Some(notice) = commit.dealloc_out.read(cycle) {
                if let DeallocNotice::Confirm(7) = notice {
                    confirmed_7 = true;
                }
            }
        }
        assert!(!confirmed_7, "a re-referenced line must not confirm");
        assert_eq!(commit.stats().get("cancelled_deallocs"), 1);
    }
}
