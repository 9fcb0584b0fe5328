//! The clocked rasterizer unit.

use std::collections::VecDeque;

use ax_model_core::{ClockedUnit, Signal, Statistics, TriangleSetupInput};
use log::debug;

use crate::fragment::Stamp;
use crate::setup::TriangleId;
use crate::{RasterizerCore, RasterizerConfig};

/// Which scan engine drives fragment generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Tiled scanline walk with save/restore slots.
    Scanline,
    /// Recursive hierarchical descent (the default).
    Recursive,
}

/// The rasterizer pipeline stage: pulls triangles from the clipper, runs
/// setup and the configured scan engine, and pushes 2x2 stamps downstream
/// under demand-driven back-pressure.
///
/// Triangle order is preserved: a triangle's stamps are fully emitted
/// before the next triangle starts. Every emitted stamp carries one
/// reference on its setup triangle; the consumer returns it through
/// `release_in` when done, and the table entry frees once the rasterizer
/// has also dropped its own reference at the last fragment.
pub struct Rasterizer {
    core: RasterizerCore,
    mode: ScanMode,

    /// Triangles set up and waiting for their scan to start, in order.
    pending: VecDeque<TriangleId>,
    /// Triangle currently being scanned.
    current: Option<TriangleId>,
    /// Stamps the downstream consumer has asked for.
    demand: u32,
    /// Stamps emitted per cycle at most.
    stamps_cycle: u32,
    /// Recursive updates allowed per cycle.
    updates_cycle: u32,
    /// Triangle demand outstanding towards the clipper.
    requested_triangles: usize,

    pub triangle_in: Signal<TriangleSetupInput>,
    pub request_out: Signal<u32>,
    pub stamp_out: Signal<Stamp>,
    pub stamp_request_in: Signal<u32>,
    pub release_in: Signal<TriangleId>,

    stats: Statistics,
}

impl Rasterizer {
    pub fn new(cfg: RasterizerConfig, mode: ScanMode, stamps_cycle: u32) -> Rasterizer {
        Rasterizer {
            core: RasterizerCore::new(cfg),
            mode,
            pending: VecDeque::new(),
            current: None,
            demand: 0,
            stamps_cycle,
            updates_cycle: 4,
            requested_triangles: 0,
            triangle_in: Signal::new("RasterizerTriangle", 2, 1),
            request_out: Signal::new("RasterizerTriangleRequest", 1, 1),
            stamp_out: Signal::new("RasterizerStamp", stamps_cycle.max(1), 1),
            stamp_request_in: Signal::new("RasterizerStampRequest", 1, 1),
            release_in: Signal::new("RasterizerRelease", 8, 1),
            stats: Statistics::new("Rasterizer"),
        }
    }

    pub fn core(&self) -> &RasterizerCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut RasterizerCore {
        &mut self.core
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// True when every accepted triangle has been fully rasterized.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    fn msaa_enabled(&self) -> bool {
        self.core.config().msaa_samples > 1
    }

    /// Starts the scan of the next pending triangle.
    fn start_next(&mut self) {
        if let Some(id) = self.pending.pop_front() {
            let msaa = self.msaa_enabled();
            match self.mode {
                ScanMode::Recursive => self.core.start_recursive(&[id], msaa),
                ScanMode::Scanline => self.core.start_position(id, msaa),
            }
            self.current = Some(id);
        }
    }

    /// Pulls the next stamp out of the active scan engine.
    fn next_stamp(&mut self, id: TriangleId) -> Option<Stamp> {
        match self.mode {
            ScanMode::Recursive => {
                let mut updates = self.updates_cycle;
                loop {
                    if let Some((stamp, _source)) = self.core.next_stamp_recursive() {
                        return Some(stamp);
                    }
                    if self.core.last_fragment(id) || updates == 0 {
                        return None;
                    }
                    self.core.update_recursive();
                    updates -= 1;
                }
            }
            ScanMode::Scanline => self.core.next_stamp_tiled(id),
        }
    }

    fn emit_stamps(&mut self, cycle: u64) {
        let mut slots = self.stamps_cycle;
        while slots > 0 && self.demand > 0 && self.stamp_out.can_write(cycle) {
            let Some(id) = self.current else { break };
            let Some(mut stamp) = self.next_stamp(id) else {
                if self.core.last_fragment(id) {
                    debug!("Rasterizer: cycle {cycle}: triangle {id} finished");
                    self.core.destroy_triangle(id);
                    self.current = None;
                    self.start_next();
                    continue;
                }
                break;
            };

            if self.msaa_enabled() {
                let samples = self.core.config().msaa_samples;
                for f in &mut stamp.fragments {
                    self.core.compute_msaa_samples(f, samples);
                }
            }

            let last = stamp.is_last();
            // Fully-culled stamps are dropped unless they carry the last
            // fragment mark, which downstream needs for lifetime tracking.
            if stamp.covered() > 0 || last {
                self.core.retain(stamp.triangle);
                self.stats.inc("stamps");
                self.stats.add("fragments", crate::STAMP_FRAGMENTS as u64);
                self.stamp_out.write(cycle, stamp);
                self.demand -= 1;
                slots -= 1;
            } else {
                self.stats.inc("culled_stamps");
            }

            if last {
                self.core.destroy_triangle(id);
                self.current = None;
                self.start_next();
            }
        }
    }
}

impl ClockedUnit for Rasterizer {
    fn clock(&mut self, cycle: u64) {
        // Returned references from the consumer.
        while let Some(id) = self.release_in.read(cycle) {
            self.core.release(id);
        }

        // Downstream stamp demand.
        while let Some(n) = self.stamp_request_in.read(cycle) {
            self.demand += n;
        }

        // New triangles from the clipper: setup right away, scan later.
        while let Some(tri) = self.triangle_in.read(cycle) {
            self.requested_triangles = self.requested_triangles.saturating_sub(1);
            let [v1, v2, v3] = tri.vertices;
            let id = self.core.setup(v1, v2, v3);
            self.stats.inc("triangles");
            self.pending.push_back(id);
        }

        if self.current.is_none() {
            self.start_next();
        }

        self.emit_stamps(cycle);

        // Ask the clipper for as many triangles as the setup table can
        // still take, counting requests already in flight.
        let free = self.core.free_setup_slots();
        if free > self.requested_triangles && self.request_out.can_write(cycle) {
            let ask = (free - self.requested_triangles) as u32;
            self.request_out.write(cycle, ask);
            self.requested_triangles += ask as usize;
        }
    }

    fn name(&self) -> &'static str {
        "Rasterizer"
    }

    fn state_line(&self) -> String {
        format!(
            "Rasterizer: current {:?}, {} pending, demand {}",
            self.current,
            self.pending.len(),
            self.demand
        )
    }
}
