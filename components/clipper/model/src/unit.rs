//! The clipper clocked unit.

use std::collections::VecDeque;

use ax_model_core::{fatal, ClockedUnit, Signal, Statistics, TriangleSetupInput};
use log::debug;

use crate::frustum::trivial_reject;

/// Commands driving the clipper state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClipperCommand {
    Reset,
    /// Start accepting triangles for a batch.
    Draw,
    /// Close the current batch.
    End,
    /// Enable or disable the frustum rejection test.
    SetFrustumClip(bool),
    /// Select the clip-space depth convention: [0,1] (D3D9) or [-1,1].
    SetD3d9DepthRange(bool),
}

/// Clipper state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClipperState {
    Reset,
    Ready,
    Draw,
    End,
}

/// The trivial-reject clipper.
///
/// Receives triangles from primitive assembly, rejects those fully outside
/// the frustum, and forwards the rest to triangle setup, paced by the
/// rasterizer's request signal. Rejection is a normal outcome, never an
/// error.
pub struct Clipper {
    state: ClipperState,
    frustum_clip: bool,
    d3d9_depth_range: bool,

    buffer: VecDeque<TriangleSetupInput>,
    buffer_size: usize,
    /// Triangles the rasterizer has asked for and not yet received.
    requested_triangles: u32,
    /// Cycles until the reject unit accepts the next triangle.
    clip_cycles: u32,
    exec_latency: u32,
    triangle_count: u64,

    pub command_in: Signal<ClipperCommand>,
    pub triangle_in: Signal<TriangleSetupInput>,
    /// Free-slot count advertised to primitive assembly.
    pub request_out: Signal<u32>,
    pub triangle_out: Signal<TriangleSetupInput>,
    /// Triangle demand arriving from the rasterizer.
    pub rast_request_in: Signal<u32>,

    stats: Statistics,
}

impl Clipper {
    pub fn new(triangles_cycle: u32, buffer_size: usize, exec_latency: u32) -> Clipper {
        assert!(triangles_cycle > 0, "at least one triangle per cycle");
        assert!(buffer_size > 0, "clip buffer requires at least one entry");
        Clipper {
            state: ClipperState::Reset,
            frustum_clip: true,
            d3d9_depth_range: false,
            buffer: VecDeque::with_capacity(buffer_size),
            buffer_size,
            requested_triangles: 0,
            clip_cycles: 0,
            exec_latency,
            triangle_count: 0,
            command_in: Signal::new("ClipperCommand", 1, 1),
            triangle_in: Signal::new("ClipperInput", triangles_cycle, 1),
            request_out: Signal::new("ClipperRequest", 1, 1),
            triangle_out: Signal::new("ClipperOutput", triangles_cycle, 1),
            rast_request_in: Signal::new("RasterizerRequest", 1, 1),
            stats: Statistics::new("Clipper"),
        }
    }

    pub fn state(&self) -> ClipperState {
        self.state
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Triangles processed in the current batch.
    pub fn triangle_count(&self) -> u64 {
        self.triangle_count
    }

    fn process_command(&mut self, cycle: u64, command: ClipperCommand) {
        match command {
            ClipperCommand::Reset => {
                self.buffer.clear();
                self.requested_triangles = 0;
                self.clip_cycles = 0;
                self.triangle_count = 0;
                self.state = ClipperState::Reset;
            }
            ClipperCommand::Draw => {
                if self.state != ClipperState::Ready {
                    fatal!("Clipper", cycle, "DRAW received outside READY state");
                }
                self.triangle_count = 0;
                self.state = ClipperState::Draw;
            }
            ClipperCommand::End => {
                if self.state != ClipperState::Draw {
                    fatal!("Clipper", cycle, "END received outside DRAW state");
                }
                self.state = ClipperState::End;
            }
            ClipperCommand::SetFrustumClip(enable) => self.frustum_clip = enable,
            ClipperCommand::SetD3d9DepthRange(enable) => self.d3d9_depth_range = enable,
        }
    }
}

impl ClockedUnit for Clipper {
    fn clock(&mut self, cycle: u64) {
        match self.state {
            ClipperState::Reset => {
                self.buffer.clear();
                self.requested_triangles = 0;
                self.state = ClipperState::Ready;
            }
            ClipperState::Ready => {
                if let Some(command) = self.command_in.read(cycle) {
                    self.process_command(cycle, command);
                }
            }
            ClipperState::Draw => {
                if let Some(command) = self.command_in.read(cycle) {
                    self.process_command(cycle, command);
                }

                // Accumulate rasterizer demand.
                while let Some(n) = self.rast_request_in.read(cycle) {
                    self.requested_triangles += n;
                }

                // Test incoming triangles while the reject unit is free and
                // the clip buffer has room.
                while self.clip_cycles == 0 && self.buffer.len() < self.buffer_size {
                    let Some(tri) = self.triangle_in.read(cycle) else {
                        break;
                    };
                    self.stats.inc("inputs");
                    self.triangle_count += 1;
                    let rejected = self.frustum_clip
                        && trivial_reject(
                            tri.position(0),
                            tri.position(1),
                            tri.position(2),
                            self.d3d9_depth_range,
                        );
                    if rejected {
                        debug!("Clipper: cycle {cycle}: triangle {} rejected", tri.id);
                        self.stats.inc("clipped");
                    } else {
                        self.buffer.push_back(tri);
                    }
                    self.clip_cycles = self.exec_latency;
                }
                self.clip_cycles = self.clip_cycles.saturating_sub(1);

                // Forward clipped triangles on rasterizer demand.
                while self.requested_triangles > 0
                    && !self.buffer.is_empty()
                    && self.triangle_out.can_write(cycle)
                {
                    let tri = self.buffer.pop_front().unwrap();
                    self.stats.inc("outputs");
                    self.requested_triangles -= 1;
                    self.triangle_out.write(cycle, tri);
                }

                // Advertise remaining buffer room to primitive assembly.
                if self.request_out.can_write(cycle) {
                    let free = (self.buffer_size - self.buffer.len()) as u32;
                    self.request_out.write(cycle, free);
                }
            }
            ClipperState::End => {
                // Drain the buffer, then return to ready.
                while self.requested_triangles > 0
                    && !self.buffer.is_empty()
                    && self.triangle_out.can_write(cycle)
                {
                    let tri = self.buffer.pop_front().unwrap();
                    self.stats.inc("outputs");
                    self.requested_triangles -= 1;
                    self.triangle_out.write(cycle, tri);
                }
                while let Some(n) = self.rast_request_in.read(cycle) {
                    self.requested_triangles += n;
                }
                if self.buffer.is_empty() {
                    self.state = ClipperState::Ready;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "Clipper"
    }

    fn state_line(&self) -> String {
        format!(
            "Clipper: {:?}, {} buffered, {} requested",
            self.state,
            self.buffer.len(),
            self.requested_triangles
        )
    }
}
