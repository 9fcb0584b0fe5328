//! The pipeline hub: unit instantiation, per-cycle message forwarding and
//! output collection.

use std::collections::{HashMap, VecDeque};

use ax_clipper::{Clipper, ClipperCommand};
use ax_membus::LatencyMemory;
use ax_model_core::{ClockedUnit, TriangleSetupInput};
use ax_raster::{Fragment, Rasterizer, Stamp};
use ax_shader::input::{ShaderInput, ShaderInputId, ShaderOutput};
use ax_shader::isa::{Bank, Opcode, Operand, ShaderInstr};
use ax_shader::ShaderFetch;
use ax_streamer::cache::{IndexRequest, StreamerCommand, StreamerOutputCache};
use ax_streamer::commit::{CommittedPrimitive, StreamerCommit};
use ax_streamer::loader::{StreamerLoader, VertexJob};
use glam::Vec4;

use crate::config::PipelineConfig;

/// Coverage and depth metadata kept next to a fragment while it shades.
#[derive(Clone, Copy, Debug)]
struct FragmentMeta {
    zc: u32,
    inside: bool,
}

/// A fragment after shading, ready for the depth/color stages downstream.
#[derive(Clone, Debug)]
pub struct ShadedFragment {
    pub triangle: u32,
    pub x: i32,
    pub y: i32,
    pub zc: u32,
    /// Sample-point coverage of the fragment.
    pub inside: bool,
    /// Killed by the shader program.
    pub kill: bool,
    pub outputs: Vec<Vec4>,
    pub z_exports: Vec<f32>,
}

/// The assembled core. Feed triangles and vertex jobs, clock it, read the
/// shaded streams.
pub struct Pipeline {
    cfg: PipelineConfig,
    cycle: u64,

    clipper: Clipper,
    rasterizer: Rasterizer,
    fragment_shader: ShaderFetch,
    vertex_shader: ShaderFetch,
    loader: StreamerLoader,
    output_cache: StreamerOutputCache,
    commit: StreamerCommit,
    memory: LatencyMemory,

    /// Triangles waiting to enter the clipper.
    triangle_queue: VecDeque<TriangleSetupInput>,
    /// Vertex jobs waiting to enter the output cache lookup.
    vertex_queue: VecDeque<VertexJob>,
    /// Jobs whose lookup missed, on their way to the loader.
    miss_queue: VecDeque<(VertexJob, u32)>,
    /// Output-memory line each in-flight vertex will land in.
    vertex_lines: HashMap<(u32, u32), u32>,
    /// Shaded vertices stored per output-memory line.
    output_memory: Vec<Option<ShaderOutput>>,
    /// Cache hits whose line data has not landed yet.
    pending_hits: VecDeque<u32>,

    fragment_meta: HashMap<(u32, i32, i32), FragmentMeta>,
    /// Demand counters already handed to the producer signals.
    stamp_demand: u32,
    fragment_output_demand: u32,
    vertex_output_demand: u32,
    /// Fragment shader capacity last advertised on its ready signal.
    fragment_ready: u32,

    pub shaded_fragments: Vec<ShadedFragment>,
    pub shaded_vertices: Vec<ShaderOutput>,
    /// Primitives assembled by the commit stage, named by cache lines.
    pub assembled_primitives: Vec<CommittedPrimitive>,
}

/// Pass-through programs loaded by default: the vertex program copies its
/// inputs to the outputs, the fragment program copies the interpolated
/// attributes.
fn passthrough_program(attributes: usize) -> Vec<ShaderInstr> {
    let mut program = Vec::with_capacity(attributes + 1);
    for a in 0..attributes as u32 {
        program.push(
            ShaderInstr::new(Opcode::Mov)
                .src(0, Operand::reg(Bank::In, a))
                .dst(Bank::Out, a),
        );
    }
    program.push(ShaderInstr::new(Opcode::End));
    program
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig) -> Pipeline {
        cfg.validate();

        let mut clipper = Clipper::new(cfg.triangles_cycle, cfg.clip_buffer_size, 0);
        let rasterizer = Rasterizer::new(cfg.raster.clone(), cfg.scan_mode, cfg.stamps_cycle);
        let mut fragment_shader = ShaderFetch::new(cfg.shader.clone());
        let mut vertex_shader = ShaderFetch::new(cfg.shader.clone());
        let loader = StreamerLoader::new(cfg.stream.clone(), 2);
        let mut output_cache = StreamerOutputCache::new(2, cfg.output_cache_lines, 2, 1, 2);
        let commit = StreamerCommit::new(4);
        let memory = LatencyMemory::new(cfg.memory_size, cfg.memory_latency, cfg.memory_queue);

        // Default programs so the pipeline shades without explicit setup.
        let vertex_program = passthrough_program(cfg.stream.attributes);
        let fragment_program = passthrough_program(cfg.raster.fragment_attributes.min(8));
        vertex_shader.emulator_mut().load_program(&vertex_program, 0);
        fragment_shader
            .emulator_mut()
            .load_program(&fragment_program, cfg.shader.init_pc[1]);

        // Bring the command-driven units into their running states.
        clipper.clock(0);
        clipper.command_in.write(0, ClipperCommand::Draw);
        output_cache.clock(0);
        output_cache.command_in.write(0, StreamerCommand::Start);

        let output_lines = cfg.output_cache_lines;

        Pipeline {
            cfg,
            cycle: 1,
            clipper,
            rasterizer,
            fragment_shader,
            vertex_shader,
            loader,
            output_cache,
            commit,
            memory,
            triangle_queue: VecDeque::new(),
            vertex_queue: VecDeque::new(),
            miss_queue: VecDeque::new(),
            vertex_lines: HashMap::new(),
            output_memory: vec![None; output_lines],
            pending_hits: VecDeque::new(),
            fragment_meta: HashMap::new(),
            stamp_demand: 0,
            fragment_output_demand: 0,
            vertex_output_demand: 0,
            fragment_ready: 0,
            shaded_fragments: Vec::new(),
            shaded_vertices: Vec::new(),
            assembled_primitives: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn clipper(&self) -> &Clipper {
        &self.clipper
    }

    pub fn rasterizer(&self) -> &Rasterizer {
        &self.rasterizer
    }

    pub fn rasterizer_mut(&mut self) -> &mut Rasterizer {
        &mut self.rasterizer
    }

    pub fn fragment_shader_mut(&mut self) -> &mut ShaderFetch {
        &mut self.fragment_shader
    }

    pub fn vertex_shader_mut(&mut self) -> &mut ShaderFetch {
        &mut self.vertex_shader
    }

    pub fn output_cache(&self) -> &StreamerOutputCache {
        &self.output_cache
    }

    pub fn memory_mut(&mut self) -> &mut LatencyMemory {
        &mut self.memory
    }

    /// Queues a transformed triangle for the clipper.
    pub fn feed_triangle(&mut self, triangle: TriangleSetupInput) {
        self.triangle_queue.push_back(triangle);
    }

    /// Queues an indexed vertex for loading and shading.
    pub fn feed_vertex_job(&mut self, job: VertexJob) {
        self.vertex_queue.push_back(job);
    }

    /// Converts an inside (or helper) fragment into a shader input, using
    /// the MSAA centroid for attribute sampling under partial coverage.
    fn fragment_to_input(&self, fragment: &Fragment) -> ShaderInput {
        let core = self.rasterizer.core();
        let attributes = match &fragment.msaa {
            Some(msaa) if msaa.any_inside && msaa.coverage.iter().any(|c| !c) => {
                let mut centroid = fragment.clone();
                centroid.coords = msaa.centroid;
                core.interpolate_all(&centroid)
            }
            _ => core.interpolate_all(fragment),
        };
        ShaderInput::fragment(fragment.triangle, fragment.x, fragment.y, attributes)
    }

    fn forward_fragment_path(&mut self, cycle: u64) {
        // Clipper <- external triangles.
        while !self.triangle_queue.is_empty() && self.clipper.triangle_in.can_write(cycle) {
            let tri = self.triangle_queue.pop_front().unwrap();
            self.clipper.triangle_in.write(cycle, tri);
        }

        // Clipper <-> rasterizer handshake.
        while let Some(n) = self.rasterizer.request_out.read(cycle) {
            if self.clipper.rast_request_in.can_write(cycle) {
                self.clipper.rast_request_in.write(cycle, n);
            }
        }
        while let Some(tri) = self.clipper.triangle_out.read(cycle) {
            self.rasterizer.triangle_in.write(cycle, tri);
        }
        // Primitive assembly back-pressure is external; drain the signal.
        while self.clipper.request_out.read(cycle).is_some() {}

        // Track the fragment shader's advertised input capacity.
        while let Some(n) = self.fragment_shader.ready_out.read(cycle) {
            self.fragment_ready = n;
        }

        // Keep stamp demand topped up against shader capacity.
        if self.stamp_demand < 16 && self.rasterizer.stamp_request_in.can_write(cycle) {
            self.rasterizer.stamp_request_in.write(cycle, 8);
            self.stamp_demand += 8;
        }

        // Stamps into fragment shader inputs, four threads per stamp, at
        // most two stamps per cycle.
        let mut accepted = 0;
        while accepted < 2 && self.fragment_ready >= ax_raster::STAMP_FRAGMENTS as u32 {
            let Some(stamp) = self.rasterizer.stamp_out.read(cycle) else { break };
            self.stamp_demand = self.stamp_demand.saturating_sub(1);
            self.fragment_ready -= ax_raster::STAMP_FRAGMENTS as u32;
            self.accept_stamp(cycle, stamp);
            accepted += 1;
        }

        // Drain shaded fragments.
        if self.fragment_output_demand < 16 && self.fragment_shader.output_request_in.can_write(cycle) {
            self.fragment_shader.output_request_in.write(cycle, 16);
            self.fragment_output_demand += 16;
        }
        while let Some(out) = self.fragment_shader.output_out.read(cycle) {
            self.fragment_output_demand = self.fragment_output_demand.saturating_sub(1);
            self.collect_fragment(out);
        }
    }

    fn accept_stamp(&mut self, cycle: u64, stamp: Stamp) {
        for fragment in &stamp.fragments {
            let input = self.fragment_to_input(fragment);
            self.fragment_meta.insert(
                (fragment.triangle, fragment.x, fragment.y),
                FragmentMeta {
                    zc: fragment.zc,
                    inside: fragment.inside,
                },
            );
            self.fragment_shader.input_in.write(cycle, input);
        }
        // Attributes are interpolated; the setup triangle reference can go
        // back to the rasterizer.
        self.rasterizer.release_in.write(cycle, stamp.triangle);
    }

    fn collect_fragment(&mut self, out: ShaderOutput) {
        let ShaderInputId::Fragment { triangle, x, y } = out.input.id else {
            return;
        };
        let meta = self
            .fragment_meta
            .remove(&(triangle, x, y))
            .unwrap_or(FragmentMeta { zc: 0, inside: false });
        self.shaded_fragments.push(ShadedFragment {
            triangle,
            x,
            y,
            zc: meta.zc,
            inside: meta.inside,
            kill: out.input.kill,
            outputs: out.outputs,
            z_exports: out.z_exports,
        });
    }

    fn forward_vertex_path(&mut self, cycle: u64) {
        // Jobs enter the output cache lookup.
        while let Some(job) = self.vertex_queue.front() {
            if !self.output_cache.index_in.can_write(cycle) {
                break;
            }
            let job = *job;
            self.vertex_queue.pop_front();
            self.output_cache.index_in.write(
                cycle,
                IndexRequest {
                    index: job.index,
                    instance: job.instance,
                },
            );
            self.miss_queue.push_back((job, u32::MAX));
        }

        // Lookup results: hits reuse the stored vertex, misses load.
        while let Some(lookup) = self.output_cache.lookup_out.read(cycle) {
            let position = self
                .miss_queue
                .iter()
                .position(|(job, line)| {
                    job.index == lookup.index && job.instance == lookup.instance && *line == u32::MAX
                });
            let Some(position) = position else { continue };
            if lookup.hit {
                let (job, _) = self.miss_queue.remove(position).unwrap();
                // The tagged line may still be shading; park the hit until
                // its data lands in output memory.
                self.pending_hits.push_back(lookup.line);
                // A batch-ending vertex that hits never reaches the
                // shader, so the open wavefronts close here instead.
                if job.last_in_batch {
                    self.vertex_shader.close_open_wavefronts();
                }
            } else {
                self.miss_queue[position].1 = lookup.line;
                let (job, line) = self.miss_queue.remove(position).unwrap();
                self.vertex_lines.insert((job.instance, job.index), line);
                self.loader.job_in.write(cycle, job);
            }
        }

        // Loader <-> memory bridging.
        while let Some(req) = self.loader.mem_request_out.read(cycle) {
            self.memory.request_in.write(cycle, req);
        }
        while let Some(resp) = self.memory.response_out.read(cycle) {
            self.loader.mem_response_in.write(cycle, resp);
        }
        while let Some(state) = self.memory.state_out.read(cycle) {
            self.loader.mem_state_in.write(cycle, state);
        }

        // Loader <-> vertex shader handshake.
        while let Some(n) = self.vertex_shader.ready_out.read(cycle) {
            if self.loader.shader_ready_in.can_write(cycle) {
                self.loader.shader_ready_in.write(cycle, n);
            }
        }
        while let Some(input) = self.loader.shader_out.read(cycle) {
            self.vertex_shader.input_in.write(cycle, input);
        }

        // Drain shaded vertices into the output memory and the collector.
        if self.vertex_output_demand < 16 && self.vertex_shader.output_request_in.can_write(cycle) {
            self.vertex_shader.output_request_in.write(cycle, 16);
            self.vertex_output_demand += 16;
        }
        loop {
            // A vertex consumed here must also report its line use to the
            // commit stage, so both channels need room.
            if !self.commit.use_in.can_write(cycle) {
                break;
            }
            let Some(out) = self.vertex_shader.output_out.read(cycle) else {
                break;
            };
            self.vertex_output_demand = self.vertex_output_demand.saturating_sub(1);
            if let ShaderInputId::Vertex { instance, index } = out.input.id {
                if let Some(&line) = self.vertex_lines.get(&(instance, index)) {
                    if (line as usize) >= self.output_memory.len() {
                        self.output_memory.resize(line as usize + 1, None);
                    }
                    self.output_memory[line as usize] = Some(out.clone());
                    self.output_cache.update_line(line, index, instance);
                    self.commit.use_in.write(cycle, line);
                }
            }
            self.shaded_vertices.push(out);
        }

        // Hits whose data has arrived by now.
        while let Some(&line) = self.pending_hits.front() {
            if !self.commit.use_in.can_write(cycle) {
                break;
            }
            let Some(stored) = self
                .output_memory
                .get(line as usize)
                .and_then(|s| s.clone())
            else {
                break;
            };
            self.pending_hits.pop_front();
            self.commit.use_in.write(cycle, line);
            self.shaded_vertices.push(stored);
        }

        // Commit output: assembled primitives and line retirement notices
        // for the output cache.
        while let Some(primitive) = self.commit.primitive_out.read(cycle) {
            self.assembled_primitives.push(primitive);
        }
        while let Some(notice) = self.commit.dealloc_out.read(cycle) {
            if self.output_cache.dealloc_in.can_write(cycle) {
                self.output_cache.dealloc_in.write(cycle, notice);
            }
        }
    }

    /// One simulation cycle: forward messages, then clock every unit.
    pub fn clock(&mut self) {
        let cycle = self.cycle;

        self.forward_fragment_path(cycle);
        self.forward_vertex_path(cycle);

        self.clipper.clock(cycle);
        self.rasterizer.clock(cycle);
        self.fragment_shader.clock(cycle);
        self.output_cache.clock(cycle);
        self.loader.clock(cycle);
        self.vertex_shader.clock(cycle);
        self.commit.clock(cycle);
        self.memory.clock(cycle);

        self.cycle += 1;
    }

    /// True when no work remains anywhere in the core.
    pub fn is_idle(&self) -> bool {
        self.triangle_queue.is_empty()
            && self.vertex_queue.is_empty()
            && self.miss_queue.is_empty()
            && self.rasterizer.is_idle()
            && self.fragment_shader.is_idle()
            && self.vertex_shader.is_idle()
            && self.loader.is_idle()
            && self.fragment_meta.is_empty()
            && self.pending_hits.is_empty()
    }

    /// Clocks until the core drains or the cycle budget runs out; returns
    /// the cycles spent.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> u64 {
        let start = self.cycle;
        // A few settle cycles so in-flight signals fully drain.
        let mut settle = 0;
        while self.cycle - start < max_cycles {
            self.clock();
            if self.is_idle() {
                settle += 1;
                if settle > 8 {
                    break;
                }
            } else {
                settle = 0;
            }
        }
        self.cycle - start
    }

    /// Statistics dump across all units.
    pub fn dump_stats(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.clipper.stats().dump());
        out.push_str(&self.rasterizer.stats().dump());
        out.push_str(&self.fragment_shader.stats().dump());
        out.push_str(&self.vertex_shader.stats().dump());
        out.push_str(&self.output_cache.stats().dump());
        out.push_str(&self.commit.stats().dump());
        out.push_str(&self.loader.stats().dump());
        out
    }
}
