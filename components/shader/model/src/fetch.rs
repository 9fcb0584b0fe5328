//! The shader front end: thread table, wavefront fetch and scheduling.
//!
//! Threads move through FREE -> FILLED -> READY -> EXECUTING with excursions
//! to BLOCKED (texture pending, derivation quad incomplete, output full) and
//! retire through END -> DRAINING -> FREE once their output is transmitted.
//!
//! Three scheduling modes are supported, fixed at construction:
//! lock-step wavefronts (all lanes advance one shared PC), a thread window
//! (scan up to `window_size` threads for a ready one), and swap-on-block
//! (stay on the current thread until it stalls).

use std::collections::{BTreeSet, VecDeque};

use ax_model_core::{fatal, ClockedUnit, Signal, Statistics};
use glam::Vec4;
use log::debug;

use crate::emu::{ShaderEmulator, PARTITION_INSTRUCTIONS};
use crate::input::{ShaderInput, ShaderInputMode, ShaderOutput};
use crate::isa::Opcode;
use crate::texture::TextureAccess;

/// Procedural texture sampler used by the texture unit model: maps an
/// access element to a sample value.
pub type TextureSampler = fn(&TextureAccess, usize) -> Vec4;

fn identity_sampler(access: &TextureAccess, element: usize) -> Vec4 {
    access.coords[element]
}

/// Static configuration of the shader front end.
#[derive(Clone, Debug)]
pub struct ShaderConfig {
    pub num_threads: usize,
    pub num_input_buffers: usize,
    /// Per-thread resource units available (register file shares).
    pub num_resources: u32,
    /// Threads issued per cycle in the window and swap modes.
    pub threads_cycle: u32,
    /// Wavefront width for lock-step execution.
    pub wavefront_size: u32,
    pub lock_step: bool,
    /// Fetch one SIMD plus one scalar instruction per slot.
    pub scalar_alu: bool,
    pub thread_window: bool,
    pub window_size: u32,
    /// Cycles a thread stays unfetchable after an issue.
    pub fetch_delay: u32,
    pub swap_on_block: bool,
    pub texture_units: u32,
    pub texture_latency: u64,
    /// Outputs transmitted per cycle.
    pub output_cycle: u32,
    pub output_latency: u64,
    /// Program start PC per partition (vertex, fragment).
    pub init_pc: [u32; 2],
    /// Resource units one thread of each partition consumes.
    pub thread_resources: [u32; 2],
    /// Cache decoded instructions per (PC, thread).
    pub store_decoded: bool,
    pub stamp_fragments: usize,
    pub fxp_dec_bits: u32,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        ShaderConfig {
            num_threads: 64,
            num_input_buffers: 32,
            num_resources: 2048,
            threads_cycle: 1,
            wavefront_size: 4,
            lock_step: true,
            scalar_alu: false,
            thread_window: false,
            window_size: 16,
            fetch_delay: 0,
            swap_on_block: false,
            texture_units: 1,
            texture_latency: 16,
            output_cycle: 2,
            output_latency: 2,
            init_pc: [0, PARTITION_INSTRUCTIONS as u32],
            thread_resources: [8, 8],
            store_decoded: true,
            stamp_fragments: 4,
            fxp_dec_bits: 16,
        }
    }
}

impl ShaderConfig {
    fn validate(&self) {
        if self.num_threads == 0 || self.wavefront_size == 0 {
            fatal!("ShaderFetch", "threads and wavefront width must be non-zero");
        }
        if self.num_threads % self.wavefront_size as usize != 0 {
            fatal!("ShaderFetch", "thread count must be a wavefront multiple");
        }
        if self.num_input_buffers == 0 {
            fatal!("ShaderFetch", "at least one input buffer required");
        }
        if self.thread_resources.iter().any(|&r| r > self.num_resources) {
            fatal!("ShaderFetch", "a single thread exceeds the resource pool");
        }
        if self.lock_step && (self.thread_window || self.swap_on_block) {
            fatal!("ShaderFetch", "lock step excludes the other scheduling modes");
        }
    }
}

/// Per-thread scheduling state.
#[derive(Clone, Debug)]
pub struct ThreadEntry {
    pub ready: bool,
    pub blocked: bool,
    pub free: bool,
    pub end: bool,
    /// The next fetch must re-issue the same instruction.
    pub repeat: bool,
    /// The thread has executed a z-export instruction.
    pub zexported: bool,
    pub pc: u32,
    pub instruction_count: u32,
    pub input: Option<ShaderInput>,
    pub next_fetch_cycle: u64,
}

impl ThreadEntry {
    fn empty() -> ThreadEntry {
        ThreadEntry {
            ready: false,
            blocked: false,
            free: true,
            end: false,
            repeat: false,
            zexported: false,
            pc: 0,
            instruction_count: 0,
            input: None,
            next_fetch_cycle: 0,
        }
    }
}

/// What an issued instruction did to its thread.
enum IssueOutcome {
    Executed,
    Ended,
    BlockedTexture,
    BlockedDerivation,
    /// Queue full; retry the same instruction later.
    Stalled,
}

/// The shader front-end clocked unit. Owns the emulator.
pub struct ShaderFetch {
    cfg: ShaderConfig,
    emulator: ShaderEmulator,

    threads: Vec<ThreadEntry>,
    free_threads: BTreeSet<u32>,
    finished: VecDeque<u32>,
    free_resources: u32,
    free_buffers: usize,

    /// Wavefront fill state for lock-step gating.
    wavefront_filled: Vec<u32>,
    wavefront_closed: Vec<bool>,
    next_wavefront: usize,
    /// Scan cursor for the window and swap modes.
    next_thread: usize,
    current_thread: Option<u32>,

    /// Vertex texture requests awaiting promotion.
    vertex_texture_pending: u32,
    /// Texture accesses in flight through the texture unit model.
    texture_inflight: VecDeque<(u64, TextureAccess)>,
    pub sampler: TextureSampler,

    output_demand: u32,

    pub input_in: Signal<ShaderInput>,
    /// Free input slots advertised upstream.
    pub ready_out: Signal<u32>,
    pub output_out: Signal<ShaderOutput>,
    pub output_request_in: Signal<u32>,

    stats: Statistics,
}

impl ShaderFetch {
    pub fn new(cfg: ShaderConfig) -> ShaderFetch {
        cfg.validate();
        let emulator = ShaderEmulator::new(
            cfg.num_threads,
            cfg.store_decoded,
            cfg.stamp_fragments,
            cfg.fxp_dec_bits,
        );
        let wavefronts = cfg.num_threads / cfg.wavefront_size as usize;
        ShaderFetch {
            threads: vec![ThreadEntry::empty(); cfg.num_threads],
            free_threads: (0..cfg.num_threads as u32).collect(),
            finished: VecDeque::new(),
            free_resources: cfg.num_resources,
            free_buffers: cfg.num_input_buffers,
            wavefront_filled: vec![0; wavefronts],
            wavefront_closed: vec![false; wavefronts],
            next_wavefront: 0,
            next_thread: 0,
            current_thread: None,
            vertex_texture_pending: 0,
            texture_inflight: VecDeque::new(),
            sampler: identity_sampler,
            output_demand: 0,
            input_in: Signal::new("ShaderInput", 2 * cfg.stamp_fragments as u32, 1),
            ready_out: Signal::new("ShaderReady", 1, 1),
            output_out: Signal::new("ShaderOutput", cfg.output_cycle, cfg.output_latency),
            output_request_in: Signal::new("ShaderOutputRequest", 1, 1),
            emulator,
            cfg,
            stats: Statistics::new("ShaderFetch"),
        }
    }

    pub fn emulator(&self) -> &ShaderEmulator {
        &self.emulator
    }

    pub fn emulator_mut(&mut self) -> &mut ShaderEmulator {
        &mut self.emulator
    }

    pub fn config(&self) -> &ShaderConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn thread(&self, id: u32) -> &ThreadEntry {
        &self.threads[id as usize]
    }

    /// True when no thread holds work.
    pub fn is_idle(&self) -> bool {
        self.free_threads.len() == self.cfg.num_threads && self.finished.is_empty()
    }

    fn partition_of(mode: ShaderInputMode) -> usize {
        match mode {
            ShaderInputMode::Vertex => 0,
            ShaderInputMode::Fragment
            | ShaderInputMode::Triangle
            | ShaderInputMode::MicroTriFragment => 1,
        }
    }

    /// Loads a new shader input into a free thread.
    fn process_input(&mut self, cycle: u64, mut input: ShaderInput) {
        let Some(&thread) = self.free_threads.iter().next() else {
            fatal!("ShaderFetch", cycle, "shader input with no free thread");
        };
        let partition = Self::partition_of(input.mode);
        let resources = self.cfg.thread_resources[partition];
        if resources > self.free_resources || self.free_buffers == 0 {
            fatal!("ShaderFetch", cycle, "shader input without reserved resources");
        }
        self.free_threads.remove(&thread);
        self.free_resources -= resources;
        self.free_buffers -= 1;

        self.emulator.reset_thread(thread);
        self.emulator.load_inputs(thread, &input.attributes);
        let pc = self.cfg.init_pc[partition];
        self.emulator.set_thread_pc(thread, pc);

        input.start_cycle = cycle;
        let last = input.last;

        let entry = &mut self.threads[thread as usize];
        entry.free = false;
        entry.ready = true;
        entry.blocked = false;
        entry.end = false;
        entry.repeat = false;
        entry.zexported = false;
        entry.pc = pc;
        entry.instruction_count = 0;
        entry.input = Some(input);
        entry.next_fetch_cycle = cycle;

        let w = (thread / self.cfg.wavefront_size) as usize;
        self.wavefront_filled[w] += 1;
        if self.wavefront_filled[w] == self.cfg.wavefront_size || last {
            self.wavefront_closed[w] = true;
        }
        self.stats.inc("inputs");
        debug!("ShaderFetch: cycle {cycle}: input loaded into thread {thread}");
    }

    /// Closes every partially filled wavefront, the way a batch end does:
    /// lock-step fetch may then issue them without waiting for more lanes.
    pub fn close_open_wavefronts(&mut self) {
        for (w, &filled) in self.wavefront_filled.iter().enumerate() {
            if filled > 0 {
                self.wavefront_closed[w] = true;
            }
        }
    }

    /// Marks a thread finished; its output transmits when the consumer
    /// drains.
    fn finish_thread(&mut self, thread: u32) {
        let entry = &mut self.threads[thread as usize];
        entry.end = true;
        entry.ready = false;
        self.finished.push_back(thread);
    }

    /// Issues the instruction at a thread's PC and classifies the result.
    fn issue_thread(&mut self, _cycle: u64, thread: u32, vector_length: u32) -> IssueOutcome {
        let pc = self.emulator.thread_pc(thread);
        let opcode = self.emulator.read_instruction(pc).opcode;

        match opcode {
            Opcode::End => {
                self.finish_thread(thread);
                self.stats.inc("fetched");
                IssueOutcome::Ended
            }
            Opcode::Jmp => {
                let dec = self.emulator.fetch(thread, pc);
                self.emulator.check_jump(&dec, vector_length.max(1));
                self.stats.inc("fetched");
                IssueOutcome::Executed
            }
            op if op.is_texture() => {
                if !self.emulator.texture_queue_has_room() {
                    // Full queue: refetch the same instruction later.
                    self.threads[thread as usize].repeat = true;
                    self.stats.inc("refetched");
                    return IssueOutcome::Stalled;
                }
                let dec = self.emulator.fetch(thread, pc);
                let is_vertex = self.threads[thread as usize]
                    .input
                    .as_ref()
                    .map(|i| i.is_vertex())
                    .unwrap_or(false);
                self.emulator.execute(&dec);
                if is_vertex {
                    self.vertex_texture_pending += 1;
                }
                self.threads[thread as usize].repeat = false;
                self.threads[thread as usize].instruction_count += 1;
                self.stats.inc("fetched");
                IssueOutcome::BlockedTexture
            }
            op if op.is_derivation() => {
                let dec = self.emulator.fetch(thread, pc);
                let value = self.emulator.read_operand(&dec, 0);
                let completed = self.emulator.deriv_operation(&dec, value);
                self.emulator.set_thread_pc(thread, pc + 1);
                self.threads[thread as usize].instruction_count += 1;
                self.stats.inc("fetched");
                if completed {
                    // All four quad lanes got their result; release them.
                    let base = thread - (thread & 0x3);
                    for lane in base..base + 4 {
                        let e = &mut self.threads[lane as usize];
                        if e.blocked {
                            e.blocked = false;
                            e.ready = true;
                        }
                    }
                    IssueOutcome::Executed
                } else {
                    IssueOutcome::BlockedDerivation
                }
            }
            _ => {
                let dec = self.emulator.fetch(thread, pc);
                self.emulator.execute(&dec);
                if matches!(opcode, Opcode::Zxp | Opcode::Zxs) {
                    self.threads[thread as usize].zexported = true;
                }
                self.threads[thread as usize].instruction_count += 1;
                self.stats.inc("fetched");
                IssueOutcome::Executed
            }
        }
    }

    /// Scalar co-issue: a second, scalar-unit instruction fetched in the
    /// same slot when the next instruction qualifies.
    fn co_issue_scalar(&mut self, cycle: u64, thread: u32) {
        if !self.cfg.scalar_alu || !self.threads[thread as usize].ready {
            return;
        }
        let pc = self.emulator.thread_pc(thread);
        if pc as usize >= 2 * PARTITION_INSTRUCTIONS {
            return;
        }
        let opcode = self.emulator.read_instruction(pc).opcode;
        let scalar = matches!(
            opcode,
            Opcode::Rcp
                | Opcode::Rsq
                | Opcode::Ex2
                | Opcode::Lg2
                | Opcode::Exp
                | Opcode::Log
                | Opcode::Sin
                | Opcode::Cos
        );
        if scalar {
            self.issue_thread(cycle, thread, 1);
            self.stats.inc("co_issued");
        }
    }

    fn lane_active(&self, thread: u32) -> bool {
        let e = &self.threads[thread as usize];
        !e.free && !e.end
    }

    /// Lock-step fetch: one wavefront per cycle whose every active lane is
    /// ready, all lanes sharing one PC.
    fn fetch_lock_step(&mut self, cycle: u64) {
        let w_size = self.cfg.wavefront_size;
        let wavefronts = self.wavefront_filled.len();

        for probe in 0..wavefronts {
            let w = (self.next_wavefront + probe) % wavefronts;
            if !self.wavefront_closed[w] {
                continue;
            }
            let base = w as u32 * w_size;
            let lanes: Vec<u32> = (base..base + w_size).filter(|&t| self.lane_active(t)).collect();
            if lanes.is_empty() {
                continue;
            }
            let issuable = lanes.iter().all(|&t| {
                let e = &self.threads[t as usize];
                e.ready && !e.blocked && e.next_fetch_cycle <= cycle
            });
            if !issuable {
                continue;
            }

            // Lock-step invariant: every lane of the wavefront shares the
            // PC before the fetch.
            let pc = self.emulator.thread_pc(lanes[0]);
            for &t in &lanes {
                if self.emulator.thread_pc(t) != pc {
                    fatal!("ShaderFetch", cycle, "wavefront {w} lanes diverged in PC");
                }
            }

            let opcode = self.emulator.read_instruction(pc).opcode;
            // A texture wavefront issues all lanes or none: a mid-wavefront
            // stall would let lane PCs diverge.
            if opcode.is_texture() && !self.emulator.texture_queue_has_room() {
                self.stats.inc("refetched");
                self.next_wavefront = (w + 1) % wavefronts;
                return;
            }
            if opcode == Opcode::Jmp {
                // One evaluation covers the whole wavefront.
                let dec = self.emulator.fetch(lanes[0], pc);
                self.emulator.check_jump(&dec, lanes.len() as u32);
                for &t in &lanes {
                    self.threads[t as usize].instruction_count += 1;
                    self.threads[t as usize].next_fetch_cycle = cycle + 1;
                }
                self.stats.inc("fetched");
            } else {
                let mut any_blocked = false;
                for &t in &lanes {
                    match self.issue_thread(cycle, t, w_size) {
                        IssueOutcome::BlockedTexture => {
                            self.threads[t as usize].blocked = true;
                            self.threads[t as usize].ready = false;
                            any_blocked = true;
                        }
                        IssueOutcome::BlockedDerivation => {
                            self.threads[t as usize].blocked = true;
                            self.threads[t as usize].ready = false;
                        }
                        IssueOutcome::Stalled => {
                            any_blocked = true;
                        }
                        IssueOutcome::Executed | IssueOutcome::Ended => {}
                    }
                    self.threads[t as usize].next_fetch_cycle = cycle + 1;
                }
                if !any_blocked {
                    for &t in &lanes {
                        if self.threads[t as usize].ready {
                            self.co_issue_scalar(cycle, t);
                        }
                    }
                }
            }

            self.next_wavefront = (w + 1) % wavefronts;
            return;
        }
        self.stats.inc("no_ready_cycles");
    }

    /// Thread-window fetch: scan a window of threads for ready ones and
    /// issue up to `threads_cycle` of them.
    fn fetch_thread_window(&mut self, cycle: u64) {
        let n = self.cfg.num_threads;
        let mut issued = 0;
        let mut scanned = 0;
        let mut cursor = self.next_thread;

        while issued < self.cfg.threads_cycle && scanned < self.cfg.window_size.min(n as u32) {
            let t = cursor as u32;
            cursor = (cursor + 1) % n;
            scanned += 1;

            let e = &self.threads[t as usize];
            if e.free || e.end || !e.ready || e.blocked || e.next_fetch_cycle > cycle {
                continue;
            }
            match self.issue_thread(cycle, t, 1) {
                IssueOutcome::BlockedTexture | IssueOutcome::BlockedDerivation => {
                    self.threads[t as usize].blocked = true;
                    self.threads[t as usize].ready = false;
                }
                IssueOutcome::Stalled | IssueOutcome::Ended | IssueOutcome::Executed => {}
            }
            self.threads[t as usize].next_fetch_cycle = cycle + 1 + self.cfg.fetch_delay as u64;
            self.co_issue_scalar(cycle, t);
            issued += 1;
        }
        self.next_thread = cursor;
        if issued == 0 {
            self.stats.inc("no_ready_cycles");
        }
    }

    /// Swap-on-block fetch: stick with the active thread until it blocks
    /// or finishes, then search for another ready thread.
    fn fetch_swap_on_block(&mut self, cycle: u64) {
        let still_good = self.current_thread.is_some_and(|t| {
            let e = &self.threads[t as usize];
            !e.free && !e.end && e.ready && !e.blocked
        });
        if !still_good {
            self.current_thread = None;
            let n = self.cfg.num_threads;
            for probe in 0..n {
                let t = ((self.next_thread + probe) % n) as u32;
                let e = &self.threads[t as usize];
                if !e.free && !e.end && e.ready && !e.blocked {
                    self.current_thread = Some(t);
                    self.next_thread = (t as usize + 1) % n;
                    break;
                }
            }
        }

        let Some(t) = self.current_thread else {
            self.stats.inc("no_ready_cycles");
            return;
        };
        match self.issue_thread(cycle, t, 1) {
            IssueOutcome::BlockedTexture | IssueOutcome::BlockedDerivation => {
                self.threads[t as usize].blocked = true;
                self.threads[t as usize].ready = false;
                self.current_thread = None;
            }
            IssueOutcome::Ended => {
                self.current_thread = None;
            }
            IssueOutcome::Stalled | IssueOutcome::Executed => {}
        }
        self.co_issue_scalar(cycle, t);
    }

    /// Moves completed stamps from the texture queue into the texture unit
    /// model and completed accesses back into result registers.
    fn clock_textures(&mut self, cycle: u64) {
        // Results arriving from the texture units.
        loop {
            let ready = match self.texture_inflight.front() {
                Some((ready, _)) => *ready,
                None => break,
            };
            if ready > cycle {
                break;
            }
            let (_, access) = self.texture_inflight.pop_front().unwrap();
            let samples: Vec<Vec4> = (0..access.coords.len())
                .map(|e| (self.sampler)(&access, e))
                .collect();
            let threads = self.emulator.write_texture_access(access.id, &samples);
            for t in threads {
                let e = &mut self.threads[t as usize];
                if e.blocked {
                    e.blocked = false;
                    e.ready = true;
                }
            }
            self.stats.inc("texture_results");
        }

        // New accesses entering the texture units.
        for _ in 0..self.cfg.texture_units {
            let access = if self.vertex_texture_pending > 0 {
                self.emulator.next_vertex_texture_access()
            } else {
                self.emulator.next_texture_access()
            };
            let Some(access) = access else { break };
            if self.emulator.textures.is_vertex_access(access.id) {
                self.vertex_texture_pending = self
                    .vertex_texture_pending
                    .saturating_sub(access.original as u32);
            } else {
                // A full stamp consumed up to four pending vertex posts.
                self.vertex_texture_pending = self
                    .vertex_texture_pending
                    .saturating_sub(self.cfg.stamp_fragments as u32);
            }
            self.texture_inflight
                .push_back((cycle + self.cfg.texture_latency, access));
            self.stats.inc("texture_accesses");
        }
    }

    /// Transmits finished thread outputs under consumer demand and frees
    /// the threads.
    fn clock_outputs(&mut self, cycle: u64) {
        let mut sent = 0;
        while sent < self.cfg.output_cycle
            && self.output_demand > 0
            && !self.finished.is_empty()
            && self.output_out.can_write(cycle)
        {
            let thread = self.finished.pop_front().unwrap();
            let entry = &mut self.threads[thread as usize];
            let mut input = entry.input.take().unwrap_or_else(|| {
                fatal!("ShaderFetch", cycle, "finished thread {thread} has no input")
            });
            input.kill = self.emulator.thread_kill(thread);
            input.shader_latency = (cycle - input.start_cycle) as u32;

            let partition = Self::partition_of(input.mode);
            let zexported = entry.zexported;
            entry.free = true;
            entry.end = false;
            entry.ready = false;
            entry.blocked = false;

            let output = ShaderOutput {
                outputs: self.emulator.read_outputs(thread),
                z_exports: if zexported {
                    self.emulator.thread_z_exports(thread)
                } else {
                    Vec::new()
                },
                input,
            };
            self.output_out.write(cycle, output);
            self.output_demand -= 1;
            sent += 1;

            self.free_threads.insert(thread);
            self.free_resources += self.cfg.thread_resources[partition];
            self.free_buffers += 1;

            let w = (thread / self.cfg.wavefront_size) as usize;
            self.wavefront_filled[w] -= 1;
            if self.wavefront_filled[w] == 0 {
                self.wavefront_closed[w] = false;
            }
            self.stats.inc("outputs");
        }
    }
}

impl ClockedUnit for ShaderFetch {
    fn clock(&mut self, cycle: u64) {
        while let Some(n) = self.output_request_in.read(cycle) {
            self.output_demand += n;
        }

        self.clock_textures(cycle);

        // Accept new inputs while capacity remains.
        loop {
            let slot_free = !self.free_threads.is_empty()
                && self.free_buffers > 0
                && self.free_resources >= *self.cfg.thread_resources.iter().max().unwrap();
            if !slot_free {
                break;
            }
            match self.input_in.read(cycle) {
                Some(input) => self.process_input(cycle, input),
                None => break,
            }
        }

        if self.cfg.lock_step {
            self.fetch_lock_step(cycle);
        } else if self.cfg.thread_window {
            self.fetch_thread_window(cycle);
        } else if self.cfg.swap_on_block {
            self.fetch_swap_on_block(cycle);
        } else {
            // Plain in-order fetch falls back to a window over all threads.
            self.fetch_thread_window(cycle);
        }

        self.clock_outputs(cycle);

        // Advertise input capacity upstream.
        if self.ready_out.can_write(cycle) {
            let capacity = self
                .free_threads
                .len()
                .min(self.free_buffers)
                .min((self.free_resources / self.cfg.thread_resources.iter().copied().max().unwrap().max(1)) as usize);
            self.ready_out.write(cycle, capacity as u32);
        }
    }

    fn name(&self) -> &'static str {
        "ShaderFetch"
    }

    fn state_line(&self) -> String {
        format!(
            "ShaderFetch: {} free threads, {} finished, {} resources",
            self.free_threads.len(),
            self.finished.len(),
            self.free_resources
        )
    }
}
