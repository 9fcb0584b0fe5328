//! The shaded-vertex output cache.
//!
//! Indexed vertices that were already shaded hit an output-memory line and
//! skip the shader. Lines freed by the commit stage are deallocated
//! speculatively: the commit may still reuse a line in the same cycle pair,
//! so an unconfirmed deallocation parks in a per-parity list and only a
//! confirmation moves the line to the free list; unconfirmed lines are
//! re-validated the next cycle.

use ax_model_core::{fatal, ClockedUnit, Signal, Statistics};
use log::debug;

/// Commands driving the output cache state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamerCommand {
    Reset,
    /// Begin streaming a batch.
    Start,
    /// End the batch and return to ready.
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamerState {
    Reset,
    Ready,
    Streaming,
}

/// An index lookup request: (index, instance).
#[derive(Clone, Copy, Debug)]
pub struct IndexRequest {
    pub index: u32,
    pub instance: u32,
}

/// Lookup outcome handed back to the fetch side.
#[derive(Clone, Copy, Debug)]
pub struct CacheLookup {
    pub index: u32,
    pub instance: u32,
    /// The vertex is already shaded in this output-memory line.
    pub hit: bool,
    /// Line allocated (miss) or found (hit).
    pub line: u32,
}

/// A deallocation notice from the commit stage; `confirmed` follows one
/// cycle later for lines that really retired.
#[derive(Clone, Copy, Debug)]
pub enum DeallocNotice {
    Dealloc(u32),
    Confirm(u32),
}

/// The output cache: tags, valid bits and the output-memory free list.
pub struct StreamerOutputCache {
    indices_cycle: u32,
    memory_size: usize,
    vertices_cycle: u32,

    state: StreamerState,
    tag_index: Vec<u32>,
    tag_instance: Vec<u32>,
    valid: Vec<bool>,
    free_list: Vec<u32>,

    /// Unconfirmed deallocated lines for even and odd cycles.
    unconfirmed: [Vec<u32>; 2],

    pub command_in: Signal<StreamerCommand>,
    pub index_in: Signal<IndexRequest>,
    pub lookup_out: Signal<CacheLookup>,
    pub dealloc_in: Signal<DeallocNotice>,

    stats: Statistics,
}

impl StreamerOutputCache {
    /// `indices_cycle` must match the combined index rate of the loader
    /// units; a mismatch is a construction error.
    pub fn new(
        indices_cycle: u32,
        memory_size: usize,
        vertices_cycle: u32,
        loader_units: u32,
        loader_indices_cycle: u32,
    ) -> StreamerOutputCache {
        if indices_cycle == 0 {
            fatal!("StreamerOutputCache", "at least an index per cycle required");
        }
        if vertices_cycle == 0 {
            fatal!("StreamerOutputCache", "at least a vertex per cycle required");
        }
        if memory_size == 0 {
            fatal!("StreamerOutputCache", "at least one output memory line required");
        }
        if indices_cycle != loader_units * loader_indices_cycle {
            fatal!(
                "StreamerOutputCache",
                "indices per cycle must equal the loader units' combined rate"
            );
        }
        StreamerOutputCache {
            indices_cycle,
            memory_size,
            vertices_cycle,
            state: StreamerState::Reset,
            tag_index: vec![0; memory_size],
            tag_instance: vec![0; memory_size],
            valid: vec![false; memory_size],
            free_list: (0..memory_size as u32).collect(),
            unconfirmed: [Vec::new(), Vec::new()],
            command_in: Signal::new("StreamerCommand", 1, 1),
            index_in: Signal::new("StreamerNewIndex", indices_cycle, 1),
            lookup_out: Signal::new("StreamerLookup", indices_cycle, 1),
            dealloc_in: Signal::new("StreamerDealloc", 2 * vertices_cycle, 1),
            stats: Statistics::new("StreamerOutputCache"),
        }
    }

    pub fn state(&self) -> StreamerState {
        self.state
    }

    pub fn free_lines(&self) -> usize {
        self.free_list.len()
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Records a shaded vertex landing in a line, validating its tag.
    pub fn update_line(&mut self, line: u32, index: u32, instance: u32) {
        self.tag_index[line as usize] = index;
        self.tag_instance[line as usize] = instance;
        self.valid[line as usize] = true;
    }

    /// Searches the tags for a shaded vertex.
    fn search(&self, index: u32, instance: u32) -> Option<u32> {
        (0..self.memory_size)
            .find(|&l| self.valid[l] && self.tag_index[l] == index && self.tag_instance[l] == instance)
            .map(|l| l as u32)
    }

    /// Removes a specific line from the free list when a hit pins it.
    fn unfree(&mut self, line: u32) {
        if let Some(pos) = self.free_list.iter().position(|&l| l == line) {
            self.free_list.remove(pos);
        }
    }

    fn allocate(&mut self) -> u32 {
        if self.free_list.is_empty() {
            fatal!("StreamerOutputCache", "no free output memory lines");
        }
        self.free_list.remove(0)
    }

    fn reset_state(&mut self) {
        self.valid.fill(false);
        self.free_list = (0..self.memory_size as u32).collect();
        self.unconfirmed[0].clear();
        self.unconfirmed[1].clear();
        self.state = StreamerState::Ready;
    }

    fn process_command(&mut self, command: StreamerCommand) {
        match (self.state, command) {
            (_, StreamerCommand::Reset) => self.state = StreamerState::Reset,
            (StreamerState::Ready, StreamerCommand::Start) => {
                self.state = StreamerState::Streaming;
            }
            (StreamerState::Streaming, StreamerCommand::End) => {
                self.state = StreamerState::Ready;
            }
            (state, command) => {
                fatal!("StreamerOutputCache", "command {command:?} in state {state:?}");
            }
        }
    }
}

impl ClockedUnit for StreamerOutputCache {
    fn clock(&mut self, cycle: u64) {
        match self.state {
            StreamerState::Reset => self.reset_state(),
            StreamerState::Ready => {
                if let Some(command) = self.command_in.read(cycle) {
                    self.process_command(command);
                }
            }
            StreamerState::Streaming => {
                if let Some(command) = self.command_in.read(cycle) {
                    self.process_command(command);
                    if self.state != StreamerState::Streaming {
                        return;
                    }
                }

                let parity = (cycle % 2) as usize;
                let other = 1 - parity;
                self.unconfirmed[parity].clear();
                let mut confirmed = vec![false; self.unconfirmed[other].len()];

                // Deallocations from commit: unconfirmed ones park and are
                // invalidated; confirmations free last cycle's parks.
                while let Some(notice) = self.dealloc_in.read(cycle) {
                    match notice {
                        DeallocNotice::Dealloc(line) => {
                            debug!("StreamerOutputCache: cycle {cycle}: dealloc line {line}");
                            self.unconfirmed[parity].push(line);
                            self.valid[line as usize] = false;
                        }
                        DeallocNotice::Confirm(line) => {
                            for (i, &parked) in self.unconfirmed[other].iter().enumerate() {
                                if parked == line {
                                    confirmed[i] = true;
                                    if !self.free_list.contains(&line) {
                                        if self.free_list.len() == self.memory_size {
                                            fatal!(
                                                "StreamerOutputCache",
                                                "all output lines already free"
                                            );
                                        }
                                        self.free_list.push(line);
                                    }
                                }
                            }
                        }
                    }
                }

                // Lines deallocated last cycle but never confirmed stay
                // live: re-validate them.
                for (i, &line) in self.unconfirmed[other].iter().enumerate() {
                    if !confirmed[i] {
                        self.valid[line as usize] = true;
                    }
                }

                // Index lookups from the fetch side.
                let mut served = 0;
                while served < self.indices_cycle {
                    let Some(req) = self.index_in.read(cycle) else { break };
                    served += 1;
                    self.stats.inc("indices");

                    let lookup = match self.search(req.index, req.instance) {
                        Some(line) => {
                            // A hit pins the line: remove it from the free
                            // list so it cannot be reallocated underneath.
                            self.unfree(line);
                            self.stats.inc("hits");
                            CacheLookup {
                                index: req.index,
                                instance: req.instance,
                                hit: true,
                                line,
                            }
                        }
                        None => {
                            let line = self.allocate();
                            // Tag the line right away so later references
                            // to the same index hit while the vertex is
                            // still shading; the data catches up later.
                            self.update_line(line, req.index, req.instance);
                            self.stats.inc("misses");
                            CacheLookup {
                                index: req.index,
                                instance: req.instance,
                                hit: false,
                                line,
                            }
                        }
                    };
                    self.lookup_out.write(cycle, lookup);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "StreamerOutputCache"
    }

    fn state_line(&self) -> String {
        format!(
            "StreamerOutputCache: {:?}, {} free lines",
            self.state,
            self.free_list.len()
        )
    }
}
