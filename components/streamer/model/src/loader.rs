//! The vertex stream loader.
//!
//! Fetches vertex attribute data over the ticketed memory bus and
//! assembles [`ShaderInput`]s for the shader front end, honouring both the
//! memory controller's state word and the shader's readiness signal.

use std::collections::VecDeque;

use ax_membus::{MemCommand, MemRequest, MemResponse, MemState};
use ax_model_core::{fatal, ClockedUnit, Signal, Statistics};
use ax_shader::input::ShaderInput;
use glam::Vec4;
use log::debug;

/// Layout of one vertex stream in memory.
#[derive(Clone, Debug)]
pub struct StreamLayout {
    /// Byte address of the first vertex.
    pub base_address: u32,
    /// Bytes between consecutive vertices.
    pub stride: u32,
    /// Four-component f32 attributes per vertex.
    pub attributes: usize,
}

/// A request to load and shade one vertex.
#[derive(Clone, Copy, Debug)]
pub struct VertexJob {
    pub index: u32,
    pub instance: u32,
    pub last_in_batch: bool,
}

/// In-flight vertex fetch waiting for its memory response.
struct PendingFetch {
    ticket: u32,
    job: VertexJob,
}

/// The loader clocked unit: vertex jobs in, shader inputs out.
pub struct StreamerLoader {
    layout: StreamLayout,
    /// Vertices fetched per cycle at most.
    indices_cycle: u32,
    next_ticket: u32,
    pending: VecDeque<PendingFetch>,
    /// Shader input slots the shader has advertised.
    shader_ready: u32,
    /// Last observed memory controller state.
    mem_state: MemState,
    /// Assembled inputs waiting for shader readiness.
    assembled: VecDeque<ShaderInput>,

    pub job_in: Signal<VertexJob>,
    pub mem_request_out: Signal<MemRequest>,
    pub mem_response_in: Signal<MemResponse>,
    pub mem_state_in: Signal<MemState>,
    pub shader_out: Signal<ShaderInput>,
    pub shader_ready_in: Signal<u32>,

    stats: Statistics,
}

impl StreamerLoader {
    pub fn new(layout: StreamLayout, indices_cycle: u32) -> StreamerLoader {
        if indices_cycle == 0 {
            fatal!("StreamerLoader", "at least an index per cycle required");
        }
        if layout.attributes == 0 {
            fatal!("StreamerLoader", "vertices need at least one attribute");
        }
        if layout.stride < (layout.attributes * 16) as u32 {
            fatal!("StreamerLoader", "stream stride smaller than the vertex");
        }
        StreamerLoader {
            layout,
            indices_cycle,
            next_ticket: 0,
            pending: VecDeque::new(),
            shader_ready: 0,
            mem_state: MemState::NONE,
            assembled: VecDeque::new(),
            job_in: Signal::new("LoaderJob", 4, 1),
            mem_request_out: Signal::new("LoaderMemRequest", 2, 1),
            mem_response_in: Signal::new("LoaderMemResponse", 2, 1),
            mem_state_in: Signal::new("LoaderMemState", 1, 1),
            shader_out: Signal::new("LoaderShaderInput", 4, 1),
            shader_ready_in: Signal::new("LoaderShaderReady", 1, 1),
            stats: Statistics::new("StreamerLoader"),
        }
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// True when no fetch is in flight and nothing waits for the shader.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.assembled.is_empty()
    }

    fn vertex_address(&self, index: u32) -> u32 {
        self.layout.base_address + index * self.layout.stride
    }

    fn decode_vertex(&self, data: &[u8]) -> Vec<Vec4> {
        let mut attributes = Vec::with_capacity(self.layout.attributes);
        for a in 0..self.layout.attributes {
            let mut v = [0.0f32; 4];
            for (c, slot) in v.iter_mut().enumerate() {
                let o = a * 16 + c * 4;
                *slot = f32::from_le_bytes(data[o..o + 4].try_into().unwrap());
            }
            attributes.push(Vec4::from_array(v));
        }
        attributes
    }
}

impl ClockedUnit for StreamerLoader {
    fn clock(&mut self, cycle: u64) {
        // Track the memory controller and shader readiness.
        while let Some(state) = self.mem_state_in.read(cycle) {
            self.mem_state = state;
        }
        while let Some(n) = self.shader_ready_in.read(cycle) {
            self.shader_ready = n;
        }

        // Completed vertex fetches become shader inputs, in fetch order.
        while let Some(response) = self.mem_response_in.read(cycle) {
            let Some(front) = self.pending.front() else {
                fatal!("StreamerLoader", cycle, "memory response with no pending fetch");
            };
            if front.ticket != response.ticket {
                fatal!("StreamerLoader", cycle, "out of order memory response");
            }
            let fetch = self.pending.pop_front().unwrap();
            let attributes = self.decode_vertex(&response.data);
            let mut input = ShaderInput::vertex(fetch.job.instance, fetch.job.index, attributes);
            if fetch.job.last_in_batch {
                input = input.last_in_batch();
            }
            debug!(
                "StreamerLoader: cycle {cycle}: vertex {} assembled",
                fetch.job.index
            );
            self.assembled.push_back(input);
            self.stats.inc("vertices_loaded");
        }

        // Issue new fetches while the bus accepts reads.
        let vertex_bytes = self.layout.attributes * 16;
        for _ in 0..self.indices_cycle {
            if !self.mem_state.contains(MemState::READ_ACCEPT) {
                break;
            }
            if !self.mem_request_out.can_write(cycle) {
                break;
            }
            let Some(job) = self.job_in.read(cycle) else { break };
            let ticket = self.next_ticket;
            self.next_ticket = (self.next_ticket + 1) % ax_membus::MAX_MEMORY_TICKETS;
            self.mem_request_out.write(
                cycle,
                MemRequest {
                    ticket,
                    address: self.vertex_address(job.index),
                    size: vertex_bytes,
                    command: MemCommand::ReadReq,
                    data: Vec::new(),
                    mask: None,
                },
            );
            self.pending.push_back(PendingFetch { ticket, job });
            self.stats.inc("fetches");
        }

        // Forward assembled inputs under shader back-pressure.
        while self.shader_ready > 0
            && !self.assembled.is_empty()
            && self.shader_out.can_write(cycle)
        {
            let input = self.assembled.pop_front().unwrap();
            self.shader_out.write(cycle, input);
            self.shader_ready -= 1;
            self.stats.inc("inputs_sent");
        }
    }

    fn name(&self) -> &'static str {
        "StreamerLoader"
    }

    fn state_line(&self) -> String {
        format!(
            "StreamerLoader: {} pending fetches, {} assembled",
            self.pending.len(),
            self.assembled.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_membus::LatencyMemory;

    fn layout() -> StreamLayout {
        StreamLayout {
            base_address: 0,
            stride: 32,
            attributes: 2,
        }
    }

    fn seed_vertex(mem: &mut LatencyMemory, index: u32, value: f32) {
        let mut bytes = Vec::new();
        for c in 0..8 {
            bytes.extend_from_slice(&(value + c as f32).to_le_bytes());
        }
        mem.preload(index * 32, &bytes);
    }

    #[test]
    fn vertex_round_trip_through_memory() {
        let mut mem = LatencyMemory::new(1024, 2, 8);
        seed_vertex(&mut mem, 0, 10.0);
        seed_vertex(&mut mem, 1, 20.0);

        let mut loader = StreamerLoader::new(layout(), 2);
        loader.job_in.write(0, VertexJob { index: 0, instance: 0, last_in_batch: false });
        loader.job_in.write(0, VertexJob { index: 1, instance: 0, last_in_batch: true });
        loader.shader_ready_in.write(0, 4);

        let mut outputs = Vec::new();
        for cycle in 0..30 {
            // Bridge the loader's bus endpoints to the memory model.
            while let Some(req) = loader.mem_request_out.read(cycle) {
                mem.request_in.write(cycle, req);
            }
            mem.clock(cycle);
            while let Some(resp) = mem.response_out.read(cycle) {
                loader.mem_response_in.write(cycle, resp);
            }
            while let Some(state) = mem.state_out.read(cycle) {
                loader.mem_state_in.write(cycle, state);
            }
            loader.clock(cycle);
            while let Some(input) = loader.shader_out.read(cycle) {
                outputs.push(input);
            }
        }

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].attributes[0].x, 10.0);
        assert_eq!(outputs[0].attributes[1].x, 14.0);
        assert!(outputs[1].last);
    }

    #[test]
    fn fetches_wait_for_read_accept() {
        let mut loader = StreamerLoader::new(layout(), 1);
        loader.job_in.write(0, VertexJob { index: 0, instance: 0, last_in_batch: false });
        // No memory state seen yet: the loader must not issue.
        loader.clock(1);
        assert!(loader.mem_request_out.read(2).is_none());
        assert_eq!(loader.stats().get("fetches"), 0);
    }
}
