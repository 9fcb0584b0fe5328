//! Memory bus interface of the axion GPU core.
//!
//! The core never sees DRAM timing; it sees a ticketed request/response bus
//! plus a state word saying which directions currently accept traffic. This
//! crate defines those wire types and a flat-array memory double that
//! services requests after a fixed latency, for driving the pipeline in
//! tests and demos.

use std::collections::VecDeque;

use ax_model_core::{fatal, ClockedUnit, Signal, Statistics};
use bitflags::bitflags;

/// Maximum payload of one transaction, in bytes.
pub const MAX_TRANSACTION_SIZE: usize = 64;

/// Size of a write mask covering one transaction, in 32-bit words.
pub const WRITE_MASK_SIZE: usize = MAX_TRANSACTION_SIZE >> 2;

/// Number of outstanding tickets the bus distinguishes.
pub const MAX_MEMORY_TICKETS: u32 = 256;

bitflags! {
    /// Which directions the memory controller currently accepts.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemState: u8 {
        /// Read requests can be issued.
        const READ_ACCEPT = 0x01;
        /// Write data can be sent.
        const WRITE_ACCEPT = 0x02;
    }
}

impl MemState {
    /// Accepts nothing this cycle.
    pub const NONE: MemState = MemState::empty();
    /// Accepts both reads and writes.
    pub const BOTH: MemState = MemState::all();
}

/// Transaction command on the request side of the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemCommand {
    /// Read request; the response arrives later with the same ticket.
    ReadReq,
    /// Write data going to memory.
    WriteData,
    /// Preload data into memory without timing cost.
    PreloadData,
}

/// A request transaction from a core unit to the memory controller.
#[derive(Clone, Debug)]
pub struct MemRequest {
    pub ticket: u32,
    pub address: u32,
    pub size: usize,
    pub command: MemCommand,
    /// Payload for writes and preloads.
    pub data: Vec<u8>,
    /// Optional per-32-bit-word write mask.
    pub mask: Option<[u32; WRITE_MASK_SIZE]>,
}

/// A response transaction carrying read data back to the requester.
#[derive(Clone, Debug)]
pub struct MemResponse {
    pub ticket: u32,
    pub size: usize,
    pub data: Vec<u8>,
}

/// A serviced-in-order memory double with a fixed read latency.
///
/// Stands in for the memory controller on the other side of the bus: it
/// consumes [`MemRequest`]s, applies writes immediately, and emits read
/// [`MemResponse`]s `read_latency` cycles after accepting the request. The
/// exported [`MemState`] toggles to NONE while its internal queue is full,
/// which is how back-pressure reaches the core.
pub struct LatencyMemory {
    storage: Vec<u8>,
    read_latency: u64,
    queue_limit: usize,
    pending: VecDeque<(u64, MemResponse)>,
    pub request_in: Signal<MemRequest>,
    pub response_out: Signal<MemResponse>,
    pub state_out: Signal<MemState>,
    stats: Statistics,
}

impl LatencyMemory {
    pub fn new(size: usize, read_latency: u64, queue_limit: usize) -> LatencyMemory {
        LatencyMemory {
            storage: vec![0; size],
            read_latency,
            queue_limit,
            pending: VecDeque::new(),
            request_in: Signal::new("MemRequest", 2, 1),
            response_out: Signal::new("MemResponse", 2, 1),
            state_out: Signal::new("MemState", 1, 1),
            stats: Statistics::new("Memory"),
        }
    }

    /// Direct backdoor write used to seed memory before a run.
    pub fn preload(&mut self, address: u32, data: &[u8]) {
        let a = address as usize;
        self.storage[a..a + data.len()].copy_from_slice(data);
    }

    /// Direct backdoor read used by tests.
    pub fn peek(&self, address: u32, size: usize) -> &[u8] {
        let a = address as usize;
        &self.storage[a..a + size]
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    fn service(&mut self, cycle: u64, req: MemRequest) {
        if req.size > MAX_TRANSACTION_SIZE {
            fatal!("Memory", cycle, "transaction larger than the bus allows");
        }
        match req.command {
            MemCommand::ReadReq => {
                let a = req.address as usize;
                if a + req.size > self.storage.len() {
                    fatal!("Memory", cycle, "read past the end of memory");
                }
                let data = self.storage[a..a + req.size].to_vec();
                self.stats.inc("reads");
                self.pending.push_back((
                    cycle + self.read_latency,
                    MemResponse {
                        ticket: req.ticket,
                        size: req.size,
                        data,
                    },
                ));
            }
            MemCommand::WriteData | MemCommand::PreloadData => {
                let a = req.address as usize;
                if a + req.data.len() > self.storage.len() {
                    fatal!("Memory", cycle, "write past the end of memory");
                }
                match req.mask {
                    Some(mask) => {
                        for (w, &m) in mask.iter().enumerate().take(req.data.len() >> 2) {
                            if m != 0 {
                                let o = a + (w << 2);
                                self.storage[o..o + 4]
                                    .copy_from_slice(&req.data[w << 2..(w << 2) + 4]);
                            }
                        }
                    }
                    None => {
                        self.storage[a..a + req.data.len()].copy_from_slice(&req.data);
                    }
                }
                self.stats.inc("writes");
            }
        }
    }
}

impl ClockedUnit for LatencyMemory {
    fn clock(&mut self, cycle: u64) {
        // Drain responses whose latency has elapsed.
        loop {
            let ready = match self.pending.front() {
                Some((ready, _)) => *ready,
                None => break,
            };
            if ready > cycle || !self.response_out.can_write(cycle) {
                break;
            }
            let (_, resp) = self.pending.pop_front().unwrap();
            self.response_out.write(cycle, resp);
        }

        // Accept new requests while the queue has room.
        while self.pending.len() < self.queue_limit {
            match self.request_in.read(cycle) {
                Some(req) => self.service(cycle, req),
                None => break,
            }
        }

        // Export the acceptance state for the next cycle.
        let state = if self.pending.len() < self.queue_limit {
            MemState::BOTH
        } else {
            MemState::NONE
        };
        if self.state_out.can_write(cycle) {
            self.state_out.write(cycle, state);
        }
    }

    fn name(&self) -> &'static str {
        "Memory"
    }

    fn state_line(&self) -> String {
        format!("Memory: {} responses pending", self.pending.len())
    }
}
