//! The texture request queue.
//!
//! Texture instructions do not produce a result at issue time. Each of the
//! four fragments of a stamp posts its coordinates into the same queue
//! entry; when the fourth posts, the entry moves to the wait list and
//! becomes one texture access. Vertex texture fetches fill the remaining
//! slots with replicas of the first element and mark the access, so only
//! element 0 carries real data.

use ax_model_core::fatal;
use glam::Vec4;

use crate::emu::DecodedInstr;

/// Entries in the texture queue.
pub const TEXT_QUEUE_SIZE: usize = 64;

/// What a texture access asks the texture unit to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureOperation {
    /// Filtered texture read.
    Read,
    /// Texture read with an explicit level of detail.
    ReadWithLod,
    /// Attribute stream read (LDA).
    AttributeRead,
}

/// One queue entry, collecting the requests of a whole stamp.
pub struct TextureQueueEntry {
    pub op: TextureOperation,
    /// Sampler (or attribute) the stamp addresses.
    pub unit: u32,
    pub coords: Vec<Vec4>,
    /// Per-fragment LOD or bias parameter.
    pub param: Vec<f32>,
    /// The decoded instructions that will receive the samples.
    pub instrs: Vec<Option<DecodedInstr>>,
    /// Fragments that have posted so far.
    pub requested: usize,
    /// Elements that carry real requests; replicas sit beyond this count
    /// in a promoted vertex access.
    pub original: usize,
    pub vertex_access: bool,
}

impl TextureQueueEntry {
    fn new(stamp_fragments: usize) -> TextureQueueEntry {
        TextureQueueEntry {
            op: TextureOperation::Read,
            unit: 0,
            coords: vec![Vec4::ZERO; stamp_fragments],
            param: vec![0.0; stamp_fragments],
            instrs: (0..stamp_fragments).map(|_| None).collect(),
            requested: 0,
            original: 0,
            vertex_access: false,
        }
    }
}

/// A complete texture access released from the queue, ready for the
/// texture unit.
#[derive(Clone, Debug)]
pub struct TextureAccess {
    /// Queue entry the results come back to.
    pub id: usize,
    pub op: TextureOperation,
    pub unit: u32,
    pub coords: Vec<Vec4>,
    pub param: Vec<f32>,
    /// Elements carrying real requests (the rest are replicas).
    pub original: usize,
}

/// The stamp-grouping texture queue with free and wait lists.
pub struct TextureQueue {
    stamp_fragments: usize,
    entries: Vec<TextureQueueEntry>,
    free: Vec<usize>,
    wait: Vec<usize>,
}

impl TextureQueue {
    pub fn new(stamp_fragments: usize) -> TextureQueue {
        TextureQueue {
            stamp_fragments,
            entries: (0..TEXT_QUEUE_SIZE)
                .map(|_| TextureQueueEntry::new(stamp_fragments))
                .collect(),
            free: (0..TEXT_QUEUE_SIZE).collect(),
            wait: Vec::new(),
        }
    }

    /// True when a new stamp could start filling an entry.
    pub fn has_free_entry(&self) -> bool {
        !self.free.is_empty()
    }

    /// Entries waiting to be turned into accesses.
    pub fn waiting(&self) -> usize {
        self.wait.len()
    }

    pub fn free_entries(&self) -> usize {
        self.free.len()
    }

    /// Fragments posted so far into the entry currently filling.
    pub fn current_requested(&self) -> usize {
        self.free.first().map(|&e| self.entries[e].requested).unwrap_or(0)
    }

    /// Posts one fragment's texture operation. The whole stamp must issue
    /// the same operation against the same sampler.
    pub fn enqueue(&mut self, dec: &DecodedInstr, op: TextureOperation, coord: Vec4, param: f32) {
        let Some(&entry_id) = self.free.first() else {
            fatal!("Shader", "no free entries in the texture queue");
        };
        let unit = dec.instr.texture_unit();
        let entry = &mut self.entries[entry_id];

        if entry.requested == 0 {
            entry.op = op;
            entry.unit = unit;
            entry.vertex_access = false;
        } else {
            if entry.op != op {
                fatal!("Shader", "different texture operation within one stamp");
            }
            if entry.unit != unit {
                fatal!("Shader", "different texture units within one stamp");
            }
        }

        entry.coords[entry.requested] = coord;
        entry.param[entry.requested] = param;
        entry.instrs[entry.requested] = Some(dec.clone());
        entry.requested += 1;

        if entry.requested == self.stamp_fragments {
            entry.original = entry.requested;
            self.free.remove(0);
            self.wait.push(entry_id);
        }
    }

    /// Releases the next complete stamp access, if any.
    pub fn next_access(&mut self) -> Option<TextureAccess> {
        if self.wait.is_empty() {
            return None;
        }
        let id = self.wait.remove(0);
        let entry = &self.entries[id];
        Some(TextureAccess {
            id,
            op: entry.op,
            unit: entry.unit,
            coords: entry.coords.clone(),
            param: entry.param.clone(),
            original: entry.original,
        })
    }

    /// Promotes a partially-filled vertex texture request to a complete
    /// access by replicating element 0, then releases the next access.
    pub fn next_vertex_access(&mut self) -> Option<TextureAccess> {
        if let Some(&entry_id) = self.free.first() {
            let entry = &mut self.entries[entry_id];
            if entry.requested > 0 {
                // Replicate element 0 into the slots no thread filled.
                entry.original = entry.requested;
                for e in entry.requested..self.stamp_fragments {
                    entry.coords[e] = entry.coords[0];
                    entry.param[e] = entry.param[0];
                    entry.instrs[e] = entry.instrs[0].clone();
                }
                entry.requested = self.stamp_fragments;
                entry.vertex_access = true;
                self.free.remove(0);
                self.wait.push(entry_id);
            }
        }
        self.next_access()
    }

    /// True when entry `id` was promoted from a vertex fetch.
    pub fn is_vertex_access(&self, id: usize) -> bool {
        self.entries[id].vertex_access
    }

    /// The threads whose instructions wait on entry `id`.
    pub fn entry_threads(&self, id: usize) -> Vec<u32> {
        self.entries[id]
            .instrs
            .iter()
            .flatten()
            .map(|d| d.thread)
            .collect()
    }

    /// Takes the decoded instructions out of a completed entry and returns
    /// the entry to the free list, exactly once.
    pub(crate) fn complete(&mut self, id: usize) -> (Vec<Option<DecodedInstr>>, bool, usize) {
        let entry = &mut self.entries[id];
        if entry.requested == 0 {
            fatal!("Shader", "texture queue entry {id} completed twice");
        }
        let vertex = entry.vertex_access;
        let original = entry.original;
        let instrs = std::mem::replace(
            &mut entry.instrs,
            (0..self.stamp_fragments).map(|_| None).collect(),
        );
        entry.requested = 0;
        entry.original = 0;
        self.free.push(id);
        (instrs, vertex, original)
    }
}

impl crate::emu::ShaderEmulator {
    /// The next complete fragment texture access, if one is waiting.
    pub fn next_texture_access(&mut self) -> Option<TextureAccess> {
        self.textures.next_access()
    }

    /// The next texture access for a vertex fetch, promoting the pending
    /// partial request first.
    pub fn next_vertex_texture_access(&mut self) -> Option<TextureAccess> {
        self.textures.next_vertex_access()
    }

    /// Completes a texture access: writes all four samples (or only the
    /// original elements for a vertex access) into the requesting result
    /// registers and frees the queue entry. Returns the threads that were
    /// waiting.
    pub fn write_texture_access(&mut self, id: usize, samples: &[Vec4]) -> Vec<u32> {
        let (instrs, vertex, original) = self.textures.complete(id);
        let mut threads = Vec::new();
        for (i, slot) in instrs.iter().enumerate() {
            if vertex && i >= original {
                continue;
            }
            if let Some(dec) = slot {
                self.write_sample(dec, samples[i]);
                threads.push(dec.thread);
            }
        }
        threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::ShaderEmulator;
    use crate::isa::{Bank, Opcode, Operand, ShaderInstr};

    fn emulator() -> ShaderEmulator {
        let mut emu = ShaderEmulator::new(8, true, 4, 16);
        let program = vec![ShaderInstr::new(Opcode::Tex)
            .src(0, Operand::reg(Bank::Temp, 0))
            .src(1, Operand::reg(Bank::Text, 0))
            .dst(Bank::Temp, 1)];
        emu.load_program(&program, 0);
        emu
    }

    #[test]
    fn stamp_completes_after_four_posts() {
        let mut emu = emulator();
        let coords = [
            Vec4::new(0.0, 0.0, 0.0, 0.0),
            Vec4::new(1.0, 0.0, 0.0, 0.0),
            Vec4::new(0.0, 1.0, 0.0, 0.0),
            Vec4::new(1.0, 1.0, 0.0, 0.0),
        ];
        for (t, c) in coords.iter().enumerate() {
            emu.load_temp(t as u32, 0, *c);
            let dec = emu.fetch(t as u32, 0);
            emu.execute(&dec);
            if t < 3 {
                assert!(emu.next_texture_access().is_none(), "incomplete stamp released");
            }
        }

        let access = emu.next_texture_access().expect("complete stamp");
        assert_eq!(access.coords.len(), 4);
        assert_eq!(access.coords[3], coords[3]);

        // Memory returns four samples; each lands in its thread's register.
        let samples: Vec<Vec4> = (0..4).map(|i| Vec4::splat(i as f32)).collect();
        let threads = emu.write_texture_access(access.id, &samples);
        assert_eq!(threads, vec![0, 1, 2, 3]);
        for t in 0..4u32 {
            assert_eq!(emu.read_temp(t, 1), Vec4::splat(t as f32));
        }
        assert_eq!(emu.textures.free_entries(), TEXT_QUEUE_SIZE);
    }

    #[test]
    fn vertex_access_replicates_element_zero() {
        let mut emu = emulator();
        emu.load_temp(0, 0, Vec4::new(7.0, 0.0, 0.0, 0.0));
        let dec = emu.fetch(0, 0);
        emu.execute(&dec);

        let access = emu
            .next_vertex_texture_access()
            .expect("vertex access promoted");
        assert!(emu.textures.is_vertex_access(access.id));
        assert_eq!(access.coords[0], access.coords[3]);

        let samples = vec![Vec4::splat(5.0); 4];
        let threads = emu.write_texture_access(access.id, &samples);
        // Only the first element is written back.
        assert_eq!(threads, vec![0]);
        assert_eq!(emu.read_temp(0, 1), Vec4::splat(5.0));
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_completion_is_fatal() {
        let mut emu = emulator();
        for t in 0..4u32 {
            let dec = emu.fetch(t, 0);
            emu.execute(&dec);
        }
        let access = emu.next_texture_access().unwrap();
        let samples = vec![Vec4::ZERO; 4];
        emu.write_texture_access(access.id, &samples);
        emu.write_texture_access(access.id, &samples);
    }
}
