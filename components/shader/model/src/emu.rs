//! The unified shader emulator: register banks, instruction decode and the
//! execution kernels.

use ax_model_core::fatal;
use fixp::FixedPoint;
use glam::Vec4;

use crate::isa::{Bank, Opcode, Operand, ShaderInstr};
use crate::texture::{TextureOperation, TextureQueue};

/// Registers per thread in the input bank.
pub const INPUT_REGS: usize = 16;
/// Registers per thread in the output bank.
pub const OUTPUT_REGS: usize = 16;
/// Temporary registers per thread.
pub const TEMP_REGS: usize = 32;
/// Constant registers per PARAM partition.
pub const PARAM_REGS: usize = 256;
/// Address registers per thread.
pub const ADDR_REGS: usize = 2;
/// Predicate registers per thread.
pub const PRED_REGS: usize = 8;
/// Instructions per program partition.
pub const PARTITION_INSTRUCTIONS: usize = 512;
/// Samples each thread tracks kill and z-export state for.
pub const MAX_MSAA_SAMPLES: usize = 8;

/// PARAM partitions: the primary bank, the secondary bank, and the
/// triangle-program window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamPartition {
    Primary,
    Secondary,
    Triangle,
}

impl ParamPartition {
    fn base(self) -> usize {
        match self {
            ParamPartition::Primary => 0,
            ParamPartition::Secondary => PARAM_REGS,
            // The triangle setup program reads a window inside the shared
            // bank rather than a partition of its own.
            ParamPartition::Triangle => 200,
        }
    }

    /// The partition a PC falls into.
    pub fn of_pc(pc: u32) -> ParamPartition {
        if (pc as usize) < PARTITION_INSTRUCTIONS {
            ParamPartition::Primary
        } else {
            ParamPartition::Secondary
        }
    }
}

/// A resolved reference to the register an operand or result will touch,
/// computed once at decode.
#[derive(Clone, Copy, Debug)]
pub enum RegRef {
    In(u32),
    Out(u32),
    Param(u32),
    /// PARAM through an address register: resolved at read time from the
    /// register value plus the instruction offset.
    ParamRel {
        addr_reg: u32,
        comp: u8,
        offset: i32,
        base: u32,
    },
    Temp(u32),
    Addr(u32),
    Pred(u32),
    /// Immediate replicated over four lanes at decode.
    Imm([u32; 4]),
    /// Texture unit or sample identifiers resolve to no register.
    None,
}

/// Kernel function executing one decoded instruction.
pub type Kernel = fn(&mut ShaderEmulator, &DecodedInstr);

/// A shader instruction decoded for one thread: the static instruction
/// plus resolved register references and the emulation kernel.
#[derive(Clone)]
pub struct DecodedInstr {
    pub instr: ShaderInstr,
    pub pc: u32,
    pub thread: u32,
    pub ops: [RegRef; 3],
    pub result: RegRef,
    pub predicate: Option<u32>,
    pub kernel: Kernel,
}

impl std::fmt::Debug for DecodedInstr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedInstr")
            .field("opcode", &self.instr.opcode)
            .field("pc", &self.pc)
            .field("thread", &self.thread)
            .finish()
    }
}

/// A pending derivation: a 2x2 quad gathering its four lane inputs.
struct DerivationState {
    base_thread: u32,
    inputs: Vec<Vec4>,
    instrs: Vec<DecodedInstr>,
}

/// The multithreaded shader emulator.
///
/// All per-thread state (registers, PC, kill/z-export/sample index) lives
/// here; the fetch stage decides *when* instructions run, the emulator
/// decides *what* they do.
pub struct ShaderEmulator {
    num_threads: usize,
    stamp_fragments: usize,
    fxp_dec_bits: u32,
    store_decoded: bool,

    pc: Vec<u32>,
    input_bank: Vec<Vec<Vec4>>,
    output_bank: Vec<Vec<Vec4>>,
    temp_bank: Vec<Vec<Vec4>>,
    addr_bank: Vec<Vec<[i32; 4]>>,
    pred_bank: Vec<Vec<bool>>,
    /// Shared constant bank, both partitions.
    param_bank: Vec<Vec4>,
    /// Fixed-point accumulator quad per thread.
    accum_fxp: Vec<[FixedPoint; 4]>,

    kill: Vec<[bool; MAX_MSAA_SAMPLES]>,
    z_export: Vec<[f32; MAX_MSAA_SAMPLES]>,
    sample_idx: Vec<usize>,

    instr_memory: Vec<ShaderInstr>,
    /// Per-(pc, thread) decoded instruction cache when enabled.
    decoded: Vec<Vec<Option<DecodedInstr>>>,

    pub(crate) textures: TextureQueue,
    derivation: DerivationState,
}

impl ShaderEmulator {
    pub fn new(
        num_threads: usize,
        store_decoded: bool,
        stamp_fragments: usize,
        fxp_dec_bits: u32,
    ) -> ShaderEmulator {
        let memory_size = 2 * PARTITION_INSTRUCTIONS;
        ShaderEmulator {
            num_threads,
            stamp_fragments,
            fxp_dec_bits,
            store_decoded,
            pc: vec![0; num_threads],
            input_bank: vec![vec![Vec4::ZERO; INPUT_REGS]; num_threads],
            output_bank: vec![vec![Vec4::ZERO; OUTPUT_REGS]; num_threads],
            temp_bank: vec![vec![Vec4::ZERO; TEMP_REGS]; num_threads],
            addr_bank: vec![vec![[0; 4]; ADDR_REGS]; num_threads],
            pred_bank: vec![vec![false; PRED_REGS]; num_threads],
            param_bank: vec![Vec4::ZERO; 2 * PARAM_REGS],
            accum_fxp: vec![[FixedPoint::default(); 4]; num_threads],
            kill: vec![[false; MAX_MSAA_SAMPLES]; num_threads],
            z_export: vec![[0.0; MAX_MSAA_SAMPLES]; num_threads],
            sample_idx: vec![0; num_threads],
            instr_memory: vec![ShaderInstr::new(Opcode::Illegal); memory_size],
            decoded: if store_decoded {
                vec![vec![None; num_threads]; memory_size]
            } else {
                Vec::new()
            },
            textures: TextureQueue::new(stamp_fragments),
            derivation: DerivationState {
                base_thread: 0,
                inputs: Vec::new(),
                instrs: Vec::new(),
            },
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn stamp_fragments(&self) -> usize {
        self.stamp_fragments
    }

    fn check_thread(&self, thread: u32) {
        if thread as usize >= self.num_threads {
            fatal!("Shader", "illegal thread number {thread}");
        }
    }

    /// Resets all per-thread state of one thread.
    pub fn reset_thread(&mut self, thread: u32) {
        self.check_thread(thread);
        let t = thread as usize;
        self.pc[t] = 0;
        self.input_bank[t].fill(Vec4::ZERO);
        self.output_bank[t].fill(Vec4::ZERO);
        self.temp_bank[t].fill(Vec4::ZERO);
        self.addr_bank[t].fill([0; 4]);
        self.pred_bank[t].fill(false);
        self.kill[t].fill(false);
        self.z_export[t].fill(0.0);
        self.sample_idx[t] = 0;
    }

    // --- Register bank state loads and reads -----------------------------

    /// Loads an input register of a thread.
    pub fn load_input(&mut self, thread: u32, reg: usize, value: Vec4) {
        self.check_thread(thread);
        if reg >= INPUT_REGS {
            fatal!("Shader", "input register {reg} out of range");
        }
        self.input_bank[thread as usize][reg] = value;
    }

    /// Loads consecutive input registers from a slice.
    pub fn load_inputs(&mut self, thread: u32, values: &[Vec4]) {
        for (reg, value) in values.iter().enumerate().take(INPUT_REGS) {
            self.load_input(thread, reg, *value);
        }
    }

    /// Loads a constant register in the shared PARAM bank.
    pub fn load_param(&mut self, reg: usize, value: Vec4) {
        if reg >= 2 * PARAM_REGS {
            fatal!("Shader", "constant register {reg} out of range");
        }
        self.param_bank[reg] = value;
    }

    /// Loads a temporary register; used by tests and state restore.
    pub fn load_temp(&mut self, thread: u32, reg: usize, value: Vec4) {
        self.check_thread(thread);
        if reg >= TEMP_REGS {
            fatal!("Shader", "temporary register {reg} out of range");
        }
        self.temp_bank[thread as usize][reg] = value;
    }

    pub fn read_input(&self, thread: u32, reg: usize) -> Vec4 {
        self.input_bank[thread as usize][reg]
    }

    pub fn read_output(&self, thread: u32, reg: usize) -> Vec4 {
        self.output_bank[thread as usize][reg]
    }

    pub fn read_outputs(&self, thread: u32) -> Vec<Vec4> {
        self.output_bank[thread as usize].clone()
    }

    pub fn read_temp(&self, thread: u32, reg: usize) -> Vec4 {
        self.temp_bank[thread as usize][reg]
    }

    pub fn read_param(&self, reg: usize) -> Vec4 {
        self.param_bank[reg]
    }

    pub fn read_pred(&self, thread: u32, reg: usize) -> bool {
        self.pred_bank[thread as usize][reg]
    }

    pub fn read_addr(&self, thread: u32, reg: usize) -> [i32; 4] {
        self.addr_bank[thread as usize][reg]
    }

    // --- Thread status ---------------------------------------------------

    pub fn thread_pc(&self, thread: u32) -> u32 {
        self.pc[thread as usize]
    }

    pub fn set_thread_pc(&mut self, thread: u32, pc: u32) {
        self.check_thread(thread);
        self.pc[thread as usize] = pc;
    }

    /// The kill flag of a thread's current sample 0.
    pub fn thread_kill(&self, thread: u32) -> bool {
        self.kill[thread as usize][0]
    }

    pub fn thread_kill_sample(&self, thread: u32, sample: usize) -> bool {
        self.kill[thread as usize][sample]
    }

    pub fn thread_z_export(&self, thread: u32, sample: usize) -> f32 {
        self.z_export[thread as usize][sample]
    }

    pub fn thread_z_exports(&self, thread: u32) -> Vec<f32> {
        self.z_export[thread as usize].to_vec()
    }

    // --- Program load and decode -----------------------------------------

    /// Loads a program into instruction memory at `address`, invalidating
    /// any cached decodes of the overwritten range.
    pub fn load_program(&mut self, code: &[ShaderInstr], address: u32) {
        let address = address as usize;
        if address + code.len() > self.instr_memory.len() {
            fatal!("Shader", "shader program too large for instruction memory");
        }
        for (i, instr) in code.iter().enumerate() {
            self.instr_memory[address + i] = instr.clone();
            if self.store_decoded {
                self.decoded[address + i].fill(None);
            }
        }
    }

    /// Reads the static instruction at `pc`.
    pub fn read_instruction(&self, pc: u32) -> &ShaderInstr {
        &self.instr_memory[pc as usize]
    }

    fn decode_reg(&self, op: &Operand, instr: &ShaderInstr, partition: ParamPartition) -> RegRef {
        match op.bank {
            Bank::In => RegRef::In(op.reg),
            Bank::Out => RegRef::Out(op.reg),
            Bank::Param => {
                if instr.relative_mode {
                    RegRef::ParamRel {
                        addr_reg: instr.rel_addr_reg,
                        comp: instr.rel_comp,
                        offset: instr.rel_offset,
                        base: partition.base() as u32,
                    }
                } else {
                    RegRef::Param(op.reg + partition.base() as u32)
                }
            }
            Bank::Temp => RegRef::Temp(op.reg),
            Bank::Addr => RegRef::Addr(op.reg),
            Bank::Pred => RegRef::Pred(op.reg),
            Bank::Imm => RegRef::Imm([instr.immediate; 4]),
            Bank::Text | Bank::Samp => RegRef::None,
        }
    }

    /// Decodes an instruction for one thread: resolves the operand and
    /// result references and selects the emulation kernel.
    pub fn decode(&self, pc: u32, thread: u32, partition: ParamPartition) -> DecodedInstr {
        self.check_thread(thread);
        let instr = &self.instr_memory[pc as usize];
        let mut ops = [RegRef::None, RegRef::None, RegRef::None];
        for (i, slot) in instr.operands.iter().enumerate() {
            if let Some(op) = slot {
                ops[i] = self.decode_reg(op, instr, partition);
            }
        }
        // Texture instructions resolve their result register too: it is
        // written later, when the sample comes back.
        let result = if instr.opcode.has_result() || instr.opcode.is_texture() {
            self.decode_reg(
                &Operand::reg(instr.result_bank, instr.result_reg),
                instr,
                partition,
            )
        } else {
            RegRef::None
        };
        let predicate = instr.predicated.then_some(instr.pred_reg);

        DecodedInstr {
            instr: instr.clone(),
            pc,
            thread,
            ops,
            result,
            predicate,
            kernel: kernel_for(instr.opcode),
        }
    }

    /// Fetches the decoded instruction at (pc, thread): from the decoded
    /// cache when enabled (decoding on demand), else decoding afresh.
    pub fn fetch(&mut self, thread: u32, pc: u32) -> DecodedInstr {
        if pc as usize >= self.instr_memory.len() {
            fatal!("Shader", "PC {pc:#x} overflows instruction memory");
        }
        let partition = ParamPartition::of_pc(pc);
        if self.store_decoded {
            if self.decoded[pc as usize][thread as usize].is_none() {
                let dec = self.decode(pc, thread, partition);
                self.decoded[pc as usize][thread as usize] = Some(dec);
            }
            self.decoded[pc as usize][thread as usize].clone().unwrap()
        } else {
            self.decode(pc, thread, partition)
        }
    }

    /// Executes a decoded instruction through its kernel.
    pub fn execute(&mut self, dec: &DecodedInstr) {
        self.check_thread(dec.thread);
        (dec.kernel)(self, dec);
    }

    // --- Operand path ----------------------------------------------------

    fn reg_value(&self, thread: u32, r: &RegRef) -> Vec4 {
        let t = thread as usize;
        match *r {
            RegRef::In(reg) => self.input_bank[t][reg as usize],
            RegRef::Out(reg) => self.output_bank[t][reg as usize],
            RegRef::Param(reg) => self.param_bank[reg as usize],
            RegRef::ParamRel {
                addr_reg,
                comp,
                offset,
                base,
            } => {
                // Relative PARAM access resolves here, at read time.
                let a = self.addr_bank[t][addr_reg as usize][comp as usize];
                let index = base as i32 + a + offset;
                if index < 0 || index as usize >= 2 * PARAM_REGS {
                    fatal!("Shader", "relative constant access out of range ({index})");
                }
                self.param_bank[index as usize]
            }
            RegRef::Temp(reg) => self.temp_bank[t][reg as usize],
            RegRef::Addr(reg) => {
                let a = self.addr_bank[t][reg as usize];
                Vec4::new(a[0] as f32, a[1] as f32, a[2] as f32, a[3] as f32)
            }
            RegRef::Pred(reg) => {
                let p = self.pred_bank[t][reg as usize] as u32 as f32;
                Vec4::splat(p)
            }
            RegRef::Imm(raw) => Vec4::new(
                f32::from_bits(raw[0]),
                f32::from_bits(raw[1]),
                f32::from_bits(raw[2]),
                f32::from_bits(raw[3]),
            ),
            RegRef::None => Vec4::ZERO,
        }
    }

    /// Integer view of a register, reading the raw bit patterns.
    fn reg_value_int(&self, thread: u32, r: &RegRef) -> [i32; 4] {
        let t = thread as usize;
        match *r {
            RegRef::Addr(reg) => self.addr_bank[t][reg as usize],
            RegRef::Imm(raw) => [raw[0] as i32, raw[1] as i32, raw[2] as i32, raw[3] as i32],
            _ => {
                let v = self.reg_value(thread, r);
                [
                    v.x.to_bits() as i32,
                    v.y.to_bits() as i32,
                    v.z.to_bits() as i32,
                    v.w.to_bits() as i32,
                ]
            }
        }
    }

    fn swizzle(mode: u8, v: Vec4) -> Vec4 {
        let lane = |shift: u8| v[((mode >> shift) & 0x3) as usize];
        Vec4::new(lane(6), lane(4), lane(2), lane(0))
    }

    fn swizzle_int(mode: u8, v: [i32; 4]) -> [i32; 4] {
        let lane = |shift: u8| v[((mode >> shift) & 0x3) as usize];
        [lane(6), lane(4), lane(2), lane(0)]
    }

    /// Reads one vector operand: swizzle, then absolute, then negate.
    pub fn read_operand(&self, dec: &DecodedInstr, index: usize) -> Vec4 {
        let op = dec.instr.operands[index]
            .unwrap_or_else(|| fatal!("Shader", "missing operand {index}"));
        let mut v = Self::swizzle(op.swizzle, self.reg_value(dec.thread, &dec.ops[index]));
        if op.absolute {
            v = v.abs();
        }
        if op.negate {
            v = -v;
        }
        v
    }

    /// Reads one scalar operand: the w field of the swizzle selects the
    /// lane, then absolute and negate apply.
    pub fn read_scalar(&self, dec: &DecodedInstr, index: usize) -> f32 {
        let op = dec.instr.operands[index]
            .unwrap_or_else(|| fatal!("Shader", "missing operand {index}"));
        let v = self.reg_value(dec.thread, &dec.ops[index]);
        let mut s = v[(op.swizzle & 0x3) as usize];
        if op.absolute {
            s = s.abs();
        }
        if op.negate {
            s = -s;
        }
        s
    }

    fn read_operand_int(&self, dec: &DecodedInstr, index: usize) -> [i32; 4] {
        let op = dec.instr.operands[index]
            .unwrap_or_else(|| fatal!("Shader", "missing operand {index}"));
        let mut v = Self::swizzle_int(op.swizzle, self.reg_value_int(dec.thread, &dec.ops[index]));
        if op.absolute {
            for c in &mut v {
                *c = c.wrapping_abs();
            }
        }
        if op.negate {
            for c in &mut v {
                *c = c.wrapping_neg();
            }
        }
        v
    }

    fn read_scalar_int(&self, dec: &DecodedInstr, index: usize) -> i32 {
        let op = dec.instr.operands[index]
            .unwrap_or_else(|| fatal!("Shader", "missing operand {index}"));
        let v = self.reg_value_int(dec.thread, &dec.ops[index]);
        let mut s = v[(op.swizzle & 0x3) as usize];
        if op.absolute {
            s = s.wrapping_abs();
        }
        if op.negate {
            s = s.wrapping_neg();
        }
        s
    }

    /// Reads a boolean operand: the absolute flag marks an immediate
    /// condition carried in the negate flag; otherwise a predicate (or a
    /// constant lane) is read, inverted by the negate flag.
    fn read_bool(&self, dec: &DecodedInstr, index: usize) -> bool {
        let op = dec.instr.operands[index]
            .unwrap_or_else(|| fatal!("Shader", "missing operand {index}"));
        if op.absolute {
            return op.negate;
        }
        let mut b = match op.bank {
            Bank::Param => {
                let v = self.reg_value_int(dec.thread, &dec.ops[index]);
                v[(op.swizzle & 0x3) as usize] != 0
            }
            _ => match dec.ops[index] {
                RegRef::Pred(reg) => self.pred_bank[dec.thread as usize][reg as usize],
                _ => fatal!("Shader", "boolean operand from a non-predicate bank"),
            },
        };
        if op.negate {
            b = !b;
        }
        b
    }

    // --- Result path -----------------------------------------------------

    /// Whether predication lets this instruction commit its result.
    fn predicate_passes(&self, dec: &DecodedInstr) -> bool {
        match dec.predicate {
            None => true,
            Some(reg) => {
                let p = self.pred_bank[dec.thread as usize][reg as usize];
                p != dec.instr.negate_pred
            }
        }
    }

    /// Writes a vector result: predication, saturation, then the
    /// component write mask.
    pub fn write_result(&mut self, dec: &DecodedInstr, value: [f32; 4]) {
        if !self.predicate_passes(dec) {
            return;
        }
        let value = if dec.instr.saturate {
            [
                value[0].clamp(0.0, 1.0),
                value[1].clamp(0.0, 1.0),
                value[2].clamp(0.0, 1.0),
                value[3].clamp(0.0, 1.0),
            ]
        } else {
            value
        };
        self.masked_write(dec, value);
    }

    fn masked_write(&mut self, dec: &DecodedInstr, value: [f32; 4]) {
        let t = dec.thread as usize;
        let mask = dec.instr.mask;
        let dst: &mut Vec4 = match dec.result {
            RegRef::In(reg) => &mut self.input_bank[t][reg as usize],
            RegRef::Out(reg) => &mut self.output_bank[t][reg as usize],
            RegRef::Temp(reg) => &mut self.temp_bank[t][reg as usize],
            RegRef::Param(_) | RegRef::ParamRel { .. } => {
                fatal!("Shader", "constant bank is read-only")
            }
            RegRef::Addr(reg) => {
                let dst = &mut self.addr_bank[t][reg as usize];
                for c in 0..4 {
                    if mask & (0x8 >> c) != 0 {
                        dst[c] = value[c] as i32;
                    }
                }
                return;
            }
            RegRef::Pred(_) | RegRef::Imm(_) | RegRef::None => {
                fatal!("Shader", "vector result into a non-vector bank")
            }
        };
        for c in 0..4 {
            if mask & (0x8 >> c) != 0 {
                dst[c] = value[c];
            }
        }
    }

    fn write_result_int(&mut self, dec: &DecodedInstr, value: [i32; 4]) {
        if !self.predicate_passes(dec) {
            return;
        }
        let t = dec.thread as usize;
        let mask = dec.instr.mask;
        match dec.result {
            RegRef::Addr(reg) => {
                let dst = &mut self.addr_bank[t][reg as usize];
                for c in 0..4 {
                    if mask & (0x8 >> c) != 0 {
                        dst[c] = value[c];
                    }
                }
            }
            RegRef::Temp(reg) => {
                let dst = &mut self.temp_bank[t][reg as usize];
                for c in 0..4 {
                    if mask & (0x8 >> c) != 0 {
                        dst[c] = f32::from_bits(value[c] as u32);
                    }
                }
            }
            _ => fatal!("Shader", "integer result into an unsupported bank"),
        }
    }

    /// Writes a boolean result into a predicate register; the saturate
    /// flag aliases result inversion.
    fn write_result_bool(&mut self, dec: &DecodedInstr, value: bool) {
        if !self.predicate_passes(dec) {
            return;
        }
        let value = if dec.instr.saturate { !value } else { value };
        match dec.result {
            RegRef::Pred(reg) => self.pred_bank[dec.thread as usize][reg as usize] = value,
            _ => fatal!("Shader", "predicate result into a non-predicate bank"),
        }
    }

    /// Writes a fixed-point quad into the thread's accumulator. The write
    /// mask applies; saturation is not supported on the accumulator.
    fn write_result_fxp(&mut self, dec: &DecodedInstr, value: [FixedPoint; 4]) {
        if !self.predicate_passes(dec) {
            return;
        }
        let acc = &mut self.accum_fxp[dec.thread as usize];
        for c in 0..4 {
            if dec.instr.mask & (0x8 >> c) != 0 {
                acc[c] = value[c];
            }
        }
    }

    /// Writes a texture (or attribute load) sample through the decoded
    /// instruction that requested it.
    pub(crate) fn write_sample(&mut self, dec: &DecodedInstr, sample: Vec4) {
        self.write_result(dec, sample.to_array());
    }

    fn advance_pc(&mut self, thread: u32) {
        self.pc[thread as usize] += 1;
    }

    // --- Texture and derivation entry points ------------------------------

    /// True when the texture queue can take another stamp request.
    pub fn texture_queue_has_room(&self) -> bool {
        self.textures.has_free_entry()
    }

    /// Per-wavefront jump: the condition is AND-reduced over every lane of
    /// the vector; all lane PCs move to the target or fall through
    /// together. Returns whether the jump was taken.
    pub fn check_jump(&mut self, dec: &DecodedInstr, vector_length: u32) -> bool {
        let start = dec.thread - dec.thread % vector_length;
        let op = dec.instr.operands[0]
            .unwrap_or_else(|| fatal!("Shader", "JMP without a condition operand"));

        let jump = if op.absolute {
            // Immediate condition aliased in the negate flag.
            op.negate
        } else {
            let mut all = true;
            for lane in 0..vector_length {
                let t = (start + lane) as usize;
                let mut b = match op.bank {
                    Bank::Param => {
                        let v = self.reg_value_int(start + lane, &dec.ops[0]);
                        v[(op.swizzle & 0x3) as usize] != 0
                    }
                    _ => self.pred_bank[t][op.reg as usize],
                };
                if op.negate {
                    b = !b;
                }
                all &= b;
            }
            all
        };

        let base_pc = self.pc[start as usize];
        let dest = if jump {
            (base_pc as i64 + dec.instr.jump_offset as i64) as u32
        } else {
            base_pc + 1
        };
        for lane in 0..vector_length {
            self.pc[(start + lane) as usize] = dest;
        }
        jump
    }

    /// Posts one lane of a derivation quad; when the fourth lane arrives
    /// the gradients are computed and written back for all four. Returns
    /// true when the quad completed.
    pub fn deriv_operation(&mut self, dec: &DecodedInstr, input: Vec4) -> bool {
        let base = dec.thread - (dec.thread & 0x3);

        if self.derivation.inputs.is_empty() {
            self.derivation.base_thread = base;
        } else if self.derivation.base_thread != base {
            let bt = self.derivation.base_thread;
            fatal!("Shader", "derivation quad mixes base threads {bt} and {base}");
        } else if self.derivation.inputs.len() >= 4 {
            fatal!("Shader", "derivation quad overflow");
        }

        self.derivation.inputs.push(input);
        self.derivation.instrs.push(dec.clone());

        if self.derivation.inputs.len() < 4 {
            return false;
        }

        let q = &self.derivation.inputs;
        let results = match self.derivation.instrs[0].instr.opcode {
            // Quad layout: 0 1 / 2 3. The x gradient is constant along
            // each row, the y gradient along each column.
            Opcode::Ddx => {
                let top = q[1] - q[0];
                let bottom = q[3] - q[2];
                [top, top, bottom, bottom]
            }
            Opcode::Ddy => {
                let left = q[2] - q[0];
                let right = q[3] - q[1];
                [left, right, left, right]
            }
            _ => fatal!("Shader", "expected a derivation instruction"),
        };

        let instrs = std::mem::take(&mut self.derivation.instrs);
        self.derivation.inputs.clear();
        for (dec, result) in instrs.iter().zip(results.iter()) {
            self.write_result(dec, result.to_array());
        }
        true
    }

    // --- Checkpoint -------------------------------------------------------

    /// Serializes the register banks of one thread into an opaque blob.
    pub fn checkpoint_thread(&self, thread: u32) -> Vec<u8> {
        self.check_thread(thread);
        let t = thread as usize;
        let mut blob = Vec::new();
        let push_vec = |blob: &mut Vec<u8>, v: &Vec4| {
            for c in 0..4 {
                blob.extend_from_slice(&v[c].to_bits().to_le_bytes());
            }
        };
        for v in &self.input_bank[t] {
            push_vec(&mut blob, v);
        }
        for v in &self.output_bank[t] {
            push_vec(&mut blob, v);
        }
        for v in &self.temp_bank[t] {
            push_vec(&mut blob, v);
        }
        for a in &self.addr_bank[t] {
            for c in a {
                blob.extend_from_slice(&c.to_le_bytes());
            }
        }
        for p in &self.pred_bank[t] {
            blob.push(*p as u8);
        }
        blob
    }

    /// Restores a thread's register banks from a checkpoint blob.
    pub fn restore_thread(&mut self, thread: u32, blob: &[u8]) {
        self.check_thread(thread);
        let t = thread as usize;
        let mut cursor = 0usize;
        let read_f32 = |cursor: &mut usize| {
            let raw = u32::from_le_bytes(blob[*cursor..*cursor + 4].try_into().unwrap());
            *cursor += 4;
            f32::from_bits(raw)
        };
        for reg in 0..INPUT_REGS {
            let mut v = [0.0f32; 4];
            for c in &mut v {
                *c = read_f32(&mut cursor);
            }
            self.input_bank[t][reg] = Vec4::from_array(v);
        }
        for reg in 0..OUTPUT_REGS {
            let mut v = [0.0f32; 4];
            for c in &mut v {
                *c = read_f32(&mut cursor);
            }
            self.output_bank[t][reg] = Vec4::from_array(v);
        }
        for reg in 0..TEMP_REGS {
            let mut v = [0.0f32; 4];
            for c in &mut v {
                *c = read_f32(&mut cursor);
            }
            self.temp_bank[t][reg] = Vec4::from_array(v);
        }
        for reg in 0..ADDR_REGS {
            for c in 0..4 {
                self.addr_bank[t][reg][c] =
                    i32::from_le_bytes(blob[cursor..cursor + 4].try_into().unwrap());
                cursor += 4;
            }
        }
        for reg in 0..PRED_REGS {
            self.pred_bank[t][reg] = blob[cursor] != 0;
            cursor += 1;
        }
    }
}

/// Selects the emulation kernel for an opcode.
pub fn kernel_for(opcode: Opcode) -> Kernel {
    use Opcode::*;
    match opcode {
        Nop => k_nop,
        Mov => k_mov,
        Add => k_add,
        Mul => k_mul,
        Mad => k_mad,
        Dp3 => k_dp3,
        Dp4 => k_dp4,
        Dph => k_dph,
        Dst => k_dst,
        Max => k_max,
        Min => k_min,
        Sge => k_sge,
        Slt => k_slt,
        Cmp => k_cmp,
        Frc => k_frc,
        Flr => k_flr,
        Lit => k_lit,
        Rcp => k_rcp,
        Rsq => k_rsq,
        Ex2 => k_ex2,
        Lg2 => k_lg2,
        Exp => k_exp,
        Log => k_log,
        Sin => k_sin,
        Cos => k_cos,
        Arl => k_arl,
        SetpEq => k_setpeq,
        SetpGt => k_setpgt,
        SetpLt => k_setplt,
        Andp => k_andp,
        StpEqI => k_stpeqi,
        StpGtI => k_stpgti,
        StpLtI => k_stplti,
        AddI => k_addi,
        MulI => k_muli,
        Tex => k_tex,
        Txb => k_txb,
        Txp => k_txp,
        Txl => k_txl,
        Lda => k_lda,
        Kil => k_kil,
        Kls => k_kls,
        CmpKil => k_cmpkil,
        Zxp => k_zxp,
        Zxs => k_zxs,
        Chs => k_chs,
        FxMul => k_fxmul,
        FxMad => k_fxmad,
        FxMad2 => k_fxmad2,
        Ddx | Ddy => k_deriv_issue,
        Jmp => k_jmp_issue,
        End => k_end,
        Illegal => k_illegal,
    }
}

// --- Kernels --------------------------------------------------------------

fn k_nop(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    emu.advance_pc(dec.thread);
}

fn k_mov(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    emu.write_result(dec, a.to_array());
    emu.advance_pc(dec.thread);
}

fn k_add(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    emu.write_result(dec, (a + b).to_array());
    emu.advance_pc(dec.thread);
}

fn k_mul(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    emu.write_result(dec, (a * b).to_array());
    emu.advance_pc(dec.thread);
}

fn k_mad(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let c = emu.read_operand(dec, 2);
    emu.write_result(dec, (a * b + c).to_array());
    emu.advance_pc(dec.thread);
}

fn k_dp3(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let d = a.x * b.x + a.y * b.y + a.z * b.z;
    emu.write_result(dec, [d; 4]);
    emu.advance_pc(dec.thread);
}

fn k_dp4(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let d = a.dot(b);
    emu.write_result(dec, [d; 4]);
    emu.advance_pc(dec.thread);
}

fn k_dph(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let d = a.x * b.x + a.y * b.y + a.z * b.z + b.w;
    emu.write_result(dec, [d; 4]);
    emu.advance_pc(dec.thread);
}

fn k_dst(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    emu.write_result(dec, [1.0, a.y * b.y, a.z, b.w]);
    emu.advance_pc(dec.thread);
}

fn k_max(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    emu.write_result(dec, a.max(b).to_array());
    emu.advance_pc(dec.thread);
}

fn k_min(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    emu.write_result(dec, a.min(b).to_array());
    emu.advance_pc(dec.thread);
}

fn k_sge(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let r = [
        (a.x >= b.x) as u32 as f32,
        (a.y >= b.y) as u32 as f32,
        (a.z >= b.z) as u32 as f32,
        (a.w >= b.w) as u32 as f32,
    ];
    emu.write_result(dec, r);
    emu.advance_pc(dec.thread);
}

fn k_slt(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let r = [
        (a.x < b.x) as u32 as f32,
        (a.y < b.y) as u32 as f32,
        (a.z < b.z) as u32 as f32,
        (a.w < b.w) as u32 as f32,
    ];
    emu.write_result(dec, r);
    emu.advance_pc(dec.thread);
}

fn k_cmp(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let c = emu.read_operand(dec, 2);
    let pick = |av: f32, bv: f32, cv: f32| if av < 0.0 { bv } else { cv };
    emu.write_result(
        dec,
        [
            pick(a.x, b.x, c.x),
            pick(a.y, b.y, c.y),
            pick(a.z, b.z, c.z),
            pick(a.w, b.w, c.w),
        ],
    );
    emu.advance_pc(dec.thread);
}

fn k_frc(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    emu.write_result(dec, (a - a.floor()).to_array());
    emu.advance_pc(dec.thread);
}

fn k_flr(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    emu.write_result(dec, a.floor().to_array());
    emu.advance_pc(dec.thread);
}

fn k_lit(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    // Clamp the specular exponent to the traditional [-128, 128] range.
    let power = a.w.clamp(-128.0, 128.0);
    let specular = if a.x > 0.0 {
        a.y.max(0.0).powf(power)
    } else {
        0.0
    };
    emu.write_result(dec, [1.0, a.x.max(0.0), specular, 1.0]);
    emu.advance_pc(dec.thread);
}

fn k_rcp(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let s = emu.read_scalar(dec, 0);
    // Reciprocal of zero produces an infinity, which propagates.
    emu.write_result(dec, [1.0 / s; 4]);
    emu.advance_pc(dec.thread);
}

fn k_rsq(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let s = emu.read_scalar(dec, 0);
    emu.write_result(dec, [1.0 / s.abs().sqrt(); 4]);
    emu.advance_pc(dec.thread);
}

fn k_ex2(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let s = emu.read_scalar(dec, 0);
    emu.write_result(dec, [s.exp2(); 4]);
    emu.advance_pc(dec.thread);
}

fn k_lg2(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let s = emu.read_scalar(dec, 0);
    emu.write_result(dec, [s.log2(); 4]);
    emu.advance_pc(dec.thread);
}

fn k_exp(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let s = emu.read_scalar(dec, 0);
    emu.write_result(dec, [s.floor().exp2(), s - s.floor(), s.exp2(), 1.0]);
    emu.advance_pc(dec.thread);
}

fn k_log(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let s = emu.read_scalar(dec, 0).abs();
    let exponent = s.log2().floor();
    let mantissa = s / exponent.exp2();
    emu.write_result(dec, [exponent, mantissa, s.log2(), 1.0]);
    emu.advance_pc(dec.thread);
}

fn k_sin(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let s = emu.read_scalar(dec, 0);
    emu.write_result(dec, [s.sin(); 4]);
    emu.advance_pc(dec.thread);
}

fn k_cos(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let s = emu.read_scalar(dec, 0);
    emu.write_result(dec, [s.cos(); 4]);
    emu.advance_pc(dec.thread);
}

fn k_arl(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let r = [
        a.x.floor() as i32,
        a.y.floor() as i32,
        a.z.floor() as i32,
        a.w.floor() as i32,
    ];
    emu.write_result_int(dec, r);
    emu.advance_pc(dec.thread);
}

fn k_setpeq(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_scalar(dec, 0);
    let b = emu.read_scalar(dec, 1);
    emu.write_result_bool(dec, a == b);
    emu.advance_pc(dec.thread);
}

fn k_setpgt(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_scalar(dec, 0);
    let b = emu.read_scalar(dec, 1);
    emu.write_result_bool(dec, a > b);
    emu.advance_pc(dec.thread);
}

fn k_setplt(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_scalar(dec, 0);
    let b = emu.read_scalar(dec, 1);
    emu.write_result_bool(dec, a < b);
    emu.advance_pc(dec.thread);
}

fn k_andp(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_bool(dec, 0);
    let b = emu.read_bool(dec, 1);
    emu.write_result_bool(dec, a && b);
    emu.advance_pc(dec.thread);
}

fn k_stpeqi(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_scalar_int(dec, 0);
    let b = emu.read_scalar_int(dec, 1);
    emu.write_result_bool(dec, a == b);
    emu.advance_pc(dec.thread);
}

fn k_stpgti(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_scalar_int(dec, 0);
    let b = emu.read_scalar_int(dec, 1);
    emu.write_result_bool(dec, a > b);
    emu.advance_pc(dec.thread);
}

fn k_stplti(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_scalar_int(dec, 0);
    let b = emu.read_scalar_int(dec, 1);
    emu.write_result_bool(dec, a < b);
    emu.advance_pc(dec.thread);
}

fn k_addi(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand_int(dec, 0);
    let b = emu.read_operand_int(dec, 1);
    let r = [
        a[0].wrapping_add(b[0]),
        a[1].wrapping_add(b[1]),
        a[2].wrapping_add(b[2]),
        a[3].wrapping_add(b[3]),
    ];
    emu.write_result_int(dec, r);
    emu.advance_pc(dec.thread);
}

fn k_muli(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand_int(dec, 0);
    let b = emu.read_operand_int(dec, 1);
    let r = [
        a[0].wrapping_mul(b[0]),
        a[1].wrapping_mul(b[1]),
        a[2].wrapping_mul(b[2]),
        a[3].wrapping_mul(b[3]),
    ];
    emu.write_result_int(dec, r);
    emu.advance_pc(dec.thread);
}

fn k_tex(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let coord = emu.read_operand(dec, 0);
    emu.textures.enqueue(dec, TextureOperation::Read, coord, 0.0);
    emu.advance_pc(dec.thread);
}

fn k_txb(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let coord = emu.read_operand(dec, 0);
    let bias = coord.w;
    emu.textures.enqueue(dec, TextureOperation::Read, coord, bias);
    emu.advance_pc(dec.thread);
}

fn k_txp(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let mut coord = emu.read_operand(dec, 0);
    coord.x /= coord.w;
    coord.y /= coord.w;
    coord.z /= coord.w;
    emu.textures.enqueue(dec, TextureOperation::Read, coord, 0.0);
    emu.advance_pc(dec.thread);
}

fn k_txl(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let coord = emu.read_operand(dec, 0);
    let lod = coord.w;
    emu.textures
        .enqueue(dec, TextureOperation::ReadWithLod, coord, lod);
    emu.advance_pc(dec.thread);
}

fn k_lda(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let index = emu.read_operand(dec, 0);
    emu.textures
        .enqueue(dec, TextureOperation::AttributeRead, index, 0.0);
    emu.advance_pc(dec.thread);
}

fn k_kil(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    if a.x < 0.0 || a.y < 0.0 || a.z < 0.0 || a.w < 0.0 {
        let t = dec.thread as usize;
        let s = emu.sample_idx[t];
        emu.kill[t][s] = true;
    }
    emu.advance_pc(dec.thread);
}

fn k_kls(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let sample = dec.instr.sample_id() as usize;
    if a.x < 0.0 || a.y < 0.0 || a.z < 0.0 || a.w < 0.0 {
        emu.kill[dec.thread as usize][sample] = true;
    }
    emu.advance_pc(dec.thread);
}

fn k_cmpkil(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let c = emu.read_operand(dec, 2);
    let pick = |av: f32, bv: f32, cv: f32| if av < 0.0 { bv } else { cv };
    let r = [
        pick(a.x, b.x, c.x),
        pick(a.y, b.y, c.y),
        pick(a.z, b.z, c.z),
        pick(a.w, b.w, c.w),
    ];
    emu.write_result(dec, r);

    let mask = dec.instr.mask;
    let killed = (mask & 0x8 != 0 && r[0] < 0.0)
        || (mask & 0x4 != 0 && r[1] < 0.0)
        || (mask & 0x2 != 0 && r[2] < 0.0)
        || (mask & 0x1 != 0 && r[3] < 0.0);
    if killed {
        let t = dec.thread as usize;
        let s = emu.sample_idx[t];
        emu.kill[t][s] = true;
    }
    emu.advance_pc(dec.thread);
}

fn k_zxp(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    emu.z_export[dec.thread as usize][0] = a.x;
    emu.advance_pc(dec.thread);
}

fn k_zxs(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let t = dec.thread as usize;
    // Four samples export per instruction, scoped by the sample cursor.
    let base = emu.sample_idx[t] / 4;
    for i in 0..4 {
        if base + i < MAX_MSAA_SAMPLES {
            emu.z_export[t][base + i] = a[i];
        }
    }
    emu.advance_pc(dec.thread);
}

fn k_chs(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let t = dec.thread as usize;
    emu.sample_idx[t] += 1;
    emu.advance_pc(dec.thread);
}

fn k_fxmul(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let bits = emu.fxp_dec_bits;
    let mut r = [FixedPoint::default(); 4];
    for c in 0..4 {
        let fa = FixedPoint::from_f32(a[c], 16, bits);
        let fb = FixedPoint::from_f32(b[c], 16, bits);
        // Double-precision accumulator format.
        let wide = FixedPoint::from_f32(1.0, 32, 2 * bits);
        r[c] = wide * fa * fb;
    }
    emu.write_result_fxp(dec, r);
    emu.advance_pc(dec.thread);
}

fn k_fxmad(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let bits = emu.fxp_dec_bits;
    let acc = emu.accum_fxp[dec.thread as usize];
    let mut r = [0.0f32; 4];
    for c in 0..4 {
        let fa = FixedPoint::from_f32(a[c], 16, bits);
        let fb = FixedPoint::from_f32(b[c], 16, bits);
        let wide = FixedPoint::from_f32(1.0, 32, 2 * bits);
        r[c] = (wide * fa * fb + acc[c]).to_f32();
    }
    emu.write_result(dec, r);
    emu.advance_pc(dec.thread);
}

fn k_fxmad2(emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let a = emu.read_operand(dec, 0);
    let b = emu.read_operand(dec, 1);
    let c3 = emu.read_operand(dec, 2);
    let bits = emu.fxp_dec_bits;
    let mut r = [FixedPoint::default(); 4];
    for c in 0..4 {
        let fa = FixedPoint::from_f32(a[c], 16, bits);
        let fb = FixedPoint::from_f32(b[c], 16, bits);
        let fc = FixedPoint::from_f32(c3[c], 16, bits);
        let wide = FixedPoint::from_f32(1.0, 32, 2 * bits);
        r[c] = wide * fa * fb + fc;
    }
    emu.write_result_fxp(dec, r);
    emu.advance_pc(dec.thread);
}

/// Derivation issue is handled by the fetch stage through
/// [`ShaderEmulator::deriv_operation`]; reaching the kernel directly means
/// the fetch wiring is broken.
fn k_deriv_issue(_emu: &mut ShaderEmulator, _dec: &DecodedInstr) {
    fatal!("Shader", "derivation instruction executed outside quad collection");
}

/// JMP is evaluated per wavefront by the fetch stage via
/// [`ShaderEmulator::check_jump`].
fn k_jmp_issue(_emu: &mut ShaderEmulator, _dec: &DecodedInstr) {
    fatal!("Shader", "JMP executed outside the fetch scheduler");
}

/// END does nothing on the emulator side; the fetch stage retires the
/// thread.
fn k_end(_emu: &mut ShaderEmulator, _dec: &DecodedInstr) {}

fn k_illegal(_emu: &mut ShaderEmulator, dec: &DecodedInstr) {
    let pc = dec.pc;
    let thread = dec.thread;
    fatal!("Shader", "illegal opcode at PC {pc:#x}, thread {thread}");
}
