//! Unified shader component of the axion GPU core.
//!
//! Splits, as the hardware does, into a behavioural emulator — register
//! banks, instruction decode and the execution kernels — and a timing front
//! end that owns the thread table, wavefront scheduling and the texture and
//! derivation stall logic.

pub mod emu;
pub mod fetch;
pub mod input;
pub mod isa;
pub mod texture;

pub use emu::{DecodedInstr, ParamPartition, RegRef, ShaderEmulator};
pub use fetch::{ShaderConfig, ShaderFetch, ThreadEntry};
pub use input::{ShaderInput, ShaderInputId, ShaderInputMode, ShaderOutput};
pub use isa::{Bank, Opcode, Operand, ShaderInstr};
pub use texture::{TextureAccess, TextureOperation, TextureQueue};
