//! Shared infrastructure for the axion GPU model component crates.
//!
//! Components are single-threaded clocked units that exchange messages
//! through typed [`Signal`]s with a fixed per-edge bandwidth and latency.
//! A global cycle counter drives every unit's `clock` entry point once per
//! cycle; all communication effects of cycle `c` become observable at
//! `c + latency`.

pub mod signal;
pub mod stats;
pub mod types;
pub mod unit;

pub use signal::Signal;
pub use stats::Statistics;
pub use types::{FaceMode, TriangleSetupInput, VertexAttributes, POSITION_ATTRIBUTE};
pub use unit::ClockedUnit;

/// Cycles without input or output progress after which a unit is reported
/// as stalled.
pub const STALL_CYCLE_THRESHOLD: u64 = 1_000_000;

/// Aborts the simulation with a single diagnostic line naming the component
/// and, when given, the cycle of the violated invariant.
///
/// Back-pressure is never reported this way; only broken invariants are.
#[macro_export]
macro_rules! fatal {
    ($component:expr, $cycle:expr, $($arg:tt)*) => {{
        panic!("[{}] cycle {}: {}", $component, $cycle, format_args!($($arg)*))
    }};
    ($component:expr, $($arg:tt)*) => {{
        panic!("[{}] {}", $component, format_args!($($arg)*))
    }};
}
