//! Streamer component of the axion GPU core: fetches vertex data over the
//! memory bus, feeds vertex work to the shader, and caches shaded vertices
//! so re-referenced indices skip shading.

pub mod cache;
pub mod commit;
pub mod loader;

pub use cache::{CacheLookup, StreamerCommand, StreamerOutputCache, StreamerState};
pub use commit::{CommittedPrimitive, StreamerCommit};
pub use loader::StreamerLoader;
