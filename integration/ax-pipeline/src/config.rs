//! Pipeline-level configuration.

use ax_model_core::fatal;
use ax_raster::{RasterizerConfig, ScanMode};
use ax_shader::ShaderConfig;
use ax_streamer::loader::StreamLayout;

/// Configuration of the whole core, combining the per-component blocks.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub raster: RasterizerConfig,
    pub scan_mode: ScanMode,
    pub shader: ShaderConfig,
    /// Stamps the rasterizer may emit per cycle.
    pub stamps_cycle: u32,
    /// Triangles the clipper accepts per cycle.
    pub triangles_cycle: u32,
    pub clip_buffer_size: usize,
    /// Backing memory for the vertex streams.
    pub memory_size: usize,
    pub memory_latency: u64,
    pub memory_queue: usize,
    /// Vertex stream layout for the loader.
    pub stream: StreamLayout,
    /// Output cache lines for shaded vertices.
    pub output_cache_lines: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            raster: RasterizerConfig::default(),
            scan_mode: ScanMode::Recursive,
            shader: ShaderConfig::default(),
            stamps_cycle: 2,
            triangles_cycle: 1,
            clip_buffer_size: 8,
            memory_size: 1 << 20,
            memory_latency: 8,
            memory_queue: 16,
            stream: StreamLayout {
                base_address: 0,
                stride: 64,
                attributes: 4,
            },
            output_cache_lines: 16,
        }
    }
}

impl PipelineConfig {
    /// Cross-component checks on top of the per-component validation.
    pub fn validate(&self) {
        self.raster.validate();
        if self.shader.stamp_fragments != ax_raster::STAMP_FRAGMENTS {
            fatal!("Pipeline", "shader stamp size must match the rasterizer stamp");
        }
        if self.raster.msaa_samples > 1 && self.shader.stamp_fragments != 4 {
            fatal!("Pipeline", "MSAA requires 2x2 stamps");
        }
        if self.memory_size == 0 {
            fatal!("Pipeline", "memory size must be non-zero");
        }
    }
}
