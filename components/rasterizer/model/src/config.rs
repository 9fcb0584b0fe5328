//! Rasterizer configuration.

use ax_model_core::fatal;
use ax_model_core::types::FaceMode;

/// Static configuration of the rasterizer, fixed at construction.
#[derive(Clone, Debug)]
pub struct RasterizerConfig {
    /// Scan tile size in pixels (power of two).
    pub scan_tile_w: u32,
    pub scan_tile_h: u32,
    /// Over tile size in scan tiles.
    pub over_tile_w: u32,
    pub over_tile_h: u32,
    /// Generation tile size in pixels (power of two, at least a stamp).
    pub gen_tile_w: u32,
    pub gen_tile_h: u32,
    /// Entries in the setup-triangle table.
    pub active_triangles: usize,
    /// Attributes carried per fragment.
    pub fragment_attributes: usize,
    /// Fractional bits of the subpixel bounding box.
    pub subpixel_bits: u32,
    /// Depth buffer precision in bits.
    pub depth_bits: u32,
    /// Depth range.
    pub depth_near: f32,
    pub depth_far: f32,
    /// Pixel-coordinate convention: D3D9 inverts the vertical axis.
    pub d3d9_pixel_coordinates: bool,
    /// Clip-space depth convention: [0,1] (D3D9) or [-1,1] (OpenGL).
    pub d3d9_depth_range: bool,
    /// Skip the OpenGL half-pixel sample offset.
    pub d3d9_rasterization_rules: bool,
    /// Winding that counts as front-facing.
    pub face_mode: FaceMode,
    /// Viewport origin and size.
    pub viewport_x: i32,
    pub viewport_y: i32,
    pub viewport_w: u32,
    pub viewport_h: u32,
    /// Render window size (scissor clamp bound).
    pub window_w: u32,
    pub window_h: u32,
    /// Scissor rectangle; disabled means the full window.
    pub scissor_enabled: bool,
    pub scissor_x: i32,
    pub scissor_y: i32,
    pub scissor_w: u32,
    pub scissor_h: u32,
    /// MSAA sample count; 1 disables multisampling.
    pub msaa_samples: u32,
}

impl Default for RasterizerConfig {
    fn default() -> Self {
        RasterizerConfig {
            scan_tile_w: 8,
            scan_tile_h: 8,
            over_tile_w: 4,
            over_tile_h: 4,
            gen_tile_w: 4,
            gen_tile_h: 4,
            active_triangles: 16,
            fragment_attributes: 8,
            subpixel_bits: 8,
            depth_bits: 24,
            depth_near: 0.0,
            depth_far: 1.0,
            d3d9_pixel_coordinates: false,
            d3d9_depth_range: false,
            d3d9_rasterization_rules: false,
            face_mode: FaceMode::Ccw,
            viewport_x: 0,
            viewport_y: 0,
            viewport_w: 400,
            viewport_h: 400,
            window_w: 400,
            window_h: 400,
            scissor_enabled: false,
            scissor_x: 0,
            scissor_y: 0,
            scissor_w: 400,
            scissor_h: 400,
            msaa_samples: 1,
        }
    }
}

impl RasterizerConfig {
    /// Rejects configurations the hardware could not be built with.
    pub fn validate(&self) {
        if !self.scan_tile_w.is_power_of_two() || !self.scan_tile_h.is_power_of_two() {
            fatal!("Rasterizer", "scan tile size must be a power of two");
        }
        if !self.gen_tile_w.is_power_of_two() || !self.gen_tile_h.is_power_of_two() {
            fatal!("Rasterizer", "generation tile size must be a power of two");
        }
        if self.gen_tile_w < 2 || self.gen_tile_h < 2 {
            fatal!("Rasterizer", "generation tile must cover at least a stamp");
        }
        if self.gen_tile_w > self.scan_tile_w || self.gen_tile_h > self.scan_tile_h {
            fatal!("Rasterizer", "generation tile larger than the scan tile");
        }
        if self.active_triangles == 0 {
            fatal!("Rasterizer", "at least one setup triangle entry required");
        }
        if !matches!(self.msaa_samples, 1 | 2 | 4 | 6 | 8) {
            fatal!("Rasterizer", "unsupported MSAA mode");
        }
        if self.depth_bits == 0 || self.depth_bits > 32 {
            fatal!("Rasterizer", "depth precision out of range");
        }
    }

    /// The effective scissor box clamped to the render window.
    pub fn scissor_box(&self) -> (i32, i32, u32, u32) {
        if self.scissor_enabled {
            let x0 = self.scissor_x.max(0);
            let y0 = self.scissor_y.max(0);
            let w = self.scissor_w.min(self.window_w.saturating_sub(x0 as u32));
            let h = self.scissor_h.min(self.window_h.saturating_sub(y0 as u32));
            (x0, y0, w, h)
        } else {
            (0, 0, self.window_w, self.window_h)
        }
    }
}
