//! Micro-triangle detection.
//!
//! Triangles whose subpixel bounding box fits inside a small pixel budget
//! can skip the hierarchical scan entirely and be shaded as micro-triangle
//! fragments. The test works on the fixed-point subpixel bounding box so a
//! sliver that merely straddles a pixel edge still counts its true extent.

use crate::setup::TriangleId;
use crate::RasterizerCore;

/// Outcome of the micro-triangle test: the pixel-space footprint of a
/// triangle small enough to bypass the scan engines.
#[derive(Clone, Copy, Debug)]
pub struct MicroTriangle {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
    /// Whole pixels covered per axis.
    pub pixels_x: u32,
    pub pixels_y: u32,
    /// 2x2 stamps covering the footprint per axis.
    pub stamps_x: u32,
    pub stamps_y: u32,
}

impl RasterizerCore {
    /// Tests whether a setup triangle is a micro triangle: its whole-pixel
    /// footprint is at most `size_limit` pixels on each axis. Returns the
    /// footprint when it is.
    ///
    /// Triangles touching the render window border are not micro
    /// triangles; their footprint was clipped and the real extent is
    /// unknown.
    pub fn test_micro_triangle(&self, id: TriangleId, size_limit: u32) -> Option<MicroTriangle> {
        let t = self.triangle(id);
        let (fx_min_x, fx_min_y, fx_max_x, fx_max_y) = t.subpixel_bounding_box();

        let min_x = fx_min_x.integer().to_f64() as i32;
        let min_y = fx_min_y.integer().to_f64() as i32;
        let max_x = fx_max_x.integer().to_f64() as i32;
        let max_y = fx_max_y.integer().to_f64() as i32;

        let w = self.cfg.window_w as i32;
        let h = self.cfg.window_h as i32;
        let on_border = min_x <= 0 || min_y <= 0 || max_x >= w - 1 || max_y >= h - 1;
        if on_border {
            return None;
        }

        let pixels_x = (max_x - min_x + 1) as u32;
        let pixels_y = (max_y - min_y + 1) as u32;
        if pixels_x > size_limit || pixels_y > size_limit {
            return None;
        }

        // Stamps are 2x2 and stamp-aligned, so an unaligned footprint may
        // need one extra stamp per axis.
        let aligned_x = min_x % 2 == 0;
        let aligned_y = min_y % 2 == 0;
        let stamps_x = (pixels_x + if aligned_x { 0 } else { 1 }).div_ceil(2);
        let stamps_y = (pixels_y + if aligned_y { 0 } else { 1 }).div_ceil(2);

        Some(MicroTriangle {
            min_x,
            min_y,
            max_x,
            max_y,
            pixels_x,
            pixels_y,
            stamps_x,
            stamps_y,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RasterizerConfig;
    use ax_model_core::types::VertexAttributes;
    use glam::Vec4;

    fn core() -> crate::RasterizerCore {
        crate::RasterizerCore::new(RasterizerConfig {
            viewport_w: 64,
            viewport_h: 64,
            window_w: 64,
            window_h: 64,
            active_triangles: 4,
            scan_tile_w: 8,
            scan_tile_h: 8,
            gen_tile_w: 4,
            gen_tile_h: 4,
            ..RasterizerConfig::default()
        })
    }

    fn vert(x: f32, y: f32) -> VertexAttributes {
        vec![Vec4::new(x, y, 0.0, 1.0)]
    }

    #[test]
    fn tiny_interior_triangle_is_micro() {
        let mut c = core();
        // Roughly two pixels wide around screen (32, 32).
        let id = c.setup(vert(0.0, 0.0), vert(0.06, 0.0), vert(0.0, 0.06));
        let micro = c.test_micro_triangle(id, 8).expect("fits the budget");
        assert!(micro.pixels_x <= 4 && micro.pixels_y <= 4);
        assert!(micro.stamps_x >= 1 && micro.stamps_y >= 1);
    }

    #[test]
    fn large_triangle_is_not_micro() {
        let mut c = core();
        let id = c.setup(vert(-0.8, -0.8), vert(0.8, -0.8), vert(-0.8, 0.8));
        assert!(c.test_micro_triangle(id, 8).is_none());
    }

    #[test]
    fn border_triangle_is_not_micro() {
        let mut c = core();
        // Small, but clipped against the window origin.
        let id = c.setup(vert(-1.0, -1.0), vert(-0.95, -1.0), vert(-1.0, -0.95));
        assert!(c.test_micro_triangle(id, 8).is_none());
    }

    #[test]
    fn unaligned_footprint_needs_the_extra_stamp() {
        let mut c = core();
        // Footprint starting on an odd pixel row/column.
        let id = c.setup(vert(-0.26, -0.26), vert(-0.2, -0.26), vert(-0.26, -0.2));
        if let Some(micro) = c.test_micro_triangle(id, 8) {
            if micro.min_x % 2 != 0 {
                assert!(micro.stamps_x * 2 >= micro.pixels_x + 1);
            }
        }
    }
}
