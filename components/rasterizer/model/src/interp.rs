//! Fragment attribute interpolation.
//!
//! Attributes interpolate from the vertex attributes through the edge
//! coordinates of the fragment:
//!
//! ```text
//! r  = 1 / (F0 + F1 + F2)
//! fi = r * Fi
//! pk = pk0*f0 + pk1*f1 + pk2*f2
//! ```
//!
//! where Fi are the edge equation values at the fragment and pki the
//! attribute values at the vertices. Perspective correction, when a shader
//! wants it, is the shader's business via the per-vertex 1/w.

use glam::Vec4;

use crate::fragment::Fragment;
use crate::RasterizerCore;

impl RasterizerCore {
    /// Barycentric weights of a fragment derived from its edge values.
    fn weights(&self, fragment: &Fragment) -> [f64; 3] {
        let f = &fragment.coords;
        let r = 1.0 / (f[0] + f[1] + f[2]);
        [r * f[0], r * f[1], r * f[2]]
    }

    /// Interpolates one attribute of a fragment.
    pub fn interpolate(&self, fragment: &Fragment, attribute: usize) -> Vec4 {
        let w = self.weights(fragment);
        let t = self.triangle(fragment.triangle);
        let p0 = t.attribute(0, attribute);
        let p1 = t.attribute(1, attribute);
        let p2 = t.attribute(2, attribute);

        let mut out = [0.0f32; 4];
        for k in 0..4 {
            out[k] = (p0[k] as f64 * w[0] + p1[k] as f64 * w[1] + p2[k] as f64 * w[2]) as f32;
        }
        Vec4::from_array(out)
    }

    /// Interpolates every attribute of a fragment.
    pub fn interpolate_all(&self, fragment: &Fragment) -> Vec<Vec4> {
        let w = self.weights(fragment);
        let t = self.triangle(fragment.triangle);
        let count = t
            .attributes(0)
            .len()
            .min(self.config().fragment_attributes);

        let mut out = Vec::with_capacity(count);
        for a in 0..count {
            let p0 = t.attribute(0, a);
            let p1 = t.attribute(1, a);
            let p2 = t.attribute(2, a);
            let mut v = [0.0f32; 4];
            for k in 0..4 {
                v[k] = (p0[k] as f64 * w[0] + p1[k] as f64 * w[1] + p2[k] as f64 * w[2]) as f32;
            }
            out.push(Vec4::from_array(v));
        }
        out
    }

    /// Copies (flat-shades) one attribute from a provoking vertex.
    pub fn flat_attribute(&self, fragment: &Fragment, attribute: usize, vertex: usize) -> Vec4 {
        self.triangle(fragment.triangle).attribute(vertex, attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RasterizerConfig, RasterizerCore};
    use ax_model_core::types::VertexAttributes;

    fn core() -> RasterizerCore {
        RasterizerCore::new(RasterizerConfig {
            viewport_w: 16,
            viewport_h: 16,
            window_w: 16,
            window_h: 16,
            active_triangles: 4,
            scan_tile_w: 8,
            scan_tile_h: 8,
            gen_tile_w: 4,
            gen_tile_h: 4,
            ..RasterizerConfig::default()
        })
    }

    fn vert(x: f32, y: f32, color: Vec4) -> VertexAttributes {
        vec![Vec4::new(x, y, 0.0, 1.0), color]
    }

    #[test]
    fn interpolation_reproduces_sample_position() {
        let mut c = core();
        // Color attribute carries the clip position so interpolation can be
        // checked against the sample coordinates.
        let id = c.setup(
            vert(-1.0, -1.0, Vec4::new(-1.0, -1.0, 0.0, 1.0)),
            vert(1.0, -1.0, Vec4::new(1.0, -1.0, 0.0, 1.0)),
            vert(-1.0, 1.0, Vec4::new(-1.0, 1.0, 0.0, 1.0)),
        );

        c.start_recursive(&[id], false);
        while let Some((stamp, _)) = c.next_stamp_recursive_blocking() {
            for f in stamp.fragments.iter().filter(|f| f.inside) {
                let v = c.interpolate(f, 1);
                // Screen position of an interpolated clip position.
                let sx = (v.x + 1.0) * 0.5 * 16.0;
                let sy = (v.y + 1.0) * 0.5 * 16.0;
                // Samples sit at the pixel center.
                let ex = f.x as f64 + 0.5;
                let ey = f.y as f64 + 0.5;
                assert!(
                    (sx as f64 - ex).abs() < 1e-3 && (sy as f64 - ey).abs() < 1e-3,
                    "sample ({ex}, {ey}) interpolated to ({sx}, {sy})"
                );
            }
            if stamp.is_last() {
                break;
            }
        }
    }

    #[test]
    fn weights_sum_to_one() {
        let mut c = core();
        let id = c.setup(
            vert(-1.0, -1.0, Vec4::ONE),
            vert(1.0, -1.0, Vec4::ONE),
            vert(-1.0, 1.0, Vec4::ONE),
        );
        c.start_recursive(&[id], false);
        while let Some((stamp, _)) = c.next_stamp_recursive_blocking() {
            for f in stamp.fragments.iter().filter(|f| f.inside) {
                let v = c.interpolate(f, 1);
                assert!((v.x - 1.0).abs() < 1e-5, "constant attribute drifted: {v}");
            }
            if stamp.is_last() {
                break;
            }
        }
    }
}
