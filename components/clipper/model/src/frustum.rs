//! Trivial frustum rejection test.

use glam::Vec4;

/// Outcode bits for the six frustum half-spaces in clip space.
fn outcode(v: Vec4, d3d9_depth_range: bool) -> u32 {
    let w = v.w;
    // Near-plane bound of the clip volume: z >= 0 under the D3D9 convention,
    // z >= -w under the OpenGL convention.
    let z_min = if d3d9_depth_range { 0.0 } else { -w };

    let mut code = 0;
    if v.x < -w {
        code |= 0x01;
    }
    if v.x > w {
        code |= 0x02;
    }
    if v.y < -w {
        code |= 0x04;
    }
    if v.y > w {
        code |= 0x08;
    }
    if v.z < z_min {
        code |= 0x10;
    }
    if v.z > w {
        code |= 0x20;
    }
    code
}

/// Returns true when the triangle can be trivially rejected: all three
/// vertices fail the same half-space test of the clip volume.
pub fn trivial_reject(v1: Vec4, v2: Vec4, v3: Vec4, d3d9_depth_range: bool) -> bool {
    outcode(v1, d3d9_depth_range)
        & outcode(v2, d3d9_depth_range)
        & outcode(v3, d3d9_depth_range)
        != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_left_of_frustum_is_rejected() {
        let v1 = Vec4::new(-2.0, 0.0, 0.0, 1.0);
        let v2 = Vec4::new(-3.0, 0.0, 0.0, 1.0);
        let v3 = Vec4::new(-2.5, 1.0, 0.0, 1.0);
        assert!(trivial_reject(v1, v2, v3, false));
    }

    #[test]
    fn triangle_inside_is_kept() {
        let v1 = Vec4::new(0.0, 0.0, 0.0, 1.0);
        let v2 = Vec4::new(0.5, 0.0, 0.0, 1.0);
        let v3 = Vec4::new(0.0, 0.5, 0.0, 1.0);
        assert!(!trivial_reject(v1, v2, v3, false));
    }

    #[test]
    fn straddling_triangle_is_kept() {
        // One vertex far left, the others inside: no common failing plane.
        let v1 = Vec4::new(-5.0, 0.0, 0.0, 1.0);
        let v2 = Vec4::new(0.5, 0.0, 0.0, 1.0);
        let v3 = Vec4::new(0.0, 0.5, 0.0, 1.0);
        assert!(!trivial_reject(v1, v2, v3, false));
    }

    #[test]
    fn near_plane_depends_on_depth_convention() {
        // z slightly negative: outside under D3D9, inside under OpenGL.
        let v1 = Vec4::new(0.0, 0.0, -0.1, 1.0);
        let v2 = Vec4::new(0.2, 0.0, -0.1, 1.0);
        let v3 = Vec4::new(0.0, 0.2, -0.1, 1.0);
        assert!(trivial_reject(v1, v2, v3, true));
        assert!(!trivial_reject(v1, v2, v3, false));
    }

    #[test]
    fn behind_far_plane_is_rejected() {
        let v1 = Vec4::new(0.0, 0.0, 2.0, 1.0);
        let v2 = Vec4::new(0.2, 0.0, 2.5, 1.0);
        let v3 = Vec4::new(0.0, 0.2, 3.0, 1.0);
        assert!(trivial_reject(v1, v2, v3, false));
    }
}
