//! Edge-equation and viewport math for triangle setup.
//!
//! An edge equation is a triple (a, b, c) whose value at a sample is
//! a*x + b*y + c; the sign tells which side of the edge the sample lies on,
//! with inside positive. All setup math runs in f64.

use fixp::FixedPoint;
use glam::Vec4;

/// Half-width of the zero region used by the tie-break rules.
pub const EQ_ZERO: f64 = 1e-12;

/// True when the value is positive and outside the zero region.
#[inline]
pub fn is_positive(v: f64) -> bool {
    v > EQ_ZERO
}

/// True when the value falls inside the zero region.
#[inline]
pub fn is_zero(v: f64) -> bool {
    v.abs() <= EQ_ZERO
}

/// Deterministic inside rule for one edge equation.
///
/// A sample exactly on an edge belongs to at most one of two adjoining
/// triangles: the tie resolves by the sign of the horizontal coefficient,
/// then the vertical one.
#[inline]
pub fn inside_equation(c: f64, a: f64, b: f64) -> bool {
    is_positive(c) || (is_zero(c) && (is_positive(a) || (is_zero(a) && b >= 0.0)))
}

/// Componentwise add of equation-value quadruples (three edges + depth).
#[inline]
pub fn add4(a: &[f64; 4], b: &[f64; 4]) -> [f64; 4] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]]
}

/// Computes the three edge equations of a triangle from the homogeneous
/// (x, y, w) coordinates of its vertices.
///
/// Each edge is the cross product of the other two vertices' (x, y, w)
/// columns, i.e. a row of the adjoint of the vertex matrix, so
/// edge_i(vertex_j) vanishes for i != j and all three agree in sign on the
/// interior.
pub fn setup_matrix(v1: Vec4, v2: Vec4, v3: Vec4) -> ([f64; 3], [f64; 3], [f64; 3]) {
    let col = |v: Vec4| (v.x as f64, v.y as f64, v.w as f64);
    let (x1, y1, w1) = col(v1);
    let (x2, y2, w2) = col(v2);
    let (x3, y3, w3) = col(v3);

    let cross = |(xa, ya, wa): (f64, f64, f64), (xb, yb, wb): (f64, f64, f64)| {
        [ya * wb - wa * yb, wa * xb - xa * wb, xa * yb - ya * xb]
    };

    (
        cross((x2, y2, w2), (x3, y3, w3)),
        cross((x3, y3, w3), (x1, y1, w1)),
        cross((x1, y1, w1), (x2, y2, w2)),
    )
}

/// Derives the depth interpolation equation from the three edge equations
/// and the vertex depth values, treating the edges as a basis: edge_i is
/// non-zero only at vertex i, so scaling each edge by z_i over its value at
/// vertex i and summing interpolates depth.
pub fn interpolation_equation(
    e1: &[f64; 3],
    e2: &[f64; 3],
    e3: &[f64; 3],
    v1: Vec4,
    v2: Vec4,
    v3: Vec4,
) -> [f64; 3] {
    let eval = |e: &[f64; 3], v: Vec4| {
        e[0] * v.x as f64 + e[1] * v.y as f64 + e[2] * v.w as f64
    };
    let d1 = eval(e1, v1);
    let d2 = eval(e2, v2);
    let d3 = eval(e3, v3);
    let (z1, z2, z3) = (v1.z as f64 / d1, v2.z as f64 / d2, v3.z as f64 / d3);

    [
        z1 * e1[0] + z2 * e2[0] + z3 * e3[0],
        z1 * e1[1] + z2 * e2[1] + z3 * e3[1],
        z1 * e1[2] + z2 * e2[2] + z3 * e3[2],
    ]
}

/// Adjusts the edge and depth equations so they evaluate directly in screen
/// pixel coordinates under the given viewport, and returns the triangle
/// signed area approximation (the dot product of the c coefficients with
/// the vertex w components).
#[allow(clippy::too_many_arguments)]
pub fn viewport(
    v1: Vec4,
    v2: Vec4,
    v3: Vec4,
    e1: &mut [f64; 3],
    e2: &mut [f64; 3],
    e3: &mut [f64; 3],
    zeq: &mut [f64; 3],
    x0: i32,
    y0: i32,
    w: u32,
    h: u32,
) -> f64 {
    let area =
        e1[2] * v1.w as f64 + e2[2] * v2.w as f64 + e3[2] * v3.w as f64;

    // Screen x maps to NDC as (2(sx - x0) - w) / w; substituting into
    // a*ndc_x + b*ndc_y + c rescales a and b and folds the translation
    // into c.
    let remap = |e: &mut [f64; 3]| {
        let a = e[0];
        let b = e[1];
        let ax = 2.0 * a / w as f64;
        let by = 2.0 * b / h as f64;
        e[0] = ax;
        e[1] = by;
        e[2] -= ax * x0 as f64 + a + by * y0 as f64 + b;
    };
    remap(e1);
    remap(e2);
    remap(e3);
    remap(zeq);

    area
}

/// Non-homogeneous device coordinates of a clip-space vertex; w keeps the
/// reciprocal of the homogeneous w for later perspective math.
pub fn non_homogeneous(v: Vec4) -> Vec4 {
    let rw = 1.0 / v.w;
    Vec4::new(v.x * rw, v.y * rw, v.z * rw, rw)
}

/// Computes the non-homogeneous positions of the three vertices and the
/// fraction of the NDC square the triangle covers.
pub fn triangle_screen_area(v1: Vec4, v2: Vec4, v3: Vec4) -> (f64, Vec4, Vec4, Vec4) {
    let n1 = non_homogeneous(v1);
    let n2 = non_homogeneous(v2);
    let n3 = non_homogeneous(v3);

    let ax = (n2.x - n1.x) as f64;
    let ay = (n2.y - n1.y) as f64;
    let bx = (n3.x - n1.x) as f64;
    let by = (n3.y - n1.y) as f64;
    // Triangle area over the area of the [-1,1]^2 NDC square.
    let percent = (ax * by - ay * bx).abs() * 0.5 / 4.0;

    (percent, n1, n2, n3)
}

/// Screen-space position of a clip-space vertex under a viewport.
pub fn to_screen(v: Vec4, x0: i32, y0: i32, w: u32, h: u32) -> (f64, f64, f64) {
    let n = non_homogeneous(v);
    (
        x0 as f64 + (n.x as f64 + 1.0) * 0.5 * w as f64,
        y0 as f64 + (n.y as f64 + 1.0) * 0.5 * h as f64,
        n.z as f64,
    )
}

/// Integer screen bounding box of a triangle under a viewport.
#[allow(clippy::too_many_arguments)]
pub fn bounding_box(
    v1: Vec4,
    v2: Vec4,
    v3: Vec4,
    x0: i32,
    y0: i32,
    w: u32,
    h: u32,
) -> (i32, i32, i32, i32, i32, i32) {
    let p1 = to_screen(v1, x0, y0, w, h);
    let p2 = to_screen(v2, x0, y0, w, h);
    let p3 = to_screen(v3, x0, y0, w, h);

    let min3 = |a: f64, b: f64, c: f64| a.min(b).min(c);
    let max3 = |a: f64, b: f64, c: f64| a.max(b).max(c);

    (
        min3(p1.0, p2.0, p3.0).floor() as i32,
        max3(p1.0, p2.0, p3.0).ceil() as i32,
        min3(p1.1, p2.1, p3.1).floor() as i32,
        max3(p1.1, p2.1, p3.1).ceil() as i32,
        min3(p1.2, p2.2, p3.2).floor() as i32,
        max3(p1.2, p2.2, p3.2).ceil() as i32,
    )
}

/// Subpixel-precision screen bounding box kept as 16.N fixed point.
#[allow(clippy::too_many_arguments)]
pub fn subpixel_bounding_box(
    v1: Vec4,
    v2: Vec4,
    v3: Vec4,
    x0: i32,
    y0: i32,
    w: u32,
    h: u32,
    subpixel_bits: u32,
) -> (FixedPoint, FixedPoint, FixedPoint, FixedPoint) {
    let p1 = to_screen(v1, x0, y0, w, h);
    let p2 = to_screen(v2, x0, y0, w, h);
    let p3 = to_screen(v3, x0, y0, w, h);

    let min3 = |a: f64, b: f64, c: f64| a.min(b).min(c);
    let max3 = |a: f64, b: f64, c: f64| a.max(b).max(c);

    let fx = |v: f64| FixedPoint::from_f64(v, 16, subpixel_bits);
    (
        fx(min3(p1.0, p2.0, p3.0)),
        fx(min3(p1.1, p2.1, p3.1)),
        fx(max3(p1.0, p2.0, p3.0)),
        fx(max3(p1.1, p2.1, p3.1)),
    )
}

/// Conservative tile test on four corner samples of the three edge
/// equations (depth in the fourth lane is ignored).
///
/// A tile may contain covered samples unless some edge sees all four
/// corners strictly negative; a tile that passes can still turn out empty.
pub fn evaluate_tile(c0: &[f64; 4], c1: &[f64; 4], c2: &[f64; 4], c3: &[f64; 4]) -> bool {
    for e in 0..3 {
        if c0[e] < 0.0 && c1[e] < 0.0 && c2[e] < 0.0 && c3[e] < 0.0 {
            return false;
        }
    }
    true
}
