//! The per-primitive setup record and the setup operations.

use ax_model_core::fatal;
use ax_model_core::types::{FaceMode, VertexAttributes, POSITION_ATTRIBUTE};
use fixp::FixedPoint;
use glam::Vec4;

use crate::math;
use crate::RasterizerCore;

/// Index of a triangle in the setup table.
pub type TriangleId = u32;

/// Travel direction of the tiled scanline engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RasterDirection {
    Center,
    Up,
    Down,
    UpLeft,
    UpRight,
    DownLeft,
    DownRight,
    CenterLeft,
    CenterRight,
    Left,
    Right,
    TopBorder,
    LeftBorder,
    BottomBorder,
}

impl RasterDirection {
    /// Border directions search the bounding box edges for coverage.
    pub fn is_border(self) -> bool {
        matches!(
            self,
            RasterDirection::TopBorder
                | RasterDirection::LeftBorder
                | RasterDirection::BottomBorder
        )
    }
}

/// The save slots of a setup triangle: the raster start, the stamp-level
/// resume positions and the over-tile resume positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveKind {
    RasterStart,
    Up,
    Down,
    Right,
    TileUp,
    TileDown,
    TileLeft,
    TileRight,
}

/// Public alias kept for wiring code.
pub type SaveSlot = SaveKind;

/// One saved scan position: the c values of the three edges and the depth
/// equation plus the position they were sampled at.
#[derive(Clone, Copy, Debug, Default)]
struct Save {
    valid: bool,
    c: [f64; 4],
    x: i32,
    y: i32,
}

/// The root per-primitive record: vertex attributes, equations, bounding
/// boxes and the scanline engine's resume state.
pub struct SetupTriangle {
    attributes: [VertexAttributes; 3],
    nh_position: [Vec4; 3],

    /// Edge equations; the c component always holds the value at the
    /// current raster position.
    edges: [[f64; 3]; 3],
    zeq: [f64; 3],

    x: i32,
    y: i32,
    direction: RasterDirection,
    /// Direction committed at over-tile granularity; Center permits saves
    /// in every direction.
    tile_direction: RasterDirection,
    /// Travel direction the right save resumes with, fixed when the save
    /// is taken so a row keeps its vertical commitment.
    right_resume: RasterDirection,

    bb: (i32, i32, i32, i32),
    sub_bb: (FixedPoint, FixedPoint, FixedPoint, FixedPoint),

    area: f64,
    screen_percent: f64,
    pre_bound: bool,
    first_stamp: bool,
    last_fragment: bool,

    saves: [Save; 8],
}

fn slot_index(kind: SaveKind) -> usize {
    match kind {
        SaveKind::RasterStart => 0,
        SaveKind::Up => 1,
        SaveKind::Down => 2,
        SaveKind::Right => 3,
        SaveKind::TileUp => 4,
        SaveKind::TileDown => 5,
        SaveKind::TileLeft => 6,
        SaveKind::TileRight => 7,
    }
}

impl SetupTriangle {
    pub fn new(v1: VertexAttributes, v2: VertexAttributes, v3: VertexAttributes) -> SetupTriangle {
        SetupTriangle {
            attributes: [v1, v2, v3],
            nh_position: [Vec4::ZERO; 3],
            edges: [[0.0; 3]; 3],
            zeq: [0.0; 3],
            x: 0,
            y: 0,
            direction: RasterDirection::Center,
            tile_direction: RasterDirection::Center,
            right_resume: RasterDirection::CenterRight,
            bb: (0, 0, 0, 0),
            sub_bb: (
                FixedPoint::default(),
                FixedPoint::default(),
                FixedPoint::default(),
                FixedPoint::default(),
            ),
            area: 0.0,
            screen_percent: 0.0,
            pre_bound: false,
            first_stamp: true,
            last_fragment: false,
            saves: [Save::default(); 8],
        }
    }

    pub fn attribute(&self, vertex: usize, index: usize) -> Vec4 {
        self.attributes[vertex][index]
    }

    pub fn attributes(&self, vertex: usize) -> &VertexAttributes {
        &self.attributes[vertex]
    }

    pub fn position(&self, vertex: usize) -> Vec4 {
        self.attributes[vertex][POSITION_ATTRIBUTE]
    }

    pub fn nh_position(&self, vertex: usize) -> Vec4 {
        self.nh_position[vertex]
    }

    pub fn edge1(&self) -> [f64; 3] {
        self.edges[0]
    }

    pub fn edge2(&self) -> [f64; 3] {
        self.edges[1]
    }

    pub fn edge3(&self) -> [f64; 3] {
        self.edges[2]
    }

    pub fn zeq(&self) -> [f64; 3] {
        self.zeq
    }

    /// The equation values at the current raster position, depth last.
    pub fn current_values(&self) -> [f64; 4] {
        [self.edges[0][2], self.edges[1][2], self.edges[2][2], self.zeq[2]]
    }

    pub fn set_edge_equations(&mut self, e1: [f64; 3], e2: [f64; 3], e3: [f64; 3]) {
        self.edges = [e1, e2, e3];
    }

    pub fn set_z_equation(&mut self, zeq: [f64; 3]) {
        self.zeq = zeq;
    }

    pub fn raster_position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn set_raster_position(&mut self, x: i32, y: i32) {
        self.x = x;
        self.y = y;
    }

    pub fn direction(&self) -> RasterDirection {
        self.direction
    }

    pub fn set_direction(&mut self, direction: RasterDirection) {
        self.direction = direction;
    }

    /// Whether a save in the given over-tile direction is still allowed
    /// under the current tile-level commitment. Moving back towards the
    /// over-tile the walk came from is never allowed; everything else is.
    pub fn tile_direction_allows(&self, direction: RasterDirection) -> bool {
        let opposite = match self.tile_direction {
            RasterDirection::Up => RasterDirection::Down,
            RasterDirection::Down => RasterDirection::Up,
            RasterDirection::Left => RasterDirection::Right,
            RasterDirection::Right => RasterDirection::Left,
            _ => return true,
        };
        direction != opposite
    }

    pub fn set_tile_direction(&mut self, direction: RasterDirection) {
        self.tile_direction = direction;
    }

    pub fn right_resume(&self) -> RasterDirection {
        self.right_resume
    }

    pub fn set_right_resume(&mut self, direction: RasterDirection) {
        self.right_resume = direction;
    }

    pub fn bounding_box(&self) -> (i32, i32, i32, i32) {
        self.bb
    }

    pub fn set_bounding_box(&mut self, x_min: i32, y_min: i32, x_max: i32, y_max: i32) {
        self.bb = (x_min, y_min, x_max, y_max);
    }

    pub fn subpixel_bounding_box(&self) -> (FixedPoint, FixedPoint, FixedPoint, FixedPoint) {
        self.sub_bb
    }

    pub fn set_subpixel_bounding_box(
        &mut self,
        x_min: FixedPoint,
        y_min: FixedPoint,
        x_max: FixedPoint,
        y_max: FixedPoint,
    ) {
        self.sub_bb = (x_min, y_min, x_max, y_max);
    }

    pub fn area(&self) -> f64 {
        self.area
    }

    pub fn set_area(&mut self, area: f64) {
        self.area = area;
    }

    pub fn screen_percent(&self) -> f64 {
        self.screen_percent
    }

    pub fn set_screen_percent(&mut self, percent: f64) {
        self.screen_percent = percent;
    }

    pub fn set_nh_position(&mut self, vertex: usize, position: Vec4) {
        self.nh_position[vertex] = position;
    }

    pub fn is_pre_bound(&self) -> bool {
        self.pre_bound
    }

    pub fn set_pre_bound(&mut self) {
        self.pre_bound = true;
    }

    pub fn is_first_stamp(&self) -> bool {
        self.first_stamp
    }

    pub fn set_first_stamp(&mut self, first: bool) {
        self.first_stamp = first;
    }

    pub fn is_last_fragment(&self) -> bool {
        self.last_fragment
    }

    /// Marks that the scan produced its final position.
    pub fn mark_last_fragment(&mut self) {
        self.last_fragment = true;
    }

    /// Negates all edge equations, flipping which side counts as inside.
    pub fn invert_facing(&mut self) {
        for e in &mut self.edges {
            e[0] = -e[0];
            e[1] = -e[1];
            e[2] = -e[2];
        }
        self.area = -self.area;
    }

    /// Stores equation values and a position into a save slot.
    pub fn save(&mut self, c: [f64; 4], x: i32, y: i32, kind: SaveKind) {
        let slot = &mut self.saves[slot_index(kind)];
        slot.valid = true;
        slot.c = c;
        slot.x = x;
        slot.y = y;
    }

    /// Captures the current raster position into the raster-start slot.
    pub fn save_raster_start(&mut self) {
        let c = self.current_values();
        let (x, y) = (self.x, self.y);
        self.save(c, x, y, SaveKind::RasterStart);
    }

    pub fn is_saved(&self, kind: SaveKind) -> bool {
        self.saves[slot_index(kind)].valid
    }

    /// Reloads a save slot into the live equations and clears its valid
    /// bit, making the slot the active raster position.
    pub fn restore(&mut self, kind: SaveKind) {
        let slot = &mut self.saves[slot_index(kind)];
        if !slot.valid {
            fatal!("Rasterizer", "restoring an empty {kind:?} save");
        }
        slot.valid = false;
        let c = slot.c;
        let (x, y) = (slot.x, slot.y);
        self.edges[0][2] = c[0];
        self.edges[1][2] = c[1];
        self.edges[2][2] = c[2];
        self.zeq[2] = c[3];
        self.x = x;
        self.y = y;
    }

    /// Moves the live raster position to new values without a save slot.
    pub fn update_position(&mut self, c: [f64; 4], x: i32, y: i32) {
        self.edges[0][2] = c[0];
        self.edges[1][2] = c[1];
        self.edges[2][2] = c[2];
        self.zeq[2] = c[3];
        self.x = x;
        self.y = y;
    }

    /// Re-evaluates the equation c components at position (x, y), relative
    /// to the current raster position.
    pub fn step_to(&mut self, x: i32, y: i32) {
        let dx = (x - self.x) as f64;
        let dy = (y - self.y) as f64;
        for e in &mut self.edges {
            e[2] += e[0] * dx + e[1] * dy;
        }
        self.zeq[2] += self.zeq[0] * dx + self.zeq[1] * dy;
        self.x = x;
        self.y = y;
    }

    /// Count of valid stamp-level and tile-level saves, for invariants.
    pub fn valid_saves(&self) -> usize {
        self.saves.iter().skip(1).filter(|s| s.valid).count()
    }
}

impl RasterizerCore {
    /// Full triangle setup: allocates a slot, computes the equations, the
    /// bounding boxes and the derived scalars.
    pub fn setup(
        &mut self,
        v1: VertexAttributes,
        v2: VertexAttributes,
        v3: VertexAttributes,
    ) -> TriangleId {
        let id = self.pre_bound(v1, v2, v3);
        self.triangle_mut(id).pre_bound = false;
        self.setup_edge_equations(id);
        id
    }

    /// Allocates the triangle and computes only its bounding boxes; the
    /// edge equations follow in `setup_edge_equations`.
    pub fn pre_bound(
        &mut self,
        v1: VertexAttributes,
        v2: VertexAttributes,
        v3: VertexAttributes,
    ) -> TriangleId {
        let mut triangle = SetupTriangle::new(v1, v2, v3);

        // The D3D9 pixel convention grows y downwards.
        if self.config().d3d9_pixel_coordinates {
            for v in 0..3 {
                triangle.attributes[v][POSITION_ATTRIBUTE].y =
                    -triangle.attributes[v][POSITION_ATTRIBUTE].y;
            }
        }

        let (p1, p2, p3) = (
            triangle.position(0),
            triangle.position(1),
            triangle.position(2),
        );
        let cfg = self.config().clone();

        let (sub_x_min, sub_y_min, sub_x_max, sub_y_max) = math::subpixel_bounding_box(
            p1,
            p2,
            p3,
            cfg.viewport_x,
            cfg.viewport_y,
            cfg.viewport_w,
            cfg.viewport_h,
            cfg.subpixel_bits,
        );

        let (mut x_min, mut x_max, mut y_min, mut y_max, _z_min, _z_max) = math::bounding_box(
            p1,
            p2,
            p3,
            cfg.viewport_x,
            cfg.viewport_y,
            cfg.viewport_w,
            cfg.viewport_h,
        );

        // Clamp the box to the scissor rectangle.
        let (scx, scy, scw, sch) = cfg.scissor_box();
        x_min = x_min.max(scx).min(scx + scw as i32);
        x_max = x_max.min(scx + scw as i32).max(scx);
        y_min = y_min.max(scy).min(scy + sch as i32);
        y_max = y_max.min(scy + sch as i32).max(scy);

        let (percent, n1, n2, n3) = math::triangle_screen_area(p1, p2, p3);
        triangle.set_nh_position(0, n1);
        triangle.set_nh_position(1, n2);
        triangle.set_nh_position(2, n3);
        triangle.set_screen_percent(percent);
        triangle.set_bounding_box(x_min, y_min, x_max, y_max);
        triangle.set_subpixel_bounding_box(sub_x_min, sub_y_min, sub_x_max, sub_y_max);
        triangle.set_pre_bound();

        self.allocate_slot(triangle)
    }

    /// Computes the edge and depth equations of a pre-bound triangle.
    pub fn setup_edge_equations(&mut self, id: TriangleId) {
        let cfg = self.config().clone();
        let t = self.triangle(id);
        let (p1, p2, p3) = (t.position(0), t.position(1), t.position(2));

        let (mut e1, mut e2, mut e3) = math::setup_matrix(p1, p2, p3);

        // Inverting the vertical coordinate inverts the vertex ordering, so
        // the facing flip condition folds the two conventions together.
        if (cfg.face_mode == FaceMode::Cw && !cfg.d3d9_pixel_coordinates)
            || (cfg.face_mode == FaceMode::Ccw && cfg.d3d9_pixel_coordinates)
        {
            for e in [&mut e1, &mut e2, &mut e3] {
                e[0] = -e[0];
                e[1] = -e[1];
                e[2] = -e[2];
            }
        }

        let mut zeq = math::interpolation_equation(&e1, &e2, &e3, p1, p2, p3);

        let area = math::viewport(
            p1,
            p2,
            p3,
            &mut e1,
            &mut e2,
            &mut e3,
            &mut zeq,
            cfg.viewport_x,
            cfg.viewport_y,
            cfg.viewport_w,
            cfg.viewport_h,
        );

        // OpenGL samples at pixel centers; D3D9 rules sample at the pixel
        // origin.
        if !cfg.d3d9_rasterization_rules {
            for e in [&mut e1, &mut e2, &mut e3, &mut zeq] {
                e[2] += e[0] * 0.5 + e[1] * 0.5;
            }
        }

        let t = self.triangle_mut(id);
        t.set_area(area);
        t.set_edge_equations(e1, e2, e3);
        t.set_z_equation(zeq);
    }

    /// Creates a setup triangle from equations precalculated by a setup
    /// shader program: A/B/C pack the per-edge coefficients column-wise,
    /// with the depth equation in the w lanes.
    pub fn setup_precalculated(
        &mut self,
        v1: VertexAttributes,
        v2: VertexAttributes,
        v3: VertexAttributes,
        a: Vec4,
        b: Vec4,
        c: Vec4,
        area: f32,
    ) -> TriangleId {
        let id = self.pre_bound(v1, v2, v3);
        self.triangle_mut(id).pre_bound = false;
        self.load_precalculated(id, a, b, c, area);
        id
    }

    /// Loads precalculated equations into a pre-bound triangle.
    pub fn load_precalculated(&mut self, id: TriangleId, a: Vec4, b: Vec4, c: Vec4, area: f32) {
        let t = self.triangle_mut(id);
        t.set_edge_equations(
            [a.x as f64, b.x as f64, c.x as f64],
            [a.y as f64, b.y as f64, c.y as f64],
            [a.z as f64, b.z as f64, c.z as f64],
        );
        t.set_z_equation([a.w as f64, b.w as f64, c.w as f64]);
        t.set_area(area as f64);
    }

    /// Selects between the two vertex color sets of a two-sided lighting
    /// setup based on the triangle's facing.
    pub fn select_two_sided_color(&mut self, id: TriangleId, front_color: usize, back_color: usize) {
        let facing_front = self.triangle(id).area() > 0.0;
        let source = if facing_front { front_color } else { back_color };
        let t = self.triangle_mut(id);
        for v in 0..3 {
            if source < t.attributes[v].len() {
                let color = t.attributes[v][source];
                t.attributes[v][front_color] = color;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RasterizerConfig;

    fn core_4x4() -> RasterizerCore {
        RasterizerCore::new(RasterizerConfig {
            viewport_w: 4,
            viewport_h: 4,
            window_w: 4,
            window_h: 4,
            scissor_w: 4,
            scissor_h: 4,
            active_triangles: 4,
            scan_tile_w: 4,
            scan_tile_h: 4,
            gen_tile_w: 2,
            gen_tile_h: 2,
            ..RasterizerConfig::default()
        })
    }

    fn vert(x: f32, y: f32, z: f32) -> VertexAttributes {
        vec![Vec4::new(x, y, z, 1.0)]
    }

    #[test]
    fn setup_fills_equations_and_box() {
        let mut core = core_4x4();
        let id = core.setup(
            vert(-1.0, -1.0, 0.0),
            vert(1.0, -1.0, 0.0),
            vert(-1.0, 1.0, 0.0),
        );
        let t = core.triangle(id);
        assert!(t.area() != 0.0);
        let (x0, y0, x1, y1) = t.bounding_box();
        assert_eq!((x0, y0), (0, 0));
        assert!(x1 >= 4 && y1 >= 4);
    }

    #[test]
    fn save_restore_round_trip() {
        let mut core = core_4x4();
        let id = core.setup(
            vert(-1.0, -1.0, 0.0),
            vert(1.0, -1.0, 0.0),
            vert(-1.0, 1.0, 0.0),
        );
        let t = core.triangle_mut(id);
        t.set_raster_position(0, 0);
        let before = t.current_values();
        t.save(before, 0, 0, SaveKind::Right);
        assert!(t.is_saved(SaveKind::Right));
        t.step_to(2, 2);
        t.restore(SaveKind::Right);
        assert!(!t.is_saved(SaveKind::Right));
        assert_eq!(t.current_values(), before);
        assert_eq!(t.raster_position(), (0, 0));
    }

    #[test]
    fn step_to_is_incremental() {
        let mut core = core_4x4();
        let id = core.setup(
            vert(-1.0, -1.0, 0.5),
            vert(1.0, -1.0, 0.5),
            vert(-1.0, 1.0, 0.5),
        );
        let t = core.triangle_mut(id);
        t.set_raster_position(0, 0);
        let e1 = t.edge1();
        let expect = e1[2] + e1[0] * 3.0 + e1[1] * 1.0;
        t.step_to(3, 1);
        assert!((t.edge1()[2] - expect).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "no free setup triangle entry")]
    fn table_overflow_is_fatal() {
        let mut core = core_4x4();
        for _ in 0..5 {
            core.setup(
                vert(-1.0, -1.0, 0.0),
                vert(1.0, -1.0, 0.0),
                vert(-1.0, 1.0, 0.0),
            );
        }
    }

    #[test]
    fn release_frees_the_slot() {
        let mut core = core_4x4();
        let id = core.setup(
            vert(-1.0, -1.0, 0.0),
            vert(1.0, -1.0, 0.0),
            vert(-1.0, 1.0, 0.0),
        );
        core.retain(id);
        core.destroy_triangle(id);
        // A fragment still holds a reference; the slot stays occupied.
        assert_eq!(core.free_setup_slots(), 3);
        core.release(id);
        assert_eq!(core.free_setup_slots(), 4);
    }

    #[test]
    fn d3d9_flips_vertical_axis() {
        let mut cfg = RasterizerConfig {
            viewport_w: 4,
            viewport_h: 4,
            window_w: 4,
            window_h: 4,
            active_triangles: 4,
            scan_tile_w: 4,
            scan_tile_h: 4,
            gen_tile_w: 2,
            gen_tile_h: 2,
            ..RasterizerConfig::default()
        };
        cfg.d3d9_pixel_coordinates = true;
        let mut core = RasterizerCore::new(cfg);
        let id = core.pre_bound(
            vert(-1.0, -1.0, 0.0),
            vert(1.0, -1.0, 0.0),
            vert(-1.0, 1.0, 0.0),
        );
        // Stored position has the y negated.
        assert_eq!(core.triangle(id).position(0).y, 1.0);
    }
}
