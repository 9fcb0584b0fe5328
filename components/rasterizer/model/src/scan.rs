//! Tiled scanline scan engine.
//!
//! The walk moves scan-tile by scan-tile, travelling left (or right when
//! resumed from a right save) and saving resume positions in the
//! triangle's save slots. Saves at over-tile boundaries go to the
//! dedicated over-tile slots so the walk finishes the current over-tile
//! before moving on. Restores follow a strict priority:
//! right > up > down > over-tile, and over-tile left > right > up > down.

use crate::fragment::Stamp;
use crate::math;
use crate::setup::{RasterDirection, SaveKind, TriangleId};
use crate::tile::Tile;
use crate::{RasterizerCore, STAMP_FRAGMENTS};

impl RasterizerCore {
    /// Computes the scan start position of a triangle: its top-most vertex
    /// snapped to the scan-tile grid, clamped to the bounding box.
    ///
    /// The raster-start save keeps the unpositioned equations so the scan
    /// can later be restarted elsewhere.
    pub fn start_position(&mut self, id: TriangleId, msaa_enabled: bool) {
        let cfg = self.cfg.clone();
        let (sw, sh) = (cfg.scan_tile_w as i32, cfg.scan_tile_h as i32);
        let t = self.triangle(id);
        let (left, bottom, right, top) = t.bounding_box();

        // Top-most vertex in screen coordinates.
        let mut best = (f64::NEG_INFINITY, 0.0f64);
        for v in 0..3 {
            let p = math::to_screen(
                t.position(v),
                cfg.viewport_x,
                cfg.viewport_y,
                cfg.viewport_w,
                cfg.viewport_h,
            );
            if p.1 > best.0 {
                best = (p.1, p.0);
            }
        }
        let mut start_x = (best.1.floor() as i32).clamp(left, right);
        let mut start_y = (best.0.floor() as i32).clamp(bottom, top);

        // Snap to the scan-tile grid.
        start_x -= start_x.rem_euclid(sw);
        start_y -= start_y.rem_euclid(sh);

        // With multisampling the equations sample the pixel origin instead
        // of the center, half a pixel down-left.
        let offset = if msaa_enabled { -0.5 } else { 0.0 };

        let t = self.triangle_mut(id);
        t.save_raster_start();
        let sx = start_x as f64 + offset;
        let sy = start_y as f64 + offset;
        let mut edges = [t.edge1(), t.edge2(), t.edge3()];
        for e in &mut edges {
            e[2] += e[0] * sx + e[1] * sy;
        }
        let mut zeq = t.zeq();
        zeq[2] += zeq[0] * sx + zeq[1] * sy;
        t.set_edge_equations(edges[0], edges[1], edges[2]);
        t.set_z_equation(zeq);
        t.set_raster_position(start_x, start_y);
        t.set_tile_direction(RasterDirection::Center);
        t.set_first_stamp(true);

        // When the snapped start tile misses the triangle, walk the
        // bounding-box border until coverage appears.
        let covered = {
            let t = self.triangle(id);
            let c = t.current_values();
            let e = [t.edge1(), t.edge2(), t.edge3(), t.zeq()];
            let corner = |dx: f64, dy: f64| {
                [
                    c[0] + e[0][0] * dx + e[0][1] * dy,
                    c[1] + e[1][0] * dx + e[1][1] * dy,
                    c[2] + e[2][0] * dx + e[2][1] * dy,
                    c[3] + e[3][0] * dx + e[3][1] * dy,
                ]
            };
            math::evaluate_tile(
                &corner(0.0, 0.0),
                &corner(sw as f64, 0.0),
                &corner(0.0, sh as f64),
                &corner(sw as f64, sh as f64),
            )
        };
        self.triangle_mut(id).set_direction(if covered {
            RasterDirection::Center
        } else {
            RasterDirection::TopBorder
        });
    }

    /// Probes the scan tile to the left of (x, .) and shifts `c` one scan
    /// tile left. Returns whether the left tile may contain fragments.
    fn scan_tile_left(
        &self,
        id: TriangleId,
        c: &mut [f64; 4],
        x: i32,
        left_bound: i32,
        extended: bool,
    ) -> bool {
        let (sw, sh) = (self.cfg.scan_tile_w as i32, self.cfg.scan_tile_h as i32);
        let x = x - sw;

        if x < left_bound - left_bound.rem_euclid(sw) {
            return false;
        }
        let (scx, _, _, _) = self.cfg.scissor_box();
        if x < scx - scx.rem_euclid(sw) {
            return false;
        }

        let (a, b) = self.coefficient_vectors(id);
        // Extended probes cover a double-size region on the first stamp so
        // thin triangles near the start are not lost.
        let (tw, th) = if extended {
            (2.0 * sw as f64, 2.0 * sh as f64)
        } else {
            (sw as f64, sh as f64)
        };

        let rb = *c;
        let rt = offset_by(c, &b, th);
        let lb = offset_neg(c, &a, tw);
        let lt = offset_by(&lb, &b, th);
        let covered = math::evaluate_tile(&rb, &rt, &lb, &lt);

        *c = offset_neg(c, &a, sw as f64);
        covered
    }

    /// Probes the scan tile to the right of (x, .) and shifts `c` one scan
    /// tile right.
    fn scan_tile_right(
        &self,
        id: TriangleId,
        c: &mut [f64; 4],
        x: i32,
        right_bound: i32,
        extended: bool,
    ) -> bool {
        let (sw, sh) = (self.cfg.scan_tile_w as i32, self.cfg.scan_tile_h as i32);
        let x = x + sw;

        if x > right_bound {
            return false;
        }
        let (scx, _, scw, _) = self.cfg.scissor_box();
        if x >= scx + scw as i32 {
            return false;
        }

        let (a, b) = self.coefficient_vectors(id);
        let swf = sw as f64;
        let shf = sh as f64;

        let (corners, step) = if extended {
            // One tile below to three tiles right of the current position.
            let lb = offset_neg(&offset_by(c, &a, swf), &b, shf);
            let lt = offset_by(&offset_by(c, &a, swf), &b, shf);
            let rb = offset_neg(&offset_by(c, &a, 3.0 * swf), &b, shf);
            let rt = offset_by(&offset_by(c, &a, 3.0 * swf), &b, shf);
            ([lb, lt, rb, rt], swf)
        } else {
            let lb = offset_by(c, &a, swf);
            let lt = offset_by(&lb, &b, shf);
            let rb = offset_by(c, &a, 2.0 * swf);
            let rt = offset_by(&rb, &b, shf);
            ([lb, lt, rb, rt], swf)
        };
        let covered = math::evaluate_tile(&corners[0], &corners[1], &corners[2], &corners[3]);

        *c = offset_by(c, &a, step);
        covered
    }

    /// Probes the scan tile below (., y) and shifts `c` one scan tile down.
    fn scan_tile_down(
        &self,
        id: TriangleId,
        c: &mut [f64; 4],
        y: i32,
        bottom_bound: i32,
        extended: bool,
    ) -> bool {
        let (sw, sh) = (self.cfg.scan_tile_w as i32, self.cfg.scan_tile_h as i32);
        let y = y - sh;

        if y < bottom_bound - bottom_bound.rem_euclid(sh) {
            return false;
        }
        let (_, scy, _, _) = self.cfg.scissor_box();
        if y < scy - scy.rem_euclid(sh) {
            return false;
        }

        let (a, b) = self.coefficient_vectors(id);
        let swf = sw as f64;
        let shf = sh as f64;

        let corners = if extended {
            // Probe one tile left to one tile right, two tiles down.
            let lb = offset_neg(&offset_neg(c, &a, swf), &b, 2.0 * shf);
            let lt = offset_neg(c, &a, swf);
            let rb = offset_neg(&offset_by(c, &a, swf), &b, 2.0 * shf);
            let rt = offset_by(c, &a, swf);
            [lb, lt, rb, rt]
        } else {
            let lb = offset_neg(c, &b, shf);
            let lt = *c;
            let rb = offset_neg(&offset_by(c, &a, swf), &b, shf);
            let rt = offset_by(c, &a, swf);
            [lb, lt, rb, rt]
        };
        let covered = math::evaluate_tile(&corners[0], &corners[1], &corners[2], &corners[3]);

        *c = offset_neg(c, &b, shf);
        covered
    }

    /// Probes the scan tile above (., y) and shifts `c` one scan tile up.
    fn scan_tile_up(
        &self,
        id: TriangleId,
        c: &mut [f64; 4],
        y: i32,
        upper_bound: i32,
        extended: bool,
    ) -> bool {
        let (sw, sh) = (self.cfg.scan_tile_w as i32, self.cfg.scan_tile_h as i32);
        let y = y + sh;

        if y >= upper_bound {
            return false;
        }
        let (_, scy, _, sch) = self.cfg.scissor_box();
        if y >= scy + sch as i32 {
            return false;
        }

        let (a, b) = self.coefficient_vectors(id);
        let swf = sw as f64;
        let shf = sh as f64;

        let corners = if extended {
            // Probe two tiles wide, one to three tiles up.
            let lt = offset_by(c, &b, 3.0 * shf);
            let lb = offset_by(c, &b, shf);
            let rt = offset_by(&offset_by(c, &a, 2.0 * swf), &b, 3.0 * shf);
            let rb = offset_by(&offset_by(c, &a, 2.0 * swf), &b, shf);
            [lt, lb, rt, rb]
        } else {
            let lt = offset_by(c, &b, 2.0 * shf);
            let lb = offset_by(c, &b, shf);
            let rt = offset_by(&offset_by(c, &a, swf), &b, 2.0 * shf);
            let rb = offset_by(&offset_by(c, &a, swf), &b, shf);
            [lt, lb, rt, rb]
        };
        let covered = math::evaluate_tile(&corners[0], &corners[1], &corners[2], &corners[3]);

        *c = offset_by(c, &b, shf);
        covered
    }

    /// The per-edge (a, b) coefficient quadruples, depth last.
    fn coefficient_vectors(&self, id: TriangleId) -> ([f64; 4], [f64; 4]) {
        let t = self.triangle(id);
        let (e1, e2, e3, z) = (t.edge1(), t.edge2(), t.edge3(), t.zeq());
        (
            [e1[0], e2[0], e3[0], z[0]],
            [e1[1], e2[1], e3[1], z[1]],
        )
    }

    /// Probes up and saves the resume position, to the over-tile slot when
    /// the move would cross an over-tile boundary.
    fn save_up(&mut self, id: TriangleId, x: i32, y: i32, upper_bound: i32, extended: bool) {
        let sh = self.cfg.scan_tile_h as i32;
        let over_h = self.cfg.over_tile_h as i32;
        let mut c = self.triangle(id).current_values();

        if (y / sh + 1).rem_euclid(over_h) == 0 {
            let t = self.triangle(id);
            if t.tile_direction_allows(RasterDirection::Up) && !t.is_saved(SaveKind::TileUp)
                && self.scan_tile_up(id, &mut c, y, upper_bound, extended)
            {
                self.triangle_mut(id).save(c, x, y + sh, SaveKind::TileUp);
            }
        } else if !self.triangle(id).is_saved(SaveKind::Up)
            && self.scan_tile_up(id, &mut c, y, upper_bound, extended)
        {
            self.triangle_mut(id).save(c, x, y + sh, SaveKind::Up);
        }
    }

    /// Border variant: always a plain stamp-level save.
    fn save_up_border(&mut self, id: TriangleId, x: i32, y: i32, upper_bound: i32, extended: bool) {
        let sh = self.cfg.scan_tile_h as i32;
        let mut c = self.triangle(id).current_values();
        if !self.triangle(id).is_saved(SaveKind::Up)
            && self.scan_tile_up(id, &mut c, y, upper_bound, extended)
        {
            self.triangle_mut(id).save(c, x, y + sh, SaveKind::Up);
        }
    }

    fn save_down(&mut self, id: TriangleId, x: i32, y: i32, bottom_bound: i32, extended: bool) {
        let sh = self.cfg.scan_tile_h as i32;
        let over_h = self.cfg.over_tile_h as i32;
        let mut c = self.triangle(id).current_values();

        if (y / sh - 1).rem_euclid(over_h) == over_h - 1 {
            let t = self.triangle(id);
            if t.tile_direction_allows(RasterDirection::Down) && !t.is_saved(SaveKind::TileDown)
                && self.scan_tile_down(id, &mut c, y, bottom_bound, extended)
            {
                self.triangle_mut(id).save(c, x, y - sh, SaveKind::TileDown);
            }
        } else if !self.triangle(id).is_saved(SaveKind::Down)
            && self.scan_tile_down(id, &mut c, y, bottom_bound, extended)
        {
            self.triangle_mut(id).save(c, x, y - sh, SaveKind::Down);
        }
    }

    fn save_down_border(&mut self, id: TriangleId, x: i32, y: i32, bottom_bound: i32, extended: bool) {
        let sh = self.cfg.scan_tile_h as i32;
        let mut c = self.triangle(id).current_values();
        if !self.triangle(id).is_saved(SaveKind::Down)
            && self.scan_tile_down(id, &mut c, y, bottom_bound, extended)
        {
            self.triangle_mut(id).save(c, x, y - sh, SaveKind::Down);
        }
    }

    fn save_right(&mut self, id: TriangleId, x: i32, y: i32, right_bound: i32, extended: bool) {
        let sw = self.cfg.scan_tile_w as i32;
        let over_w = self.cfg.over_tile_w as i32;
        let mut c = self.triangle(id).current_values();

        if (x / sw + 1).rem_euclid(over_w) == 0 {
            let t = self.triangle(id);
            if t.tile_direction_allows(RasterDirection::Right) && !t.is_saved(SaveKind::TileRight)
                && self.scan_tile_right(id, &mut c, x, right_bound, extended)
            {
                self.triangle_mut(id).save(c, x + sw, y, SaveKind::TileRight);
            }
        } else if !self.triangle(id).is_saved(SaveKind::Right)
            && self.scan_tile_right(id, &mut c, x, right_bound, extended)
        {
            // The save resumes with the vertical commitment of the row it
            // was taken from, so restoring never re-enters a visited row.
            let resume = match self.triangle(id).direction() {
                RasterDirection::Up | RasterDirection::UpLeft | RasterDirection::UpRight => {
                    RasterDirection::UpRight
                }
                RasterDirection::Down | RasterDirection::DownLeft | RasterDirection::DownRight => {
                    RasterDirection::DownRight
                }
                _ => RasterDirection::CenterRight,
            };
            let t = self.triangle_mut(id);
            t.set_right_resume(resume);
            t.save(c, x + sw, y, SaveKind::Right);
        }
    }

    fn save_right_border(&mut self, id: TriangleId, x: i32, y: i32, right_bound: i32, extended: bool) {
        let sw = self.cfg.scan_tile_w as i32;
        let mut c = self.triangle(id).current_values();
        if !self.triangle(id).is_saved(SaveKind::Right)
            && self.scan_tile_right(id, &mut c, x, right_bound, extended)
        {
            self.triangle_mut(id).save(c, x + sw, y, SaveKind::Right);
        }
    }

    /// Moves one scan tile left when covered, or saves the left over-tile
    /// position when the move would cross an over-tile boundary. Returns
    /// whether the walk continues left.
    fn rasterize_left(
        &mut self,
        id: TriangleId,
        x: i32,
        y: i32,
        left_bound: i32,
        extended: bool,
    ) -> bool {
        let sw = self.cfg.scan_tile_w as i32;
        let over_w = self.cfg.over_tile_w as i32;
        let mut c = self.triangle(id).current_values();

        if (x / sw - 1).rem_euclid(over_w) == over_w - 1 {
            let t = self.triangle(id);
            if t.tile_direction_allows(RasterDirection::Left) && !t.is_saved(SaveKind::TileLeft)
                && self.scan_tile_left(id, &mut c, x, left_bound, extended)
            {
                self.triangle_mut(id).save(c, x - sw, y, SaveKind::TileLeft);
            }
            false
        } else if self.scan_tile_left(id, &mut c, x, left_bound, extended) {
            // Keep the row's vertical commitment while travelling left.
            let next = match self.triangle(id).direction() {
                RasterDirection::Up | RasterDirection::UpLeft => RasterDirection::UpLeft,
                RasterDirection::Down | RasterDirection::DownLeft => RasterDirection::DownLeft,
                _ => RasterDirection::Left,
            };
            let t = self.triangle_mut(id);
            t.update_position(c, x - sw, y);
            t.set_direction(next);
            true
        } else {
            false
        }
    }

    fn rasterize_right(
        &mut self,
        id: TriangleId,
        x: i32,
        y: i32,
        right_bound: i32,
        extended: bool,
    ) -> bool {
        let sw = self.cfg.scan_tile_w as i32;
        let over_w = self.cfg.over_tile_w as i32;
        let mut c = self.triangle(id).current_values();

        if (x / sw + 1).rem_euclid(over_w) == 0 {
            let t = self.triangle(id);
            if t.tile_direction_allows(RasterDirection::Right) && !t.is_saved(SaveKind::TileRight)
                && self.scan_tile_right(id, &mut c, x, right_bound, extended)
            {
                self.triangle_mut(id).save(c, x + sw, y, SaveKind::TileRight);
            }
            false
        } else if self.scan_tile_right(id, &mut c, x, right_bound, extended) {
            let next = match self.triangle(id).direction() {
                RasterDirection::UpRight => RasterDirection::UpRight,
                RasterDirection::DownRight => RasterDirection::DownRight,
                _ => RasterDirection::Right,
            };
            let t = self.triangle_mut(id);
            t.update_position(c, x + sw, y);
            t.set_direction(next);
            true
        } else {
            false
        }
    }

    /// Walks the top border of the bounding box looking for coverage.
    fn rasterize_top_border(&mut self, id: TriangleId, x: i32, y: i32, left_bound: i32) {
        let sw = self.cfg.scan_tile_w as i32;
        let mut c = self.triangle(id).current_values();

        if self.scan_tile_left(id, &mut c, x, left_bound, false) {
            let t = self.triangle_mut(id);
            t.update_position(c, x - sw, y);
            t.set_direction(RasterDirection::Center);
        } else if (x - sw) < left_bound - left_bound.rem_euclid(sw) {
            self.triangle_mut(id).set_direction(RasterDirection::LeftBorder);
        } else {
            self.triangle_mut(id).update_position(c, x - sw, y);
        }
    }

    /// Walks the left border of the bounding box looking for coverage.
    fn rasterize_left_border(&mut self, id: TriangleId, x: i32, y: i32, bottom_bound: i32) {
        let sh = self.cfg.scan_tile_h as i32;
        let mut c = self.triangle(id).current_values();

        if self.scan_tile_down(id, &mut c, y, bottom_bound, false) {
            let t = self.triangle_mut(id);
            t.update_position(c, x, y - sh);
            t.set_direction(RasterDirection::Center);
        } else if (y - sh) < bottom_bound - bottom_bound.rem_euclid(sh) {
            self.triangle_mut(id).set_direction(RasterDirection::BottomBorder);
        } else {
            self.triangle_mut(id).update_position(c, x, y - sh);
        }
    }

    /// Walks the bottom border; returns false when the right bound is
    /// reached without finding coverage.
    fn rasterize_bottom_border(&mut self, id: TriangleId, x: i32, y: i32, right_bound: i32) -> bool {
        let sw = self.cfg.scan_tile_w as i32;
        let mut c = self.triangle(id).current_values();

        if self.scan_tile_right(id, &mut c, x, right_bound, false) {
            let t = self.triangle_mut(id);
            t.update_position(c, x + sw, y);
            t.set_direction(RasterDirection::Center);
            true
        } else if (x + sw) > right_bound {
            false
        } else {
            self.triangle_mut(id).update_position(c, x + sw, y);
            true
        }
    }

    /// Restore helpers: each clears its slot and commits the matching
    /// travel direction.
    fn restore_right(&mut self, id: TriangleId) -> bool {
        if self.triangle(id).is_saved(SaveKind::Right) {
            let resume = self.triangle(id).right_resume();
            let t = self.triangle_mut(id);
            t.restore(SaveKind::Right);
            t.set_direction(resume);
            true
        } else {
            false
        }
    }

    fn restore_up(&mut self, id: TriangleId) -> bool {
        if self.triangle(id).is_saved(SaveKind::Up) {
            let t = self.triangle_mut(id);
            t.restore(SaveKind::Up);
            t.set_direction(RasterDirection::Up);
            true
        } else {
            false
        }
    }

    fn restore_down(&mut self, id: TriangleId) -> bool {
        if self.triangle(id).is_saved(SaveKind::Down) {
            let t = self.triangle_mut(id);
            t.restore(SaveKind::Down);
            t.set_direction(RasterDirection::Down);
            true
        } else {
            false
        }
    }

    /// Restores an over-tile save; priority left > right > up > down. The
    /// restored direction becomes the over-tile commitment and the stamp
    /// walk restarts from center.
    fn restore_tile(&mut self, id: TriangleId) -> bool {
        let slots = [
            (SaveKind::TileLeft, RasterDirection::Left),
            (SaveKind::TileRight, RasterDirection::Right),
            (SaveKind::TileUp, RasterDirection::Up),
            (SaveKind::TileDown, RasterDirection::Down),
        ];
        for (slot, dir) in slots {
            if self.triangle(id).is_saved(slot) {
                let t = self.triangle_mut(id);
                t.restore(slot);
                t.set_tile_direction(dir);
                t.set_direction(RasterDirection::Center);
                return true;
            }
        }
        false
    }

    /// Next position after a failed left/right move: right > up > down >
    /// over-tile, else the triangle is finished.
    fn next_tile_rud(&mut self, id: TriangleId) {
        if !self.restore_right(id) && !self.restore_up(id) && !self.restore_down(id)
            && !self.restore_tile(id)
        {
            self.triangle_mut(id).mark_last_fragment();
        }
    }

    fn next_tile_ud(&mut self, id: TriangleId) {
        if !self.restore_up(id) && !self.restore_down(id) && !self.restore_tile(id) {
            self.triangle_mut(id).mark_last_fragment();
        }
    }

    fn next_tile_rd(&mut self, id: TriangleId) {
        if !self.restore_right(id) && !self.restore_down(id) && !self.restore_tile(id) {
            self.triangle_mut(id).mark_last_fragment();
        }
    }

    fn next_tile_d(&mut self, id: TriangleId) {
        if !self.restore_down(id) && !self.restore_tile(id) {
            self.triangle_mut(id).mark_last_fragment();
        }
    }

    /// Border variant: any restore wins over continuing the border walk.
    fn next_tile_border(&mut self, id: TriangleId) -> bool {
        if !self.restore_right(id) && !self.restore_up(id) && !self.restore_down(id)
            && !self.restore_tile(id)
        {
            return false;
        }
        self.triangle_mut(id).set_direction(RasterDirection::Center);
        true
    }

    /// One step of the tiled scanline walk: saves the orthogonal resume
    /// positions, then advances in the travel direction or restores the
    /// highest-priority save. Marks the triangle's last fragment when no
    /// saves remain.
    pub fn scan_tiled(&mut self, id: TriangleId) {
        let t = self.triangle(id);
        let (x, y) = t.raster_position();
        let (left, bottom, right, top) = t.bounding_box();
        let dir = t.direction();
        let first = t.is_first_stamp();

        if !dir.is_border() {
            self.triangle_mut(id).set_first_stamp(false);
        }

        match dir {
            RasterDirection::Center => {
                self.save_up(id, x, y, top, first);
                self.save_down(id, x, y, bottom, first);
                self.save_right(id, x, y, right, first);
                if !self.rasterize_left(id, x, y, left, first) {
                    self.next_tile_rud(id);
                }
            }
            RasterDirection::Up => {
                self.save_up(id, x, y, top, first);
                self.save_right(id, x, y, right, first);
                if !self.rasterize_left(id, x, y, left, first) {
                    self.next_tile_rud(id);
                }
            }
            RasterDirection::Down => {
                self.save_down(id, x, y, bottom, first);
                self.save_right(id, x, y, right, first);
                if !self.rasterize_left(id, x, y, left, false) {
                    self.next_tile_rd(id);
                }
            }
            RasterDirection::DownLeft => {
                self.save_down(id, x, y, bottom, false);
                if !self.rasterize_left(id, x, y, left, false) {
                    self.next_tile_rd(id);
                }
            }
            RasterDirection::DownRight => {
                self.save_down(id, x, y, bottom, false);
                if !self.rasterize_right(id, x, y, right, false) {
                    self.next_tile_d(id);
                }
            }
            RasterDirection::UpLeft => {
                self.save_up(id, x, y, top, false);
                if !self.rasterize_left(id, x, y, left, false) {
                    self.next_tile_rud(id);
                }
            }
            RasterDirection::UpRight => {
                self.save_up(id, x, y, top, false);
                if !self.rasterize_right(id, x, y, right, false) {
                    self.next_tile_ud(id);
                }
            }
            RasterDirection::CenterLeft => {
                self.save_up(id, x, y, top, false);
                self.save_down(id, x, y, bottom, false);
                if !self.rasterize_left(id, x, y, left, false) {
                    self.next_tile_rud(id);
                }
            }
            RasterDirection::CenterRight => {
                self.save_up(id, x, y, top, false);
                self.save_down(id, x, y, bottom, false);
                if !self.rasterize_right(id, x, y, right, false) {
                    self.next_tile_ud(id);
                }
            }
            RasterDirection::Left => {
                // A committed left walk behaves like center without the
                // right save (the right side was covered already).
                self.save_up(id, x, y, top, false);
                self.save_down(id, x, y, bottom, false);
                if !self.rasterize_left(id, x, y, left, false) {
                    self.next_tile_rud(id);
                }
            }
            RasterDirection::Right => {
                self.save_up(id, x, y, top, false);
                self.save_down(id, x, y, bottom, false);
                if !self.rasterize_right(id, x, y, right, false) {
                    self.next_tile_ud(id);
                }
            }
            RasterDirection::TopBorder => {
                self.save_down_border(id, x, y, bottom, first);
                if !self.next_tile_border(id) {
                    self.rasterize_top_border(id, x, y, left);
                }
            }
            RasterDirection::LeftBorder => {
                self.save_right_border(id, x, y, right, first);
                if !self.next_tile_border(id) {
                    self.rasterize_left_border(id, x, y, bottom);
                }
            }
            RasterDirection::BottomBorder => {
                self.save_up_border(id, x, y, top, first);
                if !self.next_tile_border(id)
                    && !self.rasterize_bottom_border(id, x, y, right)
                {
                    self.triangle_mut(id).mark_last_fragment();
                }
            }
        }
    }

    /// Expands the current scan tile into generation tiles for the
    /// scanline engine (all children, no rejection; empty fragments are
    /// culled by the inside test later).
    fn expand_scan_tile(&mut self, id: TriangleId) {
        let t = self.triangle(id);
        let (x, y) = t.raster_position();
        let c = t.current_values();
        let top = Tile::single(id, x, y, c, self.scan_level);
        let gen_level = self.gen_level;
        let tiles = self.expand_tile(top, gen_level);
        self.stored_gen_tiles[id as usize] = tiles.len();
        self.gen_tiles[id as usize] = tiles;
    }

    /// Produces the next 2x2 stamp of the tiled scanline walk, or `None`
    /// when the triangle is exhausted for now.
    pub fn next_stamp_tiled(&mut self, id: TriangleId) -> Option<Stamp> {
        let idx = id as usize;

        // Scan forward when the previous scan tile is fully expanded.
        if self.stored_gen_tiles[idx] == 0 && !self.triangle(id).is_last_fragment() {
            self.expand_scan_tile(id);
            self.scan_tiled(id);
        }

        // Expand the next generation tile into fragments.
        if self.stored_fragments[idx] == 0 && self.stored_gen_tiles[idx] > 0 {
            self.generate_fragments(id);
            self.stored_gen_tiles[idx] -= 1;
            self.stored_fragments[idx] = self.gen_tile_fragments;
        }

        if self.stored_fragments[idx] == 0 {
            return None;
        }

        let base = self.gen_tile_fragments - self.stored_fragments[idx];
        let mut quad: Vec<_> = self.fragments[idx][base..base + STAMP_FRAGMENTS].to_vec();
        self.stored_fragments[idx] -= STAMP_FRAGMENTS;

        if self.triangle(id).is_last_fragment()
            && self.stored_gen_tiles[idx] == 0
            && self.stored_fragments[idx] == 0
        {
            quad[3].mark_last();
        }

        let quad: [crate::Fragment; STAMP_FRAGMENTS] =
            quad.try_into().expect("stamps are always quads");
        Some(Stamp::new(quad))
    }

    /// Expands the generation tile at the cursor into stamp fragments.
    fn generate_fragments(&mut self, id: TriangleId) {
        let idx = id as usize;
        let cursor = self.gen_tiles[idx].len() - self.stored_gen_tiles[idx];
        let gen_tile = self.gen_tiles[idx][cursor].clone();
        let stamps = self.expand_tile(gen_tile, 1);

        let mut fragments = Vec::with_capacity(self.gen_tile_fragments);
        let mut sources = Vec::with_capacity(self.gen_tile_fragments);
        for stamp in &stamps {
            let (quad, source, _) = self.generate_stamp(stamp);
            sources.extend([source; STAMP_FRAGMENTS]);
            fragments.extend(quad);
        }
        self.fragments[idx] = fragments;
        self.fragment_sources[idx] = sources;
    }
}

fn offset_by(c: &[f64; 4], v: &[f64; 4], k: f64) -> [f64; 4] {
    [c[0] + v[0] * k, c[1] + v[1] * k, c[2] + v[2] * k, c[3] + v[3] * k]
}

fn offset_neg(c: &[f64; 4], v: &[f64; 4], k: f64) -> [f64; 4] {
    [c[0] - v[0] * k, c[1] - v[1] * k, c[2] - v[2] * k, c[3] - v[3] * k]
}
