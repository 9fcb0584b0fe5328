//! Recursive hierarchical scan engine.
//!
//! A single top-level tile covers the triangle batch's bounding box. Each
//! update step pops tiles at the current level, samples the nine corner
//! points of the 2x2 subdivision and keeps the children that may contain
//! coverage. Tiles that reach scan level are expanded down to generation
//! tiles, which in turn expand to 2x2 stamp tiles that emit fragments.

use ax_model_core::fatal;

use crate::fragment::{Fragment, Stamp};
use crate::math;
use crate::setup::TriangleId;
use crate::tile::Tile;
use crate::{RasterizerCore, MAX_BATCH_TRIANGLES, MAX_LEVELS, STAMP_FRAGMENTS, TILE_TESTERS};

impl RasterizerCore {
    /// The nine sample points of a tile's 2x2 subdivision for one triangle.
    ///
    /// ```text
    ///   2b  s6--s7--s8
    ///       |   |   |
    ///    b  s3--s4--s5
    ///       |   |   |
    ///       s0--s1--s2
    ///           a   2a
    /// ```
    ///
    /// The coefficients are scaled to half the tile size for the inner
    /// samples and the full size for the outer ones.
    fn sub_tile_samples_9(&self, tile: &Tile, index: usize) -> [[f64; 4]; 9] {
        let id = tile.triangle(index);
        let t = self.triangle(id);
        let (e1, e2, e3, z) = (t.edge1(), t.edge2(), t.edge3(), t.zeq());
        let level = tile.level();
        let half = (1u64 << (level - 1)) as f64;
        let full = (1u64 << level) as f64;

        let s0 = tile.values(index);
        let sa = [e1[0] * half, e2[0] * half, e3[0] * half, z[0] * half];
        let s2a = [e1[0] * full, e2[0] * full, e3[0] * full, z[0] * full];
        let sb = [e1[1] * half, e2[1] * half, e3[1] * half, z[1] * half];
        let s2b = [e1[1] * full, e2[1] * full, e3[1] * full, z[1] * full];

        let s1 = math::add4(&s0, &sa);
        let s2 = math::add4(&s0, &s2a);
        let s3 = math::add4(&s0, &sb);
        let s4 = math::add4(&s1, &sb);
        let s5 = math::add4(&s2, &sb);
        let s6 = math::add4(&s0, &s2b);
        let s7 = math::add4(&s1, &s2b);
        let s8 = math::add4(&s2, &s2b);

        [s0, s1, s2, s3, s4, s5, s6, s7, s8]
    }

    /// The four child start points of a tile's subdivision for one
    /// triangle: the tile start, one half-size step in x, in y, and both.
    fn sub_tile_samples_4(&self, tile: &Tile, index: usize) -> [[f64; 4]; 4] {
        let id = tile.triangle(index);
        let t = self.triangle(id);
        let (e1, e2, e3, z) = (t.edge1(), t.edge2(), t.edge3(), t.zeq());
        let half = (1u64 << (tile.level() - 1)) as f64;

        let s0 = tile.values(index);
        let sa = [e1[0] * half, e2[0] * half, e3[0] * half, z[0] * half];
        let sb = [e1[1] * half, e2[1] * half, e3[1] * half, z[1] * half];

        let s1 = math::add4(&s0, &sa);
        let s2 = math::add4(&s0, &sb);
        let s3 = math::add4(&s1, &sb);

        [s0, s1, s2, s3]
    }

    /// Subdivides a tile into its four children unconditionally, copying
    /// the per-triangle inside flags down.
    pub(crate) fn generate_tiles(&self, tile: &Tile) -> [Tile; 4] {
        if tile.level() <= 1 {
            fatal!("Rasterizer", "subdividing a stamp level tile");
        }
        let n = tile.triangle_count();
        let half = 1i32 << (tile.level() - 1);
        let (x, y) = (tile.x(), tile.y());

        let mut samples = Vec::with_capacity(n);
        for i in 0..n {
            samples.push(self.sub_tile_samples_4(tile, i));
        }

        let child = |corner: usize, cx: i32, cy: i32| {
            let mut edge_c = Vec::with_capacity(n);
            let mut z_c = Vec::with_capacity(n);
            for s in &samples {
                let v = s[corner];
                edge_c.push([v[0], v[1], v[2]]);
                z_c.push(v[3]);
            }
            let mut t = Tile::new(
                tile.triangles().to_vec(),
                cx,
                cy,
                edge_c,
                z_c,
                tile.level() - 1,
            );
            for (i, &inside) in tile.inside_flags().iter().enumerate() {
                t.set_inside(i, inside);
            }
            t
        };

        [
            child(0, x, y),
            child(1, x + half, y),
            child(2, x, y + half),
            child(3, x + half, y + half),
        ]
    }

    /// Evaluates a tile's four children and returns the survivors: a child
    /// survives when any inside triangle passes the conservative corner
    /// test on its quarter of the nine-point sample grid.
    pub(crate) fn evaluate_tile_step(&self, tile: &Tile) -> Vec<Tile> {
        if tile.level() <= 1 {
            fatal!("Rasterizer", "evaluating a fragment level tile");
        }
        let n = tile.triangle_count();
        let half = 1i32 << (tile.level() - 1);
        let (x, y) = (tile.x(), tile.y());
        let cfg = &self.cfg;
        let (vx, vy) = (cfg.viewport_x, cfg.viewport_y);
        let (vw, vh) = (cfg.viewport_w as i32, cfg.viewport_h as i32);

        let mut samples = Vec::with_capacity(n);
        let mut covered = [[false; 4]; MAX_BATCH_TRIANGLES];
        let mut any = [false; 4];

        for i in 0..n {
            let s = if tile.is_inside(i) {
                let s = self.sub_tile_samples_9(tile, i);
                // Child layout: 0 bottom-left, 1 bottom-right, 2 top-left,
                // 3 top-right.
                covered[i][0] = math::evaluate_tile(&s[0], &s[1], &s[4], &s[3]);
                covered[i][1] = math::evaluate_tile(&s[1], &s[2], &s[5], &s[4]);
                covered[i][2] = math::evaluate_tile(&s[3], &s[4], &s[7], &s[6]);
                covered[i][3] = math::evaluate_tile(&s[4], &s[5], &s[8], &s[7]);
                for c in 0..4 {
                    any[c] |= covered[i][c];
                }
                s
            } else {
                [[0.0; 4]; 9]
            };
            samples.push(s);
        }

        // Sample index of each child's start corner in the 9-point grid.
        let corner_of = [0usize, 1, 3, 4];
        let offsets = [(0, 0), (half, 0), (0, half), (half, half)];

        let mut children = Vec::new();
        for c in 0..4 {
            let (ox, oy) = offsets[c];
            let inside_viewport = x + ox <= vx + vw && y + oy <= vy + vh;
            if !any[c] || !inside_viewport {
                continue;
            }
            let mut edge_c = Vec::with_capacity(n);
            let mut z_c = Vec::with_capacity(n);
            for s in &samples {
                let v = s[corner_of[c]];
                edge_c.push([v[0], v[1], v[2]]);
                z_c.push(v[3]);
            }
            let mut child = Tile::new(
                tile.triangles().to_vec(),
                x + ox,
                y + oy,
                edge_c,
                z_c,
                tile.level() - 1,
            );
            for i in 0..n {
                child.set_inside(i, covered[i][c]);
            }
            children.push(child);
        }
        children
    }

    /// Expands a tile down to `level` without rejection; the union of the
    /// children's sample points at each step equals the evaluator's
    /// nine-point grid.
    pub(crate) fn expand_tile(&self, tile: Tile, level: u32) -> Vec<Tile> {
        let mut tiles = vec![tile];
        while tiles[0].level() > level {
            let mut out = Vec::with_capacity(tiles.len() * 4);
            for t in &tiles {
                out.extend(self.generate_tiles(t));
            }
            tiles = out;
        }
        tiles
    }

    /// Evaluates a tile down to `level`, dropping empty subtiles.
    pub(crate) fn evaluate_to_level(&self, tile: Tile, level: u32) -> Vec<Tile> {
        let mut tiles = vec![tile];
        while !tiles.is_empty() && tiles[0].level() > level {
            let mut out = Vec::with_capacity(tiles.len() * 4);
            for t in &tiles {
                out.extend(self.evaluate_tile_step(t));
            }
            tiles = out;
        }
        tiles
    }

    /// Builds the top-level tile covering the batch bounding box, snapped
    /// to the scan-tile grid, at the smallest level that spans it.
    pub(crate) fn top_level_tile(&self, batch: &[TriangleId], msaa_enabled: bool) -> Tile {
        let (scx, scy, scw, sch) = self.cfg.scissor_box();
        let mut x_min = scx + scw as i32;
        let mut y_min = scy + sch as i32;
        let mut x_max = scx;
        let mut y_max = scy;

        for &id in batch {
            let (bx0, by0, bx1, by1) = self.triangle(id).bounding_box();
            x_min = x_min.min(bx0);
            y_min = y_min.min(by0);
            x_max = x_max.max(bx1);
            y_max = y_max.max(by1);
        }

        let sw = self.cfg.scan_tile_w as i32;
        let sh = self.cfg.scan_tile_h as i32;
        let start_x = x_min - x_min.rem_euclid(sw);
        let start_y = y_min - y_min.rem_euclid(sh);

        let span = (x_max - start_x + 1).max(y_max - start_y + 1).max(1) as f64;
        let level = (span.log2().ceil() as u32).max(self.scan_level);

        let offset = if msaa_enabled { -0.5 } else { 0.0 };
        let sx = start_x as f64 + offset;
        let sy = start_y as f64 + offset;

        let mut edge_c = Vec::with_capacity(batch.len());
        let mut z_c = Vec::with_capacity(batch.len());
        for &id in batch {
            let t = self.triangle(id);
            let (e1, e2, e3, z) = (t.edge1(), t.edge2(), t.edge3(), t.zeq());
            edge_c.push([
                e1[0] * sx + e1[1] * sy + e1[2],
                e2[0] * sx + e2[1] * sy + e2[2],
                e3[0] * sx + e3[1] * sy + e3[2],
            ]);
            z_c.push(z[0] * sx + z[1] * sy + z[2]);
        }

        Tile::new(batch.to_vec(), start_x, start_y, edge_c, z_c, level)
    }

    /// Initializes the recursive engine for a batch of setup triangles.
    /// Stamps are later pulled with `next_stamp_recursive`.
    pub fn start_recursive(&mut self, batch: &[TriangleId], msaa_enabled: bool) {
        if batch.is_empty() {
            fatal!("Rasterizer", "the triangle batch requires at least a triangle");
        }
        if batch.len() > MAX_BATCH_TRIANGLES {
            fatal!("Rasterizer", "triangle batch is too large");
        }

        for queue in &mut self.levels {
            queue.reset();
        }
        self.batch = batch.to_vec();

        let top = self.top_level_tile(batch, msaa_enabled);
        let level = top.level() as usize;
        if level >= MAX_LEVELS {
            fatal!("Rasterizer", "top level tile exceeds the supported screen size");
        }
        self.levels[level].tiles.push(top);
        self.level = level;
    }

    /// One update step of the recursive search: either expands the next
    /// scan tile into generation tiles, or evaluates a few tiles of the
    /// current level and descends or ascends accordingly.
    pub fn update_recursive(&mut self) {
        let lead = self.batch[0];

        if self.level == self.scan_level as usize {
            if self.stored_gen_tiles[lead as usize] == 0 {
                let cursor = self.levels[self.level].next;
                let tile = self.levels[self.level].tiles[cursor].clone();
                let gen_level = self.gen_level;
                let tiles = self.expand_tile(tile, gen_level);
                self.stored_gen_tiles[lead as usize] = tiles.len();
                self.gen_tiles[lead as usize] = tiles;
                self.levels[self.level].next += 1;

                if self.levels[self.level].exhausted() {
                    self.level += 1;
                }
            }
            return;
        }

        if self.triangle(lead).is_last_fragment() {
            return;
        }

        if self.level >= MAX_LEVELS || self.levels[self.level].exhausted() {
            self.level += 1;
        } else {
            // Evaluate a handful of tiles into the level below.
            let below = self.level - 1;
            self.levels[below].reset();
            for _ in 0..TILE_TESTERS {
                if self.levels[self.level].exhausted() {
                    break;
                }
                let cursor = self.levels[self.level].next;
                let tile = self.levels[self.level].tiles[cursor].clone();
                let children = self.evaluate_tile_step(&tile);
                self.levels[below].tiles.extend(children);
                self.levels[self.level].next += 1;
            }

            if !self.levels[below].tiles.is_empty() {
                self.level = below;
            } else if self.levels[self.level].exhausted() {
                self.level += 1;
            }
        }

        // The batch is finished when every level at or above the cursor is
        // exhausted.
        let exhausted = (self.level..MAX_LEVELS).all(|l| self.levels[l].exhausted());
        if exhausted && self.stored_gen_tiles[lead as usize] == 0 {
            self.triangle_mut(lead).mark_last_fragment();
        }
    }

    /// Generates the fragments of one stamp-level tile for its next inside
    /// triangle. Returns the quad, the generating triangle and whether the
    /// tile still holds fragments of later batch triangles.
    pub(crate) fn generate_stamp(&self, tile: &Tile) -> ([Fragment; STAMP_FRAGMENTS], TriangleId, bool) {
        if tile.level() != 1 {
            fatal!("Rasterizer", "generating fragments for a non stamp level tile");
        }

        let n = tile.triangle_count();
        let mut next = tile.next_triangle();
        while next < n && !tile.is_inside(next) {
            next += 1;
        }
        if next == n {
            fatal!("Rasterizer", "no triangles in the batch are inside the tile");
        }

        let id = tile.triangle(next);
        let t = self.triangle(id);
        let (e1, e2, e3, z) = (t.edge1(), t.edge2(), t.edge3(), t.zeq());
        let a = [e1[0], e2[0], e3[0], z[0]];
        let b = [e1[1], e2[1], e3[1], z[1]];

        let s0 = tile.values(next);
        let s1 = math::add4(&s0, &a);
        let s2 = math::add4(&s0, &b);
        let s3 = math::add4(&s1, &b);

        let (x, y) = (tile.x(), tile.y());
        let make = |sx: i32, sy: i32, s: [f64; 4]| {
            Fragment::new(
                id,
                sx,
                sy,
                self.convert_z(s[3]),
                s,
                self.test_inside_triangle(id, &s),
            )
        };
        let quad = [
            make(x, y, s0),
            make(x + 1, y, s1),
            make(x, y + 1, s2),
            make(x + 1, y + 1, s3),
        ];

        // Look for a later batch triangle covering this stamp.
        let mut more = next + 1;
        while more < n && !tile.is_inside(more) {
            more += 1;
        }

        (quad, id, more < n)
    }

    /// A stamp with every fragment outside, emitted when a replayed tile
    /// has no further triangles but the stream layout needs a quad.
    fn generate_culled_stamp(&self, tile: &Tile) -> ([Fragment; STAMP_FRAGMENTS], TriangleId) {
        let id = tile.triangle(0);
        let s = tile.values(0);
        let (x, y) = (tile.x(), tile.y());
        let make = |sx: i32, sy: i32| Fragment::new(id, sx, sy, self.convert_z(s[3]), s, false);
        (
            [make(x, y), make(x + 1, y), make(x, y + 1), make(x + 1, y + 1)],
            id,
        )
    }

    /// Expands the current generation tile into fragments, replaying the
    /// stamp tiles once per covering batch triangle.
    fn generate_fragments_multi(&mut self, lead: TriangleId) -> bool {
        let idx = lead as usize;

        let mut stamps = if self.stamp_tiles[idx].is_empty() {
            let cursor = self.gen_tiles[idx].len() - self.stored_gen_tiles[idx];
            let gen_tile = self.gen_tiles[idx][cursor].clone();
            self.expand_tile(gen_tile, 1)
        } else {
            std::mem::take(&mut self.stamp_tiles[idx])
        };

        let mut fragments = Vec::with_capacity(self.gen_tile_fragments);
        let mut sources = Vec::with_capacity(self.gen_tile_fragments);
        let mut more = false;
        for stamp in &mut stamps {
            // A tile already drained on an earlier replay pass emits a
            // fully-culled quad to keep the fragment stream aligned.
            if stamp.next_triangle() >= stamp.triangle_count() {
                let (quad, source) = self.generate_culled_stamp(stamp);
                sources.extend([source; STAMP_FRAGMENTS]);
                fragments.extend(quad);
                continue;
            }
            let (quad, source, has_more) = self.generate_stamp(stamp);
            if has_more {
                // Replay this tile for the next covering triangle.
                let next = (stamp.next_triangle() + 1..stamp.triangle_count())
                    .find(|&i| stamp.is_inside(i))
                    .unwrap();
                stamp.set_next_triangle(next);
            } else {
                stamp.set_next_triangle(stamp.triangle_count());
            }
            more |= has_more;
            sources.extend([source; STAMP_FRAGMENTS]);
            fragments.extend(quad);
        }
        self.fragments[idx] = fragments;
        self.fragment_sources[idx] = sources;

        if more {
            self.stamp_tiles[idx] = stamps;
        } else {
            self.stamp_tiles[idx].clear();
        }
        more
    }

    /// Produces the next stamp of the recursive walk together with the
    /// batch triangle that generated it, or `None` when no fragments are
    /// currently available.
    pub fn next_stamp_recursive(&mut self) -> Option<(Stamp, TriangleId)> {
        let lead = self.batch[0];
        let idx = lead as usize;

        if self.stored_fragments[idx] == 0 && self.stored_gen_tiles[idx] > 0 {
            let more = self.generate_fragments_multi(lead);
            if !more {
                self.stored_gen_tiles[idx] -= 1;
            }
            self.stored_fragments[idx] = self.fragments[idx].len();
        }

        if self.stored_fragments[idx] == 0 {
            return None;
        }

        let base = self.fragments[idx].len() - self.stored_fragments[idx];
        let mut quad: Vec<_> = self.fragments[idx][base..base + STAMP_FRAGMENTS].to_vec();
        let source = self.fragment_sources[idx][base];
        self.stored_fragments[idx] -= STAMP_FRAGMENTS;

        if self.triangle(lead).is_last_fragment()
            && self.stored_gen_tiles[idx] == 0
            && self.stored_fragments[idx] == 0
        {
            quad[3].mark_last();
        }

        let quad: [Fragment; STAMP_FRAGMENTS] = quad.try_into().expect("stamps are always quads");
        Some((Stamp::new(quad), source))
    }

    /// Drives the recursive engine until it either produces a stamp or
    /// finishes the batch.
    pub fn next_stamp_recursive_blocking(&mut self) -> Option<(Stamp, TriangleId)> {
        loop {
            if let Some(out) = self.next_stamp_recursive() {
                return Some(out);
            }
            let lead = self.batch[0];
            if self.last_fragment(lead) {
                return None;
            }
            self.update_recursive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RasterizerConfig;
    use ax_model_core::types::VertexAttributes;
    use glam::Vec4;

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

    fn vert(x: f32, y: f32, z: f32) -> VertexAttributes {
        vec![Vec4::new(x, y, z, 1.0)]
    }

    /// Half-screen triangle covering the lower-left of the viewport.
    fn setup_half(core: &mut RasterizerCore) -> TriangleId {
        core.setup(
            vert(-1.0, -1.0, 0.0),
            vert(1.0, -1.0, 0.0),
            vert(-1.0, 1.0, 0.0),
        )
    }

    #[test]
    fn subdivision_children_cover_the_nine_point_grid() {
        let mut c = core();
        let id = setup_half(&mut c);
        let tile = c.top_level_tile(&[id], false);
        let children = c.generate_tiles(&tile);
        let nine = c.sub_tile_samples_9(&tile, 0);

        // Each child's four corner samples (at its own level) must appear
        // in the parent's nine-point grid.
        for child in &children {
            let four = c.sub_tile_samples_4(child, 0);
            let s0 = four[0];
            let found = nine
                .iter()
                .any(|s| (s[0] - s0[0]).abs() < 1e-9 && (s[3] - s0[3]).abs() < 1e-9);
            assert!(found, "child start sample missing from the parent grid");
        }
    }

    #[test]
    fn recursive_walk_emits_covered_fragments() {
        let mut c = core();
        let id = setup_half(&mut c);
        c.start_recursive(&[id], false);

        let mut inside = 0;
        while let Some((stamp, source)) = c.next_stamp_recursive_blocking() {
            assert_eq!(source, id);
            inside += stamp.covered();
            if stamp.is_last() {
                break;
            }
        }
        // The half-screen triangle covers about half of the 16x16 pixels.
        assert!(inside > 80 && inside < 160, "covered {inside} pixels");
    }

    #[test]
    fn fragments_agree_with_direct_evaluation() {
        let mut c = core();
        let id = setup_half(&mut c);
        c.start_recursive(&[id], false);

        while let Some((stamp, _)) = c.next_stamp_recursive_blocking() {
            for f in &stamp.fragments {
                let t = c.triangle(id);
                let e1 = t.edge1();
                let expect = e1[0] * f.x as f64 + e1[1] * f.y as f64 + e1[2];
                assert!(
                    (f.coords[0] - expect).abs() < 1e-6,
                    "incremental and direct edge values diverge"
                );
            }
            if stamp.is_last() {
                break;
            }
        }
    }

    #[test]
    fn degenerate_triangle_produces_no_covered_fragments() {
        let mut c = core();
        let id = c.setup(
            vert(-0.5, -0.5, 0.0),
            vert(0.5, 0.5, 0.0),
            vert(0.0, 0.0, 0.0),
        );
        assert!(c.triangle_area(id).abs() < 1e-9);
        c.start_recursive(&[id], false);
        let mut covered = 0;
        while let Some((stamp, _)) = c.next_stamp_recursive_blocking() {
            covered += stamp.covered();
            if stamp.is_last() {
                break;
            }
        }
        assert_eq!(covered, 0);
    }

    #[test]
    fn batch_emits_stamps_for_both_triangles() {
        let mut c = core();
        let a = setup_half(&mut c);
        let b = c.setup(
            vert(1.0, 1.0, 0.0),
            vert(-1.0, 1.0, 0.0),
            vert(1.0, -1.0, 0.0),
        );
        c.start_recursive(&[a, b], false);

        let mut sources = std::collections::BTreeSet::new();
        while let Some((stamp, source)) = c.next_stamp_recursive_blocking() {
            if stamp.covered() > 0 {
                sources.insert(source);
            }
            if stamp.is_last() {
                break;
            }
        }
        assert!(sources.contains(&a) && sources.contains(&b));
    }
}
