//! Rasterizer component of the axion GPU core.
//!
//! Turns setup triangles into 2x2 fragment stamps. Two scan engines are
//! implemented and selectable per configuration:
//!
//! - a tiled scanline walk that moves scan-tile by scan-tile, saving resume
//!   positions in the triangle's save slots, and
//! - a recursive descent that subdivides a top-level tile covering the
//!   triangle (or a batch of triangles) down to scan, generation and stamp
//!   level, trivially rejecting empty subtiles on the way.
//!
//! Edge and depth interpolation runs in f64 throughout; fragment depth is
//! converted to the configured integer precision as the final step.

pub mod config;
pub mod fragment;
pub mod interp;
pub mod math;
pub mod micro;
pub mod msaa;
pub mod recursive;
pub mod scan;
pub mod setup;
pub mod tile;
mod unit;

pub use config::RasterizerConfig;
pub use fragment::{Fragment, MsaaFragmentData, Stamp};
pub use micro::MicroTriangle;
pub use setup::{RasterDirection, SaveSlot, SetupTriangle, TriangleId};
pub use tile::Tile;
pub use unit::{Rasterizer, ScanMode};

use ax_model_core::fatal;
use fixp::FixedPoint;

use crate::setup::SaveKind;

/// Fragments in a stamp. The stamp is always a 2x2 pixel quad.
pub const STAMP_FRAGMENTS: usize = 4;

/// Deepest tile level the recursive engine tracks (level 15 covers a
/// 32768-pixel axis).
pub const MAX_LEVELS: usize = 16;

/// Tiles evaluated per recursive update step.
pub const TILE_TESTERS: usize = 4;

/// Largest triangle batch the recursive engine accepts.
pub const MAX_BATCH_TRIANGLES: usize = 16;

/// One level of the recursive descent: pending tiles and a consume cursor.
#[derive(Default)]
struct LevelQueue {
    tiles: Vec<Tile>,
    next: usize,
}

impl LevelQueue {
    fn exhausted(&self) -> bool {
        self.next == self.tiles.len()
    }

    fn reset(&mut self) {
        self.tiles.clear();
        self.next = 0;
    }
}

/// The rasterizer state: setup-triangle table, scan state and the recursive
/// tile queues. The clocked [`Rasterizer`] unit drives this through the
/// per-triangle operations.
pub struct RasterizerCore {
    pub(crate) cfg: RasterizerConfig,

    /// Scan-tile and generation-tile levels derived from the configuration.
    pub(crate) scan_level: u32,
    pub(crate) gen_level: u32,
    /// Generation tiles per scan tile.
    pub(crate) scan_tile_gen_tiles: usize,
    /// Fragments per generation tile.
    pub(crate) gen_tile_fragments: usize,

    /// The setup-triangle table; `None` entries are free.
    pub(crate) triangles: Vec<Option<SetupTriangle>>,
    /// Strong references held on each table entry.
    pub(crate) refcounts: Vec<u32>,
    pub(crate) free_list: Vec<TriangleId>,
    pub(crate) next_free: usize,
    pub(crate) free_count: usize,
    pub(crate) active_count: usize,

    /// Per-triangle generation tiles waiting to be expanded into stamps.
    pub(crate) gen_tiles: Vec<Vec<Tile>>,
    /// Per-triangle stamp-level tiles kept across multi-triangle replays.
    pub(crate) stamp_tiles: Vec<Vec<Tile>>,
    /// Per-triangle generated fragments not yet consumed.
    pub(crate) fragments: Vec<Vec<Fragment>>,
    /// Per-fragment generating triangle within a batch.
    pub(crate) fragment_sources: Vec<Vec<TriangleId>>,
    pub(crate) stored_gen_tiles: Vec<usize>,
    pub(crate) stored_fragments: Vec<usize>,

    /// Recursive engine state.
    pub(crate) levels: Vec<LevelQueue>,
    pub(crate) level: usize,
    pub(crate) batch: Vec<TriangleId>,

    /// MSAA sample-offset bounding box of the active sample pattern.
    pub(crate) sample_bb_min: (FixedPoint, FixedPoint),
    pub(crate) sample_bb_max: (FixedPoint, FixedPoint),
}

impl RasterizerCore {
    pub fn new(cfg: RasterizerConfig) -> RasterizerCore {
        cfg.validate();
        let n = cfg.active_triangles;
        let scan_level = (cfg.scan_tile_w.max(cfg.scan_tile_h) as f64).log2().ceil() as u32;
        let gen_level = (cfg.gen_tile_w.max(cfg.gen_tile_h) as f64).log2().ceil() as u32;
        let per_axis = 1usize << (scan_level - gen_level);
        let gen_tile_fragments = (cfg.gen_tile_w * cfg.gen_tile_h) as usize;

        let mut core = RasterizerCore {
            scan_level,
            gen_level,
            scan_tile_gen_tiles: per_axis * per_axis,
            gen_tile_fragments,
            triangles: (0..n).map(|_| None).collect(),
            refcounts: vec![0; n],
            free_list: (0..n as u32).collect(),
            next_free: 0,
            free_count: n,
            active_count: 0,
            gen_tiles: (0..n).map(|_| Vec::new()).collect(),
            stamp_tiles: (0..n).map(|_| Vec::new()).collect(),
            fragments: (0..n).map(|_| Vec::new()).collect(),
            fragment_sources: (0..n).map(|_| Vec::new()).collect(),
            stored_gen_tiles: vec![0; n],
            stored_fragments: vec![0; n],
            levels: (0..MAX_LEVELS).map(|_| LevelQueue::default()).collect(),
            level: MAX_LEVELS,
            batch: Vec::new(),
            sample_bb_min: (FixedPoint::default(), FixedPoint::default()),
            sample_bb_max: (FixedPoint::default(), FixedPoint::default()),
            cfg,
        };
        core.compute_msaa_bounding_box();
        core
    }

    pub fn config(&self) -> &RasterizerConfig {
        &self.cfg
    }

    pub fn scan_level(&self) -> u32 {
        self.scan_level
    }

    pub fn gen_level(&self) -> u32 {
        self.gen_level
    }

    /// Free entries in the setup table.
    pub fn free_setup_slots(&self) -> usize {
        self.free_count
    }

    /// Immutable access to a setup triangle.
    pub fn triangle(&self, id: TriangleId) -> &SetupTriangle {
        self.triangles
            .get(id as usize)
            .and_then(|t| t.as_ref())
            .unwrap_or_else(|| fatal!("Rasterizer", "triangle {id} is not a setup triangle"))
    }

    pub(crate) fn triangle_mut(&mut self, id: TriangleId) -> &mut SetupTriangle {
        self.triangles
            .get_mut(id as usize)
            .and_then(|t| t.as_mut())
            .unwrap_or_else(|| fatal!("Rasterizer", "triangle {id} is not a setup triangle"))
    }

    /// Allocates a setup-table slot for a new triangle. The caller must
    /// respect back-pressure: running out of slots is fatal.
    pub(crate) fn allocate_slot(&mut self, triangle: SetupTriangle) -> TriangleId {
        if self.active_count == self.cfg.active_triangles {
            fatal!("Rasterizer", "no free setup triangle entry");
        }
        let id = self.free_list[self.next_free];
        if self.triangles[id as usize].is_some() {
            fatal!("Rasterizer", "setup triangle table entry {id} not empty");
        }
        self.triangles[id as usize] = Some(triangle);
        self.refcounts[id as usize] = 1;
        self.next_free = (self.next_free + 1) % self.cfg.active_triangles;
        self.free_count -= 1;
        self.active_count += 1;
        self.stored_gen_tiles[id as usize] = 0;
        self.stored_fragments[id as usize] = 0;
        self.gen_tiles[id as usize].clear();
        self.stamp_tiles[id as usize].clear();
        self.fragments[id as usize].clear();
        self.fragment_sources[id as usize].clear();
        id
    }

    /// Takes an additional reference on a triangle, on behalf of an
    /// in-flight fragment or tile.
    pub fn retain(&mut self, id: TriangleId) {
        self.refcounts[id as usize] += 1;
    }

    /// Drops one reference; the table entry is freed when the last owner
    /// lets go.
    pub fn release(&mut self, id: TriangleId) {
        let idx = id as usize;
        if self.triangles[idx].is_none() {
            fatal!("Rasterizer", "releasing triangle {id} twice");
        }
        self.refcounts[idx] -= 1;
        if self.refcounts[idx] == 0 {
            if self.free_count == self.cfg.active_triangles {
                fatal!("Rasterizer", "all setup triangles already deleted");
            }
            self.triangles[idx] = None;
            self.free_list[(self.next_free + self.free_count) % self.cfg.active_triangles] = id;
            self.free_count += 1;
            self.active_count -= 1;
        }
    }

    /// Destroys the setup table's own reference to a triangle.
    pub fn destroy_triangle(&mut self, id: TriangleId) {
        self.release(id);
    }

    /// Maps an interpolated depth to the configured integer precision.
    ///
    /// The incoming value lies in [0, 1] under the D3D9 depth convention or
    /// [-1, 1] under the OpenGL one; both are first mapped through the
    /// depth range (near, far) into [0, 1].
    pub fn convert_z(&self, z: f64) -> u32 {
        let n = self.cfg.depth_near as f64;
        let f = self.cfg.depth_far as f64;
        let zw = if self.cfg.d3d9_depth_range {
            (f - n) * z + n
        } else {
            ((f - n) / 2.0) * z + (n + f) / 2.0
        };
        (zw * (((1u64 << self.cfg.depth_bits) - 1) as f64)) as u32
    }

    /// The deterministic inside test for a sample's edge and depth values.
    ///
    /// Ties on an edge (value in the zero region) resolve by the edge's
    /// horizontal coefficient, then by its vertical coefficient, so shared
    /// edges of adjoining triangles never generate a fragment twice.
    pub fn test_inside_triangle(&self, id: TriangleId, coords: &[f64; 4]) -> bool {
        let t = self.triangle(id);
        let e1 = t.edge1();
        let e2 = t.edge2();
        let e3 = t.edge3();
        let depth_ok = if self.cfg.d3d9_depth_range {
            coords[3] >= 0.0 && coords[3] <= 1.0
        } else {
            coords[3].abs() <= 1.0
        };
        math::inside_equation(coords[0], e1[0], e1[1])
            && math::inside_equation(coords[1], e2[0], e2[1])
            && math::inside_equation(coords[2], e3[0], e3[1])
            && depth_ok
    }

    /// Signed area approximation of a setup triangle.
    pub fn triangle_area(&self, id: TriangleId) -> f64 {
        self.triangle(id).area()
    }

    /// Fraction of the screen the triangle covers.
    pub fn screen_percent(&self, id: TriangleId) -> f64 {
        self.triangle(id).screen_percent()
    }

    /// Integer bounding box of a setup triangle.
    pub fn bounding_box(&self, id: TriangleId) -> (i32, i32, i32, i32) {
        self.triangle(id).bounding_box()
    }

    /// True when the triangle has produced its last fragment and no stamps
    /// remain buffered.
    pub fn last_fragment(&self, id: TriangleId) -> bool {
        self.triangle(id).is_last_fragment()
            && self.stored_gen_tiles[id as usize] == 0
            && self.stored_fragments[id as usize] == 0
    }

    /// Scan-tile coordinates of a fragment, used to spread stamps over
    /// downstream units.
    pub fn tile_identifier(&self, fragment: &Fragment) -> (i32, i32) {
        (
            fragment.x / self.cfg.scan_tile_w as i32,
            fragment.y / self.cfg.scan_tile_h as i32,
        )
    }

    /// Flips the facing of a setup triangle by negating its edge equations.
    pub fn invert_triangle_facing(&mut self, id: TriangleId) {
        self.triangle_mut(id).invert_facing();
    }

    /// Moves the raster position to a new start point, recomputing the
    /// equation values from the saved raster start.
    pub fn change_raster_position(&mut self, id: TriangleId, x: i32, y: i32) {
        let (sw, sh) = (self.cfg.scan_tile_w as i32, self.cfg.scan_tile_h as i32);
        let x = x - x.rem_euclid(sw);
        let y = y - y.rem_euclid(sh);
        let t = self.triangle_mut(id);
        t.restore(SaveKind::RasterStart);
        t.save_raster_start();
        t.step_to(x, y);
    }
}

