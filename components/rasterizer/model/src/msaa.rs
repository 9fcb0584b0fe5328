//! Multisample patterns and per-fragment sample evaluation.
//!
//! Sample offsets are given in 1/128-pixel units from the pixel origin.
//! Each table carries two extra rows: the coordinate-wise minimum and
//! maximum of the pattern, precomputed for the setup-time sample bounding
//! box.

use fixp::FixedPoint;

use crate::fragment::{Fragment, MsaaFragmentData};
use crate::RasterizerCore;

/// Denominator of the sample offset tables.
pub const MSAA_SUBPIXEL_PRECISION: f64 = 128.0;

/// Largest supported sample count.
pub const MAX_MSAA_SAMPLES: usize = 8;

/// Sample offsets plus (min, max) bounding rows.
pub const MSAA_PATTERN_2: [(f64, f64); 4] = [
    (8.0, 120.0),
    (120.0, 8.0),
    // Pattern bounding box.
    (8.0, 8.0),
    (120.0, 120.0),
];

pub const MSAA_PATTERN_4: [(f64, f64); 6] = [
    (12.0, 44.0),
    (44.0, 108.0),
    (76.0, 12.0),
    (108.0, 76.0),
    // Pattern bounding box.
    (12.0, 12.0),
    (108.0, 108.0),
];

pub const MSAA_PATTERN_6: [(f64, f64); 8] = [
    (12.0, 12.0),
    (32.0, 52.0),
    (52.0, 96.0),
    (76.0, 32.0),
    (96.0, 116.0),
    (116.0, 76.0),
    // Pattern bounding box.
    (12.0, 12.0),
    (116.0, 116.0),
];

pub const MSAA_PATTERN_8: [(f64, f64); 10] = [
    (8.0, 56.0),
    (24.0, 104.0),
    (40.0, 24.0),
    (56.0, 88.0),
    (72.0, 40.0),
    (88.0, 120.0),
    (104.0, 72.0),
    (120.0, 8.0),
    // Pattern bounding box.
    (8.0, 8.0),
    (120.0, 120.0),
];

/// The sample offsets (without the bounding rows) for a sample count.
pub fn pattern(samples: u32) -> &'static [(f64, f64)] {
    match samples {
        2 => &MSAA_PATTERN_2[..2],
        4 => &MSAA_PATTERN_4[..4],
        6 => &MSAA_PATTERN_6[..6],
        8 => &MSAA_PATTERN_8[..8],
        _ => panic!("[Rasterizer] unsupported MSAA mode"),
    }
}

/// The precomputed (min, max) rows of a pattern.
pub fn pattern_bounds(samples: u32) -> ((f64, f64), (f64, f64)) {
    match samples {
        2 => (MSAA_PATTERN_2[2], MSAA_PATTERN_2[3]),
        4 => (MSAA_PATTERN_4[4], MSAA_PATTERN_4[5]),
        6 => (MSAA_PATTERN_6[6], MSAA_PATTERN_6[7]),
        8 => (MSAA_PATTERN_8[8], MSAA_PATTERN_8[9]),
        _ => panic!("[Rasterizer] unsupported MSAA mode"),
    }
}

impl RasterizerCore {
    /// Recomputes the sample-offset bounding box for the active pattern.
    /// With multisampling off the single sample sits at the pixel center.
    pub(crate) fn compute_msaa_bounding_box(&mut self) {
        let bits = self.config().subpixel_bits;
        let fx = |v: f64| FixedPoint::from_f64(v, 16, bits);
        let samples = self.config().msaa_samples;

        if samples <= 1 {
            self.sample_bb_min = (fx(0.5), fx(0.5));
            self.sample_bb_max = (fx(0.5), fx(0.5));
        } else {
            let (min, max) = pattern_bounds(samples);
            self.sample_bb_min = (
                fx(min.0 / MSAA_SUBPIXEL_PRECISION),
                fx(min.1 / MSAA_SUBPIXEL_PRECISION),
            );
            self.sample_bb_max = (
                fx(max.0 / MSAA_SUBPIXEL_PRECISION),
                fx(max.1 / MSAA_SUBPIXEL_PRECISION),
            );
        }
    }

    /// The sample-offset bounding box, as (min_x, min_y, max_x, max_y).
    pub fn msaa_sample_bounds(&self) -> (FixedPoint, FixedPoint, FixedPoint, FixedPoint) {
        (
            self.sample_bb_min.0,
            self.sample_bb_min.1,
            self.sample_bb_max.0,
            self.sample_bb_max.1,
        )
    }

    /// Evaluates the sub-pixel samples of a fragment: per-sample coverage
    /// and depth plus the centroid of the covered samples.
    ///
    /// The fragment's base coordinates sample the pixel origin (the scan
    /// start was shifted -0.5 pixels), so each sample offsets the equation
    /// values by its table entry.
    pub fn compute_msaa_samples(&self, fragment: &mut Fragment, samples: u32) {
        let t = self.triangle(fragment.triangle);
        let e1 = t.edge1();
        let e2 = t.edge2();
        let e3 = t.edge3();
        let zeq = t.zeq();
        let base = fragment.coords;

        let mut coverage = Vec::with_capacity(samples as usize);
        let mut z = Vec::with_capacity(samples as usize);
        let mut centroid = [0.0f64; 4];
        let mut covered = 0u32;
        let mut any_inside = false;

        for &(ox, oy) in pattern(samples) {
            let dx = ox / MSAA_SUBPIXEL_PRECISION;
            let dy = oy / MSAA_SUBPIXEL_PRECISION;
            let sample = [
                base[0] + e1[0] * dx + e1[1] * dy,
                base[1] + e2[0] * dx + e2[1] * dy,
                base[2] + e3[0] * dx + e3[1] * dy,
                base[3] + zeq[0] * dx + zeq[1] * dy,
            ];
            z.push(self.convert_z(sample[3]));
            let inside = self.test_inside_triangle(fragment.triangle, &sample);
            coverage.push(inside);
            if inside {
                for (c, s) in centroid.iter_mut().zip(sample.iter()) {
                    *c += s;
                }
                covered += 1;
            }
            any_inside |= inside;
        }

        if any_inside {
            for c in &mut centroid {
                *c /= covered as f64;
            }
        }

        fragment.inside = any_inside;
        fragment.msaa = Some(MsaaFragmentData {
            coverage,
            z,
            centroid,
            any_inside,
        });
    }
}
