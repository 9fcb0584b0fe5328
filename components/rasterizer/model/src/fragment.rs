//! Fragments and stamps emitted by the scan engines.

use crate::setup::TriangleId;
use crate::STAMP_FRAGMENTS;

/// Per-sample MSAA data attached to a fragment when multisampling is on.
#[derive(Clone, Debug)]
pub struct MsaaFragmentData {
    /// Coverage of each sub-pixel sample.
    pub coverage: Vec<bool>,
    /// Converted depth of each sub-pixel sample.
    pub z: Vec<u32>,
    /// Equation values at the centroid of the covered samples, depth last.
    pub centroid: [f64; 4],
    /// True when any sample is covered.
    pub any_inside: bool,
}

/// A pixel-level fragment produced at tile level 0.
#[derive(Clone, Debug)]
pub struct Fragment {
    /// The setup triangle this fragment belongs to. The setup table holds
    /// the owning reference; fragments never outlive their triangle.
    pub triangle: TriangleId,
    pub x: i32,
    pub y: i32,
    /// Depth converted to the configured integer precision.
    pub zc: u32,
    /// Edge equation values and interpolated depth at the sample point.
    pub coords: [f64; 4],
    /// Result of the deterministic inside test at the sample point.
    pub inside: bool,
    /// Set on the final fragment the triangle will ever produce.
    pub last_fragment: bool,
    /// Per-sample data when MSAA is enabled.
    pub msaa: Option<MsaaFragmentData>,
}

impl Fragment {
    pub fn new(triangle: TriangleId, x: i32, y: i32, zc: u32, coords: [f64; 4], inside: bool) -> Fragment {
        Fragment {
            triangle,
            x,
            y,
            zc,
            coords,
            inside,
            last_fragment: false,
            msaa: None,
        }
    }

    /// Interpolated depth before integer conversion.
    pub fn zw(&self) -> f64 {
        self.coords[3]
    }

    pub fn mark_last(&mut self) {
        self.last_fragment = true;
    }
}

/// A 2x2 quad of fragments, the unit of work handed to the shader.
#[derive(Clone, Debug)]
pub struct Stamp {
    pub fragments: [Fragment; STAMP_FRAGMENTS],
    /// Triangle that generated the stamp (all four fragments agree).
    pub triangle: TriangleId,
}

impl Stamp {
    pub fn new(fragments: [Fragment; STAMP_FRAGMENTS]) -> Stamp {
        let triangle = fragments[0].triangle;
        Stamp {
            fragments,
            triangle,
        }
    }

    /// True when the last fragment of the owning triangle is in this stamp.
    pub fn is_last(&self) -> bool {
        self.fragments.iter().any(|f| f.last_fragment)
    }

    /// Number of fragments whose sample is inside the triangle.
    pub fn covered(&self) -> usize {
        self.fragments.iter().filter(|f| f.inside).count()
    }
}
