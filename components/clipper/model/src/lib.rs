//! Clipper component of the axion GPU core.
//!
//! The clipper only performs trivial rejection of triangles that lie fully
//! outside the frustum clip volume. No new vertices or triangles are ever
//! generated; triangles that merely poke out of the frustum pass through and
//! are caught later by the scissored bounding box in triangle setup.

pub mod frustum;
mod unit;

pub use frustum::trivial_reject;
pub use unit::{Clipper, ClipperCommand, ClipperState};
