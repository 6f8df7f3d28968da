//! Mapping of sub-phase progress into one overall percentage
//!
//! Each phase of an update owns a slice of the 0..100 bar. Device callbacks
//! report a fraction of their own work; the fraction is rounded up to a
//! coarse granularity before being mapped so the UI only sees a handful of
//! distinct values per phase.

use serde::{Deserialize, Serialize};

/// Relative error of an `f32` quotient; `0.3f32 / 0.1f32` lands within this
/// distance of 3
const QUOTIENT_TOLERANCE: f64 = 2.0 * f32::EPSILON as f64;

/// Slice of the overall progress bar owned by one phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseBoundary {
    pub start_percent: f32,
    pub end_percent: f32,
}

impl PhaseBoundary {
    pub const fn new(start_percent: f32, end_percent: f32) -> Self {
        Self {
            start_percent,
            end_percent,
        }
    }

    /// Map a phase fraction into this boundary
    pub fn map(&self, fraction: f32, granularity: f32) -> f32 {
        map_progress(fraction, self.start_percent, self.end_percent, granularity)
    }
}

/// `ceil(fraction / granularity) * granularity * (end - start) + start`
///
/// `fraction` is clamped to `[0, 1]`. A non-positive granularity disables
/// rounding.
pub fn map_progress(fraction: f32, start: f32, end: f32, granularity: f32) -> f32 {
    let fraction = if fraction.is_nan() {
        0.0
    } else {
        f64::from(fraction.clamp(0.0, 1.0))
    };
    let granularity = f64::from(granularity);

    let rounded = if granularity > 0.0 {
        (round_up_steps(fraction / granularity) * granularity).min(1.0)
    } else {
        fraction
    };

    let start = f64::from(start);
    let end = f64::from(end);
    (rounded * (end - start) + start) as f32
}

/// `ceil(quotient)`, except that a quotient within `f32` noise of a whole
/// step counts as that step
fn round_up_steps(quotient: f64) -> f64 {
    let nearest = quotient.round();
    if (quotient - nearest).abs() <= nearest * QUOTIENT_TOLERANCE {
        nearest
    } else {
        quotient.ceil()
    }
}
