//! Probe-sized windows into the object grid.

use crate::geometry::PixelPosition;
use crate::math::{Complex64, ComplexGrid, GridShape};

/// Copy the `shape` window of `object` starting at `origin`.
///
/// Panics if the window leaves the grid; callers obtain `origin` from
/// [`ObjectGeometry::patch_origin`](crate::ObjectGeometry::patch_origin),
/// which clamps.
pub fn extract_patch(object: &ComplexGrid, origin: PixelPosition, shape: GridShape) -> ComplexGrid {
    object
        .view((origin.row, origin.col), (shape.rows, shape.cols))
        .into_owned()
}

/// Add `delta` into the window of `object` starting at `origin`.
pub fn add_patch(object: &mut ComplexGrid, origin: PixelPosition, delta: &ComplexGrid) {
    let mut window = object.view_mut((origin.row, origin.col), delta.shape());
    window += delta;
}

/// Accumulate `weight * value` into `accumulator` over a window; used by
/// projection engines that average many overlapping patches.
pub fn accumulate_patch(
    accumulator: &mut ComplexGrid,
    origin: PixelPosition,
    value: &ComplexGrid,
    weight: &crate::math::RealGrid,
) {
    let mut window = accumulator.view_mut((origin.row, origin.col), value.shape());
    window.zip_zip_apply(value, weight, |acc, v, w| *acc += v * Complex64::new(w, 0.0));
}
