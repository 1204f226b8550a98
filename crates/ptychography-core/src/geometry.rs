//! Scan and object-plane geometry.
//!
//! Scan positions are physical coordinates (metres) of the probe centre on
//! the sample. The object grid is laid out so that every probe-sized patch
//! touched by the scan lies inside it; [`ObjectGeometry::patch_origin`] maps a
//! scan point to the top-left pixel of that patch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::{GridShape, Real, wavelength_m};

/// Errors raised while deriving object-plane geometry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("scan has no positions")]
    NoPositions,
    #[error("non-finite scan position at index {0}")]
    NonFinitePosition(usize),
    #[error("invalid detector geometry: {0}")]
    InvalidDetector(String),
    #[error("invalid object pixel size {width_m} x {height_m} m")]
    InvalidPixel { width_m: Real, height_m: Real },
}

/// Probe-centre coordinate on the sample, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanPoint {
    pub x_m: Real,
    pub y_m: Real,
}

impl ScanPoint {
    pub const fn new(x_m: Real, y_m: Real) -> Self {
        Self { x_m, y_m }
    }

    pub fn is_finite(&self) -> bool {
        self.x_m.is_finite() && self.y_m.is_finite()
    }

    pub fn offset(&self, dx_m: Real, dy_m: Real) -> Self {
        Self::new(self.x_m + dx_m, self.y_m + dy_m)
    }
}

/// Detector placement relative to the sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorGeometry {
    /// Sample-to-detector distance.
    pub distance_m: Real,
    pub pixel_width_m: Real,
    pub pixel_height_m: Real,
}

impl Default for DetectorGeometry {
    fn default() -> Self {
        Self {
            distance_m: 2.0,
            pixel_width_m: 75e-6,
            pixel_height_m: 75e-6,
        }
    }
}

impl DetectorGeometry {
    pub fn validate(&self) -> Result<(), GeometryError> {
        let valid = |v: Real| v.is_finite() && v > 0.0;
        if !valid(self.distance_m) {
            return Err(GeometryError::InvalidDetector(format!(
                "distance {} m",
                self.distance_m
            )));
        }
        if !valid(self.pixel_width_m) || !valid(self.pixel_height_m) {
            return Err(GeometryError::InvalidDetector(format!(
                "pixel size {} x {} m",
                self.pixel_width_m, self.pixel_height_m
            )));
        }
        Ok(())
    }

    /// Object-plane sampling for a far-field measurement: `λ z / (N p)` per axis.
    pub fn object_pixel_geometry(
        &self,
        frame: GridShape,
        energy_ev: Real,
    ) -> Result<PixelGeometry, GeometryError> {
        self.validate()?;
        let lambda = wavelength_m(energy_ev);
        let pixel = PixelGeometry {
            width_m: lambda * self.distance_m / (frame.cols as Real * self.pixel_width_m),
            height_m: lambda * self.distance_m / (frame.rows as Real * self.pixel_height_m),
        };
        pixel.validate()?;
        Ok(pixel)
    }
}

/// Physical size of one object-plane pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelGeometry {
    pub width_m: Real,
    pub height_m: Real,
}

impl PixelGeometry {
    pub fn validate(&self) -> Result<(), GeometryError> {
        let valid = |v: Real| v.is_finite() && v > 0.0;
        if valid(self.width_m) && valid(self.height_m) {
            Ok(())
        } else {
            Err(GeometryError::InvalidPixel {
                width_m: self.width_m,
                height_m: self.height_m,
            })
        }
    }
}

/// Integer pixel index into the object grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelPosition {
    pub row: usize,
    pub col: usize,
}

/// Object grid layout: shape, sampling and the physical coordinate of pixel `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectGeometry {
    pub shape: GridShape,
    pub pixel: PixelGeometry,
    pub origin_x_m: Real,
    pub origin_y_m: Real,
}

impl ObjectGeometry {
    /// Smallest grid covering every probe patch of the scan, plus `padding_px` on each side.
    pub fn covering(
        points: &[ScanPoint],
        probe: GridShape,
        pixel: PixelGeometry,
        padding_px: usize,
    ) -> Result<Self, GeometryError> {
        pixel.validate()?;
        let first = points.first().ok_or(GeometryError::NoPositions)?;
        let mut min_x = first.x_m;
        let mut max_x = first.x_m;
        let mut min_y = first.y_m;
        let mut max_y = first.y_m;
        for (idx, p) in points.iter().enumerate() {
            if !p.is_finite() {
                return Err(GeometryError::NonFinitePosition(idx));
            }
            min_x = min_x.min(p.x_m);
            max_x = max_x.max(p.x_m);
            min_y = min_y.min(p.y_m);
            max_y = max_y.max(p.y_m);
        }

        let span_cols = ((max_x - min_x) / pixel.width_m).ceil() as usize;
        let span_rows = ((max_y - min_y) / pixel.height_m).ceil() as usize;
        let shape = GridShape::new(
            span_rows + probe.rows + 2 * padding_px,
            span_cols + probe.cols + 2 * padding_px,
        );

        let half_cols = (probe.cols / 2) as Real;
        let half_rows = (probe.rows / 2) as Real;
        Ok(Self {
            shape,
            pixel,
            origin_x_m: min_x - (padding_px as Real + half_cols) * pixel.width_m,
            origin_y_m: min_y - (padding_px as Real + half_rows) * pixel.height_m,
        })
    }

    /// Fractional top-left pixel of the probe patch centred on `point`.
    pub fn patch_origin_exact(&self, point: ScanPoint, probe: GridShape) -> (Real, Real) {
        let col = (point.x_m - self.origin_x_m) / self.pixel.width_m - (probe.cols / 2) as Real;
        let row = (point.y_m - self.origin_y_m) / self.pixel.height_m - (probe.rows / 2) as Real;
        (row, col)
    }

    /// Top-left pixel of the probe patch centred on `point`, rounded and
    /// clamped so the patch stays inside the grid.
    pub fn patch_origin(&self, point: ScanPoint, probe: GridShape) -> PixelPosition {
        let (row, col) = self.patch_origin_exact(point, probe);
        let max_row = self.shape.rows.saturating_sub(probe.rows) as Real;
        let max_col = self.shape.cols.saturating_sub(probe.cols) as Real;
        PixelPosition {
            row: row.round().clamp(0.0, max_row) as usize,
            col: col.round().clamp(0.0, max_col) as usize,
        }
    }

    /// Convert a shift in pixels to metres.
    pub fn pixels_to_metres(&self, d_row: Real, d_col: Real) -> (Real, Real) {
        (d_col * self.pixel.width_m, d_row * self.pixel.height_m)
    }
}
