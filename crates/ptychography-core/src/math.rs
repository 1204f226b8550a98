use std::fmt;

use nalgebra::{Complex, DMatrix};
use serde::{Deserialize, Serialize};

pub type Real = f64;
pub type Complex64 = Complex<Real>;

/// Real-valued 2D grid indexed `(row, col)`.
pub type RealGrid = DMatrix<Real>;
/// Complex-valued 2D grid indexed `(row, col)`.
pub type ComplexGrid = DMatrix<Complex64>;

/// Planck constant times the speed of light, in eV·m.
pub const HC_EV_M: Real = 1.239_841_984e-6;

/// Shape of a 2D grid as `rows × cols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

impl GridShape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn square(side: usize) -> Self {
        Self::new(side, side)
    }

    pub fn of<T: nalgebra::Scalar>(grid: &DMatrix<T>) -> Self {
        Self::new(grid.nrows(), grid.ncols())
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when `other` fits inside `self`.
    pub fn contains(&self, other: GridShape) -> bool {
        other.rows <= self.rows && other.cols <= self.cols
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

pub fn wavelength_m(energy_ev: Real) -> Real {
    HC_EV_M / energy_ev
}

pub fn energy_ev(wavelength_m: Real) -> Real {
    HC_EV_M / wavelength_m
}

pub fn zeros(shape: GridShape) -> ComplexGrid {
    ComplexGrid::from_element(shape.rows, shape.cols, Complex64::new(0.0, 0.0))
}

pub fn ones(shape: GridShape) -> ComplexGrid {
    ComplexGrid::from_element(shape.rows, shape.cols, Complex64::new(1.0, 0.0))
}

/// Sum of `|z|²` over the grid.
pub fn total_power(grid: &ComplexGrid) -> Real {
    grid.iter().map(|z| z.norm_sqr()).sum()
}

/// Largest `|z|²` in the grid.
pub fn max_intensity(grid: &ComplexGrid) -> Real {
    grid.iter().map(|z| z.norm_sqr()).fold(0.0, Real::max)
}

pub fn intensity(grid: &ComplexGrid) -> RealGrid {
    grid.map(|z| z.norm_sqr())
}

pub fn is_finite(grid: &ComplexGrid) -> bool {
    grid.iter().all(|z| z.re.is_finite() && z.im.is_finite())
}

/// Element-wise square root of a non-negative intensity grid; negatives clamp to zero.
pub fn amplitude(intensity: &RealGrid) -> RealGrid {
    intensity.map(|v| v.max(0.0).sqrt())
}

/// `exp(iφ)` with amplitude `a`.
#[inline]
pub fn polar(a: Real, phi: Real) -> Complex64 {
    Complex64::from_polar(a, phi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wavelength_energy_roundtrip() {
        let lambda = wavelength_m(10_000.0);
        assert!((lambda - 1.239_841_984e-10).abs() < 1e-20);
        assert!((energy_ev(lambda) - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn grid_shape_display_and_contains() {
        let outer = GridShape::new(64, 48);
        assert_eq!(outer.to_string(), "64x48");
        assert!(outer.contains(GridShape::square(32)));
        assert!(!outer.contains(GridShape::square(50)));
        assert_eq!(outer.len(), 64 * 48);
    }

    #[test]
    fn power_helpers() {
        let mut grid = zeros(GridShape::new(2, 3));
        grid[(0, 1)] = Complex64::new(3.0, 4.0);
        assert_eq!(total_power(&grid), 25.0);
        assert_eq!(max_intensity(&grid), 25.0);
        assert!(is_finite(&grid));
        grid[(1, 2)] = Complex64::new(Real::NAN, 0.0);
        assert!(!is_finite(&grid));
    }
}
