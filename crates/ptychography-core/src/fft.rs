//! Discrete Fourier transforms on complex grids.
//!
//! Power-of-two lengths use an iterative radix-2 Cooley–Tukey transform;
//! other lengths fall back to a direct O(n²) DFT. Forward transforms are
//! unnormalised, inverse transforms scale by `1/n`.
//!
//! Detector frames keep the zero frequency at the frame centre. Use
//! [`fftshift`] / [`ifftshift`] to move between that convention and the
//! natural transform ordering.

use nalgebra::{DMatrix, Scalar};

use crate::math::{Complex64, ComplexGrid, GridShape, Real};

/// Precomputed 1D transform of a fixed length.
#[derive(Debug, Clone)]
pub struct FftPlan {
    len: usize,
    /// `roots[k] = exp(-2πik/len)`.
    roots: Vec<Complex64>,
    bit_reverse: Option<Vec<usize>>,
}

impl FftPlan {
    pub fn new(len: usize) -> Self {
        let roots = (0..len)
            .map(|k| {
                let theta = -2.0 * std::f64::consts::PI * k as Real / len as Real;
                Complex64::new(theta.cos(), theta.sin())
            })
            .collect();
        let bit_reverse = len.is_power_of_two().then(|| bit_reverse_table(len));
        Self {
            len,
            roots,
            bit_reverse,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn forward(&self, data: &mut [Complex64]) {
        self.transform(data, false);
    }

    pub fn inverse(&self, data: &mut [Complex64]) {
        self.transform(data, true);
        let scale = 1.0 / self.len as Real;
        for z in data.iter_mut() {
            *z *= scale;
        }
    }

    fn transform(&self, data: &mut [Complex64], inverse: bool) {
        debug_assert_eq!(data.len(), self.len);
        if self.len <= 1 {
            return;
        }
        match &self.bit_reverse {
            Some(table) => self.radix2(data, table, inverse),
            None => self.direct(data, inverse),
        }
    }

    fn radix2(&self, data: &mut [Complex64], table: &[usize], inverse: bool) {
        let n = self.len;
        for (i, &j) in table.iter().enumerate() {
            if i < j {
                data.swap(i, j);
            }
        }

        let mut size = 2;
        while size <= n {
            let half = size / 2;
            let stride = n / size;
            for start in (0..n).step_by(size) {
                for k in 0..half {
                    let mut w = self.roots[k * stride];
                    if inverse {
                        w = w.conj();
                    }
                    let a = data[start + k];
                    let b = data[start + k + half] * w;
                    data[start + k] = a + b;
                    data[start + k + half] = a - b;
                }
            }
            size *= 2;
        }
    }

    fn direct(&self, data: &mut [Complex64], inverse: bool) {
        let n = self.len;
        let input = data.to_vec();
        for (k, out) in data.iter_mut().enumerate() {
            let mut acc = Complex64::new(0.0, 0.0);
            for (j, x) in input.iter().enumerate() {
                let mut w = self.roots[(k * j) % n];
                if inverse {
                    w = w.conj();
                }
                acc += *x * w;
            }
            *out = acc;
        }
    }
}

fn bit_reverse_table(n: usize) -> Vec<usize> {
    let bits = n.trailing_zeros();
    if bits == 0 {
        return vec![0; n];
    }
    (0..n)
        .map(|i| i.reverse_bits() >> (usize::BITS - bits))
        .collect()
}

/// 2D transform over a fixed grid shape.
#[derive(Debug, Clone)]
pub struct Fft2 {
    /// Transforms along a column (length = rows).
    column_plan: FftPlan,
    /// Transforms along a row (length = cols).
    row_plan: FftPlan,
}

impl Fft2 {
    pub fn new(shape: GridShape) -> Self {
        Self {
            column_plan: FftPlan::new(shape.rows),
            row_plan: FftPlan::new(shape.cols),
        }
    }

    pub fn shape(&self) -> GridShape {
        GridShape::new(self.column_plan.len(), self.row_plan.len())
    }

    pub fn forward(&self, grid: &mut ComplexGrid) {
        self.apply(grid, false);
    }

    pub fn inverse(&self, grid: &mut ComplexGrid) {
        self.apply(grid, true);
    }

    /// Forward transform of a copy.
    pub fn forward_of(&self, grid: &ComplexGrid) -> ComplexGrid {
        let mut out = grid.clone();
        self.forward(&mut out);
        out
    }

    /// Inverse transform of a copy.
    pub fn inverse_of(&self, grid: &ComplexGrid) -> ComplexGrid {
        let mut out = grid.clone();
        self.inverse(&mut out);
        out
    }

    fn apply(&self, grid: &mut ComplexGrid, inverse: bool) {
        assert_eq!(
            GridShape::of(grid),
            self.shape(),
            "grid shape does not match the transform plan"
        );
        let (rows, cols) = grid.shape();

        // Column-major storage: each column is a contiguous slice.
        for column in grid.as_mut_slice().chunks_exact_mut(rows) {
            if inverse {
                self.column_plan.inverse(column);
            } else {
                self.column_plan.forward(column);
            }
        }

        let mut buffer = vec![Complex64::new(0.0, 0.0); cols];
        for r in 0..rows {
            for (c, slot) in buffer.iter_mut().enumerate() {
                *slot = grid[(r, c)];
            }
            if inverse {
                self.row_plan.inverse(&mut buffer);
            } else {
                self.row_plan.forward(&mut buffer);
            }
            for (c, value) in buffer.iter().enumerate() {
                grid[(r, c)] = *value;
            }
        }
    }
}

/// Move the zero frequency from index 0 to the grid centre.
pub fn fftshift<T: Scalar>(grid: &DMatrix<T>) -> DMatrix<T> {
    let (rows, cols) = grid.shape();
    DMatrix::from_fn(rows, cols, |r, c| {
        grid[((r + rows - rows / 2) % rows, (c + cols - cols / 2) % cols)].clone()
    })
}

/// Inverse of [`fftshift`].
pub fn ifftshift<T: Scalar>(grid: &DMatrix<T>) -> DMatrix<T> {
    let (rows, cols) = grid.shape();
    DMatrix::from_fn(rows, cols, |r, c| {
        grid[((r + rows / 2) % rows, (c + cols / 2) % cols)].clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::total_power;

    fn test_signal(shape: GridShape) -> ComplexGrid {
        ComplexGrid::from_fn(shape.rows, shape.cols, |r, c| {
            Complex64::new((r as Real * 0.7).sin() + c as Real * 0.1, (c as Real * 0.3).cos())
        })
    }

    fn max_abs_diff(a: &ComplexGrid, b: &ComplexGrid) -> Real {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).norm())
            .fold(0.0, Real::max)
    }

    #[test]
    fn radix2_matches_direct_dft() {
        let mut fast = vec![Complex64::new(0.0, 0.0); 8];
        for (i, z) in fast.iter_mut().enumerate() {
            *z = Complex64::new(i as Real, (i * i) as Real * 0.5);
        }
        let mut slow = fast.clone();

        FftPlan::new(8).forward(&mut fast);
        let plan = FftPlan::new(8);
        plan.direct(&mut slow, false);

        for (a, b) in fast.iter().zip(slow.iter()) {
            assert!((a - b).norm() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn inverse_restores_input_for_odd_and_even_shapes() {
        for shape in [GridShape::new(16, 8), GridShape::new(6, 5), GridShape::new(1, 4)] {
            let original = test_signal(shape);
            let fft = Fft2::new(shape);
            let mut grid = original.clone();
            fft.forward(&mut grid);
            fft.inverse(&mut grid);
            assert!(max_abs_diff(&grid, &original) < 1e-9, "shape {shape}");
        }
    }

    #[test]
    fn parseval_holds_for_unnormalised_forward() {
        let shape = GridShape::new(8, 16);
        let signal = test_signal(shape);
        let spectrum = Fft2::new(shape).forward_of(&signal);
        let expected = total_power(&signal) * shape.len() as Real;
        assert!((total_power(&spectrum) - expected).abs() < 1e-6 * expected);
    }

    #[test]
    fn delta_transforms_to_constant() {
        let shape = GridShape::square(4);
        let mut grid = crate::math::zeros(shape);
        grid[(0, 0)] = Complex64::new(1.0, 0.0);
        Fft2::new(shape).forward(&mut grid);
        assert!(grid.iter().all(|z| (z - Complex64::new(1.0, 0.0)).norm() < 1e-12));
    }

    #[test]
    fn shifts_are_inverse_of_each_other() {
        let grid = DMatrix::from_fn(5, 4, |r, c| (r * 10 + c) as Real);
        let shifted = fftshift(&grid);
        assert_eq!(shifted[(2, 2)], grid[(0, 0)]);
        assert_eq!(ifftshift(&shifted), grid);
    }
}
