/*
    Nyx, blazing fast astrodynamics
    Copyright (C) 2018-onwards Christopher Rabotin <christopher.rabotin@gmail.com>

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

pub use na::base::*;

/// Default tolerance used when inverting covariances into information matrices.
pub const DEFAULT_COV_INV_TOL: f64 = 1.0e-20;

/// Forces exact symmetry by averaging each pair of off-diagonal terms.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows().min(m.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// Returns whether the matrix is square and bit-for-bit symmetric.
pub fn is_symmetric(m: &DMatrix<f64>) -> bool {
    if !m.is_square() {
        return false;
    }
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            if m[(i, j)] != m[(j, i)] {
                return false;
            }
        }
    }
    true
}

/// Sum of the diagonal of a square matrix.
pub fn trace(m: &DMatrix<f64>) -> f64 {
    m.diagonal().sum()
}

/// Inverts a square matrix through its LU decomposition.
///
/// The matrix is first normalized by the square root of the magnitude of its diagonal, so `tol` bounds the pivots
/// of a correlation-like matrix rather than raw values whose units may differ by many orders of magnitude.
/// Returns `None` if the matrix is not square or if the magnitude of any pivot does not exceed `tol`.
pub fn invert_with_tolerance(m: &DMatrix<f64>, tol: f64) -> Option<DMatrix<f64>> {
    if !m.is_square() {
        return None;
    }
    let inv_scale = DMatrix::from_diagonal(&m.diagonal().map(|d| {
        let mag = d.abs();
        if mag > 0.0 && mag.is_finite() {
            1.0 / mag.sqrt()
        } else {
            1.0
        }
    }));

    let lu = (&inv_scale * m * &inv_scale).lu();
    if lu
        .u()
        .diagonal()
        .iter()
        .any(|pivot| !pivot.is_finite() || pivot.abs() <= tol)
    {
        return None;
    }
    let scaled_inv = lu.try_inverse()?;
    Some(&inv_scale * scaled_inv * &inv_scale)
}

/// Computes the information matrix (inverse) of a covariance, exactly symmetric.
pub fn information(covar: &DMatrix<f64>, tol: f64) -> Option<DMatrix<f64>> {
    let mut info = invert_with_tolerance(covar, tol)?;
    symmetrize(&mut info);
    Some(info)
}

/// Flattens the lower triangle of a square matrix, row by row: (1,1), (2,1), (2,2), (3,1), ...
pub fn lower_triangle(m: &DMatrix<f64>) -> Vec<f64> {
    let n = m.nrows();
    let mut flat = Vec::with_capacity(n * (n + 1) / 2);
    for i in 0..n {
        for j in 0..=i {
            flat.push(m[(i, j)]);
        }
    }
    flat
}

/// Rebuilds a symmetric matrix from its row-major lower triangle.
///
/// Returns `None` if the number of values is not triangular for `n`.
pub fn from_lower_triangle(n: usize, flat: &[f64]) -> Option<DMatrix<f64>> {
    if flat.len() != n * (n + 1) / 2 {
        return None;
    }
    let mut m = DMatrix::<f64>::zeros(n, n);
    let mut k = 0;
    for i in 0..n {
        for j in 0..=i {
            m[(i, j)] = flat[k];
            m[(j, i)] = flat[k];
            k += 1;
        }
    }
    Some(m)
}

/// Copies a 6x6 block onto the diagonal of `target`, starting at `offset`, truncating if the target is too small.
pub fn embed_block(target: &mut DMatrix<f64>, block: &Matrix6<f64>, offset: usize) {
    let n = target.nrows().min(target.ncols());
    if offset >= n {
        return;
    }
    let span = 6.min(n - offset);
    for i in 0..span {
        for j in 0..span {
            target[(offset + i, offset + j)] = block[(i, j)];
        }
    }
}

#[cfg(test)]
mod ut_linalg {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn symmetrize_averages() {
        let mut m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 3.0]);
        assert!(!is_symmetric(&m));
        symmetrize(&mut m);
        assert!(is_symmetric(&m));
        assert_eq!(m[(0, 1)], 3.0);
        assert_eq!(trace(&m), 4.0);
    }

    #[test]
    fn inversion_and_tolerance() {
        let m = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 0.5, 0.0, 0.5, 2.0]);
        let inv = invert_with_tolerance(&m, 1e-20).unwrap();
        assert_relative_eq!(&m * &inv, DMatrix::identity(3, 3), epsilon = 1e-14);

        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert!(invert_with_tolerance(&singular, 1e-12).is_none());
        assert!(invert_with_tolerance(&DMatrix::zeros(2, 3), 1e-12).is_none());
    }

    #[test]
    fn tolerance_is_relative() {
        // Tiny but well conditioned
        let tiny = DMatrix::from_diagonal_element(3, 3, 1e-30);
        let inv = invert_with_tolerance(&tiny, 1e-20).unwrap();
        assert_relative_eq!(inv[(1, 1)], 1e30, max_relative = 1e-12);

        // Large but nearly singular: correlation of 1 - 1e-12
        let rho = 1.0 - 1e-12;
        let near = DMatrix::from_row_slice(2, 2, &[1e6, rho * 1e6, rho * 1e6, 1e6]);
        assert!(invert_with_tolerance(&near, 1e-9).is_none());
        assert!(invert_with_tolerance(&near, 1e-14).is_some());
    }

    #[test]
    fn information_of_badly_scaled_covariance() {
        let covar = DMatrix::from_diagonal(&DVector::from_vec(vec![1e6, 1e-14]));
        let info = information(&covar, 1e-20).unwrap();
        assert_relative_eq!(info[(0, 0)], 1e-6, max_relative = 1e-12);
        assert_relative_eq!(info[(1, 1)], 1e14, max_relative = 1e-12);
    }

    #[test]
    fn lower_triangle_layout() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 4.0, 2.0, 3.0, 5.0, 4.0, 5.0, 6.0]);
        let flat = lower_triangle(&m);
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(from_lower_triangle(3, &flat).unwrap(), m);
        assert!(from_lower_triangle(3, &flat[1..]).is_none());
    }

    #[test]
    fn embed_truncates() {
        let mut target = DMatrix::<f64>::zeros(8, 8);
        embed_block(&mut target, &Matrix6::identity(), 4);
        assert_eq!(trace(&target), 4.0);
    }
}
