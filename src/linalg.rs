//! Dense linear algebra helpers for walker stabilisation.
//!
//! Everything here works on complex `nalgebra` matrices. The walker keeps the
//! inverse overlap `(ψ_T^† φ)^{-1}` alive by rank-1 Sherman–Morrison updates and
//! periodically re-orthonormalises `φ` by QR, which is what keeps long
//! imaginary-time propagation numerically sane.

use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

use crate::error::{AfqmcError, Result};

pub type CMatrix = DMatrix<Complex64>;
pub type CVector = DVector<Complex64>;

/// Hard floor below which overlaps, ratios and update denominators count as zero.
pub const OVERLAP_FLOOR: f64 = 1e-16;

pub(crate) const ONE: Complex64 = Complex64::new(1.0, 0.0);
pub(crate) const ZERO: Complex64 = Complex64::new(0.0, 0.0);

/// Promote a real matrix to complex storage.
pub fn to_complex(m: &DMatrix<f64>) -> CMatrix {
    m.map(|x| Complex64::new(x, 0.0))
}

/// Rank-1 update of an inverse: given `A^{-1}`, return `(A + u vᵀ)^{-1}` and
/// the denominator `1 + vᵀ A^{-1} u`, which is also `det(A + u vᵀ) / det(A)`.
///
/// A denominator under [`OVERLAP_FLOOR`] (or non-finite) makes the updated
/// matrix singular; it is reported as [`AfqmcError::NumericalDegeneracy`] so the
/// caller can kill the walker instead of spreading NaN.
pub fn sherman_morrison(a_inv: &CMatrix, u: &CVector, vt: &CVector) -> Result<(CMatrix, Complex64)> {
    let au = a_inv * u;
    let va = a_inv.transpose() * vt;
    let denom = ONE + vt.dot(&au);
    if !denom.is_finite() || denom.norm() < OVERLAP_FLOOR {
        return Err(AfqmcError::NumericalDegeneracy(format!(
            "Sherman-Morrison denominator {denom}"
        )));
    }
    let update = &au * va.transpose();
    Ok((a_inv - update * (ONE / denom), denom))
}

/// QR decomposition of `m` with the diagonal of R made real and positive.
///
/// Returns `(Q, R, det R)`. The phase of each `R_jj` is moved into column `j`
/// of Q, so `Q R` still reproduces `m` and `det R = Π |R_jj|`.
pub fn reorthonormalize(m: &CMatrix) -> (CMatrix, CMatrix, Complex64) {
    let qr = m.clone().qr();
    let mut q = qr.q();
    let mut r = qr.r();
    let mut det = ONE;
    for j in 0..r.nrows() {
        let d = r[(j, j)];
        let mag = d.norm();
        if mag > 0.0 {
            let s = d / mag;
            scale_column(&mut q, j, s);
            scale_row(&mut r, j, s.conj());
        }
        det *= r[(j, j)];
    }
    (q, r, det)
}

/// Inverse of a square matrix, degenerate matrices reported as walker death.
pub fn inverse(m: &CMatrix) -> Result<CMatrix> {
    m.clone()
        .try_inverse()
        .ok_or_else(|| AfqmcError::NumericalDegeneracy("singular overlap matrix".to_string()))
}

/// One-particle Green's function between two determinants,
/// `b (a^† b)^{-1} a^†`. Transposed, this is the walker's G.
pub fn gab(a: &CMatrix, b: &CMatrix) -> Result<CMatrix> {
    let inv = inverse(&(a.adjoint() * b))?;
    Ok(b * inv * a.adjoint())
}

/// Walker Green's function `(φ (ψ^† φ)^{-1} ψ^†)^T` from a stored inverse overlap.
pub fn greens_from_inverse(phi: &CMatrix, inv_ovlp: &CMatrix, psi: &CMatrix) -> CMatrix {
    (phi * inv_ovlp * psi.adjoint()).transpose()
}

/// `exp(-tau h)` for a real symmetric `h`, via its eigendecomposition.
pub fn exp_symmetric(h: &DMatrix<f64>, tau: f64) -> DMatrix<f64> {
    let eig = h.clone().symmetric_eigen();
    let d = DMatrix::from_diagonal(&eig.eigenvalues.map(|e| (-tau * e).exp()));
    &eig.eigenvectors * d * eig.eigenvectors.transpose()
}

/// `(I + F_k ⋯ F_2 F_1)^{-1}` for factors given rightmost first.
///
/// The product is accumulated in stratified `Q D T` form so that the large and
/// small scales of a long imaginary-time chain never meet in one matrix.
pub fn stable_inverse_one_plus(factors: &[&CMatrix]) -> Result<CMatrix> {
    let first = factors.first().ok_or(AfqmcError::Unsupported("empty matrix chain"))?;
    let n = first.nrows();
    let (mut q, mut d, mut t) = qdt(first)?;
    for b in &factors[1..] {
        let mut c = *b * &q;
        for j in 0..n {
            scale_column(&mut c, j, d[j]);
        }
        let (q2, d2, t2) = qdt(&c)?;
        q = q2;
        d = d2;
        t = t2 * t;
    }
    // I + Q D T = Q Db (Db^{-1} Q^† + Ds T) with |Db| > 1 >= |Ds|.
    let mut db_inv_qh = q.adjoint();
    let mut ds_t = t;
    for j in 0..n {
        if d[j].norm() > 1.0 {
            scale_row(&mut db_inv_qh, j, ONE / d[j]);
        } else {
            scale_row(&mut ds_t, j, d[j]);
        }
    }
    let m = inverse(&(&db_inv_qh + ds_t))?;
    Ok(m * db_inv_qh)
}

/// Split `m = Q D T` with D diagonal and T unit upper triangular.
fn qdt(m: &CMatrix) -> Result<(CMatrix, CVector, CMatrix)> {
    let qr = m.clone().qr();
    let q = qr.q();
    let mut t = qr.r();
    let d = t.diagonal();
    for j in 0..t.nrows() {
        if d[j].norm() < OVERLAP_FLOOR {
            return Err(AfqmcError::NumericalDegeneracy("rank deficient propagator chain".to_string()));
        }
        scale_row(&mut t, j, ONE / d[j]);
    }
    Ok((q, d, t))
}

pub(crate) fn scale_row(m: &mut CMatrix, i: usize, s: Complex64) {
    for j in 0..m.ncols() {
        m[(i, j)] *= s;
    }
}

pub(crate) fn scale_column(m: &mut CMatrix, j: usize, s: Complex64) {
    for i in 0..m.nrows() {
        m[(i, j)] *= s;
    }
}

/// Row `i` of `m` as an owned column vector.
pub(crate) fn row_vector(m: &CMatrix, i: usize) -> CVector {
    m.row(i).transpose()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    pub(crate) fn random_matrix<R: Rng>(rng: &mut R, nrows: usize, ncols: usize) -> CMatrix {
        CMatrix::from_fn(nrows, ncols, |_, _| {
            Complex64::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5)
        })
    }

    #[test]
    fn test_sherman_morrison_chain_matches_full_inverse() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let n = 10;
        let mut a = random_matrix(&mut rng, n, n) + CMatrix::identity(n, n) * Complex64::new(3.0, 0.0);
        let mut a_inv = inverse(&a).unwrap();
        let mut det_ratio = ONE;
        let det0 = a.determinant();
        for _ in 0..25 {
            let u = CVector::from_fn(n, |_, _| Complex64::new(rng.gen::<f64>() - 0.5, 0.1));
            let v = CVector::from_fn(n, |_, _| Complex64::new(0.2 * rng.gen::<f64>(), -0.1));
            let (next, denom) = sherman_morrison(&a_inv, &u, &v).unwrap();
            a += &u * v.transpose();
            a_inv = next;
            det_ratio *= denom;
        }
        let direct = inverse(&a).unwrap();
        assert!((&a_inv - &direct).norm() < 1e-8);
        let expected = a.determinant() / det0;
        assert!((det_ratio - expected).norm() < 1e-8 * expected.norm());
    }

    #[test]
    fn test_sherman_morrison_singular_update() {
        let a_inv = CMatrix::identity(3, 3);
        let mut u = CVector::zeros(3);
        let mut v = CVector::zeros(3);
        u[1] = ONE;
        v[1] = Complex64::new(-1.0, 0.0);
        let err = sherman_morrison(&a_inv, &u, &v).unwrap_err();
        assert!(err.is_walker_death());
    }

    #[test]
    fn test_reorthonormalize() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let m = random_matrix(&mut rng, 12, 5);
        let (q, r, det) = reorthonormalize(&m);
        assert!((&q * &r - &m).norm() < 1e-12);
        assert!((q.adjoint() * &q - CMatrix::identity(5, 5)).norm() < 1e-12);
        for j in 0..5 {
            assert!(r[(j, j)].re > 0.0);
            assert_relative_eq!(r[(j, j)].im, 0.0, epsilon = 1e-14);
        }
        assert_relative_eq!(det.re, r.determinant().re, max_relative = 1e-12);
        assert_relative_eq!(det.im, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gab_is_projector() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let a = random_matrix(&mut rng, 8, 3);
        let b = random_matrix(&mut rng, 8, 3);
        let g = gab(&a, &b).unwrap();
        assert!((&g * &g - &g).norm() < 1e-10);
        assert_relative_eq!(g.trace().re, 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_stable_inverse_one_plus() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let factors: Vec<CMatrix> = (0..6)
            .map(|_| random_matrix(&mut rng, 6, 6) + CMatrix::identity(6, 6) * Complex64::new(1.5, 0.0))
            .collect();
        let refs: Vec<&CMatrix> = factors.iter().collect();
        let stable = stable_inverse_one_plus(&refs).unwrap();
        let mut product = CMatrix::identity(6, 6);
        for f in &factors {
            product = f * product;
        }
        let direct = inverse(&(CMatrix::identity(6, 6) + product)).unwrap();
        assert!((&stable - &direct).norm() < 1e-9 * direct.norm());
    }

    #[test]
    fn test_exp_symmetric_commutes_with_inverse() {
        let h = DMatrix::from_row_slice(3, 3, &[0.0, -1.0, 0.0, -1.0, 0.5, -1.0, 0.0, -1.0, 0.0]);
        let fwd = exp_symmetric(&h, 0.3);
        let bwd = exp_symmetric(&h, -0.3);
        assert!((&fwd * &bwd - DMatrix::<f64>::identity(3, 3)).norm() < 1e-12);
    }
}
