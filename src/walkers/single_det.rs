//! Single-determinant UHF walker.

use num_complex::Complex64;

use crate::error::Result;
use crate::linalg::{
    greens_from_inverse, inverse, reorthonormalize, row_vector, scale_row, sherman_morrison, CMatrix, ONE,
};
use crate::systems::EnergyEvaluator;
use crate::walkers::buffer::{push_matrix, BufferReader};
use crate::walkers::WalkerBackend;
use crate::wavefunction::Trial;

/// Walker `|φ↑⟩ ⊗ |φ↓⟩` guided by the leading trial determinant.
#[derive(Clone, Debug)]
pub struct SingleDet {
    phi: Vec<CMatrix>,
    inv_ovlp: Vec<CMatrix>,
    greens: Vec<CMatrix>,
    ot: Complex64,
}

impl SingleDet {
    pub fn new(trial: &Trial) -> Result<Self> {
        Self::from_wavefunction(trial.leading().to_vec(), trial)
    }

    pub fn from_wavefunction(phi: Vec<CMatrix>, trial: &Trial) -> Result<Self> {
        let mut walker = Self {
            inv_ovlp: phi.iter().map(|p| CMatrix::zeros(p.ncols(), p.ncols())).collect(),
            greens: phi.iter().map(|p| CMatrix::zeros(p.nrows(), p.nrows())).collect(),
            phi,
            ot: ONE,
        };
        walker.refresh(trial)?;
        Ok(walker)
    }

    /// Per-spin `(ψ_T^† φ)^{-1}`.
    pub fn inverse_overlap(&self) -> &[CMatrix] {
        &self.inv_ovlp
    }

    /// Recompute inverse overlaps, overlap and Green's functions from `phi`.
    fn refresh(&mut self, trial: &Trial) -> Result<()> {
        let psi = trial.leading();
        let mut ot = ONE;
        let mut inv = Vec::with_capacity(2);
        for (p, f) in psi.iter().zip(&self.phi) {
            let ovlp = p.adjoint() * f;
            ot *= ovlp.determinant();
            inv.push(inverse(&ovlp)?);
        }
        self.inv_ovlp = inv;
        self.ot = ot;
        self.update_greens(psi);
        Ok(())
    }

    fn update_greens(&mut self, psi: &[CMatrix]) {
        for s in 0..2 {
            self.greens[s] = greens_from_inverse(&self.phi[s], &self.inv_ovlp[s], &psi[s]);
        }
    }
}

impl WalkerBackend for SingleDet {
    fn trial_overlap(&self) -> Complex64 {
        self.ot
    }

    fn greens_function(&self) -> &[CMatrix] {
        &self.greens
    }

    fn wavefunction(&self) -> &[CMatrix] {
        &self.phi
    }

    fn field_ratio(&self, site: usize, deltas: [Complex64; 2]) -> Complex64 {
        (0..2).map(|s| ONE + deltas[s] * self.greens[s][(site, site)]).product()
    }

    fn apply_field_update(&mut self, site: usize, deltas: [Complex64; 2], trial: &Trial) -> Result<Complex64> {
        let psi = trial.leading();
        let mut updated = Vec::with_capacity(2);
        let mut ratio = ONE;
        for s in 0..2 {
            let u = row_vector(&psi[s], site).map(|z| z.conj());
            let vt = row_vector(&self.phi[s], site) * deltas[s];
            let (inv, denom) = sherman_morrison(&self.inv_ovlp[s], &u, &vt)?;
            updated.push(inv);
            ratio *= denom;
        }
        for (s, inv) in updated.into_iter().enumerate() {
            scale_row(&mut self.phi[s], site, ONE + deltas[s]);
            self.inv_ovlp[s] = inv;
        }
        self.ot *= ratio;
        self.update_greens(psi);
        Ok(ratio)
    }

    fn apply_one_body(&mut self, b: &CMatrix, trial: &Trial) -> Result<Complex64> {
        let old = self.ot;
        let phi: Vec<CMatrix> = self.phi.iter().map(|p| b * p).collect();
        let previous = std::mem::replace(&mut self.phi, phi);
        if let Err(e) = self.refresh(trial) {
            self.phi = previous;
            return Err(e);
        }
        Ok(self.ot / old)
    }

    fn reorthogonalize(&mut self, trial: &Trial) -> Result<Complex64> {
        let mut det = ONE;
        for p in self.phi.iter_mut().filter(|p| p.ncols() > 0) {
            let (q, _, d) = reorthonormalize(p);
            *p = q;
            det *= d;
        }
        self.refresh(trial)?;
        Ok(det)
    }

    fn set_wavefunction(&mut self, phi: Vec<CMatrix>, trial: &Trial) -> Result<()> {
        self.phi = phi;
        self.refresh(trial)
    }

    fn local_energy(&self, evaluator: &dyn EnergyEvaluator) -> Complex64 {
        evaluator.local_energy(&self.greens)
    }

    fn pack(&self, buf: &mut Vec<Complex64>) {
        buf.push(self.ot);
        for s in 0..2 {
            push_matrix(buf, &self.phi[s]);
            push_matrix(buf, &self.inv_ovlp[s]);
            push_matrix(buf, &self.greens[s]);
        }
    }

    fn unpack(&mut self, reader: &mut BufferReader) -> Result<()> {
        self.ot = reader.complex()?;
        for s in 0..2 {
            reader.matrix_into(&mut self.phi[s])?;
            reader.matrix_into(&mut self.inv_ovlp[s])?;
            reader.matrix_into(&mut self.greens[s])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::tests::random_matrix;
    use crate::systems::Hubbard;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn setup() -> (Trial, SingleDet) {
        let system = Hubbard::new(4, 2, 1.0, 4.0, 3, 2);
        let trial = Trial::free_electron(&system);
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let phi: Vec<CMatrix> = trial
            .leading()
            .iter()
            .map(|p| p + random_matrix(&mut rng, p.nrows(), p.ncols()) * Complex64::new(0.3, 0.0))
            .collect();
        let walker = SingleDet::from_wavefunction(phi, &trial).unwrap();
        (trial, walker)
    }

    #[test]
    fn test_field_updates_keep_greens_function_consistent() {
        let (trial, mut walker) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for step in 0..3 {
            for site in 0..8 {
                let deltas = [
                    Complex64::new(rng.gen::<f64>() - 0.4, 0.0),
                    Complex64::new(0.2, 0.1 * step as f64),
                ];
                let predicted = walker.field_ratio(site, deltas);
                let old = walker.trial_overlap();
                let ratio = walker.apply_field_update(site, deltas, &trial).unwrap();
                assert!((ratio - predicted).norm() < 1e-10 * predicted.norm());
                let psi = trial.leading();
                let mut direct = ONE;
                for s in 0..2 {
                    let ovlp = psi[s].adjoint() * &walker.phi[s];
                    direct *= ovlp.determinant();
                    let inv = inverse(&ovlp).unwrap();
                    let g = greens_from_inverse(&walker.phi[s], &inv, &psi[s]);
                    assert!((&g - &walker.greens_function()[s]).norm() < 1e-10);
                    assert!((&inv - &walker.inverse_overlap()[s]).norm() < 1e-8 * inv.norm());
                }
                assert!((direct - old * ratio).norm() < 1e-8 * direct.norm());
            }
        }
    }

    #[test]
    fn test_reorthogonalize_is_overlap_neutral() {
        let (trial, mut walker) = setup();
        let before = walker.trial_overlap();
        let g_before = walker.greens_function().to_vec();
        let det = walker.reorthogonalize(&trial).unwrap();
        let after = walker.trial_overlap();
        assert!((before - after * det).norm() < 1e-10 * before.norm());
        for s in 0..2 {
            assert!((&g_before[s] - &walker.greens[s]).norm() < 1e-10);
            let gram = walker.phi[s].adjoint() * &walker.phi[s];
            assert!((gram - CMatrix::identity(walker.phi[s].ncols(), walker.phi[s].ncols())).norm() < 1e-12);
        }
        assert_relative_eq!(det.im, 0.0, epsilon = 1e-12);
    }
}
